//! Graph node identity and the node wrapper around a filter.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::Result;
use crate::filter::Role;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide unique node identity.
///
/// Ids are never reused within a process, including across `copy`/`expand`,
/// so they double as a stable key for scheduler bookkeeping (per-node error
/// capture, channel lookup) even after a graph has been rewritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

impl NodeId {
    fn fresh() -> NodeId {
        NodeId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A graph vertex: a stable identity, a human-readable name (used by
/// `dump_dot` and log messages), and the filter it runs.
pub struct Node {
    id: NodeId,
    name: String,
    role: Role,
}

impl Node {
    pub fn new(name: impl Into<String>, role: Role) -> Node {
        Node {
            id: NodeId::fresh(),
            name: name.into(),
            role,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// A new node with a fresh identity that shares this node's filter.
    ///
    /// Filters are reference-counted, not deep-cloned: duplicate nodes
    /// produced by `expand` or `copy` run the same underlying filter
    /// instance, mirroring how the source graph this crate's graph
    /// transformations are modeled on shares filter objects by reference
    /// count rather than duplicating filter state. The underlying filter
    /// gets a say first: a filter that cannot safely run as two concurrent
    /// instances refuses via `confirm_copy`, and that refusal propagates
    /// here as an error instead of a panic.
    pub fn copy(&self) -> Result<Node> {
        self.role.confirm_copy()?;
        Ok(Node {
            id: NodeId::fresh(),
            name: self.name.clone(),
            role: self.role.clone(),
        })
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}
