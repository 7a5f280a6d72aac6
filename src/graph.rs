//! The pipeline topology: nodes plus the directed edges connecting them,
//! and the transformations the scheduler applies before execution.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::node::{Node, NodeId};

/// A directed acyclic graph of [`Node`]s.
///
/// Nodes are held by `Arc` so that `shallow_copy` and `shallow_subgraph` can
/// produce new `Graph` values that share node identity with their source
/// without cloning filter state; only [`Graph::copy`] and [`Graph::expand`]
/// ever mint new node identities.
#[derive(Default, Clone)]
pub struct Graph {
    nodes: HashMap<NodeId, Arc<Node>>,
    edges: HashMap<(NodeId, NodeId), String>,
}

impl Graph {
    pub fn new() -> Graph {
        Graph::default()
    }

    /// Adds `node` to the graph and returns its id.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = node.id();
        self.nodes.insert(id, Arc::new(node));
        id
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<Node>> {
        self.nodes.get(&id).cloned()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.values()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Connects `from` to `to` with an edge label (typically an input port
    /// index as a string). Reconnecting an already-connected pair just
    /// overwrites the label.
    pub fn connect_nodes(&mut self, from: NodeId, to: NodeId, label: impl Into<String>) -> Result<()> {
        if !self.nodes.contains_key(&from) || !self.nodes.contains_key(&to) {
            return Err(Error::graph_invalid("connect_nodes: both endpoints must already be in the graph"));
        }
        self.edges.insert((from, to), label.into());
        Ok(())
    }

    pub fn is_connected(&self, from: NodeId, to: NodeId) -> bool {
        self.edges.contains_key(&(from, to))
    }

    pub fn edge_label(&self, from: NodeId, to: NodeId) -> Option<&str> {
        self.edges.get(&(from, to)).map(|s| s.as_str())
    }

    /// Removes the edge between `from` and `to`.
    ///
    /// Known limitation, carried over unchanged from the reference graph
    /// library this module's transformations are modeled on: both endpoint
    /// nodes are dropped from the graph outright, even if either still has
    /// other incident edges. Callers that need to prune a single edge out
    /// of a node with multiple edges should build a fresh graph with
    /// [`Graph::shallow_subgraph`] instead of calling this directly.
    pub fn remove_edge(&mut self, from: NodeId, to: NodeId) -> Result<()> {
        if self.edges.remove(&(from, to)).is_none() {
            return Err(Error::graph_invalid("remove_edge: no such edge"));
        }
        self.nodes.remove(&from);
        self.nodes.remove(&to);
        Ok(())
    }

    pub fn predecessors(&self, id: NodeId) -> Vec<Arc<Node>> {
        self.edges
            .keys()
            .filter(|(_, to)| *to == id)
            .filter_map(|(from, _)| self.nodes.get(from).cloned())
            .collect()
    }

    pub fn successors(&self, id: NodeId) -> Vec<Arc<Node>> {
        self.edges
            .keys()
            .filter(|(from, _)| *from == id)
            .filter_map(|(_, to)| self.nodes.get(to).cloned())
            .collect()
    }

    pub fn num_predecessors(&self, id: NodeId) -> usize {
        self.edges.keys().filter(|(_, to)| *to == id).count()
    }

    pub fn num_successors(&self, id: NodeId) -> usize {
        self.edges.keys().filter(|(from, _)| *from == id).count()
    }

    /// Nodes with no incoming edges.
    pub fn roots(&self) -> Vec<Arc<Node>> {
        self.nodes
            .values()
            .filter(|n| self.num_predecessors(n.id()) == 0)
            .cloned()
            .collect()
    }

    /// Nodes with no outgoing edges.
    pub fn leaves(&self) -> Vec<Arc<Node>> {
        self.nodes
            .values()
            .filter(|n| self.num_successors(n.id()) == 0)
            .cloned()
            .collect()
    }

    /// A deep structural copy: every node is duplicated with a fresh id
    /// (sharing the same underlying filter, see [`Node::copy`]) and the
    /// edge topology is rebuilt over the new ids.
    ///
    /// Fails if any node's filter refuses duplication via `confirm_copy`.
    pub fn copy(&self) -> Result<Graph> {
        let mut map = HashMap::with_capacity(self.nodes.len());
        let mut out = Graph::new();
        for node in self.nodes.values() {
            let duplicate = node.copy()?;
            let new_id = out.add_node(duplicate);
            map.insert(node.id(), new_id);
        }
        for ((from, to), label) in &self.edges {
            let nf = map[from];
            let nt = map[to];
            out.connect_nodes(nf, nt, label.clone()).expect("copy: mapped endpoints always exist");
        }
        Ok(out)
    }

    /// A structural copy that shares node identity with `self`: same node
    /// ids, same edges, independent storage.
    pub fn shallow_copy(&self) -> Graph {
        self.clone()
    }

    /// The induced subgraph containing every node reachable from `roots`
    /// without passing beyond any node in `leaves` (both sets are included
    /// in the result).
    pub fn shallow_subgraph(&self, roots: &[NodeId], leaves: &[NodeId]) -> Graph {
        let leaf_set: HashSet<NodeId> = leaves.iter().copied().collect();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = roots.iter().copied().collect();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if leaf_set.contains(&id) {
                continue;
            }
            for succ in self.successors(id) {
                queue.push_back(succ.id());
            }
        }

        let mut out = Graph::new();
        for &id in &visited {
            if let Some(node) = self.nodes.get(&id) {
                out.nodes.insert(id, node.clone());
            }
        }
        for ((from, to), label) in &self.edges {
            if visited.contains(from) && visited.contains(to) {
                out.edges.insert((*from, *to), label.clone());
            }
        }
        out
    }

    /// Groups nodes into levels such that every predecessor of a node in
    /// level `n` lies in a level `< n`. Level 0 is exactly the graph's
    /// roots.
    pub fn flatten(&self) -> Vec<Vec<Arc<Node>>> {
        let mut remaining: HashMap<NodeId, usize> = self
            .nodes
            .keys()
            .map(|&id| (id, self.num_predecessors(id)))
            .collect();

        let mut levels = Vec::new();
        loop {
            let level: Vec<NodeId> = remaining
                .iter()
                .filter(|&(_, &count)| count == 0)
                .map(|(&id, _)| id)
                .collect();

            if level.is_empty() {
                break;
            }

            for &id in &level {
                remaining.remove(&id);
                for succ in self.successors(id) {
                    if let Some(c) = remaining.get_mut(&succ.id()) {
                        *c -= 1;
                    }
                }
            }

            levels.push(level.iter().filter_map(|id| self.nodes.get(id).cloned()).collect());
        }

        levels
    }

    /// Returns a new graph with one additional parallel replica of `path`'s
    /// interior spliced in alongside the original, for running an extra
    /// copy of a filter chain on an additional device.
    ///
    /// The head and tail of `path` are never duplicated: the head is the
    /// shared split point feeding every replica, and the tail is the
    /// shared join point every replica feeds back into. Only the interior
    /// nodes are walked; each one with a single predecessor is duplicated
    /// via [`Node::copy`] and wired in series with whatever its
    /// predecessor resolved to on this pass, while an interior node with
    /// more than one predecessor is itself a join point and is reused
    /// unduplicated. After the walk, whatever the last interior step
    /// resolved to is connected forward to the original tail, closing the
    /// replica back into the shared graph instead of leaving it as a
    /// detached chain ending in a cloned tail.
    ///
    /// Fails if any interior node's filter refuses duplication via
    /// `confirm_copy` (see [`Node::copy`]).
    pub fn expand(&self, path: &[NodeId]) -> Result<Graph> {
        let mut out = self.shallow_copy();
        if path.len() < 2 {
            return Ok(out);
        }

        let tail = path[path.len() - 1];
        let mut prev = path[0];
        for &id in &path[1..path.len() - 1] {
            let node = match out.nodes.get(&id) {
                Some(n) => n.clone(),
                None => return Ok(out),
            };

            let next = if out.num_predecessors(id) > 1 {
                id
            } else {
                let duplicate = node.copy()?;
                let dup_id = out.add_node(duplicate);
                let label = out.edge_label(prev, id).unwrap_or("").to_string();
                out.connect_nodes(prev, dup_id, label)
                    .expect("expand: prev and duplicate always exist");
                dup_id
            };

            prev = next;
        }

        let closing_label = out.edge_label(path[path.len() - 2], tail).unwrap_or("").to_string();
        out.connect_nodes(prev, tail, closing_label)
            .expect("expand: prev and tail always exist");

        Ok(out)
    }

    /// A topological ordering of the graph's nodes (Kahn's algorithm). An
    /// ordering shorter than `num_nodes` indicates a cycle.
    pub(crate) fn topological_order(&self) -> Vec<NodeId> {
        let mut in_degree: HashMap<NodeId, usize> =
            self.nodes.keys().map(|&id| (id, self.num_predecessors(id))).collect();
        let mut queue: VecDeque<NodeId> = in_degree
            .iter()
            .filter(|&(_, &d)| d == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for succ in self.successors(id) {
                if let Some(d) = in_degree.get_mut(&succ.id()) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(succ.id());
                    }
                }
            }
        }
        order
    }

    /// The longest node-weighted path through the graph, restricted to
    /// nodes `pred` accepts, used by the scheduler to pick which chain of
    /// filters to replicate when partitioning work across multiple
    /// devices — a node whose filter isn't expandable can still appear as
    /// the path's endpoint by way of another node's edge into it, but the
    /// relaxation never walks forward *through* one. Falls back to a
    /// single arbitrary node for an empty or single-node graph.
    pub fn find_longest_path(&self, pred: impl Fn(NodeId) -> bool) -> Vec<NodeId> {
        if self.nodes.is_empty() {
            return Vec::new();
        }

        let order = self.topological_order();
        let mut dist: HashMap<NodeId, usize> = HashMap::new();
        let mut prev: HashMap<NodeId, NodeId> = HashMap::new();

        for &id in &order {
            dist.entry(id).or_insert(0);
            if !pred(id) {
                continue;
            }
            let d = dist[&id];
            for succ in self.successors(id) {
                let sid = succ.id();
                let candidate = d + 1;
                if candidate > *dist.get(&sid).unwrap_or(&0) {
                    dist.insert(sid, candidate);
                    prev.insert(sid, id);
                }
            }
        }

        let end = dist
            .iter()
            .max_by_key(|(_, &d)| d)
            .map(|(&id, _)| id)
            .unwrap_or_else(|| *self.nodes.keys().next().unwrap());

        let mut path = vec![end];
        let mut cur = end;
        while let Some(&p) = prev.get(&cur) {
            path.push(p);
            cur = p;
        }
        path.reverse();
        path
    }

    /// Renders the graph as a Graphviz `digraph`.
    pub fn dump_dot(&self) -> String {
        let mut out = String::from("digraph ufo {\n");
        for ((from, to), label) in &self.edges {
            let from_name = self.nodes.get(from).map(|n| n.name()).unwrap_or("?");
            let to_name = self.nodes.get(to).map(|n| n.name()).unwrap_or("?");
            if label.is_empty() {
                let _ = writeln!(out, "  {}_{} -> {}_{};", from_name, from, to_name, to);
            } else {
                let _ = writeln!(out, "  {}_{} -> {}_{} [label=\"{}\"];", from_name, from, to_name, to, label);
            }
        }
        out.push('}');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Role;
    use std::sync::Arc as StdArc;

    fn source_node(name: &str, source: impl crate::filter::Source + 'static) -> Node {
        Node::new(name, Role::Source(StdArc::new(source)))
    }

    #[derive(Debug)]
    struct NoopSource;
    impl crate::filter::Filter for NoopSource {}
    impl crate::filter::Source for NoopSource {
        fn output_requisition(&self, _props: &crate::filter::PropertyBag) -> crate::requisition::Requisition {
            crate::requisition::Requisition::new(&[1])
        }
        fn generate(
            &self,
            _output: &mut crate::buffer::Buffer,
            _queue: &StdArc<dyn crate::resources::CommandQueue>,
            _props: &crate::filter::PropertyBag,
        ) -> Result<bool> {
            Ok(false)
        }
    }

    fn chain(n: usize) -> (Graph, Vec<NodeId>) {
        let mut g = Graph::new();
        let mut ids = Vec::new();
        for i in 0..n {
            ids.push(g.add_node(source_node(&format!("n{}", i), NoopSource)));
        }
        for w in ids.windows(2) {
            g.connect_nodes(w[0], w[1], "0").unwrap();
        }
        (g, ids)
    }

    #[test]
    fn roots_and_leaves_of_a_chain() {
        let (g, ids) = chain(3);
        assert_eq!(g.roots().iter().map(|n| n.id()).collect::<Vec<_>>(), vec![ids[0]]);
        assert_eq!(g.leaves().iter().map(|n| n.id()).collect::<Vec<_>>(), vec![ids[2]]);
    }

    #[test]
    fn find_longest_path_spans_the_whole_chain() {
        let (g, ids) = chain(4);
        assert_eq!(g.find_longest_path(|_| true), ids);
    }

    #[test]
    fn find_longest_path_does_not_walk_through_a_non_expandable_node() {
        let (g, ids) = chain(4);
        let blocked = ids[1];
        let path = g.find_longest_path(|id| id != blocked);
        assert!(!path.contains(&blocked) || path.len() < ids.len());
        assert!(path.windows(2).all(|w| g.is_connected(w[0], w[1])));
    }

    #[test]
    fn flatten_groups_by_dependency_depth() {
        let (g, _ids) = chain(3);
        let levels = g.flatten();
        assert_eq!(levels.len(), 3);
        assert_eq!(levels[0].len(), 1);
    }

    #[test]
    fn copy_produces_fresh_ids_but_preserves_topology() {
        let (g, ids) = chain(3);
        let copied = g.copy().unwrap();
        assert_eq!(copied.num_nodes(), 3);
        assert!(!copied.nodes().any(|n| ids.contains(&n.id())));
        assert_eq!(copied.find_longest_path(|_| true).len(), 3);
    }

    #[test]
    fn shallow_subgraph_excludes_nodes_past_the_leaf() {
        let (g, ids) = chain(4);
        let sub = g.shallow_subgraph(&[ids[0]], &[ids[2]]);
        assert_eq!(sub.num_nodes(), 3);
        assert!(sub.node(ids[3]).is_none());
    }

    #[test]
    fn remove_edge_drops_both_endpoints() {
        let (mut g, ids) = chain(3);
        g.remove_edge(ids[0], ids[1]).unwrap();
        assert!(g.node(ids[0]).is_none());
        assert!(g.node(ids[1]).is_none());
        assert!(g.node(ids[2]).is_some());
    }

    #[test]
    fn expand_duplicates_interior_nodes_and_rejoins_the_original_tail() {
        let (g, ids) = chain(3);
        let expanded = g.expand(&ids).unwrap();

        // Only the interior node (ids[1]) is duplicated; the tail (ids[2])
        // is reused as the shared join point, not cloned.
        assert_eq!(expanded.num_nodes(), 4);
        assert!(expanded.node(ids[2]).is_some());

        let duplicate_interior = expanded
            .predecessors(ids[2])
            .into_iter()
            .map(|n| n.id())
            .find(|&id| id != ids[1])
            .expect("expand should have wired a duplicate node into the original tail");

        assert!(expanded.is_connected(ids[0], duplicate_interior));
        assert!(expanded.is_connected(duplicate_interior, ids[2]));
        // The original chain survives untouched alongside the replica.
        assert!(expanded.is_connected(ids[0], ids[1]));
        assert!(expanded.is_connected(ids[1], ids[2]));
    }

    #[test]
    fn expand_leaves_a_two_node_path_unchanged() {
        let (g, ids) = chain(2);
        let expanded = g.expand(&ids).unwrap();
        assert_eq!(expanded.num_nodes(), 2);
        assert!(expanded.is_connected(ids[0], ids[1]));
    }
}
