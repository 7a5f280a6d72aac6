//! A streaming dataflow engine for image-processing pipelines across
//! heterogeneous compute devices.
//!
//! A pipeline is described as a [`graph::Graph`] of [`node::Node`]s, each
//! running a filter in one of three roles (`Source`, `Transform`, `Sink`,
//! see [`filter`]). A [`scheduler::Scheduler`] validates the graph,
//! partitions it across the devices a [`resources::ResourcePool`] exposes,
//! and drives it to completion with one OS thread per node, moving
//! [`buffer::Buffer`]s between adjacent nodes over bounded
//! [`channel::Channel`]s.

pub mod buffer;
pub mod channel;
pub mod error;
pub mod filter;
pub mod graph;
pub mod node;
pub mod requisition;
pub mod resources;
pub mod scheduler;

pub use buffer::{Buffer, Residency, Side, SourceDepth};
pub use channel::Channel;
pub use error::{Error, PropertyWarning, Result};
pub use filter::{Filter, PropertyBag, PropertyKind, PropertyValue, Role, Sink, Source, Transform};
pub use graph::Graph;
pub use node::{Node, NodeId};
pub use requisition::Requisition;
pub use resources::{CommandQueue, DeviceContext, DeviceHandle, QueueId, ResourcePool};
pub use scheduler::Scheduler;

#[cfg(test)]
mod tests;
