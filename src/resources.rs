//! The device-resource interface consumed by [`crate::buffer::Buffer`] and the
//! scheduler.
//!
//! Kernel loading, program building, and everything else a real OpenCL
//! resource manager does are out of scope for this crate — only the subset
//! the buffer and scheduler actually touch is specified here: allocate/release
//! device memory, enqueue blocking read/write/copy. A real OpenCL-backed
//! implementation of these traits is an integration point for a downstream
//! crate; `ufo-extras` ships the only implementation in this repository, a
//! software queue that treats "device" memory as a second host allocation.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::Result;

/// Opaque handle to a device-side allocation.
///
/// Carries no information interpretable outside the [`DeviceContext`] that
/// issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle(pub u64);

/// Identifies a [`CommandQueue`] for round-robin assignment and for a
/// buffer's "last queue used" bookkeeping used to resolve lazy residency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueueId(pub usize);

/// Supplies device memory allocation and release.
///
/// Thread-safe: shared read-only across every worker thread.
pub trait DeviceContext: Send + Sync + fmt::Debug {
    /// Allocates `size_bytes` of device memory, uninitialized.
    fn alloc(&self, size_bytes: usize) -> Result<DeviceHandle>;

    /// Releases a previously allocated handle. Must be idempotent-safe to
    /// call at most once per handle; callers (the `Buffer` destructor) own
    /// that invariant.
    fn release(&self, handle: DeviceHandle);
}

/// A single command queue: the synchronous subset of an OpenCL command
/// queue the buffer layer requires (enqueue read/write/copy, all blocking).
///
/// Each worker is assigned exactly one `CommandQueue` for its lifetime;
/// queues are never moved between workers during execution.
pub trait CommandQueue: Send + Sync + fmt::Debug {
    /// This queue's identity, used for the buffer's last-queue bookkeeping.
    fn id(&self) -> QueueId;

    /// Blocking device -> host read of `host.len()` float32s from `handle`.
    fn enqueue_read(&self, handle: DeviceHandle, host: &mut [f32]) -> Result<()>;

    /// Blocking host -> device write of `host` into `handle`.
    fn enqueue_write(&self, handle: DeviceHandle, host: &[f32]) -> Result<()>;

    /// Blocking device -> device copy of `len` float32s from `src` to `dst`.
    fn enqueue_copy(&self, src: DeviceHandle, dst: DeviceHandle, len: usize) -> Result<()>;
}

/// Supplies a device context and a fixed pool of command queues, handing
/// queues out round-robin as the scheduler assigns one to each worker at
/// setup.
pub struct ResourcePool {
    context: Arc<dyn DeviceContext>,
    queues: Vec<Arc<dyn CommandQueue>>,
    next: AtomicUsize,
}

impl ResourcePool {
    pub fn new(context: Arc<dyn DeviceContext>, queues: Vec<Arc<dyn CommandQueue>>) -> ResourcePool {
        assert!(!queues.is_empty(), "ResourcePool::new: at least one queue is required");
        ResourcePool {
            context,
            queues,
            next: AtomicUsize::new(0),
        }
    }

    /// Returns the shared device context.
    pub fn context(&self) -> Arc<dyn DeviceContext> {
        self.context.clone()
    }

    /// Hands out the next queue, round-robin.
    pub fn next_queue(&self) -> Arc<dyn CommandQueue> {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.queues.len();
        self.queues[idx].clone()
    }

    /// Number of queues in the pool.
    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }
}

impl fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("context", &self.context)
            .field("num_queues", &self.queues.len())
            .finish()
    }
}
