//! The software device context and command queue.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ufo::{CommandQueue, DeviceContext, DeviceHandle, Error, QueueId, ResourcePool, Result};

/// A [`DeviceContext`] backed by ordinary host allocations, keyed by a
/// monotonically increasing handle.
#[derive(Debug)]
pub struct SoftwareContext {
    next_handle: AtomicU64,
    allocations: Mutex<HashMap<u64, Vec<f32>>>,
}

impl SoftwareContext {
    pub fn new() -> SoftwareContext {
        SoftwareContext {
            next_handle: AtomicU64::new(1),
            allocations: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for SoftwareContext {
    fn default() -> SoftwareContext {
        SoftwareContext::new()
    }
}

impl DeviceContext for SoftwareContext {
    fn alloc(&self, size_bytes: usize) -> Result<DeviceHandle> {
        let len = size_bytes / std::mem::size_of::<f32>();
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.allocations.lock().unwrap().insert(handle, vec![0.0; len]);
        Ok(DeviceHandle(handle))
    }

    fn release(&self, handle: DeviceHandle) {
        self.allocations.lock().unwrap().remove(&handle.0);
    }
}

/// A [`CommandQueue`] whose "device" operations are memcpys against a
/// shared [`SoftwareContext`].
#[derive(Debug)]
pub struct SoftwareQueue {
    id: QueueId,
    context: Arc<SoftwareContext>,
}

impl SoftwareQueue {
    pub fn new(id: QueueId, context: Arc<SoftwareContext>) -> SoftwareQueue {
        SoftwareQueue { id, context }
    }
}

impl CommandQueue for SoftwareQueue {
    fn id(&self) -> QueueId {
        self.id
    }

    fn enqueue_read(&self, handle: DeviceHandle, host: &mut [f32]) -> Result<()> {
        let allocations = self.context.allocations.lock().unwrap();
        let mem = allocations
            .get(&handle.0)
            .ok_or_else(|| Error::DeviceTransfer(format!("enqueue_read: unknown handle {:?}", handle)))?;
        let n = host.len().min(mem.len());
        host[..n].copy_from_slice(&mem[..n]);
        Ok(())
    }

    fn enqueue_write(&self, handle: DeviceHandle, host: &[f32]) -> Result<()> {
        let mut allocations = self.context.allocations.lock().unwrap();
        let mem = allocations
            .get_mut(&handle.0)
            .ok_or_else(|| Error::DeviceTransfer(format!("enqueue_write: unknown handle {:?}", handle)))?;
        let n = host.len().min(mem.len());
        mem[..n].copy_from_slice(&host[..n]);
        Ok(())
    }

    fn enqueue_copy(&self, src: DeviceHandle, dst: DeviceHandle, len: usize) -> Result<()> {
        let mut allocations = self.context.allocations.lock().unwrap();
        let src_data = allocations
            .get(&src.0)
            .ok_or_else(|| Error::DeviceTransfer(format!("enqueue_copy: unknown src handle {:?}", src)))?
            .clone();
        let n = len.min(src_data.len());
        let dst_mem = allocations
            .get_mut(&dst.0)
            .ok_or_else(|| Error::DeviceTransfer(format!("enqueue_copy: unknown dst handle {:?}", dst)))?;
        let n = n.min(dst_mem.len());
        dst_mem[..n].copy_from_slice(&src_data[..n]);
        Ok(())
    }
}

/// Bundles a [`SoftwareContext`] with `num_queues` [`SoftwareQueue`]s into a
/// [`ResourcePool`], for tests that just need something to run a scheduler
/// against.
pub struct SoftwareResources {
    pool: Arc<ResourcePool>,
}

impl SoftwareResources {
    pub fn new(num_queues: usize) -> SoftwareResources {
        let context = Arc::new(SoftwareContext::new());
        let queues: Vec<Arc<dyn CommandQueue>> = (0..num_queues.max(1))
            .map(|i| Arc::new(SoftwareQueue::new(QueueId(i), context.clone())) as Arc<dyn CommandQueue>)
            .collect();
        SoftwareResources {
            pool: Arc::new(ResourcePool::new(context, queues)),
        }
    }

    pub fn pool(&self) -> Arc<ResourcePool> {
        self.pool.clone()
    }
}
