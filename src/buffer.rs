//! An n-dimensional float32 array with dual host/device residency.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::requisition::Requisition;
use crate::resources::{CommandQueue, DeviceContext, DeviceHandle};

/// Which side of a [`Buffer`] currently holds the authoritative data.
///
/// `Both` means host and device agree; it is reached only by a transfer
/// (`get_host`/`get_device`/`copy`), never by a write, which always demotes
/// residency back to the side written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    Host,
    Device,
    Both,
}

/// One side of a buffer, used by [`Buffer::discard_location`] to name which
/// side is about to be overwritten wholesale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Host,
    Device,
}

/// Source bit depth for [`Buffer::convert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDepth {
    U8,
    U16,
}

/// An n-dimensional float32 array that lives on the host, the device, or
/// both, synchronizing lazily between the two as filters request either
/// side.
///
/// A `Buffer` is held exclusively: it circulates by value between the
/// scheduler, channels, and filter workers, and exactly one of them touches
/// it at any moment.
pub struct Buffer {
    requisition: Requisition,
    host: Vec<f32>,
    device: Option<DeviceHandle>,
    context: Arc<dyn DeviceContext>,
    last_queue: Option<Arc<dyn CommandQueue>>,
    residency: Residency,
}

impl Buffer {
    /// Allocates a zero-initialized buffer of shape `req` against `context`.
    pub fn new(req: Requisition, context: Arc<dyn DeviceContext>) -> Result<Buffer> {
        let device = context
            .alloc(req.size_bytes())
            .map_err(|e| Error::DeviceAllocation(e.to_string()))?;

        Ok(Buffer {
            requisition: req,
            host: vec![0.0; req.len()],
            device: Some(device),
            context,
            last_queue: None,
            residency: Residency::Host,
        })
    }

    /// The buffer's shape.
    pub fn requisition(&self) -> Requisition {
        self.requisition
    }

    /// Current authoritative side(s).
    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Byte size of the buffer's storage.
    pub fn size_bytes(&self) -> usize {
        self.requisition.size_bytes()
    }

    /// Releases the current allocations and reallocates per `req`.
    ///
    /// Residency resets to `Host`, matching fresh construction.
    pub fn resize(&mut self, req: Requisition) -> Result<()> {
        if let Some(handle) = self.device.take() {
            self.context.release(handle);
        }

        let device = self
            .context
            .alloc(req.size_bytes())
            .map_err(|e| Error::DeviceAllocation(e.to_string()))?;

        self.host = vec![0.0; req.len()];
        self.device = Some(device);
        self.requisition = req;
        self.residency = Residency::Host;
        Ok(())
    }

    /// Returns a fresh buffer with the same requisition. Contents are
    /// undefined; no storage is shared with `self`.
    pub fn duplicate(&self) -> Result<Buffer> {
        Buffer::new(self.requisition, self.context.clone())
    }

    /// Signed sum of per-dimension differences between `req` and this
    /// buffer's current shape; positive when `req` is larger.
    pub fn cmp_dimensions(&self, req: &Requisition) -> i64 {
        self.requisition.cmp_dimensions(req)
    }

    fn device_handle(&self) -> DeviceHandle {
        self.device.expect("Buffer: device handle missing outside of construction/resize")
    }

    /// Blocking device -> host read, performed only if the device side is
    /// currently authoritative. Returns a mutable view of the host array and
    /// promotes residency to `Host`.
    pub fn get_host(&mut self, queue: Option<&Arc<dyn CommandQueue>>) -> Result<&mut [f32]> {
        self.to_host(queue)?;
        // The slice handed back is a write capability, not a read-only
        // view, so the device side can no longer be trusted as current.
        self.residency = Residency::Host;
        Ok(&mut self.host)
    }

    fn to_host(&mut self, queue: Option<&Arc<dyn CommandQueue>>) -> Result<()> {
        if let Some(q) = queue {
            self.last_queue = Some(q.clone());
        }

        if matches!(self.residency, Residency::Host | Residency::Both) {
            return Ok(());
        }

        let q = queue
            .cloned()
            .or_else(|| self.last_queue.clone())
            .ok_or_else(|| Error::DeviceTransfer("Buffer::get_host: no queue available".into()))?;

        q.enqueue_read(self.device_handle(), &mut self.host)
            .map_err(|e| Error::DeviceTransfer(e.to_string()))?;

        self.residency = Residency::Both;
        Ok(())
    }

    /// Blocking host -> device write, performed only if the host side is
    /// currently authoritative. Returns the device handle and promotes
    /// residency to `Device`.
    pub fn get_device(&mut self, queue: &Arc<dyn CommandQueue>) -> Result<DeviceHandle> {
        self.to_device(queue)?;
        // The handle handed back is a write capability, so the host side
        // can no longer be trusted as current.
        self.residency = Residency::Device;
        Ok(self.device_handle())
    }

    fn to_device(&mut self, queue: &Arc<dyn CommandQueue>) -> Result<()> {
        self.last_queue = Some(queue.clone());

        if matches!(self.residency, Residency::Device | Residency::Both) {
            return Ok(());
        }

        queue
            .enqueue_write(self.device_handle(), &self.host)
            .map_err(|e| Error::DeviceTransfer(e.to_string()))?;

        self.residency = Residency::Both;
        Ok(())
    }

    /// Marks `discard` as stale and the other side authoritative, without
    /// copying. Used when a filter is about to overwrite a buffer wholesale
    /// and the prior contents are worthless.
    pub fn discard_location(&mut self, discard: Side) {
        self.residency = match discard {
            Side::Host => Residency::Device,
            Side::Device => Residency::Host,
        };
    }

    /// Copies the contents of `src` into `dst`. Chooses the cheapest path:
    /// if both reside on the same side, a same-side copy; otherwise `src`
    /// is synchronized to whichever side `dst` currently favors first.
    /// After completion `dst` is authoritative on that side.
    ///
    /// Precondition: `src.size_bytes() == dst.size_bytes()`.
    pub fn copy(src: &mut Buffer, dst: &mut Buffer) -> Result<()> {
        if src.size_bytes() != dst.size_bytes() {
            return Err(Error::DeviceTransfer(format!(
                "Buffer::copy: size mismatch (src: {}, dst: {})",
                src.size_bytes(),
                dst.size_bytes()
            )));
        }

        match (src.residency, dst.residency) {
            (Residency::Host, Residency::Host)
            | (Residency::Host, Residency::Both)
            | (Residency::Both, Residency::Host) => copy_host_to_host(src, dst),
            (Residency::Device, Residency::Device)
            | (Residency::Device, Residency::Both)
            | (Residency::Both, Residency::Device) => copy_device_to_device(src, dst),
            (Residency::Both, Residency::Both) => copy_host_to_host(src, dst),
            _ => {
                let queue = src
                    .last_queue
                    .clone()
                    .or_else(|| dst.last_queue.clone());

                match queue {
                    None => {
                        src.to_host(None)?;
                        copy_host_to_host(src, dst)
                    }
                    Some(q) if dst.residency == Residency::Host => {
                        src.to_host(Some(&q))?;
                        copy_host_to_host(src, dst)
                    }
                    Some(q) => {
                        src.to_device(&q)?;
                        copy_device_to_device(src, dst)
                    }
                }
            }
        }
    }

    /// In-place widening of host bytes from an 8- or 16-bit unsigned integer
    /// representation to float32. Processes back-to-front so source and
    /// destination may alias within the same allocation.
    ///
    /// Precondition: `self`'s storage is already sized for float32 (i.e. was
    /// allocated with the final requisition) and the caller has populated
    /// only the low bytes of each element with packed `depth`-bit values.
    pub fn convert(&mut self, depth: SourceDepth) {
        let n = self.host.len();

        // SAFETY: `self.host` is a `Vec<f32>` whose backing storage is
        // exactly `n * 4` bytes; reinterpreting it as bytes to read the
        // narrower packed representation out of the low bytes of each slot
        // is the documented precondition of this function, and the
        // back-to-front write order never reads a byte after it has been
        // overwritten by a wider write to an earlier index.
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(self.host.as_mut_ptr() as *mut u8, n * 4)
        };

        match depth {
            SourceDepth::U8 => {
                for i in (0..n).rev() {
                    let v = bytes[i] as f32;
                    self.host[i] = v;
                }
            }
            SourceDepth::U16 => {
                for i in (0..n).rev() {
                    let lo = bytes[2 * i] as u16;
                    let hi = bytes[2 * i + 1] as u16;
                    let v = (lo | (hi << 8)) as f32;
                    self.host[i] = v;
                }
            }
        }

        self.residency = Residency::Host;
    }
}

fn copy_host_to_host(src: &mut Buffer, dst: &mut Buffer) -> Result<()> {
    src.to_host(None).ok();
    dst.host.copy_from_slice(&src.host);
    dst.residency = Residency::Host;
    Ok(())
}

fn copy_device_to_device(src: &mut Buffer, dst: &mut Buffer) -> Result<()> {
    let queue = src
        .last_queue
        .clone()
        .or_else(|| dst.last_queue.clone())
        .ok_or_else(|| Error::DeviceTransfer("Buffer::copy: no queue available for device copy".into()))?;

    queue
        .enqueue_copy(src.device_handle(), dst.device_handle(), src.requisition.len())
        .map_err(|e| Error::DeviceTransfer(e.to_string()))?;

    dst.last_queue = Some(queue);
    dst.residency = Residency::Device;
    Ok(())
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some(handle) = self.device.take() {
            self.context.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ufo_extras::SoftwareResources;

    fn fixture() -> (Requisition, Arc<dyn DeviceContext>, Arc<dyn CommandQueue>) {
        let req = Requisition::new(&[4, 4]);
        let resources = SoftwareResources::new(1);
        let context = resources.pool().context();
        let queue = resources.pool().next_queue();
        (req, context, queue)
    }

    #[test]
    fn new_buffer_is_host_resident_and_zeroed() {
        let (req, ctx, _queue) = fixture();
        let mut buf = Buffer::new(req, ctx).unwrap();
        assert_eq!(buf.residency(), Residency::Host);
        assert!(buf.get_host(None).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn round_trip_host_device_host_is_byte_identical() {
        let (req, ctx, queue) = fixture();
        let mut buf = Buffer::new(req, ctx).unwrap();
        {
            let host = buf.get_host(Some(&queue)).unwrap();
            for (i, v) in host.iter_mut().enumerate() {
                *v = i as f32;
            }
        }
        buf.discard_location(Side::Host); // pretend something dirtied bookkeeping only
        buf.residency = Residency::Host; // restore: the write above stays authoritative on host

        let before: Vec<f32> = buf.get_host(Some(&queue)).unwrap().to_vec();
        let _dev = buf.get_device(&queue).unwrap();
        assert_eq!(buf.residency(), Residency::Device);
        let after = buf.get_host(Some(&queue)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn get_device_after_get_host_does_not_return_stale_data() {
        // A device-resident buffer read via get_host must not let a
        // subsequent get_device skip the re-upload just because the
        // read-only sync briefly agreed on both sides.
        let (req, ctx, queue) = fixture();
        let mut buf = Buffer::new(req, ctx).unwrap();
        buf.get_device(&queue).unwrap();
        buf.discard_location(Side::Host); // device is authoritative

        {
            let host = buf.get_host(Some(&queue)).unwrap();
            host[0] = 42.0;
        }
        assert_eq!(buf.residency(), Residency::Host);

        let handle = buf.get_device(&queue).unwrap();
        assert_eq!(buf.residency(), Residency::Device);
        let mut readback = vec![0.0; req.len()];
        queue.enqueue_read(handle, &mut readback).unwrap();
        assert_eq!(readback[0], 42.0);
    }

    #[test]
    fn discard_location_sets_the_other_side_without_copying() {
        let (req, ctx, queue) = fixture();
        let mut buf = Buffer::new(req, ctx).unwrap();
        buf.get_host(Some(&queue)).unwrap();
        buf.residency = Residency::Both; // pretend both sides currently agree
        buf.discard_location(Side::Host);
        assert_eq!(buf.residency(), Residency::Device);
    }

    #[test]
    fn cmp_dimensions_matches_requisition() {
        let (req, ctx, _q) = fixture();
        let buf = Buffer::new(req, ctx).unwrap();
        let bigger = Requisition::new(&[8, 8]);
        assert!(buf.cmp_dimensions(&bigger) > 0);
    }

    #[test]
    fn convert_u8_widens_every_pixel() {
        let req = Requisition::new(&[4]);
        let resources = SoftwareResources::new(1);
        let mut buf = Buffer::new(req, resources.pool().context()).unwrap();
        {
            let host = buf.get_host(None).unwrap();
            let bytes = unsafe {
                std::slice::from_raw_parts_mut(host.as_mut_ptr() as *mut u8, host.len() * 4)
            };
            for (i, b) in bytes.iter_mut().take(4).enumerate() {
                *b = (i * 10) as u8;
            }
        }
        buf.convert(SourceDepth::U8);
        let host = buf.get_host(None).unwrap();
        assert_eq!(host, &[0.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn copy_same_side_host_to_host() {
        let resources = SoftwareResources::new(1);
        let req = Requisition::new(&[2, 2]);
        let mut src = Buffer::new(req, resources.pool().context()).unwrap();
        let mut dst = Buffer::new(req, resources.pool().context()).unwrap();
        src.get_host(None).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        Buffer::copy(&mut src, &mut dst).unwrap();
        assert_eq!(dst.get_host(None).unwrap(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn copy_rejects_size_mismatch() {
        let resources = SoftwareResources::new(1);
        let mut src = Buffer::new(Requisition::new(&[4]), resources.pool().context()).unwrap();
        let mut dst = Buffer::new(Requisition::new(&[8]), resources.pool().context()).unwrap();
        assert!(Buffer::copy(&mut src, &mut dst).is_err());
    }
}
