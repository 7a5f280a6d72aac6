//! A software-only resource backend for `ufo`, plus small fixtures used by
//! its test suite. No OpenCL, no native library, nothing to link: "device"
//! memory is a second host-side allocation, and every queue operation is
//! an ordinary memcpy behind a mutex.
//!
//! A real OpenCL-backed implementation of [`ufo::DeviceContext`] and
//! [`ufo::CommandQueue`] is an integration point left to a downstream
//! crate; this one exists purely so the core crate's test suite has
//! something to run filters against.

mod software;

pub use software::{SoftwareContext, SoftwareQueue, SoftwareResources};

use std::sync::Arc;

use ufo::{Buffer, DeviceContext, Requisition};

/// Allocates a buffer of `dims` and fills its host side with `value`.
pub fn filled_buffer(context: Arc<dyn DeviceContext>, dims: &[usize], value: f32) -> Buffer {
    let mut buf = Buffer::new(Requisition::new(dims), context).expect("software context never fails to allocate");
    buf.get_host(None)
        .expect("freshly allocated buffer is host-resident")
        .iter_mut()
        .for_each(|v| *v = value);
    buf
}
