//! Raw GBM allocator backend.

use std::fs::{File, OpenOptions};
use std::os::fd::AsFd;
use std::path::Path;

use smithay::backend::allocator::gbm::{GbmBuffer, GbmBufferFlags, GbmDevice};
use smithay::backend::allocator::Buffer as _;
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::drm::buffer::DrmFourcc as Fourcc;
use smithay::reexports::gbm::{AsRaw, Modifier};

use crate::allocator::{AllocatedBuffer, AllocatorBackend, BackendTag};
use crate::error::{Error, Result};

/// Owned GBM buffer object kept alive for the life of an allocation, so
/// `Stream::get_gbm_bo` has a live `gbm_bo*` to hand back rather than just
/// the plane fds duplicated out of it at alloc time.
pub struct GbmBo(GbmBuffer);

// SAFETY: the wrapped `gbm_bo*` is only ever touched through GBM calls
// serialised by the stream's loop lock, the same coarse-locking contract
// `allocator::egl::EglImage` relies on for its own manual impl.
unsafe impl Send for GbmBo {}
unsafe impl Sync for GbmBo {}

impl GbmBo {
    /// The raw `gbm_bo*`, valid only while the owning buffer is dequeued.
    pub fn as_raw(&self) -> *mut core::ffi::c_void {
        self.0.as_raw().cast()
    }
}

/// Wraps a `GbmDevice` opened against a render node, allocating dma-buf
/// backed buffers on request.
pub struct GbmAllocator {
    device: GbmDevice<DrmDeviceFd>,
}

impl GbmAllocator {
    /// Opens the render node at `path` (typically `/dev/dri/renderD128`).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|e| Error::NoDevice(format!("open render node {}: {e}", path.as_ref().display())))?;
        Self::from_file(file)
    }

    pub fn from_file(file: File) -> Result<Self> {
        let fd = DrmDeviceFd::new(file.into());
        let device = GbmDevice::new(fd).map_err(|e| Error::NoDevice(format!("gbm device init: {e}")))?;
        Ok(Self { device })
    }

    pub fn device(&self) -> &GbmDevice<DrmDeviceFd> {
        &self.device
    }
}

impl AllocatorBackend for GbmAllocator {
    fn tag(&self) -> BackendTag {
        BackendTag::Gbm
    }

    fn alloc_buffer(&self, width: u32, height: u32, fourcc: Fourcc, modifiers: &[Modifier]) -> Result<AllocatedBuffer> {
        let is_implicit = modifiers == [Modifier::Invalid];
        let bo = if is_implicit {
            self.device
                .create_buffer_object::<()>(width, height, fourcc, GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT)
                .map_err(|e| Error::NotPresent(format!("gbm implicit allocation failed: {e}")))?
        } else {
            self.device
                .create_buffer_object_with_modifiers2::<()>(
                    width,
                    height,
                    fourcc,
                    modifiers.iter().copied(),
                    GbmBufferFlags::RENDERING | GbmBufferFlags::SCANOUT,
                )
                .map_err(|e| Error::NotPresent(format!("gbm modifier-aware allocation failed: {e}")))?
        };

        let buffer = GbmBuffer::from_bo(bo, is_implicit);
        let plane_count = buffer.planes().len().max(1);

        let mut stride = [0u32; 4];
        let mut offset = [0u32; 4];
        let mut fds = Vec::with_capacity(plane_count);
        for i in 0..plane_count {
            stride[i] = buffer.plane_stride(i).unwrap_or_default();
            offset[i] = buffer.plane_offset(i).unwrap_or_default();
            let plane_fd = buffer
                .handle(i)
                .ok_or_else(|| Error::io(format!("missing plane handle for plane {i}")))?;
            fds.push(
                nix::unistd::dup(plane_fd.as_fd())
                    .map_err(|e| Error::io(format!("dup plane {i} fd: {e}")))?,
            );
        }

        Ok(AllocatedBuffer {
            width: buffer.width(),
            height: buffer.height(),
            fourcc,
            modifier: buffer.modifier(),
            plane_count,
            stride,
            offset,
            fd: fds,
            backend_handle: None,
            gbm_bo: Some(GbmBo(buffer)),
        })
    }

    fn free_buffer(&self, buffer: &mut AllocatedBuffer) {
        // Dropping the retained `GbmBo` releases the `gbm_bo*`; plane fds
        // are closed separately by the buffer pool's free ordering.
        buffer.gbm_bo = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_modifier_list_is_recognised() {
        assert_eq!([Modifier::Invalid].as_slice(), [Modifier::Invalid]);
    }
}
