//! Allocator backends.
//!
//! Three subtypes share one small interface: `GBM` (the raw allocator),
//! `EGL` (GBM plus render-node discovery through display attributes), and
//! `VULKAN` (GBM plus a `VkImage` sharing the same dma-buf). Modelled as a
//! tagged variant holding a trait object rather than an inheritance
//! hierarchy, per the backend-polymorphism design note.

pub mod gbm;
#[cfg(feature = "egl")]
pub mod egl;
#[cfg(feature = "vulkan")]
pub mod vulkan;

use std::os::fd::OwnedFd;
use std::sync::Arc;

use smithay::reexports::drm::buffer::DrmFourcc as Fourcc;
use smithay::reexports::gbm::Modifier;

use crate::error::{Error, Result};
use crate::sync::SyncBridge;

/// Which allocator backend a stream was initialised with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendTag {
    Unset,
    Gbm,
    Egl,
    Vulkan,
}

/// Plane layout and ownership-transferred descriptors for one allocated
/// buffer, as reported by an [`AllocatorBackend::alloc_buffer`] call.
pub struct AllocatedBuffer {
    pub width: u32,
    pub height: u32,
    pub fourcc: Fourcc,
    pub modifier: Modifier,
    pub plane_count: usize,
    pub stride: [u32; 4],
    pub offset: [u32; 4],
    /// One dma-buf fd per plane; callers duplicate as needed when handing
    /// fds to the transport.
    pub fd: Vec<OwnedFd>,
    /// Backend-specific handle kept alive for the buffer's lifetime
    /// (EGLImage, VkImage, ...); `None` for the raw GBM backend.
    pub backend_handle: Option<BackendHandle>,
    /// The GBM buffer object backing every plane fd above, kept alive for
    /// as long as the buffer is allocated so `get_gbm_bo` has a live
    /// pointer to hand back, not just the fds duplicated out of it.
    pub gbm_bo: Option<gbm::GbmBo>,
}

/// Opaque backend-specific image handle, returned to callers through the
/// public accessor surface (`get_egl_image`, `get_vk_image`).
pub enum BackendHandle {
    #[cfg(feature = "egl")]
    Egl(egl::EglImage),
    #[cfg(feature = "vulkan")]
    Vulkan(vulkan::VkImage),
}

/// Per-stream allocator: given a concrete `(width, height, fourcc,
/// modifier)` it produces a fully-described buffer, or tears one down.
pub trait AllocatorBackend: Send + Sync {
    fn tag(&self) -> BackendTag;

    /// Allocates a buffer for the given geometry. For linear-tiled
    /// buffers the returned `width` may exceed the request (allocator
    /// row-alignment); callers that report size to the public API must
    /// keep reporting the caller's requested width, not this one.
    fn alloc_buffer(&self, width: u32, height: u32, fourcc: Fourcc, modifiers: &[Modifier]) -> Result<AllocatedBuffer>;

    /// Releases backend-specific resources (EGLImage, VkImage) and the
    /// underlying allocator buffer object. Plane fds are closed by the
    /// caller as part of the buffer-free ordering in `buffer.rs`.
    fn free_buffer(&self, buffer: &mut AllocatedBuffer);

    /// Optional per-enqueue hook (Vulkan: export a release semaphore as
    /// a sync-file, via the queue's end-of-commands fence).
    fn enqueue_buffer(&self, _buffer: &AllocatedBuffer) -> Result<()> {
        Ok(())
    }

    /// The render-node's sync bridge, if this backend performs explicit
    /// sync translation. `None` for backends that only ever see implicit
    /// sync (plain GBM with no Vulkan/EGL layer on top).
    fn sync_bridge(&self) -> Option<&Arc<SyncBridge>> {
        None
    }

    /// Whether this backend is capable of explicit sync at all.
    fn explicit_sync_supported(&self) -> bool {
        self.sync_bridge().is_some()
    }

    /// Tears down any backend-global resources not owned by a single
    /// buffer (a bound `SyncBridge`, a Vulkan device, ...). Called once
    /// from `Stream`'s teardown, after every buffer has already been
    /// freed through `free_buffer`. The default no-op suits GBM, which
    /// owns nothing beyond its buffer objects.
    fn destroy(&mut self) {}

    /// Returns the buffer's acquire and release semaphores, as raw
    /// backend handles, for a Vulkan-capable backend. May be called once
    /// per dequeue; a second call before the next dequeue fails `Busy`.
    /// Not supported by backends with no Vulkan image to synchronise.
    fn vk_semaphores(&self, _buffer: &mut AllocatedBuffer) -> Result<(u64, u64)> {
        Err(Error::not_supported("backend does not expose Vulkan semaphores"))
    }

    /// Returns the buffer's submission fence, as a raw backend handle.
    /// May be called once per dequeue; see [`AllocatorBackend::vk_semaphores`].
    fn vk_fence(&self, _buffer: &mut AllocatedBuffer) -> Result<u64> {
        Err(Error::not_supported("backend does not expose a Vulkan fence"))
    }
}
