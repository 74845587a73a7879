//! Vulkan allocator backend: GBM allocation plus a `VkImage` imported
//! over the same dma-buf via `VK_EXT_image_drm_format_modifier` and
//! external memory fd extensions, with per-buffer semaphores/fence for
//! explicit sync.

use std::os::fd::AsFd;
use std::sync::Arc;

use ash::vk;
use smithay::backend::drm::DrmDeviceFd;
use smithay::reexports::drm::buffer::DrmFourcc as Fourcc;
use smithay::reexports::gbm::Modifier;
use tracing::debug;

use crate::allocator::gbm::GbmAllocator;
use crate::allocator::{AllocatedBuffer, AllocatorBackend, BackendHandle, BackendTag};
use crate::config::VulkanConfig;
use crate::error::{Error, Result};
use crate::sync::SyncBridge;

/// A `VkImage` plus the per-buffer acquire/release semaphores and the
/// fence the producer's command batch must signal.
pub struct VkImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub acquire_semaphore: vk::Semaphore,
    pub release_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
    /// Set by `get_vk_semaphores`; cleared on the next dequeue. Enforces
    /// the documented "once per dequeue" accessor contract with `EBUSY`
    /// on the second call.
    pub semaphores_queried: bool,
    pub fence_queried: bool,
}

/// The four Vulkan pixel formats the external interface recognises,
/// combined with SRGB/UNORM and an optional alpha channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VkFormat {
    R8G8B8A8Unorm,
    R8G8B8A8Srgb,
    B8G8R8A8Unorm,
    B8G8R8A8Srgb,
}

impl VkFormat {
    pub fn to_ash(self) -> vk::Format {
        match self {
            VkFormat::R8G8B8A8Unorm => vk::Format::R8G8B8A8_UNORM,
            VkFormat::R8G8B8A8Srgb => vk::Format::R8G8B8A8_SRGB,
            VkFormat::B8G8R8A8Unorm => vk::Format::B8G8R8A8_UNORM,
            VkFormat::B8G8R8A8Srgb => vk::Format::B8G8R8A8_SRGB,
        }
    }

    /// Converts to the GBM fourcc this format maps onto, so the raw
    /// allocator can be driven from a Vulkan-format request.
    pub fn to_gbm_fourcc(self) -> Fourcc {
        match self {
            VkFormat::R8G8B8A8Unorm | VkFormat::R8G8B8A8Srgb => Fourcc::Abgr8888,
            VkFormat::B8G8R8A8Unorm | VkFormat::B8G8R8A8Srgb => Fourcc::Argb8888,
        }
    }

    /// The reverse of [`VkFormat::to_gbm_fourcc`], used when importing a
    /// buffer GBM already allocated. Srgb and Unorm share one fourcc, so
    /// this always resolves to the Unorm variant; callers that need Srgb
    /// sampling select it explicitly when they allocate, not here.
    pub fn from_gbm_fourcc(fourcc: Fourcc) -> Option<Self> {
        match fourcc {
            Fourcc::Abgr8888 => Some(VkFormat::R8G8B8A8Unorm),
            Fourcc::Argb8888 => Some(VkFormat::B8G8R8A8Unorm),
            _ => None,
        }
    }
}

pub struct VulkanAllocator {
    gbm: GbmAllocator,
    instance: ash::Instance,
    device: ash::Device,
    physical_device: vk::PhysicalDevice,
    config: VulkanConfig,
    sync_bridge: Option<Arc<SyncBridge>>,
}

impl VulkanAllocator {
    /// Opens the render node reachable from the physical device's DRM
    /// properties (`/dev/dri/renderD{minor}`, falling back to
    /// `/dev/dri/card{N}` when minor is below 128), then wraps it.
    /// `config.image_usage` and `config.required_features` gate every
    /// subsequent `import_image` call (see there).
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
        render_minor: u32,
        config: VulkanConfig,
    ) -> Result<Self> {
        let path = if render_minor >= 128 {
            format!("/dev/dri/renderD{render_minor}")
        } else {
            format!("/dev/dri/card{render_minor}")
        };
        let gbm = GbmAllocator::open(&path)?;
        let sync_bridge = SyncBridge::probe(DrmDeviceFd::new(gbm.device().node().clone())).ok();
        Ok(Self { gbm, instance, device, physical_device, config, sync_bridge })
    }

    fn import_image(&self, buffer: &AllocatedBuffer) -> Result<(vk::Image, vk::DeviceMemory)> {
        let vk_format = VkFormat::from_gbm_fourcc(buffer.fourcc)
            .ok_or_else(|| Error::not_supported(format!("no Vulkan format maps to fourcc {:?}", buffer.fourcc)))?
            .to_ash();

        // SAFETY: `get_physical_device_format_properties` only reads device
        // state; no external chain is attached.
        let properties = unsafe { self.instance.get_physical_device_format_properties(self.physical_device, vk_format) };
        let required = vk::FormatFeatureFlags::from_raw(self.config.required_features as u32);
        if !properties.optimal_tiling_features.contains(required) {
            return Err(Error::not_supported(format!(
                "format {vk_format:?} does not support the configured required features on this device"
            )));
        }

        let mut plane_layouts = Vec::with_capacity(buffer.plane_count);
        for i in 0..buffer.plane_count {
            plane_layouts.push(vk::SubresourceLayout {
                offset: buffer.offset[i] as u64,
                size: 0,
                row_pitch: buffer.stride[i] as u64,
                array_pitch: 0,
                depth_pitch: 0,
            });
        }

        let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(u64::from(buffer.modifier))
            .plane_layouts(&plane_layouts);

        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(vk_format)
            .extent(vk::Extent3D { width: buffer.width, height: buffer.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::from_raw(self.config.image_usage))
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .push_next(&mut external_info)
            .push_next(&mut modifier_info);

        // SAFETY: `create_info` references valid, live temporaries for
        // the duration of this call only.
        let image = unsafe { self.device.create_image(&create_info, None) }
            .map_err(|e| Error::io(format!("vkCreateImage with DRM modifier: {e:?}")))?;

        let requirements = unsafe { self.device.get_image_memory_requirements(image) };

        let plane0_fd = buffer
            .fd
            .first()
            .ok_or_else(|| Error::invalid("allocated buffer has no plane 0 fd"))?
            .as_fd();
        let dup_fd = nix::unistd::dup(plane0_fd).map_err(|e| Error::io(format!("dup plane 0 fd for vkImportMemory: {e}")))?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(std::os::fd::IntoRawFd::into_raw_fd(dup_fd));

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .push_next(&mut import_info);

        // SAFETY: `alloc_info` is a valid allocate-info chain for the
        // just-created image's memory requirements.
        let memory = unsafe { self.device.allocate_memory(&alloc_info, None) }.map_err(|e| {
            unsafe { self.device.destroy_image(image, None) };
            Error::io(format!("vkAllocateMemory with imported fd: {e:?}"))
        })?;

        // SAFETY: `image` and `memory` were both just created and are
        // bound exactly once, at offset 0.
        unsafe { self.device.bind_image_memory(image, memory, 0) }
            .map_err(|e| Error::io(format!("vkBindImageMemory: {e:?}")))?;

        Ok((image, memory))
    }

    fn create_sync_objects(&self) -> Result<(vk::Semaphore, vk::Semaphore, vk::Fence)> {
        let sem_info = vk::SemaphoreCreateInfo::default();
        // SAFETY: trivial create-info with no external chains.
        let acquire = unsafe { self.device.create_semaphore(&sem_info, None) }.map_err(|e| Error::io(format!("vkCreateSemaphore (acquire): {e:?}")))?;
        let release = unsafe { self.device.create_semaphore(&sem_info, None) }.map_err(|e| Error::io(format!("vkCreateSemaphore (release): {e:?}")))?;
        // Pre-signaled: `get_vk_semaphores`' first-ever call on a fresh
        // buffer waits on the previous submission's fence before handing
        // out semaphores, and there is no previous submission yet.
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        let fence = unsafe { self.device.create_fence(&fence_info, None) }.map_err(|e| Error::io(format!("vkCreateFence: {e:?}")))?;
        Ok((acquire, release, fence))
    }
}

impl AllocatorBackend for VulkanAllocator {
    fn tag(&self) -> BackendTag {
        BackendTag::Vulkan
    }

    fn alloc_buffer(&self, width: u32, height: u32, fourcc: Fourcc, modifiers: &[Modifier]) -> Result<AllocatedBuffer> {
        let mut buffer = self.gbm.alloc_buffer(width, height, fourcc, modifiers)?;
        let (image, memory) = self.import_image(&buffer)?;
        let (acquire_semaphore, release_semaphore, fence) = self.create_sync_objects()?;
        buffer.backend_handle = Some(BackendHandle::Vulkan(VkImage {
            image,
            memory,
            acquire_semaphore,
            release_semaphore,
            fence,
            semaphores_queried: false,
            fence_queried: false,
        }));
        Ok(buffer)
    }

    fn free_buffer(&self, buffer: &mut AllocatedBuffer) {
        if let Some(BackendHandle::Vulkan(vk_image)) = buffer.backend_handle.take() {
            // SAFETY: these handles are only ever owned by this buffer and
            // are not in use on any queue once the buffer pool decides to
            // free it (the pool already waited for idle in `free_buffer`'s
            // caller ordering).
            unsafe {
                self.device.destroy_fence(vk_image.fence, None);
                self.device.destroy_semaphore(vk_image.release_semaphore, None);
                self.device.destroy_semaphore(vk_image.acquire_semaphore, None);
                self.device.destroy_image(vk_image.image, None);
                self.device.free_memory(vk_image.memory, None);
            }
        }
        self.gbm.free_buffer(buffer);
    }

    fn enqueue_buffer(&self, buffer: &AllocatedBuffer) -> Result<()> {
        if let Some(BackendHandle::Vulkan(_)) = &buffer.backend_handle {
            // The release sync-file is exported by the sync bridge from
            // the release semaphore's underlying timeline once the
            // producer's command batch signals `fence`; that translation
            // lives in `sync.rs` and is driven from `stream.rs`'s enqueue
            // path, not here.
        }
        Ok(())
    }

    fn sync_bridge(&self) -> Option<&Arc<SyncBridge>> {
        self.sync_bridge.as_ref()
    }

    fn destroy(&mut self) {
        if self.sync_bridge.take().is_some() {
            debug!("vulkan allocator: dropped sync bridge on teardown");
        }
    }

    /// Waits for the previous submission's fence, resets it, and returns
    /// the acquire/release semaphore pair as raw handles. `EBUSY` if
    /// already called for this dequeue (`mark_semaphores_queried`).
    fn vk_semaphores(&self, buffer: &mut AllocatedBuffer) -> Result<(u64, u64)> {
        let Some(BackendHandle::Vulkan(vk_image)) = &mut buffer.backend_handle else {
            return Err(Error::not_supported("buffer has no Vulkan image"));
        };
        mark_semaphores_queried(vk_image)?;
        // SAFETY: `fence` belongs to this buffer alone and is never waited
        // on concurrently (enforced by `semaphores_queried`'s EBUSY gate).
        unsafe {
            self.device
                .wait_for_fences(&[vk_image.fence], true, u64::MAX)
                .map_err(|e| Error::io(format!("vkWaitForFences: {e:?}")))?;
            self.device.reset_fences(&[vk_image.fence]).map_err(|e| Error::io(format!("vkResetFences: {e:?}")))?;
        }
        Ok((ash::vk::Handle::as_raw(vk_image.acquire_semaphore), ash::vk::Handle::as_raw(vk_image.release_semaphore)))
    }

    /// Returns the fence the producer's command batch must signal.
    /// `EBUSY` if already called for this dequeue (`mark_fence_queried`).
    fn vk_fence(&self, buffer: &mut AllocatedBuffer) -> Result<u64> {
        let Some(BackendHandle::Vulkan(vk_image)) = &mut buffer.backend_handle else {
            return Err(Error::not_supported("buffer has no Vulkan image"));
        };
        mark_fence_queried(vk_image)?;
        Ok(ash::vk::Handle::as_raw(vk_image.fence))
    }
}

/// Thin RAII guard used by `buffer.rs` to enforce the "export once per
/// dequeue" contract on a `VkImage` without duplicating the bookkeeping
/// in every call site.
pub fn mark_semaphores_queried(vk_image: &mut VkImage) -> Result<()> {
    if vk_image.semaphores_queried {
        return Err(Error::Busy("get_vk_semaphores called twice for this dequeue".into()));
    }
    vk_image.semaphores_queried = true;
    Ok(())
}

pub fn mark_fence_queried(vk_image: &mut VkImage) -> Result<()> {
    if vk_image.fence_queried {
        return Err(Error::Busy("get_vk_fence called twice for this dequeue".into()));
    }
    vk_image.fence_queried = true;
    Ok(())
}

pub fn reset_per_dequeue_flags(vk_image: &mut VkImage) {
    vk_image.semaphores_queried = false;
    vk_image.fence_queried = false;
}
