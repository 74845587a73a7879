//! Buffer records and the pool that owns them.
//!
//! A [`Buffer`] is allocated in response to the transport's `add_buffer`
//! callback and freed on `remove_buffer`, unless it is currently in the
//! producer's hands — in which case it is orphaned (its transport handle
//! is cleared) and freed lazily on the next `enqueue`/`return`.

use std::os::fd::{AsFd, OwnedFd};

use crate::allocator::{AllocatedBuffer, AllocatorBackend, BackendHandle};
use crate::error::{Error, Result};
use crate::sync::SyncPoint;

/// A single buffer slot in a stream's pool.
pub struct Buffer {
    /// The transport's raw `pw_buffer` pointer for this slot, reused as a
    /// stable key. Used instead of a strong back-reference to the owning
    /// stream, per the weak-index cycle-breaking convention (stream ->
    /// buffers is a weak index, buffer -> stream is a borrow scoped to one
    /// call).
    pub id: usize,
    /// Set once `remove_buffer` fires while this slot is dequeued. The
    /// record survives until the next `enqueue`/`return` frees it.
    pub removed: bool,
    pub allocation: AllocatedBuffer,
    pub dequeued: bool,
    pub acquire: SyncPoint,
    pub release: SyncPoint,
    pub release_sync_file_set: bool,
    /// Negotiated per the `set_sync(EXPLICIT_HYBRID) && !backend_sync`
    /// rule in the buffer-pool add path.
    pub frontend_sync: bool,
    /// Always `false` today; see the design notes on why no shipped
    /// backend claims backend-provided explicit sync.
    pub backend_sync: bool,
    pub sent_count: u64,
}

impl Buffer {
    /// Resets the per-dequeue query flags (`acquire.queried`,
    /// `release.queried`, `release_sync_file_set`, and any Vulkan
    /// per-dequeue accessor flags) so the "queried once per dequeue"
    /// contracts start fresh.
    pub fn reset_per_dequeue_flags(&mut self) {
        self.acquire.queried = false;
        self.release.queried = false;
        self.release_sync_file_set = false;
        if let Some(BackendHandle::Vulkan(vk_image)) = &mut self.allocation.backend_handle {
            crate::allocator::vulkan::reset_per_dequeue_flags(vk_image);
        }
    }

    /// True if this buffer was removed from the transport's pool while
    /// still in the producer's hands.
    pub fn is_orphaned(&self) -> bool {
        self.removed
    }

    /// Duplicates the dma-buf fd for plane 0, for callers that need to
    /// pass an owned copy into an implicit-sync ioctl.
    pub fn dup_plane0_fd(&self) -> Result<OwnedFd> {
        let fd = self.allocation.fd.first().ok_or_else(|| Error::invalid("buffer has no plane 0 fd"))?;
        nix::unistd::dup(fd.as_fd()).map_err(|e| Error::io(format!("dup plane 0 fd: {e}")))
    }
}

/// Owns every [`Buffer`] a stream currently knows about, keyed by the
/// transport's buffer id.
#[derive(Default)]
pub struct BufferPool {
    buffers: Vec<Buffer>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn get(&self, id: usize) -> Option<&Buffer> {
        self.buffers.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Buffer> {
        self.buffers.iter_mut().find(|b| b.id == id)
    }

    /// Inserts a freshly-allocated buffer for `add_buffer`.
    pub fn insert(&mut self, buffer: Buffer) {
        self.buffers.push(buffer);
    }

    /// Removes and returns the buffer for `remove_buffer`, so the caller
    /// can decide between immediate free and orphaning.
    pub fn take(&mut self, id: usize) -> Option<Buffer> {
        let index = self.buffers.iter().position(|b| b.id == id)?;
        Some(self.buffers.remove(index))
    }

    /// Frees `buffer` in the documented order: user free callback, then
    /// the backend's free hook, then the allocator BO, then the owned
    /// plane fds, then the buffer's own sync-objects.
    pub fn free(
        buffer: Buffer,
        backend: &dyn AllocatorBackend,
        mut user_free: impl FnMut(&Buffer),
    ) {
        user_free(&buffer);
        let mut buffer = buffer;
        backend.free_buffer(&mut buffer.allocation);
        // `buffer.allocation.fd` drops here, closing every plane fd.
        if let Some(bridge) = backend.sync_bridge() {
            if buffer.frontend_sync {
                bridge.destroy_timeline(buffer.acquire.handle);
                bridge.destroy_timeline(buffer.release.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_allocation() -> AllocatedBuffer {
        AllocatedBuffer {
            width: 0,
            height: 0,
            fourcc: smithay::reexports::drm::buffer::DrmFourcc::Argb8888,
            modifier: smithay::reexports::gbm::Modifier::Linear,
            plane_count: 0,
            stride: [0; 4],
            offset: [0; 4],
            fd: Vec::new(),
            backend_handle: None,
            gbm_bo: None,
        }
    }

    #[test]
    fn orphaned_buffer_has_no_pw_handle() {
        let buffer = Buffer {
            id: 1,
            removed: true,
            allocation: empty_allocation(),
            dequeued: true,
            acquire: SyncPoint::default(),
            release: SyncPoint::default(),
            release_sync_file_set: false,
            frontend_sync: false,
            backend_sync: false,
            sent_count: 0,
        };
        assert!(buffer.is_orphaned());
    }

    #[test]
    fn pool_insert_and_take_round_trip() {
        let mut pool = BufferPool::new();
        pool.insert(Buffer {
            id: 7,
            removed: false,
            allocation: empty_allocation(),
            dequeued: false,
            acquire: SyncPoint::default(),
            release: SyncPoint::default(),
            release_sync_file_set: false,
            frontend_sync: false,
            backend_sync: false,
            sent_count: 0,
        });
        assert!(pool.get(7).is_some());
        let taken = pool.take(7).unwrap();
        assert_eq!(taken.id, 7);
        assert!(pool.get(7).is_none());
    }
}
