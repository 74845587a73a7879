//! Sync bridge: translates between per-buffer sync-file descriptors and
//! timeline sync-object `(handle, point)` pairs.
//!
//! Two representations exist for the producer side of a buffer's fences:
//!
//! - **sync-file** — a single fd that signals once, when the fence fires.
//! - **timeline sync-object** — a kernel object holding a monotonic `u64`
//!   point; a waiter blocks until the stored value reaches a target point.
//!
//! A DRM render node can be asked to translate either way. Kernels that
//! don't accept the `TIMELINE` flag on `SYNCOBJ_HANDLE_TO_FD` /
//! `FD_TO_HANDLE` need a staging translation through one dummy binary
//! syncobj per direction; [`SyncBridge::supports_timeline_transfer`]
//! detects this once at stream-start and every subsequent buffer reuses
//! the cached answer.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;

use smithay::reexports::drm::control::Device as DrmControlDevice;
use smithay::backend::drm::DrmDeviceFd;

use crate::error::{Error, Result};

/// `{handle, point, queried}` — one direction (acquire or release) of a
/// buffer's explicit-sync state. Points increase strictly monotonically
/// per buffer per direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncPoint {
    pub handle: u32,
    pub point: u64,
    /// Set once a `get_*`/`set_*` accessor has successfully produced a
    /// value for this direction during the buffer's current dequeue.
    pub queried: bool,
}

impl SyncPoint {
    fn bump(&mut self) -> u64 {
        let point = self.point;
        self.point += 1;
        point
    }
}

/// Per-render-node sync bridge. One instance is shared (via `Arc`) by
/// every buffer allocated against the same device.
pub struct SyncBridge {
    device: DrmDeviceFd,
    timeline_transfer_supported: bool,
}

impl SyncBridge {
    /// Probes whether `device` accepts the `TIMELINE` flag on
    /// `SYNCOBJ_HANDLE_TO_FD`/`FD_TO_HANDLE`, and wraps it for use by
    /// buffers allocated against it.
    pub fn probe(device: DrmDeviceFd) -> Result<Arc<Self>> {
        let probe_handle = device
            .create_syncobj(false)
            .map_err(|e| Error::io(format!("create probe syncobj: {e}")))?;
        let timeline_transfer_supported = device.syncobj_to_fd(probe_handle, Some(0)).is_ok();
        let _ = device.destroy_syncobj(probe_handle);
        Ok(Arc::new(Self { device, timeline_transfer_supported }))
    }

    pub fn supports_timeline_transfer(&self) -> bool {
        self.timeline_transfer_supported
    }

    /// Allocates a fresh binary (non-timeline) syncobj at point 0, used
    /// as both the acquire and release timeline for a newly-allocated
    /// buffer.
    pub fn create_timeline(&self) -> Result<u32> {
        self.device
            .create_syncobj(false)
            .map_err(|e| Error::io(format!("create timeline syncobj: {e}")))
    }

    pub fn destroy_timeline(&self, handle: u32) {
        let _ = self.device.destroy_syncobj(handle);
    }

    /// Imports a sync-file fence into `point` on `sync.handle`, staging
    /// through the dummy binary syncobj if the kernel can't import
    /// directly at an arbitrary timeline point.
    pub fn import_sync_file(&self, sync: &mut SyncPoint, fd: BorrowedFd<'_>) -> Result<()> {
        if self.timeline_transfer_supported {
            self.device
                .fd_to_syncobj_timeline(fd, sync.handle, sync.point)
                .map_err(|e| Error::io(format!("import sync-file into timeline: {e}")))?;
        } else {
            let dummy = self.create_timeline()?;
            let result = self
                .device
                .fd_to_syncobj(fd, dummy)
                .map_err(|e| Error::io(format!("import sync-file into dummy syncobj: {e}")))
                .and_then(|()| {
                    self.device
                        .syncobj_transfer(dummy, 0, sync.handle, sync.point)
                        .map_err(|e| Error::io(format!("transfer dummy syncobj into timeline: {e}")))
                });
            self.destroy_timeline(dummy);
            result?;
        }
        sync.queried = true;
        Ok(())
    }

    /// Exports `point` on `sync.handle` as a new sync-file, returning an
    /// owned fd the caller must close. Does not advance `sync.point`;
    /// callers that intend to bump the timeline do so explicitly.
    pub fn export_sync_file(&self, sync: &SyncPoint) -> Result<OwnedFd> {
        if self.timeline_transfer_supported {
            self.device
                .syncobj_timeline_to_fd(sync.handle, sync.point)
                .map_err(|e| Error::io(format!("export timeline point as sync-file: {e}")))
        } else {
            let dummy = self.create_timeline()?;
            let result = self
                .device
                .syncobj_transfer(sync.handle, sync.point, dummy, 0)
                .map_err(|e| Error::io(format!("transfer timeline into dummy syncobj: {e}")))
                .and_then(|()| {
                    self.device
                        .syncobj_to_fd(dummy, None)
                        .map_err(|e| Error::io(format!("export dummy syncobj as sync-file: {e}")))
                });
            self.destroy_timeline(dummy);
            result
        }
    }

    /// Exports the dma-buf's read-side implicit fence as a sync-file,
    /// imports it into `acquire` at the current point, and bumps the
    /// point. Used when `!backend_sync` (always, today — see the design
    /// notes on why `backend_sync` never becomes `true`).
    pub fn acquire_from_implicit(&self, acquire: &mut SyncPoint, dmabuf_fd: BorrowedFd<'_>) -> Result<()> {
        let fence = export_implicit_read_fence(dmabuf_fd)?;
        self.import_sync_file(acquire, fence.as_fd())?;
        acquire.bump();
        Ok(())
    }

    /// Exports `release`'s current point as a sync-file and imports it
    /// into the dma-buf's write-side implicit fence, then bumps the
    /// point, so implicit-sync consumers still observe the release fence.
    pub fn release_into_implicit(&self, release: &mut SyncPoint, dmabuf_fd: BorrowedFd<'_>) -> Result<()> {
        let fence = self.export_sync_file(release)?;
        import_implicit_write_fence(dmabuf_fd, fence.as_fd())?;
        release.bump();
        Ok(())
    }

    /// Exports the dma-buf's read-side implicit fence as a sync-file, for
    /// a style-(A) (sync-file) producer's `get_acquire_sync_file`. Unlike
    /// [`SyncBridge::acquire_from_implicit`], this does not touch any
    /// timeline sync-object — style-(A) producers bypass it entirely.
    pub fn export_acquire_sync_file(&self, dmabuf_fd: BorrowedFd<'_>) -> Result<OwnedFd> {
        export_implicit_read_fence(dmabuf_fd)
    }

    /// Imports `fence_fd` into the dma-buf's write-side implicit fence,
    /// for a style-(A) producer's `set_release_sync_file`.
    pub fn import_release_sync_file(&self, dmabuf_fd: BorrowedFd<'_>, fence_fd: BorrowedFd<'_>) -> Result<()> {
        import_implicit_write_fence(dmabuf_fd, fence_fd)
    }
}

/// Exports the read-side implicit fence of a dma-buf as a one-shot
/// sync-file, via `DMA_BUF_IOCTL_EXPORT_SYNC_FILE`.
fn export_implicit_read_fence(dmabuf_fd: BorrowedFd<'_>) -> Result<OwnedFd> {
    dmabuf_sync_file::export(dmabuf_fd, dmabuf_sync_file::Direction::Read)
        .map_err(|e| Error::io(format!("export dma-buf read fence: {e}")))
}

/// Imports a sync-file fence into the write-side implicit fence of a
/// dma-buf, via `DMA_BUF_IOCTL_IMPORT_SYNC_FILE`.
fn import_implicit_write_fence(dmabuf_fd: BorrowedFd<'_>, fence_fd: BorrowedFd<'_>) -> Result<()> {
    dmabuf_sync_file::import(dmabuf_fd, dmabuf_sync_file::Direction::Write, fence_fd)
        .map_err(|e| Error::io(format!("import dma-buf write fence: {e}")))
}

/// Thin wrapper around the `DMA_BUF_IOCTL_{EX,IM}PORT_SYNC_FILE` ioctls
/// (`linux/dma-buf.h`), which `nix`/`libc` do not yet wrap directly.
mod dmabuf_sync_file {
    use std::io;
    use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

    #[repr(u32)]
    pub enum Direction {
        Read = 1,
        Write = 2,
    }

    #[repr(C)]
    struct DmaBufSyncFile {
        flags: u32,
        fd: i32,
    }

    const DMA_BUF_IOCTL_EXPORT_SYNC_FILE: u64 = 0x4004_62cc;
    const DMA_BUF_IOCTL_IMPORT_SYNC_FILE: u64 = 0x4004_62cd;

    pub fn export(dmabuf_fd: BorrowedFd<'_>, direction: Direction) -> io::Result<OwnedFd> {
        let mut arg = DmaBufSyncFile { flags: direction as u32, fd: -1 };
        // SAFETY: `arg` is a valid, appropriately-sized buffer for this ioctl
        // for the duration of the call; the kernel writes the exported fd
        // back into `arg.fd`.
        let ret = unsafe { libc::ioctl(dmabuf_fd.as_raw_fd(), DMA_BUF_IOCTL_EXPORT_SYNC_FILE as _, &mut arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: the kernel set `arg.fd` to a freshly-opened, owned fd on success.
        Ok(unsafe { OwnedFd::from_raw_fd(arg.fd) })
    }

    pub fn import(dmabuf_fd: BorrowedFd<'_>, direction: Direction, fence_fd: BorrowedFd<'_>) -> io::Result<()> {
        let arg = DmaBufSyncFile { flags: direction as u32, fd: fence_fd.as_raw_fd() };
        // SAFETY: `arg` is a valid, appropriately-sized buffer for this ioctl
        // for the duration of the call.
        let ret = unsafe { libc::ioctl(dmabuf_fd.as_raw_fd(), DMA_BUF_IOCTL_IMPORT_SYNC_FILE as _, &arg) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_point_bump_is_monotonic() {
        let mut point = SyncPoint::default();
        let first = point.bump();
        let second = point.bump();
        assert!(second > first);
        assert_eq!(point.point, 2);
    }
}
