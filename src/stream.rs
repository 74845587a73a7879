//! The stream state machine: pacing, the producer/consumer handshake,
//! and the public dequeue/enqueue/return/skip_frame surface.
//!
//! The callbacks the loop thread invokes (`add_buffer`, `remove_buffer`,
//! `param_changed`, `process`, `state_changed`) run on a genuinely
//! different OS thread than the one calling the producer-facing methods
//! below. `Inner` is therefore shared behind `Arc<parking_lot::Mutex<_>>`,
//! not the single-threaded `Rc<RefCell<_>>` niri uses for the equivalent
//! `CastState` — `Mutex` gives the compiler a real `Sync` bound to check
//! instead of trusting that `ThreadLoop::lock()`'s external serialisation
//! is never bypassed. Most methods still also hold the transport's own
//! loop lock (`Context::thread_loop().lock()`) for as long as they need
//! the libpipewire calls serialised against the loop thread; the `Mutex`
//! is what makes holding `Inner` across *that* boundary sound.

use std::sync::Arc;

use parking_lot::Mutex;
use pipewire::spa::utils::Direction;
use pipewire::stream::{Stream as PwStream, StreamFlags, StreamListener, StreamState as PwStreamState};
use tracing::{debug, trace, warn};

use crate::allocator::AllocatorBackend;
use crate::buffer::{Buffer, BufferPool};
use crate::config::{Fraction, PacingMode, RateTriple, StreamConfig, SyncMode};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::negotiation::{self, NegotiatedState, NegotiationOutcome};
use crate::sync::SyncPoint;
use crate::wire;

/// Opaque handle to a dequeued buffer. Valid only until the matching
/// `enqueue`/`return_buffer` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHandle(pub(crate) usize);

/// Three-way rendezvous state used only in `SYNCHRONOUS` pacing mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Inactive,
    Waiting,
    Active,
}

struct PacingState {
    active: bool,
    cycle_state: CycleState,
    pending_buffer: Option<usize>,
    skip_buffer: bool,
    buffers_dequeued: u8,
    skip_frames: u32,
}

impl Default for PacingState {
    fn default() -> Self {
        Self {
            active: false,
            cycle_state: CycleState::Inactive,
            pending_buffer: None,
            skip_buffer: false,
            buffers_dequeued: 0,
            skip_frames: 0,
        }
    }
}

/// State shared between the producer-facing `Stream` methods and the
/// loop-thread callbacks. Everything here is only ever touched while the
/// transport's loop lock is held.
struct Inner {
    context: Arc<Context>,
    backend: Box<dyn AllocatorBackend>,
    explicit_sync_required: bool,

    config: StreamConfig,
    cur_config: StreamConfig,
    negotiated: NegotiatedState,
    pacing: PacingState,
    pool: BufferPool,
    transport_state: PwStreamState,
}

impl Inner {
    fn unblock_process(&mut self, guard: &pipewire::thread_loop::ThreadLoopLockGuard<'_>) {
        if self.pacing.cycle_state == CycleState::Active {
            guard.accept();
            self.pacing.cycle_state = CycleState::Inactive;
        }
    }

    fn on_state_changed(&mut self, new_state: PwStreamState) {
        trace!(?new_state, "stream state changed");
        self.transport_state = new_state;
        if !matches!(new_state, PwStreamState::Streaming) {
            self.pacing.pending_buffer = None;
            self.pacing.skip_buffer = false;
        }
    }

    fn on_param_changed(&mut self, pw_stream: &PwStream, id: u32, pod: Option<&libspa::pod::Pod>) {
        if id != libspa::param::ParamType::Format.as_raw() {
            return;
        }
        let Some(pod) = pod else { return };

        let parsed = match negotiation::parse_offered_format(pod) {
            Ok(Some(parsed)) => parsed,
            Ok(None) => return,
            Err(err) => {
                warn!(%err, "on_param_changed: could not parse offered format");
                return;
            }
        };
        let (fourcc, width, height) = parsed;

        let mut modifiers = match negotiation::read_modifier_choice(pod) {
            Ok(m) => m,
            Err(err) => {
                warn!(%err, "on_param_changed: could not read modifier choice");
                return;
            }
        };
        modifiers.dedup();

        match negotiation::negotiate(&mut self.negotiated, self.backend.as_ref(), fourcc, width, height, &modifiers) {
            Ok(NegotiationOutcome::Fixated { modifier, .. }) => {
                if let Some(entry) = self.config.formats.find(fourcc) {
                    let mut scratch = Vec::new();
                    let object = wire::fixated_format_params(entry, modifier, width, height, self.config.rate);
                    let pod = wire::serialize(&mut scratch, object);
                    let mut params = [pod];
                    if let Err(e) = pw_stream.update_params(&mut params) {
                        warn!(%e, "failed to update params with fixated format");
                    }
                }
            }
            Ok(NegotiationOutcome::AlreadyNegotiated) => {
                self.negotiated.ready = true;
                let objects = wire::buffers_params(self.cur_config.buffer_count, self.negotiated.plane_count);
                let mut scratch_buffers: Vec<Vec<u8>> = objects.iter().map(|_| Vec::new()).collect();
                let mut params = Vec::new();
                for (object, scratch) in objects.into_iter().zip(scratch_buffers.iter_mut()) {
                    params.push(wire::serialize(scratch, object));
                }
                if let Err(e) = pw_stream.update_params(&mut params) {
                    warn!(%e, "failed to update buffers/meta params");
                }
            }
            Err(err) => warn!(%err, "negotiation failed for offered format"),
        }
    }

    /// Allocates against the *current* (already negotiated) fourcc and
    /// modifier, populates sync state, and invokes the backend alloc
    /// hook, per §4.5.
    fn on_add_buffer(&mut self, id: usize) {
        let Some(fourcc) = self.negotiated.fourcc else {
            warn!("on_add_buffer before negotiation settled");
            return;
        };

        let allocation = match self.backend.alloc_buffer(self.negotiated.width, self.negotiated.height, fourcc, &[self.negotiated.modifier]) {
            Ok(a) => a,
            Err(err) => {
                warn!(%err, "on_add_buffer: allocation failed");
                return;
            }
        };

        let backend_sync = false;
        let frontend_sync = self.cur_config.sync_mode == SyncMode::ExplicitHybrid && !backend_sync;

        let (acquire, release) = if frontend_sync {
            match self.backend.sync_bridge() {
                Some(bridge) => (
                    bridge.create_timeline().map(|h| SyncPoint { handle: h, point: 0, queried: false }).unwrap_or_default(),
                    bridge.create_timeline().map(|h| SyncPoint { handle: h, point: 0, queried: false }).unwrap_or_default(),
                ),
                None => (SyncPoint::default(), SyncPoint::default()),
            }
        } else {
            (SyncPoint::default(), SyncPoint::default())
        };

        self.pool.insert(Buffer {
            id,
            removed: false,
            allocation,
            dequeued: false,
            acquire,
            release,
            release_sync_file_set: false,
            frontend_sync,
            backend_sync,
            sent_count: 0,
        });
    }

    /// Orphans the record if it is currently dequeued, otherwise frees it
    /// immediately; clears `pending_buffer` if it pointed here.
    fn on_remove_buffer(&mut self, id: usize) {
        if self.pacing.pending_buffer == Some(id) {
            self.pacing.pending_buffer = None;
        }

        let Some(mut buffer) = self.pool.take(id) else { return };
        if buffer.dequeued {
            buffer.removed = true;
            self.pool.insert(buffer);
        } else {
            BufferPool::free(buffer, self.backend.as_ref(), |_| {});
        }
    }

    /// The loop thread's `process()` callback: runs the SYNCHRONOUS
    /// handshake step, drains a pending buffer or consumes a skip, then
    /// signals every waiter.
    fn process(&mut self, pw_stream: &PwStream, guard: &pipewire::thread_loop::ThreadLoopLockGuard<'_>) {
        if !self.pacing.active {
            return;
        }
        if self.config.pacing_mode == PacingMode::Synchronous && self.pacing.cycle_state == CycleState::Waiting {
            self.pacing.cycle_state = CycleState::Active;
            guard.signal(true);
        }
        if let Some(id) = self.pacing.pending_buffer.take() {
            requeue(pw_stream, id);
        } else if self.pacing.skip_buffer {
            self.pacing.skip_buffer = false;
        }
        guard.signal(false);
    }
}

/// Hands a dequeued slot back to the transport by its stable pointer id.
/// Buffer slots are a fixed-size, pointer-stable array for the life of
/// the connection (see `add_buffer`/`remove_buffer` above), so the id is
/// sufficient to identify the slot without holding on to a borrowed guard
/// across the blocking dequeue/enqueue calls.
fn requeue(pw_stream: &PwStream, id: usize) {
    raw_buffers::requeue(pw_stream, id);
}

/// Thin wrapper around the two libpipewire buffer-queue entry points.
/// `pipewire::stream::Stream` has no safe by-id dequeue/requeue pair (its
/// `process` callback model assumes you drain everything inline), but the
/// producer side here dequeues from a separate thread than the one the
/// loop's callbacks run on, so the raw C calls are used directly instead.
mod raw_buffers {
    use pipewire::stream::Stream as PwStream;
    use pipewire::sys;

    pub fn dequeue(stream: &PwStream) -> Option<usize> {
        // SAFETY: `stream.as_raw_ptr()` is valid for the stream's lifetime;
        // `pw_stream_dequeue_buffer` returns null when no slot is free.
        let raw = unsafe { sys::pw_stream_dequeue_buffer(stream.as_raw_ptr()) };
        if raw.is_null() {
            None
        } else {
            Some(raw as usize)
        }
    }

    pub fn requeue(stream: &PwStream, id: usize) {
        let raw = id as *mut sys::pw_buffer;
        // SAFETY: `id` was produced by a previous `dequeue`/`add_buffer`
        // call on this same stream and has not already been requeued.
        unsafe { sys::pw_stream_queue_buffer(stream.as_raw_ptr(), raw) };
    }
}

/// One logical video output.
pub struct Stream {
    name: String,
    context: Arc<Context>,
    pw_stream: PwStream,
    _listener: StreamListener<()>,
    inner: Arc<Mutex<Inner>>,
}

impl Stream {
    /// Creates a stream against `context` with the given name and
    /// allocator backend. Does not connect to the transport yet —
    /// `configure` then `start` do that.
    pub fn new(context: Arc<Context>, name: impl Into<String>, backend: Box<dyn AllocatorBackend>) -> Result<Self> {
        let name = name.into();
        // No shipped backend mandates explicit-only sync today; kept as a
        // field rather than a constant since a future Vulkan backend that
        // drops GBM's implicit-fence fallback would set it per-instance.
        let explicit_sync_required = false;

        let inner = Arc::new(Mutex::new(Inner {
            context: context.clone(),
            backend,
            explicit_sync_required,
            config: StreamConfig::default(),
            cur_config: StreamConfig::default(),
            negotiated: NegotiatedState::default(),
            pacing: PacingState::default(),
            pool: BufferPool::new(),
            transport_state: PwStreamState::Unconnected,
        }));

        let guard = context.thread_loop().lock();
        let pw_stream = PwStream::new(
            context.core(),
            &name,
            pipewire::properties::properties! {
                "media.type" => "Video",
                "media.class" => "Stream/Output/Video",
            },
        )
        .map_err(|e| Error::io(format!("create stream: {e}")))?;

        let listener = pw_stream
            .add_local_listener_with_user_data(())
            .state_changed({
                let inner = inner.clone();
                move |_stream, (), _old, new| inner.lock().on_state_changed(new)
            })
            .param_changed({
                let inner = inner.clone();
                move |stream, (), id, pod| inner.lock().on_param_changed(stream, id, pod)
            })
            .add_buffer({
                let inner = inner.clone();
                move |_stream, (), buffer| {
                    // The transport hands out a fixed-size array of buffer
                    // slots for the life of the connection; the raw pointer
                    // is therefore a stable per-slot key, used the same way
                    // across add_buffer/remove_buffer/dequeue.
                    let id = buffer as usize;
                    inner.lock().on_add_buffer(id);
                }
            })
            .remove_buffer({
                let inner = inner.clone();
                move |_stream, (), buffer| {
                    let id = buffer as usize;
                    inner.lock().on_remove_buffer(id);
                }
            })
            .process({
                let inner = inner.clone();
                let context = context.clone();
                move |stream, ()| {
                    let guard = context.thread_loop().lock();
                    inner.lock().process(stream, &guard);
                }
            })
            .register();
        drop(guard);

        Ok(Self { name, context, pw_stream, _listener: listener, inner })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    // -----------------------------------------------------------------
    // Format registry mutators (§4.2)
    // -----------------------------------------------------------------

    pub fn set_size(&self, width: u32, height: u32) -> Result<()> {
        if width == 0 || height == 0 {
            return Err(Error::invalid("set_size: width and height must be positive"));
        }
        let mut inner = self.inner.lock();
        inner.config.width = width;
        inner.config.height = height;
        Ok(())
    }

    pub fn set_rate(&self, default: Fraction, min: Fraction, max: Fraction) -> Result<()> {
        if default.denom == 0 || min.denom == 0 || max.denom == 0 {
            return Err(Error::invalid("set_rate: denominator must not be zero"));
        }
        self.inner.lock().config.rate = RateTriple { default, min, max };
        Ok(())
    }

    pub fn set_mode(&self, mode: PacingMode) {
        let mut inner = self.inner.lock();
        inner.config.pacing_mode = mode;
        inner.config.buffer_count = crate::config::BufferCountTriple::for_pacing_mode(mode);
    }

    /// Applies the `set_sync` policy table from §4.2: validates the
    /// requested mode against the backend's explicit-sync capability and
    /// downgrades or rejects as documented.
    pub fn set_sync(&self, requested: SyncMode) -> Result<()> {
        let mut inner = self.inner.lock();
        let supported = inner.backend.explicit_sync_supported();
        let required = inner.explicit_sync_required;

        let resolved = match requested {
            SyncMode::Implicit if required => return Err(Error::not_supported("explicit sync is required by this backend")),
            SyncMode::Implicit => SyncMode::Implicit,
            SyncMode::Either if !supported => SyncMode::Implicit,
            SyncMode::Either => SyncMode::Either,
            SyncMode::ExplicitHybrid | SyncMode::ExplicitOnly if !supported => {
                return Err(Error::not_supported("backend does not support explicit sync"));
            }
            SyncMode::ExplicitOnly => SyncMode::ExplicitOnly,
            SyncMode::ExplicitHybrid => SyncMode::ExplicitHybrid,
        };

        inner.config.sync_mode = resolved;
        Ok(())
    }

    pub fn clear_formats(&self) {
        self.inner.lock().config.formats.clear();
    }

    pub fn add_format(&self, fourcc: smithay::reexports::drm::buffer::DrmFourcc, modifiers: Vec<smithay::reexports::gbm::Modifier>) -> Result<()> {
        self.inner.lock().config.formats.add_format(fourcc, modifiers)
    }

    pub fn has_nonlinear_tiling(&self) -> bool {
        self.inner.lock().config.has_nonlinear_tiling()
    }

    /// Returns EINPROGRESS until negotiation settles.
    pub fn get_rate(&self) -> Result<Fraction> {
        let inner = self.inner.lock();
        if !inner.negotiated.ready {
            return Err(Error::InProgress("format not yet negotiated".into()));
        }
        Ok(inner.cur_config.rate.default)
    }

    // -----------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------

    /// Commits the pending configuration, publishing the initial
    /// `EnumFormat` offer for every configured format entry.
    #[tracing::instrument(name = "stream_configure", skip(self))]
    pub fn configure(&mut self) -> Result<()> {
        let entries = {
            let inner = self.inner.lock();
            inner.config.validate().map_err(|issues| Error::invalid(issues.join("; ")))?;
            negotiation::initial_offer_is_valid(&inner.config.formats)?;
            (inner.config.formats.entries().to_vec(), inner.config.width, inner.config.height, inner.config.rate)
        };
        let (formats, width, height, rate) = entries;

        let guard = self.context.thread_loop().lock();
        let mut scratch_buffers: Vec<Vec<u8>> = formats.iter().map(|_| Vec::new()).collect();
        let mut params = Vec::with_capacity(formats.len());
        for (entry, scratch) in formats.iter().zip(scratch_buffers.iter_mut()) {
            let object = wire::format_params(entry, width, height, rate);
            params.push(wire::serialize(scratch, object));
        }

        self.pw_stream
            .connect(Direction::Output, None, StreamFlags::DRIVER | StreamFlags::ALLOC_BUFFERS, &mut params)
            .map_err(|e| Error::io(format!("stream connect: {e}")))?;
        drop(guard);

        let mut inner = self.inner.lock();
        inner.cur_config = inner.config.clone();
        debug!(width, height, "stream configured");
        Ok(())
    }

    #[tracing::instrument(name = "stream_start", skip(self))]
    pub fn start(&self) -> Result<()> {
        let _guard = self.context.thread_loop().lock();
        self.inner.lock().pacing.active = true;
        Ok(())
    }

    /// Stops the stream and unblocks every waiter: sets `active=false`
    /// and runs `unblock_process` so a process() blocked on a
    /// SYNCHRONOUS ack is released too.
    #[tracing::instrument(name = "stream_stop", skip(self))]
    pub fn stop(&self) -> Result<()> {
        let guard = self.context.thread_loop().lock();
        let mut inner = self.inner.lock();
        inner.pacing.active = false;
        inner.unblock_process(&guard);
        guard.signal(false);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pacing state machine (§4.6)
    // -----------------------------------------------------------------

    /// `dequeue(stream) -> buffer | nothing`, following the algorithm in
    /// §4.6 exactly: EINVAL if a buffer is already out, then a loop that
    /// blocks on pacing/negotiation/cycle-state until a free buffer is
    /// available or the stream becomes inactive.
    #[tracing::instrument(name = "stream_dequeue", skip(self))]
    pub fn dequeue(&self) -> Result<Option<BufferHandle>> {
        let guard = self.context.thread_loop().lock();
        let mut inner = self.inner.lock();

        if inner.pacing.buffers_dequeued > 0 {
            return Err(Error::invalid("dequeue called while a buffer is already out"));
        }

        let id = loop {
            if inner.context.is_dead() {
                return Err(Error::io("context is dead"));
            }
            if !inner.pacing.active {
                return Err(Error::Shutdown("stream is not active".into()));
            }
            if inner.pacing.skip_frames > 0 {
                inner.pacing.skip_frames -= 1;
                return Ok(None);
            }
            if inner.transport_state != PwStreamState::Streaming {
                if inner.config.pacing_mode == PacingMode::Async {
                    return Ok(None);
                }
                inner.unblock_process(&guard);
                guard.wait();
                continue;
            }
            if inner.config.pacing_mode == PacingMode::SingleBuffered
                && (inner.pacing.pending_buffer.is_some() || inner.pacing.skip_buffer)
            {
                inner.unblock_process(&guard);
                guard.wait();
                continue;
            }
            if inner.config.pacing_mode == PacingMode::Synchronous && inner.pacing.cycle_state != CycleState::Active {
                inner.pacing.cycle_state = CycleState::Waiting;
                guard.wait();
                continue;
            }

            let attempts = inner.pool.len().max(1);
            let mut dequeued = None;
            for _ in 0..attempts {
                if let Some(id) = raw_buffers::dequeue(&self.pw_stream) {
                    dequeued = Some(id);
                    break;
                }
            }
            match dequeued {
                Some(id) => break id,
                None => {
                    if inner.config.pacing_mode == PacingMode::Async {
                        return Ok(None);
                    }
                    guard.wait();
                    continue;
                }
            }
        };

        inner.pacing.buffers_dequeued = 1;
        if let Some(buffer) = inner.pool.get_mut(id) {
            buffer.dequeued = true;
            buffer.reset_per_dequeue_flags();
        }
        Ok(Some(BufferHandle(id)))
    }

    /// `enqueue(stream, buffer)`.
    #[tracing::instrument(name = "stream_enqueue", skip(self))]
    pub fn enqueue(&self, handle: BufferHandle) -> Result<()> {
        self.submit(handle, true)
    }

    /// `return(stream, buffer)` — equivalent to `enqueue` with a buffer
    /// that carries no new frame (`skip_buffer` is set for the next
    /// process tick instead of `pending_buffer`).
    #[tracing::instrument(name = "stream_return", skip(self))]
    pub fn return_buffer(&self, handle: BufferHandle) -> Result<()> {
        self.submit(handle, false)
    }

    fn submit(&self, handle: BufferHandle, valid: bool) -> Result<()> {
        let id = handle.0;

        {
            let inner = self.inner.lock();
            let buffer = inner.pool.get(id).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
            if buffer.frontend_sync && (!buffer.acquire.queried || !buffer.release.queried) {
                return Err(Error::invalid("frontend_sync buffer enqueued without both sync points queried"));
            }
        }

        {
            let mut inner = self.inner.lock();
            if let Some(buffer) = inner.pool.get(id) {
                if !buffer.is_orphaned() {
                    let _ = inner.backend.enqueue_buffer(&buffer.allocation);
                }
            }

            if let Some(bridge) = inner.backend.sync_bridge().cloned() {
                if let Some(buffer) = inner.pool.get_mut(id) {
                    if buffer.frontend_sync && !buffer.backend_sync && !buffer.release_sync_file_set {
                        if let Ok(fd) = buffer.dup_plane0_fd() {
                            use std::os::fd::AsFd;
                            let _ = bridge.release_into_implicit(&mut buffer.release, fd.as_fd());
                            buffer.release_sync_file_set = true;
                        }
                    }
                }
            }
        }

        let guard = self.context.thread_loop().lock();
        let mut inner = self.inner.lock();
        inner.pacing.buffers_dequeued = 0;
        if let Some(buffer) = inner.pool.get_mut(id) {
            buffer.dequeued = false;
        }

        loop {
            let orphaned = inner.pool.get(id).map(Buffer::is_orphaned).unwrap_or(true);
            if orphaned {
                if let Some(buffer) = inner.pool.take(id) {
                    let backend = &*inner.backend;
                    BufferPool::free(buffer, backend, |_| {});
                }
                return Err(Error::Stale("buffer was orphaned by a renegotiation".into()));
            }
            if inner.context.is_dead() {
                requeue(&self.pw_stream, id);
                return Err(Error::io("context is dead"));
            }
            if !inner.pacing.active {
                requeue(&self.pw_stream, id);
                return Err(Error::Shutdown("stream is not active".into()));
            }
            if inner.transport_state != PwStreamState::Streaming {
                requeue(&self.pw_stream, id);
                return Err(Error::WouldBlock("stream is not currently streaming".into()));
            }

            if inner.config.pacing_mode == PacingMode::Async {
                if let Some(previous) = inner.pacing.pending_buffer.take() {
                    requeue(&self.pw_stream, previous);
                }
                break;
            } else if inner.pacing.pending_buffer.is_some() || inner.pacing.skip_buffer {
                inner.unblock_process(&guard);
                guard.wait();
                continue;
            } else {
                break;
            }
        }

        if inner.config.pacing_mode == PacingMode::Synchronous && inner.pacing.cycle_state != CycleState::Active {
            return Err(Error::Stale("SYNCHRONOUS cycle was aborted before enqueue completed".into()));
        }

        if valid {
            inner.pacing.pending_buffer = Some(id);
        } else {
            inner.pacing.skip_buffer = true;
        }
        inner.unblock_process(&guard);
        if inner.config.pacing_mode == PacingMode::Async {
            inner.process(&self.pw_stream, &guard);
        }
        Ok(())
    }

    /// `skip_frame(stream)` — increments `skip_frames` and wakes any
    /// blocked `dequeue` so it returns no-buffer.
    pub fn skip_frame(&self) {
        let guard = self.context.thread_loop().lock();
        self.inner.lock().pacing.skip_frames += 1;
        guard.signal(false);
    }

    // -----------------------------------------------------------------
    // Public accessors (§4.8)
    // -----------------------------------------------------------------

    /// Returns the *configured* size, not the allocation's (possibly
    /// row-aligned, wider) size.
    pub fn get_size(&self) -> (u32, u32) {
        let inner = self.inner.lock();
        (inner.cur_config.width, inner.cur_config.height)
    }

    pub fn has_sync(&self, handle: BufferHandle) -> bool {
        self.inner.lock().pool.get(handle.0).map(|b| b.frontend_sync).unwrap_or(false)
    }

    pub fn is_efficient_for_rendering(&self, handle: BufferHandle) -> bool {
        let inner = self.inner.lock();
        let Some(buffer) = inner.pool.get(handle.0) else { return false };
        !(inner.cur_config.has_nonlinear_tiling() && buffer.allocation.modifier == smithay::reexports::gbm::Modifier::Linear)
    }

    /// Returns the `gbm_bo*` backing `handle`, valid only while it is
    /// dequeued.
    pub fn get_gbm_bo(&self, handle: BufferHandle) -> Result<*mut core::ffi::c_void> {
        let inner = self.inner.lock();
        let buffer = inner.pool.get(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        buffer
            .allocation
            .gbm_bo
            .as_ref()
            .map(crate::allocator::gbm::GbmBo::as_raw)
            .ok_or_else(|| Error::not_supported("buffer has no GBM buffer object"))
    }

    /// Returns the `EGLImage` backing `handle`, valid only while it is
    /// dequeued.
    #[cfg(feature = "egl")]
    pub fn get_egl_image(&self, handle: BufferHandle) -> Result<*const core::ffi::c_void> {
        let inner = self.inner.lock();
        let buffer = inner.pool.get(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        match &buffer.allocation.backend_handle {
            Some(crate::allocator::BackendHandle::Egl(image)) => Ok(image.as_raw()),
            _ => Err(Error::not_supported("buffer has no EGLImage")),
        }
    }

    /// Returns the `VkImage` backing `handle`, valid only while it is
    /// dequeued.
    #[cfg(feature = "vulkan")]
    pub fn get_vk_image(&self, handle: BufferHandle) -> Result<ash::vk::Image> {
        let inner = self.inner.lock();
        let buffer = inner.pool.get(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        match &buffer.allocation.backend_handle {
            Some(crate::allocator::BackendHandle::Vulkan(vk_image)) => Ok(vk_image.image),
            _ => Err(Error::not_supported("buffer has no VkImage")),
        }
    }

    /// Returns `(acquire, release)` semaphores as raw handles. May be
    /// called once per dequeue; a second call before the next dequeue
    /// fails `Busy`. Waits for the previous use's fence before returning.
    #[cfg(feature = "vulkan")]
    pub fn get_vk_semaphores(&self, handle: BufferHandle) -> Result<(u64, u64)> {
        let mut inner = self.inner.lock();
        let Inner { backend, pool, .. } = &mut *inner;
        let buffer = pool.get_mut(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        backend.vk_semaphores(&mut buffer.allocation)
    }

    /// Returns the fence the producer's command batch must signal. May be
    /// called once per dequeue; see [`Stream::get_vk_semaphores`].
    #[cfg(feature = "vulkan")]
    pub fn get_vk_fence(&self, handle: BufferHandle) -> Result<u64> {
        let mut inner = self.inner.lock();
        let Inner { backend, pool, .. } = &mut *inner;
        let buffer = pool.get_mut(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        backend.vk_fence(&mut buffer.allocation)
    }

    /// Returns `(handle, point)` for a style-(B) (sync-object) producer's
    /// acquire wait. `EINVAL` if the buffer carries no sync (not
    /// `frontend_sync`), or if a style-(A) accessor already serviced the
    /// acquire direction this dequeue.
    pub fn get_acquire_sync_object(&self, handle: BufferHandle) -> Result<(u32, u64)> {
        let mut inner = self.inner.lock();
        let Inner { backend, pool, .. } = &mut *inner;
        let buffer = pool.get_mut(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        if !buffer.frontend_sync {
            return Err(Error::invalid("buffer does not require sync"));
        }
        if buffer.acquire.queried {
            return Err(Error::invalid("acquire direction already serviced this dequeue"));
        }
        if let Some(bridge) = backend.sync_bridge() {
            let fd = buffer.dup_plane0_fd()?;
            use std::os::fd::AsFd;
            bridge.acquire_from_implicit(&mut buffer.acquire, fd.as_fd())?;
        }
        Ok((buffer.acquire.handle, buffer.acquire.point))
    }

    /// Returns `(handle, point)` for a style-(B) producer's release
    /// signal. `EINVAL` under the same conditions as
    /// [`Stream::get_acquire_sync_object`], plus when a release sync-file
    /// was already supplied via [`Stream::set_release_sync_file`].
    pub fn get_release_sync_object(&self, handle: BufferHandle) -> Result<(u32, u64)> {
        let mut inner = self.inner.lock();
        let Inner { pool, .. } = &mut *inner;
        let buffer = pool.get_mut(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        if !buffer.frontend_sync {
            return Err(Error::invalid("buffer does not require sync"));
        }
        if buffer.release.queried || buffer.release_sync_file_set {
            return Err(Error::invalid("release direction already serviced this dequeue"));
        }
        buffer.release.queried = true;
        Ok((buffer.release.handle, buffer.release.point))
    }

    /// Returns an fd for a style-(A) (sync-file) producer's acquire wait.
    /// `EINVAL` if the sync-object accessors already serviced the acquire
    /// direction this dequeue.
    pub fn get_acquire_sync_file(&self, handle: BufferHandle) -> Result<std::os::fd::OwnedFd> {
        let mut inner = self.inner.lock();
        let Inner { backend, pool, .. } = &mut *inner;
        let buffer = pool.get_mut(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        if buffer.acquire.queried {
            return Err(Error::invalid("acquire direction already serviced this dequeue"));
        }
        let bridge = backend.sync_bridge().ok_or_else(|| Error::not_supported("backend has no sync bridge"))?;
        let fd = buffer.dup_plane0_fd()?;
        use std::os::fd::AsFd;
        let sync_file = bridge.export_acquire_sync_file(fd.as_fd())?;
        buffer.acquire.queried = true;
        Ok(sync_file)
    }

    /// Hands `fd` to a style-(A) producer's release signal. `EINVAL` if
    /// the sync-object accessors already serviced the release direction
    /// this dequeue.
    pub fn set_release_sync_file(&self, handle: BufferHandle, fd: std::os::fd::OwnedFd) -> Result<()> {
        let mut inner = self.inner.lock();
        let Inner { backend, pool, .. } = &mut *inner;
        let buffer = pool.get_mut(handle.0).ok_or_else(|| Error::invalid("buffer does not belong to this stream"))?;
        if buffer.release.queried {
            return Err(Error::invalid("release direction already serviced this dequeue"));
        }
        let bridge = backend.sync_bridge().ok_or_else(|| Error::not_supported("backend has no sync bridge"))?;
        let plane_fd = buffer.dup_plane0_fd()?;
        use std::os::fd::AsFd;
        bridge.import_release_sync_file(plane_fd.as_fd(), fd.as_fd())?;
        buffer.release_sync_file_set = true;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let _ = self.stop();
        self.inner.lock().backend.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_state_default_is_inactive() {
        let pacing = PacingState::default();
        assert_eq!(pacing.cycle_state, CycleState::Inactive);
        assert_eq!(pacing.buffers_dequeued, 0);
        assert!(!pacing.skip_buffer);
    }
}
