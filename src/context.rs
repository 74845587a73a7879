//! Transport glue: the loop thread, the daemon connection, and the error
//! latch every stream checks before trusting its own state.
//!
//! PipeWire's types are `!Send`; the whole transport must live on one
//! dedicated OS thread. We use `pipewire::thread_loop::ThreadLoop` for
//! that thread rather than integrating with the caller's own event loop,
//! since the public API here is blocking (`dequeue`/`enqueue`), not
//! `async` — there is no caller loop to integrate with.
//!
//! That dedicated thread is a real second OS thread, though: the loop
//! callbacks (`add_buffer`, `process`, ...) run on it, while producer
//! code calls in from whatever thread owns the `Stream`. Every call on
//! either side that touches `ThreadLoop`, `PwContext` or `Core` goes
//! through `ThreadLoop::lock()` first, which takes libpipewire's own
//! mutex around the loop's internal state — see the `unsafe impl
//! Send`/`Sync` below for why that makes sharing a `Context` across the
//! two threads sound.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pipewire::context::Context as PwContext;
use pipewire::core::Core;
use pipewire::thread_loop::ThreadLoop;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};

/// Process-wide-ish handle to the transport daemon. Created on [`Context::connect`],
/// destroyed on drop (which stops the loop and tears down the connection).
/// Multiple contexts are independent; each owns its own loop thread.
pub struct Context {
    thread_loop: ThreadLoop,
    _pw_context: PwContext,
    core: Core,
    /// Sticky error latch. Set from the core's error listener, running on
    /// the loop thread; read from the producer thread under the loop lock.
    dead: Arc<AtomicBool>,
}

impl Context {
    /// Connects to the transport daemon, starting a dedicated loop thread.
    /// Fails with `ConnectionRefused` if the daemon is unreachable.
    #[tracing::instrument(name = "pw_context_connect", skip_all)]
    pub fn connect() -> Result<Self> {
        pipewire::init();

        let thread_loop = ThreadLoop::new(Some("lamco-pw-stream"), None)
            .map_err(|e| Error::io(format!("create thread loop: {e}")))?;

        let guard = thread_loop.lock();
        let pw_context = PwContext::new(&thread_loop).map_err(|e| Error::io(format!("create context: {e}")))?;
        let core = pw_context
            .connect(None)
            .map_err(|e| Error::ConnectionRefused(format!("connect to transport daemon: {e}")))?;

        let dead = Arc::new(AtomicBool::new(false));
        let dead_for_listener = dead.clone();
        let listener = core
            .add_listener_local()
            .error(move |id, seq, res, message| {
                error!(id, seq, res, message, "transport core reported a fatal error");
                dead_for_listener.store(true, Ordering::SeqCst);
            })
            .register();
        std::mem::forget(listener);

        thread_loop.start();
        drop(guard);

        debug!("transport context connected");
        Ok(Self { thread_loop, _pw_context: pw_context, core, dead })
    }

    pub fn core(&self) -> &Core {
        &self.core
    }

    pub fn thread_loop(&self) -> &ThreadLoop {
        &self.thread_loop
    }

    /// True once the error latch has been set by a fatal core error.
    /// Permanent for the lifetime of this context.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub(crate) fn dead_flag(&self) -> Arc<AtomicBool> {
        self.dead.clone()
    }

    /// Fails with `Io` if the error latch is set; otherwise a no-op. Every
    /// producer-facing API call starts with this check.
    pub fn check_alive(&self) -> Result<()> {
        if self.is_dead() {
            return Err(Error::io("transport context is dead"));
        }
        Ok(())
    }
}

// SAFETY: `ThreadLoop`, `PwContext` and `Core` are not `Send`/`Sync`
// because libpipewire's objects are ordinarily only ever touched from the
// thread running their loop. Every method on `Context` that reaches into
// them does so only after calling `ThreadLoop::lock()`, which blocks until
// the loop thread is idle and holds libpipewire's own mutex for the
// duration — the same coarse-locking contract `allocator::egl::EglImage`
// relies on for its own manual Send/Sync impl. No field is ever read or
// written from a second thread without that lock held, so sharing a
// `Context` behind an `Arc` across the producer and loop threads is sound.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Drop for Context {
    fn drop(&mut self) {
        self.thread_loop.stop();
        // SAFETY: this is the last live reference to the transport's
        // process-wide state for this context; `pipewire::init()` and
        // `deinit()` are reference-counted scoped-acquisition calls, not a
        // true singleton teardown.
        unsafe { pipewire::deinit() };
        if self.is_dead() {
            warn!("dropping a context whose error latch was already set");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dead_flag_starts_false() {
        let dead = Arc::new(AtomicBool::new(false));
        assert!(!dead.load(Ordering::SeqCst));
    }
}
