//! # lamco-pw-stream
//!
//! Publishes DMA-BUF video frames onto a PipeWire stream for a consumer
//! (a compositor, a remote-desktop daemon, a recorder) to pull from —
//! the producer side of the wire, as opposed to the capture-side clients
//! most PipeWire crates target.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lamco_pw_stream::{Context, Stream, StreamConfig, PacingMode};
//! use lamco_pw_stream::allocator::gbm::GbmAllocator;
//!
//! # fn example() -> lamco_pw_stream::Result<()> {
//! let context = Arc::new(Context::connect()?);
//! let backend = Box::new(GbmAllocator::open("/dev/dri/renderD128")?);
//! let mut stream = Stream::new(context, "my-output", backend)?;
//!
//! stream.set_size(1920, 1080)?;
//! stream.set_mode(PacingMode::Async);
//! stream.configure()?;
//! stream.start()?;
//!
//! if let Some(handle) = stream.dequeue()? {
//!     // render into the buffer behind `handle`, then:
//!     stream.enqueue(handle)?;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Architecture
//!
//! PipeWire's Rust bindings use `Rc<>` and raw pointers internally,
//! making them `!Send`. This crate keeps the whole transport — the
//! thread loop, the context, the stream listener — on one dedicated OS
//! thread (`pipewire::thread_loop::ThreadLoop`), and exposes a blocking,
//! condvar-paced `dequeue`/`enqueue` surface to the producer's own
//! thread instead of requiring the caller to integrate with PipeWire's
//! event loop directly:
//!
//! ```text
//! ┌───────────────────────────────┐      ┌───────────────────────────────┐
//! │      Producer thread          │      │   PipeWire loop thread        │
//! │  (yours — a renderer, a       │      │   (ThreadLoop, owned by       │
//! │   compositor's output loop)   │      │    Context)                   │
//! │                                │      │                                │
//! │  Stream::dequeue()  ─────────►│◄────►│  add_buffer / remove_buffer   │
//! │  Stream::enqueue()             │ lock │  param_changed / process      │
//! │  Stream::return_buffer()       │ wait │  state_changed                │
//! │                                │signal│                                │
//! └───────────────────────────────┘      └───────────────────────────────┘
//! ```
//!
//! Format and modifier negotiation ([`negotiation`]), buffer allocation
//! ([`allocator`]), and explicit/implicit sync bridging ([`sync`]) are
//! each a separate module so a new allocator backend only has to
//! implement [`allocator::AllocatorBackend`] — it does not need to know
//! about pacing or negotiation at all.
//!
//! # Cargo Features
//!
//! | Feature  | Default | Description                                   |
//! |----------|---------|------------------------------------------------|
//! | `gbm`    | Yes     | Raw GBM allocator backend                       |
//! | `egl`    | Yes     | EGL render-node backend (implies `gbm`)         |
//! | `vulkan` | No      | Vulkan external-memory backend (implies `gbm`)  |
//! | `full`   | No      | All backends enabled                            |

pub mod allocator;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod format;
pub mod negotiation;
pub mod stream;
pub mod sync;
pub mod wire;

pub use allocator::{AllocatedBuffer, AllocatorBackend, BackendHandle, BackendTag};
pub use config::{
    BufferCountTriple, Fraction, PacingMode, RateTriple, StreamConfig, StreamConfigBuilder, SyncMode,
};
#[cfg(feature = "vulkan")]
pub use config::VulkanConfig;
pub use context::Context;
pub use error::{classify_error, Error, ErrorClass, ErrorContext, Result, RetryConfig};
pub use format::{FormatEntry, FormatRegistry};
pub use stream::{BufferHandle, CycleState, Stream};
pub use sync::{SyncBridge, SyncPoint};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!VERSION.is_empty());
    }
}
