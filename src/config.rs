//! Stream configuration.
//!
//! Provides configuration options for a published video stream, with a
//! builder for ergonomic construction.
//!
//! # Examples
//!
//! ```rust
//! use lamco_pw_stream::{StreamConfig, PacingMode, SyncMode};
//!
//! let config = StreamConfig::builder()
//!     .pacing_mode(PacingMode::Async)
//!     .sync_mode(SyncMode::Implicit)
//!     .size(1920, 1080)
//!     .build();
//! ```

use crate::format::FormatRegistry;

/// Frame pacing mode. Selects the producer/consumer handshake and the
/// default buffer-count triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacingMode {
    /// Triple-buffered; `enqueue` never blocks, newest buffer wins.
    #[default]
    Async,
    /// `enqueue` blocks until the previous pending buffer has been
    /// consumed by a process tick; `dequeue` never blocks on pacing.
    DoubleBuffered,
    /// `dequeue` blocks while a pending or skip buffer exists.
    SingleBuffered,
    /// Full three-way rendezvous: `dequeue` blocks until the loop thread
    /// admits the producer, `enqueue` hands control back to the loop.
    Synchronous,
}

/// Fence mechanism negotiated with the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Fences are attached to the DMA-BUF and honoured by the kernel.
    #[default]
    Implicit,
    /// Explicit sync points are negotiated but the implicit fence is also
    /// kept updated, so implicit-sync consumers still observe them.
    ExplicitHybrid,
    /// Explicit sync only; the implicit fence is never advertised.
    ExplicitOnly,
    /// Prefer explicit sync if the backend supports it, otherwise fall
    /// back to implicit silently.
    Either,
}

/// A `{default, min, max}` triple, used for both buffer counts and frame
/// rates (as a fraction numerator/denominator pair, see [`RateTriple`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferCountTriple {
    pub default: u32,
    pub min: u32,
    pub max: u32,
}

impl BufferCountTriple {
    /// `{5,4,8}` for ASYNC/DOUBLE_BUFFERED, `{4,3,8}` for
    /// SINGLE_BUFFERED/SYNCHRONOUS, matching the pacing-mode derivation
    /// rule in the stream configuration's data model.
    pub fn for_pacing_mode(mode: PacingMode) -> Self {
        match mode {
            PacingMode::Async | PacingMode::DoubleBuffered => Self { default: 5, min: 4, max: 8 },
            PacingMode::SingleBuffered | PacingMode::Synchronous => Self { default: 4, min: 3, max: 8 },
        }
    }
}

/// A rate fraction, `{0,1}` meaning variable/unnegotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fraction {
    pub num: u32,
    pub denom: u32,
}

impl Fraction {
    pub const VARIABLE: Self = Self { num: 0, denom: 1 };
}

/// `{default, min, max}` frame-rate triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateTriple {
    pub default: Fraction,
    pub min: Fraction,
    pub max: Fraction,
}

impl Default for RateTriple {
    fn default() -> Self {
        Self { default: Fraction::VARIABLE, min: Fraction::VARIABLE, max: Fraction::VARIABLE }
    }
}

/// Vulkan-specific configuration, only consulted when the stream is
/// initialised with the Vulkan allocator backend.
#[cfg(feature = "vulkan")]
#[derive(Debug, Clone, Copy, Default)]
pub struct VulkanConfig {
    pub image_usage: u32,
    pub required_features: u64,
}

/// A stream's configuration snapshot. Two live inside a `Stream`: the
/// pending configuration being built up by setters, and the current one
/// that was active at the last successful `configure`.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub pacing_mode: PacingMode,
    pub sync_mode: SyncMode,
    pub buffer_count: BufferCountTriple,
    pub rate: RateTriple,
    pub width: u32,
    pub height: u32,
    pub formats: FormatRegistry,
    #[cfg(feature = "vulkan")]
    pub vulkan: VulkanConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        let pacing_mode = PacingMode::default();
        Self {
            pacing_mode,
            sync_mode: SyncMode::default(),
            buffer_count: BufferCountTriple::for_pacing_mode(pacing_mode),
            rate: RateTriple::default(),
            width: 1920,
            height: 1080,
            formats: FormatRegistry::new(),
            #[cfg(feature = "vulkan")]
            vulkan: VulkanConfig::default(),
        }
    }
}

impl StreamConfig {
    /// Creates a new configuration builder.
    #[must_use]
    pub fn builder() -> StreamConfigBuilder {
        StreamConfigBuilder::default()
    }

    /// True if any configured format has a non-`LINEAR` modifier.
    pub fn has_nonlinear_tiling(&self) -> bool {
        self.formats.has_nonlinear_tiling()
    }

    /// Validates the configuration and returns any issues. An empty
    /// result means the configuration is acceptable to `configure`.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.width == 0 || self.height == 0 {
            issues.push("width and height must both be positive".to_string());
        }

        if self.rate.default.denom == 0 || self.rate.min.denom == 0 || self.rate.max.denom == 0 {
            issues.push("rate fraction denominator must not be zero".to_string());
        }

        if self.formats.is_empty() {
            issues.push("at least one format must be configured before start".to_string());
        }

        if self.buffer_count.min > self.buffer_count.max {
            issues.push("buffer_count.min must not exceed buffer_count.max".to_string());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(issues)
        }
    }
}

/// Fluent builder for [`StreamConfig`].
#[derive(Debug, Clone, Default)]
pub struct StreamConfigBuilder {
    config: StreamConfigInner,
}

#[derive(Debug, Clone)]
struct StreamConfigInner {
    pacing_mode: PacingMode,
    sync_mode: SyncMode,
    rate: RateTriple,
    width: u32,
    height: u32,
    #[cfg(feature = "vulkan")]
    vulkan: VulkanConfig,
}

impl Default for StreamConfigInner {
    fn default() -> Self {
        let defaults = StreamConfig::default();
        Self {
            pacing_mode: defaults.pacing_mode,
            sync_mode: defaults.sync_mode,
            rate: defaults.rate,
            width: defaults.width,
            height: defaults.height,
            #[cfg(feature = "vulkan")]
            vulkan: defaults.vulkan,
        }
    }
}

impl StreamConfigBuilder {
    #[must_use]
    pub fn pacing_mode(mut self, mode: PacingMode) -> Self {
        self.config.pacing_mode = mode;
        self
    }

    #[must_use]
    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.config.sync_mode = mode;
        self
    }

    #[must_use]
    pub fn rate(mut self, rate: RateTriple) -> Self {
        self.config.rate = rate;
        self
    }

    #[must_use]
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.config.width = width;
        self.config.height = height;
        self
    }

    #[cfg(feature = "vulkan")]
    #[must_use]
    pub fn vulkan(mut self, vulkan: VulkanConfig) -> Self {
        self.config.vulkan = vulkan;
        self
    }

    #[must_use]
    pub fn build(self) -> StreamConfig {
        StreamConfig {
            pacing_mode: self.config.pacing_mode,
            sync_mode: self.config.sync_mode,
            buffer_count: BufferCountTriple::for_pacing_mode(self.config.pacing_mode),
            rate: self.config.rate,
            width: self.config.width,
            height: self.config.height,
            formats: FormatRegistry::new(),
            #[cfg(feature = "vulkan")]
            vulkan: self.config.vulkan,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid_once_formats_added() {
        let mut config = StreamConfig::default();
        assert!(config.validate().is_err());
        config
            .formats
            .add_format(smithay::reexports::drm::buffer::DrmFourcc::Argb8888, vec![smithay::reexports::gbm::Modifier::Linear])
            .unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn buffer_count_triple_follows_pacing_mode() {
        assert_eq!(BufferCountTriple::for_pacing_mode(PacingMode::Async), BufferCountTriple { default: 5, min: 4, max: 8 });
        assert_eq!(
            BufferCountTriple::for_pacing_mode(PacingMode::Synchronous),
            BufferCountTriple { default: 4, min: 3, max: 8 }
        );
    }

    #[test]
    fn builder_round_trips_pacing_and_size() {
        let config = StreamConfig::builder().pacing_mode(PacingMode::Synchronous).size(640, 480).build();
        assert_eq!(config.pacing_mode, PacingMode::Synchronous);
        assert_eq!((config.width, config.height), (640, 480));
        assert_eq!(config.buffer_count, BufferCountTriple { default: 4, min: 3, max: 8 });
    }

    #[test]
    fn zero_size_fails_validation() {
        let issues = StreamConfig::builder().size(0, 480).build().validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("width")));
    }
}
