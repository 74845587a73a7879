//! Pixel format table and per-stream format registry.
//!
//! Only 8-bit-per-channel RGB/RGBA variants are supported, matching the
//! fixed translation table the wire protocol understands. `modifier`
//! values follow the DRM tiling-modifier convention (`DRM_FORMAT_MOD_*`);
//! `Modifier::Linear` (value `0`) and `Modifier::Invalid` (`!0`, "producer
//! does not care, don't negotiate one") are the two values every backend
//! must accept.

use libspa::param::video::VideoFormat as WireFormat;
use smithay::reexports::gbm::Modifier;
use smithay::reexports::drm::buffer::DrmFourcc as Fourcc;

use crate::error::{Error, Result};

/// Translates a DRM fourcc to the wire `VideoFormat` enum, and back.
///
/// 8 entries: RGBA/RGBx in both byte orders, matching what the daemon's
/// raw-video pod actually encodes.
const FOURCC_TABLE: &[(Fourcc, WireFormat)] = &[
    (Fourcc::Argb8888, WireFormat::BGRA),
    (Fourcc::Abgr8888, WireFormat::RGBA),
    (Fourcc::Rgba8888, WireFormat::ABGR),
    (Fourcc::Bgra8888, WireFormat::ARGB),
    (Fourcc::Xrgb8888, WireFormat::BGRx),
    (Fourcc::Xbgr8888, WireFormat::RGBx),
    (Fourcc::Rgbx8888, WireFormat::xBGR),
    (Fourcc::Bgrx8888, WireFormat::xRGB),
];

/// Looks up the wire format id for a DRM fourcc.
pub fn fourcc_to_wire(fourcc: Fourcc) -> Result<WireFormat> {
    FOURCC_TABLE
        .iter()
        .find(|(f, _)| *f == fourcc)
        .map(|(_, w)| *w)
        .ok_or_else(|| Error::not_supported(format!("unsupported fourcc {fourcc:?}")))
}

/// Looks up the DRM fourcc for a wire format id.
pub fn wire_to_fourcc(wire: WireFormat) -> Result<Fourcc> {
    FOURCC_TABLE
        .iter()
        .find(|(_, w)| *w == wire)
        .map(|(f, _)| *f)
        .ok_or_else(|| Error::not_supported(format!("unsupported wire format {wire:?}")))
}

/// One `(fourcc, modifier-list)` entry in a stream's ordered format list.
///
/// The modifier list is never empty; [`FormatRegistry::add_format`]
/// rejects empty lists with `InvalidArgument`.
#[derive(Debug, Clone)]
pub struct FormatEntry {
    pub fourcc: Fourcc,
    pub wire_format: WireFormat,
    pub modifiers: Vec<Modifier>,
}

impl FormatEntry {
    fn new(fourcc: Fourcc, modifiers: Vec<Modifier>) -> Result<Self> {
        if modifiers.is_empty() {
            return Err(Error::invalid("add_format: modifier list must not be empty"));
        }
        let wire_format = fourcc_to_wire(fourcc)?;
        Ok(Self { fourcc, wire_format, modifiers })
    }

    /// True if any configured modifier is not `LINEAR`.
    pub fn has_nonlinear_tiling(&self) -> bool {
        self.modifiers.iter().any(|m| *m != Modifier::Linear)
    }
}

/// Ordered list of format entries a stream advertises, in preference order
/// (first entry is the producer's most-preferred format).
#[derive(Debug, Clone, Default)]
pub struct FormatRegistry {
    entries: Vec<FormatEntry>,
}

impl FormatRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `(fourcc, modifiers)` entry. Validates the fourcc against
    /// the fixed wire table and rejects an empty modifier list.
    pub fn add_format(&mut self, fourcc: Fourcc, modifiers: Vec<Modifier>) -> Result<()> {
        self.entries.push(FormatEntry::new(fourcc, modifiers)?);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[FormatEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any entry has a non-linear modifier in its list.
    pub fn has_nonlinear_tiling(&self) -> bool {
        self.entries.iter().any(FormatEntry::has_nonlinear_tiling)
    }

    pub fn find(&self, fourcc: Fourcc) -> Option<&FormatEntry> {
        self.entries.iter().find(|e| e.fourcc == fourcc)
    }
}

/// Logical EGL format names from the public configuration surface, each
/// expanding to a preference-ordered list of GBM fourccs. The first fourcc
/// the allocator accepts wins; this ordering is carried over from the
/// original probing behaviour rather than invented fresh.
pub fn egl_format_fourccs(name: EglFormat) -> &'static [Fourcc] {
    match name {
        EglFormat::Rgb888 => &[Fourcc::Xrgb8888, Fourcc::Xbgr8888, Fourcc::Rgbx8888, Fourcc::Bgrx8888],
        EglFormat::Rgba8888 => &[Fourcc::Argb8888, Fourcc::Rgba8888, Fourcc::Abgr8888, Fourcc::Bgra8888],
    }
}

/// Logical EGL pixel formats exposed on the public configuration surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EglFormat {
    Rgb888,
    Rgba8888,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_wire_round_trips() {
        for (fourcc, wire) in FOURCC_TABLE {
            assert_eq!(fourcc_to_wire(*fourcc).unwrap(), *wire);
            assert_eq!(wire_to_fourcc(*wire).unwrap(), *fourcc);
        }
    }

    #[test]
    fn add_format_rejects_empty_modifiers() {
        let mut reg = FormatRegistry::new();
        let err = reg.add_format(Fourcc::Argb8888, vec![]).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn has_nonlinear_tiling_reflects_modifiers() {
        let mut reg = FormatRegistry::new();
        reg.add_format(Fourcc::Argb8888, vec![Modifier::Linear]).unwrap();
        assert!(!reg.has_nonlinear_tiling());
        reg.add_format(Fourcc::Xrgb8888, vec![Modifier::Invalid, Modifier::Linear]).unwrap();
        assert!(reg.has_nonlinear_tiling());
    }

    #[test]
    fn egl_rgba_preference_order() {
        let list = egl_format_fourccs(EglFormat::Rgba8888);
        assert_eq!(list[0], Fourcc::Argb8888);
        assert_eq!(list.len(), 4);
    }
}
