//! Format and modifier negotiation.
//!
//! The consumer (daemon) drives negotiation: it picks one of the offered
//! `(fourcc, modifier-list)` entries and echoes it back through a
//! `param_changed(Format)` event carrying a `DONT_FIXATE` modifier
//! choice. This module turns that event into a probe allocation, and the
//! probe's result into a re-published, fixated format plus the
//! `Buffers`/`Meta` documents.

use libspa::param::format::{FormatProperties, MediaSubtype, MediaType};
use libspa::param::video::VideoFormat as WireFormat;
use libspa::pod::Pod;
use smithay::reexports::gbm::Modifier;

use crate::allocator::AllocatorBackend;
use crate::format::{self, FormatRegistry};
use crate::error::{Error, Result};

/// The stream's current negotiated state, valid once `ready` is set.
#[derive(Debug, Clone, Default)]
pub struct NegotiatedState {
    pub ready: bool,
    pub fourcc: Option<smithay::reexports::drm::buffer::DrmFourcc>,
    pub modifier: Modifier,
    pub plane_count: usize,
    pub stride: [u32; 4],
    pub offset: [u32; 4],
    pub width: u32,
    pub height: u32,
}

/// The result of successfully reacting to one `param_changed` event:
/// either the negotiation isn't finished yet (a probe allocation ran and
/// we must re-publish the fixated format), or it had already settled for
/// this fourcc/size and we can go straight to publishing `Buffers`/`Meta`.
pub enum NegotiationOutcome {
    Fixated { modifier: Modifier, plane_count: usize },
    AlreadyNegotiated,
}

/// Parses a raw-video format pod from `param_changed`, validating media
/// type/subtype and translating the wire format id to a DRM fourcc.
/// Returns `None` for events this stream should ignore (wrong param id,
/// non-video format) rather than erroring — those are routine on a
/// PipeWire node with several param types.
pub fn parse_offered_format(pod: &Pod) -> Result<Option<(smithay::reexports::drm::buffer::DrmFourcc, u32, u32)>> {
    let object = pod.as_object().map_err(|e| Error::invalid(format!("param_changed pod is not an object: {e}")))?;

    let media_type = read_id_prop(object, FormatProperties::MediaType.as_raw())?;
    let media_subtype = read_id_prop(object, FormatProperties::MediaSubtype.as_raw())?;
    if media_type != MediaType::Video.as_raw() || media_subtype != MediaSubtype::Raw.as_raw() {
        return Ok(None);
    }

    let wire_id = read_id_prop(object, FormatProperties::VideoFormat.as_raw())?;
    let wire_format = WireFormat::from_raw(wire_id);
    let fourcc = format::wire_to_fourcc(wire_format)?;

    let (width, height) = read_size_prop(object)?;
    Ok(Some((fourcc, width, height)))
}

fn read_id_prop(object: &libspa::pod::Object, key: u32) -> Result<u32> {
    object
        .find_prop(libspa::utils::Id(key))
        .and_then(|p| p.value().get_id().ok())
        .map(|id| id.0)
        .ok_or_else(|| Error::invalid(format!("missing property {key} in format pod")))
}

fn read_size_prop(object: &libspa::pod::Object) -> Result<(u32, u32)> {
    let prop = object
        .find_prop(libspa::utils::Id(FormatProperties::VideoSize.as_raw()))
        .ok_or_else(|| Error::invalid("missing VideoSize property"))?;
    let rect: libspa::utils::Rectangle = prop
        .value()
        .get_rectangle()
        .map_err(|e| Error::invalid(format!("VideoSize is not a rectangle: {e}")))?;
    Ok((rect.width, rect.height))
}

/// Reads the modifier choice from the format pod, deduplicating and
/// dropping `Modifier::Invalid` whenever more than one alternative was
/// offered (the consumer signalling "implicit sync is fine, don't
/// negotiate a specific tiling").
pub fn read_modifier_choice(pod: &Pod) -> Result<Vec<Modifier>> {
    let object = pod.as_object().map_err(|e| Error::invalid(format!("format pod is not an object: {e}")))?;
    let prop = object
        .find_prop(libspa::utils::Id(FormatProperties::VideoModifier.as_raw()))
        .ok_or_else(|| Error::invalid("modifier property missing from format pod"))?;

    let (_, choice) = libspa::pod::deserialize::PodDeserializer::deserialize_from::<libspa::utils::Choice<i64>>(prop.value().as_bytes())
        .map_err(|e| Error::invalid(format!("modifier property is not a Choice: {e:?}")))?;

    let libspa::utils::ChoiceEnum::Enum { default, alternatives } = choice.1 else {
        return Err(Error::invalid("modifier choice is not an enum"));
    };

    let mut modifiers: Vec<Modifier> = std::iter::once(default)
        .chain(alternatives)
        .map(|m| Modifier::from(m as u64))
        .collect();
    modifiers.dedup();

    if modifiers.len() > 1 {
        modifiers.retain(|m| *m != Modifier::Invalid);
    }
    if modifiers.is_empty() {
        return Err(Error::NotPresent("no usable modifier left after filtering Invalid".into()));
    }
    Ok(modifiers)
}

/// Runs one negotiation step for a chosen `(fourcc, width, height,
/// modifier candidates)`. If `current` already matches this fourcc/size,
/// negotiation is considered already settled (step 5 of the negotiation
/// algorithm) and no probe allocation runs. Otherwise a probe buffer is
/// allocated to discover the concrete modifier and plane layout, then
/// immediately destroyed.
pub fn negotiate(
    current: &mut NegotiatedState,
    backend: &dyn AllocatorBackend,
    fourcc: smithay::reexports::drm::buffer::DrmFourcc,
    width: u32,
    height: u32,
    candidate_modifiers: &[Modifier],
) -> Result<NegotiationOutcome> {
    if current.ready && current.fourcc == Some(fourcc) && current.width == width && current.height == height {
        return Ok(NegotiationOutcome::AlreadyNegotiated);
    }

    current.ready = false;

    let mut probe = backend
        .alloc_buffer(width, height, fourcc, candidate_modifiers)
        .map_err(|e| Error::NotPresent(format!("probe allocation failed: {e}")))?;

    current.fourcc = Some(fourcc);
    current.modifier = probe.modifier;
    current.plane_count = probe.plane_count;
    current.stride = probe.stride;
    current.offset = probe.offset;
    current.width = width;
    current.height = height;

    backend.free_buffer(&mut probe);

    Ok(NegotiationOutcome::Fixated { modifier: probe.modifier, plane_count: probe.plane_count })
}

/// Validates that `formats` has at least one entry whose fourcc is
/// reachable from the negotiated state, used before publishing the
/// initial `EnumFormat` parameter set on connect.
pub fn initial_offer_is_valid(formats: &FormatRegistry) -> Result<()> {
    if formats.is_empty() {
        return Err(Error::invalid("no formats configured before connect"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_negotiated_skips_reprobe() {
        let mut state = NegotiatedState {
            ready: true,
            fourcc: Some(smithay::reexports::drm::buffer::DrmFourcc::Argb8888),
            width: 1920,
            height: 1080,
            ..Default::default()
        };
        // A backend would be needed to actually reach the probe branch;
        // this only exercises the already-negotiated short-circuit, which
        // never touches the backend argument.
        struct Unreachable;
        impl AllocatorBackend for Unreachable {
            fn tag(&self) -> crate::allocator::BackendTag {
                unreachable!()
            }
            fn alloc_buffer(
                &self,
                _: u32,
                _: u32,
                _: smithay::reexports::drm::buffer::DrmFourcc,
                _: &[Modifier],
            ) -> Result<crate::allocator::AllocatedBuffer> {
                unreachable!("probe must not run when already negotiated")
            }
            fn free_buffer(&self, _: &mut crate::allocator::AllocatedBuffer) {
                unreachable!()
            }
        }

        let outcome = negotiate(
            &mut state,
            &Unreachable,
            smithay::reexports::drm::buffer::DrmFourcc::Argb8888,
            1920,
            1080,
            &[Modifier::Linear],
        )
        .unwrap();
        assert!(matches!(outcome, NegotiationOutcome::AlreadyNegotiated));
    }
}
