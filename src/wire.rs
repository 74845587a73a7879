//! Wire parameter document construction.
//!
//! Builds the two pod documents the negotiation engine publishes: the
//! per-format `EnumFormat` document offered at connect time (and
//! re-offered, fixated, once a format is chosen), and the `Buffers`/`Meta`
//! document published once negotiation settles.

use std::io::Cursor;

use libspa::param::format::{FormatProperties, MediaSubtype, MediaType};
use libspa::param::ParamType;
use libspa::pod::serialize::PodSerializer;
use libspa::pod::{self, ChoiceValue, Pod, Property, PropertyFlags};
use libspa::utils::{Choice, ChoiceEnum, ChoiceFlags, Fraction as SpaFraction, Rectangle, SpaTypes};
use smithay::reexports::gbm::Modifier;

use crate::config::{Fraction, RateTriple};
use crate::format::FormatEntry;

/// Builds the `EnumFormat` document for one `(fourcc, modifier-list)`
/// entry. `DONT_FIXATE` is present whenever more than one modifier is
/// offered; dropped (leaving only `MANDATORY`) once the caller passes a
/// single-element list, which is how the negotiation engine re-publishes
/// a fixated format after a successful probe allocation.
pub fn format_params(entry: &FormatEntry, width: u32, height: u32, rate: RateTriple) -> pod::Object {
    let modifiers: Vec<i64> = entry.modifiers.iter().map(|m| u64::from(*m) as i64).collect();

    let dont_fixate = if modifiers.len() > 1 { PropertyFlags::DONT_FIXATE } else { PropertyFlags::empty() };

    pod::object!(
        SpaTypes::ObjectParamFormat,
        ParamType::EnumFormat,
        pod::property!(FormatProperties::MediaType, Id, MediaType::Video),
        pod::property!(FormatProperties::MediaSubtype, Id, MediaSubtype::Raw),
        pod::property!(FormatProperties::VideoFormat, Id, entry.wire_format),
        Property {
            key: FormatProperties::VideoModifier.as_raw(),
            flags: PropertyFlags::MANDATORY | dont_fixate,
            value: pod::Value::Choice(ChoiceValue::Long(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Enum { default: modifiers[0], alternatives: modifiers },
            ))),
        },
        pod::property!(FormatProperties::VideoSize, Rectangle, Rectangle { width, height }),
        pod::property!(
            FormatProperties::VideoFramerate,
            Choice,
            Range,
            SpaFraction,
            fraction(rate.default),
            fraction(rate.min),
            fraction(rate.max)
        ),
        pod::property!(
            FormatProperties::VideoMaxFramerate,
            Choice,
            Range,
            SpaFraction,
            fraction(rate.default),
            fraction(rate.min),
            fraction(rate.max)
        ),
    )
}

fn fraction(f: Fraction) -> SpaFraction {
    SpaFraction { num: f.num, denom: f.denom }
}

/// Publishes the modifier choice reduced to a single fixated value
/// (`entry.modifiers` must already have been narrowed to one element by
/// the negotiation engine's probe-allocation step).
pub fn fixated_format_params(entry: &FormatEntry, modifier: Modifier, width: u32, height: u32, rate: RateTriple) -> pod::Object {
    let mut fixed = entry.clone();
    fixed.modifiers = vec![modifier];
    format_params(&fixed, width, height, rate)
}

/// Builds the `Buffers` + `Meta` document published once a format is
/// fixated: buffer-count range, `DmaBuf` data type, and the plane count
/// the probe allocation discovered.
pub fn buffers_params(buffer_count: crate::config::BufferCountTriple, plane_count: usize) -> Vec<pod::Object> {
    let buffers = pod::object!(
        SpaTypes::ObjectParamBuffers,
        ParamType::Buffers,
        pod::property!(
            libspa::param::ParamBuffers::Buffers,
            Choice,
            Range,
            Int,
            buffer_count.default as i32,
            buffer_count.min as i32,
            buffer_count.max as i32
        ),
        pod::property!(libspa::param::ParamBuffers::DataType, Int, 1 << (libspa::buffer::DataType::DmaBuf as i32)),
        pod::property!(libspa::param::ParamBuffers::Blocks, Int, plane_count as i32),
    );

    let meta = pod::object!(
        SpaTypes::ObjectParamMeta,
        ParamType::Meta,
        pod::property!(libspa::param::ParamMeta::Type, Id, libspa::param::meta::Type::Header),
        pod::property!(libspa::param::ParamMeta::Size, Int, std::mem::size_of::<libspa::sys::spa_meta_header>() as i32),
    );

    vec![buffers, meta]
}

/// Serialises `object` into `scratch` and returns a borrowed `Pod` over
/// it, matching the serialize-into-caller-owned-buffer convention the
/// transport's `update_params`/`connect` calls require (the pod borrows
/// the backing `Vec` for as long as the caller needs it live).
pub fn serialize<'b>(scratch: &'b mut Vec<u8>, object: pod::Object) -> &'b Pod {
    PodSerializer::serialize(Cursor::new(&mut *scratch), &pod::Value::Object(object)).expect("serializing a well-formed pod object cannot fail");
    Pod::from_bytes(scratch).expect("just-serialized bytes are a valid pod")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatEntry;
    use smithay::reexports::drm::buffer::DrmFourcc as Fourcc;

    #[test]
    fn multi_modifier_format_sets_dont_fixate() {
        let entry = FormatEntry {
            fourcc: Fourcc::Argb8888,
            wire_format: libspa::param::video::VideoFormat::BGRA,
            modifiers: vec![Modifier::Linear, Modifier::Invalid],
        };
        let object = format_params(&entry, 1920, 1080, RateTriple::default());
        let prop = object
            .properties
            .iter()
            .find(|p| p.key == FormatProperties::VideoModifier.as_raw())
            .unwrap();
        assert!(prop.flags.contains(PropertyFlags::DONT_FIXATE));
    }

    #[test]
    fn single_modifier_format_drops_dont_fixate() {
        let entry = FormatEntry {
            fourcc: Fourcc::Argb8888,
            wire_format: libspa::param::video::VideoFormat::BGRA,
            modifiers: vec![Modifier::Linear],
        };
        let object = format_params(&entry, 1920, 1080, RateTriple::default());
        let prop = object
            .properties
            .iter()
            .find(|p| p.key == FormatProperties::VideoModifier.as_raw())
            .unwrap();
        assert!(!prop.flags.contains(PropertyFlags::DONT_FIXATE));
        assert!(prop.flags.contains(PropertyFlags::MANDATORY));
    }
}
