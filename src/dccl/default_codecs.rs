use std::sync::Arc;

use bytes::Bytes;

use super::bits::{bits_for, BitBuffer};

use super::descriptor::{FieldDescriptor, FieldType, FieldValue, Label, MessageDescriptor, MessageValue};
use super::field_codec::{CodecManager, FieldCodec, Fixed, FixedFieldCodec, TypeKey};
use super::{DcclError, Result, DEFAULT_CODEC_NAME};

/// Register the `"dccl.default"` codec for every field type.
pub fn register_defaults(manager: &mut CodecManager) {
    let numeric: Arc<dyn FieldCodec> = Arc::new(Fixed(DefaultNumericCodec));
    manager.add(TypeKey::Int, DEFAULT_CODEC_NAME, numeric.clone());
    manager.add(TypeKey::UInt, DEFAULT_CODEC_NAME, numeric.clone());
    manager.add(TypeKey::Double, DEFAULT_CODEC_NAME, numeric);
    manager.add(TypeKey::Bool, DEFAULT_CODEC_NAME, Arc::new(Fixed(DefaultBoolCodec)));
    manager.add(TypeKey::Enum, DEFAULT_CODEC_NAME, Arc::new(Fixed(DefaultEnumCodec)));
    manager.add(TypeKey::Str, DEFAULT_CODEC_NAME, Arc::new(DefaultStringCodec));
    manager.add(TypeKey::Bytes, DEFAULT_CODEC_NAME, Arc::new(DefaultBytesCodec));
    manager.add(TypeKey::Message, DEFAULT_CODEC_NAME, Arc::new(DefaultMessageCodec));
}

/// Bounded numeric codec for integer and floating fields.
///
/// The wire value is an offset from `min` in units of `step = 10^-precision`
/// (1 for integers). Zero is reserved for "not set", so `[1, N]` maps onto
/// `[min, max]` and the width is `ceil(log2((max - min) / step + 2))` bits.
pub struct DefaultNumericCodec;

impl DefaultNumericCodec {
    fn step(field: &FieldDescriptor) -> f64 {
        match field.field_type {
            FieldType::Double => 10f64.powi(-field.options.precision),
            _ => 1.0,
        }
    }

    fn span(field: &FieldDescriptor) -> u64 {
        ((field.options.max - field.options.min) / Self::step(field)).round() as u64
    }

    fn width(field: &FieldDescriptor) -> u32 {
        bits_for(Self::span(field) + 2)
    }

    fn numeric_value(field: &FieldDescriptor, value: &FieldValue) -> Result<f64> {
        match (&field.field_type, value) {
            (FieldType::Int64, FieldValue::Int(v)) => Ok(*v as f64),
            (FieldType::UInt64, FieldValue::UInt(v)) => Ok(*v as f64),
            (FieldType::Double, FieldValue::Double(v)) => Ok(*v),
            _ => Err(DcclError::InvalidSchema(format!(
                "field {:?} holds a value of the wrong type",
                field.name
            ))),
        }
    }
}

impl FixedFieldCodec for DefaultNumericCodec {
    fn validate(&self, field: &FieldDescriptor) -> Result<()> {
        let opts = &field.options;
        if !(opts.min <= opts.max) {
            return Err(DcclError::InvalidSchema(format!(
                "field {:?}: min {} exceeds max {}",
                field.name, opts.min, opts.max
            )));
        }
        if Self::width(field) > 64 {
            return Err(DcclError::InvalidSchema(format!(
                "field {:?}: bounds span more than 64 bits",
                field.name
            )));
        }
        Ok(())
    }

    fn size(&self, field: &FieldDescriptor) -> Result<u32> {
        Ok(Self::width(field))
    }

    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
    ) -> Result<()> {
        let width = Self::width(field);
        let Some(value) = value else {
            return bits.push(0, width);
        };

        let v = Self::numeric_value(field, value)?;
        if v < field.options.min || v > field.options.max {
            return Err(DcclError::OutOfRange(field.name.clone()));
        }

        let wire = ((v - field.options.min) / Self::step(field)).round() as u64 + 1;
        bits.push(wire, width)
    }

    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
    ) -> Result<Option<FieldValue>> {
        let wire = bits.pop(Self::width(field))?;
        if wire == 0 {
            return Ok(None);
        }
        if wire - 1 > Self::span(field) {
            return Err(DcclError::Malformed(format!(
                "wire value {} out of bounds for field {:?}",
                wire, field.name
            )));
        }

        let v = field.options.min + (wire - 1) as f64 * Self::step(field);
        Ok(Some(match field.field_type {
            FieldType::Int64 => FieldValue::Int(v.round() as i64),
            FieldType::UInt64 => FieldValue::UInt(v.round() as u64),
            _ => FieldValue::Double(quantize(v, field.options.precision)),
        }))
    }
}

fn quantize(v: f64, precision: i32) -> f64 {
    let scale = 10f64.powi(precision);
    (v * scale).round() / scale
}

/// Two bits: 0 = not set, 1 = false, 2 = true.
pub struct DefaultBoolCodec;

impl FixedFieldCodec for DefaultBoolCodec {
    fn size(&self, _field: &FieldDescriptor) -> Result<u32> {
        Ok(2)
    }

    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
    ) -> Result<()> {
        let wire = match value {
            None => 0,
            Some(FieldValue::Bool(false)) => 1,
            Some(FieldValue::Bool(true)) => 2,
            Some(_) => {
                return Err(DcclError::InvalidSchema(format!(
                    "field {:?} holds a value of the wrong type",
                    field.name
                )))
            }
        };
        bits.push(wire, 2)
    }

    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
    ) -> Result<Option<FieldValue>> {
        match bits.pop(2)? {
            0 => Ok(None),
            1 => Ok(Some(FieldValue::Bool(false))),
            2 => Ok(Some(FieldValue::Bool(true))),
            w => Err(DcclError::Malformed(format!(
                "wire value {} invalid for bool field {:?}",
                w, field.name
            ))),
        }
    }
}

/// `ceil(log2(n_values + 1))` bits; 0 = not set, `i + 1` = value index `i`.
pub struct DefaultEnumCodec;

impl DefaultEnumCodec {
    fn values(field: &FieldDescriptor) -> Result<&Arc<Vec<String>>> {
        match &field.field_type {
            FieldType::Enum(values) => Ok(values),
            _ => Err(DcclError::InvalidSchema(format!(
                "enum codec bound to non-enum field {:?}",
                field.name
            ))),
        }
    }
}

impl FixedFieldCodec for DefaultEnumCodec {
    fn validate(&self, field: &FieldDescriptor) -> Result<()> {
        if Self::values(field)?.is_empty() {
            return Err(DcclError::InvalidSchema(format!(
                "enum field {:?} has no values",
                field.name
            )));
        }
        Ok(())
    }

    fn size(&self, field: &FieldDescriptor) -> Result<u32> {
        Ok(bits_for(Self::values(field)?.len() as u64 + 1))
    }

    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
    ) -> Result<()> {
        let n = Self::values(field)?.len() as u64;
        let width = bits_for(n + 1);
        match value {
            None => bits.push(0, width),
            Some(FieldValue::Enum(i)) if (*i as u64) < n => bits.push(*i as u64 + 1, width),
            Some(_) => Err(DcclError::OutOfRange(field.name.clone())),
        }
    }

    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
    ) -> Result<Option<FieldValue>> {
        let n = Self::values(field)?.len() as u64;
        match bits.pop(bits_for(n + 1))? {
            0 => Ok(None),
            w if w <= n => Ok(Some(FieldValue::Enum((w - 1) as u32))),
            w => Err(DcclError::Malformed(format!(
                "wire value {} out of bounds for enum field {:?}",
                w, field.name
            ))),
        }
    }
}

/// Length prefix of `ceil(log2(max_length + 1))` bits, then 8 bits per byte.
///
/// Strings longer than `max_length` are silently truncated on encode; this is
/// a documented contract, not an error. A zero length decodes as "not set",
/// so an empty string is indistinguishable from an absent one.
pub struct DefaultStringCodec;

impl FieldCodec for DefaultStringCodec {
    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
        _codecs: &CodecManager,
    ) -> Result<()> {
        let s = match value {
            None => "",
            Some(FieldValue::String(s)) => s.as_str(),
            Some(_) => {
                return Err(DcclError::InvalidSchema(format!(
                    "field {:?} holds a value of the wrong type",
                    field.name
                )))
            }
        };
        encode_length_prefixed(&truncate_utf8(s, field.options.max_length as usize), field, bits)
    }

    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
        _codecs: &CodecManager,
    ) -> Result<Option<FieldValue>> {
        Ok(decode_length_prefixed(field, bits)?.map(|raw| {
            FieldValue::String(String::from_utf8_lossy(&raw).into_owned())
        }))
    }

    fn size_of(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        _codecs: &CodecManager,
    ) -> Result<u32> {
        let len = match value {
            Some(FieldValue::String(s)) => truncate_utf8(s, field.options.max_length as usize).len(),
            _ => 0,
        };
        Ok(length_prefix_bits(field) + 8 * len as u32)
    }

    fn min_size(&self, field: &FieldDescriptor, _codecs: &CodecManager) -> Result<u32> {
        Ok(length_prefix_bits(field))
    }

    fn max_size(&self, field: &FieldDescriptor, _codecs: &CodecManager) -> Result<u32> {
        Ok(length_prefix_bits(field) + 8 * field.options.max_length)
    }
}

/// Like the string codec, but raw bytes.
pub struct DefaultBytesCodec;

impl FieldCodec for DefaultBytesCodec {
    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
        _codecs: &CodecManager,
    ) -> Result<()> {
        let b = match value {
            None => &[][..],
            Some(FieldValue::Bytes(b)) => &b[..b.len().min(field.options.max_length as usize)],
            Some(_) => {
                return Err(DcclError::InvalidSchema(format!(
                    "field {:?} holds a value of the wrong type",
                    field.name
                )))
            }
        };
        encode_length_prefixed(b, field, bits)
    }

    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
        _codecs: &CodecManager,
    ) -> Result<Option<FieldValue>> {
        Ok(decode_length_prefixed(field, bits)?
            .map(|raw| FieldValue::Bytes(Bytes::from(raw))))
    }

    fn size_of(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        _codecs: &CodecManager,
    ) -> Result<u32> {
        let len = match value {
            Some(FieldValue::Bytes(b)) => b.len().min(field.options.max_length as usize),
            _ => 0,
        };
        Ok(length_prefix_bits(field) + 8 * len as u32)
    }

    fn min_size(&self, field: &FieldDescriptor, _codecs: &CodecManager) -> Result<u32> {
        Ok(length_prefix_bits(field))
    }

    fn max_size(&self, field: &FieldDescriptor, _codecs: &CodecManager) -> Result<u32> {
        Ok(length_prefix_bits(field) + 8 * field.options.max_length)
    }
}

fn length_prefix_bits(field: &FieldDescriptor) -> u32 {
    bits_for(field.options.max_length as u64 + 1)
}

fn truncate_utf8(s: &str, max_len: usize) -> Vec<u8> {
    let mut end = s.len().min(max_len);
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    s.as_bytes()[..end].to_vec()
}

fn encode_length_prefixed(
    raw: &[u8],
    field: &FieldDescriptor,
    bits: &mut BitBuffer,
) -> Result<()> {
    bits.push(raw.len() as u64, length_prefix_bits(field))?;
    for b in raw {
        bits.push(*b as u64, 8)?;
    }
    Ok(())
}

fn decode_length_prefixed(
    field: &FieldDescriptor,
    bits: &mut BitBuffer,
) -> Result<Option<Vec<u8>>> {
    let len = bits.pop(length_prefix_bits(field))?;
    if len == 0 {
        return Ok(None);
    }
    if len > field.options.max_length as u64 {
        return Err(DcclError::Malformed(format!(
            "length {} exceeds max_length {} for field {:?}",
            len, field.options.max_length, field.name
        )));
    }
    let mut raw = Vec::with_capacity(len as usize);
    for _ in 0..len {
        raw.push(bits.pop(8)? as u8);
    }
    Ok(Some(raw))
}

/// Recursive encoding of a nested message. A single presence bit is
/// prepended when the containing field is optional; there is no other
/// framing.
pub struct DefaultMessageCodec;

impl DefaultMessageCodec {
    fn descriptor(field: &FieldDescriptor) -> Result<&Arc<MessageDescriptor>> {
        match &field.field_type {
            FieldType::Message(desc) => Ok(desc),
            _ => Err(DcclError::InvalidSchema(format!(
                "message codec bound to non-message field {:?}",
                field.name
            ))),
        }
    }

    fn has_presence_bit(field: &FieldDescriptor) -> bool {
        matches!(field.label, Label::Optional)
    }
}

impl FieldCodec for DefaultMessageCodec {
    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
        codecs: &CodecManager,
    ) -> Result<()> {
        let desc = Self::descriptor(field)?;
        match value {
            None if Self::has_presence_bit(field) => bits.push(0, 1),
            None => encode_message_fields(desc, &MessageValue::new(desc.clone()), bits, codecs),
            Some(FieldValue::Message(msg)) => {
                if Self::has_presence_bit(field) {
                    bits.push(1, 1)?;
                }
                encode_message_fields(desc, msg, bits, codecs)
            }
            Some(_) => Err(DcclError::InvalidSchema(format!(
                "field {:?} holds a value of the wrong type",
                field.name
            ))),
        }
    }

    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
        codecs: &CodecManager,
    ) -> Result<Option<FieldValue>> {
        let desc = Self::descriptor(field)?;
        if Self::has_presence_bit(field) && bits.pop(1)? == 0 {
            return Ok(None);
        }
        Ok(Some(FieldValue::Message(decode_message_fields(
            desc, bits, codecs,
        )?)))
    }

    fn size_of(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        codecs: &CodecManager,
    ) -> Result<u32> {
        let desc = Self::descriptor(field)?;
        let presence = Self::has_presence_bit(field) as u32;
        match value {
            None if Self::has_presence_bit(field) => Ok(presence),
            None => message_body_size(desc, &MessageValue::new(desc.clone()), codecs),
            Some(FieldValue::Message(msg)) => {
                Ok(presence + message_body_size(desc, msg, codecs)?)
            }
            Some(_) => Err(DcclError::InvalidSchema(format!(
                "field {:?} holds a value of the wrong type",
                field.name
            ))),
        }
    }

    fn min_size(&self, field: &FieldDescriptor, codecs: &CodecManager) -> Result<u32> {
        let desc = Self::descriptor(field)?;
        if Self::has_presence_bit(field) {
            Ok(1)
        } else {
            message_min_size(desc, codecs)
        }
    }

    fn max_size(&self, field: &FieldDescriptor, codecs: &CodecManager) -> Result<u32> {
        let desc = Self::descriptor(field)?;
        Ok(Self::has_presence_bit(field) as u32 + message_max_size(desc, codecs)?)
    }
}

fn repeat_prefix_bits(max_repeat: u32) -> u32 {
    bits_for(max_repeat as u64 + 1)
}

/// Encode every field of `msg` in declared order. This is the top-level body
/// codec as well as the recursion step for nested messages.
pub fn encode_message_fields(
    desc: &MessageDescriptor,
    msg: &MessageValue,
    bits: &mut BitBuffer,
    codecs: &CodecManager,
) -> Result<()> {
    for (i, field) in desc.fields.iter().enumerate() {
        let codec = codecs.find(field)?;
        let value = msg.value_at(i);
        match field.label {
            Label::Repeated { max_repeat } => {
                let items = repeated_items(field, value)?;
                if items.len() > max_repeat as usize {
                    return Err(DcclError::OutOfRange(field.name.clone()));
                }
                bits.push(items.len() as u64, repeat_prefix_bits(max_repeat))?;
                for item in items {
                    codec.encode(field, Some(item), bits, codecs)?;
                }
            }
            _ => codec.encode(field, value, bits, codecs)?,
        }
    }
    Ok(())
}

pub fn decode_message_fields(
    desc: &Arc<MessageDescriptor>,
    bits: &mut BitBuffer,
    codecs: &CodecManager,
) -> Result<MessageValue> {
    let mut msg = MessageValue::new(desc.clone());
    for (i, field) in desc.fields.iter().enumerate() {
        let codec = codecs.find(field)?;
        match field.label {
            Label::Repeated { max_repeat } => {
                let count = bits.pop(repeat_prefix_bits(max_repeat))?;
                if count > max_repeat as u64 {
                    return Err(DcclError::Malformed(format!(
                        "repeat count {} exceeds max_repeat {} for field {:?}",
                        count, max_repeat, field.name
                    )));
                }
                let mut items = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    match codec.decode(field, bits, codecs)? {
                        Some(item) => items.push(item),
                        None => {
                            return Err(DcclError::Malformed(format!(
                                "absent element in repeated field {:?}",
                                field.name
                            )))
                        }
                    }
                }
                if !items.is_empty() {
                    msg.set_at(i, Some(FieldValue::List(items)));
                }
            }
            _ => msg.set_at(i, codec.decode(field, bits, codecs)?),
        }
    }
    Ok(msg)
}

pub fn message_body_size(
    desc: &MessageDescriptor,
    msg: &MessageValue,
    codecs: &CodecManager,
) -> Result<u32> {
    let mut total = 0;
    for (i, field) in desc.fields.iter().enumerate() {
        let codec = codecs.find(field)?;
        let value = msg.value_at(i);
        total += match field.label {
            Label::Repeated { max_repeat } => {
                let items = repeated_items(field, value)?;
                let mut bits = repeat_prefix_bits(max_repeat);
                for item in items {
                    bits += codec.size_of(field, Some(item), codecs)?;
                }
                bits
            }
            _ => codec.size_of(field, value, codecs)?,
        };
    }
    Ok(total)
}

pub fn message_min_size(desc: &MessageDescriptor, codecs: &CodecManager) -> Result<u32> {
    let mut total = 0;
    for field in &desc.fields {
        let codec = codecs.find(field)?;
        total += match field.label {
            Label::Repeated { max_repeat } => repeat_prefix_bits(max_repeat),
            _ => codec.min_size(field, codecs)?,
        };
    }
    Ok(total)
}

pub fn message_max_size(desc: &MessageDescriptor, codecs: &CodecManager) -> Result<u32> {
    let mut total = 0;
    for field in &desc.fields {
        let codec = codecs.find(field)?;
        total += match field.label {
            Label::Repeated { max_repeat } => {
                repeat_prefix_bits(max_repeat) + max_repeat * codec.max_size(field, codecs)?
            }
            _ => codec.max_size(field, codecs)?,
        };
    }
    Ok(total)
}

fn repeated_items<'a>(
    field: &FieldDescriptor,
    value: Option<&'a FieldValue>,
) -> Result<&'a [FieldValue]> {
    match value {
        None => Ok(&[]),
        Some(FieldValue::List(items)) => Ok(items),
        Some(single) => Ok(std::slice::from_ref(single)),
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    fn codecs() -> CodecManager {
        let mut manager = CodecManager::default();
        register_defaults(&mut manager);
        manager
    }

    fn round_trip(field: &FieldDescriptor, value: Option<FieldValue>) -> Option<FieldValue> {
        let manager = codecs();
        let codec = manager.find(field).unwrap();
        let mut bits = BitBuffer::new();
        codec
            .encode(field, value.as_ref(), &mut bits, &manager)
            .unwrap();
        codec.decode(field, &mut bits, &manager).unwrap()
    }

    #[rstest]
    #[case::mid(42)]
    #[case::min(-100)]
    #[case::max(100)]
    #[case::zero(0)]
    fn test_int_round_trip(#[case] value: i64) {
        let field = FieldDescriptor::int64("depth", -100, 100);
        assert_eq!(round_trip(&field, Some(FieldValue::Int(value))), Some(FieldValue::Int(value)));
    }

    #[test]
    fn test_int_width_matches_bound_formula() {
        // span 200, plus the reserved zero and both endpoints: 202 values, 8 bits
        let field = FieldDescriptor::int64("depth", -100, 100);
        let manager = codecs();
        let codec = manager.find(&field).unwrap();
        assert_eq!(codec.size_of(&field, None, &manager).unwrap(), 8);
    }

    #[rstest]
    #[case::above(101)]
    #[case::below(-101)]
    fn test_int_out_of_range(#[case] value: i64) {
        let field = FieldDescriptor::int64("depth", -100, 100);
        let manager = codecs();
        let codec = manager.find(&field).unwrap();
        let mut bits = BitBuffer::new();
        assert!(matches!(
            codec.encode(&field, Some(&FieldValue::Int(value)), &mut bits, &manager),
            Err(DcclError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_int_absent_round_trip() {
        let field = FieldDescriptor::int64("depth", -100, 100);
        assert_eq!(round_trip(&field, None), None);
    }

    #[rstest]
    #[case::precise(10.12, 10.12)]
    #[case::rounded(10.126, 10.13)]
    #[case::negative(-5.0, -5.0)]
    fn test_double_round_trip_within_step(#[case] input: f64, #[case] expected: f64) {
        let field = FieldDescriptor::double("speed", -10.0, 20.0, 2);
        assert_eq!(
            round_trip(&field, Some(FieldValue::Double(input))),
            Some(FieldValue::Double(expected))
        );
    }

    #[rstest]
    #[case::unset(None)]
    #[case::yes(Some(true))]
    #[case::no(Some(false))]
    fn test_bool_round_trip(#[case] value: Option<bool>) {
        let field = FieldDescriptor::boolean("armed");
        assert_eq!(round_trip(&field, value.map(FieldValue::Bool)), value.map(FieldValue::Bool));
    }

    #[test]
    fn test_enum_round_trip_and_width() {
        let field = FieldDescriptor::enumeration("mode", &["idle", "survey", "return"]);
        let manager = codecs();
        let codec = manager.find(&field).unwrap();
        // 3 values + reserved zero = 4 states in 2 bits
        assert_eq!(codec.size_of(&field, None, &manager).unwrap(), 2);
        assert_eq!(round_trip(&field, Some(FieldValue::Enum(2))), Some(FieldValue::Enum(2)));
    }

    #[test]
    fn test_enum_out_of_range() {
        let field = FieldDescriptor::enumeration("mode", &["a", "b"]);
        let manager = codecs();
        let mut bits = BitBuffer::new();
        assert!(matches!(
            manager
                .find(&field)
                .unwrap()
                .encode(&field, Some(&FieldValue::Enum(2)), &mut bits, &manager),
            Err(DcclError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_string_round_trip() {
        let field = FieldDescriptor::string("telegram", 16);
        assert_eq!(
            round_trip(&field, Some(FieldValue::String("hello".into()))),
            Some(FieldValue::String("hello".into()))
        );
    }

    #[test]
    fn test_string_truncates_silently() {
        let field = FieldDescriptor::string("telegram", 4);
        assert_eq!(
            round_trip(&field, Some(FieldValue::String("overlong".into()))),
            Some(FieldValue::String("over".into()))
        );
    }

    #[test]
    fn test_bytes_round_trip() {
        let field = FieldDescriptor::bytes("blob", 8);
        let value = FieldValue::Bytes(Bytes::from_static(b"\x01\x02\xff"));
        assert_eq!(round_trip(&field, Some(value.clone())), Some(value));
    }

    #[test]
    fn test_repeated_round_trip() {
        let desc = MessageDescriptor::builder("track", 9)
            .field(FieldDescriptor::int64("depths", 0, 1000).repeated(4))
            .build();
        let mut msg = MessageValue::new(desc.clone());
        msg.set(
            "depths",
            FieldValue::List(vec![FieldValue::Int(1), FieldValue::Int(500)]),
        )
        .unwrap();

        let manager = codecs();
        let mut bits = BitBuffer::new();
        encode_message_fields(&desc, &msg, &mut bits, &manager).unwrap();
        let decoded = decode_message_fields(&desc, &mut bits, &manager).unwrap();
        assert_eq!(decoded.get("depths"), msg.get("depths"));
    }

    #[test]
    fn test_repeated_over_max_fails() {
        let desc = MessageDescriptor::builder("track", 9)
            .field(FieldDescriptor::int64("depths", 0, 10).repeated(2))
            .build();
        let mut msg = MessageValue::new(desc.clone());
        msg.set(
            "depths",
            FieldValue::List(vec![FieldValue::Int(1), FieldValue::Int(2), FieldValue::Int(3)]),
        )
        .unwrap();

        let manager = codecs();
        let mut bits = BitBuffer::new();
        assert!(matches!(
            encode_message_fields(&desc, &msg, &mut bits, &manager),
            Err(DcclError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_optional_submessage_presence_bit() {
        let inner = MessageDescriptor::builder("position", 0)
            .field(FieldDescriptor::int64("x", 0, 100))
            .build();
        let field = FieldDescriptor::message("pos", inner.clone());

        // absent: exactly one bit
        let manager = codecs();
        let codec = manager.find(&field).unwrap();
        let mut bits = BitBuffer::new();
        codec.encode(&field, None, &mut bits, &manager).unwrap();
        assert_eq!(bits.size_bits(), 1);

        let mut inner_value = MessageValue::new(inner);
        inner_value.set("x", FieldValue::Int(7)).unwrap();
        let decoded = round_trip(&field, Some(FieldValue::Message(inner_value.clone())));
        assert_eq!(decoded, Some(FieldValue::Message(inner_value)));
    }

    #[test]
    fn test_size_bounds_hold() {
        let desc = MessageDescriptor::builder("mixed", 11)
            .field(FieldDescriptor::int64("a", -100, 100))
            .field(FieldDescriptor::string("s", 8))
            .field(FieldDescriptor::boolean("b"))
            .build();
        let mut msg = MessageValue::new(desc.clone());
        msg.set("a", FieldValue::Int(5)).unwrap();
        msg.set("s", FieldValue::String("hi".into())).unwrap();

        let manager = codecs();
        let size = message_body_size(&desc, &msg, &manager).unwrap();
        assert!(message_min_size(&desc, &manager).unwrap() <= size);
        assert!(size <= message_max_size(&desc, &manager).unwrap());

        let mut bits = BitBuffer::new();
        encode_message_fields(&desc, &msg, &mut bits, &manager).unwrap();
        assert_eq!(bits.size_bits() as u32, size);
    }
}
