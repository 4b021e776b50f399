use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::bits::BitBuffer;

use super::descriptor::{FieldDescriptor, FieldType, FieldValue};
use super::{DcclError, Result};

/// One field encoder/decoder. A codec is selected per
/// `(field type, codec name)`; the name defaults to `"dccl.default"`.
///
/// Codecs that always occupy the same number of bits should implement
/// [`FixedFieldCodec`] instead and be registered through [`Fixed`].
pub trait FieldCodec {
    /// Check the field's options at validation time; failures keep the whole
    /// message type out of the registry.
    fn validate(&self, _field: &FieldDescriptor) -> Result<()> {
        Ok(())
    }

    /// Append the encoding of `value` (`None` = field not set).
    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
        codecs: &CodecManager,
    ) -> Result<()>;

    /// Consume this field's bits, returning `None` for a field encoded as
    /// absent.
    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
        codecs: &CodecManager,
    ) -> Result<Option<FieldValue>>;

    /// Encoded size in bits of this particular value.
    fn size_of(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        codecs: &CodecManager,
    ) -> Result<u32>;

    fn min_size(&self, field: &FieldDescriptor, codecs: &CodecManager) -> Result<u32>;

    fn max_size(&self, field: &FieldDescriptor, codecs: &CodecManager) -> Result<u32>;
}

/// A codec whose width never depends on the value.
pub trait FixedFieldCodec {
    fn validate(&self, _field: &FieldDescriptor) -> Result<()> {
        Ok(())
    }

    fn size(&self, field: &FieldDescriptor) -> Result<u32>;

    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
    ) -> Result<()>;

    fn decode(&self, field: &FieldDescriptor, bits: &mut BitBuffer)
        -> Result<Option<FieldValue>>;
}

/// Adapter presenting a [`FixedFieldCodec`] through the [`FieldCodec`]
/// capability set: `size_of`, `min_size` and `max_size` all collapse to
/// `size`.
pub struct Fixed<T>(pub T);

impl<T: FixedFieldCodec> FieldCodec for Fixed<T> {
    fn validate(&self, field: &FieldDescriptor) -> Result<()> {
        self.0.validate(field)
    }

    fn encode(
        &self,
        field: &FieldDescriptor,
        value: Option<&FieldValue>,
        bits: &mut BitBuffer,
        _codecs: &CodecManager,
    ) -> Result<()> {
        self.0.encode(field, value, bits)
    }

    fn decode(
        &self,
        field: &FieldDescriptor,
        bits: &mut BitBuffer,
        _codecs: &CodecManager,
    ) -> Result<Option<FieldValue>> {
        self.0.decode(field, bits)
    }

    fn size_of(
        &self,
        field: &FieldDescriptor,
        _value: Option<&FieldValue>,
        _codecs: &CodecManager,
    ) -> Result<u32> {
        self.0.size(field)
    }

    fn min_size(&self, field: &FieldDescriptor, _codecs: &CodecManager) -> Result<u32> {
        self.0.size(field)
    }

    fn max_size(&self, field: &FieldDescriptor, _codecs: &CodecManager) -> Result<u32> {
        self.0.size(field)
    }
}

/// Codec lookup key: the field type stripped of its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKey {
    Bool,
    Int,
    UInt,
    Double,
    Str,
    Bytes,
    Enum,
    Message,
}

impl TypeKey {
    pub fn of(field_type: &FieldType) -> TypeKey {
        match field_type {
            FieldType::Bool => TypeKey::Bool,
            FieldType::Int64 => TypeKey::Int,
            FieldType::UInt64 => TypeKey::UInt,
            FieldType::Double => TypeKey::Double,
            FieldType::String => TypeKey::Str,
            FieldType::Bytes => TypeKey::Bytes,
            FieldType::Enum(_) => TypeKey::Enum,
            FieldType::Message(_) => TypeKey::Message,
        }
    }
}

/// Registry of field codecs keyed by `(type, name)`.
#[derive(Default)]
pub struct CodecManager {
    codecs: FxHashMap<(TypeKey, String), Arc<dyn FieldCodec>>,
}

impl CodecManager {
    pub fn add(&mut self, key: TypeKey, name: &str, codec: Arc<dyn FieldCodec>) {
        self.codecs.insert((key, name.to_string()), codec);
    }

    pub fn find(&self, field: &FieldDescriptor) -> Result<&Arc<dyn FieldCodec>> {
        self.codecs
            .get(&(TypeKey::of(&field.field_type), field.codec_name.clone()))
            .ok_or_else(|| DcclError::CodecMissing {
                name: field.codec_name.clone(),
                field: field.name.clone(),
            })
    }
}
