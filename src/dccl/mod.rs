//! DCCL - the Dynamic Compact Control Language codec.
//!
//! A schema-driven, bit-packed message codec. Message types are described by
//! a [`descriptor::MessageDescriptor`], validated against a [`Registry`], and
//! encoded into the smallest possible byte string: a short id on the wire
//! followed by the bit-packed body in declared field order, with no per-field
//! tags. Field-level codecs are pluggable per `(field type, codec name)`.

pub mod bits;
pub mod codec;
pub mod crypto;
pub mod default_codecs;
pub mod descriptor;
pub mod field_codec;
pub mod id_codec;
pub mod registry;

pub use codec::{DcclCodec, DcclConfig};
pub use descriptor::{
    FieldDescriptor, FieldType, FieldValue, HookValue, Label, MessageDescriptor, MessageValue,
};
pub use registry::Registry;

use thiserror::Error;

pub const DEFAULT_CODEC_NAME: &str = "dccl.default";

#[derive(Debug, Error)]
pub enum DcclError {
    #[error("bit buffer overflow: {0}")]
    Overflow(String),
    #[error("value out of range for field {0:?}")]
    OutOfRange(String),
    #[error("message {0:?} has not been validated")]
    NotValidated(String),
    #[error("encoded message is {size} bytes, exceeding the {max} byte limit")]
    TooLarge { size: usize, max: usize },
    #[error("unknown dccl id {0} in encoded message")]
    UnknownId(u16),
    #[error("malformed encoded message: {0}")]
    Malformed(String),
    #[error("crypto envelope could not be opened")]
    BadCrypto,
    #[error("dccl id {0} is already registered")]
    DuplicateId(u16),
    #[error("no codec named {name:?} for field {field:?}")]
    CodecMissing { name: String, field: String },
    #[error("message {message:?} has no field {field:?}")]
    NoSuchField { message: String, field: String },
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
}

pub type Result<T> = std::result::Result<T, DcclError>;
