use std::sync::Arc;

use bytes::Bytes;

use super::{DcclError, Result, DEFAULT_CODEC_NAME};

/// Cardinality of a field. New fields default to `Optional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Label {
    Required,
    Optional,
    Repeated { max_repeat: u32 },
}

/// The type a field presents to the caller. The codec bound to the field may
/// use a different representation on the wire (a bounded double travels as an
/// unsigned integer offset, for example).
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    Bool,
    Int64,
    UInt64,
    Double,
    String,
    Bytes,
    Enum(Arc<Vec<String>>),
    Message(Arc<MessageDescriptor>),
}

/// Codec options attached to a field. Numeric bounds are doubles regardless
/// of the field type, matching the schema language they come from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldOptions {
    pub min: f64,
    pub max: f64,
    pub precision: i32,
    pub max_length: u32,
    /// `(extension number, value)` annotations harvested by hook callbacks,
    /// e.g. the queue layer's src/dest/time markers.
    pub extensions: Vec<(u32, HookValue)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub name: String,
    pub field_type: FieldType,
    pub label: Label,
    pub codec_name: String,
    pub options: FieldOptions,
}

impl FieldDescriptor {
    fn new(name: &str, field_type: FieldType, options: FieldOptions) -> FieldDescriptor {
        FieldDescriptor {
            name: name.to_string(),
            field_type,
            label: Label::Optional,
            codec_name: DEFAULT_CODEC_NAME.to_string(),
            options,
        }
    }

    pub fn int64(name: &str, min: i64, max: i64) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            FieldType::Int64,
            FieldOptions {
                min: min as f64,
                max: max as f64,
                ..Default::default()
            },
        )
    }

    pub fn uint64(name: &str, min: u64, max: u64) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            FieldType::UInt64,
            FieldOptions {
                min: min as f64,
                max: max as f64,
                ..Default::default()
            },
        )
    }

    pub fn double(name: &str, min: f64, max: f64, precision: i32) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            FieldType::Double,
            FieldOptions {
                min,
                max,
                precision,
                ..Default::default()
            },
        )
    }

    pub fn boolean(name: &str) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Bool, FieldOptions::default())
    }

    pub fn string(name: &str, max_length: u32) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            FieldType::String,
            FieldOptions {
                max_length,
                ..Default::default()
            },
        )
    }

    pub fn bytes(name: &str, max_length: u32) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            FieldType::Bytes,
            FieldOptions {
                max_length,
                ..Default::default()
            },
        )
    }

    pub fn enumeration(name: &str, values: &[&str]) -> FieldDescriptor {
        FieldDescriptor::new(
            name,
            FieldType::Enum(Arc::new(values.iter().map(|s| s.to_string()).collect())),
            FieldOptions::default(),
        )
    }

    pub fn message(name: &str, desc: Arc<MessageDescriptor>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Message(desc), FieldOptions::default())
    }

    pub fn required(mut self) -> FieldDescriptor {
        self.label = Label::Required;
        self
    }

    pub fn optional(mut self) -> FieldDescriptor {
        self.label = Label::Optional;
        self
    }

    pub fn repeated(mut self, max_repeat: u32) -> FieldDescriptor {
        self.label = Label::Repeated { max_repeat };
        self
    }

    /// Bind a non-default codec by name.
    pub fn codec(mut self, name: &str) -> FieldDescriptor {
        self.codec_name = name.to_string();
        self
    }

    pub fn extension(mut self, number: u32, value: HookValue) -> FieldDescriptor {
        self.options.extensions.push((number, value));
        self
    }
}

/// A structural description of one message type, keyed on the wire by its
/// dccl id (1-65535).
#[derive(Debug, PartialEq)]
pub struct MessageDescriptor {
    pub name: String,
    pub dccl_id: u16,
    pub fields: Vec<FieldDescriptor>,
}

impl MessageDescriptor {
    pub fn builder(name: &str, dccl_id: u16) -> MessageDescriptorBuilder {
        MessageDescriptorBuilder {
            name: name.to_string(),
            dccl_id,
            fields: Vec::new(),
        }
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

pub struct MessageDescriptorBuilder {
    name: String,
    dccl_id: u16,
    fields: Vec<FieldDescriptor>,
}

impl MessageDescriptorBuilder {
    pub fn field(mut self, field: FieldDescriptor) -> MessageDescriptorBuilder {
        self.fields.push(field);
        self
    }

    pub fn build(self) -> Arc<MessageDescriptor> {
        Arc::new(MessageDescriptor {
            name: self.name,
            dccl_id: self.dccl_id,
            fields: self.fields,
        })
    }
}

/// A tagged field value. Repeated fields hold a `List`.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    String(String),
    Bytes(Bytes),
    /// Index into the enum's symbolic name table.
    Enum(u32),
    Message(MessageValue),
    List(Vec<FieldValue>),
}

/// A structured value conforming to a [`MessageDescriptor`]: one optional
/// value per declared field, in declared order.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageValue {
    desc: Arc<MessageDescriptor>,
    values: Vec<Option<FieldValue>>,
}

impl MessageValue {
    pub fn new(desc: Arc<MessageDescriptor>) -> MessageValue {
        let values = vec![None; desc.fields.len()];
        MessageValue { desc, values }
    }

    pub fn descriptor(&self) -> &Arc<MessageDescriptor> {
        &self.desc
    }

    pub fn set(&mut self, name: &str, value: FieldValue) -> Result<&mut MessageValue> {
        match self.desc.field_index(name) {
            Some(i) => {
                self.values[i] = Some(value);
                Ok(self)
            }
            None => Err(DcclError::NoSuchField {
                message: self.desc.name.clone(),
                field: name.to_string(),
            }),
        }
    }

    pub fn clear(&mut self, name: &str) {
        if let Some(i) = self.desc.field_index(name) {
            self.values[i] = None;
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.desc
            .field_index(name)
            .and_then(|i| self.values[i].as_ref())
    }

    pub(crate) fn value_at(&self, index: usize) -> Option<&FieldValue> {
        self.values[index].as_ref()
    }

    pub(crate) fn set_at(&mut self, index: usize, value: Option<FieldValue>) {
        self.values[index] = value;
    }
}

/// The tagged variant handed to hook callbacks, replacing "any value of any
/// type" with a closed set that callbacks dispatch on.
#[derive(Debug, Clone, PartialEq)]
pub enum HookValue {
    Bool(bool),
    I64(i64),
    U64(u64),
    F64(f64),
    Str(String),
    Bytes(Bytes),
    Descriptor(Arc<MessageDescriptor>),
}

impl HookValue {
    /// Lossy view of a [`FieldValue`] for hook dispatch.
    pub fn from_field_value(value: &FieldValue) -> Option<HookValue> {
        match value {
            FieldValue::Bool(b) => Some(HookValue::Bool(*b)),
            FieldValue::Int(i) => Some(HookValue::I64(*i)),
            FieldValue::UInt(u) => Some(HookValue::U64(*u)),
            FieldValue::Double(d) => Some(HookValue::F64(*d)),
            FieldValue::Enum(e) => Some(HookValue::U64(*e as u64)),
            FieldValue::String(s) => Some(HookValue::Str(s.clone())),
            FieldValue::Bytes(b) => Some(HookValue::Bytes(b.clone())),
            FieldValue::Message(_) | FieldValue::List(_) => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            HookValue::U64(u) => Some(*u),
            HookValue::I64(i) if *i >= 0 => Some(*i as u64),
            HookValue::F64(f) if *f >= 0.0 => Some(*f as u64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HookValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}
