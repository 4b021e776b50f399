use std::sync::Arc;

use rustc_hash::FxHashMap;
use tracing::warn;

use super::default_codecs::register_defaults;
use super::descriptor::{FieldValue, HookValue, MessageDescriptor, MessageValue};
use super::field_codec::CodecManager;
use super::{DcclError, Result};

/// Hook callback: `(field value, wire value, extension value)`.
pub type Hook = Box<dyn Fn(&HookValue, &HookValue, &HookValue)>;

/// Holds validated message descriptors, the field codec bindings, and the
/// extension hooks.
///
/// A `Registry` is an explicit value threaded into [`super::DcclCodec`]
/// rather than process-wide shared state, so tests and embedders instantiate
/// their own.
pub struct Registry {
    descriptors: FxHashMap<u16, Arc<MessageDescriptor>>,
    codecs: CodecManager,
    hooks: FxHashMap<u32, Hook>,
}

impl Registry {
    /// A registry with the `"dccl.default"` codec set installed.
    pub fn new() -> Registry {
        let mut codecs = CodecManager::default();
        register_defaults(&mut codecs);
        Registry {
            descriptors: FxHashMap::default(),
            codecs,
            hooks: FxHashMap::default(),
        }
    }

    pub fn codecs(&self) -> &CodecManager {
        &self.codecs
    }

    pub fn codecs_mut(&mut self) -> &mut CodecManager {
        &mut self.codecs
    }

    pub(crate) fn insert(&mut self, desc: Arc<MessageDescriptor>) -> Result<()> {
        if self.descriptors.contains_key(&desc.dccl_id) {
            return Err(DcclError::DuplicateId(desc.dccl_id));
        }
        self.descriptors.insert(desc.dccl_id, desc);
        Ok(())
    }

    pub fn get(&self, dccl_id: u16) -> Option<&Arc<MessageDescriptor>> {
        self.descriptors.get(&dccl_id)
    }

    pub fn contains(&self, dccl_id: u16) -> bool {
        self.descriptors.contains_key(&dccl_id)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<MessageDescriptor>> {
        self.descriptors.values()
    }

    /// Register a callback fired for every field annotated with the given
    /// extension number during [`Registry::run_hooks`] traversal.
    pub fn register_hook(&mut self, extension_number: u32, hook: Hook) {
        if self.hooks.insert(extension_number, hook).is_some() {
            warn!(extension_number, "replacing previously registered hook");
        }
    }

    /// Walk `msg` (including nested messages) and fire registered hooks for
    /// every set field carrying a matching extension annotation.
    pub fn run_hooks(&self, msg: &MessageValue) {
        for_each_extension(msg, &mut |number, field_value, ext_value| {
            if let Some(hook) = self.hooks.get(&number) {
                if let Some(hv) = HookValue::from_field_value(field_value) {
                    // the default codecs are value-preserving up to
                    // quantisation, so the wire view equals the field view
                    hook(&hv, &hv, ext_value);
                }
            }
        });
    }
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

/// Depth-first traversal of every set, extension-annotated field.
pub fn for_each_extension(
    msg: &MessageValue,
    f: &mut dyn FnMut(u32, &FieldValue, &HookValue),
) {
    let desc = msg.descriptor().clone();
    for (i, field) in desc.fields.iter().enumerate() {
        let Some(value) = msg.value_at(i) else {
            continue;
        };

        for (number, ext_value) in &field.options.extensions {
            f(*number, value, ext_value);
        }

        match value {
            FieldValue::Message(inner) => for_each_extension(inner, f),
            FieldValue::List(items) => {
                for item in items {
                    if let FieldValue::Message(inner) = item {
                        for_each_extension(inner, f);
                    }
                }
            }
            _ => {}
        }
    }
}
