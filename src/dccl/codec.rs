use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use super::bits::BitBuffer;

use super::crypto::Crypto;
use super::default_codecs::{
    decode_message_fields, encode_message_fields, message_body_size, message_max_size,
    message_min_size,
};
use super::descriptor::{FieldType, MessageDescriptor, MessageValue};
use super::id_codec::{DefaultIdCodec, IdCodec};
use super::registry::Registry;
use super::{DcclError, Result};

pub struct DcclConfig {
    /// Hard limit on the encoded size of any validated message, sized to fit
    /// a typical modem frame.
    pub max_bytes: usize,
    /// Enables the AES envelope around message bodies (never the id).
    pub crypto_passphrase: Option<String>,
}

impl Default for DcclConfig {
    fn default() -> Self {
        DcclConfig {
            max_bytes: 32,
            crypto_passphrase: None,
        }
    }
}

/// Top-level encode/decode orchestration over a schema registry.
///
/// Wire layout: `[id codec bytes][optionally-encrypted body, zero-padded to a
/// byte]`. The body follows declared field order with no per-field tags.
pub struct DcclCodec {
    registry: Registry,
    max_bytes: usize,
    crypto: Option<Crypto>,
    id_codec: Box<dyn IdCodec>,
}

impl DcclCodec {
    pub fn new(cfg: DcclConfig) -> DcclCodec {
        DcclCodec::with_registry(Registry::new(), cfg)
    }

    pub fn with_registry(registry: Registry, cfg: DcclConfig) -> DcclCodec {
        DcclCodec {
            registry,
            max_bytes: cfg.max_bytes,
            crypto: cfg.crypto_passphrase.as_deref().map(Crypto::new),
            id_codec: Box::new(DefaultIdCodec),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Swap the id codec. Existing registrations are not re-checked, so do
    /// this before validating message types.
    pub fn set_id_codec(&mut self, id_codec: Box<dyn IdCodec>) {
        self.id_codec = id_codec;
    }

    /// Bind codecs, check field options and size bounds, and register the
    /// descriptor. A message type must be validated before it can be encoded
    /// or decoded.
    pub fn validate(&mut self, desc: Arc<MessageDescriptor>) -> Result<()> {
        if desc.dccl_id == 0 {
            return Err(DcclError::InvalidSchema(format!(
                "message {:?}: dccl id 0 is reserved",
                desc.name
            )));
        }
        self.id_codec.validate(desc.dccl_id)?;
        if self.registry.contains(desc.dccl_id) {
            return Err(DcclError::DuplicateId(desc.dccl_id));
        }

        self.validate_fields(&desc)?;

        let max_body_bits = message_max_size(&desc, self.registry.codecs())?;
        let max_bits =
            8 * self.max_bytes.saturating_sub(self.id_codec.size(desc.dccl_id)) as u32;
        if max_body_bits > max_bits {
            return Err(DcclError::InvalidSchema(format!(
                "message {:?}: maximum body of {} bits exceeds the {} bits available in {} bytes",
                desc.name, max_body_bits, max_bits, self.max_bytes
            )));
        }

        debug!(
            name = %desc.name,
            id = desc.dccl_id,
            min_bits = message_min_size(&desc, self.registry.codecs())?,
            max_bits = max_body_bits,
            "validated message type"
        );
        self.registry.insert(desc)
    }

    fn validate_fields(&self, desc: &MessageDescriptor) -> Result<()> {
        for field in &desc.fields {
            let codec = self.registry.codecs().find(field)?;
            codec.validate(field)?;
            if let FieldType::Message(inner) = &field.field_type {
                self.validate_fields(inner)?;
            }
        }
        Ok(())
    }

    /// Encode a message into its wire bytes.
    pub fn encode(&self, msg: &MessageValue) -> Result<Bytes> {
        let desc = self.checked_descriptor(msg)?;

        let mut id_bytes = Vec::new();
        self.id_codec.encode(desc.dccl_id, &mut id_bytes)?;

        let mut bits = BitBuffer::new();
        encode_message_fields(desc, msg, &mut bits, self.registry.codecs())?;
        let body = bits.to_bytes();

        let body = match &self.crypto {
            Some(crypto) => Bytes::from(crypto.encrypt(&body, &id_bytes)),
            None => body,
        };

        let total = id_bytes.len() + body.len();
        if total > self.max_bytes {
            return Err(DcclError::TooLarge {
                size: total,
                max: self.max_bytes,
            });
        }

        let mut out = BytesMut::with_capacity(total);
        out.put_slice(&id_bytes);
        out.put_slice(&body);
        Ok(out.freeze())
    }

    /// Decode wire bytes into a message of the registered type.
    pub fn decode(&self, bytes: &[u8]) -> Result<MessageValue> {
        let (id, id_len) = self.id_codec.decode(bytes)?;
        let desc = self
            .registry
            .get(id)
            .ok_or(DcclError::UnknownId(id))?
            .clone();

        let body = match &self.crypto {
            Some(crypto) => Bytes::from(crypto.decrypt(&bytes[id_len..], &bytes[..id_len])?),
            None => Bytes::copy_from_slice(&bytes[id_len..]),
        };

        let mut bits = BitBuffer::from_bytes(&body, body.len() * 8)?;
        decode_message_fields(&desc, &mut bits, self.registry.codecs()).map_err(|e| match e {
            DcclError::Overflow(detail) => {
                DcclError::Malformed(format!("body ends prematurely: {}", detail))
            }
            other => other,
        })
    }

    /// The encoded size of `msg` in bytes, without encoding it.
    pub fn size(&self, msg: &MessageValue) -> Result<usize> {
        let desc = self.checked_descriptor(msg)?;
        let body_bits = message_body_size(desc, msg, self.registry.codecs())?;
        let body_bytes = (body_bits as usize).div_ceil(8);
        let body_bytes = match &self.crypto {
            // PKCS#7 always pads to the next whole block
            Some(_) => (body_bytes / 16 + 1) * 16,
            None => body_bytes,
        };
        Ok(self.id_codec.size(desc.dccl_id) + body_bytes)
    }

    /// Recover the dccl id of an encoded message without decoding (and
    /// without the crypto key).
    pub fn id_from_encoded(&self, bytes: &[u8]) -> Result<u16> {
        Ok(self.id_codec.decode(bytes)?.0)
    }

    /// Concatenate several encoded messages into one byte string, in order.
    pub fn encode_repeated(&self, msgs: &[MessageValue]) -> Result<Bytes> {
        let mut out = BytesMut::new();
        for msg in msgs {
            out.put_slice(&self.encode(msg)?);
        }
        Ok(out.freeze())
    }

    /// Decode messages produced by [`DcclCodec::encode_repeated`]. If a later
    /// message fails to decode, the messages decoded so far are returned.
    pub fn decode_repeated(&self, bytes: &[u8]) -> Result<Vec<MessageValue>> {
        let mut out = Vec::new();
        let mut remaining = bytes;
        while !remaining.is_empty() {
            match self.decode(remaining) {
                Ok(msg) => {
                    let consumed = self.size(&msg)?;
                    remaining = &remaining[consumed.min(remaining.len())..];
                    out.push(msg);
                }
                Err(e) if out.is_empty() => return Err(e),
                Err(e) => {
                    warn!(
                        "failed to decode trailing bytes {:?}, returning the {} messages already decoded: {}",
                        hex::encode(remaining),
                        out.len(),
                        e
                    );
                    break;
                }
            }
        }
        Ok(out)
    }

    /// Human readable summary of one validated message type.
    pub fn info(&self, dccl_id: u16) -> Option<String> {
        let desc = self.registry.get(dccl_id)?;
        let codecs = self.registry.codecs();
        let mut out = format!(
            "{} {{ id: {}, body: {}..{} bits }}\n",
            desc.name,
            desc.dccl_id,
            message_min_size(desc, codecs).ok()?,
            message_max_size(desc, codecs).ok()?,
        );
        for field in &desc.fields {
            let codec = codecs.find(field).ok()?;
            out.push_str(&format!(
                "  {}: {}..{} bits\n",
                field.name,
                codec.min_size(field, codecs).ok()?,
                codec.max_size(field, codecs).ok()?,
            ));
        }
        Some(out)
    }

    /// Summaries of every validated message type.
    pub fn info_all(&self) -> String {
        let mut ids: Vec<u16> = self.registry.descriptors().map(|d| d.dccl_id).collect();
        ids.sort_unstable();
        ids.iter().filter_map(|id| self.info(*id)).collect()
    }

    /// Run registered extension hooks over a message. See
    /// [`Registry::register_hook`].
    pub fn run_hooks(&self, msg: &MessageValue) {
        self.registry.run_hooks(msg)
    }

    fn checked_descriptor<'a>(&self, msg: &'a MessageValue) -> Result<&'a Arc<MessageDescriptor>> {
        let desc = msg.descriptor();
        match self.registry.get(desc.dccl_id) {
            Some(registered) if Arc::ptr_eq(registered, desc) => Ok(desc),
            _ => Err(DcclError::NotValidated(desc.name.clone())),
        }
    }
}
