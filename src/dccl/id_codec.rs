use super::{DcclError, Result};

/// Encodes the dccl id that leads every message on the wire.
///
/// The id codec must be self-terminating: [`IdCodec::decode`] reads only its
/// own bytes and reports how many it consumed, so the id of an encoded
/// message can always be recovered without a crypto key.
pub trait IdCodec {
    fn encode(&self, id: u16, buf: &mut Vec<u8>) -> Result<()>;

    /// Returns `(id, bytes consumed)`.
    fn decode(&self, bytes: &[u8]) -> Result<(u16, usize)>;

    fn size(&self, id: u16) -> usize;

    fn max_size(&self) -> usize;

    /// Called at validation time; rejects ids this codec cannot represent.
    fn validate(&self, id: u16) -> Result<()>;
}

/// Default variable id codec: one byte for ids 0-127, two bytes for ids
/// 128-32767 with the top bit of the first byte as continuation flag.
pub struct DefaultIdCodec;

impl IdCodec for DefaultIdCodec {
    fn encode(&self, id: u16, buf: &mut Vec<u8>) -> Result<()> {
        self.validate(id)?;
        if id < 0x80 {
            buf.push(id as u8);
        } else {
            buf.push(0x80 | (id >> 8) as u8);
            buf.push((id & 0xff) as u8);
        }
        Ok(())
    }

    fn decode(&self, bytes: &[u8]) -> Result<(u16, usize)> {
        match bytes {
            [] => Err(DcclError::Malformed("empty encoded message".to_string())),
            [b0, ..] if b0 & 0x80 == 0 => Ok((*b0 as u16, 1)),
            [b0, b1, ..] => Ok((((*b0 as u16 & 0x7f) << 8) | *b1 as u16, 2)),
            _ => Err(DcclError::Malformed(
                "truncated two-byte dccl id".to_string(),
            )),
        }
    }

    fn size(&self, id: u16) -> usize {
        if id < 0x80 {
            1
        } else {
            2
        }
    }

    fn max_size(&self) -> usize {
        2
    }

    fn validate(&self, id: u16) -> Result<()> {
        if id > 0x7fff {
            return Err(DcclError::InvalidSchema(format!(
                "dccl id {} does not fit the default id codec (max 32767)",
                id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::one(1, &[0x01])]
    #[case::small(127, &[0x7f])]
    #[case::two_byte_low(128, &[0x80, 0x80])]
    #[case::two_byte(4660, &[0x92, 0x34])]
    #[case::two_byte_max(32767, &[0xff, 0xff])]
    fn test_encode_decode(#[case] id: u16, #[case] expected: &[u8]) {
        let codec = DefaultIdCodec;
        let mut buf = Vec::new();
        codec.encode(id, &mut buf).unwrap();
        assert_eq!(&buf, expected);
        assert_eq!(codec.size(id), expected.len());
        assert_eq!(codec.decode(&buf).unwrap(), (id, expected.len()));
    }

    #[test]
    fn test_decode_ignores_trailing_body() {
        let codec = DefaultIdCodec;
        assert_eq!(codec.decode(&[0x05, 0xaa, 0xbb]).unwrap(), (5, 1));
    }

    #[test]
    fn test_decode_empty_fails() {
        assert!(DefaultIdCodec.decode(&[]).is_err());
    }

    #[test]
    fn test_decode_truncated_two_byte_fails() {
        assert!(DefaultIdCodec.decode(&[0x80]).is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_id() {
        assert!(DefaultIdCodec.validate(0x8000).is_err());
        assert!(DefaultIdCodec.validate(0x7fff).is_ok());
    }
}
