use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use sha2::{Digest, Sha256};

use super::{DcclError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES-256-CBC envelope for the message body.
///
/// The key is the SHA-256 hash of a user passphrase. The IV is derived from
/// the encoded id bytes, which travel in the clear ahead of the body so that
/// [`crate::dccl::DcclCodec::id_from_encoded`] works without the key.
pub struct Crypto {
    key: [u8; 32],
}

impl Crypto {
    pub fn new(passphrase: &str) -> Crypto {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        Crypto {
            key: hasher.finalize().into(),
        }
    }

    fn iv(id_bytes: &[u8]) -> [u8; 16] {
        let mut hasher = Sha256::new();
        hasher.update(id_bytes);
        let digest = hasher.finalize();
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&digest[..16]);
        iv
    }

    pub fn encrypt(&self, body: &[u8], id_bytes: &[u8]) -> Vec<u8> {
        let iv = Self::iv(id_bytes);
        Aes256CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(body)
    }

    pub fn decrypt(&self, body: &[u8], id_bytes: &[u8]) -> Result<Vec<u8>> {
        let iv = Self::iv(id_bytes);
        Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| DcclError::BadCrypto)
    }
}
