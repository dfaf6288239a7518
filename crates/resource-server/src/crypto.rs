//! Payload encryption for SSL-negotiated sessions.
//!
//! Frames are sealed with AES-256-CBC and PKCS#7 padding. The key is the
//! control connection's shared secret; the IV is the first 16 bytes of the
//! `key_size`-byte IV carried in each encryption header.

use aes::Aes256;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use irods_protocol::{EncryptionAlgorithm, EncryptionContext};
use rand::RngCore;

use crate::error::ResourceServerError;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const KEY_LEN: usize = 32;
const BLOCK_LEN: usize = 16;

/// Encrypts and decrypts frame payloads for one session.
#[derive(Clone)]
pub struct FrameCipher {
    key: [u8; KEY_LEN],
    iv_len: usize,
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher")
            .field("iv_len", &self.iv_len)
            .finish_non_exhaustive()
    }
}

impl FrameCipher {
    pub fn new(ctx: &EncryptionContext) -> Result<Self, ResourceServerError> {
        if ctx.algorithm != EncryptionAlgorithm::Aes256Cbc {
            return Err(ResourceServerError::Unsupported(format!(
                "frame encryption with {}",
                ctx.algorithm.as_str()
            )));
        }
        if ctx.shared_secret.len() != KEY_LEN {
            return Err(ResourceServerError::Encryption(format!(
                "shared secret must be {KEY_LEN} bytes, got {}",
                ctx.shared_secret.len()
            )));
        }
        if ctx.key_size < BLOCK_LEN {
            return Err(ResourceServerError::Encryption(format!(
                "key size {} is shorter than the cipher block",
                ctx.key_size
            )));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&ctx.shared_secret);
        Ok(Self {
            key,
            iv_len: ctx.key_size,
        })
    }

    /// Length of the IV carried in every encryption header.
    pub fn iv_len(&self) -> usize {
        self.iv_len
    }

    pub fn generate_iv(&self) -> Vec<u8> {
        let mut iv = vec![0u8; self.iv_len];
        rand::thread_rng().fill_bytes(&mut iv);
        iv
    }

    pub fn encrypt(&self, iv: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, ResourceServerError> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, self.block_iv(iv)?)
            .map_err(|e| ResourceServerError::Encryption(e.to_string()))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    pub fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, ResourceServerError> {
        let cipher = Aes256CbcDec::new_from_slices(&self.key, self.block_iv(iv)?)
            .map_err(|e| ResourceServerError::Encryption(e.to_string()))?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| ResourceServerError::Encryption("bad padding in decrypted frame".into()))
    }

    fn block_iv<'a>(&self, iv: &'a [u8]) -> Result<&'a [u8], ResourceServerError> {
        iv.get(..BLOCK_LEN).ok_or_else(|| {
            ResourceServerError::Encryption(format!("IV of {} bytes is too short", iv.len()))
        })
    }
}
