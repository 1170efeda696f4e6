//! Record cipher for courier transfers.
//!
//! Every record is AES-256-CBC with PKCS#7 padding under the one
//! pre-provisioned key, with a fresh random IV per record. Wire format of an
//! encrypted record payload:
//!
//! ```text
//! [iv_len: u16 big-endian][iv][ciphertext]
//! ```
//!
//! Two encryptions of the same plaintext therefore never produce the same
//! payload. Decryption rejects truncated payloads, foreign IV lengths and
//! bad padding; callers treat any of those as a fatal protocol error for the
//! record in question.

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use thiserror::Error;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 16;
pub const BLOCK_SIZE: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("encrypted record too short")]
    Truncated,
    #[error("record IV length {0} is not the cipher block size")]
    BadIvLength(usize),
    #[error("ciphertext padding invalid")]
    Padding,
}

/// Per-process cipher context for the shared transfer key.
#[derive(Clone)]
pub struct RecordCipher {
    key: [u8; KEY_SIZE],
}

impl RecordCipher {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        RecordCipher { key }
    }

    /// Encrypt one record. Returns `[iv_len:u16 BE][iv][ciphertext]`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext =
            Aes256CbcEnc::new(&self.key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(2 + IV_SIZE + ciphertext.len());
        out.extend_from_slice(&(IV_SIZE as u16).to_be_bytes());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt one record payload produced by [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, payload: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if payload.len() < 2 {
            return Err(CryptoError::Truncated);
        }
        let iv_len = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        if iv_len != IV_SIZE {
            return Err(CryptoError::BadIvLength(iv_len));
        }
        if payload.len() < 2 + iv_len {
            return Err(CryptoError::Truncated);
        }

        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&payload[2..2 + IV_SIZE]);
        let ciphertext = &payload[2 + IV_SIZE..];

        if ciphertext.is_empty() {
            return Err(CryptoError::Truncated);
        }
        if ciphertext.len() % BLOCK_SIZE != 0 {
            return Err(CryptoError::Padding);
        }

        Aes256CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Padding)
    }
}
