//! AES-128-CBC/PKCS7 for at-rest secrets (§6): cloud connector credentials,
//! key-registry private material. IV is the first 16 bytes of the
//! process-wide encryption key, matching the original service's layout
//! byte-for-byte so existing encrypted blobs keep decrypting.

use aes::Aes128;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use thiserror::Error;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

const KEY_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption key must be at least {KEY_LEN} bytes, got {0}")]
    KeyTooShort(usize),

    #[error("ciphertext is shorter than the IV")]
    Truncated,

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("padding or block alignment error")]
    Padding,

    #[error("decrypted bytes are not valid UTF-8")]
    NotUtf8,
}

/// A process-wide symmetric key. The first 16 bytes double as both the AES
/// key and the IV.
#[derive(Clone)]
pub struct EncryptionKey([u8; KEY_LEN]);

impl EncryptionKey {
    pub fn from_str(raw: &str) -> Result<Self, CryptoError> {
        let bytes = raw.as_bytes();
        if bytes.len() < KEY_LEN {
            return Err(CryptoError::KeyTooShort(bytes.len()));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes[..KEY_LEN]);
        Ok(EncryptionKey(key))
    }
}

/// Encrypts `plaintext`, returning URL-safe-base64(IV ‖ AES-128-CBC(PKCS7(plaintext))).
pub fn encrypt_text(key: &EncryptionKey, plaintext: &str) -> String {
    let iv = key.0;
    let enc = Aes128CbcEnc::new(&key.0.into(), &iv.into());
    let ciphertext = enc.encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    let mut out = Vec::with_capacity(KEY_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    URL_SAFE_NO_PAD.encode(out)
}

/// Inverse of [`encrypt_text`].
pub fn decrypt_text(key: &EncryptionKey, encoded: &str) -> Result<String, CryptoError> {
    let raw = URL_SAFE_NO_PAD.decode(encoded)?;
    if raw.len() < KEY_LEN {
        return Err(CryptoError::Truncated);
    }
    let (iv, ciphertext) = raw.split_at(KEY_LEN);
    let mut buf = ciphertext.to_vec();
    let dec = Aes128CbcDec::new(&key.0.into(), iv.into());
    let plain = dec
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .map_err(|_| CryptoError::Padding)?;
    String::from_utf8(plain.to_vec()).map_err(|_| CryptoError::NotUtf8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_then_decrypt_is_identity() {
        let key = EncryptionKey::from_str("0123456789abcdef").unwrap();
        for text in ["", "hello world", "a very long plaintext indeed!!", "unicode: héllo"] {
            let enc = encrypt_text(&key, text);
            let dec = decrypt_text(&key, &enc).unwrap();
            assert_eq!(dec, text);
        }
    }

    #[test]
    fn short_key_is_rejected() {
        assert!(EncryptionKey::from_str("short").is_err());
    }

    #[test]
    fn only_first_16_bytes_of_a_longer_key_are_used() {
        let short = EncryptionKey::from_str("0123456789abcdef").unwrap();
        let long = EncryptionKey::from_str("0123456789abcdefEXTRA").unwrap();
        let enc = encrypt_text(&short, "payload");
        assert_eq!(decrypt_text(&long, &enc).unwrap(), "payload");
    }

    #[test]
    fn truncated_ciphertext_is_rejected() {
        let key = EncryptionKey::from_str("0123456789abcdef").unwrap();
        assert!(decrypt_text(&key, "short").is_err());
    }
}
