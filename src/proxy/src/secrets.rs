//! Decryption of backend passwords stored encrypted in config files.
//!
//! Mirrors the on-disk key file format of a MaxScale-style secrets file: a
//! JSON document holding a 256-bit AES-CBC key, readable only by its owner.
//! An encrypted password value is `hex(iv) || hex(ciphertext)`: the first
//! 32 hex characters are a 16-byte IV, the rest is the ciphertext. A fresh
//! IV is drawn for every encryption, so encrypting the same plaintext
//! twice never produces the same value.

use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes256;
use rand::RngCore;
use serde::Deserialize;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

const CIPHER_NAME: &str = "EVP_aes_256_cbc";
const KEY_LEN: usize = 32;
const IV_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("secrets file {0} is not a regular file or has permissions other than owner-read (0400)")]
    BadPermissions(String),
    #[error("failed to read secrets file {0}: {1}")]
    Io(String, #[source] std::io::Error),
    #[error("failed to parse secrets file {0} as JSON: {1}")]
    Json(String, #[source] serde_json::Error),
    #[error("secrets file {0} has encryption_cipher {1:?}, expected {CIPHER_NAME:?}")]
    UnsupportedCipher(String, String),
    #[error("secrets file {0} has a {1}-hex-char encryption_key, expected {2}")]
    WrongKeyLength(String, usize, usize),
    #[error("encryption_key is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("encrypted value is too short to contain a {IV_LEN}-byte IV")]
    TooShort,
    #[error("AES-CBC decryption failed, key or ciphertext is corrupt")]
    DecryptFailed,
}

/// The JSON layout of a secrets file on disk.
#[derive(Debug, Deserialize)]
struct SecretsFile {
    #[allow(dead_code)]
    description: String,
    #[allow(dead_code)]
    maxscale_version: String,
    encryption_cipher: String,
    encryption_key: String,
}

/// A loaded 256-bit AES-CBC key, ready to encrypt or decrypt backend
/// passwords.
#[derive(Clone)]
pub struct EncryptionKey(Vec<u8>);

impl EncryptionKey {
    /// Loads and validates a secrets file. The file must be a regular file
    /// with mode `0400`: anything more permissive is rejected outright,
    /// since the key protects every backend password in the config.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SecretsError> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let metadata = fs::metadata(path).map_err(|e| SecretsError::Io(display.clone(), e))?;
        if !metadata.is_file() || metadata.permissions().mode() & 0o777 != 0o400 {
            return Err(SecretsError::BadPermissions(display));
        }

        let contents = fs::read_to_string(path).map_err(|e| SecretsError::Io(display.clone(), e))?;
        let parsed: SecretsFile =
            serde_json::from_str(&contents).map_err(|e| SecretsError::Json(display.clone(), e))?;

        if parsed.encryption_cipher != CIPHER_NAME {
            return Err(SecretsError::UnsupportedCipher(
                display,
                parsed.encryption_cipher,
            ));
        }

        let key = hex::decode(&parsed.encryption_key)?;
        if key.len() != KEY_LEN {
            return Err(SecretsError::WrongKeyLength(
                display,
                parsed.encryption_key.len(),
                KEY_LEN * 2,
            ));
        }

        Ok(Self(key))
    }

    /// Encrypts `plaintext` under a freshly generated IV, returning
    /// `hex(iv) || hex(ciphertext)`.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let ciphertext = Aes256CbcEnc::new(self.0.as_slice().into(), &iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

        let mut out = hex::encode(iv);
        out.push_str(&hex::encode(ciphertext));
        out
    }

    /// Decrypts a value produced by [`Self::encrypt`].
    pub fn decrypt(&self, input: &str) -> Result<String, SecretsError> {
        let iv_hex_len = IV_LEN * 2;
        if input.len() < iv_hex_len {
            return Err(SecretsError::TooShort);
        }
        let (iv_hex, ciphertext_hex) = input.split_at(iv_hex_len);
        let iv = hex::decode(iv_hex)?;
        let ciphertext = hex::decode(ciphertext_hex)?;

        let plaintext = Aes256CbcDec::new(self.0.as_slice().into(), iv.as_slice().into())
            .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
            .map_err(|_| SecretsError::DecryptFailed)?;

        String::from_utf8(plaintext).map_err(|_| SecretsError::DecryptFailed)
    }

    /// Decrypts `input` if it looks like a hex-encoded encrypted value,
    /// otherwise returns it unchanged. Config passwords may be stored in
    /// plaintext when no key file is configured, so callers that always
    /// have a key still need to tolerate plaintext values already present
    /// in a config.
    pub fn decrypt_or_passthrough(&self, input: &str) -> String {
        if input.len() >= IV_LEN * 2 && input.bytes().all(|b| b.is_ascii_hexdigit()) {
            self.decrypt(input).unwrap_or_else(|_| input.to_string())
        } else {
            input.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> EncryptionKey {
        EncryptionKey(vec![0x42u8; KEY_LEN])
    }

    #[test]
    fn round_trips_through_encrypt_and_decrypt() {
        let key = test_key();
        let encrypted = key.encrypt("s3kret-password");
        assert_eq!(key.decrypt(&encrypted).unwrap(), "s3kret-password");
    }

    #[test]
    fn draws_a_fresh_iv_every_time() {
        let key = test_key();
        let a = key.encrypt("same plaintext");
        let b = key.encrypt("same plaintext");
        assert_ne!(&a[..32], &b[..32]);
        assert_ne!(a, b);
    }

    #[test]
    fn passthrough_leaves_plaintext_looking_values_alone() {
        let key = test_key();
        assert_eq!(key.decrypt_or_passthrough("not-hex-at-all!"), "not-hex-at-all!");
    }

    #[test]
    fn rejects_wrong_cipher_name() {
        let json = serde_json::json!({
            "description": "x",
            "maxscale_version": "1.0",
            "encryption_cipher": "EVP_aes_128_cbc",
            "encryption_key": hex::encode([0u8; KEY_LEN]),
        });
        let parsed: SecretsFile = serde_json::from_value(json).unwrap();
        assert_ne!(parsed.encryption_cipher, CIPHER_NAME);
    }
}
