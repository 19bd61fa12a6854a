//! Symmetric codec for fields stored encrypted at rest.
//!
//! Uses AES-256-GCM with no associated data. Both the key and the nonce are
//! hex-encoded; ciphertexts are `hex(ciphertext || tag)` and carry no nonce
//! prefix, so the caller has to supply the same nonce on decryption.
//!
//! ```text
//! ENCRYPTION_KEY (64 hex chars) ─┐
//!                                ├─► AES-256-GCM ─► hex(ciphertext || tag)
//! session nonce (24 hex chars) ──┘
//! ```
//!
//! The nonce is issued once per user session and reused for every field that
//! user stores. That matches the existing on-disk format but means a single
//! (key, nonce) pair covers many plaintexts.

use aes_gcm::{
    aead::{Aead, AeadCore, OsRng},
    Aes256Gcm, KeyInit, Nonce,
};
use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;

/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

/// Stored values that mean "never set".
const UNSET_SENTINELS: [&str; 2] = ["", "null"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key length: got {got} bytes, want 32")]
    InvalidKeyLength { got: usize },

    #[error("encryption key is not valid hex")]
    MalformedKey,

    #[error("invalid nonce: {0}")]
    InvalidNonce(String),

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("decrypted value is not valid UTF-8")]
    InvalidUtf8,
}

/// AES-256-GCM codec bound to the process-wide key.
///
/// The key is validated on every call rather than at construction, so a
/// misconfigured key surfaces as `InvalidKeyLength` on the operation that
/// needed it. Call [`Cipher::validate`] at startup to fail fast instead.
pub struct Cipher {
    key_hex: SecretString,
}

impl Cipher {
    pub fn new(key_hex: SecretString) -> Self {
        Self { key_hex }
    }

    /// Generate a fresh hex-encoded nonce from the OS random source.
    pub fn new_nonce() -> String {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        hex::encode(nonce)
    }

    /// Generate a fresh hex-encoded 32-byte key.
    pub fn new_key() -> String {
        let key = Aes256Gcm::generate_key(&mut OsRng);
        hex::encode(key)
    }

    /// Check that the configured key decodes to exactly 32 bytes.
    pub fn validate(&self) -> Result<(), CryptoError> {
        self.cipher().map(|_| ())
    }

    pub fn encrypt(&self, plaintext: &str, nonce_hex: &str) -> Result<String, CryptoError> {
        let cipher = self.cipher()?;
        let nonce = decode_nonce(nonce_hex)?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(hex::encode(ciphertext))
    }

    /// Decrypt a stored field.
    ///
    /// `""` and `"null"` decrypt to `""` without touching the key. Anything
    /// that fails authentication, including non-hex input, is reported as
    /// `DecryptionFailed`.
    pub fn decrypt(&self, ciphertext_hex: &str, nonce_hex: &str) -> Result<String, CryptoError> {
        if UNSET_SENTINELS.contains(&ciphertext_hex) {
            return Ok(String::new());
        }

        let cipher = self.cipher()?;
        let nonce = decode_nonce(nonce_hex)?;
        let ciphertext = hex::decode(ciphertext_hex).map_err(|_| CryptoError::DecryptionFailed)?;

        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::InvalidUtf8)
    }

    /// Decrypt an optional field, mapping an absent value to `None`.
    pub fn decrypt_opt(
        &self,
        ciphertext_hex: Option<&str>,
        nonce_hex: &str,
    ) -> Result<Option<String>, CryptoError> {
        match ciphertext_hex {
            None => Ok(None),
            Some(value) => {
                let plaintext = self.decrypt(value, nonce_hex)?;
                Ok(Some(plaintext).filter(|p| !p.is_empty()))
            }
        }
    }

    fn cipher(&self) -> Result<Aes256Gcm, CryptoError> {
        let key =
            hex::decode(self.key_hex.expose_secret().trim()).map_err(|_| CryptoError::MalformedKey)?;
        if key.len() != KEY_SIZE {
            return Err(CryptoError::InvalidKeyLength { got: key.len() });
        }
        Aes256Gcm::new_from_slice(&key).map_err(|_| CryptoError::InvalidKeyLength { got: key.len() })
    }
}

fn decode_nonce(nonce_hex: &str) -> Result<Vec<u8>, CryptoError> {
    let nonce = hex::decode(nonce_hex)
        .map_err(|e| CryptoError::InvalidNonce(format!("not valid hex: {}", e)))?;
    if nonce.len() != NONCE_SIZE {
        return Err(CryptoError::InvalidNonce(format!(
            "got {} bytes, want {}",
            nonce.len(),
            NONCE_SIZE
        )));
    }
    Ok(nonce)
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher")
            .field("key_hex", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn test_cipher() -> Cipher {
        Cipher::new(SecretString::from(TEST_KEY.to_string()))
    }

    #[test]
    fn test_new_nonce_is_24_hex_chars() {
        let nonce = Cipher::new_nonce();
        assert_eq!(nonce.len(), 24);
        assert_eq!(hex::decode(&nonce).unwrap().len(), NONCE_SIZE);
    }

    #[test]
    fn test_new_nonce_differs_between_calls() {
        assert_ne!(Cipher::new_nonce(), Cipher::new_nonce());
    }

    #[test]
    fn test_new_key_is_valid() {
        let key = Cipher::new_key();
        assert_eq!(key.len(), 64);
        let cipher = Cipher::new(SecretString::from(key));
        assert!(cipher.validate().is_ok());
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let cipher = test_cipher();
        let nonce = Cipher::new_nonce();

        let encrypted = cipher.encrypt("hello world", &nonce).unwrap();
        assert_ne!(encrypted, "hello world");

        let decrypted = cipher.decrypt(&encrypted, &nonce).unwrap();
        assert_eq!(decrypted, "hello world");
    }

    #[test]
    fn test_ciphertext_is_plaintext_plus_tag() {
        let cipher = test_cipher();
        let nonce = Cipher::new_nonce();

        let encrypted = cipher.encrypt("abcd", &nonce).unwrap();
        // 4 bytes of ciphertext + 16-byte tag, hex-encoded
        assert_eq!(encrypted.len(), (4 + 16) * 2);
    }

    #[test]
    fn test_sentinels_decrypt_to_empty() {
        let cipher = test_cipher();
        assert_eq!(cipher.decrypt("", "not-even-a-nonce").unwrap(), "");
        assert_eq!(cipher.decrypt("null", "not-even-a-nonce").unwrap(), "");
    }

    #[test]
    fn test_sentinels_ignore_bad_key() {
        let cipher = Cipher::new(SecretString::from("abcd".to_string()));
        assert_eq!(cipher.decrypt("null", &Cipher::new_nonce()).unwrap(), "");
    }

    #[test]
    fn test_short_key_rejected() {
        let cipher = Cipher::new(SecretString::from("00112233".to_string()));
        let result = cipher.encrypt("data", &Cipher::new_nonce());
        assert_eq!(result, Err(CryptoError::InvalidKeyLength { got: 4 }));
    }

    #[test]
    fn test_non_hex_key_rejected() {
        let cipher = Cipher::new(SecretString::from("z".repeat(64)));
        assert_eq!(cipher.validate(), Err(CryptoError::MalformedKey));
    }

    #[test]
    fn test_wrong_nonce_length_rejected() {
        let cipher = test_cipher();
        let result = cipher.encrypt("data", "00112233");
        assert!(matches!(result, Err(CryptoError::InvalidNonce(_))));
    }

    #[test]
    fn test_non_hex_ciphertext_fails() {
        let cipher = test_cipher();
        let result = cipher.decrypt("nothexdata", &Cipher::new_nonce());
        assert_eq!(result, Err(CryptoError::DecryptionFailed));
    }

    #[test]
    fn test_decrypt_opt() {
        let cipher = test_cipher();
        let nonce = Cipher::new_nonce();
        let encrypted = cipher.encrypt("/root/.ssh/id_ed25519", &nonce).unwrap();

        assert_eq!(cipher.decrypt_opt(None, &nonce).unwrap(), None);
        assert_eq!(cipher.decrypt_opt(Some(""), &nonce).unwrap(), None);
        assert_eq!(
            cipher.decrypt_opt(Some(&encrypted), &nonce).unwrap().as_deref(),
            Some("/root/.ssh/id_ed25519")
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", test_cipher());
        assert!(!debug.contains(TEST_KEY));
        assert!(debug.contains("REDACTED"));
    }
}
