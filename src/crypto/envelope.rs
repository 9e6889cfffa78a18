//! AES-256-GCM envelope for stored peer configurations.
//!
//! Ciphertexts are stored as three hex segments joined by `:` --
//! `nonce:tag:ciphertext` -- so a stored value can be eyeballed and parsed
//! unambiguously. The persistence layer may hand back binary columns as a
//! `\x`-prefixed hex blob; [`parse_envelope`] unwraps that transparently.

use std::path::Path;

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Key, Nonce};
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

/// AES-256-GCM with the 16-byte nonce the stored envelopes use.
type EnvelopeAead = AesGcm<Aes256, U16>;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid encryption key: {0}")]
    InvalidKey(&'static str),

    #[error("malformed ciphertext: {0}")]
    MalformedCiphertext(&'static str),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("failed to read key file: {0}")]
    KeyFileError(String),
}

/// Symmetric cipher for peer configuration payloads.
pub struct ConfigCipher {
    key: [u8; KEY_LEN],
}

impl std::fmt::Debug for ConfigCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigCipher")
            .field("key", &"<redacted>")
            .finish()
    }
}

impl ConfigCipher {
    /// Create from a key string, either 64 hex characters or base64.
    ///
    /// Base64 is detected by the presence of `=`, `+` or `/`; anything else
    /// must be pure hex. The decoded key must be exactly 32 bytes.
    pub fn from_key_str(raw: &str) -> Result<Self, CryptoError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CryptoError::InvalidKey("key is empty"));
        }

        let mut bytes = if trimmed.contains(['=', '+', '/']) {
            base64::engine::general_purpose::STANDARD
                .decode(trimmed)
                .map_err(|_| CryptoError::InvalidKey("malformed base64"))?
        } else {
            hex::decode(trimmed).map_err(|_| CryptoError::InvalidKey("malformed hex"))?
        };

        if bytes.len() != KEY_LEN {
            bytes.zeroize();
            return Err(CryptoError::InvalidKey("key must decode to exactly 32 bytes"));
        }

        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&bytes);
        bytes.zeroize();

        Ok(Self { key })
    }

    /// Load the key from a file containing the hex or base64 string.
    pub fn from_file(key_path: &Path) -> Result<Self, CryptoError> {
        let content = std::fs::read_to_string(key_path)
            .map_err(|e| CryptoError::KeyFileError(e.to_string()))?;
        Self::from_key_str(&content)
    }

    /// Encrypt a configuration payload.
    ///
    /// A fresh random 16-byte nonce is drawn per call, so encrypting the
    /// same plaintext twice yields different envelopes.
    pub fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        let cipher = EnvelopeAead::new(Key::<EnvelopeAead>::from_slice(&self.key));

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        // The AEAD appends the tag to the ciphertext; the envelope stores
        // them as separate segments.
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        Ok(format!(
            "{}:{}:{}",
            hex::encode(nonce),
            hex::encode(tag),
            hex::encode(ciphertext)
        ))
    }

    /// Decrypt a stored envelope back to the configuration text.
    pub fn decrypt(&self, raw: &str) -> Result<String, CryptoError> {
        let (nonce, tag, ciphertext) = parse_envelope(raw)?;

        let cipher = EnvelopeAead::new(Key::<EnvelopeAead>::from_slice(&self.key));

        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);

        let plaintext = cipher
            .decrypt(Nonce::<U16>::from_slice(&nonce), sealed.as_ref())
            .map_err(|_| CryptoError::AuthenticationFailed)?;

        String::from_utf8(plaintext)
            .map_err(|_| CryptoError::MalformedCiphertext("payload is not valid UTF-8"))
    }
}

impl Drop for ConfigCipher {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Generate a new random 32-byte key, hex encoded.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    OsRng.fill_bytes(&mut key);
    hex::encode(key)
}

/// Split a stored envelope into `(nonce, tag, ciphertext)` bytes.
///
/// Two input formats: the plain `nonce:tag:ciphertext` hex form, and a
/// `\x`-prefixed hex blob whose decoded ASCII content is that same form.
pub fn parse_envelope(raw: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CryptoError> {
    let trimmed = raw.trim();

    if let Some(blob) = trimmed.strip_prefix("\\x") {
        let decoded = hex::decode(blob)
            .map_err(|_| CryptoError::MalformedCiphertext("invalid hex blob"))?;
        let inner = std::str::from_utf8(&decoded)
            .map_err(|_| CryptoError::MalformedCiphertext("hex blob is not ASCII"))?;
        return split_segments(inner);
    }

    split_segments(trimmed)
}

fn split_segments(envelope: &str) -> Result<(Vec<u8>, Vec<u8>, Vec<u8>), CryptoError> {
    let parts: Vec<&str> = envelope.split(':').collect();
    if parts.len() != 3 {
        return Err(CryptoError::MalformedCiphertext(
            "expected three colon-separated segments",
        ));
    }

    let nonce =
        hex::decode(parts[0]).map_err(|_| CryptoError::MalformedCiphertext("invalid nonce hex"))?;
    let tag =
        hex::decode(parts[1]).map_err(|_| CryptoError::MalformedCiphertext("invalid tag hex"))?;
    let ciphertext = hex::decode(parts[2])
        .map_err(|_| CryptoError::MalformedCiphertext("invalid ciphertext hex"))?;

    if nonce.len() != NONCE_LEN {
        return Err(CryptoError::MalformedCiphertext("nonce must be 16 bytes"));
    }
    if tag.len() != TAG_LEN {
        return Err(CryptoError::MalformedCiphertext("tag must be 16 bytes"));
    }

    Ok((nonce, tag, ciphertext))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_HEX: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn cipher() -> ConfigCipher {
        ConfigCipher::from_key_str(KEY_HEX).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let c = cipher();
        let plaintext = "[Interface]\nAddress = 10.8.0.2/24\nPrivateKey = abc\n";
        let envelope = c.encrypt(plaintext).unwrap();
        assert_eq!(c.decrypt(&envelope).unwrap(), plaintext);
    }

    #[test]
    fn test_nonce_randomization() {
        let c = cipher();
        let a = c.encrypt("same input").unwrap();
        let b = c.encrypt("same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_base64_key_round_trip() {
        let key_bytes: Vec<u8> = (0u8..32).collect();
        let key_b64 = base64::engine::general_purpose::STANDARD.encode(&key_bytes);
        assert!(key_b64.contains('='));

        let c = ConfigCipher::from_key_str(&key_b64).unwrap();
        let envelope = c.encrypt("payload").unwrap();
        assert_eq!(c.decrypt(&envelope).unwrap(), "payload");

        // Same key given as hex decrypts the same envelope.
        let c2 = ConfigCipher::from_key_str(KEY_HEX).unwrap();
        assert_eq!(c2.decrypt(&envelope).unwrap(), "payload");
    }

    #[test]
    fn test_key_validation() {
        assert_eq!(
            ConfigCipher::from_key_str("").unwrap_err(),
            CryptoError::InvalidKey("key is empty")
        );
        assert_eq!(
            ConfigCipher::from_key_str("   ").unwrap_err(),
            CryptoError::InvalidKey("key is empty")
        );
        // 16 bytes of hex, not 32
        assert!(matches!(
            ConfigCipher::from_key_str("00112233445566778899aabbccddeeff").unwrap_err(),
            CryptoError::InvalidKey(_)
        ));
        // odd-length hex
        assert!(matches!(
            ConfigCipher::from_key_str("abc").unwrap_err(),
            CryptoError::InvalidKey(_)
        ));
        // base64 of the wrong length
        assert!(matches!(
            ConfigCipher::from_key_str("c2hvcnQ=").unwrap_err(),
            CryptoError::InvalidKey(_)
        ));
    }

    #[test]
    fn test_tampered_tag_fails_auth() {
        let c = cipher();
        let envelope = c.encrypt("sensitive config").unwrap();

        let mut parts: Vec<String> = envelope.split(':').map(String::from).collect();
        let mut tag = hex::decode(&parts[1]).unwrap();
        tag[0] ^= 0x01;
        parts[1] = hex::encode(tag);

        let tampered = parts.join(":");
        assert_eq!(c.decrypt(&tampered).unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_tampered_ciphertext_fails_auth() {
        let c = cipher();
        let envelope = c.encrypt("sensitive config").unwrap();

        let mut parts: Vec<String> = envelope.split(':').map(String::from).collect();
        let mut body = hex::decode(&parts[2]).unwrap();
        body[0] ^= 0xff;
        parts[2] = hex::encode(body);

        let tampered = parts.join(":");
        assert_eq!(c.decrypt(&tampered).unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_wrong_key_fails_auth() {
        let envelope = cipher().encrypt("payload").unwrap();

        let other = ConfigCipher::from_key_str(
            "ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
        )
        .unwrap();
        assert_eq!(other.decrypt(&envelope).unwrap_err(), CryptoError::AuthenticationFailed);
    }

    #[test]
    fn test_malformed_envelope() {
        let c = cipher();
        assert!(matches!(
            c.decrypt("deadbeef").unwrap_err(),
            CryptoError::MalformedCiphertext(_)
        ));
        assert!(matches!(
            c.decrypt("aa:bb").unwrap_err(),
            CryptoError::MalformedCiphertext(_)
        ));
        assert!(matches!(
            c.decrypt("aa:bb:cc:dd").unwrap_err(),
            CryptoError::MalformedCiphertext(_)
        ));
        // nonce segment too short
        assert!(matches!(
            c.decrypt("aabb:00112233445566778899aabbccddeeff:cc").unwrap_err(),
            CryptoError::MalformedCiphertext(_)
        ));
        // non-hex garbage
        assert!(matches!(
            c.decrypt("zz:yy:xx").unwrap_err(),
            CryptoError::MalformedCiphertext(_)
        ));
    }

    #[test]
    fn test_hex_blob_wrapper() {
        let c = cipher();
        let envelope = c.encrypt("wrapped payload").unwrap();

        let wrapped = format!("\\x{}", hex::encode(envelope.as_bytes()));
        assert_eq!(c.decrypt(&wrapped).unwrap(), "wrapped payload");
    }

    #[test]
    fn test_hex_blob_wrapper_invalid() {
        let c = cipher();
        assert!(matches!(
            c.decrypt("\\xnothex").unwrap_err(),
            CryptoError::MalformedCiphertext(_)
        ));
    }

    #[test]
    fn test_generate_key_is_usable() {
        let key = generate_key();
        assert_eq!(key.len(), 64);
        let c = ConfigCipher::from_key_str(&key).unwrap();
        assert_eq!(c.decrypt(&c.encrypt("x").unwrap()).unwrap(), "x");
    }
}
