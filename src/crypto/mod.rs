//! Cryptographic operations module.

pub mod envelope;

pub use envelope::{generate_key, parse_envelope, ConfigCipher, CryptoError};
