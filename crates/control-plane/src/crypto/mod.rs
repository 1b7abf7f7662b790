//! Encryption of integration credentials at rest.

pub mod encryption;

pub use encryption::{CredentialCipher, CryptoError};
