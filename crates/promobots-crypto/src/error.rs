//! Crypto error types.

/// Errors from key handling and token encryption.
///
/// None of the variants carry plaintext, ciphertext or key bytes.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Invalid key size: expected 16, 24 or 32 bytes, got {actual}")]
    InvalidKeySize { actual: usize },

    #[error("Unknown key version: {0}")]
    UnknownKeyVersion(u32),

    #[error("No key material configured")]
    NoKeys,

    #[error("Key material for version {version} is not valid base64")]
    InvalidKeyEncoding { version: u32 },

    #[error("Invalid key variable name: {0}")]
    InvalidKeyName(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Short input and authentication failure are reported identically.
    #[error("Decryption failed")]
    DecryptionFailed,
}
