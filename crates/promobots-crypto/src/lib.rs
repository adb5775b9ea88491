//! Promobots token encryption.
//!
//! Bot credentials are stored as envelope ciphertexts: each blob is sealed by
//! one versioned key and the version is persisted next to it.
//!
//! ## Primitives
//!
//! - **Encryptor**: AES-GCM (128/192/256 by key length), random 12-byte nonce,
//!   output `nonce || sealed`, empty associated data
//! - **`KeyStore`**: version → encryptor map with a designated current version

pub mod cipher;
pub mod error;
pub mod keys;
pub mod keystore;

pub use cipher::{AesGcmEncryptor, Encryptor, NONCE_SIZE, TAG_SIZE};
pub use error::CryptoError;
pub use keys::{KEY_ENV_PREFIX, KeyMaterial, load_key_material};
pub use keystore::KeyStore;
