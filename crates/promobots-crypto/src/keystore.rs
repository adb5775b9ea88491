//! Versioned key store.
//!
//! Maps integer key versions to encryptors and designates the version used
//! for new ciphertexts. Rotation is additive: operators introduce version
//! `v+1` and, unless a version is pinned, the store promotes itself to it.
//! Existing ciphertexts keep decrypting under the version recorded next to
//! them.

use std::collections::BTreeMap;
use std::sync::Arc;

use zeroize::Zeroizing;

use crate::cipher::{AesGcmEncryptor, Encryptor};
use crate::error::CryptoError;
use crate::keys::{self, KeyMaterial};

/// Immutable set of encryptors keyed by version.
#[derive(Clone)]
pub struct KeyStore {
    encryptors: BTreeMap<u32, Arc<dyn Encryptor>>,
    current: u32,
    current_encryptor: Arc<dyn Encryptor>,
}

impl std::fmt::Debug for KeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStore")
            .field("versions", &self.versions())
            .field("current", &self.current)
            .finish()
    }
}

impl KeyStore {
    /// Build a store from raw key material.
    ///
    /// `current_version` of `None` or `Some(0)` selects the highest version
    /// present. A pinned version that is not among the keys is rejected.
    pub fn new(
        current_version: Option<u32>,
        materials: impl IntoIterator<Item = KeyMaterial>,
    ) -> Result<Self, CryptoError> {
        let mut encryptors: BTreeMap<u32, Arc<dyn Encryptor>> = BTreeMap::new();
        for material in materials {
            let encryptor = AesGcmEncryptor::new(material.bytes())?;
            encryptors.insert(material.version(), Arc::new(encryptor));
        }
        Self::from_encryptors(current_version, encryptors)
    }

    /// Build a store from ready-made encryptors.
    pub fn from_encryptors(
        current_version: Option<u32>,
        encryptors: BTreeMap<u32, Arc<dyn Encryptor>>,
    ) -> Result<Self, CryptoError> {
        let Some(&max_version) = encryptors.keys().next_back() else {
            return Err(CryptoError::NoKeys);
        };

        let current = match current_version {
            None | Some(0) => max_version,
            Some(v) => v,
        };
        let current_encryptor = encryptors
            .get(&current)
            .cloned()
            .ok_or(CryptoError::UnknownKeyVersion(current))?;

        Ok(Self {
            encryptors,
            current,
            current_encryptor,
        })
    }

    /// Build a store from `PROMO_BOTS_TOKEN_ENCRYPTION_KEY[_V{N}]` variables.
    pub fn from_env(current_version: Option<u32>) -> Result<Self, CryptoError> {
        let materials = keys::load_key_material(std::env::vars())?;
        Self::new(current_version, materials)
    }

    /// Encryptor for a specific version (decrypt path).
    pub fn encryptor_for(&self, version: u32) -> Result<Arc<dyn Encryptor>, CryptoError> {
        self.encryptors
            .get(&version)
            .cloned()
            .ok_or(CryptoError::UnknownKeyVersion(version))
    }

    /// Current version and its encryptor (encrypt path).
    pub fn current(&self) -> (u32, Arc<dyn Encryptor>) {
        (self.current, Arc::clone(&self.current_encryptor))
    }

    pub const fn current_version(&self) -> u32 {
        self.current
    }

    /// All loaded versions in ascending order.
    pub fn versions(&self) -> Vec<u32> {
        self.encryptors.keys().copied().collect()
    }

    /// Encrypt with the current key, returning `(version, ciphertext)`.
    pub fn seal(&self, plaintext: &[u8]) -> Result<(u32, Vec<u8>), CryptoError> {
        let (version, encryptor) = self.current();
        Ok((version, encryptor.encrypt(plaintext)?))
    }

    /// Decrypt a ciphertext recorded under `version`.
    pub fn open(&self, version: u32, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        self.encryptor_for(version)?.decrypt(ciphertext)
    }
}
