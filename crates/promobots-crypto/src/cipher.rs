//! AES-GCM token encryption.
//!
//! Ciphertexts are self-framed: a fresh random 12-byte nonce followed by the
//! sealed bytes (ciphertext plus 16-byte tag). No associated data is used.

use aes_gcm::aead::consts::U12;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm, AesGcm, Nonce};
use rand::RngCore;
use rand::rngs::OsRng;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Nonce size for AES-GCM.
pub const NONCE_SIZE: usize = 12;

/// Authentication tag appended by AES-GCM.
pub const TAG_SIZE: usize = 16;

type Aes192Gcm = AesGcm<aes_gcm::aes::Aes192, U12>;

/// Symmetric encryptor bound to a single key.
///
/// Implementations are stateless after construction and safe to share
/// across tasks.
pub trait Encryptor: Send + Sync {
    /// Seal `plaintext`, returning `nonce || sealed`.
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// Open a blob produced by [`Encryptor::encrypt`] under the same key.
    ///
    /// The returned buffer is wiped when dropped.
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

enum Cipher {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
}

/// AES-GCM encryptor; the key length picks AES-128, AES-192 or AES-256.
pub struct AesGcmEncryptor {
    cipher: Cipher,
}

impl std::fmt::Debug for AesGcmEncryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self.cipher {
            Cipher::Aes128(_) => 128,
            Cipher::Aes192(_) => 192,
            Cipher::Aes256(_) => 256,
        };
        f.debug_struct("AesGcmEncryptor")
            .field("bits", &bits)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl AesGcmEncryptor {
    /// Build an encryptor from raw key bytes (16, 24 or 32 bytes).
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeySize { actual: key.len() };
        let cipher = match key.len() {
            16 => Cipher::Aes128(Aes128Gcm::new_from_slice(key).map_err(invalid)?),
            24 => Cipher::Aes192(Aes192Gcm::new_from_slice(key).map_err(invalid)?),
            32 => Cipher::Aes256(Aes256Gcm::new_from_slice(key).map_err(invalid)?),
            actual => return Err(CryptoError::InvalidKeySize { actual }),
        };
        Ok(Self { cipher })
    }
}

impl Encryptor for AesGcmEncryptor {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let sealed = match &self.cipher {
            Cipher::Aes128(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes192(c) => c.encrypt(nonce, plaintext),
            Cipher::Aes256(c) => c.encrypt(nonce, plaintext),
        }
        .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce_bytes, sealed) = ciphertext.split_at(NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);

        match &self.cipher {
            Cipher::Aes128(c) => c.decrypt(nonce, sealed),
            Cipher::Aes192(c) => c.decrypt(nonce, sealed),
            Cipher::Aes256(c) => c.decrypt(nonce, sealed),
        }
        .map(Zeroizing::new)
        .map_err(|_| CryptoError::DecryptionFailed)
    }
}
