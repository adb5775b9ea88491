//! Key material and its environment loader.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use zeroize::Zeroizing;

use crate::error::CryptoError;

/// Prefix of the environment variables carrying key material.
pub const KEY_ENV_PREFIX: &str = "PROMO_BOTS_TOKEN_ENCRYPTION_KEY";

/// Raw symmetric key tagged with its version. Wiped on drop.
pub struct KeyMaterial {
    version: u32,
    bytes: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("version", &self.version)
            .field("len", &self.bytes.len())
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

impl KeyMaterial {
    pub fn new(version: u32, bytes: Vec<u8>) -> Self {
        Self {
            version,
            bytes: Zeroizing::new(bytes),
        }
    }

    pub const fn version(&self) -> u32 {
        self.version
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Collect key material from `(name, value)` pairs such as `std::env::vars()`.
///
/// `PROMO_BOTS_TOKEN_ENCRYPTION_KEY` is version 1 and
/// `PROMO_BOTS_TOKEN_ENCRYPTION_KEY_V{N}` is version `N` (`N > 0`). Values are
/// standard base64. Unrelated names are ignored. Results are sorted by
/// version; a later duplicate of a version replaces the earlier one.
pub fn load_key_material<I, K, V>(vars: I) -> Result<Vec<KeyMaterial>, CryptoError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut found = std::collections::BTreeMap::new();
    for (name, value) in vars {
        let Some(version) = parse_key_version(name.as_ref())? else {
            continue;
        };
        let bytes = STANDARD
            .decode(value.as_ref().trim())
            .map_err(|_| CryptoError::InvalidKeyEncoding { version })?;
        found.insert(version, KeyMaterial::new(version, bytes));
    }
    Ok(found.into_values().collect())
}

/// Version encoded in a key variable name, or `None` for unrelated names.
fn parse_key_version(name: &str) -> Result<Option<u32>, CryptoError> {
    let Some(rest) = name.strip_prefix(KEY_ENV_PREFIX) else {
        return Ok(None);
    };
    if rest.is_empty() {
        return Ok(Some(1));
    }
    let Some(digits) = rest.strip_prefix("_V") else {
        return Ok(None);
    };
    match digits.parse::<u32>() {
        Ok(v) if v > 0 => Ok(Some(v)),
        _ => Err(CryptoError::InvalidKeyName(name.to_string())),
    }
}
