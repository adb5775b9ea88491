//! File-backed registry of broadcast definitions.
//!
//! The document on disk is `{"broadcasts": [...]}`. The in-memory list sits
//! behind a readers-writer lock. Every write to disk happens under the write
//! half, so `save`, `add` and `delete` are serialized and never share the
//! temp file. `add` and `delete` reload the document first so entries written
//! by another process survive.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use promobots_core::db::unix_timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::targeting::Targeting;
use crate::platform::InlineKeyboard;

#[cfg(unix)]
const DIR_MODE: u32 = 0o755;
#[cfg(unix)]
const FILE_MODE: u32 = 0o644;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Failed to load broadcast registry {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Failed to save broadcast registry {path}: {reason}")]
    Save { path: PathBuf, reason: String },

    #[error("Broadcast '{0}' already exists")]
    AlreadyExists(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastDefinition {
    pub id: String,
    pub name: String,
    /// Path of the file whose contents become the message text.
    pub template_file: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub photos: Vec<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline_keyboard: Option<InlineKeyboard>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub targeting: Option<Targeting>,
    /// Unix seconds; stamped by [`BroadcastRegistry::add`] when zero.
    #[serde(default)]
    pub created_at: i64,
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryDocument {
    #[serde(default)]
    broadcasts: Vec<BroadcastDefinition>,
}

pub struct BroadcastRegistry {
    path: PathBuf,
    broadcasts: RwLock<Vec<BroadcastDefinition>>,
}

impl BroadcastRegistry {
    /// An empty registry bound to `path`. Nothing is read until [`load`](Self::load).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            broadcasts: RwLock::new(Vec::new()),
        }
    }

    /// Bind to `path` and load whatever is already there.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let registry = Self::new(path);
        registry.load().await?;
        Ok(registry)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the in-memory list with the document on disk. A missing file is an empty registry.
    pub async fn load(&self) -> Result<(), RegistryError> {
        let mut guard = self.broadcasts.write().await;
        *guard = read_document(&self.path).await?;
        info!(path = %self.path.display(), count = guard.len(), "Broadcast registry loaded");
        Ok(())
    }

    pub async fn save(&self) -> Result<(), RegistryError> {
        let guard = self.broadcasts.write().await;
        write_document(&self.path, &guard).await
    }

    /// Add a definition, failing if its id is already taken.
    ///
    /// Reloads from disk first so definitions written by another process are
    /// not overwritten.
    pub async fn add(
        &self,
        mut definition: BroadcastDefinition,
    ) -> Result<BroadcastDefinition, RegistryError> {
        let mut guard = self.broadcasts.write().await;
        let mut broadcasts = read_document(&self.path).await?;
        if broadcasts.iter().any(|b| b.id == definition.id) {
            return Err(RegistryError::AlreadyExists(definition.id));
        }
        if definition.created_at == 0 {
            definition.created_at = unix_timestamp();
        }
        broadcasts.push(definition.clone());
        write_document(&self.path, &broadcasts).await?;
        *guard = broadcasts;

        info!(broadcast_id = %definition.id, "Broadcast added");
        Ok(definition)
    }

    pub async fn get(&self, id: &str) -> Option<BroadcastDefinition> {
        self.broadcasts
            .read()
            .await
            .iter()
            .find(|b| b.id == id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<BroadcastDefinition> {
        self.broadcasts.read().await.clone()
    }

    /// Remove a definition and persist. Returns `false` if no such id existed.
    pub async fn delete(&self, id: &str) -> Result<bool, RegistryError> {
        let mut guard = self.broadcasts.write().await;
        let mut remaining = read_document(&self.path).await?;
        let Some(index) = remaining.iter().position(|b| b.id == id) else {
            debug!(broadcast_id = %id, "Delete of unknown broadcast");
            *guard = remaining;
            return Ok(false);
        };
        remaining.remove(index);
        write_document(&self.path, &remaining).await?;
        *guard = remaining;

        info!(broadcast_id = %id, "Broadcast deleted");
        Ok(true)
    }
}

async fn read_document(path: &Path) -> Result<Vec<BroadcastDefinition>, RegistryError> {
    let load_err = |reason: String| RegistryError::Load {
        path: path.to_path_buf(),
        reason,
    };

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(load_err(e.to_string())),
    };
    let document: RegistryDocument =
        serde_json::from_slice(&bytes).map_err(|e| load_err(e.to_string()))?;
    Ok(document.broadcasts)
}

/// Write to a sibling temp file and rename over the target.
async fn write_document(path: &Path, broadcasts: &[BroadcastDefinition]) -> Result<(), RegistryError> {
    let save_err = |reason: String| RegistryError::Save {
        path: path.to_path_buf(),
        reason,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| save_err(e.to_string()))?;
        #[cfg(unix)]
        set_mode(parent, DIR_MODE)
            .await
            .map_err(|e| save_err(e.to_string()))?;
    }

    let document = RegistryDocument {
        broadcasts: broadcasts.to_vec(),
    };
    let json = serde_json::to_vec_pretty(&document).map_err(|e| save_err(e.to_string()))?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| save_err(e.to_string()))?;
    #[cfg(unix)]
    set_mode(&tmp, FILE_MODE)
        .await
        .map_err(|e| save_err(e.to_string()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| save_err(e.to_string()))?;

    debug!(path = %path.display(), count = broadcasts.len(), "Broadcast registry saved");
    Ok(())
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}
