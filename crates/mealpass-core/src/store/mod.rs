//! Durable key/value persistence for opaque strings.
//!
//! Everything written here has already been sealed by the vault's codec, so
//! adapters only move strings around. Three adapters are provided:
//! - `KeychainStore`: OS keychain via the `keyring` crate
//! - `FileStore`: one file per key under a private directory
//! - `MemoryStore`: process-local map, used for tests and ephemeral sessions

pub mod file;
pub mod keychain;
pub mod memory;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileStore;
pub use keychain::KeychainStore;
pub use memory::MemoryStore;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Keychain error: {0}")]
    Keychain(#[from] keyring::Error),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Failed to encode value for storage: {0}")]
    Encode(String),
}

pub trait SecureStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a key that was never written succeeds.
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Keychain,
    File,
    Memory,
}

/// Open the configured backend. `dir` is only used by the file backend.
pub fn open(backend: StorageBackend, dir: PathBuf) -> Result<Arc<dyn SecureStore>, StoreError> {
    Ok(match backend {
        StorageBackend::Keychain => Arc::new(KeychainStore::new()),
        StorageBackend::File => Arc::new(FileStore::new(dir)?),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    })
}

/// Keys become file names and keychain account names, so keep them boring.
pub(crate) fn validate_key(key: &str) -> Result<(), StoreError> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("session.token").is_ok());
        assert!(validate_key("cache.pending_tickets-2").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("../escape").is_err());
        assert!(validate_key("with space").is_err());
    }

    #[test]
    fn test_storage_backend_serde() {
        let backend: StorageBackend = serde_json::from_str("\"file\"").unwrap();
        assert_eq!(backend, StorageBackend::File);
        assert_eq!(StorageBackend::default(), StorageBackend::Keychain);
    }
}
