//! Sealed persistence of the session credential and the cached profile.
//!
//! The vault is the only writer of the session token. Reads never fail:
//! storage errors and undecryptable entries are logged and read as absent,
//! so a corrupt cache degrades to signed-out instead of crashing the app.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::crypto::{BlobCodec, Decoded};
use crate::models::{Credential, UserProfile};
use crate::store::{SecureStore, StoreError};

pub const TOKEN_KEY: &str = "session.token";
pub const PROFILE_KEY: &str = "session.profile";

/// Prefix for entries owned by collaborating subsystems (pending tickets, ...)
const CACHE_PREFIX: &str = "cache.";

/// What a read actually found, before it is collapsed to `Option`.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultRead<T> {
    Found(T),
    Absent,
    CorruptIgnored,
}

impl<T> VaultRead<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            VaultRead::Found(value) => Some(value),
            VaultRead::Absent | VaultRead::CorruptIgnored => None,
        }
    }
}

pub struct CredentialVault {
    store: Arc<dyn SecureStore>,
    codec: BlobCodec,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn SecureStore>, codec: BlobCodec) -> Self {
        Self { store, codec }
    }

    fn read<T: DeserializeOwned>(&self, key: &str) -> VaultRead<T> {
        let blob = match self.store.get(key) {
            Ok(Some(blob)) => blob,
            Ok(None) => return VaultRead::Absent,
            Err(e) => {
                warn!(key, error = %e, "Storage read failed, treating entry as absent");
                return VaultRead::Absent;
            }
        };

        match self.codec.decode(&blob) {
            Decoded::Sealed(value) => VaultRead::Found(value),
            Decoded::Plaintext(value) => {
                debug!(key, "Read unsealed legacy entry");
                VaultRead::Found(value)
            }
            Decoded::Empty => VaultRead::Absent,
            Decoded::Corrupt => {
                warn!(key, "Ignoring entry that could not be decrypted");
                VaultRead::CorruptIgnored
            }
        }
    }

    fn write<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        let blob = self.codec.encrypt(value);
        if blob.is_empty() {
            return Err(StoreError::Encode(key.to_string()));
        }
        self.store.set(key, &blob)
    }

    // ===== Credential =====

    pub fn store_token(&self, credential: &Credential) -> Result<(), StoreError> {
        self.write(TOKEN_KEY, credential)
    }

    pub fn read_token(&self) -> VaultRead<Credential> {
        self.read(TOKEN_KEY)
    }

    pub fn get_token(&self) -> Option<Credential> {
        self.read_token().into_option()
    }

    // ===== Profile =====

    pub fn store_profile(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.write(PROFILE_KEY, profile)
    }

    pub fn read_profile(&self) -> VaultRead<UserProfile> {
        self.read(PROFILE_KEY)
    }

    pub fn get_profile(&self) -> Option<UserProfile> {
        self.read_profile().into_option()
    }

    // ===== Pair =====

    /// Write credential and profile together. If the profile write fails the
    /// credential is rolled back so no half session is left behind.
    pub fn store_session(
        &self,
        credential: &Credential,
        profile: &UserProfile,
    ) -> Result<(), StoreError> {
        self.store_token(credential)?;
        if let Err(e) = self.store_profile(profile) {
            if let Err(rollback) = self.store.remove(TOKEN_KEY) {
                warn!(error = %rollback, "Failed to roll back token after profile write failure");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Both halves of the session, or nothing.
    pub fn load_session(&self) -> Option<(Credential, UserProfile)> {
        let credential = self.get_token()?;
        let profile = self.get_profile()?;
        Some((credential, profile))
    }

    /// Remove token and profile. Both deletes are attempted even if the first
    /// fails; removing entries that were never written is not an error.
    pub fn clear(&self) -> Result<(), StoreError> {
        let token = self.store.remove(TOKEN_KEY);
        let profile = self.store.remove(PROFILE_KEY);
        debug!(
            token_ok = token.is_ok(),
            profile_ok = profile.is_ok(),
            "Cleared session entries"
        );
        token.and(profile)
    }

    // ===== Collaborator cache entries =====

    pub fn store_cached<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<(), StoreError> {
        self.write(&format!("{}{}", CACHE_PREFIX, key), value)
    }

    pub fn load_cached<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.read(&format!("{}{}", CACHE_PREFIX, key)).into_option()
    }

    pub fn remove_cached(&self, key: &str) -> Result<(), StoreError> {
        self.store.remove(&format!("{}{}", CACHE_PREFIX, key))
    }

    // ===== Migration =====

    /// Re-seal session entries that were written before sealing existed.
    /// Returns how many entries were rewritten.
    pub fn migrate_plaintext(&self) -> usize {
        let mut migrated = 0;
        for key in [TOKEN_KEY, PROFILE_KEY] {
            let raw = match self.store.get(key) {
                Ok(Some(raw)) if !raw.is_empty() => raw,
                Ok(_) => continue,
                Err(e) => {
                    warn!(key, error = %e, "Storage read failed during migration");
                    continue;
                }
            };
            if BlobCodec::looks_encrypted(&raw) {
                continue;
            }
            let value: Value = match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(_) => {
                    warn!(key, "Entry is neither sealed nor JSON, leaving it alone");
                    continue;
                }
            };
            match self.write(key, &value) {
                Ok(()) => {
                    info!(key, "Sealed legacy plaintext entry");
                    migrated += 1;
                }
                Err(e) => warn!(key, error = %e, "Failed to seal legacy entry"),
            }
        }
        migrated
    }
}

// ============================================================================
// Tests
// ============================================================================
