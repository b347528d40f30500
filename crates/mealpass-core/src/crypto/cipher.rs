use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use thiserror::Error;

/// XChaCha20-Poly1305 key size (256 bits)
pub const KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size (192 bits), random per message
pub const NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const TAG_SIZE: usize = 16;

/// Secret compiled into the client. Swap the key source (platform keystore)
/// by constructing `ChaChaCipher::from_key` instead.
pub const DEFAULT_SHARED_SECRET: &str = "mealpass-client-storage-secret-v1";

/// Fixed salt so every install derives the same key from the shared secret.
const KEY_SALT: &[u8] = b"mealpass.vault.v1";

/// Argon2id cost. Derivation happens once per process.
const KDF_MEMORY_KIB: u32 = 8 * 1024;
const KDF_ITERATIONS: u32 = 2;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Failed to serialize value: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Encryption failed")]
    Seal,

    #[error("Decryption failed - wrong key or tampered data")]
    Open,

    #[error("Ciphertext too short ({0} bytes)")]
    Truncated(usize),
}

/// Authenticated symmetric encryption over opaque bytes.
pub trait Cipher: Send + Sync {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Default cipher: XChaCha20-Poly1305, output laid out as `nonce || ciphertext+tag`.
pub struct ChaChaCipher {
    aead: XChaCha20Poly1305,
}

impl ChaChaCipher {
    pub fn from_key(key: [u8; KEY_SIZE]) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(&key)),
        }
    }

    /// Derive the key from a secret with Argon2id over the application salt.
    pub fn from_secret(secret: &str) -> Result<Self, CryptoError> {
        let params = Params::new(KDF_MEMORY_KIB, KDF_ITERATIONS, 1, Some(KEY_SIZE))
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0u8; KEY_SIZE];
        argon
            .hash_password_into(secret.as_bytes(), KEY_SALT, &mut key)
            .map_err(|e| CryptoError::KeyDerivation(e.to_string()))?;
        Ok(Self::from_key(key))
    }
}

impl Cipher for ChaChaCipher {
    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .aead
            .encrypt(XNonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| CryptoError::Seal)?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(CryptoError::Truncated(sealed.len()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        self.aead
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Open)
    }
}
