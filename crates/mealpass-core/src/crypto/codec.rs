use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::cipher::{Cipher, CryptoError, NONCE_SIZE, TAG_SIZE};

/// Outcome of reading a blob, kept apart so callers can log what happened
/// before collapsing it to `Option`.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<T> {
    /// Opened with the configured key.
    Sealed(T),
    /// Not cipher output, but valid JSON written before sealing existed.
    Plaintext(T),
    Empty,
    /// Neither openable nor JSON: foreign key, tampering or garbage.
    Corrupt,
}

impl<T> Decoded<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Decoded::Sealed(value) | Decoded::Plaintext(value) => Some(value),
            Decoded::Empty | Decoded::Corrupt => None,
        }
    }
}

/// String-level contract over a `Cipher`: values in, opaque base64 blobs out.
#[derive(Clone)]
pub struct BlobCodec {
    cipher: Arc<dyn Cipher>,
}

impl BlobCodec {
    pub fn new(cipher: Arc<dyn Cipher>) -> Self {
        Self { cipher }
    }

    /// Seal a value. Returns an empty string on failure; persistence is best-effort.
    pub fn encrypt<T: Serialize + ?Sized>(&self, value: &T) -> String {
        match self.try_encrypt(value) {
            Ok(blob) => blob,
            Err(e) => {
                warn!(error = %e, "Failed to seal value");
                String::new()
            }
        }
    }

    fn try_encrypt<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, CryptoError> {
        let json = serde_json::to_vec(value)?;
        let sealed = self.cipher.seal(&json)?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// Recover a JSON value. `None` for empty, foreign or unparseable input.
    pub fn decrypt(&self, blob: &str) -> Option<Value> {
        self.decode(blob).into_option()
    }

    pub fn decode<T: DeserializeOwned>(&self, blob: &str) -> Decoded<T> {
        if blob.is_empty() {
            return Decoded::Empty;
        }

        if let Some(plaintext) = self.open(blob) {
            match serde_json::from_slice(&plaintext) {
                Ok(value) => return Decoded::Sealed(value),
                Err(e) => debug!(error = %e, "Opened blob is not the expected JSON"),
            }
        }

        match serde_json::from_str(blob) {
            Ok(value) => Decoded::Plaintext(value),
            Err(_) => Decoded::Corrupt,
        }
    }

    fn open(&self, blob: &str) -> Option<Vec<u8>> {
        let bytes = URL_SAFE_NO_PAD.decode(blob.trim()).ok()?;
        match self.cipher.open(&bytes) {
            Ok(plaintext) => Some(plaintext),
            Err(e) => {
                debug!(error = %e, "Blob did not open with the configured key");
                None
            }
        }
    }

    /// Whether `blob` has the shape of cipher output rather than raw JSON.
    /// Only a shape check: it says nothing about which key sealed it.
    pub fn looks_encrypted(blob: &str) -> bool {
        if blob.is_empty() || serde_json::from_str::<Value>(blob).is_ok() {
            return false;
        }
        URL_SAFE_NO_PAD
            .decode(blob.trim())
            .map(|bytes| bytes.len() >= NONCE_SIZE + TAG_SIZE)
            .unwrap_or(false)
    }
}
