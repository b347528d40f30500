//! Symmetric sealing of JSON values for local persistence.
//!
//! Split in two layers:
//! - `Cipher`: authenticated encryption over opaque bytes. The key source is
//!   an adapter concern; `ChaChaCipher` derives its key from a shared secret.
//! - `BlobCodec`: the string contract the vault relies on. Encryption never
//!   fails loudly and decryption never escapes an error.

pub mod cipher;
pub mod codec;

pub use cipher::{ChaChaCipher, Cipher, CryptoError, DEFAULT_SHARED_SECRET};
pub use codec::{BlobCodec, Decoded};
