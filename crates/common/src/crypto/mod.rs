//! Encryption at rest for cloudfs volumes
//!
//! - **Key derivation**: the volume master key is Argon2id(password, salt);
//!   salt and cost parameters live in the superblock.
//! - **Sealing**: every chunk is sealed with ChaCha20-Poly1305 under a key
//!   derived from the master key. The chunk's coordinate
//!   `(volume, kind, index, epoch)` is the associated data, so a chunk moved
//!   or replayed to a different coordinate fails authentication.
//! - **Verifier**: a sealed constant in the superblock tells a wrong password
//!   apart from corrupted data on the first access.
//! - **Randomness**: nonces and salts come from the OS RNG, or from a seeded
//!   generator when `norandom` is configured (see [`RandomSource`]).

mod engine;
mod kdf;
mod random;
mod secret;

pub use engine::{generate_salt, CryptEngine};
pub use kdf::{derive_master, KdfParams, SALT_SIZE};
pub use random::RandomSource;
pub use secret::{Secret, FRAME_OVERHEAD, FRAME_VERSION, NONCE_SIZE, SECRET_SIZE, TAG_SIZE};

use store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum CryptError {
    /// Tag mismatch: tampered, corrupted, or misplaced chunk
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),
    #[error("wrong password")]
    WrongPassword,
    #[error("malformed encrypted data: {0}")]
    Malformed(String),
    #[error("key derivation failed: {0}")]
    Kdf(String),
    #[error("random source failed: {0}")]
    Random(String),
    #[error("encryption failed")]
    Encrypt,
}

/// Failure moving a sealed chunk between the store and plaintext.
#[derive(Debug, thiserror::Error)]
pub enum ChunkError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypt(#[from] CryptError),
}

impl ChunkError {
    pub fn is_authentication_failure(&self) -> bool {
        matches!(self, ChunkError::Crypt(CryptError::AuthenticationFailure(_)))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ChunkError::Store(e) if e.is_not_found())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ChunkError::Store(e) if e.is_transient())
    }
}
