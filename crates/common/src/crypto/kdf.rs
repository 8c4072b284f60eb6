//! Password-based key derivation (Argon2id).

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::{CryptError, Secret, SECRET_SIZE};

/// Length of the per-volume salt stored in the superblock
pub const SALT_SIZE: usize = 16;

/// Argon2id cost parameters. Persisted next to the salt so a volume stays
/// mountable if the defaults change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    pub mem_cost_kib: u32,
    pub time_cost: u32,
    pub lanes: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 64 * 1024,
            time_cost: 3,
            lanes: 1,
        }
    }
}

impl KdfParams {
    /// Minimal cost, for tests only.
    pub fn for_testing() -> Self {
        Self {
            mem_cost_kib: 8,
            time_cost: 1,
            lanes: 1,
        }
    }
}

/// Stretch `password` with `salt` into the volume master key.
///
/// CPU and memory heavy; async callers should run it on a blocking thread.
pub fn derive_master(password: &[u8], salt: &[u8], params: KdfParams) -> Result<Secret, CryptError> {
    let params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.lanes,
        Some(SECRET_SIZE),
    )
    .map_err(|e| CryptError::Kdf(e.to_string()))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; SECRET_SIZE]);
    argon2
        .hash_password_into(password, salt, &mut *key)
        .map_err(|e| CryptError::Kdf(e.to_string()))?;

    Ok(Secret::from(*key))
}
