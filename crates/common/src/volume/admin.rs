//! Operations on volumes as a whole that need no password.

use serde::Serialize;
use store::SharedStore;

use super::persist;
use super::superblock::{Envelope, MountMarker};
use super::{validate_name, VolumeError, VolumeFormat};
use crate::chunk::{superblock_key, volume_prefix};
use crate::pool::PoolHandle;

/// What the plaintext envelope says about a volume.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VolumeInfo {
    pub name: String,
    pub format: VolumeFormat,
    pub size: u64,
    pub block_size: u32,
    pub mounted: Option<MountMarker>,
}

impl VolumeInfo {
    pub(super) fn from_envelope(name: &str, envelope: &Envelope) -> Self {
        Self {
            name: name.to_string(),
            format: envelope.format,
            size: envelope.size,
            block_size: envelope.block_size,
            mounted: envelope.marker.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeleteReport {
    pub volume: String,
    pub deleted: usize,
    /// Whether a superblock was still present, i.e. this was not a resumed
    /// delete
    pub had_superblock: bool,
}

/// Delete every object of `name`, the superblock last.
///
/// An interrupted delete keeps the superblock, so the volume is still
/// listed and running the delete again finishes the job. Stray chunks
/// without a superblock are removed as well.
pub async fn delete(
    store: &SharedStore,
    name: &str,
    pool: &PoolHandle,
    force: bool,
) -> Result<DeleteReport, VolumeError> {
    validate_name(name)?;
    let had_superblock = match Envelope::load(store, name).await {
        Ok(envelope) => {
            if let Some(marker) = envelope.marker {
                if !force {
                    return Err(VolumeError::AlreadyMounted {
                        volume: name.to_string(),
                        marker,
                    });
                }
                tracing::warn!(volume = name, %marker, "deleting a volume that is marked mounted");
            }
            true
        }
        // an unreadable superblock still gets deleted
        Err(VolumeError::Malformed(reason)) => {
            tracing::warn!(volume = name, reason, "superblock is malformed");
            true
        }
        Err(VolumeError::NotFound(_)) => false,
        Err(e) => return Err(e),
    };

    let superblock = superblock_key(name);
    let keys: Vec<String> = store
        .list(&volume_prefix(name))
        .await?
        .into_iter()
        .filter(|key| *key != superblock)
        .collect();
    if keys.is_empty() && !had_superblock {
        return Err(VolumeError::NotFound(name.to_string()));
    }

    let total = keys.len();
    let failed = persist::delete_keys(store, pool, keys).await?;
    if let Some((key, e)) = failed.into_iter().next() {
        tracing::error!(volume = name, key, "delete incomplete, superblock kept");
        return Err(e.into());
    }
    if had_superblock {
        match store.delete(&superblock).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.into()),
        }
    }

    tracing::info!(volume = name, deleted = total, "volume deleted");
    Ok(DeleteReport {
        volume: name.to_string(),
        deleted: total + usize::from(had_superblock),
        had_superblock,
    })
}

/// Every volume in the bucket, read from the plaintext envelopes.
/// Prefixes without a readable superblock are skipped.
pub async fn list_volumes(store: &SharedStore) -> Result<Vec<VolumeInfo>, VolumeError> {
    let mut volumes = Vec::new();
    for name in store.list_prefixes("").await? {
        match Envelope::load(store, &name).await {
            Ok(envelope) => volumes.push(VolumeInfo::from_envelope(&name, &envelope)),
            Err(VolumeError::NotFound(_)) => {
                tracing::debug!(prefix = name, "no superblock, skipping");
            }
            Err(VolumeError::Malformed(reason)) => {
                tracing::warn!(prefix = name, reason, "unreadable superblock, skipping");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(volumes)
}
