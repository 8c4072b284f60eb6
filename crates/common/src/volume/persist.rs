//! Chunked persistence for volume metadata.
//!
//! The allocation map and the tree are each serialized into one blob, cut
//! into parts of at most [`PART_BYTES`], and sealed as `alloc/` or `tree/`
//! chunks at the committing epoch. A [`MetaRoot`] in the superblock body
//! records how to find them again.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use store::{SharedStore, StoreError};

use super::VolumeError;
use crate::chunk::ChunkId;
use crate::crypto::CryptEngine;
use crate::pool::PoolHandle;

pub const PART_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRoot {
    pub parts: u64,
    /// Total blob length in bytes
    pub len: u64,
    pub epoch: u64,
}

impl MetaRoot {
    pub fn part_ids(&self, ctor: fn(u64, u64) -> ChunkId) -> Vec<ChunkId> {
        (0..self.parts).map(|part| ctor(part, self.epoch)).collect()
    }
}

/// Seal `blob` as parts at `epoch`, in parallel on the pool.
pub async fn store_blob(
    crypt: &CryptEngine,
    pool: &PoolHandle,
    ctor: fn(u64, u64) -> ChunkId,
    blob: &[u8],
    epoch: u64,
) -> Result<MetaRoot, VolumeError> {
    let jobs = blob
        .chunks(PART_BYTES)
        .enumerate()
        .map(|(part, bytes)| {
            let crypt = crypt.clone();
            let bytes = bytes.to_vec();
            let id = ctor(part as u64, epoch);
            pool.submit(async move { crypt.put_chunk(id, &bytes).await })
        })
        .collect::<Result<Vec<_>, _>>()?;
    let parts = jobs.len() as u64;
    for result in futures::future::join_all(jobs).await {
        result??;
    }
    Ok(MetaRoot {
        parts,
        len: blob.len() as u64,
        epoch,
    })
}

/// Fetch, authenticate and reassemble the blob `root` points at.
pub async fn load_blob(
    crypt: &CryptEngine,
    pool: &PoolHandle,
    ctor: fn(u64, u64) -> ChunkId,
    root: &MetaRoot,
) -> Result<Vec<u8>, VolumeError> {
    let jobs = root
        .part_ids(ctor)
        .into_iter()
        .map(|id| {
            let crypt = crypt.clone();
            pool.submit(async move { crypt.get_chunk(id).await })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut blob = Vec::with_capacity(root.len as usize);
    for result in futures::future::join_all(jobs).await {
        blob.extend_from_slice(&result??);
    }
    if blob.len() as u64 != root.len {
        return Err(VolumeError::Inconsistent(format!(
            "metadata is {} bytes, superblock expects {}",
            blob.len(),
            root.len
        )));
    }
    Ok(blob)
}

/// Delete `keys` on the pool. A key that is already gone counts as deleted.
///
/// Returns the keys that could not be deleted.
pub async fn delete_keys(
    store: &SharedStore,
    pool: &PoolHandle,
    keys: Vec<String>,
) -> Result<Vec<(String, StoreError)>, VolumeError> {
    let jobs = keys
        .into_iter()
        .map(|key| {
            let store = store.clone();
            pool.submit(async move {
                let result = match store.delete(&key).await {
                    Err(StoreError::NotFound(_)) => Ok(()),
                    other => other,
                };
                (key, result)
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut failed = Vec::new();
    let mut outcomes = stream::iter(jobs).buffer_unordered(pool.size().max(1) * 2);
    while let Some(outcome) = outcomes.next().await {
        let (key, result) = outcome?;
        if let Err(e) = result {
            tracing::warn!(key, "failed to delete object: {}", e);
            failed.push((key, e));
        }
    }
    Ok(failed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{KdfParams, RandomSource, SALT_SIZE};
    use crate::pool::WorkerPool;
    use bytes::Bytes;
    use std::sync::Arc;
    use store::ObjectStorage;

    async fn crypt(store: SharedStore) -> CryptEngine {
        CryptEngine::unlock(
            "vol",
            "pw",
            &[0; SALT_SIZE],
            KdfParams::for_testing(),
            Arc::new(RandomSource::new(false)),
            store,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_blob_spans_parts() {
        let pool = WorkerPool::new(4);
        let store: SharedStore = Arc::new(ObjectStorage::memory());
        let crypt = crypt(store.clone()).await;

        let blob: Vec<u8> = (0..PART_BYTES * 2 + 10).map(|i| (i % 251) as u8).collect();
        let root = store_blob(&crypt, &pool.handle(), ChunkId::alloc, &blob, 5)
            .await
            .unwrap();
        assert_eq!(root.parts, 3);
        assert_eq!(store.list("vol/alloc").await.unwrap().len(), 3);

        let loaded = load_blob(&crypt, &pool.handle(), ChunkId::alloc, &root)
            .await
            .unwrap();
        assert_eq!(loaded, blob);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_blob_has_no_parts() {
        let pool = WorkerPool::new(1);
        let store: SharedStore = Arc::new(ObjectStorage::memory());
        let crypt = crypt(store.clone()).await;
        let root = store_blob(&crypt, &pool.handle(), ChunkId::tree, &[], 1)
            .await
            .unwrap();
        assert_eq!(root.parts, 0);
        assert!(load_blob(&crypt, &pool.handle(), ChunkId::tree, &root)
            .await
            .unwrap()
            .is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_keys_tolerates_missing() {
        let pool = WorkerPool::new(2);
        let store: SharedStore = Arc::new(ObjectStorage::memory());
        store.put("vol/a", Bytes::from_static(b"a")).await.unwrap();
        let failed = delete_keys(
            &store,
            &pool.handle(),
            vec!["vol/a".to_string(), "vol/missing".to_string()],
        )
        .await
        .unwrap();
        assert!(failed.is_empty());
        assert!(store.list("vol").await.unwrap().is_empty());
        pool.shutdown().await;
    }
}
