use std::sync::Arc;

use bytes::Bytes;
use store::SharedStore;

use super::kdf::{derive_master, KdfParams, SALT_SIZE};
use super::{ChunkError, CryptError, RandomSource, Secret};
use crate::chunk::ChunkId;

/// Sub-key context for sealing chunks with the volume master key.
const CHUNK_KEY_CONTEXT: &str = "cloudfs 2024-01 chunk sealing key";

/// Plaintext sealed into the superblock to recognise the right password.
const VERIFIER_PLAINTEXT: &[u8] = b"cloudfs key verifier";

/// Seals and opens the chunks of one volume.
///
/// Wraps the store: every chunk written through [`CryptEngine::put_chunk`]
/// is sealed under the volume key and bound to its [`ChunkId`], every chunk
/// read through [`CryptEngine::get_chunk`] is authenticated before it is
/// returned.
#[derive(Debug, Clone)]
pub struct CryptEngine {
    volume: Arc<str>,
    key: Arc<Secret>,
    rng: Arc<RandomSource>,
    store: SharedStore,
}

impl CryptEngine {
    /// Derive the volume key from `password` and the stored `salt`.
    ///
    /// The KDF runs on a blocking thread.
    pub async fn unlock(
        volume: &str,
        password: &str,
        salt: &[u8],
        params: KdfParams,
        rng: Arc<RandomSource>,
        store: SharedStore,
    ) -> Result<Self, CryptError> {
        let password = zeroize::Zeroizing::new(password.as_bytes().to_vec());
        let salt = salt.to_vec();
        let master = tokio::task::spawn_blocking(move || derive_master(&password, &salt, params))
            .await
            .map_err(|e| CryptError::Kdf(e.to_string()))??;
        Ok(Self::from_master(volume, &master, rng, store))
    }

    pub fn from_master(
        volume: &str,
        master: &Secret,
        rng: Arc<RandomSource>,
        store: SharedStore,
    ) -> Self {
        Self {
            volume: Arc::from(volume),
            key: Arc::new(master.derive(CHUNK_KEY_CONTEXT)),
            rng,
            store,
        }
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn rng(&self) -> &Arc<RandomSource> {
        &self.rng
    }

    pub fn seal(&self, plaintext: &[u8], id: ChunkId) -> Result<Vec<u8>, CryptError> {
        let nonce = self.rng.nonce()?;
        self.key.seal(plaintext, &id.context(&self.volume), nonce)
    }

    pub fn open(&self, sealed: &[u8], id: ChunkId) -> Result<Vec<u8>, CryptError> {
        self.key
            .open(sealed, &id.context(&self.volume), &id.to_string())
    }

    /// Seal `plaintext` and store it under the chunk's key.
    pub async fn put_chunk(&self, id: ChunkId, plaintext: &[u8]) -> Result<(), ChunkError> {
        let sealed = self.seal(plaintext, id)?;
        let key = id.key(&self.volume);
        tracing::debug!(chunk = %id, bytes = sealed.len(), "put chunk");
        self.store.put(&key, Bytes::from(sealed)).await?;
        Ok(())
    }

    /// Fetch and authenticate a chunk.
    pub async fn get_chunk(&self, id: ChunkId) -> Result<Vec<u8>, ChunkError> {
        let key = id.key(&self.volume);
        tracing::debug!(chunk = %id, "get chunk");
        let sealed = self.store.get(&key).await?;
        Ok(self.open(&sealed, id)?)
    }

    pub fn make_verifier(&self) -> Result<Vec<u8>, CryptError> {
        self.seal(VERIFIER_PLAINTEXT, ChunkId::verifier())
    }

    /// Distinguish a wrong password from a damaged superblock.
    pub fn check_verifier(&self, verifier: &[u8]) -> Result<(), CryptError> {
        match self.open(verifier, ChunkId::verifier()) {
            Ok(plain) if plain == VERIFIER_PLAINTEXT => Ok(()),
            Ok(_) => Err(CryptError::Malformed("unexpected key verifier".into())),
            Err(CryptError::AuthenticationFailure(_)) => Err(CryptError::WrongPassword),
            Err(e) => Err(e),
        }
    }
}

/// Fresh random salt for a new volume.
pub fn generate_salt(rng: &RandomSource) -> Result<[u8; SALT_SIZE], CryptError> {
    let mut salt = [0u8; SALT_SIZE];
    rng.fill(&mut salt)?;
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::{ObjectStorage, StoreError};

    async fn engine(password: &str) -> CryptEngine {
        let store: SharedStore = Arc::new(ObjectStorage::memory());
        CryptEngine::unlock(
            "vol",
            password,
            &[3; SALT_SIZE],
            KdfParams::for_testing(),
            Arc::new(RandomSource::new(false)),
            store,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_put_get_chunk() {
        let engine = engine("pw").await;
        let id = ChunkId::data(4, 1);
        engine.put_chunk(id, b"block contents").await.unwrap();
        assert_eq!(engine.get_chunk(id).await.unwrap(), b"block contents");

        let missing = engine.get_chunk(ChunkId::data(5, 1)).await.unwrap_err();
        assert!(matches!(missing, ChunkError::Store(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_replayed_chunk_fails_authentication() {
        let engine = engine("pw").await;
        engine.put_chunk(ChunkId::data(1, 1), b"one").await.unwrap();

        // copy block 1's object over block 2's key
        let sealed = engine.store().get(&ChunkId::data(1, 1).key("vol")).await.unwrap();
        engine
            .store()
            .put(&ChunkId::data(2, 1).key("vol"), sealed)
            .await
            .unwrap();

        let err = engine.get_chunk(ChunkId::data(2, 1)).await.unwrap_err();
        assert!(err.is_authentication_failure());
    }

    #[tokio::test]
    async fn test_verifier_detects_wrong_password() {
        let right = engine("right").await;
        let verifier = right.make_verifier().unwrap();
        right.check_verifier(&verifier).unwrap();

        let wrong = engine("wrong").await;
        assert!(matches!(
            wrong.check_verifier(&verifier),
            Err(CryptError::WrongPassword)
        ));
    }

    #[test]
    fn test_salts_differ() {
        let rng = RandomSource::new(false);
        assert_ne!(generate_salt(&rng).unwrap(), generate_salt(&rng).unwrap());
    }
}
