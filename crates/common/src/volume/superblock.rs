//! The superblock: a volume's root record.
//!
//! Stored as a plaintext JSON envelope at `<volume>/superblock` so that
//! listing and deletion work without the password. The envelope carries the
//! KDF salt and parameters, the key verifier, and the exclusive-mount
//! marker; everything that must not be forged (generation, metadata roots)
//! lives in the sealed body, whose format and size are cross-checked
//! against the envelope on open.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use store::{SharedStore, StoreError};
use uuid::Uuid;

use super::persist::MetaRoot;
use super::{VolumeError, VolumeFormat};
use crate::chunk::{superblock_key, ChunkId};
use crate::crypto::{CryptEngine, KdfParams};

pub const MAGIC: &str = "cloudfs-superblock";
pub const SUPERBLOCK_VERSION: u32 = 1;

/// Record of the session that holds a volume mounted read-write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountMarker {
    pub holder: Uuid,
    pub host: String,
    pub pid: u32,
    pub since: DateTime<Utc>,
}

impl MountMarker {
    pub fn new(holder: Uuid) -> Self {
        Self {
            holder,
            host: hostname(),
            pid: std::process::id(),
            since: Utc::now(),
        }
    }
}

impl fmt::Display for MountMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "session {} (pid {} on {}) since {}",
            self.holder,
            self.pid,
            self.host,
            self.since.to_rfc3339()
        )
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "unknown".to_string())
}

/// Authenticated part of the superblock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Body {
    pub format: VolumeFormat,
    pub size: u64,
    pub block_size: u32,
    pub generation: u64,
    pub alloc: MetaRoot,
    pub tree: Option<MetaRoot>,
    pub created: DateTime<Utc>,
    pub committed: DateTime<Utc>,
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub magic: String,
    pub version: u32,
    pub format: VolumeFormat,
    pub size: u64,
    pub block_size: u32,
    #[serde(with = "hex_bytes")]
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
    #[serde(with = "hex_bytes")]
    pub verifier: Vec<u8>,
    pub marker: Option<MountMarker>,
    /// Highest chunk epoch handed to a writer. Every writable session
    /// reserves a fresh one, so two sessions never produce the same key.
    #[serde(default)]
    pub epoch: u64,
    #[serde(with = "hex_bytes")]
    pub body: Vec<u8>,
}

impl Envelope {
    pub fn new(
        format: VolumeFormat,
        size: u64,
        block_size: u32,
        salt: Vec<u8>,
        kdf: KdfParams,
        verifier: Vec<u8>,
    ) -> Self {
        Self {
            magic: MAGIC.to_string(),
            version: SUPERBLOCK_VERSION,
            format,
            size,
            block_size,
            salt,
            kdf,
            verifier,
            marker: None,
            epoch: 0,
            body: Vec::new(),
        }
    }

    /// Claim the next unused chunk epoch. The caller persists the envelope.
    pub fn reserve_epoch(&mut self, generation: u64) -> u64 {
        self.epoch = self.epoch.max(generation) + 1;
        self.epoch
    }

    /// Fetch and parse the envelope of `volume`.
    pub async fn load(store: &SharedStore, volume: &str) -> Result<Self, VolumeError> {
        let raw = match store.get(&superblock_key(volume)).await {
            Ok(raw) => raw,
            Err(StoreError::NotFound(_)) => return Err(VolumeError::NotFound(volume.to_string())),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_slice(&raw)?;
        if envelope.magic != MAGIC {
            return Err(VolumeError::Malformed(format!(
                "'{volume}' superblock has bad magic '{}'",
                envelope.magic
            )));
        }
        if envelope.version != SUPERBLOCK_VERSION {
            return Err(VolumeError::Malformed(format!(
                "'{volume}' superblock version {} is not supported",
                envelope.version
            )));
        }
        Ok(envelope)
    }

    pub async fn save(&self, store: &SharedStore, volume: &str) -> Result<(), VolumeError> {
        let raw = serde_json::to_vec_pretty(self)?;
        store.put(&superblock_key(volume), Bytes::from(raw)).await?;
        Ok(())
    }

    /// Verify the password and authenticate the body.
    pub fn open_body(&self, crypt: &CryptEngine) -> Result<Body, VolumeError> {
        crypt.check_verifier(&self.verifier)?;
        let plain = crypt.open(&self.body, ChunkId::superblock())?;
        let body: Body = bincode::deserialize(&plain)?;
        if body.format != self.format || body.size != self.size || body.block_size != self.block_size
        {
            return Err(VolumeError::Inconsistent(format!(
                "superblock envelope ({} / {} bytes / {} byte blocks) disagrees with its sealed body ({} / {} / {})",
                self.format, self.size, self.block_size, body.format, body.size, body.block_size
            )));
        }
        Ok(body)
    }

    pub fn seal_body(&mut self, crypt: &CryptEngine, body: &Body) -> Result<(), VolumeError> {
        let plain = bincode::serialize(body)?;
        self.body = crypt.seal(&plain, ChunkId::superblock())?;
        self.format = body.format;
        self.size = body.size;
        self.block_size = body.block_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{RandomSource, SALT_SIZE};
    use std::sync::Arc;
    use store::ObjectStorage;

    async fn setup(password: &str) -> (SharedStore, CryptEngine) {
        let store: SharedStore = Arc::new(ObjectStorage::memory());
        let crypt = CryptEngine::unlock(
            "vol",
            password,
            &[1; SALT_SIZE],
            KdfParams::for_testing(),
            Arc::new(RandomSource::new(false)),
            store.clone(),
        )
        .await
        .unwrap();
        (store, crypt)
    }

    fn body() -> Body {
        Body {
            format: VolumeFormat::Block,
            size: 1 << 20,
            block_size: 4096,
            generation: 3,
            alloc: MetaRoot::default(),
            tree: None,
            created: Utc::now(),
            committed: Utc::now(),
        }
    }

    fn envelope(crypt: &CryptEngine) -> Envelope {
        let mut envelope = Envelope::new(
            VolumeFormat::Block,
            1 << 20,
            4096,
            vec![1; SALT_SIZE],
            KdfParams::for_testing(),
            crypt.make_verifier().unwrap(),
        );
        envelope.seal_body(crypt, &body()).unwrap();
        envelope
    }

    #[tokio::test]
    async fn test_save_load_open() {
        let (store, crypt) = setup("pw").await;
        let mut env = envelope(&crypt);
        env.marker = Some(MountMarker::new(Uuid::new_v4()));
        env.save(&store, "vol").await.unwrap();

        let loaded = Envelope::load(&store, "vol").await.unwrap();
        assert_eq!(loaded.marker, env.marker);
        assert_eq!(loaded.open_body(&crypt).unwrap().generation, 3);

        // the envelope is readable JSON
        let raw = store.get("vol/superblock").await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(json["magic"], MAGIC);
        assert_eq!(json["format"], "block");
    }

    #[tokio::test]
    async fn test_reserved_epochs_never_repeat() {
        let (store, crypt) = setup("pw").await;
        let mut env = envelope(&crypt);
        // a fresh reservation starts above the committed generation
        assert_eq!(env.reserve_epoch(3), 4);
        assert_eq!(env.reserve_epoch(3), 5);
        env.save(&store, "vol").await.unwrap();

        let mut loaded = Envelope::load(&store, "vol").await.unwrap();
        assert_eq!(loaded.epoch, 5);
        assert_eq!(loaded.reserve_epoch(4), 6);
        assert_eq!(loaded.reserve_epoch(9), 10);
    }

    #[tokio::test]
    async fn test_envelope_without_epoch_parses() {
        let (_, crypt) = setup("pw").await;
        let env = envelope(&crypt);
        let mut json = serde_json::to_value(&env).unwrap();
        json.as_object_mut().unwrap().remove("epoch");
        let parsed: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.epoch, 0);
    }

    #[tokio::test]
    async fn test_wrong_password_is_distinguished() {
        let (_, crypt) = setup("right").await;
        let env = envelope(&crypt);
        let (_, wrong) = setup("wrong").await;
        assert!(matches!(
            env.open_body(&wrong),
            Err(VolumeError::Crypt(crate::crypto::CryptError::WrongPassword))
        ));
    }

    #[tokio::test]
    async fn test_envelope_tamper_is_detected() {
        let (_, crypt) = setup("pw").await;
        let mut env = envelope(&crypt);
        env.size *= 2;
        assert!(matches!(
            env.open_body(&crypt),
            Err(VolumeError::Inconsistent(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_superblock() {
        let (store, _) = setup("pw").await;
        assert!(matches!(
            Envelope::load(&store, "nope").await,
            Err(VolumeError::NotFound(_))
        ));
    }
}
