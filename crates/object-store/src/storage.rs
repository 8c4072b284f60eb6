//! Object storage backends (local directory/S3/GCS/memory).

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};
use crate::retry::{RetryPolicy, RetryingStore};
use crate::store::{SharedStore, Store};

/// Which backend a [`StoreConfig`] selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Dummy,
    Amazon,
    Google,
}

impl StoreKind {
    pub fn name(&self) -> &'static str {
        match self {
            StoreKind::Memory => "memory",
            StoreKind::Dummy => "dummy",
            StoreKind::Amazon => "amazon",
            StoreKind::Google => "google",
        }
    }
}

/// Configuration for the object storage backend.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-memory storage (for testing)
    #[default]
    Memory,

    /// Local directory storage, one sub-directory per bucket
    Dummy {
        /// Path to the storage directory
        path: PathBuf,
    },

    /// S3-compatible storage (AWS S3, MinIO, etc.)
    Amazon {
        /// Access key ID
        access_key: String,
        /// Secret access key
        secret_key: String,
        /// Optional endpoint (host or URL); defaults to AWS
        #[serde(default)]
        endpoint: Option<String>,
        /// Optional region (defaults to "us-east-1")
        #[serde(default)]
        region: Option<String>,
        /// Use HTTPS when the endpoint has no explicit scheme
        #[serde(default)]
        use_https: bool,
    },

    /// Google Cloud Storage
    Google {
        /// Credentials file (service account or authorized user JSON)
        #[serde(default)]
        token_file: Option<PathBuf>,
        #[serde(default)]
        client_id: Option<String>,
        #[serde(default)]
        client_secret: Option<String>,
        #[serde(default)]
        project_id: Option<String>,
    },
}

impl StoreConfig {
    pub fn kind(&self) -> StoreKind {
        match self {
            StoreConfig::Memory => StoreKind::Memory,
            StoreConfig::Dummy { .. } => StoreKind::Dummy,
            StoreConfig::Amazon { .. } => StoreKind::Amazon,
            StoreConfig::Google { .. } => StoreKind::Google,
        }
    }

    /// Create the bucket. Only directory-backed stores can do this themselves.
    pub async fn create_bucket(&self, bucket: &str) -> Result<()> {
        validate_bucket(bucket)?;
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Dummy { path } => {
                let dir = path.join(bucket);
                if tokio::fs::try_exists(&dir).await? {
                    return Err(StoreError::BucketExists(bucket.to_string()));
                }
                tokio::fs::create_dir_all(&dir).await?;
                tracing::info!(bucket, path = ?dir, "created bucket");
                Ok(())
            }
            other => Err(StoreError::Unsupported {
                operation: "bucket creation",
                backend: other.kind().name(),
            }),
        }
    }

    /// Delete an empty bucket.
    pub async fn delete_bucket(&self, bucket: &str) -> Result<()> {
        validate_bucket(bucket)?;
        match self {
            StoreConfig::Memory => Ok(()),
            StoreConfig::Dummy { path } => {
                let dir = path.join(bucket);
                if !tokio::fs::try_exists(&dir).await? {
                    return Err(StoreError::BucketNotFound(bucket.to_string()));
                }
                let storage = ObjectStorage::new(self, bucket).await?;
                if !storage.list("").await?.is_empty() {
                    return Err(StoreError::BucketNotEmpty(bucket.to_string()));
                }
                tokio::fs::remove_dir_all(&dir).await?;
                tracing::info!(bucket, "deleted bucket");
                Ok(())
            }
            other => Err(StoreError::Unsupported {
                operation: "bucket deletion",
                backend: other.kind().name(),
            }),
        }
    }
}

fn validate_bucket(bucket: &str) -> Result<()> {
    let valid = !bucket.is_empty()
        && bucket
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && bucket != "."
        && bucket != "..";
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidConfig(format!(
            "invalid bucket name '{bucket}'"
        )))
    }
}

/// Open a bucket on the configured backend, wrapped in transient-error retries.
///
/// With `auto_create` set, a missing dummy bucket is created instead of failing.
pub async fn open_store(
    config: &StoreConfig,
    bucket: &str,
    retry: RetryPolicy,
    auto_create: bool,
) -> Result<SharedStore> {
    let storage = match ObjectStorage::new(config, bucket).await {
        Err(StoreError::BucketNotFound(_)) if auto_create => {
            config.create_bucket(bucket).await?;
            ObjectStorage::new(config, bucket).await?
        }
        other => other?,
    };
    Ok(Arc::new(RetryingStore::new(storage, retry)))
}

/// Wrapper around different object storage backends.
#[derive(Debug, Clone)]
pub struct ObjectStorage {
    inner: Arc<dyn ObjectStore>,
    kind: StoreKind,
}

impl ObjectStorage {
    /// Create a new storage backend for `bucket` from configuration.
    pub async fn new(config: &StoreConfig, bucket: &str) -> Result<Self> {
        validate_bucket(bucket)?;
        let inner: Arc<dyn ObjectStore> = match config {
            StoreConfig::Memory => Arc::new(InMemory::new()),

            StoreConfig::Dummy { path } => {
                let dir = path.join(bucket);
                if !tokio::fs::try_exists(&dir).await? {
                    return Err(StoreError::BucketNotFound(bucket.to_string()));
                }
                Arc::new(
                    LocalFileSystem::new_with_prefix(&dir)
                        .map_err(|e| StoreError::InvalidConfig(e.to_string()))?,
                )
            }

            StoreConfig::Amazon {
                access_key,
                secret_key,
                endpoint,
                region,
                use_https,
            } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_access_key_id(access_key)
                    .with_secret_access_key(secret_key)
                    .with_bucket_name(bucket)
                    .with_region(region.as_deref().unwrap_or("us-east-1"));

                if let Some(endpoint) = endpoint {
                    let url = if endpoint.contains("://") {
                        endpoint.clone()
                    } else if *use_https {
                        format!("https://{endpoint}")
                    } else {
                        format!("http://{endpoint}")
                    };
                    builder = builder
                        .with_allow_http(url.starts_with("http://"))
                        .with_endpoint(url);
                }

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| StoreError::InvalidConfig(e.to_string()))?,
                );
                verify_bucket(&store, bucket).await?;
                store
            }

            StoreConfig::Google {
                token_file,
                client_id,
                client_secret,
                project_id,
            } => {
                let mut builder = GoogleCloudStorageBuilder::from_env().with_bucket_name(bucket);
                // read by build(), so it only has to outlive the builder
                let client_credentials = match (client_id, client_secret) {
                    (Some(id), Some(secret)) => {
                        let token_file = token_file.as_deref().ok_or_else(|| {
                            StoreError::InvalidConfig(
                                "google client credentials need a token file holding the refresh token"
                                    .into(),
                            )
                        })?;
                        let json =
                            google_user_credentials(id, secret, token_file, project_id.as_deref())?;
                        Some(write_credentials(&json)?)
                    }
                    (None, None) => {
                        if project_id.is_some() {
                            tracing::warn!("google project id is only used with client credentials");
                        }
                        None
                    }
                    _ => {
                        return Err(StoreError::InvalidConfig(
                            "google client id and client secret must be given together".into(),
                        ))
                    }
                };
                match (&client_credentials, token_file) {
                    (Some(file), _) => {
                        builder = builder.with_application_credentials(file.path().to_string_lossy());
                    }
                    (None, Some(token_file)) => {
                        builder = builder.with_application_credentials(token_file.to_string_lossy());
                    }
                    (None, None) => {}
                }

                let store: Arc<dyn ObjectStore> = Arc::new(
                    builder
                        .build()
                        .map_err(|e| StoreError::InvalidConfig(e.to_string()))?,
                );
                drop(client_credentials);
                verify_bucket(&store, bucket).await?;
                store
            }
        };

        Ok(Self {
            inner,
            kind: config.kind(),
        })
    }

    /// Create an in-memory storage backend.
    pub fn memory() -> Self {
        Self {
            inner: Arc::new(InMemory::new()),
            kind: StoreKind::Memory,
        }
    }

    fn path(key: &str) -> ObjectPath {
        ObjectPath::from(key)
    }
}

/// `authorized_user` application credentials for an OAuth client, using the
/// refresh token saved in `token_file`. The project becomes the quota
/// project requests are billed to.
fn google_user_credentials(
    client_id: &str,
    client_secret: &str,
    token_file: &Path,
    project_id: Option<&str>,
) -> Result<serde_json::Value> {
    let invalid = |reason: String| {
        StoreError::InvalidConfig(format!("google token file {}: {reason}", token_file.display()))
    };
    let raw = std::fs::read(token_file).map_err(|e| invalid(e.to_string()))?;
    let token: serde_json::Value =
        serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))?;
    let refresh_token = token
        .get("refresh_token")
        .and_then(|t| t.as_str())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| invalid("no refresh_token".into()))?;

    let mut credentials = serde_json::json!({
        "type": "authorized_user",
        "client_id": client_id,
        "client_secret": client_secret,
        "refresh_token": refresh_token,
    });
    if let Some(project_id) = project_id {
        credentials["quota_project_id"] = project_id.into();
    }
    Ok(credentials)
}

/// Owner-only temporary file holding `credentials`.
fn write_credentials(credentials: &serde_json::Value) -> Result<tempfile::NamedTempFile> {
    let mut file = tempfile::Builder::new()
        .prefix("cloudfs-gcs-")
        .suffix(".json")
        .tempfile()?;
    file.write_all(credentials.to_string().as_bytes())?;
    file.flush()?;
    Ok(file)
}

/// Fail fast if a remote bucket does not exist.
async fn verify_bucket(store: &Arc<dyn ObjectStore>, bucket: &str) -> Result<()> {
    let mut stream = store.list(None);
    match stream.try_next().await {
        Ok(_) => Ok(()),
        Err(object_store::Error::NotFound { .. }) => {
            Err(StoreError::BucketNotFound(bucket.to_string()))
        }
        Err(e) => {
            let msg = e.to_string();
            if msg.contains("NoSuchBucket") || msg.contains("bucket") && msg.contains("not") {
                return Err(StoreError::BucketNotFound(bucket.to_string()));
            }
            Err(e.into())
        }
    }
}

#[async_trait::async_trait]
impl Store for ObjectStorage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self.inner.get(&Self::path(key)).await?;
        Ok(result.bytes().await?)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.inner.put(&Self::path(key), data.into()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = Self::path(key);
        // Some backends treat deleting a missing key as success; make it explicit.
        match self.inner.head(&path).await {
            Ok(_) => {}
            Err(object_store::Error::NotFound { .. }) => {
                return Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => return Err(e.into()),
        }
        self.inner.delete(&path).await?;
        Ok(())
    }

    async fn list_after(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>> {
        let prefix = (!prefix.is_empty()).then(|| Self::path(prefix));
        let items: Vec<_> = match start_after {
            Some(offset) => {
                self.inner
                    .list_with_offset(prefix.as_ref(), &Self::path(offset))
                    .try_collect()
                    .await?
            }
            None => self.inner.list(prefix.as_ref()).try_collect().await?,
        };

        let mut keys: Vec<String> = items
            .into_iter()
            .map(|meta| meta.location.to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = (!prefix.is_empty()).then(|| Self::path(prefix));
        let listing = self.inner.list_with_delimiter(prefix.as_ref()).await?;
        let mut children: Vec<String> = listing
            .common_prefixes
            .into_iter()
            .filter_map(|path| path.filename().map(str::to_string))
            .collect();
        children.sort();
        Ok(children)
    }

    fn kind(&self) -> &'static str {
        self.kind.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_storage() {
        let storage = ObjectStorage::memory();

        let key = "vol/data/0000000000000001.0000000000000001";
        let data = Bytes::from("hello world");

        storage.put(key, data.clone()).await.unwrap();
        let retrieved = storage.get(key).await.unwrap();
        assert_eq!(retrieved, data);

        let keys = storage.list("vol").await.unwrap();
        assert_eq!(keys, vec![key.to_string()]);

        storage.delete(key).await.unwrap();
        assert!(storage.get(key).await.unwrap_err().is_not_found());
        assert!(storage.delete(key).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_dummy_storage() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::Dummy {
            path: temp_dir.path().to_path_buf(),
        };

        // Bucket must exist first
        let missing = ObjectStorage::new(&config, "bucket").await.unwrap_err();
        assert!(matches!(missing, StoreError::BucketNotFound(_)));

        config.create_bucket("bucket").await.unwrap();
        let storage = ObjectStorage::new(&config, "bucket").await.unwrap();

        let data = Bytes::from("test data");
        storage.put("vol/superblock", data.clone()).await.unwrap();
        assert_eq!(storage.get("vol/superblock").await.unwrap(), data);

        // Verify file exists on disk
        let file_path = temp_dir.path().join("bucket").join("vol").join("superblock");
        assert!(file_path.exists());

        // Non-empty bucket cannot be deleted
        let err = config.delete_bucket("bucket").await.unwrap_err();
        assert!(matches!(err, StoreError::BucketNotEmpty(_)));

        storage.delete("vol/superblock").await.unwrap();
        config.delete_bucket("bucket").await.unwrap();
        assert!(!temp_dir.path().join("bucket").exists());
    }

    #[tokio::test]
    async fn test_list_is_segment_prefixed_and_resumable() {
        let storage = ObjectStorage::memory();
        for key in ["vol/a", "vol/b", "vol/c", "vol2/a"] {
            storage.put(key, Bytes::from_static(b"x")).await.unwrap();
        }

        let all = storage.list("vol").await.unwrap();
        assert_eq!(all, vec!["vol/a", "vol/b", "vol/c"]);

        let rest = storage.list_after("vol", Some("vol/a")).await.unwrap();
        assert_eq!(rest, vec!["vol/b", "vol/c"]);

        let everything = storage.list("").await.unwrap();
        assert_eq!(everything.len(), 4);

        storage.put("vol/data/x", Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(storage.list_prefixes("").await.unwrap(), vec!["vol", "vol2"]);
        assert_eq!(storage.list_prefixes("vol").await.unwrap(), vec!["data"]);
    }

    #[tokio::test]
    async fn test_auto_create_bucket() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::Dummy {
            path: temp_dir.path().to_path_buf(),
        };

        let store = open_store(&config, "auto", RetryPolicy::default(), true)
            .await
            .unwrap();
        store.put("k", Bytes::from_static(b"v")).await.unwrap();
        assert!(temp_dir.path().join("auto").join("k").exists());
    }

    #[tokio::test]
    async fn test_invalid_bucket_name() {
        let config = StoreConfig::Memory;
        assert!(matches!(
            config.create_bucket("../escape").await,
            Err(StoreError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_cloud_bucket_admin_unsupported() {
        let config = StoreConfig::Google {
            token_file: None,
            client_id: None,
            client_secret: None,
            project_id: None,
        };
        assert!(matches!(
            config.create_bucket("bucket").await,
            Err(StoreError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_google_client_credentials_use_stored_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("token.json");
        std::fs::write(
            &token_file,
            r#"{"access_token": "stale", "refresh_token": "1//refresh"}"#,
        )
        .unwrap();

        let json =
            google_user_credentials("id.apps", "s3cret", &token_file, Some("proj-1")).unwrap();
        assert_eq!(json["type"], "authorized_user");
        assert_eq!(json["client_id"], "id.apps");
        assert_eq!(json["client_secret"], "s3cret");
        assert_eq!(json["refresh_token"], "1//refresh");
        assert_eq!(json["quota_project_id"], "proj-1");

        let file = write_credentials(&json).unwrap();
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(file.path()).unwrap()).unwrap();
        assert_eq!(written, json);

        std::fs::write(&token_file, r#"{"access_token": "only"}"#).unwrap();
        assert!(matches!(
            google_user_credentials("id", "secret", &token_file, None),
            Err(StoreError::InvalidConfig(msg)) if msg.contains("refresh_token")
        ));
    }

    #[tokio::test]
    async fn test_google_client_credentials_are_validated() {
        let half = StoreConfig::Google {
            token_file: None,
            client_id: Some("id".to_string()),
            client_secret: None,
            project_id: None,
        };
        assert!(matches!(
            ObjectStorage::new(&half, "bucket").await,
            Err(StoreError::InvalidConfig(msg)) if msg.contains("together")
        ));

        let no_token = StoreConfig::Google {
            token_file: None,
            client_id: Some("id".to_string()),
            client_secret: Some("secret".to_string()),
            project_id: None,
        };
        assert!(matches!(
            ObjectStorage::new(&no_token, "bucket").await,
            Err(StoreError::InvalidConfig(msg)) if msg.contains("token file")
        ));

        let missing = StoreConfig::Google {
            token_file: Some(PathBuf::from("/nonexistent/cloudfs-token.json")),
            client_id: Some("id".to_string()),
            client_secret: Some("secret".to_string()),
            project_id: None,
        };
        assert!(matches!(
            ObjectStorage::new(&missing, "bucket").await,
            Err(StoreError::InvalidConfig(_))
        ));
    }
}
