//! The storage interface consumed by the crypt engine.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;

/// Whole-object storage bound to a single bucket.
///
/// Keys are `/`-separated paths. Listing is by path-segment prefix: a prefix
/// of `vol` matches `vol/superblock` but not `vol2/superblock`.
#[async_trait::async_trait]
pub trait Store: Send + Sync + Debug {
    /// Fetch an object. Missing objects are `StoreError::NotFound`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Store an object, replacing any previous object under the same key.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Delete an object. Missing objects are `StoreError::NotFound`.
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every key under `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.list_after(prefix, None).await
    }

    /// List keys under `prefix` strictly greater than `start_after`.
    ///
    /// Lets a caller resume an interrupted listing from the last key it saw.
    async fn list_after(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>>;

    /// Immediate child segments under `prefix` (`""` for the bucket root),
    /// in lexicographic order. `vol/superblock` and `vol/data/..` both yield
    /// `vol` at the root.
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let skip = if prefix.is_empty() { 0 } else { prefix.len() + 1 };
        let mut children: Vec<String> = self
            .list(prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                let rest = key.get(skip..)?;
                let (child, _) = rest.split_once('/')?;
                Some(child.to_string())
            })
            .collect();
        children.dedup();
        Ok(children)
    }

    /// Short backend name used in logs and errors.
    fn kind(&self) -> &'static str;
}

/// Store handle shared between the crypt engine, cache and workers.
pub type SharedStore = Arc<dyn Store>;

#[async_trait::async_trait]
impl<S: Store + ?Sized> Store for Arc<S> {
    async fn get(&self, key: &str) -> Result<Bytes> {
        (**self).get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        (**self).put(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        (**self).delete(key).await
    }

    async fn list_after(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>> {
        (**self).list_after(prefix, start_after).await
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        (**self).list_prefixes(prefix).await
    }

    fn kind(&self) -> &'static str {
        (**self).kind()
    }
}
