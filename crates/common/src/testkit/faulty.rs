use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use store::{ObjectStorage, Result, SharedStore, Store, StoreError};

type KeyPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Default)]
struct Faults {
    puts: Option<KeyPredicate>,
    gets: Option<KeyPredicate>,
    deletes: Option<KeyPredicate>,
    /// Operations still to fail with a transient error
    transient: u32,
}

#[derive(Default)]
struct Counters {
    gets: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
    lists: AtomicU64,
}

/// Store wrapper that fails selected operations and counts the rest.
pub struct FaultyStore {
    inner: SharedStore,
    faults: Mutex<Faults>,
    counters: Counters,
}

impl fmt::Debug for FaultyStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyStore")
            .field("inner", &self.inner)
            .field("puts", &self.puts())
            .field("gets", &self.gets())
            .finish()
    }
}

impl FaultyStore {
    pub fn new(inner: SharedStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            faults: Mutex::new(Faults::default()),
            counters: Counters::default(),
        })
    }

    pub fn memory() -> Arc<Self> {
        Self::new(Arc::new(ObjectStorage::memory()))
    }

    /// The wrapped store, bypassing fault injection.
    pub fn inner(&self) -> &SharedStore {
        &self.inner
    }

    /// Fail every put whose key matches, permanently.
    pub fn fail_puts(&self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.faults.lock().puts = Some(Arc::new(predicate));
    }

    /// Fail every get whose key matches, permanently.
    pub fn fail_gets(&self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.faults.lock().gets = Some(Arc::new(predicate));
    }

    /// Fail every delete whose key matches, permanently.
    pub fn fail_deletes(&self, predicate: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.faults.lock().deletes = Some(Arc::new(predicate));
    }

    /// Fail the next `count` operations of any kind with a transient error.
    pub fn fail_transiently(&self, count: u32) {
        self.faults.lock().transient = count;
    }

    pub fn heal(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn gets(&self) -> u64 {
        self.counters.gets.load(Ordering::Relaxed)
    }

    pub fn puts(&self) -> u64 {
        self.counters.puts.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.counters.deletes.load(Ordering::Relaxed)
    }

    pub fn lists(&self) -> u64 {
        self.counters.lists.load(Ordering::Relaxed)
    }

    pub fn reset_counts(&self) {
        for counter in [
            &self.counters.gets,
            &self.counters.puts,
            &self.counters.deletes,
            &self.counters.lists,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Flip one byte in the middle of a stored object.
    pub async fn corrupt(&self, key: &str) -> Result<()> {
        let mut data = self.inner.get(key).await?.to_vec();
        if data.is_empty() {
            return Err(StoreError::Permanent(format!("cannot corrupt empty object {key}")));
        }
        let middle = data.len() / 2;
        data[middle] ^= 0xff;
        self.inner.put(key, Bytes::from(data)).await
    }

    fn check(&self, operation: &str, key: &str) -> Result<()> {
        let mut faults = self.faults.lock();
        if faults.transient > 0 {
            faults.transient -= 1;
            return Err(StoreError::Transient(format!("injected {operation} failure on {key}")));
        }
        let rule = match operation {
            "put" => faults.puts.as_ref(),
            "get" => faults.gets.as_ref(),
            "delete" => faults.deletes.as_ref(),
            _ => None,
        };
        match rule {
            Some(matches) if matches(key) => Err(StoreError::Permanent(format!(
                "injected {operation} failure on {key}"
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl Store for FaultyStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        self.counters.gets.fetch_add(1, Ordering::Relaxed);
        self.check("get", key)?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.counters.puts.fetch_add(1, Ordering::Relaxed);
        self.check("put", key)?;
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.counters.deletes.fetch_add(1, Ordering::Relaxed);
        self.check("delete", key)?;
        self.inner.delete(key).await
    }

    async fn list_after(&self, prefix: &str, start_after: Option<&str>) -> Result<Vec<String>> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        self.check("list", prefix)?;
        self.inner.list_after(prefix, start_after).await
    }

    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        self.counters.lists.fetch_add(1, Ordering::Relaxed);
        self.check("list", prefix)?;
        self.inner.list_prefixes(prefix).await
    }

    fn kind(&self) -> &'static str {
        "faulty"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_injected_failures() {
        let store = FaultyStore::memory();
        store.put("v/a", Bytes::from_static(b"a")).await.unwrap();

        store.fail_puts(|key| key.ends_with("/superblock"));
        assert!(store.put("v/b", Bytes::from_static(b"b")).await.is_ok());
        assert!(matches!(
            store.put("v/superblock", Bytes::new()).await,
            Err(StoreError::Permanent(_))
        ));

        store.fail_transiently(1);
        assert!(store.get("v/a").await.unwrap_err().is_transient());
        assert_eq!(store.get("v/a").await.unwrap(), Bytes::from_static(b"a"));

        store.heal();
        store.put("v/superblock", Bytes::new()).await.unwrap();
        assert_eq!(store.puts(), 4);
        assert_eq!(store.gets(), 2);
    }

    #[tokio::test]
    async fn test_corrupt_flips_a_byte() {
        let store = FaultyStore::memory();
        store.put("k", Bytes::from_static(b"abc")).await.unwrap();
        store.corrupt("k").await.unwrap();
        assert_ne!(store.get("k").await.unwrap(), Bytes::from_static(b"abc"));
    }
}
