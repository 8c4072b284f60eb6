//! Bounded write-back block cache
//!
//! Sits between the volume engine and the crypt engine. Entries are whole
//! blocks keyed by block index; each counts `block_size` bytes against the
//! configured budget whether it lives in memory or in a spill file.
//!
//! - Reads fill on miss through the [`Backing`].
//! - Writes mark the entry dirty and return; dirty entries reach the store
//!   through [`Cache::flush`], [`Cache::flush_all`], the periodic write-back
//!   task, or eviction.
//! - Admission that would exceed the budget first evicts the least recently
//!   used unpinned entry (ties go to the lower block index). A dirty victim is
//!   flushed before it is dropped; if that flush fails the admission fails
//!   and the entry stays dirty.
//!
//! The entry table sits behind a short synchronous lock. Each entry's
//! contents sit behind their own async lock, held for the duration of a
//! fill, write or flush, so operations on one block apply in order while
//! disjoint blocks proceed in parallel.

mod storage;

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{CacheConfig, CacheKind};
use crate::crypto::ChunkError;
use crate::pool::{PoolError, PoolHandle};

use self::storage::{Content, Storage};

/// Source and sink of block contents on a miss or a flush.
#[async_trait::async_trait]
pub trait Backing: Send + Sync {
    /// Current contents of block `index`. Must be exactly one block long.
    async fn fetch(&self, index: u64) -> Result<Vec<u8>, ChunkError>;

    /// Persist `data` as the new contents of block `index`.
    async fn flush(&self, index: u64, data: &[u8]) -> Result<(), ChunkError>;
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache full: every entry within the {max_bytes} byte budget is in use")]
    CapacityExceeded { max_bytes: u64 },
    #[error("failed to load block {index}: {source}")]
    Fetch { index: u64, source: ChunkError },
    #[error("failed to flush block {index}: {source}")]
    Flush { index: u64, source: ChunkError },
    #[error("{failed} of {total} dirty blocks could not be flushed: {reason}")]
    FlushIncomplete {
        failed: usize,
        total: usize,
        reason: String,
    },
    #[error("block {index} has {len} bytes, expected {block_size}")]
    BadBlock {
        index: u64,
        len: usize,
        block_size: usize,
    },
    #[error("write of {len} bytes at offset {offset} crosses the block boundary")]
    BadRange { offset: usize, len: usize },
    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),
    #[error("cache io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl CacheError {
    /// Whether the failure came from a chunk that did not authenticate.
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            CacheError::Fetch { source, .. } | CacheError::Flush { source, .. } => {
                source.is_authentication_failure()
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub kind: &'static str,
    pub entries: usize,
    pub dirty: usize,
    pub resident_bytes: u64,
    pub max_bytes: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub flushes: u64,
}

struct Slot {
    content: tokio::sync::Mutex<Content>,
}

struct Entry {
    slot: Arc<Slot>,
    dirty: bool,
    last_access: u64,
    pins: usize,
}

#[derive(Default)]
struct Table {
    entries: HashMap<u64, Entry>,
    resident: u64,
    tick: u64,
}

impl Table {
    fn victim(&self) -> Option<u64> {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.pins == 0)
            .min_by_key(|(index, entry)| (entry.last_access, **index))
            .map(|(index, _)| *index)
    }

    fn entry_for(&mut self, index: u64, slot: &Arc<Slot>) -> Option<&mut Entry> {
        self.entries
            .get_mut(&index)
            .filter(|entry| Arc::ptr_eq(&entry.slot, slot))
    }
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    flushes: AtomicU64,
}

/// An entry kept resident while an operation uses it.
struct Pinned<'a> {
    cache: &'a Cache,
    index: u64,
    slot: Arc<Slot>,
}

impl Drop for Pinned<'_> {
    fn drop(&mut self) {
        let mut table = self.cache.table.lock();
        if let Some(entry) = table.entry_for(self.index, &self.slot) {
            entry.pins -= 1;
        }
    }
}

enum Admission {
    Ready(Arc<Slot>),
    Evicted(Arc<Slot>),
    FlushVictim(u64, Arc<Slot>),
    Full,
}

pub struct Cache {
    backing: Arc<dyn Backing>,
    storage: Storage,
    block_size: usize,
    max_bytes: u64,
    flush_retries: u32,
    flush_backoff: Duration,
    pool: PoolHandle,
    table: Mutex<Table>,
    counters: Counters,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("storage", &self.storage)
            .field("block_size", &self.block_size)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl Cache {
    /// Build a cache for blocks of `block_size` bytes.
    ///
    /// A file cache spills into an owner-only directory named after `label`
    /// under `<path>`, created here and removed when the cache is dropped.
    pub fn new(
        config: &CacheConfig,
        block_size: usize,
        label: &str,
        backing: Arc<dyn Backing>,
        pool: PoolHandle,
    ) -> Result<Self, CacheError> {
        if config.max_bytes < block_size as u64 {
            return Err(CacheError::InvalidConfig(format!(
                "cache size {} is smaller than one block ({} bytes)",
                config.max_bytes, block_size
            )));
        }
        let storage = match config.kind {
            CacheKind::Memory => Storage::Memory,
            CacheKind::File => {
                let root = config.path.clone().unwrap_or_else(std::env::temp_dir);
                Storage::file(&root, label)?
            }
        };
        tracing::debug!(
            kind = ?config.kind,
            max_bytes = config.max_bytes,
            block_size,
            "cache created"
        );
        Ok(Self {
            backing,
            storage,
            block_size,
            max_bytes: config.max_bytes,
            flush_retries: config.flush_retries.max(1),
            flush_backoff: Duration::from_millis(config.flush_backoff_ms),
            pool,
            table: Mutex::new(Table::default()),
            counters: Counters::default(),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn spill_dir(&self) -> Option<&Path> {
        self.storage.dir()
    }

    fn entry_size(&self) -> u64 {
        self.block_size as u64
    }

    /// Pin `index`, admitting it (and evicting to make room) if absent.
    async fn pin(&self, index: u64) -> Result<Pinned<'_>, CacheError> {
        loop {
            let admission = {
                let mut table = self.table.lock();
                table.tick += 1;
                let tick = table.tick;
                if let Some(entry) = table.entries.get_mut(&index) {
                    entry.pins += 1;
                    entry.last_access = tick;
                    Admission::Ready(entry.slot.clone())
                } else if table.resident + self.entry_size() <= self.max_bytes {
                    let slot = Arc::new(Slot {
                        content: tokio::sync::Mutex::new(Content::Empty),
                    });
                    table.entries.insert(
                        index,
                        Entry {
                            slot: slot.clone(),
                            dirty: false,
                            last_access: tick,
                            pins: 1,
                        },
                    );
                    table.resident += self.entry_size();
                    Admission::Ready(slot)
                } else {
                    match table.victim() {
                        None => Admission::Full,
                        Some(victim) => match table.entries.remove(&victim) {
                            Some(mut entry) if entry.dirty => {
                                entry.pins += 1;
                                let slot = entry.slot.clone();
                                table.entries.insert(victim, entry);
                                Admission::FlushVictim(victim, slot)
                            }
                            Some(entry) => {
                                table.resident -= self.entry_size();
                                Admission::Evicted(entry.slot)
                            }
                            None => Admission::Full,
                        },
                    }
                }
            };

            match admission {
                Admission::Ready(slot) => {
                    return Ok(Pinned {
                        cache: self,
                        index,
                        slot,
                    })
                }
                Admission::Full => {
                    return Err(CacheError::CapacityExceeded {
                        max_bytes: self.max_bytes,
                    })
                }
                Admission::Evicted(slot) => {
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    let mut content = slot.content.lock().await;
                    self.storage.release(&mut content).await;
                }
                Admission::FlushVictim(victim, slot) => {
                    tracing::debug!(victim, "flushing dirty block before eviction");
                    let pinned = Pinned {
                        cache: self,
                        index: victim,
                        slot,
                    };
                    self.flush_pinned(&pinned).await?;
                }
            }
        }
    }

    /// Pin `index` only if it is already resident.
    fn pin_resident(&self, index: u64) -> Option<Pinned<'_>> {
        let mut table = self.table.lock();
        let entry = table.entries.get_mut(&index)?;
        entry.pins += 1;
        Some(Pinned {
            cache: self,
            index,
            slot: entry.slot.clone(),
        })
    }

    fn set_dirty(&self, pinned: &Pinned<'_>, dirty: bool) {
        let mut table = self.table.lock();
        if let Some(entry) = table.entry_for(pinned.index, &pinned.slot) {
            entry.dirty = dirty;
        }
    }

    fn is_dirty(&self, pinned: &Pinned<'_>) -> bool {
        let mut table = self.table.lock();
        table
            .entry_for(pinned.index, &pinned.slot)
            .map(|entry| entry.dirty)
            .unwrap_or(false)
    }

    async fn load_or_fetch(&self, index: u64, content: &mut Content) -> Result<Vec<u8>, CacheError> {
        if let Some(data) = self.storage.load(content).await? {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(data);
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        let data = self
            .backing
            .fetch(index)
            .await
            .map_err(|source| CacheError::Fetch { index, source })?;
        self.check_len(index, data.len())?;
        self.storage.store(content, index, data.clone()).await?;
        Ok(data)
    }

    fn check_len(&self, index: u64, len: usize) -> Result<(), CacheError> {
        if len != self.block_size {
            return Err(CacheError::BadBlock {
                index,
                len,
                block_size: self.block_size,
            });
        }
        Ok(())
    }

    /// Whole contents of block `index`.
    pub async fn read(&self, index: u64) -> Result<Vec<u8>, CacheError> {
        let pinned = self.pin(index).await?;
        let mut content = pinned.slot.content.lock().await;
        self.load_or_fetch(index, &mut content).await
    }

    /// `len` bytes of block `index` starting at `offset`.
    pub async fn read_range(
        &self,
        index: u64,
        offset: usize,
        len: usize,
    ) -> Result<Vec<u8>, CacheError> {
        if offset + len > self.block_size {
            return Err(CacheError::BadRange { offset, len });
        }
        let mut block = self.read(index).await?;
        block.truncate(offset + len);
        Ok(block.split_off(offset))
    }

    /// Replace block `index` entirely. Does not touch the store.
    pub async fn write(&self, index: u64, data: Vec<u8>) -> Result<(), CacheError> {
        self.check_len(index, data.len())?;
        let pinned = self.pin(index).await?;
        let mut content = pinned.slot.content.lock().await;
        self.storage.store(&mut content, index, data).await?;
        self.set_dirty(&pinned, true);
        Ok(())
    }

    /// Overwrite part of block `index`, loading the rest of it first.
    pub async fn write_at(&self, index: u64, offset: usize, bytes: &[u8]) -> Result<(), CacheError> {
        if offset + bytes.len() > self.block_size {
            return Err(CacheError::BadRange {
                offset,
                len: bytes.len(),
            });
        }
        if offset == 0 && bytes.len() == self.block_size {
            return self.write(index, bytes.to_vec()).await;
        }
        let pinned = self.pin(index).await?;
        let mut content = pinned.slot.content.lock().await;
        let mut block = self.load_or_fetch(index, &mut content).await?;
        block[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.storage.store(&mut content, index, block).await?;
        self.set_dirty(&pinned, true);
        Ok(())
    }

    async fn flush_pinned(&self, pinned: &Pinned<'_>) -> Result<(), CacheError> {
        let content = pinned.slot.content.lock().await;
        if !self.is_dirty(pinned) {
            return Ok(());
        }
        let index = pinned.index;
        let Some(data) = self.storage.load(&content).await? else {
            // dirty entries always hold contents
            self.set_dirty(pinned, false);
            return Ok(());
        };

        let mut attempt = 0;
        loop {
            match self.backing.flush(index, &data).await {
                Ok(()) => break,
                Err(source) if attempt + 1 < self.flush_retries => {
                    let delay = self.flush_backoff * 2u32.saturating_pow(attempt);
                    tracing::warn!(
                        index,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "flush failed, retrying: {}",
                        source
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(source) => {
                    tracing::error!(index, "flush failed, block stays dirty: {}", source);
                    return Err(CacheError::Flush { index, source });
                }
            }
        }

        self.set_dirty(pinned, false);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Write block `index` to the store if it is dirty.
    pub async fn flush(&self, index: u64) -> Result<(), CacheError> {
        match self.pin_resident(index) {
            Some(pinned) => self.flush_pinned(&pinned).await,
            None => Ok(()),
        }
    }

    /// Flush every dirty block, fanned out over the worker pool.
    ///
    /// Blocks that fail stay dirty; the error reports how many.
    pub async fn flush_all(self: &Arc<Self>) -> Result<usize, CacheError> {
        let mut dirty = self.dirty_indices();
        dirty.sort_unstable();
        let total = dirty.len();
        if total == 0 {
            return Ok(0);
        }

        let jobs = dirty
            .into_iter()
            .map(|index| {
                let cache = self.clone();
                self.pool.submit(async move { cache.flush(index).await })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut failed = 0;
        let mut reason = None;
        for job in jobs {
            let outcome = match job.await {
                Ok(result) => result,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                failed += 1;
                reason.get_or_insert_with(|| e.to_string());
            }
        }

        if failed > 0 {
            return Err(CacheError::FlushIncomplete {
                failed,
                total,
                reason: reason.unwrap_or_default(),
            });
        }
        tracing::debug!(total, "flushed dirty blocks");
        Ok(total)
    }

    /// Forget block `index` without flushing it. Used when the block is freed.
    pub async fn discard(&self, index: u64) {
        let Some(pinned) = self.pin_resident(index) else {
            return;
        };
        let mut content = pinned.slot.content.lock().await;
        self.storage.release(&mut content).await;
        let mut table = self.table.lock();
        if let Some(entry) = table.entry_for(index, &pinned.slot) {
            entry.dirty = false;
            if entry.pins == 1 {
                table.entries.remove(&index);
                table.resident -= self.entry_size();
            }
        }
    }

    fn dirty_indices(&self) -> Vec<u64> {
        self.table
            .lock()
            .entries
            .iter()
            .filter(|(_, entry)| entry.dirty)
            .map(|(index, _)| *index)
            .collect()
    }

    pub fn dirty_count(&self) -> usize {
        self.table
            .lock()
            .entries
            .values()
            .filter(|entry| entry.dirty)
            .count()
    }

    pub fn is_resident(&self, index: u64) -> bool {
        self.table.lock().entries.contains_key(&index)
    }

    pub fn stats(&self) -> CacheStats {
        let table = self.table.lock();
        CacheStats {
            kind: match self.storage {
                Storage::Memory => "memory",
                Storage::File { .. } => "file",
            },
            entries: table.entries.len(),
            dirty: table.entries.values().filter(|e| e.dirty).count(),
            resident_bytes: table.resident,
            max_bytes: self.max_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            flushes: self.counters.flushes.load(Ordering::Relaxed),
        }
    }

    /// Periodically flush dirty blocks until `shutdown` fires or the cache
    /// is dropped.
    pub fn spawn_writeback(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<()>,
    ) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                if cache.dirty_count() == 0 {
                    continue;
                }
                match cache.flush_all().await {
                    Ok(flushed) => tracing::debug!(flushed, "write-back pass complete"),
                    Err(e) => tracing::warn!("write-back pass incomplete: {}", e),
                }
            }
            tracing::debug!("write-back task stopped");
        })
    }
}

/// Spill directory name for a cache belonging to one mount session.
pub fn spill_label(volume: &str, holder: &uuid::Uuid) -> String {
    format!("{volume}-{}", holder.simple())
}
