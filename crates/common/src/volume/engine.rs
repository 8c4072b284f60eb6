use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use store::SharedStore;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::admin::{self, VolumeInfo};
use super::alloc::AllocationMap;
use super::layout::{
    block_count, check_bounds, round_size, split_range, validate_block_size, BLOCK_SIZE,
};
use super::persist::{self, MetaRoot};
use super::superblock::{Body, Envelope, MountMarker};
use super::tree::Tree;
use super::{
    validate_name, CreateOptions, MountOptions, MountReport, VolumeError, VolumeFormat,
    VolumeState, VolumeStats,
};
use crate::cache::{spill_label, Backing, Cache, CacheError};
use crate::chunk::ChunkId;
use crate::config::EngineConfig;
use crate::crypto::{generate_salt, ChunkError, CryptEngine, RandomSource};
use crate::pool::PoolHandle;

/// Allocation metadata of a mounted volume. Only touched under its mutex,
/// and never held across an await.
pub(super) struct AllocState {
    /// Last committed generation
    pub generation: u64,
    pub map: AllocationMap,
    /// Committed chunks replaced or freed since the last commit
    pub superseded: Vec<ChunkId>,
    pub alloc_root: MetaRoot,
    pub tree_root: Option<MetaRoot>,
    pub dirty: bool,
    /// Epoch reserved in the superblock for this session's writes
    pub epoch: u64,
}

impl AllocState {
    /// Epoch of every chunk written before the next commit.
    pub fn session_epoch(&self) -> u64 {
        self.epoch
    }
}

/// Moves blocks between the cache and sealed data chunks.
struct BlockBacking {
    crypt: CryptEngine,
    alloc: Arc<Mutex<AllocState>>,
    block_size: usize,
}

#[async_trait::async_trait]
impl Backing for BlockBacking {
    async fn fetch(&self, index: u64) -> Result<Vec<u8>, ChunkError> {
        let epoch = self.alloc.lock().map.get(index);
        match epoch {
            // free blocks are holes
            None => Ok(vec![0; self.block_size]),
            Some(epoch) => self.crypt.get_chunk(ChunkId::data(index, epoch)).await,
        }
    }

    async fn flush(&self, index: u64, data: &[u8]) -> Result<(), ChunkError> {
        let epoch = self.alloc.lock().session_epoch();
        self.crypt.put_chunk(ChunkId::data(index, epoch), data).await?;

        let mut state = self.alloc.lock();
        if let Some(old) = state.map.set(index, epoch) {
            if old != epoch {
                state.superseded.push(ChunkId::data(index, old));
            }
        }
        state.dirty = true;
        Ok(())
    }
}

/// One piece of a read: `len` bytes at `offset` inside volume block `index`,
/// or zeros when there is no block behind it.
pub(super) struct ReadPiece {
    pub index: Option<u64>,
    pub offset: usize,
    pub len: usize,
}

pub(super) struct WritePiece {
    pub index: u64,
    pub offset: usize,
    pub data: Vec<u8>,
}

struct Writeback {
    stop: watch::Sender<()>,
    task: JoinHandle<()>,
}

/// A mounted volume.
///
/// Public operations hold the I/O gate shared; commit, unmount and abandon
/// hold it exclusively so they see no half-applied writes. Lock order is
/// gate, tree, cache entry, allocation state.
pub struct Volume {
    pub(super) name: String,
    pub(super) format: VolumeFormat,
    pub(super) size: u64,
    pub(super) block_size: u32,
    readonly: bool,
    holder: Uuid,
    created: DateTime<Utc>,
    crypt: CryptEngine,
    pub(super) cache: Arc<Cache>,
    pub(super) pool: PoolHandle,
    pub(super) alloc: Arc<Mutex<AllocState>>,
    envelope: Mutex<Envelope>,
    pub(super) io_gate: RwLock<()>,
    pub(super) tree: RwLock<Option<Tree>>,
    state: Mutex<VolumeState>,
    writeback: Mutex<Option<Writeback>>,
    writeback_interval: Duration,
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("format", &self.format)
            .field("size", &self.size)
            .field("readonly", &self.readonly)
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl Volume {
    /// Write a fresh generation-0 superblock for `name`.
    pub async fn create(
        store: SharedStore,
        name: &str,
        password: &str,
        options: &CreateOptions,
        config: &EngineConfig,
        pool: &PoolHandle,
    ) -> Result<VolumeInfo, VolumeError> {
        validate_name(name)?;
        let block_size = options.block_size.unwrap_or(BLOCK_SIZE);
        validate_block_size(block_size)?;
        let size = round_size(options.size, block_size)?;

        match Envelope::load(&store, name).await {
            Ok(existing) => {
                if !options.overwrite {
                    return Err(VolumeError::AlreadyExists(name.to_string()));
                }
                if let Some(marker) = existing.marker {
                    return Err(VolumeError::AlreadyMounted {
                        volume: name.to_string(),
                        marker,
                    });
                }
                admin::delete(&store, name, pool, false).await?;
            }
            Err(VolumeError::NotFound(_)) => {
                // leftovers of an interrupted delete would shadow new chunks
                if !store.list(name).await?.is_empty() {
                    if !options.overwrite {
                        return Err(VolumeError::AlreadyExists(format!(
                            "{name} (partially deleted; run delete again)"
                        )));
                    }
                    admin::delete(&store, name, pool, false).await?;
                }
            }
            Err(e) => return Err(e),
        }

        let rng = Arc::new(RandomSource::new(config.norandom));
        let salt = generate_salt(&rng)?;
        let crypt =
            CryptEngine::unlock(name, password, &salt, config.kdf, rng, store.clone()).await?;

        let tree = match options.format {
            VolumeFormat::Tree => Some(
                persist::store_blob(&crypt, pool, ChunkId::tree, &Tree::new().encode()?, 0)
                    .await?,
            ),
            VolumeFormat::Block => None,
        };

        let now = Utc::now();
        let body = Body {
            format: options.format,
            size,
            block_size,
            generation: 0,
            alloc: MetaRoot::default(),
            tree,
            created: now,
            committed: now,
        };
        let mut envelope = Envelope::new(
            options.format,
            size,
            block_size,
            salt.to_vec(),
            config.kdf,
            crypt.make_verifier()?,
        );
        envelope.seal_body(&crypt, &body)?;
        envelope.save(&store, name).await?;

        tracing::info!(
            volume = name,
            format = %options.format,
            size,
            block_size,
            "volume created"
        );
        Ok(VolumeInfo::from_envelope(name, &envelope))
    }

    /// Open `name` for I/O.
    ///
    /// Fails with `AlreadyMounted` if another session's marker is present,
    /// unless `force` is set, in which case the override is logged and
    /// reported in the returned [`MountReport`].
    pub async fn mount(
        store: SharedStore,
        name: &str,
        password: &str,
        options: MountOptions,
        config: &EngineConfig,
        pool: PoolHandle,
    ) -> Result<(Volume, MountReport), VolumeError> {
        validate_name(name)?;
        let mut envelope = Envelope::load(&store, name).await?;
        let rng = Arc::new(RandomSource::new(config.norandom));
        let crypt = CryptEngine::unlock(
            name,
            password,
            &envelope.salt,
            envelope.kdf,
            rng,
            store.clone(),
        )
        .await?;
        let body = envelope.open_body(&crypt)?;

        let mut report = MountReport {
            generation: body.generation,
            ..MountReport::default()
        };
        if let Some(marker) = envelope.marker.clone() {
            if options.force {
                tracing::warn!(volume = name, %marker, "forcing mount over existing mount marker");
                report
                    .warnings
                    .push(format!("forced mount over marker held by {marker}"));
                report.forced_over = Some(marker);
            } else if options.readonly {
                tracing::warn!(volume = name, %marker, "read-only mount of a volume mounted elsewhere");
                report.warnings.push(format!(
                    "volume is mounted read-write by {marker}; this view may be stale"
                ));
            } else {
                return Err(VolumeError::AlreadyMounted {
                    volume: name.to_string(),
                    marker,
                });
            }
        }

        let map = AllocationMap::decode(
            &persist::load_blob(&crypt, &pool, ChunkId::alloc, &body.alloc).await?,
        )?;
        let tree = match (body.format, &body.tree) {
            (VolumeFormat::Tree, Some(root)) => Some(Tree::decode(
                &persist::load_blob(&crypt, &pool, ChunkId::tree, root).await?,
            )?),
            (VolumeFormat::Tree, None) => {
                return Err(VolumeError::Inconsistent(
                    "tree volume has no tree metadata".into(),
                ))
            }
            (VolumeFormat::Block, _) => None,
        };

        let holder = Uuid::new_v4();
        // read-only sessions never write, so they reserve nothing
        let epoch = if options.readonly {
            body.generation + 1
        } else {
            envelope.reserve_epoch(body.generation)
        };
        let alloc = Arc::new(Mutex::new(AllocState {
            generation: body.generation,
            map,
            superseded: Vec::new(),
            alloc_root: body.alloc,
            tree_root: body.tree,
            dirty: false,
            epoch,
        }));
        let backing = Arc::new(BlockBacking {
            crypt: crypt.clone(),
            alloc: alloc.clone(),
            block_size: body.block_size as usize,
        });
        let cache = Arc::new(Cache::new(
            &config.cache,
            body.block_size as usize,
            &spill_label(name, &holder),
            backing,
            pool.clone(),
        )?);

        if !options.readonly {
            envelope.marker = Some(MountMarker::new(holder));
            envelope.save(&store, name).await?;
        }

        tracing::info!(
            volume = name,
            generation = body.generation,
            epoch,
            readonly = options.readonly,
            allocated = alloc.lock().map.len(),
            "volume mounted"
        );

        let volume = Volume {
            name: name.to_string(),
            format: body.format,
            size: body.size,
            block_size: body.block_size,
            readonly: options.readonly,
            holder,
            created: body.created,
            crypt,
            cache,
            pool,
            alloc,
            envelope: Mutex::new(envelope),
            io_gate: RwLock::new(()),
            tree: RwLock::new(tree),
            state: Mutex::new(VolumeState::Clean),
            writeback: Mutex::new(None),
            writeback_interval: config.writeback_interval(),
        };
        Ok((volume, report))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn format(&self) -> VolumeFormat {
        self.format
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Identifier recorded in this session's mount marker.
    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Last committed generation.
    pub fn generation(&self) -> u64 {
        self.alloc.lock().generation
    }

    pub fn state(&self) -> VolumeState {
        *self.state.lock()
    }

    pub fn stats(&self) -> VolumeStats {
        let (generation, allocated) = {
            let alloc = self.alloc.lock();
            (alloc.generation, alloc.map.len() as u64)
        };
        VolumeStats {
            name: self.name.clone(),
            format: self.format,
            size: self.size,
            block_size: self.block_size,
            generation,
            allocated_blocks: allocated,
            state: self.state(),
            readonly: self.readonly,
            cache: self.cache.stats(),
        }
    }

    pub(super) fn ensure_readable(&self) -> Result<(), VolumeError> {
        match self.state() {
            VolumeState::Unmounted | VolumeState::Unmounting => {
                Err(VolumeError::NotMounted(self.name.clone()))
            }
            _ => Ok(()),
        }
    }

    pub(super) fn ensure_writable(&self) -> Result<(), VolumeError> {
        self.ensure_readable()?;
        if self.readonly {
            return Err(VolumeError::ReadOnly);
        }
        if self.state() == VolumeState::Inconsistent {
            return Err(VolumeError::Inconsistent(format!(
                "'{}' failed an integrity check this session; run fsck",
                self.name
            )));
        }
        Ok(())
    }

    pub(super) fn ensure_format(&self, expected: VolumeFormat) -> Result<(), VolumeError> {
        if self.format != expected {
            return Err(VolumeError::WrongFormat {
                volume: self.name.clone(),
                expected,
                actual: self.format,
            });
        }
        Ok(())
    }

    pub(super) fn mark_dirty(&self) {
        let mut state = self.state.lock();
        if *state == VolumeState::Clean {
            *state = VolumeState::Dirty;
        }
    }

    /// Surface a cache failure, marking the volume inconsistent when a
    /// chunk failed authentication.
    pub(super) fn check<T>(&self, result: Result<T, CacheError>) -> Result<T, VolumeError> {
        result.map_err(|e| {
            if e.is_authentication_failure() {
                tracing::error!(volume = %self.name, "integrity violation: {}", e);
                *self.state.lock() = VolumeState::Inconsistent;
            }
            VolumeError::from(e)
        })
    }

    pub(super) async fn read_pieces(&self, pieces: Vec<ReadPiece>) -> Result<Vec<u8>, VolumeError> {
        let total: usize = pieces.iter().map(|p| p.len).sum();
        let jobs = pieces
            .iter()
            .map(|piece| match piece.index {
                Some(index) => {
                    let cache = self.cache.clone();
                    let (offset, len) = (piece.offset, piece.len);
                    self.pool
                        .submit(async move { cache.read_range(index, offset, len).await })
                        .map(Some)
                }
                None => Ok(None),
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut out = Vec::with_capacity(total);
        for (piece, job) in pieces.iter().zip(jobs) {
            match job {
                Some(job) => out.extend_from_slice(&self.check(job.await?)?),
                None => out.resize(out.len() + piece.len, 0),
            }
        }
        Ok(out)
    }

    /// Apply writes to distinct blocks in parallel. Every piece is awaited
    /// before the first error is returned.
    pub(super) async fn write_pieces(&self, pieces: Vec<WritePiece>) -> Result<(), VolumeError> {
        self.mark_dirty();
        let block_size = self.block_size as usize;
        let jobs = pieces
            .into_iter()
            .map(|piece| {
                let cache = self.cache.clone();
                self.pool.submit(async move {
                    if piece.offset == 0 && piece.data.len() == block_size {
                        cache.write(piece.index, piece.data).await
                    } else {
                        cache.write_at(piece.index, piece.offset, &piece.data).await
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut first_error = None;
        for job in futures::future::join_all(jobs).await {
            let outcome = match job {
                Ok(result) => self.check(result),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = outcome {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop a block's contents and return it to the free pool.
    pub(super) async fn free_block(&self, index: u64) {
        self.cache.discard(index).await;
        let mut alloc = self.alloc.lock();
        if let Some(epoch) = alloc.map.remove(index) {
            alloc.superseded.push(ChunkId::data(index, epoch));
            alloc.dirty = true;
        }
    }

    /// Read `len` bytes at `offset` of a block volume.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>, VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_readable()?;
        self.ensure_format(VolumeFormat::Block)?;
        check_bounds(offset, len, self.size)?;

        let pieces = split_range(self.block_size, offset, len)
            .into_iter()
            .map(|span| ReadPiece {
                index: Some(span.index),
                offset: span.offset_in_block,
                len: span.len,
            })
            .collect();
        self.read_pieces(pieces).await
    }

    /// Write `data` at `offset` of a block volume. Partial blocks are
    /// merged with their current contents.
    pub async fn write(&self, offset: u64, data: &[u8]) -> Result<(), VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_writable()?;
        self.ensure_format(VolumeFormat::Block)?;
        check_bounds(offset, data.len(), self.size)?;

        let pieces = split_range(self.block_size, offset, data.len())
            .into_iter()
            .map(|span| WritePiece {
                index: span.index,
                offset: span.offset_in_block,
                data: data[span.buf_offset..span.buf_offset + span.len].to_vec(),
            })
            .collect();
        self.write_pieces(pieces).await
    }

    /// TRIM: free every block wholly inside the range and zero the partial
    /// edges. Returns the number of blocks freed.
    pub async fn discard(&self, offset: u64, len: usize) -> Result<u64, VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_writable()?;
        self.ensure_format(VolumeFormat::Block)?;
        check_bounds(offset, len, self.size)?;
        self.mark_dirty();

        let mut freed = 0;
        let mut edges = Vec::new();
        for span in split_range(self.block_size, offset, len) {
            if span.is_whole(self.block_size) {
                self.free_block(span.index).await;
                freed += 1;
            } else {
                edges.push(WritePiece {
                    index: span.index,
                    offset: span.offset_in_block,
                    data: vec![0; span.len],
                });
            }
        }
        self.write_pieces(edges).await?;
        tracing::debug!(volume = %self.name, offset, len, freed, "discarded range");
        Ok(freed)
    }

    /// Durable checkpoint: flush, persist metadata and write generation + 1,
    /// keeping the volume mounted.
    pub async fn commit(&self) -> Result<u64, VolumeError> {
        let _gate = self.io_gate.write().await;
        self.ensure_writable()?;
        self.commit_locked(true).await
    }

    async fn commit_locked(&self, keep_marker: bool) -> Result<u64, VolumeError> {
        let store = self.crypt.store();

        // refuse to clobber a superblock someone else has taken over
        let mut envelope = self.envelope.lock().clone();
        let current = Envelope::load(store, &self.name).await?;
        match &current.marker {
            Some(marker) if marker.holder != self.holder => {
                return Err(VolumeError::AlreadyMounted {
                    volume: self.name.clone(),
                    marker: marker.clone(),
                })
            }
            _ if current.body != envelope.body => {
                return Err(VolumeError::Inconsistent(format!(
                    "'{}' superblock was rewritten by another session",
                    self.name
                )))
            }
            _ => {}
        }
        self.check(self.cache.flush_all().await)?;

        let (generation, epoch, old_alloc_root, old_tree_root, alloc_blob) = {
            let alloc = self.alloc.lock();
            let blob = if alloc.dirty {
                Some(alloc.map.encode()?)
            } else {
                None
            };
            (
                alloc.generation,
                alloc.epoch,
                alloc.alloc_root,
                alloc.tree_root,
                blob,
            )
        };
        let new_generation = generation + 1;

        let alloc_root = match alloc_blob {
            Some(blob) => {
                persist::store_blob(&self.crypt, &self.pool, ChunkId::alloc, &blob, epoch).await?
            }
            None => old_alloc_root,
        };

        let tree_blob = match self.tree.read().await.as_ref() {
            Some(tree) if tree.is_dirty() => Some(tree.encode()?),
            _ => None,
        };
        let tree_written = tree_blob.is_some();
        let tree_root = match tree_blob {
            Some(blob) => Some(
                persist::store_blob(&self.crypt, &self.pool, ChunkId::tree, &blob, epoch).await?,
            ),
            None => old_tree_root,
        };

        let body = Body {
            format: self.format,
            size: self.size,
            block_size: self.block_size,
            generation: new_generation,
            alloc: alloc_root,
            tree: tree_root,
            created: self.created,
            committed: Utc::now(),
        };
        // committed keys are never rewritten, so a session that stays
        // mounted moves on to a fresh epoch
        let next_epoch = if keep_marker {
            envelope.epoch = envelope.epoch.max(current.epoch).max(epoch) + 1;
            envelope.epoch
        } else {
            envelope.marker = None;
            envelope.epoch = envelope.epoch.max(current.epoch);
            epoch
        };
        envelope.seal_body(&self.crypt, &body)?;
        // the commit point
        envelope.save(store, &self.name).await?;
        *self.envelope.lock() = envelope;

        let garbage = {
            let mut alloc = self.alloc.lock();
            alloc.generation = new_generation;
            alloc.epoch = next_epoch;
            let mut garbage: Vec<ChunkId> = alloc.superseded.drain(..).collect();
            garbage.retain(|id| alloc.map.get(id.index) != Some(id.epoch));
            if alloc_root != old_alloc_root {
                garbage.extend(old_alloc_root.part_ids(ChunkId::alloc));
            }
            if let Some(old) = old_tree_root.filter(|old| Some(*old) != tree_root) {
                garbage.extend(old.part_ids(ChunkId::tree));
            }
            alloc.alloc_root = alloc_root;
            alloc.tree_root = tree_root;
            alloc.dirty = false;
            garbage
        };
        if tree_written {
            if let Some(tree) = self.tree.write().await.as_mut() {
                tree.mark_clean();
            }
        }
        {
            let mut state = self.state.lock();
            if *state != VolumeState::Inconsistent {
                *state = VolumeState::Clean;
            }
        }

        tracing::info!(volume = %self.name, generation = new_generation, "volume committed");
        self.collect_garbage(garbage).await;
        Ok(new_generation)
    }

    /// Delete superseded chunks. Failures only leave orphans for fsck.
    async fn collect_garbage(&self, garbage: Vec<ChunkId>) {
        if garbage.is_empty() {
            return;
        }
        let keys: Vec<String> = garbage.iter().map(|id| id.key(&self.name)).collect();
        let total = keys.len();
        match persist::delete_keys(self.crypt.store(), &self.pool, keys).await {
            Ok(failed) if failed.is_empty() => {
                tracing::debug!(volume = %self.name, total, "collected superseded chunks")
            }
            Ok(failed) => tracing::warn!(
                volume = %self.name,
                failed = failed.len(),
                total,
                "some superseded chunks were not deleted; fsck will report them"
            ),
            Err(e) => tracing::warn!(volume = %self.name, "garbage collection failed: {}", e),
        }
    }

    /// Flush everything, write the final superblock and clear the marker.
    ///
    /// On failure the generation is not advanced and the volume stays
    /// mounted and dirty; retry or [`Volume::abandon`].
    pub async fn unmount(&self) -> Result<u64, VolumeError> {
        let _gate = self.io_gate.write().await;
        match self.state() {
            VolumeState::Unmounted => return Err(VolumeError::NotMounted(self.name.clone())),
            VolumeState::Inconsistent if !self.readonly => {
                return Err(VolumeError::UnmountFailed {
                    volume: self.name.clone(),
                    source: Box::new(VolumeError::Inconsistent(
                        "integrity violation detected this session".into(),
                    )),
                })
            }
            _ => {}
        }
        self.stop_writeback().await;

        if self.readonly {
            *self.state.lock() = VolumeState::Unmounted;
            tracing::info!(volume = %self.name, "read-only volume unmounted");
            return Ok(self.generation());
        }

        *self.state.lock() = VolumeState::Unmounting;
        match self.commit_locked(false).await {
            Ok(generation) => {
                *self.state.lock() = VolumeState::Unmounted;
                tracing::info!(volume = %self.name, generation, "volume unmounted");
                Ok(generation)
            }
            Err(e) => {
                *self.state.lock() = VolumeState::Dirty;
                tracing::error!(volume = %self.name, "unmount failed: {}", e);
                Err(VolumeError::UnmountFailed {
                    volume: self.name.clone(),
                    source: Box::new(e),
                })
            }
        }
    }

    /// Give up on the session: drop uncommitted writes and release the
    /// mount marker. The last committed generation stays current.
    pub async fn abandon(&self) -> Result<(), VolumeError> {
        let _gate = self.io_gate.write().await;
        if self.state() == VolumeState::Unmounted {
            return Err(VolumeError::NotMounted(self.name.clone()));
        }
        self.stop_writeback().await;
        *self.state.lock() = VolumeState::Unmounted;
        tracing::warn!(
            volume = %self.name,
            dropped = self.cache.dirty_count(),
            "session abandoned, uncommitted writes discarded"
        );

        if self.readonly {
            return Ok(());
        }
        let store = self.crypt.store();
        let mut current = match Envelope::load(store, &self.name).await {
            Ok(envelope) => envelope,
            // deleted underneath us, no marker left to clear
            Err(VolumeError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        if current
            .marker
            .as_ref()
            .is_some_and(|marker| marker.holder == self.holder)
        {
            current.marker = None;
            current.save(store, &self.name).await?;
        }
        Ok(())
    }

    /// Start flushing dirty blocks in the background every
    /// `writeback_secs`. Stopped by unmount or abandon.
    pub fn start_writeback(&self) {
        if self.readonly {
            return;
        }
        let mut writeback = self.writeback.lock();
        if writeback.is_some() {
            return;
        }
        let (stop, rx) = watch::channel(());
        let task = self.cache.spawn_writeback(self.writeback_interval, rx);
        *writeback = Some(Writeback { stop, task });
    }

    async fn stop_writeback(&self) {
        let writeback = self.writeback.lock().take();
        if let Some(Writeback { stop, task }) = writeback {
            let _ = stop.send(());
            if let Err(e) = task.await {
                tracing::warn!(volume = %self.name, "write-back task failed: {}", e);
            }
        }
    }

    pub fn info(&self) -> VolumeInfo {
        VolumeInfo::from_envelope(&self.name, &self.envelope.lock())
    }

    pub fn allocated_blocks(&self) -> u64 {
        self.alloc.lock().map.len() as u64
    }

    pub fn total_blocks(&self) -> u64 {
        block_count(self.size, self.block_size)
    }
}

impl Drop for Volume {
    fn drop(&mut self) {
        let state = *self.state.get_mut();
        if state != VolumeState::Unmounted {
            tracing::warn!(
                volume = %self.name,
                ?state,
                "volume dropped while mounted; uncommitted writes are lost and the mount marker stays"
            );
        }
    }
}
