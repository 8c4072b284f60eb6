//! Offline consistency check and repair.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use store::SharedStore;

use super::alloc::AllocationMap;
use super::layout::block_count;
use super::persist::{self, MetaRoot};
use super::superblock::{Body, Envelope};
use super::tree::{InodeKind, Tree, ROOT_INO};
use super::{validate_name, VolumeError, VolumeFormat};
use crate::chunk::{superblock_key, volume_prefix, ChunkId, ChunkKind};
use crate::config::EngineConfig;
use crate::crypto::{CryptEngine, RandomSource};
use crate::pool::PoolHandle;

#[derive(Debug, Clone, Copy, Default)]
pub struct FsckOptions {
    /// Fix what can be fixed and commit the result as a new generation
    pub repair: bool,
    /// Run even though a mount marker is present
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "problem", rename_all = "snake_case")]
pub enum TreeProblem {
    /// Directory entry pointing at an inode that does not exist
    DanglingEntry { dir: u64, name: String, ino: u64 },
    /// Volume block claimed by two files
    DuplicateBlock { block: u64, first: u64, second: u64 },
    /// File block mapped past the end of the volume
    BlockOutOfRange { ino: u64, block: u64 },
    /// Inode that no directory refers to
    Unreachable { ino: u64 },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct FsckReport {
    pub volume: String,
    pub generation: u64,
    pub checked_blocks: u64,
    /// Allocated blocks whose chunk is gone
    pub missing: Vec<u64>,
    /// Allocated blocks whose chunk fails authentication or has the wrong size
    pub corrupt: Vec<u64>,
    /// Keys under the volume that nothing references
    pub orphans: Vec<String>,
    /// Allocated blocks that are out of range or owned by no file
    pub leaked: Vec<u64>,
    pub tree_problems: Vec<TreeProblem>,
    /// Metadata that could not be loaded or authenticated
    pub damaged_metadata: Vec<String>,
    /// Set when a repair committed a new generation
    pub repaired: bool,
}

impl FsckReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty()
            && self.corrupt.is_empty()
            && self.orphans.is_empty()
            && self.leaked.is_empty()
            && self.tree_problems.is_empty()
            && self.damaged_metadata.is_empty()
    }

    pub fn problem_count(&self) -> usize {
        self.missing.len()
            + self.corrupt.len()
            + self.orphans.len()
            + self.leaked.len()
            + self.tree_problems.len()
            + self.damaged_metadata.len()
    }
}

enum BlockHealth {
    Ok,
    Missing,
    Corrupt,
}

/// Verify every chunk a volume references and look for garbage.
///
/// The volume must be unmounted unless `force` is set; a live session's
/// uncommitted chunks would otherwise show up as orphans.
pub async fn fsck(
    store: SharedStore,
    name: &str,
    password: &str,
    options: FsckOptions,
    config: &EngineConfig,
    pool: &PoolHandle,
) -> Result<FsckReport, VolumeError> {
    validate_name(name)?;
    let mut envelope = Envelope::load(&store, name).await?;
    if let Some(marker) = envelope.marker.clone() {
        if !options.force {
            return Err(VolumeError::AlreadyMounted {
                volume: name.to_string(),
                marker,
            });
        }
        tracing::warn!(volume = name, %marker, "checking a volume that is marked mounted");
    }

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
    let mut report = FsckReport {
        volume: name.to_string(),
        generation: body.generation,
        ..FsckReport::default()
    };

    let loaded = persist::load_blob(&crypt, pool, ChunkId::alloc, &body.alloc)
        .await
        .and_then(|blob| AllocationMap::decode(&blob));
    let mut map = match loaded {
        Ok(map) => map,
        Err(e) if is_damage(&e) => {
            tracing::warn!(
                volume = name,
                error = %e,
                "allocation map unreadable, rebuilding it from the bucket listing"
            );
            report.damaged_metadata.push(format!("allocation map: {e}"));
            recover_map(&store, name).await?
        }
        Err(e) => return Err(e),
    };
    let mut tree = match (&body.tree, body.format) {
        (Some(root), VolumeFormat::Tree) => Some(Tree::decode(
            &persist::load_blob(&crypt, pool, ChunkId::tree, root).await?,
        )?),
        (None, VolumeFormat::Tree) => {
            return Err(VolumeError::Inconsistent(
                "tree volume has no tree metadata".into(),
            ))
        }
        _ => None,
    };

    check_blocks(&crypt, pool, &map, body.block_size, &mut report).await?;
    report.orphans = find_orphans(&store, name, &body, &map).await?;

    let total = block_count(body.size, body.block_size);
    match &tree {
        Some(tree) => {
            report.tree_problems = check_tree(tree, total);
            let owned = tree.used_blocks();
            report.leaked = map
                .iter()
                .map(|(index, _)| index)
                .filter(|index| !owned.contains(index) || *index >= total)
                .collect();
        }
        None => {
            report.leaked = map
                .iter()
                .map(|(index, _)| index)
                .filter(|index| *index >= total)
                .collect();
        }
    }

    tracing::info!(
        volume = name,
        generation = body.generation,
        checked = report.checked_blocks,
        problems = report.problem_count(),
        "fsck complete"
    );

    if options.repair && !report.is_clean() {
        repair(
            &crypt,
            pool,
            &mut envelope,
            &body,
            &mut map,
            tree.as_mut(),
            &mut report,
        )
        .await?;
    }
    Ok(report)
}

/// Whether a failed metadata load is damage to report rather than an error.
fn is_damage(err: &VolumeError) -> bool {
    err.is_authentication_failure()
        || matches!(err, VolumeError::Chunk(e) if e.is_not_found())
        || matches!(err, VolumeError::Malformed(_) | VolumeError::Inconsistent(_))
}

/// Rebuild an allocation map from the data chunks in the bucket, taking the
/// newest epoch of every block. Older copies then show up as orphans.
async fn recover_map(store: &SharedStore, name: &str) -> Result<AllocationMap, VolumeError> {
    let mut map = AllocationMap::new();
    for key in store.list(&volume_prefix(name)).await? {
        if let Some(id) = ChunkId::parse(name, &key).filter(|id| id.kind == ChunkKind::Data) {
            if map.get(id.index).map_or(true, |epoch| epoch < id.epoch) {
                map.set(id.index, id.epoch);
            }
        }
    }
    Ok(map)
}

async fn check_blocks(
    crypt: &CryptEngine,
    pool: &PoolHandle,
    map: &AllocationMap,
    block_size: u32,
    report: &mut FsckReport,
) -> Result<(), VolumeError> {
    let mut checks = stream::iter(map.iter().collect::<Vec<_>>())
        .map(|(index, epoch)| {
            let crypt = crypt.clone();
            async move {
                let job = pool.submit(async move {
                    match crypt.get_chunk(ChunkId::data(index, epoch)).await {
                        Ok(data) if data.len() == block_size as usize => Ok(BlockHealth::Ok),
                        Ok(_) => Ok(BlockHealth::Corrupt),
                        Err(e) if e.is_not_found() => Ok(BlockHealth::Missing),
                        Err(e) if e.is_authentication_failure() => Ok(BlockHealth::Corrupt),
                        Err(e) => Err(e),
                    }
                })?;
                Ok::<_, VolumeError>((index, job.await??))
            }
        })
        .buffer_unordered(pool.size().max(1) * 2);

    while let Some(outcome) = checks.next().await {
        let (index, health) = outcome?;
        report.checked_blocks += 1;
        match health {
            BlockHealth::Ok => {}
            BlockHealth::Missing => {
                tracing::warn!(index, "block chunk missing");
                report.missing.push(index);
            }
            BlockHealth::Corrupt => {
                tracing::warn!(index, "block chunk failed authentication");
                report.corrupt.push(index);
            }
        }
    }
    report.missing.sort_unstable();
    report.corrupt.sort_unstable();
    Ok(())
}

async fn find_orphans(
    store: &SharedStore,
    name: &str,
    body: &Body,
    map: &AllocationMap,
) -> Result<Vec<String>, VolumeError> {
    let mut referenced: HashSet<ChunkId> = map
        .iter()
        .map(|(index, epoch)| ChunkId::data(index, epoch))
        .collect();
    referenced.extend(body.alloc.part_ids(ChunkId::alloc));
    if let Some(root) = &body.tree {
        referenced.extend(root.part_ids(ChunkId::tree));
    }

    let superblock = superblock_key(name);
    let orphans = store
        .list(&volume_prefix(name))
        .await?
        .into_iter()
        .filter(|key| *key != superblock)
        .filter(|key| match ChunkId::parse(name, key) {
            Some(id) => !referenced.contains(&id),
            None => true,
        })
        .collect();
    Ok(orphans)
}

fn check_tree(tree: &Tree, total: u64) -> Vec<TreeProblem> {
    let inodes = tree.inodes();
    let mut problems = Vec::new();
    let mut reachable = BTreeSet::from([ROOT_INO]);
    for (dir, inode) in inodes {
        if let InodeKind::Dir { entries } = &inode.kind {
            for (name, ino) in entries {
                if inodes.contains_key(ino) {
                    reachable.insert(*ino);
                } else {
                    problems.push(TreeProblem::DanglingEntry {
                        dir: *dir,
                        name: name.clone(),
                        ino: *ino,
                    });
                }
            }
        }
    }

    let mut owners: BTreeMap<u64, u64> = BTreeMap::new();
    for (ino, inode) in inodes {
        if !reachable.contains(ino) {
            problems.push(TreeProblem::Unreachable { ino: *ino });
        }
        if let InodeKind::File { blocks, .. } = &inode.kind {
            for block in blocks.values() {
                if *block >= total {
                    problems.push(TreeProblem::BlockOutOfRange {
                        ino: *ino,
                        block: *block,
                    });
                } else if let Some(first) = owners.insert(*block, *ino) {
                    owners.insert(*block, first);
                    problems.push(TreeProblem::DuplicateBlock {
                        block: *block,
                        first,
                        second: *ino,
                    });
                }
            }
        }
    }
    problems
}

/// Drop whatever cannot be trusted, commit the result as the next
/// generation and delete the garbage.
///
/// Missing or corrupt blocks become holes. Files keep their first claim on
/// a shared block; later claims and out-of-range mappings become holes.
async fn repair(
    crypt: &CryptEngine,
    pool: &PoolHandle,
    envelope: &mut Envelope,
    body: &Body,
    map: &mut AllocationMap,
    tree: Option<&mut Tree>,
    report: &mut FsckReport,
) -> Result<(), VolumeError> {
    let mut garbage: Vec<String> = report.orphans.clone();
    let volume = crypt.volume().to_string();
    for index in report
        .missing
        .iter()
        .chain(&report.corrupt)
        .chain(&report.leaked)
    {
        if let Some(epoch) = map.remove(*index) {
            garbage.push(ChunkId::data(*index, epoch).key(&volume));
        }
    }

    let total = block_count(body.size, body.block_size);
    let new_generation = body.generation + 1;
    // a fresh epoch, so no committed part is overwritten before the superblock
    let epoch = envelope.reserve_epoch(body.generation);
    let tree_root = match tree {
        Some(tree) => {
            repair_tree(tree, &report.tree_problems, total);
            // blocks that became holes no longer need their chunks
            let owned = tree.used_blocks().clone();
            let unowned: Vec<u64> = map
                .iter()
                .map(|(index, _)| index)
                .filter(|index| !owned.contains(index))
                .collect();
            for index in unowned {
                if let Some(epoch) = map.remove(index) {
                    garbage.push(ChunkId::data(index, epoch).key(&volume));
                }
            }
            Some(persist::store_blob(crypt, pool, ChunkId::tree, &tree.encode()?, epoch).await?)
        }
        None => body.tree,
    };
    let alloc_root =
        persist::store_blob(crypt, pool, ChunkId::alloc, &map.encode()?, epoch).await?;

    let repaired = Body {
        generation: new_generation,
        alloc: alloc_root,
        tree: tree_root,
        committed: Utc::now(),
        ..body.clone()
    };
    envelope.seal_body(crypt, &repaired)?;
    envelope.save(crypt.store(), &volume).await?;

    garbage.extend(old_parts(&volume, &body.alloc, ChunkId::alloc));
    if let Some(root) = &body.tree {
        garbage.extend(old_parts(&volume, root, ChunkId::tree));
    }
    let failed = persist::delete_keys(crypt.store(), pool, garbage).await?;
    if !failed.is_empty() {
        tracing::warn!(volume, failed = failed.len(), "some garbage could not be deleted");
    }

    report.generation = new_generation;
    report.repaired = true;
    tracing::info!(volume, generation = new_generation, "fsck repair committed");
    Ok(())
}

fn old_parts(volume: &str, root: &MetaRoot, ctor: fn(u64, u64) -> ChunkId) -> Vec<String> {
    root.part_ids(ctor)
        .into_iter()
        .map(|id| id.key(volume))
        .collect()
}

fn repair_tree(tree: &mut Tree, problems: &[TreeProblem], total: u64) {
    let inodes = tree.inodes_mut();
    for problem in problems {
        match problem {
            TreeProblem::DanglingEntry { dir, name, .. } => {
                if let Some(InodeKind::Dir { entries }) = inodes.get_mut(dir).map(|i| &mut i.kind) {
                    entries.remove(name);
                }
            }
            TreeProblem::DuplicateBlock { block, second, .. } => {
                if let Some(InodeKind::File { blocks, .. }) =
                    inodes.get_mut(second).map(|i| &mut i.kind)
                {
                    blocks.retain(|_, b| *b != *block);
                }
            }
            TreeProblem::BlockOutOfRange { ino, .. } => {
                if let Some(InodeKind::File { blocks, .. }) = inodes.get_mut(ino).map(|i| &mut i.kind)
                {
                    blocks.retain(|_, b| *b < total);
                }
            }
            TreeProblem::Unreachable { ino } => {
                inodes.remove(ino);
            }
        }
    }
    tree.rebuild_used();
    tree.mark_dirty();
}
