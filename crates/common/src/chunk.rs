//! Chunk identity: where a unit of storage lives and what it is bound to.
//!
//! A chunk is addressed by `(volume, kind, index, epoch)`. The same tuple is
//! both the object key in the bucket and the associated data the chunk is
//! sealed under, so a chunk copied to another coordinate fails to open.
//!
//! Key layout (stable across versions):
//!
//! ```text
//! <volume>/superblock
//! <volume>/data/<index:016x>.<epoch:016x>
//! <volume>/alloc/<part:016x>.<epoch:016x>
//! <volume>/tree/<part:016x>.<epoch:016x>
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Domain separator mixed into every chunk's associated data.
const CONTEXT_DOMAIN: &[u8] = b"cloudfs/chunk/v1";

pub const SUPERBLOCK_NAME: &str = "superblock";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Contents of one logical block
    Data,
    /// One part of the serialized allocation map
    Alloc,
    /// One part of the serialized directory/inode tree
    Tree,
    /// The sealed body of the superblock
    Superblock,
    /// The password verifier embedded in the superblock
    Verifier,
}

impl ChunkKind {
    fn tag(&self) -> u8 {
        match self {
            ChunkKind::Data => 1,
            ChunkKind::Alloc => 2,
            ChunkKind::Tree => 3,
            ChunkKind::Superblock => 4,
            ChunkKind::Verifier => 5,
        }
    }

    fn dir(&self) -> Option<&'static str> {
        match self {
            ChunkKind::Data => Some("data"),
            ChunkKind::Alloc => Some("alloc"),
            ChunkKind::Tree => Some("tree"),
            ChunkKind::Superblock | ChunkKind::Verifier => None,
        }
    }

    fn from_dir(dir: &str) -> Option<Self> {
        match dir {
            "data" => Some(ChunkKind::Data),
            "alloc" => Some(ChunkKind::Alloc),
            "tree" => Some(ChunkKind::Tree),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId {
    pub kind: ChunkKind,
    pub index: u64,
    pub epoch: u64,
}

impl ChunkId {
    pub fn data(index: u64, epoch: u64) -> Self {
        Self {
            kind: ChunkKind::Data,
            index,
            epoch,
        }
    }

    pub fn alloc(part: u64, epoch: u64) -> Self {
        Self {
            kind: ChunkKind::Alloc,
            index: part,
            epoch,
        }
    }

    pub fn tree(part: u64, epoch: u64) -> Self {
        Self {
            kind: ChunkKind::Tree,
            index: part,
            epoch,
        }
    }

    pub fn superblock() -> Self {
        Self {
            kind: ChunkKind::Superblock,
            index: 0,
            epoch: 0,
        }
    }

    pub fn verifier() -> Self {
        Self {
            kind: ChunkKind::Verifier,
            index: 0,
            epoch: 0,
        }
    }

    /// Object key of this chunk inside `volume`'s prefix.
    ///
    /// The superblock body and verifier are embedded in the superblock object.
    pub fn key(&self, volume: &str) -> String {
        match self.kind.dir() {
            Some(dir) => format!("{volume}/{dir}/{:016x}.{:016x}", self.index, self.epoch),
            None => superblock_key(volume),
        }
    }

    /// Parse a key produced by [`ChunkId::key`]. Returns `None` for the
    /// superblock and for anything that is not a chunk key of `volume`.
    pub fn parse(volume: &str, key: &str) -> Option<Self> {
        let rest = key.strip_prefix(volume)?.strip_prefix('/')?;
        let (dir, name) = rest.split_once('/')?;
        let kind = ChunkKind::from_dir(dir)?;
        let (index, epoch) = name.split_once('.')?;
        if index.len() != 16 || epoch.len() != 16 {
            return None;
        }
        Some(Self {
            kind,
            index: u64::from_str_radix(index, 16).ok()?,
            epoch: u64::from_str_radix(epoch, 16).ok()?,
        })
    }

    /// Associated data binding a sealed chunk to its coordinate.
    pub fn context(&self, volume: &str) -> Vec<u8> {
        let mut aad = Vec::with_capacity(CONTEXT_DOMAIN.len() + volume.len() + 2 + 16);
        aad.extend_from_slice(CONTEXT_DOMAIN);
        aad.push(0);
        aad.extend_from_slice(volume.as_bytes());
        aad.push(0);
        aad.push(self.kind.tag());
        aad.extend_from_slice(&self.index.to_be_bytes());
        aad.extend_from_slice(&self.epoch.to_be_bytes());
        aad
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}@{}", self.kind, self.index, self.epoch)
    }
}

pub fn superblock_key(volume: &str) -> String {
    format!("{volume}/{SUPERBLOCK_NAME}")
}

/// Prefix holding every object that belongs to `volume`.
pub fn volume_prefix(volume: &str) -> String {
    volume.to_string()
}
