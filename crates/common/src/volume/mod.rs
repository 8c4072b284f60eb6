//! Volume engine
//!
//! Turns a bucket with whole-object get/put/delete/list into a mountable,
//! randomly addressable volume. A volume is either a raw block device
//! ([`VolumeFormat::Block`]) or a directory tree ([`VolumeFormat::Tree`])
//! whose files live in the same block space.
//!
//! Lifecycle: [`Volume::create`] writes a generation-0 superblock;
//! [`Volume::mount`] checks the password and the exclusive-mount marker and
//! loads the allocation map; reads and writes go through the write-back
//! cache; [`Volume::commit`] and [`Volume::unmount`] flush, persist the
//! metadata, and write a new superblock last. [`fsck`] and [`delete`] work
//! on unmounted volumes.
//!
//! Crash safety comes from never overwriting committed objects: every
//! writable session reserves a fresh epoch in the superblock at mount (and
//! again after each commit) and writes every chunk with it, so the committed
//! superblock and everything it references stay intact until the next one
//! is stored. Two sessions never share an epoch, so a session overridden by
//! a forced mount cannot clobber what its successor committed.

mod admin;
mod alloc;
mod engine;
mod fs;
mod fsck;
mod layout;
mod persist;
mod superblock;
mod tree;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use store::StoreError;

use crate::cache::{CacheError, CacheStats};
use crate::crypto::{ChunkError, CryptError};
use crate::pool::PoolError;

pub use admin::{delete, list_volumes, DeleteReport, VolumeInfo};
pub use alloc::AllocationMap;
pub use engine::Volume;
pub use fsck::{fsck, FsckOptions, FsckReport, TreeProblem};
pub use layout::{split_range, BlockSpan, BLOCK_SIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE};
pub use persist::MetaRoot;
pub use superblock::{MountMarker, SUPERBLOCK_VERSION};
pub use tree::{DirEntry, FileKind, FileStat, TreeError, ROOT_INO};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeFormat {
    /// Raw block device
    Block,
    /// Directory tree ("vfs" on the command line)
    Tree,
}

impl fmt::Display for VolumeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VolumeFormat::Block => f.write_str("block"),
            VolumeFormat::Tree => f.write_str("vfs"),
        }
    }
}

impl FromStr for VolumeFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "block" => Ok(VolumeFormat::Block),
            "vfs" | "tree" => Ok(VolumeFormat::Tree),
            other => Err(format!("unknown volume format '{other}' (expected vfs or block)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeState {
    /// Mounted, nothing written since the last commit
    Clean,
    /// Mounted with uncommitted writes
    Dirty,
    Unmounting,
    /// An integrity violation was detected; writes are refused
    Inconsistent,
    Unmounted,
}

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub format: VolumeFormat,
    /// Requested size in bytes, rounded up to whole blocks
    pub size: u64,
    /// Defaults to [`BLOCK_SIZE`]
    pub block_size: Option<u32>,
    /// Replace an existing, unmounted volume of the same name
    pub overwrite: bool,
}

impl CreateOptions {
    pub fn new(format: VolumeFormat, size: u64) -> Self {
        Self {
            format,
            size,
            block_size: None,
            overwrite: false,
        }
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MountOptions {
    pub readonly: bool,
    /// Mount even though another session's marker is present
    pub force: bool,
}

/// Outcome of a successful mount.
#[derive(Debug, Clone, Default)]
pub struct MountReport {
    pub generation: u64,
    /// Marker that was overridden by `force`, if any
    pub forced_over: Option<MountMarker>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeStats {
    pub name: String,
    pub format: VolumeFormat,
    pub size: u64,
    pub block_size: u32,
    pub generation: u64,
    pub allocated_blocks: u64,
    pub state: VolumeState,
    pub readonly: bool,
    pub cache: CacheStats,
}

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("volume '{volume}' is already mounted by {marker}")]
    AlreadyMounted { volume: String, marker: MountMarker },
    #[error("volume '{0}' is not mounted")]
    NotMounted(String),
    #[error("volume is mounted read-only")]
    ReadOnly,
    #[error("range {offset}+{len} is outside the volume ({size} bytes)")]
    OutOfBounds { offset: u64, len: usize, size: u64 },
    #[error("volume '{0}' has no free blocks left")]
    CapacityExceeded(String),
    #[error("volume is inconsistent: {0}")]
    Inconsistent(String),
    #[error("volume '{0}' already exists")]
    AlreadyExists(String),
    #[error("volume '{0}' not found")]
    NotFound(String),
    #[error("unmount of '{volume}' failed, volume stays mounted: {source}")]
    UnmountFailed {
        volume: String,
        #[source]
        source: Box<VolumeError>,
    },
    #[error("invalid volume name '{0}'")]
    InvalidName(String),
    #[error("invalid size: {0}")]
    InvalidSize(String),
    #[error("operation needs a {expected} volume, '{volume}' is {actual}")]
    WrongFormat {
        volume: String,
        expected: VolumeFormat,
        actual: VolumeFormat,
    },
    #[error("malformed metadata: {0}")]
    Malformed(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Crypt(#[from] CryptError),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Tree(#[from] TreeError),
}

impl VolumeError {
    pub fn is_authentication_failure(&self) -> bool {
        match self {
            VolumeError::Crypt(CryptError::AuthenticationFailure(_)) => true,
            VolumeError::Chunk(e) => e.is_authentication_failure(),
            VolumeError::Cache(e) => e.is_authentication_failure(),
            VolumeError::UnmountFailed { source, .. } => source.is_authentication_failure(),
            _ => false,
        }
    }
}

impl From<bincode::Error> for VolumeError {
    fn from(err: bincode::Error) -> Self {
        VolumeError::Malformed(err.to_string())
    }
}

impl From<serde_json::Error> for VolumeError {
    fn from(err: serde_json::Error) -> Self {
        VolumeError::Malformed(err.to_string())
    }
}

/// Volume names become the first key segment, so keep them to a safe
/// character set.
pub fn validate_name(name: &str) -> Result<(), VolumeError> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(VolumeError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_names() {
        assert_eq!("vfs".parse::<VolumeFormat>().unwrap(), VolumeFormat::Tree);
        assert_eq!("block".parse::<VolumeFormat>().unwrap(), VolumeFormat::Block);
        assert!("ext4".parse::<VolumeFormat>().is_err());
        assert_eq!(VolumeFormat::Tree.to_string(), "vfs");
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("backup-01").is_ok());
        assert!(validate_name("photos_2024.v2").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".hidden").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("sp ace").is_err());
    }
}
