//! Directory/inode metadata for tree-format volumes.
//!
//! Pure in-memory structure; the volume engine persists it with the same
//! chunked, epoch-keyed discipline as the allocation map. File contents are
//! volume blocks: each file maps its file-relative block numbers to volume
//! block indices, and every volume block belongs to at most one file.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::VolumeError;

pub const ROOT_INO: u64 = 1;

const DEFAULT_DIR_MODE: u32 = 0o755;
const DEFAULT_FILE_MODE: u32 = 0o644;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TreeError {
    #[error("no such file or directory: {0}")]
    NotFound(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("cannot move a directory into itself: {0}")]
    MoveIntoSelf(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InodeKind {
    Dir {
        entries: BTreeMap<String, u64>,
    },
    File {
        size: u64,
        /// File block number to volume block index
        blocks: BTreeMap<u64, u64>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inode {
    pub kind: InodeKind,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
}

impl Inode {
    fn dir(mode: u32) -> Self {
        Self {
            kind: InodeKind::Dir {
                entries: BTreeMap::new(),
            },
            mode,
            mtime: Utc::now(),
        }
    }

    fn file(mode: u32) -> Self {
        Self {
            kind: InodeKind::File {
                size: 0,
                blocks: BTreeMap::new(),
            },
            mode,
            mtime: Utc::now(),
        }
    }

    pub fn file_kind(&self) -> FileKind {
        match self.kind {
            InodeKind::Dir { .. } => FileKind::Directory,
            InodeKind::File { .. } => FileKind::File,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileStat {
    pub ino: u64,
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: DateTime<Utc>,
    /// Volume blocks owned by the file
    pub blocks: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntry {
    pub name: String,
    pub ino: u64,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    inodes: BTreeMap<u64, Inode>,
    next_ino: u64,
    #[serde(skip)]
    used: BTreeSet<u64>,
    #[serde(skip)]
    dirty: bool,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

fn components(path: &str) -> Result<Vec<&str>, TreeError> {
    let parts: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
    if parts
        .iter()
        .any(|c| *c == "." || *c == ".." || c.contains('\0'))
    {
        return Err(TreeError::InvalidPath(path.to_string()));
    }
    Ok(parts)
}

impl Tree {
    pub fn new() -> Self {
        let mut inodes = BTreeMap::new();
        inodes.insert(ROOT_INO, Inode::dir(DEFAULT_DIR_MODE));
        Self {
            inodes,
            next_ino: ROOT_INO + 1,
            used: BTreeSet::new(),
            dirty: true,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, VolumeError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self, VolumeError> {
        let mut tree: Tree = bincode::deserialize(blob)?;
        if !matches!(
            tree.inodes.get(&ROOT_INO).map(|i| &i.kind),
            Some(InodeKind::Dir { .. })
        ) {
            return Err(VolumeError::Malformed("tree has no root directory".into()));
        }
        tree.rebuild_used();
        tree.dirty = false;
        Ok(tree)
    }

    pub(crate) fn rebuild_used(&mut self) {
        self.used = self
            .inodes
            .values()
            .filter_map(|inode| match &inode.kind {
                InodeKind::File { blocks, .. } => Some(blocks.values().copied()),
                InodeKind::Dir { .. } => None,
            })
            .flatten()
            .collect();
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn used_blocks(&self) -> &BTreeSet<u64> {
        &self.used
    }

    pub(crate) fn inodes(&self) -> &BTreeMap<u64, Inode> {
        &self.inodes
    }

    pub(crate) fn inodes_mut(&mut self) -> &mut BTreeMap<u64, Inode> {
        self.dirty = true;
        &mut self.inodes
    }

    /// Resolve `path` to an inode number.
    pub fn lookup(&self, path: &str) -> Result<u64, TreeError> {
        let mut ino = ROOT_INO;
        for name in components(path)? {
            ino = match self.inodes.get(&ino).map(|i| &i.kind) {
                Some(InodeKind::Dir { entries }) => *entries
                    .get(name)
                    .ok_or_else(|| TreeError::NotFound(path.to_string()))?,
                _ => return Err(TreeError::NotADirectory(path.to_string())),
            };
        }
        Ok(ino)
    }

    /// Directory inode that holds (or would hold) `path`, plus the final name.
    fn parent(&self, path: &str) -> Result<(u64, String), TreeError> {
        let parts = components(path)?;
        let Some((name, dirs)) = parts.split_last() else {
            return Err(TreeError::InvalidPath(path.to_string()));
        };
        let parent = self.lookup(&dirs.join("/"))?;
        match self.inodes.get(&parent).map(|i| &i.kind) {
            Some(InodeKind::Dir { .. }) => Ok((parent, name.to_string())),
            _ => Err(TreeError::NotADirectory(path.to_string())),
        }
    }

    fn entries_mut(&mut self, dir: u64) -> Result<&mut BTreeMap<String, u64>, TreeError> {
        match self.inodes.get_mut(&dir).map(|i| &mut i.kind) {
            Some(InodeKind::Dir { entries }) => Ok(entries),
            _ => Err(TreeError::NotADirectory(format!("inode {dir}"))),
        }
    }

    fn touch(&mut self, ino: u64) {
        if let Some(inode) = self.inodes.get_mut(&ino) {
            inode.mtime = Utc::now();
        }
        self.dirty = true;
    }

    fn insert(&mut self, path: &str, inode: Inode) -> Result<u64, TreeError> {
        let (parent, name) = self.parent(path)?;
        if self.entries_mut(parent)?.contains_key(&name) {
            return Err(TreeError::AlreadyExists(path.to_string()));
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.inodes.insert(ino, inode);
        self.entries_mut(parent)?.insert(name, ino);
        self.touch(parent);
        Ok(ino)
    }

    pub fn mkdir(&mut self, path: &str) -> Result<u64, TreeError> {
        self.insert(path, Inode::dir(DEFAULT_DIR_MODE))
    }

    pub fn create(&mut self, path: &str) -> Result<u64, TreeError> {
        self.insert(path, Inode::file(DEFAULT_FILE_MODE))
    }

    pub fn stat(&self, path: &str) -> Result<FileStat, TreeError> {
        let ino = self.lookup(path)?;
        let inode = self
            .inodes
            .get(&ino)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        let (size, blocks) = match &inode.kind {
            InodeKind::File { size, blocks } => (*size, blocks.len() as u64),
            InodeKind::Dir { entries } => (entries.len() as u64, 0),
        };
        Ok(FileStat {
            ino,
            kind: inode.file_kind(),
            size,
            mode: inode.mode,
            mtime: inode.mtime,
            blocks,
        })
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, TreeError> {
        let ino = self.lookup(path)?;
        match self.inodes.get(&ino).map(|i| &i.kind) {
            Some(InodeKind::Dir { entries }) => Ok(entries
                .iter()
                .filter_map(|(name, ino)| {
                    self.inodes.get(ino).map(|inode| DirEntry {
                        name: name.clone(),
                        ino: *ino,
                        kind: inode.file_kind(),
                    })
                })
                .collect()),
            _ => Err(TreeError::NotADirectory(path.to_string())),
        }
    }

    /// Resolve `path` to a regular file.
    pub fn file(&self, path: &str) -> Result<u64, TreeError> {
        let ino = self.lookup(path)?;
        match self.inodes.get(&ino).map(|i| &i.kind) {
            Some(InodeKind::File { .. }) => Ok(ino),
            _ => Err(TreeError::IsADirectory(path.to_string())),
        }
    }

    pub fn file_size(&self, ino: u64) -> u64 {
        match self.inodes.get(&ino).map(|i| &i.kind) {
            Some(InodeKind::File { size, .. }) => *size,
            _ => 0,
        }
    }

    pub fn file_block(&self, ino: u64, file_block: u64) -> Option<u64> {
        match self.inodes.get(&ino).map(|i| &i.kind) {
            Some(InodeKind::File { blocks, .. }) => blocks.get(&file_block).copied(),
            _ => None,
        }
    }

    /// Lowest free volume block below `total`, reserved on return.
    pub fn allocate(&mut self, total: u64) -> Option<u64> {
        let mut candidate = 0;
        for used in self.used.range(..total) {
            if *used != candidate {
                break;
            }
            candidate += 1;
        }
        if candidate >= total {
            return None;
        }
        self.used.insert(candidate);
        Some(candidate)
    }

    pub fn assign(&mut self, ino: u64, file_block: u64, volume_block: u64) {
        if let Some(Inode {
            kind: InodeKind::File { blocks, .. },
            ..
        }) = self.inodes.get_mut(&ino)
        {
            blocks.insert(file_block, volume_block);
            self.used.insert(volume_block);
            self.dirty = true;
        }
    }

    /// Grow the recorded size to at least `end`.
    pub fn extend(&mut self, ino: u64, end: u64) {
        if let Some(Inode {
            kind: InodeKind::File { size, .. },
            ..
        }) = self.inodes.get_mut(&ino)
        {
            *size = (*size).max(end);
        }
        self.touch(ino);
    }

    /// Set the file size, returning the volume blocks no longer covered.
    pub fn truncate(&mut self, ino: u64, new_size: u64, block_size: u32) -> Vec<u64> {
        let keep = new_size.div_ceil(block_size as u64);
        let mut freed = Vec::new();
        if let Some(Inode {
            kind: InodeKind::File { size, blocks },
            ..
        }) = self.inodes.get_mut(&ino)
        {
            freed = blocks.split_off(&keep).into_values().collect();
            *size = new_size;
        }
        for block in &freed {
            self.used.remove(block);
        }
        self.touch(ino);
        freed
    }

    /// Remove a file, returning the volume blocks it owned.
    pub fn unlink(&mut self, path: &str) -> Result<Vec<u64>, TreeError> {
        let ino = self.file(path)?;
        let (parent, name) = self.parent(path)?;
        self.entries_mut(parent)?.remove(&name);
        self.touch(parent);
        Ok(self.drop_inode(ino))
    }

    fn drop_inode(&mut self, ino: u64) -> Vec<u64> {
        let freed: Vec<u64> = match self.inodes.remove(&ino).map(|i| i.kind) {
            Some(InodeKind::File { blocks, .. }) => blocks.into_values().collect(),
            _ => Vec::new(),
        };
        for block in &freed {
            self.used.remove(block);
        }
        self.dirty = true;
        freed
    }

    pub fn rmdir(&mut self, path: &str) -> Result<(), TreeError> {
        let ino = self.lookup(path)?;
        if ino == ROOT_INO {
            return Err(TreeError::InvalidPath(path.to_string()));
        }
        match self.inodes.get(&ino).map(|i| &i.kind) {
            Some(InodeKind::Dir { entries }) if !entries.is_empty() => {
                return Err(TreeError::NotEmpty(path.to_string()))
            }
            Some(InodeKind::Dir { .. }) => {}
            _ => return Err(TreeError::NotADirectory(path.to_string())),
        }
        let (parent, name) = self.parent(path)?;
        self.entries_mut(parent)?.remove(&name);
        self.inodes.remove(&ino);
        self.touch(parent);
        Ok(())
    }

    /// Move `from` to `to`, replacing a file or empty directory at `to`.
    /// Returns the blocks of a replaced file.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<Vec<u64>, TreeError> {
        let ino = self.lookup(from)?;
        if ino == ROOT_INO {
            return Err(TreeError::InvalidPath(from.to_string()));
        }
        let from_parts = components(from)?;
        let to_parts = components(to)?;
        if from_parts == to_parts {
            return Ok(Vec::new());
        }
        let moving_dir = matches!(
            self.inodes.get(&ino).map(|i| &i.kind),
            Some(InodeKind::Dir { .. })
        );
        if moving_dir && to_parts.starts_with(&from_parts) {
            return Err(TreeError::MoveIntoSelf(to.to_string()));
        }

        let (to_parent, to_name) = self.parent(to)?;
        let mut freed = Vec::new();
        if let Some(existing) = self.entries_mut(to_parent)?.get(&to_name).copied() {
            let target = self.inodes.get(&existing).map(|inode| match &inode.kind {
                InodeKind::Dir { entries } => Some(entries.is_empty()),
                InodeKind::File { .. } => None,
            });
            match (moving_dir, target) {
                (true, Some(Some(true))) => {
                    self.inodes.remove(&existing);
                }
                (true, Some(Some(false))) => return Err(TreeError::NotEmpty(to.to_string())),
                (true, _) => return Err(TreeError::NotADirectory(to.to_string())),
                (false, Some(Some(_))) => return Err(TreeError::IsADirectory(to.to_string())),
                (false, _) => freed = self.drop_inode(existing),
            }
        }

        let (from_parent, from_name) = self.parent(from)?;
        self.entries_mut(from_parent)?.remove(&from_name);
        self.entries_mut(to_parent)?.insert(to_name, ino);
        self.touch(from_parent);
        self.touch(to_parent);
        Ok(freed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mkdir_create_lookup() {
        let mut tree = Tree::new();
        tree.mkdir("/docs").unwrap();
        let ino = tree.create("/docs/a.txt").unwrap();
        assert_eq!(tree.lookup("/docs/a.txt").unwrap(), ino);
        assert_eq!(tree.lookup("docs//a.txt").unwrap(), ino);
        assert_eq!(tree.lookup("/").unwrap(), ROOT_INO);

        assert_eq!(
            tree.create("/docs/a.txt"),
            Err(TreeError::AlreadyExists("/docs/a.txt".into()))
        );
        assert!(matches!(tree.create("/missing/x"), Err(TreeError::NotFound(_))));
        assert!(matches!(
            tree.create("/docs/a.txt/x"),
            Err(TreeError::NotADirectory(_))
        ));
        assert!(matches!(tree.lookup("/docs/../etc"), Err(TreeError::InvalidPath(_))));
    }

    #[test]
    fn test_readdir_and_stat() {
        let mut tree = Tree::new();
        tree.mkdir("/b").unwrap();
        tree.create("/a").unwrap();
        let names: Vec<_> = tree
            .readdir("/")
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.kind))
            .collect();
        assert_eq!(
            names,
            vec![("a".into(), FileKind::File), ("b".into(), FileKind::Directory)]
        );
        assert_eq!(tree.stat("/a").unwrap().size, 0);
        assert!(matches!(tree.readdir("/a"), Err(TreeError::NotADirectory(_))));
    }

    #[test]
    fn test_allocate_fills_lowest_gap() {
        let mut tree = Tree::new();
        let ino = tree.create("/f").unwrap();
        for fb in 0..3 {
            let vb = tree.allocate(4).unwrap();
            tree.assign(ino, fb, vb);
        }
        assert_eq!(tree.used_blocks().iter().copied().collect::<Vec<_>>(), vec![0, 1, 2]);

        let freed = tree.truncate(ino, 1, 4096);
        assert_eq!(freed, vec![1, 2]);
        assert_eq!(tree.allocate(4), Some(1));
        assert_eq!(tree.allocate(4), Some(2));
        assert_eq!(tree.allocate(4), Some(3));
        assert_eq!(tree.allocate(4), None);
    }

    #[test]
    fn test_unlink_returns_blocks() {
        let mut tree = Tree::new();
        let ino = tree.create("/f").unwrap();
        let vb = tree.allocate(10).unwrap();
        tree.assign(ino, 0, vb);
        assert_eq!(tree.unlink("/f").unwrap(), vec![vb]);
        assert!(tree.used_blocks().is_empty());
        assert!(matches!(tree.lookup("/f"), Err(TreeError::NotFound(_))));

        tree.mkdir("/d").unwrap();
        assert!(matches!(tree.unlink("/d"), Err(TreeError::IsADirectory(_))));
    }

    #[test]
    fn test_rmdir_requires_empty() {
        let mut tree = Tree::new();
        tree.mkdir("/d").unwrap();
        tree.create("/d/f").unwrap();
        assert!(matches!(tree.rmdir("/d"), Err(TreeError::NotEmpty(_))));
        tree.unlink("/d/f").unwrap();
        tree.rmdir("/d").unwrap();
        assert!(matches!(tree.rmdir("/"), Err(TreeError::InvalidPath(_))));
    }

    #[test]
    fn test_rename() {
        let mut tree = Tree::new();
        tree.mkdir("/a").unwrap();
        tree.mkdir("/b").unwrap();
        let f = tree.create("/a/f").unwrap();
        tree.rename("/a/f", "/b/g").unwrap();
        assert_eq!(tree.lookup("/b/g").unwrap(), f);
        assert!(tree.lookup("/a/f").is_err());

        // replacing a file frees its blocks
        let victim = tree.create("/b/h").unwrap();
        let vb = tree.allocate(8).unwrap();
        tree.assign(victim, 0, vb);
        assert_eq!(tree.rename("/b/g", "/b/h").unwrap(), vec![vb]);
        assert_eq!(tree.lookup("/b/h").unwrap(), f);

        assert!(matches!(tree.rename("/a", "/a/sub"), Err(TreeError::MoveIntoSelf(_))));
        assert!(matches!(tree.rename("/b/h", "/a"), Err(TreeError::IsADirectory(_))));
        tree.create("/b/x").unwrap();
        assert!(matches!(tree.rename("/a", "/b"), Err(TreeError::NotEmpty(_))));
    }

    #[test]
    fn test_encode_decode_rebuilds_used() {
        let mut tree = Tree::new();
        let ino = tree.create("/f").unwrap();
        tree.assign(ino, 0, 5);
        tree.assign(ino, 1, 9);
        tree.extend(ino, 8000);

        let decoded = Tree::decode(&tree.encode().unwrap()).unwrap();
        assert!(!decoded.is_dirty());
        assert_eq!(decoded.used_blocks().len(), 2);
        assert_eq!(decoded.file_size(ino), 8000);
        assert_eq!(decoded.file_block(ino, 1), Some(9));
    }
}
