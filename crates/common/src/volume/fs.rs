//! File operations on tree-format volumes.
//!
//! Namespace changes happen under the tree write lock. File data goes
//! through the same cache and block space as block volumes; blocks are
//! allocated under the write lock, which is then downgraded for the I/O.

use super::engine::{ReadPiece, Volume, WritePiece};
use super::layout::split_range;
use super::tree::{DirEntry, FileStat, Tree};
use super::{VolumeError, VolumeFormat};

impl Volume {
    fn missing_tree(&self) -> VolumeError {
        VolumeError::Inconsistent(format!("'{}' has no tree loaded", self.name))
    }

    fn check_file_range(&self, end: Option<u64>, offset: u64, len: usize) -> Result<u64, VolumeError> {
        match end {
            Some(end) if end <= self.size => Ok(end),
            _ => Err(VolumeError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    async fn free_blocks(&self, blocks: Vec<u64>) {
        for block in blocks {
            self.free_block(block).await;
        }
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat, VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_readable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        let tree = self.tree.read().await;
        let tree = tree.as_ref().ok_or_else(|| self.missing_tree())?;
        Ok(tree.stat(path)?)
    }

    pub async fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_readable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        let tree = self.tree.read().await;
        let tree = tree.as_ref().ok_or_else(|| self.missing_tree())?;
        Ok(tree.readdir(path)?)
    }

    /// Run a namespace change that frees no blocks.
    async fn modify_tree<T>(
        &self,
        change: impl FnOnce(&mut Tree) -> Result<T, VolumeError>,
    ) -> Result<T, VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_writable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        let mut tree = self.tree.write().await;
        let tree = tree.as_mut().ok_or_else(|| self.missing_tree())?;
        let out = change(tree)?;
        self.mark_dirty();
        Ok(out)
    }

    pub async fn mkdir(&self, path: &str) -> Result<u64, VolumeError> {
        let ino = self.modify_tree(|tree| Ok(tree.mkdir(path)?)).await?;
        tracing::debug!(volume = %self.name, path, ino, "mkdir");
        Ok(ino)
    }

    /// Create an empty file.
    pub async fn create_file(&self, path: &str) -> Result<u64, VolumeError> {
        let ino = self.modify_tree(|tree| Ok(tree.create(path)?)).await?;
        tracing::debug!(volume = %self.name, path, ino, "create");
        Ok(ino)
    }

    pub async fn rmdir(&self, path: &str) -> Result<(), VolumeError> {
        self.modify_tree(|tree| Ok(tree.rmdir(path)?)).await
    }

    /// Read up to `len` bytes at `offset`. Reads stop at end of file and
    /// holes read as zeros.
    pub async fn read_file(
        &self,
        path: &str,
        offset: u64,
        len: usize,
    ) -> Result<Vec<u8>, VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_readable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        let tree = self.tree.read().await;
        let tree = tree.as_ref().ok_or_else(|| self.missing_tree())?;

        let ino = tree.file(path)?;
        let size = tree.file_size(ino);
        if offset >= size {
            return Ok(Vec::new());
        }
        let len = (size - offset).min(len as u64) as usize;
        let pieces = split_range(self.block_size, offset, len)
            .into_iter()
            .map(|span| ReadPiece {
                index: tree.file_block(ino, span.index),
                offset: span.offset_in_block,
                len: span.len,
            })
            .collect();
        self.read_pieces(pieces).await
    }

    /// Write `data` at `offset`, growing the file as needed.
    pub async fn write_file(&self, path: &str, offset: u64, data: &[u8]) -> Result<(), VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_writable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        let end = self.check_file_range(offset.checked_add(data.len() as u64), offset, data.len())?;

        let mut guard = self.tree.write().await;
        let tree = guard.as_mut().ok_or_else(|| self.missing_tree())?;
        let ino = tree.file(path)?;
        let spans = split_range(self.block_size, offset, data.len());

        let total = self.total_blocks();
        let needed = spans
            .iter()
            .filter(|span| tree.file_block(ino, span.index).is_none())
            .count() as u64;
        let free = total.saturating_sub(tree.used_blocks().len() as u64);
        if needed > free {
            return Err(VolumeError::CapacityExceeded(self.name.clone()));
        }

        let mut pieces = Vec::with_capacity(spans.len());
        for span in spans {
            let block = match tree.file_block(ino, span.index) {
                Some(block) => block,
                None => {
                    let block = tree
                        .allocate(total)
                        .ok_or_else(|| VolumeError::CapacityExceeded(self.name.clone()))?;
                    tree.assign(ino, span.index, block);
                    block
                }
            };
            pieces.push(WritePiece {
                index: block,
                offset: span.offset_in_block,
                data: data[span.buf_offset..span.buf_offset + span.len].to_vec(),
            });
        }
        if !data.is_empty() {
            tree.extend(ino, end);
        }

        let _tree = guard.downgrade();
        self.write_pieces(pieces).await
    }

    /// Set a file's size. Shrinking frees the blocks past the new end and
    /// zeros the rest of the last partial block.
    pub async fn truncate(&self, path: &str, new_size: u64) -> Result<(), VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_writable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        self.check_file_range(Some(new_size), new_size, 0)?;

        let mut guard = self.tree.write().await;
        let tree = guard.as_mut().ok_or_else(|| self.missing_tree())?;
        let ino = tree.file(path)?;
        let old_size = tree.file_size(ino);

        let block_size = self.block_size as u64;
        let tail = (new_size < old_size && new_size % block_size != 0)
            .then(|| tree.file_block(ino, new_size / block_size))
            .flatten()
            .map(|block| {
                let offset = (new_size % block_size) as usize;
                WritePiece {
                    index: block,
                    offset,
                    data: vec![0; self.block_size as usize - offset],
                }
            });

        let freed = tree.truncate(ino, new_size, self.block_size);
        self.mark_dirty();
        self.free_blocks(freed).await;
        let _tree = guard.downgrade();
        self.write_pieces(tail.into_iter().collect()).await
    }

    pub async fn unlink(&self, path: &str) -> Result<(), VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_writable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        let mut guard = self.tree.write().await;
        let tree = guard.as_mut().ok_or_else(|| self.missing_tree())?;
        let freed = tree.unlink(path)?;
        self.mark_dirty();
        self.free_blocks(freed).await;
        Ok(())
    }

    /// Move `from` to `to`, replacing a file or empty directory there.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), VolumeError> {
        let _gate = self.io_gate.read().await;
        self.ensure_writable()?;
        self.ensure_format(VolumeFormat::Tree)?;
        let mut guard = self.tree.write().await;
        let tree = guard.as_mut().ok_or_else(|| self.missing_tree())?;
        let freed = tree.rename(from, to)?;
        self.mark_dirty();
        self.free_blocks(freed).await;
        Ok(())
    }
}
