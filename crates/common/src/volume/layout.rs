//! Mapping byte ranges onto fixed-size blocks.

use super::VolumeError;

/// Default block size: one chunk object per MiB of volume.
pub const BLOCK_SIZE: u32 = 1024 * 1024;
pub const MIN_BLOCK_SIZE: u32 = 4 * 1024;
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024 * 1024;

/// The piece of a byte range that falls inside one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub index: u64,
    pub offset_in_block: usize,
    pub len: usize,
    /// Position of this piece within the caller's buffer
    pub buf_offset: usize,
}

impl BlockSpan {
    pub fn is_whole(&self, block_size: u32) -> bool {
        self.offset_in_block == 0 && self.len == block_size as usize
    }
}

/// Split `[offset, offset + len)` into per-block pieces.
pub fn split_range(block_size: u32, mut offset: u64, len: usize) -> Vec<BlockSpan> {
    let block_size = block_size as u64;
    let mut remaining = len as u64;
    let mut out = Vec::new();
    let mut buf_offset = 0;

    while remaining > 0 {
        let index = offset / block_size;
        let offset_in_block = offset % block_size;
        let take = (block_size - offset_in_block).min(remaining) as usize;
        out.push(BlockSpan {
            index,
            offset_in_block: offset_in_block as usize,
            len: take,
            buf_offset,
        });
        offset += take as u64;
        buf_offset += take;
        remaining -= take as u64;
    }
    out
}

/// Fail with `OutOfBounds` unless `[offset, offset + len)` lies inside a
/// volume of `size` bytes.
pub fn check_bounds(offset: u64, len: usize, size: u64) -> Result<(), VolumeError> {
    match offset.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(VolumeError::OutOfBounds { offset, len, size }),
    }
}

pub fn validate_block_size(block_size: u32) -> Result<(), VolumeError> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(VolumeError::InvalidSize(format!(
            "block size {block_size} must be a power of two between {MIN_BLOCK_SIZE} and {MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

/// Round a requested volume size up to whole blocks.
pub fn round_size(size: u64, block_size: u32) -> Result<u64, VolumeError> {
    if size == 0 {
        return Err(VolumeError::InvalidSize("volume size must be positive".into()));
    }
    let block_size = block_size as u64;
    size.div_ceil(block_size)
        .checked_mul(block_size)
        .ok_or_else(|| VolumeError::InvalidSize(format!("volume size {size} is too large")))
}

pub fn block_count(size: u64, block_size: u32) -> u64 {
    size / block_size as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_within_single_block() {
        let spans = split_range(4096, 123, 100);
        assert_eq!(
            spans,
            vec![BlockSpan {
                index: 0,
                offset_in_block: 123,
                len: 100,
                buf_offset: 0
            }]
        );
    }

    #[test]
    fn test_split_across_blocks() {
        let spans = split_range(4096, 4086, 4096 + 20);
        assert_eq!(spans.len(), 3);
        assert_eq!((spans[0].index, spans[0].offset_in_block, spans[0].len), (0, 4086, 10));
        assert_eq!((spans[1].index, spans[1].offset_in_block, spans[1].len), (1, 0, 4096));
        assert!(spans[1].is_whole(4096));
        assert_eq!((spans[2].index, spans[2].len, spans[2].buf_offset), (2, 10, 4106));
    }

    #[test]
    fn test_zero_len() {
        assert!(split_range(4096, 77, 0).is_empty());
    }

    #[test]
    fn test_bounds() {
        assert!(check_bounds(0, 10, 10).is_ok());
        assert!(check_bounds(10, 0, 10).is_ok());
        assert!(check_bounds(5, 6, 10).is_err());
        assert!(check_bounds(u64::MAX, 2, 10).is_err());
    }

    #[test]
    fn test_round_size() {
        assert_eq!(round_size(1, 4096).unwrap(), 4096);
        assert_eq!(round_size(8192, 4096).unwrap(), 8192);
        assert!(round_size(0, 4096).is_err());
        assert!(validate_block_size(4096).is_ok());
        assert!(validate_block_size(5000).is_err());
        assert!(validate_block_size(1024).is_err());
    }
}
