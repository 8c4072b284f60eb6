use std::collections::BTreeMap;

use super::VolumeError;

/// Block index to the epoch of the chunk holding its contents.
///
/// Absent indices are free and read as zeros. The chunk key follows from
/// the pair, see [`crate::chunk::ChunkId::data`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationMap {
    blocks: BTreeMap<u64, u64>,
}

impl AllocationMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, index: u64) -> Option<u64> {
        self.blocks.get(&index).copied()
    }

    /// Point `index` at `epoch`, returning the epoch it replaced.
    pub fn set(&mut self, index: u64, epoch: u64) -> Option<u64> {
        self.blocks.insert(index, epoch)
    }

    pub fn remove(&mut self, index: u64) -> Option<u64> {
        self.blocks.remove(&index)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.blocks.contains_key(&index)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.blocks.iter().map(|(index, epoch)| (*index, *epoch))
    }

    pub fn encode(&self) -> Result<Vec<u8>, VolumeError> {
        let entries: Vec<(u64, u64)> = self.iter().collect();
        Ok(bincode::serialize(&entries)?)
    }

    pub fn decode(blob: &[u8]) -> Result<Self, VolumeError> {
        if blob.is_empty() {
            return Ok(Self::new());
        }
        let entries: Vec<(u64, u64)> = bincode::deserialize(blob)?;
        Ok(Self {
            blocks: entries.into_iter().collect(),
        })
    }
}
