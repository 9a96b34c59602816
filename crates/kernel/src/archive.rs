use std::collections::BTreeMap;

use voxelcore_common::BlockKey;

use crate::block::VoxelBlock;
use crate::codec::{decode_block, encode_block};
use crate::error::ArchiveError;

/// Durable home for blocks that leave memory.
///
/// Implementations store encoded block records; a record that fails to
/// decode is reported as [`ArchiveError::Corrupt`] and never installed.
pub trait BlockArchive: Send {
    fn load(&self, key: BlockKey) -> Result<Option<VoxelBlock>, ArchiveError>;

    fn store(&mut self, block: &VoxelBlock) -> Result<(), ArchiveError>;

    fn contains(&self, key: BlockKey) -> bool;

    /// Every stored key, in key order.
    fn archived_keys(&self) -> Result<Vec<BlockKey>, ArchiveError>;
}

/// In-memory archive holding encoded records.
#[derive(Debug, Clone, Default)]
pub struct MemoryArchive {
    records: BTreeMap<BlockKey, Vec<u8>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Raw record bytes, as stored.
    pub fn raw(&self, key: BlockKey) -> Option<&[u8]> {
        self.records.get(&key).map(Vec::as_slice)
    }

    /// Replace a record with arbitrary bytes.
    pub fn insert_raw(&mut self, key: BlockKey, bytes: Vec<u8>) {
        self.records.insert(key, bytes);
    }
}

impl BlockArchive for MemoryArchive {
    fn load(&self, key: BlockKey) -> Result<Option<VoxelBlock>, ArchiveError> {
        match self.records.get(&key) {
            Some(bytes) => Ok(Some(decode_block(bytes)?)),
            None => Ok(None),
        }
    }

    fn store(&mut self, block: &VoxelBlock) -> Result<(), ArchiveError> {
        self.records.insert(block.key(), encode_block(block));
        Ok(())
    }

    fn contains(&self, key: BlockKey) -> bool {
        self.records.contains_key(&key)
    }

    fn archived_keys(&self) -> Result<Vec<BlockKey>, ArchiveError> {
        Ok(self.records.keys().copied().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;
    use voxelcore_common::Voxel;

    #[test]
    fn store_then_load() {
        let mut archive = MemoryArchive::new();
        let key = BlockKey::new(0, IVec3::new(1, 2, 3));
        let mut block = VoxelBlock::new(key, 4);
        block.install_samples(vec![Voxel(4); 64]).unwrap();
        archive.store(&block).unwrap();
        assert!(archive.contains(key));
        let loaded = archive.load(key).unwrap().unwrap();
        assert_eq!(loaded.samples(), block.samples());
        assert!(archive.load(BlockKey::default()).unwrap().is_none());
    }

    #[test]
    fn corrupt_record_is_reported() {
        let mut archive = MemoryArchive::new();
        let key = BlockKey::default();
        archive.insert_raw(key, b"VXB1 not really".to_vec());
        assert!(matches!(archive.load(key), Err(ArchiveError::Corrupt(_))));
    }
}
