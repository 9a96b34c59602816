use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use glam::IVec3;
use voxelcore_common::BlockKey;
use voxelcore_kernel::{
    ArchiveError, BlockArchive, CorruptBlockError, VoxelBlock, decode_block, encode_block,
};

/// File name of the record for `key`: `L{lod}_{x}_{y}_{z}.vxb`.
pub fn block_file_name(key: BlockKey) -> String {
    format!("L{}_{}_{}_{}.vxb", key.lod, key.x, key.y, key.z)
}

/// Inverse of [`block_file_name`].
pub fn parse_block_file_name(name: &str) -> Option<BlockKey> {
    let stem = name.strip_suffix(".vxb")?.strip_prefix('L')?;
    let mut parts = stem.split('_');
    let lod = parts.next()?.parse().ok()?;
    let x = parts.next()?.parse().ok()?;
    let y = parts.next()?.parse().ok()?;
    let z = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some(BlockKey::new(lod, IVec3::new(x, y, z)))
}

/// Result of decoding every record in a block directory.
#[derive(Debug, Default)]
pub struct BlockScan {
    pub valid: Vec<BlockKey>,
    pub corrupt: Vec<(BlockKey, CorruptBlockError)>,
}

/// A directory of binary block records; the file-backed [`BlockArchive`].
#[derive(Debug, Clone)]
pub struct BlockDirectory {
    dir: PathBuf,
}

impl BlockDirectory {
    pub fn open(dir: impl AsRef<Path>) -> std::io::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_of(&self, key: BlockKey) -> PathBuf {
        self.dir.join(block_file_name(key))
    }

    /// Keys of every record file, in key order.
    pub fn keys(&self) -> std::io::Result<Vec<BlockKey>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            if let Some(key) = entry.file_name().to_str().and_then(parse_block_file_name) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Decode every record, sorting them into valid and corrupt.
    pub fn scan(&self) -> std::io::Result<BlockScan> {
        let mut scan = BlockScan::default();
        for key in self.keys()? {
            let data = std::fs::read(self.path_of(key))?;
            match decode_block(&data) {
                Ok(block) if block.key() == key => scan.valid.push(key),
                Ok(block) => scan.corrupt.push((
                    key,
                    CorruptBlockError::KeyMismatch {
                        expected: key,
                        found: block.key(),
                    },
                )),
                Err(err) => scan.corrupt.push((key, err)),
            }
        }
        Ok(scan)
    }
}

impl BlockArchive for BlockDirectory {
    fn load(&self, key: BlockKey) -> Result<Option<VoxelBlock>, ArchiveError> {
        let data = match std::fs::read(self.path_of(key)) {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let block = decode_block(&data)?;
        if block.key() != key {
            return Err(CorruptBlockError::KeyMismatch {
                expected: key,
                found: block.key(),
            }
            .into());
        }
        Ok(Some(block))
    }

    fn store(&mut self, block: &VoxelBlock) -> Result<(), ArchiveError> {
        let key = block.key();
        let path = self.path_of(key);
        let tmp = path.with_extension("vxb.tmp");
        std::fs::write(&tmp, encode_block(block))?;
        std::fs::rename(&tmp, &path)?;
        tracing::trace!(%key, "block record written");
        Ok(())
    }

    fn contains(&self, key: BlockKey) -> bool {
        self.path_of(key).is_file()
    }

    fn archived_keys(&self) -> Result<Vec<BlockKey>, ArchiveError> {
        Ok(self.keys()?)
    }
}
