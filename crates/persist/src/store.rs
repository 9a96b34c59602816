//! File-backed world persistence.
//!
//! Layout inside the store directory:
//! ```text
//! world.meta.json              - schema versions and counters
//! world.json                   - world manifest and octree topology
//! blocks/
//!   L{lod}_{x}_{y}_{z}.vxb     - binary block records
//! edits/
//!   000001.log.cbor.zst        - CBOR+zstd compressed edit log segments
//! integrity/
//!   manifest.json              - hash chain over manifests and segments
//! ```

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use voxelcore_common::BlockKey;
use voxelcore_kernel::codec::BLOCK_RECORD_VERSION;
use voxelcore_kernel::{
    ArchiveError, BlockArchive, CorruptBlockError, EditLogState, EditRecord, VoxelSource, World,
    WorldError,
};

use crate::blocks::{BlockDirectory, BlockScan};
use crate::manifest::{WorldManifest, read_manifest};

/// Current schema versions.
const WORLD_SCHEMA_VERSION: u32 = 1;
const EDIT_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "world.meta.json";
pub(crate) const MANIFEST_FILE: &str = "world.json";
const BLOCKS_DIR: &str = "blocks";
const EDITS_DIR: &str = "edits";
const INTEGRITY_DIR: &str = "integrity";

/// Errors from file-backed persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("integrity check failed for {file}: expected {expected}, got {actual}")]
    IntegrityMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("no world saved in this store")]
    NotInitialized,
    #[error(transparent)]
    World(#[from] WorldError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Metadata stored in world.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorldMeta {
    pub world_schema_version: u32,
    pub edit_schema_version: u32,
    pub block_record_version: u16,
    pub segment_count: u32,
    pub save_count: u32,
}

/// A single entry in the integrity manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub filename: String,
    pub sha256: String,
    pub prev_hash: Option<String>,
}

/// Integrity manifest tracking file hashes in a chain.
///
/// `world.json` is rewritten on every save; only its newest entry is
/// compared against the file, older ones just link the chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityManifest {
    pub entries: Vec<ManifestEntry>,
}

impl IntegrityManifest {
    fn latest(&self, filename: &str) -> Option<&ManifestEntry> {
        self.entries.iter().rev().find(|e| e.filename == filename)
    }
}

/// What [`WorldStore::save_world`] wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub blocks: usize,
    pub records: usize,
    pub segment: u32,
    pub topology: usize,
}

/// What [`WorldStore::load_world`] restored.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub name: String,
    pub loaded: usize,
    /// Records that failed to decode; their blocks were regenerated.
    pub corrupt: Vec<(BlockKey, CorruptBlockError)>,
    /// Edited blocks named by the manifest with no record on disk.
    pub missing: Vec<BlockKey>,
    pub records: usize,
    pub nodes: usize,
}

/// File-backed world store with schema versioning and integrity checking.
pub struct WorldStore {
    root: PathBuf,
    meta: WorldMeta,
    integrity: IntegrityManifest,
    blocks: BlockDirectory,
}

impl WorldStore {
    /// Open or create a world store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = path.as_ref().to_path_buf();
        let blocks = BlockDirectory::open(root.join(BLOCKS_DIR))?;
        std::fs::create_dir_all(root.join(EDITS_DIR))?;
        std::fs::create_dir_all(root.join(INTEGRITY_DIR))?;

        let meta_path = root.join(META_FILE);
        let integrity_path = root.join(INTEGRITY_DIR).join("manifest.json");

        let (meta, integrity) = if meta_path.exists() {
            let meta: WorldMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.world_schema_version != WORLD_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.world_schema_version,
                    expected_version: WORLD_SCHEMA_VERSION,
                });
            }
            if meta.edit_schema_version != EDIT_SCHEMA_VERSION {
                return Err(StoreError::SchemaMismatch {
                    file_version: meta.edit_schema_version,
                    expected_version: EDIT_SCHEMA_VERSION,
                });
            }
            let integrity: IntegrityManifest = if integrity_path.exists() {
                serde_json::from_reader(std::fs::File::open(&integrity_path)?)?
            } else {
                IntegrityManifest::default()
            };
            (meta, integrity)
        } else {
            let meta = WorldMeta {
                world_schema_version: WORLD_SCHEMA_VERSION,
                edit_schema_version: EDIT_SCHEMA_VERSION,
                block_record_version: BLOCK_RECORD_VERSION,
                segment_count: 0,
                save_count: 0,
            };
            let integrity = IntegrityManifest::default();
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&integrity_path)?, &integrity)?;
            (meta, integrity)
        };

        Ok(Self {
            root,
            meta,
            integrity,
            blocks,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &WorldMeta {
        &self.meta
    }

    pub fn integrity(&self) -> &IntegrityManifest {
        &self.integrity
    }

    pub fn blocks(&self) -> &BlockDirectory {
        &self.blocks
    }

    /// Whether a world has been saved here.
    pub fn has_world(&self) -> bool {
        self.root.join(MANIFEST_FILE).is_file()
    }

    pub fn manifest(&self) -> Result<WorldManifest, StoreError> {
        if !self.has_world() {
            return Err(StoreError::NotInitialized);
        }
        read_manifest(&self.root.join(MANIFEST_FILE))
    }

    /// Write edited blocks, the uncompacted log as a new segment, and the
    /// manifest.
    pub fn save_world(&mut self, world: &World, name: &str) -> Result<SaveReport, StoreError> {
        self.save_world_at(world, name, now_ms())
    }

    fn save_world_at(
        &mut self,
        world: &World,
        name: &str,
        now_ms: u64,
    ) -> Result<SaveReport, StoreError> {
        let span = tracing::info_span!("save_world", world = name, root = %self.root.display());
        let _enter = span.enter();

        let created_ms = if self.has_world() {
            self.manifest().map_or(now_ms, |m| m.created_ms)
        } else {
            now_ms
        };

        let mut archive = self.blocks.clone();
        let mut edited = Vec::new();
        for block in world.edited_blocks() {
            archive.store(block)?;
            edited.push(block.key());
        }

        let state = world.export_log();
        self.meta.segment_count += 1;
        let segment = self.meta.segment_count;
        let filename = segment_file_name(segment);
        let compressed = zstd_compress(&cbor_serialize(&state.records)?)?;
        std::fs::write(self.root.join(EDITS_DIR).join(&filename), &compressed)?;
        self.chain(filename, &compressed);

        let octree = world.octree();
        let topology: Vec<BlockKey> = octree
            .leaves()
            .into_iter()
            .filter_map(|id| octree.node(id).map(|n| n.key()))
            .collect();
        let manifest = WorldManifest {
            name: name.to_string(),
            seed: world.config().seed,
            config: world.config().clone(),
            generator: world.generator().source_name().to_string(),
            created_ms,
            last_played_ms: now_ms,
            peer: world.local_peer(),
            clock: state.clock,
            next_seq: state.next_seq,
            delivered: state.delivered,
            topology,
            edited,
            segment,
        };
        let json = serde_json::to_vec_pretty(&manifest)?;
        write_atomic(&self.root.join(MANIFEST_FILE), &json)?;
        self.chain(MANIFEST_FILE.to_string(), &json);

        self.meta.save_count += 1;
        self.save_meta()?;
        self.save_integrity()?;

        let report = SaveReport {
            blocks: manifest.edited.len(),
            records: state.records.len(),
            segment,
            topology: manifest.topology.len(),
        };
        tracing::info!(
            blocks = report.blocks,
            records = report.records,
            segment,
            "world saved"
        );
        Ok(report)
    }

    /// Rebuild the saved world on top of `source`.
    ///
    /// The returned world reads and writes block records in this store.
    /// Corrupt records are reported and their blocks regenerated.
    pub fn load_world(
        &self,
        source: Arc<dyn VoxelSource>,
    ) -> Result<(World, LoadReport), StoreError> {
        let span = tracing::info_span!("load_world", root = %self.root.display());
        let _enter = span.enter();

        if !self.has_world() {
            return Err(StoreError::NotInitialized);
        }
        let bytes = std::fs::read(self.root.join(MANIFEST_FILE))?;
        self.verify_file_hash(MANIFEST_FILE, &bytes)?;
        let manifest: WorldManifest = serde_json::from_slice(&bytes)?;
        if source.name() != manifest.generator {
            tracing::warn!(
                saved = %manifest.generator,
                given = source.name(),
                "loading with a different voxel source"
            );
        }

        let mut world = World::new(manifest.config.clone(), source, manifest.peer)?;
        world.set_archive(Box::new(self.blocks.clone()));
        for key in &manifest.topology {
            world.ensure_node(*key);
        }

        let mut report = LoadReport {
            name: manifest.name.clone(),
            ..LoadReport::default()
        };
        for &key in &manifest.edited {
            world.ensure_node(key);
            match world.load_persisted(key) {
                Ok(true) => report.loaded += 1,
                Ok(false) => {
                    tracing::warn!(%key, "edited block record missing");
                    report.missing.push(key);
                }
                Err(WorldError::Corrupt(err)) => {
                    report.corrupt.push((key, err));
                    world.block_or_create(key)?;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let records = if manifest.segment > 0 {
            self.load_segment(manifest.segment)?
        } else {
            Vec::new()
        };
        world.restore_log(EditLogState {
            clock: manifest.clock,
            next_seq: manifest.next_seq,
            delivered: manifest.delivered,
            records,
        });

        report.records = world.edit_log().len();
        report.nodes = world.octree().node_count();
        tracing::info!(
            name = %report.name,
            loaded = report.loaded,
            corrupt = report.corrupt.len(),
            records = report.records,
            "world loaded"
        );
        Ok((world, report))
    }

    /// Verify chain continuity and the hash of every current file.
    pub fn verify_integrity(&self) -> Result<(), StoreError> {
        let mut prev_hash: Option<String> = None;
        for (i, entry) in self.integrity.entries.iter().enumerate() {
            if entry.prev_hash != prev_hash {
                return Err(StoreError::IntegrityMismatch {
                    file: entry.filename.clone(),
                    expected: prev_hash.unwrap_or_else(|| "None".into()),
                    actual: entry.prev_hash.clone().unwrap_or_else(|| "None".into()),
                });
            }
            let superseded = self.integrity.entries[i + 1..]
                .iter()
                .any(|later| later.filename == entry.filename);
            if !superseded {
                let data = std::fs::read(self.file_path(&entry.filename))?;
                let actual = sha256_hex(&data);
                if actual != entry.sha256 {
                    return Err(StoreError::IntegrityMismatch {
                        file: entry.filename.clone(),
                        expected: entry.sha256.clone(),
                        actual,
                    });
                }
            }
            prev_hash = Some(entry.sha256.clone());
        }
        Ok(())
    }

    /// Decode every block record on disk.
    pub fn scan_blocks(&self) -> Result<BlockScan, StoreError> {
        Ok(self.blocks.scan()?)
    }

    fn load_segment(&self, index: u32) -> Result<Vec<EditRecord>, StoreError> {
        let filename = segment_file_name(index);
        let compressed = std::fs::read(self.root.join(EDITS_DIR).join(&filename))?;
        self.verify_file_hash(&filename, &compressed)?;
        let cbor_bytes = zstd_decompress(&compressed)?;
        cbor_deserialize(&cbor_bytes)
    }

    fn file_path(&self, filename: &str) -> PathBuf {
        if filename == MANIFEST_FILE {
            self.root.join(MANIFEST_FILE)
        } else {
            self.root.join(EDITS_DIR).join(filename)
        }
    }

    fn chain(&mut self, filename: String, data: &[u8]) {
        let prev_hash = self.integrity.entries.last().map(|e| e.sha256.clone());
        self.integrity.entries.push(ManifestEntry {
            filename,
            sha256: sha256_hex(data),
            prev_hash,
        });
    }

    fn verify_file_hash(&self, filename: &str, data: &[u8]) -> Result<(), StoreError> {
        let Some(entry) = self.integrity.latest(filename) else {
            return Ok(());
        };
        let actual = sha256_hex(data);
        if entry.sha256 != actual {
            return Err(StoreError::IntegrityMismatch {
                file: filename.to_string(),
                expected: entry.sha256.clone(),
                actual,
            });
        }
        Ok(())
    }

    fn save_meta(&self) -> Result<(), StoreError> {
        let path = self.root.join(META_FILE);
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    fn save_integrity(&self) -> Result<(), StoreError> {
        let path = self.root.join(INTEGRITY_DIR).join("manifest.json");
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.integrity)?;
        Ok(())
    }
}

fn segment_file_name(index: u32) -> String {
    format!("{index:06}.log.cbor.zst")
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::CborEncode(e.to_string()))?;
    Ok(buf)
}

fn cbor_deserialize<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T, StoreError> {
    ciborium::from_reader(data).map_err(|e| StoreError::CborDecode(e.to_string()))
}

fn zstd_compress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut encoder = zstd::Encoder::new(Vec::new(), 3)?;
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn zstd_decompress(data: &[u8]) -> Result<Vec<u8>, StoreError> {
    let mut decoder = zstd::Decoder::new(data)?;
    let mut buf = Vec::new();
    decoder.read_to_end(&mut buf)?;
    Ok(buf)
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}
