use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use voxelcore_common::{BlockKey, PeerId};
use voxelcore_kernel::{LamportClock, WorldConfig};

use crate::store::{MANIFEST_FILE, StoreError};

/// Contents of `world.json`: identity, configuration, log progress and the
/// octree topology at save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldManifest {
    pub name: String,
    pub seed: u64,
    pub config: WorldConfig,
    /// Name reported by the voxel source the world was generated with.
    pub generator: String,
    /// Milliseconds since the Unix epoch.
    pub created_ms: u64,
    pub last_played_ms: u64,
    /// Local peer of the saving replica; reloaded worlds keep it.
    pub peer: PeerId,
    pub clock: LamportClock,
    pub next_seq: u64,
    pub delivered: BTreeMap<PeerId, u64>,
    /// Every leaf key, resident or not.
    pub topology: Vec<BlockKey>,
    /// Blocks written to `blocks/` by this save.
    pub edited: Vec<BlockKey>,
    /// Edit segment holding the uncompacted log.
    pub segment: u32,
}

/// One entry of [`list_worlds`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorldSummary {
    pub name: String,
    pub path: PathBuf,
    pub seed: u64,
    pub created_ms: u64,
    pub last_played_ms: u64,
}

pub(crate) fn read_manifest(path: &Path) -> Result<WorldManifest, StoreError> {
    let file = std::fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Saved worlds directly under `dir`, most recently played first.
///
/// Directories without a readable manifest are skipped.
pub fn list_worlds(dir: impl AsRef<Path>) -> Result<Vec<WorldSummary>, StoreError> {
    let mut worlds = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        let path = entry?.path();
        let manifest_path = path.join(MANIFEST_FILE);
        if !manifest_path.is_file() {
            continue;
        }
        match read_manifest(&manifest_path) {
            Ok(m) => worlds.push(WorldSummary {
                name: m.name,
                path,
                seed: m.seed,
                created_ms: m.created_ms,
                last_played_ms: m.last_played_ms,
            }),
            Err(err) => {
                tracing::warn!(path = %manifest_path.display(), %err, "skipping unreadable world manifest");
            }
        }
    }
    worlds.sort_by(|a, b| {
        b.last_played_ms
            .cmp(&a.last_played_ms)
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(worlds)
}
