//! Persistence: block record files, world manifest, edit log segments and
//! an integrity hash chain.
//!
//! # Invariants
//! - Block records are self-checking; a corrupt record is reported and its
//!   block regenerated, never installed.
//! - Log segments are append-only and chained by SHA-256.
//! - Save then load reproduces the edited voxel state exactly.

mod blocks;
mod manifest;
mod store;

pub use blocks::{BlockDirectory, BlockScan, block_file_name, parse_block_file_name};
pub use manifest::{WorldManifest, WorldSummary, list_worlds};
pub use store::{
    IntegrityManifest, LoadReport, ManifestEntry, SaveReport, StoreError, WorldMeta, WorldStore,
};

pub fn crate_info() -> &'static str {
    "voxelcore-persist v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("persist"));
    }
}
