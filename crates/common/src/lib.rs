//! Shared value types for the voxel world: voxels, materials, block keys,
//! regions, faces and peer identity.
//!
//! # Invariants
//! - Block keys and regions use world voxel units with `z` up.
//! - `Voxel(0)` is air; every other id is solid.

mod coords;
mod types;

pub use coords::{BlockKey, Face, VoxelRegion, octant_offset};
pub use types::{Material, PeerId, Voxel, WriteStamp};

pub fn crate_info() -> &'static str {
    "voxelcore-common v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("common"));
    }
}
