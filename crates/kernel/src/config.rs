use glam::IVec3;
use serde::{Deserialize, Serialize};
use voxelcore_common::{BlockKey, PeerId, VoxelRegion};

use crate::block::MAX_BLOCK_EDGE;
use crate::error::WorldError;

/// Seed used when a world is created without one.
pub const DEFAULT_WORLD_SEED: u64 = 1337;

/// Playable extent of a world: how many LOD 0 blocks it reaches from the
/// origin along each axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldSize {
    Small,
    Medium,
    #[default]
    Large,
}

impl WorldSize {
    pub fn radius_blocks(self) -> i32 {
        match self {
            WorldSize::Small => 16,
            WorldSize::Medium => 64,
            WorldSize::Large => 256,
        }
    }
}

/// Per-world configuration, persisted in the world manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Samples per block edge. Must be a power of two.
    pub block_edge: u32,
    /// Coarsest LOD level; octree roots live here.
    pub max_lod: u8,
    /// Generator seed.
    pub seed: u64,
    /// Maximum remote records held while waiting for a causal prerequisite.
    pub max_buffered_remote: usize,
    /// Peers that must acknowledge a record before it may be compacted.
    pub required_peers: Vec<PeerId>,
    /// Blocks outside this extent are never streamed or edited.
    pub world_size: WorldSize,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            block_edge: 16,
            max_lod: 3,
            seed: DEFAULT_WORLD_SEED,
            max_buffered_remote: 256,
            required_peers: Vec::new(),
            world_size: WorldSize::default(),
        }
    }
}

impl WorldConfig {
    pub fn with_seed(seed: u64) -> Self {
        Self {
            seed,
            ..Default::default()
        }
    }

    /// World units spanned by one octree root.
    pub fn root_extent(&self) -> i32 {
        (self.block_edge as i32) << self.max_lod
    }

    /// Voxel positions inside the world: LOD 0 block coordinates from
    /// `-radius` to `radius` on every axis.
    pub fn bounds(&self) -> VoxelRegion {
        let r = self.world_size.radius_blocks();
        let e = self.block_edge.min(MAX_BLOCK_EDGE) as i32;
        VoxelRegion::new(IVec3::splat(-r * e), IVec3::splat((r + 1) * e))
    }

    /// Whether any part of `key` lies inside [`WorldConfig::bounds`].
    pub fn admits_block(&self, key: BlockKey) -> bool {
        let bounds = self.bounds();
        let edge = self.block_edge as i32;
        // Compare in block units at the key's LOD so far-away keys cannot
        // overflow when converted to voxels.
        let extent = (edge as i64) << key.lod;
        let lo = key.coord().as_i64vec3() * extent;
        let hi = lo + glam::I64Vec3::splat(extent);
        lo.cmplt(bounds.max.as_i64vec3()).all() && bounds.min.as_i64vec3().cmplt(hi).all()
    }

    pub fn validate(&self) -> Result<(), WorldError> {
        if !self.block_edge.is_power_of_two() || self.block_edge < 2 {
            return Err(WorldError::InvalidConfig(format!(
                "block_edge {} must be a power of two >= 2",
                self.block_edge
            )));
        }
        if self.block_edge > MAX_BLOCK_EDGE {
            return Err(WorldError::InvalidConfig(format!(
                "block_edge {} exceeds {MAX_BLOCK_EDGE}",
                self.block_edge
            )));
        }
        if self.max_lod > 12 {
            return Err(WorldError::InvalidConfig(format!(
                "max_lod {} exceeds 12",
                self.max_lod
            )));
        }
        Ok(())
    }
}
