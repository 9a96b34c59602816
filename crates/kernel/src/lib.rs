//! Voxel kernel: blocks, the sparse octree, generation, edits and the
//! authoritative [`World`] of one replica.
//!
//! # Invariants
//! - Every octree node holds exactly one of a block or eight children, and
//!   children partition their parent's region.
//! - Block content is a pure function of (key, seed, applied edits).
//! - Edits land at LOD 0 under last-writer-wins on `(timestamp, peer)`.
//! - Records from one origin are applied in sequence order.
//! - A subtree holding unpersisted or unacknowledged edits is never evicted.
//! - Edits and snapshot blocks outside [`WorldConfig::bounds`] are refused.

pub mod archive;
pub mod block;
mod borders;
pub mod codec;
pub mod config;
pub mod edit;
pub mod error;
pub mod generator;
pub mod octree;
pub mod world;

pub use archive::{BlockArchive, MemoryArchive};
pub use block::{BlockEdit, VoxelBlock};
pub use borders::NeighborBorders;
pub use codec::{decode_block, encode_block};
pub use config::{DEFAULT_WORLD_SEED, WorldConfig, WorldSize};
pub use edit::{EditLog, EditLogState, EditRecord, LamportClock, RemoteOutcome, VoxelEdit};
pub use error::{
    ArchiveError, CoarsenDeniedError, CorruptBlockError, EvictionDeniedError, OutOfOrderError,
    WorldError,
};
pub use generator::{FlatPlane, Generator, HeightmapTerrain, TerrainParams, VoxelSource};
pub use octree::{NodeId, Octree};
pub use world::World;

pub fn crate_info() -> &'static str {
    "voxelcore-kernel v0.1.0"
}
