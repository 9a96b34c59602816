//! Streaming: viewer-driven block residency over a voxel world.
//!
//! # Invariants
//! - A block with generate or mesh work in flight is never evicted,
//!   coarsened or dispatched again.
//! - Requests run nearest first within their class; evictions run last and
//!   are cancelled when their root comes back into range.
//! - A failing job marks only its own block failed; retries back off.
//! - Meshes are never delivered for a revision older than the block's.

mod budget;
mod lod;
mod scheduler;
mod workers;

pub use budget::{FrameTimer, StreamConfig, StreamStats, TickReport};
pub use lod::{desired_leaves, lod_for_distance, roots_near, viewer_distance};
pub use scheduler::{Action, BlockState, MeshEvent, StreamingRequest, StreamingScheduler};
pub use workers::{TaskError, TaskHandle, WorkerPool};

pub fn crate_info() -> &'static str {
    "voxelcore-stream v0.1.0"
}
