//! Meshing: voxel samples to renderable surfaces, and the rendering boundary.
//!
//! # Invariants
//! - [`build`] is pure: identical samples and borders give identical meshes.
//! - A mesh records the block revision it was built from.
//! - Sinks receive read-only views and never touch voxel data.

mod mesher;
mod sink;

pub use mesher::{Mesh, Vertex, build};
pub use sink::{DebugMeshSink, MeshSink, MeshView};

pub fn crate_info() -> &'static str {
    "voxelcore-mesh v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("mesh"));
    }
}
