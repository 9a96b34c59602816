use std::collections::BTreeMap;
use std::fmt::Write as _;

use voxelcore_common::BlockKey;

use crate::mesher::Vertex;

/// Read-only view of a built mesh handed across the rendering boundary.
#[derive(Debug, Clone, Copy)]
pub struct MeshView<'a> {
    pub key: BlockKey,
    pub revision: u64,
    pub vertices: &'a [Vertex],
    pub indices: &'a [u32],
}

/// Consumer of meshes. Implementations own their GPU or text resources and
/// never see voxel data.
pub trait MeshSink {
    /// Install or replace the mesh for `key`.
    fn upload(&mut self, key: BlockKey, mesh: &MeshView<'_>);

    /// Drop whatever is held for `key`.
    fn remove(&mut self, key: BlockKey);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Resident {
    revision: u64,
    vertices: usize,
    triangles: usize,
}

/// Text sink for CLI output, logging and tests.
#[derive(Debug, Default)]
pub struct DebugMeshSink {
    resident: BTreeMap<BlockKey, Resident>,
    uploads: u64,
    removals: u64,
}

impl DebugMeshSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.resident.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resident.is_empty()
    }

    pub fn contains(&self, key: BlockKey) -> bool {
        self.resident.contains_key(&key)
    }

    /// Revision of the mesh currently held for `key`.
    pub fn revision(&self, key: BlockKey) -> Option<u64> {
        self.resident.get(&key).map(|r| r.revision)
    }

    pub fn uploads(&self) -> u64 {
        self.uploads
    }

    pub fn removals(&self) -> u64 {
        self.removals
    }

    pub fn triangle_count(&self) -> usize {
        self.resident.values().map(|r| r.triangles).sum()
    }

    /// Human-readable listing of resident meshes.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "=== Meshes ({} resident, {} triangles, {} uploads, {} removals) ===",
            self.resident.len(),
            self.triangle_count(),
            self.uploads,
            self.removals
        );
        for (key, r) in &self.resident {
            let _ = writeln!(
                out,
                "  {key} rev={} verts={} tris={}",
                r.revision, r.vertices, r.triangles
            );
        }
        out
    }
}

impl MeshSink for DebugMeshSink {
    fn upload(&mut self, key: BlockKey, mesh: &MeshView<'_>) {
        self.uploads += 1;
        self.resident.insert(
            key,
            Resident {
                revision: mesh.revision,
                vertices: mesh.vertices.len(),
                triangles: mesh.indices.len() / 3,
            },
        );
        tracing::trace!(%key, revision = mesh.revision, "mesh uploaded");
    }

    fn remove(&mut self, key: BlockKey) {
        if self.resident.remove(&key).is_some() {
            self.removals += 1;
            tracing::trace!(%key, "mesh removed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesher::Mesh;
    use glam::IVec3;

    #[test]
    fn upload_replaces_and_remove_drops() {
        let key = BlockKey::new(0, IVec3::new(1, 2, 3));
        let mut sink = DebugMeshSink::new();
        let mut mesh = Mesh::empty(key, 1);
        mesh.vertices = vec![
            Vertex {
                position: [0.0; 3],
                normal: [0.0, 0.0, 1.0],
                material: 1,
            };
            4
        ];
        mesh.indices = vec![0, 1, 2, 0, 2, 3];
        sink.upload(key, &mesh.view());
        mesh.revision = 2;
        sink.upload(key, &mesh.view());
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.revision(key), Some(2));
        assert_eq!(sink.triangle_count(), 2);
        assert!(sink.render().contains("L0(1, 2, 3) rev=2"));

        sink.remove(key);
        sink.remove(key);
        assert!(sink.is_empty());
        assert_eq!(sink.removals(), 1);
        assert_eq!(sink.uploads(), 2);
    }
}
