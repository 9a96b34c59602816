use bytemuck::{Pod, Zeroable};
use glam::IVec3;
use voxelcore_common::{BlockKey, Face, Voxel};
use voxelcore_kernel::{NeighborBorders, VoxelBlock};

use crate::sink::MeshView;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub material: u32,
}

/// Surface of one block, built from a specific block revision.
#[derive(Debug, Clone, PartialEq)]
pub struct Mesh {
    pub key: BlockKey,
    pub revision: u64,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn empty(key: BlockKey, revision: u64) -> Self {
        Self {
            key,
            revision,
            vertices: Vec::new(),
            indices: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn quad_count(&self) -> usize {
        self.vertices.len() / 4
    }

    /// Stale when the block moved past the revision this mesh was built from.
    pub fn is_stale(&self, block: &VoxelBlock) -> bool {
        self.revision != block.revision()
    }

    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    pub fn view(&self) -> MeshView<'_> {
        MeshView {
            key: self.key,
            revision: self.revision,
            vertices: &self.vertices,
            indices: &self.indices,
        }
    }

    fn push_quad(&mut self, corners: [IVec3; 4], face: Face, material: Voxel) {
        let base = self.vertices.len() as u32;
        let normal = face.normal().as_vec3().to_array();
        for c in corners {
            self.vertices.push(Vertex {
                position: c.as_vec3().to_array(),
                normal,
                material: material.0 as u32,
            });
        }
        if face.is_positive() {
            self.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        } else {
            self.indices
                .extend_from_slice(&[base, base + 2, base + 1, base, base + 3, base + 2]);
        }
    }
}

/// Greedy face-culling mesher.
///
/// A face is emitted where a solid cell meets a non-solid one, inside the
/// block or across a border. Coplanar faces of one material are merged into
/// maximal rectangles per slice. Positions are world units and triangles
/// wind counter-clockwise seen from outside.
pub fn build(block: &VoxelBlock, borders: &NeighborBorders) -> Mesh {
    let mut mesh = Mesh::empty(block.key(), block.revision());
    if !block.is_generated() {
        return mesh;
    }
    let e = block.edge() as i32;
    let spacing = block.key().spacing();
    let origin = block.origin();
    let mut mask: Vec<Option<Voxel>> = vec![None; (e * e) as usize];

    for face in Face::ALL {
        let a = face.axis();
        let (ua, va) = face.plane_axes();
        let step = if face.is_positive() { 1 } else { -1 };
        for d in 0..e {
            for j in 0..e {
                for i in 0..e {
                    let mut local = IVec3::ZERO;
                    local[a] = d;
                    local[ua] = i;
                    local[va] = j;
                    let here = block.get(local);
                    let visible = here.is_solid() && {
                        let n = d + step;
                        if (0..e).contains(&n) {
                            let mut across = local;
                            across[a] = n;
                            !block.get(across).is_solid()
                        } else {
                            !borders.is_solid(face, i as u32, j as u32)
                        }
                    };
                    mask[(i + j * e) as usize] = visible.then_some(here);
                }
            }

            let plane = origin[a] + if face.is_positive() { (d + 1) * spacing } else { d * spacing };
            for j in 0..e {
                let mut i = 0;
                while i < e {
                    let Some(material) = mask[(i + j * e) as usize] else {
                        i += 1;
                        continue;
                    };
                    let mut w = 1;
                    while i + w < e && mask[(i + w + j * e) as usize] == Some(material) {
                        w += 1;
                    }
                    let mut h = 1;
                    'grow: while j + h < e {
                        for k in 0..w {
                            if mask[(i + k + (j + h) * e) as usize] != Some(material) {
                                break 'grow;
                            }
                        }
                        h += 1;
                    }
                    for dj in 0..h {
                        for k in 0..w {
                            mask[(i + k + (j + dj) * e) as usize] = None;
                        }
                    }

                    let corner = |du: i32, dv: i32| {
                        let mut p = IVec3::ZERO;
                        p[a] = plane;
                        p[ua] = origin[ua] + (i + du) * spacing;
                        p[va] = origin[va] + (j + dv) * spacing;
                        p
                    };
                    mesh.push_quad(
                        [corner(0, 0), corner(w, 0), corner(w, h), corner(0, h)],
                        face,
                        material,
                    );
                    i += w;
                }
            }
        }
    }
    tracing::trace!(
        key = %mesh.key,
        revision = mesh.revision,
        quads = mesh.quad_count(),
        "mesh built"
    );
    mesh
}
