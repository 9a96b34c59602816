//! Occupancy just outside each face of a block, used to cull seam faces.
//!
//! Each face holds `edge * edge` values, one per cell of the block's face,
//! indexed `u + v * edge` over [`Face::plane_axes`]. When the neighbour is
//! coarser or at the same LOD the value is the neighbour cell that covers
//! the face cell. When it is finer the value is solid only if every fine
//! cell touching the face cell is solid, so a seam face is culled only when
//! fully covered.

use glam::IVec3;
use voxelcore_common::{BlockKey, Face, Voxel};

use crate::generator::Generator;

#[derive(Debug, Clone, PartialEq)]
pub struct NeighborBorders {
    edge: u32,
    faces: [Vec<Voxel>; 6],
}

/// What a point lookup found: the covering value and the LOD of the
/// resident block it came from, if any.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Lookup {
    pub value: Voxel,
    pub lod: Option<u8>,
}

impl NeighborBorders {
    /// Every border cell set to `value`.
    pub fn uniform(edge: u32, value: Voxel) -> Self {
        let n = (edge * edge) as usize;
        Self {
            edge,
            faces: std::array::from_fn(|_| vec![value; n]),
        }
    }

    /// Borders straight from the generator at the block's own LOD.
    pub fn from_generator(key: BlockKey, edge: u32, generator: &Generator) -> Self {
        collect(key, edge, |p| Lookup {
            value: generator.sample(p, key.lod),
            lod: None,
        })
    }

    pub fn edge(&self) -> u32 {
        self.edge
    }

    pub fn face(&self, face: Face) -> &[Voxel] {
        &self.faces[face.index()]
    }

    /// Border value across `face` at in-plane cell `(u, v)`.
    pub fn get(&self, face: Face, u: u32, v: u32) -> Voxel {
        self.faces[face.index()]
            .get((u + v * self.edge) as usize)
            .copied()
            .unwrap_or(Voxel::AIR)
    }

    pub fn is_solid(&self, face: Face, u: u32, v: u32) -> bool {
        self.get(face, u, v).is_solid()
    }
}

pub(crate) fn collect(
    key: BlockKey,
    edge: u32,
    mut lookup: impl FnMut(IVec3) -> Lookup,
) -> NeighborBorders {
    let origin = key.origin(edge);
    let spacing = key.spacing();
    let extent = key.extent(edge);
    let faces = Face::ALL.map(|face| {
        let a = face.axis();
        let (ua, va) = face.plane_axes();
        let layer = if face.is_positive() {
            origin[a] + extent
        } else {
            origin[a] - 1
        };
        let mut values = Vec::with_capacity((edge * edge) as usize);
        for v in 0..edge as i32 {
            for u in 0..edge as i32 {
                let mut p = IVec3::ZERO;
                p[a] = layer;
                p[ua] = origin[ua] + u * spacing;
                p[va] = origin[va] + v * spacing;
                let first = lookup(p);
                let value = match first.lod {
                    Some(lod) if lod < key.lod => covered(p, ua, va, spacing, &mut lookup),
                    _ => first.value,
                };
                values.push(value);
            }
        }
        values
    });
    NeighborBorders { edge, faces }
}

/// Solid only if every unit position of the face cell is backed by solid.
fn covered(
    corner: IVec3,
    ua: usize,
    va: usize,
    spacing: i32,
    lookup: &mut impl FnMut(IVec3) -> Lookup,
) -> Voxel {
    let mut representative = Voxel::AIR;
    for dv in 0..spacing {
        for du in 0..spacing {
            let mut q = corner;
            q[ua] += du;
            q[va] += dv;
            let value = lookup(q).value;
            if !value.is_solid() {
                return Voxel::AIR;
            }
            if representative.is_air() {
                representative = value;
            }
        }
    }
    representative
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::FlatPlane;
    use std::sync::Arc;

    #[test]
    fn flat_plane_borders() {
        let g = Generator::new(Arc::new(FlatPlane::default()), 0);
        let key = BlockKey::new(0, IVec3::new(0, 0, -1));
        let b = NeighborBorders::from_generator(key, 4, &g);
        // Above the block is air, below is solid, sides are solid.
        assert!(b.face(Face::PosZ).iter().all(|v| v.is_air()));
        assert!(b.face(Face::NegZ).iter().all(|v| v.is_solid()));
        assert!(b.face(Face::PosX).iter().all(|v| v.is_solid()));
    }

    #[test]
    fn finer_neighbour_needs_full_coverage() {
        let key = BlockKey::new(1, IVec3::ZERO);
        // The finer neighbour has a single air unit in the first face cell.
        let b = collect(key, 2, |p| Lookup {
            value: if p == IVec3::new(4, 1, 1) {
                Voxel::AIR
            } else {
                Voxel(2)
            },
            lod: Some(0),
        });
        assert!(b.is_solid(Face::PosX, 1, 1));
        assert!(!b.is_solid(Face::PosX, 0, 0));
    }

    #[test]
    fn coarser_neighbour_uses_covering_cell() {
        let key = BlockKey::new(0, IVec3::ZERO);
        let b = collect(key, 2, |p| Lookup {
            value: if p.z >= 1 { Voxel::AIR } else { Voxel(1) },
            lod: Some(1),
        });
        // PosX face: u = y, v = z.
        assert!(b.is_solid(Face::PosX, 0, 0));
        assert!(!b.is_solid(Face::PosX, 0, 1));
    }
}
