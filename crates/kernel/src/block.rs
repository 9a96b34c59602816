use std::collections::BTreeMap;

use glam::IVec3;
use voxelcore_common::{BlockKey, Voxel, WriteStamp};

use crate::error::CorruptBlockError;

/// A batch of writes to one block under a single stamp.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockEdit {
    pub stamp: WriteStamp,
    /// `(local index, new value)` pairs.
    pub writes: Vec<(u32, Voxel)>,
}

/// Fixed-edge cube of voxel samples at one LOD.
///
/// An ungenerated block carries no sample storage and revision 0. Filling it
/// (generation, archive load, coarsening) and every landed edit increment the
/// revision; meshes compare against it to detect staleness.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelBlock {
    key: BlockKey,
    edge: u32,
    samples: Vec<Voxel>,
    revision: u64,
    dirty: bool,
    unpersisted: bool,
    /// Last writer of each edited voxel, keyed by local index.
    overrides: BTreeMap<u32, WriteStamp>,
}

impl VoxelBlock {
    /// Create an ungenerated block.
    pub fn new(key: BlockKey, edge: u32) -> Self {
        debug_assert!(edge.is_power_of_two());
        Self {
            key,
            edge,
            samples: Vec::new(),
            revision: 0,
            dirty: false,
            unpersisted: false,
            overrides: BTreeMap::new(),
        }
    }

    /// Rebuild a block from persisted parts.
    pub fn from_parts(
        key: BlockKey,
        edge: u32,
        samples: Vec<Voxel>,
        revision: u64,
        overrides: BTreeMap<u32, WriteStamp>,
    ) -> Result<Self, CorruptBlockError> {
        if !edge.is_power_of_two() {
            return Err(CorruptBlockError::InvalidEdge(edge));
        }
        let expected = volume(edge);
        if samples.len() != expected {
            return Err(CorruptBlockError::SampleCountMismatch {
                declared: samples.len() as u64,
                expected: expected as u64,
            });
        }
        if let Some((&index, _)) = overrides.range(expected as u32..).next() {
            return Err(CorruptBlockError::OverrideOutOfRange {
                index,
                samples: expected,
            });
        }
        Ok(Self {
            key,
            edge,
            samples,
            revision: revision.max(1),
            dirty: true,
            unpersisted: false,
            overrides,
        })
    }

    pub fn key(&self) -> BlockKey {
        self.key
    }

    pub fn edge(&self) -> u32 {
        self.edge
    }

    pub fn lod(&self) -> u8 {
        self.key.lod
    }

    pub fn origin(&self) -> IVec3 {
        self.key.origin(self.edge)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn is_generated(&self) -> bool {
        !self.samples.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn has_unpersisted_edits(&self) -> bool {
        self.unpersisted
    }

    pub fn samples(&self) -> &[Voxel] {
        &self.samples
    }

    pub fn overrides(&self) -> &BTreeMap<u32, WriteStamp> {
        &self.overrides
    }

    /// Local index of a sample: x fastest, z slowest.
    pub fn index(&self, local: IVec3) -> usize {
        let e = self.edge as usize;
        local.x as usize + local.y as usize * e + local.z as usize * e * e
    }

    pub fn local_of_index(&self, index: usize) -> IVec3 {
        let e = self.edge as usize;
        IVec3::new(
            (index % e) as i32,
            ((index / e) % e) as i32,
            (index / (e * e)) as i32,
        )
    }

    /// Local sample coordinate covering world position `p`, if inside.
    pub fn local_of(&self, p: IVec3) -> Option<IVec3> {
        let rel = p - self.origin();
        let extent = self.key.extent(self.edge);
        if rel.cmplt(IVec3::ZERO).any() || rel.cmpge(IVec3::splat(extent)).any() {
            return None;
        }
        Some(rel / self.key.spacing())
    }

    /// Sample at a local coordinate. Air when ungenerated.
    pub fn get(&self, local: IVec3) -> Voxel {
        self.samples
            .get(self.index(local))
            .copied()
            .unwrap_or(Voxel::AIR)
    }

    /// Sample covering world position `p`. Air when outside or ungenerated.
    pub fn sample_world(&self, p: IVec3) -> Voxel {
        match self.local_of(p) {
            Some(local) => self.get(local),
            None => Voxel::AIR,
        }
    }

    /// Replace all samples with freshly produced content.
    pub fn install_samples(&mut self, samples: Vec<Voxel>) -> Result<(), CorruptBlockError> {
        let expected = volume(self.edge);
        if samples.len() != expected {
            return Err(CorruptBlockError::SampleCountMismatch {
                declared: samples.len() as u64,
                expected: expected as u64,
            });
        }
        self.samples = samples;
        self.revision += 1;
        self.dirty = true;
        Ok(())
    }

    /// Pure form of [`VoxelBlock::apply_in_place`].
    pub fn apply(&self, edit: &BlockEdit) -> VoxelBlock {
        let mut next = self.clone();
        next.apply_in_place(edit);
        next
    }

    /// Apply writes that beat the current last-writer stamp of their voxel.
    /// Returns the number of writes that landed. Any landed write bumps the
    /// revision and marks the block dirty and unpersisted.
    pub fn apply_in_place(&mut self, edit: &BlockEdit) -> usize {
        let mut landed = 0;
        for &(index, value) in &edit.writes {
            let Some(slot) = self.samples.get_mut(index as usize) else {
                continue;
            };
            let wins = self
                .overrides
                .get(&index)
                .is_none_or(|current| edit.stamp > *current);
            if !wins {
                continue;
            }
            *slot = value;
            self.overrides.insert(index, edit.stamp);
            landed += 1;
        }
        if landed > 0 {
            self.revision += 1;
            self.dirty = true;
            self.unpersisted = true;
        }
        landed
    }

    /// Force a re-mesh without changing samples (neighbour seam changed).
    pub fn invalidate(&mut self) {
        if self.is_generated() {
            self.revision += 1;
            self.dirty = true;
        }
    }

    /// Clear the dirty flag if a mesh of `revision` is current.
    pub fn mark_meshed(&mut self, revision: u64) {
        if revision == self.revision {
            self.dirty = false;
        }
    }

    pub fn mark_persisted(&mut self) {
        self.unpersisted = false;
    }

    /// Flag content that did not come from the local generator or archive.
    pub fn mark_unpersisted(&mut self) {
        if self.is_generated() {
            self.unpersisted = true;
        }
    }

    /// Drop samples and history, returning to the ungenerated state.
    pub fn clear(&mut self) {
        self.samples = Vec::new();
        self.overrides.clear();
        self.revision = 0;
        self.dirty = false;
        self.unpersisted = false;
    }

    /// Build the coarse parent of eight generated children.
    ///
    /// Each parent cell covers a 2x2x2 group of child cells. Solid wins when
    /// at least half the group is solid, taking the most frequent solid
    /// material (lower id on ties); otherwise the cell is air.
    pub fn coarsened_from(key: BlockKey, edge: u32, children: [&VoxelBlock; 8]) -> VoxelBlock {
        let e = edge as i32;
        let mut samples = Vec::with_capacity(volume(edge));
        for z in 0..e {
            for y in 0..e {
                for x in 0..e {
                    let mut group = [Voxel::AIR; 8];
                    for (i, slot) in group.iter_mut().enumerate() {
                        let g = IVec3::new(
                            2 * x + (i & 1) as i32,
                            2 * y + ((i >> 1) & 1) as i32,
                            2 * z + ((i >> 2) & 1) as i32,
                        );
                        let octant = (g.x / e) as usize
                            + 2 * (g.y / e) as usize
                            + 4 * (g.z / e) as usize;
                        let child = children[octant];
                        *slot = child.get(IVec3::new(g.x % e, g.y % e, g.z % e));
                    }
                    samples.push(majority_solid(group));
                }
            }
        }
        VoxelBlock {
            key,
            edge,
            samples,
            revision: 1,
            dirty: true,
            unpersisted: false,
            overrides: BTreeMap::new(),
        }
    }
}

/// Largest accepted block edge, in samples.
pub const MAX_BLOCK_EDGE: u32 = 256;

pub(crate) fn volume(edge: u32) -> usize {
    let e = edge as usize;
    e * e * e
}

fn majority_solid(mut group: [Voxel; 8]) -> Voxel {
    let solid = group.iter().filter(|v| v.is_solid()).count();
    if solid < 4 {
        return Voxel::AIR;
    }
    group.sort_unstable();
    let mut best = Voxel::AIR;
    let mut best_run = 0;
    let mut i = 0;
    while i < group.len() {
        let v = group[i];
        let mut j = i;
        while j < group.len() && group[j] == v {
            j += 1;
        }
        if v.is_solid() && j - i > best_run {
            best = v;
            best_run = j - i;
        }
        i = j;
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxelcore_common::PeerId;

    fn generated(key: BlockKey, edge: u32, value: Voxel) -> VoxelBlock {
        let mut b = VoxelBlock::new(key, edge);
        b.install_samples(vec![value; volume(edge)]).unwrap();
        b
    }

    fn stamp(t: u64, peer: u8) -> WriteStamp {
        WriteStamp::new(t, PeerId::from_bytes([peer; 16]))
    }

    #[test]
    fn new_block_is_ungenerated() {
        let b = VoxelBlock::new(BlockKey::default(), 8);
        assert!(!b.is_generated());
        assert_eq!(b.revision(), 0);
        assert_eq!(b.get(IVec3::ZERO), Voxel::AIR);
    }

    #[test]
    fn install_rejects_wrong_count() {
        let mut b = VoxelBlock::new(BlockKey::default(), 4);
        assert!(matches!(
            b.install_samples(vec![Voxel::AIR; 10]),
            Err(CorruptBlockError::SampleCountMismatch { .. })
        ));
    }

    #[test]
    fn apply_is_pure_and_bumps_revision() {
        let b = generated(BlockKey::default(), 4, Voxel::AIR);
        let edit = BlockEdit {
            stamp: stamp(1, 1),
            writes: vec![(5, Voxel(3))],
        };
        let next = b.apply(&edit);
        assert_eq!(b.samples()[5], Voxel::AIR);
        assert_eq!(next.samples()[5], Voxel(3));
        assert_eq!(next.revision(), b.revision() + 1);
        assert!(next.is_dirty());
        assert!(next.has_unpersisted_edits());
    }

    #[test]
    fn older_stamp_loses() {
        let mut b = generated(BlockKey::default(), 4, Voxel::AIR);
        b.apply_in_place(&BlockEdit {
            stamp: stamp(5, 1),
            writes: vec![(0, Voxel(2))],
        });
        let rev = b.revision();
        let landed = b.apply_in_place(&BlockEdit {
            stamp: stamp(4, 9),
            writes: vec![(0, Voxel(7))],
        });
        assert_eq!(landed, 0);
        assert_eq!(b.samples()[0], Voxel(2));
        assert_eq!(b.revision(), rev);
    }

    #[test]
    fn tie_broken_by_peer_id() {
        let mut b = generated(BlockKey::default(), 4, Voxel::AIR);
        b.apply_in_place(&BlockEdit {
            stamp: stamp(3, 2),
            writes: vec![(0, Voxel(2))],
        });
        b.apply_in_place(&BlockEdit {
            stamp: stamp(3, 1),
            writes: vec![(0, Voxel(1))],
        });
        assert_eq!(b.samples()[0], Voxel(2));
    }

    #[test]
    fn local_coordinates_respect_lod_spacing() {
        let key = BlockKey::new(1, IVec3::new(1, 0, -1));
        let b = generated(key, 4, Voxel(1));
        assert_eq!(b.origin(), IVec3::new(8, 0, -8));
        assert_eq!(b.local_of(IVec3::new(9, 3, -1)), Some(IVec3::new(0, 1, 3)));
        assert_eq!(b.local_of(IVec3::new(16, 0, -8)), None);
        assert_eq!(b.local_of_index(b.index(IVec3::new(1, 2, 3))), IVec3::new(1, 2, 3));
    }

    #[test]
    fn coarsening_takes_majority() {
        let parent = BlockKey::new(1, IVec3::ZERO);
        let children_keys = parent.children().unwrap();
        let solid: Vec<VoxelBlock> = children_keys
            .iter()
            .enumerate()
            .map(|(i, k)| {
                // Lower half (z octants 0..4) stone, upper half air.
                let v = if i < 4 { Voxel(3) } else { Voxel::AIR };
                generated(*k, 4, v)
            })
            .collect();
        let refs: [&VoxelBlock; 8] = std::array::from_fn(|i| &solid[i]);
        let coarse = VoxelBlock::coarsened_from(parent, 4, refs);
        assert_eq!(coarse.revision(), 1);
        assert_eq!(coarse.get(IVec3::new(0, 0, 0)), Voxel(3));
        assert_eq!(coarse.get(IVec3::new(3, 3, 1)), Voxel(3));
        assert_eq!(coarse.get(IVec3::new(0, 0, 2)), Voxel::AIR);
    }

    #[test]
    fn majority_prefers_frequent_then_lower_id() {
        let v = [
            Voxel(2),
            Voxel(2),
            Voxel(3),
            Voxel(3),
            Voxel::AIR,
            Voxel::AIR,
            Voxel::AIR,
            Voxel::AIR,
        ];
        assert_eq!(majority_solid(v), Voxel(2));
        let v = [
            Voxel(5),
            Voxel(5),
            Voxel(5),
            Voxel::AIR,
            Voxel::AIR,
            Voxel::AIR,
            Voxel::AIR,
            Voxel::AIR,
        ];
        assert_eq!(majority_solid(v), Voxel::AIR);
    }
}
