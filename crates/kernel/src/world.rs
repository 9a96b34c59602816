use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use glam::IVec3;
use voxelcore_common::{BlockKey, Face, PeerId, Voxel, VoxelRegion, WriteStamp};

use crate::archive::BlockArchive;
use crate::block::{BlockEdit, VoxelBlock};
use crate::borders::{self, NeighborBorders, Lookup};
use crate::config::WorldConfig;
use crate::edit::{
    Admission, EditLog, EditLogState, EditRecord, RemoteOutcome, VoxelEdit, blocks_touching,
};
use crate::error::{ArchiveError, CoarsenDeniedError, EvictionDeniedError, WorldError};
use crate::generator::{Generator, VoxelSource};
use crate::octree::{NodeId, Octree};

/// The authoritative voxel world of one replica.
///
/// Owns the octree, the generator, the edit log and an optional archive.
/// All mutation goes through `&mut self`; the streaming scheduler is the
/// only caller in a running system, workers receive owned copies.
pub struct World {
    config: WorldConfig,
    generator: Generator,
    octree: Octree,
    log: EditLog,
    archive: Option<Box<dyn BlockArchive>>,
    dirty: BTreeSet<BlockKey>,
}

impl fmt::Debug for World {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("World")
            .field("config", &self.config)
            .field("generator", &self.generator)
            .field("nodes", &self.octree.node_count())
            .field("log_len", &self.log.len())
            .field("archive", &self.archive.is_some())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

impl World {
    pub fn new(
        config: WorldConfig,
        source: Arc<dyn VoxelSource>,
        local: PeerId,
    ) -> Result<Self, WorldError> {
        config.validate()?;
        let generator = Generator::new(source, config.seed);
        let octree = Octree::new(config.block_edge, config.max_lod);
        let log = EditLog::new(local, config.max_buffered_remote, &config.required_peers);
        tracing::debug!(
            %local,
            seed = config.seed,
            edge = config.block_edge,
            max_lod = config.max_lod,
            source = generator.source_name(),
            "world created"
        );
        Ok(Self {
            config,
            generator,
            octree,
            log,
            archive: None,
            dirty: BTreeSet::new(),
        })
    }

    pub fn with_archive(mut self, archive: Box<dyn BlockArchive>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn set_archive(&mut self, archive: Box<dyn BlockArchive>) {
        self.archive = Some(archive);
    }

    pub fn has_archive(&self) -> bool {
        self.archive.is_some()
    }

    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    pub fn edge(&self) -> u32 {
        self.config.block_edge
    }

    pub fn generator(&self) -> &Generator {
        &self.generator
    }

    pub fn octree(&self) -> &Octree {
        &self.octree
    }

    pub fn edit_log(&self) -> &EditLog {
        &self.log
    }

    pub fn local_peer(&self) -> PeerId {
        self.log.local_peer()
    }

    pub fn add_required_peer(&mut self, peer: PeerId) {
        self.log.add_required_peer(peer);
    }

    /// Block at exactly `key`, if the node exists and is a leaf.
    pub fn block(&self, key: BlockKey) -> Option<&VoxelBlock> {
        self.octree.find(key).and_then(|id| self.octree.block(id))
    }

    /// Node at `key`, creating it and its ancestors if needed.
    pub fn ensure_node(&mut self, key: BlockKey) -> NodeId {
        self.octree.ensure(key)
    }

    /// Leaves covering `region` at `lod` or finer.
    pub fn resolve(&mut self, region: &VoxelRegion, lod: u8) -> Vec<(NodeId, BlockKey)> {
        let ids = self.octree.resolve(region, lod);
        ids.into_iter()
            .filter_map(|id| self.octree.node(id).map(|n| (id, n.key())))
            .collect()
    }

    /// Existing or newly created block at `key`, generated on demand.
    /// Idempotent: a second call returns the same block unchanged.
    pub fn block_or_create(&mut self, key: BlockKey) -> Result<&VoxelBlock, WorldError> {
        let id = self.ensure_generated(key)?;
        self.octree.block(id).ok_or(WorldError::NotALeaf(key))
    }

    fn ensure_generated(&mut self, key: BlockKey) -> Result<NodeId, WorldError> {
        let id = self.octree.ensure(key);
        let generated = self
            .octree
            .block(id)
            .ok_or(WorldError::NotALeaf(key))?
            .is_generated();
        if !generated {
            let resident = self.octree.node(id).map(|n| n.key()).unwrap_or(key);
            let loaded = match self.load_persisted(resident) {
                Ok(loaded) => loaded,
                Err(WorldError::Corrupt(_)) => false,
                Err(err) => return Err(err),
            };
            if !loaded {
                let samples = self.generator.samples_for(resident, self.edge());
                self.install_generated(resident, samples)?;
            }
        }
        Ok(id)
    }

    /// Install the archived copy of an ungenerated leaf. Returns whether one
    /// was installed. A corrupt record is reported and left for the
    /// generator.
    pub fn load_persisted(&mut self, key: BlockKey) -> Result<bool, WorldError> {
        let Some(archive) = self.archive.as_ref() else {
            return Ok(false);
        };
        if !archive.contains(key) {
            return Ok(false);
        }
        let loaded = match archive.load(key) {
            Ok(Some(block)) => block,
            Ok(None) => return Ok(false),
            Err(ArchiveError::Corrupt(err)) => {
                tracing::warn!(%key, %err, "corrupt archived block, regenerating");
                return Err(WorldError::Corrupt(err));
            }
            Err(err) => return Err(err.into()),
        };
        if loaded.key() != key || loaded.edge() != self.edge() {
            tracing::warn!(%key, found = %loaded.key(), "archived block does not match its slot");
            return Ok(false);
        }
        let Some(slot) = self.octree.find(key).and_then(|id| self.octree.block_mut(id)) else {
            return Ok(false);
        };
        if slot.is_generated() {
            return Ok(false);
        }
        let edited = !loaded.overrides().is_empty();
        *slot = loaded;
        self.dirty.insert(key);
        self.invalidate_neighbors(key, edited);
        tracing::trace!(%key, "block loaded from archive");
        Ok(true)
    }

    /// Install generated samples into an ungenerated leaf. Returns `false`
    /// when the result is stale: the node is gone, subdivided, or already
    /// filled.
    pub fn install_generated(
        &mut self,
        key: BlockKey,
        samples: Vec<Voxel>,
    ) -> Result<bool, WorldError> {
        let Some(block) = self.octree.find(key).and_then(|id| self.octree.block_mut(id)) else {
            return Ok(false);
        };
        if block.is_generated() {
            return Ok(false);
        }
        block.install_samples(samples)?;
        self.dirty.insert(key);
        self.invalidate_neighbors(key, false);
        Ok(true)
    }

    /// Re-mesh resident neighbours whose seam with `key` may have changed.
    /// Same-LOD neighbours already saw generator content across the seam,
    /// so they only need it when `edited` content arrived.
    fn invalidate_neighbors(&mut self, key: BlockKey, edited: bool) {
        let edge = self.edge();
        let region = key.region(edge);
        let extent = key.extent(edge);
        let mut touched = BTreeSet::new();
        for face in Face::ALL {
            let a = face.axis();
            let (ua, va) = face.plane_axes();
            let last = extent - 1;
            let samples = [(0, 0), (last, 0), (0, last), (last, last), (extent / 2, extent / 2)];
            for (du, dv) in samples {
                let mut p = region.min;
                p[a] = if face.is_positive() {
                    region.max[a]
                } else {
                    region.min[a] - 1
                };
                p[ua] += du;
                p[va] += dv;
                if let Some(id) = self.octree.leaf_at(p) {
                    touched.insert(id);
                }
            }
        }
        for id in touched {
            let Some(block) = self.octree.block_mut(id) else {
                continue;
            };
            if !block.is_generated() || (block.lod() == key.lod && !edited) {
                continue;
            }
            block.invalidate();
            self.dirty.insert(block.key());
        }
    }

    /// Current value at world position `p`: the resident block covering it,
    /// else the generator at LOD 0.
    pub fn voxel(&self, p: IVec3) -> Voxel {
        match self.octree.leaf_at(p).and_then(|id| self.octree.block(id)) {
            Some(block) if block.is_generated() => block.sample_world(p),
            _ => self.generator.sample(p, 0),
        }
    }

    /// Apply a local edit and append it to the log.
    pub fn record(&mut self, edit: VoxelEdit) -> Result<EditRecord, WorldError> {
        check_values(&self.config, &edit.region, edit.values.len())?;
        let touched = blocks_touching(&edit.region, self.edge());
        for key in &touched {
            self.ensure_generated(*key)?;
        }
        let prior = edit.region.positions().map(|p| self.voxel(p)).collect();
        let (seq, timestamp) = self.log.next_local_stamp();
        let record = EditRecord {
            origin: self.log.local_peer(),
            seq,
            timestamp,
            region: edit.region,
            prior,
            values: edit.values,
        };
        let landed = self.apply_record(&record);
        self.log.append(record.clone(), touched);
        tracing::debug!(seq, timestamp, landed, "local edit recorded");
        Ok(record)
    }

    /// Deliver a record from another replica, respecting per-origin order.
    pub fn receive_remote(&mut self, record: EditRecord) -> Result<RemoteOutcome, WorldError> {
        check_values(&self.config, &record.region, record.values.len())?;
        let ready = match self.log.admit_remote(record)? {
            Admission::Duplicate => return Ok(RemoteOutcome::Duplicate),
            Admission::Buffered => return Ok(RemoteOutcome::Buffered),
            Admission::Ready(ready) => ready,
        };
        let records = ready.len();
        for record in ready {
            self.deliver(record)?;
        }
        Ok(RemoteOutcome::Applied { records })
    }

    fn deliver(&mut self, record: EditRecord) -> Result<(), WorldError> {
        self.log.observe(record.timestamp);
        let touched = blocks_touching(&record.region, self.edge());
        for key in &touched {
            self.ensure_generated(*key)?;
        }
        let landed = self.apply_record(&record);
        tracing::debug!(
            origin = %record.origin,
            seq = record.seq,
            timestamp = record.timestamp,
            landed,
            "remote edit applied"
        );
        self.log.append(record, touched);
        Ok(())
    }

    /// Write a record's values into resident LOD 0 blocks under LWW.
    fn apply_record(&mut self, record: &EditRecord) -> usize {
        let edge = self.edge();
        let e = edge as i32;
        let mut per_block: BTreeMap<BlockKey, Vec<(u32, Voxel)>> = BTreeMap::new();
        let mut seam_points = Vec::new();
        for (p, value) in record.writes() {
            let key = BlockKey::containing(p, 0, edge);
            let local = p - key.origin(edge);
            let index = (local.x + local.y * e + local.z * e * e) as u32;
            per_block.entry(key).or_default().push((index, value));
            for face in Face::ALL {
                let c = local[face.axis()];
                if (face.is_positive() && c == e - 1) || (!face.is_positive() && c == 0) {
                    seam_points.push(p + face.normal());
                }
            }
        }

        let stamp = record.stamp();
        let mut landed = 0;
        for (key, writes) in &per_block {
            let Some(block) = self.octree.find(*key).and_then(|id| self.octree.block_mut(id)) else {
                continue;
            };
            let n = block.apply_in_place(&BlockEdit {
                stamp,
                writes: writes.clone(),
            });
            if n > 0 {
                landed += n;
                self.dirty.insert(*key);
            }
        }

        let neighbours: BTreeSet<NodeId> = seam_points
            .into_iter()
            .filter_map(|p| self.octree.leaf_at(p))
            .collect();
        for id in neighbours {
            if let Some(block) = self.octree.block_mut(id) {
                if !per_block.contains_key(&block.key()) && block.is_generated() {
                    block.invalidate();
                    self.dirty.insert(block.key());
                }
            }
        }
        landed
    }

    /// Record that `acker` has applied `origin`'s records up to `seq`.
    pub fn acknowledge(&mut self, acker: PeerId, origin: PeerId, seq: u64) {
        self.log.acknowledge(acker, origin, seq);
    }

    /// Persist `key` if it holds unpersisted edits, then fold acknowledged
    /// records touching it out of the log. Returns the folded record count.
    ///
    /// Without an archive edits stay flagged unpersisted, which keeps the
    /// block resident.
    pub fn compact(&mut self, key: BlockKey) -> Result<usize, WorldError> {
        if let Some(archive) = self.archive.as_mut() {
            let block = self.octree.find(key).and_then(|id| self.octree.block_mut(id));
            if let Some(block) = block {
                if block.is_generated() && block.has_unpersisted_edits() {
                    archive.store(block)?;
                    block.mark_persisted();
                    tracing::debug!(%key, revision = block.revision(), "block persisted");
                }
            }
        }
        Ok(self.log.fold_acknowledged(key))
    }

    /// [`World::compact`] every block with pending records or unpersisted
    /// edits.
    pub fn compact_all(&mut self) -> Result<usize, WorldError> {
        let mut keys = self.log.pending_keys();
        keys.extend(self.unpersisted_keys());
        let mut folded = 0;
        for key in keys {
            folded += self.compact(key)?;
        }
        Ok(folded)
    }

    /// Leaves whose edits are not in the archive.
    pub fn unpersisted_keys(&self) -> Vec<BlockKey> {
        self.octree
            .leaves()
            .into_iter()
            .filter_map(|id| self.octree.block(id))
            .filter(|b| b.has_unpersisted_edits())
            .map(|b| b.key())
            .collect()
    }

    /// Evict the subtree at `key`. Returns the number of nodes released.
    pub fn evict(&mut self, key: BlockKey) -> Result<usize, WorldError> {
        let Some(id) = self.octree.find(key) else {
            return Ok(0);
        };
        let edge = self.edge();
        let region = key.region(edge);
        if let Some(pending) = self.log.first_pending_in(&region, edge) {
            return Err(EvictionDeniedError { node: key, pending }.into());
        }
        let released = self.octree.evict(id)?;
        self.dirty.retain(|k| !region.intersects(&k.region(edge)));
        Ok(released)
    }

    /// Collapse the branch at `key` into one coarse leaf.
    pub fn coarsen(&mut self, key: BlockKey) -> Result<(), WorldError> {
        let id = self
            .octree
            .find(key)
            .ok_or(CoarsenDeniedError::NotBranch(key))?;
        let edge = self.edge();
        let region = key.region(edge);
        if let Some(pending) = self.log.first_pending_in(&region, edge) {
            return Err(CoarsenDeniedError::ChildUnpersisted(pending).into());
        }
        self.octree.coarsen(id)?;
        self.dirty.retain(|k| !region.intersects(&k.region(edge)));
        if self.octree.block(id).is_some_and(VoxelBlock::is_generated) {
            self.dirty.insert(key);
            self.invalidate_neighbors(key, false);
        }
        Ok(())
    }

    /// Split the leaf at `key` into eight ungenerated children.
    pub fn subdivide(&mut self, key: BlockKey) -> Option<[BlockKey; 8]> {
        let id = self.octree.find(key)?;
        self.octree.subdivide(id)?;
        self.dirty.remove(&key);
        key.children()
    }

    /// Occupancy across each face of `key`, from resident neighbours where
    /// present and the generator elsewhere.
    pub fn neighbor_borders(&self, key: BlockKey) -> NeighborBorders {
        borders::collect(key, self.edge(), |p| {
            match self.octree.leaf_at(p).and_then(|id| self.octree.block(id)) {
                Some(block) if block.is_generated() => Lookup {
                    value: block.sample_world(p),
                    lod: Some(block.lod()),
                },
                _ => Lookup {
                    value: self.generator.sample(p, key.lod),
                    lod: None,
                },
            }
        })
    }

    /// Keys whose content changed since the last call.
    pub fn take_dirty(&mut self) -> BTreeSet<BlockKey> {
        std::mem::take(&mut self.dirty)
    }

    /// Clear the block's dirty flag if `revision` is still current.
    pub fn mark_meshed(&mut self, key: BlockKey, revision: u64) {
        if let Some(block) = self.octree.find(key).and_then(|id| self.octree.block_mut(id)) {
            block.mark_meshed(revision);
        }
    }

    /// Merge a block received in a snapshot. Local writes with a newer stamp
    /// survive the merge.
    pub fn install_snapshot(&mut self, mut incoming: VoxelBlock) -> Result<(), WorldError> {
        let key = incoming.key();
        if !self.config.admits_block(key) {
            return Err(WorldError::BlockOutOfBounds(key));
        }
        if incoming.edge() != self.edge() {
            return Err(WorldError::InvalidConfig(format!(
                "snapshot block edge {} does not match world edge {}",
                incoming.edge(),
                self.edge()
            )));
        }
        let id = self.octree.ensure(key);
        let slot = self.octree.block_mut(id).ok_or(WorldError::NotALeaf(key))?;
        if slot.is_generated() {
            let mut by_stamp: BTreeMap<WriteStamp, Vec<(u32, Voxel)>> = BTreeMap::new();
            for (index, stamp) in slot.overrides() {
                by_stamp
                    .entry(*stamp)
                    .or_default()
                    .push((*index, slot.samples()[*index as usize]));
            }
            for (stamp, writes) in by_stamp {
                incoming.apply_in_place(&BlockEdit { stamp, writes });
            }
        }
        incoming.mark_unpersisted();
        let edited = !incoming.overrides().is_empty();
        *slot = incoming;
        self.dirty.insert(key);
        self.invalidate_neighbors(key, edited);
        tracing::debug!(%key, "snapshot block installed");
        Ok(())
    }

    /// Adopt a peer's delivery progress after installing its snapshot, then
    /// apply buffered records that became deliverable.
    pub fn merge_remote_progress(
        &mut self,
        delivered: &BTreeMap<PeerId, u64>,
        clock: u64,
    ) -> Result<usize, WorldError> {
        self.log.observe(clock);
        let ready = self.log.merge_delivered(delivered);
        let applied = ready.len();
        for record in ready {
            self.deliver(record)?;
        }
        Ok(applied)
    }

    pub fn export_log(&self) -> EditLogState {
        self.log.export()
    }

    pub fn restore_log(&mut self, state: EditLogState) {
        self.log.restore(state, self.edge());
    }

    /// Resident LOD 0 blocks carrying edits, in key order.
    pub fn edited_blocks(&self) -> Vec<&VoxelBlock> {
        let mut blocks: Vec<&VoxelBlock> = self
            .octree
            .leaves()
            .into_iter()
            .filter_map(|id| self.octree.block(id))
            .filter(|b| b.lod() == 0 && !b.overrides().is_empty())
            .collect();
        blocks.sort_by_key(|b| b.key());
        blocks
    }

    /// LOD 0 keys holding edits, resident or in the archive.
    pub fn edited_keys(&self) -> Result<BTreeSet<BlockKey>, WorldError> {
        let mut keys: BTreeSet<BlockKey> = self.edited_blocks().iter().map(|b| b.key()).collect();
        if let Some(archive) = self.archive.as_ref() {
            keys.extend(archive.archived_keys()?.into_iter().filter(|k| k.lod == 0));
        }
        Ok(keys)
    }

    /// Deterministic FNV-1a hash of edited content. Replicas that applied
    /// the same records hash equal regardless of delivery order.
    pub fn state_hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        let mix = |h: &mut u64, bytes: &[u8]| {
            for b in bytes {
                *h ^= *b as u64;
                *h = h.wrapping_mul(0x0100_0000_01b3);
            }
        };
        for block in self.edited_blocks() {
            let key = block.key();
            mix(&mut h, &[key.lod]);
            mix(&mut h, &key.x.to_le_bytes());
            mix(&mut h, &key.y.to_le_bytes());
            mix(&mut h, &key.z.to_le_bytes());
            for v in block.samples() {
                mix(&mut h, &[v.0]);
            }
        }
        h
    }
}

fn check_values(config: &WorldConfig, region: &VoxelRegion, actual: usize) -> Result<(), WorldError> {
    if region.is_empty() {
        return Err(WorldError::EmptyRegion);
    }
    if !config.bounds().contains_region(region) {
        return Err(WorldError::OutOfBounds(*region));
    }
    let expected = region.volume();
    if expected != actual {
        return Err(WorldError::ValueCountMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::MemoryArchive;
    use crate::generator::{FlatPlane, splitmix64};

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 16])
    }

    fn flat_world(local: PeerId) -> World {
        let config = WorldConfig {
            block_edge: 8,
            max_lod: 2,
            ..WorldConfig::default()
        };
        World::new(config, Arc::new(FlatPlane::default()), local).unwrap()
    }

    #[test]
    fn voxel_falls_back_to_generator() {
        let w = flat_world(peer(1));
        assert_eq!(w.voxel(IVec3::new(3, 3, -1)), Voxel(1));
        assert_eq!(w.voxel(IVec3::new(3, 3, 0)), Voxel::AIR);
    }

    #[test]
    fn block_or_create_is_idempotent() {
        let mut w = flat_world(peer(1));
        let key = BlockKey::new(0, IVec3::new(0, 0, -1));
        let rev = w.block_or_create(key).unwrap().revision();
        let nodes = w.octree().node_count();
        assert_eq!(w.block_or_create(key).unwrap().revision(), rev);
        assert_eq!(w.octree().node_count(), nodes);
    }

    #[test]
    fn record_applies_and_captures_prior() {
        let mut w = flat_world(peer(1));
        let p = IVec3::new(2, 2, -1);
        let record = w.record(VoxelEdit::set(p, Voxel::AIR)).unwrap();
        assert_eq!(record.seq, 1);
        assert_eq!(record.timestamp, 1);
        assert_eq!(record.prior, vec![Voxel(1)]);
        assert_eq!(w.voxel(p), Voxel::AIR);

        let key = BlockKey::containing(p, 0, 8);
        let block = w.block(key).unwrap();
        assert!(block.has_unpersisted_edits());
        assert!(w.take_dirty().contains(&key));
        assert_eq!(w.edit_log().len(), 1);
    }

    #[test]
    fn mismatched_values_rejected() {
        let mut w = flat_world(peer(1));
        let region = VoxelRegion::new(IVec3::ZERO, IVec3::new(2, 2, 1));
        let err = w.record(VoxelEdit::new(region, vec![Voxel(1)])).unwrap_err();
        assert!(matches!(err, WorldError::ValueCountMismatch { expected: 4, actual: 1 }));
        let empty = VoxelRegion::new(IVec3::ZERO, IVec3::ZERO);
        assert!(matches!(
            w.record(VoxelEdit::new(empty, vec![])),
            Err(WorldError::EmptyRegion)
        ));
    }

    #[test]
    fn edits_outside_the_world_are_refused() {
        let config = WorldConfig {
            block_edge: 8,
            max_lod: 2,
            world_size: crate::config::WorldSize::Small,
            ..WorldConfig::default()
        };
        let mut w = World::new(config, Arc::new(FlatPlane::default()), peer(1)).unwrap();
        let inside = IVec3::new(135, -128, 0);
        w.record(VoxelEdit::set(inside, Voxel(3))).unwrap();

        let outside = VoxelEdit::set(IVec3::new(136, 0, 0), Voxel(3));
        assert!(matches!(w.record(outside), Err(WorldError::OutOfBounds(_))));

        // Extreme regions fail the bounds check before any size arithmetic.
        let extreme = VoxelRegion::new(IVec3::new(i32::MIN, 0, 0), IVec3::new(i32::MAX, 1, 1));
        let record = EditRecord {
            origin: peer(2),
            seq: 1,
            timestamp: 1,
            region: extreme,
            prior: vec![Voxel(1)],
            values: vec![Voxel(1)],
        };
        assert!(matches!(w.receive_remote(record), Err(WorldError::OutOfBounds(_))));
        assert_eq!(w.edit_log().delivered(peer(2)), 0);

        let far = VoxelBlock::new(BlockKey::new(0, IVec3::new(40, 0, 0)), 8);
        assert!(matches!(
            w.install_snapshot(far),
            Err(WorldError::BlockOutOfBounds(_))
        ));
    }

    #[test]
    fn edit_spanning_blocks_touches_each() {
        let mut w = flat_world(peer(1));
        let region = VoxelRegion::new(IVec3::new(6, 0, 0), IVec3::new(10, 1, 1));
        w.record(VoxelEdit::fill(region, Voxel(4))).unwrap();
        assert_eq!(w.voxel(IVec3::new(7, 0, 0)), Voxel(4));
        assert_eq!(w.voxel(IVec3::new(8, 0, 0)), Voxel(4));
        assert_eq!(w.edited_blocks().len(), 2);
    }

    #[test]
    fn border_edit_invalidates_neighbour() {
        let mut w = flat_world(peer(1));
        let left = BlockKey::new(0, IVec3::new(0, 0, -1));
        let right = BlockKey::new(0, IVec3::new(1, 0, -1));
        w.block_or_create(left).unwrap();
        let before = w.block_or_create(right).unwrap().revision();
        w.take_dirty();
        w.record(VoxelEdit::set(IVec3::new(7, 3, -2), Voxel::AIR)).unwrap();
        let dirty = w.take_dirty();
        assert!(dirty.contains(&left));
        assert!(dirty.contains(&right));
        assert_eq!(w.block(right).unwrap().revision(), before + 1);
    }

    #[test]
    fn later_timestamp_wins_on_both_replicas() {
        let (pa, pb) = (peer(1), peer(2));
        let mut a = flat_world(pa);
        let mut b = flat_world(pb);
        let p = IVec3::new(1, 1, 1);

        // B's clock runs ahead so its write carries the later timestamp.
        let warmup = b.record(VoxelEdit::set(IVec3::new(40, 0, 0), Voxel(2))).unwrap();
        let ra = a.record(VoxelEdit::set(p, Voxel(5))).unwrap();
        let rb = b.record(VoxelEdit::set(p, Voxel(7))).unwrap();
        assert_eq!(ra.timestamp, 1);
        assert_eq!(rb.timestamp, 2);

        a.receive_remote(warmup).unwrap();
        a.receive_remote(rb).unwrap();
        b.receive_remote(ra).unwrap();
        assert_eq!(a.voxel(p), Voxel(7));
        assert_eq!(b.voxel(p), Voxel(7));
        assert_eq!(a.state_hash(), b.state_hash());
    }

    #[test]
    fn gap_is_buffered_until_filled() {
        let origin = peer(9);
        let mut source = flat_world(origin);
        let r1 = source.record(VoxelEdit::set(IVec3::ZERO, Voxel(3))).unwrap();
        let r2 = source.record(VoxelEdit::set(IVec3::ZERO, Voxel(4))).unwrap();

        let mut w = flat_world(peer(1));
        assert_eq!(w.receive_remote(r2.clone()).unwrap(), RemoteOutcome::Buffered);
        assert_eq!(w.voxel(IVec3::ZERO), Voxel::AIR);
        assert_eq!(w.receive_remote(r1).unwrap(), RemoteOutcome::Applied { records: 2 });
        assert_eq!(w.voxel(IVec3::ZERO), Voxel(4));
        assert_eq!(w.receive_remote(r2).unwrap(), RemoteOutcome::Duplicate);
    }

    #[test]
    fn overflowing_buffer_is_out_of_order() {
        let origin = peer(9);
        let mut source = flat_world(origin);
        let records: Vec<EditRecord> = (0..4)
            .map(|i| source.record(VoxelEdit::set(IVec3::new(i, 0, 0), Voxel(2))).unwrap())
            .collect();
        let config = WorldConfig {
            block_edge: 8,
            max_lod: 2,
            max_buffered_remote: 2,
            ..WorldConfig::default()
        };
        let mut w = World::new(config, Arc::new(FlatPlane::default()), peer(1)).unwrap();
        w.receive_remote(records[1].clone()).unwrap();
        w.receive_remote(records[2].clone()).unwrap();
        assert!(matches!(
            w.receive_remote(records[3].clone()),
            Err(WorldError::OutOfOrder(_))
        ));
    }

    #[test]
    fn any_delivery_order_converges() {
        let peers = [peer(1), peer(2), peer(3)];
        let mut worlds: Vec<World> = peers.iter().map(|p| flat_world(*p)).collect();
        let mut all = Vec::new();
        let mut state = 99u64;
        for round in 0..12 {
            let i = round % 3;
            state = splitmix64(state);
            let p = IVec3::new((state % 6) as i32, ((state >> 8) % 3) as i32, -1);
            let v = Voxel(((state >> 16) % 9) as u8);
            all.push((i, worlds[i].record(VoxelEdit::set(p, v)).unwrap()));
        }
        for (target, world) in worlds.iter_mut().enumerate() {
            let mut incoming: Vec<EditRecord> = all
                .iter()
                .filter(|(from, _)| *from != target)
                .map(|(_, r)| r.clone())
                .collect();
            // Fisher-Yates with a per-target seed.
            let mut s = 1000 + target as u64;
            for k in (1..incoming.len()).rev() {
                s = splitmix64(s);
                incoming.swap(k, (s % (k as u64 + 1)) as usize);
            }
            for r in incoming {
                world.receive_remote(r).unwrap();
            }
            assert_eq!(world.edit_log().buffered_count(), 0);
        }
        let h = worlds[0].state_hash();
        assert!(worlds.iter().all(|w| w.state_hash() == h));
    }

    #[test]
    fn eviction_denied_until_acknowledged_and_compacted() {
        let (local, remote) = (peer(1), peer(2));
        let config = WorldConfig {
            block_edge: 8,
            max_lod: 2,
            required_peers: vec![remote],
            ..WorldConfig::default()
        };
        let mut w = World::new(config, Arc::new(FlatPlane::default()), local)
            .unwrap()
            .with_archive(Box::new(MemoryArchive::new()));
        let p = IVec3::new(1, 1, -1);
        w.record(VoxelEdit::set(p, Voxel(6))).unwrap();
        let root = BlockKey::new(2, IVec3::new(0, 0, -1));
        let nodes = w.octree().node_count();

        let err = w.evict(root).unwrap_err();
        assert!(matches!(err, WorldError::EvictionDenied(_)));
        assert_eq!(w.octree().node_count(), nodes);

        // Persisted but unacknowledged: still denied.
        let key = BlockKey::containing(p, 0, 8);
        assert_eq!(w.compact(key).unwrap(), 0);
        assert!(w.evict(root).is_err());

        w.acknowledge(remote, local, 1);
        assert_eq!(w.compact(key).unwrap(), 1);
        assert!(w.edit_log().is_empty());
        assert!(w.evict(root).unwrap() > 0);
        assert!(w.edited_blocks().is_empty());
        assert_eq!(w.edited_keys().unwrap(), BTreeSet::from([key]));

        // The edit survives the round trip through the archive.
        let block = w.block_or_create(key).unwrap();
        assert!(!block.has_unpersisted_edits());
        assert_eq!(block.get(IVec3::new(1, 1, 7)), Voxel(6));
        assert_eq!(w.voxel(p), Voxel(6));
    }

    #[test]
    fn without_archive_edits_pin_the_block() {
        let mut w = flat_world(peer(1));
        let p = IVec3::new(0, 0, -1);
        w.record(VoxelEdit::set(p, Voxel::AIR)).unwrap();
        let key = BlockKey::containing(p, 0, 8);
        assert_eq!(w.compact(key).unwrap(), 1);
        assert!(w.edit_log().is_empty());
        assert!(matches!(
            w.evict(BlockKey::new(2, IVec3::new(0, 0, -1))),
            Err(WorldError::EvictionDenied(_))
        ));
    }

    #[test]
    fn corrupt_archive_record_is_reported() {
        let mut archive = MemoryArchive::new();
        let key = BlockKey::new(0, IVec3::ZERO);
        archive.insert_raw(key, vec![0u8; 40]);
        let mut w = flat_world(peer(1)).with_archive(Box::new(archive));
        w.ensure_node(key);
        assert!(matches!(w.load_persisted(key), Err(WorldError::Corrupt(_))));
        assert!(!w.block(key).unwrap().is_generated());
    }

    #[test]
    fn install_generated_discards_stale_results() {
        let mut w = flat_world(peer(1));
        let key = BlockKey::new(0, IVec3::ZERO);
        w.ensure_node(key);
        let samples = w.generator().samples_for(key, 8);
        assert!(w.install_generated(key, samples.clone()).unwrap());
        assert!(!w.install_generated(key, samples.clone()).unwrap());
        assert!(!w.install_generated(BlockKey::new(0, IVec3::new(90, 0, 0)), samples).unwrap());
    }

    #[test]
    fn snapshot_merge_keeps_newer_local_writes() {
        let (pa, pb) = (peer(1), peer(2));
        let mut a = flat_world(pa);
        let mut b = flat_world(pb);
        a.record(VoxelEdit::set(IVec3::new(0, 0, 0), Voxel(3))).unwrap();
        let block = a.block(BlockKey::new(0, IVec3::ZERO)).unwrap().clone();

        // B writes a different voxel of the same block, then takes the snapshot.
        b.record(VoxelEdit::set(IVec3::new(1, 0, 0), Voxel(4))).unwrap();
        b.install_snapshot(block).unwrap();
        b.merge_remote_progress(&a.edit_log().delivered_vector(), a.edit_log().clock().now())
            .unwrap();
        assert_eq!(b.voxel(IVec3::new(0, 0, 0)), Voxel(3));
        assert_eq!(b.voxel(IVec3::new(1, 0, 0)), Voxel(4));
        assert_eq!(b.edit_log().delivered(pa), 1);
    }

    #[test]
    fn borders_see_resident_edits() {
        let mut w = flat_world(peer(1));
        let key = BlockKey::new(0, IVec3::new(0, 0, -1));
        let before = w.neighbor_borders(key);
        assert!(before.is_solid(Face::PosX, 0, 0));
        // Carve the neighbour cell across the +X face at (y=0, z=-8).
        w.record(VoxelEdit::set(IVec3::new(8, 0, -8), Voxel::AIR)).unwrap();
        let after = w.neighbor_borders(key);
        assert!(!after.is_solid(Face::PosX, 0, 0));
        assert!(after.is_solid(Face::PosX, 1, 0));
    }

    #[test]
    fn coarsen_after_compaction_keeps_edits_averaged() {
        let mut w = flat_world(peer(1)).with_archive(Box::new(MemoryArchive::new()));
        let parent = BlockKey::new(1, IVec3::new(0, 0, -1));
        let children = parent.children().unwrap();
        for child in children {
            w.block_or_create(child).unwrap();
        }
        w.record(VoxelEdit::set(IVec3::new(0, 0, -1), Voxel::AIR)).unwrap();
        assert!(matches!(w.coarsen(parent), Err(WorldError::CoarsenDenied(_))));
        w.compact_all().unwrap();
        w.coarsen(parent).unwrap();
        let block = w.block(parent).unwrap();
        assert!(block.is_generated());
        assert_eq!(block.lod(), 1);
        w.octree().check_invariants().unwrap();
    }
}
