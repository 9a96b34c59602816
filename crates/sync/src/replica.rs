use std::collections::BTreeMap;

use glam::IVec3;
use voxelcore_common::{BlockKey, PeerId, VoxelRegion};
use voxelcore_kernel::edit::blocks_touching;
use voxelcore_kernel::{RemoteOutcome, World, WorldError};

use crate::wire::{
    Ack, Frame, Hello, PROTOCOL_VERSION, Snapshot, SnapshotHeader, SnapshotRequest, WireError,
    decode_frames,
};

/// Most blocks a single region snapshot may carry.
pub const MAX_REGION_SNAPSHOT_BLOCKS: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    World(#[from] WorldError),
    #[error("peer {peer} is incompatible: {reason}")]
    Incompatible { peer: PeerId, reason: String },
    #[error("snapshot region {region:?} spans {blocks} blocks, limit {MAX_REGION_SNAPSHOT_BLOCKS}")]
    RegionTooLarge { region: VoxelRegion, blocks: usize },
}

/// Replication state for one remote peer.
#[derive(Debug, Clone, Default)]
pub struct PeerLink {
    /// Highest local seq handed to this peer.
    pub sent: u64,
    /// Highest local seq this peer acknowledged.
    pub acked: u64,
    /// A full snapshot has been requested from this peer and not yet
    /// received.
    pub resyncing: bool,
}

/// Per-peer replication on top of a [`World`].
///
/// The replica never owns the world; every call borrows it from the
/// single writer.
#[derive(Debug)]
pub struct Replica {
    local: PeerId,
    links: BTreeMap<PeerId, PeerLink>,
}

impl Replica {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            links: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    pub fn link(&self, peer: PeerId) -> Option<&PeerLink> {
        self.links.get(&peer)
    }

    pub fn peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.links.keys().copied()
    }

    /// Start replicating to `peer`. Returns the opening frame for it.
    pub fn connect(&mut self, world: &World, peer: PeerId) -> Frame {
        self.links.entry(peer).or_default();
        Frame::Hello(hello(world))
    }

    /// Local records each peer has not been sent yet, in seq order.
    pub fn outbound(&mut self, world: &World) -> Vec<(PeerId, Frame)> {
        let mut out = Vec::new();
        for (peer, link) in &mut self.links {
            for record in world.edit_log().local_since(link.sent) {
                link.sent = link.sent.max(record.seq);
                out.push((*peer, Frame::Edit(record)));
            }
        }
        out
    }

    /// Apply one frame from `from`. Returns the frames to send back to it.
    pub fn ingest(
        &mut self,
        world: &mut World,
        from: PeerId,
        frame: Frame,
    ) -> Result<Vec<Frame>, SyncError> {
        tracing::trace!(peer = %from, frame = frame.name(), "frame received");
        let mut replies = Vec::new();
        match frame {
            Frame::Hello(remote) => {
                check_compatible(world, &remote)?;
                let fresh = !self.links.contains_key(&from);
                let link = self.links.entry(from).or_default();
                // The peer already holds what it reports delivered from us.
                let delivered = remote.delivered.get(&self.local).copied().unwrap_or(0);
                link.sent = link.sent.max(delivered);
                let sent = link.sent;
                if fresh {
                    replies.push(Frame::Hello(hello(world)));
                }
                if !history_covers(world, sent) {
                    tracing::info!(peer = %from, sent, "log compacted past peer, sending snapshot");
                    let head = world.edit_log().delivered(self.local);
                    replies.push(self.snapshot_for(world, from, None)?);
                    self.links.entry(from).or_default().sent = head;
                }
            }
            Frame::Edit(record) => {
                self.links.entry(from).or_default();
                let origin = record.origin;
                match world.receive_remote(record) {
                    Ok(RemoteOutcome::Buffered) => {}
                    Ok(_) => replies.push(Frame::Ack(Ack {
                        acker: self.local,
                        origin,
                        seq: world.edit_log().delivered(origin),
                    })),
                    Err(WorldError::OutOfOrder(err)) => {
                        let link = self.links.entry(from).or_default();
                        if !link.resyncing {
                            tracing::warn!(peer = %from, %err, "replica desynced, requesting full snapshot");
                            link.resyncing = true;
                            replies.push(Frame::SnapshotRequest(SnapshotRequest {
                                requester: self.local,
                                region: None,
                            }));
                        }
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Frame::Ack(ack) => {
                world.acknowledge(ack.acker, ack.origin, ack.seq);
                if ack.origin == self.local {
                    let link = self.links.entry(from).or_default();
                    link.acked = link.acked.max(ack.seq);
                }
            }
            Frame::SnapshotRequest(request) => {
                replies.push(self.snapshot_for(world, from, request.region)?);
            }
            Frame::Snapshot(snapshot) => {
                let full = snapshot.header.is_full();
                let blocks = snapshot.blocks.len();
                for block in snapshot.blocks {
                    world.install_snapshot(block)?;
                }
                let drained =
                    world.merge_remote_progress(&snapshot.header.delivered, snapshot.header.clock)?;
                tracing::info!(peer = %from, blocks, full, drained, "snapshot installed");
                if full {
                    self.links.entry(from).or_default().resyncing = false;
                    for (origin, seq) in world.edit_log().delivered_vector() {
                        if origin != self.local {
                            replies.push(Frame::Ack(Ack {
                                acker: self.local,
                                origin,
                                seq,
                            }));
                        }
                    }
                }
            }
        }
        Ok(replies)
    }

    /// Decode a byte stream from `from` and ingest every complete frame.
    /// Returns the replies and the number of bytes consumed.
    pub fn ingest_bytes(
        &mut self,
        world: &mut World,
        from: PeerId,
        data: &[u8],
    ) -> Result<(Vec<Frame>, usize), SyncError> {
        let (frames, used) = decode_frames(data)?;
        let mut replies = Vec::new();
        for frame in frames {
            replies.extend(self.ingest(world, from, frame)?);
        }
        Ok((replies, used))
    }

    /// Snapshot for `peer`.
    ///
    /// With `region == None` this is a full snapshot: every edited block,
    /// resident or archived, plus the local delivery vector, which is enough
    /// to replace any records the peer is missing. A region snapshot carries
    /// the blocks overlapping `region` and no delivery progress.
    pub fn snapshot_for(
        &self,
        world: &mut World,
        peer: PeerId,
        region: Option<VoxelRegion>,
    ) -> Result<Frame, SyncError> {
        let keys: Vec<BlockKey> = match region {
            Some(region) => {
                if !world.config().bounds().contains_region(&region) {
                    return Err(WorldError::OutOfBounds(region).into());
                }
                let blocks = block_span(&region, world.edge());
                if blocks > MAX_REGION_SNAPSHOT_BLOCKS {
                    return Err(SyncError::RegionTooLarge { region, blocks });
                }
                blocks_touching(&region, world.edge())
            }
            None => world.edited_keys()?.into_iter().collect(),
        };
        let mut blocks = Vec::with_capacity(keys.len());
        for key in keys {
            blocks.push(world.block_or_create(key)?.clone());
        }
        let delivered = match region {
            Some(_) => BTreeMap::new(),
            None => world.edit_log().delivered_vector(),
        };
        tracing::debug!(%peer, blocks = blocks.len(), full = region.is_none(), "snapshot served");
        Ok(Frame::Snapshot(Snapshot {
            header: SnapshotHeader {
                sender: self.local,
                region,
                clock: world.edit_log().clock().now(),
                delivered,
                blocks: blocks.len() as u32,
            },
            blocks,
        }))
    }
}

/// Whether every local record after `sent` is still in the log.
fn history_covers(world: &World, sent: u64) -> bool {
    let log = world.edit_log();
    if sent >= log.delivered(log.local_peer()) {
        return true;
    }
    log.local_since(sent).first().is_some_and(|r| r.seq == sent + 1)
}

/// LOD 0 blocks overlapped by a region inside the world bounds.
fn block_span(region: &VoxelRegion, edge: u32) -> usize {
    if region.is_empty() {
        return 0;
    }
    let lo = BlockKey::containing(region.min, 0, edge).coord();
    let hi = BlockKey::containing(region.max - IVec3::ONE, 0, edge).coord();
    let n = hi - lo + IVec3::ONE;
    n.x as usize * n.y as usize * n.z as usize
}

fn hello(world: &World) -> Hello {
    Hello {
        peer: world.local_peer(),
        protocol: PROTOCOL_VERSION,
        seed: world.config().seed,
        block_edge: world.edge(),
        world_radius: world.config().world_size.radius_blocks(),
        delivered: world.edit_log().delivered_vector(),
    }
}

fn check_compatible(world: &World, remote: &Hello) -> Result<(), SyncError> {
    let radius = world.config().world_size.radius_blocks();
    let reason = if remote.protocol != PROTOCOL_VERSION {
        format!("protocol v{}, expected v{PROTOCOL_VERSION}", remote.protocol)
    } else if remote.block_edge != world.edge() {
        format!("block edge {}, expected {}", remote.block_edge, world.edge())
    } else if remote.seed != world.config().seed {
        format!("seed {}, expected {}", remote.seed, world.config().seed)
    } else if remote.world_radius != radius {
        format!("world radius {}, expected {radius}", remote.world_radius)
    } else {
        return Ok(());
    };
    Err(SyncError::Incompatible {
        peer: remote.peer,
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use voxelcore_common::Voxel;
    use voxelcore_kernel::{EditRecord, FlatPlane, VoxelEdit, WorldConfig, WorldSize};

    fn peer(n: u8) -> PeerId {
        PeerId::from_bytes([n; 16])
    }

    fn config(max_buffered_remote: usize, required: &[PeerId]) -> WorldConfig {
        WorldConfig {
            block_edge: 8,
            max_lod: 2,
            seed: 5,
            max_buffered_remote,
            required_peers: required.to_vec(),
            world_size: WorldSize::Large,
        }
    }

    fn node(id: PeerId, config: WorldConfig) -> (World, Replica) {
        let world = World::new(config, Arc::new(FlatPlane::default()), id).unwrap();
        (world, Replica::new(id))
    }

    /// Deliver frames over the wire until both sides are quiet.
    fn pump(a: (&mut World, &mut Replica), b: (&mut World, &mut Replica), mut to_b: Vec<Frame>) {
        let (wa, ra) = a;
        let (wb, rb) = b;
        let mut to_a = Vec::new();
        for _ in 0..16 {
            to_b.extend(ra.outbound(wa).into_iter().map(|(_, f)| f));
            for frame in to_b.drain(..) {
                let bytes = frame.encode().unwrap();
                let (replies, used) = rb.ingest_bytes(wb, ra.local(), &bytes).unwrap();
                assert_eq!(used, bytes.len());
                to_a.extend(replies);
            }
            to_a.extend(rb.outbound(wb).into_iter().map(|(_, f)| f));
            for frame in to_a.drain(..) {
                to_b.extend(ra.ingest(wa, rb.local(), frame).unwrap());
            }
            if to_b.is_empty() {
                return;
            }
        }
        panic!("replicas did not settle");
    }

    /// Hand `frames` to `rb` except the ones whose seq is in `lost`, then
    /// answer every reply through `ra`. Returns what `ra` sent back.
    fn deliver_with_loss(
        (wa, ra): (&mut World, &mut Replica),
        (wb, rb): (&mut World, &mut Replica),
        frames: Vec<Frame>,
        lost: &[u64],
    ) -> Vec<Frame> {
        let mut replies = Vec::new();
        for frame in frames {
            if matches!(&frame, Frame::Edit(r) if lost.contains(&r.seq)) {
                continue;
            }
            replies.extend(rb.ingest(wb, ra.local(), frame).unwrap());
        }
        let mut back = Vec::new();
        for reply in replies {
            back.extend(ra.ingest(wa, rb.local(), reply).unwrap());
        }
        back
    }

    fn lost_record(world: &World, seq: u64) -> EditRecord {
        world
            .edit_log()
            .records()
            .find(|r| r.seq == seq)
            .cloned()
            .unwrap()
    }

    #[test]
    fn concurrent_edits_converge() {
        let (pa, pb) = (peer(1), peer(2));
        let (mut wa, mut ra) = node(pa, config(16, &[pb]));
        let (mut wb, mut rb) = node(pb, config(16, &[pa]));
        let hello = ra.connect(&wa, pb);
        rb.connect(&wb, pa);

        let p = IVec3::new(3, 3, 1);
        wa.record(VoxelEdit::set(p, Voxel(2))).unwrap();
        wb.record(VoxelEdit::set(p, Voxel(3))).unwrap();
        wb.record(VoxelEdit::set(IVec3::new(9, 0, 0), Voxel(4)))
            .unwrap();

        pump((&mut wa, &mut ra), (&mut wb, &mut rb), vec![hello]);

        assert_eq!(wa.state_hash(), wb.state_hash());
        // Equal timestamps: the higher peer id wins.
        assert_eq!(wa.voxel(p), Voxel(3));
        assert_eq!(wa.voxel(IVec3::new(9, 0, 0)), Voxel(4));
        assert_eq!(ra.link(pb).unwrap().acked, 1);
        assert_eq!(rb.link(pa).unwrap().acked, 2);
    }

    #[test]
    fn acknowledged_records_compact() {
        let (pa, pb) = (peer(1), peer(2));
        let (mut wa, mut ra) = node(pa, config(16, &[pb]));
        let (mut wb, mut rb) = node(pb, config(16, &[pa]));
        let hello = ra.connect(&wa, pb);

        wa.record(VoxelEdit::set(IVec3::new(1, 1, 1), Voxel(6)))
            .unwrap();
        wa.compact_all().unwrap();
        assert_eq!(wa.edit_log().len(), 1);

        pump((&mut wa, &mut ra), (&mut wb, &mut rb), vec![hello]);
        wa.compact_all().unwrap();
        assert!(wa.edit_log().is_empty());
        assert_eq!(wb.voxel(IVec3::new(1, 1, 1)), Voxel(6));
    }

    #[test]
    fn hello_skips_records_the_peer_already_has() {
        let (pa, pb) = (peer(1), peer(2));
        let (mut wa, mut ra) = node(pa, config(16, &[]));
        let (mut wb, mut rb) = node(pb, config(16, &[]));
        let record = wa
            .record(VoxelEdit::set(IVec3::new(0, 0, 0), Voxel(2)))
            .unwrap();
        wb.receive_remote(record).unwrap();

        rb.ingest(&mut wb, pa, ra.connect(&wa, pb)).unwrap();
        let reply = rb.connect(&wb, pa);
        assert!(ra.ingest(&mut wa, pb, reply).unwrap().is_empty());
        assert!(ra.outbound(&wa).is_empty());
    }

    #[test]
    fn incompatible_peer_is_refused() {
        let (pa, pb) = (peer(1), peer(2));
        let (wa, mut ra) = node(pa, config(16, &[]));
        let mut other = config(16, &[]);
        other.seed = 6;
        let (mut wb, mut rb) = node(pb, other);
        let hello = ra.connect(&wa, pb);
        assert!(matches!(
            rb.ingest(&mut wb, pa, hello),
            Err(SyncError::Incompatible { .. })
        ));

        let mut smaller = config(16, &[]);
        smaller.world_size = WorldSize::Small;
        let (mut wc, mut rc) = node(peer(3), smaller);
        let hello = ra.connect(&wa, peer(3));
        let Err(SyncError::Incompatible { reason, .. }) = rc.ingest(&mut wc, pa, hello) else {
            panic!("expected a refusal");
        };
        assert!(reason.contains("world radius"));
    }

    #[test]
    fn overflow_turns_into_full_snapshot_resync() {
        let (pa, pb) = (peer(1), peer(2));
        let (mut wa, mut ra) = node(pa, config(16, &[]));
        let (mut wb, mut rb) = node(pb, config(2, &[]));
        ra.connect(&wa, pb);

        let region = VoxelRegion::new(IVec3::new(0, 0, 0), IVec3::new(4, 4, 1));
        for i in 0..5u8 {
            wa.record(VoxelEdit::fill(region, Voxel(i + 1))).unwrap();
        }
        let frames: Vec<Frame> = ra.outbound(&wa).into_iter().map(|(_, f)| f).collect();
        assert_eq!(frames.len(), 5);

        // Record 1 is lost in transit.
        let mut replies = Vec::new();
        for frame in frames.into_iter().skip(1) {
            replies.extend(rb.ingest(&mut wb, pa, frame).unwrap());
        }
        assert_eq!(wb.edit_log().buffered_count(), 2);
        assert_eq!(replies.len(), 1);
        let Frame::SnapshotRequest(request) = &replies[0] else {
            panic!("expected snapshot request, got {}", replies[0].name());
        };
        assert_eq!(request.region, None);
        assert!(rb.link(pa).unwrap().resyncing);

        let mut back = Vec::new();
        for reply in replies {
            back.extend(ra.ingest(&mut wa, pb, reply).unwrap());
        }
        assert_eq!(back.len(), 1);
        for frame in back {
            rb.ingest(&mut wb, pa, frame).unwrap();
        }
        assert!(!rb.link(pa).unwrap().resyncing);
        assert_eq!(wb.edit_log().delivered(pa), 5);
        assert_eq!(wb.edit_log().buffered_count(), 0);
        assert_eq!(wb.voxel(IVec3::new(2, 2, 0)), Voxel(5));
        assert_eq!(wa.state_hash(), wb.state_hash());
    }

    #[test]
    fn resync_covers_lost_records_in_other_blocks() {
        let (pa, pb) = (peer(1), peer(2));
        let (mut wa, mut ra) = node(pa, config(16, &[]));
        let (mut wb, mut rb) = node(pb, config(2, &[]));
        ra.connect(&wa, pb);

        let far = IVec3::new(100, 0, 0);
        let near = IVec3::new(1, 1, 1);
        wa.record(VoxelEdit::set(far, Voxel(7))).unwrap();
        for i in 0..4u8 {
            wa.record(VoxelEdit::set(near, Voxel(i + 1))).unwrap();
        }
        let frames: Vec<Frame> = ra.outbound(&wa).into_iter().map(|(_, f)| f).collect();
        let back = deliver_with_loss((&mut wa, &mut ra), (&mut wb, &mut rb), frames, &[1]);
        for frame in back {
            rb.ingest(&mut wb, pa, frame).unwrap();
        }
        assert_eq!(wb.voxel(far), Voxel(7));
        assert_eq!(wb.voxel(near), Voxel(4));
        assert_eq!(wb.edit_log().delivered(pa), 5);
        assert_eq!(wa.state_hash(), wb.state_hash());

        // A late retransmission of the lost record is already covered.
        let retransmit = lost_record(&wa, 1);
        assert_eq!(wb.receive_remote(retransmit).unwrap(), RemoteOutcome::Duplicate);
        assert_eq!(wa.state_hash(), wb.state_hash());

        // A second desync over the same blocks is served again.
        wa.record(VoxelEdit::set(far, Voxel(8))).unwrap();
        for i in 0..4u8 {
            wa.record(VoxelEdit::set(near, Voxel(i + 10))).unwrap();
        }
        let frames: Vec<Frame> = ra.outbound(&wa).into_iter().map(|(_, f)| f).collect();
        let back = deliver_with_loss((&mut wa, &mut ra), (&mut wb, &mut rb), frames, &[6]);
        let Some(Frame::Snapshot(snapshot)) = back.first() else {
            panic!("expected a snapshot");
        };
        assert_eq!(snapshot.blocks.len(), 2);
        for frame in back {
            rb.ingest(&mut wb, pa, frame).unwrap();
        }
        assert_eq!(wb.voxel(far), Voxel(8));
        assert_eq!(wb.edit_log().delivered(pa), 10);
        assert_eq!(wa.state_hash(), wb.state_hash());
    }

    #[test]
    fn late_joiner_gets_snapshot_of_compacted_history() {
        let (pa, pc) = (peer(1), peer(3));
        let (mut wa, mut ra) = node(pa, config(16, &[]));
        wa.record(VoxelEdit::set(IVec3::new(4, 4, 0), Voxel(9)))
            .unwrap();
        wa.record(VoxelEdit::set(IVec3::new(20, 4, 0), Voxel(9)))
            .unwrap();
        wa.compact_all().unwrap();
        assert!(wa.edit_log().is_empty());

        let (mut wc, mut rc) = node(pc, config(16, &[]));
        let hello = rc.connect(&wc, pa);
        let replies = ra.ingest(&mut wa, pc, hello).unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(ra.link(pc).unwrap().sent, 2);
        for frame in replies {
            rc.ingest(&mut wc, pa, frame).unwrap();
        }
        assert_eq!(wc.voxel(IVec3::new(20, 4, 0)), Voxel(9));
        assert_eq!(wc.edit_log().delivered(pa), 2);
        assert_eq!(wc.state_hash(), wa.state_hash());
        assert!(ra.outbound(&wa).is_empty());
    }

    #[test]
    fn region_snapshot_carries_no_progress() {
        let (pa, pb) = (peer(1), peer(2));
        let (mut wa, ra) = node(pa, config(16, &[]));
        wa.record(VoxelEdit::set(IVec3::new(4, 4, 0), Voxel(9)))
            .unwrap();
        let region = VoxelRegion::new(IVec3::new(0, 0, 0), IVec3::new(16, 8, 8));

        for _ in 0..2 {
            let Frame::Snapshot(snapshot) = ra.snapshot_for(&mut wa, pb, Some(region)).unwrap()
            else {
                panic!("expected snapshot");
            };
            assert_eq!(snapshot.blocks.len(), 2);
            assert!(snapshot.header.delivered.is_empty());
        }

        let (mut wb, mut rb) = node(pb, config(16, &[]));
        let frame = ra.snapshot_for(&mut wa, pb, Some(region)).unwrap();
        assert!(rb.ingest(&mut wb, pa, frame).unwrap().is_empty());
        assert_eq!(wb.voxel(IVec3::new(4, 4, 0)), Voxel(9));
        assert_eq!(wb.edit_log().delivered(pa), 0);
    }

    #[test]
    fn oversized_region_requests_are_refused() {
        let (pa, pb) = (peer(1), peer(2));
        let (mut wa, ra) = node(pa, config(16, &[]));
        let wide = VoxelRegion::new(IVec3::new(-2048, -2048, 0), IVec3::new(2048, 2048, 8));
        assert!(matches!(
            ra.snapshot_for(&mut wa, pb, Some(wide)),
            Err(SyncError::RegionTooLarge { blocks: 262_144, .. })
        ));
        let outside = VoxelRegion::new(IVec3::new(i32::MIN, 0, 0), IVec3::new(i32::MAX, 1, 1));
        assert!(matches!(
            ra.snapshot_for(&mut wa, pb, Some(outside)),
            Err(SyncError::World(WorldError::OutOfBounds(_)))
        ));
    }
}
