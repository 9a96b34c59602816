use std::collections::{BTreeMap, BTreeSet};

use glam::IVec3;
use serde::{Deserialize, Serialize};
use voxelcore_common::{BlockKey, PeerId, Voxel, VoxelRegion, WriteStamp};

use crate::error::OutOfOrderError;

/// A requested mutation: new values for every voxel of `region`, in
/// x-fastest order.
#[derive(Debug, Clone, PartialEq)]
pub struct VoxelEdit {
    pub region: VoxelRegion,
    pub values: Vec<Voxel>,
}

impl VoxelEdit {
    pub fn new(region: VoxelRegion, values: Vec<Voxel>) -> Self {
        Self { region, values }
    }

    /// Set a single voxel.
    pub fn set(p: IVec3, value: Voxel) -> Self {
        Self::new(VoxelRegion::single(p), vec![value])
    }

    /// Fill a region with one value.
    pub fn fill(region: VoxelRegion, value: Voxel) -> Self {
        Self::new(region, vec![value; region.volume()])
    }
}

/// An ordered, causally tagged delta.
///
/// Records from one origin form a sequence; `seq` depends on `seq - 1`.
/// The Lamport `timestamp` together with `origin` decides last-writer-wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRecord {
    pub origin: PeerId,
    pub seq: u64,
    pub timestamp: u64,
    pub region: VoxelRegion,
    /// Values before the edit, as seen by the origin. Used for undo.
    pub prior: Vec<Voxel>,
    pub values: Vec<Voxel>,
}

impl EditRecord {
    pub fn stamp(&self) -> WriteStamp {
        WriteStamp::new(self.timestamp, self.origin)
    }

    /// The edit that restores this record's prior values.
    pub fn inverse(&self) -> VoxelEdit {
        VoxelEdit::new(self.region, self.prior.clone())
    }

    /// `(position, value)` pairs in region order.
    pub fn writes(&self) -> impl Iterator<Item = (IVec3, Voxel)> + '_ {
        self.region.positions().zip(self.values.iter().copied())
    }
}

/// LOD 0 block keys overlapping `region`.
pub fn blocks_touching(region: &VoxelRegion, edge: u32) -> Vec<BlockKey> {
    if region.is_empty() {
        return Vec::new();
    }
    let lo = BlockKey::containing(region.min, 0, edge).coord();
    let hi = BlockKey::containing(region.max - IVec3::ONE, 0, edge).coord();
    let mut out = Vec::new();
    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                out.push(BlockKey::new(0, IVec3::new(x, y, z)));
            }
        }
    }
    out
}

/// Lamport logical clock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LamportClock {
    time: u64,
}

impl LamportClock {
    pub fn now(&self) -> u64 {
        self.time
    }

    /// Advance for a local event and return the new time.
    pub fn tick(&mut self) -> u64 {
        self.time += 1;
        self.time
    }

    /// Merge a remote timestamp.
    pub fn observe(&mut self, remote: u64) {
        self.time = self.time.max(remote);
    }
}

/// What happened to a remote record on arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOutcome {
    /// The record, and `records - 1` buffered successors, were applied.
    Applied { records: usize },
    /// Waiting for an earlier record from the same origin.
    Buffered,
    /// Already delivered.
    Duplicate,
}

/// Result of admitting a remote record into the log.
#[derive(Debug)]
pub enum Admission {
    Duplicate,
    Buffered,
    /// Records now deliverable, in causal order.
    Ready(Vec<EditRecord>),
}

#[derive(Debug, Clone)]
struct LoggedRecord {
    record: EditRecord,
    /// Blocks whose persisted state does not yet include this record.
    pending: BTreeSet<BlockKey>,
}

/// Serializable snapshot of the log, for persistence and snapshots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EditLogState {
    pub clock: LamportClock,
    pub next_seq: u64,
    pub delivered: BTreeMap<PeerId, u64>,
    pub records: Vec<EditRecord>,
}

/// Append-only record of applied edits with causal delivery bookkeeping.
///
/// The log does not touch voxel data; [`crate::World`] applies what the log
/// admits and tells it which blocks each record touched.
#[derive(Debug, Clone)]
pub struct EditLog {
    local: PeerId,
    clock: LamportClock,
    next_seq: u64,
    records: Vec<LoggedRecord>,
    delivered: BTreeMap<PeerId, u64>,
    buffered: BTreeMap<PeerId, BTreeMap<u64, EditRecord>>,
    buffered_count: usize,
    max_buffered: usize,
    required_peers: BTreeSet<PeerId>,
    /// acker -> origin -> highest contiguous seq the acker has applied.
    acks: BTreeMap<PeerId, BTreeMap<PeerId, u64>>,
}

impl EditLog {
    pub fn new(local: PeerId, max_buffered: usize, required_peers: &[PeerId]) -> Self {
        Self {
            local,
            clock: LamportClock::default(),
            next_seq: 0,
            records: Vec::new(),
            delivered: BTreeMap::new(),
            buffered: BTreeMap::new(),
            buffered_count: 0,
            max_buffered,
            required_peers: required_peers.iter().copied().filter(|p| *p != local).collect(),
            acks: BTreeMap::new(),
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }

    pub fn clock(&self) -> LamportClock {
        self.clock
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered_count
    }

    pub fn records(&self) -> impl Iterator<Item = &EditRecord> + '_ {
        self.records.iter().map(|r| &r.record)
    }

    /// Highest sequence delivered from `origin`; for the local peer, the
    /// last sequence issued.
    pub fn delivered(&self, origin: PeerId) -> u64 {
        if origin == self.local {
            self.next_seq
        } else {
            self.delivered.get(&origin).copied().unwrap_or(0)
        }
    }

    /// Delivery vector including the local peer.
    pub fn delivered_vector(&self) -> BTreeMap<PeerId, u64> {
        let mut v = self.delivered.clone();
        v.insert(self.local, self.next_seq);
        v
    }

    pub fn add_required_peer(&mut self, peer: PeerId) {
        if peer != self.local {
            self.required_peers.insert(peer);
        }
    }

    pub fn required_peers(&self) -> impl Iterator<Item = PeerId> + '_ {
        self.required_peers.iter().copied()
    }

    /// Reserve `(seq, timestamp)` for a new local record.
    pub fn next_local_stamp(&mut self) -> (u64, u64) {
        self.next_seq += 1;
        (self.next_seq, self.clock.tick())
    }

    /// Append an applied record together with the blocks it touched.
    pub fn append(&mut self, record: EditRecord, touched: Vec<BlockKey>) {
        self.records.push(LoggedRecord {
            record,
            pending: touched.into_iter().collect(),
        });
    }

    /// Decide whether a remote record can be delivered now.
    pub fn admit_remote(&mut self, record: EditRecord) -> Result<Admission, OutOfOrderError> {
        let origin = record.origin;
        let expected = self.delivered(origin) + 1;
        if origin == self.local || record.seq < expected {
            return Ok(Admission::Duplicate);
        }
        if record.seq > expected {
            let queue = self.buffered.entry(origin).or_default();
            if queue.contains_key(&record.seq) {
                return Ok(Admission::Buffered);
            }
            if self.buffered_count >= self.max_buffered {
                return Err(OutOfOrderError {
                    origin,
                    expected,
                    received: record.seq,
                    buffered: self.buffered_count,
                });
            }
            queue.insert(record.seq, record);
            self.buffered_count += 1;
            tracing::trace!(%origin, expected, "remote edit buffered");
            return Ok(Admission::Buffered);
        }

        let mut ready = vec![record];
        self.mark_delivered(origin, expected);
        ready.extend(self.drain_buffered(origin));
        Ok(Admission::Ready(ready))
    }

    fn mark_delivered(&mut self, origin: PeerId, seq: u64) {
        self.delivered.insert(origin, seq);
    }

    /// Pop buffered successors of `origin` that are now contiguous.
    fn drain_buffered(&mut self, origin: PeerId) -> Vec<EditRecord> {
        let mut out = Vec::new();
        let Some(queue) = self.buffered.get_mut(&origin) else {
            return out;
        };
        let mut next = self.delivered.get(&origin).copied().unwrap_or(0) + 1;
        // Anything at or below the delivered mark is stale.
        let stale: Vec<u64> = queue.range(..next).map(|(s, _)| *s).collect();
        for s in stale {
            queue.remove(&s);
            self.buffered_count -= 1;
        }
        while let Some(record) = queue.remove(&next) {
            self.buffered_count -= 1;
            out.push(record);
            next += 1;
        }
        if queue.is_empty() {
            self.buffered.remove(&origin);
        }
        if let Some(last) = out.last() {
            self.delivered.insert(origin, last.seq);
        }
        out
    }

    /// Merge a remote timestamp into the clock.
    pub fn observe(&mut self, timestamp: u64) {
        self.clock.observe(timestamp);
    }

    /// Raise delivery marks from a snapshot's vector and return buffered
    /// records that became deliverable.
    pub fn merge_delivered(&mut self, vector: &BTreeMap<PeerId, u64>) -> Vec<EditRecord> {
        let mut ready = Vec::new();
        for (origin, seq) in vector {
            if *origin == self.local {
                continue;
            }
            let current = self.delivered.entry(*origin).or_insert(0);
            if *seq > *current {
                *current = *seq;
            }
            ready.extend(self.drain_buffered(*origin));
        }
        ready
    }

    /// Record that `acker` has applied every record of `origin` up to `seq`.
    pub fn acknowledge(&mut self, acker: PeerId, origin: PeerId, seq: u64) {
        let entry = self.acks.entry(acker).or_default().entry(origin).or_insert(0);
        *entry = (*entry).max(seq);
    }

    /// Whether every required peer other than the origin has the record.
    pub fn is_acknowledged(&self, record: &EditRecord) -> bool {
        self.required_peers
            .iter()
            .filter(|p| **p != record.origin)
            .all(|p| {
                self.acks
                    .get(p)
                    .and_then(|m| m.get(&record.origin))
                    .is_some_and(|s| *s >= record.seq)
            })
    }

    /// Whether any record still waits to be folded into `key`.
    pub fn has_pending(&self, key: BlockKey) -> bool {
        self.records.iter().any(|r| r.pending.contains(&key))
    }

    /// First LOD 0 block inside `region` with a pending record.
    pub fn first_pending_in(&self, region: &VoxelRegion, edge: u32) -> Option<BlockKey> {
        self.records
            .iter()
            .flat_map(|r| r.pending.iter())
            .find(|k| region.intersects(&k.region(edge)))
            .copied()
    }

    /// Keys that still have pending records.
    pub fn pending_keys(&self) -> BTreeSet<BlockKey> {
        self.records
            .iter()
            .flat_map(|r| r.pending.iter().copied())
            .collect()
    }

    /// Fold acknowledged records into `key` and drop records that no longer
    /// pend anywhere. Returns how many records were folded for `key`.
    pub fn fold_acknowledged(&mut self, key: BlockKey) -> usize {
        let mut folded = 0;
        let acked: Vec<bool> = self
            .records
            .iter()
            .map(|r| self.is_acknowledged(&r.record))
            .collect();
        for (entry, acked) in self.records.iter_mut().zip(acked) {
            if acked && entry.pending.remove(&key) {
                folded += 1;
            }
        }
        let before = self.records.len();
        self.records.retain(|r| !r.pending.is_empty());
        let truncated = before - self.records.len();
        if folded > 0 {
            tracing::debug!(%key, folded, truncated, "edit log compacted");
        }
        folded
    }

    /// Local records with `seq > after`, still present in the log.
    pub fn local_since(&self, after: u64) -> Vec<EditRecord> {
        self.records
            .iter()
            .map(|r| &r.record)
            .filter(|r| r.origin == self.local && r.seq > after)
            .cloned()
            .collect()
    }

    pub fn export(&self) -> EditLogState {
        EditLogState {
            clock: self.clock,
            next_seq: self.next_seq,
            delivered: self.delivered.clone(),
            records: self.records().cloned().collect(),
        }
    }

    /// Restore persisted state. Restored records pend on every block they
    /// touch until compacted again.
    pub fn restore(&mut self, state: EditLogState, edge: u32) {
        self.clock = state.clock;
        self.next_seq = state.next_seq;
        self.delivered = state.delivered;
        self.delivered.remove(&self.local);
        self.records = state
            .records
            .into_iter()
            .map(|record| LoggedRecord {
                pending: blocks_touching(&record.region, edge).into_iter().collect(),
                record,
            })
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(b: u8) -> PeerId {
        PeerId::from_bytes([b; 16])
    }

    fn remote(origin: PeerId, seq: u64, ts: u64) -> EditRecord {
        EditRecord {
            origin,
            seq,
            timestamp: ts,
            region: VoxelRegion::single(IVec3::ZERO),
            prior: vec![Voxel::AIR],
            values: vec![Voxel(seq as u8)],
        }
    }

    #[test]
    fn lamport_clock_merges() {
        let mut c = LamportClock::default();
        assert_eq!(c.tick(), 1);
        c.observe(10);
        assert_eq!(c.tick(), 11);
        c.observe(3);
        assert_eq!(c.now(), 11);
    }

    #[test]
    fn in_order_records_are_ready() {
        let mut log = EditLog::new(peer(1), 8, &[]);
        let a = peer(2);
        match log.admit_remote(remote(a, 1, 1)).unwrap() {
            Admission::Ready(r) => assert_eq!(r.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(log.delivered(a), 1);
    }

    #[test]
    fn gap_is_buffered_then_drained() {
        let mut log = EditLog::new(peer(1), 8, &[]);
        let a = peer(2);
        assert!(matches!(log.admit_remote(remote(a, 3, 3)).unwrap(), Admission::Buffered));
        assert!(matches!(log.admit_remote(remote(a, 2, 2)).unwrap(), Admission::Buffered));
        assert_eq!(log.buffered_count(), 2);
        match log.admit_remote(remote(a, 1, 1)).unwrap() {
            Admission::Ready(r) => {
                let seqs: Vec<u64> = r.iter().map(|r| r.seq).collect();
                assert_eq!(seqs, vec![1, 2, 3]);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(log.buffered_count(), 0);
        assert_eq!(log.delivered(a), 3);
    }

    #[test]
    fn duplicates_ignored() {
        let mut log = EditLog::new(peer(1), 8, &[]);
        let a = peer(2);
        log.admit_remote(remote(a, 1, 1)).unwrap();
        assert!(matches!(log.admit_remote(remote(a, 1, 1)).unwrap(), Admission::Duplicate));
        assert!(matches!(log.admit_remote(remote(peer(1), 1, 1)).unwrap(), Admission::Duplicate));
    }

    #[test]
    fn buffer_bound_raises_out_of_order() {
        let mut log = EditLog::new(peer(1), 2, &[]);
        let a = peer(2);
        log.admit_remote(remote(a, 5, 5)).unwrap();
        log.admit_remote(remote(a, 6, 6)).unwrap();
        let err = log.admit_remote(remote(a, 7, 7)).unwrap_err();
        assert_eq!(err.expected, 1);
        assert_eq!(err.received, 7);
        assert_eq!(err.buffered, 2);
    }

    #[test]
    fn merge_delivered_releases_buffered() {
        let mut log = EditLog::new(peer(1), 8, &[]);
        let a = peer(2);
        log.admit_remote(remote(a, 4, 4)).unwrap();
        log.admit_remote(remote(a, 2, 2)).unwrap();
        let ready = log.merge_delivered(&BTreeMap::from([(a, 3)]));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].seq, 4);
        assert_eq!(log.buffered_count(), 0);
        assert_eq!(log.delivered(a), 4);
    }

    #[test]
    fn acknowledgement_requires_all_required_peers() {
        let local = peer(1);
        let (b, c) = (peer(2), peer(3));
        let mut log = EditLog::new(local, 8, &[b, c]);
        let (seq, ts) = log.next_local_stamp();
        let rec = EditRecord {
            origin: local,
            seq,
            timestamp: ts,
            region: VoxelRegion::single(IVec3::ZERO),
            prior: vec![Voxel::AIR],
            values: vec![Voxel(1)],
        };
        assert!(!log.is_acknowledged(&rec));
        log.acknowledge(b, local, 1);
        assert!(!log.is_acknowledged(&rec));
        log.acknowledge(c, local, 1);
        assert!(log.is_acknowledged(&rec));
    }

    #[test]
    fn fold_truncates_once_all_blocks_folded() {
        let local = peer(1);
        let mut log = EditLog::new(local, 8, &[]);
        let (seq, ts) = log.next_local_stamp();
        let region = VoxelRegion::new(IVec3::new(15, 0, 0), IVec3::new(17, 1, 1));
        let touched = blocks_touching(&region, 16);
        assert_eq!(touched.len(), 2);
        log.append(
            EditRecord {
                origin: local,
                seq,
                timestamp: ts,
                region,
                prior: vec![Voxel::AIR; 2],
                values: vec![Voxel(1); 2],
            },
            touched.clone(),
        );
        assert_eq!(log.fold_acknowledged(touched[0]), 1);
        assert_eq!(log.len(), 1);
        assert!(log.has_pending(touched[1]));
        assert_eq!(log.fold_acknowledged(touched[1]), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn export_restore_roundtrip() {
        let local = peer(1);
        let mut log = EditLog::new(local, 8, &[]);
        let (seq, ts) = log.next_local_stamp();
        log.append(remote(local, seq, ts), vec![BlockKey::default()]);
        log.admit_remote(remote(peer(2), 1, 9)).unwrap();
        let state = log.export();

        let mut restored = EditLog::new(local, 8, &[]);
        restored.restore(state.clone(), 16);
        assert_eq!(restored.export(), state);
        assert!(restored.has_pending(BlockKey::default()));
    }
}
