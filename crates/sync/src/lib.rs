//! Replication of voxel edits between peers.
//!
//! `wire` frames edit records, acks and snapshots; [`Replica`] drives the
//! per-peer links on top of a [`voxelcore_kernel::World`]; [`Editor`] adds
//! undo/redo on the same log.
//!
//! # Invariants
//! - Local records reach each peer in sequence order, at most once per link.
//! - A desynced link requests a full snapshot instead of failing.
//! - Only a full snapshot, which carries every edited block, advances a
//!   peer's delivery marks.
//! - Undo and redo append new records; history is never rewritten.

pub mod editor;
pub mod replica;
pub mod wire;

pub use editor::Editor;
pub use replica::{MAX_REGION_SNAPSHOT_BLOCKS, PeerLink, Replica, SyncError};
pub use wire::{
    Ack, Frame, Hello, PROTOCOL_VERSION, Snapshot, SnapshotHeader, SnapshotRequest, WireError,
    decode_frames, encode_frames,
};

pub fn crate_info() -> &'static str {
    "voxelcore-sync v0.1.0"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        assert!(crate_info().contains("sync"));
    }
}
