//! Frame codec for peer links.
//!
//! Every frame is `tag u8 | len u32 | payload`, little-endian. Metadata
//! frames carry JSON, edits and acks carry CBOR, and snapshots carry a JSON
//! header followed by binary block records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use voxelcore_common::{PeerId, VoxelRegion};
use voxelcore_kernel::codec::ByteReader;
use voxelcore_kernel::{CorruptBlockError, EditRecord, VoxelBlock, decode_block, encode_block};

/// Version announced in [`Hello`]. Peers with another version are refused.
pub const PROTOCOL_VERSION: u32 = 2;

/// Frames larger than this are rejected before their payload is read.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 5;

const TAG_HELLO: u8 = 1;
const TAG_EDIT: u8 = 2;
const TAG_ACK: u8 = 3;
const TAG_SNAPSHOT_REQUEST: u8 = 4;
const TAG_SNAPSHOT: u8 = 5;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown frame tag {0}")]
    UnknownTag(u8),
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("malformed binary payload: {0}")]
    Malformed(#[from] CorruptBlockError),
    #[error("JSON payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR encode error: {0}")]
    CborEncode(String),
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
    #[error("edit region {0:?} is too large to address")]
    RegionOverflow(VoxelRegion),
    #[error("edit carries {declared} values for a region of {volume} voxels")]
    ValueCount { declared: usize, volume: usize },
    #[error("snapshot header announces {declared} blocks, payload holds {found}")]
    BlockCount { declared: u32, found: usize },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// Opening frame of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub peer: PeerId,
    pub protocol: u32,
    pub seed: u64,
    pub block_edge: u32,
    /// LOD 0 blocks the world reaches from the origin along each axis.
    pub world_radius: i32,
    /// Highest contiguous seq the sender has applied, per origin.
    pub delivered: BTreeMap<PeerId, u64>,
}

/// `acker` has applied every record of `origin` up to `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub acker: PeerId,
    pub origin: PeerId,
    pub seq: u64,
}

/// Ask a peer for block records. `None` asks for a full snapshot: every
/// edited block plus the sender's delivery progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub requester: PeerId,
    pub region: Option<VoxelRegion>,
}

/// JSON header of a snapshot frame; `blocks` records follow it.
///
/// Only a full snapshot (`region == None`) carries `delivered`; a region
/// snapshot says nothing about records outside the region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub sender: PeerId,
    pub region: Option<VoxelRegion>,
    pub clock: u64,
    pub delivered: BTreeMap<PeerId, u64>,
    pub blocks: u32,
}

impl SnapshotHeader {
    pub fn is_full(&self) -> bool {
        self.region.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub blocks: Vec<VoxelBlock>,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Hello(Hello),
    Edit(EditRecord),
    Ack(Ack),
    SnapshotRequest(SnapshotRequest),
    Snapshot(Snapshot),
}

impl Frame {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello(_) => "hello",
            Self::Edit(_) => "edit",
            Self::Ack(_) => "ack",
            Self::SnapshotRequest(_) => "snapshot_request",
            Self::Snapshot(_) => "snapshot",
        }
    }

    fn tag(&self) -> u8 {
        match self {
            Self::Hello(_) => TAG_HELLO,
            Self::Edit(_) => TAG_EDIT,
            Self::Ack(_) => TAG_ACK,
            Self::SnapshotRequest(_) => TAG_SNAPSHOT_REQUEST,
            Self::Snapshot(_) => TAG_SNAPSHOT,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = match self {
            Self::Hello(hello) => serde_json::to_vec(hello)?,
            Self::Edit(record) => cbor_serialize(record)?,
            Self::Ack(ack) => cbor_serialize(ack)?,
            Self::SnapshotRequest(req) => serde_json::to_vec(req)?,
            Self::Snapshot(snapshot) => encode_snapshot(snapshot)?,
        };
        if payload.len() > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(payload.len()));
        }
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(self.tag());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode the frame at the start of `data`. `Ok(None)` means more bytes
    /// are needed; otherwise returns the frame and the bytes it used.
    pub fn decode(data: &[u8]) -> Result<Option<(Frame, usize)>, WireError> {
        if data.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = data[0];
        let len = u32::from_le_bytes([data[1], data[2], data[3], data[4]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireError::FrameTooLarge(len));
        }
        let Some(payload) = data.get(HEADER_LEN..HEADER_LEN + len) else {
            return Ok(None);
        };
        let frame = match tag {
            TAG_HELLO => Self::Hello(serde_json::from_slice(payload)?),
            TAG_EDIT => Self::Edit(decode_edit(payload)?),
            TAG_ACK => Self::Ack(cbor_deserialize(payload)?),
            TAG_SNAPSHOT_REQUEST => Self::SnapshotRequest(serde_json::from_slice(payload)?),
            TAG_SNAPSHOT => Self::Snapshot(decode_snapshot(payload)?),
            other => return Err(WireError::UnknownTag(other)),
        };
        Ok(Some((frame, HEADER_LEN + len)))
    }
}

/// Encode frames back to back.
pub fn encode_frames(frames: &[Frame]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::new();
    for frame in frames {
        out.extend_from_slice(&frame.encode()?);
    }
    Ok(out)
}

/// Decode every complete frame in `data`. Returns the frames and the count
/// of bytes consumed; an incomplete tail is left for the caller.
pub fn decode_frames(data: &[u8]) -> Result<(Vec<Frame>, usize), WireError> {
    let mut frames = Vec::new();
    let mut used = 0;
    while let Some((frame, n)) = Frame::decode(&data[used..])? {
        frames.push(frame);
        used += n;
    }
    Ok((frames, used))
}

fn cbor_serialize<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| WireError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// Decode one CBOR value that must span the whole payload.
fn cbor_deserialize<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, WireError> {
    let mut rest = payload;
    let value = ciborium::from_reader(&mut rest).map_err(|e| WireError::CborDecode(e.to_string()))?;
    if !rest.is_empty() {
        return Err(WireError::TrailingBytes(rest.len()));
    }
    Ok(value)
}

fn decode_edit(payload: &[u8]) -> Result<EditRecord, WireError> {
    let record: EditRecord = cbor_deserialize(payload)?;
    let volume = record
        .region
        .checked_volume()
        .ok_or(WireError::RegionOverflow(record.region))?;
    for declared in [record.values.len(), record.prior.len()] {
        if declared != volume {
            return Err(WireError::ValueCount { declared, volume });
        }
    }
    Ok(record)
}

// header_len u32 | header JSON | (record_len u32 | block record)*
fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>, WireError> {
    let header = SnapshotHeader {
        blocks: snapshot.blocks.len() as u32,
        ..snapshot.header.clone()
    };
    let json = serde_json::to_vec(&header)?;
    let mut out = Vec::new();
    out.extend_from_slice(&(json.len() as u32).to_le_bytes());
    out.extend_from_slice(&json);
    for block in &snapshot.blocks {
        let record = encode_block(block);
        out.extend_from_slice(&(record.len() as u32).to_le_bytes());
        out.extend_from_slice(&record);
    }
    Ok(out)
}

fn decode_snapshot(payload: &[u8]) -> Result<Snapshot, WireError> {
    let mut r = ByteReader::new(payload);
    let json_len = r.u32()? as usize;
    let header: SnapshotHeader = serde_json::from_slice(r.bytes(json_len)?)?;
    // The count is only trusted once the records are actually present.
    let mut blocks = Vec::new();
    while r.remaining() > 0 {
        let len = r.u32()? as usize;
        blocks.push(decode_block(r.bytes(len)?)?);
    }
    if blocks.len() != header.blocks as usize {
        return Err(WireError::BlockCount {
            declared: header.blocks,
            found: blocks.len(),
        });
    }
    Ok(Snapshot { header, blocks })
}
