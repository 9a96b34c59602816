//! Binary block records.
//!
//! ```text
//! magic "VXB1" | version u16 | encoding u8 | lod u8 | x i32 | y i32 | z i32
//! | edge u32 | revision u64 | sample_count u32 | payload_len u32 | payload
//! | override_count u32 | (index u32, timestamp u64, peer [u8; 16])*
//! | checksum u64
//! ```
//!
//! All integers are little-endian. The checksum is the first eight bytes of
//! SHA-256 over everything preceding it. The payload is either dense (one
//! byte per sample) or run-length pairs `(run u16, value u8)`; the encoder
//! picks whichever is smaller.

use std::collections::BTreeMap;

use glam::IVec3;
use sha2::{Digest, Sha256};
use voxelcore_common::{BlockKey, PeerId, Voxel, WriteStamp};

use crate::block::{MAX_BLOCK_EDGE, VoxelBlock, volume};
use crate::error::CorruptBlockError;

pub const BLOCK_MAGIC: [u8; 4] = *b"VXB1";
pub const BLOCK_RECORD_VERSION: u16 = 1;

const ENCODING_DENSE: u8 = 0;
const ENCODING_RLE: u8 = 1;

/// Serialize a generated block into a self-checking record.
pub fn encode_block(block: &VoxelBlock) -> Vec<u8> {
    let samples = block.samples();
    let rle = rle_encode(samples);
    let (encoding, payload): (u8, Vec<u8>) = if rle.len() < samples.len() {
        (ENCODING_RLE, rle)
    } else {
        (ENCODING_DENSE, samples.iter().map(|v| v.0).collect())
    };

    let key = block.key();
    let mut out = Vec::with_capacity(48 + payload.len() + block.overrides().len() * 28);
    out.extend_from_slice(&BLOCK_MAGIC);
    out.extend_from_slice(&BLOCK_RECORD_VERSION.to_le_bytes());
    out.push(encoding);
    out.push(key.lod);
    out.extend_from_slice(&key.x.to_le_bytes());
    out.extend_from_slice(&key.y.to_le_bytes());
    out.extend_from_slice(&key.z.to_le_bytes());
    out.extend_from_slice(&block.edge().to_le_bytes());
    out.extend_from_slice(&block.revision().to_le_bytes());
    out.extend_from_slice(&(samples.len() as u32).to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&(block.overrides().len() as u32).to_le_bytes());
    for (index, stamp) in block.overrides() {
        out.extend_from_slice(&index.to_le_bytes());
        out.extend_from_slice(&stamp.timestamp.to_le_bytes());
        out.extend_from_slice(stamp.peer.as_bytes());
    }
    let checksum = checksum(&out);
    out.extend_from_slice(&checksum.to_le_bytes());
    out
}

/// Parse a block record, verifying structure, sample count and checksum.
pub fn decode_block(data: &[u8]) -> Result<VoxelBlock, CorruptBlockError> {
    if data.len() < 8 {
        return Err(CorruptBlockError::Truncated {
            needed: 8,
            available: data.len(),
        });
    }
    let (body, tail) = data.split_at(data.len() - 8);
    let mut r = ByteReader::new(body);

    let magic = r.array::<4>()?;
    if magic != BLOCK_MAGIC {
        return Err(CorruptBlockError::BadMagic(magic));
    }
    let version = r.u16()?;
    if version != BLOCK_RECORD_VERSION {
        return Err(CorruptBlockError::UnsupportedVersion(version));
    }
    let stored = u64::from_le_bytes(tail.try_into().unwrap_or([0; 8]));
    let computed = checksum(body);
    if stored != computed {
        return Err(CorruptBlockError::ChecksumMismatch { stored, computed });
    }

    let encoding = r.u8()?;
    let lod = r.u8()?;
    let coord = IVec3::new(r.i32()?, r.i32()?, r.i32()?);
    let edge = r.u32()?;
    if !edge.is_power_of_two() || edge > MAX_BLOCK_EDGE {
        return Err(CorruptBlockError::InvalidEdge(edge));
    }
    let revision = r.u64()?;
    let declared = r.u32()? as u64;
    let expected = volume(edge) as u64;
    if declared != expected {
        return Err(CorruptBlockError::SampleCountMismatch { declared, expected });
    }
    let payload_len = r.u32()? as usize;
    let payload = r.bytes(payload_len)?;
    let samples = match encoding {
        ENCODING_DENSE => {
            if payload.len() != expected as usize {
                return Err(CorruptBlockError::RunLengthMismatch {
                    decoded: payload.len(),
                    expected: expected as usize,
                });
            }
            payload.iter().map(|&b| Voxel(b)).collect()
        }
        ENCODING_RLE => rle_decode(payload, expected as usize)?,
        other => return Err(CorruptBlockError::UnknownEncoding(other)),
    };

    let override_count = r.u32()? as usize;
    let mut overrides = BTreeMap::new();
    for _ in 0..override_count {
        let index = r.u32()?;
        let timestamp = r.u64()?;
        let peer = PeerId::from_bytes(r.array::<16>()?);
        overrides.insert(index, WriteStamp::new(timestamp, peer));
    }
    if r.remaining() > 0 {
        return Err(CorruptBlockError::TrailingBytes(r.remaining()));
    }

    VoxelBlock::from_parts(BlockKey::new(lod, coord), edge, samples, revision, overrides)
}

/// Run-length encode samples as `(run u16, value u8)` pairs.
pub fn rle_encode(samples: &[Voxel]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = samples.iter().copied().peekable();
    while let Some(v) = iter.next() {
        let mut run: u16 = 1;
        while run < u16::MAX && iter.peek() == Some(&v) {
            iter.next();
            run += 1;
        }
        out.extend_from_slice(&run.to_le_bytes());
        out.push(v.0);
    }
    out
}

/// Decode run-length pairs, requiring exactly `expected` samples.
pub fn rle_decode(data: &[u8], expected: usize) -> Result<Vec<Voxel>, CorruptBlockError> {
    if data.len() % 3 != 0 {
        return Err(CorruptBlockError::Truncated {
            needed: data.len().div_ceil(3) * 3,
            available: data.len(),
        });
    }
    // `expected` may come from an untrusted header; grow with the data.
    let mut out = Vec::new();
    for pair in data.chunks_exact(3) {
        let run = u16::from_le_bytes([pair[0], pair[1]]) as usize;
        if out.len() + run > expected {
            return Err(CorruptBlockError::RunLengthMismatch {
                decoded: out.len() + run,
                expected,
            });
        }
        out.extend(std::iter::repeat_n(Voxel(pair[2]), run));
    }
    if out.len() != expected {
        return Err(CorruptBlockError::RunLengthMismatch {
            decoded: out.len(),
            expected,
        });
    }
    Ok(out)
}

fn checksum(data: &[u8]) -> u64 {
    let digest = Sha256::digest(data);
    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(first)
}

/// Little-endian cursor over a byte slice. Reads past the end report
/// [`CorruptBlockError::Truncated`].
#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], CorruptBlockError> {
        if self.remaining() < n {
            return Err(CorruptBlockError::Truncated {
                needed: self.pos + n,
                available: self.data.len(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], CorruptBlockError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, CorruptBlockError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn u16(&mut self) -> Result<u16, CorruptBlockError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, CorruptBlockError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, CorruptBlockError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, CorruptBlockError> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}
