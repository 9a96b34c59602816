use voxelcore_common::{BlockKey, PeerId, VoxelRegion};

/// Malformed persisted or transmitted block data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorruptBlockError {
    #[error("block record truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("bad block record magic {0:?}")]
    BadMagic([u8; 4]),
    #[error("unsupported block record version {0}")]
    UnsupportedVersion(u16),
    #[error("unknown sample encoding tag {0}")]
    UnknownEncoding(u8),
    #[error("edge length {0} is not a power of two up to 256")]
    InvalidEdge(u32),
    #[error("declared sample count {declared} does not match edge^3 = {expected}")]
    SampleCountMismatch { declared: u64, expected: u64 },
    #[error("run-length payload decodes to {decoded} samples, expected {expected}")]
    RunLengthMismatch { decoded: usize, expected: usize },
    #[error("checksum mismatch: stored {stored:#018x}, computed {computed:#018x}")]
    ChecksumMismatch { stored: u64, computed: u64 },
    #[error("override index {index} out of range for {samples} samples")]
    OverrideOutOfRange { index: u32, samples: usize },
    #[error("{0} trailing bytes after block record")]
    TrailingBytes(usize),
    #[error("record holds {found}, filed under {expected}")]
    KeyMismatch { expected: BlockKey, found: BlockKey },
}

/// Attempted eviction of a subtree that still holds unpersisted edits.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("eviction of {node} denied: {pending} holds unpersisted edits")]
pub struct EvictionDeniedError {
    pub node: BlockKey,
    pub pending: BlockKey,
}

/// A remote record whose causal prerequisite cannot be satisfied from the
/// bounded reorder buffer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "out-of-order edit from {origin}: expected seq {expected}, received {received} with {buffered} buffered"
)]
pub struct OutOfOrderError {
    pub origin: PeerId,
    pub expected: u64,
    pub received: u64,
    pub buffered: usize,
}

/// Reasons a branch cannot be collapsed into a single coarse leaf.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoarsenDeniedError {
    #[error("{0} is a leaf, nothing to coarsen")]
    NotBranch(BlockKey),
    #[error("descendant {0} holds unpersisted edits")]
    ChildUnpersisted(BlockKey),
}

/// Failures of a block archive backend.
#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("corrupt block record: {0}")]
    Corrupt(#[from] CorruptBlockError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced by [`crate::World`] operations.
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    #[error(transparent)]
    Corrupt(#[from] CorruptBlockError),
    #[error(transparent)]
    EvictionDenied(#[from] EvictionDeniedError),
    #[error(transparent)]
    OutOfOrder(#[from] OutOfOrderError),
    #[error(transparent)]
    CoarsenDenied(#[from] CoarsenDeniedError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("edit carries {actual} values for a region of {expected} voxels")]
    ValueCountMismatch { expected: usize, actual: usize },
    #[error("edit region is empty")]
    EmptyRegion,
    #[error("edit region {0:?} leaves the world bounds")]
    OutOfBounds(VoxelRegion),
    #[error("{0} lies outside the world bounds")]
    BlockOutOfBounds(BlockKey),
    #[error("{0} is not a leaf of the octree")]
    NotALeaf(BlockKey),
    #[error("invalid world configuration: {0}")]
    InvalidConfig(String),
}
