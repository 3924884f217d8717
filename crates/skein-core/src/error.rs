//! Error types for segment and snapshot operations

use std::io;
use std::path::PathBuf;

/// Error from allocating, restoring, or mutating a graph segment.
#[derive(Debug)]
pub enum SegmentError {
    /// Filesystem-level failure on the backing region.
    Io { path: PathBuf, source: io::Error },
    /// Zero or otherwise unusable vertex capacity.
    InvalidCapacity(u64),
    /// Vertex id beyond the segment's fixed capacity.
    VertexOutOfRange { vertex: u64, capacity: u64 },
    /// Edge-block arena exhausted.
    ArenaFull { blocks: u64 },
    /// The mapped bytes do not describe a valid segment.
    BadImage(String),
    /// Mutation attempted through a read-only attachment.
    ReadOnly,
    /// Operation on a handle whose region was already released.
    Released,
    /// Snapshot encode/decode failure during persist or restore.
    Snapshot(SnapshotError),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io { path, source } => write!(f, "{}: {source}", path.display()),
            Self::InvalidCapacity(cap) => write!(f, "invalid vertex capacity {cap}"),
            Self::VertexOutOfRange { vertex, capacity } => {
                write!(f, "vertex {vertex} out of range (capacity {capacity})")
            }
            Self::ArenaFull { blocks } => {
                write!(f, "edge-block arena exhausted ({blocks} blocks)")
            }
            Self::BadImage(why) => write!(f, "invalid segment image: {why}"),
            Self::ReadOnly => write!(f, "segment attachment is read-only"),
            Self::Released => write!(f, "segment was already released"),
            Self::Snapshot(e) => write!(f, "snapshot: {e}"),
        }
    }
}

impl std::error::Error for SegmentError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io { source, .. } => Some(source),
            Self::Snapshot(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SnapshotError> for SegmentError {
    fn from(e: SnapshotError) -> Self {
        Self::Snapshot(e)
    }
}

/// Error from reading or writing a durable snapshot file.
#[derive(Debug)]
pub enum SnapshotError {
    Io(io::Error),
    BadMagic,
    UnsupportedVersion(u32),
    Truncated,
    ChecksumMismatch,
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::BadMagic => write!(f, "not a snapshot file"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported snapshot version {v}"),
            Self::Truncated => write!(f, "snapshot file is truncated"),
            Self::ChecksumMismatch => write!(f, "snapshot checksum mismatch"),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for SnapshotError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}
