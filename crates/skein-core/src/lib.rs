//! Skein core — shared-memory graph segment and update plumbing
//!
//! This crate holds the pieces of the graph server that are independent of
//! transport: the mapped graph segment and its durable snapshot format, the
//! update-batch codec, vertex name interning, the cancellation primitive
//! shared by the service loops, and logging setup.

pub mod batch;
pub mod error;
pub mod logging;
pub mod names;
pub mod segment;
pub mod shm;
pub mod shutdown;
pub mod snapshot;

// Re-exports for convenience
pub use batch::{Batch, BatchError, IdMode, Update, VertexKey};
pub use error::{SegmentError, SnapshotError};
pub use logging::init_logging;
pub use names::VertexNames;
pub use segment::{ConsistencyReport, GraphSegment};
pub use shutdown::CancelToken;
