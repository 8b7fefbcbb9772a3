//! Segment storage collaborators
//!
//! The locality index never reads values. All it needs from the store is,
//! for every segment, the step range it covers and an ascending stream of
//! the keys updated inside it:
//!
//! - **types**: `StepRange`, the `KeySource` trait, `MemSegment`
//! - **compression**: front coding + LZ4 for key blocks
//! - **segment**: on-disk key segment files
//! - **set**: `SegmentSet`, the ordered segment list of one store
//! - **error**: Error types
//!
//! # Architecture
//!
//! ```text
//! Build Path:
//!   SegmentSet → coarse (bucket-sized) segments → merge scan → locality index
//!
//! Read Path:
//!   key → locality index → candidate buckets → caller reads those segments
//! ```

pub mod compression;
pub mod error;
pub mod segment;
pub mod set;
pub mod types;

// Re-export commonly used types
pub use compression::{compress_keys, decompress_keys};
pub use error::{StorageError, StorageResult};
pub use segment::{write_segment, BlockMeta, KeySegment, SegmentHeader, SegmentWriter};
pub use set::SegmentSet;
pub use types::{KeySource, KeyStream, MemSegment, StepRange};
