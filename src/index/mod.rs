//! Locality Index
//!
//! Tells a segmented history store, for any key, which coarse buckets of
//! steps contain an update to that key:
//!
//! - **codec**: fixed-width bucket bitmaps
//! - **bitmap**: the `bm` file, one bitmap row per key
//! - **rows**: key → row ordinal
//! - **iter**: merge scan over the coarse segments
//! - **builder**: writes and publishes an artifact
//! - **context**: read handle, `lookup_idx_files`
//! - **manager**: `LocalityIndex`, the published artifact of one store
//!
//! # Architecture
//!
//! ```text
//! Query: "where was key K last touched at or after op N?"
//!        ↓
//! rows: K → row r
//!        ↓
//! bm: first two buckets >= N / (aggregation_step * steps_in_biggest_file)
//!        ↓
//! (v1, v2, next_from_op_num) → caller searches only those segments
//! ```

pub mod bitmap;
pub mod builder;
pub mod codec;
pub mod context;
pub mod files;
mod header;
pub mod iter;
mod manager;
pub mod rows;

pub use bitmap::{BitmapWriter, Bitmaps};
pub use builder::{BuildSummary, CancelFlag, LocalityBuilder};
pub use codec::{BitPositions, First2};
pub use context::{IdxLookup, LocalityContext};
pub use files::{ArtifactName, LocalityFiles};
pub use iter::LocalityIterator;
pub use manager::{
    LocalityConfig, LocalityIndex, LocalityStats, DEFAULT_AGGREGATION_STEP, DEFAULT_MAX_BUCKETS,
    DEFAULT_STEPS_IN_BIGGEST_FILE,
};
pub use rows::{KeyRows, RowsWriter};
