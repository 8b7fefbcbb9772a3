//! # Locality Index
//!
//! Disk-resident index for segmented, append-only history stores. For
//! every key it records which coarse buckets of steps contain an update,
//! so a point-in-time read can jump straight to the right segment files
//! instead of probing every one of them.
//!
//! ## Features
//!
//! - **Compact**: one fixed-width bitmap row per key, memory-mapped
//! - **Immutable artifacts**: built once, published atomically, reclaimed
//!   when the last reader lets go
//! - **Cheap to keep current**: rebuilds only when the coarse segment set grows
//!
//! ## Modules
//!
//! - [`storage`]: segment collaborators (step ranges, key segments, segment sets)
//! - [`index`]: the locality index proper
//! - [`config`]: TOML configuration with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use locality_index::index::{CancelFlag, LocalityConfig, LocalityIndex};
//! use locality_index::storage::SegmentSet;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = LocalityConfig::new("/var/lib/store/locality", "accounts");
//!     let index = LocalityIndex::open(config)?;
//!
//!     // Rebuild if merges produced new coarse segments
//!     let segments = SegmentSet::load_dir("/var/lib/store/segments".as_ref())?;
//!     index.build_missed_indices(&segments, &CancelFlag::new())?;
//!
//!     // Where was the key last touched at or after op 100_000_000?
//!     let ctx = index.make_context(&segments);
//!     let hit = index.lookup_idx_files(&ctx, b"some-key", 100_000_000)?;
//!     if hit.has_v1 {
//!         println!("search from step {}", hit.v1);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod index;
pub mod storage;

// Re-export top-level types for convenience
pub use storage::{KeySource, MemSegment, SegmentSet, StepRange, StorageError, StorageResult};

pub use index::{
    CancelFlag, First2, IdxLookup, LocalityConfig, LocalityContext, LocalityIndex, LocalityStats,
};

pub use config::{Config, ConfigError, IndexConfig, LoggingConfig};
