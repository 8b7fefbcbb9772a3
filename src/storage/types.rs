//! Core data types shared by segments and the locality index
//!
//! - `StepRange`: a half-open interval of aggregation steps
//! - `KeySource`: anything that can stream its keys in ascending order
//! - `MemSegment`: an in-memory `KeySource`, used by tests and tooling

use crate::storage::error::StorageResult;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open range of aggregation steps `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepRange {
    /// First step covered (inclusive)
    pub from: u64,
    /// End step (exclusive)
    pub to: u64,
}

impl StepRange {
    pub fn new(from: u64, to: u64) -> Self {
        Self { from, to }
    }

    /// Number of steps covered
    pub fn len(&self) -> u64 {
        self.to.saturating_sub(self.from)
    }

    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    /// True when the range is exactly one bucket, aligned on a bucket boundary
    pub fn is_coarse(&self, steps_in_biggest_file: u64) -> bool {
        steps_in_biggest_file > 0
            && self.len() == steps_in_biggest_file
            && self.from % steps_in_biggest_file == 0
    }

    /// Bucket index this range starts in
    pub fn bucket(&self, steps_in_biggest_file: u64) -> u64 {
        self.from / steps_in_biggest_file
    }

    /// Check if a step falls inside the range
    pub fn contains(&self, step: u64) -> bool {
        step >= self.from && step < self.to
    }
}

impl fmt::Display for StepRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.from, self.to)
    }
}

/// Lazy ascending key stream produced by a segment
pub type KeyStream<'a> = Box<dyn Iterator<Item = StorageResult<Vec<u8>>> + Send + 'a>;

/// A segment that can enumerate its keys in strictly ascending order
///
/// Every call to `keys` starts a fresh stream.
pub trait KeySource: Send + Sync {
    /// Steps this segment covers
    fn step_range(&self) -> StepRange;

    /// Start a new ascending key stream
    fn keys(&self) -> StorageResult<KeyStream<'_>>;

    /// Human readable name for logs
    fn name(&self) -> String {
        self.step_range().to_string()
    }
}

/// In-memory segment holding a sorted, de-duplicated key list
#[derive(Debug, Clone)]
pub struct MemSegment {
    range: StepRange,
    keys: Vec<Vec<u8>>,
}

impl MemSegment {
    /// Create a segment; keys are sorted and de-duplicated
    pub fn new(range: StepRange, mut keys: Vec<Vec<u8>>) -> Self {
        keys.sort();
        keys.dedup();
        Self { range, keys }
    }

    /// Segment whose keys are `u64`s encoded big-endian, so byte order matches numeric order
    pub fn from_u64s(range: StepRange, keys: impl IntoIterator<Item = u64>) -> Self {
        Self::new(range, keys.into_iter().map(|k| k.to_be_bytes().to_vec()).collect())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeySource for MemSegment {
    fn step_range(&self) -> StepRange {
        self.range
    }

    fn keys(&self) -> StorageResult<KeyStream<'_>> {
        Ok(Box::new(self.keys.iter().map(|k| Ok(k.clone()))))
    }

    fn name(&self) -> String {
        format!("mem:{}", self.range)
    }
}
