//! Read handle over one loaded locality artifact
//!
//! A context pins the artifact that was current when it was created (and
//! the coarse segments it was built from) for as long as it lives. A later
//! publication does not affect it; the old files are reclaimed once the
//! last context holding them is dropped.

use crate::index::bitmap::Bitmaps;
use crate::index::codec::First2;
use crate::index::files::LocalityFiles;
use crate::index::iter::LocalityIterator;
use crate::index::rows::KeyRows;
use crate::storage::{KeySource, StepRange, StorageError, StorageResult};
use serde::Serialize;
use std::sync::{Arc, OnceLock};

/// Answer of `lookup_idx_files`
///
/// `v1`/`v2` are step numbers, `next_from_op_num` is an op number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IdxLookup {
    /// First step of the nearest bucket at or after the requested op
    pub v1: u64,
    /// First step of the second hit, or of the bucket before `v1`
    pub v2: u64,
    /// Op number just past the matched bucket
    pub next_from_op_num: u64,
    pub has_v1: bool,
    pub has_v2: bool,
}

impl IdxLookup {
    /// No coarse hit; the caller falls back to a full search from `from_op_num`
    pub fn miss(from_op_num: u64) -> Self {
        Self {
            next_from_op_num: from_op_num,
            ..Self::default()
        }
    }
}

pub struct LocalityContext {
    files: Option<Arc<LocalityFiles>>,
    segments: Vec<Arc<dyn KeySource>>,
    coarse_range: Option<StepRange>,
    /// Coarse segments follow each other without a missing bucket
    contiguous: bool,
    aggregation_step: u64,
    steps_in_biggest_file: u64,
    poisoned: OnceLock<String>,
}

impl LocalityContext {
    pub(crate) fn new(
        files: Option<Arc<LocalityFiles>>,
        segments: Vec<Arc<dyn KeySource>>,
        aggregation_step: u64,
        steps_in_biggest_file: u64,
    ) -> Self {
        let coarse_range = match (segments.first(), segments.last()) {
            (Some(first), Some(last)) => {
                Some(StepRange::new(first.step_range().from, last.step_range().to))
            }
            _ => None,
        };
        let contiguous = segments
            .windows(2)
            .all(|pair| pair[0].step_range().to == pair[1].step_range().from);

        Self {
            files,
            segments,
            coarse_range,
            contiguous,
            aggregation_step,
            steps_in_biggest_file,
            poisoned: OnceLock::new(),
        }
    }

    fn check_poisoned(&self) -> StorageResult<()> {
        match self.poisoned.get() {
            Some(reason) => Err(StorageError::RebuildRequired(reason.clone())),
            None => Ok(()),
        }
    }

    /// Corruption is sticky: the first one poisons the context for good
    fn guard<T>(&self, result: StorageResult<T>) -> StorageResult<T> {
        if let Err(e) = &result {
            if e.is_corruption() {
                let reason = e.to_string();
                tracing::warn!("Locality context poisoned: {}", reason);
                let _ = self.poisoned.set(reason);
            }
        }
        result
    }

    /// All buckets of a row, ascending
    pub fn at(&self, row: u64) -> StorageResult<Vec<u64>> {
        self.check_poisoned()?;
        match &self.files {
            Some(files) => self.guard(files.bitmaps.at(row)),
            None => Err(StorageError::OutOfRange { row, key_count: 0 }),
        }
    }

    /// First two buckets `>= from_bucket` of a row
    pub fn first2_at(&self, row: u64, from_bucket: u64) -> StorageResult<First2> {
        self.check_poisoned()?;
        match &self.files {
            Some(files) => self.guard(files.bitmaps.first2_at(row, from_bucket)),
            None => Err(StorageError::OutOfRange { row, key_count: 0 }),
        }
    }

    /// Row assigned to `key`, or `None` if the key was not seen at build time
    pub fn row_of(&self, key: &[u8]) -> StorageResult<Option<u64>> {
        self.check_poisoned()?;
        Ok(self.files.as_ref().and_then(|files| files.rows.row_of(key)))
    }

    /// Nearest bucket at or after `from_op_num` in which `key` was updated
    pub fn lookup_idx_files(&self, key: &[u8], from_op_num: u64) -> StorageResult<IdxLookup> {
        let Some(row) = self.row_of(key)? else {
            return Ok(IdxLookup::miss(from_op_num));
        };

        let steps = self.steps_in_biggest_file;
        let ops_per_bucket = self.aggregation_step.saturating_mul(steps);
        let bucket = from_op_num / ops_per_bucket;

        let hit = self.first2_at(row, bucket)?;
        if !hit.has_first {
            return Ok(IdxLookup::miss(from_op_num));
        }

        let v2 = if hit.has_second {
            hit.second.saturating_mul(steps)
        } else if hit.first > 0 {
            (hit.first - 1).saturating_mul(steps)
        } else {
            0
        };

        Ok(IdxLookup {
            v1: hit.first.saturating_mul(steps),
            v2,
            next_from_op_num: (hit.first + 1).saturating_mul(ops_per_bucket),
            has_v1: true,
            has_v2: hit.has_second,
        })
    }

    /// Fresh ascending scan of `(key, buckets)` over the coarse segments
    ///
    /// Buckets starting past `max_tx_num` are left out; `u64::MAX` selects all.
    pub fn iterate_keys_locality(&self, max_tx_num: u64) -> StorageResult<LocalityIterator<'_>> {
        self.check_poisoned()?;
        LocalityIterator::new(
            &self.segments,
            self.steps_in_biggest_file,
            self.aggregation_step,
            max_tx_num,
            None,
        )
    }

    pub fn bitmaps(&self) -> Option<&Bitmaps> {
        self.files.as_ref().map(|f| &f.bitmaps)
    }

    pub fn rows(&self) -> Option<&KeyRows> {
        self.files.as_ref().map(|f| &f.rows)
    }

    pub fn key_count(&self) -> u64 {
        self.files.as_ref().map(|f| f.key_count()).unwrap_or(0)
    }

    /// Steps covered by the loaded artifact
    pub fn step_range(&self) -> Option<StepRange> {
        self.files.as_ref().map(|f| f.range())
    }

    /// True when the artifact does not cover the coarse segments this context was opened with
    pub fn is_stale(&self) -> bool {
        match self.coarse_range {
            Some(_) if !self.contiguous => true,
            Some(range) => self.step_range() != Some(range),
            None => false,
        }
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.get().is_some()
    }

    /// Release the artifact
    pub fn close(self) {
        tracing::debug!("Closing locality context over {:?}", self.step_range());
    }
}

impl std::fmt::Debug for LocalityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalityContext")
            .field("step_range", &self.step_range())
            .field("key_count", &self.key_count())
            .field("segments", &self.segments.len())
            .field("poisoned", &self.is_poisoned())
            .finish()
    }
}
