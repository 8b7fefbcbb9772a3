//! Builds a locality artifact from the coarse segments of a store
//!
//! One merge scan over every bucket-sized segment assigns rows in key order
//! and writes both files side by side into temp files. Publication renames
//! the bitmap first and the row file second; a reader only trusts complete
//! pairs, so a crash between the two renames leaves an orphan, never a
//! half-visible artifact.

use crate::index::bitmap::BitmapWriter;
use crate::index::files::ArtifactName;
use crate::index::iter::LocalityIterator;
use crate::index::manager::LocalityConfig;
use crate::index::rows::RowsWriter;
use crate::storage::{SegmentSet, StepRange, StorageError, StorageResult};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Rows written between two polls of the cancel flag
const CANCEL_CHECK_INTERVAL: u64 = 1024;

/// Shared cancellation signal for a running build
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn check(&self) -> StorageResult<()> {
        if self.is_cancelled() {
            Err(StorageError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// What a finished build published
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildSummary {
    #[serde(skip)]
    pub name: ArtifactName,
    pub range: StepRange,
    pub key_count: u64,
    pub bits_per_row: u64,
    pub buckets: usize,
}

/// Writes artifacts for one store into its data directory
pub struct LocalityBuilder<'a> {
    config: &'a LocalityConfig,
}

impl<'a> LocalityBuilder<'a> {
    pub fn new(config: &'a LocalityConfig) -> Self {
        Self { config }
    }

    /// Build and publish an artifact over the coarse segments of `segments`
    ///
    /// Returns `None` when there is no coarse segment to index. Always
    /// rebuilds; deciding whether a build is needed is the caller's job.
    pub fn build(
        &self,
        segments: &SegmentSet,
        cancel: &CancelFlag,
    ) -> StorageResult<Option<BuildSummary>> {
        let steps = self.config.steps_in_biggest_file;
        let coarse = segments.coarse(steps);
        let (Some(first), Some(last)) = (coarse.first(), coarse.last()) else {
            tracing::debug!("No coarse segments for {}, nothing to build", self.config.filename_base);
            return Ok(None);
        };

        if let Some(missing) = segments.coarse_gap(steps) {
            return Err(StorageError::InvalidSegment(format!(
                "no coarse segment for bucket {} (steps {}..{})",
                missing,
                missing * steps,
                (missing + 1) * steps
            )));
        }

        let range = StepRange::new(first.step_range().from, last.step_range().to);
        let bits_per_row = last.step_range().bucket(steps) + 1;
        if bits_per_row > self.config.max_buckets {
            return Err(StorageError::Config(format!(
                "bucket {} exceeds the configured ceiling of {} buckets",
                bits_per_row - 1,
                self.config.max_buckets
            )));
        }

        let dir = &self.config.data_dir;
        std::fs::create_dir_all(dir)?;

        let name = ArtifactName::new(self.config.filename_base.clone(), range);
        let start = Instant::now();
        tracing::info!(
            "Building locality index {} from {} coarse segments",
            name.rows_file_name(),
            coarse.len()
        );

        let mut rows = RowsWriter::new(dir, range)?;
        let mut bitmaps = BitmapWriter::new(dir, bits_per_row, range)?;

        let iter = LocalityIterator::new(
            &coarse,
            steps,
            self.config.aggregation_step,
            u64::MAX,
            Some(cancel),
        )?;

        for item in iter {
            if rows.key_count() % CANCEL_CHECK_INTERVAL == 0 {
                cancel.check()?;
            }
            let (key, buckets) = item?;
            rows.push_key(&key)?;
            bitmaps.push_row(&buckets)?;
        }

        let key_count = rows.key_count();
        let bitmap_tmp = bitmaps.finish()?;
        let rows_tmp = rows.finish()?;
        cancel.check()?;

        bitmap_tmp.persist(dir.join(name.bitmap_file_name()))?;
        rows_tmp.persist(dir.join(name.rows_file_name()))?;

        tracing::info!(
            "Published locality index {}: {} keys over {} buckets in {:?}",
            name.rows_file_name(),
            key_count,
            bits_per_row,
            start.elapsed()
        );

        Ok(Some(BuildSummary {
            name,
            range,
            key_count,
            bits_per_row,
            buckets: coarse.len(),
        }))
    }
}
