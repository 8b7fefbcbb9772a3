//! Ordered set of segments a locality index is built from

use crate::storage::error::StorageResult;
use crate::storage::segment::{KeySegment, SEGMENT_EXTENSION};
use crate::storage::types::{KeySource, StepRange};
use std::path::Path;
use std::sync::Arc;

/// Segments of one store, ordered by step range
#[derive(Clone, Default)]
pub struct SegmentSet {
    segments: Vec<Arc<dyn KeySource>>,
}

impl SegmentSet {
    pub fn new(mut segments: Vec<Arc<dyn KeySource>>) -> Self {
        segments.sort_by_key(|s| s.step_range());
        Self { segments }
    }

    /// Add a segment, keeping the set ordered
    pub fn push(&mut self, segment: Arc<dyn KeySource>) {
        self.segments.push(segment);
        self.segments.sort_by_key(|s| s.step_range());
    }

    /// Open every `*.kseg` file in a directory
    ///
    /// Files that fail to open are skipped with a warning.
    pub fn load_dir(dir: &Path) -> StorageResult<Self> {
        let mut segments: Vec<Arc<dyn KeySource>> = Vec::new();

        if !dir.exists() {
            return Ok(Self::default());
        }

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();

            if path.extension().map(|e| e == SEGMENT_EXTENSION).unwrap_or(false) {
                match KeySegment::open(&path) {
                    Ok(segment) => segments.push(Arc::new(segment)),
                    Err(e) => {
                        tracing::warn!("Failed to open segment {:?}: {}", path, e);
                    }
                }
            }
        }

        tracing::info!("Loaded {} segments from {:?}", segments.len(), dir);
        Ok(Self::new(segments))
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn KeySource>> {
        self.segments.iter()
    }

    /// Bucket-sized segments in ascending bucket order
    ///
    /// When two coarse segments claim the same bucket only the first is kept.
    pub fn coarse(&self, steps_in_biggest_file: u64) -> Vec<Arc<dyn KeySource>> {
        let mut out: Vec<Arc<dyn KeySource>> = Vec::new();
        for segment in &self.segments {
            let range = segment.step_range();
            if !range.is_coarse(steps_in_biggest_file) {
                continue;
            }
            if let Some(last) = out.last() {
                if last.step_range() == range {
                    tracing::warn!("Duplicate coarse segment {} ignored", segment.name());
                    continue;
                }
            }
            out.push(Arc::clone(segment));
        }
        out
    }

    /// Step range a locality index over the coarse segments must cover
    pub fn coarse_range(&self, steps_in_biggest_file: u64) -> Option<StepRange> {
        let coarse = self.coarse(steps_in_biggest_file);
        let first = coarse.first()?.step_range();
        let last = coarse.last()?.step_range();
        Some(StepRange::new(first.from, last.to))
    }

    /// First bucket missing between the lowest and highest coarse segment
    pub fn coarse_gap(&self, steps_in_biggest_file: u64) -> Option<u64> {
        let coarse = self.coarse(steps_in_biggest_file);
        coarse.windows(2).find_map(|pair| {
            let end = pair[0].step_range().to;
            (pair[1].step_range().from != end).then(|| end / steps_in_biggest_file)
        })
    }
}

impl std::fmt::Debug for SegmentSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.segments.iter().map(|s| s.step_range()))
            .finish()
    }
}
