//! Locality Index Manager - owns the published artifact of one store
//!
//! Provides a unified interface to:
//! - open: pick up the latest complete artifact and sweep leftovers
//! - build: rebuild only when the coarse segment set moved past the artifact
//! - query: hand out contexts and answer `lookup_idx_files`
//!
//! # Publication
//!
//! ```text
//! build ──► accounts.0-96.{lb,li} ──► swap under write lock
//!                                        │
//! contexts on 0-64 keep reading ◄────────┘ old pair marked obsolete,
//!                                          deleted when the last one drops
//! ```

use crate::index::builder::{BuildSummary, CancelFlag, LocalityBuilder};
use crate::index::context::{IdxLookup, LocalityContext};
use crate::index::files::{ArtifactName, DirScan, LocalityFiles};
use crate::storage::{SegmentSet, StepRange, StorageError, StorageResult};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

pub const DEFAULT_AGGREGATION_STEP: u64 = 3_125_000;
pub const DEFAULT_STEPS_IN_BIGGEST_FILE: u64 = 32;
pub const DEFAULT_MAX_BUCKETS: u64 = 4096;

/// Runtime settings of one locality index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalityConfig {
    /// Directory holding the artifact files
    pub data_dir: PathBuf,
    /// Base name shared by the artifact files, usually the owning store's name
    pub filename_base: String,
    /// Ops per step
    pub aggregation_step: u64,
    /// Steps per bucket
    pub steps_in_biggest_file: u64,
    /// Bucket-count ceiling
    pub max_buckets: u64,
}

impl LocalityConfig {
    pub fn new(data_dir: impl Into<PathBuf>, filename_base: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            filename_base: filename_base.into(),
            aggregation_step: DEFAULT_AGGREGATION_STEP,
            steps_in_biggest_file: DEFAULT_STEPS_IN_BIGGEST_FILE,
            max_buckets: DEFAULT_MAX_BUCKETS,
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.aggregation_step == 0 {
            return Err(StorageError::Config("aggregation_step must be > 0".into()));
        }
        if self.steps_in_biggest_file == 0 {
            return Err(StorageError::Config("steps_in_biggest_file must be > 0".into()));
        }
        if self.max_buckets == 0 {
            return Err(StorageError::Config("max_buckets must be > 0".into()));
        }
        if self.filename_base.is_empty()
            || self.filename_base.contains(|c| c == '/' || c == '\\')
            || self.filename_base.starts_with('.')
        {
            return Err(StorageError::Config(format!(
                "invalid filename_base {:?}",
                self.filename_base
            )));
        }
        Ok(())
    }
}

/// Sizes of the loaded artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalityStats {
    pub key_count: u64,
    pub bits_per_row: u64,
    pub step_range: StepRange,
    pub rows_bytes: u64,
    pub bitmap_bytes: u64,
}

impl std::fmt::Display for LocalityStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} keys, {} buckets, steps {}, {} KB rows, {} KB bitmap",
            self.key_count,
            self.bits_per_row,
            self.step_range,
            self.rows_bytes / 1024,
            self.bitmap_bytes / 1024
        )
    }
}

/// The published locality artifact of one store
pub struct LocalityIndex {
    config: LocalityConfig,
    current: RwLock<Option<Arc<LocalityFiles>>>,
}

impl LocalityIndex {
    /// Open the index directory
    ///
    /// Loads the complete artifact covering the most steps. Older pairs,
    /// orphaned halves, unreadable pairs and leftover temp files are removed.
    pub fn open(config: LocalityConfig) -> StorageResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)?;

        let scan = DirScan::scan(&config.data_dir, &config.filename_base)?;

        for path in scan.temps.iter().chain(scan.orphans.iter()) {
            tracing::warn!("Removing leftover locality file {:?}", path);
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove {:?}: {}", path, e);
            }
        }

        let mut candidates = scan.complete.clone();
        candidates.sort_by_key(|r| (std::cmp::Reverse(r.to), r.from));

        let mut current = None;
        for range in candidates {
            let name = ArtifactName::new(config.filename_base.clone(), range);
            if current.is_none() {
                match LocalityFiles::open(&config.data_dir, name.clone(), config.max_buckets) {
                    Ok(files) => {
                        tracing::info!(
                            "Opened locality index {} ({} keys)",
                            name.rows_file_name(),
                            files.key_count()
                        );
                        current = Some(Arc::new(files));
                        continue;
                    }
                    Err(e) => {
                        tracing::warn!("Discarding locality index {}: {}", name.rows_file_name(), e);
                    }
                }
            }
            remove_pair(&config, &name);
        }

        if current.is_none() {
            tracing::debug!("No locality index for {} yet", config.filename_base);
        }

        Ok(Self {
            config,
            current: RwLock::new(current),
        })
    }

    fn loaded(&self) -> Option<Arc<LocalityFiles>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Swap in freshly built files; the previous ones go once unreferenced
    fn publish(&self, files: Arc<LocalityFiles>) {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = current.as_ref() {
            if old.range() == files.range() {
                tracing::debug!("Locality index {} already loaded", files.range());
                return;
            }
            old.mark_obsolete();
        }
        *current = Some(files);
    }

    /// Read handle over the current artifact and the coarse part of `segments`
    pub fn make_context(&self, segments: &SegmentSet) -> LocalityContext {
        let files = self.loaded();
        let coarse = segments.coarse(self.config.steps_in_biggest_file);
        tracing::debug!(
            "Locality context over {:?} with {} coarse segments",
            files.as_ref().map(|f| f.range()),
            coarse.len()
        );
        LocalityContext::new(
            files,
            coarse,
            self.config.aggregation_step,
            self.config.steps_in_biggest_file,
        )
    }

    pub fn current_range(&self) -> Option<StepRange> {
        self.loaded().map(|f| f.range())
    }

    /// True when the loaded artifact covers every coarse segment of `segments`
    ///
    /// A coarse set with a missing bucket is never current: the build that
    /// follows reports the gap instead of trusting an artifact that may span it.
    pub fn is_current(&self, segments: &SegmentSet) -> bool {
        let steps = self.config.steps_in_biggest_file;
        if let Some(missing) = segments.coarse_gap(steps) {
            tracing::warn!(
                "Coarse segments of {} are missing bucket {}",
                self.config.filename_base,
                missing
            );
            return false;
        }
        match segments.coarse_range(steps) {
            Some(range) => self.current_range() == Some(range),
            None => true,
        }
    }

    /// Build the artifact if it is missing or stale
    ///
    /// Returns `Ok(true)` when a new artifact was published and `Ok(false)`
    /// when the loaded one is already current. On error the previously
    /// loaded artifact stays in place.
    pub fn build_missed_indices(
        &self,
        segments: &SegmentSet,
        cancel: &CancelFlag,
    ) -> StorageResult<bool> {
        if self.is_current(segments) {
            tracing::debug!(
                "Locality index {} is current, skipping build",
                self.config.filename_base
            );
            return Ok(false);
        }

        let Some(summary) = LocalityBuilder::new(&self.config).build(segments, cancel)? else {
            return Ok(false);
        };
        self.load(summary)?;
        Ok(true)
    }

    fn load(&self, summary: BuildSummary) -> StorageResult<()> {
        let files = LocalityFiles::open(
            &self.config.data_dir,
            summary.name,
            self.config.max_buckets,
        )?;
        self.publish(Arc::new(files));
        Ok(())
    }

    /// `build_missed_indices` on the blocking pool
    pub async fn build_missed_indices_async(
        self: &Arc<Self>,
        segments: SegmentSet,
        cancel: CancelFlag,
    ) -> StorageResult<bool> {
        let index = Arc::clone(self);
        tokio::task::spawn_blocking(move || index.build_missed_indices(&segments, &cancel))
            .await
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?
    }

    pub fn lookup_idx_files(
        &self,
        ctx: &LocalityContext,
        key: &[u8],
        from_op_num: u64,
    ) -> StorageResult<IdxLookup> {
        ctx.lookup_idx_files(key, from_op_num)
    }

    pub fn stats(&self) -> Option<LocalityStats> {
        self.loaded().map(|files| LocalityStats {
            key_count: files.key_count(),
            bits_per_row: files.bitmaps.bits_per_row(),
            step_range: files.range(),
            rows_bytes: files.rows.size_bytes(),
            bitmap_bytes: files.bitmaps.size_bytes(),
        })
    }

    pub fn config(&self) -> &LocalityConfig {
        &self.config
    }
}

fn remove_pair(config: &LocalityConfig, name: &ArtifactName) {
    for file in [name.rows_file_name(), name.bitmap_file_name()] {
        let path = config.data_dir.join(file);
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!("Failed to remove {:?}: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{KeySource, MemSegment};
    use std::path::Path;
    use tempfile::tempdir;

    fn config(dir: &Path) -> LocalityConfig {
        LocalityConfig {
            aggregation_step: 10,
            ..LocalityConfig::new(dir, "accounts")
        }
    }

    fn bucket(b: u64, keys: &[u64]) -> Arc<dyn KeySource> {
        Arc::new(MemSegment::from_u64s(
            StepRange::new(b * 32, (b + 1) * 32),
            keys.iter().copied(),
        ))
    }

    fn files_in(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_validate() {
        let dir = tempdir().unwrap();
        assert!(config(dir.path()).validate().is_ok());

        let mut cfg = config(dir.path());
        cfg.steps_in_biggest_file = 0;
        assert!(matches!(cfg.validate(), Err(StorageError::Config(_))));

        let mut cfg = config(dir.path());
        cfg.filename_base = "../x".into();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_build_missing_then_skip() {
        let dir = tempdir().unwrap();
        let index = LocalityIndex::open(config(dir.path())).unwrap();
        let set = SegmentSet::new(vec![bucket(0, &[1, 2]), bucket(1, &[2, 3])]);

        assert!(!index.is_current(&set));
        assert!(index.build_missed_indices(&set, &CancelFlag::new()).unwrap());
        assert!(index.is_current(&set));
        assert_eq!(index.current_range(), Some(StepRange::new(0, 64)));
        assert!(!index.build_missed_indices(&set, &CancelFlag::new()).unwrap());

        let stats = index.stats().unwrap();
        assert_eq!(stats.key_count, 3);
        assert_eq!(stats.bits_per_row, 2);
    }

    #[test]
    fn test_reopen_keeps_latest_and_sweeps() {
        let dir = tempdir().unwrap();
        {
            let index = LocalityIndex::open(config(dir.path())).unwrap();
            let set = SegmentSet::new(vec![bucket(0, &[1]), bucket(1, &[1])]);
            index.build_missed_indices(&set, &CancelFlag::new()).unwrap();
        }
        // an older pair, an orphan and a temp file left behind by a crash
        {
            let cfg = config(dir.path());
            let set = SegmentSet::new(vec![bucket(0, &[1])]);
            LocalityBuilder::new(&cfg)
                .build(&set, &CancelFlag::new())
                .unwrap();
        }
        std::fs::write(dir.path().join("accounts.0-96.lb"), b"orphan").unwrap();
        std::fs::write(dir.path().join(".locality-x1.tmp"), b"partial").unwrap();

        let index = LocalityIndex::open(config(dir.path())).unwrap();
        assert_eq!(index.current_range(), Some(StepRange::new(0, 64)));
        assert_eq!(
            files_in(dir.path()),
            vec!["accounts.0-64.lb", "accounts.0-64.li"]
        );
    }

    #[test]
    fn test_open_discards_corrupt_latest() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path());
        LocalityBuilder::new(&cfg)
            .build(&SegmentSet::new(vec![bucket(0, &[1])]), &CancelFlag::new())
            .unwrap();
        LocalityBuilder::new(&cfg)
            .build(
                &SegmentSet::new(vec![bucket(0, &[1]), bucket(1, &[2])]),
                &CancelFlag::new(),
            )
            .unwrap();
        std::fs::write(dir.path().join("accounts.0-64.li"), b"garbage").unwrap();

        let index = LocalityIndex::open(cfg).unwrap();
        assert_eq!(index.current_range(), Some(StepRange::new(0, 32)));
        assert!(!dir.path().join("accounts.0-64.li").exists());
    }

    #[test]
    fn test_old_files_outlive_open_contexts() {
        let dir = tempdir().unwrap();
        let index = LocalityIndex::open(config(dir.path())).unwrap();
        let small = SegmentSet::new(vec![bucket(0, &[1, 2])]);
        index.build_missed_indices(&small, &CancelFlag::new()).unwrap();

        let old_ctx = index.make_context(&small);
        let bigger = SegmentSet::new(vec![bucket(0, &[1, 2]), bucket(1, &[2, 9])]);
        assert!(index.build_missed_indices(&bigger, &CancelFlag::new()).unwrap());

        // the old context still answers from the old artifact
        assert!(dir.path().join("accounts.0-32.li").exists());
        assert_eq!(old_ctx.key_count(), 2);
        assert_eq!(old_ctx.at(1).unwrap(), vec![0]);

        let new_ctx = index.make_context(&bigger);
        assert_eq!(new_ctx.key_count(), 3);
        assert_eq!(new_ctx.at(1).unwrap(), vec![0, 1]);

        old_ctx.close();
        assert!(!dir.path().join("accounts.0-32.li").exists());
        assert!(!dir.path().join("accounts.0-32.lb").exists());
        assert!(dir.path().join("accounts.0-64.li").exists());
    }

    #[test]
    fn test_failed_build_keeps_previous() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.max_buckets = 2;
        let index = LocalityIndex::open(cfg).unwrap();
        index
            .build_missed_indices(&SegmentSet::new(vec![bucket(0, &[1])]), &CancelFlag::new())
            .unwrap();

        let too_wide = SegmentSet::new(vec![bucket(0, &[1]), bucket(1, &[1]), bucket(2, &[1])]);
        assert!(index.build_missed_indices(&too_wide, &CancelFlag::new()).is_err());
        assert_eq!(index.current_range(), Some(StepRange::new(0, 32)));
    }

    #[test]
    fn test_gap_is_never_current() {
        let dir = tempdir().unwrap();
        let index = LocalityIndex::open(config(dir.path())).unwrap();
        let full = SegmentSet::new(vec![bucket(0, &[1]), bucket(1, &[1, 7]), bucket(2, &[1])]);
        assert!(index.build_missed_indices(&full, &CancelFlag::new()).unwrap());

        // bucket 1 failed to load: the outer range still matches the artifact
        let gapped = SegmentSet::new(vec![bucket(0, &[1]), bucket(2, &[1])]);
        assert_eq!(gapped.coarse_range(32), index.current_range());
        assert!(!index.is_current(&gapped));
        assert!(index.make_context(&gapped).is_stale());

        let err = index
            .build_missed_indices(&gapped, &CancelFlag::new())
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidSegment(_)));
        assert_eq!(index.current_range(), Some(StepRange::new(0, 96)));
        assert_eq!(
            files_in(dir.path()),
            vec!["accounts.0-96.lb", "accounts.0-96.li"]
        );

        // the loaded artifact still answers for the missing bucket
        let ctx = index.make_context(&full);
        let row = ctx.row_of(&7u64.to_be_bytes()).unwrap().unwrap();
        assert_eq!(ctx.at(row).unwrap(), vec![1]);
    }

    #[test]
    fn test_gap_refused_without_previous_artifact() {
        let dir = tempdir().unwrap();
        let index = LocalityIndex::open(config(dir.path())).unwrap();
        let gapped = SegmentSet::new(vec![bucket(0, &[1]), bucket(2, &[1])]);

        assert!(matches!(
            index.build_missed_indices(&gapped, &CancelFlag::new()),
            Err(StorageError::InvalidSegment(_))
        ));
        assert_eq!(index.current_range(), None);
        assert!(files_in(dir.path()).is_empty());
    }

    #[test]
    fn test_reopen_with_lower_ceiling_discards_artifact() {
        let dir = tempdir().unwrap();
        {
            let index = LocalityIndex::open(config(dir.path())).unwrap();
            let set = SegmentSet::new(vec![bucket(0, &[1]), bucket(1, &[1]), bucket(2, &[1])]);
            assert!(index.build_missed_indices(&set, &CancelFlag::new()).unwrap());
        }

        let mut cfg = config(dir.path());
        cfg.max_buckets = 2;
        let index = LocalityIndex::open(cfg).unwrap();
        assert_eq!(index.current_range(), None);
        assert!(index.stats().is_none());
        assert!(matches!(
            index.make_context(&SegmentSet::default()).at(0),
            Err(StorageError::OutOfRange { key_count: 0, .. })
        ));
    }

    #[tokio::test]
    async fn test_build_async() {
        let dir = tempdir().unwrap();
        let index = Arc::new(LocalityIndex::open(config(dir.path())).unwrap());
        let set = SegmentSet::new(vec![bucket(0, &[4]), bucket(1, &[4])]);

        assert!(index
            .build_missed_indices_async(set.clone(), CancelFlag::new())
            .await
            .unwrap());

        let ctx = index.make_context(&set);
        let hit = index.lookup_idx_files(&ctx, &4u64.to_be_bytes(), 0).unwrap();
        assert!(hit.has_v1);
        assert!(hit.has_v2);
        assert_eq!(hit.v1, 0);
        assert_eq!(hit.v2, 32);
    }
}
