//! Artifact naming and the loaded (rows, bitmap) pair
//!
//! Both files of one artifact carry the covered step range in their name,
//! so staleness can be judged from a directory listing:
//!
//! ```text
//! accounts.0-64.li   row assignment
//! accounts.0-64.lb   bitmap
//! ```

use crate::index::bitmap::Bitmaps;
use crate::index::header::{TEMP_PREFIX, TEMP_SUFFIX};
use crate::index::rows::KeyRows;
use crate::storage::{StepRange, StorageError, StorageResult};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub const ROWS_EXTENSION: &str = "li";
pub const BITMAP_EXTENSION: &str = "lb";

/// Name of one artifact: owning store's base name plus step range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactName {
    pub base: String,
    pub range: StepRange,
}

impl ArtifactName {
    pub fn new(base: impl Into<String>, range: StepRange) -> Self {
        Self {
            base: base.into(),
            range,
        }
    }

    pub fn rows_file_name(&self) -> String {
        format!("{}.{}.{}", self.base, self.range, ROWS_EXTENSION)
    }

    pub fn bitmap_file_name(&self) -> String {
        format!("{}.{}.{}", self.base, self.range, BITMAP_EXTENSION)
    }

    /// Parse `<base>.<from>-<to>.<ext>` for a known base
    ///
    /// Returns the step range and extension, or `None` for foreign files.
    pub fn parse<'a>(file_name: &'a str, base: &str) -> Option<(StepRange, &'a str)> {
        let rest = file_name.strip_prefix(base)?.strip_prefix('.')?;
        let (range, ext) = rest.rsplit_once('.')?;
        let (from, to) = range.split_once('-')?;
        let range = StepRange::new(from.parse().ok()?, to.parse().ok()?);
        if range.is_empty() {
            return None;
        }
        Some((range, ext))
    }
}

/// What a directory scan found for one base name
#[derive(Debug, Default)]
pub struct DirScan {
    /// Ranges with both files present, ascending
    pub complete: Vec<StepRange>,
    /// Files whose partner is missing
    pub orphans: Vec<PathBuf>,
    /// Leftover temp files from interrupted builds
    pub temps: Vec<PathBuf>,
}

impl DirScan {
    pub fn scan(dir: &Path, base: &str) -> StorageResult<Self> {
        let mut scan = DirScan::default();
        if !dir.exists() {
            return Ok(scan);
        }

        let mut halves: BTreeMap<StepRange, (Option<PathBuf>, Option<PathBuf>)> = BTreeMap::new();

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
                scan.temps.push(path.clone());
                continue;
            }

            match ArtifactName::parse(name, base) {
                Some((range, ROWS_EXTENSION)) => halves.entry(range).or_default().0 = Some(path.clone()),
                Some((range, BITMAP_EXTENSION)) => halves.entry(range).or_default().1 = Some(path.clone()),
                _ => {}
            }
        }

        for (range, pair) in halves {
            match pair {
                (Some(_), Some(_)) => scan.complete.push(range),
                (Some(p), None) | (None, Some(p)) => scan.orphans.push(p),
                (None, None) => {}
            }
        }
        Ok(scan)
    }

    /// Complete artifact covering the most steps
    pub fn latest(&self) -> Option<StepRange> {
        self.complete.iter().copied().max_by_key(|r| (r.to, std::cmp::Reverse(r.from)))
    }
}

/// An opened artifact: row assignment and bitmap sharing one row numbering
///
/// Shared behind an `Arc`; once marked obsolete the files are removed when
/// the last holder drops it.
#[derive(Debug)]
pub struct LocalityFiles {
    pub name: ArtifactName,
    pub rows: KeyRows,
    pub bitmaps: Bitmaps,
    obsolete: AtomicBool,
}

impl LocalityFiles {
    /// Open a complete pair, rejecting bitmaps wider than `max_buckets`
    pub fn open(dir: &Path, name: ArtifactName, max_buckets: u64) -> StorageResult<Self> {
        let bitmaps = Bitmaps::open(dir.join(name.bitmap_file_name()))?;
        if bitmaps.bits_per_row() > max_buckets {
            return Err(StorageError::Corruption(format!(
                "artifact {} has {} buckets per row, ceiling is {}",
                name.bitmap_file_name(),
                bitmaps.bits_per_row(),
                max_buckets
            )));
        }
        let rows = KeyRows::open(dir.join(name.rows_file_name()))?;

        if rows.key_count() != bitmaps.key_count() {
            return Err(StorageError::Corruption(format!(
                "artifact {} has {} rows but {} bitmaps",
                name.rows_file_name(),
                rows.key_count(),
                bitmaps.key_count()
            )));
        }
        if rows.step_range() != name.range || bitmaps.step_range() != name.range {
            return Err(StorageError::Corruption(format!(
                "artifact {} headers disagree with file name (rows {}, bitmap {})",
                name.rows_file_name(),
                rows.step_range(),
                bitmaps.step_range()
            )));
        }

        Ok(Self {
            name,
            rows,
            bitmaps,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn range(&self) -> StepRange {
        self.name.range
    }

    pub fn key_count(&self) -> u64 {
        self.rows.key_count()
    }

    /// Delete the files once the last reader lets go
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }
}

impl Drop for LocalityFiles {
    fn drop(&mut self) {
        if !self.obsolete.load(Ordering::Acquire) {
            return;
        }
        for path in [self.rows.path(), self.bitmaps.path()] {
            if let Err(e) = std::fs::remove_file(path) {
                tracing::warn!("Failed to remove obsolete artifact {:?}: {}", path, e);
            }
        }
        tracing::debug!("Removed obsolete locality artifact {}", self.name.range);
    }
}
