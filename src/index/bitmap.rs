//! Bitmap index (`bm`)
//!
//! Read-only table of fixed-width rows, one per key ordinal. Row `r` is the
//! set of buckets the key with ordinal `r` was updated in.
//!
//! Layout:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ HEADER (64 bytes, magic "LBMP")               │
//! │   key_count, bits_per_row, step range, crc    │
//! ├───────────────────────────────────────────────┤
//! │ ROWS: key_count × ceil(bits_per_row / 64) u64 │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Row `r` starts at `64 + r * row_bytes`, so `at` and `first2_at` are a
//! bounds check plus one slice of the memory map.

use crate::index::codec::{BitPositions, First2};
use crate::index::header::{artifact_temp, ArtifactHeader, HEADER_SIZE};
use crate::storage::{StepRange, StorageError, StorageResult};
use memmap2::Mmap;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub(crate) const BITMAP_MAGIC: [u8; 4] = *b"LBMP";

/// Memory-mapped, read-only bitmap file
pub struct Bitmaps {
    path: PathBuf,
    mmap: Mmap,
    header: ArtifactHeader,
    codec: BitPositions,
}

impl Bitmaps {
    /// Open and verify a bitmap file
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: published artifact files are never written again; a rebuild
        // writes a new pair and only unlinks this one once no reader holds it
        let mmap = unsafe { Mmap::map(&file)? };

        let header = ArtifactHeader::from_bytes(&mmap, BITMAP_MAGIC)?;
        let codec = BitPositions::new(header.width);

        let body = &mmap[HEADER_SIZE..];
        let expected = header
            .key_count
            .checked_mul(codec.row_bytes() as u64)
            .ok_or_else(|| StorageError::Corruption("bitmap size overflows".into()))?;
        if body.len() as u64 != expected {
            return Err(StorageError::Corruption(format!(
                "bitmap {:?} has {} body bytes, expected {} ({} rows of {} bytes)",
                path,
                body.len(),
                expected,
                header.key_count,
                codec.row_bytes()
            )));
        }
        if crc32fast::hash(body) != header.body_crc {
            return Err(StorageError::Corruption(format!(
                "bitmap {:?} body checksum mismatch",
                path
            )));
        }

        Ok(Self {
            path,
            mmap,
            header,
            codec,
        })
    }

    fn row(&self, row: u64) -> StorageResult<&[u8]> {
        if row >= self.header.key_count {
            return Err(StorageError::OutOfRange {
                row,
                key_count: self.header.key_count,
            });
        }
        let len = self.codec.row_bytes();
        let start = HEADER_SIZE + row as usize * len;
        Ok(&self.mmap[start..start + len])
    }

    /// All buckets of a row, ascending, as an owned copy
    pub fn at(&self, row: u64) -> StorageResult<Vec<u64>> {
        self.codec.decode(self.row(row)?)
    }

    /// First and second bucket `>= from_bucket` in a row
    pub fn first2_at(&self, row: u64, from_bucket: u64) -> StorageResult<First2> {
        self.codec.first2(self.row(row)?, from_bucket)
    }

    /// Number of buckets set in a row
    pub fn count_at(&self, row: u64) -> StorageResult<u64> {
        self.codec.count(self.row(row)?)
    }

    pub fn key_count(&self) -> u64 {
        self.header.key_count
    }

    pub fn bits_per_row(&self) -> u64 {
        self.codec.bits_per_row()
    }

    pub fn step_range(&self) -> StepRange {
        self.header.range
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size_bytes(&self) -> u64 {
        self.mmap.len() as u64
    }
}

impl std::fmt::Debug for Bitmaps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmaps")
            .field("path", &self.path)
            .field("key_count", &self.header.key_count)
            .field("bits_per_row", &self.codec.bits_per_row())
            .finish()
    }
}

/// Streams rows into a temp file next to the final location
///
/// Nothing is visible under the final name until the caller persists the
/// file returned by `finish`; dropping the writer removes the temp file.
pub struct BitmapWriter {
    writer: BufWriter<NamedTempFile>,
    header: ArtifactHeader,
    codec: BitPositions,
    hasher: crc32fast::Hasher,
    row_buf: Vec<u8>,
}

impl BitmapWriter {
    pub fn new(dir: &Path, bits_per_row: u64, range: StepRange) -> StorageResult<Self> {
        let header = ArtifactHeader::new(BITMAP_MAGIC, bits_per_row, range);
        let mut writer = BufWriter::new(artifact_temp(dir)?);
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            writer,
            header,
            codec: BitPositions::new(bits_per_row),
            hasher: crc32fast::Hasher::new(),
            row_buf: Vec::new(),
        })
    }

    /// Append the next row
    pub fn push_row(&mut self, buckets: &[u64]) -> StorageResult<()> {
        self.row_buf.clear();
        self.codec.encode_into(buckets, &mut self.row_buf)?;
        self.hasher.update(&self.row_buf);
        self.writer.write_all(&self.row_buf)?;
        self.header.key_count += 1;
        Ok(())
    }

    pub fn key_count(&self) -> u64 {
        self.header.key_count
    }

    /// Finalize the header and fsync; the caller decides where to persist
    pub fn finish(mut self) -> StorageResult<NamedTempFile> {
        self.header.body_crc = self.hasher.finalize();
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.header.to_bytes())?;

        let tmp = self.writer.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}
