//! Row assignment: key → dense row ordinal
//!
//! Keys are stored in ascending order, so the row of a key is its rank and
//! lookup is a binary search over the memory-mapped file. Assignment is
//! collision-free and deterministic for every key seen at build time; any
//! other key is simply not found.
//!
//! Layout:
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ HEADER (64 bytes, magic "LROW")               │
//! │   key_count, blob_len, step range, crc        │
//! ├───────────────────────────────────────────────┤
//! │ KEY BLOB: keys concatenated in row order      │
//! ├───────────────────────────────────────────────┤
//! │ OFFSETS: key_count + 1 × u64 into the blob    │
//! └───────────────────────────────────────────────┘
//! ```

use crate::index::header::{artifact_temp, ArtifactHeader, HEADER_SIZE};
use crate::storage::segment::read_u64;
use crate::storage::{StepRange, StorageError, StorageResult};
use memmap2::Mmap;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub(crate) const ROWS_MAGIC: [u8; 4] = *b"LROW";

/// Memory-mapped, read-only row assignment
pub struct KeyRows {
    path: PathBuf,
    mmap: Mmap,
    header: ArtifactHeader,
    offsets_start: usize,
}

impl KeyRows {
    /// Open and verify a row file
    ///
    /// Checks the body checksum, offset monotonicity and strict key order,
    /// so lookups afterwards cannot fail.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        // SAFETY: published artifact files are never written again; a rebuild
        // writes a new pair and only unlinks this one once no reader holds it
        let mmap = unsafe { Mmap::map(&file)? };

        let header = ArtifactHeader::from_bytes(&mmap, ROWS_MAGIC)?;
        let blob_len = header.width;
        let offsets_len = header
            .key_count
            .checked_add(1)
            .and_then(|n| n.checked_mul(8));

        let expected = offsets_len.and_then(|o| o.checked_add(blob_len));
        if expected != Some((mmap.len() - HEADER_SIZE) as u64) {
            return Err(StorageError::Corruption(format!(
                "row file {:?} is {} bytes, header describes {} keys in {} blob bytes",
                path,
                mmap.len(),
                header.key_count,
                blob_len
            )));
        }
        if crc32fast::hash(&mmap[HEADER_SIZE..]) != header.body_crc {
            return Err(StorageError::Corruption(format!(
                "row file {:?} body checksum mismatch",
                path
            )));
        }

        let rows = Self {
            path,
            offsets_start: HEADER_SIZE + blob_len as usize,
            mmap,
            header,
        };
        rows.validate()?;
        Ok(rows)
    }

    fn validate(&self) -> StorageResult<()> {
        if self.offset(0) != 0 || self.offset(self.header.key_count) != self.header.width {
            return Err(StorageError::Corruption(format!(
                "row file {:?} offsets do not span the key blob",
                self.path
            )));
        }

        let mut prev: Option<&[u8]> = None;
        for row in 0..self.header.key_count {
            let (start, end) = (self.offset(row), self.offset(row + 1));
            if end < start || end > self.header.width {
                return Err(StorageError::Corruption(format!(
                    "row file {:?} offsets out of order at row {}",
                    self.path, row
                )));
            }
            let key = self.key_unchecked(row);
            if let Some(p) = prev {
                if key <= p {
                    return Err(StorageError::Corruption(format!(
                        "row file {:?} keys not strictly ascending at row {}",
                        self.path, row
                    )));
                }
            }
            prev = Some(key);
        }
        Ok(())
    }

    fn offset(&self, i: u64) -> u64 {
        read_u64(&self.mmap, self.offsets_start + i as usize * 8)
    }

    fn key_unchecked(&self, row: u64) -> &[u8] {
        let start = HEADER_SIZE + self.offset(row) as usize;
        let end = HEADER_SIZE + self.offset(row + 1) as usize;
        &self.mmap[start..end]
    }

    /// Row ordinal of a key, if it was seen at build time
    pub fn row_of(&self, key: &[u8]) -> Option<u64> {
        let (mut lo, mut hi) = (0u64, self.header.key_count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.key_unchecked(mid).cmp(key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Some(mid),
            }
        }
        None
    }

    /// Key stored at a row
    pub fn key_at(&self, row: u64) -> StorageResult<&[u8]> {
        if row >= self.header.key_count {
            return Err(StorageError::OutOfRange {
                row,
                key_count: self.header.key_count,
            });
        }
        Ok(self.key_unchecked(row))
    }

    /// Keys in row order
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> + '_ {
        (0..self.header.key_count).map(move |row| self.key_unchecked(row))
    }

    pub fn key_count(&self) -> u64 {
        self.header.key_count
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

impl std::fmt::Debug for KeyRows {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRows")
            .field("path", &self.path)
            .field("key_count", &self.header.key_count)
            .finish()
    }
}

/// Assigns the next row ordinal to each key pushed, in ascending key order
pub struct RowsWriter {
    writer: BufWriter<NamedTempFile>,
    header: ArtifactHeader,
    hasher: crc32fast::Hasher,
    offsets: Vec<u64>,
    last_key: Option<Vec<u8>>,
}

impl RowsWriter {
    pub fn new(dir: &Path, range: StepRange) -> StorageResult<Self> {
        let header = ArtifactHeader::new(ROWS_MAGIC, 0, range);
        let mut writer = BufWriter::new(artifact_temp(dir)?);
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            writer,
            header,
            hasher: crc32fast::Hasher::new(),
            offsets: vec![0],
            last_key: None,
        })
    }

    /// Assign the next row to `key`, returning the row
    pub fn push_key(&mut self, key: &[u8]) -> StorageResult<u64> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(StorageError::InvalidSegment(format!(
                    "row keys must be strictly ascending: {:02x?} after {:02x?}",
                    key, last
                )));
            }
        }

        self.hasher.update(key);
        self.writer.write_all(key)?;
        self.header.width += key.len() as u64;
        self.offsets.push(self.header.width);
        self.last_key = Some(key.to_vec());

        let row = self.header.key_count;
        self.header.key_count += 1;
        Ok(row)
    }

    pub fn key_count(&self) -> u64 {
        self.header.key_count
    }

    /// Write the offset table and header, then fsync
    pub fn finish(mut self) -> StorageResult<NamedTempFile> {
        for offset in &self.offsets {
            let bytes = offset.to_le_bytes();
            self.hasher.update(&bytes);
            self.writer.write_all(&bytes)?;
        }

        self.header.body_crc = self.hasher.finalize();
        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.header.to_bytes())?;

        let tmp = self.writer.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        Ok(tmp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_rows(dir: &Path, keys: &[&[u8]]) -> PathBuf {
        let mut writer = RowsWriter::new(dir, StepRange::new(0, 64)).unwrap();
        for (i, key) in keys.iter().enumerate() {
            assert_eq!(writer.push_key(key).unwrap(), i as u64);
        }
        let path = dir.join("test.0-64.li");
        writer.finish().unwrap().persist(&path).unwrap();
        path
    }

    #[test]
    fn test_row_of() {
        let dir = tempdir().unwrap();
        let path = write_rows(dir.path(), &[b"a", b"ab", b"b", b"zz"]);

        let rows = KeyRows::open(&path).unwrap();
        assert_eq!(rows.key_count(), 4);
        assert_eq!(rows.row_of(b"a"), Some(0));
        assert_eq!(rows.row_of(b"ab"), Some(1));
        assert_eq!(rows.row_of(b"zz"), Some(3));
        assert_eq!(rows.row_of(b""), None);
        assert_eq!(rows.row_of(b"aa"), None);
        assert_eq!(rows.row_of(b"zzz"), None);

        assert_eq!(rows.key_at(2).unwrap(), b"b");
        assert!(matches!(
            rows.key_at(4),
            Err(StorageError::OutOfRange { row: 4, key_count: 4 })
        ));

        let keys: Vec<&[u8]> = rows.keys().collect();
        assert_eq!(
            keys,
            [b"a".as_slice(), b"ab".as_slice(), b"b".as_slice(), b"zz".as_slice()]
        );
    }

    #[test]
    fn test_empty_rows() {
        let dir = tempdir().unwrap();
        let path = write_rows(dir.path(), &[]);
        let rows = KeyRows::open(&path).unwrap();
        assert_eq!(rows.key_count(), 0);
        assert_eq!(rows.row_of(b"a"), None);
    }

    #[test]
    fn test_writer_rejects_unsorted() {
        let dir = tempdir().unwrap();
        let mut writer = RowsWriter::new(dir.path(), StepRange::new(0, 32)).unwrap();
        writer.push_key(b"b").unwrap();
        assert!(writer.push_key(b"b").is_err());
        assert!(writer.push_key(b"a").is_err());
        assert_eq!(writer.key_count(), 1);
    }

    #[test]
    fn test_corruption_detected() {
        let dir = tempdir().unwrap();
        let path = write_rows(dir.path(), &[b"k1", b"k2"]);

        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE + 1] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(KeyRows::open(&path).unwrap_err().is_corruption());
    }
}
