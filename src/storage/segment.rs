//! Key segment file format
//!
//! A key segment holds the sorted set of keys updated during one step range.
//! The locality index only ever needs the keys, so values are not stored.
//!
//! Layout:
//! ```text
//! ┌─────────────────────────────────────────┐
//! │ HEADER (64 bytes)                       │
//! │   magic: [u8; 4] = "LKSG"               │
//! │   version: u16                          │
//! │   block_count: u32                      │
//! │   key_count: u64                        │
//! │   from_step: u64                        │
//! │   to_step: u64                          │
//! │   reserved: [u8; 26]                    │
//! │   checksum: u32                         │
//! ├─────────────────────────────────────────┤
//! │ BLOCKS (variable)                       │
//! │   For each block:                       │
//! │     block_size: u32                     │
//! │     compressed_keys: [u8; block_size]   │
//! │     block_checksum: u32                 │
//! ├─────────────────────────────────────────┤
//! │ FOOTER                                  │
//! │   per block: offset u64, size u32,      │
//! │              key_count u32              │
//! │   footer_size: u32                      │
//! │   footer_checksum: u32                  │
//! └─────────────────────────────────────────┘
//! ```

use crate::storage::compression::{compress_keys, decompress_keys, raw_size};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{KeySource, KeyStream, StepRange};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Magic bytes for key segment identification
const SEGMENT_MAGIC: [u8; 4] = *b"LKSG";

/// Current segment format version
const SEGMENT_VERSION: u16 = 1;

/// Header size in bytes
const HEADER_SIZE: usize = 64;

/// Footer entry: offset(8) + size(4) + key_count(4)
const FOOTER_ENTRY_SIZE: usize = 16;

/// File extension of key segments
pub const SEGMENT_EXTENSION: &str = "kseg";

/// Key segment file header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub block_count: u32,
    pub key_count: u64,
    pub range: StepRange,
}

impl SegmentHeader {
    pub fn new(range: StepRange) -> Self {
        Self {
            magic: SEGMENT_MAGIC,
            version: SEGMENT_VERSION,
            block_count: 0,
            key_count: 0,
            range,
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..10].copy_from_slice(&self.block_count.to_le_bytes());
        buf[10..18].copy_from_slice(&self.key_count.to_le_bytes());
        buf[18..26].copy_from_slice(&self.range.from.to_le_bytes());
        buf[26..34].copy_from_slice(&self.range.to.to_le_bytes());
        // bytes 34-59 reserved

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());

        buf
    }

    /// Parse header from bytes
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> StorageResult<Self> {
        let stored_checksum = u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]);
        let computed_checksum = crc32fast::hash(&buf[0..60]);

        if stored_checksum != computed_checksum {
            return Err(StorageError::Corruption(format!(
                "Segment header checksum mismatch: stored={}, computed={}",
                stored_checksum, computed_checksum
            )));
        }

        let mut magic = [0u8; 4];
        magic.copy_from_slice(&buf[0..4]);

        if magic != SEGMENT_MAGIC {
            return Err(StorageError::InvalidSegment(format!(
                "Invalid magic: {:?}",
                magic
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > SEGMENT_VERSION {
            return Err(StorageError::InvalidSegment(format!(
                "Unsupported version: {}",
                version
            )));
        }

        Ok(Self {
            magic,
            version,
            block_count: read_u32(buf, 6),
            key_count: read_u64(buf, 10),
            range: StepRange::new(read_u64(buf, 18), read_u64(buf, 26)),
        })
    }
}

pub(crate) fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(word)
}

/// Metadata for a single key block within a segment
#[derive(Debug, Clone, Copy)]
pub struct BlockMeta {
    /// Offset from start of file
    pub offset: u64,
    /// Size of compressed data
    pub size: u32,
    /// Number of keys in this block
    pub key_count: u32,
}

/// A read-only key segment file
#[derive(Debug)]
pub struct KeySegment {
    pub path: PathBuf,
    pub header: SegmentHeader,
    pub blocks: Vec<BlockMeta>,
}

impl KeySegment {
    /// Conventional file name for a segment of `base` covering `range`
    pub fn file_name(base: &str, range: StepRange) -> String {
        format!("{}.{}.{}", base, range, SEGMENT_EXTENSION)
    }

    /// Open an existing segment file
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufReader::new(File::open(&path)?);

        let mut header_buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut header_buf)?;
        let header = SegmentHeader::from_bytes(&header_buf)?;

        let blocks = Self::read_footer(&mut file, &header)?;

        let counted: u64 = blocks.iter().map(|b| b.key_count as u64).sum();
        if counted != header.key_count {
            return Err(StorageError::Corruption(format!(
                "Segment {:?} header says {} keys, blocks hold {}",
                path, header.key_count, counted
            )));
        }

        Ok(Self {
            path,
            header,
            blocks,
        })
    }

    fn read_footer(
        file: &mut BufReader<File>,
        header: &SegmentHeader,
    ) -> StorageResult<Vec<BlockMeta>> {
        if header.block_count == 0 {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::End(-8))?;

        let mut tail = [0u8; 8];
        file.read_exact(&mut tail)?;
        let footer_size = read_u32(&tail, 0) as usize;
        let stored_checksum = read_u32(&tail, 4);

        if footer_size != header.block_count as usize * FOOTER_ENTRY_SIZE {
            return Err(StorageError::Corruption(format!(
                "Footer size {} does not match {} blocks",
                footer_size, header.block_count
            )));
        }

        file.seek(SeekFrom::End(-(footer_size as i64) - 8))?;
        let mut footer_data = vec![0u8; footer_size];
        file.read_exact(&mut footer_data)?;

        if crc32fast::hash(&footer_data) != stored_checksum {
            return Err(StorageError::Corruption("Footer checksum mismatch".into()));
        }

        let blocks = footer_data
            .chunks_exact(FOOTER_ENTRY_SIZE)
            .map(|entry| BlockMeta {
                offset: read_u64(entry, 0),
                size: read_u32(entry, 8),
                key_count: read_u32(entry, 12),
            })
            .collect();

        Ok(blocks)
    }

    /// Total key count
    pub fn key_count(&self) -> u64 {
        self.header.key_count
    }

    /// Read and decompress a specific block
    fn read_block(reader: &mut BufReader<File>, idx: usize, meta: &BlockMeta) -> StorageResult<Vec<Vec<u8>>> {
        reader.seek(SeekFrom::Start(meta.offset))?;

        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf)?;
        let size = u32::from_le_bytes(size_buf);
        if size != meta.size {
            return Err(StorageError::Corruption(format!(
                "Block {} size {} disagrees with footer ({})",
                idx, size, meta.size
            )));
        }

        let mut data = vec![0u8; size as usize];
        reader.read_exact(&mut data)?;

        let mut checksum_buf = [0u8; 4];
        reader.read_exact(&mut checksum_buf)?;
        if u32::from_le_bytes(checksum_buf) != crc32fast::hash(&data) {
            return Err(StorageError::Corruption(format!(
                "Block {} checksum mismatch",
                idx
            )));
        }

        let keys = decompress_keys(&data)?;
        if keys.len() != meta.key_count as usize {
            return Err(StorageError::Corruption(format!(
                "Block {} holds {} keys, footer says {}",
                idx,
                keys.len(),
                meta.key_count
            )));
        }
        Ok(keys)
    }
}

impl KeySource for KeySegment {
    fn step_range(&self) -> StepRange {
        self.header.range
    }

    fn keys(&self) -> StorageResult<KeyStream<'_>> {
        let reader = BufReader::new(File::open(&self.path)?);
        Ok(Box::new(SegmentKeys {
            reader,
            blocks: &self.blocks,
            next_block: 0,
            current: Vec::new().into_iter(),
            failed: false,
        }))
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

/// Lazy block-by-block key stream over a segment file
struct SegmentKeys<'a> {
    reader: BufReader<File>,
    blocks: &'a [BlockMeta],
    next_block: usize,
    current: std::vec::IntoIter<Vec<u8>>,
    failed: bool,
}

impl Iterator for SegmentKeys<'_> {
    type Item = StorageResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some(key) = self.current.next() {
                return Some(Ok(key));
            }
            let meta = self.blocks.get(self.next_block)?;
            match KeySegment::read_block(&mut self.reader, self.next_block, meta) {
                Ok(keys) => {
                    self.current = keys.into_iter();
                    self.next_block += 1;
                }
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

/// Streaming writer for key segments
///
/// Keys must be added in strictly ascending order. The file becomes
/// visible under its final name only in `finish`.
pub struct SegmentWriter {
    path: PathBuf,
    header: SegmentHeader,
    target_block_size: usize,
    buffer: Vec<Vec<u8>>,
    blocks: Vec<BlockMeta>,
    writer: BufWriter<NamedTempFile>,
    offset: u64,
    last_key: Option<Vec<u8>>,
}

impl SegmentWriter {
    pub fn create(path: impl AsRef<Path>, range: StepRange) -> StorageResult<Self> {
        let path = path.as_ref().to_path_buf();
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)?;

        let header = SegmentHeader::new(range);
        let mut writer = BufWriter::new(NamedTempFile::new_in(&parent)?);
        writer.write_all(&header.to_bytes())?;

        Ok(Self {
            path,
            header,
            target_block_size: 16 * 1024, // 16KB target
            buffer: Vec::new(),
            blocks: Vec::new(),
            writer,
            offset: HEADER_SIZE as u64,
            last_key: None,
        })
    }

    pub fn target_block_size(mut self, size: usize) -> Self {
        self.target_block_size = size.max(1);
        self
    }

    /// Add the next key
    pub fn add_key(&mut self, key: &[u8]) -> StorageResult<()> {
        if let Some(last) = &self.last_key {
            if key <= last.as_slice() {
                return Err(StorageError::InvalidSegment(format!(
                    "Keys must be strictly ascending: {:02x?} after {:02x?}",
                    key, last
                )));
            }
        }
        self.last_key = Some(key.to_vec());
        self.buffer.push(key.to_vec());

        if raw_size(&self.buffer) >= self.target_block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> StorageResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let keys = std::mem::take(&mut self.buffer);
        let compressed = compress_keys(&keys)?;
        let checksum = crc32fast::hash(&compressed);

        self.writer.write_all(&(compressed.len() as u32).to_le_bytes())?;
        self.writer.write_all(&compressed)?;
        self.writer.write_all(&checksum.to_le_bytes())?;

        self.blocks.push(BlockMeta {
            offset: self.offset,
            size: compressed.len() as u32,
            key_count: keys.len() as u32,
        });
        self.offset += compressed.len() as u64 + 8;
        self.header.key_count += keys.len() as u64;
        Ok(())
    }

    /// Write footer and header, then publish the file under its final name
    pub fn finish(mut self) -> StorageResult<KeySegment> {
        self.flush_block()?;
        self.header.block_count = self.blocks.len() as u32;

        if !self.blocks.is_empty() {
            let mut footer_data = Vec::with_capacity(self.blocks.len() * FOOTER_ENTRY_SIZE);
            for block in &self.blocks {
                footer_data.extend_from_slice(&block.offset.to_le_bytes());
                footer_data.extend_from_slice(&block.size.to_le_bytes());
                footer_data.extend_from_slice(&block.key_count.to_le_bytes());
            }
            let checksum = crc32fast::hash(&footer_data);
            self.writer.write_all(&footer_data)?;
            self.writer.write_all(&(footer_data.len() as u32).to_le_bytes())?;
            self.writer.write_all(&checksum.to_le_bytes())?;
        }

        self.writer.seek(SeekFrom::Start(0))?;
        self.writer.write_all(&self.header.to_bytes())?;

        let tmp = self.writer.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;

        Ok(KeySegment {
            path: self.path,
            header: self.header,
            blocks: self.blocks,
        })
    }
}

/// Write a whole segment from an ascending key iterator
pub fn write_segment<I, K>(path: impl AsRef<Path>, range: StepRange, keys: I) -> StorageResult<KeySegment>
where
    I: IntoIterator<Item = K>,
    K: AsRef<[u8]>,
{
    let mut writer = SegmentWriter::create(path, range)?;
    for key in keys {
        writer.add_key(key.as_ref())?;
    }
    writer.finish()
}
