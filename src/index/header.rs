//! Fixed 64-byte header shared by both locality artifact files
//!
//! ```text
//! magic: [u8; 4]      0..4
//! version: u16        4..6
//! key_count: u64      6..14
//! width: u64          14..22   bits per row (bitmap) / key blob length (rows)
//! from_step: u64      22..30
//! to_step: u64        30..38
//! body_crc: u32       38..42
//! reserved            42..60
//! header_crc: u32     60..64
//! ```

use crate::storage::segment::{read_u32, read_u64};
use crate::storage::{StepRange, StorageError, StorageResult};
use std::path::Path;
use tempfile::NamedTempFile;

pub(crate) const HEADER_SIZE: usize = 64;

/// Prefix and suffix of in-flight artifact files
pub(crate) const TEMP_PREFIX: &str = ".locality-";
pub(crate) const TEMP_SUFFIX: &str = ".tmp";

/// Temp file in the artifact directory, removed on drop unless persisted
pub(crate) fn artifact_temp(dir: &Path) -> std::io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
}

/// Current artifact format version
pub(crate) const ARTIFACT_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArtifactHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub key_count: u64,
    pub width: u64,
    pub range: StepRange,
    pub body_crc: u32,
}

impl ArtifactHeader {
    pub fn new(magic: [u8; 4], width: u64, range: StepRange) -> Self {
        Self {
            magic,
            version: ARTIFACT_VERSION,
            key_count: 0,
            width,
            range,
            body_crc: 0,
        }
    }

    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];

        buf[0..4].copy_from_slice(&self.magic);
        buf[4..6].copy_from_slice(&self.version.to_le_bytes());
        buf[6..14].copy_from_slice(&self.key_count.to_le_bytes());
        buf[14..22].copy_from_slice(&self.width.to_le_bytes());
        buf[22..30].copy_from_slice(&self.range.from.to_le_bytes());
        buf[30..38].copy_from_slice(&self.range.to.to_le_bytes());
        buf[38..42].copy_from_slice(&self.body_crc.to_le_bytes());

        let checksum = crc32fast::hash(&buf[0..60]);
        buf[60..64].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Parse and validate a header read from the front of an artifact file
    pub fn from_bytes(buf: &[u8], magic: [u8; 4]) -> StorageResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StorageError::Corruption(format!(
                "artifact is {} bytes, shorter than its header",
                buf.len()
            )));
        }

        let stored = read_u32(buf, 60);
        let computed = crc32fast::hash(&buf[0..60]);
        if stored != computed {
            return Err(StorageError::Corruption(format!(
                "artifact header checksum mismatch: stored={}, computed={}",
                stored, computed
            )));
        }

        if buf[0..4] != magic {
            return Err(StorageError::Corruption(format!(
                "invalid artifact magic {:?}, expected {:?}",
                &buf[0..4],
                magic
            )));
        }

        let version = u16::from_le_bytes([buf[4], buf[5]]);
        if version > ARTIFACT_VERSION {
            return Err(StorageError::Corruption(format!(
                "unsupported artifact version {}",
                version
            )));
        }

        Ok(Self {
            magic,
            version,
            key_count: read_u64(buf, 6),
            width: read_u64(buf, 14),
            range: StepRange::new(read_u64(buf, 22), read_u64(buf, 30)),
            body_crc: read_u32(buf, 38),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let mut header = ArtifactHeader::new(*b"TEST", 70, StepRange::new(0, 64));
        header.key_count = 31;
        header.body_crc = 0xdead_beef;

        let bytes = header.to_bytes();
        assert_eq!(ArtifactHeader::from_bytes(&bytes, *b"TEST").unwrap(), header);
    }

    #[test]
    fn test_header_wrong_magic() {
        let bytes = ArtifactHeader::new(*b"TEST", 1, StepRange::new(0, 32)).to_bytes();
        assert!(ArtifactHeader::from_bytes(&bytes, *b"NOPE")
            .unwrap_err()
            .is_corruption());
    }

    #[test]
    fn test_header_truncated() {
        let bytes = ArtifactHeader::new(*b"TEST", 1, StepRange::new(0, 32)).to_bytes();
        assert!(ArtifactHeader::from_bytes(&bytes[..40], *b"TEST")
            .unwrap_err()
            .is_corruption());
    }
}
