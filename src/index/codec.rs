//! Bit positions codec
//!
//! Turns a sorted, duplicate-free set of bucket indices into a fixed-width
//! row and back. Every row of a bitmap file has the same width: enough
//! little-endian `u64` words to hold `bits_per_row` bits. Bucket `b` is bit
//! `b % 64` of word `b / 64`.
//!
//! ```text
//! bits_per_row = 70, buckets = {0, 1, 65}
//!
//!   word 0: ...0011        word 1: ...0000010
//!           ^^ buckets 0,1         ^ bucket 65   (bits 70..127 must stay zero)
//! ```

use crate::storage::{StorageError, StorageResult};
use serde::Serialize;

/// Bytes per bitmap word
pub const WORD_BYTES: usize = 8;

/// Result of a forward search: the two smallest buckets `>= from`
///
/// `has_first == false` implies `first == 0` and `has_second == false`;
/// `has_second == false` implies `second == 0`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct First2 {
    pub first: u64,
    pub second: u64,
    pub has_first: bool,
    pub has_second: bool,
}

impl First2 {
    fn from_hits(hits: &[u64]) -> Self {
        match *hits {
            [] => Self::default(),
            [first] => Self {
                first,
                has_first: true,
                ..Self::default()
            },
            [first, second, ..] => Self {
                first,
                second,
                has_first: true,
                has_second: true,
            },
        }
    }
}

/// Fixed-width row codec for one bucket-count ceiling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitPositions {
    bits_per_row: u64,
}

impl BitPositions {
    pub fn new(bits_per_row: u64) -> Self {
        Self { bits_per_row }
    }

    /// Bucket-count ceiling: every stored bucket is `< bits_per_row`
    pub fn bits_per_row(&self) -> u64 {
        self.bits_per_row
    }

    pub fn words_per_row(&self) -> usize {
        self.bits_per_row.div_ceil(64) as usize
    }

    /// Encoded size of one row in bytes
    pub fn row_bytes(&self) -> usize {
        self.words_per_row() * WORD_BYTES
    }

    /// Encode a bucket set into a fresh row
    pub fn encode(&self, buckets: &[u64]) -> StorageResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.row_bytes());
        self.encode_into(buckets, &mut out)?;
        Ok(out)
    }

    /// Encode a bucket set, appending the row to `out`
    ///
    /// Fails without touching `out` if the set is unsorted, has duplicates,
    /// or holds a bucket at or past the ceiling.
    pub fn encode_into(&self, buckets: &[u64], out: &mut Vec<u8>) -> StorageResult<()> {
        let mut words = vec![0u64; self.words_per_row()];
        let mut prev: Option<u64> = None;

        for &bucket in buckets {
            if let Some(p) = prev {
                if bucket <= p {
                    return Err(StorageError::InvalidBucketSet(format!(
                        "bucket {} follows {}; buckets must be strictly increasing",
                        bucket, p
                    )));
                }
            }
            if bucket >= self.bits_per_row {
                return Err(StorageError::InvalidBucketSet(format!(
                    "bucket {} beyond ceiling {}",
                    bucket, self.bits_per_row
                )));
            }
            words[(bucket / 64) as usize] |= 1u64 << (bucket % 64);
            prev = Some(bucket);
        }

        out.reserve(self.row_bytes());
        for word in words {
            out.extend_from_slice(&word.to_le_bytes());
        }
        Ok(())
    }

    /// Decode a row into its ascending bucket indices
    pub fn decode(&self, row: &[u8]) -> StorageResult<Vec<u64>> {
        self.check_row(row)?;

        let mut buckets = Vec::new();
        for i in 0..self.words_per_row() {
            let mut word = word_at(row, i);
            while word != 0 {
                buckets.push(i as u64 * 64 + word.trailing_zeros() as u64);
                word &= word - 1;
            }
        }
        Ok(buckets)
    }

    /// Two smallest buckets `>= from`, scanning only the words from `from / 64` on
    pub fn first2(&self, row: &[u8], from: u64) -> StorageResult<First2> {
        self.check_row(row)?;
        if from >= self.bits_per_row {
            return Ok(First2::default());
        }

        let mut hits = [0u64; 2];
        let mut n = 0;
        let start = (from / 64) as usize;

        for i in start..self.words_per_row() {
            let mut word = word_at(row, i);
            if i == start {
                word &= !0u64 << (from % 64);
            }
            while word != 0 && n < 2 {
                hits[n] = i as u64 * 64 + word.trailing_zeros() as u64;
                n += 1;
                word &= word - 1;
            }
            if n == 2 {
                break;
            }
        }

        Ok(First2::from_hits(&hits[..n]))
    }

    /// Number of buckets set in a row
    pub fn count(&self, row: &[u8]) -> StorageResult<u64> {
        self.check_row(row)?;
        Ok((0..self.words_per_row())
            .map(|i| word_at(row, i).count_ones() as u64)
            .sum())
    }

    /// Length and padding checks shared by every read
    fn check_row(&self, row: &[u8]) -> StorageResult<()> {
        if row.len() != self.row_bytes() {
            return Err(StorageError::Corruption(format!(
                "bitmap row is {} bytes, expected {}",
                row.len(),
                self.row_bytes()
            )));
        }

        let tail = self.bits_per_row % 64;
        if tail != 0 {
            let last = word_at(row, self.words_per_row() - 1);
            if last & (!0u64 << tail) != 0 {
                return Err(StorageError::Corruption(format!(
                    "bitmap row has buckets beyond ceiling {}",
                    self.bits_per_row
                )));
            }
        }
        Ok(())
    }
}

fn word_at(row: &[u8], i: usize) -> u64 {
    let mut word = [0u8; WORD_BYTES];
    word.copy_from_slice(&row[i * WORD_BYTES..(i + 1) * WORD_BYTES]);
    u64::from_le_bytes(word)
}
