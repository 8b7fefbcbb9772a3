//! Key block compression for segment files
//!
//! Sorted keys share long prefixes, so each block is front-coded before
//! it is handed to LZ4.
//!
//! Strategy:
//! 1. Keys arrive in ascending order
//! 2. Store for each key the length of the prefix shared with the previous key
//! 3. Store only the remaining suffix bytes
//! 4. Serialize to compact binary format (bincode)
//! 5. LZ4 compress the result

use crate::storage::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

/// Intermediate format for a front-coded key block
#[derive(Debug, Serialize, Deserialize)]
struct EncodedKeyBlock {
    /// Bytes shared with the previous key (0 for the first key)
    shared: Vec<u32>,
    /// Remaining bytes of each key
    suffixes: Vec<Vec<u8>>,
}

fn shared_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Compress a block of ascending keys using front coding + LZ4
pub fn compress_keys(keys: &[Vec<u8>]) -> StorageResult<Vec<u8>> {
    if keys.is_empty() {
        return Ok(Vec::new());
    }

    let mut shared = Vec::with_capacity(keys.len());
    let mut suffixes = Vec::with_capacity(keys.len());
    let mut prev: &[u8] = &[];

    for key in keys {
        let n = shared_prefix(prev, key);
        shared.push(n as u32);
        suffixes.push(key[n..].to_vec());
        prev = key;
    }

    let block = EncodedKeyBlock { shared, suffixes };

    let serialized =
        bincode::serialize(&block).map_err(|e| StorageError::Serialization(e.to_string()))?;

    Ok(lz4_flex::compress_prepend_size(&serialized))
}

/// Decompress a block back to its keys
pub fn decompress_keys(data: &[u8]) -> StorageResult<Vec<Vec<u8>>> {
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let decompressed = lz4_flex::decompress_size_prepended(data)
        .map_err(|e| StorageError::Compression(format!("LZ4 decompression failed: {}", e)))?;

    let block: EncodedKeyBlock = bincode::deserialize(&decompressed)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;

    if block.shared.len() != block.suffixes.len() {
        return Err(StorageError::Corruption(format!(
            "Key block has {} prefix lengths but {} suffixes",
            block.shared.len(),
            block.suffixes.len()
        )));
    }

    let mut keys: Vec<Vec<u8>> = Vec::with_capacity(block.suffixes.len());
    for (shared, suffix) in block.shared.into_iter().zip(block.suffixes) {
        let shared = shared as usize;
        let mut key = match keys.last() {
            Some(prev) if shared <= prev.len() => prev[..shared].to_vec(),
            None if shared == 0 => Vec::with_capacity(suffix.len()),
            _ => {
                return Err(StorageError::Corruption(format!(
                    "Key block prefix length {} exceeds previous key",
                    shared
                )))
            }
        };
        key.extend_from_slice(&suffix);
        keys.push(key);
    }

    Ok(keys)
}

/// Size of a key block before compression, for block sizing
pub fn raw_size(keys: &[Vec<u8>]) -> usize {
    keys.iter().map(|k| k.len() + 4).sum()
}
