//! Merge scan over coarse segments
//!
//! Visits every key of the bucket-sized segments once, in global ascending
//! order, and yields it together with the ascending list of buckets it
//! appears in:
//!
//! ```text
//! bucket 0: k1 k2    k4
//! bucket 1: k1    k3 k4
//!           ↓
//! (k1,[0,1]) (k2,[0]) (k3,[1]) (k4,[0,1])
//! ```
//!
//! The builder consumes this stream to assign rows; the query context
//! exposes it as `iterate_keys_locality`.

use crate::index::builder::CancelFlag;
use crate::storage::{KeySource, KeyStream, StorageError, StorageResult};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

/// One stream per bucket; heap entries are `(key, stream index)`
pub struct LocalityIterator<'a> {
    buckets: Vec<u64>,
    streams: Vec<KeyStream<'a>>,
    last: Vec<Option<Vec<u8>>>,
    heap: BinaryHeap<Reverse<(Vec<u8>, usize)>>,
    failed: bool,
}

impl<'a> LocalityIterator<'a> {
    /// Open a stream for every coarse segment whose first op number is `<= max_tx_num`
    ///
    /// `segments` must be bucket-sized and ordered by bucket (see
    /// `SegmentSet::coarse`). The cancel flag is polled before each
    /// bucket's stream is opened.
    pub fn new(
        segments: &'a [Arc<dyn KeySource>],
        steps_in_biggest_file: u64,
        aggregation_step: u64,
        max_tx_num: u64,
        cancel: Option<&CancelFlag>,
    ) -> StorageResult<Self> {
        let mut iter = Self {
            buckets: Vec::with_capacity(segments.len()),
            streams: Vec::with_capacity(segments.len()),
            last: Vec::with_capacity(segments.len()),
            heap: BinaryHeap::with_capacity(segments.len()),
            failed: false,
        };

        for segment in segments {
            if cancel.map(|c| c.is_cancelled()).unwrap_or(false) {
                return Err(StorageError::Cancelled);
            }

            let range = segment.step_range();
            if range.from.saturating_mul(aggregation_step) > max_tx_num {
                continue;
            }

            let idx = iter.streams.len();
            iter.buckets.push(range.bucket(steps_in_biggest_file));
            iter.streams.push(segment.keys()?);
            iter.last.push(None);
            iter.advance(idx)?;
        }

        Ok(iter)
    }

    /// Buckets whose streams take part in this scan
    pub fn buckets(&self) -> &[u64] {
        &self.buckets
    }

    /// Pull the next key of one stream into the heap
    fn advance(&mut self, idx: usize) -> StorageResult<()> {
        let key = match self.streams[idx].next() {
            None => return Ok(()),
            Some(key) => key?,
        };

        if let Some(prev) = &self.last[idx] {
            if key <= *prev {
                return Err(StorageError::InvalidSegment(format!(
                    "bucket {} keys out of order: {:02x?} after {:02x?}",
                    self.buckets[idx], key, prev
                )));
            }
        }
        self.last[idx] = Some(key.clone());
        self.heap.push(Reverse((key, idx)));
        Ok(())
    }
}

impl Iterator for LocalityIterator<'_> {
    type Item = StorageResult<(Vec<u8>, Vec<u64>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }

        let Reverse((key, idx)) = self.heap.pop()?;
        // Ties pop in stream order, and streams are in bucket order,
        // so `buckets` comes out ascending.
        let mut buckets = vec![self.buckets[idx]];
        let mut to_advance = vec![idx];

        while let Some(Reverse((next_key, _))) = self.heap.peek() {
            if *next_key != key {
                break;
            }
            if let Some(Reverse((_, j))) = self.heap.pop() {
                buckets.push(self.buckets[j]);
                to_advance.push(j);
            }
        }

        for j in to_advance {
            if let Err(e) = self.advance(j) {
                self.failed = true;
                return Some(Err(e));
            }
        }

        Some(Ok((key, buckets)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemSegment, StepRange};

    fn seg(bucket: u64, keys: &[u64]) -> Arc<dyn KeySource> {
        Arc::new(MemSegment::from_u64s(
            StepRange::new(bucket * 32, (bucket + 1) * 32),
            keys.iter().copied(),
        ))
    }

    fn collect(iter: LocalityIterator<'_>) -> Vec<(u64, Vec<u64>)> {
        iter.map(|item| {
            let (key, buckets) = item.unwrap();
            let mut k = [0u8; 8];
            k.copy_from_slice(&key);
            (u64::from_be_bytes(k), buckets)
        })
        .collect()
    }

    #[test]
    fn test_merge_coalesces_buckets() {
        let segments = vec![seg(0, &[1, 2, 4]), seg(1, &[1, 3, 4])];
        let iter = LocalityIterator::new(&segments, 32, 10, u64::MAX, None).unwrap();
        assert_eq!(iter.buckets(), &[0, 1]);

        assert_eq!(
            collect(iter),
            vec![
                (1, vec![0, 1]),
                (2, vec![0]),
                (3, vec![1]),
                (4, vec![0, 1])
            ]
        );
    }

    #[test]
    fn test_max_tx_num_filters_buckets() {
        let segments = vec![seg(0, &[1, 2]), seg(1, &[1, 3]), seg(2, &[5])];

        // bucket 1 starts at op 32 * 10 = 320
        let iter = LocalityIterator::new(&segments, 32, 10, 319, None).unwrap();
        assert_eq!(collect(iter), vec![(1, vec![0]), (2, vec![0])]);

        let iter = LocalityIterator::new(&segments, 32, 10, 320, None).unwrap();
        assert_eq!(
            collect(iter),
            vec![(1, vec![0, 1]), (2, vec![0]), (3, vec![1])]
        );
    }

    #[test]
    fn test_gap_in_buckets() {
        let segments = vec![seg(0, &[7]), seg(3, &[7, 8])];
        let iter = LocalityIterator::new(&segments, 32, 1, u64::MAX, None).unwrap();
        assert_eq!(collect(iter), vec![(7, vec![0, 3]), (8, vec![3])]);
    }

    #[test]
    fn test_empty_input() {
        let segments: Vec<Arc<dyn KeySource>> = Vec::new();
        let mut iter = LocalityIterator::new(&segments, 32, 1, u64::MAX, None).unwrap();
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_cancelled_before_open() {
        let segments = vec![seg(0, &[1])];
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = LocalityIterator::new(&segments, 32, 1, u64::MAX, Some(&cancel))
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::Cancelled));
    }

    struct Unsorted;

    impl KeySource for Unsorted {
        fn step_range(&self) -> StepRange {
            StepRange::new(0, 32)
        }

        fn keys(&self) -> StorageResult<KeyStream<'_>> {
            Ok(Box::new(
                vec![b"b".to_vec(), b"a".to_vec()].into_iter().map(Ok),
            ))
        }
    }

    #[test]
    fn test_out_of_order_stream_fails_once() {
        let segments: Vec<Arc<dyn KeySource>> = vec![Arc::new(Unsorted)];
        let mut iter = LocalityIterator::new(&segments, 32, 1, u64::MAX, None).unwrap();

        assert!(matches!(
            iter.next(),
            Some(Err(StorageError::InvalidSegment(_)))
        ));
        assert!(iter.next().is_none());
    }
}
