//! End-to-end tests over file-backed key segments

use locality_index::index::{CancelFlag, First2, IdxLookup, LocalityConfig, LocalityIndex};
use locality_index::storage::{write_segment, KeySegment, SegmentSet, StepRange, StorageError};
use std::path::Path;

const AGG: u64 = 16;
const S: u64 = 32;

fn config(dir: &Path) -> LocalityConfig {
    LocalityConfig {
        aggregation_step: AGG,
        steps_in_biggest_file: S,
        ..LocalityConfig::new(dir.join("locality"), "accounts")
    }
}

fn key(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

/// Write one bucket-sized segment file holding `keys`
fn write_bucket(dir: &Path, bucket: u64, keys: impl Iterator<Item = u64>) {
    let range = StepRange::new(bucket * S, (bucket + 1) * S);
    let path = dir
        .join("segments")
        .join(KeySegment::file_name("accounts", range));
    write_segment(path, range, keys.map(key)).unwrap();
}

fn load_segments(dir: &Path) -> SegmentSet {
    SegmentSet::load_dir(&dir.join("segments")).unwrap()
}

/// Keys 1..=30 updated in buckets 0 and 1, plus a finer segment the index ignores
fn scenario(dir: &Path) -> (LocalityIndex, SegmentSet) {
    write_bucket(dir, 0, 1..=30);
    write_bucket(dir, 1, 1..=30);
    let fine = StepRange::new(2 * S, 2 * S + 4);
    write_segment(
        dir.join("segments").join(KeySegment::file_name("accounts", fine)),
        fine,
        [key(99)],
    )
    .unwrap();

    let segments = load_segments(dir);
    assert_eq!(segments.len(), 3);

    let index = LocalityIndex::open(config(dir)).unwrap();
    assert!(index
        .build_missed_indices(&segments, &CancelFlag::new())
        .unwrap());
    (index, segments)
}

#[test]
fn test_iterate_keys_locality() {
    let dir = tempfile::tempdir().unwrap();
    let (index, segments) = scenario(dir.path());
    let ctx = index.make_context(&segments);

    let items: Vec<(Vec<u8>, Vec<u64>)> = ctx
        .iterate_keys_locality(u64::MAX)
        .unwrap()
        .map(|item| item.unwrap())
        .collect();

    assert_eq!(items.len(), 30);
    assert_eq!(items[0], (key(1).to_vec(), vec![0, 1]));
    assert_eq!(items[1], (key(2).to_vec(), vec![0, 1]));
    assert_eq!(items.last().unwrap().0, key(30).to_vec());

    // restartable: a second scan sees the same keys
    assert_eq!(ctx.iterate_keys_locality(u64::MAX).unwrap().count(), 30);

    // bucket 1 starts at op S * AGG
    let first = ctx
        .iterate_keys_locality(S * AGG - 1)
        .unwrap()
        .next()
        .unwrap()
        .unwrap();
    assert_eq!(first, (key(1).to_vec(), vec![0]));
}

#[test]
fn test_at_and_first2_at() {
    let dir = tempfile::tempdir().unwrap();
    let (index, segments) = scenario(dir.path());
    let ctx = index.make_context(&segments);
    assert_eq!(ctx.key_count(), 30);

    assert_eq!(ctx.at(0).unwrap(), vec![0, 1]);
    assert_eq!(ctx.at(1).unwrap(), vec![0, 1]);
    for row in [30, 32, u64::MAX] {
        assert!(matches!(
            ctx.at(row),
            Err(StorageError::OutOfRange { key_count: 30, .. })
        ));
    }

    assert_eq!(
        ctx.first2_at(0, 1).unwrap(),
        First2 {
            first: 1,
            second: 0,
            has_first: true,
            has_second: false,
        }
    );
    assert_eq!(ctx.first2_at(0, 2).unwrap(), First2::default());

    // the bitmap reader is usable directly too
    let bm = ctx.bitmaps().unwrap();
    assert_eq!(bm.first2_at(5, 0).unwrap().second, 1);
}

#[test]
fn test_lookup_idx_files() {
    let dir = tempfile::tempdir().unwrap();
    let (index, segments) = scenario(dir.path());
    let ctx = index.make_context(&segments);

    let hit = index
        .lookup_idx_files(&ctx, &key(1), AGG * S)
        .unwrap();
    assert_eq!(
        hit,
        IdxLookup {
            v1: S,
            v2: 0,
            next_from_op_num: 2 * AGG * S,
            has_v1: true,
            has_v2: false,
        }
    );

    let hit = index.lookup_idx_files(&ctx, &key(1), 0).unwrap();
    assert_eq!(hit.v1, 0);
    assert_eq!(hit.v2, S);
    assert!(hit.has_v2);
    assert_eq!(hit.next_from_op_num, AGG * S);

    // key only present in the fine segment is unknown to the index
    let from = 5;
    assert_eq!(
        index.lookup_idx_files(&ctx, &key(99), from).unwrap(),
        IdxLookup::miss(from)
    );
    // past every bucket
    let from = 2 * AGG * S;
    assert_eq!(
        index.lookup_idx_files(&ctx, &key(1), from).unwrap(),
        IdxLookup::miss(from)
    );
}

#[test]
fn test_rebuild_is_noop_and_reopen_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let (index, segments) = scenario(dir.path());
    let rows_path = dir.path().join("locality/accounts.0-64.li");
    let before = std::fs::read(&rows_path).unwrap();

    assert!(!index
        .build_missed_indices(&segments, &CancelFlag::new())
        .unwrap());
    drop(index);

    let index = LocalityIndex::open(config(dir.path())).unwrap();
    assert!(index.is_current(&segments));
    assert_eq!(std::fs::read(&rows_path).unwrap(), before);
}

#[test]
fn test_stale_after_merge_then_rebuild() {
    let dir = tempfile::tempdir().unwrap();
    let (index, segments) = scenario(dir.path());
    let old_ctx = index.make_context(&segments);

    write_bucket(dir.path(), 2, [5, 31].into_iter());
    let merged = load_segments(dir.path());
    assert!(!index.is_current(&merged));
    assert!(index.make_context(&merged).is_stale());

    assert!(index
        .build_missed_indices(&merged, &CancelFlag::new())
        .unwrap());
    let ctx = index.make_context(&merged);
    assert!(!ctx.is_stale());
    assert_eq!(ctx.step_range(), Some(StepRange::new(0, 3 * S)));
    assert_eq!(ctx.key_count(), 31);

    let row = ctx.row_of(&key(5)).unwrap().unwrap();
    assert_eq!(ctx.at(row).unwrap(), vec![0, 1, 2]);
    let hit = ctx.lookup_idx_files(&key(31), 0).unwrap();
    assert_eq!(hit.v1, 2 * S);
    assert_eq!(hit.v2, S);
    assert!(!hit.has_v2);

    // the old context keeps its artifact until it is closed
    assert_eq!(old_ctx.key_count(), 30);
    assert!(dir.path().join("locality/accounts.0-64.lb").exists());
    old_ctx.close();
    assert!(!dir.path().join("locality/accounts.0-64.lb").exists());
}

#[test]
fn test_corrupted_artifact_is_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let (index, segments) = scenario(dir.path());
    drop(index);

    let path = dir.path().join("locality/accounts.0-64.lb");
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x80;
    std::fs::write(&path, &bytes).unwrap();

    let index = LocalityIndex::open(config(dir.path())).unwrap();
    assert_eq!(index.current_range(), None);
    assert!(!index.is_current(&segments));

    // a fresh build restores it
    assert!(index
        .build_missed_indices(&segments, &CancelFlag::new())
        .unwrap());
    assert_eq!(index.make_context(&segments).at(0).unwrap(), vec![0, 1]);
}

#[test]
fn test_unreadable_bucket_is_not_papered_over() {
    let dir = tempfile::tempdir().unwrap();
    let (index, _) = scenario(dir.path());
    write_bucket(dir.path(), 2, [1, 40].into_iter());
    let full = load_segments(dir.path());
    assert!(index.build_missed_indices(&full, &CancelFlag::new()).unwrap());

    // bucket 1 no longer opens, so the loaded set skips it
    let bucket1 = dir
        .path()
        .join("segments")
        .join(KeySegment::file_name("accounts", StepRange::new(S, 2 * S)));
    std::fs::remove_file(&bucket1).unwrap();
    std::fs::write(&bucket1, b"truncated").unwrap();
    let gapped = load_segments(dir.path());
    assert_eq!(gapped.coarse(S).len(), 2);
    assert_eq!(gapped.coarse_gap(S), Some(1));

    assert!(!index.is_current(&gapped));
    assert!(index.make_context(&gapped).is_stale());
    assert!(matches!(
        index.build_missed_indices(&gapped, &CancelFlag::new()),
        Err(StorageError::InvalidSegment(_))
    ));

    // the artifact built before the loss still sees key 1 in bucket 1
    assert_eq!(index.current_range(), Some(StepRange::new(0, 3 * S)));
    let hit = index
        .lookup_idx_files(&index.make_context(&full), &key(1), AGG * S)
        .unwrap();
    assert_eq!(hit.v1, S);
    assert_eq!(hit.v2, 2 * S);
    assert!(hit.has_v2);
}

#[test]
fn test_reopen_with_lower_bucket_ceiling() {
    let dir = tempfile::tempdir().unwrap();
    let (index, segments) = scenario(dir.path());
    write_bucket(dir.path(), 2, [3].into_iter());
    let merged = load_segments(dir.path());
    assert!(index.build_missed_indices(&merged, &CancelFlag::new()).unwrap());
    drop(index);

    let cfg = LocalityConfig {
        max_buckets: 2,
        ..config(dir.path())
    };
    let index = LocalityIndex::open(cfg).unwrap();
    assert_eq!(index.current_range(), None);
    assert!(index.make_context(&segments).at(0).is_err());
    assert!(!dir.path().join("locality/accounts.0-96.lb").exists());
}
