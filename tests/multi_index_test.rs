//! Multi-index and multi-time-column behavior across the public API

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;
use tskv::catalog::IndexSpec;
use tskv::types::now_millis;
use tskv::{
    Dimension, DiskTable, EngineConfig, Partition, Table, TableBackend, TableMeta, TsDimension,
    TtlType, TtlValue,
};

const MINUTE: u64 = 60_000;

fn meta() -> TableMeta {
    TableMeta::new("tx", 2, 3)
        .with_index(IndexSpec::new("card").with_ts_columns(vec![1, 2]))
        .with_index(
            IndexSpec::new("mcc")
                .with_ts_columns(vec![1, 2])
                .with_ttl(TtlType::Absolute, TtlValue::absolute(10))
                .with_column_ttl(2, TtlValue::absolute(1)),
        )
        .with_index(
            IndexSpec::new("merchant").with_ttl(TtlType::LatestCount, TtlValue::latest(3)),
        )
}

fn tss(table: &dyn Table, idx: u32, ts_idx: Option<u32>, pk: &[u8]) -> Vec<u64> {
    let mut it = table.new_iterator_with_ts_idx(idx, ts_idx, pk).unwrap();
    it.seek_to_first();
    let mut out = Vec::new();
    while it.valid() {
        out.push(it.ts());
        it.next();
    }
    out
}

#[test]
fn test_per_column_ttl_and_recovery() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let now = now_millis();

    let partition = Partition::create(meta(), &config, TableBackend::Disk).unwrap();
    let put = |pk: &str, ts1: u64, ts2: u64| {
        partition
            .put_ts_dimensions(
                vec![Dimension::new(pk, 0), Dimension::new(pk, 1), Dimension::new(pk, 2)],
                vec![TsDimension::new(ts1, 1), TsDimension::new(ts2, 2)],
                format!("{}-{}", ts1, ts2).as_bytes(),
            )
            .unwrap()
    };
    put("a", now, now);
    put("a", now - 5 * MINUTE, now - 5 * MINUTE);
    put("a", now - 20 * MINUTE, now - 20 * MINUTE);

    let table = partition.table().as_ref();
    // column 1 keeps ten minutes, column 2 only one
    assert_eq!(tss(table, 1, Some(1), b"a"), vec![now, now - 5 * MINUTE]);
    assert_eq!(tss(table, 1, Some(2), b"a"), vec![now]);
    // card has no TTL, merchant keys carry the first ts dimension
    assert_eq!(tss(table, 0, Some(2), b"a").len(), 3);
    assert_eq!(tss(table, 2, None, b"a").len(), 3);

    let stats = table.sched_gc().unwrap();
    assert_eq!(stats.expired_ranges, 2);

    partition.make_snapshot(0).unwrap();
    drop(partition);

    let (partition, report) = Partition::open(meta(), &config, TableBackend::Disk).unwrap();
    assert_eq!(report.snapshot_offset, 3);
    let table = partition.table().as_ref();
    assert_eq!(tss(table, 1, Some(1), b"a"), vec![now, now - 5 * MINUTE]);
    assert_eq!(tss(table, 1, Some(2), b"a"), vec![now]);
    assert_eq!(tss(table, 0, Some(1), b"a").len(), 3);
}

#[test]
fn test_latest_count_traverse_over_random_writes() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let table = DiskTable::new(meta(), &config).unwrap();
    table.init().unwrap();

    let mut rng = rand::rngs::StdRng::seed_from_u64(7);
    let pks: Vec<String> = (0..20).map(|i| format!("m{:02}", i)).collect();
    let mut written = std::collections::BTreeMap::<String, Vec<u64>>::new();
    for _ in 0..200 {
        let pk = pks.choose(&mut rng).unwrap().clone();
        let ts = rng.gen_range(1..1_000_000u64);
        table
            .put_dimensions(ts, b"v", &[Dimension::new(pk.as_str(), 2)])
            .unwrap();
        written.entry(pk).or_default().push(ts);
    }

    let mut expected = Vec::new();
    for (pk, mut stamps) in written {
        stamps.sort_unstable_by(|a, b| b.cmp(a));
        stamps.dedup();
        for ts in stamps.into_iter().take(3) {
            expected.push((pk.clone().into_bytes(), ts));
        }
    }

    let mut it = table.new_traverse_iterator(2).unwrap();
    it.seek_to_first();
    let mut seen = Vec::new();
    while it.valid() {
        seen.push((it.pk().to_vec(), it.ts()));
        it.next();
    }
    assert_eq!(seen, expected);

    // resume in the middle of the scan
    let (pk, ts) = expected[4].clone();
    let mut it = table.new_traverse_iterator(2).unwrap();
    it.seek(&pk, ts);
    let mut rest = Vec::new();
    while it.valid() {
        rest.push((it.pk().to_vec(), it.ts()));
        it.next();
    }
    assert_eq!(rest, expected[5..].to_vec());

    // GC leaves exactly the traversed view behind
    table.sched_gc().unwrap();
    let mut entries = Vec::new();
    table
        .for_each_live_entry(&mut |entry| {
            if entry.idx == 2 {
                entries.push((entry.pk, entry.ts));
            }
            Ok(())
        })
        .unwrap();
    assert_eq!(entries, expected);
}

#[test]
fn test_checkpoint_is_isolated_from_later_writes() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let table = DiskTable::new(meta(), &config).unwrap();
    table.init().unwrap();
    table.put(b"a", 10, b"before").unwrap();

    let other = TempDir::new().unwrap();
    let restored_config = EngineConfig::for_testing(other.path());
    let target = restored_config.partition_path(2, 3).join("data");
    table.create_checkpoint(&target).unwrap();

    table.put(b"a", 11, b"after").unwrap();
    table.delete(b"a", 0).unwrap();

    let restored = DiskTable::new(meta(), &restored_config).unwrap();
    restored.load().unwrap();
    assert_eq!(
        restored.get_with_ts_idx(0, b"a", 10, Some(1)).unwrap(),
        Some(b"before".to_vec())
    );
    assert_eq!(restored.get_with_ts_idx(0, b"a", 11, Some(1)).unwrap(), None);
    assert!(table.get_with_ts_idx(0, b"a", 10, Some(1)).unwrap().is_none());
}

#[test]
fn test_deleted_index_is_skipped_on_write() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let partition = Partition::create(meta(), &config, TableBackend::Memory).unwrap();
    partition.delete_index("merchant").unwrap();

    partition
        .put_dimensions(5, b"v", vec![Dimension::new("c", 0), Dimension::new("m", 2)])
        .unwrap();
    let table = partition.table().as_ref();
    assert_eq!(table.get(0, b"c", 5).unwrap(), Some(b"v".to_vec()));
    assert!(table.get(2, b"m", 5).is_err());
    assert!(partition.delete(b"m", 2).is_err());
}

#[test]
fn test_concurrent_writes_keep_indexes_in_step() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let meta = TableMeta::new("pair", 4, 1)
        .with_index(IndexSpec::new("left"))
        .with_index(IndexSpec::new("right"));
    let table = Arc::new(DiskTable::new(meta, &config).unwrap());
    table.init().unwrap();
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..3)
        .map(|w| {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                for ts in 1..=200u64 {
                    let pk = format!("w{}-{}", w, ts % 7);
                    table
                        .put_dimensions(
                            ts,
                            &[0u8; 40],
                            &[Dimension::new(pk.as_str(), 0), Dimension::new(pk.as_str(), 1)],
                        )
                        .unwrap();
                }
            })
        })
        .collect();

    let reader = {
        let table = Arc::clone(&table);
        let done = Arc::clone(&done);
        thread::spawn(move || loop {
            let finished = done.load(Ordering::Acquire);
            // index 0 is scanned under an older snapshot than index 1, so
            // every entry it holds must already be in index 1
            let mut left = HashSet::new();
            let mut right = HashSet::new();
            table
                .for_each_live_entry(&mut |entry| {
                    let key = (entry.pk, entry.ts);
                    if entry.idx == 0 {
                        left.insert(key);
                    } else {
                        right.insert(key);
                    }
                    Ok(())
                })
                .unwrap();
            assert!(left.is_subset(&right), "{} left, {} right", left.len(), right.len());
            if finished {
                assert_eq!(left, right);
                return left.len();
            }
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert_eq!(reader.join().unwrap(), 600);
}
