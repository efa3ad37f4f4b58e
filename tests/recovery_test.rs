//! End-to-end snapshot + binlog recovery

use std::path::Path;
use tempfile::TempDir;
use tskv::catalog::IndexSpec;
use tskv::durability::binlog::{segment_path, BinlogRecord};
use tskv::storage::{FrameReader, ReadOutcome};
use tskv::table::TableEntry;
use tskv::{
    Dimension, EngineConfig, MemTable, Partition, StorageError, Table, TableBackend, TableMeta,
};

fn meta() -> TableMeta {
    TableMeta::new("t1", 1, 0)
        .with_index(IndexSpec::new("card"))
        .with_index(IndexSpec::new("mcc"))
}

fn entries(table: &dyn Table) -> Vec<TableEntry> {
    let mut out = Vec::new();
    table
        .for_each_live_entry(&mut |entry| {
            out.push(entry);
            Ok(())
        })
        .unwrap();
    out
}

fn values(table: &dyn Table, pk: &[u8], seek: u64) -> Vec<Vec<u8>> {
    let mut it = table.new_iterator(0, pk).unwrap();
    it.seek(seek);
    let mut out = Vec::new();
    while it.valid() {
        out.push(it.value().to_vec());
        it.next();
    }
    out
}

/// Drop the partition without sealing its binlog segment
fn crash(partition: Partition) {
    std::mem::forget(partition);
}

fn write_keys(partition: &Partition, pk: &str) {
    for i in 0..10u64 {
        partition
            .put(pk.as_bytes(), i, format!("value{}", i).as_bytes())
            .unwrap();
    }
}

#[test]
fn test_snapshot_then_binlog_recovery() {
    for backend in [TableBackend::Disk, TableBackend::Memory] {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::for_testing(dir.path());

        let partition = Partition::create(meta(), &config, backend).unwrap();
        write_keys(&partition, "key");
        assert_eq!(partition.make_snapshot(0).unwrap(), 10);
        write_keys(&partition, "key2");
        crash(partition);

        let (partition, report) = Partition::open(meta(), &config, backend).unwrap();
        assert_eq!(report.snapshot_offset, 10);
        assert_eq!(report.latest_offset, 20);
        assert_eq!(partition.table().offset(), 20);

        let table = partition.table().as_ref();
        assert_eq!(
            values(table, b"key", 1),
            vec![b"value1".to_vec(), b"value0".to_vec()]
        );
        assert_eq!(values(table, b"key2", 9).len(), 10);

        assert_eq!(partition.put(b"key3", 1, b"v").unwrap(), 21);
    }
}

#[test]
fn test_recovery_matches_direct_application() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let direct = MemTable::new(meta(), config.max_traverse_cnt).unwrap();
    direct.init().unwrap();

    let partition = Partition::create(meta(), &config, TableBackend::Disk).unwrap();
    for i in 0..30u64 {
        let dims = vec![
            Dimension::new(format!("card{}", i % 4), 0),
            Dimension::new(format!("mcc{}", i % 3), 1),
        ];
        partition.put_dimensions(100 + i, b"tx", dims.clone()).unwrap();
        direct.put_dimensions(100 + i, b"tx", &dims).unwrap();
        if i == 12 {
            partition.make_snapshot(0).unwrap();
        }
        if i == 20 {
            partition.delete(b"card1", 0).unwrap();
            direct.delete(b"card1", 0).unwrap();
            partition.roll_binlog().unwrap();
        }
    }
    crash(partition);

    let (first, report) = Partition::open(meta(), &config, TableBackend::Disk).unwrap();
    assert_eq!(report.latest_offset, 31);
    assert_eq!(entries(first.table().as_ref()), entries(&direct));
    drop(first);

    // recovering again from the same files gives the same state
    let (second, again) = Partition::open(meta(), &config, TableBackend::Disk).unwrap();
    assert_eq!(again, report);
    assert_eq!(entries(second.table().as_ref()), entries(&direct));
}

#[test]
fn test_watermark_regression_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let partition = Partition::create(meta(), &config, TableBackend::Memory).unwrap();
    write_keys(&partition, "key");

    partition.make_snapshot(0).unwrap();
    assert!(matches!(
        partition.make_snapshot(5),
        Err(StorageError::InvalidState(_))
    ));
    let manifest = partition.snapshot().manifest().unwrap().unwrap();
    assert_eq!(manifest.offset, 10);
    assert_eq!(manifest.count, 10);

    for _ in 0..3 {
        partition.make_snapshot(0).unwrap();
    }
    assert_eq!(partition.make_snapshot(12).unwrap(), 12);
    let files = std::fs::read_dir(partition.snapshot().dir())
        .unwrap()
        .filter(|e| e.as_ref().unwrap().path().extension().map_or(false, |x| x == "sdb"))
        .count();
    assert!(files <= 2);
}

fn truncate(path: &Path, by: u64) {
    let len = std::fs::metadata(path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(path).unwrap();
    file.set_len(len - by).unwrap();
}

#[test]
fn test_torn_binlog_tail_keeps_prefix() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let partition = Partition::create(meta(), &config, TableBackend::Memory).unwrap();
    write_keys(&partition, "key");
    let binlog_dir = partition.binlog().dir().to_path_buf();
    crash(partition);

    truncate(&segment_path(&binlog_dir, 0), 2);
    let (partition, report) = Partition::open(meta(), &config, TableBackend::Memory).unwrap();
    assert_eq!(report.latest_offset, 9);
    assert_eq!(values(partition.table().as_ref(), b"key", 9).len(), 9);

    // new writes go to a fresh segment and continue the offsets
    assert_eq!(partition.put(b"key", 10, b"value10").unwrap(), 10);
    drop(partition);
    let (_partition, report) = Partition::open(meta(), &config, TableBackend::Memory).unwrap();
    assert_eq!(report.latest_offset, 10);
}

/// Byte offset of the frame holding binlog entry `log_index`
fn entry_frame_offset(path: &Path, log_index: u64) -> u64 {
    let mut reader = FrameReader::open(path).unwrap();
    loop {
        let offset = reader.offset();
        match reader.read_next::<BinlogRecord>().unwrap() {
            ReadOutcome::Record(BinlogRecord::Entry(entry)) if entry.log_index == log_index => {
                return offset
            }
            ReadOutcome::Record(_) => {}
            _ => panic!("entry {} not found in {}", log_index, path.display()),
        }
    }
}

#[test]
fn test_damaged_sealed_segment_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let partition = Partition::create(meta(), &config, TableBackend::Memory).unwrap();
    for i in 1..=5u64 {
        partition.put(b"key", i, b"old").unwrap();
    }
    partition.roll_binlog().unwrap();
    for i in 6..=8u64 {
        partition.put(b"key", i, b"new").unwrap();
    }
    let binlog_dir = partition.binlog().dir().to_path_buf();
    crash(partition);

    // cut the sealed segment inside entry 4, entries 4 and 5 are gone
    let sealed = segment_path(&binlog_dir, 0);
    let cut = entry_frame_offset(&sealed, 4) + 3;
    let file = std::fs::OpenOptions::new().write(true).open(&sealed).unwrap();
    file.set_len(cut).unwrap();
    drop(file);

    assert!(matches!(
        Partition::open(meta(), &config, TableBackend::Memory),
        Err(StorageError::Corruption(_))
    ));
}

#[test]
fn test_missing_segment_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let partition = Partition::create(meta(), &config, TableBackend::Memory).unwrap();
    write_keys(&partition, "key");
    partition.roll_binlog().unwrap();
    write_keys(&partition, "key2");
    let binlog_dir = partition.binlog().dir().to_path_buf();
    drop(partition);

    std::fs::remove_file(segment_path(&binlog_dir, 0)).unwrap();
    assert!(matches!(
        Partition::open(meta(), &config, TableBackend::Memory),
        Err(StorageError::Corruption(_))
    ));
}

#[test]
fn test_corrupt_manifest_is_fatal() {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::for_testing(dir.path());
    let partition = Partition::create(meta(), &config, TableBackend::Memory).unwrap();
    write_keys(&partition, "key");
    partition.make_snapshot(0).unwrap();
    let snapshot_dir = partition.snapshot().dir().to_path_buf();
    drop(partition);

    std::fs::write(snapshot_dir.join("MANIFEST"), "offset: ten\n").unwrap();
    assert!(matches!(
        Partition::open(meta(), &config, TableBackend::Memory),
        Err(StorageError::Corruption(_))
    ));
}
