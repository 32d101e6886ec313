use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;
use tsdbe::wal::WalReader;
use tsdbe::{DataPoint, Row, StorageBuilder, WalSyncMode};

fn segment_files(data_path: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(data_path.join("wal"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".wal"))
        .collect();
    names.sort();
    names
}

#[test]
fn test_rows_survive_restart_without_flush() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = StorageBuilder::new()
            .with_data_path(temp_dir.path())
            .with_wal_sync_mode(WalSyncMode::PerAppend)
            .build()
            .unwrap();
        storage
            .insert_rows(&[
                Row::new("cpu", DataPoint::new(100, 1.0)),
                Row::new("mem", DataPoint::new(150, 2.0)),
            ])
            .unwrap();
        storage
            .insert_rows(&[Row::new("cpu", DataPoint::new(200, 3.0))])
            .unwrap();
        // Dropped without close: the rows only live in the WAL.
    }
    assert_eq!(segment_files(temp_dir.path()), vec!["000001.wal"]);

    let storage = StorageBuilder::new()
        .with_data_path(temp_dir.path())
        .build()
        .unwrap();

    assert_eq!(
        storage.select_rows("cpu", 0, 1_000),
        vec![DataPoint::new(100, 1.0), DataPoint::new(200, 3.0)]
    );
    assert_eq!(
        storage.select_rows("mem", 0, 1_000),
        vec![DataPoint::new(150, 2.0)]
    );

    // The replayed rows were re-logged into a new segment, the old one is gone.
    assert_eq!(segment_files(temp_dir.path()), vec!["000002.wal"]);
}

#[test]
fn test_recovery_does_not_duplicate_rows() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = StorageBuilder::new()
            .with_data_path(temp_dir.path())
            .build()
            .unwrap();
        storage
            .insert_rows(&[Row::new("cpu", DataPoint::new(1, 1.0))])
            .unwrap();
    }

    // Two restarts in a row replay the same row once.
    for _ in 0..2 {
        let storage = StorageBuilder::new()
            .with_data_path(temp_dir.path())
            .build()
            .unwrap();
        assert_eq!(storage.select_rows("cpu", 0, 10).len(), 1);
    }

    let storage = StorageBuilder::new()
        .with_data_path(temp_dir.path())
        .build()
        .unwrap();
    storage.close().unwrap();
    assert!(segment_files(temp_dir.path()).is_empty());

    let storage = StorageBuilder::new()
        .with_data_path(temp_dir.path())
        .build()
        .unwrap();
    assert_eq!(storage.select_rows("cpu", 0, 10).len(), 1);
}

#[test]
fn test_flushed_partition_segment_is_discarded() {
    let temp_dir = TempDir::new().unwrap();
    let storage = StorageBuilder::new()
        .with_data_path(temp_dir.path())
        .with_partition_duration(Duration::from_secs(1))
        .build()
        .unwrap();

    storage
        .insert_rows(&[
            Row::new("cpu", DataPoint::new(0, 1.0)),
            Row::new("cpu", DataPoint::new(1_000, 2.0)),
        ])
        .unwrap();
    storage
        .insert_rows(&[Row::new("cpu", DataPoint::new(2_000, 3.0))])
        .unwrap();
    assert_eq!(segment_files(temp_dir.path()).len(), 2);

    storage.flush_rows().unwrap();
    assert_eq!(segment_files(temp_dir.path()), vec!["000002.wal"]);

    let recovered = WalReader::new(temp_dir.path().join("wal"))
        .read_all()
        .unwrap();
    assert_eq!(
        recovered.rows,
        vec![Row::new("cpu", DataPoint::new(2_000, 3.0))]
    );
}

#[test]
fn test_disabled_wal_loses_unflushed_rows() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = StorageBuilder::new()
            .with_data_path(temp_dir.path())
            .with_wal_enabled(false)
            .build()
            .unwrap();
        storage
            .insert_rows(&[Row::new("cpu", DataPoint::new(1, 1.0))])
            .unwrap();
    }
    assert!(!temp_dir.path().join("wal").exists());

    let storage = StorageBuilder::new()
        .with_data_path(temp_dir.path())
        .with_wal_enabled(false)
        .build()
        .unwrap();
    assert!(storage.select_rows("cpu", 0, 10).is_empty());
}

#[test]
fn test_close_without_wal_still_persists() {
    let temp_dir = TempDir::new().unwrap();
    {
        let storage = StorageBuilder::new()
            .with_data_path(temp_dir.path())
            .with_wal_enabled(false)
            .build()
            .unwrap();
        storage
            .insert_rows(&[Row::new("cpu", DataPoint::new(1, 1.0))])
            .unwrap();
        storage.close().unwrap();
    }

    let storage = StorageBuilder::new()
        .with_data_path(temp_dir.path())
        .with_wal_enabled(false)
        .build()
        .unwrap();
    assert_eq!(
        storage.select_rows("cpu", 0, 10),
        vec![DataPoint::new(1, 1.0)]
    );
}
