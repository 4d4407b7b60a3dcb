//! Crash scenarios for the page file
//!
//! A flush must leave the file either entirely before or entirely after
//! the batch, whatever point the process died at.

use brokerstore_storage::{PageFile, PageFileConfig, PageId};
use proptest::prelude::*;
use std::collections::BTreeMap;
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> PageFile {
    PageFile::open(dir, PageFileConfig::for_testing()).unwrap()
}

/// Commit `values` one page each and flush. Returns the page ids.
fn write_entities(file: &PageFile, values: &[String]) -> Vec<PageId> {
    let mut tx = file.tx();
    let mut ids = Vec::new();
    for value in values {
        let id = tx.allocate().unwrap();
        tx.store(id, value).unwrap();
        ids.push(id);
    }
    tx.commit().unwrap();
    file.flush().unwrap();
    ids
}

// === Redo Scenarios ===

#[test]
fn scenario_crash_after_redo_written() {
    let dir = tempdir().unwrap();
    let ids;
    {
        let file = open(dir.path());
        ids = write_entities(&file, &["a".to_string(), "b".to_string()]);

        let mut tx = file.tx();
        tx.store(ids[0], &"a2".to_string()).unwrap();
        tx.store(ids[1], &"b2".to_string()).unwrap();
        tx.commit().unwrap();
        file.flush().unwrap();
        file.close().unwrap();
    }

    // Simulate dying between the redo sync and the in-place writes: put a
    // stale page image back and leave a complete redo file of the batch.
    let data_path = dir.path().join("db.data");
    let redo_path = dir.path().join("db.redo");
    let current = std::fs::read(&data_path).unwrap();
    let mut redo = Vec::new();
    redo.extend_from_slice(b"BSRD");
    redo.extend_from_slice(&2u32.to_le_bytes());
    for &id in &ids {
        let start = id as usize * 4096;
        redo.extend_from_slice(&id.to_le_bytes());
        redo.extend_from_slice(&current[start..start + 4096]);
    }
    let crc = crc32fast::hash(&redo);
    redo.extend_from_slice(&crc.to_le_bytes());
    std::fs::write(&redo_path, &redo).unwrap();

    let mut stale = current.clone();
    stale[ids[0] as usize * 4096 + 30] ^= 0xFF;
    std::fs::write(&data_path, &stale).unwrap();

    let file = open(dir.path());
    let tx = file.tx();
    assert_eq!(tx.load::<String>(ids[0]).unwrap(), "a2");
    assert_eq!(tx.load::<String>(ids[1]).unwrap(), "b2");
}

#[test]
fn scenario_crash_during_redo_write() {
    let dir = tempdir().unwrap();
    let ids;
    {
        let file = open(dir.path());
        ids = write_entities(&file, &["stable".to_string()]);
        file.close().unwrap();
    }

    // A half-written redo file means the in-place writes never started.
    std::fs::write(dir.path().join("db.redo"), b"BSRD\x01\x00\x00\x00garbage").unwrap();

    let file = open(dir.path());
    let tx = file.tx();
    assert_eq!(tx.load::<String>(ids[0]).unwrap(), "stable");
}

#[test]
fn scenario_crash_before_flush_keeps_last_flushed_state() {
    let dir = tempdir().unwrap();
    let ids;
    {
        let file = open(dir.path());
        ids = write_entities(&file, &["v1".to_string()]);

        let mut tx = file.tx();
        tx.store(ids[0], &"v2".to_string()).unwrap();
        tx.commit().unwrap();
        file.abandon();
    }

    let file = open(dir.path());
    let tx = file.tx();
    assert_eq!(tx.load::<String>(ids[0]).unwrap(), "v1");
}

#[test]
fn scenario_corrupt_page_reported() {
    let dir = tempdir().unwrap();
    let ids;
    {
        let file = open(dir.path());
        ids = write_entities(&file, &["x".repeat(100)]);
        file.close().unwrap();
    }

    let data_path = dir.path().join("db.data");
    let mut data = std::fs::read(&data_path).unwrap();
    data[ids[0] as usize * 4096 + 40] ^= 0x01;
    std::fs::write(&data_path, &data).unwrap();

    let file = open(dir.path());
    let tx = file.tx();
    let err = tx.load::<String>(ids[0]).unwrap_err();
    assert!(err.to_string().contains("Corrupt page"));
}

// === Model Check ===

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_flushed_state_matches_model(
        ops in prop::collection::vec((0usize..6, prop::option::of(0usize..9000)), 1..30)
    ) {
        let dir = tempdir().unwrap();
        let mut model: BTreeMap<usize, Option<usize>> = BTreeMap::new();
        let mut slots: Vec<PageId> = Vec::new();
        {
            let file = open(dir.path());
            let mut tx = file.tx();
            for _ in 0..6 {
                let id = tx.allocate().unwrap();
                tx.store(id, &Vec::<u8>::new()).unwrap();
                slots.push(id);
            }
            tx.commit().unwrap();

            for (slot, len) in &ops {
                let mut tx = file.tx();
                let value = vec![*slot as u8; len.unwrap_or(0)];
                tx.store(slots[*slot], &value).unwrap();
                tx.commit().unwrap();
                model.insert(*slot, *len);
            }
            file.close().unwrap();
        }

        let file = open(dir.path());
        let tx = file.tx();
        for (slot, len) in model {
            let value: Vec<u8> = tx.load(slots[slot]).unwrap();
            prop_assert_eq!(value, vec![slot as u8; len.unwrap_or(0)]);
        }
    }
}
