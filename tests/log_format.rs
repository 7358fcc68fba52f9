//! On-disk arithmetic and recovery properties of the transaction logs.

use woofdb::{Database, DbOptions, QueryOptions};

const FILE_HDR: u64 = 10;
const BLOCK_HDR: u64 = 14;
const FRAME_HDR: u64 = 12;
const BLOCK_BODY: u64 = 4096 - BLOCK_HDR;

fn open(dir: &tempfile::TempDir, max_log_size: u64) -> Database {
    Database::open(
        dir.path(),
        DbOptions {
            transaction_log_max_size: max_log_size,
            ..DbOptions::default()
        },
    )
    .unwrap()
}

fn log_file(db: &Database, log: &str, seq: u64) -> std::path::PathBuf {
    db.path()
        .join("transaction_logs")
        .join(log)
        .join(format!("{seq}.txnlog"))
}

#[test]
fn contiguous_commits_follow_the_size_formula() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 0);
    let log = db.use_log("sized").unwrap();

    let n: u64 = 400;
    let k: u64 = 10;
    for _ in 0..n {
        db.transaction(|txn| log.add_entry(&vec![b'x'; k as usize], txn.id()))
            .unwrap();
    }

    let body_bytes = n * (FRAME_HDR + k);
    let blocks = (body_bytes + BLOCK_BODY - 1) / BLOCK_BODY;
    let expected = FILE_HDR + blocks * BLOCK_HDR + body_bytes;
    assert_eq!(
        std::fs::metadata(log_file(&db, "sized", 1)).unwrap().len(),
        expected
    );
}

#[test]
fn every_file_stays_near_the_size_limit_and_one_tail_exists() {
    let dir = tempfile::tempdir().unwrap();
    let max = 500u64;
    let db = open(&dir, max);
    let log = db.use_log("bounded").unwrap();

    for _ in 0..40 {
        db.transaction(|txn| log.add_entry(&[b'b'; 64], txn.id()))
            .unwrap();
    }

    let listings = db.list_logs().unwrap();
    let files = &listings[0].files;
    assert!(files.len() > 1);
    for file in files {
        // One frame's continuation overhead at most past the limit.
        assert!(file.size <= max + 4096, "file {} is {} bytes", file.name, file.size);
    }
    // Sequences are dense and exactly the highest one is the tail.
    let seqs: Vec<u64> = files.iter().map(|f| f.seq).collect();
    let expected: Vec<u64> = (1..=files.len() as u64).collect();
    assert_eq!(seqs, expected);

    // Another commit extends only the highest-numbered file.
    let sizes_before: Vec<u64> = files.iter().map(|f| f.size).collect();
    db.transaction(|txn| log.add_entry(&[b'b'; 64], txn.id()))
        .unwrap();
    let after = db.list_logs().unwrap();
    let files_after = &after[0].files;
    for (before, file) in sizes_before.iter().zip(files_after.iter()) {
        if file.seq < files_after.len() as u64 {
            assert_eq!(*before, file.size);
        }
    }
}

#[test]
fn zero_length_entries_carry_a_bare_frame_header() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 0);
    let log = db.use_log("empty").unwrap();

    db.transaction(|txn| {
        log.add_entry(b"", txn.id())?;
        log.add_entry(b"", txn.id())
    })
    .unwrap();

    assert_eq!(
        std::fs::metadata(log_file(&db, "empty", 1)).unwrap().len(),
        FILE_HDR + BLOCK_HDR + 2 * FRAME_HDR
    );
    let entries: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.data.is_empty()));
    assert!(!entries[0].end_of_txn);
    assert!(entries[1].end_of_txn);
}

#[test]
fn multi_block_entries_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 0);
    let log = db.use_log("big").unwrap();

    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    db.transaction(|txn| log.add_entry(&payload, txn.id()))
        .unwrap();

    // Three blocks' worth of body plus change.
    let size = std::fs::metadata(log_file(&db, "big", 1)).unwrap().len();
    assert!(size > FILE_HDR + 2 * BLOCK_HDR + FRAME_HDR + 10_000 - BLOCK_BODY);

    let entries: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data, payload);
    assert!(entries[0].end_of_txn);
}

#[test]
fn one_transaction_many_entries_flags_only_the_last() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 0);
    let log = db.use_log("multi").unwrap();

    db.transaction(|txn| {
        for i in 0..100u32 {
            log.add_entry(&i.to_be_bytes(), txn.id())?;
        }
        Ok(())
    })
    .unwrap();

    let entries: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 100);
    for (i, entry) in entries.iter().enumerate() {
        assert_eq!(entry.data, (i as u32).to_be_bytes());
        assert_eq!(entry.end_of_txn, i == 99);
    }
    // All entries of one transaction share one stamp.
    assert!(entries.iter().all(|e| e.timestamp == entries[0].timestamp));
}

#[test]
fn interrupted_tail_writes_are_ignored_and_overwritten() {
    let dir = tempfile::tempdir().unwrap();
    let file;
    {
        let db = open(&dir, 0);
        let log = db.use_log("crashy").unwrap();
        db.transaction(|txn| log.add_entry(b"survivor", txn.id()))
            .unwrap();
        file = log_file(&db, "crashy", 1);
        db.close().unwrap();
    }

    // Simulate a torn write: a frame header promising more bytes than
    // exist, with the state file lost too.
    let mut bytes = std::fs::read(&file).unwrap();
    bytes.extend_from_slice(&u64::MAX.to_be_bytes());
    bytes.extend_from_slice(&500u32.to_be_bytes());
    bytes.extend_from_slice(b"torn");
    std::fs::write(&file, &bytes).unwrap();
    std::fs::remove_file(file.parent().unwrap().join("txn.state")).unwrap();

    let db = open(&dir, 0);
    let log = db.use_log("crashy").unwrap();
    let entries: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].data, b"survivor");

    // The next append reclaims the torn bytes.
    db.transaction(|txn| log.add_entry(b"replacement", txn.id()))
        .unwrap();
    let entries: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[1].data, b"replacement");
}
