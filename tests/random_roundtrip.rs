//! Randomized round-trips: whatever sequence of entries goes in, the
//! same sequence comes back out, regardless of how the frames fall
//! across block and file boundaries.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use woofdb::{Database, DbOptions, QueryOptions};

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

fn random_payload(rng: &mut StdRng) -> Vec<u8> {
    // Sizes chosen to straddle the interesting boundaries: empty frames,
    // sub-block frames, and frames spanning several blocks.
    let len = match rng.gen_range(0..4) {
        0 => rng.gen_range(0..16),
        1 => rng.gen_range(16..512),
        2 => rng.gen_range(3_900..4_200),
        _ => rng.gen_range(8_000..12_000),
    };
    (0..len).map(|_| rng.gen()).collect()
}

#[test]
fn random_entries_round_trip_without_rotation() {
    let mut rng = StdRng::seed_from_u64(0x57_4F_4F_46);
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir, 0);
    let log = db.use_log("fuzz").unwrap();

    let mut expected: Vec<(Vec<Vec<u8>>, u64)> = Vec::new();
    for _ in 0..40 {
        let entries: Vec<Vec<u8>> = (0..rng.gen_range(1..5))
            .map(|_| random_payload(&mut rng))
            .collect();
        let ts = db
            .transaction(|txn| {
                for entry in &entries {
                    log.add_entry(entry, txn.id())?;
                }
                txn.commit()
            })
            .unwrap();
        expected.push((entries, ts));
    }

    let got: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    let flat: Vec<&Vec<u8>> = expected.iter().flat_map(|(e, _)| e.iter()).collect();
    assert_eq!(got.len(), flat.len());
    let mut i = 0;
    for (entries, ts) in &expected {
        for (j, entry) in entries.iter().enumerate() {
            assert_eq!(&got[i].data, entry);
            assert_eq!(got[i].timestamp, *ts);
            assert_eq!(got[i].end_of_txn, j == entries.len() - 1);
            i += 1;
        }
    }
}

#[test]
fn random_entries_round_trip_across_rotated_files() {
    let mut rng = StdRng::seed_from_u64(0xDB);
    let dir = tempfile::tempdir().unwrap();
    let max = 2_000u64;
    let db = open(&dir, max);
    let log = db.use_log("fuzz").unwrap();

    let mut expected: Vec<Vec<u8>> = Vec::new();
    for _ in 0..60 {
        let payload = random_payload(&mut rng);
        db.transaction(|txn| log.add_entry(&payload, txn.id()))
            .unwrap();
        expected.push(payload);
    }
    assert!(log.list_files().len() > 3);
    for file in log.list_files() {
        assert!(file.size <= max + 4096 + 14);
    }

    let got: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(got.len(), expected.len());
    for (entry, payload) in got.iter().zip(expected.iter()) {
        assert_eq!(&entry.data, payload);
        assert!(entry.end_of_txn);
    }
    // Stamps never decrease: the commits were serial on one handle.
    for pair in got.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }
}

#[test]
fn random_reopens_preserve_the_sequence() {
    let mut rng = StdRng::seed_from_u64(7);
    let dir = tempfile::tempdir().unwrap();
    let mut expected: Vec<Vec<u8>> = Vec::new();

    for _ in 0..5 {
        let db = open(&dir, 3_000);
        let log = db.use_log("across").unwrap();
        for _ in 0..8 {
            let payload = random_payload(&mut rng);
            db.transaction(|txn| log.add_entry(&payload, txn.id()))
                .unwrap();
            expected.push(payload);
        }
        drop(log);
        db.close().unwrap();
        drop(db);
    }

    let db = open(&dir, 3_000);
    let log = db.use_log("across").unwrap();
    let got: Vec<_> = log
        .query(QueryOptions::default())
        .map(|e| e.unwrap())
        .collect();
    assert_eq!(got.len(), expected.len());
    for (entry, payload) in got.iter().zip(expected.iter()) {
        assert_eq!(&entry.data, payload);
    }
}
