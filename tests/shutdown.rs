//! Process-wide teardown. Kept in its own binary: `shutdown()` closes
//! every handle in the process.

use woofdb::{Database, DbOptions};

#[test]
fn shutdown_closes_every_open_database() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = Database::open(dir_a.path(), DbOptions::default()).unwrap();
    let b = Database::open(dir_b.path(), DbOptions::default()).unwrap();
    assert!(a.is_open());
    assert!(b.is_open());

    woofdb::shutdown();

    assert!(!a.is_open());
    assert!(!b.is_open());
    assert_eq!(
        a.begin().unwrap_err().kind(),
        woofdb::ErrorKind::NotOpen
    );

    // The paths can be opened again afterwards.
    let again = Database::open(dir_a.path(), DbOptions::default()).unwrap();
    assert!(again.is_open());
}
