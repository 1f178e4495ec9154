use granite::{CellValue, StorageError};
use serial_test::serial;
use tempfile::tempdir;

mod common;

#[test]
#[serial]
fn committed_insert_survives_a_crash_and_recovery() {
    let dir = tempdir().unwrap();
    let blk = {
        let db = common::open_db(dir.path());
        let tx = db.begin().unwrap();
        let blk = tx.append("data.tbl").unwrap();
        tx.insert_cell(&blk, b"x", CellValue::Int(42), true).unwrap();
        tx.commit().unwrap();
        blk
        // dropping the Db simulates the crash: the pool and its frames
        // simply disappear
    };

    let db = common::open_db(dir.path());
    db.recover().unwrap();

    let tx = db.begin().unwrap();
    let cell = tx.find_cell(&blk, b"x").unwrap();
    assert_eq!(cell.value(), Some(&CellValue::Int(42)));
    tx.commit().unwrap();
}

#[test]
#[serial]
fn rolled_back_insert_leaves_the_key_absent() {
    let dir = tempdir().unwrap();
    let db = common::open_db(dir.path());

    let blk = {
        let tx = db.begin().unwrap();
        let blk = tx.append("data.tbl").unwrap();
        tx.insert_cell(&blk, b"y", CellValue::Str("hi".into()), true)
            .unwrap();
        tx.rollback().unwrap();
        blk
    };

    let tx = db.begin().unwrap();
    assert!(matches!(
        tx.find_cell(&blk, b"y"),
        Err(StorageError::KeyNotFound)
    ));
    tx.commit().unwrap();
}

#[test]
#[serial]
fn rollback_undoes_past_its_own_start_record() {
    let dir = tempdir().unwrap();
    let db = common::open_db(dir.path());

    let tx = db.begin().unwrap();
    let blk = tx.append("data.tbl").unwrap();
    tx.insert_cell(&blk, b"k", CellValue::Int(1), true).unwrap();
    tx.insert_cell(&blk, b"k", CellValue::Int(2), true).unwrap();
    tx.rollback().unwrap();

    // both the update and the original insert are unwound
    let tx = db.begin().unwrap();
    assert!(matches!(
        tx.find_cell(&blk, b"k"),
        Err(StorageError::KeyNotFound)
    ));
    tx.commit().unwrap();
}

#[test]
#[serial]
fn recovery_restores_committed_value_over_uncommitted_flushed_one() {
    let dir = tempdir().unwrap();
    let blk = {
        let db = common::open_db(dir.path());
        let tx1 = db.begin().unwrap();
        let blk = tx1.append("data.tbl").unwrap();
        tx1.insert_cell(&blk, b"k", CellValue::Int(1), true).unwrap();
        tx1.commit().unwrap();

        // tx2 overwrites the cell and its dirty page even reaches disk
        // (as an eviction would do), but tx2 never commits
        let tx2 = db.begin().unwrap();
        tx2.insert_cell(&blk, b"k", CellValue::Int(2), true).unwrap();
        db.pool().flush_all(tx2.txnum()).unwrap();
        db.wal().flush().unwrap();
        blk
        // crash with tx2 unfinished
    };

    let db = common::open_db(dir.path());
    db.recover().unwrap();

    let tx = db.begin().unwrap();
    let cell = tx.find_cell(&blk, b"k").unwrap();
    assert_eq!(cell.value(), Some(&CellValue::Int(1)));
    tx.commit().unwrap();
}

#[test]
#[serial]
fn uncommitted_fresh_insert_disappears_after_recovery() {
    let dir = tempdir().unwrap();
    let blk = {
        let db = common::open_db(dir.path());
        let tx = db.begin().unwrap();
        let blk = tx.append("data.tbl").unwrap();
        tx.insert_cell(&blk, b"ghost", CellValue::Int(9), true)
            .unwrap();
        db.pool().flush_all(tx.txnum()).unwrap();
        db.wal().flush().unwrap();
        blk
        // crash before commit
    };

    let db = common::open_db(dir.path());
    db.recover().unwrap();

    let tx = db.begin().unwrap();
    assert!(matches!(
        tx.find_cell(&blk, b"ghost"),
        Err(StorageError::KeyNotFound)
    ));
    tx.commit().unwrap();
}

#[test]
#[serial]
fn recovery_stops_at_a_checkpoint() {
    let dir = tempdir().unwrap();
    let blk = {
        let db = common::open_db(dir.path());
        let tx = db.begin().unwrap();
        let blk = tx.append("data.tbl").unwrap();
        tx.insert_cell(&blk, b"stable", CellValue::Int(7), true)
            .unwrap();
        tx.commit().unwrap();
        db.recover().unwrap(); // writes a checkpoint
        blk
    };

    // recovery after the checkpoint must not disturb settled data
    let db = common::open_db(dir.path());
    db.recover().unwrap();

    let tx = db.begin().unwrap();
    let cell = tx.find_cell(&blk, b"stable").unwrap();
    assert_eq!(cell.value(), Some(&CellValue::Int(7)));
    tx.commit().unwrap();
}

#[test]
#[serial]
fn recovery_after_pure_reads_changes_nothing() {
    let dir = tempdir().unwrap();
    let blk = {
        let db = common::open_db(dir.path());
        let tx = db.begin().unwrap();
        let blk = tx.append("data.tbl").unwrap();
        tx.insert_cell(&blk, b"r", CellValue::Int(3), true).unwrap();
        tx.commit().unwrap();

        let reader = db.begin().unwrap();
        let cell = reader.find_cell(&blk, b"r").unwrap();
        assert_eq!(cell.value(), Some(&CellValue::Int(3)));
        reader.commit().unwrap();
        blk
    };

    let db = common::open_db(dir.path());
    db.recover().unwrap();

    let tx = db.begin().unwrap();
    let cell = tx.find_cell(&blk, b"r").unwrap();
    assert_eq!(cell.value(), Some(&CellValue::Int(3)));
    tx.commit().unwrap();
}
