mod common;

use std::fs::OpenOptions;

use common::{open_db, s};
use tempfile::tempdir;

#[test]
fn committed_transactions_are_durable_without_a_clean_close() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        db.put(s("a"), s("1")).unwrap();
        db.put(s("b"), s("2")).unwrap();
        // Dropped without close: only the WAL guarantees durability.
    }

    let db = open_db(dir.path());
    assert_eq!(db.get(&s("a")).unwrap(), Some(s("1")));
    assert_eq!(db.get(&s("b")).unwrap(), Some(s("2")));
    assert_eq!(db.size().unwrap(), 2);
}

#[test]
fn uncommitted_transactions_are_rolled_back_on_reopen() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        db.put(s("committed"), s("yes")).unwrap();

        let tx = db.begin_transaction().unwrap();
        db.put_tx(s("uncommitted"), s("no"), &tx).unwrap();
        db.flush().unwrap();
        // Crash: neither commit nor rollback reaches the log.
    }

    let db = open_db(dir.path());
    assert_eq!(db.get(&s("committed")).unwrap(), Some(s("yes")));
    assert_eq!(db.get(&s("uncommitted")).unwrap(), None);
}

#[test]
fn rolled_back_transactions_stay_invisible_after_reopen() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        let tx = db.begin_transaction().unwrap();
        db.put_tx(s("ghost"), s("value"), &tx).unwrap();
        db.rollback_transaction(&tx).unwrap();
    }

    let db = open_db(dir.path());
    assert_eq!(db.get(&s("ghost")).unwrap(), None);
    assert!(db.is_empty().unwrap());
}

#[test]
fn deletes_replay_in_order() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        db.put(s("k"), s("v1")).unwrap();
        db.delete(&s("k")).unwrap();
        db.put(s("k"), s("v2")).unwrap();
    }

    let db = open_db(dir.path());
    assert_eq!(db.get(&s("k")).unwrap(), Some(s("v2")));
    assert_eq!(db.size().unwrap(), 1);
}

#[test]
fn replaying_twice_is_idempotent() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        for i in 0..25 {
            db.put(format!("key{i:02}"), format!("value{i}")).unwrap();
        }
        db.delete(&s("key03")).unwrap();
    }

    // Each reopen replays the full log against the already-applied tree.
    for _ in 0..2 {
        let db = open_db(dir.path());
        assert_eq!(db.size().unwrap(), 24);
        assert_eq!(db.get(&s("key04")).unwrap(), Some(s("value4")));
        assert_eq!(db.get(&s("key03")).unwrap(), None);
        db.close().unwrap();
    }
}

#[test]
fn truncated_wal_tail_is_treated_as_a_crash_point() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        db.put(s("early"), s("kept")).unwrap();
        db.put(s("late"), s("cut")).unwrap();
    }

    // Cut into the last frame, as an interrupted write would.
    let wal_path = dir.path().join("wal.log");
    let len = std::fs::metadata(&wal_path).unwrap().len();
    let file = OpenOptions::new().write(true).open(&wal_path).unwrap();
    file.set_len(len - 3).unwrap();

    // The partial record is discarded; everything before it replays. The
    // second put lost its commit record, so only the first one survives.
    let db = open_db(dir.path());
    assert_eq!(db.get(&s("early")).unwrap(), Some(s("kept")));
    assert_eq!(db.get(&s("late")).unwrap(), None);
}

#[test]
fn state_after_reopen_equals_the_committed_prefix() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        db.put(s("a"), s("1")).unwrap();

        let tx1 = db.begin_transaction().unwrap();
        let tx2 = db.begin_transaction().unwrap();
        db.put_tx(s("b"), s("2"), &tx1).unwrap();
        db.put_tx(s("c"), s("3"), &tx2).unwrap();
        db.commit_transaction(&tx1).unwrap();
        // tx2 never commits.
        db.flush().unwrap();
    }

    let db = open_db(dir.path());
    assert_eq!(db.get(&s("a")).unwrap(), Some(s("1")));
    assert_eq!(db.get(&s("b")).unwrap(), Some(s("2")));
    assert_eq!(db.get(&s("c")).unwrap(), None);
    assert_eq!(db.size().unwrap(), 2);
}

#[test]
fn recovery_rebuilds_the_tree_from_the_log_alone() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        for i in 0..40 {
            db.put(format!("key{i:02}"), format!("value{i}")).unwrap();
        }
        db.close().unwrap();
    }

    // Delete only the tree file: the log alone rebuilds the state.
    std::fs::remove_file(dir.path().join("data.db")).unwrap();

    let db = open_db(dir.path());
    assert_eq!(db.size().unwrap(), 40);
    assert_eq!(db.get(&s("key39")).unwrap(), Some(s("value39")));
}
