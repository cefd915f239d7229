mod common;

use common::{open_db, s};
use stratum::{Error, TxState};
use tempfile::tempdir;

#[test]
fn uncommitted_writes_are_visible_only_inside_the_transaction() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    let tx = db.begin_transaction().unwrap();
    db.put_tx(s("x"), s("1"), &tx).unwrap();

    assert_eq!(db.get(&s("x")).unwrap(), None);
    assert_eq!(db.get_tx(&s("x"), &tx).unwrap(), Some(s("1")));

    db.commit_transaction(&tx).unwrap();
    assert_eq!(db.get(&s("x")).unwrap(), Some(s("1")));
    assert_eq!(tx.state(), TxState::Committed);
}

#[test]
fn rollback_discards_every_operation() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("stable"), s("before")).unwrap();

    let tx = db.begin_transaction().unwrap();
    db.put_tx(s("stable"), s("changed"), &tx).unwrap();
    db.put_tx(s("fresh"), s("value"), &tx).unwrap();
    db.rollback_transaction(&tx).unwrap();

    assert_eq!(db.get(&s("stable")).unwrap(), Some(s("before")));
    assert_eq!(db.get(&s("fresh")).unwrap(), None);
    assert_eq!(db.size().unwrap(), 1);
    assert_eq!(tx.state(), TxState::Aborted);
}

#[test]
fn pending_delete_hides_the_committed_value() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("k"), s("v")).unwrap();

    let tx = db.begin_transaction().unwrap();
    assert!(db.delete_tx(&s("k"), &tx).unwrap());

    assert_eq!(db.get_tx(&s("k"), &tx).unwrap(), None);
    assert!(!db.contains_key_tx(&s("k"), &tx).unwrap());
    // Still visible outside.
    assert_eq!(db.get(&s("k")).unwrap(), Some(s("v")));

    db.commit_transaction(&tx).unwrap();
    assert_eq!(db.get(&s("k")).unwrap(), None);
}

#[test]
fn latest_pending_operation_wins() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    let tx = db.begin_transaction().unwrap();
    db.put_tx(s("k"), s("first"), &tx).unwrap();
    db.put_tx(s("k"), s("second"), &tx).unwrap();
    assert_eq!(db.get_tx(&s("k"), &tx).unwrap(), Some(s("second")));

    db.commit_transaction(&tx).unwrap();
    assert_eq!(db.get(&s("k")).unwrap(), Some(s("second")));
}

#[test]
fn range_inside_a_transaction_overlays_pending_operations() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("a"), s("1")).unwrap();
    db.put(s("b"), s("2")).unwrap();
    db.put(s("c"), s("3")).unwrap();

    let tx = db.begin_transaction().unwrap();
    db.put_tx(s("b"), s("2-updated"), &tx).unwrap();
    db.put_tx(s("bb"), s("inserted"), &tx).unwrap();
    db.delete_tx(&s("c"), &tx).unwrap();

    assert_eq!(
        db.range_tx(&s("a"), &s("z"), &tx).unwrap(),
        vec![s("1"), s("2-updated"), s("inserted")]
    );
    // The committed view is untouched.
    assert_eq!(db.range(&s("a"), &s("z")).unwrap(), vec![s("1"), s("2"), s("3")]);
}

#[test]
fn operations_on_finished_transactions_fail() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    let tx = db.begin_transaction().unwrap();
    db.commit_transaction(&tx).unwrap();

    assert!(matches!(
        db.put_tx(s("k"), s("v"), &tx),
        Err(Error::TransactionNotActive(_))
    ));
    assert!(matches!(
        db.delete_tx(&s("k"), &tx),
        Err(Error::TransactionNotActive(_))
    ));
    assert!(matches!(
        db.commit_transaction(&tx),
        Err(Error::TransactionNotActive(_))
    ));
    assert!(matches!(
        db.rollback_transaction(&tx),
        Err(Error::TransactionNotActive(_))
    ));
}

#[test]
fn reads_with_a_finished_transaction_fall_back_to_committed_state() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("k"), s("committed")).unwrap();

    let tx = db.begin_transaction().unwrap();
    db.put_tx(s("k"), s("pending"), &tx).unwrap();
    db.rollback_transaction(&tx).unwrap();

    assert_eq!(db.get_tx(&s("k"), &tx).unwrap(), Some(s("committed")));
}

#[test]
fn interleaved_transactions_commit_independently() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    let tx1 = db.begin_transaction().unwrap();
    let tx2 = db.begin_transaction().unwrap();

    db.put_tx(s("from-tx1"), s("1"), &tx1).unwrap();
    db.put_tx(s("from-tx2"), s("2"), &tx2).unwrap();

    db.commit_transaction(&tx2).unwrap();
    assert_eq!(db.get(&s("from-tx1")).unwrap(), None);
    assert_eq!(db.get(&s("from-tx2")).unwrap(), Some(s("2")));

    db.commit_transaction(&tx1).unwrap();
    assert_eq!(db.get(&s("from-tx1")).unwrap(), Some(s("1")));
}

#[test]
fn close_rolls_back_active_transactions() {
    let dir = tempdir().unwrap();

    {
        let db = open_db(dir.path());
        let tx = db.begin_transaction().unwrap();
        db.put_tx(s("pending"), s("value"), &tx).unwrap();
        db.close().unwrap();
        assert_eq!(tx.state(), TxState::Aborted);
    }

    let db = open_db(dir.path());
    assert_eq!(db.get(&s("pending")).unwrap(), None);
}
