mod common;

use common::{open_db, s};
use stratum::Error;
use tempfile::tempdir;

#[test]
fn autocommit_cas_succeeds_when_expectation_matches() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("k"), s("0")).unwrap();

    assert!(db.compare_and_set(s("k"), Some(s("0")), s("1")).unwrap());
    assert_eq!(db.get(&s("k")).unwrap(), Some(s("1")));
}

#[test]
fn autocommit_cas_fails_on_stale_expectation() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("k"), s("actual")).unwrap();

    assert!(!db.compare_and_set(s("k"), Some(s("stale")), s("new")).unwrap());
    assert_eq!(db.get(&s("k")).unwrap(), Some(s("actual")));
}

#[test]
fn cas_with_absent_expectation_creates_the_key() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    assert!(db.compare_and_set(s("fresh"), None, s("v")).unwrap());
    assert_eq!(db.get(&s("fresh")).unwrap(), Some(s("v")));

    // A second absent-expectation attempt sees the key present.
    assert!(!db.compare_and_set(s("fresh"), None, s("other")).unwrap());
    assert_eq!(db.get(&s("fresh")).unwrap(), Some(s("v")));
}

#[test]
fn cas_sees_its_own_transaction_writes() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    let tx = db.begin_transaction().unwrap();
    db.put_tx(s("k"), s("pending"), &tx).unwrap();

    // Operation-time check runs against the transaction's view.
    assert!(db
        .compare_and_set_tx(s("k"), Some(s("pending")), s("updated"), &tx)
        .unwrap());
    assert_eq!(db.get_tx(&s("k"), &tx).unwrap(), Some(s("updated")));

    // The precondition is revalidated against the committed tree, where the
    // key does not exist yet: the commit must fail.
    let err = db.commit_transaction(&tx).unwrap_err();
    assert!(matches!(err, Error::CompareAndSetFailed { .. }));
    assert_eq!(db.get(&s("k")).unwrap(), None);
}

#[test]
fn commit_race_lets_exactly_one_winner_through() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("c"), s("0")).unwrap();

    let tx1 = db.begin_transaction().unwrap();
    let tx2 = db.begin_transaction().unwrap();

    // Both optimistic updates succeed at operation time.
    assert!(db
        .compare_and_set_tx(s("c"), Some(s("0")), s("1"), &tx1)
        .unwrap());
    assert!(db
        .compare_and_set_tx(s("c"), Some(s("0")), s("2"), &tx2)
        .unwrap());

    db.commit_transaction(&tx1).unwrap();

    // The loser fails deterministically with the observed value.
    let err = db.commit_transaction(&tx2).unwrap_err();
    match err {
        Error::CompareAndSetFailed {
            key,
            expected,
            actual,
        } => {
            assert_eq!(key, "\"c\"");
            assert_eq!(expected, "\"0\"");
            assert_eq!(actual, "\"1\"");
        }
        other => panic!("expected compare-and-set failure, got {other:?}"),
    }

    assert_eq!(db.get(&s("c")).unwrap(), Some(s("1")));
}

#[test]
fn failed_cas_commit_discards_sibling_operations() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    db.put(s("guard"), s("0")).unwrap();

    let tx = db.begin_transaction().unwrap();
    db.put_tx(s("other"), s("value"), &tx).unwrap();
    assert!(db
        .compare_and_set_tx(s("guard"), Some(s("0")), s("1"), &tx)
        .unwrap());

    // Another writer invalidates the precondition before commit.
    db.put(s("guard"), s("interfered")).unwrap();

    assert!(matches!(
        db.commit_transaction(&tx),
        Err(Error::CompareAndSetFailed { .. })
    ));

    // Nothing from the losing transaction is visible.
    assert_eq!(db.get(&s("other")).unwrap(), None);
    assert_eq!(db.get(&s("guard")).unwrap(), Some(s("interfered")));
}

#[test]
fn autocommit_cas_translates_commit_failure_into_false() {
    let dir = tempdir().unwrap();
    let db = open_db(dir.path());

    // Absent expectation against an absent key passes the operation-time
    // check and the commit-time check; present key fails at operation time.
    assert!(db.compare_and_set(s("k"), None, s("v1")).unwrap());
    assert!(!db.compare_and_set(s("k"), None, s("v2")).unwrap());
    assert!(db.compare_and_set(s("k"), Some(s("v1")), s("v2")).unwrap());
    assert_eq!(db.get(&s("k")).unwrap(), Some(s("v2")));
}
