//! End-to-end walkthrough of the Stratum public API: basic operations,
//! transactions with read-your-writes, compare-and-set, range queries and
//! reopen-after-close recovery.

use std::sync::Arc;

use stratum::{Database, Options, Rebalancer, StringCodec};

fn main() -> stratum::Result<()> {
    tracing_subscriber::fmt().init();

    let dir = tempfile::tempdir()?;
    let data_path = dir.path().join("example.db");
    let wal_path = dir.path().join("example.wal");

    let open = || {
        Database::<String, String>::open_with(
            data_path.clone(),
            wal_path.clone(),
            Options {
                order: 4,
                ..Options::default()
            },
            Arc::new(StringCodec),
            Arc::new(StringCodec),
            Arc::new(stratum::NaturalOrder),
        )
    };

    let db = open()?;

    // Basic operations.
    db.put("name".into(), "John Doe".into())?;
    db.put("age".into(), "30".into())?;
    db.put("city".into(), "San Francisco".into())?;

    println!("Name: {:?}", db.get(&"name".into())?);
    println!("Age: {:?}", db.get(&"age".into())?);

    // Transaction with read-your-writes visibility.
    let tx = db.begin_transaction()?;
    db.put_tx("name".into(), "Jane Smith".into(), &tx)?;
    db.put_tx("occupation".into(), "Engineer".into(), &tx)?;

    println!("Name outside transaction: {:?}", db.get(&"name".into())?);
    println!("Name inside transaction: {:?}", db.get_tx(&"name".into(), &tx)?);

    db.commit_transaction(&tx)?;
    println!("Name after commit: {:?}", db.get(&"name".into())?);

    // Compare-and-set only wins when the expectation holds.
    let swapped = db.compare_and_set("age".into(), Some("30".into()), "31".into())?;
    let refused = db.compare_and_set("age".into(), Some("30".into()), "99".into())?;
    println!("CAS with matching expectation: {swapped}");
    println!("CAS with stale expectation: {refused}");
    println!("Age now: {:?}", db.get(&"age".into())?);

    // Range query over a keyspace prefix.
    db.put("apple".into(), "fruit".into())?;
    db.put("banana".into(), "fruit".into())?;
    db.put("carrot".into(), "vegetable".into())?;
    println!(
        "Items from 'a' to 'c': {:?}",
        db.range(&"a".into(), &"c".into())?
    );

    // Deletes leave sparse nodes behind; the offline rebalancer repacks.
    for i in 0..40 {
        db.put(format!("bulk{i:02}"), format!("payload{i}"))?;
    }
    for i in (0..40).step_by(2) {
        db.delete(&format!("bulk{i:02}"))?;
    }

    // Committed data survives a close and reopen.
    let size_before = db.size()?;
    db.close()?;

    let rebalancer: Rebalancer<String, String> = Rebalancer::new(
        Arc::new(StringCodec),
        Arc::new(StringCodec),
        Arc::new(stratum::NaturalOrder),
        4,
        128,
    );
    println!("Before rebalance: {}", rebalancer.tree_stats(&data_path)?);
    rebalancer.rebalance(&data_path)?;
    println!("After rebalance:  {}", rebalancer.tree_stats(&data_path)?);

    let db = open()?;
    println!(
        "Reopened with {} entries (was {}), name = {:?}",
        db.size()?,
        size_before,
        db.get(&"name".into())?
    );
    db.close()?;

    Ok(())
}
