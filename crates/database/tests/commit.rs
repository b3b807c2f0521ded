//! End-to-end commit scenarios over an in-memory persistence: clean
//! commits, OCC conflicts through published and pending writes, durability
//! failures, and publish ordering.

use std::time::Duration;

use common::{
    assert_obj,
    errors::ErrorMetadataAnyhowExt,
    interval::Interval,
    types::{
        Order,
        Timestamp,
    },
    val,
};
use database::test_helpers::{
    items_by_qty,
    qty_range,
    DbFixture,
};

fn table() -> common::types::TableName {
    "items".parse().unwrap()
}

#[tokio::test]
async fn test_clean_commit() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut tx = db.begin();
    let id = tx.insert(table(), assert_obj!("qty" => 1))?;
    let commit_ts = db.commit(tx).await?;
    assert_eq!(commit_ts, Timestamp::must(1));

    let mut read = db.begin();
    assert_eq!(*read.begin_timestamp(), commit_ts);
    let document = read.get(&id)?.expect("document should exist");
    assert_eq!(document.value().get(&"qty".parse()?), Some(&val!(1)));
    Ok(())
}

#[tokio::test]
async fn test_occ_conflict_on_range_read() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;

    // T1 observes the range [0, 10) empty and decides to write based on it.
    let mut t1 = db.begin();
    let conflicting = t1.range(&items_by_qty(), &qty_range(0, 10), Order::Asc, 100)?;
    assert!(conflicting.is_empty());
    t1.insert(table(), assert_obj!("qty" => 5))?;

    // T2 commits an insert into that range first.
    let mut t2 = db.begin();
    t2.insert(table(), assert_obj!("qty" => 3))?;
    let t2_ts = db.commit(t2).await?;
    assert_eq!(t2_ts, Timestamp::must(1));

    // T1's range read is now stale: the commit must abort and report the
    // conflicting timestamp for the caller's retry.
    let err = db.commit(t1).await.unwrap_err();
    assert!(err.is_occ());
    assert_eq!(err.occ_conflicting_ts(), Some(t2_ts));
    Ok(())
}

#[tokio::test]
async fn test_no_conflict_on_disjoint_range() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;

    let mut t1 = db.begin();
    assert!(t1
        .range(&items_by_qty(), &qty_range(0, 10), Order::Asc, 100)?
        .is_empty());
    t1.insert(table(), assert_obj!("qty" => 5))?;

    let mut t2 = db.begin();
    t2.insert(table(), assert_obj!("qty" => 50))?;
    db.commit(t2).await?;

    let t1_ts = db.commit(t1).await?;
    assert_eq!(t1_ts, Timestamp::must(2));

    // Both revisions are observable at the final snapshot.
    let mut read = db.begin();
    let all = read.range(&items_by_qty(), &Interval::all(), Order::Asc, 100)?;
    let qtys: Vec<_> = all
        .iter()
        .map(|(d, _)| d.value().get(&"qty".parse().unwrap()).unwrap().clone())
        .collect();
    assert_eq!(qtys, vec![val!(5), val!(50)]);
    Ok(())
}

#[tokio::test]
async fn test_pending_write_conflict() -> anyhow::Result<()> {
    let DbFixture {
        database: db,
        persistence,
    } = DbFixture::new().await?;

    // Both transactions read the same empty range and want to write into it.
    let mut t1 = db.begin();
    assert!(t1
        .range(&items_by_qty(), &qty_range(0, 10), Order::Asc, 100)?
        .is_empty());
    t1.insert(table(), assert_obj!("qty" => 1))?;

    let mut t2 = db.begin();
    assert!(t2
        .range(&items_by_qty(), &qty_range(0, 10), Order::Asc, 100)?
        .is_empty());
    t2.insert(table(), assert_obj!("qty" => 2))?;

    // Hold T1 in the staged-but-not-durable window.
    persistence.set_paused(true);
    let db1 = db.clone();
    let t1_commit = tokio::spawn(async move { db1.commit(t1).await });
    while persistence.write_attempts() == 0 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // T2 validates while T1 is only pending: the conflict check must see
    // pending writes, not just the published log.
    let err = db.commit(t2).await.unwrap_err();
    assert!(err.is_occ());
    assert_eq!(err.occ_conflicting_ts(), Some(Timestamp::must(1)));

    persistence.set_paused(false);
    let t1_ts = t1_commit.await??;
    assert_eq!(t1_ts, Timestamp::must(1));
    Ok(())
}

#[tokio::test]
async fn test_persistence_failure_does_not_publish() -> anyhow::Result<()> {
    let DbFixture {
        database: db,
        persistence,
    } = DbFixture::new().await?;

    persistence.set_failing(true);
    let mut tx = db.begin();
    tx.insert(table(), assert_obj!("qty" => 1))?;
    let err = db.commit(tx).await.unwrap_err();
    assert!(err.is_overloaded());
    assert_eq!(err.short_msg(), Some("PersistenceUnavailable"));

    // Nothing was published or persisted.
    assert_eq!(persistence.write_count(), 0);
    let mut read = db.begin();
    assert!(read
        .range(&items_by_qty(), &Interval::all(), Order::Asc, 100)?
        .is_empty());

    // The committer keeps serving commits after the failure.
    persistence.set_failing(false);
    let mut retry = db.begin();
    retry.insert(table(), assert_obj!("qty" => 1))?;
    let ts = db.commit(retry).await?;
    assert!(ts > Timestamp::must(1));
    assert_eq!(persistence.write_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_commit_timestamps_strictly_increase() -> anyhow::Result<()> {
    let DbFixture {
        database: db,
        persistence,
    } = DbFixture::new().await?;
    let mut last = Timestamp::MIN;
    for i in 0..10i64 {
        let mut tx = db.begin();
        tx.insert(table(), assert_obj!("qty" => i))?;
        let ts = db.commit(tx).await?;
        assert!(ts > last);
        last = ts;
    }
    assert_eq!(persistence.write_count(), 10);
    assert_eq!(persistence.max_ts(), Some(last));
    Ok(())
}

#[tokio::test]
async fn test_concurrent_disjoint_commits_all_land() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut handles = Vec::new();
    for i in 0..8i64 {
        let db = db.clone();
        handles.push(tokio::spawn(async move {
            let mut tx = db.begin();
            tx.insert("items".parse().unwrap(), assert_obj!("qty" => i))?;
            db.commit(tx).await
        }));
    }
    let mut timestamps = Vec::new();
    for handle in handles {
        timestamps.push(handle.await??);
    }
    timestamps.sort();
    timestamps.dedup();
    assert_eq!(timestamps.len(), 8);

    let mut read = db.begin();
    let all = read.range(&items_by_qty(), &Interval::all(), Order::Asc, 100)?;
    assert_eq!(all.len(), 8);
    Ok(())
}

#[tokio::test]
async fn test_read_only_commit_is_trivial() -> anyhow::Result<()> {
    let DbFixture {
        database: db,
        persistence,
    } = DbFixture::new().await?;
    let mut tx = db.begin();
    let _ = tx.range(&items_by_qty(), &Interval::all(), Order::Asc, 10)?;
    let ts = db.commit(tx).await?;
    assert_eq!(ts, *db.latest_ts());
    assert_eq!(persistence.write_count(), 0);
    Ok(())
}

#[tokio::test]
async fn test_read_your_writes() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut tx = db.begin();
    let id = tx.insert(table(), assert_obj!("qty" => 7))?;

    // The uncommitted insert is visible through the transaction's own view.
    let document = tx.get(&id)?.expect("own insert should be visible");
    assert_eq!(document.value().get(&"qty".parse()?), Some(&val!(7)));
    let scanned = tx.range(&items_by_qty(), &Interval::all(), Order::Asc, 10)?;
    assert_eq!(scanned.len(), 1);
    assert_eq!(scanned[0].1, common::types::WriteTimestamp::Pending);

    // Replacement substitutes, deletion hides.
    tx.replace(id.clone(), assert_obj!("qty" => 8))?;
    assert_eq!(
        tx.get(&id)?.unwrap().value().get(&"qty".parse()?),
        Some(&val!(8))
    );
    tx.delete(id.clone())?;
    assert!(tx.get(&id)?.is_none());
    assert!(tx
        .range(&items_by_qty(), &Interval::all(), Order::Asc, 10)?
        .is_empty());
    Ok(())
}

#[tokio::test]
async fn test_delete_then_commit_tombstone_conflicts_scanners() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut setup = db.begin();
    let id = setup.insert(table(), assert_obj!("qty" => 5))?;
    db.commit(setup).await?;

    // A scanner observes the document present.
    let mut scanner = db.begin();
    let seen = scanner.range(&items_by_qty(), &qty_range(0, 10), Order::Asc, 10)?;
    assert_eq!(seen.len(), 1);
    scanner.insert(table(), assert_obj!("qty" => 9))?;

    // A tombstone lands inside the scanned range.
    let mut deleter = db.begin();
    deleter.delete(id)?;
    let delete_ts = db.commit(deleter).await?;

    let err = db.commit(scanner).await.unwrap_err();
    assert!(err.is_occ());
    assert_eq!(err.occ_conflicting_ts(), Some(delete_ts));
    Ok(())
}

#[tokio::test]
async fn test_replace_and_delete_roundtrip() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut tx = db.begin();
    let id = tx.insert(table(), assert_obj!("qty" => 1))?;
    db.commit(tx).await?;

    let mut tx = db.begin();
    tx.replace(id.clone(), assert_obj!("qty" => 2))?;
    db.commit(tx).await?;

    let mut read = db.begin();
    assert_eq!(
        read.get(&id)?.unwrap().value().get(&"qty".parse()?),
        Some(&val!(2))
    );

    let mut tx = db.begin();
    tx.delete(id.clone())?;
    db.commit(tx).await?;

    let mut read = db.begin();
    assert!(read.get(&id)?.is_none());

    // Deleting again fails: the document is gone.
    let mut tx = db.begin();
    let err = tx.delete(id).unwrap_err();
    assert_eq!(err.short_msg(), Some("InvalidWrite"));
    Ok(())
}

#[tokio::test]
async fn test_reads_observe_snapshot_at_begin_timestamp() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut tx = db.begin();
    let id = tx.insert(table(), assert_obj!("qty" => 1))?;
    let v1_ts = db.commit(tx).await?;
    let mut tx = db.begin();
    tx.replace(id.clone(), assert_obj!("qty" => 2))?;
    let v2_ts = db.commit(tx).await?;

    // A read at the older timestamp sees the revision with the greatest
    // commit timestamp at or below it, not the latest.
    let mut old_read = db.begin_at(v1_ts)?;
    assert_eq!(
        old_read.get(&id)?.unwrap().value().get(&"qty".parse()?),
        Some(&val!(1))
    );
    let mut new_read = db.begin_at(v2_ts)?;
    assert_eq!(
        new_read.get(&id)?.unwrap().value().get(&"qty".parse()?),
        Some(&val!(2))
    );
    Ok(())
}

#[tokio::test]
async fn test_bootstrap_recovers_latest_revisions() -> anyhow::Result<()> {
    let DbFixture {
        database: db,
        persistence,
    } = DbFixture::new().await?;
    let mut tx = db.begin();
    let keep = tx.insert(table(), assert_obj!("qty" => 1))?;
    let gone = tx.insert(table(), assert_obj!("qty" => 2))?;
    db.commit(tx).await?;
    let mut tx = db.begin();
    tx.replace(keep.clone(), assert_obj!("qty" => 10))?;
    tx.delete(gone)?;
    let final_ts = db.commit(tx).await?;
    db.shutdown();

    // A fresh database over the same persistence sees exactly the surviving
    // revisions, at the durable horizon.
    let reloaded = database::Database::load_for_testing(
        persistence.clone(),
        database::test_helpers::items_registry(),
    )
    .await?;
    assert_eq!(*reloaded.latest_ts(), final_ts);
    let mut read = reloaded.begin();
    let all = read.range(&items_by_qty(), &Interval::all(), Order::Asc, 10)?;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].0.id(), &keep);
    assert_eq!(
        all[0].0.value().get(&"qty".parse()?),
        Some(&val!(10))
    );
    Ok(())
}
