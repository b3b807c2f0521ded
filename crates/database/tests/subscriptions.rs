//! Subscription invalidation driven end-to-end through the write log.

use std::time::Duration;

use common::{
    assert_obj,
    types::Order,
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
async fn test_overlapping_commit_invalidates_exactly_once() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut setup = db.begin();
    let id_a = setup.insert(table(), assert_obj!("qty" => 1))?;
    db.commit(setup).await?;

    // Subscribe to the point read of document A.
    let mut reader = db.begin();
    let _ = reader.get(&id_a)?;
    let subscription = db.subscribe(reader.into_token()).await?;
    assert!(subscription.current_ts().is_some());

    // A commit writing A invalidates the subscription, tagged with the
    // commit that did it.
    let mut writer = db.begin();
    writer.replace(id_a, assert_obj!("qty" => 7))?;
    let write_ts = db.commit(writer).await?;

    let invalidated_at = tokio::time::timeout(
        Duration::from_secs(5),
        subscription.wait_for_invalidation(),
    )
    .await?;
    assert_eq!(invalidated_at, Some(write_ts));
    assert_eq!(subscription.current_ts(), None);
    Ok(())
}

#[tokio::test]
async fn test_disjoint_commit_does_not_invalidate() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut setup = db.begin();
    let id_a = setup.insert(table(), assert_obj!("qty" => 1))?;
    db.commit(setup).await?;

    let mut reader = db.begin();
    let _ = reader.get(&id_a)?;
    let subscription = db.subscribe(reader.into_token()).await?;

    // A commit writing an unrelated document produces no event.
    let mut writer = db.begin();
    writer.insert(table(), assert_obj!("qty" => 2))?;
    db.commit(writer).await?;

    let result = tokio::time::timeout(
        Duration::from_millis(200),
        subscription.wait_for_invalidation(),
    )
    .await;
    assert!(result.is_err(), "subscription should remain valid");
    Ok(())
}

#[tokio::test]
async fn test_insert_into_observed_empty_range_invalidates() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;

    // The reader observes [0, 10) empty; its read set records the gap.
    let mut reader = db.begin();
    assert!(reader
        .range(&items_by_qty(), &qty_range(0, 10), Order::Asc, 10)?
        .is_empty());
    let subscription = db.subscribe(reader.into_token()).await?;

    let mut writer = db.begin();
    writer.insert(table(), assert_obj!("qty" => 5))?;
    let write_ts = db.commit(writer).await?;

    let invalidated_at = tokio::time::timeout(
        Duration::from_secs(5),
        subscription.wait_for_invalidation(),
    )
    .await?;
    assert_eq!(invalidated_at, Some(write_ts));
    Ok(())
}

#[tokio::test]
async fn test_write_outside_scanned_range_does_not_invalidate() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;

    let mut reader = db.begin();
    let _ = reader.range(&items_by_qty(), &qty_range(0, 10), Order::Asc, 10)?;
    let subscription = db.subscribe(reader.into_token()).await?;

    // qty = 10 sits exactly at the exclusive upper bound.
    let mut writer = db.begin();
    writer.insert(table(), assert_obj!("qty" => 10))?;
    db.commit(writer).await?;

    let result = tokio::time::timeout(
        Duration::from_millis(200),
        subscription.wait_for_invalidation(),
    )
    .await;
    assert!(result.is_err(), "upper bound is exclusive");
    Ok(())
}

#[tokio::test]
async fn test_stale_token_yields_invalid_subscription() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut setup = db.begin();
    let id_a = setup.insert(table(), assert_obj!("qty" => 1))?;
    db.commit(setup).await?;

    // Take a token, then overwrite its reads before subscribing: the
    // registration replay detects the conflict up front.
    let mut reader = db.begin();
    let _ = reader.get(&id_a)?;
    let token = reader.into_token();

    let mut writer = db.begin();
    writer.replace(id_a, assert_obj!("qty" => 2))?;
    db.commit(writer).await?;

    let subscription = db.subscribe(token).await?;
    assert_eq!(subscription.current_ts(), None);
    assert_eq!(subscription.wait_for_invalidation().await, None);
    Ok(())
}

#[tokio::test]
async fn test_dropping_subscription_unsubscribes() -> anyhow::Result<()> {
    let DbFixture { database: db, .. } = DbFixture::new().await?;
    let mut setup = db.begin();
    let id_a = setup.insert(table(), assert_obj!("qty" => 1))?;
    db.commit(setup).await?;

    let mut reader = db.begin();
    let _ = reader.get(&id_a)?;
    let subscription = db.subscribe(reader.into_token()).await?;
    drop(subscription);

    // A conflicting commit still publishes fine with no live subscriber.
    let mut writer = db.begin();
    writer.replace(id_a, assert_obj!("qty" => 9))?;
    db.commit(writer).await?;
    Ok(())
}
