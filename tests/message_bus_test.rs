#![cfg(feature = "test-db")]
//! S1 (message fan-out) and the at-most-one-acknowledger invariant.

mod common;

use common::TestDb;
use coord_fabric::messaging::MessageBus;
use serde_json::json;
use serial_test::serial;

#[tokio::test]
#[serial]
async fn s1_priority_fanout_and_single_winner_ack() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let bus = MessageBus::new(std::sync::Arc::new(db.store.clone()));
    let channel = db.channel("ops");

    bus.publish(&channel, "A", json!({"n": 1}), None, Some(3)).await?;
    let id_n2 = bus.publish(&channel, "A", json!({"n": 2}), None, Some(1)).await?;

    let seen_by_b = bus.poll(&channel, "B", 10, false).await?;
    let seen_by_c = bus.poll(&channel, "C", 10, false).await?;

    assert_eq!(seen_by_b[0].id, id_n2);
    assert_eq!(seen_by_c[0].id, id_n2);

    let b_wins = bus.ack(id_n2, "B").await?;
    let c_wins = bus.ack(id_n2, "C").await?;
    assert!(b_wins ^ c_wins, "exactly one acknowledger must win");

    Ok(())
}

#[tokio::test]
#[serial]
async fn ack_is_idempotent() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let bus = MessageBus::new(std::sync::Arc::new(db.store.clone()));
    let channel = db.channel("idem");

    let id = bus.publish(&channel, "A", json!({}), None, None).await?;
    assert!(bus.ack(id, "B").await?);
    assert!(!bus.ack(id, "C").await?, "second ack must not win");

    Ok(())
}

#[tokio::test]
#[serial]
async fn unicast_recipient_is_excluded_from_other_agents() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let bus = MessageBus::new(std::sync::Arc::new(db.store.clone()));
    let channel = db.channel("unicast");

    bus.publish(&channel, "A", json!({"for": "B"}), Some("B"), None).await?;

    let seen_by_b = bus.poll(&channel, "B", 10, false).await?;
    let seen_by_c = bus.poll(&channel, "C", 10, false).await?;

    assert_eq!(seen_by_b.len(), 1);
    assert_eq!(seen_by_c.len(), 0);

    Ok(())
}
