#![cfg(feature = "test-db")]
//! S6 (pattern subscription fan-out).

mod common;

use common::TestDb;
use coord_fabric::subscription::{NotificationService, SubscriptionKind};
use serde_json::json;
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
#[serial]
async fn s6_pattern_subscription_fires_only_on_match() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let service = NotificationService::new(Arc::new(db.store.clone()));
    let channel = db.channel("c");

    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count_clone = fire_count.clone();

    service
        .subscribe(
            "X",
            &channel,
            SubscriptionKind::Pattern,
            Some("urgent".to_string()),
            Arc::new(move |_kind, _data| {
                let counter = fire_count_clone.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await?;

    service
        .notify(&channel, "evt", json!({"text": "urgent alert"}), None)
        .await;
    assert_eq!(fire_count.load(Ordering::SeqCst), 1);

    service
        .notify(&channel, "evt", json!({"text": "routine"}), None)
        .await;
    assert_eq!(fire_count.load(Ordering::SeqCst), 1, "non-matching event must not fire");

    Ok(())
}

#[tokio::test]
#[serial]
async fn direct_mode_only_fires_for_matching_recipient() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let service = NotificationService::new(Arc::new(db.store.clone()));
    let channel = db.channel("direct");

    let fire_count = Arc::new(AtomicUsize::new(0));
    let fire_count_clone = fire_count.clone();

    service
        .subscribe(
            "X",
            &channel,
            SubscriptionKind::Direct,
            None,
            Arc::new(move |_kind, _data| {
                let counter = fire_count_clone.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await?;

    service.notify(&channel, "evt", json!({"recipient": "Y"}), None).await;
    assert_eq!(fire_count.load(Ordering::SeqCst), 0);

    service.notify(&channel, "evt", json!({"recipient": "X"}), None).await;
    assert_eq!(fire_count.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
#[serial]
async fn subscriptions_survive_rehydration() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let channel = db.channel("rehydrate");

    {
        let service = NotificationService::new(Arc::new(db.store.clone()));
        service
            .subscribe(
                "Z",
                &channel,
                SubscriptionKind::All,
                None,
                Arc::new(|_, _| Box::pin(async {})),
            )
            .await?;
    }

    // A fresh process-local registry with the same persisted state.
    let service = NotificationService::new(Arc::new(db.store.clone()));
    let count = service.rehydrate().await?;
    assert!(count >= 1);

    // Rehydrated subscriptions have no callback and so don't execute
    // anything, but they still count toward fan-out.
    let fanout = service.notify(&channel, "evt", json!({}), None).await;
    assert_eq!(fanout, 1);

    Ok(())
}

#[tokio::test]
#[serial]
async fn unique_agent_channel_subscription() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let service = NotificationService::new(Arc::new(db.store.clone()));
    let channel = db.channel("unique");

    service
        .subscribe("X", &channel, SubscriptionKind::All, None, Arc::new(|_, _| Box::pin(async {})))
        .await?;
    service
        .subscribe("X", &channel, SubscriptionKind::Direct, None, Arc::new(|_, _| Box::pin(async {})))
        .await?;

    let rows: Vec<(String,)> = sqlx::query_as("SELECT channel FROM subscriptions WHERE agent = 'X'")
        .fetch_all(&db.pool)
        .await?;
    assert_eq!(rows.len(), 1, "(agent, channel) is unique; resubscribe upserts");

    Ok(())
}
