#![cfg(feature = "test-db")]
//! S4 (cache TTL) and the idempotent-upsert law.

mod common;

use common::TestDb;
use coord_fabric::cache::ResultCache;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
#[serial]
async fn s4_ttl_expiry_and_cleanup() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let cache = ResultCache::new(Arc::new(db.store.clone()));
    let key = db.channel("x");

    cache.set(&key, json!(42), Duration::from_secs(1), "a", None, None).await?;
    assert_eq!(cache.get(&key, "a", None).await?, Some(json!(42)));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(cache.get(&key, "a", None).await?, None);

    let deleted = cache.cleanup_expired().await?;
    assert!(deleted >= 1);

    Ok(())
}

#[tokio::test]
#[serial]
async fn upsert_overwrites_value_and_bumps_access_count() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let cache = ResultCache::new(Arc::new(db.store.clone()));
    let key = db.channel("upsert");

    cache.set(&key, json!("v1"), Duration::from_secs(60), "a", None, None).await?;
    cache.set(&key, json!("v2"), Duration::from_secs(120), "a", None, None).await?;

    assert_eq!(cache.get(&key, "a", None).await?, Some(json!("v2")));

    let stats = cache.stats().await?;
    assert!(stats.live_entries >= 1);

    Ok(())
}

#[tokio::test]
#[serial]
async fn extend_ttl_only_succeeds_while_live() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let cache = ResultCache::new(Arc::new(db.store.clone()));
    let key = db.channel("extend");

    cache.set(&key, json!(1), Duration::from_millis(200), "a", None, None).await?;
    tokio::time::sleep(Duration::from_millis(400)).await;

    assert!(!cache.extend_ttl(&key, 60, None).await?, "expired entries cannot be extended");

    Ok(())
}

#[tokio::test]
#[serial]
async fn namespace_is_prefixed_verbatim() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let cache = ResultCache::new(Arc::new(db.store.clone()));
    let key = db.channel("ns_key");

    cache
        .set(&key, json!("scoped"), Duration::from_secs(60), "a", None, Some("tenant1"))
        .await?;

    assert_eq!(cache.get(&key, "a", None).await?, None, "unnamespaced lookup must miss");
    assert_eq!(
        cache.get(&key, "a", Some("tenant1")).await?,
        Some(json!("scoped"))
    );

    Ok(())
}
