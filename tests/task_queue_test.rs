#![cfg(feature = "test-db")]
//! S2 (dependency gate) and S3 (retry with backoff), plus priority
//! ordering and retry-count monotonicity laws.

mod common;

use common::TestDb;
use coord_fabric::config::FabricConfig;
use coord_fabric::tasks::{EnqueueRequest, TaskQueue, TaskStatus};
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;

fn queue(db: &TestDb) -> TaskQueue {
    TaskQueue::new(Arc::new(db.store.clone()), &FabricConfig::default())
}

#[tokio::test]
#[serial]
async fn s2_dependency_gate() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let q = queue(&db);
    let agent = format!("worker_{}", db.test_id);

    let t1 = q.enqueue(EnqueueRequest::new(&agent, "a", json!({}))).await?;
    let t2 = q
        .enqueue(EnqueueRequest::new(&agent, "b", json!({})).depends_on(vec![t1]))
        .await?;

    let dequeued1 = q.dequeue(&agent, None).await?.expect("t1 should be eligible");
    assert_eq!(dequeued1.task_id, t1);

    assert!(q.dequeue(&agent, None).await?.is_none(), "t2 is gated by t1");

    q.complete(t1, json!({"ok": true}), None).await?;

    let dequeued2 = q.dequeue(&agent, None).await?.expect("t2 now eligible");
    assert_eq!(dequeued2.task_id, t2);

    Ok(())
}

#[tokio::test]
#[serial]
async fn s3_retry_with_backoff_then_terminal_failure() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let q = queue(&db);
    let agent = format!("worker_{}", db.test_id);

    let t = q
        .enqueue(EnqueueRequest::new(&agent, "flaky", json!({})).with_max_retries(2))
        .await?;

    q.dequeue(&agent, None).await?;
    assert!(q.fail(t, "boom", true).await?);
    let after_first = q.get(t).await?;
    assert_eq!(after_first.status, TaskStatus::Pending);
    assert_eq!(after_first.retry_count, 1);
    assert!(after_first.delay_until().is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    q.dequeue(&agent, None).await?;
    assert!(q.fail(t, "boom again", true).await?);
    let after_second = q.get(t).await?;
    assert_eq!(after_second.retry_count, 2);

    tokio::time::sleep(Duration::from_secs(6)).await;
    q.dequeue(&agent, None).await?;
    assert!(!q.fail(t, "boom forever", true).await?, "retry budget exhausted");
    let terminal = q.get(t).await?;
    assert_eq!(terminal.status, TaskStatus::Failed);
    assert_eq!(terminal.retry_count, 2);
    assert!(terminal.retry_count <= terminal.max_retries);

    Ok(())
}

#[tokio::test]
#[serial]
async fn priority_outranks_age() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let q = queue(&db);
    let agent = format!("worker_{}", db.test_id);

    let old_low_priority = q
        .enqueue(EnqueueRequest::new(&agent, "a", json!({})).with_priority(10i16))
        .await?;
    tokio::time::sleep(Duration::from_millis(10)).await;
    let new_high_priority = q
        .enqueue(EnqueueRequest::new(&agent, "a", json!({})).with_priority(1i16))
        .await?;

    let first = q.dequeue(&agent, None).await?.unwrap();
    assert_eq!(first.task_id, new_high_priority);

    let second = q.dequeue(&agent, None).await?.unwrap();
    assert_eq!(second.task_id, old_low_priority);

    Ok(())
}

#[tokio::test]
#[serial]
async fn empty_kinds_filter_means_no_restriction() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let q = queue(&db);
    let agent = format!("worker_{}", db.test_id);

    q.enqueue(EnqueueRequest::new(&agent, "any_kind", json!({}))).await?;
    let empty: Vec<String> = Vec::new();
    let result = q.dequeue(&agent, Some(&empty)).await?;
    assert!(result.is_some(), "an empty kinds filter must not restrict by kind");

    Ok(())
}

#[tokio::test]
#[serial]
async fn cancel_is_noop_once_processing() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let q = queue(&db);
    let agent = format!("worker_{}", db.test_id);

    let t = q.enqueue(EnqueueRequest::new(&agent, "a", json!({}))).await?;
    q.dequeue(&agent, None).await?;

    assert!(!q.cancel(t, "too late").await?);
    assert_eq!(q.get(t).await?.status, TaskStatus::Processing);

    Ok(())
}

#[tokio::test]
#[serial]
async fn batch_enqueue_is_all_or_nothing() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let q = queue(&db);
    let agent = format!("worker_{}", db.test_id);

    let ids = q
        .enqueue_batch(vec![
            EnqueueRequest::new(&agent, "a", json!({})),
            EnqueueRequest::new(&agent, "b", json!({})),
            EnqueueRequest::new(&agent, "c", json!({})),
        ])
        .await?;
    assert_eq!(ids.len(), 3);
    for id in ids {
        assert_eq!(q.get(id).await?.status, TaskStatus::Pending);
    }

    Ok(())
}
