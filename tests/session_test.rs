#![cfg(feature = "test-db")]
//! S5 (session lifecycle) and the terminal-state immutability invariant.

mod common;

use common::TestDb;
use coord_fabric::session::SessionStore;
use serde_json::json;
use serial_test::serial;
use std::sync::Arc;

#[tokio::test]
#[serial]
async fn s5_lifecycle_and_frozen_terminal_history() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let sessions = SessionStore::new(Arc::new(db.store.clone()));

    let session_id = sessions
        .create("u", &["tutor".to_string()], None, None)
        .await?;

    sessions
        .append_turn(session_id, "u", "ask", json!({"q": "hi"}), None, None)
        .await?;
    sessions
        .append_turn(session_id, "tutor", "reply", json!({"a": "hello"}), Some(42), None)
        .await?;

    sessions.complete(session_id, Some("done"), None).await?;

    let after_complete = sessions
        .append_turn(session_id, "tutor", "late", json!({}), None, None)
        .await;
    assert!(after_complete.is_err(), "terminal sessions reject new turns");

    let session = sessions.get(session_id).await?.expect("session exists");
    assert_eq!(session.history.len(), 2);
    assert_eq!(session.status, coord_fabric::session::SessionStatus::Completed);

    Ok(())
}

#[tokio::test]
#[serial]
async fn pause_resume_round_trip() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let sessions = SessionStore::new(Arc::new(db.store.clone()));

    let session_id = sessions.create("u", &[], None, None).await?;
    sessions.pause(session_id).await?;
    assert_eq!(
        sessions.get(session_id).await?.unwrap().status,
        coord_fabric::session::SessionStatus::Paused
    );

    sessions.resume(session_id).await?;
    assert_eq!(
        sessions.get(session_id).await?.unwrap().status,
        coord_fabric::session::SessionStatus::Active
    );

    Ok(())
}

#[tokio::test]
#[serial]
async fn illegal_transition_is_rejected() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let sessions = SessionStore::new(Arc::new(db.store.clone()));

    let session_id = sessions.create("u", &[], None, None).await?;
    sessions.complete(session_id, None, None).await?;

    let result = sessions.resume(session_id).await;
    assert!(result.is_err(), "completed sessions cannot resume");

    Ok(())
}

#[tokio::test]
#[serial]
async fn state_merge_is_top_level_last_writer_wins() -> anyhow::Result<()> {
    let db = TestDb::new().await?;
    let sessions = SessionStore::new(Arc::new(db.store.clone()));

    let session_id = sessions
        .create("u", &[], Some(json!({"a": 1, "b": 1})), None)
        .await?;

    sessions.update_state(session_id, json!({"b": 2, "c": 3}), true).await?;

    let session = sessions.get(session_id).await?.unwrap();
    assert_eq!(session.state, json!({"a": 1, "b": 2, "c": 3}));

    sessions.update_state(session_id, json!({"only": "this"}), false).await?;
    let session = sessions.get(session_id).await?.unwrap();
    assert_eq!(session.state, json!({"only": "this"}));

    Ok(())
}
