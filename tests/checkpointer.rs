//! Durable checkpointer behavior over sqlite, including retention pruning
//! and cross-instance resumption.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use tempfile::tempdir;

use amila::engine::{Checkpoint, Checkpointer, SqliteCheckpointer};
use amila::state::QueryState;
use amila::types::{DatabaseType, NodeKind};

fn checkpoint(thread: &str, step: u64, next: Option<NodeKind>) -> Checkpoint {
    let mut state = QueryState::new(&format!("q-{thread}"), thread, "sample query", DatabaseType::Oracle);
    state.sql_query = format!("SELECT {step} FROM dual");
    Checkpoint::new(thread, step, next, state)
}

#[tokio::test]
async fn save_and_load_latest_roundtrip() {
    let dir = tempdir().unwrap();
    let url = format!("sqlite://{}/checkpoints.db", dir.path().display());
    let cp = SqliteCheckpointer::connect(&url).await.unwrap();

    cp.save(checkpoint("t1", 0, Some(NodeKind::Understand)))
        .await
        .unwrap();
    cp.save(checkpoint("t1", 1, Some(NodeKind::RetrieveContext)))
        .await
        .unwrap();
    cp.save(checkpoint("t2", 0, Some(NodeKind::Understand)))
        .await
        .unwrap();

    let latest = cp.load_latest("t1").await.unwrap().unwrap();
    assert_eq!(latest.step, 1);
    assert_eq!(latest.next_node, Some(NodeKind::RetrieveContext));
    assert_eq!(latest.state.sql_query, "SELECT 1 FROM dual");

    let mut threads = cp.list_threads().await.unwrap();
    threads.sort();
    assert_eq!(threads, vec!["t1".to_string(), "t2".to_string()]);
    assert!(cp.load_latest("missing").await.unwrap().is_none());
}

#[tokio::test]
async fn same_step_save_replaces() {
    let dir = tempdir().unwrap();
    let url = format!("sqlite://{}/checkpoints.db", dir.path().display());
    let cp = SqliteCheckpointer::connect(&url).await.unwrap();

    cp.save(checkpoint("t1", 3, Some(NodeKind::AwaitApproval)))
        .await
        .unwrap();
    let mut updated = checkpoint("t1", 3, Some(NodeKind::AwaitApproval));
    updated.state.approved = true;
    cp.save(updated).await.unwrap();

    let latest = cp.load_latest("t1").await.unwrap().unwrap();
    assert!(latest.state.approved);
}

#[tokio::test]
async fn terminal_checkpoints_have_no_next_node() {
    let dir = tempdir().unwrap();
    let url = format!("sqlite://{}/checkpoints.db", dir.path().display());
    let cp = SqliteCheckpointer::connect(&url).await.unwrap();

    cp.save(checkpoint("t1", 9, None)).await.unwrap();
    let latest = cp.load_latest("t1").await.unwrap().unwrap();
    assert_eq!(latest.next_node, None);
}

#[tokio::test]
async fn prune_enforces_age_and_per_thread_cap() {
    let dir = tempdir().unwrap();
    let url = format!("sqlite://{}/checkpoints.db", dir.path().display());
    let cp = SqliteCheckpointer::connect(&url).await.unwrap();

    // One stale checkpoint and a long fresh history.
    let mut stale = checkpoint("old", 0, None);
    stale.created_at = Utc::now() - ChronoDuration::days(30);
    cp.save(stale).await.unwrap();
    for step in 0..15 {
        cp.save(checkpoint("busy", step, Some(NodeKind::Execute)))
            .await
            .unwrap();
    }

    let removed = cp
        .prune(Utc::now() - ChronoDuration::days(7), 10)
        .await
        .unwrap();
    assert!(removed >= 6, "removed {removed}");

    assert!(cp.load_latest("old").await.unwrap().is_none());
    // The newest steps survive the cap.
    let latest = cp.load_latest("busy").await.unwrap().unwrap();
    assert_eq!(latest.step, 14);
}

#[tokio::test]
async fn a_second_instance_resumes_from_disk() {
    let dir = tempdir().unwrap();
    let url = format!("sqlite://{}/checkpoints.db", dir.path().display());
    {
        let cp = SqliteCheckpointer::connect(&url).await.unwrap();
        cp.save(checkpoint("t1", 5, Some(NodeKind::AwaitApproval)))
            .await
            .unwrap();
    }
    let cp = SqliteCheckpointer::connect(&url).await.unwrap();
    let latest = cp.load_latest("t1").await.unwrap().unwrap();
    assert_eq!(latest.step, 5);
    assert_eq!(latest.next_node, Some(NodeKind::AwaitApproval));
}
