//! Queue behaviour across connections and tasks
//!
//! - Concurrent dequeues never hand out the same job twice
//! - Two store handles on one database file see each other's claims
//! - A reset job can be claimed by a new worker while the old lease is void

use codeintel_storage::{JobState, JobStore, NewJob, SqliteJobStore};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;

fn upload(repository_id: i64) -> NewJob {
    NewJob::new(repository_id, "deadbeef1", "sub3/", "lsif-go")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dequeue_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let store = SqliteJobStore::open(&path, "lsif_uploads").unwrap();
    let mut expected = HashSet::new();
    for _ in 0..40 {
        expected.insert(store.enqueue(&upload(50)).await.unwrap());
    }

    // Separate handles so that claims race across connections
    let mut handles = Vec::new();
    for _ in 0..4 {
        let worker = Arc::new(SqliteJobStore::open(&path, "lsif_uploads").unwrap());
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(claim) = worker.dequeue().await.unwrap() {
                claimed.push(claim.id());
                assert!(worker.complete(claim.id(), claim.token).await.unwrap());
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.await.unwrap() {
            assert!(seen.insert(id), "job {} claimed twice", id);
        }
    }
    assert_eq!(seen, expected);

    let counts = store.state_counts(50).await.unwrap();
    assert_eq!(counts.completed, 40);
    assert_eq!(counts.processing, 0);
}

#[tokio::test]
async fn test_reset_job_changes_owner() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let first = SqliteJobStore::open(&path, "lsif_uploads").unwrap();
    let second = SqliteJobStore::open(&path, "lsif_uploads").unwrap();

    let id = first.enqueue(&upload(50)).await.unwrap();
    let stale = first.dequeue().await.unwrap().unwrap();

    let later = chrono::Utc::now() + chrono::Duration::minutes(10);
    let outcome = second
        .reset_stalled(later, chrono::Duration::seconds(30), 3)
        .await
        .unwrap();
    assert_eq!(outcome.reset, vec![id]);

    let fresh = second.dequeue().await.unwrap().unwrap();
    assert_eq!(fresh.id(), id);
    assert_ne!(fresh.token, stale.token);

    // The stalled worker wakes up and tries to finish
    assert!(!first.heartbeat(id, stale.token).await.unwrap());
    assert!(!first.fail(id, stale.token, "late").await.unwrap());

    assert!(second.complete(id, fresh.token).await.unwrap());
    let job = first.get(id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.num_resets, 1);
    assert_eq!(job.failure_message, None);
}

#[tokio::test]
async fn test_queues_are_isolated_by_table() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let uploads = SqliteJobStore::open(&path, "lsif_uploads").unwrap();
    let indexes = SqliteJobStore::open(&path, "lsif_indexes").unwrap();

    uploads.enqueue(&upload(50)).await.unwrap();
    assert!(indexes.dequeue().await.unwrap().is_none());
    assert_eq!(indexes.queue_name(), "lsif_indexes");
    assert!(uploads.dequeue().await.unwrap().is_some());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// Every enqueued job is dequeued exactly once, oldest first
    #[test]
    fn prop_dequeue_order_is_fifo(repositories in prop::collection::vec(1i64..5, 1..20)) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            let store = SqliteJobStore::in_memory("lsif_uploads").unwrap();
            let mut ids = Vec::new();
            for repository_id in &repositories {
                ids.push(store.enqueue(&upload(*repository_id)).await.unwrap());
            }

            let mut claimed = Vec::new();
            while let Some(claim) = store.dequeue().await.unwrap() {
                claimed.push(claim.id());
            }
            prop_assert_eq!(claimed, ids);
            Ok(())
        })?;
    }
}
