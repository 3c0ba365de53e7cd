//! Repository contract against the in-memory store: claims, releases,
//! batch claims and state persistence.

use std::sync::Arc;

use chrono::{Duration, Utc};
use corral::{CorralError, JobRecord, JobRepository, JobStore, MemoryStore};

fn fixture() -> (Arc<MemoryStore>, JobRepository) {
    let store = Arc::new(MemoryStore::new());
    let repository = JobRepository::new(Arc::clone(&store) as Arc<dyn JobStore>);
    (store, repository)
}

fn due(name: &str, secs_ago: i64) -> JobRecord {
    JobRecord::new(name, serde_json::Value::Null).schedule(Utc::now() - Duration::seconds(secs_ago))
}

#[tokio::test]
async fn claim_sets_the_lock_exactly_once() {
    let (store, repository) = fixture();
    let record = store.insert(due("emails", 1)).await.unwrap();

    let claimed = repository.claim(&record).await.unwrap().expect("first claim wins");
    assert!(claimed.locked_at.is_some());

    // the second claim loses the race
    assert!(repository.claim(&record).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_skips_disabled_jobs() {
    let (store, repository) = fixture();
    let mut record = due("emails", 1);
    record.disabled = true;
    let record = store.insert(record).await.unwrap();

    assert!(repository.claim(&record).await.unwrap().is_none());
}

#[tokio::test]
async fn claim_next_prefers_higher_priority_on_ties() {
    let (store, repository) = fixture();
    let at = Utc::now() - Duration::seconds(1);
    for priority in [0i8, 10, -10] {
        store
            .insert(
                JobRecord::new("emails", serde_json::Value::Null)
                    .schedule(at)
                    .with_priority(priority),
            )
            .await
            .unwrap();
    }

    let now = Utc::now();
    let claimed = repository
        .claim_next("emails", now + Duration::seconds(5), now - Duration::seconds(600), now)
        .await
        .unwrap()
        .expect("something is due");
    assert_eq!(claimed.priority, 10);
}

#[tokio::test]
async fn claim_next_honors_the_scan_horizon() {
    let (store, repository) = fixture();
    store
        .insert(
            JobRecord::new("emails", serde_json::Value::Null)
                .schedule(Utc::now() + Duration::minutes(10)),
        )
        .await
        .unwrap();

    let now = Utc::now();
    let claimed = repository
        .claim_next("emails", now + Duration::seconds(5), now - Duration::seconds(600), now)
        .await
        .unwrap();
    assert!(claimed.is_none());
}

#[tokio::test]
async fn claim_next_steals_stale_locks() {
    let (store, repository) = fixture();
    let mut record = due("emails", 60);
    record.locked_at = Some(Utc::now() - Duration::seconds(60));
    store.insert(record).await.unwrap();

    let now = Utc::now();
    let claimed = repository
        .claim_next("emails", now + Duration::seconds(5), now - Duration::seconds(30), now)
        .await
        .unwrap()
        .expect("stale claim is up for grabs");
    assert_eq!(claimed.locked_at, Some(now));
}

#[tokio::test]
async fn claim_then_release_leaves_the_document_unchanged() {
    let (store, repository) = fixture();
    let before = store.insert(due("emails", 1)).await.unwrap();

    let claimed = repository.claim(&before).await.unwrap().expect("claimed");
    repository.release(&claimed).await.unwrap();

    let after = store.get(before.id).await.unwrap().expect("still there");
    assert_eq!(after, before);
}

#[tokio::test]
async fn release_does_not_unfinish_a_completed_job() {
    let (store, repository) = fixture();
    let mut record = due("emails", 1);
    // completion cleared the schedule but the lock write is still in flight
    record.next_run_at = None;
    record.locked_at = Some(Utc::now());
    let record = store.insert(record).await.unwrap();

    repository.release(&record).await.unwrap();

    let after = store.get(record.id).await.unwrap().expect("still there");
    assert!(after.locked_at.is_some(), "completed job must keep its state");
}

#[tokio::test]
async fn batch_claim_stamps_only_the_requested_window() {
    let (store, repository) = fixture();
    let base = Utc::now() - Duration::seconds(60);
    let mut ids = Vec::new();
    for n in 0..5i64 {
        let record = store
            .insert(
                JobRecord::new("emails", serde_json::json!({ "n": n }))
                    .schedule(base + Duration::seconds(n)),
            )
            .await
            .unwrap();
        ids.push(record.id);
    }

    let now = Utc::now();
    let claimed = repository
        .batch_claim(
            "emails",
            3,
            now + Duration::seconds(5),
            now - Duration::seconds(600),
            now,
        )
        .await
        .unwrap();

    // the three earliest, in discovery order, all carrying our stamp
    assert_eq!(claimed.len(), 3);
    let claimed_ids: Vec<_> = claimed.iter().map(|record| record.id).collect();
    assert_eq!(claimed_ids, ids[..3].to_vec());
    assert!(claimed.iter().all(|record| record.locked_at == Some(now)));

    for id in &ids[3..] {
        let record = store.get(*id).await.unwrap().unwrap();
        assert!(record.locked_at.is_none());
    }
}

#[tokio::test]
async fn batch_claim_then_release_many_is_a_roundtrip() {
    let (store, repository) = fixture();
    for n in 0..4i64 {
        store
            .insert(
                JobRecord::new("emails", serde_json::Value::Null)
                    .schedule(Utc::now() - Duration::seconds(10 + n)),
            )
            .await
            .unwrap();
    }
    let before = store.all();

    let now = Utc::now();
    let claimed = repository
        .batch_claim(
            "emails",
            10,
            now + Duration::seconds(5),
            now - Duration::seconds(600),
            now,
        )
        .await
        .unwrap();
    assert_eq!(claimed.len(), 4);

    let ids: Vec<_> = claimed.iter().map(|record| record.id).collect();
    let released = repository.release_many(&ids).await.unwrap();
    assert_eq!(released, 4);
    assert_eq!(store.all(), before);
}

#[tokio::test]
async fn save_state_patches_only_execution_fields() {
    let (store, repository) = fixture();
    let record = store.insert(due("emails", 1)).await.unwrap();

    let mut finished = record.clone();
    finished.last_run_at = Some(Utc::now());
    finished.last_finished_at = Some(Utc::now());
    finished.next_run_at = None;
    finished.progress = Some(100);
    // local payload edits must not be written back by save_state
    finished.data = serde_json::json!({ "tampered": true });

    repository.save_state(&finished).await.unwrap();
    // saving the same state twice is a no-op
    repository.save_state(&finished).await.unwrap();

    let stored = store.get(record.id).await.unwrap().unwrap();
    assert_eq!(stored.last_finished_at, finished.last_finished_at);
    assert_eq!(stored.progress, Some(100));
    assert!(stored.next_run_at.is_none());
    assert_eq!(stored.data, serde_json::Value::Null);
}

#[tokio::test]
async fn save_state_fails_for_missing_documents() {
    let (_store, repository) = fixture();
    let record = due("emails", 1);

    let err = repository.save_state(&record).await.unwrap_err();
    assert!(matches!(err, CorralError::JobNotFound(id) if id == record.id));
}

#[tokio::test]
async fn queue_size_counts_jobs_already_due() {
    let (store, repository) = fixture();
    store.insert(due("emails", 10)).await.unwrap();
    store.insert(due("reports", 20)).await.unwrap();
    store
        .insert(
            JobRecord::new("emails", serde_json::Value::Null)
                .schedule(Utc::now() + Duration::minutes(5)),
        )
        .await
        .unwrap();

    assert_eq!(repository.queue_size().await.unwrap(), 2);
}

#[tokio::test]
async fn single_jobs_stay_unique_under_concurrent_creators() {
    let (store, repository) = fixture();
    let repository = Arc::new(repository);

    let mut tasks = Vec::new();
    for n in 0..10i64 {
        let repository = Arc::clone(&repository);
        tasks.push(tokio::spawn(async move {
            repository
                .save_new(JobRecord::single("digest", serde_json::json!({ "n": n })))
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(store.len(), 1);
}
