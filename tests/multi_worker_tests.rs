//! Multiple workers cooperating on one store: mutual exclusion, lock
//! stealing and quiescence.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use corral::{
    DefineOptions, JobProcessor, JobRecord, JobRegistry, JobRepository, JobStore, MemoryStore,
    ProcessorConfig,
};
use uuid::Uuid;

struct Cluster {
    store: Arc<MemoryStore>,
    registry: Arc<JobRegistry>,
    workers: Vec<Arc<JobProcessor>>,
}

/// Spin up `count` workers over one shared store and one shared registry.
fn cluster(count: usize, process_every: Duration) -> Cluster {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(JobRegistry::new());
    let workers = (0..count)
        .map(|n| {
            let repository = Arc::new(JobRepository::new(Arc::clone(&store) as Arc<dyn JobStore>));
            Arc::new(JobProcessor::new(
                Arc::clone(&registry),
                repository,
                ProcessorConfig::new(format!("worker-{n}")).with_process_every(process_every),
            ))
        })
        .collect();
    Cluster {
        store,
        registry,
        workers,
    }
}

impl Cluster {
    fn start(&self) {
        for worker in &self.workers {
            worker.start();
        }
    }

    fn stop(&self) {
        for worker in &self.workers {
            worker.stop();
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_ready_job_runs_on_exactly_one_worker() {
    let cluster = cluster(2, Duration::from_millis(30));
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    cluster.registry.define_fn(
        "solo",
        DefineOptions {
            lock_lifetime: Duration::from_secs(60),
            ..Default::default()
        },
        move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(())
            }
        },
    );
    let record = cluster
        .store
        .insert(
            JobRecord::new("solo", serde_json::Value::Null)
                .schedule(Utc::now() - chrono::Duration::seconds(1)),
        )
        .await
        .unwrap();

    cluster.start();
    tokio::time::sleep(Duration::from_millis(700)).await;
    cluster.stop();

    assert_eq!(runs.load(Ordering::SeqCst), 1, "both workers ran the job");
    let stored = cluster.store.get(record.id).await.unwrap().unwrap();
    assert!(stored.locked_at.is_none());
    assert!(stored.last_finished_at.is_some());
    assert_eq!(stored.fail_count, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_job_runs_exactly_once_across_the_fleet() {
    let cluster = cluster(3, Duration::from_millis(30));
    let counts: Arc<Mutex<HashMap<Uuid, usize>>> = Arc::new(Mutex::new(HashMap::new()));
    {
        let counts = Arc::clone(&counts);
        cluster.registry.define_fn(
            "fanout",
            DefineOptions {
                lock_lifetime: Duration::from_secs(60),
                ..Default::default()
            },
            move |job| {
                let counts = Arc::clone(&counts);
                async move {
                    *counts.lock().unwrap().entry(job.id()).or_insert(0) += 1;
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(())
                }
            },
        );
    }
    let mut ids = Vec::new();
    for n in 0..20i64 {
        let record = cluster
            .store
            .insert(
                JobRecord::new("fanout", serde_json::json!({ "n": n }))
                    .schedule(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
        ids.push(record.id);
    }

    cluster.start();
    tokio::time::sleep(Duration::from_millis(2000)).await;
    cluster.stop();

    let counts = counts.lock().unwrap().clone();
    for id in &ids {
        assert_eq!(counts.get(id), Some(&1), "job {id} did not run exactly once");
    }
    assert_eq!(counts.len(), ids.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_live_worker_steals_claims_from_a_dead_one() {
    let cluster = cluster(1, Duration::from_millis(30));
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&runs);
    cluster.registry.define_fn(
        "orphaned",
        DefineOptions {
            lock_lifetime: Duration::from_secs(30),
            ..Default::default()
        },
        move |_job| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        },
    );
    // a claim left behind by a worker that died two minutes ago
    let mut record = JobRecord::new("orphaned", serde_json::Value::Null)
        .schedule(Utc::now() - chrono::Duration::seconds(120));
    record.locked_at = Some(Utc::now() - chrono::Duration::seconds(120));
    let record = cluster.store.insert(record).await.unwrap();

    cluster.start();
    tokio::time::sleep(Duration::from_millis(500)).await;
    cluster.stop();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    let stored = cluster.store.get(record.id).await.unwrap().unwrap();
    assert!(stored.locked_at.is_none());
    assert!(stored.last_finished_at.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_locks_remain_after_the_fleet_goes_quiet() {
    let cluster = cluster(2, Duration::from_millis(30));
    cluster
        .registry
        .define_fn("burst", DefineOptions::default(), |_job| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        });
    for _ in 0..10 {
        cluster
            .store
            .insert(
                JobRecord::new("burst", serde_json::Value::Null)
                    .schedule(Utc::now() - chrono::Duration::seconds(1)),
            )
            .await
            .unwrap();
    }

    cluster.start();
    tokio::time::sleep(Duration::from_millis(1500)).await;
    cluster.stop();
    // quiescence: nothing is running, so no document may stay claimed
    tokio::time::sleep(Duration::from_millis(100)).await;

    for record in cluster.store.all() {
        assert!(
            record.locked_at.is_none(),
            "job {} leaked its lock",
            record.id
        );
    }
}
