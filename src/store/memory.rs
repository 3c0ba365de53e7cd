use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::job::record::{JobRecord, JobType};
use crate::store::{claim_order, JobFilter, JobStore, JobUpdate, StoreError, StoreResult};

/// In-memory job collection.
///
/// Backs the demo worker and the test suite. A single mutex around the map
/// makes every operation atomic, which is exactly the consistency model the
/// scheduler expects from a real document store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobRecord>> {
        self.jobs.lock().expect("memory store lock poisoned")
    }

    /// Every document, in claim order. Test and demo helper.
    pub fn all(&self) -> Vec<JobRecord> {
        let jobs = self.guard();
        let mut records: Vec<JobRecord> = jobs.values().cloned().collect();
        records.sort_by(claim_order);
        records
    }

    pub fn len(&self) -> usize {
        self.guard().len()
    }

    pub fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    fn matching(jobs: &HashMap<Uuid, JobRecord>, filter: &JobFilter) -> Vec<Uuid> {
        let mut records: Vec<&JobRecord> = jobs.values().filter(|r| filter.matches(r)).collect();
        records.sort_by(|a, b| claim_order(a, b));
        records.into_iter().map(|r| r.id).collect()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, record: JobRecord) -> StoreResult<JobRecord> {
        let mut jobs = self.guard();
        if jobs.contains_key(&record.id) {
            return Err(StoreError::duplicate_key(format!(
                "duplicate key error on insert: {}",
                record.id
            )));
        }
        jobs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn upsert_single(&self, record: JobRecord) -> StoreResult<JobRecord> {
        let mut jobs = self.guard();
        let existing = jobs
            .values()
            .find(|r| r.name == record.name && r.job_type == JobType::Single)
            .map(|r| r.id);
        match existing {
            Some(id) => {
                let stored = jobs
                    .get_mut(&id)
                    .ok_or_else(|| StoreError::other("single record vanished during upsert"))?;
                // update side: the stored schedule wins
                stored.data = record.data;
                stored.priority = record.priority;
                stored.disabled = record.disabled;
                stored.repeat_interval = record.repeat_interval;
                Ok(stored.clone())
            }
            None => {
                jobs.insert(record.id, record.clone());
                Ok(record)
            }
        }
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<JobRecord>> {
        Ok(self.guard().get(&id).cloned())
    }

    async fn find_one_and_update(
        &self,
        filter: &JobFilter,
        update: &JobUpdate,
    ) -> StoreResult<Option<JobRecord>> {
        let mut jobs = self.guard();
        let id = match Self::matching(&jobs, filter).first() {
            Some(id) => *id,
            None => return Ok(None),
        };
        let record = jobs
            .get_mut(&id)
            .ok_or_else(|| StoreError::other("record vanished during update"))?;
        update.apply(record);
        Ok(Some(record.clone()))
    }

    async fn find_many(
        &self,
        filter: &JobFilter,
        limit: Option<usize>,
    ) -> StoreResult<Vec<JobRecord>> {
        let jobs = self.guard();
        let mut ids = Self::matching(&jobs, filter);
        if let Some(limit) = limit {
            ids.truncate(limit);
        }
        Ok(ids.into_iter().filter_map(|id| jobs.get(&id).cloned()).collect())
    }

    async fn update_one(&self, filter: &JobFilter, update: &JobUpdate) -> StoreResult<u64> {
        let mut jobs = self.guard();
        let id = match Self::matching(&jobs, filter).first() {
            Some(id) => *id,
            None => return Ok(0),
        };
        if let Some(record) = jobs.get_mut(&id) {
            update.apply(record);
        }
        Ok(1)
    }

    async fn update_many(&self, filter: &JobFilter, update: &JobUpdate) -> StoreResult<u64> {
        let mut jobs = self.guard();
        let ids = Self::matching(&jobs, filter);
        for id in &ids {
            if let Some(record) = jobs.get_mut(id) {
                update.apply(record);
            }
        }
        Ok(ids.len() as u64)
    }

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64> {
        let jobs = self.guard();
        Ok(jobs.values().filter(|r| filter.matches(r)).count() as u64)
    }

    async fn delete_many(&self, filter: &JobFilter) -> StoreResult<u64> {
        let mut jobs = self.guard();
        let ids = Self::matching(&jobs, filter);
        for id in &ids {
            jobs.remove(id);
        }
        Ok(ids.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::store::LockFilter;

    fn due_job(name: &str, secs_ago: i64) -> JobRecord {
        let mut record = JobRecord::new(name, serde_json::Value::Null);
        record.next_run_at = Some(Utc::now() - Duration::seconds(secs_ago));
        record
    }

    #[test]
    fn claimable_filter_matches_due_unlocked_jobs() {
        let now = Utc::now();
        let filter = JobFilter {
            name: Some("emails".to_string()),
            enabled_only: true,
            lock: Some(LockFilter::Claimable {
                scan_horizon: now + Duration::seconds(5),
                lock_deadline: now - Duration::seconds(600),
            }),
            ..Default::default()
        };

        let due = due_job("emails", 1);
        assert!(filter.matches(&due));

        let mut future = due_job("emails", 1);
        future.next_run_at = Some(now + Duration::seconds(60));
        assert!(!filter.matches(&future));

        let mut disabled = due_job("emails", 1);
        disabled.disabled = true;
        assert!(!filter.matches(&disabled));

        let mut held = due_job("emails", 1);
        held.locked_at = Some(now - Duration::seconds(30));
        assert!(!filter.matches(&held));

        // a claim older than the deadline can be stolen
        let mut stale = due_job("emails", 1);
        stale.locked_at = Some(now - Duration::seconds(700));
        assert!(filter.matches(&stale));
    }

    #[tokio::test]
    async fn find_one_and_update_picks_highest_priority_first() {
        let store = MemoryStore::new();
        let at = Utc::now() - Duration::seconds(1);
        for priority in [0i8, 10, -10] {
            let mut record = due_job("emails", 1);
            record.next_run_at = Some(at);
            record.priority = priority;
            store.insert(record).await.unwrap();
        }

        let filter = JobFilter {
            name: Some("emails".to_string()),
            lock: Some(LockFilter::Unlocked),
            ..Default::default()
        };
        let claimed = store
            .find_one_and_update(&filter, &JobUpdate::lock(Utc::now()))
            .await
            .unwrap()
            .expect("one record claimed");
        assert_eq!(claimed.priority, 10);
        assert!(claimed.locked_at.is_some());
    }

    #[tokio::test]
    async fn upsert_single_keeps_one_record_and_its_schedule() {
        let store = MemoryStore::new();
        let first_run = Utc::now() + Duration::seconds(30);

        let mut first = JobRecord::single("heartbeat", serde_json::json!({"rev": 1}));
        first.next_run_at = Some(first_run);
        store.upsert_single(first).await.unwrap();

        let mut second = JobRecord::single("heartbeat", serde_json::json!({"rev": 2}));
        second.next_run_at = Some(Utc::now() + Duration::seconds(600));
        let stored = store.upsert_single(second).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(stored.data, serde_json::json!({"rev": 2}));
        assert_eq!(stored.next_run_at, Some(first_run));
    }
}
