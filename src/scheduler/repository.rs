use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{CorralError, Result};
use crate::job::record::{JobRecord, JobType};
use crate::scheduler::retry::{RetryExecutor, RetryOptions};
use crate::store::{JobFilter, JobStore, JobUpdate, LockFilter};

/// Typed operations on the shared job collection.
///
/// Every mutation is one conditional atomic update, so competing workers
/// coordinate purely through the store. Claim paths run under the retry
/// executor because they hit the hottest documents.
pub struct JobRepository {
    store: Arc<dyn JobStore>,
    retry: RetryExecutor,
}

impl JobRepository {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self::with_retry(store, RetryOptions::default())
    }

    pub fn with_retry(store: Arc<dyn JobStore>, options: RetryOptions) -> Self {
        Self {
            store,
            retry: RetryExecutor::new(options),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Claim one specific job. Returns None when another worker won the
    /// race or the job was disabled in the meantime.
    pub async fn claim(&self, record: &JobRecord) -> Result<Option<JobRecord>> {
        let filter = JobFilter {
            id: Some(record.id),
            name: Some(record.name.clone()),
            enabled_only: true,
            lock: Some(LockFilter::Unlocked),
            ..Default::default()
        };
        let update = JobUpdate::lock(Utc::now());
        let claimed = self
            .retry
            .execute(|| self.store.find_one_and_update(&filter, &update))
            .await?;
        Ok(claimed)
    }

    /// Claim the next eligible job of `name`: unlocked and due before
    /// `scan_horizon`, or holding a claim stale since `lock_deadline`.
    pub async fn claim_next(
        &self,
        name: &str,
        scan_horizon: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        let filter = JobFilter {
            name: Some(name.to_string()),
            enabled_only: true,
            lock: Some(LockFilter::Claimable {
                scan_horizon,
                lock_deadline,
            }),
            ..Default::default()
        };
        let update = JobUpdate::lock(now);
        let claimed = self
            .retry
            .execute(|| self.store.find_one_and_update(&filter, &update))
            .await?;
        Ok(claimed)
    }

    /// Claim up to `batch_size` eligible jobs of `name` in two phases:
    /// select candidate ids, then stamp `locked_at = now` on the ones that
    /// are still claimable in a single multi-document update, and read back
    /// only the documents carrying our stamp. One multi-update replaces
    /// `batch_size` independent contention events, and the stamp filter on
    /// the second phase tolerates stealers that got in between.
    pub async fn batch_claim(
        &self,
        name: &str,
        batch_size: usize,
        scan_horizon: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        if batch_size == 0 {
            return Ok(Vec::new());
        }
        let eligible = JobFilter {
            name: Some(name.to_string()),
            enabled_only: true,
            lock: Some(LockFilter::Claimable {
                scan_horizon,
                lock_deadline,
            }),
            ..Default::default()
        };
        let claimed = self
            .retry
            .execute(|| async {
                let candidates = self.store.find_many(&eligible, Some(batch_size)).await?;
                if candidates.is_empty() {
                    return Ok(Vec::new());
                }
                let ids: Vec<Uuid> = candidates.iter().map(|record| record.id).collect();

                let still_claimable = JobFilter {
                    ids: Some(ids.clone()),
                    lock: Some(LockFilter::UnlockedOrExpired(lock_deadline)),
                    ..Default::default()
                };
                let stamped = self
                    .store
                    .update_many(&still_claimable, &JobUpdate::lock(now))
                    .await?;
                if stamped == 0 {
                    return Ok(Vec::new());
                }

                let ours = JobFilter {
                    ids: Some(ids.clone()),
                    locked_at_eq: Some(now),
                    ..Default::default()
                };
                let mut won = self.store.find_many(&ours, None).await?;
                // hand jobs back in the order the first phase picked them
                won.sort_by_key(|record| ids.iter().position(|id| *id == record.id));
                Ok(won)
            })
            .await?;
        Ok(claimed)
    }

    /// Give a claim back without running the job. The `next_run_at` guard
    /// keeps a release from un-finishing a job whose schedule was cleared
    /// by completion.
    pub async fn release(&self, record: &JobRecord) -> Result<()> {
        let filter = JobFilter {
            id: Some(record.id),
            scheduled_only: true,
            ..Default::default()
        };
        self.store.update_one(&filter, &JobUpdate::unlock()).await?;
        tracing::debug!(job_id = %record.id, name = %record.name, "claim released");
        Ok(())
    }

    /// Release every claim in `ids`. Returns how many documents matched.
    pub async fn release_many(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let filter = JobFilter {
            ids: Some(ids.to_vec()),
            scheduled_only: true,
            ..Default::default()
        };
        let released = self.store.update_many(&filter, &JobUpdate::unlock()).await?;
        tracing::debug!(requested = ids.len(), released, "claims released");
        Ok(released)
    }

    /// Persist the mutable execution fields of `record`. Fails when the
    /// document no longer exists.
    pub async fn save_state(&self, record: &JobRecord) -> Result<()> {
        let filter = JobFilter {
            id: Some(record.id),
            name: Some(record.name.clone()),
            ..Default::default()
        };
        let matched = self
            .store
            .update_one(&filter, &JobUpdate::run_state(record))
            .await?;
        if matched == 0 {
            return Err(CorralError::JobNotFound(record.id));
        }
        Ok(())
    }

    /// Advisory count of jobs already due.
    pub async fn queue_size(&self) -> Result<u64> {
        let filter = JobFilter {
            due_before: Some(Utc::now()),
            ..Default::default()
        };
        Ok(self.store.count(&filter).await?)
    }

    /// Persist a new job. Single-type jobs go through the upsert that keeps
    /// one document per name even under concurrent creators.
    pub async fn save_new(&self, record: JobRecord) -> Result<JobRecord> {
        match record.job_type {
            JobType::Single => {
                let saved = self
                    .retry
                    .execute(|| self.store.upsert_single(record.clone()))
                    .await?;
                Ok(saved)
            }
            JobType::Normal => Ok(self.store.insert(record).await?),
        }
    }
}
