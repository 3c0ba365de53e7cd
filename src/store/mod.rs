//! Storage contract for the shared job collection.
//!
//! The scheduler treats the document store as its only shared mutable
//! resource: every cross-worker mutation goes through a single conditional
//! atomic update here. Backends implement [`JobStore`]; the bundled
//! [`memory::MemoryStore`] is the reference backend used by the demo worker
//! and the test suite.
//!
//! # Required indexes
//!
//! A persistent backend needs these indexes to stay correct at scale:
//!
//! - `{name, disabled, next_run_at, locked_at, priority DESC}` — discovery
//! - `{locked_at, name}` partial on `locked_at != null` — lock cleanup
//! - `{name, last_finished_at DESC}` — status queries

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::job::record::{JobRecord, JobType};

pub mod memory;

/// Backend code for a duplicate key violation on insert/upsert.
pub const DUPLICATE_KEY: i32 = 11000;
/// Backend code for an optimistic write conflict.
pub const WRITE_CONFLICT: i32 = 112;

/// Error surfaced by a store backend. Carries the backend's numeric code
/// and code name so callers can tell conflicts from real failures.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StoreError {
    pub code: Option<i32>,
    pub code_name: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn duplicate_key(message: impl Into<String>) -> Self {
        Self {
            code: Some(DUPLICATE_KEY),
            code_name: Some("DuplicateKey".to_string()),
            message: message.into(),
        }
    }

    pub fn write_conflict(message: impl Into<String>) -> Self {
        Self {
            code: Some(WRITE_CONFLICT),
            code_name: Some("WriteConflict".to_string()),
            message: message.into(),
        }
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self {
            code: None,
            code_name: None,
            message: message.into(),
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Lock-state predicate for conditional updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFilter {
    /// `locked_at` is unset.
    Unlocked,
    /// `locked_at` is set and at or before the given instant.
    LockedOnOrBefore(DateTime<Utc>),
    /// Unlocked, or locked at or before the given instant (a stale claim).
    UnlockedOrExpired(DateTime<Utc>),
    /// The discovery predicate: unlocked and due before `scan_horizon`, or
    /// holding a claim that went stale at `lock_deadline`.
    Claimable {
        scan_horizon: DateTime<Utc>,
        lock_deadline: DateTime<Utc>,
    },
}

/// Typed query over the job collection. All set fields must match.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub id: Option<Uuid>,
    pub ids: Option<Vec<Uuid>>,
    pub name: Option<String>,
    pub job_type: Option<JobType>,
    /// Skip disabled jobs.
    pub enabled_only: bool,
    pub lock: Option<LockFilter>,
    /// `locked_at` equals this exact stamp.
    pub locked_at_eq: Option<DateTime<Utc>>,
    /// `next_run_at` is set.
    pub scheduled_only: bool,
    /// `next_run_at` is set and strictly before this instant.
    pub due_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn by_id(id: Uuid) -> Self {
        Self {
            id: Some(id),
            ..Default::default()
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        if let Some(id) = self.id {
            if record.id != id {
                return false;
            }
        }
        if let Some(ids) = &self.ids {
            if !ids.contains(&record.id) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if record.name != *name {
                return false;
            }
        }
        if let Some(job_type) = self.job_type {
            if record.job_type != job_type {
                return false;
            }
        }
        if self.enabled_only && record.disabled {
            return false;
        }
        if self.scheduled_only && record.next_run_at.is_none() {
            return false;
        }
        if let Some(before) = self.due_before {
            match record.next_run_at {
                Some(at) if at < before => {}
                _ => return false,
            }
        }
        if let Some(stamp) = self.locked_at_eq {
            if record.locked_at != Some(stamp) {
                return false;
            }
        }
        if let Some(lock) = self.lock {
            let ok = match lock {
                LockFilter::Unlocked => record.locked_at.is_none(),
                LockFilter::LockedOnOrBefore(deadline) => {
                    matches!(record.locked_at, Some(at) if at <= deadline)
                }
                LockFilter::UnlockedOrExpired(deadline) => {
                    record.locked_at.is_none()
                        || matches!(record.locked_at, Some(at) if at <= deadline)
                }
                LockFilter::Claimable {
                    scan_horizon,
                    lock_deadline,
                } => {
                    let due = matches!(record.next_run_at, Some(at) if at <= scan_horizon);
                    (record.locked_at.is_none() && due)
                        || matches!(record.locked_at, Some(at) if at <= lock_deadline)
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }
}

/// Partial update of a job document. `Some(None)` clears an optional field.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub locked_at: Option<Option<DateTime<Utc>>>,
    pub next_run_at: Option<Option<DateTime<Utc>>>,
    pub last_run_at: Option<Option<DateTime<Utc>>>,
    pub last_finished_at: Option<Option<DateTime<Utc>>>,
    pub failed_at: Option<Option<DateTime<Utc>>>,
    pub fail_count: Option<u32>,
    pub fail_reason: Option<Option<String>>,
    pub progress: Option<Option<u8>>,
    pub disabled: Option<bool>,
    pub data: Option<serde_json::Value>,
}

impl JobUpdate {
    /// Stamp a claim.
    pub fn lock(at: DateTime<Utc>) -> Self {
        Self {
            locked_at: Some(Some(at)),
            ..Default::default()
        }
    }

    /// Give a claim back.
    pub fn unlock() -> Self {
        Self {
            locked_at: Some(None),
            ..Default::default()
        }
    }

    /// Patch of the mutable execution fields, taken from `record`.
    pub fn run_state(record: &JobRecord) -> Self {
        Self {
            locked_at: Some(record.locked_at),
            next_run_at: Some(record.next_run_at),
            last_run_at: Some(record.last_run_at),
            last_finished_at: Some(record.last_finished_at),
            failed_at: Some(record.failed_at),
            fail_count: Some(record.fail_count),
            fail_reason: Some(record.fail_reason.clone()),
            progress: Some(record.progress),
            ..Default::default()
        }
    }

    pub fn apply(&self, record: &mut JobRecord) {
        if let Some(locked_at) = self.locked_at {
            record.locked_at = locked_at;
        }
        if let Some(next_run_at) = self.next_run_at {
            record.next_run_at = next_run_at;
        }
        if let Some(last_run_at) = self.last_run_at {
            record.last_run_at = last_run_at;
        }
        if let Some(last_finished_at) = self.last_finished_at {
            record.last_finished_at = last_finished_at;
        }
        if let Some(failed_at) = self.failed_at {
            record.failed_at = failed_at;
        }
        if let Some(fail_count) = self.fail_count {
            record.fail_count = fail_count;
        }
        if let Some(fail_reason) = &self.fail_reason {
            record.fail_reason = fail_reason.clone();
        }
        if let Some(progress) = self.progress {
            record.progress = progress;
        }
        if let Some(disabled) = self.disabled {
            record.disabled = disabled;
        }
        if let Some(data) = &self.data {
            record.data = data.clone();
        }
    }
}

/// Discovery order: `next_run_at` ascending (unset first), then priority
/// descending. Ties beyond that keep the backend's stable order.
pub fn claim_order(a: &JobRecord, b: &JobRecord) -> Ordering {
    match (a.next_run_at, b.next_run_at) {
        (None, Some(_)) => return Ordering::Less,
        (Some(_), None) => return Ordering::Greater,
        (Some(x), Some(y)) => {
            let by_time = x.cmp(&y);
            if by_time != Ordering::Equal {
                return by_time;
            }
        }
        (None, None) => {}
    }
    b.priority.cmp(&a.priority)
}

/// A document collection with conditional atomic updates.
///
/// Queries that return or pick documents do so in [`claim_order`]. Every
/// method is a single atomic step from the point of view of other workers.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new document. Fails with a duplicate key error when the id
    /// is already present.
    async fn insert(&self, record: JobRecord) -> StoreResult<JobRecord>;

    /// Upsert keyed on `{name, type: single}` so at most one document per
    /// name exists. `next_run_at` is only written on the insert side; on
    /// the update side the stored schedule wins.
    async fn upsert_single(&self, record: JobRecord) -> StoreResult<JobRecord>;

    async fn get(&self, id: Uuid) -> StoreResult<Option<JobRecord>>;

    /// Atomically update the first matching document (in [`claim_order`])
    /// and return it with the update applied.
    async fn find_one_and_update(
        &self,
        filter: &JobFilter,
        update: &JobUpdate,
    ) -> StoreResult<Option<JobRecord>>;

    /// Matching documents in [`claim_order`], up to `limit`.
    async fn find_many(
        &self,
        filter: &JobFilter,
        limit: Option<usize>,
    ) -> StoreResult<Vec<JobRecord>>;

    /// Update the first matching document. Returns the matched count (0 or 1).
    async fn update_one(&self, filter: &JobFilter, update: &JobUpdate) -> StoreResult<u64>;

    /// Update every matching document in one atomic step. Returns the
    /// matched count.
    async fn update_many(&self, filter: &JobFilter, update: &JobUpdate) -> StoreResult<u64>;

    async fn count(&self, filter: &JobFilter) -> StoreResult<u64>;

    async fn delete_many(&self, filter: &JobFilter) -> StoreResult<u64>;
}
