use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Named priority levels. Any value in `LOWEST..=HIGHEST` is valid.
pub mod priority {
    pub const HIGHEST: i8 = 20;
    pub const HIGH: i8 = 10;
    pub const NORMAL: i8 = 0;
    pub const LOW: i8 = -10;
    pub const LOWEST: i8 = -20;
}

pub fn clamp_priority(value: i8) -> i8 {
    value.clamp(priority::LOWEST, priority::HIGHEST)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// Any number of records may exist per name.
    Normal,
    /// At most one record exists per name.
    Single,
}

impl std::fmt::Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobType::Normal => write!(f, "normal"),
            JobType::Single => write!(f, "single"),
        }
    }
}

/// A job document as it lives in the shared store.
///
/// A job is claimed exactly when `locked_at` is set; the claim is a lease
/// that other workers may steal once it outlives the name's lock lifetime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    /// Handler type; jobs are discovered per name.
    pub name: String,
    /// Handler-defined payload.
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Higher runs earlier when `next_run_at` ties. Clamped to [-20, 20].
    pub priority: i8,
    /// Next eligible execution; unset means the job is not scheduled.
    pub next_run_at: Option<DateTime<Utc>>,
    /// When a worker claimed the job; unset means unclaimed.
    pub locked_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_finished_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub fail_count: u32,
    pub fail_reason: Option<String>,
    /// Advisory completion percentage, 0..=100.
    pub progress: Option<u8>,
    /// Disabled jobs are skipped during discovery.
    pub disabled: bool,
    /// When set, a run reschedules the job this far from its start.
    pub repeat_interval: Option<Duration>,
}

impl JobRecord {
    /// A new job of `name`, scheduled to run now.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            data,
            job_type: JobType::Normal,
            priority: priority::NORMAL,
            next_run_at: Some(Utc::now()),
            locked_at: None,
            last_run_at: None,
            last_finished_at: None,
            failed_at: None,
            fail_count: 0,
            fail_reason: None,
            progress: None,
            disabled: false,
            repeat_interval: None,
        }
    }

    /// A new single-type job; the store keeps at most one per name.
    pub fn single(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            job_type: JobType::Single,
            ..Self::new(name, data)
        }
    }

    pub fn with_priority(mut self, value: i8) -> Self {
        self.priority = clamp_priority(value);
        self
    }

    pub fn schedule(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at = Some(at);
        self
    }

    pub fn repeat_every(mut self, every: Duration) -> Self {
        self.repeat_interval = Some(every);
        self
    }

    pub fn is_claimed(&self) -> bool {
        self.locked_at.is_some()
    }
}
