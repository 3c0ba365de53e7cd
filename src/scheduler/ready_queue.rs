use std::cmp::Ordering;
use std::collections::HashSet;

use uuid::Uuid;

use crate::error::{CorralError, Result};
use crate::job::handle::JobHandle;

pub const DEFAULT_MAX_QUEUE_SIZE: usize = 10_000;

/// Claimed jobs waiting for their run time.
///
/// Kept sorted by `(next_run_at ascending, priority descending)` with FIFO
/// order for ties, so index 0 is the most urgent job and the rightmost
/// element is the least urgent.
#[derive(Debug)]
pub struct ReadyQueue {
    jobs: Vec<JobHandle>,
    max_size: usize,
}

impl Default for ReadyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadyQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_QUEUE_SIZE)
    }

    pub fn with_capacity(max_size: usize) -> Self {
        Self {
            jobs: Vec::new(),
            max_size,
        }
    }

    fn order(a: &JobHandle, b: &JobHandle) -> Ordering {
        match (a.next_run_at(), b.next_run_at()) {
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
        b.priority().cmp(&a.priority())
    }

    /// Insert at the sorted position. Returns false when the queue is at
    /// capacity; the caller must release the claim so the job isn't leaked.
    pub fn insert(&mut self, job: JobHandle) -> bool {
        if self.jobs.len() >= self.max_size {
            return false;
        }
        let position = self
            .jobs
            .partition_point(|existing| Self::order(existing, &job) != Ordering::Greater);
        self.jobs.insert(position, job);
        true
    }

    /// Remove and return the rightmost (least urgent) job.
    pub fn pop(&mut self) -> Option<JobHandle> {
        self.jobs.pop()
    }

    /// Remove a job, matching by handle identity first and id second.
    pub fn remove(&mut self, job: &JobHandle) -> Result<JobHandle> {
        let position = self
            .jobs
            .iter()
            .position(|queued| JobHandle::same(queued, job))
            .or_else(|| self.jobs.iter().position(|queued| queued.id() == job.id()));
        match position {
            Some(index) => Ok(self.jobs.remove(index)),
            None => Err(CorralError::JobNotFound(job.id())),
        }
    }

    /// Scan from the rightmost end and return the first job not in
    /// `excluded` whose name still has running capacity. The rightward bias
    /// hands out less urgent work first, preserving the urgent left end for
    /// dispatch passes triggered by newly arrived jobs.
    pub fn pick_next_runnable(
        &self,
        excluded: &HashSet<Uuid>,
        mut has_capacity: impl FnMut(&str) -> bool,
    ) -> Option<JobHandle> {
        for job in self.jobs.iter().rev() {
            if excluded.contains(&job.id()) {
                continue;
            }
            if has_capacity(&job.name()) {
                return Some(job.clone());
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Fill ratio in `[0, 1]`, for back-pressure decisions.
    pub fn utilization(&self) -> f64 {
        if self.max_size == 0 {
            return 1.0;
        }
        self.jobs.len() as f64 / self.max_size as f64
    }

    pub fn is_near_capacity(&self, threshold: f64) -> bool {
        self.utilization() >= threshold
    }

    /// Queued job ids in urgency order, for status reporting.
    pub fn ids(&self) -> Vec<Uuid> {
        self.jobs.iter().map(|job| job.id()).collect()
    }
}
