use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{CorralError, Result};
use crate::job::record::JobRecord;
use crate::job::registry::JobDefinition;
use crate::scheduler::repository::JobRepository;

/// Handle to a claimed job: identity, mutable run state, cancellation and
/// the one-shot `run()` entry point.
///
/// Cloning is cheap; all clones share the same underlying job.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<Inner>,
}

struct Inner {
    attrs: Mutex<JobRecord>,
    definition: Arc<JobDefinition>,
    repository: Arc<JobRepository>,
    cancellation: CancellationToken,
    cancel_reason: Mutex<Option<String>>,
    ran: AtomicBool,
    finished: AtomicBool,
    timer_armed: AtomicBool,
}

impl JobHandle {
    pub fn new(
        record: JobRecord,
        definition: Arc<JobDefinition>,
        repository: Arc<JobRepository>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                attrs: Mutex::new(record),
                definition,
                repository,
                cancellation: CancellationToken::new(),
                cancel_reason: Mutex::new(None),
                ran: AtomicBool::new(false),
                finished: AtomicBool::new(false),
                timer_armed: AtomicBool::new(false),
            }),
        }
    }

    fn attrs_guard(&self) -> MutexGuard<'_, JobRecord> {
        self.inner.attrs.lock().expect("job attrs lock poisoned")
    }

    /// Snapshot of the job document as this worker last saw it.
    pub fn attrs(&self) -> JobRecord {
        self.attrs_guard().clone()
    }

    /// Replace the local snapshot, e.g. after a claim returned the stored
    /// document.
    pub fn set_attrs(&self, record: JobRecord) {
        *self.attrs_guard() = record;
    }

    pub fn id(&self) -> Uuid {
        self.attrs_guard().id
    }

    pub fn name(&self) -> String {
        self.attrs_guard().name.clone()
    }

    pub fn data(&self) -> serde_json::Value {
        self.attrs_guard().data.clone()
    }

    pub fn priority(&self) -> i8 {
        self.attrs_guard().priority
    }

    pub fn next_run_at(&self) -> Option<DateTime<Utc>> {
        self.attrs_guard().next_run_at
    }

    pub fn locked_at(&self) -> Option<DateTime<Utc>> {
        self.attrs_guard().locked_at
    }

    pub fn definition(&self) -> &Arc<JobDefinition> {
        &self.inner.definition
    }

    /// True when two handles refer to the same underlying job object.
    pub fn same(a: &JobHandle, b: &JobHandle) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// True when the claim has outlived the name's lock lifetime, or was
    /// never held.
    pub fn is_expired(&self) -> bool {
        match self.locked_at() {
            None => true,
            Some(locked_at) => locked_at + self.inner.definition.lock_lifetime <= Utc::now(),
        }
    }

    /// Token handlers can watch to wind down when the job is cancelled.
    pub fn cancellation(&self) -> CancellationToken {
        self.inner.cancellation.clone()
    }

    /// Signal the handler to wind down, remembering the reason.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::debug!(job_id = %self.id(), reason = %reason, "job cancelled");
        *self
            .inner
            .cancel_reason
            .lock()
            .expect("cancel reason lock poisoned") = Some(reason);
        self.inner.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancellation.is_cancelled()
    }

    pub fn cancel_reason(&self) -> Option<String> {
        self.inner
            .cancel_reason
            .lock()
            .expect("cancel reason lock poisoned")
            .clone()
    }

    /// Arm the deferred-dispatch timer. Returns false when it was already
    /// armed, so a job never holds two timers.
    pub fn arm_timer(&self) -> bool {
        !self.inner.timer_armed.swap(true, Ordering::SeqCst)
    }

    pub fn disarm_timer(&self) {
        self.inner.timer_armed.store(false, Ordering::SeqCst);
    }

    pub fn timer_armed(&self) -> bool {
        self.inner.timer_armed.load(Ordering::SeqCst)
    }

    /// True once `run()` has settled, either way. The watchdog uses this to
    /// tell a finished job from a lost lock.
    pub fn is_finished(&self) -> bool {
        self.inner.finished.load(Ordering::SeqCst)
    }

    /// Refresh the claim lease (and optionally the advisory progress) and
    /// persist it. Long handlers call this to keep their lock alive.
    pub async fn touch(&self, progress: Option<u8>) -> Result<()> {
        {
            let mut attrs = self.attrs_guard();
            attrs.locked_at = Some(Utc::now());
            if let Some(progress) = progress {
                attrs.progress = Some(progress.min(100));
            }
        }
        self.inner.repository.save_state(&self.attrs()).await
    }

    /// Record a failure: bump `fail_count`, remember the reason, stamp the
    /// failure and finish times, and drop the lock so the job can retry.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let now = Utc::now();
        let mut attrs = self.attrs_guard();
        attrs.fail_count += 1;
        attrs.fail_reason = Some(reason.clone());
        attrs.failed_at = Some(now);
        attrs.last_finished_at = Some(now);
        attrs.locked_at = None;
        tracing::debug!(
            job_id = %attrs.id,
            name = %attrs.name,
            fail_count = attrs.fail_count,
            reason = %reason,
            "job failed"
        );
    }

    /// Run the handler. Callable at most once per claim.
    ///
    /// Stamps `last_run_at`, advances `next_run_at` for recurring jobs (or
    /// clears it), and on completion stamps `last_finished_at` and drops
    /// the lock. The caller persists the resulting state.
    pub async fn run(&self) -> Result<()> {
        if self.inner.ran.swap(true, Ordering::SeqCst) {
            return Err(CorralError::AlreadyRun(self.id()));
        }
        let now = Utc::now();
        {
            let mut attrs = self.attrs_guard();
            attrs.last_run_at = Some(now);
            attrs.next_run_at = attrs.repeat_interval.map(|every| now + every);
        }
        tracing::debug!(job_id = %self.id(), name = %self.name(), "running job");

        let handler = Arc::clone(&self.inner.definition.handler);
        let result = match handler.run(self.clone()).await {
            Ok(()) => {
                let mut attrs = self.attrs_guard();
                attrs.last_finished_at = Some(Utc::now());
                attrs.locked_at = None;
                Ok(())
            }
            Err(err) => {
                let reason = err.to_string();
                self.fail(reason.clone());
                Err(CorralError::JobFailed {
                    id: self.id(),
                    name: self.name(),
                    reason,
                })
            }
        };
        self.inner.finished.store(true, Ordering::SeqCst);
        result
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attrs = self.attrs();
        f.debug_struct("JobHandle")
            .field("id", &attrs.id)
            .field("name", &attrs.name)
            .field("next_run_at", &attrs.next_run_at)
            .field("locked_at", &attrs.locked_at)
            .finish_non_exhaustive()
    }
}
