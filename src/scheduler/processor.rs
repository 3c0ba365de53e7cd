use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ProcessorConfig;
use crate::error::CorralError;
use crate::events::{EventBus, SchedulerEvent};
use crate::job::handle::JobHandle;
use crate::job::record::JobRecord;
use crate::job::registry::JobRegistry;
use crate::scheduler::ready_queue::ReadyQueue;
use crate::scheduler::repository::JobRepository;

/// Sleeps longer than this are clamped so a deferred dispatch never
/// overflows a 32-bit millisecond timer; the dispatch that fires simply
/// re-evaluates the remaining wait.
const MAX_TIMER_DELAY: Duration = Duration::from_millis(1 << 31);

#[derive(Debug, Default, Clone, Serialize)]
pub struct NameCounters {
    pub locked: usize,
    pub running: usize,
    pub lock_limit_reached: u64,
}

struct ProcessorState {
    ready: ReadyQueue,
    locked: HashMap<Uuid, JobHandle>,
    running: HashMap<Uuid, JobHandle>,
    to_claim: VecDeque<JobHandle>,
    to_claim_ids: HashSet<Uuid>,
    job_status: HashMap<String, NameCounters>,
    next_scan_at: DateTime<Utc>,
    local_queue_processing: usize,
    local_lock_limit_reached: u64,
    claiming_on_the_fly: bool,
    filling: HashSet<String>,
}

/// Discovers ready jobs, claims them, and runs their handlers under a
/// liveness watchdog.
///
/// All bookkeeping lives behind one mutex that is only held between
/// suspension points, so the counters and collections are consistent
/// whenever the processor awaits storage or a handler.
pub struct JobProcessor {
    registry: Arc<JobRegistry>,
    repository: Arc<JobRepository>,
    events: EventBus,
    config: ProcessorConfig,
    state: Mutex<ProcessorState>,
    is_running: AtomicBool,
    shutdown: CancellationToken,
}

impl JobProcessor {
    pub fn new(
        registry: Arc<JobRegistry>,
        repository: Arc<JobRepository>,
        config: ProcessorConfig,
    ) -> Self {
        let state = ProcessorState {
            ready: ReadyQueue::with_capacity(config.max_queue_size),
            locked: HashMap::new(),
            running: HashMap::new(),
            to_claim: VecDeque::new(),
            to_claim_ids: HashSet::new(),
            job_status: HashMap::new(),
            next_scan_at: Utc::now(),
            local_queue_processing: 0,
            local_lock_limit_reached: 0,
            claiming_on_the_fly: false,
            filling: HashSet::new(),
        };
        Self {
            registry,
            repository,
            events: EventBus::new(),
            config,
            state: Mutex::new(state),
            is_running: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn repository(&self) -> &Arc<JobRepository> {
        &self.repository
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, ProcessorState> {
        self.state.lock().expect("processor state lock poisoned")
    }

    /// Spawn the periodic discovery tick. The first scan runs immediately.
    pub fn start(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let processor = Arc::clone(self);
        let process_every = self.config.process_every;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(process_every);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = processor.shutdown.cancelled() => break,
                    _ = tick.tick() => processor.process(None).await,
                }
            }
            tracing::debug!(queue = %processor.config.name, "tick loop stopped");
        });
        self.events.emit(SchedulerEvent::Ready);
        tracing::info!(
            queue = %self.config.name,
            process_every_ms = self.config.process_every.as_millis() as u64,
            max_concurrency = self.config.max_concurrency,
            "job processor started"
        );
    }

    /// Stop processing: no further scans or dispatches happen, and the
    /// currently claimed jobs are returned so the caller can drain
    /// in-flight handlers and release the rest.
    pub fn stop(&self) -> Vec<JobHandle> {
        self.is_running.store(false, Ordering::SeqCst);
        self.shutdown.cancel();
        let state = self.state();
        tracing::info!(
            queue = %self.config.name,
            claimed = state.locked.len(),
            running = state.running.len(),
            "job processor stopped"
        );
        state.locked.values().cloned().collect()
    }

    /// True when this worker may take another claim of `name` under both
    /// the per-name lock limit and the total lock limit (0 = no limit).
    pub fn should_lock(&self, name: &str) -> bool {
        let state = self.state();
        self.should_lock_inner(&state, name)
    }

    fn should_lock_inner(&self, state: &ProcessorState, name: &str) -> bool {
        let total_limit = self.config.total_lock_limit;
        if total_limit > 0 && state.locked.len() >= total_limit {
            return false;
        }
        let lock_limit = self
            .registry
            .get(name)
            .map(|definition| definition.lock_limit)
            .unwrap_or(0);
        if lock_limit > 0 {
            let locked = state
                .job_status
                .get(name)
                .map(|counters| counters.locked)
                .unwrap_or(0);
            if locked >= lock_limit {
                return false;
            }
        }
        true
    }

    /// Run one scheduling pass.
    ///
    /// Without `extra_job` this is a full discovery pass over every
    /// registered name. With `extra_job`, and when the job is due before
    /// the next periodic scan, the job is claimed right away instead of
    /// waiting out the tick.
    pub async fn process(self: &Arc<Self>, extra_job: Option<JobHandle>) {
        if !self.is_running() {
            return;
        }
        match extra_job {
            Some(job) => {
                let fast_path = {
                    let state = self.state();
                    matches!(job.next_run_at(), Some(at) if at < state.next_scan_at)
                };
                if fast_path {
                    {
                        let mut state = self.state();
                        if state.to_claim_ids.insert(job.id()) {
                            state.to_claim.push_back(job);
                        }
                    }
                    self.claim_on_the_fly().await;
                }
            }
            None => self.fill_queue().await,
        }
        self.dispatch().await;
    }

    async fn fill_queue(self: &Arc<Self>) {
        for name in self.registry.names() {
            if !self.is_running() {
                return;
            }
            self.fill_queue_for_name(&name).await;
        }
    }

    /// Discovery pass for one name: claim eligible documents in batches
    /// until a ceiling stops us or the store runs dry.
    async fn fill_queue_for_name(self: &Arc<Self>, name: &str) {
        {
            let mut state = self.state();
            if !state.filling.insert(name.to_string()) {
                return;
            }
        }
        let definition = match self.registry.get(name) {
            Some(definition) => definition,
            None => {
                self.state().filling.remove(name);
                return;
            }
        };

        loop {
            let batch_size = {
                let mut state = self.state();
                if !self.should_lock_inner(&state, name) {
                    state
                        .job_status
                        .entry(name.to_string())
                        .or_default()
                        .lock_limit_reached += 1;
                    state.local_lock_limit_reached += 1;
                    break;
                }
                let global_free = if self.config.total_lock_limit == 0 {
                    usize::MAX
                } else {
                    self.config.total_lock_limit.saturating_sub(state.locked.len())
                };
                let name_locked = state
                    .job_status
                    .get(name)
                    .map(|counters| counters.locked)
                    .unwrap_or(0);
                let per_name_free = if definition.lock_limit == 0 {
                    usize::MAX
                } else {
                    definition.lock_limit.saturating_sub(name_locked)
                };
                state.next_scan_at = Utc::now() + self.config.process_every;
                self.config.batch_size.min(global_free.min(per_name_free))
            };

            let now = Utc::now();
            let scan_horizon = now + self.config.process_every;
            let lock_deadline = now - definition.lock_lifetime;

            let claimed = if self.config.enable_batching && batch_size > 1 {
                self.repository
                    .batch_claim(name, batch_size, scan_horizon, lock_deadline, now)
                    .await
            } else {
                self.repository
                    .claim_next(name, scan_horizon, lock_deadline, now)
                    .await
                    .map(|record| record.into_iter().collect())
            };
            let claimed = match claimed {
                Ok(claimed) => claimed,
                Err(err) => {
                    tracing::error!(name, error = %err, "claim failed, leaving jobs for the next scan");
                    self.events.error(err);
                    break;
                }
            };
            if claimed.is_empty() {
                break;
            }

            let mut remaining: VecDeque<JobRecord> = claimed.into();
            let mut stop_name = false;
            while let Some(record) = remaining.pop_front() {
                if record.name != name {
                    tracing::error!(
                        job_id = %record.id,
                        expected = name,
                        got = %record.name,
                        "store returned a record from another queue, releasing"
                    );
                    if let Err(err) = self.repository.release(&record).await {
                        self.events.error(err);
                    }
                    stop_name = true;
                    break;
                }
                let slot_taken = {
                    let state = self.state();
                    !self.should_lock_inner(&state, name)
                };
                if slot_taken {
                    // a concurrent claim used the last slot after this batch
                    if let Err(err) = self.repository.release(&record).await {
                        self.events.error(err);
                    }
                    stop_name = true;
                    break;
                }
                let job = JobHandle::new(
                    record,
                    Arc::clone(&definition),
                    Arc::clone(&self.repository),
                );
                if !self.track_claimed(&job) {
                    self.handle_overflow(&job).await;
                    stop_name = true;
                    break;
                }
            }
            if stop_name {
                // give back whatever the batch still holds
                let leftover: Vec<Uuid> = remaining.iter().map(|record| record.id).collect();
                if let Err(err) = self.repository.release_many(&leftover).await {
                    self.events.error(err);
                }
                break;
            }
            let keep_going = {
                let state = self.state();
                self.should_lock_inner(&state, name)
            };
            if !keep_going {
                break;
            }
        }

        self.state().filling.remove(name);
    }

    /// Record a fresh claim in the bookkeeping and the ready queue.
    /// Returns false when the ready queue is full.
    fn track_claimed(&self, job: &JobHandle) -> bool {
        let mut state = self.state();
        if !state.ready.insert(job.clone()) {
            return false;
        }
        state.locked.insert(job.id(), job.clone());
        state.job_status.entry(job.name()).or_default().locked += 1;
        true
    }

    async fn handle_overflow(&self, job: &JobHandle) {
        let (queue_size, max_size) = {
            let state = self.state();
            (state.ready.len(), state.ready.max_size())
        };
        let name = job.name();
        tracing::warn!(name = %name, queue_size, max_size, "local queue full, releasing claim");
        self.events.emit(SchedulerEvent::QueueOverflow {
            name,
            queue_size,
            max_size,
        });
        if let Err(err) = self.repository.release(&job.attrs()).await {
            self.events.error(err);
        }
    }

    /// Claim jobs scheduled ahead of the next periodic scan, one at a time.
    /// Reentrancy-guarded so concurrent callers collapse into one drain.
    async fn claim_on_the_fly(self: &Arc<Self>) {
        {
            let mut state = self.state();
            if state.claiming_on_the_fly {
                return;
            }
            state.claiming_on_the_fly = true;
        }

        loop {
            if !self.is_running() {
                break;
            }
            let job = {
                let mut state = self.state();
                match state.to_claim.pop_front() {
                    Some(job) => {
                        state.to_claim_ids.remove(&job.id());
                        job
                    }
                    None => break,
                }
            };
            let blocked = {
                let mut state = self.state();
                if self.should_lock_inner(&state, &job.name()) {
                    false
                } else {
                    state
                        .job_status
                        .entry(job.name())
                        .or_default()
                        .lock_limit_reached += 1;
                    state.local_lock_limit_reached += 1;
                    // one blocked job abandons the whole buffer; the next
                    // periodic scan picks the dropped jobs up again
                    state.to_claim.clear();
                    state.to_claim_ids.clear();
                    true
                }
            };
            if blocked {
                break;
            }
            match self.repository.claim(&job.attrs()).await {
                Ok(Some(record)) => {
                    job.set_attrs(record);
                    if !self.track_claimed(&job) {
                        self.handle_overflow(&job).await;
                    }
                }
                Ok(None) => {
                    tracing::debug!(job_id = %job.id(), "job already claimed elsewhere");
                }
                Err(err) => self.events.error(err),
            }
        }

        self.state().claiming_on_the_fly = false;
    }

    fn dispatch_boxed(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.dispatch().await;
        })
    }

    fn execute_task(self: Arc<Self>, job: JobHandle) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            self.execute(job).await;
        })
    }

    /// Drop our claim bookkeeping for `job` and give the claim back.
    async fn drop_claim(&self, job: &JobHandle) {
        {
            let mut state = self.state();
            if state.locked.remove(&job.id()).is_some() {
                if let Some(counters) = state.job_status.get_mut(&job.name()) {
                    counters.locked = counters.locked.saturating_sub(1);
                }
            }
        }
        if let Err(err) = self.repository.release(&job.attrs()).await {
            self.events.error(err);
        }
    }

    /// Pull runnable jobs off the ready queue and start them, yielding
    /// between jobs so storage I/O and handlers keep flowing.
    async fn dispatch(self: &Arc<Self>) {
        {
            let mut state = self.state();
            state.local_queue_processing += 1;
        }
        let mut handled: HashSet<Uuid> = HashSet::new();
        loop {
            if !self.is_running() {
                break;
            }
            let job = {
                let mut state = self.state();
                if state.ready.is_empty() {
                    break;
                }
                let picked = {
                    let ProcessorState {
                        ready, job_status, ..
                    } = &*state;
                    let registry = &self.registry;
                    ready.pick_next_runnable(&handled, |name| {
                        let concurrency = registry
                            .get(name)
                            .map(|definition| definition.concurrency)
                            .unwrap_or(0);
                        let running = job_status
                            .get(name)
                            .map(|counters| counters.running)
                            .unwrap_or(0);
                        concurrency == 0 || running < concurrency
                    })
                };
                match picked {
                    None => break,
                    Some(job) => match state.ready.remove(&job) {
                        Ok(job) => job,
                        Err(_) => panic!(
                            "picked job {} vanished from the local queue",
                            job.id()
                        ),
                    },
                }
            };

            if job.is_expired() {
                // another worker stole the claim; drop our copy
                tracing::debug!(
                    job_id = %job.id(),
                    name = %job.name(),
                    "claim expired before dispatch, dropping"
                );
                let mut state = self.state();
                if state.locked.remove(&job.id()).is_some() {
                    if let Some(counters) = state.job_status.get_mut(&job.name()) {
                        counters.locked = counters.locked.saturating_sub(1);
                    }
                }
                continue;
            }

            let now = Utc::now();
            match job.next_run_at() {
                Some(at) if at > now => {
                    let wait = (at - now).to_std().unwrap_or(Duration::ZERO);
                    if wait > self.config.process_every {
                        // rescheduled too far out while queued; give it back
                        tracing::debug!(
                            job_id = %job.id(),
                            name = %job.name(),
                            wait_ms = wait.as_millis() as u64,
                            "job drifted past the next scan, releasing claim"
                        );
                        self.drop_claim(&job).await;
                    } else {
                        let requeued = {
                            let mut state = self.state();
                            state.ready.insert(job.clone())
                        };
                        if !requeued {
                            self.handle_overflow(&job).await;
                            {
                                let mut state = self.state();
                                if state.locked.remove(&job.id()).is_some() {
                                    if let Some(counters) = state.job_status.get_mut(&job.name()) {
                                        counters.locked = counters.locked.saturating_sub(1);
                                    }
                                }
                            }
                        } else if job.arm_timer() {
                            let processor = Arc::clone(self);
                            let timed_job = job.clone();
                            let delay = wait.min(MAX_TIMER_DELAY);
                            tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                timed_job.disarm_timer();
                                processor.dispatch_boxed().await;
                            });
                        }
                        handled.insert(job.id());
                    }
                }
                _ => {
                    self.run_or_retry(job.clone()).await;
                    handled.insert(job.id());
                }
            }

            let keep_going = {
                let state = self.state();
                self.config.max_concurrency == 0
                    || state.local_queue_processing < self.config.max_concurrency
            };
            if !keep_going {
                break;
            }
            tokio::task::yield_now().await;
        }
        {
            let mut state = self.state();
            state.local_queue_processing -= 1;
        }
    }

    /// Start `job` if the running ceilings allow it; otherwise it goes back
    /// to the ready queue for a later pass.
    async fn run_or_retry(self: &Arc<Self>, job: JobHandle) {
        if !self.is_running() {
            return;
        }
        let definition = Arc::clone(job.definition());
        let admitted = {
            let mut state = self.state();
            let name_running = state
                .job_status
                .get(&job.name())
                .map(|counters| counters.running)
                .unwrap_or(0);
            let name_free = definition.concurrency == 0 || name_running < definition.concurrency;
            let total_free = self.config.max_concurrency == 0
                || state.running.len() < self.config.max_concurrency;
            if name_free && total_free {
                state.running.insert(job.id(), job.clone());
                state.job_status.entry(job.name()).or_default().running += 1;
                Some(true)
            } else if state.ready.insert(job.clone()) {
                Some(false)
            } else {
                None
            }
        };
        match admitted {
            Some(true) => {
                tokio::spawn(Arc::clone(self).execute_task(job));
            }
            Some(false) => {}
            None => {
                // the queue filled while this job was out being dispatched
                self.handle_overflow(&job).await;
                let mut state = self.state();
                if state.locked.remove(&job.id()).is_some() {
                    if let Some(counters) = state.job_status.get_mut(&job.name()) {
                        counters.locked = counters.locked.saturating_sub(1);
                    }
                }
            }
        }
    }

    /// Run the handler under the liveness watchdog and reconcile final
    /// state with the store.
    async fn execute(self: &Arc<Self>, job: JobHandle) {
        let definition = Arc::clone(job.definition());
        self.events.emit(SchedulerEvent::ProcessJob(job.clone()));

        let watchdog_every =
            std::cmp::max(self.config.process_every / 2, definition.lock_lifetime / 2);
        let outcome: std::result::Result<(), String> = {
            let run = job.run();
            tokio::pin!(run);
            let mut watchdog = tokio::time::interval_at(
                tokio::time::Instant::now() + watchdog_every,
                watchdog_every,
            );
            loop {
                tokio::select! {
                    result = &mut run => break result.map_err(|err| err.to_string()),
                    _ = watchdog.tick() => {
                        if job.is_finished() {
                            // the handler settled; the run branch resolves next poll
                            continue;
                        }
                        if job.locked_at().is_none() {
                            let reason = format!(
                                "job {} lock is gone: the claim was released or finished elsewhere",
                                job.id()
                            );
                            job.cancel(reason.clone());
                            job.fail(reason.clone());
                            break Err(reason);
                        }
                        if job.is_expired() {
                            let reason = format!(
                                "job {} took longer than its lockLifetime of {}ms and was cancelled; \
                                 call touch() from the handler to keep the lock alive",
                                job.id(),
                                definition.lock_lifetime.as_millis()
                            );
                            job.cancel(reason.clone());
                            job.fail(reason.clone());
                            break Err(reason);
                        }
                    }
                }
            }
        };

        match &outcome {
            Ok(()) => {
                tracing::debug!(job_id = %job.id(), name = %job.name(), "job finished");
            }
            Err(reason) => {
                tracing::warn!(job_id = %job.id(), name = %job.name(), reason = %reason, "job failed");
                self.events.error(CorralError::JobFailed {
                    id: job.id(),
                    name: job.name(),
                    reason: reason.clone(),
                });
            }
        }

        if let Err(err) = self.repository.save_state(&job.attrs()).await {
            self.events.error(err);
        }

        {
            let mut state = self.state();
            if state.running.remove(&job.id()).is_none() {
                panic!(
                    "job {} finished but was not tracked as running",
                    job.id()
                );
            }
            if let Some(counters) = state.job_status.get_mut(&job.name()) {
                counters.running = counters.running.saturating_sub(1);
            }
            if state.locked.remove(&job.id()).is_some() {
                if let Some(counters) = state.job_status.get_mut(&job.name()) {
                    counters.locked = counters.locked.saturating_sub(1);
                }
            }
        }

        // a slot just freed up; see if more queued work fits
        self.dispatch().await;
    }

    /// Observable snapshot of the processor.
    pub fn status(&self, full_details: bool) -> ProcessorStatus {
        let state = self.state();
        let mut job_status: HashMap<String, NameStatus> = HashMap::new();
        let mut names: HashSet<String> = self.registry.names().into_iter().collect();
        names.extend(state.job_status.keys().cloned());
        for name in names {
            let counters = state.job_status.get(&name).cloned().unwrap_or_default();
            let definition = self.registry.get(&name);
            job_status.insert(
                name,
                NameStatus {
                    locked: counters.locked,
                    running: counters.running,
                    lock_limit_reached: counters.lock_limit_reached,
                    concurrency: definition.as_ref().map(|d| d.concurrency),
                    lock_limit: definition.as_ref().map(|d| d.lock_limit),
                    lock_lifetime_ms: definition
                        .as_ref()
                        .map(|d| d.lock_lifetime.as_millis() as u64),
                },
            );
        }
        ProcessorStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            queue_name: self.config.name.clone(),
            max_concurrency: self.config.max_concurrency,
            total_lock_limit: self.config.total_lock_limit,
            process_every_ms: self.config.process_every.as_millis() as u64,
            is_running: self.is_running(),
            job_status,
            queued_jobs: state.ready.len(),
            running_jobs: state.running.len(),
            locked_jobs: state.locked.len(),
            jobs_to_claim: state.to_claim.len(),
            local_queue_processing: state.local_queue_processing,
            local_lock_limit_reached: state.local_lock_limit_reached,
            queued_job_ids: full_details.then(|| state.ready.ids()),
            running_job_ids: full_details.then(|| state.running.keys().copied().collect()),
            locked_job_ids: full_details.then(|| state.locked.keys().copied().collect()),
            to_claim_ids: full_details.then(|| state.to_claim.iter().map(|j| j.id()).collect()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NameStatus {
    pub locked: usize,
    pub running: usize,
    pub lock_limit_reached: u64,
    pub concurrency: Option<usize>,
    pub lock_limit: Option<usize>,
    pub lock_lifetime_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatus {
    pub version: String,
    pub queue_name: String,
    pub max_concurrency: usize,
    pub total_lock_limit: usize,
    pub process_every_ms: u64,
    pub is_running: bool,
    pub job_status: HashMap<String, NameStatus>,
    pub queued_jobs: usize,
    pub running_jobs: usize,
    pub locked_jobs: usize,
    pub jobs_to_claim: usize,
    pub local_queue_processing: usize,
    pub local_lock_limit_reached: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queued_job_ids: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_job_ids: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locked_job_ids: Option<Vec<Uuid>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_claim_ids: Option<Vec<Uuid>>,
}
