use std::time::Duration;

pub const DEFAULT_MAX_CONCURRENCY: usize = 20;
pub const DEFAULT_BATCH_SIZE: usize = 5;
pub const DEFAULT_PROCESS_EVERY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Queue name, used for logging and the status snapshot.
    pub name: String,
    /// Maximum number of handlers running at once on this worker.
    pub max_concurrency: usize,
    /// Maximum number of claims held at once across all job names. 0 means no limit.
    pub total_lock_limit: usize,
    /// Cadence of the periodic discovery scan.
    pub process_every: Duration,
    /// How many documents a single discovery round trip may claim.
    pub batch_size: usize,
    /// When false, discovery claims one document per round trip.
    pub enable_batching: bool,
    /// Capacity of the local ready queue.
    pub max_queue_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            total_lock_limit: 0,
            process_every: DEFAULT_PROCESS_EVERY,
            batch_size: DEFAULT_BATCH_SIZE,
            enable_batching: true,
            max_queue_size: crate::scheduler::ready_queue::DEFAULT_MAX_QUEUE_SIZE,
        }
    }
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_total_lock_limit(mut self, total_lock_limit: usize) -> Self {
        self.total_lock_limit = total_lock_limit;
        self
    }

    pub fn with_process_every(mut self, process_every: Duration) -> Self {
        self.process_every = process_every;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_batching(mut self, enable_batching: bool) -> Self {
        self.enable_batching = enable_batching;
        self
    }

    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }
}
