use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;

use crate::job::handle::JobHandle;

pub const DEFAULT_CONCURRENCY: usize = 5;
pub const DEFAULT_LOCK_LIMIT: usize = 0;
pub const DEFAULT_LOCK_LIFETIME: Duration = Duration::from_secs(10 * 60);

/// User-supplied job logic.
///
/// Long-running handlers should call [`JobHandle::touch`] to keep their
/// claim alive and watch [`JobHandle::cancellation`] to wind down early.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: JobHandle) -> anyhow::Result<()>;
}

/// Adapter so plain async closures can be registered as handlers.
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobHandle) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn run(&self, job: JobHandle) -> anyhow::Result<()> {
        (self.0)(job).await
    }
}

/// Everything the scheduler knows about one job name.
#[derive(Clone)]
pub struct JobDefinition {
    pub handler: Arc<dyn JobHandler>,
    /// How many jobs of this name may run at once on one worker.
    pub concurrency: usize,
    /// How many claims of this name one worker may hold. 0 means no limit.
    pub lock_limit: usize,
    /// Lease duration; an unrefreshed claim older than this may be stolen.
    pub lock_lifetime: Duration,
    /// Default priority for new jobs of this name.
    pub priority: i8,
}

impl fmt::Debug for JobDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobDefinition")
            .field("concurrency", &self.concurrency)
            .field("lock_limit", &self.lock_limit)
            .field("lock_lifetime", &self.lock_lifetime)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct DefineOptions {
    pub concurrency: usize,
    pub lock_limit: usize,
    pub lock_lifetime: Duration,
    pub priority: i8,
}

impl Default for DefineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            lock_limit: DEFAULT_LOCK_LIMIT,
            lock_lifetime: DEFAULT_LOCK_LIFETIME,
            priority: 0,
        }
    }
}

/// Registry of job names to their definitions.
///
/// Definitions may be added at any time; the next discovery scan picks up
/// new names. Definitions are never removed while a worker runs.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: RwLock<HashMap<String, Arc<JobDefinition>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&self, name: impl Into<String>, options: DefineOptions, handler: Arc<dyn JobHandler>) {
        let name = name.into();
        let definition = Arc::new(JobDefinition {
            handler,
            concurrency: options.concurrency,
            lock_limit: options.lock_limit,
            lock_lifetime: options.lock_lifetime,
            priority: crate::job::record::clamp_priority(options.priority),
        });
        tracing::debug!(name = %name, ?options, "job defined");
        self.definitions
            .write()
            .expect("registry lock poisoned")
            .insert(name, definition);
    }

    pub fn define_fn<F, Fut>(&self, name: impl Into<String>, options: DefineOptions, handler: F)
    where
        F: Fn(JobHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.define(name, options, Arc::new(FnHandler(handler)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<JobDefinition>> {
        self.definitions
            .read()
            .expect("registry lock poisoned")
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .definitions
            .read()
            .expect("registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn lock_lifetime(&self, name: &str) -> Duration {
        self.get(name)
            .map(|d| d.lock_lifetime)
            .unwrap_or(DEFAULT_LOCK_LIFETIME)
    }
}
