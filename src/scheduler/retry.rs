use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::store::{StoreError, StoreResult, DUPLICATE_KEY, WRITE_CONFLICT};

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);

pub type ConflictClassifier = Arc<dyn Fn(&StoreError) -> bool + Send + Sync>;

/// True for conflict-class errors: a duplicate key on upsert or an
/// optimistic write conflict. Everything else is not worth retrying.
pub fn is_conflict_error(err: &StoreError) -> bool {
    matches!(err.code, Some(DUPLICATE_KEY) | Some(WRITE_CONFLICT))
        || err.code_name.as_deref() == Some("WriteConflict")
        || err.message.contains("WriteConflict")
        || err.message.contains("duplicate key")
}

#[derive(Clone)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Overrides [`is_conflict_error`] when set.
    pub classifier: Option<ConflictClassifier>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            classifier: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("custom_classifier", &self.classifier.is_some())
            .finish()
    }
}

/// Wraps contended writes with bounded exponential backoff.
///
/// Hot documents make concurrent workers trip over each other's claims;
/// those writes fail with conflict-class errors and succeed on a later
/// attempt. The additive jitter is uniform in `[0, base_delay)` so workers
/// woken by the same tick don't retry in lockstep.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    options: RetryOptions,
}

impl RetryExecutor {
    pub fn new(options: RetryOptions) -> Self {
        Self { options }
    }

    fn retryable(&self, err: &StoreError) -> bool {
        match &self.options.classifier {
            Some(classifier) => classifier(err),
            None => is_conflict_error(err),
        }
    }

    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.options.base_delay.as_millis() as u64;
        let exponential = base.saturating_mul(1u64 << attempt.min(31));
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..base)
        } else {
            0
        };
        let capped = exponential
            .saturating_add(jitter)
            .min(self.options.max_delay.as_millis() as u64);
        Duration::from_millis(capped)
    }

    /// Run `operation`, retrying up to `max_retries` times on conflict-class
    /// errors. Non-conflict errors and exhaustion propagate as-is.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.options.max_retries || !self.retryable(&err) {
                        return Err(err);
                    }
                    let delay = self.backoff_delay(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "write conflict, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
