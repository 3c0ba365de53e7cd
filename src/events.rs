use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::CorralError;
use crate::job::handle::JobHandle;

pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle signals produced by the processor.
///
/// These are observations only; nothing in the scheduler consumes them.
/// Slow subscribers lag and lose the oldest events rather than blocking
/// the processor.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// The processor started and its tick loop is live.
    Ready,
    /// A job was handed to its handler.
    ProcessJob(JobHandle),
    /// A storage or per-job error the processor absorbed.
    Error(Arc<CorralError>),
    /// The local ready queue rejected a claim.
    QueueOverflow {
        name: String,
        queue_size: usize,
        max_size: usize,
    },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; a send with no subscribers is not an error.
    pub fn emit(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    pub fn error(&self, err: CorralError) {
        tracing::error!(error = %err, "scheduler error");
        self.emit(SchedulerEvent::Error(Arc::new(err)));
    }
}
