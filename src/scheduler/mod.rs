//! Claiming and running jobs.
//!
//! This module is the worker-side half of the scheduler:
//! - **Retry**: bounded exponential backoff around contended writes
//! - **Repository**: typed claim/release/save operations on the store
//! - **Ready queue**: claimed jobs waiting for their run time
//! - **Processor**: discovery, dispatch and liveness supervision
//!
//! # Processing flow
//!
//! 1. A periodic tick asks the processor to top up the ready queue
//! 2. [`JobRepository::batch_claim`] stamps `locked_at` on eligible documents
//! 3. Dispatch pulls due jobs off the queue, re-checks the concurrency
//!    ceilings, and runs each handler under a liveness watchdog
//! 4. Final state is written back; the lock is released by that write

pub mod processor;
pub mod ready_queue;
pub mod repository;
pub mod retry;

pub use processor::JobProcessor;
pub use ready_queue::ReadyQueue;
pub use repository::JobRepository;
pub use retry::{RetryExecutor, RetryOptions};
