pub mod config;
pub mod error;
pub mod events;
pub mod job;
pub mod scheduler;
pub mod store;

pub use config::ProcessorConfig;
pub use error::{CorralError, Result};
pub use events::{EventBus, SchedulerEvent};
pub use job::handle::JobHandle;
pub use job::record::{JobRecord, JobType};
pub use job::registry::{DefineOptions, JobDefinition, JobHandler, JobRegistry};
pub use scheduler::processor::{JobProcessor, ProcessorStatus};
pub use scheduler::ready_queue::ReadyQueue;
pub use scheduler::repository::JobRepository;
pub use scheduler::retry::{RetryExecutor, RetryOptions};
pub use store::memory::MemoryStore;
pub use store::{JobStore, StoreError};
