use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CorralError {
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    #[error("no handler defined for job name: {0}")]
    UndefinedJob(String),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("local queue for {name} is full ({queue_size}/{max_size})")]
    QueueFull {
        name: String,
        queue_size: usize,
        max_size: usize,
    },

    #[error("job {id} ({name}) failed: {reason}")]
    JobFailed {
        id: Uuid,
        name: String,
        reason: String,
    },

    #[error("job {0} has already been run")]
    AlreadyRun(Uuid),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CorralError>;
