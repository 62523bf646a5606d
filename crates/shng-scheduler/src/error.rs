//! Scheduler error types

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the scheduler API
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Invalid cycle '{cycle}' for job {name}")]
    InvalidCycle { name: String, cycle: String },

    #[error("Invalid crontab entry '{entry}' for job {name}")]
    InvalidCron { name: String, entry: String },

    #[error("Unknown job: {0}")]
    UnknownJob(String),

    #[error("Job table lock not acquired within {0:?}")]
    Deadlock(Duration),

    #[error("Failed to spawn thread {name}: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for scheduler operations
pub type SchedulerResult<T> = Result<T, SchedulerError>;

/// Error returned by callable jobs
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Eval(#[from] shng_core::EvalError),
}

impl JobError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}
