//! Item errors

use shng_core::path::PathError;
use shng_core::{CastError, EvalError};
use shng_scheduler::SchedulerError;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for item operations
pub type ItemResult<T> = Result<T, ItemError>;

/// Errors raised while building or operating the item graph
#[derive(Debug, Error)]
pub enum ItemError {
    #[error("item '{path}': {message}")]
    InvalidConfig { path: String, message: String },

    #[error("item '{path}': invalid attribute '{attribute}': {message}")]
    InvalidAttribute {
        path: String,
        attribute: String,
        message: String,
    },

    #[error("item '{path}': {source}")]
    TypeMismatch {
        path: String,
        #[source]
        source: CastError,
    },

    #[error("item '{0}' already exists")]
    Collision(String),

    #[error("unknown item '{0}'")]
    UnknownItem(String),

    #[error("item '{path}': cannot write element: {message}")]
    Element { path: String, message: String },

    #[error("cache file {file}: {source}")]
    Cache {
        file: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl ItemError {
    pub(crate) fn attribute(
        path: &str,
        attribute: &str,
        message: impl Into<String>,
    ) -> Self {
        Self::InvalidAttribute {
            path: path.to_string(),
            attribute: attribute.to_string(),
            message: message.into(),
        }
    }
}
