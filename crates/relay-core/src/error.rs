//! Error types for relay.

use thiserror::Error;

use crate::run::RunStatus;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("provisioning '{key}' failed: {message}")]
    Provisioning { key: String, message: String },

    #[error("step '{step}' failed with exit code {exit_code:?}")]
    StepFailed { step: String, exit_code: Option<i32> },

    #[error("no runner satisfies labels {missing:?} for job '{job}'")]
    Infrastructure { job: String, missing: Vec<String> },

    #[error("invalid run transition: {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn provisioning(key: impl Into<String>, message: impl ToString) -> Self {
        Error::Provisioning {
            key: key.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
