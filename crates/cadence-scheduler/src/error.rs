use thiserror::Error;

use crate::types::{InstanceStatus, JobKey};

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The cron expression does not parse or can never match.
    #[error("Invalid cron expression '{expression}': {reason}")]
    InvalidExpression { expression: String, reason: String },

    /// Attempted to run an instance that is no longer `scheduled`.
    #[error("Schedule {id} cannot be executed because its status is {status}")]
    DoesNotExecute { id: String, status: InstanceStatus },

    /// No job implementation is registered under the key.
    #[error("Job not found: {key}")]
    JobNotFound { key: JobKey },

    /// No job definition is persisted under the key.
    #[error("Job definition not found: {key}")]
    DefinitionNotFound { key: JobKey },

    /// No schedule instance with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    InstanceNotFound { id: String },

    /// An administrator edit carries a value outside its allowed range.
    #[error("Invalid setting {field}: {reason}")]
    InvalidSetting { field: &'static str, reason: String },

    /// A persisted row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl SchedulerError {
    /// Stable short code for logs and CLI exit messages.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE",
            Self::InvalidExpression { .. } => "INVALID_EXPRESSION",
            Self::DoesNotExecute { .. } => "DOES_NOT_EXECUTE",
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::DefinitionNotFound { .. } => "DEFINITION_NOT_FOUND",
            Self::InstanceNotFound { .. } => "INSTANCE_NOT_FOUND",
            Self::InvalidSetting { .. } => "INVALID_SETTING",
            Self::Corrupt(_) => "CORRUPT",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
