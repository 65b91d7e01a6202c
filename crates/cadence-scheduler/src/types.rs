use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Identity of a job implementation and of its persisted definition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobKey {
    pub namespace: String,
    pub name: String,
}

impl JobKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.name)
    }
}

/// Persisted configuration for one discovered job implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// UUID v4 string; referenced by schedule instances.
    pub id: String,
    pub key: JobKey,
    /// Standard 5-field cron expression, evaluated in local time.
    pub cron_expression: String,
    /// Days a reported, finished instance is kept. Zero keeps it forever.
    pub retention_days: u32,
    /// Digest recipients, one address per entry.
    pub recipients: Vec<String>,
    /// Days between two digests. Zero reports on the first tick after a run.
    pub digest_days: u32,
    /// Only failed runs are mailed when set.
    pub error_only: bool,
    pub last_digest: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Administrator-editable fields of a [`JobDefinition`]. `None` leaves a field unchanged.
#[derive(Debug, Clone, Default)]
pub struct DefinitionUpdate {
    pub cron_expression: Option<String>,
    pub retention_days: Option<u32>,
    pub recipients: Option<Vec<String>>,
    pub digest_days: Option<u32>,
    pub error_only: Option<bool>,
}

/// Split a free-form recipient list (newlines or commas) into trimmed addresses.
pub fn parse_recipients(raw: &str) -> Vec<String> {
    raw.split(['\n', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Lifecycle state of a schedule instance. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Waiting for its start instant.
    Scheduled,
    /// Currently being executed.
    Running,
    /// Execution returned; result and timing are recorded.
    Finished,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Scheduled => "scheduled",
            InstanceStatus::Running => "running",
            InstanceStatus::Finished => "finished",
        }
    }

    /// Scheduled and running instances count against the one-active-instance rule.
    pub fn is_active(&self) -> bool {
        !matches!(self, InstanceStatus::Finished)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InstanceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(InstanceStatus::Scheduled),
            "running" => Ok(InstanceStatus::Running),
            "finished" => Ok(InstanceStatus::Finished),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

/// One concrete past or future execution of a job definition.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleInstance {
    /// UUID v4 string.
    pub id: String,
    pub definition_id: String,
    /// Target start instant.
    pub start: DateTime<Utc>,
    /// Set once, when the instance enters `Running`.
    pub started: Option<DateTime<Utc>>,
    pub status: InstanceStatus,
    /// Set once, when the instance enters `Finished`.
    pub time_spent: Option<Duration>,
    /// Captured output and diagnostics.
    pub result: String,
    /// Unset until the instance is finished.
    pub has_errors: Option<bool>,
    pub reported: bool,
}

/// What a single job execution produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub has_errors: bool,
    pub report: String,
}

impl ExecutionOutcome {
    pub fn failed(report: impl Into<String>) -> Self {
        Self {
            has_errors: true,
            report: report.into(),
        }
    }
}

/// Result of trying to move an instance through its run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunAttempt {
    /// The instance ran; carries its finished state.
    Ran(ScheduleInstance),
    /// The instance was not `scheduled` (already running, finished, or lost a race).
    NotEligible { id: String, status: InstanceStatus },
    /// The instance or its definition no longer exists.
    NotFound { id: String },
}

impl RunAttempt {
    /// Turn the non-`Ran` outcomes into errors for callers that only care about success.
    pub fn into_result(self) -> Result<ScheduleInstance> {
        match self {
            RunAttempt::Ran(instance) => Ok(instance),
            RunAttempt::NotEligible { id, status } => {
                Err(SchedulerError::DoesNotExecute { id, status })
            }
            RunAttempt::NotFound { id } => Err(SchedulerError::InstanceNotFound { id }),
        }
    }
}
