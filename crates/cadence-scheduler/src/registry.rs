use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::types::JobKey;

/// Namespace and name reserved for the control loop itself; never scheduled.
pub const CONTROLLER_NAMESPACE: &str = "cadence";
pub const CONTROLLER_NAME: &str = "controller";

pub fn controller_key() -> JobKey {
    JobKey::new(CONTROLLER_NAMESPACE, CONTROLLER_NAME)
}

/// Two in-memory text sinks handed to a job for the duration of one execution.
///
/// Both implement [`std::fmt::Write`], so jobs use `writeln!(io.out, …)`.
#[derive(Debug, Default)]
pub struct Capture {
    /// Normal progress output.
    pub out: String,
    /// Error output. Anything written here marks the run as failed.
    pub err: String,
}

/// A runnable job implementation.
#[async_trait]
pub trait Job: Send + Sync {
    /// Run the job body. Returning `Err` (or panicking) aborts the run.
    async fn execute(&self, io: &mut Capture) -> anyhow::Result<()>;

    /// What the job is, e.g. the command it wraps.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Free-form notes for administrators.
    fn help(&self) -> Option<&str> {
        None
    }

    /// Cadence alias (`hourly`, `daily`, …) used for the initial cron expression.
    fn when(&self) -> Option<&str> {
        None
    }
}

/// The set of known job implementations, keyed by (namespace, name).
#[derive(Default, Clone)]
pub struct JobRegistry {
    jobs: BTreeMap<JobKey, Arc<dyn Job>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job`, replacing any previous job under the same key.
    pub fn register(&mut self, key: JobKey, job: Arc<dyn Job>) {
        debug!(%key, "job registered");
        self.jobs.insert(key, job);
    }

    pub fn lookup(&self, key: &JobKey) -> Option<Arc<dyn Job>> {
        self.jobs.get(key).cloned()
    }

    pub fn contains(&self, key: &JobKey) -> bool {
        self.jobs.contains_key(key)
    }

    /// Iterate registered jobs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&JobKey, &Arc<dyn Job>)> {
        self.jobs.iter()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
