use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{
    catalog,
    digest::{self, DigestSummary},
    error::{Result, SchedulerError},
    lifecycle,
    mailer::Mailer,
    registry::JobRegistry,
    retention,
    store::Store,
    types::{RunAttempt, ScheduleInstance},
};

/// Counts for each phase of one tick, plus the dispatched executions.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Definitions deleted because their job vanished from the registry.
    pub removed: usize,
    /// Definitions created for newly registered jobs.
    pub discovered: usize,
    /// One handle per due instance handed to a task this tick.
    pub dispatched: Vec<JoinHandle<()>>,
    /// Fresh instances created for definitions without an active one.
    pub scheduled: usize,
    pub digests: DigestSummary,
    /// Instances removed by retention.
    pub expired: usize,
}

impl TickReport {
    /// Wait until every execution dispatched by this tick has completed.
    pub async fn join(self) {
        for handle in self.dispatched {
            if let Err(e) = handle.await {
                error!("dispatched job task failed: {e}");
            }
        }
    }
}

/// Drives the scheduler: one [`tick`](Controller::tick) per trigger.
pub struct Controller {
    store: Arc<dyn Store>,
    registry: Arc<JobRegistry>,
    mailer: Arc<dyn Mailer>,
    permits: Arc<Semaphore>,
    in_flight: InFlight,
}

impl Controller {
    /// `max_concurrent_jobs` bounds how many executions run at once; zero is
    /// treated as one.
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<JobRegistry>,
        mailer: Arc<dyn Mailer>,
        max_concurrent_jobs: usize,
    ) -> Self {
        Self {
            store,
            registry,
            mailer,
            permits: Arc::new(Semaphore::new(max_concurrent_jobs.max(1))),
            in_flight: InFlight::default(),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Run every phase once, in order: prune stale definitions, sync new jobs,
    /// dispatch due instances, schedule the next instances, send digests and
    /// prune expired history.
    ///
    /// Dispatched executions are not awaited; their handles are in the report.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport {
            removed: catalog::prune_stale(self.store.as_ref(), &self.registry)?,
            discovered: catalog::sync_new(self.store.as_ref(), &self.registry, now)?.len(),
            ..Default::default()
        };

        for instance in self.store.due_instances(now)? {
            if let Some(handle) = self.dispatch(instance) {
                report.dispatched.push(handle);
            }
        }

        for definition in self.store.list_definitions()? {
            if self.store.active_instance(&definition.id)?.is_some() {
                continue;
            }
            match lifecycle::next_schedule(self.store.as_ref(), &definition, now) {
                Ok(_) => report.scheduled += 1,
                Err(SchedulerError::InvalidExpression { expression, reason }) => {
                    warn!(
                        job = %definition.key,
                        %expression,
                        %reason,
                        "cannot schedule job; fix its cron expression"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        report.digests =
            digest::send_digests(self.store.as_ref(), self.mailer.as_ref(), now).await?;
        report.expired = retention::prune_expired(self.store.as_ref(), now)?;

        info!(
            removed = report.removed,
            discovered = report.discovered,
            dispatched = report.dispatched.len(),
            scheduled = report.scheduled,
            digests = report.digests.sent,
            expired = report.expired,
            "tick complete"
        );
        Ok(report)
    }

    /// Hand `instance` to its own task. Returns `None` if it is already in flight.
    fn dispatch(&self, instance: ScheduleInstance) -> Option<JoinHandle<()>> {
        let Some(claim) = self.in_flight.claim(&instance.id) else {
            debug!(schedule_id = %instance.id, "already dispatched; skipping");
            return None;
        };

        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let permits = Arc::clone(&self.permits);

        Some(tokio::spawn(async move {
            let _claim = claim;
            // The semaphore is never closed, so acquire only fails if it were.
            if let Ok(_permit) = permits.acquire_owned().await {
                match lifecycle::run_job(store.as_ref(), &registry, &instance).await {
                    Ok(RunAttempt::Ran(done)) => {
                        debug!(schedule_id = %done.id, has_errors = ?done.has_errors, "dispatched run done");
                    }
                    Ok(attempt) => {
                        if let Err(e) = attempt.into_result() {
                            warn!(schedule_id = %instance.id, "dispatched run skipped: {e}");
                        }
                    }
                    Err(e) => error!(schedule_id = %instance.id, "dispatched run failed: {e}"),
                }
            }
        }))
    }

    /// Tick every `period` until `shutdown` broadcasts `true`.
    ///
    /// A failed tick is logged; the next one retries.
    pub async fn run(&self, period: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        info!(period_secs = period.as_secs(), "controller started");

        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(code = e.code(), "controller tick error: {e}");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("controller shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Instance ids handed to a task and not yet completed.
#[derive(Debug, Default, Clone)]
struct InFlight(Arc<Mutex<HashSet<String>>>);

impl InFlight {
    /// Mark `id` in flight. `None` if it already is.
    fn claim(&self, id: &str) -> Option<Claim> {
        if !lock(&self.0).insert(id.to_string()) {
            return None;
        }
        Some(Claim {
            ids: self.clone(),
            id: id.to_string(),
        })
    }
}

/// Releases its id when dropped, including when the owning task panics.
#[derive(Debug)]
struct Claim {
    ids: InFlight,
    id: String,
}

impl Drop for Claim {
    fn drop(&mut self) {
        lock(&self.ids.0).remove(&self.id);
    }
}

fn lock(set: &Mutex<HashSet<String>>) -> MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
