use chrono::{DateTime, Local, SubsecRound, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    cron,
    error::{Result, SchedulerError},
    registry::JobRegistry,
    runner,
    store::Store,
    types::{InstanceStatus, JobDefinition, JobKey, RunAttempt, ScheduleInstance},
};

/// Return the scheduled/running instance of `definition`, or create the next one.
///
/// The start instant is the next cron match after `now`, evaluated in local
/// time. Repeated calls return the same instance until it finishes.
pub fn next_schedule(
    store: &dyn Store,
    definition: &JobDefinition,
    now: DateTime<Utc>,
) -> Result<ScheduleInstance> {
    if let Some(active) = store.active_instance(&definition.id)? {
        return Ok(active);
    }

    let start = cron::next(&definition.cron_expression, &now.with_timezone(&Local))?
        .with_timezone(&Utc);
    let instance = ScheduleInstance {
        id: Uuid::new_v4().to_string(),
        definition_id: definition.id.clone(),
        start,
        started: None,
        status: InstanceStatus::Scheduled,
        time_spent: None,
        result: String::new(),
        has_errors: None,
        reported: false,
    };
    store.insert_instance(&instance)?;
    info!(
        job = %definition.key,
        schedule_id = %instance.id,
        start = %start.with_timezone(&Local),
        "job scheduled"
    );
    Ok(instance)
}

/// Run a scheduled instance to completion.
///
/// Does not check whether the instance is due. The `running` state is
/// persisted before the job body starts, the `finished` state after it
/// returns; an interrupted process leaves the instance in `running`.
pub async fn run_job(
    store: &dyn Store,
    registry: &JobRegistry,
    instance: &ScheduleInstance,
) -> Result<RunAttempt> {
    if instance.status != InstanceStatus::Scheduled {
        return Ok(RunAttempt::NotEligible {
            id: instance.id.clone(),
            status: instance.status,
        });
    }

    let Some(definition) = store.get_definition_by_id(&instance.definition_id)? else {
        return Ok(RunAttempt::NotFound {
            id: instance.id.clone(),
        });
    };

    // Whole microseconds, the precision the store keeps.
    let started = Utc::now().trunc_subsecs(6);
    if !store.begin_run(&instance.id, started)? {
        // Someone else moved it first, or it was deleted underneath us.
        return Ok(match store.get_instance(&instance.id)? {
            Some(current) => RunAttempt::NotEligible {
                id: current.id,
                status: current.status,
            },
            None => RunAttempt::NotFound {
                id: instance.id.clone(),
            },
        });
    }
    info!(job = %definition.key, schedule_id = %instance.id, "job started");

    let outcome = runner::execute(registry, &definition.key).await;

    let time_spent = Utc::now().trunc_subsecs(6) - started;
    store.finish_run(&instance.id, &outcome, time_spent)?;
    if outcome.has_errors {
        warn!(job = %definition.key, schedule_id = %instance.id, "job finished with errors");
    } else {
        info!(job = %definition.key, schedule_id = %instance.id, "job finished");
    }

    Ok(RunAttempt::Ran(ScheduleInstance {
        started: Some(started),
        status: InstanceStatus::Finished,
        time_spent: Some(time_spent),
        result: outcome.report,
        has_errors: Some(outcome.has_errors),
        ..instance.clone()
    }))
}

/// Run a job immediately, outside its cron cadence.
///
/// Uses the current active instance (creating one if needed); an instance that
/// is already running is rejected with `DoesNotExecute`.
pub async fn run_now(
    store: &dyn Store,
    registry: &JobRegistry,
    key: &JobKey,
    now: DateTime<Utc>,
) -> Result<ScheduleInstance> {
    if !registry.contains(key) {
        return Err(SchedulerError::JobNotFound { key: key.clone() });
    }
    let definition = store
        .get_definition(key)?
        .ok_or_else(|| SchedulerError::DefinitionNotFound { key: key.clone() })?;
    let instance = next_schedule(store, &definition, now)?;
    run_job(store, registry, &instance).await?.into_result()
}

/// Run one instance by id; the manual counterpart of a dispatched run.
pub async fn run_instance(
    store: &dyn Store,
    registry: &JobRegistry,
    id: &str,
) -> Result<ScheduleInstance> {
    let instance = store
        .get_instance(id)?
        .ok_or_else(|| SchedulerError::InstanceNotFound { id: id.to_string() })?;
    run_job(store, registry, &instance).await?.into_result()
}
