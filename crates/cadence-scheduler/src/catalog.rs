use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use crate::{
    cron,
    error::{Result, SchedulerError},
    registry::{controller_key, JobRegistry},
    store::Store,
    types::{DefinitionUpdate, JobDefinition, JobKey},
};

/// Retention given to newly discovered jobs.
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Upper bound for `retention_days` and `digest_days` (about a thousand years).
pub const MAX_DAYS: u32 = 365_000;

const DEFAULT_CADENCE: &str = "daily";

/// Cron expression for a job's declared cadence alias.
///
/// Unknown or missing aliases fall back to `daily`.
pub fn cadence_expression(when: Option<&str>) -> &'static str {
    match when.unwrap_or(DEFAULT_CADENCE) {
        "minutely" => "* * * * *",
        "QuarterHourly" => "*/15 * * * *",
        "hourly" => "0 * * * *",
        "daily" => "0 0 * * *",
        "weekly" => "0 0 * * 0",
        "monthly" => "0 0 1 * *",
        "yearly" => "0 0 1 1 *",
        _ => "0 0 * * *",
    }
}

/// Delete every definition whose job is no longer registered.
///
/// Instances of a deleted definition go with it. Returns the number removed.
pub fn prune_stale(store: &dyn Store, registry: &JobRegistry) -> Result<usize> {
    let mut removed = 0;
    for definition in store.list_definitions()? {
        if registry.contains(&definition.key) {
            continue;
        }
        store.delete_definition(&definition.id)?;
        info!(job = %definition.key, "removed definition of vanished job");
        removed += 1;
    }
    Ok(removed)
}

/// Create a definition for every registered job that has none yet.
///
/// The controller's own registration is skipped. Returns the new definitions.
pub fn sync_new(
    store: &dyn Store,
    registry: &JobRegistry,
    now: DateTime<Utc>,
) -> Result<Vec<JobDefinition>> {
    let controller = controller_key();
    let mut created = Vec::new();

    for (key, job) in registry.iter() {
        if *key == controller || store.get_definition(key)?.is_some() {
            continue;
        }

        let definition = JobDefinition {
            id: Uuid::new_v4().to_string(),
            key: key.clone(),
            cron_expression: cadence_expression(job.when()).to_string(),
            retention_days: DEFAULT_RETENTION_DAYS,
            recipients: Vec::new(),
            digest_days: 0,
            error_only: false,
            last_digest: None,
            created_at: now,
        };
        store.insert_definition(&definition)?;
        info!(
            job = %key,
            cron = %definition.cron_expression,
            help = job.help().unwrap_or(""),
            "new job found"
        );
        created.push(definition);
    }
    Ok(created)
}

/// Apply administrator edits to a definition, validating them first.
pub fn configure(
    store: &dyn Store,
    key: &JobKey,
    update: &DefinitionUpdate,
) -> Result<JobDefinition> {
    if let Some(ref expr) = update.cron_expression {
        cron::validate(expr)?;
    }
    check_days("retention_days", update.retention_days)?;
    check_days("digest_days", update.digest_days)?;
    let definition = store.update_definition(key, update)?;
    info!(job = %key, cron = %definition.cron_expression, "definition updated");
    Ok(definition)
}

fn check_days(field: &'static str, days: Option<u32>) -> Result<()> {
    match days {
        Some(days) if days > MAX_DAYS => Err(SchedulerError::InvalidSetting {
            field,
            reason: format!("{days} exceeds the maximum of {MAX_DAYS} days"),
        }),
        _ => Ok(()),
    }
}

/// Text shown to administrators: the job's description followed by its help,
/// separated by a blank line. Falls back to the key when the job offers neither.
pub fn describe(registry: &JobRegistry, key: &JobKey) -> String {
    let Some(job) = registry.lookup(key) else {
        return format!("The job {key} was not found.");
    };
    let parts: Vec<&str> = [job.description(), job.help()]
        .into_iter()
        .flatten()
        .filter(|part| !part.trim().is_empty())
        .collect();
    if parts.is_empty() {
        key.to_string()
    } else {
        parts.join("\n\n")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::registry::fixtures::ScriptedJob;
    use crate::registry::{Job, CONTROLLER_NAME, CONTROLLER_NAMESPACE};
    use crate::store::{fixtures, SqliteStore};

    fn job_with(when: Option<&'static str>) -> Arc<ScriptedJob> {
        Arc::new(ScriptedJob {
            when,
            ..ScriptedJob::printing("")
        })
    }

    #[test]
    fn alias_table() {
        assert_eq!(cadence_expression(Some("minutely")), "* * * * *");
        assert_eq!(cadence_expression(Some("QuarterHourly")), "*/15 * * * *");
        assert_eq!(cadence_expression(Some("hourly")), "0 * * * *");
        assert_eq!(cadence_expression(Some("weekly")), "0 0 * * 0");
        assert_eq!(cadence_expression(Some("monthly")), "0 0 1 * *");
        assert_eq!(cadence_expression(Some("yearly")), "0 0 1 1 *");
        assert_eq!(cadence_expression(Some("fortnightly")), "0 0 * * *");
        assert_eq!(cadence_expression(None), "0 0 * * *");
    }

    #[test]
    fn hourly_job_gets_hourly_definition() {
        let store = SqliteStore::in_memory().unwrap();
        let mut registry = JobRegistry::new();
        registry.register(JobKey::new("appA", "jobX"), job_with(Some("hourly")));

        let created = sync_new(&store, &registry, Utc::now()).unwrap();
        assert_eq!(created.len(), 1);

        let def = store
            .get_definition(&JobKey::new("appA", "jobX"))
            .unwrap()
            .unwrap();
        assert_eq!(def.cron_expression, "0 * * * *");
        assert_eq!(def.retention_days, 30);
        assert_eq!(def.digest_days, 0);
        assert!(!def.error_only);
        assert!(def.recipients.is_empty());
        assert!(def.last_digest.is_none());
    }

    #[test]
    fn controller_is_never_synced() {
        let store = SqliteStore::in_memory().unwrap();
        let mut registry = JobRegistry::new();
        registry.register(
            JobKey::new(CONTROLLER_NAMESPACE, CONTROLLER_NAME),
            job_with(Some("minutely")),
        );

        assert!(sync_new(&store, &registry, Utc::now()).unwrap().is_empty());
        assert!(store.list_definitions().unwrap().is_empty());
    }

    #[test]
    fn prune_removes_unregistered_definitions() {
        let store = SqliteStore::in_memory().unwrap();
        let kept = fixtures::definition("app", "kept");
        let gone = fixtures::definition("app", "gone");
        store.insert_definition(&kept).unwrap();
        store.insert_definition(&gone).unwrap();
        let mut registry = JobRegistry::new();
        registry.register(kept.key.clone(), job_with(None));

        assert_eq!(prune_stale(&store, &registry).unwrap(), 1);
        let remaining: Vec<JobKey> = store
            .list_definitions()
            .unwrap()
            .into_iter()
            .map(|d| d.key)
            .collect();
        assert_eq!(remaining, vec![kept.key]);
    }

    #[test]
    fn sync_is_idempotent() {
        let store = SqliteStore::in_memory().unwrap();
        let mut registry = JobRegistry::new();
        registry.register(JobKey::new("app", "a"), job_with(Some("daily")));
        registry.register(JobKey::new("app", "b"), job_with(Some("weekly")));
        let now = Utc::now();

        assert_eq!(prune_stale(&store, &registry).unwrap(), 0);
        assert_eq!(sync_new(&store, &registry, now).unwrap().len(), 2);
        let snapshot = store.list_definitions().unwrap();

        assert_eq!(prune_stale(&store, &registry).unwrap(), 0);
        assert!(sync_new(&store, &registry, now).unwrap().is_empty());
        assert_eq!(store.list_definitions().unwrap(), snapshot);
    }

    #[test]
    fn configure_validates_cron() {
        let store = SqliteStore::in_memory().unwrap();
        let def = fixtures::definition("app", "job");
        store.insert_definition(&def).unwrap();

        let bad = DefinitionUpdate {
            cron_expression: Some("61 * * * *".into()),
            ..Default::default()
        };
        let err = configure(&store, &def.key, &bad).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidExpression { .. }));

        let good = DefinitionUpdate {
            cron_expression: Some("*/10 * * * *".into()),
            recipients: Some(vec!["ops@example.com".into()]),
            ..Default::default()
        };
        let updated = configure(&store, &def.key, &good).unwrap();
        assert_eq!(updated.cron_expression, "*/10 * * * *");
        assert_eq!(updated.recipients, vec!["ops@example.com"]);
    }

    #[test]
    fn configure_rejects_out_of_range_days() {
        let store = SqliteStore::in_memory().unwrap();
        let def = fixtures::definition("app", "job");
        store.insert_definition(&def).unwrap();

        for update in [
            DefinitionUpdate {
                retention_days: Some(200_000_000),
                ..Default::default()
            },
            DefinitionUpdate {
                digest_days: Some(MAX_DAYS + 1),
                ..Default::default()
            },
        ] {
            let err = configure(&store, &def.key, &update).unwrap_err();
            assert!(matches!(err, SchedulerError::InvalidSetting { .. }));
        }
        let stored = store.get_definition(&def.key).unwrap().unwrap();
        assert_eq!(stored.retention_days, 30);

        let ok = DefinitionUpdate {
            retention_days: Some(MAX_DAYS),
            ..Default::default()
        };
        assert_eq!(configure(&store, &def.key, &ok).unwrap().retention_days, MAX_DAYS);
    }

    #[test]
    fn describe_uses_help_text() {
        let mut registry = JobRegistry::new();
        let key = JobKey::new("app", "job");
        registry.register(key.clone(), job_with(None));
        assert_eq!(describe(&registry, &key), "scripted test job");
        assert!(describe(&registry, &JobKey::new("app", "x")).contains("not found"));
    }

    #[test]
    fn describe_joins_description_and_help() {
        let mut registry = JobRegistry::new();
        let key = JobKey::new("ops", "backup");
        registry.register(
            key.clone(),
            Arc::new(crate::command::CommandJob::from_config(
                &cadence_core::config::CommandJobConfig {
                    namespace: "ops".into(),
                    name: "backup".into(),
                    command: "echo done".into(),
                    when: None,
                    help: Some("Nightly backup".into()),
                },
            )),
        );
        assert_eq!(describe(&registry, &key), "echo done\n\nNightly backup");
    }

    #[test]
    fn describe_falls_back_to_key() {
        struct Bare;

        #[async_trait::async_trait]
        impl Job for Bare {
            async fn execute(&self, _io: &mut crate::registry::Capture) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let mut registry = JobRegistry::new();
        let key = JobKey::new("app", "bare");
        registry.register(key.clone(), Arc::new(Bare));
        assert_eq!(describe(&registry, &key), "app.bare");
    }
}
