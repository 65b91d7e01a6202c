//! Persistence for job definitions and schedule instances.
//!
//! The scheduler only talks to the [`Store`] trait; [`SqliteStore`] is the
//! rusqlite-backed implementation used by the binary and the tests.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;

use crate::{
    db::{fmt_ts, init_db, parse_ts},
    error::{Result, SchedulerError},
    types::{
        DefinitionUpdate, ExecutionOutcome, InstanceStatus, JobDefinition, JobKey,
        ScheduleInstance,
    },
};

/// Create/get/filter/update/delete over definitions and instances.
///
/// Implementations must make `begin_run` an atomic compare-and-set so that
/// overlapping ticks cannot both start the same instance.
pub trait Store: Send + Sync {
    fn list_definitions(&self) -> Result<Vec<JobDefinition>>;
    fn get_definition(&self, key: &JobKey) -> Result<Option<JobDefinition>>;
    fn get_definition_by_id(&self, id: &str) -> Result<Option<JobDefinition>>;
    fn insert_definition(&self, definition: &JobDefinition) -> Result<()>;
    /// Apply the `Some` fields of `update`. Fails with `DefinitionNotFound`.
    fn update_definition(&self, key: &JobKey, update: &DefinitionUpdate) -> Result<JobDefinition>;
    /// Delete a definition together with all of its instances.
    fn delete_definition(&self, id: &str) -> Result<()>;
    fn set_last_digest(&self, id: &str, at: DateTime<Utc>) -> Result<()>;

    fn insert_instance(&self, instance: &ScheduleInstance) -> Result<()>;
    fn get_instance(&self, id: &str) -> Result<Option<ScheduleInstance>>;
    /// The scheduled or running instance of a definition, if any.
    fn active_instance(&self, definition_id: &str) -> Result<Option<ScheduleInstance>>;
    /// Scheduled instances whose start is at or before `now`, oldest first.
    fn due_instances(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleInstance>>;
    /// Most recent instances of a definition, newest start first.
    fn recent_instances(&self, definition_id: &str, limit: usize) -> Result<Vec<ScheduleInstance>>;
    /// Move `scheduled` → `running`. Returns false if the instance was not scheduled.
    fn begin_run(&self, id: &str, started: DateTime<Utc>) -> Result<bool>;
    /// Move `running` → `finished`, recording the outcome.
    fn finish_run(&self, id: &str, outcome: &ExecutionOutcome, time_spent: Duration) -> Result<()>;
    fn unreported_finished(&self, definition_id: &str) -> Result<Vec<ScheduleInstance>>;
    fn mark_reported(&self, ids: &[String]) -> Result<usize>;
    /// Delete finished, reported instances that started before `cutoff`.
    fn delete_expired(&self, definition_id: &str, cutoff: DateTime<Utc>) -> Result<usize>;
}

const DEFINITION_COLUMNS: &str = "id, namespace, name, cron_expression, retention_days,
     recipients, digest_days, error_only, last_digest, created_at";

const INSTANCE_COLUMNS: &str = "id, definition_id, start, started, status, time_spent_us,
     result, has_errors, reported";

/// [`Store`] over a single SQLite connection guarded by a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn query_definitions(
        &self,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<JobDefinition>> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {DEFINITION_COLUMNS} FROM job_definitions {filter} ORDER BY namespace, name"
        );
        let mut stmt = conn.prepare_cached(&sql)?;
        let raw: Vec<RawDefinition> = stmt
            .query_map(args, RawDefinition::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter().map(RawDefinition::decode).collect()
    }

    fn query_instances(
        &self,
        filter: &str,
        args: impl rusqlite::Params,
    ) -> Result<Vec<ScheduleInstance>> {
        let conn = self.lock();
        let sql = format!("SELECT {INSTANCE_COLUMNS} FROM job_schedules {filter}");
        let mut stmt = conn.prepare_cached(&sql)?;
        let raw: Vec<RawInstance> = stmt
            .query_map(args, RawInstance::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        raw.into_iter().map(RawInstance::decode).collect()
    }
}

impl Store for SqliteStore {
    fn list_definitions(&self) -> Result<Vec<JobDefinition>> {
        self.query_definitions("", [])
    }

    fn get_definition(&self, key: &JobKey) -> Result<Option<JobDefinition>> {
        Ok(self
            .query_definitions(
                "WHERE namespace = ?1 AND name = ?2",
                params![key.namespace, key.name],
            )?
            .into_iter()
            .next())
    }

    fn get_definition_by_id(&self, id: &str) -> Result<Option<JobDefinition>> {
        Ok(self
            .query_definitions("WHERE id = ?1", [id])?
            .into_iter()
            .next())
    }

    fn insert_definition(&self, definition: &JobDefinition) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO job_definitions
             (id, namespace, name, cron_expression, retention_days, recipients,
              digest_days, error_only, last_digest, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                definition.id,
                definition.key.namespace,
                definition.key.name,
                definition.cron_expression,
                definition.retention_days,
                definition.recipients.join("\n"),
                definition.digest_days,
                definition.error_only,
                definition.last_digest.map(fmt_ts),
                fmt_ts(definition.created_at),
            ],
        )?;
        debug!(definition_id = %definition.id, key = %definition.key, "definition inserted");
        Ok(())
    }

    fn update_definition(&self, key: &JobKey, update: &DefinitionUpdate) -> Result<JobDefinition> {
        let mut definition = self
            .get_definition(key)?
            .ok_or_else(|| SchedulerError::DefinitionNotFound { key: key.clone() })?;

        if let Some(ref expr) = update.cron_expression {
            definition.cron_expression = expr.clone();
        }
        if let Some(days) = update.retention_days {
            definition.retention_days = days;
        }
        if let Some(ref recipients) = update.recipients {
            definition.recipients = recipients.clone();
        }
        if let Some(days) = update.digest_days {
            definition.digest_days = days;
        }
        if let Some(flag) = update.error_only {
            definition.error_only = flag;
        }

        let conn = self.lock();
        conn.execute(
            "UPDATE job_definitions SET cron_expression = ?1, retention_days = ?2,
              recipients = ?3, digest_days = ?4, error_only = ?5
             WHERE id = ?6",
            params![
                definition.cron_expression,
                definition.retention_days,
                definition.recipients.join("\n"),
                definition.digest_days,
                definition.error_only,
                definition.id,
            ],
        )?;
        Ok(definition)
    }

    fn delete_definition(&self, id: &str) -> Result<()> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM job_schedules WHERE definition_id = ?1", [id])?;
        tx.execute("DELETE FROM job_definitions WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    fn set_last_digest(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE job_definitions SET last_digest = ?1 WHERE id = ?2",
            params![fmt_ts(at), id],
        )?;
        Ok(())
    }

    fn insert_instance(&self, instance: &ScheduleInstance) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO job_schedules
             (id, definition_id, start, started, status, time_spent_us, result,
              has_errors, reported)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                instance.id,
                instance.definition_id,
                fmt_ts(instance.start),
                instance.started.map(fmt_ts),
                instance.status.as_str(),
                instance.time_spent.map(duration_to_micros),
                instance.result,
                instance.has_errors,
                instance.reported,
            ],
        )?;
        Ok(())
    }

    fn get_instance(&self, id: &str) -> Result<Option<ScheduleInstance>> {
        Ok(self
            .query_instances("WHERE id = ?1", [id])?
            .into_iter()
            .next())
    }

    fn active_instance(&self, definition_id: &str) -> Result<Option<ScheduleInstance>> {
        Ok(self
            .query_instances(
                "WHERE definition_id = ?1 AND status IN ('scheduled', 'running')
                 ORDER BY start LIMIT 1",
                [definition_id],
            )?
            .into_iter()
            .next())
    }

    fn due_instances(&self, now: DateTime<Utc>) -> Result<Vec<ScheduleInstance>> {
        self.query_instances(
            "WHERE status = 'scheduled' AND start <= ?1 ORDER BY start",
            [fmt_ts(now)],
        )
    }

    fn recent_instances(&self, definition_id: &str, limit: usize) -> Result<Vec<ScheduleInstance>> {
        self.query_instances(
            "WHERE definition_id = ?1 ORDER BY start DESC LIMIT ?2",
            params![definition_id, limit as i64],
        )
    }

    fn begin_run(&self, id: &str, started: DateTime<Utc>) -> Result<bool> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE job_schedules SET status = 'running', started = ?1
             WHERE id = ?2 AND status = 'scheduled'",
            params![fmt_ts(started), id],
        )?;
        Ok(n == 1)
    }

    fn finish_run(&self, id: &str, outcome: &ExecutionOutcome, time_spent: Duration) -> Result<()> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE job_schedules SET status = 'finished', result = ?1, has_errors = ?2,
              time_spent_us = ?3
             WHERE id = ?4 AND status = 'running'",
            params![
                outcome.report,
                outcome.has_errors,
                duration_to_micros(time_spent),
                id
            ],
        )?;
        if n == 0 {
            return Err(SchedulerError::InstanceNotFound { id: id.to_string() });
        }
        Ok(())
    }

    fn unreported_finished(&self, definition_id: &str) -> Result<Vec<ScheduleInstance>> {
        self.query_instances(
            "WHERE definition_id = ?1 AND status = 'finished' AND reported = 0
             ORDER BY start",
            [definition_id],
        )
    }

    fn mark_reported(&self, ids: &[String]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut total = 0;
        {
            let mut stmt = tx.prepare_cached("UPDATE job_schedules SET reported = 1 WHERE id = ?1")?;
            for id in ids {
                total += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(total)
    }

    fn delete_expired(&self, definition_id: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "DELETE FROM job_schedules
             WHERE definition_id = ?1 AND status = 'finished' AND reported = 1
               AND started IS NOT NULL AND started < ?2",
            params![definition_id, fmt_ts(cutoff)],
        )?;
        Ok(n)
    }
}

fn duration_to_micros(d: Duration) -> i64 {
    d.num_microseconds().unwrap_or(i64::MAX)
}

struct RawDefinition {
    id: String,
    namespace: String,
    name: String,
    cron_expression: String,
    retention_days: u32,
    recipients: String,
    digest_days: u32,
    error_only: bool,
    last_digest: Option<String>,
    created_at: String,
}

impl RawDefinition {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            namespace: row.get(1)?,
            name: row.get(2)?,
            cron_expression: row.get(3)?,
            retention_days: row.get(4)?,
            recipients: row.get(5)?,
            digest_days: row.get(6)?,
            error_only: row.get(7)?,
            last_digest: row.get(8)?,
            created_at: row.get(9)?,
        })
    }

    fn decode(self) -> Result<JobDefinition> {
        Ok(JobDefinition {
            id: self.id,
            key: JobKey::new(self.namespace, self.name),
            cron_expression: self.cron_expression,
            retention_days: self.retention_days,
            recipients: crate::types::parse_recipients(&self.recipients),
            digest_days: self.digest_days,
            error_only: self.error_only,
            last_digest: self.last_digest.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

struct RawInstance {
    id: String,
    definition_id: String,
    start: String,
    started: Option<String>,
    status: String,
    time_spent_us: Option<i64>,
    result: String,
    has_errors: Option<bool>,
    reported: bool,
}

impl RawInstance {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            definition_id: row.get(1)?,
            start: row.get(2)?,
            started: row.get(3)?,
            status: row.get(4)?,
            time_spent_us: row.get(5)?,
            result: row.get(6)?,
            has_errors: row.get(7)?,
            reported: row.get(8)?,
        })
    }

    fn decode(self) -> Result<ScheduleInstance> {
        let status: InstanceStatus = self.status.parse().map_err(SchedulerError::Corrupt)?;
        Ok(ScheduleInstance {
            id: self.id,
            definition_id: self.definition_id,
            start: parse_ts(&self.start)?,
            started: self.started.as_deref().map(parse_ts).transpose()?,
            status,
            time_spent: self.time_spent_us.map(Duration::microseconds),
            result: self.result,
            has_errors: self.has_errors,
            reported: self.reported,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn definition_round_trip_and_update() {
        let store = SqliteStore::in_memory().unwrap();
        let mut def = definition("app", "job");
        def.recipients = vec!["a@example.com".into(), "b@example.com".into()];
        store.insert_definition(&def).unwrap();

        let loaded = store.get_definition(&def.key).unwrap().unwrap();
        assert_eq!(loaded.recipients, def.recipients);
        assert_eq!(loaded.retention_days, 30);

        let updated = store
            .update_definition(
                &def.key,
                &DefinitionUpdate {
                    cron_expression: Some("*/5 * * * *".into()),
                    error_only: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.cron_expression, "*/5 * * * *");
        assert!(updated.error_only);
        assert_eq!(updated.recipients, def.recipients);
        assert_eq!(store.get_definition_by_id(&def.id).unwrap().unwrap(), updated);
    }

    #[test]
    fn update_unknown_definition_fails() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .update_definition(&JobKey::new("x", "y"), &DefinitionUpdate::default())
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DefinitionNotFound { .. }));
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let store = SqliteStore::in_memory().unwrap();
        store.insert_definition(&definition("app", "job")).unwrap();
        assert!(store.insert_definition(&definition("app", "job")).is_err());
    }

    #[test]
    fn delete_definition_cascades() {
        let store = SqliteStore::in_memory().unwrap();
        let def = definition("app", "job");
        store.insert_definition(&def).unwrap();
        let inst = finished(&def, Utc::now(), false, false);
        store.insert_instance(&inst).unwrap();

        store.delete_definition(&def.id).unwrap();
        assert!(store.get_definition(&def.key).unwrap().is_none());
        assert!(store.get_instance(&inst.id).unwrap().is_none());
    }

    #[test]
    fn begin_run_is_compare_and_set() {
        let store = SqliteStore::in_memory().unwrap();
        let def = definition("app", "job");
        store.insert_definition(&def).unwrap();
        let inst = scheduled(&def, Utc::now());
        store.insert_instance(&inst).unwrap();

        assert!(store.begin_run(&inst.id, Utc::now()).unwrap());
        assert!(!store.begin_run(&inst.id, Utc::now()).unwrap());

        let running = store.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(running.status, InstanceStatus::Running);
        assert!(running.started.is_some());
    }

    #[test]
    fn finish_requires_running() {
        let store = SqliteStore::in_memory().unwrap();
        let def = definition("app", "job");
        store.insert_definition(&def).unwrap();
        let inst = scheduled(&def, Utc::now());
        store.insert_instance(&inst).unwrap();

        let outcome = ExecutionOutcome {
            has_errors: false,
            report: String::new(),
        };
        assert!(store.finish_run(&inst.id, &outcome, Duration::zero()).is_err());

        store.begin_run(&inst.id, Utc::now()).unwrap();
        store
            .finish_run(&inst.id, &outcome, Duration::milliseconds(1500))
            .unwrap();
        let done = store.get_instance(&inst.id).unwrap().unwrap();
        assert_eq!(done.status, InstanceStatus::Finished);
        assert_eq!(done.has_errors, Some(false));
        assert_eq!(done.time_spent, Some(Duration::milliseconds(1500)));
    }

    #[test]
    fn due_instances_respect_start_and_status() {
        let store = SqliteStore::in_memory().unwrap();
        let def = definition("app", "job");
        store.insert_definition(&def).unwrap();
        let now = Utc::now();
        let past = scheduled(&def, now - Duration::minutes(1));
        let future = scheduled(&def, now + Duration::minutes(1));
        store.insert_instance(&past).unwrap();
        store.insert_instance(&future).unwrap();

        let due = store.due_instances(now).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, past.id);
    }

    #[test]
    fn delete_expired_only_touches_old_reported_finished() {
        let store = SqliteStore::in_memory().unwrap();
        let def = definition("app", "job");
        store.insert_definition(&def).unwrap();
        let now = Utc::now();
        let old = now - Duration::days(40);

        let victim = finished(&def, old, false, true);
        let unreported = finished(&def, old, false, false);
        let recent = finished(&def, now, false, true);
        for inst in [&victim, &unreported, &recent] {
            store.insert_instance(inst).unwrap();
        }

        let deleted = store
            .delete_expired(&def.id, now - Duration::days(30))
            .unwrap();
        assert_eq!(deleted, 1);
        assert!(store.get_instance(&victim.id).unwrap().is_none());
        assert!(store.get_instance(&unreported.id).unwrap().is_some());
        assert!(store.get_instance(&recent.id).unwrap().is_some());
    }
}
