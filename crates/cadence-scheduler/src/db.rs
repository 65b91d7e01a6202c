use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `job_definitions` and `job_schedules` tables (idempotent) plus
/// the indexes used by the due-instance and retention queries.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        PRAGMA foreign_keys = ON;

        CREATE TABLE IF NOT EXISTS job_definitions (
            id              TEXT    NOT NULL PRIMARY KEY,
            namespace       TEXT    NOT NULL,
            name            TEXT    NOT NULL,
            cron_expression TEXT    NOT NULL,
            retention_days  INTEGER NOT NULL DEFAULT 30,
            recipients      TEXT    NOT NULL DEFAULT '',  -- one address per line
            digest_days     INTEGER NOT NULL DEFAULT 0,
            error_only      INTEGER NOT NULL DEFAULT 0,
            last_digest     TEXT,                         -- RFC 3339 or NULL
            created_at      TEXT    NOT NULL,
            UNIQUE (namespace, name)
        ) STRICT;

        CREATE TABLE IF NOT EXISTS job_schedules (
            id              TEXT    NOT NULL PRIMARY KEY,
            definition_id   TEXT    NOT NULL
                REFERENCES job_definitions (id) ON DELETE CASCADE,
            start           TEXT    NOT NULL,
            started         TEXT,
            status          TEXT    NOT NULL DEFAULT 'scheduled',
            time_spent_us   INTEGER,                      -- microseconds, set when finished
            result          TEXT    NOT NULL DEFAULT '',
            has_errors      INTEGER,                      -- NULL until finished
            reported        INTEGER NOT NULL DEFAULT 0
        ) STRICT;

        -- Due-instance polling: WHERE status = 'scheduled' AND start <= ?
        CREATE INDEX IF NOT EXISTS idx_job_schedules_status_start
            ON job_schedules (status, start);
        CREATE INDEX IF NOT EXISTS idx_job_schedules_definition
            ON job_schedules (definition_id, status);
        ",
    )?;
    Ok(())
}

/// Fixed-width UTC timestamp so lexical order in SQL equals time order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SchedulerError::Corrupt(format!("bad timestamp '{raw}': {e}")))
}
