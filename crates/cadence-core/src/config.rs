use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_SECS: u64 = 60;
pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 8;
pub const DEFAULT_MAIL_FROM: &str = "cadence@localhost";
pub const DEFAULT_MAIL_TIMEOUT_SECS: u64 = 30;

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub mail: MailConfig,
    /// Shell-command jobs exposed through the job registry.
    #[serde(default)]
    pub jobs: Vec<CommandJobConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Control-loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two ticks in `serve` mode.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Upper bound on job executions running at the same time.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: DEFAULT_TICK_SECS,
            max_concurrent_jobs: DEFAULT_MAX_CONCURRENT_JOBS,
        }
    }
}

/// Digest delivery. Without a `relay_url` digests are only written to the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailConfig {
    /// HTTP endpoint accepting `{from, to, subject, text, html}` JSON posts.
    pub relay_url: Option<String>,
    #[serde(default = "default_mail_from")]
    pub from: String,
    /// Bearer token sent to the relay, if it requires one.
    pub token: Option<String>,
    /// Upper bound on one relay request, connect included.
    #[serde(default = "default_mail_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            from: default_mail_from(),
            token: None,
            timeout_secs: DEFAULT_MAIL_TIMEOUT_SECS,
        }
    }
}

/// A job that runs a shell command, declared in `[[jobs]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandJobConfig {
    pub namespace: String,
    pub name: String,
    pub command: String,
    /// Cadence alias (`hourly`, `daily`, …) used when the job is first discovered.
    pub when: Option<String>,
    pub help: Option<String>,
}

fn default_tick_secs() -> u64 {
    DEFAULT_TICK_SECS
}
fn default_max_concurrent_jobs() -> usize {
    DEFAULT_MAX_CONCURRENT_JOBS
}
fn default_mail_from() -> String {
    DEFAULT_MAIL_FROM.to_string()
}
fn default_mail_timeout_secs() -> u64 {
    DEFAULT_MAIL_TIMEOUT_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.db", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g. `CADENCE_SCHEDULER__TICK_SECS=30`.
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CadenceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CADENCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))?;

        tracing::debug!(path = %path, jobs = config.jobs.len(), "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence/cadence.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = CadenceConfig::load(Some("missing.toml")).unwrap();
            assert_eq!(config.scheduler.tick_secs, DEFAULT_TICK_SECS);
            assert_eq!(config.scheduler.max_concurrent_jobs, DEFAULT_MAX_CONCURRENT_JOBS);
            assert!(config.mail.relay_url.is_none());
            assert_eq!(config.mail.timeout_secs, DEFAULT_MAIL_TIMEOUT_SECS);
            assert!(config.jobs.is_empty());
            Ok(())
        });
    }

    #[test]
    fn toml_jobs_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [scheduler]
                tick_secs = 15

                [[jobs]]
                namespace = "ops"
                name = "backup"
                command = "echo done"
                when = "hourly"
                "#,
            )?;
            jail.set_env("CADENCE_SCHEDULER__MAX_CONCURRENT_JOBS", "2");

            let config = CadenceConfig::load(Some("cadence.toml")).unwrap();
            assert_eq!(config.scheduler.tick_secs, 15);
            assert_eq!(config.scheduler.max_concurrent_jobs, 2);
            assert_eq!(config.jobs.len(), 1);
            assert_eq!(config.jobs[0].when.as_deref(), Some("hourly"));
            assert!(config.jobs[0].help.is_none());
            Ok(())
        });
    }

    #[test]
    fn malformed_job_is_a_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "cadence.toml",
                r#"
                [[jobs]]
                namespace = "ops"
                name = "backup"
                "#,
            )?;
            let err = CadenceConfig::load(Some("cadence.toml")).unwrap_err();
            assert_eq!(err.code(), "CONFIG_ERROR");
            assert!(err.to_string().contains("command"));
            Ok(())
        });
    }
}
