use std::process::Stdio;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use cadence_core::config::CommandJobConfig;
use tokio::process::Command;
use tracing::debug;

use crate::{
    registry::{Capture, Job, JobRegistry},
    types::JobKey,
};

/// A job that runs a shell command and captures its output.
#[derive(Debug, Clone)]
pub struct CommandJob {
    command: String,
    when: Option<String>,
    help: Option<String>,
}

impl CommandJob {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            when: None,
            help: None,
        }
    }

    pub fn from_config(config: &CommandJobConfig) -> Self {
        Self {
            command: config.command.clone(),
            when: config.when.clone(),
            help: config.help.clone(),
        }
    }
}

#[async_trait]
impl Job for CommandJob {
    async fn execute(&self, io: &mut Capture) -> anyhow::Result<()> {
        debug!(command = %self.command, "spawning command job");
        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| format!("failed to spawn `{}`", self.command))?;

        io.out.push_str(&strip_text(&output.stdout));
        io.err.push_str(&strip_text(&output.stderr));
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            if !io.err.is_empty() && !io.err.ends_with('\n') {
                io.err.push('\n');
            }
            io.err
                .push_str(&format!("command exited with status {code}\n"));
        }
        Ok(())
    }

    fn description(&self) -> Option<&str> {
        Some(&self.command)
    }

    fn help(&self) -> Option<&str> {
        self.help.as_deref()
    }

    fn when(&self) -> Option<&str> {
        self.when.as_deref()
    }
}

/// Register one [`CommandJob`] per configured entry.
pub fn register_commands(registry: &mut JobRegistry, jobs: &[CommandJobConfig]) {
    for config in jobs {
        let key = JobKey::new(&config.namespace, &config.name);
        debug!(job = %key, "registering command job");
        registry.register(key, Arc::new(CommandJob::from_config(config)));
    }
}

fn strip_text(raw: &[u8]) -> String {
    let clean = strip_ansi_escapes::strip(raw);
    String::from_utf8_lossy(&clean).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stdout_is_captured_without_colours() {
        let job = CommandJob::new(r"printf '\033[31mred\033[0m plain\n'");
        let mut io = Capture::default();
        job.execute(&mut io).await.unwrap();
        assert_eq!(io.out, "red plain\n");
        assert!(io.err.is_empty());
    }

    #[tokio::test]
    async fn failure_lands_in_err() {
        let job = CommandJob::new("echo oops >&2; exit 3");
        let mut io = Capture::default();
        job.execute(&mut io).await.unwrap();
        assert!(io.out.is_empty());
        assert_eq!(io.err, "oops\ncommand exited with status 3\n");
    }

    #[test]
    fn configured_jobs_are_registered() {
        let mut registry = JobRegistry::new();
        register_commands(
            &mut registry,
            &[CommandJobConfig {
                namespace: "ops".into(),
                name: "backup".into(),
                command: "true".into(),
                when: Some("hourly".into()),
                help: Some("Nightly backup".into()),
            }],
        );
        let job = registry.lookup(&JobKey::new("ops", "backup")).unwrap();
        assert_eq!(job.when(), Some("hourly"));
        assert_eq!(job.help(), Some("Nightly backup"));
        assert_eq!(job.description(), Some("true"));
    }
}
