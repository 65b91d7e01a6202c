use std::any::Any;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;
use tracing::{debug, warn};

use crate::{
    registry::{Capture, Job, JobRegistry},
    types::{ExecutionOutcome, JobKey},
};

const MESSAGES_TITLE: &str = "MESSAGES";
const ERRORS_TITLE: &str = "ERRORS";

/// Look up `key` and run it with fresh capture sinks.
///
/// Never fails: a registry miss, an `Err` from the job body or a panic all
/// come back as an outcome with `has_errors` set.
pub async fn execute(registry: &JobRegistry, key: &JobKey) -> ExecutionOutcome {
    let Some(job) = registry.lookup(key) else {
        warn!(%key, "job not found in registry");
        return ExecutionOutcome::failed(format!("Job {key} not found in the registry"));
    };
    let outcome = run_captured(job.as_ref()).await;
    debug!(%key, has_errors = outcome.has_errors, "job body returned");
    outcome
}

/// Run one job body. The capture lives exactly as long as this call.
pub async fn run_captured(job: &dyn Job) -> ExecutionOutcome {
    let mut io = Capture::default();
    let result = AssertUnwindSafe(job.execute(&mut io)).catch_unwind().await;

    match result {
        Ok(Ok(())) => build_report(&io),
        Ok(Err(e)) => ExecutionOutcome::failed(format!("Job aborted with error: {e:#}")),
        Err(payload) => ExecutionOutcome::failed(format!(
            "Job aborted with error: {}",
            panic_message(payload.as_ref())
        )),
    }
}

fn build_report(io: &Capture) -> ExecutionOutcome {
    let mut lines: Vec<String> = Vec::new();
    push_section(&mut lines, MESSAGES_TITLE, &io.out);
    push_section(&mut lines, ERRORS_TITLE, &io.err);
    ExecutionOutcome {
        has_errors: !io.err.is_empty(),
        report: lines.join("\n"),
    }
}

fn push_section(lines: &mut Vec<String>, title: &str, body: &str) {
    if body.is_empty() {
        return;
    }
    lines.push(String::new());
    lines.push(title.to_string());
    lines.push("-".repeat(title.len()));
    lines.push(String::new());
    lines.extend(body.lines().map(String::from));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::registry::fixtures::ScriptedJob;

    async fn run(job: ScriptedJob) -> ExecutionOutcome {
        let mut registry = JobRegistry::new();
        let key = JobKey::new("app", "job");
        registry.register(key.clone(), Arc::new(job));
        execute(&registry, &key).await
    }

    #[tokio::test]
    async fn output_only_is_clean() {
        let outcome = run(ScriptedJob::printing("line one\nline two")).await;
        assert!(!outcome.has_errors);
        assert_eq!(outcome.report, "\nMESSAGES\n--------\n\nline one\nline two");
    }

    #[tokio::test]
    async fn error_channel_marks_failure() {
        let outcome = run(ScriptedJob::complaining("disk full")).await;
        assert!(outcome.has_errors);
        assert_eq!(outcome.report, "\nERRORS\n------\n\ndisk full");
    }

    #[tokio::test]
    async fn both_sections_in_order() {
        let outcome = run(ScriptedJob {
            err: "warning",
            ..ScriptedJob::printing("progress")
        })
        .await;
        assert!(outcome.has_errors);
        let messages = outcome.report.find("MESSAGES").unwrap();
        let errors = outcome.report.find("ERRORS").unwrap();
        assert!(messages < errors);
    }

    #[tokio::test]
    async fn silent_job_has_empty_report() {
        let outcome = run(ScriptedJob::printing("")).await;
        assert!(!outcome.has_errors);
        assert!(outcome.report.is_empty());
    }

    #[tokio::test]
    async fn returned_error_aborts() {
        let outcome = run(ScriptedJob {
            fail: Some("connection refused"),
            ..ScriptedJob::printing("partial")
        })
        .await;
        assert!(outcome.has_errors);
        assert_eq!(outcome.report, "Job aborted with error: connection refused");
    }

    #[tokio::test]
    async fn panic_is_contained() {
        let outcome = run(ScriptedJob {
            panic: true,
            ..ScriptedJob::printing("")
        })
        .await;
        assert!(outcome.has_errors);
        assert_eq!(outcome.report, "Job aborted with error: scripted panic");
    }

    #[tokio::test]
    async fn missing_job_is_reported_not_raised() {
        let registry = JobRegistry::new();
        let outcome = execute(&registry, &JobKey::new("app", "gone")).await;
        assert!(outcome.has_errors);
        assert!(outcome.report.contains("not found"));
    }
}
