//! Human-readable renderings used by the CLI and the digest bodies.

use chrono::{DateTime, Duration, Local, Utc};

use crate::types::{InstanceStatus, ScheduleInstance};

fn plural(n: i64, one: &str, many: &str) -> String {
    if n == 1 {
        one.to_string()
    } else {
        format!("{n} {many}")
    }
}

/// "2 days, one hour, 3 seconds". Sub-second durations are shown in microseconds.
pub fn humanize_duration(d: Option<Duration>) -> String {
    let Some(d) = d else {
        return "no time".to_string();
    };

    let mut parts = Vec::new();
    let days = d.num_days();
    if days > 0 {
        parts.push(plural(days, "one day", "days"));
    }

    let mut seconds = d.num_seconds() - days * 86_400;
    if seconds > 0 {
        if seconds >= 3600 {
            parts.push(plural(seconds / 3600, "one hour", "hours"));
            seconds %= 3600;
        }
        if seconds >= 60 {
            parts.push(plural(seconds / 60, "one minute", "minutes"));
            seconds %= 60;
        }
        if seconds > 0 {
            parts.push(plural(seconds, "one second", "seconds"));
        }
    } else {
        let micros = (d - Duration::seconds(d.num_seconds()))
            .num_microseconds()
            .unwrap_or(0);
        if micros > 0 {
            parts.push(plural(micros, "one microsecond", "microseconds"));
        }
    }

    if parts.is_empty() {
        "no time".to_string()
    } else {
        parts.join(", ")
    }
}

/// Local wall-clock time without sub-second noise.
pub fn local_time(ts: DateTime<Utc>) -> String {
    ts.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// One-line state of an instance, e.g. "running since 2026-10-19 09:00:00".
pub fn summary(instance: &ScheduleInstance) -> String {
    match instance.status {
        InstanceStatus::Scheduled => format!("scheduled start for {}", local_time(instance.start)),
        InstanceStatus::Running => match instance.started {
            Some(started) => format!("running since {}", local_time(started)),
            None => "running".to_string(),
        },
        InstanceStatus::Finished => format!(
            "run on {}, taking {} to complete",
            instance
                .started
                .map(local_time)
                .unwrap_or_else(|| "unknown time".to_string()),
            humanize_duration(instance.time_spent)
        ),
    }
}
