use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::{
    display,
    error::Result,
    mailer::{Digest, Mailer},
    store::Store,
    types::{JobDefinition, ScheduleInstance},
};

/// What one digest pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DigestSummary {
    /// Digests handed to the mailer (delivered or not).
    pub sent: usize,
    /// Instances flagged as reported.
    pub reported: usize,
}

/// Mail a digest of unreported finished runs for every definition that is due.
///
/// Delivery failures are logged and otherwise ignored; the runs are marked
/// reported either way.
pub async fn send_digests(
    store: &dyn Store,
    mailer: &dyn Mailer,
    now: DateTime<Utc>,
) -> Result<DigestSummary> {
    let mut summary = DigestSummary::default();

    for definition in store.list_definitions()? {
        if definition.recipients.is_empty() || !digest_due(&definition, now) {
            continue;
        }

        let unreported = store.unreported_finished(&definition.id)?;
        if unreported.is_empty() {
            continue;
        }

        let selected: Vec<&ScheduleInstance> = unreported
            .iter()
            .filter(|i| !definition.error_only || i.has_errors == Some(true))
            .collect();

        if selected.is_empty() {
            debug!(job = %definition.key, "only clean runs; nothing to mail");
        } else {
            let digest = render(&definition, &selected);
            match mailer.send(&digest).await {
                Ok(()) => info!(job = %definition.key, runs = selected.len(), "digest sent"),
                Err(e) => warn!(job = %definition.key, error = %e, "digest delivery failed"),
            }
            summary.sent += 1;
        }

        let ids: Vec<String> = unreported.into_iter().map(|i| i.id).collect();
        summary.reported += store.mark_reported(&ids)?;
        store.set_last_digest(&definition.id, now)?;
    }

    Ok(summary)
}

fn digest_due(definition: &JobDefinition, now: DateTime<Utc>) -> bool {
    match definition.last_digest {
        Some(last) => Duration::try_days(i64::from(definition.digest_days))
            .is_some_and(|interval| now - last >= interval),
        None => true,
    }
}

/// Build the subject and both bodies for `rounds`.
pub fn render(definition: &JobDefinition, rounds: &[&ScheduleInstance]) -> Digest {
    let failed = rounds.iter().filter(|r| r.has_errors == Some(true)).count();

    let mut text = format!(
        "Job: {}\nRuns: {} ({} with errors)\n",
        definition.key,
        rounds.len(),
        failed
    );
    let mut html = format!(
        "<h1>{}</h1>\n<p>Runs: {} ({} with errors)</p>\n",
        escape_html(&definition.key.to_string()),
        rounds.len(),
        failed
    );

    for round in rounds {
        let state = if round.has_errors == Some(true) {
            "FAILED"
        } else {
            "OK"
        };
        let line = display::summary(round);
        text.push_str(&format!("\n== [{state}] {line}\n{}\n", round.result.trim()));
        html.push_str(&format!(
            "<h2>[{state}] {}</h2>\n<pre>{}</pre>\n",
            escape_html(&line),
            escape_html(round.result.trim())
        ));
    }

    Digest {
        subject: format!("Digest JOB: {}", definition.key.name),
        text,
        html,
        recipients: definition.recipients.clone(),
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
