use std::time::Duration;

use async_trait::async_trait;
use cadence_core::config::MailConfig;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// A rendered digest, ready for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    pub subject: String,
    pub text: String,
    pub html: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("relay rejected digest ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Outbound delivery of digests. Failures are reported but callers treat
/// delivery as best-effort.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, digest: &Digest) -> Result<(), MailError>;
}

/// Writes digests to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, digest: &Digest) -> Result<(), MailError> {
        info!(
            subject = %digest.subject,
            recipients = %digest.recipients.join(", "),
            "digest (no mail relay configured)\n{}",
            digest.text
        );
        Ok(())
    }
}

/// Posts digests as JSON to an HTTP mail relay.
pub struct HttpMailer {
    client: reqwest::Client,
    relay_url: String,
    from: String,
    token: Option<String>,
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: &'a str,
    html: &'a str,
}

impl HttpMailer {
    /// `timeout` bounds the whole request, so a stalled relay cannot hold up a tick.
    pub fn new(
        relay_url: String,
        from: String,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, MailError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            relay_url,
            from,
            token,
        })
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, digest: &Digest) -> Result<(), MailError> {
        let body = RelayMessage {
            from: &self.from,
            to: &digest.recipients,
            subject: &digest.subject,
            text: &digest.text,
            html: &digest.html,
        };
        debug!(url = %self.relay_url, subject = %digest.subject, "posting digest to relay");

        let mut builder = self.client.post(&self.relay_url).json(&body);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let message = resp.text().await.unwrap_or_default();
            warn!(status, body = %message, "mail relay error");
            return Err(MailError::Rejected { status, message });
        }
        Ok(())
    }
}

/// Pick the mailer for `config`: the HTTP relay when configured, else the log.
pub fn from_config(config: &MailConfig) -> Result<Box<dyn Mailer>, MailError> {
    match config.relay_url {
        Some(ref url) => {
            info!(relay = %url, timeout_secs = config.timeout_secs, "digests delivered through HTTP relay");
            Ok(Box::new(HttpMailer::new(
                url.clone(),
                config.from.clone(),
                config.token.clone(),
                Duration::from_secs(config.timeout_secs.max(1)),
            )?))
        }
        None => Ok(Box::new(LogMailer)),
    }
}
