//! Outbound mail transport.
//!
//! [`MailgunTransport`] sends through the Mailgun HTTP API.
//! [`MockMailTransport`] records sends in memory and can be told to fail.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{error, info};

use crate::config::Config;
use crate::error::{Error, Result};

/// A fully rendered email ready to hand to a transport.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEmail {
    pub to: String,
    pub from: String,
    pub reply_to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    /// Send one email. Any failure is reported as `Error::Transport`.
    async fn send(&self, email: &OutboundEmail) -> Result<()>;
}

// =============================================================================
// Mailgun
// =============================================================================

pub const DEFAULT_MAILGUN_API_BASE: &str = "https://api.mailgun.net/v3";

/// Mailgun `messages` endpoint client.
pub struct MailgunTransport {
    client: Client,
    api_base: String,
    domain: String,
    api_key: String,
    timeout: Duration,
}

impl MailgunTransport {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        domain: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            domain: domain.into(),
            api_key: api_key.into(),
            timeout,
        }
    }

    /// Build from `MAILGUN_*` settings; both the key and the domain are required.
    pub fn from_config(config: &Config, client: Client) -> anyhow::Result<Self> {
        let api_key = config
            .mailgun_api_key
            .clone()
            .context("MAILGUN_API_KEY is not set")?;
        let domain = config
            .mailgun_domain
            .clone()
            .context("MAILGUN_DOMAIN is not set")?;
        Ok(Self::new(
            client,
            config.mailgun_api_base.clone(),
            domain,
            api_key,
            config.request_timeout(),
        ))
    }

    fn messages_url(&self) -> String {
        format!(
            "{}/{}/messages",
            self.api_base.trim_end_matches('/'),
            self.domain
        )
    }
}

#[async_trait]
impl MailTransport for MailgunTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        let form = [
            ("from", email.from.as_str()),
            ("to", email.to.as_str()),
            ("subject", email.subject.as_str()),
            ("html", email.html.as_str()),
            ("h:Reply-To", email.reply_to.as_str()),
        ];

        let response = self
            .client
            .post(self.messages_url())
            .basic_auth("api", Some(&self.api_key))
            .timeout(self.timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!(
                        to = %email.to,
                        timeout_seconds = self.timeout.as_secs_f64(),
                        error = %e,
                        "mailgun_send_timeout"
                    );
                } else {
                    error!(to = %email.to, error = %e, "mailgun_send_request_error");
                }
                anyhow::Error::new(e).context("Mailgun request failed")
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(
                to = %email.to,
                status_code = status.as_u16(),
                body_preview = %body.chars().take(200).collect::<String>(),
                "mailgun_send_rejected"
            );
            return Err(Error::Transport(anyhow!(
                "Mailgun returned {} for {}",
                status,
                email.to
            )));
        }

        info!(
            to = %email.to,
            status_code = status.as_u16(),
            "mailgun_send_accepted"
        );
        Ok(())
    }
}

// =============================================================================
// In-memory transport
// =============================================================================

/// Records every successful send. Addresses in the failure set are rejected.
#[derive(Clone, Default)]
pub struct MockMailTransport {
    sent: Arc<Mutex<Vec<OutboundEmail>>>,
    failing: Arc<Mutex<HashSet<String>>>,
    fail_all: Arc<Mutex<bool>>,
}

impl MockMailTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, to: &str) -> Vec<OutboundEmail> {
        self.sent.lock().iter().filter(|e| e.to == to).cloned().collect()
    }

    pub fn fail_for(&self, to: &str) {
        self.failing.lock().insert(to.to_string());
    }

    pub fn fail_all(&self, fail: bool) {
        *self.fail_all.lock() = fail;
    }
}

#[async_trait]
impl MailTransport for MockMailTransport {
    async fn send(&self, email: &OutboundEmail) -> Result<()> {
        if *self.fail_all.lock() || self.failing.lock().contains(&email.to) {
            return Err(Error::Transport(anyhow!("injected send failure for {}", email.to)));
        }
        self.sent.lock().push(email.clone());
        Ok(())
    }
}

/// Build the shared HTTP client used by the Mailgun transport and feed fetches.
pub fn http_client(timeout: Duration) -> anyhow::Result<Client> {
    Client::builder()
        .pool_max_idle_per_host(100)
        .timeout(timeout)
        .build()
        .context("Failed to create HTTP client")
}
