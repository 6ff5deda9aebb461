//! Subscription lifecycle.
//!
//! ```text
//! (none) --subscribe--> Unverified --verify--> Verified
//!                           |                     |
//!                           +------delete---------+--> (none)
//! ```
//!
//! A subscription never moves back from `Verified`. Repeated subscribe calls
//! for an unverified address resend the verification email, throttled by a
//! cooldown measured from the last send.

pub mod address;

use std::sync::Arc;

use anyhow::anyhow;
use chrono::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::delivery::transport::{MailTransport, OutboundEmail};
use crate::error::{Error, Result};
use crate::model::{List, Subscription, VerificationState};
use crate::render::{render_template, templates, Substitutions};
use crate::store::SubscriptionStore;
use crate::util::{generate_token, Clock};

pub use address::normalize_email;

/// Attempts at drawing a token that is not already in the token index.
const TOKEN_ATTEMPTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubscriptionSettings {
    /// Minimum time between two verification emails for one subscription
    pub cooldown: Duration,
}

impl Default for SubscriptionSettings {
    fn default() -> Self {
        Self {
            cooldown: Duration::minutes(15),
        }
    }
}

impl SubscriptionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cooldown: Duration::minutes(config.verification_cooldown_minutes),
        }
    }
}

/// Subscribe, verify and unsubscribe operations over a [`SubscriptionStore`].
pub struct SubscriptionService {
    store: Arc<dyn SubscriptionStore>,
    transport: Arc<dyn MailTransport>,
    clock: Arc<dyn Clock>,
    settings: SubscriptionSettings,
}

impl SubscriptionService {
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        transport: Arc<dyn MailTransport>,
        clock: Arc<dyn Clock>,
        settings: SubscriptionSettings,
    ) -> Self {
        Self {
            store,
            transport,
            clock,
            settings,
        }
    }

    /// Subscribe `email` to `list`.
    ///
    /// - already verified: no-op, returns the existing record
    /// - unverified: resends the verification email (subject to the cooldown)
    /// - absent: creates an unverified record and sends the verification email
    pub async fn subscribe(&self, list: &List, email: &str) -> Result<Subscription> {
        let email = normalize_email(email)?;

        match self.store.get(&list.name, &email).await? {
            Some(existing) => self.subscribe_existing(list, existing).await,
            None => self.create(list, email).await,
        }
    }

    /// Resend the verification email of an existing unverified subscription.
    pub async fn resend_verification(&self, list: &List, email: &str) -> Result<Subscription> {
        let email = normalize_email(email)?;
        let existing = self
            .store
            .get(&list.name, &email)
            .await?
            .ok_or_else(|| Error::subscription_not_found(&list.name, &email))?;

        if existing.is_verified() {
            return Err(Error::AlreadyVerified);
        }
        self.resend(list, existing).await
    }

    /// Redeem a verification token.
    pub async fn verify(&self, token: &str) -> Result<Subscription> {
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::UnknownToken);
        }

        let mut matches = self.store.find_by_token(token).await?;
        let mut subscription = match matches.len() {
            0 => {
                info!("verify_unknown_token");
                return Err(Error::UnknownToken);
            }
            1 => matches.remove(0),
            count => {
                error!(
                    index = "verification_token",
                    count = count,
                    "subscription_token_ambiguous"
                );
                return Err(Error::AmbiguousMatch {
                    index: "verification_token",
                    key: token.to_string(),
                    count,
                });
            }
        };

        if subscription.is_verified() {
            info!(
                list = %subscription.list,
                email = %subscription.email,
                "verify_already_verified"
            );
            return Err(Error::AlreadyVerified);
        }

        self.store
            .mark_verified(&subscription.list, &subscription.email)
            .await?;
        subscription.verification = VerificationState::Verified;

        info!(
            list = %subscription.list,
            email = %subscription.email,
            "subscription_verified"
        );
        Ok(subscription)
    }

    /// Remove the subscription of `email` on `list`. `NotFound` if absent.
    pub async fn unsubscribe(&self, list: &str, email: &str) -> Result<()> {
        let email = normalize_email(email)?;
        self.store.delete(list, &email).await?;
        info!(list = %list, email = %email, "subscription_removed");
        Ok(())
    }

    /// Remove `email` from every list it is subscribed to.
    ///
    /// Every row is attempted. Rows that vanished concurrently count as
    /// removed. Returns the number of rows removed, or an aggregate error
    /// naming each row that could not be deleted.
    pub async fn delete_all_for_email(&self, email: &str) -> Result<usize> {
        let email = normalize_email(email)?;
        let rows = self.store.find_by_email(&email).await?;
        let total = rows.len();

        let mut removed = 0;
        let mut failures = Vec::new();

        for row in rows {
            match self.store.delete(&row.list, &row.email).await {
                Ok(()) => {
                    removed += 1;
                    info!(list = %row.list, email = %row.email, "subscription_removed");
                }
                Err(e) if e.is_not_found() => {
                    debug!(list = %row.list, email = %row.email, "subscription_already_removed");
                    removed += 1;
                }
                Err(e) => {
                    warn!(
                        list = %row.list,
                        email = %row.email,
                        error = %e,
                        "subscription_remove_failed"
                    );
                    failures.push(format!("{}/{}: {}", row.list, row.email, e));
                }
            }
        }

        if !failures.is_empty() {
            return Err(Error::Aggregate {
                operation: "delete_all_for_email",
                failed: failures.len(),
                total,
                failures,
            });
        }

        Ok(removed)
    }

    async fn subscribe_existing(&self, list: &List, existing: Subscription) -> Result<Subscription> {
        if existing.is_verified() {
            info!(list = %list.name, email = %existing.email, "subscribe_already_verified");
            return Ok(existing);
        }
        self.resend(list, existing).await
    }

    async fn create(&self, list: &List, email: String) -> Result<Subscription> {
        let subscription = Subscription {
            list: list.name.clone(),
            email,
            verification_token: self.issue_token().await?,
            verification: VerificationState::Unverified,
            last_sent_verification: self.clock.now(),
        };

        if !self.store.insert(&subscription).await? {
            // Another request created the row after our read
            info!(
                list = %subscription.list,
                email = %subscription.email,
                "subscription_create_conflict"
            );
            let existing = self
                .store
                .get(&subscription.list, &subscription.email)
                .await?
                .ok_or_else(|| Error::subscription_not_found(&list.name, &subscription.email))?;
            return self.subscribe_existing(list, existing).await;
        }
        info!(
            list = %subscription.list,
            email = %subscription.email,
            "subscription_created"
        );

        self.send_verification(list, &subscription).await?;
        Ok(subscription)
    }

    async fn resend(&self, list: &List, mut subscription: Subscription) -> Result<Subscription> {
        let now = self.clock.now();
        let elapsed = now - subscription.last_sent_verification;

        if elapsed < self.settings.cooldown {
            let retry_after_secs = (self.settings.cooldown - elapsed).num_seconds().max(1);
            warn!(
                list = %subscription.list,
                email = %subscription.email,
                retry_after_secs = retry_after_secs,
                "verification_resend_throttled"
            );
            return Err(Error::RecentlySent { retry_after_secs });
        }

        self.send_verification(list, &subscription).await?;
        self.store
            .record_verification_sent(&subscription.list, &subscription.email, now)
            .await?;
        subscription.last_sent_verification = now;
        Ok(subscription)
    }

    async fn send_verification(&self, list: &List, subscription: &Subscription) -> Result<()> {
        let html = render_template(
            &templates::verification_email(),
            &Substitutions::for_verification(list, subscription),
        );
        let email = OutboundEmail {
            to: subscription.email.clone(),
            from: list.from_address.clone(),
            reply_to: list.reply_to_address.clone(),
            subject: templates::verification_subject(&list.name),
            html,
        };

        self.transport.send(&email).await?;
        info!(
            list = %subscription.list,
            email = %subscription.email,
            "verification_sent"
        );
        Ok(())
    }

    async fn issue_token(&self) -> Result<String> {
        for _ in 0..TOKEN_ATTEMPTS {
            let token = generate_token();
            if self.store.find_by_token(&token).await?.is_empty() {
                return Ok(token);
            }
            warn!("verification_token_collision");
        }
        Err(Error::Transport(anyhow!(
            "no unique verification token after {} attempts",
            TOKEN_ATTEMPTS
        )))
    }
}
