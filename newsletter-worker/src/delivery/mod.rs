//! Delivery of one queued task.
//!
//! The worker resolves the task's list, subscription and content blob,
//! renders the email for the subscriber and hands it to the transport. The
//! lease on the task is completed only after the transport reports success,
//! so a crash before the send leaves the task for redelivery.

pub mod transport;

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::queue::{DeliveryTask, Lease};
use crate::render::{render_template, Substitutions};
use crate::store::{BlobStore, ListRegistry, SubscriptionStore};

pub use transport::{
    http_client, MailTransport, MailgunTransport, MockMailTransport, OutboundEmail,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The email was accepted by the transport
    Sent,
    /// The subscription was removed after fan-out; nothing was sent
    SkippedUnsubscribed,
}

pub struct DeliveryWorker {
    lists: Arc<dyn ListRegistry>,
    subscriptions: Arc<dyn SubscriptionStore>,
    blobs: Arc<dyn BlobStore>,
    transport: Arc<dyn MailTransport>,
}

impl DeliveryWorker {
    pub fn new(
        lists: Arc<dyn ListRegistry>,
        subscriptions: Arc<dyn SubscriptionStore>,
        blobs: Arc<dyn BlobStore>,
        transport: Arc<dyn MailTransport>,
    ) -> Self {
        Self {
            lists,
            subscriptions,
            blobs,
            transport,
        }
    }

    /// Deliver a task and settle its lease.
    ///
    /// Success completes the lease. Failure abandons it, asking for redelivery
    /// only when the error is retryable; the error is then returned.
    pub async fn process(&self, task: &DeliveryTask, lease: &dyn Lease) -> Result<DeliveryOutcome> {
        match self.deliver(task).await {
            Ok(outcome) => {
                lease.complete().await?;
                Ok(outcome)
            }
            Err(e) => {
                let requeue = e.is_retryable();
                warn!(
                    list = %task.list_name,
                    email = %task.subscriber_email,
                    item_guid = %task.item_guid,
                    requeue = requeue,
                    error = %e,
                    "delivery_failed"
                );
                if let Err(abandon_err) = lease.abandon(requeue).await {
                    error!(
                        list = %task.list_name,
                        email = %task.subscriber_email,
                        error = %abandon_err,
                        "delivery_abandon_failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Render and send a task without touching the queue.
    pub async fn deliver(&self, task: &DeliveryTask) -> Result<DeliveryOutcome> {
        let list = self
            .lists
            .get(&task.list_name)
            .await?
            .ok_or_else(|| Error::list_not_found(&task.list_name))?;

        let subscription = match self
            .subscriptions
            .get(&task.list_name, &task.subscriber_email)
            .await?
        {
            Some(subscription) => subscription,
            None => {
                info!(
                    list = %task.list_name,
                    email = %task.subscriber_email,
                    item_guid = %task.item_guid,
                    "delivery_skipped_unsubscribed"
                );
                return Ok(DeliveryOutcome::SkippedUnsubscribed);
            }
        };

        let body = self
            .blobs
            .get(&task.content_hash)
            .await?
            .ok_or_else(|| Error::NotFound {
                entity: "Content",
                key: task.content_hash.clone(),
            })?;

        let html = render_template(&body, &Substitutions::for_item(&list, &subscription.email));

        let email = OutboundEmail {
            to: subscription.email,
            from: list.from_address,
            reply_to: list.reply_to_address,
            subject: task.subject.clone(),
            html,
        };
        self.transport.send(&email).await?;

        info!(
            list = %task.list_name,
            email = %email.to,
            item_guid = %task.item_guid,
            content_hash = %task.content_hash,
            "delivery_sent"
        );
        Ok(DeliveryOutcome::Sent)
    }
}
