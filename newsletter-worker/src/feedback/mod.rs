//! Bounce and complaint handling.
//!
//! A permanent bounce, or a complaint not marked `not-spam`, removes every
//! destination address of the event from every list. Everything else is
//! ignored. Events of a batch are independent: a malformed event or a failed
//! removal is recorded and the rest of the batch is still applied.

pub mod signature;
pub mod types;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::subscription::SubscriptionService;

pub use types::{classify, decode_event, Classification, FeedbackEvent, Notification};

/// Counters for a handled batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackReport {
    pub events: usize,
    pub ignored: usize,
    pub addresses_removed: usize,
    pub subscriptions_removed: usize,
    pub failures: Vec<String>,
}

pub struct BounceHandler {
    subscriptions: Arc<SubscriptionService>,
}

impl BounceHandler {
    pub fn new(subscriptions: Arc<SubscriptionService>) -> Self {
        Self { subscriptions }
    }

    /// Apply a batch of raw events.
    ///
    /// Returns an aggregate error naming every failed event once the whole
    /// batch has been processed.
    pub async fn handle_batch(&self, events: &[String]) -> Result<FeedbackReport> {
        let mut report = FeedbackReport {
            events: events.len(),
            ..Default::default()
        };
        let mut failed_events = 0;

        for (index, raw) in events.iter().enumerate() {
            let failures_before = report.failures.len();
            self.handle_event(index, raw, &mut report).await;
            if report.failures.len() > failures_before {
                failed_events += 1;
            }
        }

        info!(
            events = report.events,
            ignored = report.ignored,
            addresses_removed = report.addresses_removed,
            subscriptions_removed = report.subscriptions_removed,
            failed_events = failed_events,
            "feedback_batch_handled"
        );

        if report.failures.is_empty() {
            return Ok(report);
        }
        Err(Error::Aggregate {
            operation: "feedback_batch",
            failed: failed_events,
            total: report.events,
            failures: report.failures,
        })
    }

    async fn handle_event(&self, index: usize, raw: &str, report: &mut FeedbackReport) {
        let notification = match decode_event(raw) {
            Ok(FeedbackEvent::Notification(n)) => n,
            Ok(FeedbackEvent::Control(kind)) => {
                debug!(event = index, kind = %kind, "feedback_control_ignored");
                report.ignored += 1;
                return;
            }
            Err(e) => {
                warn!(event = index, error = %e, "feedback_event_malformed");
                report.failures.push(format!("event {}: {}", index, e));
                return;
            }
        };

        let classification = classify(&notification);
        if !classification.removes_recipients() {
            debug!(
                event = index,
                notification_type = %notification.notification_type,
                "feedback_event_ignored"
            );
            report.ignored += 1;
            return;
        }

        for address in &notification.mail.destination {
            match self.subscriptions.delete_all_for_email(address).await {
                Ok(removed) => {
                    info!(
                        event = index,
                        email = %address,
                        classification = ?classification,
                        removed = removed,
                        "bounce_recipient_removed"
                    );
                    report.addresses_removed += 1;
                    report.subscriptions_removed += removed;
                }
                Err(Error::InvalidEmail(reason)) => {
                    warn!(event = index, email = %address, reason = %reason, "bounce_recipient_invalid");
                }
                Err(e) => {
                    warn!(event = index, email = %address, error = %e, "bounce_recipient_remove_failed");
                    report
                        .failures
                        .push(format!("event {} {}: {}", index, address, e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::MockMailTransport;
    use crate::model::{Subscription, VerificationState};
    use crate::store::{MemoryStore, SubscriptionStore};
    use crate::subscription::SubscriptionSettings;
    use crate::util::ManualClock;
    use chrono::{TimeZone, Utc};

    fn fixture() -> (MemoryStore, BounceHandler) {
        let store = MemoryStore::new();
        let service = SubscriptionService::new(
            Arc::new(store.clone()),
            Arc::new(MockMailTransport::new()),
            Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap(),
            )),
            SubscriptionSettings::default(),
        );
        (store, BounceHandler::new(Arc::new(service)))
    }

    fn verified(list: &str, email: &str) -> Subscription {
        Subscription {
            list: list.to_string(),
            email: email.to_string(),
            verification_token: format!("tok-{}-{}", list, email),
            verification: VerificationState::Verified,
            last_sent_verification: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    fn bounce(email: &str, bounce_type: &str) -> String {
        serde_json::json!({
            "notificationType": "Bounce",
            "mail": { "messageId": "m", "destination": [email] },
            "bounce": { "bounceType": bounce_type, "bounceSubType": "General" },
        })
        .to_string()
    }

    fn complaint(email: &str, feedback_type: &str) -> String {
        serde_json::json!({
            "notificationType": "Complaint",
            "mail": { "destination": [email] },
            "complaint": { "complaintFeedbackType": feedback_type },
        })
        .to_string()
    }

    async fn exists(store: &MemoryStore, list: &str, email: &str) -> bool {
        SubscriptionStore::get(store, list, email).await.unwrap().is_some()
    }

    #[tokio::test]
    async fn test_hard_bounce_cascades_across_lists() {
        let (store, handler) = fixture();
        store.insert_subscription(verified("a", "x@example.com"));
        store.insert_subscription(verified("b", "x@example.com"));
        store.insert_subscription(verified("a", "y@example.com"));

        let report = handler
            .handle_batch(&[bounce("x@example.com", "Permanent")])
            .await
            .unwrap();

        assert_eq!(report.subscriptions_removed, 2);
        assert!(!exists(&store, "a", "x@example.com").await);
        assert!(!exists(&store, "b", "x@example.com").await);
        assert!(exists(&store, "a", "y@example.com").await);
    }

    #[tokio::test]
    async fn test_malformed_event_does_not_stop_batch() {
        let (store, handler) = fixture();
        for email in ["1@example.com", "2@example.com", "4@example.com", "5@example.com"] {
            store.insert_subscription(verified("a", email));
        }

        let batch = vec![
            bounce("1@example.com", "Permanent"),
            complaint("2@example.com", "abuse"),
            "{\"notificationType\": \"Bounce\", \"mail\": ".to_string(),
            bounce("4@example.com", "Permanent"),
            complaint("5@example.com", "fraud"),
        ];

        let err = handler.handle_batch(&batch).await.unwrap_err();

        match err {
            Error::Aggregate { failed, total, failures, .. } => {
                assert_eq!(failed, 1);
                assert_eq!(total, 5);
                assert!(failures[0].starts_with("event 2"));
            }
            other => panic!("expected aggregate error, got {:?}", other),
        }
        assert!(store.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_soft_feedback_is_ignored() {
        let (store, handler) = fixture();
        store.insert_subscription(verified("a", "x@example.com"));

        let delivery = serde_json::json!({
            "notificationType": "Delivery",
            "mail": { "destination": ["x@example.com"] },
        })
        .to_string();
        let report = handler
            .handle_batch(&[
                bounce("x@example.com", "Transient"),
                complaint("x@example.com", "not-spam"),
                delivery,
            ])
            .await
            .unwrap();

        assert_eq!(report.ignored, 3);
        assert_eq!(report.subscriptions_removed, 0);
        assert!(exists(&store, "a", "x@example.com").await);
    }

    #[tokio::test]
    async fn test_failed_removal_is_reported_after_rest_applied() {
        let (store, handler) = fixture();
        store.insert_subscription(verified("a", "x@example.com"));
        store.insert_subscription(verified("b", "x@example.com"));
        store.insert_subscription(verified("a", "z@example.com"));
        store.fail_delete("b", "x@example.com");

        let err = handler
            .handle_batch(&[
                bounce("x@example.com", "Permanent"),
                bounce("z@example.com", "Permanent"),
            ])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Aggregate { failed: 1, total: 2, .. }));
        assert!(!exists(&store, "a", "x@example.com").await);
        assert!(exists(&store, "b", "x@example.com").await);
        assert!(!exists(&store, "a", "z@example.com").await);
    }

    #[tokio::test]
    async fn test_unknown_address_is_not_a_failure() {
        let (_store, handler) = fixture();
        let report = handler
            .handle_batch(&[bounce("nobody@example.com", "Permanent")])
            .await
            .unwrap();
        assert_eq!(report.addresses_removed, 1);
        assert_eq!(report.subscriptions_removed, 0);
    }
}
