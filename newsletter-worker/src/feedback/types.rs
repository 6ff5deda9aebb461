//! Delivery feedback payloads.
//!
//! Events arrive as SES-style notifications, either bare or wrapped in an SNS
//! envelope whose `Message` field holds the notification as a JSON string.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub const BOUNCE_TYPE_PERMANENT: &str = "Permanent";
pub const COMPLAINT_NOT_SPAM: &str = "not-spam";

/// A delivery notification.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    /// `Bounce`, `Complaint`, `Delivery` or `Received`
    #[serde(default)]
    pub notification_type: String,
    #[serde(default)]
    pub mail: Mail,
    pub bounce: Option<Bounce>,
    pub complaint: Option<Complaint>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mail {
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub destination: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounce {
    #[serde(default)]
    pub bounce_type: String,
    #[serde(default)]
    pub bounce_sub_type: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complaint {
    /// Absent when the mailbox provider did not say; treated as abuse
    #[serde(default)]
    pub complaint_feedback_type: Option<String>,
}

/// SNS delivery envelope.
#[derive(Debug, Clone, Deserialize)]
struct Envelope {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(rename = "Message", default)]
    message: String,
}

/// What a decoded event turned out to be.
#[derive(Debug, Clone)]
pub enum FeedbackEvent {
    Notification(Notification),
    /// SNS subscription handshakes and other envelope types
    Control(String),
}

/// Decode one raw event.
pub fn decode_event(raw: &str) -> Result<FeedbackEvent> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| Error::MalformedPayload(format!("invalid JSON: {}", e)))?;

    if value.get("Type").is_some() {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| Error::MalformedPayload(format!("invalid envelope: {}", e)))?;
        if envelope.kind != "Notification" {
            return Ok(FeedbackEvent::Control(envelope.kind));
        }
        let notification = serde_json::from_str(&envelope.message)
            .map_err(|e| Error::MalformedPayload(format!("invalid envelope message: {}", e)))?;
        return Ok(FeedbackEvent::Notification(notification));
    }

    let notification = serde_json::from_value(value)
        .map_err(|e| Error::MalformedPayload(format!("invalid notification: {}", e)))?;
    Ok(FeedbackEvent::Notification(notification))
}

/// Classification of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    PermanentBounce,
    Complaint,
    /// Transient bounces, not-spam complaints, deliveries and receipts
    Ignored,
}

impl Classification {
    /// Whether every destination of the event must be removed from all lists.
    pub fn removes_recipients(self) -> bool {
        matches!(self, Classification::PermanentBounce | Classification::Complaint)
    }
}

pub fn classify(notification: &Notification) -> Classification {
    if let Some(bounce) = &notification.bounce {
        if bounce.bounce_type == BOUNCE_TYPE_PERMANENT {
            return Classification::PermanentBounce;
        }
    }
    if let Some(complaint) = &notification.complaint {
        if complaint.complaint_feedback_type.as_deref() != Some(COMPLAINT_NOT_SPAM) {
            return Classification::Complaint;
        }
    }
    Classification::Ignored
}
