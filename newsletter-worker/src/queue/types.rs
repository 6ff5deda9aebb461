//! Delivery task message format.
//!
//! One task per (list, item, subscriber). Tasks reference the rendered item
//! by content hash so the queue never carries the email body.

use std::fmt;

use lapin::types::{AMQPValue, FieldTable};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Queue name for delivery tasks.
pub const DELIVERY_QUEUE: &str = "newsletter_deliveries";

/// Header read by the RabbitMQ message-deduplication plugin.
pub const DEDUP_HEADER: &str = "x-deduplication-header";

/// Header carrying the task's grouping key (list + item).
pub const GROUP_HEADER: &str = "x-group-key";

/// A single pending email send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub list_name: String,
    pub subscriber_email: String,
    pub subject: String,
    /// Key of the composed item document in the blob store
    pub content_hash: String,
    pub item_guid: String,
}

impl DeliveryTask {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            group: format!("{}:{}", self.list_name, self.item_guid),
            member: self.subscriber_email.clone(),
        }
    }
}

/// Deduplication key: a member (the subscriber) scoped within a group
/// (the list and item).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub group: String,
    pub member: String,
}

impl DedupKey {
    /// Hex SHA-256 of group and member, used as the broker dedup header.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.group.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.member.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.member)
    }
}

/// Arguments the delivery queue is declared with. Publisher and consumer must
/// declare it identically or the broker rejects the second declaration.
pub fn delivery_queue_arguments() -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-message-deduplication".into(), AMQPValue::Boolean(true));
    args
}

/// Message headers for a task: the dedup digest and the group key.
pub fn delivery_headers(key: &DedupKey) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(DEDUP_HEADER.into(), AMQPValue::LongString(key.digest().into()));
    headers.insert(GROUP_HEADER.into(), AMQPValue::LongString(key.group.clone().into()));
    headers
}
