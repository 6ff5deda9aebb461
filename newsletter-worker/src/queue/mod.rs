//! Durable delivery queue.
//!
//! ## Architecture
//!
//! ```text
//! Poller → fan-out → newsletter_deliveries queue → Delivery Worker → Mail transport
//! ```
//!
//! Enqueue carries a deduplication key so repeated fan-out of the same item
//! collapses into one task per subscriber. Consumption hands the worker a
//! [`Lease`]; the task leaves the queue only when the lease is completed.

pub mod memory;
pub mod publisher;
pub mod types;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::{MemoryLease, MemoryQueue};
pub use publisher::Publisher;
pub use types::{
    delivery_headers, delivery_queue_arguments, DedupKey, DeliveryTask, DEDUP_HEADER,
    DELIVERY_QUEUE, GROUP_HEADER,
};

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The task was accepted by the queue
    Enqueued,
    /// A task with the same dedup key was already accepted; nothing was added
    Duplicate,
}

/// Producer side of the delivery queue.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: &DeliveryTask) -> Result<EnqueueOutcome>;
}

/// Handle on one consumed task.
///
/// `complete` removes the task permanently. `abandon` releases it back to the
/// queue (`requeue = true`) or to the dead-letter path (`requeue = false`).
#[async_trait]
pub trait Lease: Send + Sync {
    async fn complete(&self) -> Result<()>;

    async fn abandon(&self, requeue: bool) -> Result<()>;
}
