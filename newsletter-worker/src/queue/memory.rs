//! In-process delivery queue with deduplication and leases.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{DedupKey, DeliveryTask, EnqueueOutcome, Lease, TaskQueue};
use crate::error::{Error, Result};

/// FIFO queue that drops tasks whose dedup key was already accepted.
#[derive(Clone, Default)]
pub struct MemoryQueue {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    accepted: HashSet<DedupKey>,
    pending: VecDeque<(u64, DeliveryTask)>,
    in_flight: HashMap<u64, DeliveryTask>,
    completed: Vec<DeliveryTask>,
    dead_letters: Vec<DeliveryTask>,
    failing_members: HashSet<String>,
    next_id: u64,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the next pending task. It stays in flight until its lease is
    /// completed or abandoned.
    pub fn receive(&self) -> Option<(DeliveryTask, MemoryLease)> {
        let mut inner = self.inner.lock();
        let (id, task) = inner.pending.pop_front()?;
        inner.in_flight.insert(id, task.clone());
        Some((
            task,
            MemoryLease {
                queue: self.clone(),
                id,
            },
        ))
    }

    pub fn pending(&self) -> Vec<DeliveryTask> {
        self.inner.lock().pending.iter().map(|(_, t)| t.clone()).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    pub fn completed(&self) -> Vec<DeliveryTask> {
        self.inner.lock().completed.clone()
    }

    pub fn dead_letters(&self) -> Vec<DeliveryTask> {
        self.inner.lock().dead_letters.clone()
    }

    /// Make enqueue fail for tasks addressed to `email`.
    pub fn fail_enqueue_for(&self, email: &str) {
        self.inner.lock().failing_members.insert(email.to_string());
    }

    fn settle(&self, id: u64, requeue: Option<bool>) -> Result<()> {
        let mut inner = self.inner.lock();
        let task = inner.in_flight.remove(&id).ok_or_else(|| Error::NotFound {
            entity: "Lease",
            key: id.to_string(),
        })?;
        match requeue {
            None => inner.completed.push(task),
            Some(true) => inner.pending.push_back((id, task)),
            Some(false) => inner.dead_letters.push(task),
        }
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, task: &DeliveryTask) -> Result<EnqueueOutcome> {
        let mut inner = self.inner.lock();
        if inner.failing_members.contains(&task.subscriber_email) {
            return Err(Error::Transport(anyhow!(
                "injected enqueue failure for {}",
                task.subscriber_email
            )));
        }
        if !inner.accepted.insert(task.dedup_key()) {
            return Ok(EnqueueOutcome::Duplicate);
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.pending.push_back((id, task.clone()));
        Ok(EnqueueOutcome::Enqueued)
    }
}

/// Lease on a task taken from a [`MemoryQueue`].
pub struct MemoryLease {
    queue: MemoryQueue,
    id: u64,
}

#[async_trait]
impl Lease for MemoryLease {
    async fn complete(&self) -> Result<()> {
        self.queue.settle(self.id, None)
    }

    async fn abandon(&self, requeue: bool) -> Result<()> {
        self.queue.settle(self.id, Some(requeue))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(email: &str, guid: &str) -> DeliveryTask {
        DeliveryTask {
            list_name: "news".to_string(),
            subscriber_email: email.to_string(),
            subject: "Issue".to_string(),
            content_hash: "abc".to_string(),
            item_guid: guid.to_string(),
        }
    }

    #[tokio::test]
    async fn test_duplicate_enqueue_collapses() {
        let queue = MemoryQueue::new();

        assert_eq!(
            queue.enqueue(&task("a@example.com", "g1")).await.unwrap(),
            EnqueueOutcome::Enqueued
        );
        assert_eq!(
            queue.enqueue(&task("a@example.com", "g1")).await.unwrap(),
            EnqueueOutcome::Duplicate
        );
        queue.enqueue(&task("b@example.com", "g1")).await.unwrap();
        queue.enqueue(&task("a@example.com", "g2")).await.unwrap();

        assert_eq!(queue.pending_len(), 3);
    }

    #[tokio::test]
    async fn test_task_stays_in_flight_until_completed() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task("a@example.com", "g1")).await.unwrap();

        let (_, lease) = queue.receive().unwrap();
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(queue.in_flight_len(), 1);

        lease.complete().await.unwrap();
        assert_eq!(queue.in_flight_len(), 0);
        assert_eq!(queue.completed().len(), 1);
        assert!(lease.complete().await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_abandon_requeues_or_dead_letters() {
        let queue = MemoryQueue::new();
        queue.enqueue(&task("a@example.com", "g1")).await.unwrap();
        queue.enqueue(&task("b@example.com", "g1")).await.unwrap();

        let (_, first) = queue.receive().unwrap();
        first.abandon(true).await.unwrap();
        let (_, second) = queue.receive().unwrap();
        second.abandon(false).await.unwrap();

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].subscriber_email, "a@example.com");
        assert_eq!(queue.dead_letters()[0].subscriber_email, "b@example.com");
    }

    #[tokio::test]
    async fn test_injected_enqueue_failure() {
        let queue = MemoryQueue::new();
        queue.fail_enqueue_for("a@example.com");

        assert!(queue.enqueue(&task("a@example.com", "g1")).await.is_err());
        assert_eq!(queue.pending_len(), 0);
    }
}
