//! Storage traits for subscriptions, lists and content blobs.
//!
//! The pipeline only talks to storage through these traits. All writes are
//! single-row: a subscription is addressed by `(list, email)`, a feed by
//! `(list name, feed url)` and a blob by its content hash.
//!
//! Two implementations ship with the crate:
//! - [`PostgresStore`]: durable storage used by the binaries
//! - [`MemoryStore`]: in-process storage for tests and local runs

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::error;

use crate::error::{Error, Result};
use crate::model::{List, Subscription};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Durable keyed storage for subscriber records.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Point lookup by primary key.
    async fn get(&self, list: &str, email: &str) -> Result<Option<Subscription>>;

    /// All subscriptions holding this verification token (expected: 0 or 1).
    async fn find_by_token(&self, token: &str) -> Result<Vec<Subscription>>;

    /// Verified subscriptions of a list.
    async fn verified_for_list(&self, list: &str) -> Result<Vec<Subscription>>;

    /// Every subscription of an address, across all lists.
    async fn find_by_email(&self, email: &str) -> Result<Vec<Subscription>>;

    /// Insert or replace. Never clears an existing verified state.
    async fn put(&self, subscription: &Subscription) -> Result<()>;

    /// Insert unless a row with the same key exists. Returns `false` and
    /// leaves the stored row untouched when it does.
    async fn insert(&self, subscription: &Subscription) -> Result<bool>;

    /// Delete by primary key; `Error::NotFound` if the row does not exist.
    async fn delete(&self, list: &str, email: &str) -> Result<()>;

    async fn mark_verified(&self, list: &str, email: &str) -> Result<()>;

    async fn record_verification_sent(
        &self,
        list: &str,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Durable storage of lists and their feed bookkeeping.
#[async_trait]
pub trait ListRegistry: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<List>>;

    /// All lists served on a domain (expected: 0 or 1).
    async fn find_by_domain(&self, domain: &str) -> Result<Vec<List>>;

    async fn all(&self) -> Result<Vec<List>>;

    async fn set_watermark(&self, list: &str, feed_url: &str, at: DateTime<Utc>) -> Result<()>;

    /// Append a guid to the feed's processed set.
    async fn mark_processed(
        &self,
        list: &str,
        feed_url: &str,
        guid: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Drop processed guids published before `before`. Returns how many were removed.
    async fn prune_processed(
        &self,
        list: &str,
        feed_url: &str,
        before: DateTime<Utc>,
    ) -> Result<usize>;
}

/// Content-addressed blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store a body under its key. Storing the same key twice is a no-op.
    async fn put(&self, key: &str, body: &str) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;
}

/// Resolve the single list served on `domain`.
///
/// More than one match means the unique domain constraint was violated and
/// is reported as `AmbiguousMatch` after an error-level log.
pub async fn resolve_list_by_domain(registry: &dyn ListRegistry, domain: &str) -> Result<List> {
    let mut lists = registry.find_by_domain(domain).await?;
    match lists.len() {
        0 => Err(Error::list_not_found(domain)),
        1 => Ok(lists.remove(0)),
        count => {
            error!(
                index = "domain",
                domain = %domain,
                count = count,
                "list_domain_ambiguous"
            );
            Err(Error::AmbiguousMatch {
                index: "domain",
                key: domain.to_string(),
                count,
            })
        }
    }
}
