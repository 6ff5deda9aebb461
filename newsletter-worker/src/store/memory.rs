//! In-process implementation of every storage trait.
//!
//! Used by the test suites and for running the pipeline locally without a
//! database. Individual writes can be made to fail so partial-failure
//! handling can be exercised.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{BlobStore, ListRegistry, SubscriptionStore};
use crate::error::{Error, Result};
use crate::model::{List, ProcessedGuid, Subscription, VerificationState};

/// In-memory subscriptions, lists and blobs behind a single lock.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    subscriptions: BTreeMap<(String, String), Subscription>,
    lists: BTreeMap<String, List>,
    blobs: HashMap<String, String>,
    failing_deletes: HashSet<(String, String)>,
    failing_marks: HashSet<String>,
    hidden_once: HashSet<(String, String)>,
    fail_blob_puts: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a list. Domain uniqueness is not enforced here.
    pub fn insert_list(&self, list: List) {
        self.inner.lock().lists.insert(list.name.clone(), list);
    }

    /// Insert a subscription row directly, bypassing the state machine.
    pub fn insert_subscription(&self, subscription: Subscription) {
        self.inner.lock().subscriptions.insert(
            (subscription.list.clone(), subscription.email.clone()),
            subscription,
        );
    }

    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.inner.lock().subscriptions.values().cloned().collect()
    }

    pub fn blob_count(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    /// Make every delete of `(list, email)` fail with a transport error.
    pub fn fail_delete(&self, list: &str, email: &str) {
        self.inner
            .lock()
            .failing_deletes
            .insert((list.to_string(), email.to_string()));
    }

    /// Make marking `guid` as processed fail with a transport error.
    pub fn fail_mark_processed(&self, guid: &str) {
        self.inner.lock().failing_marks.insert(guid.to_string());
    }

    /// Make the next `get` of `(list, email)` miss, as if the row was written
    /// by another request right after the read.
    pub fn hide_from_next_get(&self, list: &str, email: &str) {
        self.inner
            .lock()
            .hidden_once
            .insert((list.to_string(), email.to_string()));
    }

    pub fn fail_blob_puts(&self, fail: bool) {
        self.inner.lock().fail_blob_puts = fail;
    }

    fn with_feed<T>(
        &self,
        list: &str,
        feed_url: &str,
        f: impl FnOnce(&mut crate::model::Feed) -> T,
    ) -> Result<T> {
        let mut inner = self.inner.lock();
        let list_entry = inner
            .lists
            .get_mut(list)
            .ok_or_else(|| Error::list_not_found(list))?;
        let feed = list_entry
            .feeds
            .iter_mut()
            .find(|f| f.url == feed_url)
            .ok_or_else(|| Error::NotFound {
                entity: "Feed",
                key: format!("{}/{}", list, feed_url),
            })?;
        Ok(f(feed))
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn get(&self, list: &str, email: &str) -> Result<Option<Subscription>> {
        let mut inner = self.inner.lock();
        let key = (list.to_string(), email.to_string());
        if inner.hidden_once.remove(&key) {
            return Ok(None);
        }
        Ok(inner.subscriptions.get(&key).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.verification_token == token)
            .cloned()
            .collect())
    }

    async fn verified_for_list(&self, list: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.list == list && s.is_verified())
            .cloned()
            .collect())
    }

    async fn find_by_email(&self, email: &str) -> Result<Vec<Subscription>> {
        Ok(self
            .inner
            .lock()
            .subscriptions
            .values()
            .filter(|s| s.email == email)
            .cloned()
            .collect())
    }

    async fn put(&self, subscription: &Subscription) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (subscription.list.clone(), subscription.email.clone());
        let mut row = subscription.clone();
        if inner
            .subscriptions
            .get(&key)
            .map(|existing| existing.is_verified())
            .unwrap_or(false)
        {
            row.verification = VerificationState::Verified;
        }
        inner.subscriptions.insert(key, row);
        Ok(())
    }

    async fn insert(&self, subscription: &Subscription) -> Result<bool> {
        let mut inner = self.inner.lock();
        let key = (subscription.list.clone(), subscription.email.clone());
        match inner.subscriptions.entry(key) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(subscription.clone());
                Ok(true)
            }
        }
    }

    async fn delete(&self, list: &str, email: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let key = (list.to_string(), email.to_string());
        if inner.failing_deletes.contains(&key) {
            return Err(Error::Transport(anyhow!(
                "injected delete failure for {}/{}",
                list,
                email
            )));
        }
        inner
            .subscriptions
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| Error::subscription_not_found(list, email))
    }

    async fn mark_verified(&self, list: &str, email: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let sub = inner
            .subscriptions
            .get_mut(&(list.to_string(), email.to_string()))
            .ok_or_else(|| Error::subscription_not_found(list, email))?;
        sub.verification = VerificationState::Verified;
        Ok(())
    }

    async fn record_verification_sent(
        &self,
        list: &str,
        email: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let sub = inner
            .subscriptions
            .get_mut(&(list.to_string(), email.to_string()))
            .ok_or_else(|| Error::subscription_not_found(list, email))?;
        sub.last_sent_verification = at;
        Ok(())
    }
}

#[async_trait]
impl ListRegistry for MemoryStore {
    async fn get(&self, name: &str) -> Result<Option<List>> {
        Ok(self.inner.lock().lists.get(name).cloned())
    }

    async fn find_by_domain(&self, domain: &str) -> Result<Vec<List>> {
        Ok(self
            .inner
            .lock()
            .lists
            .values()
            .filter(|l| l.domain == domain)
            .cloned()
            .collect())
    }

    async fn all(&self) -> Result<Vec<List>> {
        Ok(self.inner.lock().lists.values().cloned().collect())
    }

    async fn set_watermark(&self, list: &str, feed_url: &str, at: DateTime<Utc>) -> Result<()> {
        self.with_feed(list, feed_url, |feed| feed.last_updated = Some(at))
    }

    async fn mark_processed(
        &self,
        list: &str,
        feed_url: &str,
        guid: &str,
        published_at: DateTime<Utc>,
    ) -> Result<()> {
        if self.inner.lock().failing_marks.contains(guid) {
            return Err(Error::Transport(anyhow!(
                "injected mark_processed failure for {}",
                guid
            )));
        }
        self.with_feed(list, feed_url, |feed| {
            if !feed.is_processed(guid) {
                feed.processed_guids.push(ProcessedGuid {
                    guid: guid.to_string(),
                    published_at,
                });
            }
        })
    }

    async fn prune_processed(
        &self,
        list: &str,
        feed_url: &str,
        before: DateTime<Utc>,
    ) -> Result<usize> {
        self.with_feed(list, feed_url, |feed| {
            let len = feed.processed_guids.len();
            feed.processed_guids.retain(|p| p.published_at >= before);
            len - feed.processed_guids.len()
        })
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put(&self, key: &str, body: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.fail_blob_puts {
            return Err(Error::Transport(anyhow!("injected blob put failure")));
        }
        inner
            .blobs
            .entry(key.to_string())
            .or_insert_with(|| body.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.inner.lock().blobs.get(key).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Feed;
    use chrono::{Duration, TimeZone};

    fn sub(list: &str, email: &str, verification: VerificationState) -> Subscription {
        Subscription {
            list: list.to_string(),
            email: email.to_string(),
            verification_token: format!("tok-{}-{}", list, email),
            verification,
            last_sent_verification: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = SubscriptionStore::delete(&store, "news", "a@example.com")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_put_never_clears_verified() {
        let store = MemoryStore::new();
        store.insert_subscription(sub("news", "a@example.com", VerificationState::Verified));

        SubscriptionStore::put(
            &store,
            &sub("news", "a@example.com", VerificationState::Unverified),
        )
        .await
        .unwrap();

        let row = SubscriptionStore::get(&store, "news", "a@example.com")
            .await
            .unwrap()
            .unwrap();
        assert!(row.is_verified());
    }

    #[tokio::test]
    async fn test_insert_keeps_existing_row() {
        let store = MemoryStore::new();
        let first = sub("news", "a@example.com", VerificationState::Unverified);
        let mut second = first.clone();
        second.verification_token = "other".to_string();

        assert!(SubscriptionStore::insert(&store, &first).await.unwrap());
        assert!(!SubscriptionStore::insert(&store, &second).await.unwrap());

        let row = SubscriptionStore::get(&store, "news", "a@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.verification_token, first.verification_token);
    }

    #[tokio::test]
    async fn test_verified_for_list_filters() {
        let store = MemoryStore::new();
        store.insert_subscription(sub("news", "a@example.com", VerificationState::Verified));
        store.insert_subscription(sub("news", "b@example.com", VerificationState::Unverified));
        store.insert_subscription(sub("other", "c@example.com", VerificationState::Verified));

        let verified = store.verified_for_list("news").await.unwrap();
        assert_eq!(verified.len(), 1);
        assert_eq!(verified[0].email, "a@example.com");
    }

    #[tokio::test]
    async fn test_prune_processed() {
        let now = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        let store = MemoryStore::new();
        store.insert_list(List {
            name: "news".to_string(),
            description: String::new(),
            domain: "news.example.com".to_string(),
            from_address: "news@example.com".to_string(),
            reply_to_address: "news@example.com".to_string(),
            feeds: vec![Feed::new("https://example.com/feed.xml")],
        });

        let url = "https://example.com/feed.xml";
        store
            .mark_processed("news", url, "old", now - Duration::hours(30))
            .await
            .unwrap();
        store
            .mark_processed("news", url, "new", now - Duration::hours(2))
            .await
            .unwrap();

        let removed = store
            .prune_processed("news", url, now - Duration::hours(24))
            .await
            .unwrap();
        assert_eq!(removed, 1);

        let list = ListRegistry::get(&store, "news").await.unwrap().unwrap();
        let feed = list.feed(url).unwrap();
        assert!(feed.is_processed("new"));
        assert!(!feed.is_processed("old"));
    }

    #[tokio::test]
    async fn test_blob_put_is_idempotent() {
        let store = MemoryStore::new();
        BlobStore::put(&store, "k", "first").await.unwrap();
        BlobStore::put(&store, "k", "second").await.unwrap();
        assert_eq!(BlobStore::get(&store, "k").await.unwrap().as_deref(), Some("first"));
        assert_eq!(store.blob_count(), 1);
    }
}
