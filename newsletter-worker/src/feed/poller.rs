//! One poll cycle over every feed of every list.
//!
//! Per feed:
//! 1. fetch and parse (failure is recorded, other feeds continue)
//! 2. skip if the feed's `updated` equals the stored watermark
//! 3. pick candidates: unseen guid, has a publish time, published inside the window
//! 4. per candidate: store the composed document, snapshot verified
//!    subscribers, mark the guid processed, enqueue one task per subscriber
//! 5. advance the watermark if no candidate failed before its mark
//! 6. prune processed guids that fell out of the window
//!
//! The guid is marked before any task is enqueued. A crash between the two
//! loses the item instead of mailing it twice.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use super::source::FeedSource;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fanout::fan_out;
use crate::model::{Feed, FeedItem, List};
use crate::queue::{EnqueueOutcome, TaskQueue};
use crate::render::templates::compose_item_document;
use crate::store::{BlobStore, ListRegistry, SubscriptionStore};
use crate::util::Clock;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollerSettings {
    /// How far back an item's publish time may be to still be fanned out
    pub window: Duration,
    /// Feeds fetched and processed at the same time
    pub concurrency: usize,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            window: Duration::hours(24),
            concurrency: 4,
        }
    }
}

impl PollerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            window: Duration::hours(config.item_window_hours),
            concurrency: config.poll_concurrency.max(1),
        }
    }
}

/// Counters for a completed poll cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub feeds_polled: usize,
    pub feeds_unchanged: usize,
    pub feeds_failed: usize,
    pub items_fanned_out: usize,
    pub tasks_enqueued: usize,
    pub tasks_duplicate: usize,
    pub failures: Vec<String>,
}

impl PollReport {
    fn merge(&mut self, feed: FeedReport) {
        self.feeds_polled += 1;
        if feed.unchanged {
            self.feeds_unchanged += 1;
        }
        if !feed.failures.is_empty() {
            self.feeds_failed += 1;
        }
        self.items_fanned_out += feed.items_fanned_out;
        self.tasks_enqueued += feed.tasks_enqueued;
        self.tasks_duplicate += feed.tasks_duplicate;
        self.failures.extend(feed.failures);
    }
}

#[derive(Debug, Default)]
struct FeedReport {
    unchanged: bool,
    items_fanned_out: usize,
    tasks_enqueued: usize,
    tasks_duplicate: usize,
    failures: Vec<String>,
}

/// Hex SHA-256 of a composed document, used as its blob key.
pub fn content_hash(document: &str) -> String {
    hex::encode(Sha256::digest(document.as_bytes()))
}

/// Whether `item` should be fanned out from `feed` given the window start.
pub fn is_candidate(feed: &Feed, item: &FeedItem, window_start: DateTime<Utc>) -> bool {
    if feed.is_processed(&item.guid) {
        return false;
    }
    match item.published_at {
        Some(published) => published > window_start,
        None => false,
    }
}

pub struct FeedPoller {
    lists: Arc<dyn ListRegistry>,
    subscriptions: Arc<dyn SubscriptionStore>,
    blobs: Arc<dyn BlobStore>,
    queue: Arc<dyn TaskQueue>,
    source: Arc<dyn FeedSource>,
    clock: Arc<dyn Clock>,
    settings: PollerSettings,
}

impl FeedPoller {
    pub fn new(
        lists: Arc<dyn ListRegistry>,
        subscriptions: Arc<dyn SubscriptionStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn TaskQueue>,
        source: Arc<dyn FeedSource>,
        clock: Arc<dyn Clock>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            lists,
            subscriptions,
            blobs,
            queue,
            source,
            clock,
            settings,
        }
    }

    /// Poll every feed once.
    ///
    /// Failures are isolated per feed, item and subscriber. If any occurred
    /// the cycle still completes for everything else and an aggregate error
    /// is returned.
    pub async fn run(&self) -> Result<PollReport> {
        let now = self.clock.now();
        let lists = self.lists.all().await?;
        let jobs: Vec<(&List, &Feed)> = lists
            .iter()
            .flat_map(|list| list.feeds.iter().map(move |feed| (list, feed)))
            .collect();

        info!(
            lists = lists.len(),
            feeds = jobs.len(),
            concurrency = self.settings.concurrency,
            "feed_poll_start"
        );

        let feed_reports: Vec<FeedReport> = stream::iter(
            jobs.iter()
                .map(|(list, feed)| self.poll_feed(list, feed, now)),
        )
        .buffer_unordered(self.settings.concurrency.max(1))
        .collect()
        .await;

        let mut report = PollReport::default();
        for feed_report in feed_reports {
            report.merge(feed_report);
        }

        if report.failures.is_empty() {
            info!(
                feeds_polled = report.feeds_polled,
                feeds_unchanged = report.feeds_unchanged,
                items_fanned_out = report.items_fanned_out,
                tasks_enqueued = report.tasks_enqueued,
                tasks_duplicate = report.tasks_duplicate,
                "feed_poll_complete"
            );
            return Ok(report);
        }

        error!(
            feeds_polled = report.feeds_polled,
            feeds_failed = report.feeds_failed,
            items_fanned_out = report.items_fanned_out,
            tasks_enqueued = report.tasks_enqueued,
            failures = report.failures.len(),
            "feed_poll_completed_with_failures"
        );
        Err(Error::Aggregate {
            operation: "feed_poll",
            failed: report.feeds_failed,
            total: report.feeds_polled,
            failures: report.failures,
        })
    }

    async fn poll_feed(&self, list: &List, feed: &Feed, now: DateTime<Utc>) -> FeedReport {
        let mut report = FeedReport::default();

        let parsed = match self.source.fetch(&feed.url).await {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(list = %list.name, feed = %feed.url, error = %e, "feed_fetch_failed");
                report.failures.push(format!("{}: {}", feed.url, e));
                return report;
            }
        };

        if parsed.updated.is_some() && parsed.updated == feed.last_updated {
            debug!(list = %list.name, feed = %feed.url, "feed_unchanged");
            report.unchanged = true;
            return report;
        }

        let window_start = now - self.settings.window;
        let mut seen = HashSet::new();
        let mut pre_mark_failure = false;

        for item in parsed
            .items
            .iter()
            .filter(|item| is_candidate(feed, item, window_start))
        {
            if !seen.insert(item.guid.as_str()) {
                continue;
            }

            match self.process_item(list, feed, item).await {
                Ok(item_report) => {
                    report.items_fanned_out += 1;
                    report.tasks_enqueued += item_report.tasks_enqueued;
                    report.tasks_duplicate += item_report.tasks_duplicate;
                    report.failures.extend(item_report.failures);
                }
                Err(e) => {
                    pre_mark_failure = true;
                    warn!(
                        list = %list.name,
                        feed = %feed.url,
                        guid = %item.guid,
                        error = %e,
                        "feed_item_failed"
                    );
                    report
                        .failures
                        .push(format!("{} item {}: {}", feed.url, item.guid, e));
                }
            }
        }

        if !pre_mark_failure {
            if let Some(updated) = parsed.updated {
                if let Err(e) = self.lists.set_watermark(&list.name, &feed.url, updated).await {
                    warn!(list = %list.name, feed = %feed.url, error = %e, "feed_watermark_failed");
                    report.failures.push(format!("{} watermark: {}", feed.url, e));
                }
            }
        }

        match self
            .lists
            .prune_processed(&list.name, &feed.url, window_start)
            .await
        {
            Ok(0) => {}
            Ok(pruned) => {
                debug!(list = %list.name, feed = %feed.url, pruned = pruned, "feed_processed_pruned")
            }
            Err(e) => {
                warn!(list = %list.name, feed = %feed.url, error = %e, "feed_prune_failed")
            }
        }

        info!(
            list = %list.name,
            feed = %feed.url,
            items = parsed.items.len(),
            fanned_out = report.items_fanned_out,
            failures = report.failures.len(),
            "feed_polled"
        );
        report
    }

    /// Errors returned from here happened before the guid was marked, so the
    /// item stays a candidate for the next cycle. Enqueue failures happen
    /// after the mark and are only reported.
    async fn process_item(&self, list: &List, feed: &Feed, item: &FeedItem) -> Result<ItemReport> {
        let document = compose_item_document(item);
        let hash = content_hash(&document);
        self.blobs.put(&hash, &document).await?;

        let subscribers = self.subscriptions.verified_for_list(&list.name).await?;

        let published_at = item.published_at.unwrap_or_else(|| self.clock.now());
        self.lists
            .mark_processed(&list.name, &feed.url, &item.guid, published_at)
            .await?;

        let mut report = ItemReport::default();
        for task in fan_out(list, item, &hash, &subscribers) {
            match self.queue.enqueue(&task).await {
                Ok(EnqueueOutcome::Enqueued) => report.tasks_enqueued += 1,
                Ok(EnqueueOutcome::Duplicate) => report.tasks_duplicate += 1,
                Err(e) => {
                    warn!(
                        list = %list.name,
                        guid = %item.guid,
                        email = %task.subscriber_email,
                        error = %e,
                        "delivery_enqueue_failed"
                    );
                    report
                        .failures
                        .push(format!("enqueue {}: {}", task.dedup_key(), e));
                }
            }
        }

        info!(
            list = %list.name,
            feed = %feed.url,
            guid = %item.guid,
            content_hash = %hash,
            subscribers = subscribers.len(),
            enqueued = report.tasks_enqueued,
            "feed_item_fanned_out"
        );
        Ok(report)
    }
}

#[derive(Debug, Default)]
struct ItemReport {
    tasks_enqueued: usize,
    tasks_duplicate: usize,
    failures: Vec<String>,
}
