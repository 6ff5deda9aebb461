//! Feed fetching.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use tracing::{debug, error};

use super::parser::parse_feed;
use crate::error::{Error, Result};
use crate::model::ParsedFeed;

/// Fetch and parse a feed by URL.
#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ParsedFeed>;
}

/// Fetches feeds over HTTP(S).
pub struct HttpFeedSource {
    client: Client,
    timeout: Duration,
}

impl HttpFeedSource {
    pub fn new(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch(&self, url: &str) -> Result<ParsedFeed> {
        let response = self
            .client
            .get(url)
            .header(
                "Accept",
                "application/rss+xml, application/atom+xml, application/xml;q=0.9, */*;q=0.8",
            )
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!(
                    url = url,
                    is_timeout = e.is_timeout(),
                    error = %e,
                    "feed_fetch_error"
                );
                anyhow::Error::new(e).context(format!("Failed to fetch feed {}", url))
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(anyhow!(
                "Feed {} returned status {}",
                url,
                status
            )));
        }

        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read feed body from {}", url))?;

        debug!(
            url = url,
            status_code = status.as_u16(),
            body_length = body.len(),
            "feed_fetched"
        );

        parse_feed(&body)
    }
}

/// Serves canned feeds and errors keyed by URL.
#[derive(Clone, Default)]
pub struct StaticFeedSource {
    feeds: Arc<Mutex<HashMap<String, std::result::Result<String, String>>>>,
}

impl StaticFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `xml` for `url`; it is parsed on every fetch.
    pub fn insert(&self, url: &str, xml: impl Into<String>) {
        self.feeds.lock().insert(url.to_string(), Ok(xml.into()));
    }

    /// Fail every fetch of `url` with a transport error.
    pub fn fail(&self, url: &str, message: impl Into<String>) {
        self.feeds
            .lock()
            .insert(url.to_string(), Err(message.into()));
    }
}

#[async_trait]
impl FeedSource for StaticFeedSource {
    async fn fetch(&self, url: &str) -> Result<ParsedFeed> {
        let entry = self.feeds.lock().get(url).cloned();
        match entry {
            Some(Ok(xml)) => parse_feed(&xml),
            Some(Err(message)) => Err(Error::Transport(anyhow!("{}", message))),
            None => Err(Error::NotFound {
                entity: "Feed",
                key: url.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_source_serves_and_fails() {
        let source = StaticFeedSource::new();
        source.insert(
            "https://a.example.com/feed",
            "<rss><channel><title>A</title></channel></rss>",
        );
        source.fail("https://b.example.com/feed", "connection refused");

        let feed = source.fetch("https://a.example.com/feed").await.unwrap();
        assert_eq!(feed.title, "A");

        let err = source.fetch("https://b.example.com/feed").await.unwrap_err();
        assert!(err.is_retryable());

        let err = source.fetch("https://c.example.com/feed").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
