//! Domain records shared by the stores, the poller and the delivery worker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::form_urlencoded;

// =============================================================================
// Lists & Feeds
// =============================================================================

/// A mailing list bound to exactly one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct List {
    /// Unique list name
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Unique domain the list is served on
    pub domain: String,
    pub from_address: String,
    pub reply_to_address: String,
    #[serde(default)]
    pub feeds: Vec<Feed>,
}

impl List {
    pub fn base_url(&self) -> String {
        format!("https://{}", self.domain)
    }

    /// `https://{domain}/unsubscribe?email={email}`
    pub fn unsubscribe_link(&self, email: &str) -> String {
        self.link("unsubscribe", "email", email)
    }

    /// `https://{domain}/verify?token={token}`
    pub fn verification_link(&self, token: &str) -> String {
        self.link("verify", "token", token)
    }

    pub fn feed(&self, url: &str) -> Option<&Feed> {
        self.feeds.iter().find(|f| f.url == url)
    }

    fn link(&self, path: &str, key: &str, value: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair(key, value)
            .finish();
        format!("{}/{}?{}", self.base_url(), path, query)
    }
}

/// An RSS/Atom source attached to a list, with its dedup bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub url: String,
    /// The feed's own "updated" timestamp as of the last completed poll
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Items already fanned out for this feed
    #[serde(default)]
    pub processed_guids: Vec<ProcessedGuid>,
}

impl Feed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            last_updated: None,
            processed_guids: Vec::new(),
        }
    }

    pub fn is_processed(&self, guid: &str) -> bool {
        self.processed_guids.iter().any(|p| p.guid == guid)
    }
}

/// A processed item identifier, kept with its publish time so entries older
/// than the fan-out window can be pruned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedGuid {
    pub guid: String,
    pub published_at: DateTime<Utc>,
}

// =============================================================================
// Subscriptions
// =============================================================================

/// Verification state of a subscription. Never moves back to `Unverified`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Unverified,
    Verified,
}

impl VerificationState {
    pub fn is_verified(self) -> bool {
        self == VerificationState::Verified
    }
}

/// A (list, email) membership record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub list: String,
    /// Canonical address form, see [`crate::subscription::normalize_email`]
    pub email: String,
    pub verification_token: String,
    pub verification: VerificationState,
    pub last_sent_verification: DateTime<Utc>,
}

impl Subscription {
    pub fn is_verified(&self) -> bool {
        self.verification.is_verified()
    }
}

// =============================================================================
// Feed items
// =============================================================================

/// A single entry of a fetched feed. Never persisted as-is.
#[derive(Debug, Clone, PartialEq)]
pub struct FeedItem {
    pub guid: String,
    pub title: String,
    pub content: String,
    pub published_at: Option<DateTime<Utc>>,
}

/// A fetched and parsed feed document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ParsedFeed {
    pub title: String,
    /// Feed-level "updated" metadata, used as the watermark
    pub updated: Option<DateTime<Utc>>,
    pub items: Vec<FeedItem>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list() -> List {
        List {
            name: "news".to_string(),
            description: String::new(),
            domain: "news.example.com".to_string(),
            from_address: "news@example.com".to_string(),
            reply_to_address: "editor@example.com".to_string(),
            feeds: vec![Feed::new("https://example.com/feed.xml")],
        }
    }

    #[test]
    fn test_unsubscribe_link() {
        assert_eq!(
            list().unsubscribe_link("a@example.com"),
            "https://news.example.com/unsubscribe?email=a%40example.com"
        );
    }

    #[test]
    fn test_unsubscribe_link_escapes_plus_addressing() {
        let link = list().unsubscribe_link("a+tag@example.com");
        assert_eq!(
            link,
            "https://news.example.com/unsubscribe?email=a%2Btag%40example.com"
        );
    }

    #[test]
    fn test_verification_link() {
        assert_eq!(
            list().verification_link("abc123"),
            "https://news.example.com/verify?token=abc123"
        );
    }

    #[test]
    fn test_feed_lookup_by_url() {
        let l = list();
        assert!(l.feed("https://example.com/feed.xml").is_some());
        assert!(l.feed("https://example.com/other.xml").is_none());
    }

    #[test]
    fn test_verification_state_serialization() {
        let json = serde_json::to_string(&VerificationState::Verified).unwrap();
        assert_eq!(json, "\"verified\"");
    }
}
