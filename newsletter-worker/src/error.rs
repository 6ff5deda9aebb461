//! Error types for the mailing pipeline.

use thiserror::Error;

/// Result type alias using the newsletter error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for subscriptions, polling, delivery and feedback handling.
#[derive(Error, Debug)]
pub enum Error {
    /// Address failed RFC 5322 parsing
    #[error("Invalid email address: {0}")]
    InvalidEmail(String),

    /// No subscription holds this verification token
    #[error("Unknown verification token")]
    UnknownToken,

    /// Subscription was verified by an earlier request
    #[error("Subscription already verified")]
    AlreadyVerified,

    /// A verification email went out inside the cooldown window
    #[error("A verification email for this subscription was sent recently; retry in {retry_after_secs}s")]
    RecentlySent { retry_after_secs: i64 },

    /// Subscription, list, feed or content blob does not exist
    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    /// An index expected to be unique returned more than one row
    #[error("Ambiguous match on {index} for '{key}': {count} rows")]
    AmbiguousMatch {
        index: &'static str,
        key: String,
        count: usize,
    },

    /// Some independent sub-operations of a batch failed; the others were applied
    #[error("{operation}: {failed} of {total} failed: {}", failures.join("; "))]
    Aggregate {
        operation: &'static str,
        failed: usize,
        total: usize,
        failures: Vec<String>,
    },

    /// Feedback or queue payload could not be decoded
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Feed document could not be parsed
    #[error("Feed parse error: {0}")]
    FeedParse(String),

    /// Downstream store, queue, HTTP or mail-send failure
    #[error(transparent)]
    Transport(#[from] anyhow::Error),
}

impl Error {
    pub fn subscription_not_found(list: &str, email: &str) -> Self {
        Error::NotFound {
            entity: "Subscription",
            key: format!("{}/{}", list, email),
        }
    }

    pub fn list_not_found(key: &str) -> Self {
        Error::NotFound {
            entity: "List",
            key: key.to_string(),
        }
    }

    /// Whether the queue should redeliver a task that failed with this error.
    ///
    /// Only downstream failures can succeed on a later attempt; everything
    /// else describes data that will not change by retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transport(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
