//! Newsletter - feed-driven mailing list service.
//!
//! This library provides shared modules for the three binaries:
//! - `newsletter-web`: list pages, subscribe/verify/unsubscribe, feedback webhook
//! - `newsletter-poller`: one poll cycle over every feed, fanning new items out
//! - `newsletter-worker`: delivery of queued tasks through the mail transport
//!
//! ## Architecture
//!
//! ```text
//! Feeds → Poller → blob store + newsletter_deliveries → Worker → Mailgun
//!                                                                   │
//! Web ← subscribers                       bounces/complaints ← ─────┘
//! ```

pub mod config;
pub mod delivery;
pub mod error;
pub mod fanout;
pub mod feed;
pub mod feedback;
pub mod model;
pub mod queue;
pub mod render;
pub mod store;
pub mod subscription;
pub mod util;
pub mod web;

// Re-export commonly used types
pub use config::Config;
pub use delivery::{DeliveryOutcome, DeliveryWorker};
pub use error::{Error, Result};
pub use feed::{FeedPoller, PollReport};
pub use feedback::{BounceHandler, FeedbackReport};
pub use model::{Feed, FeedItem, List, Subscription, VerificationState};
pub use queue::{DeliveryTask, Publisher, DELIVERY_QUEUE};
pub use render::{render_template, Substitutions};
pub use subscription::SubscriptionService;
pub use web::AppState;
