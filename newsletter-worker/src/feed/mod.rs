//! Feed polling: fetch, parse, pick new items and fan them out.

pub mod parser;
pub mod poller;
pub mod source;

pub use parser::parse_feed;
pub use poller::{content_hash, FeedPoller, PollReport, PollerSettings};
pub use source::{FeedSource, HttpFeedSource, StaticFeedSource};
