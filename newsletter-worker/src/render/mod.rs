//! Template rendering.
//!
//! A template is a plain HTML document. Per-recipient values are filled in by
//! element id in two passes over the parsed tree:
//! - text: every element whose id matches has its children replaced by one
//!   text node
//! - href: every `<a>` whose id matches gets its `href` set or created
//!
//! Untouched nodes are serialized back unchanged. Escaping of substituted
//! values is left to the html5ever serializer.

pub mod dom;
pub mod templates;

use std::collections::HashMap;

use tracing::debug;

use crate::model::{List, Subscription};

pub use dom::{Document, NodeId};

pub const LIST_NAME_ID: &str = "maildata-list-name";
pub const CONTENT_ID: &str = "maildata-content";
pub const ITEM_TITLE_ID: &str = "maildata-title";
pub const UNSUBSCRIBE_HREF_ID: &str = "maildata-href-unsub";
pub const VERIFY_HREF_ID: &str = "maildata-href-verify";
pub const VERIFY_TEXT_ID: &str = "maildata-text-verify";

/// Replacement values keyed by element id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Substitutions {
    pub text: HashMap<String, String>,
    pub href: HashMap<String, String>,
}

impl Substitutions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(mut self, id: impl Into<String>, value: impl Into<String>) -> Self {
        self.text.insert(id.into(), value.into());
        self
    }

    pub fn with_href(mut self, id: impl Into<String>, url: impl Into<String>) -> Self {
        self.href.insert(id.into(), url.into());
        self
    }

    /// Values for a feed item email: list name and unsubscribe link.
    pub fn for_item(list: &List, email: &str) -> Self {
        Self::new()
            .with_text(LIST_NAME_ID, list.name.clone())
            .with_href(UNSUBSCRIBE_HREF_ID, list.unsubscribe_link(email))
    }

    /// Item values plus the verification link.
    pub fn for_verification(list: &List, subscription: &Subscription) -> Self {
        let verify = list.verification_link(&subscription.verification_token);
        Self::for_item(list, &subscription.email)
            .with_text(VERIFY_TEXT_ID, verify.clone())
            .with_href(VERIFY_HREF_ID, verify)
    }
}

/// Parse `html`, apply both substitution passes and serialize the result.
pub fn render_template(html: &str, substitutions: &Substitutions) -> String {
    let mut doc = Document::parse(html);
    let text_replaced = doc.replace_text_by_id(&substitutions.text);
    let href_replaced = doc.replace_href_by_id(&substitutions.href);
    debug!(
        text_replaced = text_replaced,
        href_replaced = href_replaced,
        "template_rendered"
    );
    doc.render()
}
