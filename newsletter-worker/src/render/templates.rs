//! Built-in documents: the verification email, composed item emails and the
//! front-end pages.

use super::{
    render_template, Substitutions, CONTENT_ID, ITEM_TITLE_ID, LIST_NAME_ID, UNSUBSCRIBE_HREF_ID,
    VERIFY_HREF_ID, VERIFY_TEXT_ID,
};
use crate::model::FeedItem;

pub const PAGE_TITLE_ID: &str = "page-title";
pub const PAGE_MESSAGE_ID: &str = "page-message";
pub const PAGE_DESCRIPTION_ID: &str = "page-description";

pub fn verification_subject(list_name: &str) -> String {
    format!("Verify email for {}", list_name)
}

/// Filled per subscriber with the list name and verification link.
pub fn verification_email() -> String {
    format!(
        concat!(
            "<!DOCTYPE html>",
            "<html><head><meta charset=\"utf-8\"><title>Verify your email</title></head>",
            "<body>",
            "<p>Thanks for subscribing to <strong id=\"{list}\">this list</strong>.</p>",
            "<p>Please confirm your address by opening this link:</p>",
            "<p><a id=\"{href}\"><span id=\"{text}\">verify</span></a></p>",
            "<p>If you did not ask to subscribe you can ignore this email.</p>",
            "</body></html>"
        ),
        list = LIST_NAME_ID,
        href = VERIFY_HREF_ID,
        text = VERIFY_TEXT_ID,
    )
}

/// Wrap a feed item into a complete email document.
///
/// The title is filled in as text, the content is inserted as HTML. List name
/// and unsubscribe link are left as placeholders for the delivery worker.
pub fn compose_item_document(item: &FeedItem) -> String {
    let skeleton = format!(
        concat!(
            "<!DOCTYPE html>",
            "<html><head><meta charset=\"utf-8\"><title id=\"{title}\"></title></head>",
            "<body>",
            "<h1 id=\"{title}\"></h1>",
            "<div id=\"{content_id}\">{content}</div>",
            "<hr>",
            "<p>You are receiving this email because you subscribed to ",
            "<span id=\"{list}\"></span>. ",
            "<a id=\"{unsub}\">Unsubscribe</a></p>",
            "</body></html>"
        ),
        title = ITEM_TITLE_ID,
        content_id = CONTENT_ID,
        content = item.content,
        list = LIST_NAME_ID,
        unsub = UNSUBSCRIBE_HREF_ID,
    );
    render_template(
        &skeleton,
        &Substitutions::new().with_text(ITEM_TITLE_ID, item.title.clone()),
    )
}

/// Layout for subscribe/verify/unsubscribe result pages.
pub fn message_page() -> String {
    format!(
        concat!(
            "<!DOCTYPE html>",
            "<html><head><meta charset=\"utf-8\"><title id=\"{title}\"></title></head>",
            "<body>",
            "<h1 id=\"{title}\"></h1>",
            "<p id=\"{message}\"></p>",
            "</body></html>"
        ),
        title = PAGE_TITLE_ID,
        message = PAGE_MESSAGE_ID,
    )
}

/// Landing page of a list with subscribe and unsubscribe forms.
pub fn landing_page() -> String {
    format!(
        concat!(
            "<!DOCTYPE html>",
            "<html><head><meta charset=\"utf-8\"><title id=\"{list}\"></title></head>",
            "<body>",
            "<h1 id=\"{list}\"></h1>",
            "<p id=\"{description}\"></p>",
            "<form action=\"/subscribe\" method=\"get\">",
            "<input type=\"email\" name=\"email\" placeholder=\"you@example.com\" required>",
            "<button type=\"submit\">Subscribe</button>",
            "</form>",
            "<form action=\"/unsubscribe\" method=\"get\">",
            "<input type=\"email\" name=\"email\" placeholder=\"you@example.com\" required>",
            "<button type=\"submit\">Unsubscribe</button>",
            "</form>",
            "</body></html>"
        ),
        list = LIST_NAME_ID,
        description = PAGE_DESCRIPTION_ID,
    )
}
