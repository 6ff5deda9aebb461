//! RSS 2.0 / RSS 1.0 / Atom parser.
//!
//! Only the fields the poller needs are extracted: feed title and "updated"
//! timestamp, and per item an identifier, title, HTML content and publish
//! time. Namespaced elements are matched by local name, so `content:encoded`
//! and `dc:date` are recognised whatever prefix the feed binds.
//!
//! Text is unescaped against the HTML5 entity table, since descriptions
//! routinely carry `&nbsp;` and friends. Atom `type="xhtml"` content is inline
//! markup and is taken verbatim.

use chrono::{DateTime, Utc};
use quick_xml::escape::{resolve_html5_entity, unescape_with};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use crate::error::{Error, Result};
use crate::model::{FeedItem, ParsedFeed};

#[derive(Debug, Clone, Copy, PartialEq)]
enum Format {
    Rss,
    Atom,
}

#[derive(Default)]
struct ItemBuilder {
    guid: Option<String>,
    link: Option<String>,
    title: String,
    content: Option<String>,
    summary: Option<String>,
    published: Option<DateTime<Utc>>,
    updated: Option<DateTime<Utc>>,
}

impl ItemBuilder {
    /// Items without any identifier cannot be deduplicated and are dropped.
    fn build(self) -> Option<FeedItem> {
        let guid = self
            .guid
            .filter(|g| !g.is_empty())
            .or(self.link.filter(|l| !l.is_empty()))?;
        Some(FeedItem {
            guid,
            title: self.title,
            content: self.content.or(self.summary).unwrap_or_default(),
            published_at: self.published.or(self.updated),
        })
    }
}

/// Parse a feed document.
pub fn parse_feed(xml: &str) -> Result<ParsedFeed> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut format: Option<Format> = None;
    let mut feed = ParsedFeed::default();
    let mut stack: Vec<String> = Vec::new();
    let mut item: Option<(usize, ItemBuilder)> = None;
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = local_name(e);
                if format.is_none() {
                    format = Some(detect_format(&name)?);
                }

                let mut consumed = false;
                match name.as_str() {
                    "item" | "entry" if item.is_none() => {
                        item = Some((stack.len() + 1, ItemBuilder::default()));
                    }
                    "link" => {
                        if let Some((depth, builder)) = item.as_mut() {
                            if stack.len() == *depth {
                                set_atom_link(builder, e);
                            }
                        }
                    }
                    "content" | "summary" if is_xhtml(e) => {
                        if let Some((depth, builder)) = item.as_mut() {
                            if stack.len() == *depth {
                                let markup = reader.read_text(e.name()).map_err(|err| {
                                    Error::FeedParse(format!("XML error in <{}>: {}", name, err))
                                })?;
                                set_item_field(builder, &name, markup.trim());
                                consumed = true;
                            }
                        }
                    }
                    _ => {}
                }

                // read_text already consumed the matching end tag
                if !consumed {
                    stack.push(name);
                }
                text.clear();
            }
            Ok(Event::Empty(ref e)) => {
                let name = local_name(e);
                if format.is_none() {
                    format = Some(detect_format(&name)?);
                }
                if name == "link" {
                    if let Some((depth, builder)) = item.as_mut() {
                        if stack.len() == *depth {
                            set_atom_link(builder, e);
                        }
                    }
                }
            }
            Ok(Event::Text(ref e)) => {
                let value = match e.unescape_with(resolve_html5_entity) {
                    Ok(value) => value.into_owned(),
                    Err(_) => unescape_lenient(&String::from_utf8_lossy(&**e)),
                };
                text.push_str(&value);
            }
            Ok(Event::CData(ref e)) => {
                text.push_str(&String::from_utf8_lossy(&**e));
            }
            Ok(Event::End(_)) => {
                let name = match stack.pop() {
                    Some(name) => name,
                    None => continue,
                };
                let value = std::mem::take(&mut text);
                let value = value.trim();

                let item_depth = item.as_ref().map(|(depth, _)| *depth);
                match item_depth {
                    Some(depth) if stack.len() + 1 == depth => {
                        if let Some((_, builder)) = item.take() {
                            if let Some(done) = builder.build() {
                                feed.items.push(done);
                            }
                        }
                    }
                    Some(depth) if stack.len() == depth => {
                        if let Some((_, builder)) = item.as_mut() {
                            set_item_field(builder, &name, value);
                        }
                    }
                    Some(_) => {}
                    None => set_feed_field(&mut feed, &stack, &name, value),
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::FeedParse(format!(
                    "XML error at position {}: {}",
                    reader.buffer_position(),
                    e
                )))
            }
            _ => {}
        }

        buf.clear();
    }

    if format.is_none() {
        return Err(Error::FeedParse("document has no root element".to_string()));
    }

    Ok(feed)
}

/// Parse an RFC 2822 (RSS) or RFC 3339 (Atom) timestamp.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_ascii_lowercase()
}

fn is_xhtml(e: &BytesStart) -> bool {
    e.attributes()
        .flatten()
        .any(|attr| attr.key.as_ref() == b"type" && attr.value.as_ref() == b"xhtml")
}

/// Unescape each reference on its own, keeping the ones that do not resolve.
fn unescape_lenient(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find('&') {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let end = tail[1..]
            .find(|c: char| c == ';' || c == '&' || c.is_whitespace())
            .map(|i| i + 1)
            .filter(|&i| tail.as_bytes()[i] == b';');
        match end {
            Some(end) => {
                let reference = &tail[..=end];
                match unescape_with(reference, resolve_html5_entity) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => out.push_str(reference),
                }
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn detect_format(root: &str) -> Result<Format> {
    match root {
        "rss" | "rdf" => Ok(Format::Rss),
        "feed" => Ok(Format::Atom),
        other => Err(Error::FeedParse(format!(
            "unrecognised root element <{}>",
            other
        ))),
    }
}

fn set_atom_link(builder: &mut ItemBuilder, e: &BytesStart) {
    let mut href = None;
    let mut rel = None;
    for attr in e.attributes().flatten() {
        let value = attr.unescape_value().unwrap_or_default().to_string();
        match attr.key.as_ref() {
            b"href" => href = Some(value),
            b"rel" => rel = Some(value),
            _ => {}
        }
    }
    let alternate = matches!(rel.as_deref(), None | Some("alternate"));
    if let Some(href) = href {
        if alternate || builder.link.is_none() {
            builder.link = Some(href);
        }
    }
}

fn set_item_field(builder: &mut ItemBuilder, name: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    match name {
        "guid" | "id" => builder.guid = Some(value.to_string()),
        "link" => {
            if builder.link.is_none() {
                builder.link = Some(value.to_string());
            }
        }
        "title" => builder.title = value.to_string(),
        "encoded" | "content" => builder.content = Some(value.to_string()),
        "description" | "summary" => builder.summary = Some(value.to_string()),
        "pubdate" | "published" | "issued" => builder.published = parse_date(value),
        "date" => {
            if builder.published.is_none() {
                builder.published = parse_date(value);
            }
        }
        "updated" | "modified" => builder.updated = parse_date(value),
        _ => {}
    }
}

/// Feed-level metadata lives directly under `<channel>` (RSS) or `<feed>` (Atom).
fn set_feed_field(feed: &mut ParsedFeed, stack: &[String], name: &str, value: &str) {
    let parent = stack.last().map(|s| s.as_str());
    if !matches!(parent, Some("channel") | Some("feed")) || value.is_empty() {
        return;
    }
    match name {
        "title" => feed.title = value.to_string(),
        "lastbuilddate" | "updated" => feed.updated = parse_date(value).or(feed.updated),
        "pubdate" | "date" => {
            if feed.updated.is_none() {
                feed.updated = parse_date(value);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:content="http://purl.org/rss/1.0/modules/content/" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example Blog</title>
    <link>https://blog.example.com/</link>
    <lastBuildDate>Mon, 04 Mar 2024 10:00:00 +0000</lastBuildDate>
    <item>
      <title>Tom &amp; Jerry</title>
      <link>https://blog.example.com/1</link>
      <guid isPermaLink="false">post-1</guid>
      <pubDate>Mon, 04 Mar 2024 09:00:00 GMT</pubDate>
      <description>Short</description>
      <content:encoded><![CDATA[<p>Full <b>body</b></p>]]></content:encoded>
    </item>
    <item>
      <title>No guid</title>
      <link>https://blog.example.com/2</link>
      <dc:date>2024-03-03T08:00:00Z</dc:date>
      <description>&lt;p&gt;Escaped&lt;/p&gt;</description>
    </item>
    <item>
      <title>No identifier at all</title>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Blog</title>
  <updated>2024-03-04T10:00:00Z</updated>
  <entry>
    <title>First</title>
    <link rel="self" href="https://atom.example.com/self/1"/>
    <link rel="alternate" href="https://atom.example.com/1"/>
    <id>urn:uuid:1</id>
    <published>2024-03-04T09:00:00+01:00</published>
    <updated>2024-03-04T09:30:00Z</updated>
    <summary>Summary</summary>
    <content type="html">&lt;p&gt;Body&lt;/p&gt;</content>
  </entry>
  <entry>
    <title>Updated only</title>
    <link href="https://atom.example.com/2"/>
    <updated>2024-03-02T00:00:00Z</updated>
    <summary>Only a summary</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss() {
        let feed = parse_feed(RSS).unwrap();

        assert_eq!(feed.title, "Example Blog");
        assert_eq!(
            feed.updated,
            Some(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap())
        );
        assert_eq!(feed.items.len(), 2);

        let first = &feed.items[0];
        assert_eq!(first.guid, "post-1");
        assert_eq!(first.title, "Tom & Jerry");
        assert_eq!(first.content, "<p>Full <b>body</b></p>");
        assert_eq!(
            first.published_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap())
        );

        let second = &feed.items[1];
        assert_eq!(second.guid, "https://blog.example.com/2");
        assert_eq!(second.content, "<p>Escaped</p>");
        assert_eq!(
            second.published_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 3, 8, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_parse_atom() {
        let feed = parse_feed(ATOM).unwrap();

        assert_eq!(feed.title, "Atom Blog");
        assert_eq!(
            feed.updated,
            Some(Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap())
        );
        assert_eq!(feed.items.len(), 2);

        let first = &feed.items[0];
        assert_eq!(first.guid, "urn:uuid:1");
        assert_eq!(first.content, "<p>Body</p>");
        assert_eq!(
            first.published_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 4, 8, 0, 0).unwrap())
        );

        let second = &feed.items[1];
        assert_eq!(second.guid, "https://atom.example.com/2");
        assert_eq!(second.content, "Only a summary");
        assert_eq!(
            second.published_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_atom_xhtml_content_is_kept_as_markup() {
        let xml = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <entry>
    <id>urn:uuid:x</id>
    <title>Inline</title>
    <content type="xhtml"><div xmlns="http://www.w3.org/1999/xhtml"><p>First para</p><p>Second para</p></div></content>
    <updated>2024-03-04T09:00:00Z</updated>
  </entry>
</feed>"#;

        let feed = parse_feed(xml).unwrap();

        assert_eq!(feed.items.len(), 1);
        let item = &feed.items[0];
        assert_eq!(
            item.content,
            r#"<div xmlns="http://www.w3.org/1999/xhtml"><p>First para</p><p>Second para</p></div>"#
        );
        assert_eq!(item.title, "Inline");
        assert_eq!(
            item.published_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_html_entities_in_description_are_resolved() {
        let xml = concat!(
            "<rss><channel><item><guid>e</guid>",
            "<description>&lt;p&gt;Caf&eacute; &amp; more&nbsp;&#33;&lt;/p&gt;</description>",
            "</item></channel></rss>"
        );

        let feed = parse_feed(xml).unwrap();

        assert_eq!(feed.items[0].content, "<p>Caf\u{e9} & more\u{a0}!</p>");
    }

    #[test]
    fn test_unknown_entities_are_kept_verbatim() {
        assert_eq!(
            unescape_lenient("&lt;b&gt; &bogus; AT&T &amp"),
            "<b> &bogus; AT&T &amp"
        );
    }

    #[test]
    fn test_item_title_does_not_override_feed_title() {
        let feed = parse_feed(RSS).unwrap();
        assert_eq!(feed.title, "Example Blog");
    }

    #[test]
    fn test_rejects_non_feed_documents() {
        assert!(matches!(
            parse_feed("<html><body></body></html>"),
            Err(Error::FeedParse(_))
        ));
        assert!(matches!(parse_feed(""), Err(Error::FeedParse(_))));
        assert!(matches!(
            parse_feed("<rss><channel><item></channel></rss>"),
            Err(Error::FeedParse(_))
        ));
    }

    #[test]
    fn test_parse_date_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        assert_eq!(parse_date("Mon, 04 Mar 2024 09:00:00 +0000"), Some(expected));
        assert_eq!(parse_date("2024-03-04T09:00:00Z"), Some(expected));
        assert_eq!(parse_date("yesterday"), None);
    }
}
