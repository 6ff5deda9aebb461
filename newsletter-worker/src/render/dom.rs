//! Mutable HTML document.
//!
//! Wraps the `scraper` parse tree, an arena of nodes addressed by
//! [`NodeId`]. Substitutions edit that tree in place and rendering goes
//! through the html5ever serializer, so untouched nodes come back out the way
//! the parser read them. Detached nodes stay in the arena but are unreachable
//! from the root.

use std::collections::HashMap;

use html5ever::{LocalName, Namespace, QualName};
use scraper::node::Text;
use scraper::{Html, Node};

pub use ego_tree::NodeId;

/// A parsed HTML document that can be mutated in place and rendered back.
#[derive(Debug, Clone)]
pub struct Document {
    html: Html,
}

impl Document {
    /// Parse a full HTML document.
    pub fn parse(html: &str) -> Self {
        Self {
            html: Html::parse_document(html),
        }
    }

    pub fn root(&self) -> NodeId {
        self.html.tree.root().id()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.html.tree.get(id).map(|n| n.value())
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        self.html
            .tree
            .get(id)
            .map(|n| n.children().map(|c| c.id()).collect())
            .unwrap_or_default()
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.html.tree.get(id)?.parent().map(|p| p.id())
    }

    /// Render the document as HTML text.
    pub fn render(&self) -> String {
        self.html.html()
    }

    /// Value of an attribute on an element node.
    pub fn attr(&self, id: NodeId, name: &str) -> Option<&str> {
        self.node(id)?.as_element()?.attr(name)
    }

    /// All reachable elements whose `id` attribute equals `id`, in document order.
    pub fn elements_by_id(&self, id: &str) -> Vec<NodeId> {
        self.html
            .tree
            .root()
            .descendants()
            .filter(|n| n.value().as_element().and_then(|e| e.id()) == Some(id))
            .map(|n| n.id())
            .collect()
    }

    /// Concatenated text of a node's descendants.
    pub fn text_content(&self, id: NodeId) -> String {
        let Some(node) = self.html.tree.get(id) else {
            return String::new();
        };
        node.descendants()
            .filter_map(|n| n.value().as_text())
            .map(|t| &**t)
            .collect()
    }

    /// Replace the children of every element whose id is a key of `mappings`
    /// with a single text node holding the mapped value.
    ///
    /// Returns the number of elements changed.
    pub fn replace_text_by_id(&mut self, mappings: &HashMap<String, String>) -> usize {
        if mappings.is_empty() {
            return 0;
        }
        let mut replaced = 0;
        self.mutate_nodes(|doc, node| {
            let text = match doc.element_id(node).and_then(|id| mappings.get(id)) {
                Some(text) => text.clone(),
                None => return,
            };
            for child in doc.children(node) {
                if let Some(mut child) = doc.html.tree.get_mut(child) {
                    child.detach();
                }
            }
            if let Some(mut target) = doc.html.tree.get_mut(node) {
                target.append(Node::Text(Text { text: text.into() }));
                replaced += 1;
            }
        });
        replaced
    }

    /// Set (or create) `href` on every `<a>` whose id is a key of `mappings`.
    ///
    /// Returns the number of anchors changed.
    pub fn replace_href_by_id(&mut self, mappings: &HashMap<String, String>) -> usize {
        if mappings.is_empty() {
            return 0;
        }
        let mut replaced = 0;
        self.mutate_nodes(|doc, node| {
            let is_anchor = doc
                .node(node)
                .and_then(|n| n.as_element())
                .is_some_and(|e| e.name() == "a");
            if !is_anchor {
                return;
            }
            let url = match doc.element_id(node).and_then(|id| mappings.get(id)) {
                Some(url) => url.clone(),
                None => return,
            };
            if let Some(mut target) = doc.html.tree.get_mut(node) {
                if let Node::Element(element) = target.value() {
                    let key = element
                        .attrs
                        .keys()
                        .find(|k| k.prefix.is_none() && &*k.local == "href")
                        .cloned()
                        .unwrap_or_else(|| {
                            QualName::new(None, Namespace::from(""), LocalName::from("href"))
                        });
                    element.attrs.insert(key, url.into());
                    replaced += 1;
                }
            }
        });
        replaced
    }

    fn element_id(&self, id: NodeId) -> Option<&str> {
        self.node(id)?.as_element()?.id()
    }

    /// Visit nodes in pre-order, reading each node's children only after `f`
    /// has run on it.
    fn mutate_nodes(&mut self, mut f: impl FnMut(&mut Self, NodeId)) {
        let mut stack = vec![self.root()];
        while let Some(id) = stack.pop() {
            f(self, id);
            stack.extend(self.children(id).into_iter().rev());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mappings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_builds_parent_links() {
        let doc = Document::parse("<html><body><p id=\"x\">hi</p></body></html>");
        let p = doc.elements_by_id("x")[0];
        let body = doc.parent(p).unwrap();
        assert_eq!(doc.node(body).unwrap().as_element().unwrap().name(), "body");
        assert_eq!(doc.text_content(p), "hi");
    }

    #[test]
    fn test_replace_text_replaces_all_children() {
        let mut doc =
            Document::parse("<html><body><p id=\"name\">old <b>bold</b> text</p></body></html>");

        let changed = doc.replace_text_by_id(&mappings(&[("name", "New List")]));

        assert_eq!(changed, 1);
        let p = doc.elements_by_id("name")[0];
        assert_eq!(doc.children(p).len(), 1);
        assert_eq!(doc.text_content(p), "New List");
    }

    #[test]
    fn test_replace_text_mutates_every_duplicate_id() {
        let mut doc = Document::parse(
            "<html><body><span id=\"n\">a</span><div><span id=\"n\">b</span></div></body></html>",
        );

        let changed = doc.replace_text_by_id(&mappings(&[("n", "z")]));

        assert_eq!(changed, 2);
        for node in doc.elements_by_id("n") {
            assert_eq!(doc.text_content(node), "z");
        }
    }

    #[test]
    fn test_replace_href_creates_missing_attribute() {
        let mut doc = Document::parse("<html><body><a id=\"unsub\">Unsubscribe</a></body></html>");

        let changed =
            doc.replace_href_by_id(&mappings(&[("unsub", "https://example.com/unsubscribe")]));

        assert_eq!(changed, 1);
        let a = doc.elements_by_id("unsub")[0];
        assert_eq!(doc.attr(a, "href"), Some("https://example.com/unsubscribe"));
        assert_eq!(doc.text_content(a), "Unsubscribe");
        assert!(doc
            .render()
            .contains("<a id=\"unsub\" href=\"https://example.com/unsubscribe\">"));
    }

    #[test]
    fn test_replace_href_overwrites_existing_attribute() {
        let mut doc =
            Document::parse("<html><body><a id=\"v\" href=\"#\" class=\"btn\">Go</a></body></html>");

        doc.replace_href_by_id(&mappings(&[("v", "https://example.com/verify")]));

        let a = doc.elements_by_id("v")[0];
        assert_eq!(doc.attr(a, "href"), Some("https://example.com/verify"));
        assert_eq!(doc.attr(a, "class"), Some("btn"));
        assert!(doc
            .render()
            .contains("<a id=\"v\" href=\"https://example.com/verify\" class=\"btn\">"));
    }

    #[test]
    fn test_replace_href_ignores_non_anchor_elements() {
        let mut doc = Document::parse("<html><body><div id=\"v\">x</div></body></html>");

        let changed = doc.replace_href_by_id(&mappings(&[("v", "https://example.com")]));

        assert_eq!(changed, 0);
        let div = doc.elements_by_id("v")[0];
        assert_eq!(doc.attr(div, "href"), None);
    }

    #[test]
    fn test_replaced_children_are_unreachable() {
        let mut doc = Document::parse(
            "<html><body><div id=\"outer\"><span id=\"inner\">x</span></div></body></html>",
        );

        doc.replace_text_by_id(&mappings(&[("outer", "flat")]));

        assert!(doc.elements_by_id("inner").is_empty());
    }

    #[test]
    fn test_render_keeps_namespaced_attributes() {
        let html = concat!(
            "<html><head></head><body>",
            "<svg><use xlink:href=\"#icon\"></use></svg>",
            "<p id=\"n\">x</p>",
            "</body></html>"
        );
        let mut doc = Document::parse(html);

        doc.replace_text_by_id(&mappings(&[("n", "y")]));

        let out = doc.render();
        assert!(out.contains("<use xlink:href=\"#icon\"></use>"), "{out}");
        assert!(out.contains("<p id=\"n\">y</p>"), "{out}");
    }
}
