//! Rendered-tree access with stable node keys and disconnected markup clones
//!
//! A [`RenderedTree`] wraps a parsed `scraper::Html` document and assigns every
//! element a [`NodeKey`] before anything else looks at it. Rendering substrates
//! that stamp `data-migrate-key` on live elements get those keys back verbatim;
//! otherwise the key is the element's tree-order ordinal. Keys are what the
//! snapshot converter uses to find the clone node matching a live visual, so
//! matching is always exact.
//!
//! A [`MarkupClone`] is an edit overlay over one subtree: removals and
//! replacements are recorded against node ids and applied only when the clone
//! is serialized. The underlying tree is never mutated.

use std::collections::{HashMap, HashSet};
use std::fmt;

use ego_tree::{NodeId, NodeRef};
use scraper::{ElementRef, Html, Node, Selector};

use crate::{Error, Result};

/// Attribute a rendering substrate may stamp on live elements to carry keys
pub const KEY_ATTRIBUTE: &str = "data-migrate-key";

/// Elements that never have children or a closing tag
pub const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "link", "meta", "param", "source",
    "track", "wbr",
];

const RAW_TEXT_ELEMENTS: &[&str] = &["script", "style"];

/// Stable synthetic identifier of one element in a rendered tree
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn new(key: impl Into<String>) -> Self {
        NodeKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeKey {
    fn from(value: &str) -> Self {
        NodeKey(value.to_string())
    }
}

/// Compile a CSS selector, reporting bad input as a configuration error
pub fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| Error::ConfigError(format!("invalid selector '{}': {:?}", css, e)))
}

/// A parsed, keyed, read-only document tree
pub struct RenderedTree {
    html: Html,
    keys: HashMap<NodeId, NodeKey>,
    nodes: HashMap<NodeKey, NodeId>,
}

impl fmt::Debug for RenderedTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderedTree").field("elements", &self.keys.len()).finish()
    }
}

impl RenderedTree {
    /// Parse a full document and assign keys to every element
    pub fn parse(markup: &str) -> Self {
        Self::from_html(Html::parse_document(markup))
    }

    pub fn from_html(html: Html) -> Self {
        let mut keys = HashMap::new();
        let mut nodes = HashMap::new();
        let mut ordinal = 0usize;

        for node in html.tree.root().descendants() {
            let Some(element) = ElementRef::wrap(node) else {
                continue;
            };
            let key = match element.value().attr(KEY_ATTRIBUTE) {
                Some(stamped) if !stamped.is_empty() && !nodes.contains_key(&NodeKey::from(stamped)) => {
                    NodeKey::from(stamped)
                }
                _ => NodeKey(format!("n{}", ordinal)),
            };
            ordinal += 1;
            nodes.insert(key.clone(), node.id());
            keys.insert(node.id(), key);
        }

        RenderedTree { html, keys, nodes }
    }

    pub fn html(&self) -> &Html {
        &self.html
    }

    /// Number of keyed elements
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All matches of `selector` in document order
    pub fn select<'a>(&'a self, selector: &Selector) -> Vec<ElementRef<'a>> {
        self.html.select(selector).collect()
    }

    /// Key of an element taken from this tree
    pub fn key_of(&self, element: &ElementRef<'_>) -> NodeKey {
        self.keys
            .get(&element.id())
            .cloned()
            .unwrap_or_else(|| NodeKey(format!("detached-{:?}", element.id())))
    }

    /// Look an element up by key
    pub fn element(&self, key: &NodeKey) -> Option<ElementRef<'_>> {
        let id = self.nodes.get(key)?;
        self.html.tree.get(*id).and_then(ElementRef::wrap)
    }

    /// Take a disconnected clone of `root`'s subtree
    pub fn clone_of<'a>(&'a self, root: ElementRef<'a>) -> MarkupClone<'a> {
        MarkupClone {
            tree: self,
            root: root.id(),
            removed: HashSet::new(),
            replaced: HashMap::new(),
        }
    }
}

/// An edit overlay over one subtree of a [`RenderedTree`]
#[derive(Debug, Clone)]
pub struct MarkupClone<'a> {
    tree: &'a RenderedTree,
    root: NodeId,
    removed: HashSet<NodeId>,
    replaced: HashMap<NodeId, String>,
}

impl<'a> MarkupClone<'a> {
    pub fn root(&self) -> Option<ElementRef<'a>> {
        self.tree.html.tree.get(self.root).and_then(ElementRef::wrap)
    }

    fn within_root(&self, id: NodeId) -> bool {
        if id == self.root {
            return false;
        }
        match self.tree.html.tree.get(id) {
            Some(node) => node.ancestors().any(|a| a.id() == self.root),
            None => false,
        }
    }

    /// Drop `element` from the clone. Returns false when it is not inside the clone.
    pub fn remove(&mut self, element: &ElementRef<'_>) -> bool {
        let id = element.id();
        if !self.within_root(id) {
            return false;
        }
        self.replaced.remove(&id);
        self.removed.insert(id)
    }

    /// Swap the element carrying `key` for raw replacement markup
    pub fn replace(&mut self, key: &NodeKey, markup: impl Into<String>) -> bool {
        let Some(id) = self.tree.nodes.get(key).copied() else {
            return false;
        };
        if !self.within_root(id) || self.removed.contains(&id) {
            return false;
        }
        self.replaced.insert(id, markup.into());
        true
    }

    /// Whether the element (or one of its ancestors inside the clone) was removed or replaced
    pub fn is_detached(&self, element: &ElementRef<'_>) -> bool {
        let id = element.id();
        if self.removed.contains(&id) || self.replaced.contains_key(&id) {
            return true;
        }
        element
            .ancestors()
            .take_while(|a| a.id() != self.root)
            .any(|a| self.removed.contains(&a.id()) || self.replaced.contains_key(&a.id()))
    }

    /// Whether the element carrying `key` is still live inside the clone
    pub fn contains(&self, key: &NodeKey) -> bool {
        match self.tree.element(key) {
            Some(el) => (el.id() == self.root || self.within_root(el.id())) && !self.is_detached(&el),
            None => false,
        }
    }

    pub fn replacement_count(&self) -> usize {
        self.replaced.len()
    }

    /// Serialize the children of the clone root
    pub fn inner_html(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.tree.html.tree.get(self.root) {
            for child in root.children() {
                self.write_node(child, &mut out);
            }
        }
        out
    }

    /// Serialize the clone root including its own tag
    pub fn outer_html(&self) -> String {
        let mut out = String::new();
        if let Some(root) = self.tree.html.tree.get(self.root) {
            self.write_node(root, &mut out);
        }
        out
    }

    fn write_node(&self, node: NodeRef<'_, Node>, out: &mut String) {
        let id = node.id();
        if self.removed.contains(&id) {
            return;
        }
        if let Some(markup) = self.replaced.get(&id) {
            out.push_str(markup);
            return;
        }

        match node.value() {
            Node::Element(element) => {
                let name = element.name();
                out.push('<');
                out.push_str(name);
                for (attr, value) in element.attrs() {
                    if attr == KEY_ATTRIBUTE {
                        continue;
                    }
                    out.push(' ');
                    out.push_str(attr);
                    out.push_str("=\"");
                    out.push_str(&escape_attr(value));
                    out.push('"');
                }
                out.push('>');
                if VOID_ELEMENTS.contains(&name) {
                    return;
                }
                for child in node.children() {
                    self.write_node(child, out);
                }
                out.push_str("</");
                out.push_str(name);
                out.push('>');
            }
            Node::Text(text) => {
                let raw = node
                    .parent()
                    .and_then(|p| p.value().as_element().map(|e| RAW_TEXT_ELEMENTS.contains(&e.name())))
                    .unwrap_or(false);
                if raw {
                    out.push_str(text);
                } else {
                    out.push_str(&escape_text(text));
                }
            }
            Node::Comment(comment) => {
                out.push_str("<!--");
                out.push_str(comment);
                out.push_str("-->");
            }
            _ => {}
        }
    }
}

/// Escape text content for serialization
pub fn escape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
    out
}

/// Escape an attribute value for a double-quoted attribute
pub fn escape_attr(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            c => out.push(c),
        }
    }
    out
}

/// Concatenated descendant text of an element
pub fn text_of(element: &ElementRef<'_>) -> String {
    element.text().collect::<String>()
}

/// Whether the element carries `class` in its class list
pub fn has_class(element: &ElementRef<'_>, class: &str) -> bool {
    element.value().classes().any(|c| c == class)
}

/// Whether any proper ancestor of `element` matches `predicate`
pub fn has_ancestor(element: &ElementRef<'_>, predicate: impl Fn(&ElementRef<'_>) -> bool) -> bool {
    element
        .ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| predicate(&a))
}

/// Read one declaration from an element's inline `style` attribute
pub fn inline_style(element: &ElementRef<'_>, property: &str) -> Option<String> {
    let style = element.value().attr("style")?;
    style.split(';').find_map(|decl| {
        let (name, value) = decl.split_once(':')?;
        if name.trim().eq_ignore_ascii_case(property) {
            let value = value.trim().trim_end_matches("!important").trim();
            (!value.is_empty()).then(|| value.to_string())
        } else {
            None
        }
    })
}
