//! In-memory render surface.
//!
//! A [`Surface`] is an element node in an output tree: a tag, attributes,
//! style properties and ordered children (elements, escaped text, or trusted
//! markup). Output contexts render into surfaces; the evaluator serialises
//! them with [`Surface::to_html`].

use crate::lock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct Surface {
    inner: Arc<SurfaceInner>,
}

struct SurfaceInner {
    id: u64,
    tag: String,
    parent: Mutex<Weak<SurfaceInner>>,
    state: Mutex<SurfaceState>,
}

#[derive(Default)]
struct SurfaceState {
    attrs: BTreeMap<String, String>,
    classes: Vec<String>,
    style: BTreeMap<String, String>,
    children: Vec<Node>,
}

#[derive(Clone)]
enum Node {
    Element(Surface),
    Text(String),
    Markup(String),
}

/// Description of a surface to create with [`Surface::create_child`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceSpec {
    pub tag: String,
    pub attrs: BTreeMap<String, String>,
    pub classes: Vec<String>,
    pub style: BTreeMap<String, String>,
}

impl Default for SurfaceSpec {
    fn default() -> Self {
        Self::new("div")
    }
}

impl SurfaceSpec {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            attrs: BTreeMap::new(),
            classes: Vec::new(),
            style: BTreeMap::new(),
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(name.into(), value.into());
        self
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.classes.push(class.into());
        self
    }

    pub fn style(mut self, property: impl Into<String>, value: impl Into<String>) -> Self {
        self.style.insert(property.into(), value.into());
        self
    }
}

impl PartialEq for Surface {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Surface {}

impl fmt::Debug for Surface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Surface")
            .field("id", &self.inner.id)
            .field("tag", &self.inner.tag)
            .finish()
    }
}

impl Surface {
    /// A detached surface with no parent.
    pub fn root(tag: impl Into<String>) -> Self {
        Self::from_spec(SurfaceSpec::new(tag))
    }

    fn from_spec(spec: SurfaceSpec) -> Self {
        Self {
            inner: Arc::new(SurfaceInner {
                id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
                tag: spec.tag,
                parent: Mutex::new(Weak::new()),
                state: Mutex::new(SurfaceState {
                    attrs: spec.attrs,
                    classes: spec.classes,
                    style: spec.style,
                    children: Vec::new(),
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn tag(&self) -> &str {
        &self.inner.tag
    }

    pub fn parent(&self) -> Option<Surface> {
        lock(&self.inner.parent)
            .upgrade()
            .map(|inner| Surface { inner })
    }

    /// Append a new child element.
    pub fn create_child(&self, spec: SurfaceSpec) -> Surface {
        let child = Surface::from_spec(spec);
        *lock(&child.inner.parent) = Arc::downgrade(&self.inner);
        lock(&self.inner.state)
            .children
            .push(Node::Element(child.clone()));
        child
    }

    pub fn append_text(&self, text: &str) {
        lock(&self.inner.state)
            .children
            .push(Node::Text(text.to_string()));
    }

    /// Replace all children with `text`.
    pub fn set_text(&self, text: &str) {
        self.clear();
        self.append_text(text);
    }

    /// Append markup that is emitted verbatim by [`to_html`](Self::to_html).
    pub fn append_markup(&self, markup: &str) {
        lock(&self.inner.state)
            .children
            .push(Node::Markup(markup.to_string()));
    }

    pub fn set_markup(&self, markup: &str) {
        self.clear();
        self.append_markup(markup);
    }

    pub fn clear(&self) {
        let children = std::mem::take(&mut lock(&self.inner.state).children);
        for child in children {
            if let Node::Element(element) = child {
                *lock(&element.inner.parent) = Weak::new();
            }
        }
    }

    /// Detach this surface from its parent.
    pub fn remove(&self) {
        let parent = std::mem::take(&mut *lock(&self.inner.parent));
        if let Some(parent) = parent.upgrade() {
            lock(&parent.state)
                .children
                .retain(|node| !matches!(node, Node::Element(element) if element == self));
        }
    }

    pub fn children(&self) -> Vec<Surface> {
        lock(&self.inner.state)
            .children
            .iter()
            .filter_map(|node| match node {
                Node::Element(element) => Some(element.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn set_attr(&self, name: impl Into<String>, value: impl Into<String>) {
        lock(&self.inner.state)
            .attrs
            .insert(name.into(), value.into());
    }

    pub fn set_attrs<K, V>(&self, attrs: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        let mut state = lock(&self.inner.state);
        for (name, value) in attrs {
            state.attrs.insert(name.into(), value.into());
        }
    }

    pub fn remove_attr(&self, name: &str) -> Option<String> {
        lock(&self.inner.state).attrs.remove(name)
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        lock(&self.inner.state).attrs.get(name).cloned()
    }

    pub fn add_class(&self, class: impl Into<String>) {
        let class = class.into();
        let mut state = lock(&self.inner.state);
        if !state.classes.contains(&class) {
            state.classes.push(class);
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        lock(&self.inner.state).classes.iter().any(|c| c == class)
    }

    /// Set or remove style properties; `None` removes the property.
    pub fn update_style<K>(&self, properties: impl IntoIterator<Item = (K, Option<String>)>)
    where
        K: Into<String>,
    {
        let mut state = lock(&self.inner.state);
        for (property, value) in properties {
            match value {
                Some(value) => {
                    state.style.insert(property.into(), value);
                }
                None => {
                    state.style.remove(&property.into());
                }
            }
        }
    }

    pub fn style(&self) -> BTreeMap<String, String> {
        lock(&self.inner.state).style.clone()
    }

    /// The style properties formatted as an inline `style` attribute value.
    pub fn style_attribute(&self) -> Option<String> {
        format_style(&lock(&self.inner.state).style)
    }

    /// Concatenated text of this surface and its descendants, markup excluded.
    pub fn text_content(&self) -> String {
        let mut text = String::new();
        self.collect_text(&mut text);
        text
    }

    fn collect_text(&self, text: &mut String) {
        let children = lock(&self.inner.state).children.clone();
        for child in children {
            match child {
                Node::Element(element) => element.collect_text(text),
                Node::Text(t) => text.push_str(&t),
                Node::Markup(_) => {}
            }
        }
    }

    /// Depth-first search for a descendant (or self) carrying `name="value"`.
    pub fn find_by_attr(&self, name: &str, value: &str) -> Option<Surface> {
        if self.attr(name).as_deref() == Some(value) {
            return Some(self.clone());
        }
        self.children()
            .iter()
            .find_map(|child| child.find_by_attr(name, value))
    }

    pub fn to_html(&self) -> String {
        let mut html = String::new();
        self.write_html(&mut html);
        html
    }

    fn write_html(&self, html: &mut String) {
        let (attrs, classes, style, children) = {
            let state = lock(&self.inner.state);
            (
                state.attrs.clone(),
                state.classes.clone(),
                format_style(&state.style),
                state.children.clone(),
            )
        };

        html.push('<');
        html.push_str(&self.inner.tag);
        if !classes.is_empty() {
            push_attr(html, "class", &classes.join(" "));
        }
        for (name, value) in &attrs {
            push_attr(html, name, value);
        }
        if let Some(style) = style {
            push_attr(html, "style", &style);
        }
        html.push('>');

        for child in children {
            match child {
                Node::Element(element) => element.write_html(html),
                Node::Text(text) => html.push_str(&escape(&text)),
                Node::Markup(markup) => html.push_str(&markup),
            }
        }

        if !is_void(&self.inner.tag) {
            html.push_str("</");
            html.push_str(&self.inner.tag);
            html.push('>');
        }
    }
}

fn format_style(style: &BTreeMap<String, String>) -> Option<String> {
    if style.is_empty() {
        return None;
    }
    Some(
        style
            .iter()
            .map(|(property, value)| format!("{}: {}", property, value))
            .collect::<Vec<_>>()
            .join("; "),
    )
}

fn push_attr(html: &mut String, name: &str, value: &str) {
    html.push(' ');
    html.push_str(name);
    html.push_str("=\"");
    html.push_str(&escape(value));
    html.push('"');
}

fn is_void(tag: &str) -> bool {
    matches!(tag, "br" | "hr" | "img" | "input" | "meta" | "link")
}

fn escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn serialises_nested_tree() {
        let root = Surface::root("div");
        let child = root.create_child(
            SurfaceSpec::new("span")
                .class("plain-text")
                .attr("data-id", "x")
                .style("font-family", "monospace"),
        );
        child.append_text("a < b");
        root.append_markup("<em>ok</em>");
        root.create_child(SurfaceSpec::new("hr"));
        assert_eq!(
            root.to_html(),
            "<div><span class=\"plain-text\" data-id=\"x\" style=\"font-family: monospace\">a &lt; b</span><em>ok</em><hr></div>"
        );
        assert_eq!(root.text_content(), "a < b");
    }

    #[test]
    fn clear_and_remove_detach_children() {
        let root = Surface::root("div");
        let a = root.create_child(SurfaceSpec::default());
        let b = root.create_child(SurfaceSpec::default());
        assert_eq!(a.parent(), Some(root.clone()));
        b.remove();
        assert_eq!(root.children(), vec![a.clone()]);
        assert_eq!(b.parent(), None);
        root.clear();
        assert!(root.children().is_empty());
        assert_eq!(a.parent(), None);
    }

    #[test]
    fn update_style_sets_and_removes() {
        let surface = Surface::root("div");
        surface.update_style([
            ("color", Some("red".to_string())),
            ("margin", Some("0".to_string())),
        ]);
        surface.update_style([("color", None)]);
        assert_eq!(surface.style_attribute().as_deref(), Some("margin: 0"));
    }

    #[test]
    fn find_by_attr_searches_descendants() {
        let root = Surface::root("div");
        let inner = root
            .create_child(SurfaceSpec::default())
            .create_child(SurfaceSpec::new("span").attr("id", "target"));
        assert_eq!(root.find_by_attr("id", "target"), Some(inner));
        assert_eq!(root.find_by_attr("id", "missing"), None);
    }
}
