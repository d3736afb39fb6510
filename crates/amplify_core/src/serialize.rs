//! Markup serialization for parsed documents.
//!
//! Two layouts are produced from the same tree walk:
//! - `Compact` writes children exactly as parsed and applies pending
//!   [`PatchSet`] edits; it is the intermediate form fed back into the parser.
//! - `Pretty` indents elements whose children are only block-level elements,
//!   leaving every element with text content on one line. Re-parsing pretty
//!   output and printing it again yields the same string.

use std::collections::HashMap;

use ego_tree::{NodeId, NodeRef};
use scraper::node::{Element, Node};
use scraper::Html;

const INDENT: &str = "  ";

const VOID_ELEMENTS: &[&str] = &[
    "area", "base", "br", "col", "embed", "hr", "img", "input", "keygen", "link", "meta", "param",
    "source", "track", "wbr",
];

/// Elements whose text children are written without escaping.
const RAW_TEXT_ELEMENTS: &[&str] = &[
    "script", "style", "xmp", "iframe", "noembed", "noframes", "plaintext", "noscript",
];

/// Elements whose content is never re-indented.
const PRESERVED_ELEMENTS: &[&str] = &["pre", "textarea", "listing", "script", "style"];

/// Elements that may be laid out one per line without changing rendering.
const BLOCK_ELEMENTS: &[&str] = &[
    "html", "head", "body", "address", "article", "aside", "base", "blockquote", "dd", "details",
    "dialog", "div", "dl", "dt", "fieldset", "figcaption", "figure", "footer", "form", "h1", "h2",
    "h3", "h4", "h5", "h6", "header", "hgroup", "hr", "li", "link", "main", "menu", "meta", "nav",
    "noscript", "ol", "p", "pre", "script", "section", "style", "summary", "table", "tbody", "td",
    "template", "tfoot", "th", "thead", "title", "tr", "ul",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    Compact,
    Pretty,
}

/// Pending edits for one element, applied when the tree is serialized.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct NodePatch {
    pub attrs: Option<Vec<(String, String)>>,
    pub inner: Option<String>,
    pub prepend: String,
    pub append: String,
    pub after: String,
    pub removed: bool,
}

#[derive(Debug, Default, Clone)]
pub(crate) struct PatchSet {
    patches: HashMap<NodeId, NodePatch>,
}

impl PatchSet {
    pub fn get(&self, id: NodeId) -> Option<&NodePatch> {
        self.patches.get(&id)
    }

    pub fn entry(&mut self, id: NodeId) -> &mut NodePatch {
        self.patches.entry(id).or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}

pub(crate) fn render_document(html: &Html, patches: &PatchSet, layout: Layout) -> String {
    let mut writer = Writer::new(patches, layout);
    writer.out.push_str("<!DOCTYPE html>\n");
    for child in html.tree.root().children() {
        match child.value() {
            Node::Doctype(_) => {}
            Node::Element(_) => writer.element(child, 0),
            Node::Comment(comment) => {
                writer.comment(&comment.comment);
                if layout == Layout::Pretty {
                    writer.out.push('\n');
                }
            }
            _ => {}
        }
    }
    writer.out
}

/// Serializes the children of `id`, with pending edits applied.
pub(crate) fn render_inner(html: &Html, patches: &PatchSet, id: NodeId) -> String {
    let Some(node) = html.tree.get(id) else {
        return String::new();
    };
    let mut writer = Writer::new(patches, Layout::Compact);
    writer.children_inline(node, 0);
    writer.out
}

/// Serializes `id` itself, with pending edits applied.
pub(crate) fn render_outer(html: &Html, patches: &PatchSet, id: NodeId) -> String {
    let Some(node) = html.tree.get(id) else {
        return String::new();
    };
    let mut writer = Writer::new(patches, Layout::Compact);
    writer.element(node, 0);
    writer.out
}

struct Writer<'a> {
    patches: &'a PatchSet,
    layout: Layout,
    out: String,
}

impl<'a> Writer<'a> {
    fn new(patches: &'a PatchSet, layout: Layout) -> Self {
        Self {
            patches,
            layout,
            out: String::new(),
        }
    }

    fn element(&mut self, node: NodeRef<'_, Node>, depth: usize) {
        let Node::Element(element) = node.value() else {
            return;
        };
        let patches = self.patches;
        let patch = patches.get(node.id());
        if let Some(patch) = patch {
            if patch.removed {
                self.out.push_str(&patch.after);
                return;
            }
        }

        let name = element.name();
        self.open_tag(element, patch);

        if VOID_ELEMENTS.contains(&name) {
            if let Some(patch) = patch {
                self.out.push_str(&patch.after);
            }
            return;
        }

        if let Some(patch) = patch {
            self.out.push_str(&patch.prepend);
        }
        match patch.and_then(|p| p.inner.as_deref()) {
            Some(inner) => self.out.push_str(inner),
            None if self.layout == Layout::Pretty && is_block_container(node) => {
                self.children_block(node, depth);
            }
            None => {
                if matches!(name, "pre" | "textarea" | "listing") && starts_with_newline(node) {
                    self.out.push('\n');
                }
                self.children_inline(node, depth);
            }
        }
        if let Some(patch) = patch {
            self.out.push_str(&patch.append);
        }

        self.out.push_str("</");
        self.out.push_str(name);
        self.out.push('>');
        if let Some(patch) = patch {
            self.out.push_str(&patch.after);
        }
    }

    fn open_tag(&mut self, element: &Element, patch: Option<&NodePatch>) {
        self.out.push('<');
        self.out.push_str(element.name());
        match patch.and_then(|p| p.attrs.as_ref()) {
            Some(attrs) => {
                for (name, value) in attrs {
                    self.attribute(name, value);
                }
            }
            None => {
                for (name, value) in qualified_attributes(element) {
                    self.attribute(&name, &value);
                }
            }
        }
        self.out.push('>');
    }

    fn attribute(&mut self, name: &str, value: &str) {
        self.out.push(' ');
        self.out.push_str(name);
        self.out.push_str("=\"");
        escape_into(&mut self.out, value, true);
        self.out.push('"');
    }

    fn comment(&mut self, text: &str) {
        self.out.push_str("<!--");
        self.out.push_str(text);
        self.out.push_str("-->");
    }

    fn children_inline(&mut self, node: NodeRef<'_, Node>, depth: usize) {
        let raw = match node.value() {
            Node::Element(element) => RAW_TEXT_ELEMENTS.contains(&element.name()),
            _ => false,
        };
        let last_content = if is_body(node) {
            last_non_whitespace_child(node)
        } else {
            None
        };
        for (index, child) in node.children().enumerate() {
            match child.value() {
                Node::Text(text) => {
                    // The parser moves whitespace after `</body>` into body; drop it.
                    if is_body(node) && last_content.map_or(true, |last| index > last) {
                        continue;
                    }
                    if raw {
                        self.out.push_str(&text.text);
                    } else {
                        escape_into(&mut self.out, &text.text, false);
                    }
                }
                Node::Element(_) => self.element(child, depth + 1),
                Node::Comment(comment) => self.comment(&comment.comment),
                // Template contents hang off the element as a fragment.
                Node::Fragment => self.children_inline(child, depth),
                _ => {}
            }
        }
    }

    fn children_block(&mut self, node: NodeRef<'_, Node>, depth: usize) {
        for child in node.children() {
            match child.value() {
                Node::Element(_) => {
                    self.newline(depth + 1);
                    self.element(child, depth + 1);
                }
                Node::Comment(comment) => {
                    self.newline(depth + 1);
                    self.comment(&comment.comment);
                }
                _ => {}
            }
        }
        self.newline(depth);
    }

    fn newline(&mut self, depth: usize) {
        self.out.push('\n');
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
    }
}

/// Attributes of `element` in source order, with namespace prefixes kept
/// (`xlink:href`, `xml:lang`).
pub(crate) fn qualified_attributes(element: &Element) -> Vec<(String, String)> {
    element
        .attrs
        .iter()
        .map(|(name, value)| {
            let name = match name.prefix.as_deref() {
                Some(prefix) => format!("{prefix}:{}", &*name.local),
                None => name.local.to_string(),
            };
            (name, value.to_string())
        })
        .collect()
}

fn is_body(node: NodeRef<'_, Node>) -> bool {
    matches!(node.value(), Node::Element(element) if element.name() == "body")
}

fn last_non_whitespace_child(node: NodeRef<'_, Node>) -> Option<usize> {
    node.children()
        .enumerate()
        .filter(|(_, child)| match child.value() {
            Node::Text(text) => !text.text.trim().is_empty(),
            _ => true,
        })
        .map(|(index, _)| index)
        .last()
}

fn starts_with_newline(node: NodeRef<'_, Node>) -> bool {
    match node.first_child().map(|child| child.value()) {
        Some(Node::Text(text)) => text.text.starts_with('\n'),
        _ => false,
    }
}

fn is_block_name(name: &str) -> bool {
    BLOCK_ELEMENTS.contains(&name) || name.contains('-')
}

/// True when `node` holds at least one element and nothing but block-level
/// elements, comments and whitespace.
fn is_block_container(node: NodeRef<'_, Node>) -> bool {
    let Node::Element(element) = node.value() else {
        return false;
    };
    if PRESERVED_ELEMENTS.contains(&element.name()) || RAW_TEXT_ELEMENTS.contains(&element.name())
    {
        return false;
    }
    let mut has_element = false;
    for child in node.children() {
        match child.value() {
            Node::Element(child_element) => {
                if !is_block_name(child_element.name()) {
                    return false;
                }
                has_element = true;
            }
            Node::Text(text) => {
                if !text.text.trim().is_empty() {
                    return false;
                }
            }
            Node::Comment(_) => {}
            _ => return false,
        }
    }
    has_element
}

pub(crate) fn escape_into(out: &mut String, text: &str, attribute: bool) {
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '\u{a0}' => out.push_str("&nbsp;"),
            '"' if attribute => out.push_str("&quot;"),
            '<' if !attribute => out.push_str("&lt;"),
            '>' if !attribute => out.push_str("&gt;"),
            _ => out.push(ch),
        }
    }
}

pub(crate) fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    escape_into(&mut out, value, true);
    out
}

#[cfg(test)]
mod tests {
    use super::{render_document, Layout, PatchSet};
    use scraper::Html;

    fn pretty(markup: &str) -> String {
        render_document(&Html::parse_document(markup), &PatchSet::default(), Layout::Pretty)
    }

    #[test]
    fn block_children_are_indented_and_inline_content_stays_on_one_line() {
        let out = pretty("<html><head><title>T</title></head><body><div><p>Hello <b>you</b></p></div></body></html>");
        assert_eq!(
            out,
            "<!DOCTYPE html>\n<html>\n  <head>\n    <title>T</title>\n  </head>\n  <body>\n    <div>\n      <p>Hello <b>you</b></p>\n    </div>\n  </body>\n</html>"
        );
    }

    #[test]
    fn pretty_output_is_a_fixed_point() {
        let source = "<html><body>Loose text <div><section><p>a</p></section></div>\n\n</body></html>";
        let once = pretty(source);
        let twice = pretty(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn raw_text_is_not_escaped() {
        let out = pretty("<html><head><style>a > b { color: red }</style></head><body><p>1 < 2</p></body></html>");
        assert!(out.contains("<style>a > b { color: red }</style>"));
        assert!(out.contains("<p>1 &lt; 2</p>"));
    }

    #[test]
    fn leading_newline_in_pre_survives_reparse() {
        let once = pretty("<html><body><pre>\n\nindented</pre></body></html>");
        let twice = pretty(&once);
        assert_eq!(once, twice);
        assert!(once.contains("<pre>\n\nindented</pre>"));
    }
}
