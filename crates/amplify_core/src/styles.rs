//! Stylesheet corpus and the small CSS toolkit used by the style actions.
//!
//! The parser understands qualified rules, nested grouping at-rules
//! (`@media`, `@supports`, ...) and keeps every other at-rule verbatim.
//! It is tolerant rather than strict: malformed input is carried through
//! instead of rejected, and selectors it cannot evaluate count as used.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use scraper::{Html, Selector};

/// Second-level DNS labels whose stylesheets are never collected.
pub const DEFAULT_EXCLUDED_STYLE_HOSTS: &[&str] = &["instagram", "google", "twitter", "twttr"];

const GROUPING_AT_RULES: &[&str] = &[
    "media",
    "supports",
    "document",
    "-moz-document",
    "container",
    "layer",
];

/// Pseudo-classes that describe document structure and can be matched
/// statically.
const STRUCTURAL_PSEUDO_CLASSES: &[&str] = &[
    "first-child",
    "last-child",
    "only-child",
    "nth-child",
    "nth-last-child",
    "first-of-type",
    "last-of-type",
    "only-of-type",
    "nth-of-type",
    "nth-last-of-type",
    "not",
    "is",
    "where",
    "has",
    "root",
    "empty",
];

/// Stylesheet text captured during a job's initial page load.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleCorpus {
    by_url: BTreeMap<String, String>,
    aggregate: String,
}

impl StyleCorpus {
    /// Records one stylesheet. A URL seen before is ignored.
    pub fn record(&mut self, url: impl Into<String>, text: impl Into<String>) {
        let url = url.into();
        if self.by_url.contains_key(&url) {
            return;
        }
        let text = text.into();
        self.aggregate.push_str(&text);
        self.by_url.insert(url, text);
    }

    pub fn by_url(&self) -> &BTreeMap<String, String> {
        &self.by_url
    }

    /// Every recorded stylesheet concatenated in arrival order.
    pub fn aggregate(&self) -> &str {
        &self.aggregate
    }

    pub fn len(&self) -> usize {
        self.by_url.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_url.is_empty()
    }
}

/// True when the second DNS label of `host` is in `excluded`
/// (`www.instagram.com` matches `instagram`).
pub fn is_excluded_host<S: AsRef<str>>(host: &str, excluded: &[S]) -> bool {
    host.split('.').nth(1).is_some_and(|label| {
        excluded
            .iter()
            .any(|entry| entry.as_ref().eq_ignore_ascii_case(label))
    })
}

/// Optimized and removed styles returned by `removeUnusedStyles` when asked to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StyleReport {
    pub optimized_styles: String,
    pub unused_styles: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CssNode {
    Style {
        selectors: Vec<String>,
        declarations: Vec<(String, String)>,
    },
    Block {
        prelude: String,
        children: Vec<CssNode>,
    },
    Opaque(String),
}

/// A parsed stylesheet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stylesheet {
    nodes: Vec<CssNode>,
}

impl Stylesheet {
    pub fn parse(css: &str) -> Self {
        Self {
            nodes: parse_rules(&strip_comments(css)),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn minified(&self) -> String {
        let mut out = String::new();
        write_minified(&self.nodes, &mut out);
        out
    }

    pub fn formatted(&self) -> String {
        let mut out = String::new();
        write_formatted(&self.nodes, 0, &mut out);
        out.truncate(out.trim_end().len());
        out
    }

    /// Splits the sheet into the rules that match something in `html` and
    /// the rules that do not. Selectors in a group are judged one by one.
    pub fn prune(&self, html: &Html) -> (Stylesheet, Stylesheet) {
        let (kept, removed) = prune_nodes(&self.nodes, html);
        (Stylesheet { nodes: kept }, Stylesheet { nodes: removed })
    }
}

pub fn minify_css(css: &str) -> String {
    Stylesheet::parse(css).minified()
}

pub fn format_css(css: &str) -> String {
    Stylesheet::parse(css).formatted()
}

/// Keeps `</style` sequences from closing an inline style element early.
pub fn escape_style_text(css: &str) -> String {
    static CLOSE: OnceLock<Regex> = OnceLock::new();
    CLOSE
        .get_or_init(|| Regex::new(r"(?i)</(style)").expect("static style close regex"))
        .replace_all(css, r"<\/$1")
        .into_owned()
}

fn strip_comments(css: &str) -> String {
    let mut out = String::with_capacity(css.len());
    let mut chars = css.chars().peekable();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    while let Some(ch) = chars.next() {
        if let Some(q) = quote {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        if ch == '/' && chars.peek() == Some(&'*') {
            chars.next();
            let mut previous = '\0';
            for inner in chars.by_ref() {
                if previous == '*' && inner == '/' {
                    break;
                }
                previous = inner;
            }
            continue;
        }
        if ch == '"' || ch == '\'' {
            quote = Some(ch);
        }
        out.push(ch);
    }
    out
}

/// Visits characters outside strings and parentheses until `visit` returns true.
fn scan_top_level(s: &str, mut visit: impl FnMut(usize, char) -> bool) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut parens = 0usize;
    for (idx, ch) in s.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        match ch {
            '"' | '\'' => quote = Some(ch),
            '(' => parens += 1,
            ')' => parens = parens.saturating_sub(1),
            _ if parens == 0 => {
                if visit(idx, ch) {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(s: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    scan_top_level(s, |idx, ch| {
        if ch == separator {
            parts.push(&s[start..idx]);
            start = idx + ch.len_utf8();
        }
        false
    });
    parts.push(&s[start..]);
    parts
}

fn matching_brace(s: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    scan_top_level(&s[open..], |_, ch| {
        match ch {
            '{' => depth += 1,
            '}' => {
                depth = depth.saturating_sub(1);
                return depth == 0;
            }
            _ => {}
        }
        false
    })
    .map(|idx| open + idx)
}

fn parse_rules(input: &str) -> Vec<CssNode> {
    let mut nodes = Vec::new();
    let mut rest = input;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        let mut found = None;
        scan_top_level(rest, |idx, ch| {
            let hit = matches!(ch, '{' | ';' | '}');
            if hit {
                found = Some((idx, ch));
            }
            hit
        });
        match found {
            // Trailing text without a terminator is dropped.
            None => break,
            Some((idx, ';')) => {
                let statement = collapse_whitespace(&rest[..idx]);
                if !statement.is_empty() {
                    nodes.push(CssNode::Opaque(format!("{statement};")));
                }
                rest = &rest[idx + 1..];
            }
            Some((idx, '}')) => rest = &rest[idx + 1..],
            Some((idx, _)) => {
                let prelude = rest[..idx].trim();
                let (body, next) = match matching_brace(rest, idx) {
                    Some(end) => (&rest[idx + 1..end], &rest[end + 1..]),
                    None => (&rest[idx + 1..], ""),
                };
                if let Some(node) = classify(prelude, body) {
                    nodes.push(node);
                }
                rest = next;
            }
        }
    }
    nodes
}

fn classify(prelude: &str, body: &str) -> Option<CssNode> {
    if let Some(at_rule) = prelude.strip_prefix('@') {
        let name = at_rule
            .split(|c: char| c.is_whitespace() || c == '(')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if GROUPING_AT_RULES.contains(&name.as_str()) {
            return Some(CssNode::Block {
                prelude: collapse_whitespace(prelude),
                children: parse_rules(body),
            });
        }
        return Some(CssNode::Opaque(format!(
            "{} {{{}}}",
            collapse_whitespace(prelude),
            body.trim()
        )));
    }
    let selectors: Vec<String> = split_top_level(prelude, ',')
        .into_iter()
        .map(collapse_whitespace)
        .filter(|selector| !selector.is_empty())
        .collect();
    if selectors.is_empty() {
        return None;
    }
    let declarations = split_top_level(body, ';')
        .into_iter()
        .filter_map(|declaration| {
            let colon = scan_top_level(declaration, |_, ch| ch == ':')?;
            let property = declaration[..colon].trim();
            let value = collapse_whitespace(&declaration[colon + 1..]);
            (!property.is_empty() && !value.is_empty()).then(|| (property.to_string(), value))
        })
        .collect();
    Some(CssNode::Style {
        selectors,
        declarations,
    })
}

/// Collapses whitespace runs outside strings to one space and trims.
fn collapse_whitespace(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut pending_space = false;
    for ch in s.trim().chars() {
        if let Some(q) = quote {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == q {
                quote = None;
            }
            continue;
        }
        if ch.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        if ch == '"' || ch == '\'' {
            quote = Some(ch);
        }
        out.push(ch);
    }
    out
}

fn write_minified(nodes: &[CssNode], out: &mut String) {
    for node in nodes {
        match node {
            CssNode::Style {
                selectors,
                declarations,
            } => {
                if declarations.is_empty() {
                    continue;
                }
                out.push_str(&selectors.join(","));
                out.push('{');
                let body: Vec<String> = declarations
                    .iter()
                    .map(|(property, value)| format!("{property}:{value}"))
                    .collect();
                out.push_str(&body.join(";"));
                out.push('}');
            }
            CssNode::Block { prelude, children } => {
                let mut inner = String::new();
                write_minified(children, &mut inner);
                if inner.is_empty() {
                    continue;
                }
                out.push_str(prelude);
                out.push('{');
                out.push_str(&inner);
                out.push('}');
            }
            CssNode::Opaque(text) => out.push_str(&collapse_whitespace(text)),
        }
    }
}

fn write_formatted(nodes: &[CssNode], depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        match node {
            CssNode::Style {
                selectors,
                declarations,
            } => {
                if declarations.is_empty() {
                    continue;
                }
                out.push_str(&indent);
                out.push_str(&selectors.join(&format!(",\n{indent}")));
                out.push_str(" {\n");
                for (property, value) in declarations {
                    out.push_str(&format!("{indent}  {property}: {value};\n"));
                }
                out.push_str(&indent);
                out.push_str("}\n");
            }
            CssNode::Block { prelude, children } => {
                let mut inner = String::new();
                write_formatted(children, depth + 1, &mut inner);
                if inner.is_empty() {
                    continue;
                }
                out.push_str(&format!("{indent}{prelude} {{\n{inner}{indent}}}\n"));
            }
            CssNode::Opaque(text) => {
                out.push_str(&indent);
                out.push_str(text);
                out.push('\n');
            }
        }
    }
}

fn prune_nodes(nodes: &[CssNode], html: &Html) -> (Vec<CssNode>, Vec<CssNode>) {
    let mut kept = Vec::new();
    let mut removed = Vec::new();
    for node in nodes {
        match node {
            CssNode::Style {
                selectors,
                declarations,
            } => {
                let (used, unused): (Vec<String>, Vec<String>) = selectors
                    .iter()
                    .cloned()
                    .partition(|selector| selector_is_used(selector, html));
                if !used.is_empty() {
                    kept.push(CssNode::Style {
                        selectors: used,
                        declarations: declarations.clone(),
                    });
                }
                if !unused.is_empty() {
                    removed.push(CssNode::Style {
                        selectors: unused,
                        declarations: declarations.clone(),
                    });
                }
            }
            CssNode::Block { prelude, children } => {
                let (inner_kept, inner_removed) = prune_nodes(children, html);
                if !inner_kept.is_empty() {
                    kept.push(CssNode::Block {
                        prelude: prelude.clone(),
                        children: inner_kept,
                    });
                }
                if !inner_removed.is_empty() {
                    removed.push(CssNode::Block {
                        prelude: prelude.clone(),
                        children: inner_removed,
                    });
                }
            }
            CssNode::Opaque(_) => kept.push(node.clone()),
        }
    }
    (kept, removed)
}

fn selector_is_used(selector: &str, html: &Html) -> bool {
    match Selector::parse(&static_selector(selector)) {
        Ok(parsed) => html.select(&parsed).next().is_some(),
        Err(_) => true,
    }
}

/// Drops pseudo-elements and state-dependent pseudo-classes so the selector
/// can be evaluated against a static tree.
fn static_selector(selector: &str) -> String {
    static PSEUDO: OnceLock<Regex> = OnceLock::new();
    let pseudo = PSEUDO.get_or_init(|| {
        Regex::new(r"::?([A-Za-z-]+)(\([^)]*\))?").expect("static pseudo selector regex")
    });
    let mut out = String::with_capacity(selector.len());
    let mut last = 0;
    for caps in pseudo.captures_iter(selector) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let is_element = whole.as_str().starts_with("::");
        let name = name.as_str().to_ascii_lowercase();
        if !is_element && STRUCTURAL_PSEUDO_CLASSES.contains(&name.as_str()) {
            continue;
        }
        out.push_str(&selector[last..whole.start()]);
        let standalone = out
            .chars()
            .last()
            .map_or(true, |c| c.is_whitespace() || matches!(c, '>' | '+' | '~' | '('));
        if standalone {
            out.push('*');
        }
        last = whole.end();
    }
    out.push_str(&selector[last..]);
    out
}
