//! The action dispatcher: one pure transition per action kind.
//!
//! `dispatch` never mutates its input. On success it returns the next
//! normalized document and the line logged for the action; on failure the
//! caller keeps the document it already has.

use std::collections::HashMap;

use engine_logging::engine_warn;
use regex::{Regex, RegexBuilder};
use scraper::Html;

use crate::action::ActionKind;
use crate::document::{DomEditor, Document};
use crate::error::ActionError;
use crate::serialize::escape_attribute;
use crate::styles::{escape_style_text, minify_css, StyleCorpus, StyleReport, Stylesheet};
use crate::validation::{match_errors, ValidationError, DISALLOWED_ATTRIBUTE_PATTERN};

const CANONICAL_LINK_SELECTOR: &str = r#"link[rel="canonical"]"#;

/// Parent tag prefix whose children `replace` leaves alone.
const PROTECTED_PARENT_PREFIX: &str = "amp-";

/// Job state an action may read.
#[derive(Debug, Clone, Copy)]
pub struct DispatchContext<'a> {
    /// Target of the canonical link inserted by `replaceOrInsert`.
    pub canonical_url: &'a str,
    /// Errors from the most recent validation checkpoint.
    pub validation_errors: &'a [ValidationError],
    pub styles: &'a StyleCorpus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub document: Document,
    pub message: String,
    /// Set by `removeUnusedStyles` when `outputCss` is requested.
    pub styles: Option<StyleReport>,
}

impl ActionOutcome {
    fn new(document: Document, message: impl Into<String>) -> Self {
        Self {
            document,
            message: message.into(),
            styles: None,
        }
    }
}

/// Applies one declarative action to `document`.
///
/// `customFunc` needs the browser and is resolved by the engine; reaching it
/// here yields [`ActionError::UnknownHook`].
pub fn dispatch(
    document: &Document,
    kind: &ActionKind,
    ctx: &DispatchContext<'_>,
) -> Result<ActionOutcome, ActionError> {
    match kind {
        ActionKind::SetAttribute {
            selector,
            attribute,
            value,
        } => {
            let (document, count) = document.edit(|dom| {
                let ids = dom.select_all(selector)?;
                for &id in &ids {
                    dom.set_attribute(id, attribute, value);
                }
                Ok(ids.len())
            })?;
            Ok(ActionOutcome::new(
                document,
                format!("set {attribute} as {value} on {count} elements"),
            ))
        }
        ActionKind::RemoveAttribute {
            selector,
            attribute,
        } => {
            let (document, count) = document.edit(|dom| {
                let ids = dom.select_all(selector)?;
                for &id in &ids {
                    dom.remove_attribute(id, attribute);
                }
                Ok(ids.len())
            })?;
            Ok(ActionOutcome::new(
                document,
                format!("remove {attribute} from {count} elements"),
            ))
        }
        ActionKind::Replace {
            selector,
            regex,
            replace,
        } => {
            let pattern = compile(regex, true)?;
            let replacement = js_replacement(replace, pattern.captures_len() - 1);
            let (document, count) = document.edit(|dom| {
                let mut count = 0;
                for id in dom.select_all(selector)? {
                    let protected = dom
                        .parent_tag_name(id)
                        .is_some_and(|parent| parent.starts_with(PROTECTED_PARENT_PREFIX));
                    if protected {
                        continue;
                    }
                    let inner = dom.inner_html(id);
                    let found = pattern.find_iter(&inner).count();
                    if found > 0 {
                        count += found;
                        let replaced = pattern.replace_all(&inner, replacement.as_str());
                        dom.set_inner_html(id, replaced.into_owned());
                    }
                }
                Ok(count)
            })?;
            Ok(ActionOutcome::new(document, format!("{count} replaced")))
        }
        ActionKind::ReplaceOrInsert {
            selector,
            regex,
            replace,
            canonical_link,
        } => replace_or_insert(document, selector, regex, replace, *canonical_link, ctx),
        ActionKind::Insert { selector, value } => {
            let (document, ()) = document.edit(|dom| {
                let id = first_match(dom, selector)?;
                dom.append_html(id, value);
                Ok(())
            })?;
            Ok(ActionOutcome::new(document, format!("Inserted in {selector}")))
        }
        ActionKind::InsertAtStart { selector, value } => {
            let (document, ()) = document.edit(|dom| {
                let id = first_match(dom, selector)?;
                dom.prepend_html(id, value);
                Ok(())
            })?;
            Ok(ActionOutcome::new(document, format!("Inserted in {selector}")))
        }
        ActionKind::AppendAfter { selector, value } => {
            let (document, ()) = document.edit(|dom| {
                let id = first_match(dom, selector)?;
                dom.insert_after(id, value);
                Ok(())
            })?;
            Ok(ActionOutcome::new(document, "Dom appended"))
        }
        ActionKind::Move {
            selector,
            dest_selector,
        } => {
            let (document, count) = document.edit(|dom| {
                let ids = all_matches(dom, selector)?;
                let dest = destination(dom, dest_selector)?;
                let mut moved = String::new();
                for &id in &ids {
                    moved.push_str(&dom.outer_html(id));
                    moved.push('\n');
                }
                for &id in &ids {
                    dom.remove(id);
                }
                dom.append_html(dest, &moved);
                Ok(ids.len())
            })?;
            Ok(ActionOutcome::new(document, format!("Moved {count} elements")))
        }
        ActionKind::MergeContent {
            selector,
            dest_selector,
        } => {
            let (document, count) = document.edit(|dom| {
                let ids = all_matches(dom, selector)?;
                let dest = destination(dom, dest_selector)?;
                let mut merged = String::new();
                for &id in &ids {
                    merged.push_str(&dom.inner_html(id));
                    merged.push('\n');
                }
                let first = ids[0];
                dom.set_inner_html(first, merged);
                let block = dom.outer_html(first);
                for &id in &ids {
                    dom.remove(id);
                }
                dom.append_html(dest, &block);
                Ok(ids.len())
            })?;
            Ok(ActionOutcome::new(document, format!("Merged {count} elements")))
        }
        ActionKind::ReplaceBasedOnAmpErrors {
            selector,
            amp_error_regex,
            regex,
            replace,
        } => replace_based_on_errors(document, selector, amp_error_regex, regex, replace, ctx),
        ActionKind::RemoveDisallowedAttribute => remove_disallowed_attributes(document, ctx),
        ActionKind::InlineExternalStyles { selector, minify } => {
            let css = if *minify {
                minify_css(ctx.styles.aggregate())
            } else {
                ctx.styles.aggregate().to_string()
            };
            let (document, ()) = document.edit(|dom| {
                let id = first_match(dom, selector)?;
                dom.append_html(id, &format!("<style>{}</style>", escape_style_text(&css)));
                Ok(())
            })?;
            Ok(ActionOutcome::new(document, "styles appended"))
        }
        ActionKind::RemoveUnusedStyles {
            selector,
            minify,
            output_css,
        } => remove_unused_styles(document, selector, *minify, *output_css),
        ActionKind::CustomFunc { hook, .. } => Err(ActionError::UnknownHook { name: hook.clone() }),
        ActionKind::Unsupported { kind } => {
            engine_warn!("{kind} is not supported");
            Ok(ActionOutcome::new(
                document.clone(),
                format!("{kind} is not supported"),
            ))
        }
    }
}

fn replace_or_insert(
    document: &Document,
    selector: &str,
    regex: &str,
    replace: &str,
    canonical_link: bool,
    ctx: &DispatchContext<'_>,
) -> Result<ActionOutcome, ActionError> {
    let pattern = compile(regex, true)?;
    let (document, message) = document.edit(|dom| {
        let id = first_match(dom, selector)?;
        let inner = dom.inner_html(id);
        let matched = pattern.is_match(&inner);
        if canonical_link {
            if dom.select_first(CANONICAL_LINK_SELECTOR)?.is_some() {
                return Ok("canonical link already present".to_string());
            }
            dom.append_html(
                id,
                &format!(
                    " <link rel=\"canonical\" href=\"{}\">",
                    escape_attribute(ctx.canonical_url)
                ),
            );
        } else if matched {
            let replaced = pattern.replace_all(
                &inner,
                js_replacement(replace, pattern.captures_len() - 1).as_str(),
            );
            dom.set_inner_html(id, replaced.into_owned());
        } else {
            dom.append_html(id, replace);
        }
        Ok(if matched {
            "Replaced".to_string()
        } else {
            format!("Inserted in {selector}")
        })
    })?;
    Ok(ActionOutcome::new(document, message))
}

fn replace_based_on_errors(
    document: &Document,
    selector: &str,
    error_pattern: &str,
    regex: &str,
    replace: &str,
    ctx: &DispatchContext<'_>,
) -> Result<ActionOutcome, ActionError> {
    if selector.trim().is_empty() {
        return Err(ActionError::NoMatch {
            selector: selector.to_string(),
        });
    }
    let matches = match_errors(ctx.validation_errors, error_pattern)?;
    let mut compiled: HashMap<String, Regex> = HashMap::new();
    let mut values: Vec<String> = Vec::new();

    let (document, count) = document.edit(|dom| {
        let ids = all_matches(dom, selector)?;
        let mut count = 0;
        for &id in &ids {
            let original = dom.inner_html(id);
            let mut inner = original.clone();
            for groups in &matches {
                let mut pattern = regex.to_string();
                for index in 1..=9 {
                    if let Some(value) = groups.get(index).filter(|value| !value.is_empty()) {
                        pattern = pattern.replace(&format!("${index}"), value);
                        if !values.iter().any(|seen| seen == value) {
                            values.push(value.to_string());
                        }
                    }
                }
                if !compiled.contains_key(&pattern) {
                    let built = compile(&pattern, false)?;
                    compiled.insert(pattern.clone(), built);
                }
                let Some(target) = compiled.get(&pattern) else {
                    continue;
                };
                if target.is_match(&inner) {
                    count += 1;
                    let replacement = js_replacement(replace, target.captures_len() - 1);
                    inner = target.replace(&inner, replacement.as_str()).into_owned();
                }
            }
            if inner != original {
                dom.set_inner_html(id, inner);
            }
        }
        Ok(count)
    })?;
    Ok(ActionOutcome::new(
        document,
        format!("{count} replaced: {}", values.join(", ")),
    ))
}

fn remove_disallowed_attributes(
    document: &Document,
    ctx: &DispatchContext<'_>,
) -> Result<ActionOutcome, ActionError> {
    let matches = match_errors(ctx.validation_errors, DISALLOWED_ATTRIBUTE_PATTERN)?;
    let mut attributes: Vec<String> = Vec::new();
    let (document, count) = document.edit(|dom| {
        let mut count = 0;
        for groups in &matches {
            let (Some(attribute), Some(tag)) = (groups.get(1), groups.get(3)) else {
                continue;
            };
            if attribute.is_empty() || tag.is_empty() {
                continue;
            }
            if !attributes.iter().any(|seen| seen == attribute) {
                attributes.push(attribute.to_string());
            }
            let Ok(ids) = dom.select_all(tag) else {
                continue;
            };
            for id in ids {
                if dom.remove_attribute(id, attribute) {
                    count += 1;
                }
            }
        }
        Ok(count)
    })?;
    Ok(ActionOutcome::new(
        document,
        format!("{count} removed: {}", attributes.join(", ")),
    ))
}

fn remove_unused_styles(
    document: &Document,
    selector: &str,
    minify: bool,
    output_css: bool,
) -> Result<ActionOutcome, ActionError> {
    let (document, (old_size, optimized, unused)) = document.edit(|dom| {
        let ids = all_matches(dom, selector)?;
        let body = body_markup(dom)?;
        let mut old_size = 0;
        let mut optimized = String::new();
        let mut unused = String::new();
        for id in ids {
            let original = dom.inner_html(id);
            old_size += original.len();
            let (kept, removed) = Stylesheet::parse(&original).prune(&body);
            let styles = if minify {
                kept.minified()
            } else {
                kept.formatted()
            };
            if !removed.is_empty() {
                if !unused.is_empty() {
                    unused.push('\n');
                }
                unused.push_str(&removed.formatted());
            }
            optimized.push_str("\n\n");
            optimized.push_str(&styles);
            dom.set_inner_html(id, escape_style_text(&styles));
        }
        Ok((old_size, optimized, unused))
    })?;

    let new_size = optimized.len();
    let ratio = if old_size == 0 {
        0
    } else {
        ((old_size as f64 - new_size as f64) / old_size as f64 * 100.0).round() as i64
    };
    let mut outcome = ActionOutcome::new(
        document,
        format!("Removed {ratio}% styles. ({old_size} -> {new_size} bytes)"),
    );
    if output_css {
        outcome.styles = Some(StyleReport {
            optimized_styles: optimized,
            unused_styles: unused,
        });
    }
    Ok(outcome)
}

/// The body alone under an empty head, so head-only rules count as unused.
fn body_markup(dom: &DomEditor<'_>) -> Result<Html, ActionError> {
    let body = match dom.select_first("body")? {
        Some(id) => dom.outer_html(id),
        None => String::new(),
    };
    Ok(Html::parse_document(&format!(
        "<html><head></head>{body}</html>"
    )))
}

fn first_match(dom: &DomEditor<'_>, selector: &str) -> Result<ego_tree::NodeId, ActionError> {
    dom.select_first(selector)?
        .ok_or_else(|| ActionError::NoMatch {
            selector: selector.to_string(),
        })
}

fn all_matches(dom: &DomEditor<'_>, selector: &str) -> Result<Vec<ego_tree::NodeId>, ActionError> {
    let ids = dom.select_all(selector)?;
    if ids.is_empty() {
        return Err(ActionError::NoMatch {
            selector: selector.to_string(),
        });
    }
    Ok(ids)
}

fn destination(dom: &DomEditor<'_>, selector: &str) -> Result<ego_tree::NodeId, ActionError> {
    dom.select_first(selector)?
        .ok_or_else(|| ActionError::NoDestination {
            selector: selector.to_string(),
        })
}

fn compile(pattern: &str, case_insensitive: bool) -> Result<Regex, ActionError> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|err| ActionError::InvalidRegex {
            pattern: pattern.to_string(),
            message: err.to_string(),
        })
}

/// Rewrites a replacement written with `$&`, `$1` and `$<name>` references
/// into `regex` crate syntax for a pattern with `groups` capture groups.
/// A two-digit reference past the last group falls back to one digit
/// followed by a literal digit. Unrecognized `$` sequences stay literal.
pub fn js_replacement(replace: &str, groups: usize) -> String {
    let mut out = String::with_capacity(replace.len());
    let mut chars = replace.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '$' {
            out.push(ch);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push_str("$$");
            }
            Some('&') => {
                chars.next();
                out.push_str("${0}");
            }
            Some(first) if first.is_ascii_digit() => {
                chars.next();
                let tens = first.to_digit(10).unwrap_or(0) as usize;
                let two_digit = chars
                    .peek()
                    .and_then(|second| second.to_digit(10))
                    .map(|units| tens * 10 + units as usize)
                    .filter(|index| (1..=groups).contains(index));
                if let Some(index) = two_digit {
                    chars.next();
                    out.push_str(&format!("${{{index}}}"));
                } else if (1..=groups).contains(&tens) {
                    out.push_str(&format!("${{{tens}}}"));
                } else {
                    out.push_str("$$");
                    out.push(first);
                }
            }
            Some('<') => {
                let rest: String = chars.clone().skip(1).take_while(|c| *c != '>').collect();
                let closed = chars.clone().skip(1 + rest.chars().count()).next() == Some('>');
                if closed && !rest.is_empty() {
                    for _ in 0..rest.chars().count() + 2 {
                        chars.next();
                    }
                    out.push_str(&format!("${{{rest}}}"));
                } else {
                    out.push_str("$$");
                }
            }
            _ => out.push_str("$$"),
        }
    }
    out
}
