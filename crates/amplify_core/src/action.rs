//! Declarative pipeline model: steps made of ordered actions.
//!
//! Pipelines are supplied as JSON. Each action is an object carrying an
//! `actionType` tag plus camelCase parameters, e.g.
//! `{"actionType": "removeAttribute", "selector": "div", "attribute": "onclick"}`.
//! Unknown `actionType` values decode to [`ActionKind::Unsupported`] so older
//! binaries keep running newer pipelines.

use serde::Deserialize;
use thiserror::Error;

use crate::placeholders::Placeholders;

/// `log` label the original pipelines used to mark the canonical-link action.
const CANONICAL_LINK_LABEL: &str = "Add canonical link.";

/// Every action kind the dispatcher knows about, by its `actionType` name.
pub const KNOWN_KINDS: &[&str] = &[
    "setAttribute",
    "removeAttribute",
    "replace",
    "replaceOrInsert",
    "insert",
    "insertAtStart",
    "appendAfter",
    "move",
    "mergeContent",
    "replaceBasedOnAmpErrors",
    "removeDisallowedAttribute",
    "inlineExternalStyles",
    "removeUnusedStyles",
    "customFunc",
];

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(
    tag = "actionType",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum ActionKind {
    SetAttribute {
        selector: String,
        attribute: String,
        #[serde(default)]
        value: String,
    },
    RemoveAttribute {
        selector: String,
        attribute: String,
    },
    Replace {
        selector: String,
        regex: String,
        #[serde(default)]
        replace: String,
    },
    ReplaceOrInsert {
        selector: String,
        regex: String,
        #[serde(default)]
        replace: String,
        #[serde(default)]
        canonical_link: bool,
    },
    Insert {
        selector: String,
        #[serde(default)]
        value: String,
    },
    InsertAtStart {
        selector: String,
        #[serde(default)]
        value: String,
    },
    AppendAfter {
        selector: String,
        #[serde(default)]
        value: String,
    },
    Move {
        selector: String,
        dest_selector: String,
    },
    MergeContent {
        selector: String,
        dest_selector: String,
    },
    ReplaceBasedOnAmpErrors {
        selector: String,
        amp_error_regex: String,
        regex: String,
        #[serde(default)]
        replace: String,
    },
    RemoveDisallowedAttribute,
    InlineExternalStyles {
        selector: String,
        #[serde(default)]
        minify: bool,
    },
    RemoveUnusedStyles {
        selector: String,
        #[serde(default)]
        minify: bool,
        #[serde(default, alias = "outputCSS")]
        output_css: bool,
    },
    CustomFunc {
        #[serde(default)]
        selector: String,
        hook: String,
    },
    /// An `actionType` this build does not implement. Dispatching it is a no-op.
    #[serde(skip)]
    Unsupported { kind: String },
}

impl ActionKind {
    /// The `actionType` name of this kind.
    pub fn name(&self) -> &str {
        match self {
            ActionKind::SetAttribute { .. } => "setAttribute",
            ActionKind::RemoveAttribute { .. } => "removeAttribute",
            ActionKind::Replace { .. } => "replace",
            ActionKind::ReplaceOrInsert { .. } => "replaceOrInsert",
            ActionKind::Insert { .. } => "insert",
            ActionKind::InsertAtStart { .. } => "insertAtStart",
            ActionKind::AppendAfter { .. } => "appendAfter",
            ActionKind::Move { .. } => "move",
            ActionKind::MergeContent { .. } => "mergeContent",
            ActionKind::ReplaceBasedOnAmpErrors { .. } => "replaceBasedOnAmpErrors",
            ActionKind::RemoveDisallowedAttribute => "removeDisallowedAttribute",
            ActionKind::InlineExternalStyles { .. } => "inlineExternalStyles",
            ActionKind::RemoveUnusedStyles { .. } => "removeUnusedStyles",
            ActionKind::CustomFunc { .. } => "customFunc",
            ActionKind::Unsupported { kind } => kind,
        }
    }

    /// Returns a copy with `f` applied to every text parameter.
    fn map_text(&self, f: impl Fn(&str) -> String) -> ActionKind {
        match self {
            ActionKind::SetAttribute {
                selector,
                attribute,
                value,
            } => ActionKind::SetAttribute {
                selector: f(selector),
                attribute: f(attribute),
                value: f(value),
            },
            ActionKind::RemoveAttribute {
                selector,
                attribute,
            } => ActionKind::RemoveAttribute {
                selector: f(selector),
                attribute: f(attribute),
            },
            ActionKind::Replace {
                selector,
                regex,
                replace,
            } => ActionKind::Replace {
                selector: f(selector),
                regex: f(regex),
                replace: f(replace),
            },
            ActionKind::ReplaceOrInsert {
                selector,
                regex,
                replace,
                canonical_link,
            } => ActionKind::ReplaceOrInsert {
                selector: f(selector),
                regex: f(regex),
                replace: f(replace),
                canonical_link: *canonical_link,
            },
            ActionKind::Insert { selector, value } => ActionKind::Insert {
                selector: f(selector),
                value: f(value),
            },
            ActionKind::InsertAtStart { selector, value } => ActionKind::InsertAtStart {
                selector: f(selector),
                value: f(value),
            },
            ActionKind::AppendAfter { selector, value } => ActionKind::AppendAfter {
                selector: f(selector),
                value: f(value),
            },
            ActionKind::Move {
                selector,
                dest_selector,
            } => ActionKind::Move {
                selector: f(selector),
                dest_selector: f(dest_selector),
            },
            ActionKind::MergeContent {
                selector,
                dest_selector,
            } => ActionKind::MergeContent {
                selector: f(selector),
                dest_selector: f(dest_selector),
            },
            ActionKind::ReplaceBasedOnAmpErrors {
                selector,
                amp_error_regex,
                regex,
                replace,
            } => ActionKind::ReplaceBasedOnAmpErrors {
                selector: f(selector),
                amp_error_regex: f(amp_error_regex),
                regex: f(regex),
                replace: f(replace),
            },
            ActionKind::RemoveDisallowedAttribute => ActionKind::RemoveDisallowedAttribute,
            ActionKind::InlineExternalStyles { selector, minify } => {
                ActionKind::InlineExternalStyles {
                    selector: f(selector),
                    minify: *minify,
                }
            }
            ActionKind::RemoveUnusedStyles {
                selector,
                minify,
                output_css,
            } => ActionKind::RemoveUnusedStyles {
                selector: f(selector),
                minify: *minify,
                output_css: *output_css,
            },
            ActionKind::CustomFunc { selector, hook } => ActionKind::CustomFunc {
                selector: f(selector),
                hook: f(hook),
            },
            ActionKind::Unsupported { kind } => ActionKind::Unsupported { kind: kind.clone() },
        }
    }
}

/// One declarative DOM mutation with its optional label and pre-run delay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawAction")]
pub struct Action {
    pub kind: ActionKind,
    /// Human-readable label used in log lines instead of the kind name.
    pub log: Option<String>,
    /// Milliseconds to wait before running the action.
    pub wait_after_loaded: Option<u64>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            log: None,
            wait_after_loaded: None,
        }
    }

    pub fn with_log(mut self, log: impl Into<String>) -> Self {
        self.log = Some(log.into());
        self
    }

    /// Label for log lines: the explicit `log` text, else the kind name.
    pub fn label(&self) -> &str {
        self.log.as_deref().unwrap_or_else(|| self.kind.name())
    }

    /// A copy with every placeholder token substituted. Applied once per
    /// invocation; the stored pipeline is never modified.
    pub fn resolved(&self, placeholders: &Placeholders) -> Action {
        Action {
            kind: self.kind.map_text(|text| placeholders.resolve(text)),
            log: self.log.as_deref().map(|text| placeholders.resolve(text)),
            wait_after_loaded: self.wait_after_loaded,
        }
    }
}

/// A named, ordered group of actions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Step {
    pub name: String,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub skip: bool,
}

impl Step {
    pub fn new(name: impl Into<String>, actions: Vec<Action>) -> Self {
        Self {
            name: name.into(),
            actions,
            skip: false,
        }
    }

    /// Steps without actions or marked `skip` are bypassed entirely.
    pub fn is_runnable(&self) -> bool {
        !self.skip && !self.actions.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum ActionConfigError {
    #[error("invalid or missing parameters for action kind {kind}")]
    InvalidParameters { kind: String },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAction {
    #[serde(default)]
    log: Option<String>,
    #[serde(default)]
    wait_after_loaded: Option<u64>,
    #[serde(flatten)]
    kind: RawKind,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawKind {
    Known(ActionKind),
    Other {
        #[serde(rename = "actionType")]
        action_type: String,
    },
}

impl TryFrom<RawAction> for Action {
    type Error = ActionConfigError;

    fn try_from(raw: RawAction) -> Result<Self, Self::Error> {
        let kind = match raw.kind {
            RawKind::Known(ActionKind::ReplaceOrInsert {
                selector,
                regex,
                replace,
                canonical_link,
            }) => ActionKind::ReplaceOrInsert {
                selector,
                regex,
                replace,
                canonical_link: canonical_link
                    || raw.log.as_deref() == Some(CANONICAL_LINK_LABEL),
            },
            RawKind::Known(kind) => kind,
            // The tag named a real kind but its parameters did not decode.
            RawKind::Other { action_type } if KNOWN_KINDS.contains(&action_type.as_str()) => {
                return Err(ActionConfigError::InvalidParameters { kind: action_type });
            }
            RawKind::Other { action_type } => ActionKind::Unsupported { kind: action_type },
        };
        Ok(Action {
            kind,
            log: raw.log,
            wait_after_loaded: raw.wait_after_loaded,
        })
    }
}

/// Decodes a JSON array of steps.
pub fn parse_pipeline(json: &str) -> Result<Vec<Step>, serde_json::Error> {
    serde_json::from_str(json)
}
