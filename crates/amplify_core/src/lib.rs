//! Pure conversion logic: the pipeline model, the document snapshot and the
//! action dispatcher. Nothing in this crate performs IO.

mod action;
mod dispatch;
mod document;
mod error;
mod hook;
mod job;
mod placeholders;
mod serialize;
mod styles;
mod validation;

pub use action::{parse_pipeline, Action, ActionConfigError, ActionKind, Step, KNOWN_KINDS};
pub use dispatch::{dispatch, js_replacement, ActionOutcome, DispatchContext};
pub use document::{Document, DomEditor};
pub use error::ActionError;
pub use hook::{apply_hook_edits, collect_hook_targets, HookEdit, HookElement};
pub use job::{normalize_source_url, output_key_for, InvalidUrl, JobIdentity, JobStage};
pub use placeholders::Placeholders;
pub use styles::{
    format_css, is_excluded_host, minify_css, StyleCorpus, StyleReport, Stylesheet,
    DEFAULT_EXCLUDED_STYLE_HOSTS,
};
pub use validation::{
    match_errors, MatchGroups, ValidationError, ValidationReport, DISALLOWED_ATTRIBUTE_PATTERN,
};
