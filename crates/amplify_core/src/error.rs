use thiserror::Error;

/// A single action's precondition was not met. Never fatal to a step or a job.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ActionError {
    #[error("No matched element(s): {selector}")]
    NoMatch { selector: String },
    #[error("No matched element: {selector}")]
    NoDestination { selector: String },
    #[error("invalid selector {selector:?}: {message}")]
    InvalidSelector { selector: String, message: String },
    #[error("invalid regex {pattern:?}: {message}")]
    InvalidRegex { pattern: String, message: String },
    #[error("no custom hook registered as {name:?}")]
    UnknownHook { name: String },
    #[error("custom hook failed: {0}")]
    Hook(String),
}
