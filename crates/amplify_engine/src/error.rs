use std::io;

use amplify_core::InvalidUrl;
use thiserror::Error;

use crate::persist::PersistError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrowserError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("devtools protocol error: {0}")]
    Protocol(String),
    #[error("{operation} timed out after {after_ms} ms")]
    Timeout { operation: String, after_ms: u64 },
    #[error("browser is closed")]
    Closed,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("no free port in {start}..={end}")]
    Allocation { start: u16, end: u16 },
    #[error("local server io error: {0}")]
    Io(#[from] io::Error),
}

/// The validator could not be consulted. Callers treat this as "no errors
/// known" for the checkpoint.
#[derive(Debug, Error)]
pub enum ValidationCallError {
    #[error("failed to start validator {program:?}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("validator io error: {0}")]
    Io(#[from] io::Error),
    #[error("validator did not answer within {after_ms} ms")]
    Timeout { after_ms: u64 },
    #[error("unreadable validator output: {0}")]
    Parse(String),
}

/// Failures that end a single job. None of them stop the process.
#[derive(Debug, Error)]
pub enum JobError {
    #[error(transparent)]
    InvalidUrl(#[from] InvalidUrl),
    #[error("a conversion of {url} is already running")]
    AlreadyRunning { url: String },
    #[error("output directory {output} is in use by another conversion")]
    OutputInUse { output: String },
    #[error("browser unavailable: {0}")]
    Launch(#[source] BrowserError),
    #[error("initial navigation failed: {0}")]
    Navigation(#[source] BrowserError),
    #[error("could not start local server: {0}")]
    ServerAllocation(#[source] ServerError),
    #[error("could not write artifacts: {0}")]
    Persist(#[from] PersistError),
    #[error("job cancelled")]
    Cancelled,
    #[error("browser page error: {0}")]
    Page(#[source] BrowserError),
}
