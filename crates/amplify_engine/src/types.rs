use std::path::PathBuf;

use amplify_core::{JobStage, StyleReport, ValidationReport};
use engine_logging::engine_trace;
use tokio::sync::mpsc;

use crate::browser::Dimensions;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobProgress {
    /// Normalized source URL of the job.
    pub url: String,
    pub stage: JobStage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    Progress(JobProgress),
}

pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Forwards events into a tokio channel so an async consumer can follow a
/// job. Events emitted after the receiver is gone are dropped.
pub struct ChannelProgressSink {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelProgressSink {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// A sink together with the receiving end of its channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl ProgressSink for ChannelProgressSink {
    fn emit(&self, event: EngineEvent) {
        if let Err(err) = self.tx.send(event) {
            engine_trace!("Progress receiver gone, dropping {:?}", err.0);
        }
    }
}

/// Discards every event.
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: EngineEvent) {}
}

/// A conversion request from the outer surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvertRequest {
    pub url: String,
    /// Output directory name to use instead of the one derived from the URL.
    pub output_override: Option<String>,
}

impl ConvertRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            output_override: None,
        }
    }

    pub fn with_output(mut self, name: impl Into<String>) -> Self {
        self.output_override = Some(name.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub url: String,
    pub output_dir: PathBuf,
    pub final_html: String,
    pub validation: ValidationReport,
    pub dimensions: Dimensions,
    /// Reports from `removeUnusedStyles` actions run with `outputCss`,
    /// keyed by the action label.
    pub style_reports: Vec<(String, StyleReport)>,
}
