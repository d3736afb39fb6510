//! Runs a pipeline of steps against one job's document and browser page.
//!
//! The in-process [`Document`] is authoritative. After every successful
//! action the new markup is committed to the page (DOM-ready wait); after
//! every step it is pushed again with a network-idle wait and, from the
//! configured step onward, validated. A failing action is logged and the
//! previous document kept.

use std::time::Duration;

use amplify_core::{
    apply_hook_edits, collect_hook_targets, dispatch, Action, ActionError, ActionKind,
    ActionOutcome, DispatchContext, Document, JobStage, Placeholders, Step, StyleCorpus,
    StyleReport, ValidationError,
};
use engine_logging::{engine_debug, engine_info, engine_warn, Stopwatch};
use tokio_util::sync::CancellationToken;

use crate::browser::{RenderPage, WaitUntil};
use crate::error::JobError;
use crate::hooks::HookRegistry;
use crate::types::{EngineEvent, JobProgress, ProgressSink};
use crate::validator::Validator;

/// Mutable state of one job while its steps run.
#[derive(Debug, Clone)]
pub struct JobState {
    /// Normalized source URL, used in progress events.
    pub url: String,
    pub canonical_url: String,
    pub placeholders: Placeholders,
    pub document: Document,
    pub styles: StyleCorpus,
    /// Errors from the most recent validation checkpoint.
    pub validation_errors: Vec<ValidationError>,
    pub style_reports: Vec<(String, StyleReport)>,
}

impl JobState {
    pub fn new(
        url: impl Into<String>,
        canonical_url: impl Into<String>,
        placeholders: Placeholders,
        document: Document,
        styles: StyleCorpus,
    ) -> Self {
        Self {
            url: url.into(),
            canonical_url: canonical_url.into(),
            placeholders,
            document,
            styles,
            validation_errors: Vec::new(),
            style_reports: Vec::new(),
        }
    }
}

/// Settings the executor reads from the engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorSettings {
    pub validate_from_step: usize,
    pub content_push_timeout: Duration,
}

pub struct StepExecutor<'a> {
    pub page: &'a dyn RenderPage,
    pub validator: &'a dyn Validator,
    pub hooks: &'a HookRegistry,
    pub sink: &'a dyn ProgressSink,
    pub cancel: &'a CancellationToken,
    pub settings: ExecutorSettings,
}

impl StepExecutor<'_> {
    /// Runs every runnable step in order. Only cancellation ends the run early.
    pub async fn run(&self, state: &mut JobState, steps: &[Step]) -> Result<(), JobError> {
        for (index, step) in steps.iter().enumerate() {
            if !step.is_runnable() {
                continue;
            }
            self.run_step(state, index, step).await?;
        }
        Ok(())
    }

    async fn run_step(
        &self,
        state: &mut JobState,
        index: usize,
        step: &Step,
    ) -> Result<(), JobError> {
        let watch = Stopwatch::start();
        engine_info!("Step {}: {}", index + 1, step.name);

        for (action_index, action) in step.actions.iter().enumerate() {
            self.check_cancelled()?;
            self.emit(
                state,
                JobStage::RunningSteps {
                    step: index,
                    action: action_index,
                },
            );
            self.run_action(state, action).await?;
        }

        self.check_cancelled()?;
        self.push(state.document.html(), WaitUntil::NetworkIdle).await;
        for message in self.page.take_console_messages() {
            engine_debug!("console: {message}");
        }

        if index >= self.settings.validate_from_step {
            state.validation_errors = self.checkpoint(state.document.html()).await;
        }
        engine_info!("Step {}: {:.0} ms", index + 1, watch.elapsed_ms());
        Ok(())
    }

    async fn run_action(&self, state: &mut JobState, action: &Action) -> Result<(), JobError> {
        let action = action.resolved(&state.placeholders);
        if let Some(delay) = action.wait_after_loaded.filter(|ms| *ms > 0) {
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.check_cancelled()?;
        }

        let label = action.label().to_string();
        match self.apply(state, &action).await {
            Ok(outcome) => {
                engine_info!("{label}: {}", outcome.message);
                if let Some(report) = outcome.styles {
                    state.style_reports.push((label, report));
                }
                state.document = outcome.document;
                self.push(state.document.html(), WaitUntil::DomContentLoaded)
                    .await;
            }
            Err(err) => engine_warn!("{label}: Error: {err}"),
        }
        Ok(())
    }

    async fn apply(&self, state: &JobState, action: &Action) -> Result<ActionOutcome, ActionError> {
        if let ActionKind::CustomFunc { selector, hook } = &action.kind {
            let hook_impl = self
                .hooks
                .get(hook)
                .ok_or_else(|| ActionError::UnknownHook { name: hook.clone() })?;
            let mut elements = collect_hook_targets(&state.document, selector)?;
            let message = hook_impl
                .run(action, &mut elements, self.page, state.document.html())
                .await?;
            return Ok(ActionOutcome {
                document: apply_hook_edits(&state.document, &elements),
                message,
                styles: None,
            });
        }

        let ctx = DispatchContext {
            canonical_url: &state.canonical_url,
            validation_errors: &state.validation_errors,
            styles: &state.styles,
        };
        dispatch(&state.document, &action.kind, &ctx)
    }

    /// Commits `html` to the page. A failed push leaves the page stale but
    /// does not affect the document.
    async fn push(&self, html: &str, wait: WaitUntil) {
        if let Err(err) = self
            .page
            .set_content(html, wait, Some(self.settings.content_push_timeout))
            .await
        {
            engine_warn!("Updating page content failed: {err}");
        }
    }

    /// Validates `html`; an unreachable validator counts as no known errors.
    async fn checkpoint(&self, html: &str) -> Vec<ValidationError> {
        match self.validator.validate(html).await {
            Ok(report) if report.pass => {
                engine_info!("Validation passed");
                Vec::new()
            }
            Ok(report) => {
                for error in &report.errors {
                    engine_debug!("{error}");
                }
                engine_info!("{} validation errors", report.errors.len());
                report.errors
            }
            Err(err) => {
                engine_warn!("Validator unavailable: {err}");
                Vec::new()
            }
        }
    }

    fn check_cancelled(&self) -> Result<(), JobError> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        Ok(())
    }

    fn emit(&self, state: &JobState, stage: JobStage) {
        self.sink.emit(EngineEvent::Progress(JobProgress {
            url: state.url.clone(),
            stage,
        }));
    }
}
