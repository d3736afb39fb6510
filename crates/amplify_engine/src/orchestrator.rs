//! Job orchestration: one conversion from source URL to output artifacts.

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use amplify_core::{Document, JobIdentity, JobStage, Step, ValidationReport};
use engine_logging::{engine_debug, engine_error, engine_info, engine_warn, Stopwatch};
use tokio_util::sync::CancellationToken;

use crate::browser::{BrowserLauncher, ChromiumLauncher, Dimensions, RenderPage, WaitUntil};
use crate::browser_cache::BrowserSessionCache;
use crate::config::EngineConfig;
use crate::error::JobError;
use crate::executor::{ExecutorSettings, JobState, StepExecutor};
use crate::fetch::{Fetcher, ReqwestFetcher};
use crate::hooks::HookRegistry;
use crate::persist::{clear_output_dir, AtomicFileWriter};
use crate::server::LocalServerRegistry;
use crate::styles::StyleCollector;
use crate::types::{
    ConvertRequest, EngineEvent, JobOutcome, JobProgress, NullProgressSink, ProgressSink,
};
use crate::validator::{AmpCliValidator, Validator};

pub const ORIGINAL_HTML: &str = "output-original.html";
pub const FINAL_HTML: &str = "output-final.html";
pub const FINAL_SCREENSHOT: &str = "output-final.png";
pub const FINAL_VALIDATION: &str = "output-final-validation.txt";

/// Owns the shared services (browser cache, mirror servers, validator,
/// hooks) and runs conversion jobs against them. Jobs for different URLs may
/// run concurrently; a second job for a URL or output directory already in
/// use is rejected.
pub struct Converter {
    config: EngineConfig,
    browsers: BrowserSessionCache,
    servers: LocalServerRegistry,
    validator: Arc<dyn Validator>,
    hooks: HookRegistry,
    fetcher: Arc<dyn Fetcher>,
    sink: Arc<dyn ProgressSink>,
    active: Mutex<HashSet<String>>,
}

impl Converter {
    pub fn new(
        config: EngineConfig,
        launcher: Arc<dyn BrowserLauncher>,
        validator: Arc<dyn Validator>,
        hooks: HookRegistry,
        fetcher: Arc<dyn Fetcher>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            browsers: BrowserSessionCache::new(launcher),
            servers: LocalServerRegistry::new(config.port_range),
            config,
            validator,
            hooks,
            fetcher,
            sink,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Chromium, the `amphtml-validator` CLI, the built-in hooks and an HTTP
    /// stylesheet fetcher, all configured from `config`.
    pub fn with_defaults(config: EngineConfig) -> Self {
        let launcher = Arc::new(ChromiumLauncher::new(config.headless, config.network_idle()));
        let validator = Arc::new(AmpCliValidator::new(config.validator.clone()));
        let fetcher = Arc::new(ReqwestFetcher::new(config.stylesheet_fetch.settings()));
        Self::new(
            config,
            launcher,
            validator,
            HookRegistry::with_builtins(),
            fetcher,
            Arc::new(NullProgressSink),
        )
    }

    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Converts one page. The job's mirror server is stopped and its page
    /// closed on every exit path; the shared browser stays open.
    ///
    /// Cancelling `cancel` closes the mirror server at once. Work already in
    /// flight runs to the next cancellation check and its result is dropped.
    pub async fn convert(
        &self,
        request: &ConvertRequest,
        steps: &[Step],
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let identity = JobIdentity::new(&request.url, request.output_override.as_deref())?;
        let _admission = self.admit(&identity)?;
        let url = identity.key().to_string();
        self.emit(&url, JobStage::Initializing);

        engine_info!("Url: {}", identity.placeholders.url);
        engine_info!("Host: {}", identity.placeholders.host);
        engine_info!("Domain: {}", identity.placeholders.domain);

        let run = self.run(&identity, steps, cancel);
        tokio::pin!(run);
        let result = tokio::select! {
            biased;
            result = &mut run => result,
            () = cancel.cancelled() => {
                engine_warn!("Conversion of {url} cancelled");
                if self.servers.stop(&url).await {
                    engine_info!("Local server closed");
                }
                if let Err(err) = run.await {
                    engine_debug!("Abandoned job ended with: {err}");
                }
                Err(JobError::Cancelled)
            }
        };
        if self.servers.stop(&url).await {
            engine_info!("Local server closed");
        }
        self.emit(&url, JobStage::Closed);

        match &result {
            Ok(outcome) => engine_info!(
                "You can find the output files at {}",
                outcome.output_dir.display()
            ),
            Err(err) => engine_error!("Conversion of {url} failed: {err}"),
        }
        result
    }

    /// Stops every mirror server and closes the shared browser.
    pub async fn shutdown(&self) {
        self.servers.shutdown_all().await;
        self.browsers.shutdown().await;
    }

    async fn run(
        &self,
        identity: &JobIdentity,
        steps: &[Step],
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let output_dir = self.config.output_root.join(&identity.output_key);
        clear_output_dir(&output_dir)?;
        engine_info!("Removed previous output in {}", output_dir.display());

        let browser = self.browsers.get().await.map_err(JobError::Launch)?;
        let page = browser
            .new_page(&self.config.device)
            .await
            .map_err(JobError::Launch)?;

        let result = self
            .run_on_page(identity, &output_dir, page.as_ref(), steps, cancel)
            .await;
        if let Err(err) = page.close().await {
            engine_warn!("Closing page failed: {err}");
        }
        result
    }

    async fn run_on_page(
        &self,
        identity: &JobIdentity,
        output_dir: &Path,
        page: &dyn RenderPage,
        steps: &[Step],
        cancel: &CancellationToken,
    ) -> Result<JobOutcome, JobError> {
        let url = identity.key();
        let writer = AtomicFileWriter::new(output_dir.to_path_buf());

        self.emit(url, JobStage::CollectingStyles);
        let watch = Stopwatch::start();
        engine_info!("Step 0: loading page: {url}");
        let subscription = page.subscribe_stylesheets().await.map_err(JobError::Page)?;
        let collector = StyleCollector::new(
            subscription,
            self.fetcher.clone(),
            self.config.excluded_style_hosts.clone(),
        );
        page.goto(
            url,
            WaitUntil::NetworkIdle,
            self.config.navigation_timeout(),
        )
        .await
        .map_err(JobError::Navigation)?;
        let styles = collector.finish().await;

        let original = page.content().await.map_err(JobError::Page)?;
        let dimensions = page.body_dimensions().await.unwrap_or_else(|err| {
            engine_warn!("Could not measure the page body: {err}");
            Dimensions::default()
        });
        engine_info!("Step 0: {:.0} ms", watch.elapsed_ms());
        writer.write(ORIGINAL_HTML, &original)?;
        check_cancelled(cancel)?;

        let port = self
            .servers
            .start(url, output_dir)
            .await
            .map_err(JobError::ServerAllocation)?;
        let mirror = format!("http://127.0.0.1:{port}/{ORIGINAL_HTML}");
        if let Err(err) = page
            .goto(
                &mirror,
                WaitUntil::DomContentLoaded,
                Some(self.config.content_push_timeout()),
            )
            .await
        {
            engine_warn!("Could not load the local mirror: {err}");
        }
        self.emit(url, JobStage::Navigated);

        let mut state = JobState::new(
            url,
            identity.canonical_url(),
            identity.placeholders.clone(),
            Document::parse(&original),
            styles,
        );
        let executor = StepExecutor {
            page,
            validator: self.validator.as_ref(),
            hooks: &self.hooks,
            sink: self.sink.as_ref(),
            cancel,
            settings: ExecutorSettings {
                validate_from_step: self.config.validate_from_step,
                content_push_timeout: self.config.content_push_timeout(),
            },
        };
        executor.run(&mut state, steps).await?;
        check_cancelled(cancel)?;

        self.emit(url, JobStage::Finalizing);
        if self.servers.stop(url).await {
            engine_info!("Local server closed");
        }
        let validation = match self.validator.validate(state.document.html()).await {
            Ok(report) => report,
            Err(err) => {
                engine_warn!("Final validation unavailable: {err}");
                ValidationReport::failed(Vec::new())
            }
        };
        if validation.pass {
            engine_info!("Final markup passed validation");
        } else {
            engine_info!("Final markup has {} validation errors", validation.errors.len());
        }

        writer.write(FINAL_HTML, state.document.html())?;
        match page.screenshot(self.config.full_page_screenshot).await {
            Ok(png) => {
                writer.write_bytes(FINAL_SCREENSHOT, &png)?;
            }
            Err(err) => engine_warn!("Screenshot failed: {err}"),
        }
        writer.write(FINAL_VALIDATION, &validation.to_text())?;

        Ok(JobOutcome {
            url: url.to_string(),
            output_dir: output_dir.to_path_buf(),
            final_html: state.document.into_html(),
            validation,
            dimensions,
            style_reports: state.style_reports,
        })
    }

    /// Reserves the job's URL and output directory until the returned guard
    /// is dropped.
    fn admit(&self, identity: &JobIdentity) -> Result<Admission<'_>, JobError> {
        let url_key = format!("url:{}", identity.key());
        let output_key = format!("output:{}", identity.output_key);
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if active.contains(&url_key) {
            return Err(JobError::AlreadyRunning {
                url: identity.key().to_string(),
            });
        }
        if active.contains(&output_key) {
            return Err(JobError::OutputInUse {
                output: identity.output_key.clone(),
            });
        }
        active.insert(url_key.clone());
        active.insert(output_key.clone());
        Ok(Admission {
            active: &self.active,
            keys: [url_key, output_key],
        })
    }

    fn emit(&self, url: &str, stage: JobStage) {
        self.sink.emit(EngineEvent::Progress(JobProgress {
            url: url.to_string(),
            stage,
        }));
    }
}

/// Holds a job's URL and output directory slots for the duration of the job.
struct Admission<'a> {
    active: &'a Mutex<HashSet<String>>,
    keys: [String; 2],
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        for key in &self.keys {
            active.remove(key);
        }
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        return Err(JobError::Cancelled);
    }
    Ok(())
}
