//! In-memory browser, validator and sink used by the engine tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use amplify_core::{JobStage, ValidationError, ValidationReport};
use amplify_engine::{
    Browser, BrowserError, BrowserLauncher, DeviceProfile, Dimensions, EngineEvent, JobProgress,
    ProgressSink, RenderPage, ResponseSubscription, StyleResponse, ValidationCallError, Validator,
    WaitUntil,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// What a fake page serves when it navigates to the source URL.
#[derive(Debug, Clone, Default)]
pub struct PageScript {
    pub source_html: String,
    pub stylesheets: Vec<StyleResponse>,
    pub console: Vec<String>,
    pub fail_navigation: bool,
    /// How long each content push takes.
    pub push_delay: Option<Duration>,
}

/// Everything the fake pages observed, shared with the test.
#[derive(Debug, Default)]
pub struct PageLog {
    pub gotos: Vec<(String, WaitUntil)>,
    pub pushes: Vec<(String, WaitUntil)>,
    /// HTTP status the mirror answered with when the page navigated to it.
    pub mirror_status: Option<u16>,
    pub pages_opened: usize,
    pub pages_closed: usize,
}

pub struct FakePage {
    script: PageScript,
    log: Arc<Mutex<PageLog>>,
    content: Mutex<String>,
    console: Mutex<Vec<String>>,
}

impl FakePage {
    pub fn new(script: PageScript, log: Arc<Mutex<PageLog>>) -> Self {
        let console = script.console.clone();
        Self {
            script,
            log,
            content: Mutex::new(String::new()),
            console: Mutex::new(console),
        }
    }
}

#[async_trait]
impl RenderPage for FakePage {
    async fn subscribe_stylesheets(&self) -> Result<ResponseSubscription, BrowserError> {
        let (tx, rx) = mpsc::unbounded_channel();
        for response in &self.script.stylesheets {
            let _ = tx.send(response.clone());
        }
        Ok(ResponseSubscription::new(rx, None))
    }

    async fn goto(
        &self,
        url: &str,
        wait: WaitUntil,
        _timeout: Option<Duration>,
    ) -> Result<(), BrowserError> {
        self.log
            .lock()
            .unwrap()
            .gotos
            .push((url.to_string(), wait));
        if url.starts_with("http://127.0.0.1:") {
            let status = reqwest::get(url)
                .await
                .map(|response| response.status().as_u16())
                .map_err(|err| BrowserError::Navigation(err.to_string()))?;
            self.log.lock().unwrap().mirror_status = Some(status);
            return Ok(());
        }
        if self.script.fail_navigation {
            return Err(BrowserError::Navigation(format!("{url}: net::ERR_NAME_NOT_RESOLVED")));
        }
        *self.content.lock().unwrap() = self.script.source_html.clone();
        Ok(())
    }

    async fn content(&self) -> Result<String, BrowserError> {
        Ok(self.content.lock().unwrap().clone())
    }

    async fn set_content(
        &self,
        html: &str,
        wait: WaitUntil,
        _timeout: Option<Duration>,
    ) -> Result<(), BrowserError> {
        self.log
            .lock()
            .unwrap()
            .pushes
            .push((html.to_string(), wait));
        if let Some(delay) = self.script.push_delay {
            tokio::time::sleep(delay).await;
        }
        *self.content.lock().unwrap() = html.to_string();
        Ok(())
    }

    async fn body_dimensions(&self) -> Result<Dimensions, BrowserError> {
        Ok(Dimensions {
            width: 411,
            height: 1200,
        })
    }

    async fn screenshot(&self, _full_page: bool) -> Result<Vec<u8>, BrowserError> {
        Ok(b"\x89PNG fake".to_vec())
    }

    async fn evaluate(&self, _expression: &str) -> Result<serde_json::Value, BrowserError> {
        Ok(serde_json::Value::Null)
    }

    fn take_console_messages(&self) -> Vec<String> {
        std::mem::take(&mut *self.console.lock().unwrap())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.log.lock().unwrap().pages_closed += 1;
        Ok(())
    }
}

pub struct FakeBrowser {
    script: PageScript,
    log: Arc<Mutex<PageLog>>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl Browser for FakeBrowser {
    async fn new_page(&self, _device: &DeviceProfile) -> Result<Box<dyn RenderPage>, BrowserError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(BrowserError::Closed);
        }
        self.log.lock().unwrap().pages_opened += 1;
        Ok(Box::new(FakePage::new(self.script.clone(), self.log.clone())))
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.alive.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Launches [`FakeBrowser`]s. Every launch gets a fresh liveness flag,
/// exposed through [`FakeLauncher::kill_current`].
pub struct FakeLauncher {
    pub script: PageScript,
    pub log: Arc<Mutex<PageLog>>,
    launches: AtomicUsize,
    pub fail_launch: AtomicBool,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl FakeLauncher {
    pub fn new(script: PageScript) -> Self {
        Self {
            script,
            log: Arc::new(Mutex::new(PageLog::default())),
            launches: AtomicUsize::new(0),
            fail_launch: AtomicBool::new(false),
            current: Mutex::new(None),
        }
    }

    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Simulates the most recently launched browser process dying.
    pub fn kill_current(&self) {
        if let Some(alive) = self.current.lock().unwrap().as_ref() {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, BrowserError> {
        if self.fail_launch.load(Ordering::SeqCst) {
            return Err(BrowserError::Launch("chrome not found".to_string()));
        }
        self.launches.fetch_add(1, Ordering::SeqCst);
        let alive = Arc::new(AtomicBool::new(true));
        *self.current.lock().unwrap() = Some(alive.clone());
        Ok(Arc::new(FakeBrowser {
            script: self.script.clone(),
            log: self.log.clone(),
            alive,
        }))
    }
}

/// Reports `error` whenever the markup contains `needle`.
#[derive(Debug, Clone)]
pub struct Rule {
    pub needle: String,
    pub error: ValidationError,
}

#[derive(Default)]
pub struct FakeValidator {
    pub rules: Vec<Rule>,
    pub unavailable: bool,
    pub seen: Mutex<Vec<String>>,
}

impl FakeValidator {
    pub fn with_rule(needle: &str, line: u32, message: &str) -> Self {
        Self {
            rules: vec![Rule {
                needle: needle.to_string(),
                error: ValidationError::new(line, 0, message),
            }],
            ..Self::default()
        }
    }

    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[async_trait]
impl Validator for FakeValidator {
    async fn validate(&self, html: &str) -> Result<ValidationReport, ValidationCallError> {
        self.seen.lock().unwrap().push(html.to_string());
        if self.unavailable {
            return Err(ValidationCallError::Timeout { after_ms: 0 });
        }
        let errors: Vec<ValidationError> = self
            .rules
            .iter()
            .filter(|rule| html.contains(&rule.needle))
            .map(|rule| rule.error.clone())
            .collect();
        if errors.is_empty() {
            Ok(ValidationReport::passed())
        } else {
            Ok(ValidationReport::failed(errors))
        }
    }
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn stages(&self) -> Vec<JobStage> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|event| match event {
                EngineEvent::Progress(JobProgress { stage, .. }) => *stage,
            })
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}
