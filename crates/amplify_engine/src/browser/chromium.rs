//! Headless Chromium over the DevTools protocol (chromiumoxide).

use std::collections::HashSet;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser as CdpBrowser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{
    EventLoadingFailed, EventLoadingFinished, EventRequestWillBeSent, EventResponseReceived,
    GetResponseBodyParams, RequestId, ResourceType,
};
use chromiumoxide::cdp::browser_protocol::page::CaptureScreenshotFormat;
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::page::{Page, ScreenshotParams};
use engine_logging::{engine_debug, engine_info, engine_warn};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    Browser, BrowserLauncher, Dimensions, RenderPage, ResponseSubscription, StyleResponse,
    WaitUntil,
};
use crate::config::DeviceProfile;
use crate::error::BrowserError;

const IDLE_POLL: Duration = Duration::from_millis(50);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

const BODY_DIMENSIONS_JS: &str = "({ \
    width: document.body ? document.body.scrollWidth : 0, \
    height: document.body ? document.body.scrollHeight : 0 })";

/// Launches a local Chromium; headful when `headless` is false.
#[derive(Debug, Clone)]
pub struct ChromiumLauncher {
    headless: bool,
    network_idle: Duration,
}

impl ChromiumLauncher {
    pub fn new(headless: bool, network_idle: Duration) -> Self {
        Self {
            headless,
            network_idle,
        }
    }
}

#[async_trait]
impl BrowserLauncher for ChromiumLauncher {
    async fn launch(&self) -> Result<Arc<dyn Browser>, BrowserError> {
        engine_info!(
            "Launching {} Chromium",
            if self.headless { "headless" } else { "headful" }
        );
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu");
        if !self.headless {
            builder = builder.with_head();
        }
        let config = builder.build().map_err(BrowserError::Launch)?;

        let (browser, mut handler) = CdpBrowser::launch(config)
            .await
            .map_err(|err| BrowserError::Launch(err.to_string()))?;
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    engine_debug!("CDP handler event loop ended");
                    break;
                }
            }
        });

        Ok(Arc::new(ChromiumBrowser {
            browser: tokio::sync::Mutex::new(browser),
            handler_task,
            network_idle: self.network_idle,
        }))
    }
}

struct ChromiumBrowser {
    browser: tokio::sync::Mutex<CdpBrowser>,
    handler_task: JoinHandle<()>,
    network_idle: Duration,
}

#[async_trait]
impl Browser for ChromiumBrowser {
    async fn new_page(&self, device: &DeviceProfile) -> Result<Box<dyn RenderPage>, BrowserError> {
        if self.handler_task.is_finished() {
            return Err(BrowserError::Closed);
        }
        let page = {
            let browser = self.browser.lock().await;
            browser.new_page("about:blank").await.map_err(protocol)?
        };

        let metrics = SetDeviceMetricsOverrideParams::builder()
            .width(i64::from(device.width))
            .height(i64::from(device.height))
            .device_scale_factor(device.device_scale_factor)
            .mobile(device.mobile)
            .build()
            .map_err(BrowserError::Protocol)?;
        page.execute(metrics).await.map_err(protocol)?;
        page.set_user_agent(device.user_agent.clone())
            .await
            .map_err(protocol)?;

        ChromiumPage::attach(page, self.network_idle)
            .await
            .map(|page| Box::new(page) as Box<dyn RenderPage>)
    }

    async fn is_alive(&self) -> bool {
        if self.handler_task.is_finished() {
            return false;
        }
        let browser = self.browser.lock().await;
        matches!(
            tokio::time::timeout(HEALTH_CHECK_TIMEOUT, browser.version()).await,
            Ok(Ok(_))
        )
    }

    async fn close(&self) -> Result<(), BrowserError> {
        let mut browser = self.browser.lock().await;
        let result = browser.close().await.map(|_| ()).map_err(protocol);
        self.handler_task.abort();
        result
    }
}

#[derive(Debug)]
struct NetworkState {
    in_flight: HashSet<String>,
    last_change: Instant,
}

/// Counts in-flight requests so callers can wait for a quiet network.
#[derive(Debug)]
struct NetworkTracker {
    state: Mutex<NetworkState>,
}

impl NetworkTracker {
    fn new() -> Self {
        Self {
            state: Mutex::new(NetworkState {
                in_flight: HashSet::new(),
                last_change: Instant::now(),
            }),
        }
    }

    fn update(&self, request_id: &str, started: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if started {
            state.in_flight.insert(request_id.to_string());
        } else {
            state.in_flight.remove(request_id);
        }
        state.last_change = Instant::now();
    }

    fn touch(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.last_change = Instant::now();
    }

    fn is_idle(&self, quiet: Duration) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.in_flight.is_empty() && state.last_change.elapsed() >= quiet
    }

    async fn wait_idle(&self, quiet: Duration) {
        while !self.is_idle(quiet) {
            tokio::time::sleep(IDLE_POLL).await;
        }
    }
}

struct ChromiumPage {
    page: Page,
    network: Arc<NetworkTracker>,
    console: Arc<Mutex<Vec<String>>>,
    listeners: Vec<JoinHandle<()>>,
    network_idle: Duration,
}

impl ChromiumPage {
    async fn attach(page: Page, network_idle: Duration) -> Result<Self, BrowserError> {
        let network = Arc::new(NetworkTracker::new());
        let console = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = Vec::new();

        let mut requests = page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(protocol)?;
        let tracker = network.clone();
        listeners.push(tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                tracker.update(event.request_id.inner(), true);
            }
        }));

        let mut finished = page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(protocol)?;
        let tracker = network.clone();
        listeners.push(tokio::spawn(async move {
            while let Some(event) = finished.next().await {
                tracker.update(event.request_id.inner(), false);
            }
        }));

        let mut failed = page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(protocol)?;
        let tracker = network.clone();
        listeners.push(tokio::spawn(async move {
            while let Some(event) = failed.next().await {
                tracker.update(event.request_id.inner(), false);
            }
        }));

        let mut console_events = page
            .event_listener::<EventConsoleApiCalled>()
            .await
            .map_err(protocol)?;
        let sink = console.clone();
        listeners.push(tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let text = event
                    .args
                    .iter()
                    .map(|arg| match (&arg.value, &arg.description) {
                        (Some(serde_json::Value::String(text)), _) => text.clone(),
                        (Some(value), _) => value.to_string(),
                        (None, Some(description)) => description.clone(),
                        (None, None) => String::new(),
                    })
                    .collect::<Vec<_>>()
                    .join(" ");
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(format!("{:?}: {text}", event.r#type));
            }
        }));

        Ok(Self {
            page,
            network,
            console,
            listeners,
            network_idle,
        })
    }

    async fn settle(&self, wait: WaitUntil) {
        if wait == WaitUntil::NetworkIdle {
            self.network.wait_idle(self.network_idle).await;
        }
    }
}

async fn with_deadline<T>(
    operation: &str,
    timeout: Option<Duration>,
    future: impl Future<Output = Result<T, BrowserError>>,
) -> Result<T, BrowserError> {
    match timeout {
        None => future.await,
        Some(limit) => tokio::time::timeout(limit, future)
            .await
            .map_err(|_| BrowserError::Timeout {
                operation: operation.to_string(),
                after_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
            })?,
    }
}

#[async_trait]
impl RenderPage for ChromiumPage {
    async fn subscribe_stylesheets(&self) -> Result<ResponseSubscription, BrowserError> {
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(protocol)?;
        let mut finished = self
            .page
            .event_listener::<EventLoadingFinished>()
            .await
            .map_err(protocol)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let page = self.page.clone();
        let stopped = stop.clone();

        let producer = tokio::spawn(async move {
            let mut sheets = StylesheetTracker::default();
            loop {
                // Buffered events are handled before the stop signal.
                let ready = tokio::select! {
                    biased;
                    Some(event) = responses.next() => sheets.on_response(
                        event.request_id.clone(),
                        &event.response.url,
                        event.r#type == ResourceType::Stylesheet,
                    ),
                    Some(event) = finished.next() => sheets.on_finished(event.request_id.clone()),
                    () = stopped.cancelled() => break,
                    else => break,
                };
                let Some((request_id, url)) = ready else {
                    continue;
                };
                let body = response_body(&page, request_id, &url).await;
                if tx.send(StyleResponse { url, body }).is_err() {
                    return;
                }
            }
            for url in sheets.into_unfinished() {
                if tx.send(StyleResponse { url, body: None }).is_err() {
                    return;
                }
            }
        });

        Ok(ResponseSubscription::new(rx, Some(producer)).with_stop(stop))
    }

    async fn goto(
        &self,
        url: &str,
        wait: WaitUntil,
        timeout: Option<Duration>,
    ) -> Result<(), BrowserError> {
        with_deadline("navigation", timeout, async {
            self.network.touch();
            self.page
                .goto(url)
                .await
                .map_err(|err| BrowserError::Navigation(format!("{url}: {err}")))?;
            self.settle(wait).await;
            Ok(())
        })
        .await
    }

    async fn content(&self) -> Result<String, BrowserError> {
        self.page.content().await.map_err(protocol)
    }

    async fn set_content(
        &self,
        html: &str,
        wait: WaitUntil,
        timeout: Option<Duration>,
    ) -> Result<(), BrowserError> {
        with_deadline("content push", timeout, async {
            self.network.touch();
            self.page.set_content(html).await.map_err(protocol)?;
            self.settle(wait).await;
            Ok(())
        })
        .await
    }

    async fn body_dimensions(&self) -> Result<Dimensions, BrowserError> {
        let value = self.evaluate(BODY_DIMENSIONS_JS).await?;
        serde_json::from_value(value).map_err(|err| BrowserError::Protocol(err.to_string()))
    }

    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, BrowserError> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(full_page)
                    .build(),
            )
            .await
            .map_err(protocol)
    }

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BrowserError> {
        let result = self.page.evaluate(expression).await.map_err(protocol)?;
        Ok(result.value().cloned().unwrap_or(serde_json::Value::Null))
    }

    fn take_console_messages(&self) -> Vec<String> {
        std::mem::take(&mut *self.console.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn close(&self) -> Result<(), BrowserError> {
        for listener in &self.listeners {
            listener.abort();
        }
        if let Err(err) = self.page.clone().close().await {
            engine_warn!("Closing page failed: {err}");
        }
        Ok(())
    }
}

impl Drop for ChromiumPage {
    fn drop(&mut self) {
        for listener in &self.listeners {
            listener.abort();
        }
    }
}

async fn response_body(page: &Page, request_id: RequestId, url: &str) -> Option<String> {
    match page.execute(GetResponseBodyParams::new(request_id)).await {
        Ok(response) if !response.result.base64_encoded => Some(response.result.body.clone()),
        Ok(_) => None,
        Err(err) => {
            engine_debug!("No body for stylesheet {url}: {err}");
            None
        }
    }
}

/// Pairs stylesheet responses with their load completion. The two arrive on
/// separate event streams, so either may be seen first.
#[derive(Debug)]
struct StylesheetTracker<K> {
    /// Stylesheets whose body is still loading, in arrival order.
    loading: Vec<(K, String)>,
    /// Requests that finished before their response event was seen.
    finished_early: HashSet<K>,
}

impl<K> Default for StylesheetTracker<K> {
    fn default() -> Self {
        Self {
            loading: Vec::new(),
            finished_early: HashSet::new(),
        }
    }
}

impl<K: Eq + Hash> StylesheetTracker<K> {
    /// Returns the stylesheet when its body is ready to be read.
    fn on_response(&mut self, id: K, url: &str, stylesheet: bool) -> Option<(K, String)> {
        let already_finished = self.finished_early.remove(&id);
        if !stylesheet {
            return None;
        }
        if already_finished {
            return Some((id, url.to_string()));
        }
        self.loading.push((id, url.to_string()));
        None
    }

    fn on_finished(&mut self, id: K) -> Option<(K, String)> {
        match self.loading.iter().position(|(loading, _)| *loading == id) {
            Some(index) => Some(self.loading.remove(index)),
            None => {
                self.finished_early.insert(id);
                None
            }
        }
    }

    /// URLs of stylesheets still loading, for the fetch fallback.
    fn into_unfinished(self) -> Vec<String> {
        self.loading.into_iter().map(|(_, url)| url).collect()
    }
}

fn protocol(err: impl std::fmt::Display) -> BrowserError {
    BrowserError::Protocol(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::StylesheetTracker;

    #[test]
    fn stylesheets_pair_with_their_completion_in_either_order() {
        let mut sheets = StylesheetTracker::default();

        assert_eq!(sheets.on_response(1, "https://a.example/a.css", true), None);
        assert_eq!(
            sheets.on_finished(1),
            Some((1, "https://a.example/a.css".to_string()))
        );

        assert_eq!(sheets.on_finished(2), None);
        assert_eq!(
            sheets.on_response(2, "https://a.example/b.css", true),
            Some((2, "https://a.example/b.css".to_string()))
        );
        assert!(sheets.into_unfinished().is_empty());
    }

    #[test]
    fn other_resources_are_ignored() {
        let mut sheets = StylesheetTracker::default();
        assert_eq!(sheets.on_finished(7), None);
        assert_eq!(sheets.on_response(7, "https://a.example/app.js", false), None);
        assert_eq!(sheets.on_response(8, "https://a.example/logo.png", false), None);
        assert_eq!(sheets.on_finished(8), None);
        assert!(sheets.into_unfinished().is_empty());
    }

    #[test]
    fn sheets_still_loading_are_handed_to_the_fallback_in_order() {
        let mut sheets = StylesheetTracker::default();
        sheets.on_response(1, "https://a.example/slow.css", true);
        sheets.on_response(2, "https://a.example/fast.css", true);
        sheets.on_response(3, "https://a.example/late.css", true);
        sheets.on_finished(2);

        assert_eq!(
            sheets.into_unfinished(),
            vec![
                "https://a.example/slow.css".to_string(),
                "https://a.example/late.css".to_string(),
            ]
        );
    }
}
