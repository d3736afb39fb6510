//! The rendering replica: a browser page that shows the job's document.
//!
//! The engine talks to the browser only through these traits. The
//! chromiumoxide implementation lives in [`chromium`]; tests substitute
//! in-memory fakes.

mod chromium;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_logging::engine_warn;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DeviceProfile;
use crate::error::BrowserError;

pub use chromium::ChromiumLauncher;

/// Load condition awaited after navigating or replacing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitUntil {
    DomContentLoaded,
    /// No requests in flight for the configured quiet window.
    NetworkIdle,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// A stylesheet response observed on the page. `body` is `None` when the
/// browser could not provide it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StyleResponse {
    pub url: String,
    pub body: Option<String>,
}

/// Live feed of stylesheet responses. [`ResponseSubscription::drain`] asks
/// the producer to stop and waits for it; dropping the subscription aborts it.
pub struct ResponseSubscription {
    receiver: mpsc::UnboundedReceiver<StyleResponse>,
    producer: Option<JoinHandle<()>>,
    stop: Option<CancellationToken>,
}

impl ResponseSubscription {
    pub fn new(
        receiver: mpsc::UnboundedReceiver<StyleResponse>,
        producer: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            receiver,
            producer,
            stop: None,
        }
    }

    /// Signal the producer watches to flush what it still holds and exit.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.stop = Some(stop);
        self
    }

    /// Stops observing and returns everything received, in arrival order.
    /// A producer that has not exited within `grace` is aborted.
    pub async fn drain(&mut self, grace: Duration) -> Vec<StyleResponse> {
        if let Some(stop) = &self.stop {
            stop.cancel();
        }
        if let Some(mut producer) = self.producer.take() {
            if tokio::time::timeout(grace, &mut producer).await.is_err() {
                engine_warn!(
                    "Stylesheet capture still busy after {} ms, stopping it",
                    grace.as_millis()
                );
                producer.abort();
            }
        }
        self.receiver.close();
        let mut responses = Vec::new();
        while let Ok(response) = self.receiver.try_recv() {
            responses.push(response);
        }
        responses
    }
}

impl Drop for ResponseSubscription {
    fn drop(&mut self) {
        if let Some(stop) = &self.stop {
            stop.cancel();
        }
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

#[async_trait]
pub trait RenderPage: Send + Sync {
    /// Starts collecting stylesheet responses for this page.
    async fn subscribe_stylesheets(&self) -> Result<ResponseSubscription, BrowserError>;

    /// Navigates to `url`. `timeout` of `None` waits without limit.
    async fn goto(
        &self,
        url: &str,
        wait: WaitUntil,
        timeout: Option<Duration>,
    ) -> Result<(), BrowserError>;

    /// Serialized markup of the rendered document.
    async fn content(&self) -> Result<String, BrowserError>;

    /// Replaces the rendered document with `html`.
    async fn set_content(
        &self,
        html: &str,
        wait: WaitUntil,
        timeout: Option<Duration>,
    ) -> Result<(), BrowserError>;

    async fn body_dimensions(&self) -> Result<Dimensions, BrowserError>;

    /// PNG screenshot of the viewport, or of the whole page.
    async fn screenshot(&self, full_page: bool) -> Result<Vec<u8>, BrowserError>;

    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, BrowserError>;

    /// Console output since the previous call.
    fn take_console_messages(&self) -> Vec<String>;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait Browser: Send + Sync {
    async fn new_page(&self, device: &DeviceProfile) -> Result<Box<dyn RenderPage>, BrowserError>;

    /// Cheap liveness probe used before a cached handle is reused.
    async fn is_alive(&self) -> bool;

    async fn close(&self) -> Result<(), BrowserError>;
}

#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    async fn launch(&self) -> Result<Arc<dyn Browser>, BrowserError>;
}
