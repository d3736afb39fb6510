use std::sync::Arc;

use engine_logging::{engine_info, engine_warn};
use tokio::sync::Mutex;

use crate::browser::{Browser, BrowserLauncher};
use crate::error::BrowserError;

/// Process-wide browser handle, launched lazily and shared by every job.
///
/// A handle that fails its health check is dropped and replaced. A failed
/// launch is not cached, so the next caller tries again.
pub struct BrowserSessionCache {
    launcher: Arc<dyn BrowserLauncher>,
    slot: Mutex<Option<Arc<dyn Browser>>>,
}

impl BrowserSessionCache {
    pub fn new(launcher: Arc<dyn BrowserLauncher>) -> Self {
        Self {
            launcher,
            slot: Mutex::new(None),
        }
    }

    pub async fn get(&self) -> Result<Arc<dyn Browser>, BrowserError> {
        let mut slot = self.slot.lock().await;
        if let Some(browser) = slot.as_ref() {
            if browser.is_alive().await {
                return Ok(browser.clone());
            }
            engine_warn!("Cached browser is unresponsive, relaunching");
            *slot = None;
        }
        let browser = self.launcher.launch().await?;
        *slot = Some(browser.clone());
        Ok(browser)
    }

    /// Closes the cached browser, if any. A later `get` launches a new one.
    pub async fn shutdown(&self) {
        let browser = self.slot.lock().await.take();
        if let Some(browser) = browser {
            engine_info!("Closing browser");
            if let Err(err) = browser.close().await {
                engine_warn!("Browser close failed: {err}");
            }
        }
    }
}
