//! Engine settings. Every field has a default so a config file only needs
//! to name what it changes.

use std::path::PathBuf;
use std::time::Duration;

use amplify_core::DEFAULT_EXCLUDED_STYLE_HOSTS;
use serde::{Deserialize, Serialize};

use crate::fetch::FetchSettings;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Parent of the per-job output directories.
    pub output_root: PathBuf,
    pub headless: bool,
    pub port_range: PortRange,
    /// Zero-based index of the first step followed by a validation checkpoint.
    pub validate_from_step: usize,
    pub device: DeviceProfile,
    pub full_page_screenshot: bool,
    /// Second-level DNS labels whose stylesheets are not collected.
    pub excluded_style_hosts: Vec<String>,
    pub content_push_timeout_ms: u64,
    /// Quiet window with no requests in flight that counts as network idle.
    pub network_idle_ms: u64,
    /// `None` waits for the initial page load without limit.
    pub navigation_timeout_ms: Option<u64>,
    pub validator: ValidatorSettings,
    pub stylesheet_fetch: StylesheetFetchConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("output"),
            headless: true,
            port_range: PortRange::default(),
            validate_from_step: 8,
            device: DeviceProfile::default(),
            full_page_screenshot: false,
            excluded_style_hosts: DEFAULT_EXCLUDED_STYLE_HOSTS
                .iter()
                .map(|host| host.to_string())
                .collect(),
            content_push_timeout_ms: 30_000,
            network_idle_ms: 500,
            navigation_timeout_ms: None,
            validator: ValidatorSettings::default(),
            stylesheet_fetch: StylesheetFetchConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn content_push_timeout(&self) -> Duration {
        Duration::from_millis(self.content_push_timeout_ms)
    }

    pub fn network_idle(&self) -> Duration {
        Duration::from_millis(self.network_idle_ms)
    }

    pub fn navigation_timeout(&self) -> Option<Duration> {
        self.navigation_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 5001,
            end: 6000,
        }
    }
}

/// Viewport and user agent the page is emulated with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub device_scale_factor: f64,
    pub mobile: bool,
    pub user_agent: String,
}

impl DeviceProfile {
    pub fn pixel_2() -> Self {
        Self {
            name: "Pixel 2".to_string(),
            width: 411,
            height: 731,
            device_scale_factor: 2.625,
            mobile: true,
            user_agent: "Mozilla/5.0 (Linux; Android 8.0; Pixel 2 Build/OPD3.170816.012) \
                         AppleWebKit/537.36 (KHTML, like Gecko) Chrome/75.0.3765.0 \
                         Mobile Safari/537.36"
                .to_string(),
        }
    }
}

impl Default for DeviceProfile {
    fn default() -> Self {
        Self::pixel_2()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidatorSettings {
    pub program: String,
    /// Arguments placed before the markup is streamed on stdin.
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

impl Default for ValidatorSettings {
    fn default() -> Self {
        Self {
            program: "amphtml-validator".to_string(),
            args: vec!["--format=json".to_string(), "-".to_string()],
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StylesheetFetchConfig {
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_bytes: u64,
}

impl Default for StylesheetFetchConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            max_bytes: 5 * 1024 * 1024,
        }
    }
}

impl StylesheetFetchConfig {
    pub fn settings(&self) -> FetchSettings {
        FetchSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            max_bytes: self.max_bytes,
            ..FetchSettings::default()
        }
    }
}
