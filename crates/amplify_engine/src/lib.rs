//! Amplify engine: browser, mirror servers, validation and job orchestration.
mod browser;
mod browser_cache;
mod config;
mod error;
mod executor;
mod fetch;
mod hooks;
mod orchestrator;
mod persist;
mod server;
mod styles;
mod types;
mod validator;

pub use browser::{
    Browser, BrowserLauncher, ChromiumLauncher, Dimensions, RenderPage, ResponseSubscription,
    StyleResponse, WaitUntil,
};
pub use browser_cache::BrowserSessionCache;
pub use config::{
    DeviceProfile, EngineConfig, PortRange, StylesheetFetchConfig, ValidatorSettings,
};
pub use error::{BrowserError, JobError, ServerError, ValidationCallError};
pub use executor::{ExecutorSettings, JobState, StepExecutor};
pub use fetch::{FailureKind, FetchError, FetchSettings, Fetcher, ReqwestFetcher};
pub use hooks::{instagram_shortcode, CustomHook, HookRegistry, InstagramEmbedHook, INSTAGRAM_EMBED};
pub use orchestrator::{Converter, FINAL_HTML, FINAL_SCREENSHOT, FINAL_VALIDATION, ORIGINAL_HTML};
pub use persist::{clear_output_dir, ensure_output_dir, AtomicFileWriter, PersistError};
pub use server::LocalServerRegistry;
pub use styles::StyleCollector;
pub use types::{
    ChannelProgressSink, ConvertRequest, EngineEvent, JobOutcome, JobProgress, NullProgressSink,
    ProgressSink,
};
pub use validator::{parse_validator_output, AmpCliValidator, Validator};
