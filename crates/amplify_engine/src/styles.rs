//! Stylesheet capture during a job's initial page load.

use std::sync::Arc;
use std::time::Duration;

use amplify_core::{is_excluded_host, StyleCorpus};
use engine_logging::{engine_debug, engine_info, engine_warn};
use url::Url;

use crate::browser::{ResponseSubscription, StyleResponse};
use crate::fetch::Fetcher;

/// How long the capture may take to hand over bodies it is still reading.
const CAPTURE_GRACE: Duration = Duration::from_secs(5);

/// Observes stylesheet responses until [`StyleCollector::finish`] is called.
pub struct StyleCollector {
    subscription: ResponseSubscription,
    fetcher: Arc<dyn Fetcher>,
    excluded_hosts: Vec<String>,
}

impl StyleCollector {
    pub fn new(
        subscription: ResponseSubscription,
        fetcher: Arc<dyn Fetcher>,
        excluded_hosts: Vec<String>,
    ) -> Self {
        Self {
            subscription,
            fetcher,
            excluded_hosts,
        }
    }

    /// Stops observing and builds the corpus from what arrived. Bodies the
    /// browser could not hand over are fetched directly; failures are logged
    /// and skipped.
    pub async fn finish(mut self) -> StyleCorpus {
        let responses = self.subscription.drain(CAPTURE_GRACE).await;
        let mut corpus = StyleCorpus::default();
        for StyleResponse { url, body } in responses {
            if self.is_excluded(&url) {
                engine_debug!("Skipping stylesheet from excluded host: {url}");
                continue;
            }
            if corpus.by_url().contains_key(&url) {
                continue;
            }
            let text = match body {
                Some(text) => text,
                None => match self.fetcher.fetch_text(&url).await {
                    Ok(text) => text,
                    Err(err) => {
                        engine_warn!("Stylesheet {url} unavailable: {err}");
                        continue;
                    }
                },
            };
            corpus.record(url, text);
        }
        engine_info!(
            "Collected {} stylesheets ({} bytes)",
            corpus.len(),
            corpus.aggregate().len()
        );
        corpus
    }

    fn is_excluded(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|parsed| parsed.host_str().map(str::to_string))
            .is_some_and(|host| is_excluded_host(&host, &self.excluded_hosts))
    }
}
