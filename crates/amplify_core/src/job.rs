use std::fmt;

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::placeholders::Placeholders;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid source url {url:?}: {message}")]
pub struct InvalidUrl {
    pub url: String,
    pub message: String,
}

/// Everything derived from a job's source URL before any IO happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobIdentity {
    /// Normalized source URL; also the key for admission and the mirror server.
    pub url: Url,
    pub placeholders: Placeholders,
    /// Name of the job's directory under the output root.
    pub output_key: String,
}

impl JobIdentity {
    /// Normalizes `raw` (adding `https://` when no scheme is given) and derives
    /// the output key, unless `output_override` names one explicitly.
    pub fn new(raw: &str, output_override: Option<&str>) -> Result<Self, InvalidUrl> {
        let url = normalize_source_url(raw)?;
        let placeholders = Placeholders::from_url(&url);
        let output_key = match output_override.map(str::trim).filter(|o| !o.is_empty()) {
            Some(name) => sanitize_component(name),
            None => output_key_for(&url),
        };
        Ok(Self {
            url,
            placeholders,
            output_key,
        })
    }

    pub fn key(&self) -> &str {
        self.url.as_str()
    }

    /// The link target used by canonical-link insertion.
    pub fn canonical_url(&self) -> &str {
        &self.placeholders.url
    }
}

pub fn normalize_source_url(raw: &str) -> Result<Url, InvalidUrl> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let with_scheme = if lower.starts_with("http://") || lower.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&with_scheme).map_err(|err| InvalidUrl {
        url: raw.to_string(),
        message: err.to_string(),
    })?;
    if url.host_str().map_or(true, str::is_empty) {
        return Err(InvalidUrl {
            url: raw.to_string(),
            message: "missing host".to_string(),
        });
    }
    Ok(url)
}

/// Last non-empty path segment, or `{host}--{short_hash(url)}` for root URLs.
pub fn output_key_for(url: &Url) -> String {
    let last_segment = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .map(sanitize_component)
        .filter(|s| s != "untitled");
    match last_segment {
        Some(segment) => segment,
        None => {
            let host = sanitize_component(url.host_str().unwrap_or("untitled"));
            format!("{host}--{}", short_hash(url.as_str()))
        }
    }
}

fn sanitize_component(input: &str) -> String {
    let mut cleaned: String = input
        .chars()
        .map(|c| if is_forbidden(c) { '_' } else { c })
        .collect();
    cleaned = cleaned.trim_matches(&['_', ' ', '.'][..]).to_string();
    if cleaned.is_empty() {
        cleaned = "untitled".to_string();
    }
    if cleaned.len() > 80 {
        let mut end = 80;
        while !cleaned.is_char_boundary(end) {
            end -= 1;
        }
        cleaned.truncate(end);
    }
    cleaned
}

fn is_forbidden(c: char) -> bool {
    matches!(c,
        '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | '%' | '\0'..='\u{1F}'
    )
}

fn short_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(8);
    for byte in digest.iter().take(4) {
        use std::fmt::Write;
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

/// Lifecycle of one conversion job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStage {
    Initializing,
    CollectingStyles,
    Navigated,
    /// Zero-based step and action indexes.
    RunningSteps { step: usize, action: usize },
    Finalizing,
    Closed,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStage::Initializing => write!(f, "initializing"),
            JobStage::CollectingStyles => write!(f, "collecting styles"),
            JobStage::Navigated => write!(f, "navigated"),
            JobStage::RunningSteps { step, action } => {
                write!(f, "step {} action {}", step + 1, action + 1)
            }
            JobStage::Finalizing => write!(f, "finalizing"),
            JobStage::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{output_key_for, JobIdentity};
    use url::Url;

    #[test]
    fn scheme_less_urls_default_to_https() {
        let job = JobIdentity::new("example.com/articles/42", None).unwrap();
        assert_eq!(job.url.as_str(), "https://example.com/articles/42");
        assert_eq!(job.output_key, "42");
    }

    #[test]
    fn trailing_slash_uses_last_non_empty_segment() {
        let url = Url::parse("https://example.com/news/story-1/").unwrap();
        assert_eq!(output_key_for(&url), "story-1");
    }

    #[test]
    fn root_url_key_is_host_and_stable_hash() {
        let url = Url::parse("https://example.com/").unwrap();
        let first = output_key_for(&url);
        assert!(first.starts_with("example.com--"));
        assert_eq!(first.len(), "example.com--".len() + 8);
        assert_eq!(first, output_key_for(&url));
    }

    #[test]
    fn override_is_sanitized() {
        let job = JobIdentity::new("https://example.com/a", Some("../evil/name")).unwrap();
        assert_eq!(job.output_key, "evil_name");
    }

    #[test]
    fn rejects_unparseable_urls() {
        assert!(JobIdentity::new("http://", None).is_err());
    }
}
