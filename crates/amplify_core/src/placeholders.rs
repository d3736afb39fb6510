use std::sync::OnceLock;

use regex::{Captures, Regex};
use url::Url;

/// Job-derived values substituted for `$URL`, `$HOST` and `$DOMAIN` in action fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholders {
    /// Origin plus path, percent-encoded, without query or fragment.
    pub url: String,
    /// Scheme, host and optional port, e.g. `https://example.com:8080`.
    pub host: String,
    /// Host and optional port, e.g. `example.com:8080`.
    pub domain: String,
}

fn token_regex() -> &'static Regex {
    static TOKEN: OnceLock<Regex> = OnceLock::new();
    TOKEN.get_or_init(|| Regex::new(r"\$(URL|HOST|DOMAIN)").expect("static placeholder regex"))
}

impl Placeholders {
    pub fn from_url(url: &Url) -> Self {
        let domain = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => String::new(),
        };
        let host = format!("{}://{}", url.scheme(), domain);
        Self {
            url: format!("{}{}", url.origin().ascii_serialization(), url.path()),
            host,
            domain,
        }
    }

    /// Substitutes every token in one left-to-right pass. Substituted values are
    /// never rescanned, so a value that itself contains `$URL` stays literal.
    pub fn resolve(&self, input: &str) -> String {
        if !input.contains('$') {
            return input.to_string();
        }
        token_regex()
            .replace_all(input, |caps: &Captures| match &caps[1] {
                "URL" => self.url.clone(),
                "HOST" => self.host.clone(),
                _ => self.domain.clone(),
            })
            .into_owned()
    }
}
