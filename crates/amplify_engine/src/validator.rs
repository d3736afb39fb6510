use std::process::Stdio;
use std::time::Duration;

use amplify_core::{ValidationError, ValidationReport};
use async_trait::async_trait;
use engine_logging::engine_debug;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::ValidatorSettings;
use crate::error::ValidationCallError;

#[async_trait]
pub trait Validator: Send + Sync {
    async fn validate(&self, html: &str) -> Result<ValidationReport, ValidationCallError>;
}

/// Runs the `amphtml-validator` command line tool, streaming the markup on
/// stdin and reading its JSON report from stdout.
#[derive(Debug, Clone)]
pub struct AmpCliValidator {
    settings: ValidatorSettings,
}

impl AmpCliValidator {
    pub fn new(settings: ValidatorSettings) -> Self {
        Self { settings }
    }

    async fn run(&self, html: &str) -> Result<String, ValidationCallError> {
        let mut child = Command::new(&self.settings.program)
            .args(&self.settings.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ValidationCallError::Spawn {
                program: self.settings.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(html.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        // The tool exits non-zero for failing markup; the report is still on stdout.
        if !output.status.success() {
            engine_debug!(
                "{} exited with {}: {}",
                self.settings.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Validator for AmpCliValidator {
    async fn validate(&self, html: &str) -> Result<ValidationReport, ValidationCallError> {
        let limit = Duration::from_millis(self.settings.timeout_ms);
        let stdout = tokio::time::timeout(limit, self.run(html))
            .await
            .map_err(|_| ValidationCallError::Timeout {
                after_ms: self.settings.timeout_ms,
            })??;
        parse_validator_output(&stdout)
    }
}

#[derive(Debug, Deserialize)]
struct CliResult {
    status: String,
    #[serde(default)]
    errors: Vec<CliError>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliError {
    #[serde(default)]
    line: u32,
    #[serde(default)]
    col: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    spec_url: Option<String>,
}

/// Parses the `--format=json` report: an object keyed by input name whose
/// first entry carries `status` and `errors`.
pub fn parse_validator_output(stdout: &str) -> Result<ValidationReport, ValidationCallError> {
    let root: serde_json::Map<String, serde_json::Value> = serde_json::from_str(stdout.trim())
        .map_err(|err| ValidationCallError::Parse(err.to_string()))?;
    let first = root
        .into_iter()
        .next()
        .map(|(_, value)| value)
        .ok_or_else(|| ValidationCallError::Parse("empty validator report".to_string()))?;
    let result: CliResult =
        serde_json::from_value(first).map_err(|err| ValidationCallError::Parse(err.to_string()))?;

    if result.status.eq_ignore_ascii_case("PASS") {
        return Ok(ValidationReport::passed());
    }
    let errors = result
        .errors
        .into_iter()
        .map(|err| ValidationError {
            line: err.line,
            column: err.col,
            message: err.message,
            spec_url: err.spec_url.filter(|url| !url.is_empty()),
        })
        .collect();
    Ok(ValidationReport::failed(errors))
}

#[cfg(test)]
mod tests {
    use super::parse_validator_output;
    use crate::error::ValidationCallError;

    #[test]
    fn pass_status_has_no_errors() {
        let report = parse_validator_output(r#"{"-": {"status": "PASS", "errors": []}}"#).unwrap();
        assert!(report.pass);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn empty_object_is_a_parse_error() {
        let err = parse_validator_output("{}").unwrap_err();
        assert!(matches!(err, ValidationCallError::Parse(_)));
    }
}
