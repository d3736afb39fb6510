//! Validator results and regex extraction of violation parameters.

use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ActionError;

/// Pattern `removeDisallowedAttribute` applies to validator messages.
/// Group 1 is the attribute, group 3 the offending tag.
pub const DISALLOWED_ATTRIBUTE_PATTERN: &str =
    r"The attribute '([^']*)' may not appear in tag '([\w-]* > )*([\w-]*)'";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub spec_url: Option<String>,
}

impl ValidationError {
    pub fn new(line: u32, column: u32, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
            spec_url: None,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}, col {}: {}", self.line, self.column, self.message)?;
        if let Some(url) = self.spec_url.as_deref().filter(|url| !url.is_empty()) {
            write!(f, " (see {url})")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub pass: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationReport {
    pub fn passed() -> Self {
        Self {
            pass: true,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<ValidationError>) -> Self {
        Self {
            pass: false,
            errors,
        }
    }

    /// One formatted error per line; empty when the markup passed.
    pub fn to_text(&self) -> String {
        self.errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Capture groups of one regex match. Index 0 is the whole match; groups that
/// did not participate are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchGroups(pub Vec<Option<String>>);

impl MatchGroups {
    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).and_then(|group| group.as_deref())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Applies `pattern` to every error message and returns the distinct match
/// tuples in the order first seen.
pub fn match_errors(
    errors: &[ValidationError],
    pattern: &str,
) -> Result<Vec<MatchGroups>, ActionError> {
    let regex = Regex::new(pattern).map_err(|err| ActionError::InvalidRegex {
        pattern: pattern.to_string(),
        message: err.to_string(),
    })?;
    let mut found: Vec<MatchGroups> = Vec::new();
    for error in errors {
        let Some(caps) = regex.captures(&error.message) else {
            continue;
        };
        let groups = MatchGroups(
            caps.iter()
                .map(|group| group.map(|m| m.as_str().to_string()))
                .collect(),
        );
        if !found.contains(&groups) {
            found.push(groups);
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::{match_errors, ValidationError, ValidationReport, DISALLOWED_ATTRIBUTE_PATTERN};

    #[test]
    fn formats_errors_with_optional_spec_link() {
        let mut error = ValidationError::new(3, 14, "The tag 'img' is disallowed.");
        assert_eq!(error.to_string(), "line 3, col 14: The tag 'img' is disallowed.");
        error.spec_url = Some("https://amp.dev/img".to_string());
        assert_eq!(
            error.to_string(),
            "line 3, col 14: The tag 'img' is disallowed. (see https://amp.dev/img)"
        );
    }

    #[test]
    fn duplicate_matches_collapse() {
        let errors = vec![
            ValidationError::new(1, 1, "The attribute 'onclick' may not appear in tag 'div'."),
            ValidationError::new(9, 2, "The attribute 'onclick' may not appear in tag 'div'."),
            ValidationError::new(4, 4, "The attribute 'style' may not appear in tag 'body > span'."),
        ];
        let found = match_errors(&errors, DISALLOWED_ATTRIBUTE_PATTERN).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].get(1), Some("onclick"));
        assert_eq!(found[0].get(3), Some("div"));
        assert_eq!(found[1].get(1), Some("style"));
        assert_eq!(found[1].get(3), Some("span"));
    }

    #[test]
    fn report_text_joins_lines() {
        let report = ValidationReport::failed(vec![
            ValidationError::new(1, 0, "a"),
            ValidationError::new(2, 0, "b"),
        ]);
        assert_eq!(report.to_text(), "line 1, col 0: a\nline 2, col 0: b");
        assert_eq!(ValidationReport::passed().to_text(), "");
    }
}
