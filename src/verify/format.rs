//! Application id format validation.
//!
//! A valid label is `PREFIX_<digits>_<suffix>`: the configured prefix, an
//! underscore, one or more ASCII digits, an underscore, and at least one
//! more character. Validation is pure.

use crate::config::FormatConfig;
use crate::error::{Error, Result};
use regex::Regex;
use std::fmt;
use thiserror::Error;

/// A label that does not follow the application id format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("label {label:?} does not match {expected}")]
pub struct FormatError {
    /// The rejected label.
    pub label: String,
    /// Human-readable expected pattern.
    pub expected: String,
}

/// An application id parsed from a claimant's label.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApplicationId {
    canonical: String,
    number: String,
    suffix: String,
}

impl ApplicationId {
    /// The id as it appears on the roster (prefix normalised to the
    /// configured literal).
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// The digit run.
    #[must_use]
    pub fn number(&self) -> &str {
        &self.number
    }

    /// The free-form suffix.
    #[must_use]
    pub fn suffix(&self) -> &str {
        &self.suffix
    }
}

impl fmt::Display for ApplicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Validator for the configured label format.
#[derive(Debug, Clone)]
pub struct LabelFormat {
    prefix: String,
    pattern: Regex,
}

impl LabelFormat {
    /// Build a validator.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the prefix is empty or contains `_`.
    pub fn new(prefix: &str, case_sensitive: bool) -> Result<Self> {
        if prefix.is_empty() || prefix.contains('_') {
            return Err(Error::Config(format!("invalid label prefix {prefix:?}")));
        }
        let flags = if case_sensitive { "" } else { "(?i)" };
        let source = format!(
            r"\A(?:{flags}{})_([0-9]+)_(.+)\z",
            regex::escape(prefix)
        );
        let pattern = Regex::new(&source).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            prefix: prefix.to_string(),
            pattern,
        })
    }

    /// Build a validator from configuration.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the prefix is invalid.
    pub fn from_config(config: &FormatConfig) -> Result<Self> {
        Self::new(&config.prefix, config.case_sensitive)
    }

    /// The configured prefix literal.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Validate a label.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` for any label not of the form
    /// `PREFIX_<digits>_<suffix>`.
    pub fn validate(&self, label: &str) -> std::result::Result<ApplicationId, FormatError> {
        let captures = self.pattern.captures(label).ok_or_else(|| FormatError {
            label: label.to_string(),
            expected: format!("{}_<number>_<name>", self.prefix),
        })?;

        let number = captures.get(1).map_or("", |m| m.as_str()).to_string();
        let suffix = captures.get(2).map_or("", |m| m.as_str()).to_string();
        Ok(ApplicationId {
            canonical: format!("{}_{number}_{suffix}", self.prefix),
            number,
            suffix,
        })
    }
}
