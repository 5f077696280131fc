//! Error types for node definitions
//!
//! Configuration problems are returned as `Err` from [`crate::define_node`].
//! Input validation problems are data: they travel inside a
//! [`ValidationResult`] and never abort the caller.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// A malformed static node definition
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid node id '{0}': only lowercase letters, digits and hyphens are allowed")]
    InvalidId(String),

    #[error("Invalid node version '{0}': expected MAJOR.MINOR.PATCH")]
    InvalidVersion(String),

    #[error("Node '{0}' has no execute function")]
    MissingExecute(String),

    #[error("Node name must not be empty")]
    MissingName,

    #[error("Duplicate {kind} field '{field}'")]
    DuplicateField { kind: &'static str, field: String },

    #[error("Invalid pattern for field '{field}': {source}")]
    InvalidPattern {
        field: String,
        #[source]
        source: regex::Error,
    },

    #[error("Default value for field '{field}' fails its own validation ({} error(s))", .errors.len())]
    InvalidDefault {
        field: String,
        errors: Vec<ValidationError>,
    },
}

/// A single field-level validation failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
    pub code: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Accumulated validation outcome
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    pub fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    pub fn ok() -> Self {
        Self::from_errors(Vec::new())
    }

    /// Errors reported for one field
    pub fn errors_for<'a>(&'a self, field: &'a str) -> impl Iterator<Item = &'a ValidationError> {
        self.errors.iter().filter(move |e| e.field == field)
    }

    pub fn codes(&self) -> Vec<&str> {
        self.errors.iter().map(|e| e.code.as_str()).collect()
    }
}

/// Runtime failure of a node's execute function
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ExecutionError {
    pub message: String,
    /// Diagnostic payload (inputs, upstream error, validation errors ...)
    #[serde(default)]
    pub context: Value,
}

impl ExecutionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            context: Value::Null,
        }
    }

    pub fn with_context(mut self, context: Value) -> Self {
        self.context = context;
        self
    }
}
