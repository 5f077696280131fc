//! Validation rules and preset validators
//!
//! Rules are pure predicates over a JSON value. A rule whose kind does not
//! apply to the value's type (e.g. `min` on a string) passes.

use crate::error::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Predicate used by [`ValidationRule::Custom`]
pub type CustomValidator = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// A single validation rule attached to an input field
#[derive(Clone)]
pub enum ValidationRule {
    Min { value: f64, message: String },
    Max { value: f64, message: String },
    MinLength { value: usize, message: String },
    MaxLength { value: usize, message: String },
    Pattern { value: String, message: String },
    Custom { validator: CustomValidator, message: String },
}

impl ValidationRule {
    pub fn min(value: f64, message: impl Into<String>) -> Self {
        Self::Min {
            value,
            message: message.into(),
        }
    }

    pub fn max(value: f64, message: impl Into<String>) -> Self {
        Self::Max {
            value,
            message: message.into(),
        }
    }

    pub fn min_length(value: usize, message: impl Into<String>) -> Self {
        Self::MinLength {
            value,
            message: message.into(),
        }
    }

    pub fn max_length(value: usize, message: impl Into<String>) -> Self {
        Self::MaxLength {
            value,
            message: message.into(),
        }
    }

    pub fn pattern(value: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Pattern {
            value: value.into(),
            message: message.into(),
        }
    }

    pub fn custom<F>(message: impl Into<String>, validator: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::Custom {
            validator: Arc::new(validator),
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Min { message, .. }
            | Self::Max { message, .. }
            | Self::MinLength { message, .. }
            | Self::MaxLength { message, .. }
            | Self::Pattern { message, .. }
            | Self::Custom { message, .. } => message,
        }
    }

    /// Error code reported when this rule fails
    pub fn code(&self) -> &'static str {
        match self {
            Self::Min { .. } => "RULE_MIN",
            Self::Max { .. } => "RULE_MAX",
            Self::MinLength { .. } => "RULE_MIN_LENGTH",
            Self::MaxLength { .. } => "RULE_MAX_LENGTH",
            Self::Pattern { .. } => "RULE_PATTERN",
            Self::Custom { .. } => "RULE_CUSTOM",
        }
    }

    /// Evaluate the rule
    ///
    /// `compiled` must hold the compiled regex for a `Pattern` rule; a pattern
    /// rule without one fails closed.
    pub(crate) fn check(
        &self,
        field: &str,
        value: &Value,
        compiled: Option<&Regex>,
    ) -> Option<ValidationError> {
        let passed = match self {
            Self::Min { value: min, .. } => value.as_f64().map_or(true, |n| n >= *min),
            Self::Max { value: max, .. } => value.as_f64().map_or(true, |n| n <= *max),
            Self::MinLength { value: min, .. } => length_of(value).map_or(true, |len| len >= *min),
            Self::MaxLength { value: max, .. } => length_of(value).map_or(true, |len| len <= *max),
            Self::Pattern { .. } => match value.as_str() {
                Some(s) => compiled.map_or(false, |re| re.is_match(s)),
                None => true,
            },
            Self::Custom { validator, .. } => validator(value),
        };

        (!passed).then(|| ValidationError::new(field, self.code(), self.message()))
    }

    /// Wire form with closures removed
    pub fn to_serialized(&self) -> SerializedRule {
        let (kind, value) = match self {
            Self::Min { value, .. } => ("min", Some(Value::from(*value))),
            Self::Max { value, .. } => ("max", Some(Value::from(*value))),
            Self::MinLength { value, .. } => ("minLength", Some(Value::from(*value))),
            Self::MaxLength { value, .. } => ("maxLength", Some(Value::from(*value))),
            Self::Pattern { value, .. } => ("pattern", Some(Value::from(value.as_str()))),
            Self::Custom { .. } => ("custom", None),
        };
        SerializedRule {
            kind: kind.to_string(),
            value,
            message: self.message().to_string(),
        }
    }
}

fn length_of(value: &Value) -> Option<usize> {
    match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(items) => Some(items.len()),
        _ => None,
    }
}

impl fmt::Debug for ValidationRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Custom { message, .. } => f
                .debug_struct("Custom")
                .field("message", message)
                .finish_non_exhaustive(),
            other => {
                let serialized = other.to_serialized();
                f.debug_struct("ValidationRule")
                    .field("type", &serialized.kind)
                    .field("value", &serialized.value)
                    .field("message", &serialized.message)
                    .finish()
            }
        }
    }
}

/// Serializable rule description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedRule {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub message: String,
}

/// Ready-made rules for common formats
pub mod validators {
    use super::ValidationRule;
    use serde_json::Value;

    pub fn email() -> ValidationRule {
        ValidationRule::pattern(r"^[^\s@]+@[^\s@]+\.[^\s@]+$", "Enter a valid email address")
    }

    pub fn url() -> ValidationRule {
        ValidationRule::pattern(r"^https?://.+", "Enter a valid URL")
    }

    pub fn uuid() -> ValidationRule {
        ValidationRule::pattern(
            r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$",
            "Enter a valid UUID",
        )
    }

    pub fn positive_integer() -> ValidationRule {
        ValidationRule::custom("Must be a positive integer", |v| {
            v.as_u64().is_some_and(|n| n > 0)
                || v.as_f64().is_some_and(|n| n > 0.0 && n.fract() == 0.0)
        })
    }

    pub fn not_empty() -> ValidationRule {
        ValidationRule::custom("Must not be empty", |v| {
            v.as_str().is_some_and(|s| !s.trim().is_empty())
        })
    }

    pub fn one_of(values: Vec<Value>) -> ValidationRule {
        let listed: Vec<String> = values.iter().map(|v| v.to_string()).collect();
        ValidationRule::custom(
            format!("Must be one of: {}", listed.join(", ")),
            move |v| values.contains(v),
        )
    }

    /// Accepts an object, or a string that parses to one
    pub fn json_object() -> ValidationRule {
        ValidationRule::custom("Must be a valid JSON object", |v| match v {
            Value::Object(_) => true,
            Value::String(s) => serde_json::from_str::<Value>(s).is_ok_and(|p| p.is_object()),
            _ => false,
        })
    }
}
