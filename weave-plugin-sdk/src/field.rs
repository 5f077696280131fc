//! Input and output field declarations

use crate::rule::ValidationRule;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Value type carried by a node port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Boolean,
    Object,
    Array,
    Any,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        Self::String,
        Self::Number,
        Self::Boolean,
        Self::Object,
        Self::Array,
        Self::Any,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
            Self::Any => "any",
        }
    }

    /// Whether a (non-null) JSON value has this type
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
            Self::Any => true,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("Unknown data type: {}", s))
    }
}

/// Operator of a display condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ShowIfOperator {
    Equals,
    NotEquals,
    Contains,
    Exists,
}

/// Show a field only when another field satisfies a condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShowIf {
    pub field: String,
    pub operator: ShowIfOperator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ShowIf {
    pub fn equals(field: impl Into<String>, value: Value) -> Self {
        Self {
            field: field.into(),
            operator: ShowIfOperator::Equals,
            value: Some(value),
        }
    }

    pub fn exists(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            operator: ShowIfOperator::Exists,
            value: None,
        }
    }

    /// Evaluate against the current configuration
    pub fn evaluate(&self, config: &Map<String, Value>) -> bool {
        let current = config.get(&self.field).filter(|v| !v.is_null());
        let expected = self.value.as_ref().unwrap_or(&Value::Null);

        match self.operator {
            ShowIfOperator::Equals => current.unwrap_or(&Value::Null) == expected,
            ShowIfOperator::NotEquals => current.unwrap_or(&Value::Null) != expected,
            ShowIfOperator::Contains => match (current, expected) {
                (Some(Value::String(s)), Value::String(needle)) => s.contains(needle.as_str()),
                (Some(Value::Array(items)), needle) => items.contains(needle),
                _ => false,
            },
            ShowIfOperator::Exists => current.is_some(),
        }
    }
}

/// Declared input of a node
#[derive(Debug, Clone)]
pub struct InputField {
    pub data_type: DataType,
    pub label: String,
    pub description: Option<String>,
    pub required: bool,
    pub default_value: Option<Value>,
    pub placeholder: Option<String>,
    pub validation: Vec<ValidationRule>,
    pub show_if: Option<ShowIf>,
}

impl InputField {
    pub fn new(data_type: DataType, label: impl Into<String>) -> Self {
        Self {
            data_type,
            label: label.into(),
            description: None,
            required: false,
            default_value: None,
            placeholder: None,
            validation: Vec::new(),
            show_if: None,
        }
    }

    pub fn string(label: impl Into<String>) -> Self {
        Self::new(DataType::String, label)
    }

    pub fn number(label: impl Into<String>) -> Self {
        Self::new(DataType::Number, label)
    }

    pub fn boolean(label: impl Into<String>) -> Self {
        Self::new(DataType::Boolean, label)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn placeholder(mut self, placeholder: impl Into<String>) -> Self {
        self.placeholder = Some(placeholder.into());
        self
    }

    pub fn rule(mut self, rule: ValidationRule) -> Self {
        self.validation.push(rule);
        self
    }

    pub fn show_if(mut self, condition: ShowIf) -> Self {
        self.show_if = Some(condition);
        self
    }
}

/// Declared output of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputField {
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

impl OutputField {
    pub fn new(data_type: DataType, label: impl Into<String>) -> Self {
        Self {
            data_type,
            label: label.into(),
            description: None,
            optional: false,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}
