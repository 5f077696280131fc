//! Node definitions
//!
//! A node is declared with a [`NodeConfig`] and turned into an immutable
//! [`NodeDefinition`] by [`define_node`]. Everything that can be checked
//! statically (id, version, regex patterns, default values) is checked there,
//! so a definition that exists is a well-formed one.
//!
//! # Example
//!
//! ```rust,ignore
//! use weave_plugin_sdk::{define_node, InputField, NodeConfig, OutputField, DataType};
//! use serde_json::json;
//!
//! let node = define_node(
//!     NodeConfig::new("greet", "Greet")
//!         .version("1.0.0")
//!         .input("name", InputField::string("Name").required())
//!         .output("greeting", OutputField::new(DataType::String, "Greeting"))
//!         .execute(|ctx| async move {
//!             let name = ctx.inputs.get("name").and_then(|v| v.as_str()).unwrap_or("world");
//!             let mut out = serde_json::Map::new();
//!             out.insert("greeting".into(), json!(format!("Hello, {name}!")));
//!             Ok(out)
//!         }),
//! )?;
//! ```

use crate::error::{ConfigurationError, ExecutionError, ValidationError, ValidationResult};
use crate::field::{DataType, InputField, OutputField, ShowIf};
use crate::rule::{SerializedRule, ValidationRule};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use weave_plugin_api::{is_valid_id, parse_version, Category};

/// Node categories are shared with plugin manifests
pub type NodeCategory = Category;

/// Output map produced by a node
pub type NodeOutputs = Map<String, Value>;

/// Boxed future returned by execute functions
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased execute function
pub type ExecuteFn =
    Arc<dyn Fn(NodeExecutionContext) -> BoxFuture<'static, Result<NodeOutputs, ExecutionError>> + Send + Sync>;

/// Data handed to a node's execute function
#[derive(Debug, Clone, Default)]
pub struct NodeExecutionContext {
    pub node_id: String,
    pub execution_id: String,
    pub workflow_id: String,
    pub inputs: Map<String, Value>,
}

impl NodeExecutionContext {
    pub fn new(inputs: Map<String, Value>) -> Self {
        Self {
            inputs,
            ..Default::default()
        }
    }

    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.get(name)
    }
}

/// Author-facing node declaration
pub struct NodeConfig {
    id: String,
    name: String,
    description: String,
    category: NodeCategory,
    version: String,
    icon: Option<String>,
    tags: Vec<String>,
    inputs: Vec<(String, InputField)>,
    outputs: Vec<(String, OutputField)>,
    execute: Option<ExecuteFn>,
}

impl NodeConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: Category::Custom,
            version: "1.0.0".to_string(),
            icon: None,
            tags: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            execute: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn category(mut self, category: NodeCategory) -> Self {
        self.category = category;
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = Some(icon.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Declare an input; declaration order is validation order
    pub fn input(mut self, name: impl Into<String>, field: InputField) -> Self {
        self.inputs.push((name.into(), field));
        self
    }

    pub fn output(mut self, name: impl Into<String>, field: OutputField) -> Self {
        self.outputs.push((name.into(), field));
        self
    }

    pub fn execute<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NodeExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeOutputs, ExecutionError>> + Send + 'static,
    {
        let execute: ExecuteFn = Arc::new(
            move |ctx: NodeExecutionContext| -> BoxFuture<'static, Result<NodeOutputs, ExecutionError>> {
                Box::pin(f(ctx))
            },
        );
        self.execute = Some(execute);
        self
    }
}

/// A validated, immutable node definition
#[derive(Clone)]
pub struct NodeDefinition {
    inner: Arc<DefinitionInner>,
}

struct DefinitionInner {
    id: String,
    name: String,
    description: String,
    category: NodeCategory,
    version: String,
    icon: Option<String>,
    tags: Vec<String>,
    inputs: Vec<(String, InputField)>,
    outputs: Vec<(String, OutputField)>,
    patterns: HashMap<String, Regex>,
    execute: ExecuteFn,
}

/// Validate a node declaration and produce its definition
pub fn define_node(config: NodeConfig) -> Result<NodeDefinition, ConfigurationError> {
    if !is_valid_id(&config.id) {
        return Err(ConfigurationError::InvalidId(config.id));
    }
    if config.name.trim().is_empty() {
        return Err(ConfigurationError::MissingName);
    }
    match parse_version(&config.version) {
        Ok(v) if v.prerelease.is_none() && v.build.is_none() => {}
        _ => return Err(ConfigurationError::InvalidVersion(config.version)),
    }
    let Some(execute) = config.execute else {
        return Err(ConfigurationError::MissingExecute(config.id));
    };

    check_unique("input", config.inputs.iter().map(|(name, _)| name))?;
    check_unique("output", config.outputs.iter().map(|(name, _)| name))?;

    let mut patterns = HashMap::new();
    for (name, field) in &config.inputs {
        for rule in &field.validation {
            if let ValidationRule::Pattern { value, .. } = rule {
                if patterns.contains_key(value) {
                    continue;
                }
                let regex = Regex::new(value).map_err(|source| ConfigurationError::InvalidPattern {
                    field: name.clone(),
                    source,
                })?;
                patterns.insert(value.clone(), regex);
            }
        }
    }

    for (name, field) in &config.inputs {
        if let Some(default) = &field.default_value {
            let mut errors = Vec::new();
            check_field(name, default, field, &patterns, &mut errors);
            if !errors.is_empty() {
                return Err(ConfigurationError::InvalidDefault {
                    field: name.clone(),
                    errors,
                });
            }
        }
    }

    tracing::debug!(node = %config.id, version = %config.version, "Node defined");

    Ok(NodeDefinition {
        inner: Arc::new(DefinitionInner {
            id: config.id,
            name: config.name,
            description: config.description,
            category: config.category,
            version: config.version,
            icon: config.icon,
            tags: config.tags,
            inputs: config.inputs,
            outputs: config.outputs,
            patterns,
            execute,
        }),
    })
}

fn check_unique<'a>(
    kind: &'static str,
    names: impl Iterator<Item = &'a String>,
) -> Result<(), ConfigurationError> {
    let mut seen = std::collections::HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigurationError::DuplicateField {
                kind,
                field: name.clone(),
            });
        }
    }
    Ok(())
}

/// Type and rule checks for a present, non-null value
fn check_field(
    name: &str,
    value: &Value,
    field: &InputField,
    patterns: &HashMap<String, Regex>,
    errors: &mut Vec<ValidationError>,
) {
    if !field.data_type.accepts(value) {
        errors.push(ValidationError::new(
            name,
            "INVALID_TYPE",
            format!("{} must be of type {}", field.label, field.data_type),
        ));
        return;
    }

    for rule in &field.validation {
        let compiled = match rule {
            ValidationRule::Pattern { value, .. } => patterns.get(value),
            _ => None,
        };
        if let Some(error) = rule.check(name, value, compiled) {
            errors.push(error);
        }
    }
}

impl NodeDefinition {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn description(&self) -> &str {
        &self.inner.description
    }

    pub fn category(&self) -> NodeCategory {
        self.inner.category
    }

    pub fn version(&self) -> &str {
        &self.inner.version
    }

    pub fn inputs(&self) -> impl Iterator<Item = (&str, &InputField)> {
        self.inner.inputs.iter().map(|(n, f)| (n.as_str(), f))
    }

    pub fn outputs(&self) -> impl Iterator<Item = (&str, &OutputField)> {
        self.inner.outputs.iter().map(|(n, f)| (n.as_str(), f))
    }

    /// Validate candidate inputs
    ///
    /// Never fails: every problem is reported in the result. Fields hidden by
    /// their `show_if` condition are skipped.
    pub fn validate_inputs(&self, candidate: &Value) -> ValidationResult {
        let empty = Map::new();
        let values = candidate.as_object().unwrap_or(&empty);
        let mut errors = Vec::new();

        for (name, field) in &self.inner.inputs {
            if let Some(condition) = &field.show_if {
                if !condition.evaluate(values) {
                    continue;
                }
            }

            let value = match values.get(name) {
                None | Some(Value::Null) => {
                    if field.required {
                        errors.push(ValidationError::new(
                            name.as_str(),
                            "REQUIRED",
                            format!("{} is required", field.label),
                        ));
                    }
                    continue;
                }
                Some(value) => value,
            };

            check_field(name, value, field, &self.inner.patterns, &mut errors);
        }

        ValidationResult::from_errors(errors)
    }

    /// Fields that declare a default value
    pub fn get_default_config(&self) -> Map<String, Value> {
        self.inner
            .inputs
            .iter()
            .filter_map(|(name, field)| {
                field
                    .default_value
                    .as_ref()
                    .map(|default| (name.clone(), default.clone()))
            })
            .collect()
    }

    /// Names of inputs visible under the given configuration
    pub fn visible_inputs(&self, config: &Map<String, Value>) -> Vec<&str> {
        self.inner
            .inputs
            .iter()
            .filter(|(_, field)| field.show_if.as_ref().map_or(true, |c| c.evaluate(config)))
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Invoke the execute function without any checks
    pub async fn execute(&self, ctx: NodeExecutionContext) -> Result<NodeOutputs, ExecutionError> {
        (self.inner.execute)(ctx).await
    }

    /// Fill defaults, validate, then execute
    pub async fn run(&self, mut ctx: NodeExecutionContext) -> Result<NodeOutputs, ExecutionError> {
        for (name, default) in self.get_default_config() {
            ctx.inputs.entry(name).or_insert(default);
        }

        let result = self.validate_inputs(&Value::Object(ctx.inputs.clone()));
        if !result.valid {
            return Err(ExecutionError::new(format!(
                "Input validation failed for node {}",
                self.inner.id
            ))
            .with_context(json!({ "node": self.inner.id, "errors": result.errors })));
        }

        tracing::debug!(node = %self.inner.id, execution = %ctx.execution_id, "Executing node");
        self.execute(ctx).await
    }

    /// Wire-safe projection without closures
    pub fn serialize(&self) -> SerializedNodeDefinition {
        let inner = &self.inner;
        SerializedNodeDefinition {
            id: inner.id.clone(),
            name: inner.name.clone(),
            description: inner.description.clone(),
            category: inner.category,
            version: inner.version.clone(),
            icon: inner.icon.clone(),
            tags: inner.tags.clone(),
            inputs: inner
                .inputs
                .iter()
                .map(|(name, f)| {
                    (
                        name.clone(),
                        SerializedInputField {
                            data_type: f.data_type,
                            label: f.label.clone(),
                            description: f.description.clone(),
                            required: f.required,
                            default_value: f.default_value.clone(),
                            placeholder: f.placeholder.clone(),
                            validation: f.validation.iter().map(ValidationRule::to_serialized).collect(),
                            show_if: f.show_if.clone(),
                        },
                    )
                })
                .collect(),
            outputs: inner
                .outputs
                .iter()
                .map(|(name, f)| (name.clone(), f.clone()))
                .collect(),
        }
    }
}

impl fmt::Debug for NodeDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeDefinition")
            .field("id", &self.inner.id)
            .field("version", &self.inner.version)
            .field("inputs", &self.inner.inputs.len())
            .field("outputs", &self.inner.outputs.len())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Serialized form
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedInputField {
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placeholder: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub validation: Vec<SerializedRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub show_if: Option<ShowIf>,
}

/// Node definition as sent to a UI or registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerializedNodeDefinition {
    pub id: String,
    pub name: String,
    pub description: String,
    pub category: NodeCategory,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub inputs: BTreeMap<String, SerializedInputField>,
    pub outputs: BTreeMap<String, OutputField>,
}

/// Minimal field description used to render a form
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescription {
    pub name: String,
    pub data_type: DataType,
    pub label: String,
    pub required: bool,
    pub default_value: Option<Value>,
}

impl SerializedNodeDefinition {
    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Re-hydrate input fields into form descriptions
    pub fn describe_inputs(&self) -> Vec<FieldDescription> {
        self.inputs
            .iter()
            .map(|(name, f)| FieldDescription {
                name: name.clone(),
                data_type: f.data_type,
                label: f.label.clone(),
                required: f.required,
                default_value: f.default_value.clone(),
            })
            .collect()
    }
}

// ============================================================================
// Untyped descriptor validation
// ============================================================================

/// Validate a node descriptor received as JSON (e.g. from a plugin manifest)
pub fn validate_node_definition(descriptor: &Value) -> ValidationResult {
    let mut errors = Vec::new();
    let Some(obj) = descriptor.as_object() else {
        errors.push(ValidationError::new("", "INVALID_TYPE", "Node definition must be an object"));
        return ValidationResult::from_errors(errors);
    };

    let text = |field: &str| obj.get(field).and_then(Value::as_str).filter(|s| !s.trim().is_empty());

    match text("id") {
        None => errors.push(ValidationError::new("id", "REQUIRED", "Node id is required")),
        Some(id) if !is_valid_id(id) => errors.push(ValidationError::new(
            "id",
            "INVALID_FORMAT",
            "Node id may only contain lowercase letters, digits and hyphens",
        )),
        Some(_) => {}
    }

    if text("name").is_none() {
        errors.push(ValidationError::new("name", "REQUIRED", "Node name is required"));
    }

    match text("version") {
        None => errors.push(ValidationError::new("version", "REQUIRED", "Node version is required")),
        Some(v) => {
            let strict = parse_version(v).is_ok_and(|p| p.prerelease.is_none() && p.build.is_none());
            if !strict {
                errors.push(ValidationError::new(
                    "version",
                    "INVALID_FORMAT",
                    "Version must be semver (e.g. 1.0.0)",
                ));
            }
        }
    }

    match text("category") {
        None => errors.push(ValidationError::new("category", "REQUIRED", "Node category is required")),
        Some(c) if c.parse::<Category>().is_err() => errors.push(ValidationError::new(
            "category",
            "INVALID_VALUE",
            format!("Unknown node category: {}", c),
        )),
        Some(_) => {}
    }

    for section in ["inputs", "outputs"] {
        let Some(fields) = obj.get(section).and_then(Value::as_object) else {
            continue;
        };
        for (name, field) in fields {
            match field.get("type").and_then(Value::as_str) {
                None => errors.push(ValidationError::new(
                    format!("{}.{}.type", section, name),
                    "REQUIRED",
                    format!("Type of '{}' is required", name),
                )),
                Some(t) if t.parse::<DataType>().is_err() => errors.push(ValidationError::new(
                    format!("{}.{}.type", section, name),
                    "INVALID_VALUE",
                    format!("Unknown data type: {}", t),
                )),
                Some(_) => {}
            }
            if field.get("label").and_then(Value::as_str).is_none() {
                errors.push(ValidationError::new(
                    format!("{}.{}.label", section, name),
                    "REQUIRED",
                    format!("Label of '{}' is required", name),
                ));
            }
        }
    }

    ValidationResult::from_errors(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::validators;

    fn echo() -> NodeConfig {
        NodeConfig::new("echo", "Echo").execute(|ctx| async move { Ok(ctx.inputs) })
    }

    #[test]
    fn test_rejects_bad_id() {
        let err = define_node(NodeConfig::new("Echo_Node", "Echo").execute(|_| async { Ok(Map::new()) }))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidId(_)));
    }

    #[test]
    fn test_rejects_bad_version() {
        for version in ["1.0", "1.0.0-beta", "v1.0.0"] {
            let err = define_node(echo().version(version)).unwrap_err();
            assert!(matches!(err, ConfigurationError::InvalidVersion(_)), "{}", version);
        }
    }

    #[test]
    fn test_requires_execute() {
        let err = define_node(NodeConfig::new("echo", "Echo")).unwrap_err();
        assert!(matches!(err, ConfigurationError::MissingExecute(_)));
    }

    #[test]
    fn test_rejects_bad_pattern_and_default() {
        let err = define_node(
            echo().input("code", InputField::string("Code").rule(ValidationRule::pattern("(", "x"))),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::InvalidPattern { .. }));

        let err = define_node(echo().input(
            "retries",
            InputField::number("Retries")
                .default_value(json!(20))
                .rule(ValidationRule::max(10.0, "At most 10")),
        ))
        .unwrap_err();
        match err {
            ConfigurationError::InvalidDefault { field, errors } => {
                assert_eq!(field, "retries");
                assert_eq!(errors[0].code, "RULE_MAX");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_duplicate_inputs() {
        let err = define_node(
            echo()
                .input("a", InputField::string("A"))
                .input("a", InputField::string("A again")),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigurationError::DuplicateField { kind: "input", .. }));
    }

    #[test]
    fn test_validate_inputs_accumulates() {
        let node = define_node(
            echo()
                .input("name", InputField::string("Name").required())
                .input(
                    "email",
                    InputField::string("Email")
                        .rule(validators::email())
                        .rule(ValidationRule::min_length(50, "Too short")),
                )
                .input("count", InputField::number("Count").required())
                .input("note", InputField::string("Note")),
        )
        .unwrap();

        let result = node.validate_inputs(&json!({
            "name": null,
            "email": "x",
            "count": "three",
        }));

        assert!(!result.valid);
        assert_eq!(
            result.codes(),
            vec!["REQUIRED", "RULE_PATTERN", "RULE_MIN_LENGTH", "INVALID_TYPE"]
        );
        assert_eq!(result.errors[3].field, "count");
    }

    #[test]
    fn test_validate_inputs_total_on_non_objects() {
        let node = define_node(echo().input("name", InputField::string("Name").required())).unwrap();
        for candidate in [json!(null), json!(42), json!("x"), json!([1, 2])] {
            let result = node.validate_inputs(&candidate);
            assert_eq!(result.valid, result.errors.is_empty());
            assert_eq!(result.codes(), vec!["REQUIRED"]);
        }
        assert!(node.validate_inputs(&json!({ "name": "ok" })).valid);
    }

    #[test]
    fn test_hidden_fields_are_skipped() {
        let node = define_node(
            echo()
                .input("mode", InputField::string("Mode").default_value(json!("simple")))
                .input(
                    "script",
                    InputField::string("Script")
                        .required()
                        .show_if(ShowIf::equals("mode", json!("advanced"))),
                ),
        )
        .unwrap();

        assert!(node.validate_inputs(&json!({ "mode": "simple" })).valid);
        assert!(!node.validate_inputs(&json!({ "mode": "advanced" })).valid);
        assert_eq!(node.visible_inputs(&Map::new()), vec!["mode"]);
    }

    #[test]
    fn test_default_config_only_declared_defaults() {
        let node = define_node(
            echo()
                .input("a", InputField::string("A").default_value(json!("x")))
                .input("b", InputField::string("B")),
        )
        .unwrap();
        let defaults = node.get_default_config();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults["a"], json!("x"));
    }

    #[test]
    fn test_validate_node_definition() {
        let ok = validate_node_definition(&json!({
            "id": "http-fetch",
            "name": "HTTP Fetch",
            "version": "1.2.0",
            "category": "integration",
            "inputs": { "url": { "type": "string", "label": "URL" } },
        }));
        assert!(ok.valid, "{:?}", ok.errors);

        let bad = validate_node_definition(&json!({
            "id": "HTTP",
            "version": "1.2",
            "category": "magic",
            "inputs": { "url": { "type": "uri" } },
        }));
        assert_eq!(
            bad.codes(),
            vec!["INVALID_FORMAT", "REQUIRED", "INVALID_FORMAT", "INVALID_VALUE", "INVALID_VALUE", "REQUIRED"]
        );
    }
}
