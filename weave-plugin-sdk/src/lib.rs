//! weave-plugin-sdk: SDK for defining workflow nodes
//!
//! This SDK turns a declarative [`NodeConfig`] into a validated, immutable
//! [`NodeDefinition`] with typed inputs, validation rules and an async
//! execute function.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use weave_plugin_sdk::prelude::*;
//!
//! let node = define_node(
//!     NodeConfig::new("http-get", "HTTP GET")
//!         .category(NodeCategory::Integration)
//!         .input("url", InputField::string("URL").required().rule(validators::url()))
//!         .output("body", OutputField::new(DataType::String, "Body"))
//!         .execute(|ctx| async move { fetch(ctx).await }),
//! )?;
//!
//! let check = node.validate_inputs(&json!({ "url": "ftp://nope" }));
//! assert!(!check.valid);
//! ```

pub mod error;
pub mod expr;
pub mod field;
pub mod node;
pub mod rule;

// Re-export everything from weave-plugin-api
pub use weave_plugin_api::*;

pub use error::{ConfigurationError, ExecutionError, ValidationError, ValidationResult};
pub use expr::{Expr, ExprError};
pub use field::{DataType, InputField, OutputField, ShowIf, ShowIfOperator};
pub use node::{
    define_node, validate_node_definition, BoxFuture, ExecuteFn, FieldDescription, NodeCategory,
    NodeConfig, NodeDefinition, NodeExecutionContext, NodeOutputs, SerializedInputField,
    SerializedNodeDefinition,
};
pub use rule::{validators, CustomValidator, SerializedRule, ValidationRule};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        define_node, validators, DataType, ExecutionError, InputField, NodeCategory, NodeConfig,
        NodeDefinition, NodeExecutionContext, NodeOutputs, OutputField, ShowIf, ValidationRule,
    };
    pub use serde_json::json;
}
