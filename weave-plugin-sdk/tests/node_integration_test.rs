//! Integration tests for defining, validating and running nodes

use serde_json::{json, Map, Value};
use weave_plugin_sdk::prelude::*;
use weave_plugin_sdk::{expr, SerializedNodeDefinition};

fn filter_node() -> NodeDefinition {
    define_node(
        NodeConfig::new("filter-items", "Filter Items")
            .description("Keep items matching a condition")
            .category(NodeCategory::Data)
            .tag("array")
            .input("items", InputField::new(DataType::Array, "Items").required())
            .input(
                "condition",
                InputField::string("Condition")
                    .required()
                    .default_value(json!("item.active"))
                    .rule(ValidationRule::max_length(200, "Condition is too long")),
            )
            .output("kept", OutputField::new(DataType::Array, "Kept items"))
            .output("dropped", OutputField::new(DataType::Number, "Dropped").optional())
            .execute(|ctx| async move {
                let condition = ctx
                    .input("condition")
                    .and_then(Value::as_str)
                    .unwrap_or("true");
                let parsed = expr::parse(condition).map_err(|e| {
                    ExecutionError::new(format!("Invalid condition: {}", e))
                        .with_context(json!({ "condition": condition }))
                })?;

                let items = ctx.input("items").and_then(Value::as_array).cloned().unwrap_or_default();
                let total = items.len();
                let mut kept = Vec::new();
                for item in items {
                    let scope = json!({ "item": item });
                    let verdict = parsed
                        .evaluate(&scope)
                        .map_err(|e| ExecutionError::new(e.to_string()))?;
                    if expr::is_truthy(&verdict) {
                        kept.push(scope["item"].clone());
                    }
                }

                let mut out = Map::new();
                out.insert("dropped".into(), json!(total - kept.len()));
                out.insert("kept".into(), Value::Array(kept));
                Ok(out)
            }),
    )
    .expect("definition should be valid")
}

fn ctx(inputs: Value) -> NodeExecutionContext {
    NodeExecutionContext::new(inputs.as_object().cloned().unwrap_or_default())
}

#[tokio::test]
async fn test_run_fills_defaults_and_executes() {
    let node = filter_node();
    let out = node
        .run(ctx(json!({
            "items": [
                { "id": 1, "active": true },
                { "id": 2, "active": false },
                { "id": 3, "active": true },
            ]
        })))
        .await
        .unwrap();

    assert_eq!(out["kept"], json!([{ "id": 1, "active": true }, { "id": 3, "active": true }]));
    assert_eq!(out["dropped"], json!(1));
}

#[tokio::test]
async fn test_run_rejects_invalid_inputs_with_context() {
    let node = filter_node();
    let err = node.run(ctx(json!({ "items": "not-a-list" }))).await.unwrap_err();

    assert!(err.message.contains("filter-items"));
    assert_eq!(err.context["errors"][0]["code"], json!("INVALID_TYPE"));
    assert_eq!(err.context["errors"][0]["field"], json!("items"));
}

#[tokio::test]
async fn test_execution_error_carries_context() {
    let node = filter_node();
    let err = node
        .run(ctx(json!({ "items": [], "condition": "item.run()" })))
        .await
        .unwrap_err();

    assert!(err.message.starts_with("Invalid condition"));
    assert_eq!(err.context["condition"], json!("item.run()"));
}

#[tokio::test]
async fn test_overly_nested_condition_is_refused() {
    let node = filter_node();
    let condition = "1+".repeat(99) + "1";
    assert!(condition.len() <= 200);

    let err = node
        .run(ctx(json!({ "items": [{ "id": 1 }], "condition": condition })))
        .await
        .unwrap_err();
    assert!(err.message.starts_with("Invalid condition"), "{}", err.message);
    assert!(err.message.contains("nesting"), "{}", err.message);
}

#[test]
fn test_long_flat_chain_fits_a_small_stack() {
    let source = "1+".repeat(2040) + "1";
    let outcome = std::thread::Builder::new()
        .stack_size(2 * 1024 * 1024)
        .spawn(move || expr::evaluate(&source, &Value::Null))
        .unwrap()
        .join()
        .unwrap();
    assert_eq!(outcome, Err(expr::ExprError::TooDeep));
}

#[test]
fn test_serialized_definition_survives_json() {
    let node = filter_node();
    let wire = node.serialize().to_json().unwrap();
    assert!(!wire.contains("execute"));

    let restored = SerializedNodeDefinition::from_json(&wire).unwrap();
    assert_eq!(restored, node.serialize());
    assert_eq!(restored.category, NodeCategory::Data);

    let fields = restored.describe_inputs();
    let condition = fields.iter().find(|f| f.name == "condition").unwrap();
    assert!(condition.required);
    assert_eq!(condition.default_value, Some(json!("item.active")));
    assert_eq!(condition.data_type, DataType::String);

    let descriptor: Value = serde_json::from_str(&wire).unwrap();
    assert!(weave_plugin_sdk::validate_node_definition(&descriptor).valid);
}
