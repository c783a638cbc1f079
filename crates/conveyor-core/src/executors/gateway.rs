//! Gateway executor
//!
//! Evaluates an ordered condition list against context plus input data.
//! The first satisfied condition's target wins; a condition flagged
//! `default` catches the rest; no match at all is a failure. Expression
//! errors, including undefined variables, make that condition false
//! instead of failing the gateway.

use crate::domain::definition::NodeDefinition;
use crate::domain::instance::ProcessInstance;
use crate::domain::step::ProcessStep;
use crate::executors::{ExecutionOutcome, NodeExecutor};
use crate::{expression, ContextStore, DataPacket, EngineError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
struct GatewayCondition {
    /// `field`, `expression`, or `script`
    #[serde(default = "default_kind")]
    kind: String,
    /// Node to route to when this condition holds
    target: String,
    /// Fallback when nothing else matched
    #[serde(default)]
    default: bool,
    // field comparisons
    field: Option<String>,
    operator: Option<String>,
    value: Option<Value>,
    // expression and script conditions
    expression: Option<String>,
}

fn default_kind() -> String {
    "expression".to_string()
}

#[derive(Debug, Deserialize, Default)]
struct GatewayProperties {
    #[serde(default)]
    conditions: Vec<GatewayCondition>,
}

/// Executor for decision nodes
pub struct GatewayExecutor {
    context: Arc<ContextStore>,
}

impl GatewayExecutor {
    /// Create a gateway executor
    pub fn new(context: Arc<ContextStore>) -> Self {
        Self { context }
    }

    fn condition_holds(
        condition: &GatewayCondition,
        scope: &HashMap<String, Value>,
    ) -> Result<bool, EngineError> {
        match condition.kind.as_str() {
            "field" => {
                let field = condition.field.as_deref().ok_or_else(|| {
                    EngineError::Validation(
                        "Field condition requires a 'field' property".to_string(),
                    )
                })?;
                let operator = condition.operator.as_deref().unwrap_or("eq");
                let expected = condition.value.clone().unwrap_or(Value::Null);
                let actual = lookup_field(scope, field);
                Ok(compare_field(actual.as_ref(), operator, &expected)?)
            }
            // `script` kept as an alias for definition compatibility
            "expression" | "script" => {
                let source = condition.expression.as_deref().ok_or_else(|| {
                    EngineError::Validation(
                        "Expression condition requires an 'expression' property".to_string(),
                    )
                })?;
                expression::evaluate_condition(source, scope)
            }
            other => Err(EngineError::Validation(format!(
                "Unknown gateway condition kind '{}'",
                other
            ))),
        }
    }
}

fn lookup_field(scope: &HashMap<String, Value>, field: &str) -> Option<Value> {
    if let Some(value) = scope.get(field) {
        return Some(value.clone());
    }
    let mut parts = field.split('.');
    let mut current = scope.get(parts.next()?)?.clone();
    for part in parts {
        current = current.get(part)?.clone();
    }
    Some(current)
}

fn compare_field(
    actual: Option<&Value>,
    operator: &str,
    expected: &Value,
) -> Result<bool, EngineError> {
    let actual = match actual {
        Some(value) => value,
        None => {
            // A missing field only satisfies inequality against non-null
            return Ok(match operator {
                "ne" | "neq" => !expected.is_null(),
                "eq" => expected.is_null(),
                _ => false,
            });
        }
    };

    let numeric = |a: &Value, b: &Value| -> Option<(f64, f64)> {
        Some((a.as_f64()?, b.as_f64()?))
    };

    match operator {
        "eq" => Ok(actual == expected
            || numeric(actual, expected).is_some_and(|(a, b)| a == b)),
        "ne" | "neq" => Ok(!(actual == expected
            || numeric(actual, expected).is_some_and(|(a, b)| a == b))),
        "gt" => Ok(numeric(actual, expected).is_some_and(|(a, b)| a > b)),
        "ge" | "gte" => Ok(numeric(actual, expected).is_some_and(|(a, b)| a >= b)),
        "lt" => Ok(numeric(actual, expected).is_some_and(|(a, b)| a < b)),
        "le" | "lte" => Ok(numeric(actual, expected).is_some_and(|(a, b)| a <= b)),
        "contains" => Ok(match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle),
            (Value::Array(items), needle) => items.contains(needle),
            _ => false,
        }),
        other => Err(EngineError::Validation(format!(
            "Unknown field operator '{}'",
            other
        ))),
    }
}

#[async_trait]
impl NodeExecutor for GatewayExecutor {
    async fn execute(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        _step: &mut ProcessStep,
        input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError> {
        let props: GatewayProperties = super::parse_properties(&node.properties)?;
        if props.conditions.is_empty() {
            return Err(EngineError::Validation(format!(
                "Gateway '{}' has no conditions",
                node.id
            )));
        }

        // Input data overlays context variables
        let mut scope: HashMap<String, Value> = self.context.get_all(&instance.id).await?;
        if let Some(fields) = input.as_object() {
            for (key, value) in fields {
                scope.insert(key.clone(), value.clone());
            }
        }

        let mut fallback: Option<&GatewayCondition> = None;
        for (index, condition) in props.conditions.iter().enumerate() {
            if condition.default {
                fallback.get_or_insert(condition);
                continue;
            }
            match Self::condition_holds(condition, &scope) {
                Ok(true) => {
                    return Ok(ExecutionOutcome::Completed(DataPacket::new(json!({
                        "selected_target": condition.target,
                        "condition_index": index,
                        "default_used": false,
                    }))));
                }
                Ok(false) => {}
                Err(e) => {
                    // Recoverable false, never raised past the boundary
                    tracing::debug!(
                        instance_id = %instance.id.0,
                        node_id = %node.id.0,
                        condition_index = index,
                        error = %e,
                        "Gateway condition evaluated false on error"
                    );
                }
            }
        }

        if let Some(fallback) = fallback {
            return Ok(ExecutionOutcome::Completed(DataPacket::new(json!({
                "selected_target": fallback.target,
                "default_used": true,
            }))));
        }

        Err(EngineError::Validation(format!(
            "Gateway '{}' matched no condition and has no default",
            node.id
        )))
    }
}
