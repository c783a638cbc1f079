//! Service executor
//!
//! Dispatches to one of the built-in operation kinds selected by the
//! `service_type` property. Operation failures are captured into a
//! `{success: false, error}` payload and never raised past the boundary;
//! only an unknown `service_type` is an error.

use crate::domain::definition::NodeDefinition;
use crate::domain::instance::{ProcessInstance, UserId};
use crate::domain::repository::NotificationSender;
use crate::domain::step::ProcessStep;
use crate::executors::{ExecutionOutcome, NodeExecutor};
use crate::{expression, ContextStore, DataPacket, EngineError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Outbound call boundary; the core never performs network I/O itself
#[async_trait]
pub trait ServiceGateway: Send + Sync {
    /// Perform a remote call and return the response body
    async fn call(&self, url: &str, method: &str, body: &Value) -> Result<Value, EngineError>;
}

/// Gateway that echoes the request, for tests and offline hosts
#[cfg(feature = "testing")]
pub struct EchoServiceGateway;

#[cfg(feature = "testing")]
#[async_trait]
impl ServiceGateway for EchoServiceGateway {
    async fn call(&self, url: &str, method: &str, body: &Value) -> Result<Value, EngineError> {
        Ok(json!({"url": url, "method": method, "echo": body}))
    }
}

#[derive(Debug, Deserialize, Default)]
struct ServiceProperties {
    service_type: Option<String>,
    // http_call
    url: Option<String>,
    method: Option<String>,
    body: Option<Value>,
    // notification
    recipient: Option<String>,
    subject: Option<String>,
    message: Option<String>,
    // data_query
    variable: Option<String>,
    default: Option<Value>,
    // script
    script: Option<String>,
    /// Context variable to store the script result under
    result_variable: Option<String>,
}

/// Executor for built-in service operations
pub struct ServiceExecutor {
    context: Arc<ContextStore>,
    gateway: Arc<dyn ServiceGateway>,
    notifications: Arc<dyn NotificationSender>,
}

impl ServiceExecutor {
    /// Create a service executor
    pub fn new(
        context: Arc<ContextStore>,
        gateway: Arc<dyn ServiceGateway>,
        notifications: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            context,
            gateway,
            notifications,
        }
    }

    async fn http_call(
        &self,
        instance: &ProcessInstance,
        props: &ServiceProperties,
    ) -> Result<Value, EngineError> {
        let url_template = props.url.as_deref().ok_or_else(|| {
            EngineError::Validation("http_call requires a 'url' property".to_string())
        })?;
        let url = self
            .context
            .resolve_expression(&instance.id, url_template)
            .await?;
        let url = url.as_str().map(str::to_string).unwrap_or_else(|| url.to_string());
        let method = props.method.as_deref().unwrap_or("POST");
        let body = props.body.clone().unwrap_or(Value::Null);

        let response = self.gateway.call(&url, method, &body).await?;
        Ok(json!({"success": true, "response": response}))
    }

    async fn notification(
        &self,
        instance: &ProcessInstance,
        props: &ServiceProperties,
    ) -> Result<Value, EngineError> {
        let recipient = props.recipient.as_deref().ok_or_else(|| {
            EngineError::Validation("notification requires a 'recipient' property".to_string())
        })?;
        let subject = props.subject.as_deref().unwrap_or("Process notification");
        let message = match &props.message {
            Some(template) => {
                let resolved = self
                    .context
                    .resolve_expression(&instance.id, template)
                    .await?;
                resolved
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| resolved.to_string())
            }
            None => String::new(),
        };

        self.notifications
            .notify(&UserId(recipient.to_string()), subject, &message)
            .await?;
        Ok(json!({"success": true, "recipient": recipient}))
    }

    async fn data_query(
        &self,
        instance: &ProcessInstance,
        props: &ServiceProperties,
    ) -> Result<Value, EngineError> {
        let variable = props.variable.as_deref().ok_or_else(|| {
            EngineError::Validation("data_query requires a 'variable' property".to_string())
        })?;
        let value = self
            .context
            .get(&instance.id, variable, props.default.clone(), false)
            .await?;
        Ok(json!({"success": true, "result": value}))
    }

    async fn script(
        &self,
        instance: &ProcessInstance,
        props: &ServiceProperties,
        input: &DataPacket,
    ) -> Result<Value, EngineError> {
        let source = props.script.as_deref().ok_or_else(|| {
            EngineError::Validation("script requires a 'script' property".to_string())
        })?;

        let mut scope: HashMap<String, Value> = self.context.get_all(&instance.id).await?;
        if let Some(fields) = input.as_object() {
            for (key, value) in fields {
                scope.insert(key.clone(), value.clone());
            }
        }

        let result = expression::evaluate(source, &scope)?;
        if let Some(target) = &props.result_variable {
            self.context
                .set(&instance.id, target, result.clone(), None)
                .await?;
        }
        Ok(json!({"success": true, "result": result}))
    }
}

#[async_trait]
impl NodeExecutor for ServiceExecutor {
    async fn execute(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        _step: &mut ProcessStep,
        input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError> {
        let props: ServiceProperties = super::parse_properties(&node.properties)?;
        let kind = props.service_type.as_deref().ok_or_else(|| {
            EngineError::Validation("Service node requires a 'service_type' property".to_string())
        })?;

        let result = match kind {
            "http_call" => self.http_call(instance, &props).await,
            "notification" => self.notification(instance, &props).await,
            "data_query" => self.data_query(instance, &props).await,
            "script" => self.script(instance, &props, input).await,
            other => {
                // The one failure that crosses the boundary
                return Err(EngineError::Validation(format!(
                    "Unsupported service_type '{}'",
                    other
                )));
            }
        };

        let output = match result {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(
                    instance_id = %instance.id.0,
                    node_id = %node.id.0,
                    service_type = kind,
                    error = %e,
                    "Service operation failed"
                );
                let mut failure = Map::new();
                failure.insert("success".to_string(), Value::Bool(false));
                failure.insert("error".to_string(), Value::String(e.to_string()));
                Value::Object(failure)
            }
        };

        Ok(ExecutionOutcome::Completed(DataPacket::new(output)))
    }
}
