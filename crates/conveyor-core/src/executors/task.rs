//! User task executor
//!
//! Resolves an assignee, records form schema and due date on the step, and
//! parks the step in `waiting`. Completion arrives later through
//! `complete_external_task`.

use crate::domain::definition::NodeDefinition;
use crate::domain::instance::{ProcessInstance, UserId};
use crate::domain::repository::{NotificationSender, RoleSelection, UserDirectory};
use crate::domain::step::ProcessStep;
use crate::executors::{ExecutionOutcome, NodeExecutor};
use crate::{ContextStore, DataPacket, EngineError};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize, Default)]
struct TaskProperties {
    /// Direct user id, or `${variable}` for a context lookup
    assignee: Option<String>,
    /// Role to resolve when no direct assignee is given
    assignee_role: Option<String>,
    #[serde(default)]
    role_selection: RoleSelection,
    /// Form presented to the user; stored on the step output verbatim
    form_schema: Option<Value>,
    /// Relative due date
    due_in_seconds: Option<u64>,
}

/// Executor for externally completed user tasks
pub struct TaskExecutor {
    context: Arc<ContextStore>,
    directory: Arc<dyn UserDirectory>,
    notifications: Arc<dyn NotificationSender>,
}

impl TaskExecutor {
    /// Create a task executor
    pub fn new(
        context: Arc<ContextStore>,
        directory: Arc<dyn UserDirectory>,
        notifications: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            context,
            directory,
            notifications,
        }
    }

    async fn resolve_assignee(
        &self,
        instance: &ProcessInstance,
        props: &TaskProperties,
    ) -> Result<UserId, EngineError> {
        if let Some(assignee) = &props.assignee {
            // `${variable}` defers to the instance context
            if let Some(name) = assignee
                .strip_prefix("${")
                .and_then(|rest| rest.strip_suffix('}'))
            {
                let value = self.context.get(&instance.id, name, None, true).await?;
                return match value.as_str() {
                    Some(user) if !user.is_empty() => Ok(UserId(user.to_string())),
                    _ => Err(EngineError::Validation(format!(
                        "Context variable '{}' does not hold an assignee id",
                        name
                    ))),
                };
            }
            return Ok(UserId(assignee.clone()));
        }

        if let Some(role) = &props.assignee_role {
            let members = self
                .directory
                .resolve_role(&instance.tenant_id, role)
                .await?;
            return match props.role_selection {
                RoleSelection::First | RoleSelection::All => {
                    members.into_iter().next().ok_or_else(|| {
                        EngineError::Validation(format!(
                            "Role '{}' has no members in tenant '{}'",
                            role, instance.tenant_id.0
                        ))
                    })
                }
            };
        }

        Err(EngineError::Validation(
            "Task node has neither an assignee nor an assignee role".to_string(),
        ))
    }
}

#[async_trait]
impl NodeExecutor for TaskExecutor {
    async fn execute(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        step: &mut ProcessStep,
        _input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError> {
        let props: TaskProperties = super::parse_properties(&node.properties)?;

        let assignee = self.resolve_assignee(instance, &props).await?;
        step.assignee = Some(assignee.clone());
        if let Some(due) = props.due_in_seconds {
            step.due_at = Some(Utc::now() + ChronoDuration::seconds(due as i64));
        }

        if let Err(e) = self
            .notifications
            .notify(
                &assignee,
                "Task assigned",
                &format!("Task '{}' awaits your input", node.id),
            )
            .await
        {
            tracing::warn!(
                step_id = %step.id.0,
                assignee = %assignee.0,
                error = %e,
                "Task notification failed"
            );
        }

        Ok(ExecutionOutcome::Waiting(DataPacket::new(json!({
            "assignee": assignee.0,
            "form_schema": props.form_schema.unwrap_or(Value::Null),
            "due_at": step.due_at.map(|d| d.to_rfc3339()),
        }))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::{NodeId, NodeType, ProcessDefinitionId};
    use crate::domain::instance::{Priority, TenantId};
    use crate::domain::repository::memory::{
        FixedTenant, LoggingNotificationSender, MemoryContextRepository, StaticUserDirectory,
    };

    fn executor(directory: StaticUserDirectory) -> (TaskExecutor, Arc<ContextStore>) {
        let context = Arc::new(ContextStore::new(
            Arc::new(MemoryContextRepository::new()),
            Arc::new(FixedTenant(TenantId("acme".to_string()))),
        ));
        let executor = TaskExecutor::new(
            context.clone(),
            Arc::new(directory),
            Arc::new(LoggingNotificationSender),
        );
        (executor, context)
    }

    async fn fixtures(
        context: &ContextStore,
    ) -> (ProcessInstance, ProcessStep) {
        let instance = ProcessInstance::new(
            ProcessDefinitionId("def1".to_string()),
            TenantId("acme".to_string()),
            DataPacket::null(),
            None,
            Priority::default(),
        );
        context
            .initialize(&instance.id, instance.tenant_id.clone())
            .await
            .unwrap();
        let step = ProcessStep::new(
            instance.id.clone(),
            NodeId("review".to_string()),
            NodeType::Task,
            DataPacket::null(),
        );
        (instance, step)
    }

    fn node(properties: Value) -> NodeDefinition {
        NodeDefinition {
            id: NodeId("review".to_string()),
            node_type: NodeType::Task,
            properties,
        }
    }

    #[tokio::test]
    async fn test_direct_assignee_parks_the_step() {
        let (executor, context) = executor(StaticUserDirectory::new());
        let (instance, mut step) = fixtures(&context).await;

        let outcome = executor
            .execute(
                &instance,
                &node(json!({"assignee": "alice", "due_in_seconds": 3600})),
                &mut step,
                &DataPacket::null(),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, ExecutionOutcome::Waiting(_)));
        assert_eq!(step.assignee, Some(UserId("alice".to_string())));
        assert!(step.due_at.is_some());
        assert_eq!(outcome.data().as_value()["assignee"], json!("alice"));
    }

    #[tokio::test]
    async fn test_role_assignee_takes_first_member() {
        let (executor, context) =
            executor(StaticUserDirectory::new().with_role("acme", "reviewers", &["r1", "r2"]));
        let (instance, mut step) = fixtures(&context).await;

        executor
            .execute(
                &instance,
                &node(json!({"assignee_role": "reviewers"})),
                &mut step,
                &DataPacket::null(),
            )
            .await
            .unwrap();
        assert_eq!(step.assignee, Some(UserId("r1".to_string())));
    }

    #[tokio::test]
    async fn test_context_variable_assignee() {
        let (executor, context) = executor(StaticUserDirectory::new());
        let (instance, mut step) = fixtures(&context).await;
        context
            .set(&instance.id, "owner", json!("pat"), None)
            .await
            .unwrap();

        executor
            .execute(
                &instance,
                &node(json!({"assignee": "${owner}"})),
                &mut step,
                &DataPacket::null(),
            )
            .await
            .unwrap();
        assert_eq!(step.assignee, Some(UserId("pat".to_string())));
    }

    #[tokio::test]
    async fn test_missing_assignee_is_a_validation_error() {
        let (executor, context) = executor(StaticUserDirectory::new());
        let (instance, mut step) = fixtures(&context).await;

        let result = executor
            .execute(&instance, &node(json!({})), &mut step, &DataPacket::null())
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
