//! Subprocess executor
//!
//! Three variants: `embedded` runs a nested node graph inline within the
//! parent instance, `call_activity` spawns an independent child instance
//! and optionally parks the step until the child completes, and `event`
//! parks the step until a matching `dispatch_event` call arrives.
//!
//! `call_activity` does not spawn the child here. The parent's instance
//! lock is held during execution and the child may finish synchronously,
//! which would resume the parent and re-enter that lock. The executor
//! instead parks the step with a spawn marker; the engine creates the
//! child after releasing the lock.
//!
//! The executor holds a weak handle to the engine for embedded graphs;
//! the engine owns the registry that in turn owns this executor, and the
//! cycle is broken by `Arc::new_cyclic`.

use crate::domain::definition::{
    DefinitionStatus, EdgeDefinition, NodeDefinition, ProcessDefinition, ProcessDefinitionId,
};
use crate::domain::instance::{Priority, ProcessInstance};
use crate::domain::step::ProcessStep;
use crate::engine::ProcessEngine;
use crate::executors::{ExecutionOutcome, NodeExecutor};
use crate::{DataPacket, EngineError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::Weak;

/// Event-name prefix used to resume a parent waiting on a child instance
pub(crate) const CHILD_COMPLETED_PREFIX: &str = "subprocess.completed.";

#[derive(Debug, Deserialize, Default)]
struct SubprocessProperties {
    subprocess_type: Option<String>,
    // embedded
    #[serde(default)]
    nodes: Vec<NodeDefinition>,
    #[serde(default)]
    edges: Vec<EdgeDefinition>,
    // call_activity
    definition_id: Option<String>,
    #[serde(default = "default_wait")]
    wait_for_completion: bool,
    #[serde(default)]
    priority: Priority,
    // event
    event_name: Option<String>,
}

fn default_wait() -> bool {
    true
}

/// Executor for subprocess nodes
pub struct SubprocessExecutor {
    engine: Weak<ProcessEngine>,
}

impl SubprocessExecutor {
    /// Create a subprocess executor over a weak engine handle
    pub fn new(engine: Weak<ProcessEngine>) -> Self {
        Self { engine }
    }

    fn engine(&self) -> Result<std::sync::Arc<ProcessEngine>, EngineError> {
        self.engine
            .upgrade()
            .ok_or_else(|| EngineError::Other("Engine has been dropped".to_string()))
    }
}

#[async_trait]
impl NodeExecutor for SubprocessExecutor {
    async fn execute(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        step: &mut ProcessStep,
        input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError> {
        let props: SubprocessProperties = super::parse_properties(&node.properties)?;
        let kind = props.subprocess_type.as_deref().ok_or_else(|| {
            EngineError::Validation(
                "Subprocess node requires a 'subprocess_type' property".to_string(),
            )
        })?;

        match kind {
            "embedded" => {
                let graph = ProcessDefinition {
                    id: ProcessDefinitionId(format!("{}@{}", instance.definition_id, node.id)),
                    name: format!("embedded graph of node '{}'", node.id),
                    version: 1,
                    status: DefinitionStatus::Active,
                    nodes: props.nodes,
                    edges: props.edges,
                };
                graph.validate()?;
                let output = self.engine()?.run_embedded(instance, &graph, input).await?;
                Ok(ExecutionOutcome::Completed(output))
            }
            "call_activity" => {
                let definition_id = props.definition_id.ok_or_else(|| {
                    EngineError::Validation(
                        "call_activity requires a 'definition_id' property".to_string(),
                    )
                })?;
                Ok(ExecutionOutcome::Waiting(DataPacket::new(json!({
                    "spawn": {
                        "definition_id": definition_id,
                        "wait": props.wait_for_completion,
                        "priority": props.priority,
                    },
                }))))
            }
            "event" => {
                let event_name = props.event_name.ok_or_else(|| {
                    EngineError::Validation(
                        "Event subprocess requires an 'event_name' property".to_string(),
                    )
                })?;
                step.waiting_event = Some(event_name.clone());
                Ok(ExecutionOutcome::Waiting(DataPacket::new(json!({
                    "waiting_for_event": event_name,
                }))))
            }
            other => Err(EngineError::Validation(format!(
                "Unsupported subprocess_type '{}'",
                other
            ))),
        }
    }
}
