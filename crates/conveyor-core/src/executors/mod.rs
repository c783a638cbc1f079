//! Node executors
//!
//! One strategy per node type, registered in an [`ExecutorRegistry`] built
//! at engine construction. The registry wraps every execution with
//! pre/post/error hooks and a duration measurement; executor failures are
//! stored on the step and re-raised as [`EngineError::NodeExecution`].

mod approval;
mod gateway;
mod service;
mod subprocess;
mod task;
mod timer;

pub use approval::ApprovalExecutor;
pub use gateway::GatewayExecutor;
pub use service::{ServiceExecutor, ServiceGateway};
pub use subprocess::SubprocessExecutor;
pub use task::TaskExecutor;
pub use timer::{TimerExecutor, TimerTimeoutAction};

pub(crate) use subprocess::CHILD_COMPLETED_PREFIX;
pub(crate) use timer::{on_timer_due, TimerFire};

#[cfg(feature = "testing")]
pub use service::EchoServiceGateway;

use crate::domain::definition::{NodeDefinition, NodeType};
use crate::domain::instance::ProcessInstance;
use crate::domain::step::ProcessStep;
use crate::{DataPacket, EngineError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Parse a node's properties into a typed configuration
///
/// Absent properties deserialize as the type's default rather than
/// failing on JSON null.
pub(crate) fn parse_properties<T>(properties: &serde_json::Value) -> Result<T, EngineError>
where
    T: serde::de::DeserializeOwned + Default,
{
    if properties.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(properties.clone())
        .map_err(|e| EngineError::Validation(format!("Invalid node properties: {}", e)))
}

/// How a node execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The node finished; traversal continues over outgoing edges
    Completed(DataPacket),
    /// The step is parked; an external call resumes this branch later
    ///
    /// The payload describes the wait (assignee, chain id, due time) and
    /// is stored as the step's interim output.
    Waiting(DataPacket),
}

impl ExecutionOutcome {
    /// The output payload regardless of variant
    pub fn data(&self) -> &DataPacket {
        match self {
            ExecutionOutcome::Completed(data) | ExecutionOutcome::Waiting(data) => data,
        }
    }
}

/// Strategy for one node type
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    /// Run the node against the given step and input
    ///
    /// The executor may set bookkeeping fields on the step (assignee,
    /// due time, chain id, waiting event); status transitions are the
    /// orchestrator's job.
    async fn execute(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        step: &mut ProcessStep,
        input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError>;
}

/// Hook fired before an execution
pub type PreExecutionHook =
    Arc<dyn Fn(&ProcessInstance, &NodeDefinition, &ProcessStep) + Send + Sync>;

/// Hook fired after a successful execution
pub type PostExecutionHook =
    Arc<dyn Fn(&ProcessInstance, &NodeDefinition, &ProcessStep, &ExecutionOutcome) + Send + Sync>;

/// Hook fired when an execution fails
pub type ErrorHook =
    Arc<dyn Fn(&ProcessInstance, &NodeDefinition, &ProcessStep, &EngineError) + Send + Sync>;

/// Type-to-executor map with execution hooks
///
/// Built once at startup; the closed [`NodeType`] set means a missing
/// registration is a configuration error caught at definition validation.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<NodeType, Arc<dyn NodeExecutor>>,
    pre_hooks: Vec<PreExecutionHook>,
    post_hooks: Vec<PostExecutionHook>,
    error_hooks: Vec<ErrorHook>,
}

impl ExecutorRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the executor for a node type, replacing any previous one
    pub fn register(&mut self, node_type: NodeType, executor: Arc<dyn NodeExecutor>) {
        self.executors.insert(node_type, executor);
    }

    /// Whether a node type has a registered executor
    pub fn supports(&self, node_type: NodeType) -> bool {
        self.executors.contains_key(&node_type)
    }

    /// Register a pre-execution hook
    pub fn on_pre_execute(&mut self, hook: PreExecutionHook) {
        self.pre_hooks.push(hook);
    }

    /// Register a post-execution hook
    pub fn on_post_execute(&mut self, hook: PostExecutionHook) {
        self.post_hooks.push(hook);
    }

    /// Register an error hook
    pub fn on_error(&mut self, hook: ErrorHook) {
        self.error_hooks.push(hook);
    }

    /// Execute a node through its registered executor
    ///
    /// Failures are recorded on the step's `error_details` and wrapped as
    /// [`EngineError::NodeExecution`] with node and instance ids.
    pub async fn dispatch(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        step: &mut ProcessStep,
        input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError> {
        let executor = self.executors.get(&node.node_type).ok_or_else(|| {
            EngineError::Validation(format!(
                "No executor registered for node type '{}'",
                node.node_type
            ))
        })?;

        for hook in &self.pre_hooks {
            hook(instance, node, step);
        }

        let started = Instant::now();
        let result = executor.execute(instance, node, step, input).await;
        let elapsed_ms = started.elapsed().as_millis();

        match result {
            Ok(outcome) => {
                tracing::debug!(
                    instance_id = %instance.id.0,
                    node_id = %node.id.0,
                    node_type = %node.node_type,
                    elapsed_ms,
                    waiting = matches!(outcome, ExecutionOutcome::Waiting(_)),
                    "Node executed"
                );
                for hook in &self.post_hooks {
                    hook(instance, node, step, &outcome);
                }
                Ok(outcome)
            }
            Err(e) => {
                let wrapped = match e {
                    already @ EngineError::NodeExecution { .. } => already,
                    other => EngineError::NodeExecution {
                        node_id: node.id.0.clone(),
                        instance_id: instance.id.0.clone(),
                        message: other.to_string(),
                    },
                };
                step.error_details = Some(wrapped.to_string());
                tracing::warn!(
                    instance_id = %instance.id.0,
                    node_id = %node.id.0,
                    node_type = %node.node_type,
                    elapsed_ms,
                    error = %wrapped,
                    "Node execution failed"
                );
                for hook in &self.error_hooks {
                    hook(instance, node, step, &wrapped);
                }
                Err(wrapped)
            }
        }
    }
}
