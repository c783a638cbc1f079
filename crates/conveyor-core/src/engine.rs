//! Process orchestrator
//!
//! Drives instances through their definition graphs: starts them, walks
//! edges, dispatches node executors, applies the state machine, and
//! implements process-level error and retry policy. All mutations of one
//! instance funnel through a per-instance lock; work that crosses instance
//! boundaries (child spawning, parent resumption) is deferred until the
//! current lock is released, so lock acquisition never cycles.

use crate::approval::ApprovalChainManager;
use crate::context::ContextStore;
use crate::domain::approval::{ChainId, ChainStatus, RequestId};
use crate::domain::definition::{
    DefinitionStatus, NodeDefinition, NodeType, ProcessDefinition, ProcessDefinitionId, NodeId,
};
use crate::domain::events::{ProcessEvent, ProcessEventHandler};
use crate::domain::instance::{
    InstanceStatus, Priority, ProcessInstance, ProcessInstanceId, TenantId, UserId,
};
use crate::domain::repository::{
    ApprovalRepository, ContextRepository, DefinitionRepository, InstanceRepository,
    NotificationSender, QueuePayload, StepRepository, TaskQueue, TenantContext, UserDirectory,
};
use crate::domain::step::{ProcessStep, StepId, StepStatus};
use crate::executors::{
    on_timer_due, ApprovalExecutor, ExecutionOutcome, ExecutorRegistry, GatewayExecutor,
    ServiceExecutor, ServiceGateway, SubprocessExecutor, TaskExecutor, TimerExecutor, TimerFire,
    CHILD_COMPLETED_PREFIX,
};
use crate::state_machine::StateMachine;
use crate::{expression, DataPacket, EngineError};
use chrono::Utc;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Collaborators injected into the engine
///
/// Every field is a trait object; hosts provide durable implementations,
/// tests use the in-memory ones.
pub struct EngineDependencies {
    /// Definition storage
    pub definitions: Arc<dyn DefinitionRepository>,
    /// Instance storage
    pub instances: Arc<dyn InstanceRepository>,
    /// Step storage
    pub steps: Arc<dyn StepRepository>,
    /// Approval chain and request storage
    pub approvals: Arc<dyn ApprovalRepository>,
    /// Context variable storage
    pub contexts: Arc<dyn ContextRepository>,
    /// Abstract task queue; `None` enables inline test mode
    pub queue: Option<Arc<dyn TaskQueue>>,
    /// User and role resolver
    pub directory: Arc<dyn UserDirectory>,
    /// Fire-and-forget notifications
    pub notifications: Arc<dyn NotificationSender>,
    /// Caller tenant accessor
    pub tenant: Arc<dyn TenantContext>,
    /// Outbound service call boundary
    pub service_gateway: Arc<dyn ServiceGateway>,
    /// Sink for domain events
    pub event_handler: Arc<dyn ProcessEventHandler>,
}

/// Node-level error policy parsed from node properties
#[derive(Debug, Deserialize, Default)]
struct ErrorPolicy {
    error_strategy: Option<String>,
    #[serde(default = "default_max_attempts")]
    max_attempts: u32,
    #[serde(default = "default_backoff_seconds")]
    backoff_seconds: u64,
    fallback_node: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_seconds() -> u64 {
    10
}

/// How a parked step gets resolved
#[derive(Debug, Clone)]
enum StepResolution {
    Complete(DataPacket),
    Fail(String),
}

/// A unit of work processed under one instance's lock
#[derive(Debug)]
enum Work {
    /// Run a node's executor
    Execute {
        node_id: NodeId,
        input: DataPacket,
        retry_attempt: Option<u32>,
    },
    /// Resolve a waiting step and continue past it
    Finish {
        step_id: StepId,
        resolution: StepResolution,
    },
}

/// Cross-instance work deferred until the current lock is released
enum Followup {
    /// Spawn a call-activity child for a parked parent step
    StartChild {
        parent: ProcessInstanceId,
        step_id: StepId,
        definition_id: ProcessDefinitionId,
        input: DataPacket,
        priority: Priority,
        wait: bool,
    },
    /// Resolve the parent steps waiting on a finished child
    ResumeParent {
        parent: ProcessInstanceId,
        child: ProcessInstanceId,
        resolution: StepResolution,
    },
}

/// The process execution engine
///
/// Constructed once per host process via [`ProcessEngine::new`]; all
/// collaborators are injected, nothing is global.
pub struct ProcessEngine {
    definitions: Arc<dyn DefinitionRepository>,
    instances: Arc<dyn InstanceRepository>,
    steps: Arc<dyn StepRepository>,
    chains: Arc<ApprovalChainManager>,
    context: Arc<ContextStore>,
    state: StateMachine,
    registry: ExecutorRegistry,
    queue: Option<Arc<dyn TaskQueue>>,
    events: Arc<dyn ProcessEventHandler>,
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl ProcessEngine {
    /// Build the engine and its executor registry
    ///
    /// Returns an `Arc` because the subprocess executor holds a weak
    /// handle back to the engine.
    pub fn new(deps: EngineDependencies) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let context = Arc::new(ContextStore::new(
                deps.contexts.clone(),
                deps.tenant.clone(),
            ));
            let chains = Arc::new(ApprovalChainManager::new(
                deps.approvals.clone(),
                deps.directory.clone(),
                deps.notifications.clone(),
            ));

            let mut registry = ExecutorRegistry::new();
            registry.register(
                NodeType::Task,
                Arc::new(TaskExecutor::new(
                    context.clone(),
                    deps.directory.clone(),
                    deps.notifications.clone(),
                )),
            );
            registry.register(
                NodeType::Service,
                Arc::new(ServiceExecutor::new(
                    context.clone(),
                    deps.service_gateway.clone(),
                    deps.notifications.clone(),
                )),
            );
            registry.register(
                NodeType::Gateway,
                Arc::new(GatewayExecutor::new(context.clone())),
            );
            registry.register(
                NodeType::Approval,
                Arc::new(ApprovalExecutor::new(chains.clone())),
            );
            registry.register(
                NodeType::Timer,
                Arc::new(TimerExecutor::new(deps.queue.clone())),
            );
            registry.register(
                NodeType::Subprocess,
                Arc::new(SubprocessExecutor::new(weak.clone())),
            );

            Self {
                definitions: deps.definitions,
                instances: deps.instances,
                steps: deps.steps,
                chains,
                context,
                state: StateMachine::new(),
                registry,
                queue: deps.queue,
                events: deps.event_handler,
                locks: DashMap::new(),
            }
        })
    }

    /// The engine's context store
    pub fn context(&self) -> &Arc<ContextStore> {
        &self.context
    }

    /// The engine's approval chain manager
    pub fn chains(&self) -> &Arc<ApprovalChainManager> {
        &self.chains
    }

    // ---- public operations -------------------------------------------

    /// Start a new instance of a definition and execute its start nodes
    pub async fn start_process(
        &self,
        definition_id: &ProcessDefinitionId,
        input: DataPacket,
        initiator: Option<UserId>,
        priority: Priority,
    ) -> Result<ProcessInstanceId, EngineError> {
        let tenant = self.active_tenant()?;
        let instance = self
            .create_instance(definition_id, input, initiator, priority, tenant, None)
            .await?;
        let instance_id = instance.id.clone();

        let definition = self.load_definition(definition_id).await?;
        let work: VecDeque<Work> = definition
            .start_nodes()
            .into_iter()
            .map(|node| Work::Execute {
                node_id: node.id.clone(),
                input: instance.input_data.clone(),
                retry_attempt: None,
            })
            .collect();

        self.drive(&instance_id, work).await?;
        Ok(instance_id)
    }

    /// Resume a suspended, failed, or cancelled instance
    ///
    /// Re-enters execution at `node_id` or the last-known node. Resuming
    /// an instance that is already running is a state transition error.
    pub async fn resume_process(
        &self,
        instance_id: &ProcessInstanceId,
        node_id: Option<NodeId>,
        resume_data: Option<DataPacket>,
    ) -> Result<bool, EngineError> {
        let resume_node = {
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;

            let mut instance = self.load_instance(instance_id).await?;
            self.state
                .transition_instance(&mut instance, InstanceStatus::Running)?;
            instance.status_reason = None;
            let resume_node = node_id.or_else(|| instance.current_node.clone());
            self.save_instance(&mut instance).await?;
            resume_node
        };

        if let Some(node) = resume_node {
            let input = resume_data.unwrap_or_else(DataPacket::empty_object);
            self.drive(
                instance_id,
                VecDeque::from([Work::Execute {
                    node_id: node,
                    input,
                    retry_attempt: None,
                }]),
            )
            .await?;
        }
        Ok(true)
    }

    /// Pause a running instance
    pub async fn suspend_process(
        &self,
        instance_id: &ProcessInstanceId,
        reason: Option<String>,
    ) -> Result<bool, EngineError> {
        let lock = self.lock_for(instance_id);
        let _guard = lock.lock().await;

        let mut instance = self.load_instance(instance_id).await?;
        self.state
            .transition_instance(&mut instance, InstanceStatus::Suspended)?;
        instance.status_reason = reason;
        self.save_instance(&mut instance).await?;
        Ok(true)
    }

    /// Cancel an instance and its open approval chains
    ///
    /// Cancellation is cooperative: further continuation is rejected, but
    /// an executor already in flight is not interrupted.
    pub async fn cancel_process(
        &self,
        instance_id: &ProcessInstanceId,
        reason: Option<String>,
    ) -> Result<bool, EngineError> {
        let open_chains = {
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;

            let mut instance = self.load_instance(instance_id).await?;
            self.state
                .transition_instance(&mut instance, InstanceStatus::Cancelled)?;
            instance.status_reason = reason;
            self.save_instance(&mut instance).await?;
            self.context.evict(instance_id);

            self.steps
                .find_by_instance(instance_id)
                .await?
                .into_iter()
                .filter(|s| s.status == StepStatus::Waiting)
                .filter_map(|s| s.approval_chain_id)
                .collect::<Vec<_>>()
        };

        for chain_id in open_chains {
            if let Err(e) = self.chains.cancel_chain(&ChainId(chain_id.clone())).await {
                tracing::warn!(
                    instance_id = %instance_id.0,
                    chain_id = %chain_id,
                    error = %e,
                    "Failed to cancel approval chain"
                );
            }
        }
        Ok(true)
    }

    /// Record an approval decision and, when it decides the chain, resume
    /// the step that opened it
    ///
    /// A rejected chain completes its step with `{approved: false}`; the
    /// graph decides what rejection means via edges or a gateway.
    pub async fn submit_approval_decision(
        &self,
        request_id: &RequestId,
        approved: bool,
        approver_id: &UserId,
        comment: Option<String>,
    ) -> Result<ChainStatus, EngineError> {
        let chain_id = self.chains.chain_of_request(request_id).await?;
        let status = self
            .chains
            .process_decision(request_id, approved, approver_id, comment)
            .await?;

        if matches!(status, ChainStatus::Approved | ChainStatus::Rejected) {
            self.resume_decided_chain(&chain_id, status).await?;
        }
        Ok(status)
    }

    /// Delegate a pending approval request to another user
    pub async fn delegate_approval(
        &self,
        request_id: &RequestId,
        delegate_id: &UserId,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.chains.delegate(request_id, delegate_id, reason).await?;
        Ok(())
    }

    /// Resume every subprocess step waiting on the named event
    ///
    /// Returns the ids of the instances that were resumed.
    pub async fn dispatch_event(
        &self,
        event_name: &str,
        event_data: DataPacket,
        tenant_id: Option<&TenantId>,
    ) -> Result<Vec<ProcessInstanceId>, EngineError> {
        let waiting = self.steps.find_waiting_for_event(event_name).await?;
        let mut resumed = Vec::new();

        for step in waiting {
            if step.status != StepStatus::Waiting {
                continue;
            }
            let instance = match self.instances.find_by_id(&step.instance_id).await? {
                Some(instance) => instance,
                None => continue,
            };
            if let Some(tenant) = tenant_id {
                if &instance.tenant_id != tenant {
                    continue;
                }
            }
            if instance.status != InstanceStatus::Running {
                continue;
            }

            self.drive(
                &step.instance_id,
                VecDeque::from([Work::Finish {
                    step_id: step.id.clone(),
                    resolution: StepResolution::Complete(event_data.clone()),
                }]),
            )
            .await?;
            if !resumed.contains(&step.instance_id) {
                resumed.push(step.instance_id.clone());
            }
        }

        tracing::info!(event_name, resumed = resumed.len(), "Event dispatched");
        Ok(resumed)
    }

    /// Complete a waiting user task with its output
    pub async fn complete_external_task(
        &self,
        step_id: &StepId,
        output: DataPacket,
    ) -> Result<(), EngineError> {
        let step = self
            .steps
            .find_by_id(step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Step '{}'", step_id)))?;
        if step.node_type != NodeType::Task {
            return Err(EngineError::Validation(format!(
                "Step '{}' is not a user task",
                step_id
            )));
        }
        if step.status != StepStatus::Waiting {
            return Err(EngineError::StateTransition(format!(
                "Step '{}' is {:?}, not waiting",
                step_id, step.status
            )));
        }

        self.drive(
            &step.instance_id,
            VecDeque::from([Work::Finish {
                step_id: step_id.clone(),
                resolution: StepResolution::Complete(output),
            }]),
        )
        .await
    }

    /// Process one payload delivered back by the task queue
    pub async fn handle_callback(&self, payload: QueuePayload) -> Result<(), EngineError> {
        match payload {
            QueuePayload::ExecuteNode {
                instance_id,
                node_id,
                input,
            } => {
                self.drive(
                    &instance_id,
                    VecDeque::from([Work::Execute {
                        node_id,
                        input,
                        retry_attempt: None,
                    }]),
                )
                .await
            }
            QueuePayload::RetryStep {
                instance_id,
                node_id,
                input,
                attempt,
            } => {
                self.drive(
                    &instance_id,
                    VecDeque::from([Work::Execute {
                        node_id,
                        input,
                        retry_attempt: Some(attempt),
                    }]),
                )
                .await
            }
            QueuePayload::TimerDue { step_id } => self.handle_timer_due(&step_id).await,
            QueuePayload::SweepApprovals => self.sweep_approvals().await,
        }
    }

    /// Run the approval timeout sweep and resume any decided chains
    pub async fn sweep_approvals(&self) -> Result<(), EngineError> {
        let acted = self.chains.sweep_expired().await?;
        for chain_id in acted {
            let status = self.chains.chain_status(&chain_id).await?;
            if matches!(status, ChainStatus::Approved | ChainStatus::Rejected) {
                self.resume_decided_chain(&chain_id, status).await?;
            }
        }
        Ok(())
    }

    // ---- query helpers -----------------------------------------------

    /// Load one instance
    pub async fn get_instance(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<ProcessInstance, EngineError> {
        self.load_instance(instance_id).await
    }

    /// List instances, optionally filtered by definition and status
    pub async fn list_instances(
        &self,
        definition_id: Option<&ProcessDefinitionId>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        self.instances.list_instances(definition_id, status).await
    }

    /// All steps of an instance, in creation order
    pub async fn get_steps(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<Vec<ProcessStep>, EngineError> {
        self.steps.find_by_instance(instance_id).await
    }

    /// Status of an approval chain
    pub async fn get_chain_status(&self, chain_id: &ChainId) -> Result<ChainStatus, EngineError> {
        self.chains.chain_status(chain_id).await
    }

    // ---- internals ---------------------------------------------------

    fn active_tenant(&self) -> Result<TenantId, EngineError> {
        self.context
            .tenant_context()
            .active_tenant()
            .ok_or_else(|| {
                EngineError::ContextIsolation("No active tenant for this call".to_string())
            })
    }

    async fn load_definition(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<ProcessDefinition, EngineError> {
        self.definitions
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Process definition '{}'", id)))
    }

    async fn load_instance(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<ProcessInstance, EngineError> {
        self.instances
            .find_by_id(id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Process instance '{}'", id)))
    }

    async fn save_instance(&self, instance: &mut ProcessInstance) -> Result<(), EngineError> {
        self.instances.save(instance).await?;
        for event in instance.take_events() {
            self.events.handle_event(&event);
        }
        Ok(())
    }

    fn lock_for(&self, instance_id: &ProcessInstanceId) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(instance_id.0.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn emit_step_transition(&self, step: &ProcessStep, from: StepStatus, to: StepStatus) {
        self.events.handle_event(&ProcessEvent::StepTransitioned {
            instance_id: step.instance_id.clone(),
            step_id: step.id.clone(),
            node_id: step.node_id.clone(),
            from,
            to,
            timestamp: Utc::now(),
        });
    }

    async fn transition_step(
        &self,
        step: &mut ProcessStep,
        to: StepStatus,
    ) -> Result<(), EngineError> {
        let from = step.status;
        self.state.transition_step(step, to)?;
        self.steps.save(step).await?;
        self.emit_step_transition(step, from, to);
        Ok(())
    }

    /// Create and persist an instance with its context
    async fn create_instance(
        &self,
        definition_id: &ProcessDefinitionId,
        input: DataPacket,
        initiator: Option<UserId>,
        priority: Priority,
        tenant: TenantId,
        parent: Option<ProcessInstanceId>,
    ) -> Result<ProcessInstance, EngineError> {
        let definition = self.load_definition(definition_id).await?;
        if definition.status != DefinitionStatus::Active {
            return Err(EngineError::Validation(format!(
                "Process definition '{}' is not active",
                definition_id
            )));
        }
        definition.validate()?;
        for node in &definition.nodes {
            if !self.registry.supports(node.node_type) {
                return Err(EngineError::Validation(format!(
                    "No executor registered for node type '{}'",
                    node.node_type
                )));
            }
        }

        let mut instance =
            ProcessInstance::new(definition_id.clone(), tenant, input, initiator, priority);
        instance.parent_instance_id = parent;
        self.save_instance(&mut instance).await?;

        self.context
            .initialize(&instance.id, instance.tenant_id.clone())
            .await?;
        self.context
            .set_system(&instance.id, "system.instance_id", json!(instance.id.0))
            .await?;
        self.context
            .set_system(
                &instance.id,
                "system.definition_id",
                json!(definition_id.0),
            )
            .await?;
        self.context
            .set_system(
                &instance.id,
                "system.tenant_id",
                json!(instance.tenant_id.0),
            )
            .await?;
        self.context
            .set_system(
                &instance.id,
                "system.started_at",
                json!(instance.started_at.to_rfc3339()),
            )
            .await?;

        // Seed the context from the input object; invalid names are skipped
        if let Some(fields) = instance.input_data.as_object() {
            for (name, value) in fields {
                if let Err(e) = self
                    .context
                    .set(&instance.id, name, value.clone(), None)
                    .await
                {
                    tracing::warn!(
                        instance_id = %instance.id.0,
                        variable = %name,
                        error = %e,
                        "Input field not seeded into context"
                    );
                }
            }
        }

        tracing::info!(
            instance_id = %instance.id.0,
            definition_id = %definition_id.0,
            tenant_id = %instance.tenant_id.0,
            "Process instance started"
        );
        Ok(instance)
    }

    /// Process work for one instance, then any cross-instance followups
    async fn drive(
        &self,
        instance_id: &ProcessInstanceId,
        work: VecDeque<Work>,
    ) -> Result<(), EngineError> {
        let mut followups = {
            let lock = self.lock_for(instance_id);
            let _guard = lock.lock().await;
            self.drive_locked(instance_id, work).await?
        };

        while let Some(followup) = followups.pop() {
            let more = self.apply_followup(followup).await?;
            followups.extend(more);
        }
        Ok(())
    }

    async fn apply_followup(&self, followup: Followup) -> Result<Vec<Followup>, EngineError> {
        match followup {
            Followup::StartChild {
                parent,
                step_id,
                definition_id,
                input,
                priority,
                wait,
            } => {
                self.start_child_for_step(parent, step_id, definition_id, input, priority, wait)
                    .await
            }
            Followup::ResumeParent {
                parent,
                child,
                resolution,
            } => {
                let event = format!("{}{}", CHILD_COMPLETED_PREFIX, child);
                let waiting: Vec<StepId> = self
                    .steps
                    .find_by_instance(&parent)
                    .await?
                    .into_iter()
                    .filter(|s| {
                        s.status == StepStatus::Waiting
                            && s.waiting_event.as_deref() == Some(event.as_str())
                    })
                    .map(|s| s.id)
                    .collect();

                let work: VecDeque<Work> = waiting
                    .into_iter()
                    .map(|step_id| Work::Finish {
                        step_id,
                        resolution: resolution.clone(),
                    })
                    .collect();
                if work.is_empty() {
                    return Ok(Vec::new());
                }
                let lock = self.lock_for(&parent);
                let _guard = lock.lock().await;
                self.drive_locked(&parent, work).await
            }
        }
    }

    /// Spawn a call-activity child and stamp or complete the parent step
    async fn start_child_for_step(
        &self,
        parent: ProcessInstanceId,
        step_id: StepId,
        definition_id: ProcessDefinitionId,
        input: DataPacket,
        priority: Priority,
        wait: bool,
    ) -> Result<Vec<Followup>, EngineError> {
        let parent_instance = self.load_instance(&parent).await?;
        let child = self
            .create_instance(
                &definition_id,
                input,
                parent_instance.initiator.clone(),
                priority,
                parent_instance.tenant_id.clone(),
                Some(parent.clone()),
            )
            .await?;
        let child_id = child.id.clone();

        let mut followups = {
            let lock = self.lock_for(&parent);
            let _guard = lock.lock().await;
            let mut step = self
                .steps
                .find_by_id(&step_id)
                .await?
                .ok_or_else(|| EngineError::NotFound(format!("Step '{}'", step_id)))?;

            if wait {
                // Stamp the wait key before the child can possibly finish
                step.waiting_event = Some(format!("{}{}", CHILD_COMPLETED_PREFIX, child_id));
                step.output_data = Some(DataPacket::new(json!({
                    "child_instance_id": child_id.0,
                    "waiting": true,
                })));
                self.steps.save(&step).await?;
                Vec::new()
            } else {
                self.drive_locked(
                    &parent,
                    VecDeque::from([Work::Finish {
                        step_id: step_id.clone(),
                        resolution: StepResolution::Complete(DataPacket::new(json!({
                            "child_instance_id": child_id.0,
                            "waiting": false,
                        }))),
                    }]),
                )
                .await?
            }
        };

        // Now run the child's start nodes
        let definition = self.load_definition(&definition_id).await?;
        let child_work: VecDeque<Work> = definition
            .start_nodes()
            .into_iter()
            .map(|node| Work::Execute {
                node_id: node.id.clone(),
                input: child.input_data.clone(),
                retry_attempt: None,
            })
            .collect();
        {
            let lock = self.lock_for(&child_id);
            let _guard = lock.lock().await;
            followups.extend(self.drive_locked(&child_id, child_work).await?);
        }
        Ok(followups)
    }

    /// The work loop; caller holds the instance lock
    async fn drive_locked(
        &self,
        instance_id: &ProcessInstanceId,
        mut work: VecDeque<Work>,
    ) -> Result<Vec<Followup>, EngineError> {
        let mut followups = Vec::new();

        while let Some(item) = work.pop_front() {
            let mut instance = self.load_instance(instance_id).await?;
            if instance.status != InstanceStatus::Running {
                tracing::debug!(
                    instance_id = %instance_id.0,
                    status = ?instance.status,
                    "Work skipped, instance is not running"
                );
                continue;
            }
            let definition = self.load_definition(&instance.definition_id).await?;

            match item {
                Work::Execute {
                    node_id,
                    input,
                    retry_attempt,
                } => {
                    self.execute_one(
                        &mut instance,
                        &definition,
                        node_id,
                        input,
                        retry_attempt,
                        &mut work,
                        &mut followups,
                    )
                    .await?;
                }
                Work::Finish {
                    step_id,
                    resolution,
                } => {
                    self.finish_one(
                        &mut instance,
                        &definition,
                        step_id,
                        resolution,
                        &mut work,
                        &mut followups,
                    )
                    .await?;
                }
            }
        }

        Ok(followups)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_one(
        &self,
        instance: &mut ProcessInstance,
        definition: &ProcessDefinition,
        node_id: NodeId,
        input: DataPacket,
        retry_attempt: Option<u32>,
        work: &mut VecDeque<Work>,
        followups: &mut Vec<Followup>,
    ) -> Result<(), EngineError> {
        let node = match definition.node(&node_id) {
            Some(node) => node.clone(),
            None => {
                return Err(EngineError::Validation(format!(
                    "Node '{}' does not exist in definition '{}'",
                    node_id, definition.id
                )));
            }
        };

        // Reuse a pending step pre-created for a queued branch, create a
        // fresh one otherwise, or revive the failed one on retry
        let mut step = match retry_attempt {
            None => {
                let pending = self
                    .steps
                    .find_by_instance(&instance.id)
                    .await?
                    .into_iter()
                    .find(|s| s.node_id == node.id && s.status == StepStatus::Pending);
                match pending {
                    Some(step) => step,
                    None => {
                        let step = ProcessStep::new(
                            instance.id.clone(),
                            node.id.clone(),
                            node.node_type,
                            input.clone(),
                        );
                        self.steps.save(&step).await?;
                        step
                    }
                }
            }
            Some(attempt) => {
                let mut failed = self
                    .steps
                    .find_by_instance(&instance.id)
                    .await?
                    .into_iter()
                    .filter(|s| s.node_id == node.id && s.status == StepStatus::Failed)
                    .next_back()
                    .ok_or_else(|| {
                        EngineError::NotFound(format!(
                            "No failed step for node '{}' to retry",
                            node.id
                        ))
                    })?;
                failed.retry_count = attempt;
                failed.error_details = None;
                failed
            }
        };

        self.transition_step(&mut step, StepStatus::Running).await?;

        instance.current_node = Some(node.id.clone());
        instance.last_activity_at = Utc::now();
        self.save_instance(instance).await?;

        match self
            .registry
            .dispatch(instance, &node, &mut step, &input)
            .await
        {
            Ok(ExecutionOutcome::Completed(output)) => {
                step.output_data = Some(output.clone());
                self.transition_step(&mut step, StepStatus::Completed).await?;
                self.continue_edges(instance, definition, &node, output, work, followups)
                    .await?;
            }
            Ok(ExecutionOutcome::Waiting(payload)) => {
                step.output_data = Some(payload.clone());
                self.transition_step(&mut step, StepStatus::Waiting).await?;
                // Call-activity steps hand the spawn to the followup phase
                if let Some(spawn) = payload.as_value().get("spawn") {
                    followups.push(self.parse_spawn(instance, &step, spawn, &input)?);
                }
            }
            Err(error) => {
                self.handle_node_failure(
                    instance, definition, &node, step, &input, error, work, followups,
                )
                .await?;
            }
        }
        Ok(())
    }

    fn parse_spawn(
        &self,
        instance: &ProcessInstance,
        step: &ProcessStep,
        spawn: &Value,
        input: &DataPacket,
    ) -> Result<Followup, EngineError> {
        let definition_id = spawn
            .get("definition_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                EngineError::Validation("Spawn marker lacks a definition_id".to_string())
            })?;
        let wait = spawn.get("wait").and_then(Value::as_bool).unwrap_or(true);
        let priority = spawn
            .get("priority")
            .cloned()
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or(instance.priority);
        Ok(Followup::StartChild {
            parent: instance.id.clone(),
            step_id: step.id.clone(),
            definition_id: ProcessDefinitionId(definition_id.to_string()),
            input: input.clone(),
            priority,
            wait,
        })
    }

    async fn finish_one(
        &self,
        instance: &mut ProcessInstance,
        definition: &ProcessDefinition,
        step_id: StepId,
        resolution: StepResolution,
        work: &mut VecDeque<Work>,
        followups: &mut Vec<Followup>,
    ) -> Result<(), EngineError> {
        let mut step = self
            .steps
            .find_by_id(&step_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Step '{}'", step_id)))?;
        if step.status != StepStatus::Waiting {
            tracing::debug!(
                step_id = %step_id.0,
                status = ?step.status,
                "Finish skipped, step is not waiting"
            );
            return Ok(());
        }
        let node = definition.node(&step.node_id).cloned().ok_or_else(|| {
            EngineError::Validation(format!(
                "Node '{}' does not exist in definition '{}'",
                step.node_id, definition.id
            ))
        })?;

        match resolution {
            StepResolution::Complete(output) => {
                step.output_data = Some(output.clone());
                step.waiting_event = None;
                self.transition_step(&mut step, StepStatus::Completed).await?;
                self.continue_edges(instance, definition, &node, output, work, followups)
                    .await?;
            }
            StepResolution::Fail(message) => {
                let input = step.input_data.clone();
                self.handle_node_failure(
                    instance,
                    definition,
                    &node,
                    step,
                    &input,
                    EngineError::Other(message),
                    work,
                    followups,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Apply the node's configured error strategy
    #[allow(clippy::too_many_arguments)]
    async fn handle_node_failure(
        &self,
        instance: &mut ProcessInstance,
        definition: &ProcessDefinition,
        node: &NodeDefinition,
        mut step: ProcessStep,
        input: &DataPacket,
        error: EngineError,
        work: &mut VecDeque<Work>,
        followups: &mut Vec<Followup>,
    ) -> Result<(), EngineError> {
        let policy: ErrorPolicy =
            crate::executors::parse_properties(&node.properties).unwrap_or_default();
        let message = error.to_string();
        step.error_details = Some(message.clone());
        self.transition_step(&mut step, StepStatus::Failed).await?;

        let strategy = policy.error_strategy.as_deref().unwrap_or("fail_process");
        match strategy {
            "retry" => {
                let next_attempt = step.retry_count + 1;
                if next_attempt <= policy.max_attempts {
                    if let Some(queue) = &self.queue {
                        let backoff = Duration::from_secs(
                            policy.backoff_seconds * u64::from(next_attempt),
                        );
                        queue
                            .schedule_callback(
                                backoff,
                                QueuePayload::RetryStep {
                                    instance_id: instance.id.clone(),
                                    node_id: node.id.clone(),
                                    input: input.clone(),
                                    attempt: next_attempt,
                                },
                            )
                            .await?;
                        tracing::info!(
                            instance_id = %instance.id.0,
                            node_id = %node.id.0,
                            attempt = next_attempt,
                            "Retry scheduled"
                        );
                        return Ok(());
                    }
                }
                // Retries exhausted, or no queue to wait on
                self.fail_instance(instance, message, followups).await
            }
            "skip_step" => {
                tracing::warn!(
                    instance_id = %instance.id.0,
                    node_id = %node.id.0,
                    error = %message,
                    "Step failed, continuing with empty output"
                );
                self.continue_edges(
                    instance,
                    definition,
                    node,
                    DataPacket::empty_object(),
                    work,
                    followups,
                )
                .await
            }
            "alternative_path" => match &policy.fallback_node {
                Some(fallback) => {
                    work.push_back(Work::Execute {
                        node_id: NodeId(fallback.clone()),
                        input: input.clone(),
                        retry_attempt: None,
                    });
                    Ok(())
                }
                None => self.fail_instance(instance, message, followups).await,
            },
            _ => self.fail_instance(instance, message, followups).await,
        }
    }

    async fn fail_instance(
        &self,
        instance: &mut ProcessInstance,
        message: String,
        followups: &mut Vec<Followup>,
    ) -> Result<(), EngineError> {
        instance.record_failure(message.clone());
        self.state
            .transition_instance(instance, InstanceStatus::Failed)?;
        self.save_instance(instance).await?;
        self.context.evict(&instance.id);
        tracing::warn!(
            instance_id = %instance.id.0,
            error = %message,
            "Process instance failed"
        );

        if let Some(parent) = instance.parent_instance_id.clone() {
            followups.push(Followup::ResumeParent {
                parent,
                child: instance.id.clone(),
                resolution: StepResolution::Fail(format!(
                    "Child instance '{}' failed: {}",
                    instance.id, message
                )),
            });
        }
        Ok(())
    }

    /// Walk outgoing edges after a node produced output
    async fn continue_edges(
        &self,
        instance: &mut ProcessInstance,
        definition: &ProcessDefinition,
        node: &NodeDefinition,
        output: DataPacket,
        work: &mut VecDeque<Work>,
        followups: &mut Vec<Followup>,
    ) -> Result<(), EngineError> {
        // A gateway names its winner; edges are not re-evaluated
        if node.node_type == NodeType::Gateway {
            if let Some(target) = output.as_value().get("selected_target").and_then(Value::as_str)
            {
                work.push_back(Work::Execute {
                    node_id: NodeId(target.to_string()),
                    input: output,
                    retry_attempt: None,
                });
                return Ok(());
            }
        }

        let scope = self.edge_scope(&instance.id, &output).await?;
        let mut targets = Vec::new();
        for edge in definition.outgoing_edges(&node.id) {
            let satisfied = match &edge.condition {
                None => true,
                Some(condition) => match expression::evaluate_condition(condition, &scope) {
                    Ok(result) => result,
                    Err(e) => {
                        tracing::debug!(
                            instance_id = %instance.id.0,
                            condition = %condition,
                            error = %e,
                            "Edge condition evaluated false on error"
                        );
                        false
                    }
                },
            };
            if satisfied {
                targets.push(edge.target.clone());
            }
        }

        if targets.is_empty() {
            self.maybe_complete(instance, output, followups).await?;
            return Ok(());
        }

        // First branch runs inline; extra branches go to the queue when
        // one is configured, enabling parallel workers
        let mut targets = targets.into_iter();
        if let Some(first) = targets.next() {
            work.push_back(Work::Execute {
                node_id: first,
                input: output.clone(),
                retry_attempt: None,
            });
        }
        for target in targets {
            match &self.queue {
                Some(queue) => {
                    // A pending step keeps the branch visible to the
                    // completion check until the worker picks it up
                    let target_node = definition.node(&target).ok_or_else(|| {
                        EngineError::Validation(format!(
                            "Edge targets unknown node '{}'",
                            target
                        ))
                    })?;
                    let placeholder = ProcessStep::new(
                        instance.id.clone(),
                        target.clone(),
                        target_node.node_type,
                        output.clone(),
                    );
                    self.steps.save(&placeholder).await?;
                    queue
                        .enqueue(QueuePayload::ExecuteNode {
                            instance_id: instance.id.clone(),
                            node_id: target,
                            input: output.clone(),
                        })
                        .await?;
                }
                None => {
                    work.push_back(Work::Execute {
                        node_id: target,
                        input: output.clone(),
                        retry_attempt: None,
                    });
                }
            }
        }
        Ok(())
    }

    /// Complete the instance when no live step remains
    async fn maybe_complete(
        &self,
        instance: &mut ProcessInstance,
        output: DataPacket,
        followups: &mut Vec<Followup>,
    ) -> Result<(), EngineError> {
        let has_live_steps = self
            .steps
            .find_by_instance(&instance.id)
            .await?
            .iter()
            .any(|s| {
                matches!(
                    s.status,
                    StepStatus::Pending | StepStatus::Running | StepStatus::Waiting
                        | StepStatus::Suspended
                )
            });
        if has_live_steps {
            return Ok(());
        }

        instance.output_data = Some(output.clone());
        self.state
            .transition_instance(instance, InstanceStatus::Completed)?;
        self.save_instance(instance).await?;
        self.context.evict(&instance.id);
        tracing::info!(instance_id = %instance.id.0, "Process instance completed");

        if let Some(parent) = instance.parent_instance_id.clone() {
            followups.push(Followup::ResumeParent {
                parent,
                child: instance.id.clone(),
                resolution: StepResolution::Complete(output),
            });
        }
        Ok(())
    }

    async fn edge_scope(
        &self,
        instance_id: &ProcessInstanceId,
        output: &DataPacket,
    ) -> Result<HashMap<String, Value>, EngineError> {
        let mut scope = self.context.get_all(instance_id).await?;
        if let Some(fields) = output.as_object() {
            for (key, value) in fields {
                scope.insert(key.clone(), value.clone());
            }
        }
        Ok(scope)
    }

    async fn handle_timer_due(&self, step_id: &StepId) -> Result<(), EngineError> {
        let step = match self.steps.find_by_id(step_id).await? {
            Some(step) => step,
            None => return Ok(()),
        };
        if step.status != StepStatus::Waiting {
            return Ok(());
        }
        let instance = self.load_instance(&step.instance_id).await?;
        let definition = self.load_definition(&instance.definition_id).await?;
        let node = definition.node(&step.node_id).ok_or_else(|| {
            EngineError::Validation(format!(
                "Node '{}' does not exist in definition '{}'",
                step.node_id, definition.id
            ))
        })?;

        let resolution = match on_timer_due(node)? {
            TimerFire::Complete(data) => StepResolution::Complete(data),
            TimerFire::Fail(message) => StepResolution::Fail(message),
        };
        self.drive(
            &step.instance_id,
            VecDeque::from([Work::Finish {
                step_id: step_id.clone(),
                resolution,
            }]),
        )
        .await
    }

    async fn resume_decided_chain(
        &self,
        chain_id: &ChainId,
        status: ChainStatus,
    ) -> Result<(), EngineError> {
        let chain = self.chains.chain(chain_id).await?;
        self.events.handle_event(&ProcessEvent::ChainDecided {
            instance_id: chain.instance_id.clone(),
            chain_id: chain_id.clone(),
            status,
            timestamp: Utc::now(),
        });

        let output = DataPacket::new(json!({
            "approved": status == ChainStatus::Approved,
            "chain_id": chain_id.0,
        }));
        self.drive(
            &chain.instance_id,
            VecDeque::from([Work::Finish {
                step_id: chain.step_id.clone(),
                resolution: StepResolution::Complete(output),
            }]),
        )
        .await
    }

    /// Run an embedded subprocess graph inline within the parent instance
    ///
    /// Shares the parent's step bookkeeping but keeps its own visited set;
    /// a node is executed at most once per traversal. Blocking nodes are
    /// rejected.
    pub(crate) async fn run_embedded(
        &self,
        instance: &ProcessInstance,
        graph: &ProcessDefinition,
        input: &DataPacket,
    ) -> Result<DataPacket, EngineError> {
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<(NodeId, DataPacket)> = graph
            .start_nodes()
            .into_iter()
            .map(|n| (n.id.clone(), input.clone()))
            .collect();
        let mut last_output = DataPacket::empty_object();

        while let Some((node_id, node_input)) = queue.pop_front() {
            if !visited.insert(node_id.clone()) {
                continue;
            }
            let node = graph.node(&node_id).ok_or_else(|| {
                EngineError::Validation(format!(
                    "Node '{}' does not exist in embedded graph",
                    node_id
                ))
            })?;

            let mut step = ProcessStep::new(
                instance.id.clone(),
                node.id.clone(),
                node.node_type,
                node_input.clone(),
            );
            self.steps.save(&step).await?;
            self.transition_step(&mut step, StepStatus::Running).await?;

            let outcome = self
                .registry
                .dispatch(instance, node, &mut step, &node_input)
                .await;
            let output = match outcome {
                Ok(ExecutionOutcome::Completed(output)) => output,
                Ok(ExecutionOutcome::Waiting(_)) => {
                    let message = format!(
                        "Embedded subprocess node '{}' would block; blocking nodes are not \
                         permitted in embedded graphs",
                        node.id
                    );
                    step.error_details = Some(message.clone());
                    self.transition_step(&mut step, StepStatus::Failed).await?;
                    return Err(EngineError::Validation(message));
                }
                Err(e) => {
                    self.transition_step(&mut step, StepStatus::Failed).await?;
                    return Err(e);
                }
            };

            step.output_data = Some(output.clone());
            self.transition_step(&mut step, StepStatus::Completed).await?;

            let scope = self.edge_scope(&instance.id, &output).await?;
            for edge in graph.outgoing_edges(&node.id) {
                let satisfied = match &edge.condition {
                    None => true,
                    Some(condition) => {
                        expression::evaluate_condition(condition, &scope).unwrap_or(false)
                    }
                };
                if satisfied {
                    queue.push_back((edge.target.clone(), output.clone()));
                }
            }
            last_output = output;
        }

        Ok(last_output)
    }

    /// Audit one instance's recorded status against its steps
    pub async fn check_consistency(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<Vec<crate::state_machine::ConsistencyFinding>, EngineError> {
        let instance = self.load_instance(instance_id).await?;
        let steps = self.steps.find_by_instance(instance_id).await?;
        Ok(self.state.check_instance_consistency(&instance, &steps))
    }
}
