//! Repository and collaborator traits for the Conveyor engine
//!
//! The engine owns no persistence and no scheduling of its own: everything
//! durable or delayed goes through these traits. Host applications
//! implement them over their relational store and distributed task queue;
//! the `testing` feature provides in-memory versions for tests and
//! single-node embedding.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::context::InstanceContext;
use crate::domain::approval::{ApprovalChain, ApprovalRequest, ChainId, RequestId};
use crate::domain::definition::{NodeId, ProcessDefinition, ProcessDefinitionId};
use crate::domain::instance::{InstanceStatus, ProcessInstance, ProcessInstanceId, TenantId, UserId};
use crate::domain::step::{ProcessStep, StepId};
use crate::{DataPacket, EngineError};

/// Repository for process definitions
#[async_trait]
pub trait DefinitionRepository: Send + Sync {
    /// Find a definition by ID
    async fn find_by_id(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, EngineError>;

    /// Save a definition
    async fn save(&self, definition: &ProcessDefinition) -> Result<(), EngineError>;

    /// List all definition IDs
    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, EngineError>;
}

/// Repository for process instances
#[async_trait]
pub trait InstanceRepository: Send + Sync {
    /// Find an instance by ID
    async fn find_by_id(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, EngineError>;

    /// Save an instance
    async fn save(&self, instance: &ProcessInstance) -> Result<(), EngineError>;

    /// List instances with optional filters
    async fn list_instances(
        &self,
        definition_id: Option<&ProcessDefinitionId>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<ProcessInstance>, EngineError>;

    /// Find call-activity children of an instance
    async fn find_children(
        &self,
        parent_id: &ProcessInstanceId,
    ) -> Result<Vec<ProcessInstance>, EngineError>;
}

/// Repository for process steps
#[async_trait]
pub trait StepRepository: Send + Sync {
    /// Find a step by ID
    async fn find_by_id(&self, id: &StepId) -> Result<Option<ProcessStep>, EngineError>;

    /// Save a step
    async fn save(&self, step: &ProcessStep) -> Result<(), EngineError>;

    /// All steps of an instance, in creation order
    async fn find_by_instance(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<Vec<ProcessStep>, EngineError>;

    /// Steps parked in `waiting` on the given event name
    async fn find_waiting_for_event(
        &self,
        event_name: &str,
    ) -> Result<Vec<ProcessStep>, EngineError>;
}

/// Repository for approval chains and requests
#[async_trait]
pub trait ApprovalRepository: Send + Sync {
    /// Save a chain
    async fn save_chain(&self, chain: &ApprovalChain) -> Result<(), EngineError>;

    /// Find a chain by ID
    async fn find_chain(&self, id: &ChainId) -> Result<Option<ApprovalChain>, EngineError>;

    /// Save a request
    async fn save_request(&self, request: &ApprovalRequest) -> Result<(), EngineError>;

    /// Find a request by ID
    async fn find_request(&self, id: &RequestId) -> Result<Option<ApprovalRequest>, EngineError>;

    /// All requests of a chain, ordered by `order_index`
    async fn find_requests_by_chain(
        &self,
        chain_id: &ChainId,
    ) -> Result<Vec<ApprovalRequest>, EngineError>;

    /// Pending requests whose `expires_at` is at or before `now`
    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, EngineError>;
}

/// Durable backing store for per-instance context
#[async_trait]
pub trait ContextRepository: Send + Sync {
    /// Load the context of an instance
    async fn load(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<Option<InstanceContext>, EngineError>;

    /// Persist the context of an instance
    async fn save(
        &self,
        instance_id: &ProcessInstanceId,
        context: &InstanceContext,
    ) -> Result<(), EngineError>;

    /// Remove the context of an instance
    async fn delete(&self, instance_id: &ProcessInstanceId) -> Result<(), EngineError>;
}

/// A unit of work handed to the abstract task queue
///
/// The queue implementation delivers payloads back to the engine through
/// [`crate::engine::ProcessEngine::handle_callback`]; the engine itself
/// holds no timers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueuePayload {
    /// Execute one node of a running instance
    ExecuteNode {
        /// Target instance
        instance_id: ProcessInstanceId,
        /// Node to execute
        node_id: NodeId,
        /// Input for the node
        input: DataPacket,
    },
    /// A timer step's due time arrived
    TimerDue {
        /// The waiting timer step
        step_id: StepId,
    },
    /// Retry a failed node with backoff
    RetryStep {
        /// Target instance
        instance_id: ProcessInstanceId,
        /// Node to retry
        node_id: NodeId,
        /// Input for the node
        input: DataPacket,
        /// Attempt number, 1-based
        attempt: u32,
    },
    /// Run the approval timeout sweep
    SweepApprovals,
}

/// Abstract distributed task queue
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a unit of work for immediate execution on any worker
    async fn enqueue(&self, payload: QueuePayload) -> Result<(), EngineError>;

    /// Deliver a payload back after the given delay
    async fn schedule_callback(
        &self,
        delay: Duration,
        payload: QueuePayload,
    ) -> Result<(), EngineError>;

    /// Deliver a payload back at an absolute time
    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        payload: QueuePayload,
    ) -> Result<(), EngineError>;
}

/// Selection rule when resolving a role to approvers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RoleSelection {
    /// First member of the role
    #[default]
    First,
    /// Every member of the role
    All,
}

/// User and role resolver for assignee and approver lookups
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Members of a role within a tenant
    async fn resolve_role(
        &self,
        tenant_id: &TenantId,
        role: &str,
    ) -> Result<Vec<UserId>, EngineError>;

    /// A user's manager, if known
    async fn manager_of(&self, user_id: &UserId) -> Result<Option<UserId>, EngineError>;

    /// Administrative fallback approver for a tenant
    async fn tenant_admin(&self, tenant_id: &TenantId) -> Result<Option<UserId>, EngineError>;
}

/// Fire-and-forget notification sender; failures are logged, never fatal
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// Send one notification
    async fn notify(&self, user_id: &UserId, subject: &str, body: &str)
        -> Result<(), EngineError>;
}

/// Accessor for the caller's active tenant
pub trait TenantContext: Send + Sync {
    /// The tenant the current caller acts for
    fn active_tenant(&self) -> Option<TenantId>;
}

/// In-memory implementations for testing and single-node embedding
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory definition repository
    #[derive(Default)]
    pub struct MemoryDefinitionRepository {
        definitions: DashMap<String, ProcessDefinition>,
    }

    impl MemoryDefinitionRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DefinitionRepository for MemoryDefinitionRepository {
        async fn find_by_id(
            &self,
            id: &ProcessDefinitionId,
        ) -> Result<Option<ProcessDefinition>, EngineError> {
            Ok(self.definitions.get(&id.0).map(|d| d.clone()))
        }

        async fn save(&self, definition: &ProcessDefinition) -> Result<(), EngineError> {
            self.definitions
                .insert(definition.id.0.clone(), definition.clone());
            Ok(())
        }

        async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, EngineError> {
            Ok(self
                .definitions
                .iter()
                .map(|entry| ProcessDefinitionId(entry.key().clone()))
                .collect())
        }
    }

    /// In-memory instance repository
    #[derive(Default)]
    pub struct MemoryInstanceRepository {
        instances: DashMap<String, ProcessInstance>,
    }

    impl MemoryInstanceRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl InstanceRepository for MemoryInstanceRepository {
        async fn find_by_id(
            &self,
            id: &ProcessInstanceId,
        ) -> Result<Option<ProcessInstance>, EngineError> {
            Ok(self.instances.get(&id.0).map(|i| i.clone()))
        }

        async fn save(&self, instance: &ProcessInstance) -> Result<(), EngineError> {
            self.instances.insert(instance.id.0.clone(), instance.clone());
            Ok(())
        }

        async fn list_instances(
            &self,
            definition_id: Option<&ProcessDefinitionId>,
            status: Option<InstanceStatus>,
        ) -> Result<Vec<ProcessInstance>, EngineError> {
            Ok(self
                .instances
                .iter()
                .filter(|entry| {
                    definition_id.map_or(true, |d| &entry.definition_id == d)
                        && status.map_or(true, |s| entry.status == s)
                })
                .map(|entry| entry.clone())
                .collect())
        }

        async fn find_children(
            &self,
            parent_id: &ProcessInstanceId,
        ) -> Result<Vec<ProcessInstance>, EngineError> {
            Ok(self
                .instances
                .iter()
                .filter(|entry| entry.parent_instance_id.as_ref() == Some(parent_id))
                .map(|entry| entry.clone())
                .collect())
        }
    }

    /// In-memory step repository, preserving creation order per instance
    #[derive(Default)]
    pub struct MemoryStepRepository {
        steps: DashMap<String, ProcessStep>,
        order: Mutex<Vec<String>>,
    }

    impl MemoryStepRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl StepRepository for MemoryStepRepository {
        async fn find_by_id(&self, id: &StepId) -> Result<Option<ProcessStep>, EngineError> {
            Ok(self.steps.get(&id.0).map(|s| s.clone()))
        }

        async fn save(&self, step: &ProcessStep) -> Result<(), EngineError> {
            if self.steps.insert(step.id.0.clone(), step.clone()).is_none() {
                let mut order = self
                    .order
                    .lock()
                    .map_err(|e| EngineError::Storage(format!("step order lock: {}", e)))?;
                order.push(step.id.0.clone());
            }
            Ok(())
        }

        async fn find_by_instance(
            &self,
            instance_id: &ProcessInstanceId,
        ) -> Result<Vec<ProcessStep>, EngineError> {
            let order = self
                .order
                .lock()
                .map_err(|e| EngineError::Storage(format!("step order lock: {}", e)))?;
            Ok(order
                .iter()
                .filter_map(|id| self.steps.get(id))
                .filter(|step| &step.instance_id == instance_id)
                .map(|step| step.clone())
                .collect())
        }

        async fn find_waiting_for_event(
            &self,
            event_name: &str,
        ) -> Result<Vec<ProcessStep>, EngineError> {
            Ok(self
                .steps
                .iter()
                .filter(|entry| {
                    entry.status == crate::domain::step::StepStatus::Waiting
                        && entry.waiting_event.as_deref() == Some(event_name)
                })
                .map(|entry| entry.clone())
                .collect())
        }
    }

    /// In-memory approval repository
    #[derive(Default)]
    pub struct MemoryApprovalRepository {
        chains: DashMap<String, ApprovalChain>,
        requests: DashMap<String, ApprovalRequest>,
    }

    impl MemoryApprovalRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ApprovalRepository for MemoryApprovalRepository {
        async fn save_chain(&self, chain: &ApprovalChain) -> Result<(), EngineError> {
            self.chains.insert(chain.id.0.clone(), chain.clone());
            Ok(())
        }

        async fn find_chain(&self, id: &ChainId) -> Result<Option<ApprovalChain>, EngineError> {
            Ok(self.chains.get(&id.0).map(|c| c.clone()))
        }

        async fn save_request(&self, request: &ApprovalRequest) -> Result<(), EngineError> {
            self.requests.insert(request.id.0.clone(), request.clone());
            Ok(())
        }

        async fn find_request(
            &self,
            id: &RequestId,
        ) -> Result<Option<ApprovalRequest>, EngineError> {
            Ok(self.requests.get(&id.0).map(|r| r.clone()))
        }

        async fn find_requests_by_chain(
            &self,
            chain_id: &ChainId,
        ) -> Result<Vec<ApprovalRequest>, EngineError> {
            let mut requests: Vec<ApprovalRequest> = self
                .requests
                .iter()
                .filter(|entry| &entry.chain_id == chain_id)
                .map(|entry| entry.clone())
                .collect();
            requests.sort_by_key(|r| r.order_index);
            Ok(requests)
        }

        async fn find_expired_pending(
            &self,
            now: DateTime<Utc>,
        ) -> Result<Vec<ApprovalRequest>, EngineError> {
            Ok(self
                .requests
                .iter()
                .filter(|entry| {
                    entry.status == crate::domain::approval::RequestStatus::Pending
                        && entry.expires_at.is_some_and(|at| at <= now)
                })
                .map(|entry| entry.clone())
                .collect())
        }
    }

    /// In-memory context repository
    #[derive(Default)]
    pub struct MemoryContextRepository {
        contexts: DashMap<String, InstanceContext>,
    }

    impl MemoryContextRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl ContextRepository for MemoryContextRepository {
        async fn load(
            &self,
            instance_id: &ProcessInstanceId,
        ) -> Result<Option<InstanceContext>, EngineError> {
            Ok(self.contexts.get(&instance_id.0).map(|c| c.clone()))
        }

        async fn save(
            &self,
            instance_id: &ProcessInstanceId,
            context: &InstanceContext,
        ) -> Result<(), EngineError> {
            self.contexts.insert(instance_id.0.clone(), context.clone());
            Ok(())
        }

        async fn delete(&self, instance_id: &ProcessInstanceId) -> Result<(), EngineError> {
            self.contexts.remove(&instance_id.0);
            Ok(())
        }
    }

    /// A scheduled entry in the in-memory task queue
    #[derive(Debug, Clone)]
    pub struct ScheduledPayload {
        /// Delivery time; `None` for immediate enqueue
        pub due_at: Option<DateTime<Utc>>,
        /// The work itself
        pub payload: QueuePayload,
    }

    /// In-memory task queue that records work instead of running it
    ///
    /// Tests drain the recorded payloads and feed them back through
    /// `ProcessEngine::handle_callback`, standing in for the distributed
    /// queue's delivery loop.
    #[derive(Default)]
    pub struct MemoryTaskQueue {
        scheduled: Mutex<Vec<ScheduledPayload>>,
    }

    impl MemoryTaskQueue {
        /// Create an empty queue
        pub fn new() -> Self {
            Self::default()
        }

        /// Take everything scheduled so far
        pub fn drain(&self) -> Vec<ScheduledPayload> {
            match self.scheduled.lock() {
                Ok(mut scheduled) => std::mem::take(&mut *scheduled),
                Err(_) => Vec::new(),
            }
        }

        fn push(&self, entry: ScheduledPayload) -> Result<(), EngineError> {
            let mut scheduled = self
                .scheduled
                .lock()
                .map_err(|e| EngineError::TaskQueue(format!("queue lock: {}", e)))?;
            scheduled.push(entry);
            Ok(())
        }
    }

    #[async_trait]
    impl TaskQueue for MemoryTaskQueue {
        async fn enqueue(&self, payload: QueuePayload) -> Result<(), EngineError> {
            self.push(ScheduledPayload {
                due_at: None,
                payload,
            })
        }

        async fn schedule_callback(
            &self,
            delay: Duration,
            payload: QueuePayload,
        ) -> Result<(), EngineError> {
            let due_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| EngineError::TaskQueue(format!("bad delay: {}", e)))?;
            self.push(ScheduledPayload {
                due_at: Some(due_at),
                payload,
            })
        }

        async fn schedule_at(
            &self,
            at: DateTime<Utc>,
            payload: QueuePayload,
        ) -> Result<(), EngineError> {
            self.push(ScheduledPayload {
                due_at: Some(at),
                payload,
            })
        }
    }

    /// Static user directory backed by plain maps
    #[derive(Default)]
    pub struct StaticUserDirectory {
        roles: HashMap<(String, String), Vec<UserId>>,
        managers: HashMap<String, UserId>,
        admins: HashMap<String, UserId>,
    }

    impl StaticUserDirectory {
        /// Create an empty directory
        pub fn new() -> Self {
            Self::default()
        }

        /// Register role members for a tenant
        pub fn with_role(mut self, tenant: &str, role: &str, members: &[&str]) -> Self {
            self.roles.insert(
                (tenant.to_string(), role.to_string()),
                members.iter().map(|m| UserId(m.to_string())).collect(),
            );
            self
        }

        /// Register a user's manager
        pub fn with_manager(mut self, user: &str, manager: &str) -> Self {
            self.managers
                .insert(user.to_string(), UserId(manager.to_string()));
            self
        }

        /// Register a tenant's admin
        pub fn with_admin(mut self, tenant: &str, admin: &str) -> Self {
            self.admins
                .insert(tenant.to_string(), UserId(admin.to_string()));
            self
        }
    }

    #[async_trait]
    impl UserDirectory for StaticUserDirectory {
        async fn resolve_role(
            &self,
            tenant_id: &TenantId,
            role: &str,
        ) -> Result<Vec<UserId>, EngineError> {
            Ok(self
                .roles
                .get(&(tenant_id.0.clone(), role.to_string()))
                .cloned()
                .unwrap_or_default())
        }

        async fn manager_of(&self, user_id: &UserId) -> Result<Option<UserId>, EngineError> {
            Ok(self.managers.get(&user_id.0).cloned())
        }

        async fn tenant_admin(&self, tenant_id: &TenantId) -> Result<Option<UserId>, EngineError> {
            Ok(self.admins.get(&tenant_id.0).cloned())
        }
    }

    /// Notification sender that only logs
    pub struct LoggingNotificationSender;

    #[async_trait]
    impl NotificationSender for LoggingNotificationSender {
        async fn notify(
            &self,
            user_id: &UserId,
            subject: &str,
            _body: &str,
        ) -> Result<(), EngineError> {
            tracing::debug!(user_id = %user_id.0, subject, "Notification sent");
            Ok(())
        }
    }

    /// Tenant context fixed to one tenant, for tests and single-tenant hosts
    pub struct FixedTenant(pub TenantId);

    impl TenantContext for FixedTenant {
        fn active_tenant(&self) -> Option<TenantId> {
            Some(self.0.clone())
        }
    }
}
