//!
//! Conveyor Core - Process execution engine for the Conveyor platform
//!
//! This crate interprets directed-graph process definitions: it starts
//! and drives process instances, dispatches per-node-type executors,
//! enforces the instance and step state machines, runs multi-level
//! approval chains, and isolates per-instance context by tenant.
//!
//! Persistence, queuing, user resolution, and notification are trait
//! boundaries; hosts inject implementations through
//! [`EngineDependencies`]. In-memory implementations suitable for tests
//! and single-node use ship behind the `testing` feature.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - core business models, entities, and rules
pub mod domain;

/// Approval chain orchestration
pub mod approval;

/// Tenant-isolated per-instance context store
pub mod context;

/// The process orchestrator
pub mod engine;

/// Error types
pub mod error;

/// Node executors and their registry
pub mod executors;

/// Allow-listed condition expression evaluation
pub mod expression;

/// Instance and step state machines
pub mod state_machine;

/// Core types
pub mod types;

// Re-export key types
pub use error::EngineError;
pub use types::DataPacket;

pub use engine::{EngineDependencies, ProcessEngine};

pub use approval::{ApprovalChainManager, ApproverSpec, ChainConfig, ConditionalRule};
pub use context::{ContextStore, ContextVariable, InstanceContext};
pub use state_machine::{ConsistencyFinding, StateMachine};

// Re-export main domain types for easy use
pub use domain::approval::{
    ApprovalChain, ApprovalRequest, ChainId, ChainStatus, ChainType, RequestId, RequestStatus,
    TimeoutAction,
};
pub use domain::definition::{
    DefinitionStatus, EdgeDefinition, NodeDefinition, NodeId, NodeType, ProcessDefinition,
    ProcessDefinitionId,
};
pub use domain::events::{LoggingEventHandler, ProcessEvent, ProcessEventHandler};
pub use domain::instance::{
    InstanceStatus, Priority, ProcessInstance, ProcessInstanceId, TenantId, UserId,
};
pub use domain::repository::{
    ApprovalRepository, ContextRepository, DefinitionRepository, InstanceRepository,
    NotificationSender, QueuePayload, RoleSelection, StepRepository, TaskQueue, TenantContext,
    UserDirectory,
};
pub use domain::step::{ProcessStep, StepId, StepStatus};
pub use executors::{ExecutionOutcome, ExecutorRegistry, NodeExecutor, ServiceGateway};
