use crate::domain::definition::{NodeId, ProcessDefinitionId};
use crate::domain::events::ProcessEvent;
use crate::DataPacket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: Process instance ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessInstanceId(pub String);

/// Value object: Tenant ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(pub String);

/// Value object: User ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for ProcessInstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Process instance status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance is executing or has branches awaiting external input
    Running,
    /// Instance finished successfully
    Completed,
    /// Instance stopped on an unrecovered error; restartable
    Failed,
    /// Instance paused by an operator
    Suspended,
    /// Instance cancelled; restartable
    Cancelled,
}

/// Scheduling priority for an instance, passed through to the task queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work
    Low,
    /// Default
    #[default]
    Normal,
    /// Expedited
    High,
}

/// Aggregate: one live execution of a process definition
///
/// Owned exclusively by the orchestrator; status is mutated only through
/// the state machine's transition path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInstance {
    /// Unique identifier
    pub id: ProcessInstanceId,

    /// Definition this instance executes
    pub definition_id: ProcessDefinitionId,

    /// Owning tenant
    pub tenant_id: TenantId,

    /// Current status
    pub status: InstanceStatus,

    /// Node the instance most recently entered
    pub current_node: Option<NodeId>,

    /// Data the instance was started with
    pub input_data: DataPacket,

    /// Data produced on completion
    pub output_data: Option<DataPacket>,

    /// User who started the instance
    pub initiator: Option<UserId>,

    /// Scheduling priority
    pub priority: Priority,

    /// Start timestamp
    pub started_at: DateTime<Utc>,

    /// Completion timestamp, set on reaching a terminal-ish status
    pub completed_at: Option<DateTime<Utc>>,

    /// Last time any transition touched this instance
    pub last_activity_at: DateTime<Utc>,

    /// Number of node-level failures recorded against this instance
    pub error_count: u32,

    /// Number of restarts after failure or cancellation
    pub retry_count: u32,

    /// Most recent failure text
    pub last_error: Option<String>,

    /// Reason given for suspension or cancellation
    pub status_reason: Option<String>,

    /// Parent instance for call-activity subprocesses
    pub parent_instance_id: Option<ProcessInstanceId>,

    /// Domain events raised since the last drain
    #[serde(skip)]
    pub events: Vec<ProcessEvent>,
}

impl ProcessInstance {
    /// Create a new running instance
    pub fn new(
        definition_id: ProcessDefinitionId,
        tenant_id: TenantId,
        input_data: DataPacket,
        initiator: Option<UserId>,
        priority: Priority,
    ) -> Self {
        let id = ProcessInstanceId(Uuid::new_v4().to_string());
        let now = Utc::now();

        let mut instance = Self {
            id: id.clone(),
            definition_id: definition_id.clone(),
            tenant_id,
            status: InstanceStatus::Running,
            current_node: None,
            input_data,
            output_data: None,
            initiator,
            priority,
            started_at: now,
            completed_at: None,
            last_activity_at: now,
            error_count: 0,
            retry_count: 0,
            last_error: None,
            status_reason: None,
            parent_instance_id: None,
            events: Vec::new(),
        };

        instance.record_event(ProcessEvent::InstanceStarted {
            instance_id: id,
            definition_id,
            timestamp: now,
        });

        instance
    }

    /// Record a node-level failure against the instance
    pub fn record_failure(&mut self, error: String) {
        self.error_count += 1;
        self.last_error = Some(error);
        self.last_activity_at = Utc::now();
    }

    /// Record a domain event
    pub fn record_event(&mut self, event: ProcessEvent) {
        self.events.push(event);
    }

    /// Drain all recorded domain events
    pub fn take_events(&mut self) -> Vec<ProcessEvent> {
        std::mem::take(&mut self.events)
    }
}
