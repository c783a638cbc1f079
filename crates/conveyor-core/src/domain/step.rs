use crate::domain::definition::{NodeId, NodeType};
use crate::domain::instance::{ProcessInstanceId, UserId};
use crate::DataPacket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: Step ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Step status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Created, not yet started
    Pending,
    /// Executor in flight
    Running,
    /// Finished with output
    Completed,
    /// Finished with an error
    Failed,
    /// Bypassed by error strategy or condition
    Skipped,
    /// Suspended awaiting external input
    Waiting,
    /// Paused together with its instance
    Suspended,
}

impl StepStatus {
    /// Whether this status ends the step's lifecycle
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

/// Execution record for one node visit
///
/// Created when the orchestrator begins a node, mutated by the owning
/// executor, never deleted while the instance is retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStep {
    /// Unique identifier
    pub id: StepId,

    /// Instance this step belongs to
    pub instance_id: ProcessInstanceId,

    /// Node being visited
    pub node_id: NodeId,

    /// Node type, denormalized for querying
    pub node_type: NodeType,

    /// Current status
    pub status: StepStatus,

    /// Input handed to the executor
    pub input_data: DataPacket,

    /// Output reported by the executor
    pub output_data: Option<DataPacket>,

    /// Start timestamp, set on first transition to running
    pub started_at: Option<DateTime<Utc>>,

    /// Completion timestamp
    pub completed_at: Option<DateTime<Utc>>,

    /// Deadline for waiting steps (task due dates, timer expiry)
    pub due_at: Option<DateTime<Utc>>,

    /// Retries consumed so far
    pub retry_count: u32,

    /// Failure description when status is failed
    pub error_details: Option<String>,

    /// Resolved assignee for task steps
    pub assignee: Option<UserId>,

    /// Approval chain opened by this step, if any
    pub approval_chain_id: Option<String>,

    /// Event name an event-subprocess step is parked on
    pub waiting_event: Option<String>,
}

impl ProcessStep {
    /// Create a pending step for a node visit
    pub fn new(
        instance_id: ProcessInstanceId,
        node_id: NodeId,
        node_type: NodeType,
        input_data: DataPacket,
    ) -> Self {
        Self {
            id: StepId(Uuid::new_v4().to_string()),
            instance_id,
            node_id,
            node_type,
            status: StepStatus::Pending,
            input_data,
            output_data: None,
            started_at: None,
            completed_at: None,
            due_at: None,
            retry_count: 0,
            error_details: None,
            assignee: None,
            approval_chain_id: None,
            waiting_event: None,
        }
    }
}
