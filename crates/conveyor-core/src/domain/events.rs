use crate::domain::approval::{ChainId, ChainStatus};
use crate::domain::definition::{NodeId, ProcessDefinitionId};
use crate::domain::instance::{InstanceStatus, ProcessInstanceId};
use crate::domain::step::{StepId, StepStatus};
use chrono::{DateTime, Utc};

/// Domain events raised by instance and step mutations
///
/// Drained by the orchestrator after each save and handed to the configured
/// [`ProcessEventHandler`]; handler failures are logged and never block
/// execution.
#[derive(Debug, Clone)]
pub enum ProcessEvent {
    /// A new instance entered `running`
    InstanceStarted {
        /// Instance that started
        instance_id: ProcessInstanceId,
        /// Definition it executes
        definition_id: ProcessDefinitionId,
        /// When it started
        timestamp: DateTime<Utc>,
    },
    /// An instance changed status
    InstanceTransitioned {
        /// Instance that transitioned
        instance_id: ProcessInstanceId,
        /// Status before
        from: InstanceStatus,
        /// Status after
        to: InstanceStatus,
        /// When it transitioned
        timestamp: DateTime<Utc>,
    },
    /// A step changed status
    StepTransitioned {
        /// Instance the step belongs to
        instance_id: ProcessInstanceId,
        /// Step that transitioned
        step_id: StepId,
        /// Node being visited
        node_id: NodeId,
        /// Status before
        from: StepStatus,
        /// Status after
        to: StepStatus,
        /// When it transitioned
        timestamp: DateTime<Utc>,
    },
    /// An approval chain reached a final status
    ChainDecided {
        /// Instance the chain belongs to
        instance_id: ProcessInstanceId,
        /// The decided chain
        chain_id: ChainId,
        /// Final status
        status: ChainStatus,
        /// When the decision landed
        timestamp: DateTime<Utc>,
    },
}

impl ProcessEvent {
    /// Stable event-type string for logging and routing
    pub fn event_type(&self) -> &'static str {
        match self {
            ProcessEvent::InstanceStarted { .. } => "instance.started",
            ProcessEvent::InstanceTransitioned { .. } => "instance.transitioned",
            ProcessEvent::StepTransitioned { .. } => "step.transitioned",
            ProcessEvent::ChainDecided { .. } => "approval_chain.decided",
        }
    }

    /// Instance the event concerns
    pub fn instance_id(&self) -> &ProcessInstanceId {
        match self {
            ProcessEvent::InstanceStarted { instance_id, .. }
            | ProcessEvent::InstanceTransitioned { instance_id, .. }
            | ProcessEvent::StepTransitioned { instance_id, .. }
            | ProcessEvent::ChainDecided { instance_id, .. } => instance_id,
        }
    }
}

/// Receives drained domain events
pub trait ProcessEventHandler: Send + Sync {
    /// Handle one event; errors are logged by the caller and swallowed
    fn handle_event(&self, event: &ProcessEvent);
}

/// Default handler that logs each event at debug level
pub struct LoggingEventHandler;

impl ProcessEventHandler for LoggingEventHandler {
    fn handle_event(&self, event: &ProcessEvent) {
        tracing::debug!(
            event_type = event.event_type(),
            instance_id = %event.instance_id().0,
            "Domain event"
        );
    }
}
