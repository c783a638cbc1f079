//! Instance- and step-level status transition tables
//!
//! Every status change in the engine goes through this module. Each
//! transition runs exit hooks for the old status, transition hooks for the
//! pair, the mutation itself (with status-specific timestamping), and entry
//! hooks for the new status. Hook failures are logged and swallowed; they
//! never block a transition.

use crate::domain::events::ProcessEvent;
use crate::domain::instance::{InstanceStatus, ProcessInstance};
use crate::domain::step::{ProcessStep, StepStatus};
use crate::EngineError;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Hook invoked around instance transitions
pub type InstanceHook =
    Arc<dyn Fn(&ProcessInstance, InstanceStatus, InstanceStatus) -> Result<(), EngineError> + Send + Sync>;

/// Hook invoked around step transitions
pub type StepHook =
    Arc<dyn Fn(&ProcessStep, StepStatus, StepStatus) -> Result<(), EngineError> + Send + Sync>;

/// A consistency finding from the integrity audit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyFinding {
    /// Instance is completed but has steps that never finished
    CompletedWithUnfinishedSteps {
        /// Offending step IDs
        step_ids: Vec<String>,
    },
    /// Instance is still running although every step already finished
    RunningWithAllStepsFinished,
}

/// Validates and performs status transitions
pub struct StateMachine {
    instance_table: HashMap<InstanceStatus, HashSet<InstanceStatus>>,
    step_table: HashMap<StepStatus, HashSet<StepStatus>>,
    instance_entry_hooks: Vec<InstanceHook>,
    instance_exit_hooks: Vec<InstanceHook>,
    instance_transition_hooks: Vec<InstanceHook>,
    step_entry_hooks: Vec<StepHook>,
    step_exit_hooks: Vec<StepHook>,
    step_transition_hooks: Vec<StepHook>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Build the machine with the standard transition tables
    pub fn new() -> Self {
        use InstanceStatus as I;
        use StepStatus as S;

        let mut instance_table: HashMap<I, HashSet<I>> = HashMap::new();
        instance_table.insert(
            I::Running,
            [I::Completed, I::Failed, I::Suspended, I::Cancelled].into(),
        );
        instance_table.insert(I::Suspended, [I::Running, I::Cancelled, I::Failed].into());
        // Failed and cancelled instances may be restarted
        instance_table.insert(I::Failed, [I::Running].into());
        instance_table.insert(I::Cancelled, [I::Running].into());
        instance_table.insert(I::Completed, HashSet::new());

        let mut step_table: HashMap<S, HashSet<S>> = HashMap::new();
        step_table.insert(S::Pending, [S::Running, S::Skipped, S::Failed].into());
        step_table.insert(
            S::Running,
            [S::Completed, S::Failed, S::Waiting, S::Suspended].into(),
        );
        step_table.insert(
            S::Waiting,
            [S::Running, S::Completed, S::Failed, S::Skipped].into(),
        );
        step_table.insert(S::Suspended, [S::Running, S::Failed].into());
        // Retry path
        step_table.insert(S::Failed, [S::Pending, S::Running].into());
        step_table.insert(S::Completed, HashSet::new());
        step_table.insert(S::Skipped, HashSet::new());

        Self {
            instance_table,
            step_table,
            instance_entry_hooks: Vec::new(),
            instance_exit_hooks: Vec::new(),
            instance_transition_hooks: Vec::new(),
            step_entry_hooks: Vec::new(),
            step_exit_hooks: Vec::new(),
            step_transition_hooks: Vec::new(),
        }
    }

    /// Register an entry hook fired after an instance reaches a new status
    pub fn on_instance_entry(&mut self, hook: InstanceHook) {
        self.instance_entry_hooks.push(hook);
    }

    /// Register an exit hook fired before an instance leaves a status
    pub fn on_instance_exit(&mut self, hook: InstanceHook) {
        self.instance_exit_hooks.push(hook);
    }

    /// Register a transition hook fired between exit and mutation
    pub fn on_instance_transition(&mut self, hook: InstanceHook) {
        self.instance_transition_hooks.push(hook);
    }

    /// Register an entry hook fired after a step reaches a new status
    pub fn on_step_entry(&mut self, hook: StepHook) {
        self.step_entry_hooks.push(hook);
    }

    /// Register an exit hook fired before a step leaves a status
    pub fn on_step_exit(&mut self, hook: StepHook) {
        self.step_exit_hooks.push(hook);
    }

    /// Register a transition hook fired between exit and mutation
    pub fn on_step_transition(&mut self, hook: StepHook) {
        self.step_transition_hooks.push(hook);
    }

    /// Whether the instance table permits `from -> to`
    pub fn can_transition_instance(&self, from: InstanceStatus, to: InstanceStatus) -> bool {
        self.instance_table
            .get(&from)
            .is_some_and(|set| set.contains(&to))
    }

    /// Whether the step table permits `from -> to`
    pub fn can_transition_step(&self, from: StepStatus, to: StepStatus) -> bool {
        self.step_table
            .get(&from)
            .is_some_and(|set| set.contains(&to))
    }

    /// Transition an instance, running hooks and timestamping
    pub fn transition_instance(
        &self,
        instance: &mut ProcessInstance,
        to: InstanceStatus,
    ) -> Result<(), EngineError> {
        let from = instance.status;
        if !self.can_transition_instance(from, to) {
            return Err(EngineError::StateTransition(format!(
                "Instance '{}': {:?} -> {:?} is not permitted",
                instance.id, from, to
            )));
        }

        for hook in &self.instance_exit_hooks {
            if let Err(e) = hook(instance, from, to) {
                tracing::warn!(instance_id = %instance.id.0, error = %e, "Instance exit hook failed");
            }
        }
        for hook in &self.instance_transition_hooks {
            if let Err(e) = hook(instance, from, to) {
                tracing::warn!(instance_id = %instance.id.0, error = %e, "Instance transition hook failed");
            }
        }

        let now = Utc::now();
        instance.status = to;
        instance.last_activity_at = now;
        match to {
            InstanceStatus::Completed
            | InstanceStatus::Failed
            | InstanceStatus::Cancelled => {
                instance.completed_at = Some(now);
            }
            InstanceStatus::Running => {
                // Restart clears the previous outcome
                instance.completed_at = None;
                if matches!(from, InstanceStatus::Failed | InstanceStatus::Cancelled) {
                    instance.retry_count += 1;
                }
            }
            InstanceStatus::Suspended => {}
        }

        instance.record_event(ProcessEvent::InstanceTransitioned {
            instance_id: instance.id.clone(),
            from,
            to,
            timestamp: now,
        });

        for hook in &self.instance_entry_hooks {
            if let Err(e) = hook(instance, from, to) {
                tracing::warn!(instance_id = %instance.id.0, error = %e, "Instance entry hook failed");
            }
        }

        tracing::debug!(
            instance_id = %instance.id.0,
            from = ?from,
            to = ?to,
            "Instance transitioned"
        );
        Ok(())
    }

    /// Transition a step, running hooks and timestamping
    pub fn transition_step(
        &self,
        step: &mut ProcessStep,
        to: StepStatus,
    ) -> Result<(), EngineError> {
        let from = step.status;
        if !self.can_transition_step(from, to) {
            return Err(EngineError::StateTransition(format!(
                "Step '{}' (node '{}'): {:?} -> {:?} is not permitted",
                step.id, step.node_id, from, to
            )));
        }

        for hook in &self.step_exit_hooks {
            if let Err(e) = hook(step, from, to) {
                tracing::warn!(step_id = %step.id.0, error = %e, "Step exit hook failed");
            }
        }
        for hook in &self.step_transition_hooks {
            if let Err(e) = hook(step, from, to) {
                tracing::warn!(step_id = %step.id.0, error = %e, "Step transition hook failed");
            }
        }

        let now = Utc::now();
        step.status = to;
        match to {
            StepStatus::Running => {
                if step.started_at.is_none() {
                    step.started_at = Some(now);
                }
            }
            StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped => {
                step.completed_at = Some(now);
            }
            StepStatus::Pending => {
                // Retry resets per-attempt bookkeeping
                step.completed_at = None;
            }
            StepStatus::Waiting | StepStatus::Suspended => {}
        }

        for hook in &self.step_entry_hooks {
            if let Err(e) = hook(step, from, to) {
                tracing::warn!(step_id = %step.id.0, error = %e, "Step entry hook failed");
            }
        }

        tracing::debug!(
            step_id = %step.id.0,
            node_id = %step.node_id.0,
            from = ?from,
            to = ?to,
            "Step transitioned"
        );
        Ok(())
    }

    /// Flag instances whose recorded status contradicts their steps
    ///
    /// Used for periodic integrity audits; never mutates and never blocks
    /// execution.
    pub fn check_instance_consistency(
        &self,
        instance: &ProcessInstance,
        steps: &[ProcessStep],
    ) -> Vec<ConsistencyFinding> {
        let mut findings = Vec::new();

        if instance.status == InstanceStatus::Completed {
            let unfinished: Vec<String> = steps
                .iter()
                .filter(|s| {
                    !matches!(
                        s.status,
                        StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
                    )
                })
                .map(|s| s.id.0.clone())
                .collect();
            if !unfinished.is_empty() {
                findings.push(ConsistencyFinding::CompletedWithUnfinishedSteps {
                    step_ids: unfinished,
                });
            }
        }

        if instance.status == InstanceStatus::Running
            && !steps.is_empty()
            && steps.iter().all(|s| {
                matches!(
                    s.status,
                    StepStatus::Completed | StepStatus::Skipped | StepStatus::Failed
                )
            })
        {
            findings.push(ConsistencyFinding::RunningWithAllStepsFinished);
        }

        findings
    }
}
