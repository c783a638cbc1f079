//! Timer executor
//!
//! Three modes: `delay` (relative), `schedule` (absolute RFC 3339), and
//! `timeout` (bounds a waiting step). The due time is handed to the
//! abstract task queue as a `TimerDue` callback; the engine holds no
//! timers of its own. Without a queue the executor sleeps inline, capped,
//! which is only acceptable in tests and single-node setups.

use crate::domain::definition::NodeDefinition;
use crate::domain::instance::ProcessInstance;
use crate::domain::repository::{QueuePayload, TaskQueue};
use crate::domain::step::ProcessStep;
use crate::executors::{ExecutionOutcome, NodeExecutor};
use crate::{DataPacket, EngineError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// What a `timeout` timer does to its step when it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimerTimeoutAction {
    /// Fail the step (default)
    #[default]
    Fail,
    /// Complete the step with a timed-out marker
    Complete,
    /// Record a rejection; fails the step like `fail`
    Reject,
}

#[derive(Debug, Deserialize, Default)]
struct TimerProperties {
    timer_type: Option<String>,
    delay_seconds: Option<u64>,
    /// RFC 3339 absolute time for `schedule`
    at: Option<String>,
    timeout_seconds: Option<u64>,
    #[serde(default)]
    timeout_action: TimerTimeoutAction,
}

/// How a due timer resolves its step
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TimerFire {
    /// Complete the step with the given output
    Complete(DataPacket),
    /// Fail the step with the given error text
    Fail(String),
}

/// Resolve what a timer node does when its due time arrives
pub(crate) fn on_timer_due(node: &NodeDefinition) -> Result<TimerFire, EngineError> {
    let props: TimerProperties = super::parse_properties(&node.properties)?;
    let mode = props.timer_type.as_deref().unwrap_or("delay");
    Ok(match mode {
        "timeout" => match props.timeout_action {
            TimerTimeoutAction::Fail | TimerTimeoutAction::Reject => {
                TimerFire::Fail("Step timed out".to_string())
            }
            TimerTimeoutAction::Complete => TimerFire::Complete(DataPacket::new(json!({
                "timed_out": true,
            }))),
        },
        _ => TimerFire::Complete(DataPacket::new(json!({
            "fired_at": Utc::now().to_rfc3339(),
        }))),
    })
}

/// Executor for timer nodes
pub struct TimerExecutor {
    queue: Option<Arc<dyn TaskQueue>>,
    max_inline_wait: Duration,
}

impl TimerExecutor {
    /// Create a timer executor backed by a task queue
    pub fn new(queue: Option<Arc<dyn TaskQueue>>) -> Self {
        Self {
            queue,
            max_inline_wait: Duration::from_secs(30),
        }
    }

    /// Cap for inline waits when no queue is configured
    pub fn with_max_inline_wait(mut self, cap: Duration) -> Self {
        self.max_inline_wait = cap;
        self
    }

    fn due_time(props: &TimerProperties, mode: &str) -> Result<DateTime<Utc>, EngineError> {
        match mode {
            "delay" => {
                let seconds = props.delay_seconds.ok_or_else(|| {
                    EngineError::Validation(
                        "Delay timer requires 'delay_seconds'".to_string(),
                    )
                })?;
                Ok(Utc::now() + chrono::Duration::seconds(seconds as i64))
            }
            "schedule" => {
                let at = props.at.as_deref().ok_or_else(|| {
                    EngineError::Validation("Schedule timer requires 'at'".to_string())
                })?;
                let parsed = DateTime::parse_from_rfc3339(at).map_err(|e| {
                    EngineError::Validation(format!("Invalid schedule time '{}': {}", at, e))
                })?;
                Ok(parsed.with_timezone(&Utc))
            }
            "timeout" => {
                let seconds = props.timeout_seconds.ok_or_else(|| {
                    EngineError::Validation(
                        "Timeout timer requires 'timeout_seconds'".to_string(),
                    )
                })?;
                Ok(Utc::now() + chrono::Duration::seconds(seconds as i64))
            }
            other => Err(EngineError::Validation(format!(
                "Unknown timer_type '{}'",
                other
            ))),
        }
    }
}

#[async_trait]
impl NodeExecutor for TimerExecutor {
    async fn execute(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        step: &mut ProcessStep,
        _input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError> {
        let props: TimerProperties = super::parse_properties(&node.properties)?;
        let mode = props.timer_type.as_deref().unwrap_or("delay").to_string();
        let due = Self::due_time(&props, &mode)?;
        let now = Utc::now();
        step.due_at = Some(due);

        if due <= now {
            // Already due; fire immediately
            return match on_timer_due(node)? {
                TimerFire::Complete(data) => Ok(ExecutionOutcome::Completed(data)),
                TimerFire::Fail(message) => Err(EngineError::Other(message)),
            };
        }

        if let Some(queue) = &self.queue {
            let payload = QueuePayload::TimerDue {
                step_id: step.id.clone(),
            };
            if mode == "schedule" {
                queue.schedule_at(due, payload).await?;
            } else {
                let delay = (due - now)
                    .to_std()
                    .map_err(|e| EngineError::TaskQueue(format!("bad delay: {}", e)))?;
                queue.schedule_callback(delay, payload).await?;
            }
            tracing::debug!(
                instance_id = %instance.id.0,
                step_id = %step.id.0,
                due = %due.to_rfc3339(),
                timer_type = %mode,
                "Timer scheduled"
            );
            return Ok(ExecutionOutcome::Waiting(DataPacket::new(json!({
                "due_at": due.to_rfc3339(),
                "timer_type": mode,
            }))));
        }

        // No queue: wait inline, capped. Test and single-node mode only.
        let wait = (due - now)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .min(self.max_inline_wait);
        tokio::time::sleep(wait).await;
        match on_timer_due(node)? {
            TimerFire::Complete(data) => Ok(ExecutionOutcome::Completed(data)),
            TimerFire::Fail(message) => Err(EngineError::Other(message)),
        }
    }
}
