use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::warn;

use conveyor_core::domain::repository::{QueuePayload, TaskQueue};
use conveyor_core::EngineError;

/// Channel-backed task queue for single-process deployments
///
/// Payloads are delivered to an mpsc receiver; the host runs a loop that
/// feeds them back into `ProcessEngine::handle_callback`. Delayed work is
/// held by a spawned timer task, so delivery needs a live tokio runtime
/// and does not survive a restart.
pub struct ChannelTaskQueue {
    tx: mpsc::Sender<QueuePayload>,
}

impl ChannelTaskQueue {
    /// Create a queue and the receiver the host loop reads from
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<QueuePayload>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    fn deliver_later(&self, delay: Duration, payload: QueuePayload) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(payload).await.is_err() {
                warn!("Task queue receiver dropped; scheduled payload lost");
            }
        });
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(&self, payload: QueuePayload) -> Result<(), EngineError> {
        self.tx
            .send(payload)
            .await
            .map_err(|e| EngineError::TaskQueue(format!("queue closed: {}", e)))
    }

    async fn schedule_callback(
        &self,
        delay: Duration,
        payload: QueuePayload,
    ) -> Result<(), EngineError> {
        self.deliver_later(delay, payload);
        Ok(())
    }

    async fn schedule_at(
        &self,
        at: DateTime<Utc>,
        payload: QueuePayload,
    ) -> Result<(), EngineError> {
        let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.deliver_later(delay, payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::StepId;

    #[tokio::test]
    async fn test_enqueue_delivers_immediately() {
        let (queue, mut rx) = ChannelTaskQueue::new(8);
        queue.enqueue(QueuePayload::SweepApprovals).await.unwrap();
        let payload = rx.recv().await.unwrap();
        assert_eq!(payload, QueuePayload::SweepApprovals);
    }

    #[tokio::test]
    async fn test_scheduled_payload_arrives_after_the_delay() {
        let (queue, mut rx) = ChannelTaskQueue::new(8);
        let payload = QueuePayload::TimerDue {
            step_id: StepId("s1".to_string()),
        };
        queue
            .schedule_callback(Duration::from_millis(20), payload.clone())
            .await
            .unwrap();

        let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, payload);
    }
}
