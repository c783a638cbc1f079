//! Approval executor
//!
//! Opens an approval chain through the chain manager, records the chain id
//! on the step, and parks the step until decisions arrive via
//! `submit_approval_decision`.

use crate::approval::{ApprovalChainManager, ChainConfig};
use crate::domain::definition::NodeDefinition;
use crate::domain::instance::ProcessInstance;
use crate::domain::step::ProcessStep;
use crate::executors::{ExecutionOutcome, NodeExecutor};
use crate::{DataPacket, EngineError};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Executor for approval nodes
pub struct ApprovalExecutor {
    chains: Arc<ApprovalChainManager>,
}

impl ApprovalExecutor {
    /// Create an approval executor
    pub fn new(chains: Arc<ApprovalChainManager>) -> Self {
        Self { chains }
    }
}

#[async_trait]
impl NodeExecutor for ApprovalExecutor {
    async fn execute(
        &self,
        instance: &ProcessInstance,
        node: &NodeDefinition,
        step: &mut ProcessStep,
        input: &DataPacket,
    ) -> Result<ExecutionOutcome, EngineError> {
        let config: ChainConfig =
            serde_json::from_value(node.properties.clone()).map_err(|e| {
                EngineError::Validation(format!(
                    "Approval node '{}' has invalid chain configuration: {}",
                    node.id, e
                ))
            })?;

        let (chain, requests) = self
            .chains
            .create_chain(instance, &step.id, &config, input.clone())
            .await?;

        step.approval_chain_id = Some(chain.id.0.clone());

        let approvers: Vec<&str> = requests
            .iter()
            .map(|r| r.approver_id.0.as_str())
            .collect();
        Ok(ExecutionOutcome::Waiting(DataPacket::new(json!({
            "chain_id": chain.id.0,
            "chain_type": chain.chain_type,
            "initial_approvers": approvers,
        }))))
    }
}
