//! Approval chain manager
//!
//! Builds multi-approver decision chains, advances them on each decision,
//! and handles delegation, escalation, and the timeout sweep. Completion
//! logic lives in exactly one place, [`ApprovalChainManager::process_decision`];
//! the sweep and escalation paths delegate to it rather than re-deciding.

use crate::domain::approval::{
    ApprovalChain, ApprovalRequest, ChainId, ChainStatus, ChainType, RequestId, RequestStatus,
    TimeoutAction,
};
use crate::domain::instance::{ProcessInstance, TenantId, UserId};
use crate::domain::repository::{ApprovalRepository, NotificationSender, RoleSelection, UserDirectory};
use crate::domain::step::StepId;
use crate::expression;
use crate::{DataPacket, EngineError};
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One approver slot in a chain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverSpec {
    /// A direct user id
    User {
        /// The approver
        user_id: UserId,
    },
    /// Members of a role within the instance's tenant
    Role {
        /// Role name
        role: String,
        /// Whether the first member or every member approves
        #[serde(default)]
        selection: RoleSelection,
    },
    /// A constrained lookup against the chain's data snapshot
    ///
    /// The path is a dotted field reference, optionally wrapped in
    /// `${...}`; it must resolve to a user id string or a list of them.
    /// This is a pattern match, not an expression evaluation.
    Dynamic {
        /// Dotted path into the data snapshot
        path: String,
    },
}

/// Rule for resolving a `conditional` chain to a concrete type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalRule {
    /// Condition over the data snapshot
    pub when: String,
    /// Chain type used when the condition holds
    pub chain_type: ChainType,
}

/// Configuration parsed from an approval node's properties
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Aggregation rule; `conditional` is resolved at build time
    pub chain_type: ChainType,

    /// Ordered approver slots
    pub approvers: Vec<ApproverSpec>,

    /// Approvals needed for parallel chains; defaults to all approvers
    #[serde(default)]
    pub approval_threshold: Option<usize>,

    /// Applied to expired pending requests by the sweep
    #[serde(default)]
    pub timeout_action: TimeoutAction,

    /// Seconds before each pending request expires
    #[serde(default)]
    pub timeout_seconds: Option<u64>,

    /// Resolution rules for `conditional` chains, first match wins
    #[serde(default)]
    pub conditional_rules: Vec<ConditionalRule>,
}

/// Builds and advances approval chains
pub struct ApprovalChainManager {
    approvals: Arc<dyn ApprovalRepository>,
    directory: Arc<dyn UserDirectory>,
    notifications: Arc<dyn NotificationSender>,
}

impl ApprovalChainManager {
    /// Create a manager over the given collaborators
    pub fn new(
        approvals: Arc<dyn ApprovalRepository>,
        directory: Arc<dyn UserDirectory>,
        notifications: Arc<dyn NotificationSender>,
    ) -> Self {
        Self {
            approvals,
            directory,
            notifications,
        }
    }

    /// Build a chain for a step and open its initial requests
    ///
    /// Sequential chains open only the first request; the rest of the
    /// approver list is kept on the chain and drained one approval at a
    /// time, so a rejection never creates later requests.
    pub async fn create_chain(
        &self,
        instance: &ProcessInstance,
        step_id: &StepId,
        config: &ChainConfig,
        data: DataPacket,
    ) -> Result<(ApprovalChain, Vec<ApprovalRequest>), EngineError> {
        let chain_type = self.resolve_chain_type(config, &data)?;
        let approvers = self
            .resolve_approvers(&instance.tenant_id, &config.approvers, &data)
            .await?;
        if approvers.is_empty() {
            return Err(EngineError::Validation(
                "Approval chain has no resolvable approvers".to_string(),
            ));
        }

        let threshold = config
            .approval_threshold
            .unwrap_or(approvers.len())
            .min(approvers.len())
            .max(1);

        let mut chain = ApprovalChain::new(
            instance.id.clone(),
            instance.tenant_id.clone(),
            step_id.clone(),
            chain_type,
            threshold,
            config.timeout_action,
            config.timeout_seconds,
            data,
        );

        let expires_at = config
            .timeout_seconds
            .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64));

        let mut requests = Vec::new();
        match chain_type {
            ChainType::Sequential => {
                let mut ordered = approvers.into_iter();
                if let Some(first) = ordered.next() {
                    requests.push(ApprovalRequest::new(
                        chain.id.clone(),
                        first,
                        0,
                        expires_at,
                    ));
                }
                chain.pending_approvers = ordered.collect();
            }
            _ => {
                for (index, approver) in approvers.into_iter().enumerate() {
                    requests.push(ApprovalRequest::new(
                        chain.id.clone(),
                        approver,
                        index,
                        expires_at,
                    ));
                }
            }
        }

        self.approvals.save_chain(&chain).await?;
        for request in &requests {
            self.approvals.save_request(request).await?;
            self.notify_approver(request).await;
        }

        tracing::info!(
            chain_id = %chain.id.0,
            instance_id = %instance.id.0,
            chain_type = ?chain.chain_type,
            open_requests = requests.len(),
            "Approval chain created"
        );
        Ok((chain, requests))
    }

    /// Record one approver's decision and advance the chain
    ///
    /// Returns the chain status after the decision. All timeout actions
    /// and escalated/delegated decisions funnel through here as well.
    pub async fn process_decision(
        &self,
        request_id: &RequestId,
        approved: bool,
        approver_id: &UserId,
        comment: Option<String>,
    ) -> Result<ChainStatus, EngineError> {
        let mut request = self
            .approvals
            .find_request(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Approval request '{}'", request_id)))?;

        if request.status != RequestStatus::Pending {
            return Err(EngineError::ApprovalTransaction(format!(
                "Request '{}' already {:?}",
                request_id, request.status
            )));
        }
        if &request.approver_id != approver_id {
            return Err(EngineError::Validation(format!(
                "Request '{}' is addressed to '{}', not '{}'",
                request_id, request.approver_id, approver_id
            )));
        }

        let mut chain = self
            .approvals
            .find_chain(&request.chain_id)
            .await?
            .ok_or_else(|| {
                EngineError::ApprovalTransaction(format!(
                    "Chain '{}' missing for request '{}'",
                    request.chain_id, request_id
                ))
            })?;
        if chain.status.is_terminal() {
            return Err(EngineError::ApprovalTransaction(format!(
                "Chain '{}' already {:?}",
                chain.id, chain.status
            )));
        }

        request.status = if approved {
            RequestStatus::Approved
        } else {
            RequestStatus::Rejected
        };
        request.decided_at = Some(Utc::now());
        request.comment = comment;
        self.approvals.save_request(&request).await?;

        let status = self.advance_chain(&mut chain, &request).await?;
        tracing::info!(
            chain_id = %chain.id.0,
            request_id = %request_id.0,
            approved,
            chain_status = ?status,
            "Approval decision processed"
        );
        Ok(status)
    }

    /// Reassign a pending request to another approver
    pub async fn delegate(
        &self,
        request_id: &RequestId,
        delegate_id: &UserId,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, EngineError> {
        let mut request = self
            .approvals
            .find_request(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Approval request '{}'", request_id)))?;

        if request.status != RequestStatus::Pending {
            return Err(EngineError::ApprovalTransaction(format!(
                "Request '{}' already {:?}",
                request_id, request.status
            )));
        }
        if !request.delegate_allowed {
            return Err(EngineError::Validation(format!(
                "Request '{}' does not permit delegation",
                request_id
            )));
        }

        request.status = RequestStatus::Delegated;
        request.decided_at = Some(Utc::now());
        request.comment = reason;
        self.approvals.save_request(&request).await?;

        // The delegate inherits position and priority
        let mut delegated = ApprovalRequest::new(
            request.chain_id.clone(),
            delegate_id.clone(),
            request.order_index,
            request.expires_at,
        );
        delegated.priority = request.priority;
        delegated.required = request.required;
        self.approvals.save_request(&delegated).await?;
        self.notify_approver(&delegated).await;

        tracing::info!(
            request_id = %request_id.0,
            delegate = %delegate_id.0,
            "Approval delegated"
        );
        Ok(delegated)
    }

    /// Reassign a stalled request to the approver's manager or a tenant admin
    pub async fn escalate(&self, request_id: &RequestId) -> Result<ApprovalRequest, EngineError> {
        let mut request = self
            .approvals
            .find_request(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Approval request '{}'", request_id)))?;

        if request.status != RequestStatus::Pending {
            return Err(EngineError::ApprovalTransaction(format!(
                "Request '{}' already {:?}",
                request_id, request.status
            )));
        }

        let chain = self
            .approvals
            .find_chain(&request.chain_id)
            .await?
            .ok_or_else(|| {
                EngineError::ApprovalTransaction(format!(
                    "Chain '{}' missing for request '{}'",
                    request.chain_id, request_id
                ))
            })?;

        let target = match self.directory.manager_of(&request.approver_id).await? {
            Some(manager) => manager,
            None => self
                .directory
                .tenant_admin(&chain.tenant_id)
                .await?
                .ok_or_else(|| {
                    EngineError::ApprovalTransaction(format!(
                        "No escalation target for request '{}'",
                        request_id
                    ))
                })?,
        };

        request.status = RequestStatus::Escalated;
        request.decided_at = Some(Utc::now());
        self.approvals.save_request(&request).await?;

        let mut escalated = ApprovalRequest::new(
            request.chain_id.clone(),
            target.clone(),
            request.order_index,
            request.expires_at,
        );
        escalated.priority = request.priority.saturating_add(1);
        escalated.required = true;
        escalated.delegate_allowed = true;
        self.approvals.save_request(&escalated).await?;
        self.notify_approver(&escalated).await;

        tracing::info!(
            request_id = %request_id.0,
            target = %target.0,
            "Approval escalated"
        );
        Ok(escalated)
    }

    /// Apply each chain's timeout action to expired pending requests
    ///
    /// Returns the chains acted upon, deduplicated, so the caller can
    /// check which of them reached a decision.
    pub async fn sweep_expired(&self) -> Result<Vec<ChainId>, EngineError> {
        let expired = self.approvals.find_expired_pending(Utc::now()).await?;
        let mut acted: Vec<ChainId> = Vec::new();

        for request in expired {
            let chain = match self.approvals.find_chain(&request.chain_id).await? {
                Some(chain) if !chain.status.is_terminal() => chain,
                _ => continue,
            };

            let outcome = match chain.timeout_action {
                TimeoutAction::Escalate => self.escalate(&request.id).await.map(|_| ()),
                TimeoutAction::Reject => self
                    .process_decision(
                        &request.id,
                        false,
                        &request.approver_id,
                        Some("Request expired".to_string()),
                    )
                    .await
                    .map(|_| ()),
                TimeoutAction::Approve => self
                    .process_decision(
                        &request.id,
                        true,
                        &request.approver_id,
                        Some("Auto-approved on expiry".to_string()),
                    )
                    .await
                    .map(|_| ()),
            };

            match outcome {
                Ok(()) => {
                    if !acted.contains(&request.chain_id) {
                        acted.push(request.chain_id.clone());
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        request_id = %request.id.0,
                        error = %e,
                        "Timeout sweep failed for request"
                    );
                }
            }
        }

        Ok(acted)
    }

    /// Cancel a chain and all of its pending requests
    pub async fn cancel_chain(&self, chain_id: &ChainId) -> Result<(), EngineError> {
        let mut chain = self
            .approvals
            .find_chain(chain_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Approval chain '{}'", chain_id)))?;
        if chain.status.is_terminal() {
            return Ok(());
        }

        for mut request in self.approvals.find_requests_by_chain(chain_id).await? {
            if request.status == RequestStatus::Pending {
                request.status = RequestStatus::Cancelled;
                request.decided_at = Some(Utc::now());
                self.approvals.save_request(&request).await?;
            }
        }

        chain.status = ChainStatus::Cancelled;
        chain.decided_at = Some(Utc::now());
        chain.pending_approvers.clear();
        self.approvals.save_chain(&chain).await?;
        Ok(())
    }

    /// Current status of a chain
    pub async fn chain_status(&self, chain_id: &ChainId) -> Result<ChainStatus, EngineError> {
        Ok(self.chain(chain_id).await?.status)
    }

    /// Load a chain
    pub async fn chain(&self, chain_id: &ChainId) -> Result<ApprovalChain, EngineError> {
        self.approvals
            .find_chain(chain_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Approval chain '{}'", chain_id)))
    }

    /// Chain a request belongs to
    pub async fn chain_of_request(&self, request_id: &RequestId) -> Result<ChainId, EngineError> {
        let request = self
            .approvals
            .find_request(request_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("Approval request '{}'", request_id)))?;
        Ok(request.chain_id)
    }

    fn resolve_chain_type(
        &self,
        config: &ChainConfig,
        data: &DataPacket,
    ) -> Result<ChainType, EngineError> {
        if config.chain_type != ChainType::Conditional {
            return Ok(config.chain_type);
        }

        let scope: HashMap<String, Value> = data
            .as_object()
            .map(|o| o.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        for rule in &config.conditional_rules {
            if rule.chain_type == ChainType::Conditional {
                return Err(EngineError::Validation(
                    "Conditional rules must resolve to a concrete chain type".to_string(),
                ));
            }
            match expression::evaluate_condition(&rule.when, &scope) {
                Ok(true) => return Ok(rule.chain_type),
                Ok(false) => {}
                Err(e) => {
                    tracing::debug!(condition = %rule.when, error = %e, "Conditional rule skipped");
                }
            }
        }

        // No rule matched; ask approvers one at a time
        Ok(ChainType::Sequential)
    }

    async fn resolve_approvers(
        &self,
        tenant_id: &TenantId,
        specs: &[ApproverSpec],
        data: &DataPacket,
    ) -> Result<Vec<UserId>, EngineError> {
        let mut approvers: Vec<UserId> = Vec::new();
        for spec in specs {
            match spec {
                ApproverSpec::User { user_id } => approvers.push(user_id.clone()),
                ApproverSpec::Role { role, selection } => {
                    let members = self.directory.resolve_role(tenant_id, role).await?;
                    if members.is_empty() {
                        return Err(EngineError::Validation(format!(
                            "Role '{}' has no members in tenant '{}'",
                            role, tenant_id.0
                        )));
                    }
                    match selection {
                        RoleSelection::First => {
                            if let Some(first) = members.into_iter().next() {
                                approvers.push(first);
                            }
                        }
                        RoleSelection::All => approvers.extend(members),
                    }
                }
                ApproverSpec::Dynamic { path } => {
                    approvers.extend(resolve_dynamic_approvers(path, data)?);
                }
            }
        }
        // Same approver twice in one chain would double-count decisions
        let mut seen = std::collections::HashSet::new();
        approvers.retain(|a| seen.insert(a.clone()));
        Ok(approvers)
    }

    async fn advance_chain(
        &self,
        chain: &mut ApprovalChain,
        decided: &ApprovalRequest,
    ) -> Result<ChainStatus, EngineError> {
        let requests = self.approvals.find_requests_by_chain(&chain.id).await?;

        let approved = requests
            .iter()
            .filter(|r| r.status == RequestStatus::Approved)
            .count();
        let rejected = requests
            .iter()
            .filter(|r| r.status == RequestStatus::Rejected)
            .count();
        let pending = requests
            .iter()
            .filter(|r| r.status == RequestStatus::Pending)
            .count();

        let outcome = match chain.chain_type {
            ChainType::Sequential => {
                if decided.status == RequestStatus::Rejected {
                    Some(ChainStatus::Rejected)
                } else if chain.pending_approvers.is_empty() {
                    Some(ChainStatus::Approved)
                } else {
                    // Activate the next approver in order
                    let next = chain.pending_approvers.remove(0);
                    let expires_at = chain
                        .timeout_seconds
                        .map(|secs| Utc::now() + ChronoDuration::seconds(secs as i64));
                    let next_request = ApprovalRequest::new(
                        chain.id.clone(),
                        next,
                        decided.order_index + 1,
                        expires_at,
                    );
                    self.approvals.save_request(&next_request).await?;
                    self.approvals.save_chain(chain).await?;
                    self.notify_approver(&next_request).await;
                    None
                }
            }
            ChainType::Parallel => {
                if approved >= chain.approval_threshold {
                    Some(ChainStatus::Approved)
                } else if approved + pending < chain.approval_threshold {
                    Some(ChainStatus::Rejected)
                } else {
                    None
                }
            }
            ChainType::Unanimous => {
                if rejected > 0 {
                    Some(ChainStatus::Rejected)
                } else if pending == 0 {
                    Some(ChainStatus::Approved)
                } else {
                    None
                }
            }
            ChainType::Majority => {
                let total = approved + rejected + pending;
                let needed = total / 2 + 1;
                if approved >= needed {
                    Some(ChainStatus::Approved)
                } else if rejected > total - needed {
                    Some(ChainStatus::Rejected)
                } else {
                    None
                }
            }
            ChainType::FirstResponse => {
                // The decision that got us here is final
                if decided.status == RequestStatus::Approved {
                    Some(ChainStatus::Approved)
                } else {
                    Some(ChainStatus::Rejected)
                }
            }
            ChainType::Conditional => {
                return Err(EngineError::ApprovalTransaction(format!(
                    "Chain '{}' was persisted with an unresolved conditional type",
                    chain.id
                )));
            }
        };

        if let Some(status) = outcome {
            chain.status = status;
            chain.decided_at = Some(Utc::now());
            chain.pending_approvers.clear();

            // First-response chains close every other open request
            if chain.chain_type == ChainType::FirstResponse {
                for mut open in requests {
                    if open.status == RequestStatus::Pending {
                        open.status = RequestStatus::Cancelled;
                        open.decided_at = Some(Utc::now());
                        self.approvals.save_request(&open).await?;
                    }
                }
            }
            self.approvals.save_chain(chain).await?;
        }

        Ok(chain.status)
    }

    async fn notify_approver(&self, request: &ApprovalRequest) {
        let body = format!(
            "Approval request '{}' in chain '{}' awaits your decision",
            request.id, request.chain_id
        );
        if let Err(e) = self
            .notifications
            .notify(&request.approver_id, "Approval requested", &body)
            .await
        {
            tracing::warn!(
                request_id = %request.id.0,
                approver = %request.approver_id.0,
                error = %e,
                "Approval notification failed"
            );
        }
    }
}

/// Resolve a dynamic approver path against the data snapshot
fn resolve_dynamic_approvers(path: &str, data: &DataPacket) -> Result<Vec<UserId>, EngineError> {
    let trimmed = path.trim();
    let trimmed = trimmed
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .unwrap_or(trimmed);

    let mut current = data.as_value();
    for part in trimmed.split('.') {
        current = current.get(part).unwrap_or(&Value::Null);
    }

    match current {
        Value::String(s) if !s.is_empty() => Ok(vec![UserId(s.clone())]),
        Value::Array(items) => {
            let mut approvers = Vec::new();
            for item in items {
                match item.as_str() {
                    Some(s) if !s.is_empty() => approvers.push(UserId(s.to_string())),
                    _ => {
                        return Err(EngineError::Validation(format!(
                            "Dynamic approver path '{}' yielded a non-string entry",
                            path
                        )))
                    }
                }
            }
            Ok(approvers)
        }
        _ => Err(EngineError::Validation(format!(
            "Dynamic approver path '{}' did not resolve to a user id",
            path
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::definition::ProcessDefinitionId;
    use crate::domain::instance::{Priority, ProcessInstance};
    use crate::domain::repository::memory::{
        LoggingNotificationSender, MemoryApprovalRepository, StaticUserDirectory,
    };
    use serde_json::json;

    fn manager() -> (ApprovalChainManager, Arc<MemoryApprovalRepository>) {
        let approvals = Arc::new(MemoryApprovalRepository::new());
        let directory = StaticUserDirectory::new()
            .with_role("acme", "finance", &["fin1", "fin2"])
            .with_manager("bob", "carol")
            .with_admin("acme", "root");
        let manager = ApprovalChainManager::new(
            approvals.clone(),
            Arc::new(directory),
            Arc::new(LoggingNotificationSender),
        );
        (manager, approvals)
    }

    fn instance() -> ProcessInstance {
        let mut instance = ProcessInstance::new(
            ProcessDefinitionId("def1".to_string()),
            TenantId("acme".to_string()),
            DataPacket::null(),
            None,
            Priority::default(),
        );
        instance.take_events();
        instance
    }

    fn users(ids: &[&str]) -> Vec<ApproverSpec> {
        ids.iter()
            .map(|id| ApproverSpec::User {
                user_id: UserId(id.to_string()),
            })
            .collect()
    }

    fn config(chain_type: ChainType, approvers: Vec<ApproverSpec>) -> ChainConfig {
        ChainConfig {
            chain_type,
            approvers,
            approval_threshold: None,
            timeout_action: TimeoutAction::default(),
            timeout_seconds: None,
            conditional_rules: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_unanimous_approved_only_when_all_approve() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (_, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Unanimous, users(&["a", "b", "c"])),
                DataPacket::null(),
            )
            .await
            .unwrap();
        assert_eq!(requests.len(), 3);

        let status = manager
            .process_decision(&requests[0].id, true, &requests[0].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Pending);

        let status = manager
            .process_decision(&requests[1].id, true, &requests[1].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Pending);

        let status = manager
            .process_decision(&requests[2].id, true, &requests[2].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Approved);
    }

    #[tokio::test]
    async fn test_unanimous_any_rejection_rejects() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (_, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Unanimous, users(&["a", "b", "c"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        let status = manager
            .process_decision(&requests[1].id, false, &requests[1].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Rejected);
    }

    #[tokio::test]
    async fn test_sequential_rejection_creates_no_later_requests() {
        let (manager, approvals) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (chain, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Sequential, users(&["a", "b", "c"])),
                DataPacket::null(),
            )
            .await
            .unwrap();
        // Only the first approver is asked initially
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].order_index, 0);

        let status = manager
            .process_decision(&requests[0].id, false, &requests[0].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Rejected);

        let all = approvals.find_requests_by_chain(&chain.id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.iter().all(|r| r.order_index == 0));
    }

    #[tokio::test]
    async fn test_sequential_walks_approvers_in_order() {
        let (manager, approvals) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (chain, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Sequential, users(&["a", "b"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        let status = manager
            .process_decision(&requests[0].id, true, &UserId("a".to_string()), None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Pending);

        let all = approvals.find_requests_by_chain(&chain.id).await.unwrap();
        assert_eq!(all.len(), 2);
        let second = all.iter().find(|r| r.order_index == 1).unwrap();
        assert_eq!(second.approver_id, UserId("b".to_string()));

        let status = manager
            .process_decision(&second.id, true, &UserId("b".to_string()), None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Approved);
    }

    #[tokio::test]
    async fn test_parallel_threshold_leaves_pending_untouched() {
        let (manager, approvals) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let mut cfg = config(ChainType::Parallel, users(&["a", "b", "c"]));
        cfg.approval_threshold = Some(2);

        let (chain, requests) = manager
            .create_chain(&instance, &step_id, &cfg, DataPacket::null())
            .await
            .unwrap();

        manager
            .process_decision(&requests[0].id, true, &requests[0].approver_id, None)
            .await
            .unwrap();
        let status = manager
            .process_decision(&requests[1].id, true, &requests[1].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Approved);

        // The third request stays pending, unlike first_response
        let all = approvals.find_requests_by_chain(&chain.id).await.unwrap();
        let third = all.iter().find(|r| r.id == requests[2].id).unwrap();
        assert_eq!(third.status, RequestStatus::Pending);
    }

    #[tokio::test]
    async fn test_parallel_rejected_when_threshold_unreachable() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let mut cfg = config(ChainType::Parallel, users(&["a", "b", "c"]));
        cfg.approval_threshold = Some(3);

        let (_, requests) = manager
            .create_chain(&instance, &step_id, &cfg, DataPacket::null())
            .await
            .unwrap();

        let status = manager
            .process_decision(&requests[0].id, false, &requests[0].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Rejected);
    }

    #[tokio::test]
    async fn test_majority_decides_at_floor_half_plus_one() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (_, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Majority, users(&["a", "b", "c"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        manager
            .process_decision(&requests[0].id, true, &requests[0].approver_id, None)
            .await
            .unwrap();
        let status = manager
            .process_decision(&requests[1].id, true, &requests[1].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Approved);
    }

    #[tokio::test]
    async fn test_first_response_cancels_the_rest() {
        let (manager, approvals) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (chain, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::FirstResponse, users(&["a", "b", "c"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        let status = manager
            .process_decision(&requests[1].id, false, &requests[1].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Rejected);

        let all = approvals.find_requests_by_chain(&chain.id).await.unwrap();
        for request in all {
            if request.id == requests[1].id {
                assert_eq!(request.status, RequestStatus::Rejected);
            } else {
                assert_eq!(request.status, RequestStatus::Cancelled);
            }
        }
    }

    #[tokio::test]
    async fn test_decision_on_decided_request_is_a_transaction_error() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (_, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Unanimous, users(&["a"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        manager
            .process_decision(&requests[0].id, true, &requests[0].approver_id, None)
            .await
            .unwrap();
        let result = manager
            .process_decision(&requests[0].id, true, &requests[0].approver_id, None)
            .await;
        assert!(matches!(result, Err(EngineError::ApprovalTransaction(_))));
    }

    #[tokio::test]
    async fn test_wrong_approver_rejected() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (_, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Unanimous, users(&["a"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        let result = manager
            .process_decision(&requests[0].id, true, &UserId("mallory".to_string()), None)
            .await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delegation_preserves_order_and_priority() {
        let (manager, approvals) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (chain, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Unanimous, users(&["a", "b"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        let delegated = manager
            .delegate(&requests[0].id, &UserId("dave".to_string()), None)
            .await
            .unwrap();
        assert_eq!(delegated.order_index, requests[0].order_index);
        assert_eq!(delegated.approver_id, UserId("dave".to_string()));

        let original = approvals
            .find_request(&requests[0].id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(original.status, RequestStatus::Delegated);

        // The delegate's approval plus b's approval completes the chain
        manager
            .process_decision(&delegated.id, true, &delegated.approver_id, None)
            .await
            .unwrap();
        let status = manager
            .process_decision(&requests[1].id, true, &requests[1].approver_id, None)
            .await
            .unwrap();
        assert_eq!(status, ChainStatus::Approved);
        assert_eq!(
            manager.chain_status(&chain.id).await.unwrap(),
            ChainStatus::Approved
        );
    }

    #[tokio::test]
    async fn test_escalation_prefers_manager_then_admin() {
        let (manager, approvals) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        // bob has a manager, alice falls back to the tenant admin
        let (chain, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Unanimous, users(&["bob", "alice"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        let escalated = manager.escalate(&requests[0].id).await.unwrap();
        assert_eq!(escalated.approver_id, UserId("carol".to_string()));
        assert!(escalated.required);
        assert_eq!(escalated.priority, requests[0].priority + 1);

        let escalated = manager.escalate(&requests[1].id).await.unwrap();
        assert_eq!(escalated.approver_id, UserId("root".to_string()));

        let all = approvals.find_requests_by_chain(&chain.id).await.unwrap();
        assert_eq!(
            all.iter()
                .filter(|r| r.status == RequestStatus::Escalated)
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn test_sweep_applies_timeout_action() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let mut cfg = config(ChainType::Unanimous, users(&["a"]));
        cfg.timeout_action = TimeoutAction::Reject;
        cfg.timeout_seconds = Some(0);

        let (chain, _) = manager
            .create_chain(&instance, &step_id, &cfg, DataPacket::null())
            .await
            .unwrap();

        let acted = manager.sweep_expired().await.unwrap();
        assert_eq!(acted.len(), 1);
        assert_eq!(
            manager.chain_status(&chain.id).await.unwrap(),
            ChainStatus::Rejected
        );
    }

    #[tokio::test]
    async fn test_role_and_dynamic_approvers() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let specs = vec![
            ApproverSpec::Role {
                role: "finance".to_string(),
                selection: RoleSelection::All,
            },
            ApproverSpec::Dynamic {
                path: "${request.owner}".to_string(),
            },
        ];
        let data = DataPacket::new(json!({"request": {"owner": "olivia"}}));

        let (_, requests) = manager
            .create_chain(&instance, &step_id, &config(ChainType::Parallel, specs), data)
            .await
            .unwrap();

        let approvers: Vec<&str> = requests.iter().map(|r| r.approver_id.0.as_str()).collect();
        assert_eq!(approvers, vec!["fin1", "fin2", "olivia"]);
    }

    #[tokio::test]
    async fn test_conditional_resolves_by_rule() {
        let (manager, _) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let mut cfg = config(ChainType::Conditional, users(&["a", "b"]));
        cfg.conditional_rules = vec![
            ConditionalRule {
                when: "amount > 1000".to_string(),
                chain_type: ChainType::Unanimous,
            },
            ConditionalRule {
                when: "amount > 100".to_string(),
                chain_type: ChainType::FirstResponse,
            },
        ];

        let (chain, _) = manager
            .create_chain(
                &instance,
                &step_id,
                &cfg,
                DataPacket::new(json!({"amount": 500})),
            )
            .await
            .unwrap();
        assert_eq!(chain.chain_type, ChainType::FirstResponse);

        let (chain, _) = manager
            .create_chain(
                &instance,
                &step_id,
                &cfg,
                DataPacket::new(json!({"amount": 50})),
            )
            .await
            .unwrap();
        assert_eq!(chain.chain_type, ChainType::Sequential);
    }

    #[tokio::test]
    async fn test_cancel_chain_cancels_pending_requests() {
        let (manager, approvals) = manager();
        let instance = instance();
        let step_id = StepId("s1".to_string());

        let (chain, requests) = manager
            .create_chain(
                &instance,
                &step_id,
                &config(ChainType::Unanimous, users(&["a", "b"])),
                DataPacket::null(),
            )
            .await
            .unwrap();

        manager.cancel_chain(&chain.id).await.unwrap();
        assert_eq!(
            manager.chain_status(&chain.id).await.unwrap(),
            ChainStatus::Cancelled
        );
        for request in requests {
            let stored = approvals.find_request(&request.id).await.unwrap().unwrap();
            assert_eq!(stored.status, RequestStatus::Cancelled);
        }

        // Decisions against a cancelled chain fail
        let all = approvals.find_requests_by_chain(&chain.id).await.unwrap();
        let result = manager
            .process_decision(&all[0].id, true, &all[0].approver_id, None)
            .await;
        assert!(matches!(result, Err(EngineError::ApprovalTransaction(_))));
    }
}
