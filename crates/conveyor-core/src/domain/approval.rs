use crate::domain::instance::{ProcessInstanceId, TenantId, UserId};
use crate::domain::step::StepId;
use crate::DataPacket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Value object: Approval chain ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChainId(pub String);

/// Value object: Approval request ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub String);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How a chain aggregates individual decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainType {
    /// One approver at a time, in order; any rejection ends the chain
    Sequential,
    /// All requests open at once; approved at a configured threshold
    Parallel,
    /// All must approve; first rejection ends the chain
    Unanimous,
    /// Simple majority of all requests
    Majority,
    /// First decision wins; remaining requests are cancelled
    FirstResponse,
    /// Resolved to one of the concrete types at build time
    Conditional,
}

/// Aggregated chain status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainStatus {
    /// Decisions outstanding
    Pending,
    /// Completion rule satisfied positively
    Approved,
    /// Completion rule satisfied negatively
    Rejected,
    /// Chain abandoned (instance cancelled)
    Cancelled,
}

impl ChainStatus {
    /// Whether the chain has reached a final decision
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChainStatus::Pending)
    }
}

/// Status of one approver's request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting a decision
    Pending,
    /// Approver approved
    Approved,
    /// Approver rejected
    Rejected,
    /// Closed without a decision (first-response chains, chain cancellation)
    Cancelled,
    /// Reassigned to a delegate
    Delegated,
    /// Reassigned to a higher authority
    Escalated,
}

/// What the sweep does with an expired pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutAction {
    /// Hand the request to the approver's manager (default)
    #[default]
    Escalate,
    /// Record a rejection on behalf of the approver
    Reject,
    /// Record an approval on behalf of the approver
    Approve,
}

/// A configured multi-approver decision workflow attached to one step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalChain {
    /// Unique identifier
    pub id: ChainId,

    /// Instance the chain belongs to
    pub instance_id: ProcessInstanceId,

    /// Tenant the instance belongs to; used for admin fallback lookups
    pub tenant_id: TenantId,

    /// Step that opened the chain
    pub step_id: StepId,

    /// Aggregation rule
    pub chain_type: ChainType,

    /// Current status; terminal only when the type's completion rule holds
    pub status: ChainStatus,

    /// Approvals needed for parallel chains
    pub approval_threshold: usize,

    /// Applied to expired pending requests by the sweep
    pub timeout_action: TimeoutAction,

    /// Seconds before a pending request expires, if bounded
    pub timeout_seconds: Option<u64>,

    /// Data snapshot shown to approvers and used for dynamic lookups
    pub context: DataPacket,

    /// Approvers not yet asked, in order; drained by sequential chains
    pub pending_approvers: Vec<UserId>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Timestamp of the final decision
    pub decided_at: Option<DateTime<Utc>>,
}

impl ApprovalChain {
    /// Create a pending chain
    pub fn new(
        instance_id: ProcessInstanceId,
        tenant_id: TenantId,
        step_id: StepId,
        chain_type: ChainType,
        approval_threshold: usize,
        timeout_action: TimeoutAction,
        timeout_seconds: Option<u64>,
        context: DataPacket,
    ) -> Self {
        Self {
            id: ChainId(Uuid::new_v4().to_string()),
            instance_id,
            tenant_id,
            step_id,
            chain_type,
            status: ChainStatus::Pending,
            approval_threshold,
            timeout_action,
            timeout_seconds,
            context,
            pending_approvers: Vec::new(),
            created_at: Utc::now(),
            decided_at: None,
        }
    }
}

/// One approver's pending or answered decision
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique identifier
    pub id: RequestId,

    /// Owning chain
    pub chain_id: ChainId,

    /// Approver this request is addressed to
    pub approver_id: UserId,

    /// Current status
    pub status: RequestStatus,

    /// Position for sequential chains; preserved through delegation
    pub order_index: usize,

    /// Whether this request counts toward the completion rule
    pub required: bool,

    /// Whether the approver may delegate
    pub delegate_allowed: bool,

    /// Priority hint for notification and escalation
    pub priority: u8,

    /// Expiry deadline for the timeout sweep
    pub expires_at: Option<DateTime<Utc>>,

    /// When the decision was recorded
    pub decided_at: Option<DateTime<Utc>>,

    /// Approver's comment
    pub comment: Option<String>,
}

impl ApprovalRequest {
    /// Create a pending request
    pub fn new(
        chain_id: ChainId,
        approver_id: UserId,
        order_index: usize,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: RequestId(Uuid::new_v4().to_string()),
            chain_id,
            approver_id,
            status: RequestStatus::Pending,
            order_index,
            required: true,
            delegate_allowed: true,
            priority: 0,
            expires_at,
            decided_at: None,
            comment: None,
        }
    }
}
