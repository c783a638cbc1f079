use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use conveyor_core::domain::approval::{ApprovalChain, ApprovalRequest, ChainId, RequestId};
use conveyor_core::domain::definition::{ProcessDefinition, ProcessDefinitionId};
use conveyor_core::domain::instance::{InstanceStatus, ProcessInstance, ProcessInstanceId};
use conveyor_core::domain::repository::{
    ApprovalRepository, ContextRepository, DefinitionRepository, InstanceRepository,
    StepRepository,
};
use conveyor_core::domain::step::{ProcessStep, StepId, StepStatus};
use conveyor_core::{EngineError, InstanceContext};

/// In-memory implementation of the DefinitionRepository
#[derive(Default)]
pub struct InMemoryDefinitionRepository {
    definitions: Arc<RwLock<HashMap<String, ProcessDefinition>>>,
}

impl InMemoryDefinitionRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DefinitionRepository for InMemoryDefinitionRepository {
    async fn find_by_id(
        &self,
        id: &ProcessDefinitionId,
    ) -> Result<Option<ProcessDefinition>, EngineError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.get(&id.0).cloned())
    }

    async fn save(&self, definition: &ProcessDefinition) -> Result<(), EngineError> {
        let mut definitions = self.definitions.write().await;
        definitions.insert(definition.id.0.clone(), definition.clone());
        Ok(())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinitionId>, EngineError> {
        let definitions = self.definitions.read().await;
        Ok(definitions.values().map(|d| d.id.clone()).collect())
    }
}

/// In-memory implementation of the InstanceRepository
#[derive(Default)]
pub struct InMemoryInstanceRepository {
    instances: Arc<RwLock<HashMap<String, ProcessInstance>>>,
}

impl InMemoryInstanceRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InstanceRepository for InMemoryInstanceRepository {
    async fn find_by_id(
        &self,
        id: &ProcessInstanceId,
    ) -> Result<Option<ProcessInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances.get(&id.0).cloned())
    }

    async fn save(&self, instance: &ProcessInstance) -> Result<(), EngineError> {
        let mut instances = self.instances.write().await;
        instances.insert(instance.id.0.clone(), instance.clone());
        Ok(())
    }

    async fn list_instances(
        &self,
        definition_id: Option<&ProcessDefinitionId>,
        status: Option<InstanceStatus>,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| definition_id.map_or(true, |d| &i.definition_id == d))
            .filter(|i| status.map_or(true, |s| i.status == s))
            .cloned()
            .collect())
    }

    async fn find_children(
        &self,
        parent_id: &ProcessInstanceId,
    ) -> Result<Vec<ProcessInstance>, EngineError> {
        let instances = self.instances.read().await;
        Ok(instances
            .values()
            .filter(|i| i.parent_instance_id.as_ref() == Some(parent_id))
            .cloned()
            .collect())
    }
}

/// In-memory implementation of the StepRepository
///
/// Steps are kept in insertion order so `find_by_instance` reflects
/// execution order.
#[derive(Default)]
pub struct InMemoryStepRepository {
    steps: Arc<RwLock<Vec<ProcessStep>>>,
}

impl InMemoryStepRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StepRepository for InMemoryStepRepository {
    async fn find_by_id(&self, id: &StepId) -> Result<Option<ProcessStep>, EngineError> {
        let steps = self.steps.read().await;
        Ok(steps.iter().find(|s| &s.id == id).cloned())
    }

    async fn save(&self, step: &ProcessStep) -> Result<(), EngineError> {
        let mut steps = self.steps.write().await;
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => *existing = step.clone(),
            None => steps.push(step.clone()),
        }
        Ok(())
    }

    async fn find_by_instance(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<Vec<ProcessStep>, EngineError> {
        let steps = self.steps.read().await;
        Ok(steps
            .iter()
            .filter(|s| &s.instance_id == instance_id)
            .cloned()
            .collect())
    }

    async fn find_waiting_for_event(
        &self,
        event_name: &str,
    ) -> Result<Vec<ProcessStep>, EngineError> {
        let steps = self.steps.read().await;
        Ok(steps
            .iter()
            .filter(|s| {
                s.status == StepStatus::Waiting
                    && s.waiting_event.as_deref() == Some(event_name)
            })
            .cloned()
            .collect())
    }
}

/// In-memory implementation of the ApprovalRepository
#[derive(Default)]
pub struct InMemoryApprovalRepository {
    chains: Arc<RwLock<HashMap<String, ApprovalChain>>>,
    requests: Arc<RwLock<HashMap<String, ApprovalRequest>>>,
}

impl InMemoryApprovalRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ApprovalRepository for InMemoryApprovalRepository {
    async fn save_chain(&self, chain: &ApprovalChain) -> Result<(), EngineError> {
        let mut chains = self.chains.write().await;
        chains.insert(chain.id.0.clone(), chain.clone());
        Ok(())
    }

    async fn find_chain(&self, id: &ChainId) -> Result<Option<ApprovalChain>, EngineError> {
        let chains = self.chains.read().await;
        Ok(chains.get(&id.0).cloned())
    }

    async fn save_request(&self, request: &ApprovalRequest) -> Result<(), EngineError> {
        let mut requests = self.requests.write().await;
        requests.insert(request.id.0.clone(), request.clone());
        Ok(())
    }

    async fn find_request(
        &self,
        id: &RequestId,
    ) -> Result<Option<ApprovalRequest>, EngineError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).cloned())
    }

    async fn find_requests_by_chain(
        &self,
        chain_id: &ChainId,
    ) -> Result<Vec<ApprovalRequest>, EngineError> {
        let requests = self.requests.read().await;
        let mut matching: Vec<ApprovalRequest> = requests
            .values()
            .filter(|r| &r.chain_id == chain_id)
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.order_index);
        Ok(matching)
    }

    async fn find_expired_pending(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ApprovalRequest>, EngineError> {
        let requests = self.requests.read().await;
        Ok(requests
            .values()
            .filter(|r| {
                r.status == conveyor_core::RequestStatus::Pending
                    && r.expires_at.is_some_and(|e| e <= now)
            })
            .cloned()
            .collect())
    }
}

/// In-memory implementation of the ContextRepository
#[derive(Default)]
pub struct InMemoryContextRepository {
    contexts: Arc<RwLock<HashMap<String, InstanceContext>>>,
}

impl InMemoryContextRepository {
    /// Create an empty repository
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContextRepository for InMemoryContextRepository {
    async fn load(
        &self,
        instance_id: &ProcessInstanceId,
    ) -> Result<Option<InstanceContext>, EngineError> {
        let contexts = self.contexts.read().await;
        Ok(contexts.get(&instance_id.0).cloned())
    }

    async fn save(
        &self,
        instance_id: &ProcessInstanceId,
        context: &InstanceContext,
    ) -> Result<(), EngineError> {
        let mut contexts = self.contexts.write().await;
        contexts.insert(instance_id.0.clone(), context.clone());
        Ok(())
    }

    async fn delete(&self, instance_id: &ProcessInstanceId) -> Result<(), EngineError> {
        let mut contexts = self.contexts.write().await;
        contexts.remove(&instance_id.0);
        Ok(())
    }
}
