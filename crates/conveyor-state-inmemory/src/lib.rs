//! In-memory state store implementation for the Conveyor platform
//!
//! This crate provides in-memory implementations of the repository
//! interfaces defined in the conveyor-core crate, plus a channel-backed
//! task queue. It is useful for development, testing, and simple
//! single-process deployments where persistence is not required.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

pub mod repositories;
pub use repositories::{
    InMemoryApprovalRepository, InMemoryContextRepository, InMemoryDefinitionRepository,
    InMemoryInstanceRepository, InMemoryStepRepository,
};

pub mod queue;
pub use queue::ChannelTaskQueue;

use conveyor_core::domain::repository::{
    ApprovalRepository, ContextRepository, DefinitionRepository, InstanceRepository,
    StepRepository,
};

/// Provider bundling one in-memory repository of each kind
///
/// All handles returned by the accessors share the same storage, so a
/// provider can be passed around and tapped from several places.
#[derive(Default)]
pub struct InMemoryStateStoreProvider {
    definitions: Arc<InMemoryDefinitionRepository>,
    instances: Arc<InMemoryInstanceRepository>,
    steps: Arc<InMemoryStepRepository>,
    approvals: Arc<InMemoryApprovalRepository>,
    contexts: Arc<InMemoryContextRepository>,
}

impl InMemoryStateStoreProvider {
    /// Create a provider with empty stores
    pub fn new() -> Self {
        Self::default()
    }

    /// The definition repository
    pub fn definitions(&self) -> Arc<dyn DefinitionRepository> {
        self.definitions.clone()
    }

    /// The instance repository
    pub fn instances(&self) -> Arc<dyn InstanceRepository> {
        self.instances.clone()
    }

    /// The step repository
    pub fn steps(&self) -> Arc<dyn StepRepository> {
        self.steps.clone()
    }

    /// The approval repository
    pub fn approvals(&self) -> Arc<dyn ApprovalRepository> {
        self.approvals.clone()
    }

    /// The context repository
    pub fn contexts(&self) -> Arc<dyn ContextRepository> {
        self.contexts.clone()
    }
}
