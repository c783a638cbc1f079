//! Domain layer: process definitions, instances, steps, approval chains,
//! domain events, and the repository trait boundary.

/// Process definition graph and validation
pub mod definition;

/// Process instance aggregate
pub mod instance;

/// Per-node execution records
pub mod step;

/// Approval chains and requests
pub mod approval;

/// Domain events raised by instance mutations
pub mod events;

/// Repository and collaborator traits
pub mod repository;
