use crate::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Value object: Process definition ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessDefinitionId(pub String);

/// Value object: Node ID within a definition graph
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub String);

impl fmt::Display for ProcessDefinitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle status of a process definition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionStatus {
    /// Being edited, not yet startable
    Draft,
    /// Startable
    Active,
    /// Temporarily not startable
    Suspended,
    /// Replaced by a newer version
    Deprecated,
}

/// The closed set of node types the engine can execute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    /// Externally-completed user task
    Task,
    /// Automated service operation
    Service,
    /// Condition-routed decision point
    Gateway,
    /// Approval chain step
    Approval,
    /// Delay, schedule, or timeout timer
    Timer,
    /// Embedded graph, call activity, or event wait
    Subprocess,
}

impl NodeType {
    /// All known node types, used when building the executor registry
    pub const ALL: [NodeType; 6] = [
        NodeType::Task,
        NodeType::Service,
        NodeType::Gateway,
        NodeType::Approval,
        NodeType::Timer,
        NodeType::Subprocess,
    ];
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Task => "task",
            NodeType::Service => "service",
            NodeType::Gateway => "gateway",
            NodeType::Approval => "approval",
            NodeType::Timer => "timer",
            NodeType::Subprocess => "subprocess",
        };
        f.write_str(name)
    }
}

/// One vertex of the process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Node ID, unique within the definition
    pub id: NodeId,

    /// Which executor runs this node
    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Executor-specific configuration
    #[serde(default)]
    pub properties: serde_json::Value,
}

/// One directed edge of the process graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// Source node ID
    pub source: NodeId,

    /// Target node ID
    pub target: NodeId,

    /// Optional guard; an absent condition always passes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Immutable, versioned directed graph describing a workflow
///
/// The JSON shape is `{"nodes": [...], "edges": [...]}` plus version and
/// status metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    /// Definition ID
    pub id: ProcessDefinitionId,

    /// Human-readable name
    pub name: String,

    /// Monotonically increasing version number
    pub version: u32,

    /// Lifecycle status
    pub status: DefinitionStatus,

    /// Graph vertices
    pub nodes: Vec<NodeDefinition>,

    /// Graph edges
    pub edges: Vec<EdgeDefinition>,
}

impl ProcessDefinition {
    /// Look up a node by ID
    pub fn node(&self, id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| &n.id == id)
    }

    /// Nodes with no incoming edges; execution begins here
    pub fn start_nodes(&self) -> Vec<&NodeDefinition> {
        let targets: HashSet<&NodeId> = self.edges.iter().map(|e| &e.target).collect();
        self.nodes
            .iter()
            .filter(|n| !targets.contains(&n.id))
            .collect()
    }

    /// Outgoing edges of a node, in definition order
    pub fn outgoing_edges(&self, id: &NodeId) -> Vec<&EdgeDefinition> {
        self.edges.iter().filter(|e| &e.source == id).collect()
    }

    /// Validate the graph shape
    ///
    /// Checks: at least one node, unique node IDs, a non-empty start-node
    /// set, and that every edge references existing nodes. Executor
    /// availability is checked separately by the orchestrator against its
    /// registry.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.nodes.is_empty() {
            return Err(EngineError::Validation(
                "Process definition must have at least one node".to_string(),
            ));
        }

        let mut node_ids = HashSet::new();
        for node in &self.nodes {
            if !node_ids.insert(&node.id) {
                return Err(EngineError::Validation(format!(
                    "Duplicate node ID: {}",
                    node.id
                )));
            }
        }

        for edge in &self.edges {
            if !node_ids.contains(&edge.source) {
                return Err(EngineError::Validation(format!(
                    "Edge references unknown source node: {}",
                    edge.source
                )));
            }
            if !node_ids.contains(&edge.target) {
                return Err(EngineError::Validation(format!(
                    "Edge references unknown target node: {}",
                    edge.target
                )));
            }
        }

        if self.start_nodes().is_empty() {
            return Err(EngineError::Validation(
                "Process definition has no start node (every node has an incoming edge)"
                    .to_string(),
            ));
        }

        Ok(())
    }
}
