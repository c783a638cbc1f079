use thiserror::Error;

/// Core error type for the Conveyor engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed definition or input data; never retried
    #[error("Validation error: {0}")]
    Validation(String),

    /// Executor failure for one node visit; retried per node policy
    #[error("Node execution error for node '{node_id}' in instance '{instance_id}': {message}")]
    NodeExecution {
        /// Node that failed
        node_id: String,
        /// Instance the node was executing in
        instance_id: String,
        /// Underlying failure description
        message: String,
    },

    /// Illegal instance or step status change; fatal to the calling operation
    #[error("Invalid state transition: {0}")]
    StateTransition(String),

    /// Caller's active tenant does not own the instance
    #[error("Context isolation violation: {0}")]
    ContextIsolation(String),

    /// Context variable rejected (name, size, or validator)
    #[error("Context manager error: {0}")]
    ContextManager(String),

    /// Concurrent modification or persistence failure during approval processing
    #[error("Approval transaction error: {0}")]
    ApprovalTransaction(String),

    /// Referenced definition, instance, step, or request does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Backing store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Task queue failure
    #[error("Task queue error: {0}")]
    TaskQueue(String),

    /// Expression lexing, parsing, or evaluation error
    #[error("Expression error: {0}")]
    Expression(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<String> for EngineError {
    fn from(err: String) -> Self {
        EngineError::Other(err)
    }
}

impl From<&str> for EngineError {
    fn from(err: &str) -> Self {
        EngineError::Other(err.to_string())
    }
}
