//! Error types for eval-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database.
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

/// Errors returned by the storage traits.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("evaluation not found: {id}")]
    EvaluationNotFound { id: String },

    #[error("evaluation {id} is {status}, expected {expected}")]
    InvalidTransition {
        id: String,
        status: String,
        expected: String,
    },

    #[error("cannot finalize evaluation {id} with non-terminal status {status}")]
    NonTerminalFinalization { id: String, status: String },

    #[error("partial result for {agent_kind} does not belong to evaluation {id}")]
    MismatchedPartial { id: String, agent_kind: String },

    #[error(
        "agent run attempt {attempt} for {agent_kind} on evaluation {id} is not after attempt {latest}"
    )]
    NonMonotonicAttempt {
        id: String,
        agent_kind: String,
        attempt: u32,
        latest: u32,
    },

    #[error("agent run not found: {id}/{agent_kind}#{attempt}")]
    AgentRunNotFound {
        id: String,
        agent_kind: String,
        attempt: u32,
    },

    #[error("unknown agent kind: {0}")]
    UnknownAgentKind(String),

    #[error("unknown status: {0}")]
    UnknownStatus(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<surrealdb::Error> for StorageError {
    fn from(err: surrealdb::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}
