//! Eval-State: persistence for the evaluation orchestration core
//!
//! This crate owns every durable record the orchestrator reads or writes and
//! hides the backing database behind async traits.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: conditional status transitions, at-most-once claims, durable
//! breaker state.
//!
//! ## Key Components
//!
//! - `EvaluationStore`, `AgentRunLedger`, `BreakerStore`: storage traits
//! - `SurrealEvaluationStore`: SurrealDB implementation of all three
//! - `fakes`: in-memory implementations for tests
//! - `Stores`: the trait objects bundled for injection

use std::sync::Arc;

mod connection;
mod error;
pub mod fakes;
mod migrations;
pub mod model;
mod schema;
pub mod storage_traits;
pub mod surreal_store;

pub use connection::{connect_from_env, connect_url, CloudConfig, ConnectionTarget};
pub use error::{StateError, StorageError};
pub use migrations::init_schema;
pub use model::{
    AgentKind, AgentRun, AgentRunStatus, CircuitBreakerState, ClaimRequest, Evaluation,
    EvaluationId, EvaluationStatus, Finalization, PartialResult,
};
pub use schema::{AgentRunRow, BreakerRow, EvaluationRow, PartialResultRow};
pub use storage_traits::{AgentRunLedger, BreakerStore, EvaluationStore, StorageResult};
pub use surreal_store::SurrealEvaluationStore;

/// Result type for eval-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;

/// The three storage seams, shared behind `Arc`s.
#[derive(Clone)]
pub struct Stores {
    pub evaluations: Arc<dyn EvaluationStore>,
    pub agent_runs: Arc<dyn AgentRunLedger>,
    pub breakers: Arc<dyn BreakerStore>,
}

impl Stores {
    /// Fresh in-memory fakes.
    pub fn in_memory() -> Self {
        Self {
            evaluations: Arc::new(fakes::MemoryEvaluationStore::new()),
            agent_runs: Arc::new(fakes::MemoryAgentRunLedger::new()),
            breakers: Arc::new(fakes::MemoryBreakerStore::new()),
        }
    }

    /// All three seams served by one SurrealDB store.
    pub fn surreal(store: SurrealEvaluationStore) -> Self {
        let store = Arc::new(store);
        Self {
            evaluations: store.clone(),
            agent_runs: store.clone(),
            breakers: store,
        }
    }
}
