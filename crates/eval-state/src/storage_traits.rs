//! Storage trait definitions for the evaluation core
//!
//! These traits define the persistence seams the orchestrator depends on:
//! - `EvaluationStore`: evaluation rows, partial results, claims and reaping
//! - `AgentRunLedger`: per-attempt agent run records
//! - `BreakerStore`: circuit breaker state that must survive restarts
//!
//! All traits are async and backend-agnostic. In-memory fakes are provided
//! for testing via the `fakes` module.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::{
    AgentKind, AgentRun, CircuitBreakerState, ClaimRequest, Evaluation, EvaluationId,
    Finalization, PartialResult,
};

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// EvaluationStore
// ---------------------------------------------------------------------------

/// Durable table of evaluation jobs.
///
/// Guarantees:
/// - `claim_batch` hands any given row to at most one concurrent caller.
/// - `finalize` and `record_partial` only act on rows in `running`.
/// - Rows are never deleted.
#[async_trait]
pub trait EvaluationStore: Send + Sync {
    /// Insert a new `pending` evaluation for `target_id`.
    async fn create_evaluation(&self, target_id: &str) -> StorageResult<Evaluation>;

    /// Atomically move up to `request.limit` schedulable rows into `running`,
    /// oldest `created_at` first.
    async fn claim_batch(&self, request: ClaimRequest) -> StorageResult<Vec<Evaluation>>;

    /// Persist a succeeded agent's output. At most one per (evaluation, kind);
    /// a partial left by an earlier run cycle is replaced.
    async fn record_partial(
        &self,
        evaluation_id: &EvaluationId,
        agent_kind: AgentKind,
        partial: PartialResult,
    ) -> StorageResult<()>;

    /// Move a `running` evaluation into a terminal status.
    async fn finalize(
        &self,
        evaluation_id: &EvaluationId,
        finalization: Finalization,
    ) -> StorageResult<Evaluation>;

    /// Fetch one evaluation. Returns `StorageError::EvaluationNotFound` if absent.
    async fn get_evaluation(&self, evaluation_id: &EvaluationId) -> StorageResult<Evaluation>;

    /// Partial results for an evaluation, in canonical kind order.
    async fn list_partials(&self, evaluation_id: &EvaluationId)
        -> StorageResult<Vec<PartialResult>>;

    /// Number of evaluations whose latest claim was stamped at or after `since`.
    async fn count_claimed_since(&self, since: DateTime<Utc>) -> StorageResult<u64>;

    /// `running` rows whose `started_at` is before `cutoff`, oldest first.
    async fn find_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Evaluation>>;

    /// Force every stale `running` row to `failed` in one conditional update,
    /// appending `reason`. Returns the rows as they were reaped.
    async fn reap_stale(&self, cutoff: DateTime<Utc>, reason: &str)
        -> StorageResult<Vec<Evaluation>>;
}

// ---------------------------------------------------------------------------
// AgentRunLedger
// ---------------------------------------------------------------------------

/// Append-mostly ledger of agent attempts.
///
/// Guarantees:
/// - `attempt_number` strictly increases per (evaluation, kind).
/// - `update_agent_run` replaces an existing attempt; it never creates one.
#[async_trait]
pub trait AgentRunLedger: Send + Sync {
    async fn insert_agent_run(&self, run: AgentRun) -> StorageResult<()>;

    async fn update_agent_run(&self, run: AgentRun) -> StorageResult<()>;

    /// Every attempt for an evaluation, ordered by (kind, attempt).
    async fn list_agent_runs(&self, evaluation_id: &EvaluationId) -> StorageResult<Vec<AgentRun>>;
}

// ---------------------------------------------------------------------------
// BreakerStore
// ---------------------------------------------------------------------------

/// Persistence for per-kind circuit breaker state.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load_breakers(&self) -> StorageResult<Vec<CircuitBreakerState>>;

    /// Upsert the state for `state.agent_kind`.
    async fn save_breaker(&self, state: CircuitBreakerState) -> StorageResult<()>;
}
