//! In-memory fakes for storage traits (testing only)
//!
//! Provides `MemoryEvaluationStore`, `MemoryAgentRunLedger`, and
//! `MemoryBreakerStore` that satisfy the trait contracts without any external
//! dependencies.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageError;
use crate::model::*;
use crate::storage_traits::*;

// ---------------------------------------------------------------------------
// MemoryEvaluationStore
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct EvaluationState {
    record: Evaluation,
    partials: BTreeMap<AgentKind, PartialResult>,
}

/// In-memory evaluation store backed by a `HashMap<EvaluationId, EvaluationState>`.
///
/// Every operation runs under a single lock, so claims are trivially atomic.
#[derive(Debug, Default)]
pub struct MemoryEvaluationStore {
    evaluations: Mutex<HashMap<String, EvaluationState>>,
}

impl MemoryEvaluationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a row exactly as given, bypassing the lifecycle.
    pub fn seed(&self, evaluation: Evaluation) {
        let mut evaluations = self.evaluations.lock().unwrap();
        evaluations.insert(
            evaluation.id.0.clone(),
            EvaluationState {
                record: evaluation,
                partials: BTreeMap::new(),
            },
        );
    }

    /// Put an existing row into `running` with the given `started_at`.
    pub fn force_running(
        &self,
        evaluation_id: &EvaluationId,
        started_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut evaluations = self.evaluations.lock().unwrap();
        let state = evaluations
            .get_mut(&evaluation_id.0)
            .ok_or_else(|| not_found(evaluation_id))?;
        state.record.status = EvaluationStatus::Running;
        state.record.started_at = Some(started_at);
        state.record.completed_at = None;
        Ok(())
    }
}

fn not_found(evaluation_id: &EvaluationId) -> StorageError {
    StorageError::EvaluationNotFound {
        id: evaluation_id.0.clone(),
    }
}

fn ensure_running(record: &Evaluation) -> StorageResult<()> {
    if record.status != EvaluationStatus::Running {
        return Err(StorageError::InvalidTransition {
            id: record.id.0.clone(),
            status: record.status.to_string(),
            expected: EvaluationStatus::Running.to_string(),
        });
    }
    Ok(())
}

fn is_stale(record: &Evaluation, cutoff: DateTime<Utc>) -> bool {
    record.status == EvaluationStatus::Running
        && record.started_at.map(|s| s < cutoff).unwrap_or(false)
}

#[async_trait]
impl EvaluationStore for MemoryEvaluationStore {
    async fn create_evaluation(&self, target_id: &str) -> StorageResult<Evaluation> {
        let evaluation = Evaluation::new(target_id);
        self.seed(evaluation.clone());
        Ok(evaluation)
    }

    async fn claim_batch(&self, request: ClaimRequest) -> StorageResult<Vec<Evaluation>> {
        let now = Utc::now();
        let mut evaluations = self.evaluations.lock().unwrap();

        let mut candidates: Vec<(DateTime<Utc>, String)> = evaluations
            .values()
            .filter(|s| s.record.is_claimable(&request, now))
            .map(|s| (s.record.created_at, s.record.id.0.clone()))
            .collect();
        candidates.sort();
        candidates.truncate(request.limit);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, id) in candidates {
            if let Some(state) = evaluations.get_mut(&id) {
                state.record.mark_claimed(now);
                claimed.push(state.record.clone());
            }
        }
        Ok(claimed)
    }

    async fn record_partial(
        &self,
        evaluation_id: &EvaluationId,
        agent_kind: AgentKind,
        partial: PartialResult,
    ) -> StorageResult<()> {
        if &partial.evaluation_id != evaluation_id || partial.agent_kind != agent_kind {
            return Err(StorageError::MismatchedPartial {
                id: evaluation_id.0.clone(),
                agent_kind: agent_kind.to_string(),
            });
        }
        let mut evaluations = self.evaluations.lock().unwrap();
        let state = evaluations
            .get_mut(&evaluation_id.0)
            .ok_or_else(|| not_found(evaluation_id))?;
        ensure_running(&state.record)?;
        state.partials.insert(agent_kind, partial);
        Ok(())
    }

    async fn finalize(
        &self,
        evaluation_id: &EvaluationId,
        finalization: Finalization,
    ) -> StorageResult<Evaluation> {
        if !finalization.status.is_terminal() {
            return Err(StorageError::NonTerminalFinalization {
                id: evaluation_id.0.clone(),
                status: finalization.status.to_string(),
            });
        }
        let mut evaluations = self.evaluations.lock().unwrap();
        let state = evaluations
            .get_mut(&evaluation_id.0)
            .ok_or_else(|| not_found(evaluation_id))?;
        ensure_running(&state.record)?;

        let record = &mut state.record;
        record.status = finalization.status;
        record.completed_at = Some(Utc::now());
        record.overall_score = finalization.overall_score;
        record.errors.extend(finalization.errors);
        record.failed_kinds = finalization.failed_kinds;
        record.retryable = finalization.retryable;
        Ok(record.clone())
    }

    async fn get_evaluation(&self, evaluation_id: &EvaluationId) -> StorageResult<Evaluation> {
        let evaluations = self.evaluations.lock().unwrap();
        evaluations
            .get(&evaluation_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| not_found(evaluation_id))
    }

    async fn list_partials(
        &self,
        evaluation_id: &EvaluationId,
    ) -> StorageResult<Vec<PartialResult>> {
        let evaluations = self.evaluations.lock().unwrap();
        let state = evaluations
            .get(&evaluation_id.0)
            .ok_or_else(|| not_found(evaluation_id))?;
        Ok(state.partials.values().cloned().collect())
    }

    async fn count_claimed_since(&self, since: DateTime<Utc>) -> StorageResult<u64> {
        let evaluations = self.evaluations.lock().unwrap();
        Ok(evaluations
            .values()
            .filter(|s| s.record.started_at.map(|t| t >= since).unwrap_or(false))
            .count() as u64)
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Evaluation>> {
        let evaluations = self.evaluations.lock().unwrap();
        let mut stale: Vec<Evaluation> = evaluations
            .values()
            .filter(|s| is_stale(&s.record, cutoff))
            .map(|s| s.record.clone())
            .collect();
        stale.sort_by_key(|e| e.started_at);
        Ok(stale)
    }

    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> StorageResult<Vec<Evaluation>> {
        let now = Utc::now();
        let mut evaluations = self.evaluations.lock().unwrap();
        let mut reaped = Vec::new();
        for state in evaluations.values_mut() {
            if !is_stale(&state.record, cutoff) {
                continue;
            }
            let record = &mut state.record;
            record.status = EvaluationStatus::Failed;
            record.completed_at = Some(now);
            record.errors.push(reason.to_string());
            record.retryable = false;
            reaped.push(record.clone());
        }
        reaped.sort_by_key(|e| e.started_at);
        Ok(reaped)
    }
}

// ---------------------------------------------------------------------------
// MemoryAgentRunLedger
// ---------------------------------------------------------------------------

/// In-memory agent run ledger backed by a `HashMap<EvaluationId, Vec<AgentRun>>`.
#[derive(Debug, Default)]
pub struct MemoryAgentRunLedger {
    runs: Mutex<HashMap<String, Vec<AgentRun>>>,
}

impl MemoryAgentRunLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentRunLedger for MemoryAgentRunLedger {
    async fn insert_agent_run(&self, run: AgentRun) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let entries = runs.entry(run.evaluation_id.0.clone()).or_default();
        let latest = entries
            .iter()
            .filter(|r| r.agent_kind == run.agent_kind)
            .map(|r| r.attempt_number)
            .max()
            .unwrap_or(0);
        if run.attempt_number <= latest {
            return Err(StorageError::NonMonotonicAttempt {
                id: run.evaluation_id.0.clone(),
                agent_kind: run.agent_kind.to_string(),
                attempt: run.attempt_number,
                latest,
            });
        }
        entries.push(run);
        Ok(())
    }

    async fn update_agent_run(&self, run: AgentRun) -> StorageResult<()> {
        let mut runs = self.runs.lock().unwrap();
        let existing = runs
            .get_mut(&run.evaluation_id.0)
            .and_then(|entries| {
                entries.iter_mut().find(|r| {
                    r.agent_kind == run.agent_kind && r.attempt_number == run.attempt_number
                })
            })
            .ok_or_else(|| StorageError::AgentRunNotFound {
                id: run.evaluation_id.0.clone(),
                agent_kind: run.agent_kind.to_string(),
                attempt: run.attempt_number,
            })?;
        *existing = run;
        Ok(())
    }

    async fn list_agent_runs(&self, evaluation_id: &EvaluationId) -> StorageResult<Vec<AgentRun>> {
        let runs = self.runs.lock().unwrap();
        let mut entries = runs.get(&evaluation_id.0).cloned().unwrap_or_default();
        entries.sort_by_key(|r| (r.agent_kind, r.attempt_number));
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// MemoryBreakerStore
// ---------------------------------------------------------------------------

/// In-memory breaker store keyed by agent kind.
#[derive(Debug, Default)]
pub struct MemoryBreakerStore {
    breakers: Mutex<BTreeMap<AgentKind, CircuitBreakerState>>,
}

impl MemoryBreakerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BreakerStore for MemoryBreakerStore {
    async fn load_breakers(&self) -> StorageResult<Vec<CircuitBreakerState>> {
        let breakers = self.breakers.lock().unwrap();
        Ok(breakers.values().cloned().collect())
    }

    async fn save_breaker(&self, state: CircuitBreakerState) -> StorageResult<()> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers.insert(state.agent_kind, state);
        Ok(())
    }
}
