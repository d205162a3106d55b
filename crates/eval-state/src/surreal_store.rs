//! SurrealDB-backed evaluation store
//!
//! Implements [`EvaluationStore`], [`AgentRunLedger`] and [`BreakerStore`] on
//! one connection. Rows from `schema` are converted to `model` records at the
//! boundary. Every status transition is a single conditional `UPDATE ... WHERE
//! status = ...`, never a read followed by a blind write: a claim whose
//! candidate row was taken by a concurrent caller simply matches nothing.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::sql::Datetime as SurrealDatetime;
use surrealdb::Surreal;
use tracing::{debug, info, instrument};

use crate::connection;
use crate::error::StorageError;
use crate::model::*;
use crate::schema::{AgentRunRow, BreakerRow, EvaluationRow, PartialResultRow};
use crate::storage_traits::*;

const CLAIM_SQL: &str = r#"
    LET $candidates = (
        SELECT evaluation_id, created_at FROM evaluations
        WHERE status = 'pending'
           OR (status = 'failed' AND retryable = true
               AND retry_count < $retry_limit AND created_at >= $oldest)
        ORDER BY created_at ASC
        LIMIT $limit
    );
    UPDATE evaluations SET
        retry_count = IF status = 'failed' THEN retry_count + 1 ELSE retry_count END,
        status = 'running',
        started_at = $now,
        completed_at = NONE,
        overall_score = NONE,
        failed_kinds = []
    WHERE evaluation_id INSIDE $candidates.evaluation_id
      AND (status = 'pending'
           OR (status = 'failed' AND retryable = true
               AND retry_count < $retry_limit AND created_at >= $oldest))
    RETURN AFTER;
"#;

/// Attempts at a claim that lost a write conflict to a concurrent claimer.
const CLAIM_CONFLICT_RETRIES: usize = 5;

const FINALIZE_SQL: &str = r#"
    UPDATE evaluations SET
        status = $status,
        completed_at = $now,
        overall_score = $score,
        errors = array::concat(errors, $errors),
        failed_kinds = $failed_kinds,
        retryable = $retryable
    WHERE evaluation_id = $eid AND status = 'running'
    RETURN AFTER
"#;

const REAP_SQL: &str = r#"
    UPDATE evaluations SET
        status = 'failed',
        completed_at = $now,
        errors = array::append(errors, $reason),
        retryable = false
    WHERE status = 'running' AND started_at != NONE AND started_at < $cutoff
    RETURN AFTER
"#;

/// The candidate rows were written by another transaction first.
fn is_write_conflict(err: &surrealdb::Error) -> bool {
    let message = err.to_string().to_lowercase();
    message.contains("conflict") || message.contains("can be retried")
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: u64,
}

/// SurrealDB-backed implementation of the storage traits.
#[derive(Clone)]
pub struct SurrealEvaluationStore {
    db: Surreal<Any>,
}

impl SurrealEvaluationStore {
    /// Wrap an already-migrated connection.
    pub fn new(db: Surreal<Any>) -> Self {
        Self { db }
    }

    /// Create an in-memory instance for testing.
    ///
    /// Connects to `mem://`, selects `evald/main`, and runs `init_schema`.
    pub async fn in_memory() -> crate::Result<Self> {
        let db = connection::connect_url("mem://").await?;
        info!("SurrealEvaluationStore connected (in-memory)");
        Ok(Self { db })
    }

    /// Create from environment variables, see [`connection::connect_from_env`].
    pub async fn from_env() -> crate::Result<Self> {
        let db = connection::connect_from_env().await?;
        Ok(Self { db })
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_evaluation(&self, eid: &EvaluationId) -> StorageResult<EvaluationRow> {
        let mut res = self
            .db
            .query("SELECT * FROM evaluations WHERE evaluation_id = $eid")
            .bind(("eid", eid.0.clone()))
            .await?;

        let rows: Vec<EvaluationRow> = res.take(0)?;
        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::EvaluationNotFound { id: eid.0.clone() })
    }

    async fn fetch_running(&self, eid: &EvaluationId) -> StorageResult<EvaluationRow> {
        let row = self.fetch_evaluation(eid).await?;
        if row.status != EvaluationStatus::Running.as_str() {
            return Err(StorageError::InvalidTransition {
                id: eid.0.clone(),
                status: row.status,
                expected: EvaluationStatus::Running.to_string(),
            });
        }
        Ok(row)
    }

    fn rows_to_evaluations(rows: Vec<EvaluationRow>) -> StorageResult<Vec<Evaluation>> {
        rows.into_iter().map(Evaluation::try_from).collect()
    }
}

#[async_trait]
impl EvaluationStore for SurrealEvaluationStore {
    #[instrument(skip(self))]
    async fn create_evaluation(&self, target_id: &str) -> StorageResult<Evaluation> {
        let evaluation = Evaluation::new(target_id);
        debug!(evaluation_id = %evaluation.id, "creating evaluation");

        let _created: Option<EvaluationRow> = self
            .db
            .create("evaluations")
            .content(EvaluationRow::from(&evaluation))
            .await?;

        Ok(evaluation)
    }

    #[instrument(skip(self))]
    async fn claim_batch(&self, request: ClaimRequest) -> StorageResult<Vec<Evaluation>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }
        let mut conflicts = 0;
        let mut res = loop {
            let now = Utc::now();
            let attempt = self
                .db
                .query(CLAIM_SQL)
                .bind(("limit", request.limit as i64))
                .bind(("retry_limit", request.retry_limit as i64))
                .bind(("oldest", SurrealDatetime::from(now - request.max_age)))
                .bind(("now", SurrealDatetime::from(now)))
                .await
                .and_then(|res| res.check());
            match attempt {
                Ok(res) => break res,
                Err(e) if is_write_conflict(&e) && conflicts < CLAIM_CONFLICT_RETRIES => {
                    conflicts += 1;
                    debug!(conflicts, "claim lost a write conflict, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        };

        // Statement 0 is the LET.
        let rows: Vec<EvaluationRow> = res.take(1)?;
        let mut claimed = Self::rows_to_evaluations(rows)?;
        claimed.sort_by_key(|e| e.created_at);

        debug!(claimed = claimed.len(), "claimed evaluations");
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
        self.fetch_running(evaluation_id).await?;

        self.db
            .query("UPSERT type::thing('partial_results', [$eid, $kind]) CONTENT $row")
            .bind(("eid", evaluation_id.0.clone()))
            .bind(("kind", agent_kind.as_str().to_string()))
            .bind(("row", PartialResultRow::from(&partial)))
            .await?
            .check()?;

        Ok(())
    }

    #[instrument(skip(self, finalization), fields(status = %finalization.status))]
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

        let failed_kinds: Vec<String> = finalization
            .failed_kinds
            .iter()
            .map(|k| k.as_str().to_string())
            .collect();

        let mut res = self
            .db
            .query(FINALIZE_SQL)
            .bind(("eid", evaluation_id.0.clone()))
            .bind(("status", finalization.status.as_str().to_string()))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("score", finalization.overall_score))
            .bind(("errors", finalization.errors))
            .bind(("failed_kinds", failed_kinds))
            .bind(("retryable", finalization.retryable))
            .await?;

        let rows: Vec<EvaluationRow> = res.take(0)?;
        match rows.into_iter().next() {
            Some(row) => Evaluation::try_from(row),
            // Nothing matched: either missing or not running.
            None => {
                self.fetch_running(evaluation_id).await?;
                Err(StorageError::Backend(format!(
                    "finalize of {evaluation_id} matched no running row"
                )))
            }
        }
    }

    async fn get_evaluation(&self, evaluation_id: &EvaluationId) -> StorageResult<Evaluation> {
        let row = self.fetch_evaluation(evaluation_id).await?;
        Evaluation::try_from(row)
    }

    async fn list_partials(
        &self,
        evaluation_id: &EvaluationId,
    ) -> StorageResult<Vec<PartialResult>> {
        self.fetch_evaluation(evaluation_id).await?;

        let mut res = self
            .db
            .query("SELECT * FROM partial_results WHERE evaluation_id = $eid")
            .bind(("eid", evaluation_id.0.clone()))
            .await?;

        let rows: Vec<PartialResultRow> = res.take(0)?;
        let mut partials = rows
            .into_iter()
            .map(PartialResult::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        partials.sort_by_key(|p| p.agent_kind);
        Ok(partials)
    }

    async fn count_claimed_since(&self, since: DateTime<Utc>) -> StorageResult<u64> {
        let mut res = self
            .db
            .query(
                "SELECT count() AS count FROM evaluations \
                 WHERE started_at != NONE AND started_at >= $since GROUP ALL",
            )
            .bind(("since", SurrealDatetime::from(since)))
            .await?;

        let rows: Vec<CountRow> = res.take(0)?;
        Ok(rows.first().map(|r| r.count).unwrap_or(0))
    }

    async fn find_stale(&self, cutoff: DateTime<Utc>) -> StorageResult<Vec<Evaluation>> {
        let mut res = self
            .db
            .query(
                "SELECT * FROM evaluations \
                 WHERE status = 'running' AND started_at != NONE AND started_at < $cutoff \
                 ORDER BY started_at ASC",
            )
            .bind(("cutoff", SurrealDatetime::from(cutoff)))
            .await?;

        let rows: Vec<EvaluationRow> = res.take(0)?;
        Self::rows_to_evaluations(rows)
    }

    #[instrument(skip(self))]
    async fn reap_stale(
        &self,
        cutoff: DateTime<Utc>,
        reason: &str,
    ) -> StorageResult<Vec<Evaluation>> {
        let mut res = self
            .db
            .query(REAP_SQL)
            .bind(("cutoff", SurrealDatetime::from(cutoff)))
            .bind(("now", SurrealDatetime::from(Utc::now())))
            .bind(("reason", reason.to_string()))
            .await?;

        let rows: Vec<EvaluationRow> = res.take(0)?;
        let mut reaped = Self::rows_to_evaluations(rows)?;
        reaped.sort_by_key(|e| e.started_at);
        Ok(reaped)
    }
}

#[async_trait]
impl AgentRunLedger for SurrealEvaluationStore {
    async fn insert_agent_run(&self, run: AgentRun) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "SELECT VALUE attempt_number FROM agent_runs \
                 WHERE evaluation_id = $eid AND agent_kind = $kind",
            )
            .bind(("eid", run.evaluation_id.0.clone()))
            .bind(("kind", run.agent_kind.as_str().to_string()))
            .await?;

        let attempts: Vec<u32> = res.take(0)?;
        let latest = attempts.into_iter().max().unwrap_or(0);
        if run.attempt_number <= latest {
            return Err(StorageError::NonMonotonicAttempt {
                id: run.evaluation_id.0.clone(),
                agent_kind: run.agent_kind.to_string(),
                attempt: run.attempt_number,
                latest,
            });
        }

        let _created: Option<AgentRunRow> = self
            .db
            .create("agent_runs")
            .content(AgentRunRow::from(&run))
            .await?;
        Ok(())
    }

    async fn update_agent_run(&self, run: AgentRun) -> StorageResult<()> {
        let mut res = self
            .db
            .query(
                "UPDATE agent_runs CONTENT $row \
                 WHERE evaluation_id = $eid AND agent_kind = $kind AND attempt_number = $attempt \
                 RETURN AFTER",
            )
            .bind(("row", AgentRunRow::from(&run)))
            .bind(("eid", run.evaluation_id.0.clone()))
            .bind(("kind", run.agent_kind.as_str().to_string()))
            .bind(("attempt", run.attempt_number as i64))
            .await?;

        let rows: Vec<AgentRunRow> = res.take(0)?;
        if rows.is_empty() {
            return Err(StorageError::AgentRunNotFound {
                id: run.evaluation_id.0.clone(),
                agent_kind: run.agent_kind.to_string(),
                attempt: run.attempt_number,
            });
        }
        Ok(())
    }

    async fn list_agent_runs(&self, evaluation_id: &EvaluationId) -> StorageResult<Vec<AgentRun>> {
        let mut res = self
            .db
            .query("SELECT * FROM agent_runs WHERE evaluation_id = $eid")
            .bind(("eid", evaluation_id.0.clone()))
            .await?;

        let rows: Vec<AgentRunRow> = res.take(0)?;
        let mut runs = rows
            .into_iter()
            .map(AgentRun::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        runs.sort_by_key(|r| (r.agent_kind, r.attempt_number));
        Ok(runs)
    }
}

#[async_trait]
impl BreakerStore for SurrealEvaluationStore {
    async fn load_breakers(&self) -> StorageResult<Vec<CircuitBreakerState>> {
        let mut res = self.db.query("SELECT * FROM breakers").await?;
        let rows: Vec<BreakerRow> = res.take(0)?;
        let mut states = rows
            .into_iter()
            .map(CircuitBreakerState::try_from)
            .collect::<StorageResult<Vec<_>>>()?;
        states.sort_by_key(|s| s.agent_kind);
        Ok(states)
    }

    async fn save_breaker(&self, state: CircuitBreakerState) -> StorageResult<()> {
        self.db
            .query("UPSERT type::thing('breakers', $kind) CONTENT $row")
            .bind(("kind", state.agent_kind.as_str().to_string()))
            .bind(("row", BreakerRow::from(&state)))
            .await?
            .check()?;
        Ok(())
    }
}
