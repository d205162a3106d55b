//! Queue processor: one tick of claim-and-run.
//!
//! Each [`QueueProcessor::run_once`] claims a bounded batch of schedulable
//! evaluations and drives them through the orchestrator on a worker pool.
//! The batch is capped by both `batch_size` and what is left of the UTC-day
//! claim budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use eval_state::{ClaimRequest, EvaluationStatus, EvaluationStore};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{instrument, warn};

use crate::breaker::Clock;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::metrics::METRICS;
use crate::obs;
use crate::orchestrator::Orchestrator;

/// Summary of one queue tick.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueRunReport {
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Claims still allowed today after this run.
    pub budget_remaining: u64,
    /// Set when the run did nothing on purpose.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped_reason: Option<String>,
}

impl QueueRunReport {
    fn skipped(reason: &str, budget_remaining: u64) -> Self {
        obs::emit_queue_skipped(reason);
        Self {
            budget_remaining,
            skipped_reason: Some(reason.to_string()),
            ..Default::default()
        }
    }
}

/// Start of the UTC day containing `now`.
pub fn utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
}

struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct QueueProcessor {
    orchestrator: Arc<Orchestrator>,
    evaluations: Arc<dyn EvaluationStore>,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
}

impl QueueProcessor {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        evaluations: Arc<dyn EvaluationStore>,
        config: QueueConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            orchestrator,
            evaluations,
            config,
            clock,
            running: AtomicBool::new(false),
        }
    }

    /// Claim up to the allowed batch and run it to completion.
    ///
    /// A call that overlaps one already in progress returns immediately with
    /// `skipped_reason` set.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<QueueRunReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(QueueRunReport::skipped("previous run still in progress", 0));
        }
        let _guard = RunGuard(&self.running);
        if self.orchestrator.is_shutting_down() {
            return Ok(QueueRunReport::skipped("shutting down", 0));
        }

        let now = self.clock.now();
        let claimed_today = self.evaluations.count_claimed_since(utc_midnight(now)).await?;
        let remaining = self.config.daily_limit.saturating_sub(claimed_today);
        if remaining == 0 {
            return Ok(QueueRunReport::skipped("daily limit reached", 0));
        }

        let limit = (self.config.batch_size as u64).min(remaining) as usize;
        let request = ClaimRequest::new(
            limit,
            chrono::Duration::hours(self.config.retry_max_age_hours),
            self.config.max_retries,
        );
        let batch = self.evaluations.claim_batch(request).await?;
        let budget_remaining = remaining.saturating_sub(batch.len() as u64);
        if batch.is_empty() {
            return Ok(QueueRunReport {
                budget_remaining,
                ..Default::default()
            });
        }

        METRICS.add_claimed(batch.len() as u64);
        let claimed = batch.len();
        let sem = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut tasks = Vec::with_capacity(claimed);

        for evaluation in batch {
            obs::emit_evaluation_claimed(&evaluation.id, evaluation.retry_count);
            let orchestrator = Arc::clone(&self.orchestrator);
            let sem = Arc::clone(&sem);
            let id = evaluation.id.clone();
            let task = tokio::spawn(async move {
                let _permit = sem.acquire_owned().await.ok();
                orchestrator.run(evaluation).await
            });
            tasks.push((id, task));
        }

        let mut report = QueueRunReport {
            claimed,
            budget_remaining,
            ..Default::default()
        };
        for (id, task) in tasks {
            match task.await {
                Ok(outcome) if outcome.status == EvaluationStatus::Completed => {
                    report.completed += 1
                }
                Ok(_) => report.failed += 1,
                Err(e) => {
                    warn!(evaluation_id = %id, error = %e, "evaluation worker aborted");
                    report.failed += 1;
                }
            }
        }

        obs::emit_queue_run(
            report.claimed,
            report.completed,
            report.failed,
            report.budget_remaining,
        );
        METRICS.flush();
        Ok(report)
    }
}
