//! Zombie reaper.
//!
//! Evaluations stuck in `running` past the allowed duration (their worker
//! crashed or the process was killed mid-run) are forced to `failed` so they
//! stop counting as in flight. Reaped rows are not retried.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use eval_state::{EvaluationId, EvaluationStore};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::breaker::Clock;
use crate::error::Result;
use crate::metrics::METRICS;
use crate::obs;

/// Appended to the errors of every reaped evaluation.
pub const REAP_REASON: &str = "exceeded maximum running duration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReapedEvaluation {
    pub id: EvaluationId,
    pub target_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub running_minutes: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReapReport {
    pub reaped_count: usize,
    pub reaped: Vec<ReapedEvaluation>,
}

pub struct ZombieReaper {
    evaluations: Arc<dyn EvaluationStore>,
    clock: Arc<dyn Clock>,
}

impl ZombieReaper {
    pub fn new(evaluations: Arc<dyn EvaluationStore>, clock: Arc<dyn Clock>) -> Self {
        Self { evaluations, clock }
    }

    fn cutoff(&self, max_running: chrono::Duration) -> (DateTime<Utc>, DateTime<Utc>) {
        let now = self.clock.now();
        (now, now - max_running)
    }

    /// Fail every `running` evaluation started more than `max_running` ago.
    #[instrument(skip(self), fields(max_running_minutes = max_running.num_minutes()))]
    pub async fn sweep(&self, max_running: chrono::Duration) -> Result<ReapReport> {
        let (now, cutoff) = self.cutoff(max_running);
        let rows = self.evaluations.reap_stale(cutoff, REAP_REASON).await?;

        let reaped: Vec<ReapedEvaluation> = rows
            .into_iter()
            .map(|row| {
                let running_minutes = row
                    .started_at
                    .map(|s| (now - s).num_minutes())
                    .unwrap_or_default();
                obs::emit_zombie_reaped(&row.id, &row.target_id, running_minutes);
                ReapedEvaluation {
                    id: row.id,
                    target_id: row.target_id,
                    started_at: row.started_at,
                    running_minutes,
                }
            })
            .collect();

        METRICS.add_zombies_reaped(reaped.len() as u64);
        Ok(ReapReport {
            reaped_count: reaped.len(),
            reaped,
        })
    }

    /// How many evaluations a sweep would reap right now.
    pub async fn count_zombies(&self, max_running: chrono::Duration) -> Result<u64> {
        let (_, cutoff) = self.cutoff(max_running);
        Ok(self.evaluations.find_stale(cutoff).await?.len() as u64)
    }
}
