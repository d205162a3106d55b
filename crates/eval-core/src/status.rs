//! Read-only status view of one evaluation.

use std::collections::BTreeSet;

use eval_state::{
    AgentKind, AgentRun, AgentRunStatus, Evaluation, EvaluationId, EvaluationStatus,
    PartialResult,
};
use serde::{Deserialize, Serialize};

use crate::pipeline::Pipeline;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub total_kinds: usize,
    pub succeeded_kinds: usize,
    /// Kinds with at least one settled attempt.
    pub attempted_kinds: usize,
    pub completion_pct: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationStatusView {
    pub evaluation_id: EvaluationId,
    pub target_id: String,
    pub status: EvaluationStatus,
    pub overall_score: Option<f64>,
    pub errors: Vec<String>,
    pub failed_kinds: Vec<AgentKind>,
    pub retry_count: u32,
    pub partial_results: Vec<PartialResult>,
    pub agent_runs: Vec<AgentRun>,
    pub progress: Progress,
}

impl EvaluationStatusView {
    pub fn assemble(
        evaluation: Evaluation,
        partial_results: Vec<PartialResult>,
        agent_runs: Vec<AgentRun>,
        pipeline: &Pipeline,
    ) -> Self {
        let kinds = pipeline.kinds();
        let succeeded: BTreeSet<AgentKind> = partial_results
            .iter()
            .map(|p| p.agent_kind)
            .filter(|k| kinds.contains(k))
            .collect();
        let attempted: BTreeSet<AgentKind> = agent_runs
            .iter()
            .filter(|r| r.status.is_settled())
            .map(|r| r.agent_kind)
            .chain(succeeded.iter().copied())
            .filter(|k| kinds.contains(k))
            .collect();

        let completion_pct = if kinds.is_empty() {
            0.0
        } else {
            (succeeded.len() as f64 * 10_000.0 / kinds.len() as f64).round() / 100.0
        };

        Self {
            evaluation_id: evaluation.id,
            target_id: evaluation.target_id,
            status: evaluation.status,
            overall_score: evaluation.overall_score,
            errors: evaluation.errors,
            failed_kinds: evaluation.failed_kinds,
            retry_count: evaluation.retry_count,
            partial_results,
            agent_runs,
            progress: Progress {
                total_kinds: kinds.len(),
                succeeded_kinds: succeeded.len(),
                attempted_kinds: attempted.len(),
                completion_pct,
            },
        }
    }

    /// Attempts currently in flight.
    pub fn in_progress(&self) -> impl Iterator<Item = &AgentRun> {
        self.agent_runs
            .iter()
            .filter(|r| r.status == AgentRunStatus::InProgress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_counts_succeeded_and_attempted_kinds() {
        let evaluation = Evaluation::new("brand-1");
        let id = evaluation.id.clone();
        let partials = vec![
            PartialResult::new(id.clone(), AgentKind::Crawl, 80.0, serde_json::Value::Null),
            PartialResult::new(id.clone(), AgentKind::LlmTest, 60.0, serde_json::Value::Null),
        ];

        let mut failed = AgentRun::queued(id.clone(), AgentKind::Citation, 1);
        failed.start(60_000);
        failed.fail("boom", false);
        let mut running = AgentRun::queued(id.clone(), AgentKind::Commerce, 1);
        running.start(90_000);

        let view = EvaluationStatusView::assemble(
            evaluation,
            partials,
            vec![failed, running],
            &Pipeline::default(),
        );
        assert_eq!(view.progress.total_kinds, 6);
        assert_eq!(view.progress.succeeded_kinds, 2);
        assert_eq!(view.progress.attempted_kinds, 3);
        assert_eq!(view.progress.completion_pct, 33.33);
        assert_eq!(view.in_progress().count(), 1);
    }
}
