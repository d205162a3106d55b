//! Evaluation orchestration.
//!
//! One claimed evaluation is driven through the pipeline stage by stage. Kinds
//! in a stage run concurrently; attempts of one kind run strictly in sequence
//! with the breaker consulted before each one. Once every kind has settled
//! the evaluation is finalized exactly once.
//!
//! Between attempts of one kind the orchestrator backs off exponentially,
//! and stops retrying once the kind's retry window (`max_total_ms`) has
//! passed.
//!
//! The whole drive runs in its own task. Whatever happens inside it (a
//! storage error, a panic) the evaluation still gets a terminal write and
//! its in-flight attempt rows are closed, so a claimed row is only ever left
//! `running` if that write itself fails. The zombie reaper covers that last
//! case.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use eval_state::{
    AgentKind, AgentRun, AgentRunStatus, Evaluation, EvaluationId, EvaluationStatus,
    Finalization, PartialResult, Stores,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn, Instrument};

use crate::breaker::BreakerManager;
use crate::error::Result;
use crate::executor::{AgentExecutor, AgentOutput, AttemptOutcome, ProbeContext, ProbeRegistry};
use crate::metrics::METRICS;
use crate::obs;
use crate::pipeline::Pipeline;
use crate::scoring::{clamp_score, overall_score};

/// Failure reason for kinds cut short by [`Orchestrator::shutdown`].
pub const SHUTDOWN_REASON: &str = "interrupted by shutdown";

/// What one orchestration cycle produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationOutcome {
    pub evaluation_id: EvaluationId,
    pub status: EvaluationStatus,
    pub overall_score: Option<f64>,
    pub failed_kinds: Vec<AgentKind>,
    /// Errors recorded in this cycle only.
    pub errors: Vec<String>,
}

/// How one kind settled within a cycle.
#[derive(Debug, Clone)]
enum KindResult {
    Succeeded(AgentOutput),
    Failed(String),
    CircuitOpen,
}

#[derive(Debug, Clone)]
struct KindReport {
    kind: AgentKind,
    result: KindResult,
    /// Attempts dispatched or rejected in this cycle.
    attempts: u32,
}

impl KindReport {
    fn error_line(&self) -> Option<String> {
        match &self.result {
            KindResult::Succeeded(_) => None,
            KindResult::Failed(reason) => Some(format!(
                "{}: {} (after {} attempt{})",
                self.kind,
                reason,
                self.attempts,
                if self.attempts == 1 { "" } else { "s" }
            )),
            KindResult::CircuitOpen => Some(format!("{}: circuit breaker open", self.kind)),
        }
    }
}

pub struct Orchestrator {
    stores: Stores,
    breakers: Arc<BreakerManager>,
    executor: AgentExecutor,
    pipeline: Pipeline,
    retry_limit: u32,
    shutdown: CancellationToken,
}

impl Orchestrator {
    /// Fails if the pipeline is invalid or a pipeline kind has no probe.
    pub fn new(
        stores: Stores,
        breakers: Arc<BreakerManager>,
        registry: ProbeRegistry,
        pipeline: Pipeline,
        retry_limit: u32,
    ) -> Result<Self> {
        pipeline.validate()?;
        registry.ensure_covers(&pipeline)?;
        Ok(Self {
            stores,
            breakers,
            executor: AgentExecutor::new(registry),
            pipeline,
            retry_limit,
            shutdown: CancellationToken::new(),
        })
    }

    /// Stop dispatching. Running attempts are cancelled and pending retries
    /// dropped; evaluations in flight still finalize.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn breakers(&self) -> &Arc<BreakerManager> {
        &self.breakers
    }

    /// Drive a claimed (`running`) evaluation to a terminal status.
    ///
    /// Never returns an error: faults are converted into a `failed`
    /// finalization and reported in the outcome.
    pub async fn run(self: &Arc<Self>, evaluation: Evaluation) -> EvaluationOutcome {
        let span = obs::evaluation_span(&evaluation.id, &evaluation.target_id);
        let this = Arc::clone(self);
        let claimed = evaluation.clone();
        let handle = tokio::spawn(async move { this.drive(claimed).await }.instrument(span.clone()));

        let fault = match handle.await {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(e)) => e.to_string(),
            Err(join) if join.is_panic() => "orchestration task panicked".to_string(),
            Err(_) => "orchestration task cancelled".to_string(),
        };
        self.finalize_fault(&evaluation, fault).instrument(span).await
    }

    async fn drive(&self, evaluation: Evaluation) -> Result<EvaluationOutcome> {
        // Attempt numbers continue from earlier cycles of the same evaluation.
        let mut prior_attempts: BTreeMap<AgentKind, u32> = BTreeMap::new();
        for run in self.stores.agent_runs.list_agent_runs(&evaluation.id).await? {
            let latest = prior_attempts.entry(run.agent_kind).or_insert(0);
            *latest = (*latest).max(run.attempt_number);
        }

        let mut previous: BTreeMap<AgentKind, AgentOutput> = BTreeMap::new();
        let mut reports = Vec::with_capacity(self.pipeline.kinds().len());

        for stage in &self.pipeline.stages {
            let shared = Arc::new(previous.clone());
            let runs = stage.agents.iter().map(|agent| {
                let prior = prior_attempts.get(&agent.kind).copied().unwrap_or(0);
                self.run_kind(&evaluation, agent.kind, prior, Arc::clone(&shared))
            });

            for report in join_all(runs).await {
                let report = report?;
                if let KindResult::Succeeded(output) = &report.result {
                    previous.insert(report.kind, output.clone());
                }
                reports.push(report);
            }
        }

        self.finalize(&evaluation, &reports).await
    }

    #[instrument(skip(self, evaluation, previous), fields(agent_kind = %kind))]
    async fn run_kind(
        &self,
        evaluation: &Evaluation,
        kind: AgentKind,
        prior_attempts: u32,
        previous: Arc<BTreeMap<AgentKind, AgentOutput>>,
    ) -> Result<KindReport> {
        let schedule = self.breakers.schedule(kind);
        let max_attempts = schedule.max_attempts();
        let first_dispatch = tokio::time::Instant::now();
        let mut last_reason = String::from("no attempt dispatched");
        let settled = |result: KindResult, attempts: u32| KindReport {
            kind,
            result,
            attempts,
        };

        for local in 1..=max_attempts {
            let attempt_number = prior_attempts + local;

            if local > 1 {
                if let Some(window) = schedule.max_total_ms {
                    let elapsed = first_dispatch.elapsed().as_millis() as u64;
                    if elapsed >= window {
                        obs::emit_retry_window_exhausted(&evaluation.id, kind, elapsed, window);
                        return Ok(settled(
                            KindResult::Failed(format!(
                                "{last_reason}; retry window of {window}ms exhausted"
                            )),
                            local - 1,
                        ));
                    }
                }
                let delay = schedule.backoff_after(local - 1);
                if delay > 0 {
                    obs::emit_retry_scheduled(&evaluation.id, kind, attempt_number, delay);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => {}
                        _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
                    }
                }
            }
            if self.shutdown.is_cancelled() {
                return Ok(settled(
                    KindResult::Failed(SHUTDOWN_REASON.to_string()),
                    local - 1,
                ));
            }

            let mut run = AgentRun::queued(evaluation.id.clone(), kind, attempt_number);
            let auth = self.breakers.authorize(kind, local).await;
            if !auth.allowed {
                METRICS.inc_circuit_rejections();
                obs::emit_circuit_rejected(&evaluation.id, kind, auth.retry_after_ms);
                run.reject_circuit_open();
                self.stores.agent_runs.insert_agent_run(run).await?;
                return Ok(settled(KindResult::CircuitOpen, local));
            }

            run.start(auth.timeout_ms);
            self.stores.agent_runs.insert_agent_run(run.clone()).await?;
            METRICS.inc_agent_attempts();
            obs::emit_attempt_started(&evaluation.id, kind, attempt_number, auth.timeout_ms);

            let ctx = ProbeContext {
                evaluation_id: evaluation.id.clone(),
                agent_kind: kind,
                attempt: attempt_number,
                timeout_ms: auth.timeout_ms,
                previous_results: Arc::clone(&previous),
                cancel: self.shutdown.child_token(),
            };
            let started = tokio::time::Instant::now();
            let outcome = self
                .executor
                .execute(kind, &evaluation.target_id, ctx, auth.timeout_ms)
                .await;
            obs::emit_attempt_finished(
                &evaluation.id,
                kind,
                attempt_number,
                outcome.label(),
                started.elapsed().as_millis() as u64,
            );

            match outcome {
                AttemptOutcome::Succeeded(output) => {
                    let output = AgentOutput::new(clamp_score(output.score), output.data);
                    self.breakers.record_outcome(kind, true).await;
                    self.stores
                        .evaluations
                        .record_partial(
                            &evaluation.id,
                            kind,
                            PartialResult::new(
                                evaluation.id.clone(),
                                kind,
                                output.score,
                                output.data.clone(),
                            ),
                        )
                        .await?;
                    run.succeed(serde_json::json!({
                        "score": output.score,
                        "data": output.data,
                    }));
                    self.stores.agent_runs.update_agent_run(run).await?;
                    return Ok(settled(KindResult::Succeeded(output), local));
                }
                AttemptOutcome::Failed(reason) => {
                    self.breakers.record_outcome(kind, false).await;
                    run.fail(reason.clone(), false);
                    self.stores.agent_runs.update_agent_run(run).await?;
                    last_reason = reason;
                }
                AttemptOutcome::TimedOut { budget_ms } => {
                    METRICS.inc_agent_timeouts();
                    self.breakers.record_outcome(kind, false).await;
                    let reason = format!("timed out after {budget_ms}ms");
                    run.fail(reason.clone(), true);
                    self.stores.agent_runs.update_agent_run(run).await?;
                    last_reason = reason;
                }
                // Not the agent's fault, so the breaker is left alone.
                AttemptOutcome::Cancelled => {
                    run.fail(SHUTDOWN_REASON, false);
                    self.stores.agent_runs.update_agent_run(run).await?;
                    return Ok(settled(
                        KindResult::Failed(SHUTDOWN_REASON.to_string()),
                        local,
                    ));
                }
            }
        }

        Ok(settled(KindResult::Failed(last_reason), max_attempts))
    }

    async fn finalize(
        &self,
        evaluation: &Evaluation,
        reports: &[KindReport],
    ) -> Result<EvaluationOutcome> {
        let succeeded: Vec<(AgentKind, f64)> = reports
            .iter()
            .filter_map(|r| match &r.result {
                KindResult::Succeeded(output) => Some((r.kind, output.score)),
                _ => None,
            })
            .collect();
        let failed_kinds: Vec<AgentKind> = reports
            .iter()
            .filter(|r| !matches!(r.result, KindResult::Succeeded(_)))
            .map(|r| r.kind)
            .collect();
        let errors: Vec<String> = reports.iter().filter_map(KindReport::error_line).collect();

        let required = self.pipeline.required_kinds();
        let satisfied = if required.is_empty() {
            !succeeded.is_empty()
        } else {
            succeeded.iter().any(|(k, _)| required.contains(k))
        };

        let finalization = match (satisfied, overall_score(&self.pipeline, &succeeded)) {
            (true, Some(score)) => {
                Finalization::completed(score, failed_kinds.clone(), errors.clone())
            }
            _ => Finalization::failed(
                errors.clone(),
                failed_kinds.clone(),
                evaluation.retry_count < self.retry_limit,
            ),
        };

        let record = self
            .stores
            .evaluations
            .finalize(&evaluation.id, finalization)
            .await?;

        match record.status {
            EvaluationStatus::Completed => METRICS.inc_completed(),
            _ => METRICS.inc_failed(),
        }
        obs::emit_evaluation_finalized(
            &record.id,
            record.status,
            record.overall_score,
            failed_kinds.len(),
        );

        Ok(EvaluationOutcome {
            evaluation_id: record.id,
            status: record.status,
            overall_score: record.overall_score,
            failed_kinds,
            errors,
        })
    }

    async fn finalize_fault(&self, evaluation: &Evaluation, fault: String) -> EvaluationOutcome {
        obs::emit_orchestration_fault(&evaluation.id, &fault);
        let message = format!("orchestration error: {fault}");
        self.close_in_flight_attempts(&evaluation.id, &message).await;
        let finalization = Finalization::failed(
            vec![message.clone()],
            Vec::new(),
            evaluation.retry_count < self.retry_limit,
        );

        match self
            .stores
            .evaluations
            .finalize(&evaluation.id, finalization)
            .await
        {
            Ok(record) => {
                METRICS.inc_failed();
                obs::emit_evaluation_finalized(&record.id, record.status, None, 0);
            }
            Err(e) => obs::emit_finalize_error(&evaluation.id, &e),
        }

        EvaluationOutcome {
            evaluation_id: evaluation.id.clone(),
            status: EvaluationStatus::Failed,
            overall_score: None,
            failed_kinds: Vec::new(),
            errors: vec![message],
        }
    }

    /// Fail every attempt row of the evaluation still marked `in_progress`.
    async fn close_in_flight_attempts(&self, evaluation_id: &EvaluationId, reason: &str) {
        let runs = match self.stores.agent_runs.list_agent_runs(evaluation_id).await {
            Ok(runs) => runs,
            Err(e) => {
                warn!(evaluation_id = %evaluation_id, error = %e, "failed to list attempts to close");
                return;
            }
        };

        let mut closed = 0;
        for mut run in runs
            .into_iter()
            .filter(|r| r.status == AgentRunStatus::InProgress)
        {
            run.fail(reason, false);
            match self.stores.agent_runs.update_agent_run(run).await {
                Ok(()) => closed += 1,
                Err(e) => {
                    warn!(evaluation_id = %evaluation_id, error = %e, "failed to close attempt")
                }
            }
        }
        if closed > 0 {
            obs::emit_attempts_abandoned(evaluation_id, closed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_lines_name_the_kind() {
        let failed = KindReport {
            kind: AgentKind::Sentiment,
            result: KindResult::Failed("timed out after 90000ms".into()),
            attempts: 3,
        };
        assert_eq!(
            failed.error_line().as_deref(),
            Some("sentiment_agent: timed out after 90000ms (after 3 attempts)")
        );

        let single = KindReport {
            kind: AgentKind::Crawl,
            result: KindResult::Failed("boom".into()),
            attempts: 1,
        };
        assert_eq!(
            single.error_line().as_deref(),
            Some("crawl_agent: boom (after 1 attempt)")
        );

        let rejected = KindReport {
            kind: AgentKind::Commerce,
            result: KindResult::CircuitOpen,
            attempts: 1,
        };
        assert_eq!(
            rejected.error_line().as_deref(),
            Some("commerce_agent: circuit breaker open")
        );

        let ok = KindReport {
            kind: AgentKind::Crawl,
            result: KindResult::Succeeded(AgentOutput::new(1.0, serde_json::Value::Null)),
            attempts: 1,
        };
        assert!(ok.error_line().is_none());
    }
}
