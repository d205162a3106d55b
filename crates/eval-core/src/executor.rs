//! Agent execution with a hard deadline.
//!
//! The executor runs one attempt of one probe in its own task. When the
//! budget runs out the task is aborted and the attempt's
//! [`CancellationToken`] is cancelled, so cooperative probes can stop
//! outbound work too. Retries are the orchestrator's job, not ours.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use eval_state::{AgentKind, EvaluationId};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{OrchestratorError, ProbeError};
use crate::pipeline::Pipeline;

/// Successful probe output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Normalised 0..=100.
    pub score: f64,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl AgentOutput {
    pub fn new(score: f64, data: serde_json::Value) -> Self {
        Self { score, data }
    }
}

/// Everything a probe knows about the attempt it is serving.
#[derive(Debug, Clone)]
pub struct ProbeContext {
    pub evaluation_id: EvaluationId,
    pub agent_kind: AgentKind,
    /// Ledger attempt number (1-based, unique per evaluation and kind).
    pub attempt: u32,
    pub timeout_ms: u64,
    /// Outputs of kinds that succeeded in earlier stages.
    pub previous_results: Arc<BTreeMap<AgentKind, AgentOutput>>,
    /// Cancelled when the attempt's budget runs out.
    pub cancel: CancellationToken,
}

/// A single agent implementation.
#[async_trait]
pub trait AgentProbe: Send + Sync {
    async fn probe(&self, target_id: &str, ctx: ProbeContext) -> Result<AgentOutput, ProbeError>;
}

/// Explicit mapping from agent kind to its probe.
#[derive(Clone, Default)]
pub struct ProbeRegistry {
    probes: BTreeMap<AgentKind, Arc<dyn AgentProbe>>,
}

impl ProbeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: AgentKind, probe: Arc<dyn AgentProbe>) {
        self.probes.insert(kind, probe);
    }

    pub fn with(mut self, kind: AgentKind, probe: Arc<dyn AgentProbe>) -> Self {
        self.register(kind, probe);
        self
    }

    pub fn get(&self, kind: AgentKind) -> Option<Arc<dyn AgentProbe>> {
        self.probes.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<AgentKind> {
        self.probes.keys().copied().collect()
    }

    /// Every pipeline kind must have a probe; there are no silent no-op stages.
    pub fn ensure_covers(&self, pipeline: &Pipeline) -> Result<(), OrchestratorError> {
        match pipeline.kinds().into_iter().find(|k| !self.probes.contains_key(k)) {
            Some(missing) => Err(OrchestratorError::MissingProbe(missing)),
            None => Ok(()),
        }
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Succeeded(AgentOutput),
    Failed(String),
    TimedOut { budget_ms: u64 },
    /// The context's token was cancelled from outside before the probe
    /// settled. Says nothing about the agent's health.
    Cancelled,
}

impl AttemptOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Succeeded(_) => "succeeded",
            AttemptOutcome::Failed(_) => "failed",
            AttemptOutcome::TimedOut { .. } => "timed_out",
            AttemptOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Clone)]
pub struct AgentExecutor {
    registry: ProbeRegistry,
}

impl AgentExecutor {
    pub fn new(registry: ProbeRegistry) -> Self {
        Self { registry }
    }

    /// Run one attempt of `kind` against `target_id` within `budget_ms`.
    pub async fn execute(
        &self,
        kind: AgentKind,
        target_id: &str,
        ctx: ProbeContext,
        budget_ms: u64,
    ) -> AttemptOutcome {
        let probe = match self.registry.get(kind) {
            Some(probe) => probe,
            None => return AttemptOutcome::Failed(format!("no probe registered for {kind}")),
        };

        let cancel = ctx.cancel.clone();
        let target = target_id.to_string();
        let mut handle = tokio::spawn(async move { probe.probe(&target, ctx).await });
        let abort = handle.abort_handle();

        let joined = tokio::select! {
            biased;
            joined = &mut handle => joined,
            _ = cancel.cancelled() => {
                abort.abort();
                return AttemptOutcome::Cancelled;
            }
            _ = tokio::time::sleep(Duration::from_millis(budget_ms)) => {
                cancel.cancel();
                abort.abort();
                return AttemptOutcome::TimedOut { budget_ms };
            }
        };

        match joined {
            Ok(Ok(output)) => {
                if output.score.is_finite() {
                    AttemptOutcome::Succeeded(output)
                } else {
                    AttemptOutcome::Failed(format!("{kind} returned non-finite score"))
                }
            }
            Ok(Err(_)) if cancel.is_cancelled() => AttemptOutcome::Cancelled,
            Ok(Err(e)) => AttemptOutcome::Failed(e.to_string()),
            Err(join) if join.is_panic() => AttemptOutcome::Failed(format!("{kind} probe panicked")),
            Err(_) => AttemptOutcome::Failed(format!("{kind} probe task cancelled")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Fixed(f64);

    #[async_trait]
    impl AgentProbe for Fixed {
        async fn probe(&self, _t: &str, _ctx: ProbeContext) -> Result<AgentOutput, ProbeError> {
            Ok(AgentOutput::new(self.0, serde_json::json!({"ok": true})))
        }
    }

    struct Erroring;

    #[async_trait]
    impl AgentProbe for Erroring {
        async fn probe(&self, _t: &str, _ctx: ProbeContext) -> Result<AgentOutput, ProbeError> {
            Err(ProbeError::Failed("upstream 503".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl AgentProbe for Panicking {
        async fn probe(&self, _t: &str, _ctx: ProbeContext) -> Result<AgentOutput, ProbeError> {
            panic!("probe bug");
        }
    }

    /// Sleeps past any budget, noting whether it saw cancellation.
    struct Sleepy {
        saw_cancel: Arc<AtomicBool>,
    }

    #[async_trait]
    impl AgentProbe for Sleepy {
        async fn probe(&self, _t: &str, ctx: ProbeContext) -> Result<AgentOutput, ProbeError> {
            let flag = self.saw_cancel.clone();
            let token = ctx.cancel.clone();
            tokio::spawn(async move {
                token.cancelled().await;
                flag.store(true, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(AgentOutput::new(1.0, serde_json::Value::Null))
        }
    }

    fn ctx(kind: AgentKind) -> ProbeContext {
        ProbeContext {
            evaluation_id: EvaluationId::new(),
            agent_kind: kind,
            attempt: 1,
            timeout_ms: 1_000,
            previous_results: Arc::new(BTreeMap::new()),
            cancel: CancellationToken::new(),
        }
    }

    fn executor(kind: AgentKind, probe: Arc<dyn AgentProbe>) -> AgentExecutor {
        AgentExecutor::new(ProbeRegistry::new().with(kind, probe))
    }

    #[tokio::test]
    async fn success_passes_output_through() {
        let exec = executor(AgentKind::Crawl, Arc::new(Fixed(88.0)));
        let outcome = exec.execute(AgentKind::Crawl, "t", ctx(AgentKind::Crawl), 1_000).await;
        assert_eq!(
            outcome,
            AttemptOutcome::Succeeded(AgentOutput::new(88.0, serde_json::json!({"ok": true})))
        );
    }

    #[tokio::test]
    async fn probe_error_is_failed() {
        let exec = executor(AgentKind::Crawl, Arc::new(Erroring));
        let outcome = exec.execute(AgentKind::Crawl, "t", ctx(AgentKind::Crawl), 1_000).await;
        assert!(matches!(outcome, AttemptOutcome::Failed(ref r) if r.contains("upstream 503")));
    }

    #[tokio::test]
    async fn probe_panic_is_failed() {
        let exec = executor(AgentKind::Crawl, Arc::new(Panicking));
        let outcome = exec.execute(AgentKind::Crawl, "t", ctx(AgentKind::Crawl), 1_000).await;
        assert!(matches!(outcome, AttemptOutcome::Failed(ref r) if r.contains("panicked")));
    }

    #[tokio::test]
    async fn non_finite_score_is_failed() {
        let exec = executor(AgentKind::Crawl, Arc::new(Fixed(f64::NAN)));
        let outcome = exec.execute(AgentKind::Crawl, "t", ctx(AgentKind::Crawl), 1_000).await;
        assert!(matches!(outcome, AttemptOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn missing_probe_is_failed() {
        let exec = AgentExecutor::new(ProbeRegistry::new());
        let outcome = exec.execute(AgentKind::Commerce, "t", ctx(AgentKind::Commerce), 1_000).await;
        assert!(matches!(outcome, AttemptOutcome::Failed(ref r) if r.contains("commerce_agent")));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_times_out_and_cancels() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let exec = executor(
            AgentKind::Sentiment,
            Arc::new(Sleepy {
                saw_cancel: saw_cancel.clone(),
            }),
        );
        let context = ctx(AgentKind::Sentiment);
        let token = context.cancel.clone();

        let outcome = exec.execute(AgentKind::Sentiment, "t", context, 90_000).await;
        assert_eq!(outcome, AttemptOutcome::TimedOut { budget_ms: 90_000 });
        assert!(token.is_cancelled());

        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert!(saw_cancel.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancel_stops_the_attempt() {
        let saw_cancel = Arc::new(AtomicBool::new(false));
        let exec = executor(
            AgentKind::Crawl,
            Arc::new(Sleepy {
                saw_cancel: saw_cancel.clone(),
            }),
        );
        let context = ctx(AgentKind::Crawl);
        let token = context.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            token.cancel();
        });

        let started = tokio::time::Instant::now();
        let outcome = exec.execute(AgentKind::Crawl, "t", context, 180_000).await;
        assert_eq!(outcome, AttemptOutcome::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(180));
    }

    #[test]
    fn registry_must_cover_pipeline() {
        let pipeline = Pipeline::default();
        let mut registry = ProbeRegistry::new();
        for kind in AgentKind::ALL {
            if kind != AgentKind::GeoVisibility {
                registry.register(kind, Arc::new(Fixed(1.0)));
            }
        }
        let err = registry.ensure_covers(&pipeline).unwrap_err();
        assert!(matches!(err, OrchestratorError::MissingProbe(AgentKind::GeoVisibility)));

        registry.register(AgentKind::GeoVisibility, Arc::new(Fixed(1.0)));
        assert!(registry.ensure_covers(&pipeline).is_ok());
    }
}
