//! End-to-end lifecycle scenarios over the in-memory stores.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use eval_core::{
    AgentOutput, AgentProbe, BreakerPhase, EngineConfig, EvaluationService, ProbeContext,
    ProbeError, ProbeRegistry, SystemClock, TimeoutSchedule, REAP_REASON,
};
use eval_state::fakes::{MemoryAgentRunLedger, MemoryBreakerStore, MemoryEvaluationStore};
use eval_state::{AgentKind, AgentRunStatus, EvaluationStatus, EvaluationStore, Stores};

// ---------------------------------------------------------------------------
// Probes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Step {
    Succeed(f64),
    Fail,
    Hang,
}

/// Plays back `script` one step per call, then repeats `fallback`.
struct ScriptedProbe {
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: AtomicU32,
}

impl ScriptedProbe {
    fn new(script: Vec<Step>, fallback: Step) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            calls: AtomicU32::new(0),
        })
    }

    fn always(step: Step) -> Arc<Self> {
        Self::new(Vec::new(), step)
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentProbe for ScriptedProbe {
    async fn probe(&self, _target: &str, _ctx: ProbeContext) -> Result<AgentOutput, ProbeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self.script.lock().unwrap().pop_front().unwrap_or(self.fallback);
        match step {
            Step::Succeed(score) => Ok(AgentOutput::new(score, serde_json::json!({"ok": true}))),
            Step::Fail => Err(ProbeError::Failed("agent returned an error".into())),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(AgentOutput::new(0.0, serde_json::Value::Null))
            }
        }
    }
}

fn registry_with(overrides: Vec<(AgentKind, Arc<ScriptedProbe>)>) -> ProbeRegistry {
    let mut registry = ProbeRegistry::new();
    for kind in AgentKind::ALL {
        registry.register(kind, ScriptedProbe::always(Step::Succeed(75.0)));
    }
    for (kind, probe) in overrides {
        registry.register(kind, probe);
    }
    registry
}

fn memory_stores() -> (Stores, Arc<MemoryEvaluationStore>) {
    let evaluations = Arc::new(MemoryEvaluationStore::new());
    let stores = Stores {
        evaluations: evaluations.clone(),
        agent_runs: Arc::new(MemoryAgentRunLedger::new()),
        breakers: Arc::new(MemoryBreakerStore::new()),
    };
    (stores, evaluations)
}

async fn service(
    config: EngineConfig,
    registry: ProbeRegistry,
) -> (EvaluationService, Arc<MemoryEvaluationStore>) {
    let (stores, evaluations) = memory_stores();
    let svc = EvaluationService::build(config, stores, registry, Arc::new(SystemClock))
        .await
        .unwrap();
    (svc, evaluations)
}

// ---------------------------------------------------------------------------
// Scenario A: every kind succeeds first time
// ---------------------------------------------------------------------------

#[tokio::test]
async fn all_kinds_succeed_on_first_attempt() {
    let (svc, _) = service(EngineConfig::default(), registry_with(vec![])).await;
    let evaluation = svc.create_evaluation("brand-a").await.unwrap();
    assert_eq!(evaluation.status, EvaluationStatus::Pending);

    let report = svc.run_queue_once().await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.completed, 1);
    assert_eq!(report.failed, 0);

    let view = svc.get_status(&evaluation.id).await.unwrap();
    assert_eq!(view.status, EvaluationStatus::Completed);
    assert_eq!(view.overall_score, Some(75.0));
    assert_eq!(view.retry_count, 0);
    assert!(view.errors.is_empty());
    assert!(view.failed_kinds.is_empty());
    assert_eq!(view.partial_results.len(), 6);
    assert_eq!(view.agent_runs.len(), 6);
    assert!(view
        .agent_runs
        .iter()
        .all(|r| r.attempt_number == 1 && r.status == AgentRunStatus::Succeeded));
    assert_eq!(view.progress.completion_pct, 100.0);
}

#[tokio::test]
async fn completed_row_has_ordered_timestamps() {
    let (svc, evaluations) = service(EngineConfig::default(), registry_with(vec![])).await;
    let evaluation = svc.create_evaluation("brand-a").await.unwrap();
    svc.run_queue_once().await.unwrap();

    let row = evaluations.get_evaluation(&evaluation.id).await.unwrap();
    let started = row.started_at.unwrap();
    let completed = row.completed_at.unwrap();
    assert!(row.created_at <= started);
    assert!(started <= completed);
}

// ---------------------------------------------------------------------------
// Scenario B: timeouts then success, budgets grow
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timeouts_then_success_escalate_budgets() {
    let mut config = EngineConfig::default();
    config.agents.insert(
        AgentKind::Sentiment,
        TimeoutSchedule::new(90_000, vec![120_000, 180_000], 180_000).with_max_attempts(4),
    );
    let sentiment = ScriptedProbe::new(vec![Step::Hang, Step::Hang], Step::Succeed(50.0));
    let (svc, _) = service(
        config,
        registry_with(vec![(AgentKind::Sentiment, sentiment.clone())]),
    )
    .await;

    let evaluation = svc.create_evaluation("brand-b").await.unwrap();
    let report = svc.run_queue_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(sentiment.calls(), 3);

    let view = svc.get_status(&evaluation.id).await.unwrap();
    assert_eq!(view.status, EvaluationStatus::Completed);
    assert!(view.failed_kinds.is_empty());

    let runs: Vec<_> = view
        .agent_runs
        .iter()
        .filter(|r| r.agent_kind == AgentKind::Sentiment)
        .collect();
    assert_eq!(runs.len(), 3);
    assert_eq!(
        runs.iter().map(|r| r.attempt_number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(
        runs.iter().map(|r| r.timeout_budget_ms).collect::<Vec<_>>(),
        vec![Some(90_000), Some(120_000), Some(180_000)]
    );
    assert!(runs[0].timed_out && runs[1].timed_out);
    assert_eq!(runs[0].status, AgentRunStatus::Failed);
    assert_eq!(runs[2].status, AgentRunStatus::Succeeded);
    assert!(!runs[2].timed_out);
}

// ---------------------------------------------------------------------------
// Scenario C: failures across evaluations open the breaker
// ---------------------------------------------------------------------------

#[tokio::test]
async fn consecutive_failures_across_evaluations_open_breaker() {
    let mut config = EngineConfig::default();
    config.breaker.failure_threshold = 5;
    config.queue.batch_size = 1;
    config.agents.insert(
        AgentKind::Sentiment,
        TimeoutSchedule::new(1_000, vec![2_000, 4_000], 600_000)
            .with_max_attempts(4)
            .with_backoff(0, 0),
    );
    let sentiment = ScriptedProbe::always(Step::Fail);
    let (svc, _) = service(
        config,
        registry_with(vec![(AgentKind::Sentiment, sentiment.clone())]),
    )
    .await;

    let sentiment_runs = |runs: &[eval_state::AgentRun]| {
        runs.iter()
            .filter(|r| r.agent_kind == AgentKind::Sentiment)
            .map(|r| r.status)
            .collect::<Vec<_>>()
    };

    // First evaluation burns all four attempts; sentiment is optional.
    let first = svc.create_evaluation("brand-c1").await.unwrap();
    svc.run_queue_once().await.unwrap();
    let view = svc.get_status(&first.id).await.unwrap();
    assert_eq!(view.status, EvaluationStatus::Completed);
    assert_eq!(view.failed_kinds, vec![AgentKind::Sentiment]);
    assert_eq!(sentiment_runs(&view.agent_runs), vec![AgentRunStatus::Failed; 4]);
    assert_eq!(sentiment.calls(), 4);

    // The fifth consecutive failure trips the breaker mid-evaluation.
    let second = svc.create_evaluation("brand-c2").await.unwrap();
    svc.run_queue_once().await.unwrap();
    let view = svc.get_status(&second.id).await.unwrap();
    assert_eq!(
        sentiment_runs(&view.agent_runs),
        vec![AgentRunStatus::Failed, AgentRunStatus::CircuitOpen]
    );
    assert!(view
        .errors
        .iter()
        .any(|e| e == "sentiment_agent: circuit breaker open"));
    assert_eq!(sentiment.calls(), 5);

    // A later evaluation is rejected without touching the agent.
    let third = svc.create_evaluation("brand-c3").await.unwrap();
    svc.run_queue_once().await.unwrap();
    let view = svc.get_status(&third.id).await.unwrap();
    assert_eq!(view.status, EvaluationStatus::Completed);
    assert_eq!(
        sentiment_runs(&view.agent_runs),
        vec![AgentRunStatus::CircuitOpen]
    );
    assert_eq!(sentiment.calls(), 5);

    let breakers = svc.breaker_status().await;
    let status = breakers
        .iter()
        .find(|b| b.agent_kind == AgentKind::Sentiment)
        .unwrap();
    assert_eq!(status.phase, BreakerPhase::Open);
    assert!(status.remaining_cooldown_ms > 0);
}

// ---------------------------------------------------------------------------
// Scenario D: zombie reaping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_running_evaluation_is_reaped_once() {
    let (svc, evaluations) = service(EngineConfig::default(), registry_with(vec![])).await;
    let evaluation = svc.create_evaluation("brand-d").await.unwrap();
    evaluations
        .force_running(&evaluation.id, Utc::now() - chrono::Duration::minutes(15))
        .unwrap();

    assert_eq!(svc.count_zombies(10).await.unwrap(), 1);

    let report = svc.run_zombie_sweep(10).await.unwrap();
    assert_eq!(report.reaped_count, 1);
    assert_eq!(report.reaped[0].id, evaluation.id);
    assert_eq!(report.reaped[0].target_id, "brand-d");
    assert!(report.reaped[0].running_minutes >= 15);

    let view = svc.get_status(&evaluation.id).await.unwrap();
    assert_eq!(view.status, EvaluationStatus::Failed);
    assert!(view.errors.iter().any(|e| e == REAP_REASON));

    let row = evaluations.get_evaluation(&evaluation.id).await.unwrap();
    assert!(row.completed_at.is_some());
    assert!(!row.retryable);

    let again = svc.run_zombie_sweep(10).await.unwrap();
    assert_eq!(again.reaped_count, 0);
    assert_eq!(svc.count_zombies(10).await.unwrap(), 0);

    // reaped rows are not picked up again by the queue
    let report = svc.run_queue_once().await.unwrap();
    assert_eq!(report.claimed, 0);
}

#[tokio::test]
async fn recent_running_evaluation_is_left_alone() {
    let (svc, evaluations) = service(EngineConfig::default(), registry_with(vec![])).await;
    let evaluation = svc.create_evaluation("brand-d2").await.unwrap();
    evaluations
        .force_running(&evaluation.id, Utc::now() - chrono::Duration::minutes(3))
        .unwrap();

    let report = svc.run_zombie_sweep(10).await.unwrap();
    assert_eq!(report.reaped_count, 0);
    let view = svc.get_status(&evaluation.id).await.unwrap();
    assert_eq!(view.status, EvaluationStatus::Running);
}

// ---------------------------------------------------------------------------
// Scenario E: batch claims
// ---------------------------------------------------------------------------

#[tokio::test]
async fn batch_claims_only_what_is_pending() {
    let mut config = EngineConfig::default();
    config.queue.batch_size = 10;
    let (svc, _) = service(config, registry_with(vec![])).await;
    for i in 0..3 {
        svc.create_evaluation(&format!("brand-e{i}")).await.unwrap();
    }

    let first = svc.run_queue_once().await.unwrap();
    assert_eq!(first.claimed, 3);
    assert_eq!(first.completed, 3);
    assert_eq!(first.budget_remaining, 17);
    assert!(first.skipped_reason.is_none());

    let second = svc.run_queue_once().await.unwrap();
    assert_eq!(second.claimed, 0);
    assert!(second.skipped_reason.is_none());
}

#[tokio::test]
async fn daily_limit_caps_claims() {
    let mut config = EngineConfig::default();
    config.queue.batch_size = 10;
    config.queue.daily_limit = 2;
    let (svc, _) = service(config, registry_with(vec![])).await;
    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(svc.create_evaluation(&format!("brand-l{i}")).await.unwrap().id);
    }

    let first = svc.run_queue_once().await.unwrap();
    assert_eq!(first.claimed, 2);
    assert_eq!(first.budget_remaining, 0);

    let second = svc.run_queue_once().await.unwrap();
    assert_eq!(second.claimed, 0);
    assert_eq!(second.skipped_reason.as_deref(), Some("daily limit reached"));

    let mut pending = 0;
    for id in &ids {
        if svc.get_status(id).await.unwrap().status == EvaluationStatus::Pending {
            pending += 1;
        }
    }
    assert_eq!(pending, 1);
}
