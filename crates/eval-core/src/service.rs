//! Facade over the orchestration core.
//!
//! [`EvaluationService`] wires the breaker manager, orchestrator, queue
//! processor and reaper to one set of stores and exposes the operations the
//! daemon and its callers need.

use std::sync::Arc;

use eval_state::{AgentKind, CircuitBreakerState, Evaluation, EvaluationId, Stores};
use tracing::{info, instrument};

use crate::breaker::{BreakerManager, BreakerStatus, Clock};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::executor::ProbeRegistry;
use crate::obs;
use crate::orchestrator::{EvaluationOutcome, Orchestrator};
use crate::queue::{QueueProcessor, QueueRunReport};
use crate::reaper::{ReapReport, ZombieReaper};
use crate::status::EvaluationStatusView;

pub struct EvaluationService {
    config: EngineConfig,
    stores: Stores,
    breakers: Arc<BreakerManager>,
    orchestrator: Arc<Orchestrator>,
    queue: QueueProcessor,
    reaper: ZombieReaper,
}

impl EvaluationService {
    /// Validate `config`, restore persisted breaker state and wire components.
    pub async fn build(
        config: EngineConfig,
        stores: Stores,
        registry: ProbeRegistry,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let breakers = Arc::new(BreakerManager::new(
            config.schedules(),
            config.breaker.failure_threshold,
            Arc::clone(&stores.breakers),
            Arc::clone(&clock),
        ));
        let restored = breakers.hydrate().await?;
        info!(restored, "breaker state hydrated");

        let orchestrator = Arc::new(Orchestrator::new(
            stores.clone(),
            Arc::clone(&breakers),
            registry,
            config.pipeline.clone(),
            config.queue.max_retries,
        )?);
        let queue = QueueProcessor::new(
            Arc::clone(&orchestrator),
            Arc::clone(&stores.evaluations),
            config.queue.clone(),
            Arc::clone(&clock),
        );
        let reaper = ZombieReaper::new(Arc::clone(&stores.evaluations), clock);

        Ok(Self {
            config,
            stores,
            breakers,
            orchestrator,
            queue,
            reaper,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Enqueue a new evaluation for `target_id`.
    #[instrument(skip(self))]
    pub async fn create_evaluation(&self, target_id: &str) -> Result<Evaluation> {
        let evaluation = self.stores.evaluations.create_evaluation(target_id).await?;
        obs::emit_evaluation_enqueued(&evaluation.id, &evaluation.target_id);
        Ok(evaluation)
    }

    pub async fn get_status(&self, evaluation_id: &EvaluationId) -> Result<EvaluationStatusView> {
        let evaluation = self.stores.evaluations.get_evaluation(evaluation_id).await?;
        let partials = self.stores.evaluations.list_partials(evaluation_id).await?;
        let runs = self.stores.agent_runs.list_agent_runs(evaluation_id).await?;
        Ok(EvaluationStatusView::assemble(
            evaluation,
            partials,
            runs,
            self.orchestrator.pipeline(),
        ))
    }

    /// Drive an already claimed evaluation directly, bypassing the queue.
    pub async fn run_claimed(&self, evaluation: Evaluation) -> EvaluationOutcome {
        self.orchestrator.run(evaluation).await
    }

    /// Cancel in-flight attempts and stop claiming new work. Evaluations
    /// already claimed still finalize.
    pub fn shutdown(&self) {
        self.orchestrator.shutdown();
    }

    pub async fn run_queue_once(&self) -> Result<QueueRunReport> {
        self.queue.run_once().await
    }

    pub async fn run_zombie_sweep(&self, max_running_minutes: u32) -> Result<ReapReport> {
        self.reaper
            .sweep(chrono::Duration::minutes(i64::from(max_running_minutes)))
            .await
    }

    pub async fn count_zombies(&self, max_running_minutes: u32) -> Result<u64> {
        self.reaper
            .count_zombies(chrono::Duration::minutes(i64::from(max_running_minutes)))
            .await
    }

    pub async fn breaker_status(&self) -> Vec<BreakerStatus> {
        self.breakers.snapshot().await
    }

    pub async fn reset_breaker(&self, kind: AgentKind) -> CircuitBreakerState {
        self.breakers.reset(kind).await
    }

    pub async fn force_open_breaker(&self, kind: AgentKind) -> CircuitBreakerState {
        self.breakers.force_open(kind).await
    }
}
