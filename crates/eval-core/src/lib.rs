//! Eval-Core: evaluation orchestration
//!
//! Drives a target through a staged pipeline of independent agent probes,
//! guarding each agent kind with a progressive timeout schedule and a
//! circuit breaker, and recording every attempt through the `eval-state`
//! seams.
//!
//! ## Key Components
//!
//! - `BreakerManager`: per-kind breakers and attempt budgets
//! - `AgentExecutor`: one deadline-bound probe attempt
//! - `Orchestrator`: stage scheduling, retries and finalization
//! - `QueueProcessor`: bounded claim-and-run ticks
//! - `ZombieReaper`: recovery of abandoned `running` rows
//! - `EvaluationService`: the facade the daemon uses

pub mod breaker;
pub mod config;
pub mod error;
pub mod executor;
pub mod http_probe;
pub mod metrics;
pub mod obs;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod reaper;
pub mod scoring;
pub mod service;
pub mod status;
pub mod telemetry;

pub use breaker::{
    Authorization, BreakerManager, BreakerPhase, BreakerStatus, Clock, ManualClock, SystemClock,
};
pub use config::{
    BreakerConfig, EngineConfig, ProbeConfig, QueueConfig, TimeoutSchedule, ZombieConfig,
};
pub use error::{ConfigError, OrchestratorError, ProbeError, Result};
pub use executor::{
    AgentExecutor, AgentOutput, AgentProbe, AttemptOutcome, ProbeContext, ProbeRegistry,
};
pub use http_probe::{HttpProbe, ProbeRequest};
pub use orchestrator::{EvaluationOutcome, Orchestrator, SHUTDOWN_REASON};
pub use pipeline::{Pipeline, Stage, StageAgent};
pub use queue::{QueueProcessor, QueueRunReport};
pub use reaper::{ReapReport, ReapedEvaluation, ZombieReaper, REAP_REASON};
pub use service::EvaluationService;
pub use status::{EvaluationStatusView, Progress};
