//! Record types shared by every store implementation.
//!
//! - `Evaluation`: one scoring run for one target
//! - `AgentRun`: one attempt of one agent kind within an evaluation
//! - `PartialResult`: the persisted output of a succeeded agent kind
//! - `CircuitBreakerState`: per-kind breaker bookkeeping

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

// ---------------------------------------------------------------------------
// AgentKind
// ---------------------------------------------------------------------------

/// The closed set of probe categories a pipeline can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AgentKind {
    #[serde(rename = "crawl_agent")]
    Crawl,
    #[serde(rename = "llm_test_agent")]
    LlmTest,
    #[serde(rename = "sentiment_agent")]
    Sentiment,
    #[serde(rename = "citation_agent")]
    Citation,
    #[serde(rename = "geo_visibility_agent")]
    GeoVisibility,
    #[serde(rename = "commerce_agent")]
    Commerce,
}

impl AgentKind {
    /// Every kind, in canonical order.
    pub const ALL: [AgentKind; 6] = [
        AgentKind::Crawl,
        AgentKind::LlmTest,
        AgentKind::Sentiment,
        AgentKind::Citation,
        AgentKind::GeoVisibility,
        AgentKind::Commerce,
    ];

    /// Stable wire/storage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Crawl => "crawl_agent",
            AgentKind::LlmTest => "llm_test_agent",
            AgentKind::Sentiment => "sentiment_agent",
            AgentKind::Citation => "citation_agent",
            AgentKind::GeoVisibility => "geo_visibility_agent",
            AgentKind::Commerce => "commerce_agent",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| StorageError::UnknownAgentKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Unique identifier for an evaluation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EvaluationId(pub String);

impl EvaluationId {
    /// Generate a new random EvaluationId
    pub fn new() -> Self {
        EvaluationId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EvaluationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EvaluationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an evaluation.
///
/// `Pending -> Running -> {Completed, Failed}`; a retryable `Failed` row may
/// be claimed back into `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl EvaluationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvaluationStatus::Pending => "pending",
            EvaluationStatus::Running => "running",
            EvaluationStatus::Completed => "completed",
            EvaluationStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EvaluationStatus::Completed | EvaluationStatus::Failed)
    }
}

impl fmt::Display for EvaluationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvaluationStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EvaluationStatus::Pending),
            "running" => Ok(EvaluationStatus::Running),
            "completed" => Ok(EvaluationStatus::Completed),
            "failed" => Ok(EvaluationStatus::Failed),
            other => Err(StorageError::UnknownStatus(other.to_string())),
        }
    }
}

/// One scoring run for one target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: EvaluationId,
    /// Brand/site reference owned by the triggering collaborator.
    pub target_id: String,
    pub status: EvaluationStatus,
    pub created_at: DateTime<Utc>,
    /// Stamped on every transition into `Running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Stamped on the transition into a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    pub overall_score: Option<f64>,
    /// Failure summaries in the order they were recorded.
    pub errors: Vec<String>,
    /// Kinds that did not succeed in the last run cycle.
    pub failed_kinds: Vec<AgentKind>,
    /// Number of times the row was claimed back out of `Failed`.
    pub retry_count: u32,
    /// Whether a `Failed` row may be claimed again.
    pub retryable: bool,
}

impl Evaluation {
    /// A fresh `Pending` evaluation.
    pub fn new(target_id: impl Into<String>) -> Self {
        Self {
            id: EvaluationId::new(),
            target_id: target_id.into(),
            status: EvaluationStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            overall_score: None,
            errors: Vec::new(),
            failed_kinds: Vec::new(),
            retry_count: 0,
            retryable: false,
        }
    }

    /// Whether the row matches the claim predicate of `request` at `now`.
    pub fn is_claimable(&self, request: &ClaimRequest, now: DateTime<Utc>) -> bool {
        match self.status {
            EvaluationStatus::Pending => true,
            EvaluationStatus::Failed => {
                self.retryable
                    && self.retry_count < request.retry_limit
                    && self.created_at >= now - request.max_age
            }
            _ => false,
        }
    }

    /// Apply the claim transition in place.
    pub fn mark_claimed(&mut self, now: DateTime<Utc>) {
        if self.status == EvaluationStatus::Failed {
            self.retry_count += 1;
        }
        self.status = EvaluationStatus::Running;
        self.started_at = Some(now);
        self.completed_at = None;
        self.overall_score = None;
        self.failed_kinds.clear();
    }
}

/// Parameters for an atomic batch claim.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRequest {
    /// Maximum number of rows to claim.
    pub limit: usize,
    /// Failed rows created longer ago than this are no longer retried.
    pub max_age: chrono::Duration,
    /// Failed rows already retried this many times are no longer retried.
    pub retry_limit: u32,
}

impl ClaimRequest {
    pub fn new(limit: usize, max_age: chrono::Duration, retry_limit: u32) -> Self {
        Self {
            limit,
            max_age,
            retry_limit,
        }
    }
}

/// Terminal write for an evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalization {
    pub status: EvaluationStatus,
    pub overall_score: Option<f64>,
    /// Appended to the evaluation's error list.
    pub errors: Vec<String>,
    pub failed_kinds: Vec<AgentKind>,
    pub retryable: bool,
}

impl Finalization {
    pub fn completed(overall_score: f64, failed_kinds: Vec<AgentKind>, errors: Vec<String>) -> Self {
        Self {
            status: EvaluationStatus::Completed,
            overall_score: Some(overall_score),
            errors,
            failed_kinds,
            retryable: false,
        }
    }

    pub fn failed(errors: Vec<String>, failed_kinds: Vec<AgentKind>, retryable: bool) -> Self {
        Self {
            status: EvaluationStatus::Failed,
            overall_score: None,
            errors,
            failed_kinds,
            retryable,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentRun
// ---------------------------------------------------------------------------

/// Status of a single agent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Queued,
    InProgress,
    Succeeded,
    Failed,
    CircuitOpen,
}

impl AgentRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRunStatus::Queued => "queued",
            AgentRunStatus::InProgress => "in_progress",
            AgentRunStatus::Succeeded => "succeeded",
            AgentRunStatus::Failed => "failed",
            AgentRunStatus::CircuitOpen => "circuit_open",
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            AgentRunStatus::Succeeded | AgentRunStatus::Failed | AgentRunStatus::CircuitOpen
        )
    }
}

impl fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentRunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(AgentRunStatus::Queued),
            "in_progress" => Ok(AgentRunStatus::InProgress),
            "succeeded" => Ok(AgentRunStatus::Succeeded),
            "failed" => Ok(AgentRunStatus::Failed),
            "circuit_open" => Ok(AgentRunStatus::CircuitOpen),
            other => Err(StorageError::UnknownStatus(other.to_string())),
        }
    }
}

/// One attempt of one agent kind within one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRun {
    pub evaluation_id: EvaluationId,
    pub agent_kind: AgentKind,
    /// 1-based, strictly increasing per (evaluation, kind).
    pub attempt_number: u32,
    pub status: AgentRunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Deadline granted to this attempt; `None` until authorized.
    pub timeout_budget_ms: Option<u64>,
    pub result: Option<serde_json::Value>,
    pub failure_reason: Option<String>,
    /// The attempt failed by running out of budget rather than erroring.
    pub timed_out: bool,
}

impl AgentRun {
    /// A freshly scheduled attempt.
    pub fn queued(evaluation_id: EvaluationId, agent_kind: AgentKind, attempt_number: u32) -> Self {
        Self {
            evaluation_id,
            agent_kind,
            attempt_number,
            status: AgentRunStatus::Queued,
            started_at: None,
            finished_at: None,
            timeout_budget_ms: None,
            result: None,
            failure_reason: None,
            timed_out: false,
        }
    }

    pub fn start(&mut self, timeout_budget_ms: u64) {
        self.status = AgentRunStatus::InProgress;
        self.started_at = Some(Utc::now());
        self.timeout_budget_ms = Some(timeout_budget_ms);
    }

    pub fn succeed(&mut self, result: serde_json::Value) {
        self.status = AgentRunStatus::Succeeded;
        self.finished_at = Some(Utc::now());
        self.result = Some(result);
    }

    pub fn fail(&mut self, reason: impl Into<String>, timed_out: bool) {
        self.status = AgentRunStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.failure_reason = Some(reason.into());
        self.timed_out = timed_out;
    }

    pub fn reject_circuit_open(&mut self) {
        self.status = AgentRunStatus::CircuitOpen;
        self.finished_at = Some(Utc::now());
        self.failure_reason = Some("circuit breaker open".to_string());
    }
}

// ---------------------------------------------------------------------------
// PartialResult
// ---------------------------------------------------------------------------

/// Output of one succeeded agent kind, persisted as soon as it is known.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialResult {
    pub evaluation_id: EvaluationId,
    pub agent_kind: AgentKind,
    /// Normalised 0..=100 score reported by the probe.
    pub score: f64,
    pub data: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl PartialResult {
    pub fn new(
        evaluation_id: EvaluationId,
        agent_kind: AgentKind,
        score: f64,
        data: serde_json::Value,
    ) -> Self {
        Self {
            evaluation_id,
            agent_kind,
            score,
            data,
            recorded_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// CircuitBreakerState
// ---------------------------------------------------------------------------

/// Persisted breaker bookkeeping for one agent kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    pub agent_kind: AgentKind,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
}

impl CircuitBreakerState {
    pub fn closed(agent_kind: AgentKind, cooldown_ms: u64) -> Self {
        Self {
            agent_kind,
            consecutive_failures: 0,
            opened_at: None,
            cooldown_ms,
        }
    }

    /// Whether the cooldown window is still running at `now`.
    pub fn is_open_at(&self, now: DateTime<Utc>) -> bool {
        self.remaining_cooldown_ms(now) > 0
    }

    /// Milliseconds left in the cooldown window (0 when closed or expired).
    pub fn remaining_cooldown_ms(&self, now: DateTime<Utc>) -> u64 {
        match self.opened_at {
            Some(opened_at) => {
                let elapsed = (now - opened_at).num_milliseconds().max(0) as u64;
                self.cooldown_ms.saturating_sub(elapsed)
            }
            None => 0,
        }
    }
}
