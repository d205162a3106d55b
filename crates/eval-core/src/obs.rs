//! Structured observability hooks for the evaluation lifecycle.
//!
//! This module provides:
//! - Evaluation-scoped tracing spans via [`evaluation_span`]
//! - Emission functions for key lifecycle events: claim, agent attempts,
//!   breaker transitions, finalization, reaping, queue runs
//!
//! Events are emitted at `info!` level unless they signal trouble.

use eval_state::{AgentKind, EvaluationId, EvaluationStatus};
use tracing::{info, warn};

/// Span tagged with the evaluation id; attach with `tracing::Instrument`.
pub fn evaluation_span(evaluation_id: &EvaluationId, target_id: &str) -> tracing::Span {
    tracing::info_span!("evaluation", evaluation_id = %evaluation_id, target_id = %target_id)
}

pub fn emit_evaluation_enqueued(evaluation_id: &EvaluationId, target_id: &str) {
    info!(event = "evaluation.enqueued", evaluation_id = %evaluation_id, target_id = %target_id);
}

pub fn emit_evaluation_claimed(evaluation_id: &EvaluationId, retry_count: u32) {
    info!(
        event = "evaluation.claimed",
        evaluation_id = %evaluation_id,
        retry_count = retry_count,
    );
}

/// Emit event: an agent attempt was dispatched with its budget.
pub fn emit_attempt_started(
    evaluation_id: &EvaluationId,
    kind: AgentKind,
    attempt: u32,
    timeout_ms: u64,
) {
    info!(
        event = "agent.attempt_started",
        evaluation_id = %evaluation_id,
        agent_kind = %kind,
        attempt = attempt,
        timeout_ms = timeout_ms,
    );
}

pub fn emit_attempt_finished(
    evaluation_id: &EvaluationId,
    kind: AgentKind,
    attempt: u32,
    outcome: &str,
    duration_ms: u64,
) {
    info!(
        event = "agent.attempt_finished",
        evaluation_id = %evaluation_id,
        agent_kind = %kind,
        attempt = attempt,
        outcome = outcome,
        duration_ms = duration_ms,
    );
}

/// Emit event: a failed attempt will be retried after `delay_ms`.
pub fn emit_retry_scheduled(
    evaluation_id: &EvaluationId,
    kind: AgentKind,
    next_attempt: u32,
    delay_ms: u64,
) {
    info!(
        event = "agent.retry_scheduled",
        evaluation_id = %evaluation_id,
        agent_kind = %kind,
        next_attempt = next_attempt,
        delay_ms = delay_ms,
    );
}

pub fn emit_retry_window_exhausted(
    evaluation_id: &EvaluationId,
    kind: AgentKind,
    elapsed_ms: u64,
    max_total_ms: u64,
) {
    warn!(
        event = "agent.retry_window_exhausted",
        evaluation_id = %evaluation_id,
        agent_kind = %kind,
        elapsed_ms = elapsed_ms,
        max_total_ms = max_total_ms,
    );
}

/// Emit event: attempts left `in_progress` by a fault were closed.
pub fn emit_attempts_abandoned(evaluation_id: &EvaluationId, count: usize) {
    warn!(event = "agent.attempts_abandoned", evaluation_id = %evaluation_id, count = count);
}

pub fn emit_circuit_rejected(evaluation_id: &EvaluationId, kind: AgentKind, retry_after_ms: u64) {
    warn!(
        event = "agent.circuit_rejected",
        evaluation_id = %evaluation_id,
        agent_kind = %kind,
        retry_after_ms = retry_after_ms,
    );
}

pub fn emit_breaker_opened(kind: AgentKind, consecutive_failures: u32, cooldown_ms: u64) {
    warn!(
        event = "breaker.opened",
        agent_kind = %kind,
        consecutive_failures = consecutive_failures,
        cooldown_ms = cooldown_ms,
    );
}

pub fn emit_breaker_closed(kind: AgentKind, reason: &str) {
    info!(event = "breaker.closed", agent_kind = %kind, reason = reason);
}

/// Emit event: evaluation reached a terminal status.
pub fn emit_evaluation_finalized(
    evaluation_id: &EvaluationId,
    status: EvaluationStatus,
    overall_score: Option<f64>,
    failed_kinds: usize,
) {
    info!(
        event = "evaluation.finalized",
        evaluation_id = %evaluation_id,
        status = %status,
        overall_score = overall_score,
        failed_kinds = failed_kinds,
    );
}

/// Emit event: the terminal write itself failed (warning level).
pub fn emit_finalize_error(evaluation_id: &EvaluationId, error: &dyn std::fmt::Display) {
    warn!(event = "evaluation.finalize_error", evaluation_id = %evaluation_id, error = %error);
}

pub fn emit_orchestration_fault(evaluation_id: &EvaluationId, error: &dyn std::fmt::Display) {
    warn!(event = "evaluation.orchestration_fault", evaluation_id = %evaluation_id, error = %error);
}

pub fn emit_zombie_reaped(evaluation_id: &EvaluationId, target_id: &str, running_minutes: i64) {
    warn!(
        event = "evaluation.reaped",
        evaluation_id = %evaluation_id,
        target_id = %target_id,
        running_minutes = running_minutes,
    );
}

pub fn emit_queue_run(claimed: usize, completed: usize, failed: usize, budget_remaining: u64) {
    info!(
        event = "queue.run",
        claimed = claimed,
        completed = completed,
        failed = failed,
        budget_remaining = budget_remaining,
    );
}

pub fn emit_queue_skipped(reason: &str) {
    info!(event = "queue.skipped", reason = reason);
}
