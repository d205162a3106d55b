//! Global atomic counters for orchestration observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the queue processor does so once per run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters without locking.
pub struct Metrics {
    evaluations_claimed: AtomicU64,
    evaluations_completed: AtomicU64,
    evaluations_failed: AtomicU64,
    agent_attempts: AtomicU64,
    agent_timeouts: AtomicU64,
    circuit_rejections: AtomicU64,
    zombies_reaped: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            evaluations_claimed: AtomicU64::new(0),
            evaluations_completed: AtomicU64::new(0),
            evaluations_failed: AtomicU64::new(0),
            agent_attempts: AtomicU64::new(0),
            agent_timeouts: AtomicU64::new(0),
            circuit_rejections: AtomicU64::new(0),
            zombies_reaped: AtomicU64::new(0),
        }
    }

    pub fn add_claimed(&self, n: u64) {
        self.evaluations_claimed.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "evaluations_claimed", "counter incremented");
    }

    pub fn inc_completed(&self) {
        self.evaluations_completed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "evaluations_completed", "counter incremented");
    }

    pub fn inc_failed(&self) {
        self.evaluations_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "evaluations_failed", "counter incremented");
    }

    pub fn inc_agent_attempts(&self) {
        self.agent_attempts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agent_attempts", "counter incremented");
    }

    pub fn inc_agent_timeouts(&self) {
        self.agent_timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "agent_timeouts", "counter incremented");
    }

    pub fn inc_circuit_rejections(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "circuit_rejections", "counter incremented");
    }

    pub fn add_zombies_reaped(&self, n: u64) {
        self.zombies_reaped.fetch_add(n, Ordering::Relaxed);
        tracing::trace!(metric = "zombies_reaped", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            evaluations_claimed = self.evaluations_claimed(),
            evaluations_completed = self.evaluations_completed(),
            evaluations_failed = self.evaluations_failed(),
            agent_attempts = self.agent_attempts(),
            agent_timeouts = self.agent_timeouts(),
            circuit_rejections = self.circuit_rejections(),
            zombies_reaped = self.zombies_reaped(),
        );
    }

    pub fn evaluations_claimed(&self) -> u64 {
        self.evaluations_claimed.load(Ordering::Relaxed)
    }

    pub fn evaluations_completed(&self) -> u64 {
        self.evaluations_completed.load(Ordering::Relaxed)
    }

    pub fn evaluations_failed(&self) -> u64 {
        self.evaluations_failed.load(Ordering::Relaxed)
    }

    pub fn agent_attempts(&self) -> u64 {
        self.agent_attempts.load(Ordering::Relaxed)
    }

    pub fn agent_timeouts(&self) -> u64 {
        self.agent_timeouts.load(Ordering::Relaxed)
    }

    pub fn circuit_rejections(&self) -> u64 {
        self.circuit_rejections.load(Ordering::Relaxed)
    }

    pub fn zombies_reaped(&self) -> u64 {
        self.zombies_reaped.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.evaluations_claimed,
            &self.evaluations_completed,
            &self.evaluations_failed,
            &self.agent_attempts,
            &self.agent_timeouts,
            &self.circuit_rejections,
            &self.zombies_reaped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
