//! Per-kind circuit breakers and progressive timeout budgets.
//!
//! A breaker opens after `failure_threshold` consecutive failed attempts of a
//! kind and rejects every attempt of that kind until its cooldown elapses.
//! Cooldown expiry and any success close it again with the failure count
//! reset. Every mutation is written through to a [`BreakerStore`] so the
//! state survives restarts; mutations of one kind are serialized by that
//! kind's async mutex.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use eval_state::{AgentKind, BreakerStore, CircuitBreakerState, StorageResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::config::TimeoutSchedule;
use crate::obs;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of wall-clock time for cooldown and budget decisions.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for tests.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Authorization / status
// ---------------------------------------------------------------------------

/// Answer to "may attempt N of this kind start now, and with what budget?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Authorization {
    pub allowed: bool,
    /// Budget for the attempt; 0 when not allowed.
    pub timeout_ms: u64,
    /// Time left in the cooldown window; 0 when allowed.
    pub retry_after_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open,
}

/// Admin view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub agent_kind: AgentKind,
    pub phase: BreakerPhase,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub remaining_cooldown_ms: u64,
}

// ---------------------------------------------------------------------------
// BreakerManager
// ---------------------------------------------------------------------------

pub struct BreakerManager {
    schedules: BTreeMap<AgentKind, TimeoutSchedule>,
    failure_threshold: u32,
    states: BTreeMap<AgentKind, AsyncMutex<CircuitBreakerState>>,
    store: Arc<dyn BreakerStore>,
    clock: Arc<dyn Clock>,
}

impl BreakerManager {
    /// Kinds missing from `schedules` use [`TimeoutSchedule::default_for`].
    pub fn new(
        schedules: BTreeMap<AgentKind, TimeoutSchedule>,
        failure_threshold: u32,
        store: Arc<dyn BreakerStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let schedules: BTreeMap<_, _> = AgentKind::ALL
            .into_iter()
            .map(|k| {
                let schedule = schedules
                    .get(&k)
                    .cloned()
                    .unwrap_or_else(|| TimeoutSchedule::default_for(k));
                (k, schedule)
            })
            .collect();
        let states = schedules
            .iter()
            .map(|(k, s)| (*k, AsyncMutex::new(CircuitBreakerState::closed(*k, s.cooldown_ms))))
            .collect();
        Self {
            schedules,
            failure_threshold,
            states,
            store,
            clock,
        }
    }

    /// Load persisted state. Cooldowns always follow the current schedule.
    pub async fn hydrate(&self) -> StorageResult<usize> {
        let persisted = self.store.load_breakers().await?;
        let count = persisted.len();
        for mut saved in persisted {
            saved.cooldown_ms = self.schedule(saved.agent_kind).cooldown_ms;
            let kind = saved.agent_kind;
            *self.state(kind).lock().await = saved;
        }
        Ok(count)
    }

    pub fn schedule(&self, kind: AgentKind) -> &TimeoutSchedule {
        &self.schedules[&kind]
    }

    fn state(&self, kind: AgentKind) -> &AsyncMutex<CircuitBreakerState> {
        &self.states[&kind]
    }

    /// Decide whether 1-based `attempt` of `kind` may be dispatched now.
    pub async fn authorize(&self, kind: AgentKind, attempt: u32) -> Authorization {
        let now = self.clock.now();
        let mut state = self.state(kind).lock().await;

        if state.opened_at.is_some() {
            let remaining = state.remaining_cooldown_ms(now);
            if remaining > 0 {
                return Authorization {
                    allowed: false,
                    timeout_ms: 0,
                    retry_after_ms: remaining,
                };
            }
            state.opened_at = None;
            state.consecutive_failures = 0;
            obs::emit_breaker_closed(kind, "cooldown_elapsed");
            self.persist(&state).await;
        }

        Authorization {
            allowed: true,
            timeout_ms: self.schedule(kind).timeout_for_attempt(attempt),
            retry_after_ms: 0,
        }
    }

    /// Record the result of a dispatched attempt.
    pub async fn record_outcome(&self, kind: AgentKind, succeeded: bool) -> CircuitBreakerState {
        let now = self.clock.now();
        let mut state = self.state(kind).lock().await;

        if succeeded {
            let was_open = state.opened_at.is_some();
            state.consecutive_failures = 0;
            state.opened_at = None;
            if was_open {
                obs::emit_breaker_closed(kind, "success");
            }
        } else {
            state.consecutive_failures += 1;
            if state.opened_at.is_none() && state.consecutive_failures >= self.failure_threshold {
                state.opened_at = Some(now);
                obs::emit_breaker_opened(kind, state.consecutive_failures, state.cooldown_ms);
            }
        }

        self.persist(&state).await;
        state.clone()
    }

    /// Status of every breaker at the current time.
    pub async fn snapshot(&self) -> Vec<BreakerStatus> {
        let now = self.clock.now();
        let mut out = Vec::with_capacity(self.states.len());
        for (kind, state) in &self.states {
            let state = state.lock().await;
            let remaining = state.remaining_cooldown_ms(now);
            out.push(BreakerStatus {
                agent_kind: *kind,
                phase: if state.is_open_at(now) {
                    BreakerPhase::Open
                } else {
                    BreakerPhase::Closed
                },
                consecutive_failures: state.consecutive_failures,
                opened_at: state.opened_at,
                remaining_cooldown_ms: remaining,
            });
        }
        out
    }

    /// Close a breaker and clear its failure count.
    pub async fn reset(&self, kind: AgentKind) -> CircuitBreakerState {
        let mut state = self.state(kind).lock().await;
        state.consecutive_failures = 0;
        state.opened_at = None;
        obs::emit_breaker_closed(kind, "manual_reset");
        self.persist(&state).await;
        state.clone()
    }

    /// Open a breaker now, starting a full cooldown window.
    pub async fn force_open(&self, kind: AgentKind) -> CircuitBreakerState {
        let now = self.clock.now();
        let mut state = self.state(kind).lock().await;
        state.opened_at = Some(now);
        state.consecutive_failures = state.consecutive_failures.max(self.failure_threshold);
        obs::emit_breaker_opened(kind, state.consecutive_failures, state.cooldown_ms);
        self.persist(&state).await;
        state.clone()
    }

    // In-memory state stays authoritative when the write-through fails.
    async fn persist(&self, state: &CircuitBreakerState) {
        if let Err(e) = self.store.save_breaker(state.clone()).await {
            warn!(agent_kind = %state.agent_kind, error = %e, "failed to persist breaker state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eval_state::fakes::MemoryBreakerStore;

    fn manager(threshold: u32) -> (BreakerManager, Arc<ManualClock>, Arc<MemoryBreakerStore>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryBreakerStore::new());
        let mut schedules = BTreeMap::new();
        schedules.insert(
            AgentKind::Crawl,
            TimeoutSchedule::new(1_000, vec![2_000, 4_000], 60_000),
        );
        let mgr = BreakerManager::new(schedules, threshold, store.clone(), clock.clone());
        (mgr, clock, store)
    }

    #[tokio::test]
    async fn budgets_follow_schedule() {
        let (mgr, _, _) = manager(3);
        assert_eq!(mgr.authorize(AgentKind::Crawl, 1).await.timeout_ms, 1_000);
        assert_eq!(mgr.authorize(AgentKind::Crawl, 2).await.timeout_ms, 2_000);
        assert_eq!(mgr.authorize(AgentKind::Crawl, 3).await.timeout_ms, 4_000);
        assert_eq!(mgr.authorize(AgentKind::Crawl, 7).await.timeout_ms, 4_000);
        // unspecified kinds use production defaults
        assert_eq!(mgr.authorize(AgentKind::Citation, 1).await.timeout_ms, 60_000);
    }

    #[tokio::test]
    async fn opens_at_threshold_and_rejects_during_cooldown() {
        let (mgr, clock, _) = manager(3);
        mgr.record_outcome(AgentKind::Crawl, false).await;
        mgr.record_outcome(AgentKind::Crawl, false).await;
        assert!(mgr.authorize(AgentKind::Crawl, 1).await.allowed);

        let state = mgr.record_outcome(AgentKind::Crawl, false).await;
        assert!(state.opened_at.is_some());

        let auth = mgr.authorize(AgentKind::Crawl, 1).await;
        assert!(!auth.allowed);
        assert_eq!(auth.retry_after_ms, 60_000);

        clock.advance(chrono::Duration::seconds(59));
        assert!(!mgr.authorize(AgentKind::Crawl, 2).await.allowed);
        // other kinds are unaffected
        assert!(mgr.authorize(AgentKind::Sentiment, 1).await.allowed);
    }

    #[tokio::test]
    async fn cooldown_expiry_closes_and_resets_failures() {
        let (mgr, clock, store) = manager(2);
        mgr.record_outcome(AgentKind::Crawl, false).await;
        mgr.record_outcome(AgentKind::Crawl, false).await;
        clock.advance(chrono::Duration::seconds(60));

        let auth = mgr.authorize(AgentKind::Crawl, 1).await;
        assert!(auth.allowed);
        assert_eq!(auth.timeout_ms, 1_000);

        let saved = store.load_breakers().await.unwrap();
        let crawl = saved.iter().find(|s| s.agent_kind == AgentKind::Crawl).unwrap();
        assert_eq!(crawl.consecutive_failures, 0);
        assert!(crawl.opened_at.is_none());

        // a single new failure does not reopen it
        mgr.record_outcome(AgentKind::Crawl, false).await;
        assert!(mgr.authorize(AgentKind::Crawl, 1).await.allowed);
    }

    #[tokio::test]
    async fn success_resets_consecutive_failures() {
        let (mgr, _, _) = manager(3);
        mgr.record_outcome(AgentKind::Crawl, false).await;
        mgr.record_outcome(AgentKind::Crawl, false).await;
        let state = mgr.record_outcome(AgentKind::Crawl, true).await;
        assert_eq!(state.consecutive_failures, 0);
        mgr.record_outcome(AgentKind::Crawl, false).await;
        mgr.record_outcome(AgentKind::Crawl, false).await;
        assert!(mgr.authorize(AgentKind::Crawl, 1).await.allowed);
    }

    #[tokio::test]
    async fn failures_while_open_keep_original_window() {
        let (mgr, clock, _) = manager(1);
        let opened = mgr.record_outcome(AgentKind::Crawl, false).await.opened_at;
        clock.advance(chrono::Duration::seconds(30));
        let again = mgr.record_outcome(AgentKind::Crawl, false).await;
        assert_eq!(again.opened_at, opened);
        assert_eq!(again.consecutive_failures, 2);
    }

    #[tokio::test]
    async fn hydrate_restores_open_breaker() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryBreakerStore::new());
        let mut persisted = CircuitBreakerState::closed(AgentKind::Commerce, 1);
        persisted.consecutive_failures = 5;
        persisted.opened_at = Some(clock.now());
        store.save_breaker(persisted).await.unwrap();

        let mgr = BreakerManager::new(BTreeMap::new(), 5, store, clock.clone());
        assert_eq!(mgr.hydrate().await.unwrap(), 1);

        let auth = mgr.authorize(AgentKind::Commerce, 1).await;
        assert!(!auth.allowed);
        // cooldown comes from the schedule, not the persisted row
        assert_eq!(auth.retry_after_ms, 180_000);
    }

    #[tokio::test]
    async fn admin_operations() {
        let (mgr, _, _) = manager(3);
        mgr.force_open(AgentKind::Crawl).await;

        let snapshot = mgr.snapshot().await;
        assert_eq!(snapshot.len(), AgentKind::ALL.len());
        let crawl = snapshot.iter().find(|s| s.agent_kind == AgentKind::Crawl).unwrap();
        assert_eq!(crawl.phase, BreakerPhase::Open);
        assert_eq!(crawl.consecutive_failures, 3);
        assert_eq!(crawl.remaining_cooldown_ms, 60_000);

        mgr.reset(AgentKind::Crawl).await;
        let auth = mgr.authorize(AgentKind::Crawl, 1).await;
        assert!(auth.allowed);
        let crawl = mgr
            .snapshot()
            .await
            .into_iter()
            .find(|s| s.agent_kind == AgentKind::Crawl)
            .unwrap();
        assert_eq!(crawl.phase, BreakerPhase::Closed);
        assert_eq!(crawl.consecutive_failures, 0);
    }
}
