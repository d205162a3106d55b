//! Engine configuration.
//!
//! Defaults reproduce the production constants. A TOML file may override any
//! section, and a handful of `EVAL_*` environment variables override the
//! operational limits on top of that:
//!
//! | variable                          | field                          |
//! |-----------------------------------|--------------------------------|
//! | `EVAL_QUEUE_BATCH_SIZE`           | `queue.batch_size`             |
//! | `EVAL_QUEUE_DAILY_LIMIT`          | `queue.daily_limit`            |
//! | `EVAL_QUEUE_MAX_CONCURRENT`       | `queue.max_concurrent`         |
//! | `EVAL_QUEUE_MAX_RETRIES`          | `queue.max_retries`            |
//! | `EVAL_BREAKER_THRESHOLD`          | `breaker.failure_threshold`    |
//! | `EVAL_ZOMBIE_MAX_RUNNING_MINUTES` | `zombie.max_running_minutes`   |
//! | `EVAL_PROBE_BASE_URL`             | `probes.base_url`              |

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use eval_state::AgentKind;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::pipeline::Pipeline;

// ---------------------------------------------------------------------------
// TimeoutSchedule
// ---------------------------------------------------------------------------

/// Per-kind attempt budgets and breaker cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSchedule {
    /// Budget for the first attempt.
    pub initial_ms: u64,
    /// Budgets for attempts 2.., the last entry repeats.
    #[serde(default)]
    pub progressive_ms: Vec<u64>,
    /// How long the breaker stays open once tripped.
    pub cooldown_ms: u64,
    /// Defaults to `progressive_ms.len() + 1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Delay before the first retry; doubles per retry. 0 retries at once.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on a single retry delay.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// No retry is started once this long has passed since the kind's first
    /// attempt in a cycle. Unset means attempts are bounded by count only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_total_ms: Option<u64>,
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

impl TimeoutSchedule {
    pub fn new(initial_ms: u64, progressive_ms: Vec<u64>, cooldown_ms: u64) -> Self {
        Self {
            initial_ms,
            progressive_ms,
            cooldown_ms,
            max_attempts: None,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            max_total_ms: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.backoff_base_ms = base_ms;
        self.backoff_max_ms = max_ms;
        self
    }

    pub fn with_max_total(mut self, max_total_ms: u64) -> Self {
        self.max_total_ms = Some(max_total_ms);
        self
    }

    /// Delay after the `failed_attempts`-th failure of a cycle:
    /// `base * 2^(n-1)`, capped at `backoff_max_ms`.
    pub fn backoff_after(&self, failed_attempts: u32) -> u64 {
        if failed_attempts == 0 {
            return 0;
        }
        let factor = 1u64
            .checked_shl(failed_attempts - 1)
            .unwrap_or(u64::MAX);
        self.backoff_base_ms
            .saturating_mul(factor)
            .min(self.backoff_max_ms)
    }

    /// Production defaults per kind.
    pub fn default_for(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Crawl => Self::new(180_000, vec![300_000, 600_000, 900_000], 900_000),
            AgentKind::LlmTest => Self::new(120_000, vec![180_000, 300_000], 300_000),
            AgentKind::Sentiment => Self::new(90_000, vec![120_000, 180_000], 180_000),
            AgentKind::Citation => Self::new(60_000, vec![90_000, 120_000], 120_000),
            AgentKind::GeoVisibility => Self::new(120_000, vec![180_000, 240_000], 240_000),
            AgentKind::Commerce => Self::new(90_000, vec![120_000, 180_000], 180_000),
        }
    }

    /// Budget for a 1-based attempt number.
    pub fn timeout_for_attempt(&self, attempt: u32) -> u64 {
        if attempt <= 1 || self.progressive_ms.is_empty() {
            return self.initial_ms;
        }
        let idx = (attempt as usize - 2).min(self.progressive_ms.len() - 1);
        self.progressive_ms[idx]
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
            .unwrap_or(self.progressive_ms.len() as u32 + 1)
    }

    fn validate(&self, kind: AgentKind) -> Result<(), ConfigError> {
        if self.initial_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{kind}: initial timeout must be positive"
            )));
        }
        let mut previous = self.initial_ms;
        for &budget in &self.progressive_ms {
            if budget < previous {
                return Err(ConfigError::Invalid(format!(
                    "{kind}: progressive timeouts must be non-decreasing"
                )));
            }
            previous = budget;
        }
        if self.cooldown_ms == 0 {
            return Err(ConfigError::Invalid(format!(
                "{kind}: breaker cooldown must be positive"
            )));
        }
        if self.max_attempts == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{kind}: max_attempts must be at least 1"
            )));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::Invalid(format!(
                "{kind}: backoff_max_ms must not be below backoff_base_ms"
            )));
        }
        if self.max_total_ms == Some(0) {
            return Err(ConfigError::Invalid(format!(
                "{kind}: max_total_ms must be positive"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on evaluations claimed per run.
    pub batch_size: usize,
    /// Upper bound on claims per UTC day.
    pub daily_limit: u64,
    /// Evaluations orchestrated concurrently within one run.
    pub max_concurrent: usize,
    /// Times a failed evaluation may be re-claimed.
    pub max_retries: u32,
    /// Failed evaluations older than this are no longer re-claimed.
    pub retry_max_age_hours: i64,
    /// Period of the queue tick in `serve` mode.
    pub interval_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            daily_limit: 20,
            max_concurrent: 3,
            max_retries: 3,
            retry_max_age_hours: 24,
            interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a kind's breaker.
    pub failure_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ZombieConfig {
    pub max_running_minutes: u32,
    /// Period of the reaper sweep in `serve` mode.
    pub interval_secs: u64,
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            max_running_minutes: 10,
            interval_secs: 300,
        }
    }
}

/// Where remote probes live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// `{base_url}/{agent_kind}` is used for kinds without an explicit endpoint.
    pub base_url: Option<String>,
    pub endpoints: BTreeMap<AgentKind, String>,
}

impl ProbeConfig {
    pub fn endpoint_for(&self, kind: AgentKind) -> Option<String> {
        self.endpoints.get(&kind).cloned().or_else(|| {
            self.base_url
                .as_ref()
                .map(|base| format!("{}/{}", base.trim_end_matches('/'), kind))
        })
    }
}

// ---------------------------------------------------------------------------
// EngineConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub breaker: BreakerConfig,
    pub zombie: ZombieConfig,
    pub probes: ProbeConfig,
    /// Kinds missing here fall back to [`TimeoutSchedule::default_for`].
    pub agents: BTreeMap<AgentKind, TimeoutSchedule>,
    pub pipeline: Pipeline,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            breaker: BreakerConfig::default(),
            zombie: ZombieConfig::default(),
            probes: ProbeConfig::default(),
            agents: AgentKind::ALL
                .into_iter()
                .map(|k| (k, TimeoutSchedule::default_for(k)))
                .collect(),
            pipeline: Pipeline::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Defaults, then `path` if given, then `EVAL_*` overrides; validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides_from(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_parsed(&lookup, "EVAL_QUEUE_BATCH_SIZE", &mut self.queue.batch_size)?;
        override_parsed(&lookup, "EVAL_QUEUE_DAILY_LIMIT", &mut self.queue.daily_limit)?;
        override_parsed(
            &lookup,
            "EVAL_QUEUE_MAX_CONCURRENT",
            &mut self.queue.max_concurrent,
        )?;
        override_parsed(&lookup, "EVAL_QUEUE_MAX_RETRIES", &mut self.queue.max_retries)?;
        override_parsed(
            &lookup,
            "EVAL_BREAKER_THRESHOLD",
            &mut self.breaker.failure_threshold,
        )?;
        override_parsed(
            &lookup,
            "EVAL_ZOMBIE_MAX_RUNNING_MINUTES",
            &mut self.zombie.max_running_minutes,
        )?;
        if let Some(url) = lookup("EVAL_PROBE_BASE_URL") {
            self.probes.base_url = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.batch_size == 0 {
            return Err(ConfigError::Invalid("queue.batch_size must be positive".into()));
        }
        if self.queue.daily_limit == 0 {
            return Err(ConfigError::Invalid("queue.daily_limit must be positive".into()));
        }
        if self.queue.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_concurrent must be positive".into(),
            ));
        }
        if self.queue.retry_max_age_hours <= 0 {
            return Err(ConfigError::Invalid(
                "queue.retry_max_age_hours must be positive".into(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be positive".into(),
            ));
        }
        if self.zombie.max_running_minutes == 0 {
            return Err(ConfigError::Invalid(
                "zombie.max_running_minutes must be positive".into(),
            ));
        }
        for (kind, schedule) in &self.agents {
            schedule.validate(*kind)?;
        }
        self.pipeline.validate()
    }

    /// Configured schedule for `kind`, or its default.
    pub fn schedule_for(&self, kind: AgentKind) -> TimeoutSchedule {
        self.agents
            .get(&kind)
            .cloned()
            .unwrap_or_else(|| TimeoutSchedule::default_for(kind))
    }

    /// Schedules for every kind.
    pub fn schedules(&self) -> BTreeMap<AgentKind, TimeoutSchedule> {
        AgentKind::ALL
            .into_iter()
            .map(|k| (k, self.schedule_for(k)))
            .collect()
    }
}

fn override_parsed<F, T>(lookup: &F, var: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(value) = lookup(var) {
        *slot = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            var: var.to_string(),
            value,
        })?;
    }
    Ok(())
}
