//! SurrealDB row types
//!
//! Rows keep statuses and agent kinds as plain strings; conversion to the
//! typed records in `model` happens at the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;
use crate::model::{
    AgentKind, AgentRun, CircuitBreakerState, Evaluation, EvaluationId, PartialResult,
};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

fn parse_kinds(kinds: Vec<String>) -> Result<Vec<AgentKind>, StorageError> {
    kinds.iter().map(|k| k.parse()).collect()
}

// ---------------------------------------------------------------------------
// evaluations
// ---------------------------------------------------------------------------

/// Row in the `evaluations` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub evaluation_id: String,
    pub target_id: String,
    /// "pending" | "running" | "completed" | "failed"
    pub status: String,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub overall_score: Option<f64>,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub failed_kinds: Vec<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub retryable: bool,
}

impl From<&Evaluation> for EvaluationRow {
    fn from(e: &Evaluation) -> Self {
        EvaluationRow {
            id: None,
            evaluation_id: e.id.0.clone(),
            target_id: e.target_id.clone(),
            status: e.status.as_str().to_string(),
            created_at: e.created_at,
            started_at: e.started_at,
            completed_at: e.completed_at,
            overall_score: e.overall_score,
            errors: e.errors.clone(),
            failed_kinds: e.failed_kinds.iter().map(|k| k.as_str().to_string()).collect(),
            retry_count: e.retry_count,
            retryable: e.retryable,
        }
    }
}

impl TryFrom<EvaluationRow> for Evaluation {
    type Error = StorageError;

    fn try_from(row: EvaluationRow) -> Result<Self, Self::Error> {
        Ok(Evaluation {
            id: EvaluationId(row.evaluation_id),
            target_id: row.target_id,
            status: row.status.parse()?,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            overall_score: row.overall_score,
            errors: row.errors,
            failed_kinds: parse_kinds(row.failed_kinds)?,
            retry_count: row.retry_count,
            retryable: row.retryable,
        })
    }
}

// ---------------------------------------------------------------------------
// agent_runs
// ---------------------------------------------------------------------------

/// Row in the `agent_runs` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRunRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub evaluation_id: String,
    pub agent_kind: String,
    pub attempt_number: u32,
    /// "queued" | "in_progress" | "succeeded" | "failed" | "circuit_open"
    pub status: String,
    #[serde(default, with = "surreal_datetime_opt")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub timeout_budget_ms: Option<u64>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

impl From<&AgentRun> for AgentRunRow {
    fn from(r: &AgentRun) -> Self {
        AgentRunRow {
            id: None,
            evaluation_id: r.evaluation_id.0.clone(),
            agent_kind: r.agent_kind.as_str().to_string(),
            attempt_number: r.attempt_number,
            status: r.status.as_str().to_string(),
            started_at: r.started_at,
            finished_at: r.finished_at,
            timeout_budget_ms: r.timeout_budget_ms,
            result: r.result.clone(),
            failure_reason: r.failure_reason.clone(),
            timed_out: r.timed_out,
        }
    }
}

impl TryFrom<AgentRunRow> for AgentRun {
    type Error = StorageError;

    fn try_from(row: AgentRunRow) -> Result<Self, Self::Error> {
        Ok(AgentRun {
            evaluation_id: EvaluationId(row.evaluation_id),
            agent_kind: row.agent_kind.parse()?,
            attempt_number: row.attempt_number,
            status: row.status.parse()?,
            started_at: row.started_at,
            finished_at: row.finished_at,
            timeout_budget_ms: row.timeout_budget_ms,
            result: row.result,
            failure_reason: row.failure_reason,
            timed_out: row.timed_out,
        })
    }
}

// ---------------------------------------------------------------------------
// partial_results
// ---------------------------------------------------------------------------

/// Row in the `partial_results` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartialResultRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub evaluation_id: String,
    pub agent_kind: String,
    pub score: f64,
    pub data: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub recorded_at: DateTime<Utc>,
}

impl From<&PartialResult> for PartialResultRow {
    fn from(p: &PartialResult) -> Self {
        PartialResultRow {
            id: None,
            evaluation_id: p.evaluation_id.0.clone(),
            agent_kind: p.agent_kind.as_str().to_string(),
            score: p.score,
            data: p.data.clone(),
            recorded_at: p.recorded_at,
        }
    }
}

impl TryFrom<PartialResultRow> for PartialResult {
    type Error = StorageError;

    fn try_from(row: PartialResultRow) -> Result<Self, Self::Error> {
        Ok(PartialResult {
            evaluation_id: EvaluationId(row.evaluation_id),
            agent_kind: row.agent_kind.parse()?,
            score: row.score,
            data: row.data,
            recorded_at: row.recorded_at,
        })
    }
}

// ---------------------------------------------------------------------------
// breakers
// ---------------------------------------------------------------------------

/// Row in the `breakers` table, keyed by agent kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerRow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    pub agent_kind: String,
    pub consecutive_failures: u32,
    #[serde(default, with = "surreal_datetime_opt")]
    pub opened_at: Option<DateTime<Utc>>,
    pub cooldown_ms: u64,
}

impl From<&CircuitBreakerState> for BreakerRow {
    fn from(s: &CircuitBreakerState) -> Self {
        BreakerRow {
            id: None,
            agent_kind: s.agent_kind.as_str().to_string(),
            consecutive_failures: s.consecutive_failures,
            opened_at: s.opened_at,
            cooldown_ms: s.cooldown_ms,
        }
    }
}

impl TryFrom<BreakerRow> for CircuitBreakerState {
    type Error = StorageError;

    fn try_from(row: BreakerRow) -> Result<Self, Self::Error> {
        Ok(CircuitBreakerState {
            agent_kind: row.agent_kind.parse()?,
            consecutive_failures: row.consecutive_failures,
            opened_at: row.opened_at,
            cooldown_ms: row.cooldown_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EvaluationStatus;

    #[test]
    fn evaluation_row_round_trips_typed_fields() {
        let mut eval = Evaluation::new("brand-42");
        eval.failed_kinds = vec![AgentKind::Sentiment, AgentKind::Commerce];
        eval.status = EvaluationStatus::Running;

        let row = EvaluationRow::from(&eval);
        assert_eq!(row.status, "running");
        assert_eq!(row.failed_kinds, vec!["sentiment_agent", "commerce_agent"]);

        let back = Evaluation::try_from(row).unwrap();
        assert_eq!(back, eval);
    }

    #[test]
    fn unknown_status_in_row_is_rejected() {
        let mut row = EvaluationRow::from(&Evaluation::new("brand-1"));
        row.status = "zombie".to_string();
        let err = Evaluation::try_from(row).unwrap_err();
        assert!(matches!(err, StorageError::UnknownStatus(s) if s == "zombie"));
    }

    #[test]
    fn row_id_is_omitted_when_absent() {
        let row = BreakerRow::from(&CircuitBreakerState::closed(AgentKind::Crawl, 900_000));
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("id").is_none());
        assert_eq!(json["agent_kind"], "crawl_agent");
    }
}
