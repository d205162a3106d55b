//! SurrealDB schema migrations and initialization
//!
//! Sets up every table the evaluation core uses, with the indexes that back
//! the claim, reaping and uniqueness rules.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all evaluation tables in SurrealDB
///
/// Safe to call multiple times (idempotent).
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing evaluation SurrealDB schema");

    init_evaluations_table(db).await?;
    init_agent_runs_table(db).await?;
    init_partial_results_table(db).await?;
    init_breakers_table(db).await?;

    info!("Evaluation schema initialization complete");
    Ok(())
}

/// Initialize `evaluations` table
///
/// Schema:
/// ```text
/// TABLE evaluations {
///   evaluation_id:  STRING (unique)
///   target_id:      STRING (indexed)
///   status:         STRING (pending | running | completed | failed)
///   created_at:     DATETIME
///   started_at:     DATETIME?
///   completed_at:   DATETIME?
///   overall_score:  FLOAT?
///   errors:         ARRAY<STRING>
///   failed_kinds:   ARRAY<STRING>
///   retry_count:    INT
///   retryable:      BOOL
/// }
/// ```
///
/// Status transitions are enforced by conditional updates in the store.
async fn init_evaluations_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing evaluations table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS evaluations SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_evaluation_id ON TABLE evaluations COLUMNS evaluation_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_eval_target ON TABLE evaluations COLUMNS target_id;

        -- Claim scan: schedulable rows by age
        DEFINE INDEX IF NOT EXISTS idx_eval_status_created ON TABLE evaluations COLUMNS status, created_at;

        -- Zombie scan and daily budget
        DEFINE INDEX IF NOT EXISTS idx_eval_status_started ON TABLE evaluations COLUMNS status, started_at;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ evaluations table initialized");
    Ok(())
}

/// Initialize `agent_runs` table
///
/// `(evaluation_id, agent_kind, attempt_number)` is unique; monotonic attempt
/// numbers are enforced on insert.
async fn init_agent_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing agent_runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS agent_runs SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_agent_run_attempt ON TABLE agent_runs
            COLUMNS evaluation_id, agent_kind, attempt_number UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ agent_runs table initialized");
    Ok(())
}

/// Initialize `partial_results` table
///
/// One row per (evaluation_id, agent_kind).
async fn init_partial_results_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing partial_results table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS partial_results SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;

        DEFINE INDEX IF NOT EXISTS idx_partial_kind ON TABLE partial_results
            COLUMNS evaluation_id, agent_kind UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ partial_results table initialized");
    Ok(())
}

/// Initialize `breakers` table. Record ids are the agent kind names.
async fn init_breakers_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing breakers table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS breakers SCHEMALESS
            PERMISSIONS
                FOR create FULL
                FOR read FULL
                FOR update FULL
                FOR delete NONE;
    "#;

    db.query(sql).await?.check()?;
    info!("✓ breakers table initialized");
    Ok(())
}
