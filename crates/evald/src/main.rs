//! evald - evaluation orchestration daemon
//!
//! Runs the queue processor and zombie reaper on a schedule, and exposes the
//! same operations as one-shot subcommands for operators.
//!
//! ## Commands
//!
//! - `serve`: tick the queue and the reaper until interrupted
//! - `enqueue`: create a pending evaluation for a target
//! - `status`: show an evaluation with its partial results and attempts
//! - `run-queue-once`: claim and run one batch
//! - `sweep`: fail evaluations stuck in `running`
//! - `breakers`: inspect, reset or open circuit breakers

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use eval_core::telemetry::init_tracing;
use eval_core::{
    AgentOutput, AgentProbe, BreakerStatus, EngineConfig, EvaluationService,
    EvaluationStatusView, HttpProbe, ProbeContext, ProbeError, ProbeRegistry, QueueRunReport,
    ReapReport, SystemClock,
};
use eval_state::{AgentKind, EvaluationId, Stores, SurrealEvaluationStore};
use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "evald")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluation orchestration daemon", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (TOML)
    #[arg(long, global = true, env = "EVALD_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the queue processor and zombie reaper until interrupted
    Serve,

    /// Create a pending evaluation for a target
    Enqueue {
        /// Target (brand/site) identifier
        target_id: String,
    },

    /// Show the status of an evaluation
    Status {
        /// Evaluation identifier
        evaluation_id: String,
    },

    /// Claim and run a single batch of evaluations
    RunQueueOnce,

    /// Fail evaluations that have been running too long
    Sweep {
        /// Maximum running duration (default: zombie.max_running_minutes)
        #[arg(long)]
        max_running_minutes: Option<u32>,

        /// Only count what would be reaped
        #[arg(long)]
        dry_run: bool,
    },

    /// Inspect and operate circuit breakers
    Breakers {
        #[command(subcommand)]
        action: BreakerAction,
    },
}

#[derive(Subcommand)]
enum BreakerAction {
    /// Show every breaker
    List,
    /// Close a breaker and clear its failure count
    Reset {
        /// Agent kind, e.g. `crawl_agent`
        kind: AgentKind,
    },
    /// Open a breaker for a full cooldown window
    Open {
        /// Agent kind, e.g. `crawl_agent`
        kind: AgentKind,
    },
}

impl Commands {
    /// Whether the command may dispatch agent probes.
    fn dispatches_probes(&self) -> bool {
        matches!(self, Commands::Serve | Commands::RunQueueOnce)
    }
}

/// Stand-in for kinds without a configured endpoint, used by commands that
/// never dispatch probes. Every attempt fails.
struct UnconfiguredProbe {
    kind: AgentKind,
}

#[async_trait]
impl AgentProbe for UnconfiguredProbe {
    async fn probe(&self, _target_id: &str, _ctx: ProbeContext) -> Result<AgentOutput, ProbeError> {
        Err(ProbeError::Failed(format!(
            "no probe endpoint configured for {}",
            self.kind
        )))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = EngineConfig::load(cli.config.as_deref())
        .context("Failed to load engine configuration")?;
    let registry = build_registry(&config, cli.command.dispatches_probes())?;

    let store = SurrealEvaluationStore::from_env()
        .await
        .context("Failed to connect to evaluation database")?;
    let service = EvaluationService::build(
        config,
        Stores::surreal(store),
        registry,
        Arc::new(SystemClock),
    )
    .await
    .context("Failed to start evaluation service")?;

    let json = cli.json;
    match cli.command {
        Commands::Serve => cmd_serve(Arc::new(service)).await,
        Commands::Enqueue { target_id } => cmd_enqueue(&service, &target_id, json).await,
        Commands::Status { evaluation_id } => cmd_status(&service, &evaluation_id, json).await,
        Commands::RunQueueOnce => cmd_run_queue_once(&service, json).await,
        Commands::Sweep {
            max_running_minutes,
            dry_run,
        } => {
            let minutes =
                max_running_minutes.unwrap_or(service.config().zombie.max_running_minutes);
            cmd_sweep(&service, minutes, dry_run, json).await
        }
        Commands::Breakers { action } => match action {
            BreakerAction::List => cmd_breakers_list(&service, json).await,
            BreakerAction::Reset { kind } => {
                service.reset_breaker(kind).await;
                println!("Reset breaker for {}", kind);
                Ok(())
            }
            BreakerAction::Open { kind } => {
                let state = service.force_open_breaker(kind).await;
                println!(
                    "Opened breaker for {} (cooldown {}s)",
                    kind,
                    state.cooldown_ms / 1_000
                );
                Ok(())
            }
        },
    }
}

/// One probe per pipeline kind.
///
/// With `strict` every kind must have an endpoint; otherwise kinds without
/// one get an [`UnconfiguredProbe`].
fn build_registry(config: &EngineConfig, strict: bool) -> Result<ProbeRegistry> {
    let mut registry = ProbeRegistry::new();
    for kind in config.pipeline.kinds() {
        match config.probes.endpoint_for(kind) {
            Some(endpoint) => {
                let probe = HttpProbe::new(endpoint)
                    .with_context(|| format!("Failed to build probe client for {kind}"))?;
                registry.register(kind, Arc::new(probe));
            }
            None if strict => anyhow::bail!(
                "No probe endpoint configured for {kind}; set probes.base_url, \
                 probes.endpoints.{kind} or EVAL_PROBE_BASE_URL"
            ),
            None => registry.register(kind, Arc::new(UnconfiguredProbe { kind })),
        }
    }
    Ok(registry)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn log_task_exit(result: Result<(), JoinError>) {
    if let Err(e) = result {
        warn!(error = %e, "background task did not finish cleanly");
    }
}

/// Wait for every task in `tasks`.
async fn drain(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.join_next().await {
        log_task_exit(result);
    }
}

/// Tick the queue and the reaper until Ctrl-C, then let in-flight ticks
/// settle before returning.
async fn cmd_serve(service: Arc<EvaluationService>) -> Result<()> {
    let queue_every = Duration::from_secs(service.config().queue.interval_secs.max(1));
    let sweep_every = Duration::from_secs(service.config().zombie.interval_secs.max(1));
    let max_running = service.config().zombie.max_running_minutes;

    let mut queue_tick = tokio::time::interval(queue_every);
    queue_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut sweep_tick = tokio::time::interval(sweep_every);
    sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(
        queue_interval_secs = queue_every.as_secs(),
        sweep_interval_secs = sweep_every.as_secs(),
        "evald serving"
    );

    let mut in_flight = JoinSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(in_flight = in_flight.len(), "shutdown requested");
                break;
            }
            _ = queue_tick.tick() => {
                let service = Arc::clone(&service);
                in_flight.spawn(async move {
                    if let Err(e) = service.run_queue_once().await {
                        warn!(error = %e, "queue run failed");
                    }
                });
            }
            _ = sweep_tick.tick() => {
                let service = Arc::clone(&service);
                in_flight.spawn(async move {
                    if let Err(e) = service.run_zombie_sweep(max_running).await {
                        warn!(error = %e, "zombie sweep failed");
                    }
                });
            }
        }
        while let Some(result) = in_flight.try_join_next() {
            log_task_exit(result);
        }
    }

    // Running attempts are cancelled; their evaluations still finalize.
    service.shutdown();
    drain(&mut in_flight).await;
    info!("evald stopped");
    Ok(())
}

async fn cmd_enqueue(service: &EvaluationService, target_id: &str, json: bool) -> Result<()> {
    let evaluation = service
        .create_evaluation(target_id)
        .await
        .with_context(|| format!("Failed to enqueue evaluation for '{}'", target_id))?;

    if json {
        return print_json(&evaluation);
    }
    println!("Enqueued evaluation {} for {}", evaluation.id, target_id);
    Ok(())
}

async fn cmd_status(service: &EvaluationService, evaluation_id: &str, json: bool) -> Result<()> {
    let view = service
        .get_status(&EvaluationId(evaluation_id.to_string()))
        .await
        .with_context(|| format!("Failed to load evaluation '{}'", evaluation_id))?;

    if json {
        return print_json(&view);
    }
    print!("{}", render_status(&view));
    Ok(())
}

fn render_status(view: &EvaluationStatusView) -> String {
    let mut out = String::new();
    out.push_str(&format!("evaluation {}\n", view.evaluation_id));
    out.push_str(&format!("Target:   {}\n", view.target_id));
    out.push_str(&format!("Status:   {}\n", view.status));
    match view.overall_score {
        Some(score) => out.push_str(&format!("Score:    {:.2}\n", score)),
        None => out.push_str("Score:    -\n"),
    }
    out.push_str(&format!(
        "Progress: {}/{} kinds succeeded ({:.2}%)\n",
        view.progress.succeeded_kinds, view.progress.total_kinds, view.progress.completion_pct
    ));
    if view.retry_count > 0 {
        out.push_str(&format!("Retries:  {}\n", view.retry_count));
    }
    let in_flight = view.in_progress().count();
    if in_flight > 0 {
        out.push_str(&format!("Running:  {} attempt(s)\n", in_flight));
    }

    if !view.agent_runs.is_empty() {
        out.push_str("\nAttempts:\n");
        for run in &view.agent_runs {
            let budget = run
                .timeout_budget_ms
                .map(|ms| format!("{}ms", ms))
                .unwrap_or_else(|| "-".to_string());
            out.push_str(&format!(
                "  {:<22} #{:<2} {:<12} budget {}\n",
                run.agent_kind.as_str(),
                run.attempt_number,
                run.status.as_str(),
                budget
            ));
        }
    }

    if !view.errors.is_empty() {
        out.push_str("\nErrors:\n");
        for error in &view.errors {
            out.push_str(&format!("  - {}\n", error));
        }
    }
    out
}

async fn cmd_run_queue_once(service: &EvaluationService, json: bool) -> Result<()> {
    let report = service
        .run_queue_once()
        .await
        .context("Queue run failed")?;

    if json {
        return print_json(&report);
    }
    println!("{}", render_queue_report(&report));
    Ok(())
}

fn render_queue_report(report: &QueueRunReport) -> String {
    match &report.skipped_reason {
        Some(reason) => format!("Skipped: {}", reason),
        None => format!(
            "Claimed {}, completed {}, failed {} ({} left in today's budget)",
            report.claimed, report.completed, report.failed, report.budget_remaining
        ),
    }
}

async fn cmd_sweep(
    service: &EvaluationService,
    max_running_minutes: u32,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    if dry_run {
        let count = service
            .count_zombies(max_running_minutes)
            .await
            .context("Failed to count stale evaluations")?;
        if json {
            return print_json(&serde_json::json!({ "zombies": count }));
        }
        println!(
            "{} evaluation(s) running longer than {} minutes",
            count, max_running_minutes
        );
        return Ok(());
    }

    let report = service
        .run_zombie_sweep(max_running_minutes)
        .await
        .context("Zombie sweep failed")?;
    if json {
        return print_json(&report);
    }
    print!("{}", render_reap_report(&report));
    Ok(())
}

fn render_reap_report(report: &ReapReport) -> String {
    let mut out = format!("Reaped {} evaluation(s)\n", report.reaped_count);
    for reaped in &report.reaped {
        out.push_str(&format!(
            "  {} ({}) running {} min\n",
            reaped.id, reaped.target_id, reaped.running_minutes
        ));
    }
    out
}

async fn cmd_breakers_list(service: &EvaluationService, json: bool) -> Result<()> {
    let breakers = service.breaker_status().await;
    if json {
        return print_json(&breakers);
    }
    print!("{}", render_breakers(&breakers));
    Ok(())
}

fn render_breakers(breakers: &[BreakerStatus]) -> String {
    let mut out = String::new();
    for b in breakers {
        let phase = serde_json::to_value(b.phase)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        out.push_str(&format!(
            "{:<22} {:<6} failures={} cooldown_left={}s\n",
            b.agent_kind.as_str(),
            phase,
            b.consecutive_failures,
            b.remaining_cooldown_ms / 1_000
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use eval_core::{BreakerPhase, Progress};
    use eval_state::EvaluationStatus;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_breaker_reset_kind() {
        let cli = Cli::try_parse_from(["evald", "breakers", "reset", "citation_agent"]).unwrap();
        match cli.command {
            Commands::Breakers {
                action: BreakerAction::Reset { kind },
            } => assert_eq!(kind, AgentKind::Citation),
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn rejects_unknown_agent_kind() {
        assert!(Cli::try_parse_from(["evald", "breakers", "open", "teleport_agent"]).is_err());
    }

    #[test]
    fn parses_sweep_flags() {
        let cli = Cli::try_parse_from([
            "evald",
            "--json",
            "sweep",
            "--max-running-minutes",
            "30",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Sweep {
                max_running_minutes,
                dry_run,
            } => {
                assert_eq!(max_running_minutes, Some(30));
                assert!(dry_run);
            }
            _ => panic!("unexpected command"),
        }
    }

    #[test]
    fn only_queue_commands_dispatch_probes() {
        assert!(Commands::Serve.dispatches_probes());
        assert!(Commands::RunQueueOnce.dispatches_probes());
        assert!(!Commands::Enqueue {
            target_id: "t".into()
        }
        .dispatches_probes());
    }

    #[test]
    fn strict_registry_requires_endpoints() {
        let config = EngineConfig::default();
        let err = build_registry(&config, true).err().expect("strict registry should fail");
        assert!(err.to_string().contains("crawl_agent"));

        let lenient = build_registry(&config, false).unwrap();
        assert!(lenient.ensure_covers(&config.pipeline).is_ok());
    }

    #[test]
    fn base_url_covers_every_kind() {
        let mut config = EngineConfig::default();
        config.probes.base_url = Some("http://probes.local".into());
        let registry = build_registry(&config, true).unwrap();
        assert_eq!(registry.kinds().len(), 6);
    }

    #[test]
    fn status_rendering_lists_attempts_and_errors() {
        let id = EvaluationId("eval-42".into());
        let mut run = eval_state::AgentRun::queued(id.clone(), AgentKind::Crawl, 1);
        run.start(180_000);
        run.fail("timed out after 180000ms", true);
        let view = EvaluationStatusView {
            evaluation_id: id,
            target_id: "brand-9".into(),
            status: EvaluationStatus::Failed,
            overall_score: None,
            errors: vec!["crawl_agent: timed out after 180000ms (after 1 attempt)".into()],
            failed_kinds: vec![AgentKind::Crawl],
            retry_count: 0,
            partial_results: vec![],
            agent_runs: vec![run],
            progress: Progress {
                total_kinds: 6,
                succeeded_kinds: 0,
                attempted_kinds: 1,
                completion_pct: 0.0,
            },
        };
        let text = render_status(&view);
        assert!(text.contains("Status:   failed"));
        assert!(text.contains("Score:    -"));
        assert!(text.contains("crawl_agent"));
        assert!(text.contains("budget 180000ms"));
        assert!(text.contains("- crawl_agent: timed out"));
        assert!(!text.contains("Running:"));
    }

    #[test]
    fn status_rendering_counts_running_attempts() {
        let id = EvaluationId("eval-43".into());
        let mut run = eval_state::AgentRun::queued(id.clone(), AgentKind::LlmTest, 2);
        run.start(120_000);
        let view = EvaluationStatusView {
            evaluation_id: id,
            target_id: "brand-10".into(),
            status: EvaluationStatus::Running,
            overall_score: None,
            errors: vec![],
            failed_kinds: vec![],
            retry_count: 1,
            partial_results: vec![],
            agent_runs: vec![run],
            progress: Progress {
                total_kinds: 6,
                succeeded_kinds: 0,
                attempted_kinds: 0,
                completion_pct: 0.0,
            },
        };
        let text = render_status(&view);
        assert!(text.contains("Retries:  1"));
        assert!(text.contains("Running:  1 attempt(s)"));
        assert!(text.contains("in_progress"));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_every_tick() {
        let finished = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = JoinSet::new();
        for delay in [5_u64, 50, 500] {
            let finished = Arc::clone(&finished);
            tasks.spawn(async move {
                tokio::time::sleep(Duration::from_millis(delay)).await;
                finished.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            });
        }
        tasks.spawn(async { panic!("tick failed") });

        drain(&mut tasks).await;
        assert!(tasks.is_empty());
        assert_eq!(finished.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[test]
    fn queue_report_rendering() {
        let skipped = QueueRunReport {
            skipped_reason: Some("daily limit reached".into()),
            ..Default::default()
        };
        assert_eq!(render_queue_report(&skipped), "Skipped: daily limit reached");

        let ran = QueueRunReport {
            claimed: 3,
            completed: 2,
            failed: 1,
            budget_remaining: 17,
            skipped_reason: None,
        };
        assert_eq!(
            render_queue_report(&ran),
            "Claimed 3, completed 2, failed 1 (17 left in today's budget)"
        );
    }

    #[test]
    fn breaker_rendering_shows_phase() {
        let text = render_breakers(&[BreakerStatus {
            agent_kind: AgentKind::Commerce,
            phase: BreakerPhase::Open,
            consecutive_failures: 5,
            opened_at: None,
            remaining_cooldown_ms: 42_500,
        }]);
        assert!(text.starts_with("commerce_agent"));
        assert!(text.contains("open"));
        assert!(text.contains("failures=5"));
        assert!(text.contains("cooldown_left=42s"));
    }
}
