use clap::{Parser, Subcommand};
use escalor_core::{
    Classifier, Decision, EngineConfig, EscalorError, ExecOutcome, Fingerprint, TierCatalog,
    WorkItem,
};
use escalor_engine::{
    select_mode, DecisionEnforcer, Mode, ModeContext, ProcessClassifier, ProcessHandler,
    RunStatus, StateHandles, WorkflowEngine, WorkflowRun, WorkflowSpec,
};
use escalor_state::{summarize, EventKind};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "orchestrate", about = "Escalor — tiered orchestration and scheduling engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "escalor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route a single request and execute it under the selected mode
    Run {
        /// The request text
        request: String,
        /// Execute on this tier, bypassing classification
        #[arg(long)]
        tier: Option<String>,
        /// Force 'directive' or 'orchestration' instead of deriving the mode
        #[arg(long)]
        mode: Option<Mode>,
        /// Treat the request as a batch or scheduled submission
        #[arg(long)]
        batch: bool,
        /// Mark the request compliance-critical
        #[arg(long)]
        compliance_critical: bool,
    },
    /// Run a workflow spec end to end
    Workflow {
        /// Path to the workflow TOML file
        spec_file: PathBuf,
    },
    /// Resume a checkpointed workflow run
    Resume {
        /// Run id printed when the workflow started
        run_id: Uuid,
    },
    /// Show queue, quota and workflow-run state
    Status,
    /// Summarize compliance from the event log
    Report {
        /// Emit the summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Cancel a pending work item
    Cancel {
        /// Fingerprint of the item to cancel
        fingerprint: String,
    },
}

/// Everything a command needs, opened from one config.
struct Runtime {
    config: EngineConfig,
    state: StateHandles,
    enforcer: Arc<DecisionEnforcer>,
    workflows: WorkflowEngine,
}

async fn open_runtime(config: EngineConfig) -> anyhow::Result<Runtime> {
    let state = StateHandles::open(&config.data_dir, config.quota.window_secs).await?;
    let enforcer = Arc::new(DecisionEnforcer::new(
        config.catalog()?,
        config.retry.clone(),
        config.cache_ttl_secs,
        state.clone(),
        Arc::new(ProcessHandler::new()),
    ));
    let workflows = WorkflowEngine::new(
        enforcer.clone(),
        state.clone(),
        config.data_dir.join("workflows"),
    )?;
    Ok(Runtime {
        config,
        state,
        enforcer,
        workflows,
    })
}

/// Explicit override first, then the configured classifier, then the
/// configured default tier. With none of the three the request cannot be
/// routed.
async fn resolve_decision(
    config: &EngineConfig,
    catalog: &TierCatalog,
    request: &str,
    tier_override: Option<String>,
) -> anyhow::Result<Decision> {
    if let Some(tier) = tier_override {
        if catalog.get(&tier).is_none() {
            return Err(EscalorError::Config(format!(
                "--tier '{tier}' is not a configured tier"
            ))
            .into());
        }
        return Ok(Decision::overridden(tier));
    }
    if let Some(classifier) = &config.classifier {
        let classifier = ProcessClassifier::new(classifier.command.clone());
        return Ok(classifier.classify(request).await?);
    }
    if let Some(default) = &config.default_tier {
        return Ok(Decision::new(default.clone(), 1.0, "configured default tier"));
    }
    Err(EscalorError::Config(
        "no classifier or default_tier configured; pass --tier".to_string(),
    )
    .into())
}

fn print_run(run: &WorkflowRun) -> i32 {
    match run.status {
        RunStatus::Completed => {
            println!(
                "Workflow '{}' run {}: completed ({} steps)",
                run.spec.name,
                run.run_id,
                run.completed_steps.len()
            );
            if !run.artifacts.is_empty() {
                println!("Artifacts:");
                for name in run.artifacts.keys() {
                    println!("  {name}");
                }
            }
            0
        }
        RunStatus::Failed => {
            let step = run.failed_step.as_deref().unwrap_or("unknown");
            eprintln!(
                "Workflow '{}' run {}: failed at step '{}' ({}/{} steps completed)",
                run.spec.name,
                run.run_id,
                step,
                run.completed_steps.len(),
                run.spec.steps.len()
            );
            eprintln!("Resume with: orchestrate resume {}", run.run_id);
            1
        }
        RunStatus::Running => {
            println!(
                "Workflow '{}' run {}: still running ({}/{} steps completed)",
                run.spec.name,
                run.run_id,
                run.completed_steps.len(),
                run.spec.steps.len()
            );
            0
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    // Load config
    let config_text = tokio::fs::read_to_string(&cli.config).await.map_err(|e| {
        anyhow::anyhow!("failed to read config file '{}': {e}", cli.config.display())
    })?;
    let config = EngineConfig::from_toml_str(&config_text)?;
    let runtime = open_runtime(config).await?;

    match cli.command {
        Commands::Run {
            request,
            tier,
            mode,
            batch,
            compliance_critical,
        } => {
            let context = ModeContext {
                interactive: !batch,
                batch,
                explicit_override: mode,
                workflow_chain: false,
                compliance_critical,
            };
            let selected = select_mode(&context);
            let decision = resolve_decision(
                &runtime.config,
                runtime.enforcer.catalog(),
                &request,
                tier,
            )
            .await?;

            match selected {
                Mode::Directive => {
                    // Advisory only: surface the decision, touch nothing.
                    println!(
                        "Decision: tier '{}' (confidence {:.2})",
                        decision.tier, decision.confidence
                    );
                    println!("Rationale: {}", decision.rationale);
                    println!("Mode: directive, decision not enforced");
                    Ok(0)
                }
                Mode::Orchestration => {
                    let item = WorkItem::new(request, decision.tier.clone());
                    let record = runtime.enforcer.enforce(&item, &decision).await?;
                    match record.outcome {
                        ExecOutcome::Success => {
                            if let Some(entry) = runtime.state.cache.get(&item.id).await? {
                                println!("{}", entry.result);
                            }
                            info!(
                                fingerprint = %item.id.short(),
                                tier = %record.tier,
                                from_cache = record.from_cache,
                                "request completed"
                            );
                            Ok(0)
                        }
                        ExecOutcome::Timeout => {
                            eprintln!(
                                "execution timed out on tier '{}' (fingerprint {})",
                                record.tier, item.id
                            );
                            Ok(1)
                        }
                        _ => {
                            eprintln!(
                                "execution failed on tier '{}' (fingerprint {})",
                                record.tier, item.id
                            );
                            Ok(1)
                        }
                    }
                }
            }
        }
        Commands::Workflow { spec_file } => {
            let spec = WorkflowSpec::load(&spec_file).await?;
            let run = runtime.workflows.run(spec).await?;
            Ok(print_run(&run))
        }
        Commands::Resume { run_id } => {
            let run = runtime.workflows.resume(run_id).await?;
            Ok(print_run(&run))
        }
        Commands::Status => {
            let counts = runtime.state.queue.counts().await;
            println!(
                "Queue: {} pending, {} running, {} done, {} failed, {} cancelled",
                counts.pending, counts.running, counts.done, counts.failed, counts.cancelled
            );

            let windows = runtime.state.quota.windows().await;
            if windows.is_empty() {
                println!("Quota: no windows recorded yet");
            } else {
                println!("Quota windows:");
                for window in &windows {
                    println!(
                        "  {}: {}/{} used, {} remaining (window ends {})",
                        window.tier,
                        window.consumed,
                        window.limit,
                        window.remaining(),
                        window.window_end
                    );
                }
            }

            let runs = runtime.workflows.list_runs().await?;
            if runs.is_empty() {
                println!("Workflow runs: none");
            } else {
                println!("Workflow runs:");
                for run in &runs {
                    println!(
                        "  {}  {}  {}  {}/{} steps",
                        run.run_id,
                        run.spec.name,
                        run.status,
                        run.completed_steps.len(),
                        run.spec.steps.len()
                    );
                }
            }
            Ok(0)
        }
        Commands::Report { json } => {
            let events = runtime.state.events.read_all().await?;
            let summary = summarize(&events);
            if json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("Decisions:     {}", summary.decisions);
                println!("Cache hits:    {}", summary.cache_hits);
                println!("Executions:    {}", summary.executions);
                println!("  successes:   {}", summary.successes);
                println!("  failures:    {}", summary.failures);
                println!("Escalations:   {}", summary.escalations);
                println!("Quota denials: {}", summary.quota_denials);
                println!("Cancellations: {}", summary.cancellations);
                println!(
                    "Compliance: {} compliant, {} non-compliant",
                    summary.compliant, summary.non_compliant
                );
            }
            Ok(0)
        }
        Commands::Cancel { fingerprint } => {
            let fingerprint = Fingerprint::parse(&fingerprint)?;
            runtime.state.queue.cancel(&fingerprint).await?;
            runtime
                .state
                .events
                .record(EventKind::WorkCancelled {
                    fingerprint: fingerprint.clone(),
                })
                .await?;
            println!("Cancelled {}", fingerprint.short());
            Ok(0)
        }
    }
}

/// Quota exhaustion and structural workflow errors carry their own exit
/// codes so schedulers can tell them apart from handler failures.
fn exit_code(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<EscalorError>() {
        Some(EscalorError::Quota(_)) => 2,
        Some(EscalorError::Workflow(_)) => 3,
        _ => 1,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match execute(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(exit_code(&err));
        }
    }
}

// ─────────────────────────────── Tests ───────────────────────────────
