//! CLI command definitions for factmill.
//!
//! Two commands: `run` executes an extraction plan from a YAML file, and
//! `show-plan` prints the resolved execution order without running anything.

use std::sync::Arc;

use clap::Parser;
use tracing::info;

use crate::config::{AppConfig, CoordinatorConfig, StoreKind};
use crate::error::PlanError;
use crate::plan::{ExecutionPlan, PlanRunner, RunSummary};
use crate::store::{DataStore, MemoryStore, PostgresStore};

/// Default plan file path.
const DEFAULT_PLAN_FILE: &str = "factmill.yaml";

/// Streaming data-extraction pipeline runner.
#[derive(Parser)]
#[command(name = "factmill")]
#[command(about = "Run data-extraction pipelines over external UDF processes")]
#[command(version)]
#[command(
    long_about = "factmill streams records from a data store through pools of external UDF processes and collects their output back into the store.\n\nExample usage:\n  factmill run --plan extraction.yaml\n  factmill show-plan --plan extraction.yaml --target ext_people"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute an extraction plan.
    Run(RunArgs),

    /// Print the resolved execution order without running anything.
    #[command(name = "show-plan")]
    ShowPlan(ShowPlanArgs),
}

/// Arguments for `factmill run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Path to the plan file.
    #[arg(short, long, default_value = DEFAULT_PLAN_FILE)]
    pub plan: String,

    /// Run only this task and its transitive dependencies.
    #[arg(short, long)]
    pub target: Option<String>,
}

/// Arguments for `factmill show-plan`.
#[derive(Parser, Debug)]
pub struct ShowPlanArgs {
    /// Path to the plan file.
    #[arg(short, long, default_value = DEFAULT_PLAN_FILE)]
    pub plan: String,

    /// Restrict to this task and its transitive dependencies.
    #[arg(short, long)]
    pub target: Option<String>,
}

/// Parse CLI arguments without running a command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// This is a convenience function that parses CLI args and runs the command.
/// For more control over logging initialization, use `parse_cli()` and `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
///
/// This is the main entry point for the factmill CLI.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => {
            run_plan_command(args).await?;
        }
        Commands::ShowPlan(args) => {
            run_show_plan_command(args).await?;
        }
    }
    Ok(())
}

async fn run_plan_command(args: RunArgs) -> anyhow::Result<()> {
    let config = AppConfig::from_file(&args.plan)?;
    let plan = resolve_plan(&config, args.target.as_deref())?;
    let store = open_store(&config).await?;

    let runner = PlanRunner::new(store, CoordinatorConfig::from_env()?);
    let summary = runner.run(&plan).await?;

    print_summary(&summary);
    Ok(())
}

async fn run_show_plan_command(args: ShowPlanArgs) -> anyhow::Result<()> {
    let config = AppConfig::from_file(&args.plan)?;
    let plan = resolve_plan(&config, args.target.as_deref())?;

    println!(
        "Execution plan from {} ({} tasks, store: {}):",
        args.plan,
        plan.len(),
        config.store.kind
    );
    for (position, task) in plan.tasks().iter().enumerate() {
        let output = task.output_relation.as_deref().unwrap_or("-");
        let after = if task.dependencies.is_empty() {
            String::new()
        } else {
            format!("  (after {})", task.dependencies.join(", "))
        };
        println!(
            "  {:>2}. {:<24} {:<18} -> {}{}",
            position + 1,
            task.name,
            task.style,
            output,
            after
        );
    }
    Ok(())
}

fn resolve_plan(config: &AppConfig, target: Option<&str>) -> Result<ExecutionPlan, PlanError> {
    match target {
        Some(name) => ExecutionPlan::resolve_target(&config.tasks, name),
        None => ExecutionPlan::resolve(&config.tasks),
    }
}

async fn open_store(config: &AppConfig) -> anyhow::Result<Arc<dyn DataStore>> {
    let store: Arc<dyn DataStore> = match config.store.kind {
        StoreKind::Postgres => Arc::new(PostgresStore::connect(&config.store.url).await?),
        StoreKind::Memory => Arc::new(MemoryStore::new()),
    };
    info!(driver = store.driver_name(), "Connected to data store");
    Ok(store)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "Extraction run complete: {} tasks, {} records out, {} ms",
        summary.tasks(),
        summary.records_out,
        summary.duration_ms
    );
    for report in &summary.reports {
        println!(
            "  {:<24} {:<18} in: {:>8}  out: {:>8}  appends: {:>4}  {} ms",
            report.task,
            report.style,
            report.records_in,
            report.records_out,
            report.appends,
            report.duration_ms
        );
    }
}
