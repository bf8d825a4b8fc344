//! AMOS - Agent Milestone Orchestration CLI
//!
//! The `amos` command drives a milestone graph to completion with budget
//! caps and debate-based decisions.
//!
//! ## Commands
//!
//! - `run`: execute a milestone graph with sandboxed parallel workers
//! - `totals`: show cumulative ledger spend for one agent identity

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};

use amos_core::{
    cap_table, init_tracing, load_milestones, load_roles, BudgetLedger, MilestoneGraph,
    MilestoneRunner, MilestoneState, ParallelScheduler, RoleRegistry, SchedulerConfig,
};

#[derive(Parser)]
#[command(name = "amos")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Agent Milestone Orchestration System", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a milestone graph
    Run {
        /// Milestone definitions (YAML list of {id, goal, dependencies})
        #[arg(short, long, default_value = "milestones.yaml")]
        milestones: PathBuf,

        /// Role capability table (YAML map role -> template)
        #[arg(short, long, default_value = "roles.yaml")]
        roles: PathBuf,

        /// Shared root workspace milestones merge into
        #[arg(short, long, default_value = "workspace")]
        workspace: PathBuf,

        /// Usage ledger file
        #[arg(long, default_value = "amos_usage.jsonl")]
        ledger: PathBuf,

        /// Maximum concurrently running milestones
        #[arg(long, default_value_t = 4)]
        max_parallel: usize,

        /// Role spawned for every debate panelist
        #[arg(long, default_value = "technomancer")]
        panel_role: String,

        /// Panelists per milestone (even sizes are bumped to odd)
        #[arg(long, default_value_t = 3)]
        panel_size: usize,
    },

    /// Show cumulative ledger spend for one agent identity
    Totals {
        /// Usage ledger file
        #[arg(long, default_value = "amos_usage.jsonl")]
        ledger: PathBuf,

        /// Agent identity (or role name, for role-level records)
        agent: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            milestones,
            roles,
            workspace,
            ledger,
            max_parallel,
            panel_role,
            panel_size,
        } => {
            run(
                milestones,
                roles,
                workspace,
                ledger,
                max_parallel,
                panel_role,
                panel_size,
            )
            .await
        }
        Commands::Totals { ledger, agent } => totals(ledger, &agent).await,
    }
}

async fn run(
    milestones: PathBuf,
    roles: PathBuf,
    workspace: PathBuf,
    ledger_path: PathBuf,
    max_parallel: usize,
    panel_role: String,
    panel_size: usize,
) -> Result<()> {
    let specs = load_milestones(&milestones)
        .with_context(|| format!("loading milestones from {}", milestones.display()))?;
    let role_table =
        load_roles(&roles).with_context(|| format!("loading roles from {}", roles.display()))?;

    let ledger = Arc::new(BudgetLedger::open(&ledger_path, cap_table(&role_table))?);
    let registry = Arc::new(RoleRegistry::from_table(&role_table, Arc::clone(&ledger))?);
    let runner = Arc::new(MilestoneRunner::new(registry, &panel_role)?);

    let graph = MilestoneGraph::from_specs(specs)?;
    info!(
        milestones = graph.len(),
        max_parallel,
        workspace = %workspace.display(),
        "starting milestone run"
    );

    let scheduler = ParallelScheduler::new(
        graph,
        SchedulerConfig::new(workspace).with_max_parallel(max_parallel),
    );

    let report = scheduler
        .run_all(move |milestone, sandbox| {
            let runner = Arc::clone(&runner);
            async move {
                let decision = runner
                    .run_milestone(&milestone.goal, panel_size)
                    .await?
                    .ok_or_else(|| anyhow::anyhow!("panel reached no consensus"))?;
                let artifact = sandbox.join(format!("{}.decision.txt", milestone.id));
                std::fs::write(artifact, format!("{decision}\n"))?;
                Ok(())
            }
        })
        .await?;

    for outcome in &report.outcomes {
        match outcome.state {
            MilestoneState::Passed => println!("PASSED  {}", outcome.id),
            MilestoneState::Failed => println!(
                "FAILED  {} ({})",
                outcome.id,
                outcome.failure.as_deref().unwrap_or("unknown failure")
            ),
            other => println!("{other:?}  {}", outcome.id),
        }
    }
    println!(
        "{} passed, {} failed",
        report.passed_count(),
        report.failed_count()
    );

    if report.all_passed() {
        Ok(())
    } else {
        std::process::exit(1);
    }
}

async fn totals(ledger_path: PathBuf, agent: &str) -> Result<()> {
    let ledger = BudgetLedger::open(&ledger_path, Default::default())?;
    let totals = ledger.totals(agent).await;
    println!("{agent}: tokens={} cost_usd={:.6}", totals.tokens, totals.cost);
    Ok(())
}
