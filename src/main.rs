use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use overseer::api::{self, AppState};
use overseer::engine::{PlanFile, Planner, SessionTable};
use overseer::providers::{
    AnthropicProvider, ExecutionEngine, LLMProvider, LlmExecutionEngine, OpenAIProvider,
    SimulatedEngine,
};
use overseer::storage::{InMemoryStore, PostgresStorage, Storage};
use overseer::types::{AgentConfig, SessionReport, TaskSummary};
use overseer::validation::{LlmScorer, QualityGateEvaluator};
use overseer::Config;

#[derive(Parser)]
#[command(name = "overseer")]
#[command(about = "Manager/worker coordination for autonomous coding agents", long_about = None)]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one session to completion
    Run {
        /// YAML plan listing agents and tasks
        #[arg(long, conflicts_with = "goal")]
        plan: Option<PathBuf>,

        /// Goal for the manager agent to decompose
        #[arg(long)]
        goal: Option<String>,

        /// Worker agents to create when running from a goal
        #[arg(long, default_value_t = 2)]
        workers: usize,

        #[arg(long)]
        max_iterations: Option<u32>,

        /// Use the simulated engine instead of a model provider
        #[arg(long)]
        dry_run: bool,
    },
    /// Serve the HTTP control surface
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    match cli.command {
        Commands::Run {
            plan,
            goal,
            workers,
            max_iterations,
            dry_run,
        } => run_session(config, plan, goal, workers, max_iterations, dry_run).await?,
        Commands::Serve { port } => {
            let port = port.unwrap_or(config.server.port);
            let sessions = Arc::new(build_sessions(config, false).await?);
            api::serve(AppState { sessions }, port).await?;
        }
    }

    Ok(())
}

fn chat_provider(config: &Config) -> Option<Arc<dyn LLMProvider>> {
    if let Some(key) = &config.anthropic_api_key {
        return Some(Arc::new(AnthropicProvider::new(key.clone())));
    }
    config
        .openai_api_key
        .as_ref()
        .map(|key| Arc::new(OpenAIProvider::new(key.clone())) as Arc<dyn LLMProvider>)
}

async fn build_sessions(config: Config, dry_run: bool) -> Result<SessionTable> {
    let provider = if dry_run { None } else { chat_provider(&config) };

    let (engine, evaluator): (Arc<dyn ExecutionEngine>, QualityGateEvaluator) = match provider {
        Some(provider) => (
            Arc::new(LlmExecutionEngine::new(provider.clone())),
            QualityGateEvaluator::new(Arc::new(LlmScorer::new(provider)), config.quality_gate.clone()),
        ),
        None => {
            if !dry_run {
                log::warn!("no provider key configured, using the simulated engine");
            }
            (
                Arc::new(SimulatedEngine),
                QualityGateEvaluator::heuristic(config.quality_gate.clone()),
            )
        }
    };

    let storage: Arc<dyn Storage> = match &config.database_url {
        Some(url) => {
            let postgres = PostgresStorage::new(url).await?;
            postgres.run_migrations().await?;
            Arc::new(postgres)
        }
        None => Arc::new(InMemoryStore::new()),
    };

    Ok(SessionTable::new(config, engine, storage, evaluator))
}

async fn run_session(
    config: Config,
    plan: Option<PathBuf>,
    goal: Option<String>,
    workers: usize,
    max_iterations: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let plan = plan.map(|path| PlanFile::load(&path)).transpose()?;
    let goal = match (&plan, goal) {
        (Some(plan), _) => plan.goal.clone(),
        (None, Some(goal)) => goal,
        (None, None) => bail!("either --plan or --goal is required"),
    };

    let sessions = Arc::new(build_sessions(config.clone(), dry_run).await?);
    let max_iterations = max_iterations.or_else(|| plan.as_ref().and_then(|p| p.max_iterations));
    let coordinator = sessions.create(goal.clone(), max_iterations).await?;

    match &plan {
        Some(plan) => {
            plan.apply(&coordinator, &config).await?;
        }
        None => {
            coordinator.create_agent(AgentConfig::manager("manager")).await?;
            for n in 1..=workers {
                coordinator
                    .create_agent(AgentConfig::worker(format!("worker-{}", n)))
                    .await?;
            }
            Planner::new(coordinator.clone()).plan(&goal).await?;
        }
    }

    let stopper = sessions.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stopper.emergency_stop_all("interrupted").await;
        }
    });

    println!("Session {} started: {}", coordinator.session_id(), goal);
    let report = sessions.run_to_completion(&coordinator.session_id()).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &SessionReport) {
    println!("\nSession finished: {}", report.outcome.as_str());
    println!("Iterations: {}", report.iterations);
    if let Some(diagnostic) = &report.diagnostic {
        println!("Diagnostic: {}", diagnostic);
    }
    print_section("Succeeded", &report.succeeded);
    print_section("Failed", &report.failed);
    print_section("Interrupted", &report.interrupted);
    print_section("Never attempted", &report.never_attempted);
}

fn print_section(label: &str, tasks: &[TaskSummary]) {
    if tasks.is_empty() {
        return;
    }
    println!("{} ({}):", label, tasks.len());
    for task in tasks {
        match &task.reason {
            Some(reason) => println!("  - {} [{} attempt(s)]: {}", task.title, task.attempts, reason),
            None => println!("  - {} [{} attempt(s)]", task.title, task.attempts),
        }
    }
}
