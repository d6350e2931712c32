//! `recruitor` command-line entry point.

mod worker;

use clap::{Parser, Subcommand};
use recruitor_orchestrator::{
    AgentRuntime, ConditionExpr, Orchestrator, RecruitorConfig, StepCondition, StepGraph,
    WorkflowDefinition, WorkflowStatus,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use worker::EchoWorker;

#[derive(Parser)]
#[command(name = "recruitor", about = "Recruitor agent orchestration core")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "recruitor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a workflow definition and print its final state
    Run {
        /// Workflow definition (JSON)
        workflow: PathBuf,
    },
    /// Validate a workflow definition without running it
    Check {
        /// Workflow definition (JSON)
        workflow: PathBuf,
    },
    /// Start the services and configured workers until Ctrl-C
    Serve,
    /// List configured workers
    Workers,
}

async fn load_workflow(path: &Path) -> anyhow::Result<WorkflowDefinition> {
    let source = tokio::fs::read_to_string(path).await.map_err(|e| {
        anyhow::anyhow!("Failed to read workflow file '{}': {e}", path.display())
    })?;
    Ok(serde_json::from_str(&source)?)
}

/// Validates the graph and conditions, returning the execution order.
fn check_workflow(definition: &WorkflowDefinition) -> anyhow::Result<Vec<String>> {
    let graph = StepGraph::from_definitions(&definition.steps)?;
    for step in &definition.steps {
        if let Some(StepCondition::Custom(source)) = &step.condition {
            ConditionExpr::parse(source)?;
        }
    }
    Ok(graph.execution_order())
}

/// Actions the workflow uses that no configured worker offers.
fn uncovered_actions(definition: &WorkflowDefinition, config: &RecruitorConfig) -> Vec<String> {
    let offered: HashSet<&str> = config
        .workers
        .iter()
        .flat_map(|w| w.actions.iter().map(String::as_str))
        .collect();
    let mut missing: Vec<String> = definition
        .steps
        .iter()
        .filter(|s| s.agent_id.is_none() && !offered.contains(s.action.as_str()))
        .map(|s| s.action.clone())
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

async fn spawn_workers(
    services: &Orchestrator,
    config: &RecruitorConfig,
) -> anyhow::Result<Vec<AgentRuntime>> {
    let mut runtimes = Vec::with_capacity(config.workers.len());
    for worker in &config.workers {
        let runtime = services
            .spawn_worker(Arc::new(EchoWorker::new(worker.clone())))
            .await?;
        runtimes.push(runtime);
    }
    info!(count = runtimes.len(), "Workers spawned");
    Ok(runtimes)
}

async fn shutdown(services: &Orchestrator, runtimes: Vec<AgentRuntime>) {
    for runtime in runtimes {
        if let Err(e) = runtime.shutdown().await {
            warn!(agent_id = %runtime.id(), error = %e, "Worker shutdown failed");
        }
    }
    services.stop();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    let config = RecruitorConfig::load_or_default(&cli.config).await?;

    match cli.command {
        Commands::Run { workflow } => {
            let definition = load_workflow(&workflow).await?;
            for action in uncovered_actions(&definition, &config) {
                warn!(action = %action, "No configured worker offers this action");
            }

            let services = Orchestrator::from_config(config.clone()).await?;
            let runtimes = spawn_workers(&services, &config).await?;
            services.start();

            let result = services.engine().run(definition).await;
            shutdown(&services, runtimes).await;

            let state = result?;
            println!("{}", serde_json::to_string_pretty(&state)?);
            if state.status != WorkflowStatus::Completed {
                anyhow::bail!(
                    "Workflow '{}' ended {}: {}",
                    state.name,
                    state.status,
                    state.error.unwrap_or_default()
                );
            }
        }
        Commands::Check { workflow } => {
            let definition = load_workflow(&workflow).await?;
            let order = check_workflow(&definition)?;
            println!("Workflow '{}' is valid ({} steps)", definition.name, order.len());
            println!("Execution order: {}", order.join(" → "));
            let missing = uncovered_actions(&definition, &config);
            if !missing.is_empty() {
                println!("Actions without a configured worker: {}", missing.join(", "));
            }
        }
        Commands::Serve => {
            let services = Orchestrator::from_config(config.clone()).await?;
            let runtimes = spawn_workers(&services, &config).await?;
            services.start();

            let mut events = services.events().subscribe();
            let logger = tokio::spawn(async move {
                loop {
                    match events.recv().await {
                        Ok(event) => {
                            let payload = serde_json::to_value(&event).unwrap_or_default();
                            info!(event = %event.name(), payload = %payload, "Orchestration event");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Event logger lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    }
                }
            });

            info!("Recruitor services running, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            logger.abort();
            shutdown(&services, runtimes).await;
        }
        Commands::Workers => {
            if config.workers.is_empty() {
                println!("No workers configured.");
                println!("Configure workers in recruitor.toml under [[workers]]");
            } else {
                println!("Configured workers:");
                for worker in &config.workers {
                    println!(
                        "  {} ({}): {}",
                        worker.id,
                        worker.agent_type,
                        worker.actions.join(", ")
                    );
                    if worker.delay_ms > 0 {
                        println!("    delay: {}ms", worker.delay_ms);
                    }
                }
                println!("\nTotal: {} worker(s)", config.workers.len());
            }
        }
    }

    Ok(())
}
