//! AdPilot: autonomous campaign decision engine.
//!
//! Main entry point: loads configuration, starts the background agents and
//! serves the REST API until interrupted.

use adpilot_agents::{AgentManager, DecisionEngine};
use adpilot_api::ApiServer;
use adpilot_core::config::AppConfig;
use adpilot_core::executor::{InMemoryExecutor, PlatformExecutor};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "adpilot")]
#[command(about = "Autonomous kill, budget and learning decisions for ad campaigns")]
#[command(version)]
struct Cli {
    /// Optional TOML config file
    #[arg(long, short)]
    config: Option<String>,

    /// Node identifier (overrides config)
    #[arg(long, env = "ADPILOT__NODE_ID")]
    node_id: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "ADPILOT__API__HTTP_PORT")]
    http_port: Option<u16>,

    /// Decision cycle interval in seconds (overrides config)
    #[arg(long, env = "ADPILOT__CYCLE__INTERVAL_SECS")]
    cycle_interval: Option<u64>,

    /// Record platform actions in memory instead of applying them
    #[arg(long, default_value_t = false)]
    dry_run: bool,

    /// Serve the API without the scheduled agents
    #[arg(long, default_value_t = false)]
    api_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "adpilot=info,adpilot_agents=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("AdPilot starting up");

    let mut config = AppConfig::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(node_id) = cli.node_id {
        config.node_id = node_id;
    }
    if let Some(port) = cli.http_port {
        config.api.http_port = port;
    }
    if let Some(secs) = cli.cycle_interval {
        config.cycle.interval_secs = secs;
    }
    if cli.dry_run {
        config.executor.dry_run = true;
    }

    info!(
        node_id = %config.node_id,
        http_port = config.api.http_port,
        cycle_interval_secs = config.cycle.interval_secs,
        dry_run = config.executor.dry_run,
        "Configuration loaded"
    );

    let engine = Arc::new(DecisionEngine::new(config.clone()));

    if !config.executor.dry_run {
        warn!("No live platform executor is linked into this build; recording actions in memory");
    }
    let executor: Arc<dyn PlatformExecutor> = Arc::new(InMemoryExecutor::new());

    let mut agent_manager = AgentManager::new(engine.clone(), executor);
    if !cli.api_only {
        agent_manager.start()?;
    } else {
        agent_manager.start_feedback()?;
        info!("Running in API-only mode (no scheduled agents)");
    }

    let api_server = ApiServer::new(config.clone(), engine);
    if let Err(e) = api_server.start_metrics() {
        error!(error = %e, "Failed to start metrics exporter");
    }

    info!("AdPilot is ready to serve traffic");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };
    let served = api_server.start_http(shutdown).await;

    agent_manager.shutdown();
    agent_manager.wait().await;
    info!("AdPilot stopped");

    served
}
