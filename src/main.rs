#![allow(missing_docs)]

//! Pinky — personal AI assistant.
//!
//! Single binary that connects chat channel adapters, routes each message
//! through an LLM lane, and executes permission-gated tools on the user's
//! behalf.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use pinky::agent::{AgentLoop, TaggedJsonParser};
use pinky::approvals::{ApprovalBroker, ApprovalStore, PermissionService};
use pinky::channels::router::ChannelRouter;
use pinky::channels::telegram::TelegramAdapter;
use pinky::channels::terminal::TerminalAdapter;
use pinky::config::PinkyConfig;
use pinky::identity::IdentityService;
use pinky::inference::router::LaneRouter;
use pinky::memory::InMemoryStore;
use pinky::tools;
use pinky::tools::executor::ToolExecutor;
use pinky::tools::ToolRegistry;

/// How long shutdown waits for in-flight tool executions.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

/// Identity snapshot cadence.
const IDENTITY_SAVE_INTERVAL: Duration = Duration::from_secs(60);

/// Default assistant persona prompt.
const DEFAULT_PERSONA: &str = "You are Pinky, a personal assistant. You can run tools by \
    emitting <tool_call>{\"name\": ..., \"arguments\": {...}}</tool_call> blocks. \
    Be concise and never invent tool results.";

#[derive(Parser)]
#[command(name = "pinky", version, about = "Personal AI assistant")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the assistant (default).
    Start,
    /// Check that the current inference lane is reachable.
    Ping,
    /// List configured inference lanes.
    Lanes,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Command::Start) {
        Command::Start => start().await,
        Command::Ping => ping().await,
        Command::Lanes => lanes(),
    }
}

async fn start() -> Result<()> {
    let config = PinkyConfig::load().context("failed to load configuration")?;
    let _logging = pinky::logging::init_production(std::path::Path::new(&config.paths.logs_dir))?;

    info!("pinky starting");

    // Stores and services, leaf-first.
    let approvals = Arc::new(
        ApprovalStore::open(&config.approvals.path).context("failed to open approval store")?,
    );
    let permissions = Arc::new(PermissionService::new(Arc::clone(&approvals)));
    let broker = Arc::new(ApprovalBroker::new(
        Arc::clone(&permissions),
        Duration::from_secs(config.approvals.timeout_secs),
    ));
    let _sweeper = broker.spawn_sweeper();

    let identity = Arc::new(
        IdentityService::load(std::path::Path::new(&config.identity.path))
            .context("failed to load identity snapshot")?,
    );

    let lanes = Arc::new(
        LaneRouter::load(&config.paths.inference_config)
            .context("failed to load inference config")?,
    );

    let registry = Arc::new(ToolRegistry::new());
    registry.register(Arc::new(tools::shell::ShellTool::new(&config.tools.shell)));
    registry.register(Arc::new(tools::code::CodeTool::new()));
    registry.register(Arc::new(tools::web::WebFetchTool::new(&config.tools.web)));
    registry.register(Arc::new(tools::api::ApiTool::new(&config.tools.api)));
    registry.register(Arc::new(tools::git::GitTool::new(&config.tools.git)));
    registry.register(Arc::new(tools::download::DownloadTool::new(
        &config.tools.download,
    )));
    info!(tools = registry.count(), "tool registry ready");

    let executor = Arc::new(ToolExecutor::new(
        Arc::clone(&registry),
        Arc::clone(&permissions),
        Arc::clone(&broker),
        config.tools.max_concurrent,
        Duration::from_secs(config.tools.default_timeout_secs),
        config.tools.max_output_bytes,
    ));

    // Channel adapters.
    let channels = Arc::new(ChannelRouter::new());
    channels.register(TelegramAdapter::new(&config.channels.telegram));
    channels.register(TerminalAdapter::new(&config.channels.terminal));
    channels
        .start_all()
        .await
        .context("failed to start channel adapters")?;

    // The loop itself.
    let memory = Arc::new(InMemoryStore::new());
    let agent = AgentLoop::new(
        Arc::clone(&identity),
        Arc::clone(&lanes),
        Arc::clone(&channels),
        Arc::clone(&executor),
        Arc::clone(&broker),
        memory,
        Arc::new(TaggedJsonParser::new()),
        DEFAULT_PERSONA.to_owned(),
    );
    let readers = agent.run();
    info!(channels = ?channels.names(), "pinky ready");

    // Periodic identity snapshots.
    let identity_for_saver = Arc::clone(&identity);
    let identity_path = std::path::PathBuf::from(config.identity.path.clone());
    let saver = tokio::spawn(async move {
        let mut tick = tokio::time::interval(IDENTITY_SAVE_INTERVAL);
        loop {
            tick.tick().await;
            identity_for_saver.cleanup_expired_codes();
            if let Err(e) = identity_for_saver.save(&identity_path) {
                error!(error = %e, "identity snapshot failed");
            }
        }
    });

    // Run until interrupted.
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown signal received");

    saver.abort();
    for reader in readers {
        reader.abort();
    }
    if let Err(e) = channels.stop_all().await {
        error!(error = %e, "errors while stopping channels");
    }
    executor.shutdown(SHUTDOWN_DRAIN).await;
    broker.shutdown();
    if let Err(e) = identity.save(std::path::Path::new(&config.identity.path)) {
        error!(error = %e, "final identity snapshot failed");
    }

    info!("pinky stopped");
    Ok(())
}

async fn ping() -> Result<()> {
    pinky::logging::init_cli();
    let config = PinkyConfig::load()?;
    let lanes = LaneRouter::load(&config.paths.inference_config)?;

    match lanes.ping().await {
        Ok(()) => {
            let current = lanes
                .get_lane()
                .map(|l| format!("{} ({}/{})", l.name, l.engine, l.model))
                .unwrap_or_else(|| "<none>".to_owned());
            println!("lane reachable: {current}");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn lanes() -> Result<()> {
    pinky::logging::init_cli();
    let config = PinkyConfig::load()?;
    let lanes = LaneRouter::load(&config.paths.inference_config)?;

    let infos = lanes.list_lanes();
    if infos.is_empty() {
        println!("no lanes configured ({})", config.paths.inference_config);
        return Ok(());
    }
    for info in infos {
        let marker = if info.active { "*" } else { " " };
        println!("{marker} {:<12} {:<10} {}", info.name, info.engine.to_string(), info.model);
    }
    Ok(())
}
