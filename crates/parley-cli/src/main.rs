use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use parley_core::{InboundTurn, TurnOutcome, TurnReport, render_trace};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod wiring;

use config::ParleyConfig;
use wiring::Runtime;

#[derive(Parser)]
#[command(name = "parley")]
#[command(version)]
#[command(about = "Parley: route conversations to the right agent")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory, default config and sample routing
    Init,

    /// Show current configuration (secrets masked)
    Config,

    /// Validate the config and wire the runtime without sending traffic
    Check,

    /// List known channels with their routing
    Channels,

    /// Route a single turn and print the agent's answer
    Route {
        /// Channel the turn arrives on
        #[arg(long)]
        channel: String,

        /// Conversation id; a new one is generated when omitted
        #[arg(long)]
        conversation: Option<String>,

        /// Turn id, for idempotent redelivery
        #[arg(long)]
        turn: Option<String>,

        /// Tenant asserted by the caller
        #[arg(long)]
        tenant: Option<String>,

        /// Turn budget in seconds
        #[arg(long)]
        deadline: Option<u64>,

        /// Print the pipeline states the turn went through
        #[arg(long)]
        trace: bool,

        /// The user's message
        message: String,
    },

    /// Hold an interactive conversation on a channel
    Chat {
        #[arg(long)]
        channel: String,

        #[arg(long)]
        tenant: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Config => cmd_config(&cli.config).await,
        Commands::Check => cmd_check(&cli.config).await,
        Commands::Channels => cmd_channels(&cli.config).await,
        Commands::Route {
            channel,
            conversation,
            turn,
            tenant,
            deadline,
            trace,
            message,
        } => {
            let mut inbound = InboundTurn::new(
                conversation.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                channel,
                message,
            );
            if let Some(turn) = turn {
                inbound = inbound.with_turn_id(turn);
            }
            if let Some(tenant) = tenant {
                inbound = inbound.with_tenant(tenant);
            }
            if let Some(secs) = deadline {
                inbound = inbound.with_deadline(Duration::from_secs(secs));
            }
            cmd_route(&cli.config, inbound, trace).await
        }
        Commands::Chat { channel, tenant } => cmd_chat(&cli.config, &channel, tenant).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        // load() refuses configs readable by group or other
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&config_path, std::fs::Permissions::from_mode(0o600)).await?;
        }
        info!("Created default config at {}", config_path.display());
    }

    let routing_path = config_dir.join("channel-routing.yaml");
    if !routing_path.exists() {
        tokio::fs::write(&routing_path, include_str!("../../../config/channel-routing.yaml")).await?;
        info!("Created sample channel routing at {}", routing_path.display());
    }

    println!("Parley initialized at {}", config_dir.display());
    println!(
        "Edit {} to configure your LLM key, then describe your channels in {}.",
        config_path.display(),
        routing_path.display()
    );
    Ok(())
}

async fn cmd_config(config_path: &Option<PathBuf>) -> Result<()> {
    let config = ParleyConfig::load(config_path)?;
    println!("{:#?}", config);
    Ok(())
}

fn load_runtime(config_path: &Option<PathBuf>) -> Result<Runtime> {
    let config = ParleyConfig::load(config_path)?;
    wiring::build(&config).context("Invalid configuration")
}

async fn cmd_check(config_path: &Option<PathBuf>) -> Result<()> {
    let runtime = load_runtime(config_path)?;
    for line in &runtime.summary {
        println!("  {}", line);
    }
    println!("Configuration OK");
    Ok(())
}

async fn cmd_channels(config_path: &Option<PathBuf>) -> Result<()> {
    let runtime = load_runtime(config_path)?;
    if runtime.known_channels.is_empty() {
        println!("No channels can be listed (channels are resolved through the routing API on demand).");
        return Ok(());
    }

    for id in &runtime.known_channels {
        let tenant = match runtime.channels.lookup(id).await {
            Ok(Some(channel)) => channel.tenant_id,
            Ok(None) => "-".to_string(),
            Err(e) => format!("error: {}", e),
        };
        match runtime.cache().get(id).await {
            Ok(routing) => {
                let agents: Vec<&str> = routing.agents.iter().map(|a| a.id.as_str()).collect();
                println!(
                    "{:<20} tenant={:<12} mode={:<8} agents={}",
                    id,
                    tenant,
                    format!("{:?}", routing.mode).to_uppercase(),
                    agents.join(",")
                );
            }
            Err(e) => println!("{:<20} tenant={:<12} routing unavailable: {}", id, tenant, e),
        }
    }
    Ok(())
}

async fn cmd_route(config_path: &Option<PathBuf>, turn: InboundTurn, show_trace: bool) -> Result<()> {
    let runtime = load_runtime(config_path)?;
    let conversation_id = turn.conversation_id.clone();

    match runtime.handler.handle(turn).await {
        Ok(report) => {
            print_outcome(&report);
            if show_trace {
                println!("trace: {}", render_trace(&report.trace));
            }
            if matches!(report.outcome, TurnOutcome::AwaitingClarification { .. }) {
                println!("(reply with --conversation {})", conversation_id);
            }
            Ok(())
        }
        Err(failure) => {
            if show_trace {
                println!("trace: {}", render_trace(&failure.trace));
            }
            Err(anyhow!("{}: {}", failure.kind(), failure.error))
        }
    }
}

async fn cmd_chat(config_path: &Option<PathBuf>, channel: &str, tenant: Option<String>) -> Result<()> {
    let runtime = load_runtime(config_path)?;
    let cancel = CancellationToken::new();
    let sweeper = runtime.spawn_sweeper(cancel.clone());

    let conversation_id = uuid::Uuid::new_v4().to_string();
    info!("Conversation {} on channel '{}'", conversation_id, channel);
    println!("Chatting on '{}'. Type /quit or press Ctrl+C to leave.", channel);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("you> ");
        std::io::stdout().flush()?;

        let line = tokio::select! {
            _ = signal::ctrl_c() => {
                println!();
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "/quit" {
            break;
        }

        let mut turn = InboundTurn::new(&conversation_id, channel, text);
        if let Some(tenant) = &tenant {
            turn = turn.with_tenant(tenant);
        }
        match runtime.handler.handle(turn).await {
            Ok(report) => print_outcome(&report),
            Err(failure) => println!("!! {}: {}", failure.kind(), failure.error),
        }
    }

    cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!("Sweeper task failed: {}", e);
    }
    let stats = runtime.cache().stats();
    info!(
        "Routing cache: {} hits, {} misses, {} upstream fetches, {} stale served",
        stats.hits, stats.misses, stats.upstream_fetches, stats.stale_served
    );
    Ok(())
}

fn print_outcome(report: &TurnReport) {
    match &report.outcome {
        TurnOutcome::Completed {
            agent_id,
            response,
            fallback,
        } => {
            let note = if *fallback { " (best guess)" } else { "" };
            println!("[{}{}] {}", agent_id, note, response.content);
        }
        TurnOutcome::AwaitingClarification { question, .. } => {
            println!("[parley] {}", question);
        }
        TurnOutcome::Duplicate { turn_id } => {
            println!("(turn {} was already handled)", turn_id);
        }
    }
}
