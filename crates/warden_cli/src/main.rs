use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use warden_core::config::LoggingConfig;
use warden_core::{ChannelSink, PlatformEvent, WardenConfig};
use warden_discord::{all_tools, Authorizer, DiscordRest, GatewayClient};
use warden_reasoning::providers::anthropic::AnthropicClient;
use warden_reasoning::{Orchestrator, ReasoningClient, SignalOutcome, ToolRegistry};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML config file (missing file = defaults + env)
    #[arg(short, long, default_value = "warden.toml", env = "WARDEN_CONFIG")]
    config: PathBuf,

    /// Log filter, overrides RUST_LOG (e.g. "info,warden_reasoning=debug")
    #[arg(long)]
    log: Option<String>,

    /// Print the tool catalog with its confirmation and cooldown settings, then exit
    #[arg(long)]
    list_tools: bool,
}

fn init_logging(cfg: &LoggingConfig, filter: Option<&str>) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = match filter {
        Some(f) => EnvFilter::try_new(f).with_context(|| format!("Invalid log filter '{}'", f))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let (file_layer, guard) = match &cfg.dir {
        Some(dir) => {
            let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "warden.log"));
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(cfg.json.then(|| fmt::layer().json()))
        .with((!cfg.json).then(fmt::layer))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(guard)
}

fn build_registry(config: &WardenConfig, rest: Arc<DiscordRest>) -> ToolRegistry {
    let mut registry = ToolRegistry::with_cooldowns(config.cooldowns.clone());
    for tool in all_tools(rest) {
        registry.register(tool);
    }
    registry
}

fn print_catalog(registry: &ToolRegistry) {
    println!("{:<22} {:<12} cooldown", "tool", "confirm");
    for d in registry.descriptors() {
        let cooldown = d
            .cooldown
            .map(|c| format!("{}ms", c.as_millis()))
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<22} {:<12} {}",
            d.name,
            if d.destructive { "required" } else { "-" },
            cooldown
        );
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let config = WardenConfig::load_or_default(&args.config)?;
    let _log_guard = init_logging(&config.logging, args.log.as_deref())?;
    if !args.config.exists() {
        info!("No config file at {}, using defaults and environment", args.config.display());
    }

    let rest = Arc::new(DiscordRest::new(&config.discord)?);
    let registry = build_registry(&config, rest.clone());
    if args.list_tools {
        print_catalog(&registry);
        return Ok(());
    }

    config.validate()?;
    info!("Starting Warden for guild {}", config.discord.guild_id);

    let mut authorizer = Authorizer::new(&config.discord);
    match rest.get_guild().await {
        Ok(guild) => {
            authorizer = authorizer.with_owner(guild.get("owner_id").and_then(|v| v.as_str()));
            if let Some(roles) = guild.get("roles").and_then(|v| v.as_array()) {
                authorizer = authorizer.with_administrator_roles(roles);
            }
        }
        Err(e) => warn!("Could not fetch the guild, trusting configured admins only: {}", e),
    }
    info!(
        "{} tools registered, {} admin roles trusted",
        registry.len(),
        authorizer.admin_role_count()
    );

    let llm = Arc::new(AnthropicClient::new(&config.llm)?);
    info!("Reasoning with {}", llm.model());
    let reasoning = ReasoningClient::from_config(llm, &config.llm, &config.retry);
    let sink: Arc<dyn ChannelSink> = rest.clone();
    let orchestrator = Arc::new(Orchestrator::new(reasoning, Arc::new(registry), sink, &config));

    let mut events = GatewayClient::new(&config.discord, authorizer, rest)?.spawn();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(PlatformEvent::Message(msg)) => {
                    let orchestrator = orchestrator.clone();
                    tokio::spawn(async move {
                        orchestrator.handle_message(&msg).await;
                    });
                }
                Some(PlatformEvent::Interaction(click)) => {
                    match orchestrator.gate().signal(&click) {
                        SignalOutcome::Accepted => {}
                        other => debug!("Button {} from {}: {:?}", click.correlation_id, click.actor_id, other),
                    }
                }
                None => {
                    error!("Gateway stopped; shutting down");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted; shutting down");
                break;
            }
        }
    }

    Ok(())
}
