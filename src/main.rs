use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

use evoclaw_escalation::agent::EscalationAgent;
use evoclaw_escalation::config::Config;

/// EvoClaw capability escalation daemon
#[derive(Parser, Debug)]
#[command(name = "evoclaw-escalation", version, about)]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Agent to manage when no config file is given
    #[arg(short, long)]
    id: Option<String>,

    /// Promotion cooldown in seconds (required without a config file)
    #[arg(long)]
    cooldown_secs: Option<u64>,

    /// MQTT broker address (overrides config)
    #[arg(short, long)]
    broker: Option<String>,

    /// MQTT broker port (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Orchestrator API URL (overrides config)
    #[arg(short, long)]
    orchestrator: Option<String>,

    /// Data directory for the transition log (overrides config)
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    let mut config = match (&args.config, &args.id, args.cooldown_secs) {
        (Some(path), _, _) => Config::from_file(path)?,
        (None, Some(id), Some(cooldown)) => Config::default_for_agent(id.clone(), cooldown),
        (None, Some(_), None) => return Err("--cooldown-secs is required without --config".into()),
        (None, None, _) => return Err("either --config or --id must be given".into()),
    };

    if let Some(broker) = &args.broker {
        config.mqtt.broker = broker.clone();
    }
    if let Some(port) = args.port {
        config.mqtt.port = port;
    }
    if let Some(url) = &args.orchestrator {
        config.orchestrator.url = url.clone();
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_dir = dir.clone();
    }
    if let Some(cooldown) = args.cooldown_secs {
        config.escalation.promotion_cooldown_secs = cooldown;
    }
    Ok(config)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!(
        daemon_id = %config.daemon_id,
        broker = %config.mqtt.broker,
        agents = ?config.agents,
        "EvoClaw escalation daemon starting"
    );

    let (agent, eventloop) = EscalationAgent::new(config).await?;
    agent.run(eventloop).await
}
