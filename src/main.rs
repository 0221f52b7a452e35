use agent_metrics::config;
use agent_metrics::data_dir::DataDir;
use agent_metrics::Store;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Inspect the metrics recorded for an autonomous agent loop: global
/// rollups, per-agent profiles, recent delegations and sessions.
#[derive(Parser, Debug)]
#[command(name = "agent-metrics", version, about)]
pub struct Cli {
    /// Data directory holding metrics.json and config.toml
    #[arg(long, global = true, default_value = ".agent-metrics")]
    data_dir: PathBuf,

    /// Config file path (default: <data-dir>/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the data directory and a default config
    Init,
    /// Print the global rollup
    Summary,
    /// List agent profiles, highest XP first
    Agents,
    /// Show one agent profile
    Agent { name: String },
    /// Show the most recent delegation events
    Events {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show one session
    Session { id: String },
    /// Serve the read-only JSON API
    #[cfg(feature = "serve")]
    Serve {
        #[arg(long)]
        bind: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "agent_metrics=debug"
    } else {
        "agent_metrics=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    if let Err(e) = run(cli).await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let dd = DataDir::new(&cli.data_dir);
    let config_path = cli.config.clone().unwrap_or_else(|| dd.config());
    let cfg = config::load_config(&config_path);
    let store = Store::new(cfg.store_path(dd.root()), cfg.project.name.clone())
        .with_caps(cfg.store.max_events, cfg.store.max_sessions);

    match cli.command {
        Command::Init => {
            if dd.ensure_initialized()? {
                println!("initialized {}", dd.root().display());
            } else {
                println!("{} already initialized", dd.root().display());
            }
        }
        Command::Summary => print_json(&store.peek().global_summary())?,
        Command::Agents => print_json(&store.peek().list_agents())?,
        Command::Agent { name } => match store.peek().agent_profile(&name) {
            Some(profile) => print_json(&profile)?,
            None => return Err(format!("no profile for agent {name}").into()),
        },
        Command::Events { limit } => print_json(&store.peek().recent_events(limit))?,
        Command::Session { id } => match store.peek().session(&id) {
            Some(session) => print_json(&session)?,
            None => return Err(format!("no session {id}").into()),
        },
        #[cfg(feature = "serve")]
        Command::Serve { bind, port } => {
            let serve = config::ServeConfig {
                bind: bind.unwrap_or_else(|| cfg.serve.bind.clone()),
                port: port.unwrap_or(cfg.serve.port),
            };
            agent_metrics::serve::run(&serve, store).await?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
