//! vray: VPN Session Orchestrator CLI
//!
//! Developer entry point for the orchestrator library. Initializes the
//! global allocator, sets up logging and runs one subcommand.

mod delay;
mod engine;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use vray_vpn::{
    select, BridgeConfig, ConfigTranslator, LatencyGrade, ProxyEngine, ServerList, ServerProbe,
    VpnSettings,
};

use crate::engine::ExternalCore;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "vray")]
#[command(version)]
#[command(about = "Client-side VPN session orchestrator")]
struct Args {
    /// Settings file (TOML or JSON)
    #[arg(short, long, global = true, env = "VRAY_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Translate a connection URI into an engine configuration
    Translate {
        /// Connection URI (vless://...)
        uri: String,

        /// Single-line JSON
        #[arg(long)]
        compact: bool,
    },
    /// Print the native tunnel bridge configuration
    Bridge,
    /// Probe a server list and pick the fastest server
    Probe {
        /// JSON array of {id, name, flag, config}
        servers: PathBuf,

        /// Proxy core binary
        #[arg(long, default_value = "xray", env = "VRAY_CORE")]
        core: PathBuf,

        /// Per-probe timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

fn load_settings(path: Option<&PathBuf>) -> Result<VpnSettings> {
    match path {
        Some(path) => VpnSettings::load(path).with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Ok(VpnSettings::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let settings = load_settings(args.config.as_ref())?;

    match args.command {
        Command::Translate { uri, compact } => {
            let config = ConfigTranslator::from_settings(&settings)
                .translate(&uri)
                .context("Invalid connection URI")?;
            if compact {
                println!("{}", config.to_json());
            } else {
                println!("{}", config.to_json_pretty());
            }
        }
        Command::Bridge => {
            print!("{}", BridgeConfig::from_settings(&settings).to_yaml());
        }
        Command::Probe {
            servers,
            core,
            timeout_ms,
            json,
        } => {
            let list = ServerList::from_json_file(&servers)
                .with_context(|| format!("Failed to read server list {}", servers.display()))?;
            info!("Loaded {} servers", list.len());

            let engine = Arc::new(ExternalCore::new(core, std::env::temp_dir().join("vray")));
            engine.init_env().context("Proxy core unavailable")?;
            let mut probe = ServerProbe::new(engine, &settings);
            if let Some(ms) = timeout_ms {
                probe = probe.with_timeout(Duration::from_millis(ms));
            }

            let results = probe.probe_all(list.as_slice()).await;
            let chosen = select(list.as_slice(), &results);

            if json {
                let report = serde_json::json!({
                    "results": results,
                    "selected": chosen.map(|s| s.id),
                });
                println!("{}", serde_json::to_string_pretty(&report)?);
                return Ok(());
            }

            for server in list.as_slice() {
                let latency = results
                    .get(&server.connection_uri)
                    .copied()
                    .unwrap_or(vray_vpn::Latency::Failed);
                println!(
                    "{:>4}  {:<24} {:>14}  {:?}",
                    server.id,
                    server.name,
                    latency.to_string(),
                    LatencyGrade::of(latency)
                );
            }
            match chosen {
                Some(server) => println!("Selected: {}", server),
                None => println!("No servers to select from"),
            }
        }
    }

    Ok(())
}
