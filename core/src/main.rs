use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use coinjoin_config::CoordinatorTomlConfig;
use coinjoin_coordinator::coinjoin::enforce_phase_timeouts;
use coinjoin_coordinator::config::{
    CoordinatorSettings, node_config_from_toml, parse_network, round_config_from_toml,
};
use coinjoin_coordinator::{Coordinator, FallbackSwitch, RpcNodeClient};
use tokio::signal;
use tracing::{debug, error, info, warn};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(name = "coinjoin-coordinator")]
#[command(about = "Chaumian CoinJoin round coordinator", long_about = None)]
struct Args {
    /// Config file; otherwise CCJ_CONFIG, ./coordinator.toml, ~/.coinjoin/coordinator.toml
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding RsaKey.json and the CoinJoins ledger
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// bitcoin, testnet, signet or regtest
    #[arg(long)]
    network: Option<String>,

    /// How often phase timeouts are checked, in milliseconds
    #[arg(long, default_value = "1000", env = "CCJ_WATCHDOG_INTERVAL_MS")]
    watchdog_interval_ms: u64,

    /// Print a sample config file and exit
    #[arg(long)]
    print_sample_config: bool,
}

fn load_toml(path: Option<&Path>) -> Result<CoordinatorTomlConfig> {
    match path {
        Some(path) => CoordinatorTomlConfig::load_from(path),
        None => CoordinatorTomlConfig::load(),
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "coinjoin_coordinator=info,coinjoin_config=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.print_sample_config {
        println!("{}", CoordinatorTomlConfig::generate_sample());
        return Ok(());
    }

    let toml = load_toml(args.config.as_deref())?;
    let mut settings = CoordinatorSettings::from_toml(&toml)?;
    if let Some(network) = &args.network {
        settings.network = parse_network(network)?;
    }
    if let Some(data_dir) = &args.data_dir {
        settings.data_dir = data_dir.clone();
    }

    info!(
        network = %settings.network,
        data_dir = %settings.data_dir.display(),
        rpc_url = %toml.node.rpc_url,
        "Starting CoinJoin coordinator"
    );

    let node = Arc::new(RpcNodeClient::new(
        node_config_from_toml(&toml.node),
        FallbackSwitch::new(),
    )?);
    let sweep_interval = settings.sweep_interval;
    let coordinator = Coordinator::start(settings, node).await?;
    coordinator.ensure_two_running_rounds().await;

    // Unconfirmed coinjoin sweep
    let sweeper = coordinator.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let reached = sweeper.is_unconfirmed_coinjoin_limit_reached().await;
            debug!(reached, "Unconfirmed coinjoin sweep");
        }
    });

    // Phase timeouts
    let watchdog = coordinator.clone();
    let watchdog_interval = Duration::from_millis(args.watchdog_interval_ms.max(10));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(watchdog_interval);
        loop {
            interval.tick().await;
            let report = enforce_phase_timeouts(&watchdog, Instant::now()).await;
            if report.failed > 0 || report.advanced > 0 {
                info!(
                    failed = report.failed,
                    advanced = report.advanced,
                    "Phase timeouts enforced"
                );
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(reload_on_hangup(coordinator.clone(), args.config.clone()));

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    coordinator.shutdown().await;
    Ok(())
}

/// SIGHUP re-reads the round policy and restarts rounds still collecting
/// inputs so they pick it up.
#[cfg(unix)]
async fn reload_on_hangup(coordinator: Arc<Coordinator>, config_path: Option<PathBuf>) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGHUP, config reload disabled");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        let reloaded =
            load_toml(config_path.as_deref()).and_then(|toml| round_config_from_toml(&toml.round));
        match reloaded {
            Ok(round_config) => {
                coordinator.update_round_config(round_config);
                coordinator.fail_all_rounds_in_input_registration().await;
                info!("Round config reloaded");
            }
            Err(e) => error!(error = %e, "Config reload failed, keeping current round config"),
        }
    }
}
