//! VLAN redirector daemon.
//!
//! Loads the topology file, attaches the XDP redirect program to every input
//! and samples interface and VLAN counters until SIGINT/SIGTERM or a
//! sampling failure. Every exit path detaches all programs first and exits
//! non-zero.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vlanredird::config::{
    DEFAULT_CHART_RANGE_BITS, DEFAULT_CONFIG_PATH, DEFAULT_HISTORY_DEPTH, DEFAULT_INTERVAL_MS,
};
use vlanredird::{
    AppState, LinkControl, NetlinkLinkControl, Scheduler, Settings, StatisticsEngine,
    TopologyFile, XdpEngineLoader, XdpMode,
};

/// VLAN-aware XDP packet redirector
#[derive(Parser, Debug)]
#[command(name = "vlanredird")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Topology file (JSON)
    #[arg(short = 'c', long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Counter deltas kept per interface and VLAN
    #[arg(long, default_value_t = DEFAULT_HISTORY_DEPTH)]
    history: usize,

    /// Sampling interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_INTERVAL_MS)]
    interval_ms: u64,

    /// XDP attach mode
    #[arg(long, value_enum, default_value_t = XdpMode::Skb)]
    xdp_mode: XdpMode,

    /// Vertical resolution of the charts in bits
    #[arg(long, default_value_t = DEFAULT_CHART_RANGE_BITS)]
    chart_range_bits: u32,

    /// Log level (trace, debug, info, warn, error), overridden by RUST_LOG
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn settings(&self) -> Settings {
        Settings {
            history_depth: self.history,
            interval: Duration::from_millis(self.interval_ms),
            chart_range_bits: self.chart_range_bits,
            xdp_mode: self.xdp_mode,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = init_logging(&args.log_level) {
        eprintln!("vlanredird: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!(config = %args.config.display(), "vlanredird: Starting");
    match run(args).await {
        Ok(ticks) => warn!(ticks, "vlanredird: Stopped by signal"),
        Err(e) => error!(error = format!("{:#}", e), "vlanredird: Exiting with error"),
    }
    ExitCode::FAILURE
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber).context("Failed to set logger")
}

/// Loads, attaches and samples until a signal arrives. Returns the number of
/// completed ticks; cleanup has run on every path.
async fn run(args: Args) -> anyhow::Result<u64> {
    let settings = args.settings();
    let desc = TopologyFile::load(&args.config)
        .and_then(|file| file.validate())
        .with_context(|| format!("Invalid topology file {}", args.config.display()))?;

    let link = Arc::new(NetlinkLinkControl::connect().context("Failed to open netlink socket")?);
    let mut engines = XdpEngineLoader::new(settings.xdp_mode);
    let state = AppState::bootstrap(&desc, settings, link.as_ref(), &mut engines)
        .await
        .context("Failed to load topology")?;
    info!(
        inputs = state.topology.inputs().len(),
        outputs = state.topology.outputs().len(),
        mode = %settings.xdp_mode,
        "vlanredird: Topology attached"
    );

    let state = state.into_shared();
    let scheduler = Scheduler::new(
        settings.interval,
        StatisticsEngine::new(settings.chart_range_bits),
    );
    let link: Arc<dyn LinkControl> = link;
    let result = match shutdown_signal() {
        Ok(shutdown) => scheduler.run(state.clone(), link, shutdown).await,
        Err(e) => Err(e.into()),
    };

    state.lock().await.cleanup();
    result.context("Sampling stopped")
}

/// Resolves on the first SIGINT or SIGTERM.
fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => info!("vlanredird: Received SIGINT"),
            _ = sigterm.recv() => info!("vlanredird: Received SIGTERM"),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["vlanredird"]);
        assert_eq!(args.config, PathBuf::from(DEFAULT_CONFIG_PATH));
        assert_eq!(args.settings(), Settings::default());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_override_settings() {
        let args = Args::parse_from([
            "vlanredird",
            "--config",
            "/tmp/topology.json",
            "--history",
            "120",
            "--interval-ms",
            "250",
            "--xdp-mode",
            "driver",
            "--chart-range-bits",
            "5",
        ]);
        let settings = args.settings();
        assert_eq!(settings.history_depth, 120);
        assert_eq!(settings.interval, Duration::from_millis(250));
        assert_eq!(settings.xdp_mode, XdpMode::Driver);
        assert_eq!(settings.chart_range_bits, 5);
    }

    #[test]
    fn test_rejects_unknown_mode() {
        assert!(Args::try_parse_from(["vlanredird", "--xdp-mode", "native"]).is_err());
    }
}
