//! tether-offload: tethering hardware-offload control daemon.
//!
//! Brings up the BPF socket accounting plane (cgroup program attachment
//! plus pinned map lifecycle) and negotiates with the hardware offload
//! management process over a pair of conntrack netlink sockets. The BPF
//! object set itself is loaded at boot by the companion `netbpfload`
//! binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{debug, error, info, warn};

use tether_offload::bpf::BpfHandler;
use tether_offload::config::Config;
use tether_offload::hal::{HalVersion, NatTimeoutUpdate, OffloadHalCallback};
use tether_offload::metrics::{self, MetricsState};
use tether_offload::netd;
use tether_offload::offload::{OffloadHardwareInterface, SystemDependencies};
use tether_offload::platform::PlatformCapabilities;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "tether-offload",
    about = "Tethering hardware-offload control daemon with BPF socket accounting",
    version
)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Offload Callback
// ---------------------------------------------------------------------------

/// Logs management process notifications. The tethering state machine that
/// consumes them lives outside this daemon.
struct LoggingCallback;

impl OffloadHalCallback for LoggingCallback {
    fn on_started(&self) {
        info!("offload started");
    }
    fn on_stopped_error(&self) {
        error!("offload stopped: lower layer error");
    }
    fn on_stopped_unsupported(&self) {
        warn!("offload stopped: current bearer unsupported");
    }
    fn on_support_available(&self) {
        info!("offload support available again");
    }
    fn on_stopped_limit_reached(&self) {
        warn!("offload stopped: data limit reached");
    }
    fn on_warning_reached(&self) {
        warn!("offload data warning reached");
    }
    fn on_nat_timeout_update(&self, update: NatTimeoutUpdate) {
        debug!(?update, "NAT timeout update");
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        "starting tether-offload"
    );

    let config = Config::load(&cli.config).context("loading configuration")?;

    let caps = PlatformCapabilities::detect(config.bpf.extended_socket_hooks);
    info!(
        kernel = ?caps.kernel,
        extended_socket_hooks = caps.extended_socket_hooks,
        "platform capabilities"
    );

    // Deliberately synchronous: nothing else may run before the accounting
    // plane exists.
    let handler = match BpfHandler::init(&config.bpf, &caps) {
        Ok(handler) => handler,
        Err(e) if e.is_fatal() => {
            // A partial cgroup attach set silently corrupts accounting;
            // there is no recovery short of restarting the whole plane.
            error!(error = %e, "fatal BPF bring-up failure, aborting");
            std::process::abort();
        }
        Err(e) => return Err(e).context("BPF bring-up failed"),
    };
    let handler = netd::install(handler).context("BPF handler already installed")?;

    // --- Offload HAL negotiation ---
    let mut offload = OffloadHardwareInterface::new(Box::new(SystemDependencies::new()));
    let hal_version = if config.offload.enabled {
        let version = offload.init_offload(Arc::new(LoggingCallback));
        info!(version = %version, "offload HAL negotiation complete");
        version
    } else {
        info!("hardware offload disabled by configuration");
        HalVersion::None
    };

    // --- Metrics server ---
    let metrics_handle = if config.metrics.enabled {
        let state = MetricsState {
            handler: Some(handler),
            hal_version,
        };
        let metrics_config = config.metrics.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = metrics::serve_metrics(&metrics_config, state).await {
                error!(error = %e, "metrics server error");
            }
        }))
    } else {
        None
    };

    // --- Wait for shutdown signal ---
    info!("tether-offload is running");

    shutdown_signal().await;

    info!("shutdown signal received, cleaning up...");

    if let Some(handle) = metrics_handle {
        handle.abort();
    }
    if config.offload.enabled {
        offload.stop_offload();
    }

    info!("tether-offload stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
