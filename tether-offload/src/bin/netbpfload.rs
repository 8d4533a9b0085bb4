//! netbpfload: boot-time loader for the network BPF objects.
//!
//! Loads every object under the configured directories, pins maps and
//! programs under the netd pin root and publishes the completion markers
//! the tether-offload daemon blocks on. Meant to run from an init unit
//! before the daemon (the daemon also spawns it on demand when the marker
//! is missing).

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use tether_offload::bpf::loader::{self, LoaderConfig};

#[derive(Parser)]
#[command(
    name = "netbpfload",
    about = "Load and pin the network BPF objects",
    version
)]
struct Cli {
    /// Directory scanned for BPF ELF objects (repeatable).
    #[arg(long = "object-dir", default_values_os_t = vec![PathBuf::from("/etc/tether-offload/bpf")])]
    object_dirs: Vec<PathBuf>,

    /// Directory maps and programs are pinned under.
    #[arg(long, default_value = tether_offload_common::DEFAULT_BPF_NETD_PATH)]
    pin_root: PathBuf,

    /// Additional marker file written after a successful load (repeatable).
    #[arg(long = "marker")]
    markers: Vec<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting netbpfload");

    let config = LoaderConfig {
        object_dirs: cli.object_dirs,
        pin_root: cli.pin_root,
        extra_markers: cli.markers,
    };
    loader::load_all(&config)
}
