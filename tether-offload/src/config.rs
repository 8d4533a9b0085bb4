//! YAML configuration parsing and validation.
//!
//! Defines the configuration model for the tether-offload daemon and
//! validates it at load time.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use tether_offload_common::{DEFAULT_BPF_NETD_PATH, STATS_MAP_SIZE};

use crate::bpf::EntryLimits;

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub bpf: BpfConfig,
    #[serde(default)]
    pub offload: OffloadConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

// ---------------------------------------------------------------------------
// BPF Accounting Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct BpfConfig {
    /// Directory the network maps and programs are pinned under.
    #[serde(default = "default_pin_root")]
    pub pin_root: PathBuf,

    /// Cgroup v2 hierarchy root the accounting programs attach to.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,

    /// Marker file the platform BPF loader writes once its programs are
    /// loaded. Bring-up blocks until it exists.
    #[serde(default = "default_platform_marker")]
    pub platform_marker: PathBuf,

    /// Loader command spawned when the network BPF objects have not been
    /// loaded yet. Set to null to disable the automatic start.
    #[serde(default = "default_loader_command")]
    pub loader_command: Option<PathBuf>,

    /// Maximum tagged stats entries a single charged uid may hold.
    #[serde(default = "default_per_uid_entry_limit")]
    pub per_uid_entry_limit: u32,

    /// Maximum tagged stats entries across all uids. Must leave a reserve
    /// below the stats map capacity so untagged per-uid accounting always
    /// has room.
    #[serde(default = "default_total_entry_limit")]
    pub total_entry_limit: u32,

    /// Whether the extended per-socket hook programs (connect, UDP
    /// sendmsg/recvmsg, sockopt, release) are part of the shipped object
    /// set. Implies a kernel recent enough to support them.
    #[serde(default = "default_true")]
    pub extended_socket_hooks: bool,
}

impl Default for BpfConfig {
    fn default() -> Self {
        Self {
            pin_root: default_pin_root(),
            cgroup_root: default_cgroup_root(),
            platform_marker: default_platform_marker(),
            loader_command: default_loader_command(),
            per_uid_entry_limit: default_per_uid_entry_limit(),
            total_entry_limit: default_total_entry_limit(),
            extended_socket_hooks: true,
        }
    }
}

impl BpfConfig {
    pub fn entry_limits(&self) -> EntryLimits {
        EntryLimits {
            per_uid: self.per_uid_entry_limit,
            total: self.total_entry_limit,
        }
    }
}

fn default_pin_root() -> PathBuf {
    PathBuf::from(DEFAULT_BPF_NETD_PATH)
}
fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}
fn default_platform_marker() -> PathBuf {
    PathBuf::from("/sys/fs/bpf/bpf_progs_loaded")
}
fn default_loader_command() -> Option<PathBuf> {
    Some(PathBuf::from("netbpfload"))
}
fn default_per_uid_entry_limit() -> u32 {
    tether_offload_common::PER_UID_STATS_ENTRIES_LIMIT
}
fn default_total_entry_limit() -> u32 {
    tether_offload_common::TOTAL_UID_STATS_ENTRIES_LIMIT
}
fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Offload Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct OffloadConfig {
    /// Whether to negotiate with the hardware offload management process.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// ---------------------------------------------------------------------------
// Metrics Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_bind() -> SocketAddr {
    "127.0.0.1:9090".parse().unwrap()
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from a YAML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| "parsing YAML config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        let bpf = &self.bpf;

        if bpf.per_uid_entry_limit == 0 {
            bail!("bpf.per_uid_entry_limit must be at least 1");
        }
        if bpf.per_uid_entry_limit > bpf.total_entry_limit {
            bail!(
                "bpf.per_uid_entry_limit ({}) exceeds bpf.total_entry_limit ({})",
                bpf.per_uid_entry_limit,
                bpf.total_entry_limit
            );
        }
        if bpf.total_entry_limit + 100 >= STATS_MAP_SIZE {
            bail!(
                "bpf.total_entry_limit ({}) leaves no reserve below the stats map \
                 capacity ({}); untagged accounting would be lost to overflow",
                bpf.total_entry_limit,
                STATS_MAP_SIZE
            );
        }

        if self.metrics.enabled && !self.metrics.path.starts_with('/') {
            bail!("metrics.path must start with '/', got '{}'", self.metrics.path);
        }

        Ok(())
    }
}
