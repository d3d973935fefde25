use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default data root. Instance directories live under `<root>/instances`.
pub const DATA_ROOT_DEFAULT: &str = "/var/lib/davit";

/// Disk/memory watermarks in MB. Admission uses the low-water marks;
/// ready/full classification uses the high-water marks.
pub const DISK_HWM_MB: i64 = 80_000;
pub const DISK_LWM_MB: i64 = 40_000;
pub const MEM_HWM_MB: i64 = 1_000;
pub const MEM_LWM_MB: i64 = 512;

/// Cadence of node status/stats reporting at steady state.
pub const STATS_PERIOD: Duration = Duration::from_secs(6);

/// Cadence of per-instance resource sampling while an instance is connected.
pub const RESOURCE_PERIOD: Duration = Duration::from_secs(30);

/// Ceiling on waiting for a guest to go away after a stop issued during
/// delete. Past this the teardown force-continues.
pub const STOP_ON_DELETE_TIMEOUT: Duration = Duration::from_secs(10);

/// Ceiling on a single per-instance stats probe.
pub const STATS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the top level waits for the overseer to drain after the done
/// broadcast before giving up and panicking.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Runtime configuration for the launcher agent.
///
/// Assembled from CLI flags and cluster configuration at startup, then
/// immutable for the life of the process.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    /// TLS material for the control-channel client (consumed externally).
    pub cert_path: Option<PathBuf>,
    pub cacert_path: Option<PathBuf>,
    /// Create and tear down host networking during start/delete.
    pub manage_network: bool,
    /// Select the simulator back-end and skip the lockfile.
    pub simulation: bool,
    /// Identity handed to the block-storage driver.
    pub storage_id: Option<String>,
    /// Cluster-pushed toggle: when false, skip the disk admission and
    /// readiness checks.
    pub disk_limit: bool,
    /// Cluster-pushed toggle: when false, skip the memory admission and
    /// readiness checks.
    pub mem_limit: bool,
    pub stats_period: Duration,
    pub resource_period: Duration,
    /// Cap on concurrent instances. `None` derives the cap from the
    /// file-descriptor soft limit at startup.
    pub max_instances: Option<usize>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from(DATA_ROOT_DEFAULT),
            cert_path: None,
            cacert_path: None,
            manage_network: false,
            simulation: false,
            storage_id: None,
            disk_limit: true,
            mem_limit: true,
            stats_period: STATS_PERIOD,
            resource_period: RESOURCE_PERIOD,
            max_instances: None,
        }
    }
}

/// Toggles pushed down from cluster configuration. Absent fields keep
/// the agent defaults.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub disk_limit: Option<bool>,
    #[serde(default)]
    pub mem_limit: Option<bool>,
}

impl ClusterConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cluster config {}", path.display()))?;
        serde_yaml::from_str(&raw)
            .with_context(|| format!("Malformed cluster config {}", path.display()))
    }

    /// Fold the overrides into an agent config.
    pub fn apply(self, config: &mut AgentConfig) {
        if let Some(disk_limit) = self.disk_limit {
            config.disk_limit = disk_limit;
        }
        if let Some(mem_limit) = self.mem_limit {
            config.mem_limit = mem_limit;
        }
    }
}
