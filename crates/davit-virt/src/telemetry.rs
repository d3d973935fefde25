//! Node telemetry: the host-level readings behind `ready` and `stats`
//! payloads, collected through sysinfo.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sysinfo::{Disks, Networks, System};
use tracing::warn;
use uuid::Uuid;

use davit_core::frame::{NicSample, NodeSummary};

const MB: u64 = 1024 * 1024;

/// Read or mint the node's persistent identity at `<root>/node_id`.
pub fn node_id(data_root: &Path) -> Result<Uuid> {
    let path = data_root.join("node_id");
    if let Ok(raw) = fs::read_to_string(&path) {
        if let Ok(id) = Uuid::parse_str(raw.trim()) {
            return Ok(id);
        }
        warn!(path = %path.display(), "Replacing unparseable node id");
    }
    let id = Uuid::new_v4();
    fs::create_dir_all(data_root)?;
    fs::write(&path, format!("{id}\n"))
        .with_context(|| format!("Failed to persist node id at {}", path.display()))?;
    Ok(id)
}

/// Collector for node-level resource readings. Holds sysinfo state across
/// ticks so refreshes stay incremental.
pub struct Telemetry {
    node_id: Uuid,
    data_root: PathBuf,
    sys: System,
    disks: Disks,
    networks: Networks,
}

impl std::fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Telemetry")
            .field("node_id", &self.node_id)
            .field("data_root", &self.data_root)
            .finish_non_exhaustive()
    }
}

impl Telemetry {
    pub fn new(node_id: Uuid, data_root: PathBuf) -> Self {
        Self {
            node_id,
            data_root,
            sys: System::new(),
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Take one node-level sample.
    pub fn sample(&mut self) -> NodeSummary {
        self.sys.refresh_memory();
        self.sys.refresh_cpu_all();
        self.disks.refresh(false);
        self.networks.refresh(false);

        let (disk_total_mb, disk_available_mb) = self.data_root_disk();

        NodeSummary {
            node_uuid: self.node_id,
            timestamp: davit_core::time::report_timestamp(),
            mem_total_mb: (self.sys.total_memory() / MB) as i64,
            mem_available_mb: (self.sys.available_memory() / MB) as i64,
            disk_total_mb,
            disk_available_mb,
            load: System::load_average().one,
            cpus_online: self.sys.cpus().len(),
            hostname: System::host_name().unwrap_or_else(|| "unknown".to_string()),
            networks: self.nics(),
        }
    }

    /// First non-loopback IPv4 address of the node, for payloads that
    /// identify the agent by address.
    pub fn primary_ip(&self) -> String {
        for (_, data) in self.networks.iter() {
            for ip in data.ip_networks() {
                if let std::net::IpAddr::V4(v4) = ip.addr {
                    if !v4.is_loopback() {
                        return v4.to_string();
                    }
                }
            }
        }
        "127.0.0.1".to_string()
    }

    /// Total/available space of the filesystem holding the data root,
    /// picked by longest mount-point prefix.
    fn data_root_disk(&self) -> (i64, i64) {
        let mut best: Option<(usize, u64, u64)> = None;
        for disk in self.disks.list() {
            let mount = disk.mount_point();
            if self.data_root.starts_with(mount) {
                let depth = mount.components().count();
                if best.is_none_or(|(d, _, _)| depth > d) {
                    best = Some((depth, disk.total_space(), disk.available_space()));
                }
            }
        }
        match best {
            Some((_, total, available)) => ((total / MB) as i64, (available / MB) as i64),
            None => (-1, -1),
        }
    }

    fn nics(&self) -> Vec<NicSample> {
        let mut nics = Vec::new();
        for (name, data) in self.networks.iter() {
            if name == "lo" {
                continue;
            }
            let mac = data.mac_address().to_string();
            for ip in data.ip_networks() {
                if ip.addr.is_loopback() {
                    continue;
                }
                nics.push(NicSample {
                    ip: ip.addr.to_string(),
                    mac: mac.clone(),
                });
            }
        }
        nics
    }
}
