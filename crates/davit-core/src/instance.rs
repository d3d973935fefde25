use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Instance back-end kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    Vm,
    Container,
}

impl std::fmt::Display for InstanceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vm => write!(f, "vm"),
            Self::Container => write!(f, "container"),
        }
    }
}

/// Firmware flavor for VM instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    #[default]
    Legacy,
    Efi,
}

/// Externally observable running state of an instance.
///
/// `Stopped` appears as `exited` on the wire, matching the stats payload
/// vocabulary upstream consumers expect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunningState {
    Pending,
    Running,
    #[serde(rename = "exited")]
    Stopped,
}

impl std::fmt::Display for RunningState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "exited"),
        }
    }
}

/// One attached volume. Unique by `volume_id` within an instance; at most
/// one entry may be bootable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub volume_id: Uuid,
    #[serde(default)]
    pub bootable: bool,
}

/// Per-instance network identity, assigned by the scheduler at admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    pub mac: String,
    pub private_ip: String,
    pub concentrator_ip: String,
    pub concentrator_id: Uuid,
    /// Tenant subnet in CIDR notation, e.g. "172.16.0.0/24".
    pub subnet: String,
    pub vnic_id: Uuid,
    /// Computed SSH forwarding port on the concentrator.
    pub ssh_port: u32,
}

/// Full instance configuration, persisted at `instances/<id>/state`.
///
/// Immutable for the life of the instance except for `volumes`, which is
/// mutated only by the owning instance task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub instance_id: Uuid,
    pub tenant_id: Uuid,
    /// Image reference; empty when booting from a bootable volume.
    #[serde(default)]
    pub image_ref: String,
    pub vcpus: u32,
    pub memory_mb: i64,
    pub disk_mb: i64,
    pub kind: InstanceKind,
    #[serde(default)]
    pub firmware: Firmware,
    #[serde(default)]
    pub network_node: bool,
    pub net: NetConfig,
    #[serde(default)]
    pub volumes: Vec<VolumeConfig>,
}

impl InstanceConfig {
    pub fn has_volume(&self, volume_id: Uuid) -> bool {
        self.volumes.iter().any(|v| v.volume_id == volume_id)
    }

    pub fn bootable_volume(&self) -> Option<&VolumeConfig> {
        self.volumes.iter().find(|v| v.bootable)
    }

    pub fn volume_ids(&self) -> Vec<Uuid> {
        self.volumes.iter().map(|v| v.volume_id).collect()
    }
}

/// Compute the concentrator SSH forwarding port for a private IP.
///
/// The port encodes the last two octets of the instance IP offset from a
/// fixed base, so every instance behind one concentrator gets a distinct
/// port.
pub fn ssh_port_for(private_ip: &str) -> Option<u32> {
    let octets: Vec<u32> = private_ip
        .split('.')
        .map(|o| o.parse().ok())
        .collect::<Option<Vec<u32>>>()?;
    if octets.len() != 4 || octets.iter().any(|&o| o > 255) {
        return None;
    }
    Some(33000 + ((octets[2] << 8) | octets[3]))
}
