//! The Virtualizer capability set.
//!
//! A Virtualizer is the only surface an instance task uses to act on the
//! host: image preparation, launch, a monitor that reports guest liveness,
//! runtime volume plugging, and resource sampling. Three back-ends exist:
//! QEMU/KVM for VMs, the container daemon for containers, and an in-memory
//! simulator. Every method is called serially from the owning instance
//! task; back-ends hold no shared mutable state.

pub mod container;
pub mod qemu;
pub mod sim;

use std::path::{Path, PathBuf};

use anyhow::Result;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use davit_core::instance::{InstanceConfig, InstanceKind};

pub use container::ContainerDriver;
pub use qemu::QemuDriver;
pub use sim::SimDriver;

/// Commands accepted by a live monitor.
#[derive(Debug)]
pub enum MonitorCmd {
    /// Ask the guest to power down. Confirmation arrives via the closed
    /// signal, not a reply.
    Stop,
    Attach {
        volume_id: Uuid,
        device: PathBuf,
        reply: oneshot::Sender<Result<()>>,
    },
    Detach {
        volume_id: Uuid,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Handle to a back-end's monitor task.
///
/// The monitor flips `connected` to true once the guest is observed live
/// and `closed` to true once it is observed gone; both latch and never
/// revert within one monitor's lifetime.
#[derive(Debug)]
pub struct Monitor {
    pub control: mpsc::Sender<MonitorCmd>,
    pub connected: watch::Receiver<bool>,
    pub closed: watch::Receiver<bool>,
}

/// Channel capacity for monitor control commands. Commands are issued one
/// at a time from the owning instance task.
pub(crate) const MONITOR_CONTROL_DEPTH: usize = 4;

pub(crate) fn monitor_channels() -> (
    mpsc::Receiver<MonitorCmd>,
    watch::Sender<bool>,
    watch::Sender<bool>,
    Monitor,
) {
    let (control_tx, control_rx) = mpsc::channel(MONITOR_CONTROL_DEPTH);
    let (connected_tx, connected_rx) = watch::channel(false);
    let (closed_tx, closed_rx) = watch::channel(false);
    let monitor = Monitor {
        control: control_tx,
        connected: connected_rx,
        closed: closed_rx,
    };
    (control_rx, connected_tx, closed_tx, monitor)
}

/// One resource sample for a guest. `-1` means unknown; zero is a real
/// reading and is never coalesced with unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestStats {
    pub disk_mb: i64,
    pub mem_mb: i64,
    pub cpu_pct: i32,
}

impl GuestStats {
    pub const UNKNOWN: Self = Self {
        disk_mb: -1,
        mem_mb: -1,
        cpu_pct: -1,
    };
}

/// Uniform interface over the VM, container, and simulator back-ends.
#[derive(Debug)]
pub enum Virtualizer {
    Qemu(QemuDriver),
    Container(ContainerDriver),
    Sim(SimDriver),
}

impl Virtualizer {
    /// Pick the back-end for an instance. Simulation mode overrides the
    /// configured kind for every instance on the node.
    pub fn select(
        config: &InstanceConfig,
        instance_dir: &Path,
        image_root: &Path,
        simulation: bool,
    ) -> Self {
        if simulation {
            return Self::Sim(SimDriver::new(config, instance_dir));
        }
        match config.kind {
            InstanceKind::Vm => Self::Qemu(QemuDriver::new(config, instance_dir, image_root)),
            InstanceKind::Container => Self::Container(ContainerDriver::new(config, instance_dir)),
        }
    }

    /// Verify the backing image this instance boots from is present,
    /// fetching it where the back-end can.
    pub async fn ensure_backing_image(&mut self) -> Result<()> {
        match self {
            Self::Qemu(d) => d.ensure_backing_image().await,
            Self::Container(d) => d.ensure_backing_image().await,
            Self::Sim(d) => d.ensure_backing_image(),
        }
    }

    /// Prepare the instance's root filesystem and cloud-init media.
    pub async fn create_image(
        &mut self,
        bridge: Option<&str>,
        user_data: &str,
        meta_data: &str,
    ) -> Result<()> {
        match self {
            Self::Qemu(d) => d.create_image(user_data, meta_data).await,
            Self::Container(d) => d.create_image(bridge).await,
            Self::Sim(d) => d.create_image(),
        }
    }

    /// Remove everything `create_image` produced.
    pub async fn delete_image(&mut self) -> Result<()> {
        match self {
            Self::Qemu(d) => d.delete_image().await,
            Self::Container(d) => d.delete_image().await,
            Self::Sim(d) => d.delete_image(),
        }
    }

    /// Launch the guest.
    pub async fn start(
        &mut self,
        vnic: Option<&str>,
        node_ip: &str,
        boot_device: Option<&Path>,
    ) -> Result<()> {
        match self {
            Self::Qemu(d) => d.start(vnic, boot_device).await,
            Self::Container(d) => d.start(node_ip).await,
            Self::Sim(d) => d.start(),
        }
    }

    /// Spawn the monitor task for a freshly launched guest.
    pub fn monitor(&mut self) -> Monitor {
        match self {
            Self::Qemu(d) => d.monitor(),
            Self::Container(d) => d.monitor(),
            Self::Sim(d) => d.monitor(),
        }
    }

    /// Sample guest resource usage. Never fails; unknown readings are `-1`.
    pub async fn stats(&mut self) -> GuestStats {
        match self {
            Self::Qemu(d) => d.stats().await,
            Self::Container(d) => d.stats().await,
            Self::Sim(d) => d.stats(),
        }
    }

    /// Notification from the instance task that the connected signal fired.
    pub fn connected(&mut self) {
        match self {
            Self::Qemu(d) => d.connected(),
            Self::Container(d) => d.connected(),
            Self::Sim(d) => d.connected(),
        }
    }

    /// Notification from the instance task that the closed signal fired.
    pub fn lost(&mut self) {
        match self {
            Self::Qemu(d) => d.lost(),
            Self::Container(d) => d.lost(),
            Self::Sim(d) => d.lost(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use davit_core::instance::{Firmware, NetConfig};

    pub(crate) fn test_config(kind: InstanceKind) -> InstanceConfig {
        InstanceConfig {
            instance_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            image_ref: "img".to_string(),
            vcpus: 1,
            memory_mb: 128,
            disk_mb: 1024,
            kind,
            firmware: Firmware::Legacy,
            network_node: false,
            net: NetConfig {
                mac: "02:00:ac:10:00:02".to_string(),
                private_ip: "172.16.0.2".to_string(),
                concentrator_ip: "198.51.100.2".to_string(),
                concentrator_id: Uuid::new_v4(),
                subnet: "172.16.0.0/24".to_string(),
                vnic_id: Uuid::new_v4(),
                ssh_port: 33002,
            },
            volumes: vec![],
        }
    }

    #[test]
    fn test_select_by_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let vm = test_config(InstanceKind::Vm);
        let ct = test_config(InstanceKind::Container);

        assert!(matches!(
            Virtualizer::select(&vm, tmp.path(), tmp.path(), false),
            Virtualizer::Qemu(_)
        ));
        assert!(matches!(
            Virtualizer::select(&ct, tmp.path(), tmp.path(), false),
            Virtualizer::Container(_)
        ));
    }

    #[test]
    fn test_simulation_overrides_kind() {
        let tmp = tempfile::tempdir().unwrap();
        for kind in [InstanceKind::Vm, InstanceKind::Container] {
            let cfg = test_config(kind);
            assert!(matches!(
                Virtualizer::select(&cfg, tmp.path(), tmp.path(), true),
                Virtualizer::Sim(_)
            ));
        }
    }

    #[test]
    fn test_unknown_stats_sentinel() {
        let s = GuestStats::UNKNOWN;
        assert_eq!(s.disk_mb, -1);
        assert_eq!(s.mem_mb, -1);
        assert_eq!(s.cpu_pct, -1);
    }
}
