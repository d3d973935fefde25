//! Host networking collaborator.
//!
//! Owns the per-instance network plumbing on the node. VM instances get
//! a tap link enslaved to a per-tenant kernel bridge; container
//! instances get a per-tenant user-defined network on the container
//! daemon instead (the daemon will not accept a raw kernel bridge, and
//! `--ip`/`--mac-address` only work on user-defined networks). Instance
//! tasks call in concurrently, so every mutating operation is serialized
//! behind one internal lock. The collaborator also emits tenant
//! lifecycle events when the first link of a tenant appears on the node
//! or the last one goes away; the agent forwards these upstream
//! untouched.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

use davit_core::frame::TenantEvent;
use davit_core::instance::InstanceKind;

/// Prefix for instance vnic link names. With 12 hex digits appended the
/// name stays within the 15-character interface name limit.
const VNIC_PREFIX: &str = "dv-";

/// Prefix for per-tenant kernel bridge names.
const BRIDGE_PREFIX: &str = "dvbr-";

/// Prefix for per-tenant container daemon networks.
const DAEMON_NET_PREFIX: &str = "dvnet-";

/// What an instance task needs to ask for a vnic.
#[derive(Debug, Clone)]
pub struct VnicRequest {
    pub instance_id: Uuid,
    pub tenant_id: Uuid,
    pub vnic_id: Uuid,
    pub kind: InstanceKind,
    pub mac: String,
    pub subnet: String,
}

/// A materialized attachment point. For VMs `name` is the tap link and
/// `bridge` the kernel bridge it is enslaved to; for containers both
/// name the tenant's daemon network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vnic {
    pub name: String,
    pub bridge: String,
}

pub fn vnic_name(vnic_id: Uuid) -> String {
    let simple = vnic_id.simple().to_string();
    format!("{VNIC_PREFIX}{}", &simple[..12])
}

pub fn bridge_name(tenant_id: Uuid) -> String {
    let simple = tenant_id.simple().to_string();
    format!("{BRIDGE_PREFIX}{}", &simple[..8])
}

pub fn daemon_network_name(tenant_id: Uuid) -> String {
    let simple = tenant_id.simple().to_string();
    format!("{DAEMON_NET_PREFIX}{}", &simple[..8])
}

/// Pure name planning: which attachment point a request lands on. VMs
/// get a tap on the tenant's kernel bridge; containers get the tenant's
/// daemon network for both fields.
pub fn attachment_for(req: &VnicRequest) -> Vnic {
    match req.kind {
        InstanceKind::Vm => Vnic {
            name: vnic_name(req.vnic_id),
            bridge: bridge_name(req.tenant_id),
        },
        InstanceKind::Container => {
            let network = daemon_network_name(req.tenant_id);
            Vnic {
                name: network.clone(),
                bridge: network,
            }
        }
    }
}

/// Tenant lifecycle notifications produced by the collaborator.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    TenantAdded(TenantEvent),
    TenantRemoved(TenantEvent),
}

/// Per-tenant link accounting behind the add/remove event edges.
#[derive(Debug, Default)]
struct TenantBook(HashMap<Uuid, usize>);

impl TenantBook {
    /// Record one more link for a tenant; true when it is the first.
    fn added(&mut self, tenant_id: Uuid) -> bool {
        let count = self.0.entry(tenant_id).or_insert(0);
        *count += 1;
        *count == 1
    }

    /// Record one link gone for a tenant; true when it was the last.
    fn removed(&mut self, tenant_id: Uuid) -> bool {
        match self.0.get_mut(&tenant_id) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => {
                self.0.remove(&tenant_id);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
pub enum NodeNetwork {
    Linux(LinuxNetwork),
    /// Network management switched off by configuration; instances run
    /// without a vnic.
    Disabled,
}

impl NodeNetwork {
    /// Build the Linux driver. Returns the receiver the agent drains for
    /// tenant events.
    pub fn linux(node_ip: String) -> (Self, mpsc::UnboundedReceiver<NetworkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self::Linux(LinuxNetwork {
                node_ip,
                tenants: Mutex::new(TenantBook::default()),
                events,
            }),
            rx,
        )
    }

    pub fn disabled() -> Self {
        Self::Disabled
    }

    /// Create (or reuse) the attachment point for an instance. `None`
    /// when network management is disabled.
    pub async fn create_vnic(&self, req: &VnicRequest) -> Result<Option<Vnic>> {
        match self {
            Self::Linux(net) => net.create_vnic(req).await.map(Some),
            Self::Disabled => Ok(None),
        }
    }

    /// Tear down an instance's attachment point, best-effort on the
    /// links themselves.
    pub async fn destroy_vnic(&self, req: &VnicRequest) -> Result<()> {
        match self {
            Self::Linux(net) => net.destroy_vnic(req).await,
            Self::Disabled => Ok(()),
        }
    }

    /// Hard-reset path: remove every davit-owned link and daemon network
    /// on the node.
    pub async fn reset(&self) -> Result<()> {
        match self {
            Self::Linux(net) => net.reset().await,
            Self::Disabled => Ok(()),
        }
    }
}

#[derive(Debug)]
pub struct LinuxNetwork {
    node_ip: String,
    tenants: Mutex<TenantBook>,
    events: mpsc::UnboundedSender<NetworkEvent>,
}

impl LinuxNetwork {
    async fn create_vnic(&self, req: &VnicRequest) -> Result<Vnic> {
        let mut tenants = self.tenants.lock().await;

        let vnic = attachment_for(req);
        match req.kind {
            InstanceKind::Vm => self.ensure_tap(req, &vnic).await?,
            InstanceKind::Container => self.ensure_daemon_network(req, &vnic).await?,
        }

        if tenants.added(req.tenant_id) {
            let _ = self.events.send(NetworkEvent::TenantAdded(TenantEvent {
                tenant_uuid: req.tenant_id,
                agent_ip: self.node_ip.clone(),
                subnet: req.subnet.clone(),
            }));
        }
        Ok(vnic)
    }

    /// Tap link on the tenant's kernel bridge, for VM instances.
    async fn ensure_tap(&self, req: &VnicRequest, vnic: &Vnic) -> Result<()> {
        let bridge = vnic.bridge.as_str();
        if !link_exists(bridge).await {
            run_ip(&["link", "add", "name", bridge, "type", "bridge"])
                .await
                .with_context(|| format!("Failed to create tenant bridge {bridge}"))?;
            run_ip(&["link", "set", bridge, "up"]).await?;
        }

        let name = vnic.name.as_str();
        if !link_exists(name).await {
            run_ip(&["tuntap", "add", name, "mode", "tap"])
                .await
                .with_context(|| format!("Failed to create vnic {name}"))?;
            run_ip(&["link", "set", name, "master", bridge]).await?;
            run_ip(&["link", "set", name, "up"]).await?;
        } else {
            debug!(vnic = %name, instance = %req.instance_id, "Reusing existing vnic");
        }
        Ok(())
    }

    /// User-defined network on the container daemon, for container
    /// instances. No tap: the daemon wires the container itself.
    async fn ensure_daemon_network(&self, req: &VnicRequest, vnic: &Vnic) -> Result<()> {
        let name = vnic.name.as_str();
        if !daemon_network_exists(name).await {
            run_docker(&[
                "network", "create", "--driver", "bridge", "--subnet", &req.subnet, name,
            ])
            .await
            .with_context(|| format!("Failed to create tenant network {name}"))?;
        } else {
            debug!(network = %name, instance = %req.instance_id, "Reusing tenant network");
        }
        Ok(())
    }

    async fn destroy_vnic(&self, req: &VnicRequest) -> Result<()> {
        let mut tenants = self.tenants.lock().await;

        if req.kind == InstanceKind::Vm {
            let name = vnic_name(req.vnic_id);
            if let Err(e) = run_ip(&["link", "del", &name]).await {
                warn!(vnic = %name, error = %e, "Failed to delete vnic");
            }
        }

        if tenants.removed(req.tenant_id) {
            // Last instance of the tenant on this node: both fabrics go,
            // whichever of them exists.
            let bridge = bridge_name(req.tenant_id);
            if link_exists(&bridge).await {
                if let Err(e) = run_ip(&["link", "del", &bridge]).await {
                    warn!(bridge = %bridge, error = %e, "Failed to delete tenant bridge");
                }
            }
            let network = daemon_network_name(req.tenant_id);
            if daemon_network_exists(&network).await {
                if let Err(e) = run_docker(&["network", "rm", &network]).await {
                    warn!(network = %network, error = %e, "Failed to delete tenant network");
                }
            }
            let _ = self.events.send(NetworkEvent::TenantRemoved(TenantEvent {
                tenant_uuid: req.tenant_id,
                agent_ip: self.node_ip.clone(),
                subnet: req.subnet.clone(),
            }));
        }
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        let mut tenants = self.tenants.lock().await;
        tenants.0.clear();
        for link in davit_links().await? {
            if let Err(e) = run_ip(&["link", "del", &link]).await {
                warn!(link = %link, error = %e, "Failed to delete link during reset");
            }
        }
        for network in davit_daemon_networks().await {
            if let Err(e) = run_docker(&["network", "rm", &network]).await {
                warn!(network = %network, error = %e, "Failed to delete network during reset");
            }
        }
        Ok(())
    }
}

/// Enumerate davit-owned link names (`dv-*` vnics and `dvbr-*` bridges).
async fn davit_links() -> Result<Vec<String>> {
    let out = Command::new("ip")
        .args(["-o", "link", "show"])
        .output()
        .await
        .context("ip link show failed to run")?;
    let text = String::from_utf8_lossy(&out.stdout);
    let mut links = Vec::new();
    for line in text.lines() {
        // Format: "3: dv-abcdef012345@if2: <...>" — the name is field 2.
        let Some(field) = line.split_whitespace().nth(1) else {
            continue;
        };
        let name = field.trim_end_matches(':');
        let name = name.split('@').next().unwrap_or(name);
        if name.starts_with(VNIC_PREFIX) || name.starts_with(BRIDGE_PREFIX) {
            links.push(name.to_string());
        }
    }
    Ok(links)
}

/// Enumerate davit-owned daemon networks, best-effort (an unreachable
/// daemon yields none).
async fn davit_daemon_networks() -> Vec<String> {
    let Ok(out) = Command::new("docker")
        .args(["network", "ls", "--format", "{{.Name}}"])
        .output()
        .await
    else {
        return Vec::new();
    };
    if !out.status.success() {
        return Vec::new();
    }
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .filter(|name| name.starts_with(DAEMON_NET_PREFIX))
        .map(str::to_string)
        .collect()
}

async fn link_exists(name: &str) -> bool {
    Command::new("ip")
        .args(["link", "show", name])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn daemon_network_exists(name: &str) -> bool {
    Command::new("docker")
        .args(["network", "inspect", name])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn run_ip(args: &[&str]) -> Result<()> {
    let out = Command::new("ip").args(args).output().await?;
    if !out.status.success() {
        bail!(
            "ip {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

async fn run_docker(args: &[&str]) -> Result<()> {
    let out = Command::new("docker").args(args).output().await?;
    if !out.status.success() {
        bail!(
            "docker {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&out.stderr).trim()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: InstanceKind) -> VnicRequest {
        VnicRequest {
            instance_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            vnic_id: Uuid::new_v4(),
            kind,
            mac: "02:00:ac:10:00:02".to_string(),
            subnet: "172.16.0.0/24".to_string(),
        }
    }

    #[test]
    fn test_vnic_name_fits_ifname_limit() {
        let name = vnic_name(Uuid::new_v4());
        assert!(name.len() <= 15, "{name} exceeds IFNAMSIZ");
        assert!(name.starts_with("dv-"));
    }

    #[test]
    fn test_bridge_name_fits_ifname_limit() {
        let name = bridge_name(Uuid::new_v4());
        assert!(name.len() <= 15, "{name} exceeds IFNAMSIZ");
        assert!(name.starts_with("dvbr-"));
    }

    #[test]
    fn test_names_are_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(vnic_name(id), vnic_name(id));
        assert_eq!(bridge_name(id), bridge_name(id));
        assert_eq!(daemon_network_name(id), daemon_network_name(id));
    }

    #[test]
    fn test_fabric_names_do_not_collide() {
        let id = Uuid::new_v4();
        let names = [vnic_name(id), bridge_name(id), daemon_network_name(id)];
        assert_ne!(names[0], names[1]);
        assert_ne!(names[1], names[2]);
        assert_ne!(names[0], names[2]);
    }

    #[test]
    fn test_vm_attachment_is_tap_on_tenant_bridge() {
        let req = request(InstanceKind::Vm);
        let vnic = attachment_for(&req);
        assert_eq!(vnic.name, vnic_name(req.vnic_id));
        assert_eq!(vnic.bridge, bridge_name(req.tenant_id));
    }

    #[test]
    fn test_container_attachment_is_daemon_network() {
        let req = request(InstanceKind::Container);
        let vnic = attachment_for(&req);
        // Containers never get a tap; both fields name the tenant's
        // daemon network.
        assert_eq!(vnic.name, daemon_network_name(req.tenant_id));
        assert_eq!(vnic.bridge, vnic.name);
        assert!(!vnic.name.starts_with("dv-"));
        assert!(!vnic.name.starts_with("dvbr-"));
    }

    #[test]
    fn test_same_tenant_kinds_share_event_accounting() {
        let tenant = Uuid::new_v4();
        let mut vm = request(InstanceKind::Vm);
        let mut ct = request(InstanceKind::Container);
        vm.tenant_id = tenant;
        ct.tenant_id = tenant;

        let mut book = TenantBook::default();
        assert!(book.added(vm.tenant_id));
        assert!(!book.added(ct.tenant_id));
        assert!(!book.removed(vm.tenant_id));
        assert!(book.removed(ct.tenant_id));
    }

    #[test]
    fn test_tenant_book_edges() {
        let mut book = TenantBook::default();
        let tenant = Uuid::new_v4();

        // First link of the tenant announces it; further ones are quiet.
        assert!(book.added(tenant));
        assert!(!book.added(tenant));
        assert!(!book.added(tenant));

        // Only the last removal announces the tenant gone.
        assert!(!book.removed(tenant));
        assert!(!book.removed(tenant));
        assert!(book.removed(tenant));

        // Removing for an unknown tenant is a quiet no-op.
        assert!(!book.removed(tenant));
        assert!(!book.removed(Uuid::new_v4()));
    }

    #[test]
    fn test_tenant_book_isolates_tenants() {
        let mut book = TenantBook::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(book.added(a));
        assert!(book.added(b));
        assert!(book.removed(a));
        // Tenant b is untouched by a's removal.
        assert!(book.removed(b));
    }

    #[tokio::test]
    async fn test_disabled_network_yields_no_vnic_for_either_kind() {
        let net = NodeNetwork::disabled();
        for kind in [InstanceKind::Vm, InstanceKind::Container] {
            let req = request(kind);
            assert_eq!(net.create_vnic(&req).await.unwrap(), None);
            net.destroy_vnic(&req).await.unwrap();
        }
        net.reset().await.unwrap();
    }
}
