//! The BlockStore capability set: mapping volumes onto the node.
//!
//! One real driver (Ceph RBD via the `rbd` CLI) and a no-op driver for
//! simulation. Mapping is idempotent: a volume already mapped to the node
//! is reused, never remapped, because another instance on the node may
//! share it.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug)]
pub enum BlockStore {
    Rbd(RbdStore),
    Noop(NoopStore),
}

impl BlockStore {
    /// Pick the driver: RBD when a storage identity is configured and the
    /// node is not simulating, no-op otherwise.
    pub fn select(storage_id: Option<&str>, simulation: bool, data_root: PathBuf) -> Self {
        match storage_id {
            Some(id) if !simulation => Self::Rbd(RbdStore {
                client_id: id.to_string(),
            }),
            _ => Self::Noop(NoopStore { data_root }),
        }
    }

    /// Map a volume to the node and return its device path.
    pub async fn map(&self, volume_id: Uuid) -> Result<PathBuf> {
        match self {
            Self::Rbd(d) => d.map(volume_id).await,
            Self::Noop(d) => d.map(volume_id).await,
        }
    }

    /// Unmap a volume from the node.
    pub async fn unmap(&self, volume_id: Uuid) -> Result<()> {
        match self {
            Self::Rbd(d) => d.unmap(volume_id).await,
            Self::Noop(d) => d.unmap(volume_id).await,
        }
    }
}

/// Ceph RBD driver. `client_id` is the cephx identity this node
/// authenticates with.
#[derive(Debug)]
pub struct RbdStore {
    client_id: String,
}

impl RbdStore {
    async fn map(&self, volume_id: Uuid) -> Result<PathBuf> {
        if let Some(device) = self.existing_mapping(volume_id).await? {
            debug!(volume = %volume_id, device = %device.display(), "Volume already mapped");
            return Ok(device);
        }
        let volume = volume_id.to_string();
        let out = Command::new("rbd")
            .args(["--id", self.client_id.as_str(), "map", volume.as_str()])
            .output()
            .await
            .context("rbd map failed to run")?;
        if !out.status.success() {
            bail!(
                "rbd map {volume_id} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        let device = String::from_utf8_lossy(&out.stdout).trim().to_string();
        if device.is_empty() {
            bail!("rbd map {volume_id} returned no device");
        }
        Ok(PathBuf::from(device))
    }

    async fn unmap(&self, volume_id: Uuid) -> Result<()> {
        let volume = volume_id.to_string();
        let out = Command::new("rbd")
            .args(["--id", self.client_id.as_str(), "unmap", volume.as_str()])
            .output()
            .await
            .context("rbd unmap failed to run")?;
        if !out.status.success() {
            bail!(
                "rbd unmap {volume_id} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(())
    }

    async fn existing_mapping(&self, volume_id: Uuid) -> Result<Option<PathBuf>> {
        let out = Command::new("rbd")
            .args(["--id", self.client_id.as_str(), "showmapped", "--format", "json"])
            .output()
            .await
            .context("rbd showmapped failed to run")?;
        if !out.status.success() {
            // No mappings at all on some versions.
            return Ok(None);
        }
        Ok(parse_showmapped(
            &String::from_utf8_lossy(&out.stdout),
            volume_id,
        ))
    }
}

/// Find the device for a volume in `rbd showmapped --format json` output.
/// Handles both the array and the keyed-object output shapes.
fn parse_showmapped(raw: &str, volume_id: Uuid) -> Option<PathBuf> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let entries: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(map) => map.values().collect(),
        _ => return None,
    };
    for entry in entries {
        let Some(name) = entry.get("name").and_then(|n| n.as_str()) else {
            continue;
        };
        if name == volume_id.to_string() {
            return entry
                .get("device")
                .and_then(|d| d.as_str())
                .map(PathBuf::from);
        }
    }
    None
}

/// Simulation driver: the "device" is a file under the data root.
#[derive(Debug)]
pub struct NoopStore {
    data_root: PathBuf,
}

impl NoopStore {
    async fn map(&self, volume_id: Uuid) -> Result<PathBuf> {
        let dir = self.data_root.join("simvols");
        tokio::fs::create_dir_all(&dir).await?;
        let device = dir.join(volume_id.to_string());
        if !device.exists() {
            tokio::fs::write(&device, b"").await?;
        }
        Ok(device)
    }

    async fn unmap(&self, _volume_id: Uuid) -> Result<()> {
        Ok(())
    }
}
