//! Container back-end.
//!
//! Drives the node's container daemon through its CLI: the container is
//! created once at image-preparation time and reused across restarts.
//! Liveness is observed by polling the daemon's inspect endpoint; volume
//! hot-plug is not supported for containers.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use davit_core::config::STATS_PROBE_TIMEOUT;
use davit_core::instance::InstanceConfig;

use super::{GuestStats, Monitor, MonitorCmd, monitor_channels};
use crate::proc::{CpuSampler, rss_mb};

const LIVENESS_POLL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub struct ContainerDriver {
    instance_id: Uuid,
    dir: PathBuf,
    image_ref: String,
    memory_mb: i64,
    private_ip: String,
    mac: String,
    cpu: CpuSampler,
}

impl ContainerDriver {
    pub fn new(config: &InstanceConfig, instance_dir: &Path) -> Self {
        Self {
            instance_id: config.instance_id,
            dir: instance_dir.to_path_buf(),
            image_ref: config.image_ref.clone(),
            memory_mb: config.memory_mb,
            private_ip: config.net.private_ip.clone(),
            mac: config.net.mac.clone(),
            cpu: CpuSampler::new(),
        }
    }

    fn id_file(&self) -> PathBuf {
        self.dir.join("docker-id")
    }

    fn container_name(&self) -> String {
        format!("davit-{}", self.instance_id)
    }

    async fn container_id(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string(self.id_file())
            .await
            .with_context(|| format!("No container recorded for {}", self.instance_id))?;
        Ok(raw.trim().to_string())
    }

    pub async fn ensure_backing_image(&mut self) -> Result<()> {
        if inspect_ok("image", &self.image_ref).await {
            return Ok(());
        }
        run_stdout(Command::new("docker").args(["pull", self.image_ref.as_str()]))
            .await
            .with_context(|| format!("Failed to pull image {}", self.image_ref))?;
        Ok(())
    }

    /// Create the container. The bridge, when present, is the name of the
    /// daemon network the networking collaborator materialized for this
    /// tenant subnet.
    pub async fn create_image(&mut self, bridge: Option<&str>) -> Result<()> {
        let mut cmd = Command::new("docker");
        cmd.args(["create", "--name"]).arg(self.container_name());
        cmd.arg("--label")
            .arg(format!("davit.instance={}", self.instance_id));
        cmd.arg("--memory").arg(format!("{}m", self.memory_mb));
        if let Some(net) = bridge {
            cmd.args(["--network", net]);
            cmd.arg("--ip").arg(&self.private_ip);
            cmd.arg("--mac-address").arg(&self.mac);
        }
        cmd.arg(&self.image_ref);

        let container_id = run_stdout(&mut cmd)
            .await
            .context("Container creation failed")?;
        tokio::fs::write(self.id_file(), container_id.trim())
            .await
            .context("Failed to record container id")?;
        Ok(())
    }

    pub async fn delete_image(&mut self) -> Result<()> {
        if let Ok(cid) = self.container_id().await {
            let _ = run_stdout(Command::new("docker").args(["rm", "-f", cid.as_str()])).await;
        }
        match tokio::fs::remove_file(self.id_file()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn start(&mut self, _node_ip: &str) -> Result<()> {
        let cid = self.container_id().await?;
        run_stdout(Command::new("docker").args(["start", cid.as_str()]))
            .await
            .context("Container start failed")?;
        Ok(())
    }

    pub fn monitor(&mut self) -> Monitor {
        let (control_rx, connected_tx, closed_tx, handle) = monitor_channels();
        let instance_id = self.instance_id;
        let name = self.container_name();
        tokio::spawn(async move {
            container_monitor(instance_id, name, control_rx, connected_tx, closed_tx).await;
        });
        handle
    }

    pub async fn stats(&mut self) -> GuestStats {
        let probe = async {
            let cid = self.container_id().await.ok()?;
            let pid = run_stdout(
                Command::new("docker").args(["inspect", "-f", "{{.State.Pid}}", cid.as_str()]),
            )
            .await
            .ok()?
            .trim()
            .parse::<u32>()
            .ok()?;
            let size = run_stdout(
                Command::new("docker").args(["inspect", "--size", "-f", "{{.SizeRw}}", cid.as_str()]),
            )
            .await
            .ok()
            .and_then(|s| s.trim().parse::<i64>().ok());
            Some((pid, size))
        };
        match timeout(STATS_PROBE_TIMEOUT, probe).await {
            Ok(Some((pid, size))) if pid > 0 => GuestStats {
                disk_mb: size.map(|b| b / (1024 * 1024)).unwrap_or(-1),
                mem_mb: rss_mb(pid).unwrap_or(-1),
                cpu_pct: self.cpu.sample(pid),
            },
            _ => {
                self.cpu.reset();
                GuestStats::UNKNOWN
            }
        }
    }

    pub fn connected(&mut self) {
        self.cpu.reset();
    }

    pub fn lost(&mut self) {
        self.cpu.reset();
    }

    /// Hard-reset path: force-remove a leftover container, best-effort.
    pub async fn remove_stale(instance_dir: &Path) {
        if let Ok(raw) = tokio::fs::read_to_string(instance_dir.join("docker-id")).await {
            let cid = raw.trim().to_string();
            if !cid.is_empty() {
                let _ = run_stdout(Command::new("docker").args(["rm", "-f", cid.as_str()])).await;
            }
        }
    }
}

async fn container_monitor(
    instance_id: Uuid,
    name: String,
    mut control: mpsc::Receiver<MonitorCmd>,
    connected: watch::Sender<bool>,
    closed: watch::Sender<bool>,
) {
    let mut seen_running = false;
    loop {
        tokio::select! {
            _ = sleep(LIVENESS_POLL) => {
                match running_state(&name).await {
                    Some(true) => {
                        if !seen_running {
                            debug!(instance = %instance_id, "Container observed running");
                            seen_running = true;
                            let _ = connected.send(true);
                        }
                    }
                    Some(false) if seen_running => {
                        let _ = closed.send(true);
                        break;
                    }
                    Some(false) => {
                        // Not started yet; keep waiting.
                    }
                    None => {
                        // Container vanished or the daemon is unreachable.
                        let _ = closed.send(true);
                        break;
                    }
                }
            }
            cmd = control.recv() => match cmd {
                Some(MonitorCmd::Stop) => {
                    if let Err(e) =
                        run_stdout(Command::new("docker").args(["stop", "-t", "5", name.as_str()])).await
                    {
                        warn!(instance = %instance_id, error = %e, "Container stop failed");
                    }
                }
                Some(MonitorCmd::Attach { reply, .. }) => {
                    let _ = reply.send(Err(anyhow::anyhow!(
                        "volume attach is not supported for containers"
                    )));
                }
                Some(MonitorCmd::Detach { reply, .. }) => {
                    let _ = reply.send(Err(anyhow::anyhow!(
                        "volume detach is not supported for containers"
                    )));
                }
                None => break,
            },
        }
    }
}

async fn running_state(name: &str) -> Option<bool> {
    let out = run_stdout(
        Command::new("docker").args(["inspect", "-f", "{{.State.Running}}", name]),
    )
    .await
    .ok()?;
    match out.trim() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

async fn inspect_ok(kind: &str, name: &str) -> bool {
    Command::new("docker")
        .args([kind, "inspect", name])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn run_stdout(cmd: &mut Command) -> Result<String> {
    let output = cmd.output().await?;
    if !output.status.success() {
        bail!(
            "{:?} exited with {}: {}",
            cmd.as_std().get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use davit_core::instance::InstanceKind;

    #[test]
    fn test_container_name_is_stable() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = crate::virtualizer::tests::test_config(InstanceKind::Container);
        let driver = ContainerDriver::new(&cfg, tmp.path());
        assert_eq!(
            driver.container_name(),
            format!("davit-{}", cfg.instance_id)
        );
    }

    #[tokio::test]
    async fn test_container_id_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = crate::virtualizer::tests::test_config(InstanceKind::Container);
        let driver = ContainerDriver::new(&cfg, tmp.path());
        assert!(driver.container_id().await.is_err());
    }

    #[tokio::test]
    async fn test_container_id_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = crate::virtualizer::tests::test_config(InstanceKind::Container);
        let driver = ContainerDriver::new(&cfg, tmp.path());
        tokio::fs::write(driver.id_file(), "abc123\n").await.unwrap();
        assert_eq!(driver.container_id().await.unwrap(), "abc123");
    }
}
