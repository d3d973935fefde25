//! QEMU/KVM back-end.
//!
//! Boots the instance from a qcow2 overlay on top of a shared backing
//! image (or straight from a mapped bootable volume), feeds cloud-init
//! through a NoCloud seed ISO, and watches the guest over the QMP socket.
//! Volume hot-plug goes through QMP blockdev-add/device_add.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};
use uuid::Uuid;

use davit_core::instance::{Firmware, InstanceConfig};

use super::{GuestStats, Monitor, MonitorCmd, monitor_channels};
use crate::proc::{CpuSampler, rss_mb};

const QMP_CONNECT_ATTEMPTS: u32 = 30;
const QMP_CONNECT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub struct QemuDriver {
    instance_id: Uuid,
    dir: PathBuf,
    image_root: PathBuf,
    image_ref: String,
    vcpus: u32,
    memory_mb: i64,
    mac: String,
    firmware: Firmware,
    cpu: CpuSampler,
}

impl QemuDriver {
    pub fn new(config: &InstanceConfig, instance_dir: &Path, image_root: &Path) -> Self {
        Self {
            instance_id: config.instance_id,
            dir: instance_dir.to_path_buf(),
            image_root: image_root.to_path_buf(),
            image_ref: config.image_ref.clone(),
            vcpus: config.vcpus,
            memory_mb: config.memory_mb,
            mac: config.net.mac.clone(),
            firmware: config.firmware,
            cpu: CpuSampler::new(),
        }
    }

    fn overlay(&self) -> PathBuf {
        self.dir.join("disk.qcow2")
    }

    fn seed_iso(&self) -> PathBuf {
        self.dir.join("seed.iso")
    }

    fn qmp_sock(&self) -> PathBuf {
        self.dir.join("qmp.sock")
    }

    fn pidfile(&self) -> PathBuf {
        self.dir.join("qemu.pid")
    }

    fn backing_image(&self) -> PathBuf {
        self.image_root.join(format!("{}.qcow2", self.image_ref))
    }

    pub async fn ensure_backing_image(&mut self) -> Result<()> {
        if self.image_ref.is_empty() {
            // Booting from a volume; nothing to stage.
            return Ok(());
        }
        let base = self.backing_image();
        if !base.exists() {
            bail!("backing image {} missing", base.display());
        }
        Ok(())
    }

    pub async fn create_image(&mut self, user_data: &str, meta_data: &str) -> Result<()> {
        if !self.image_ref.is_empty() {
            let mut cmd = Command::new("qemu-img");
            cmd.args(["create", "-f", "qcow2", "-b"])
                .arg(self.backing_image())
                .args(["-F", "qcow2"])
                .arg(self.overlay());
            run(&mut cmd).await.context("qemu-img create failed")?;
        }

        let ud = self.dir.join("user-data");
        let md = self.dir.join("meta-data");
        tokio::fs::write(&ud, user_data).await?;
        tokio::fs::write(&md, meta_data).await?;
        let mut cmd = Command::new("genisoimage");
        cmd.arg("-output")
            .arg(self.seed_iso())
            .args(["-volid", "cidata", "-joliet", "-rock"])
            .arg(&ud)
            .arg(&md);
        run(&mut cmd)
            .await
            .context("cloud-init seed image creation failed")?;
        Ok(())
    }

    pub async fn delete_image(&mut self) -> Result<()> {
        for path in [
            self.overlay(),
            self.seed_iso(),
            self.dir.join("user-data"),
            self.dir.join("meta-data"),
        ] {
            remove_if_exists(&path).await?;
        }
        Ok(())
    }

    pub async fn start(&mut self, vnic: Option<&str>, boot_device: Option<&Path>) -> Result<()> {
        // Stale artifacts from a previous boot of this directory confuse
        // both qemu and the monitor.
        remove_if_exists(&self.qmp_sock()).await?;
        remove_if_exists(&self.pidfile()).await?;

        let mut cmd = Command::new("qemu-system-x86_64");
        cmd.arg("-name").arg(format!("davit-{}", self.instance_id));
        cmd.args(["-enable-kvm", "-cpu", "host", "-display", "none", "-vga", "none"]);
        cmd.arg("-m").arg(format!("{}M", self.memory_mb));
        cmd.arg("-smp").arg(self.vcpus.to_string());
        cmd.arg("-daemonize").arg("-pidfile").arg(self.pidfile());
        cmd.arg("-qmp")
            .arg(format!("unix:{},server,nowait", self.qmp_sock().display()));

        if self.firmware == Firmware::Efi {
            cmd.args(["-bios", "/usr/share/OVMF/OVMF_CODE.fd"]);
        }
        if !self.image_ref.is_empty() {
            cmd.arg("-drive").arg(format!(
                "file={},format=qcow2,if=virtio",
                self.overlay().display()
            ));
        }
        if let Some(dev) = boot_device {
            cmd.arg("-drive")
                .arg(format!("file={},format=raw,if=virtio", dev.display()));
        }
        if self.seed_iso().exists() {
            cmd.arg("-cdrom").arg(self.seed_iso());
        }
        match vnic {
            Some(ifname) => {
                cmd.arg("-netdev")
                    .arg(format!("tap,id=net0,ifname={ifname},script=no,downscript=no"));
                cmd.arg("-device")
                    .arg(format!("virtio-net-pci,netdev=net0,mac={}", self.mac));
            }
            None => {
                cmd.args(["-nic", "none"]);
            }
        }

        run(&mut cmd).await.context("qemu launch failed")?;
        Ok(())
    }

    pub fn monitor(&mut self) -> Monitor {
        let (control_rx, connected_tx, closed_tx, handle) = monitor_channels();
        let sock = self.qmp_sock();
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            qmp_monitor(instance_id, sock, control_rx, connected_tx, closed_tx).await;
        });
        handle
    }

    pub async fn stats(&mut self) -> GuestStats {
        let Some(pid) = read_pidfile(&self.pidfile()).await else {
            self.cpu.reset();
            return GuestStats::UNKNOWN;
        };
        let disk_mb = match tokio::fs::metadata(self.overlay()).await {
            Ok(meta) => (meta.len() / (1024 * 1024)) as i64,
            Err(_) => -1,
        };
        GuestStats {
            disk_mb,
            mem_mb: rss_mb(pid).unwrap_or(-1),
            cpu_pct: self.cpu.sample(pid),
        }
    }

    pub fn connected(&mut self) {
        self.cpu.reset();
    }

    pub fn lost(&mut self) {
        self.cpu.reset();
    }

    /// Hard-reset path: kill a leftover qemu by its pidfile, best-effort.
    pub async fn kill_stale(instance_dir: &Path) {
        if let Some(pid) = read_pidfile(&instance_dir.join("qemu.pid")).await {
            // SAFETY: sending a signal to an arbitrary pid is inherently racy
            // but has no memory-safety implications.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }
}

async fn run(cmd: &mut Command) -> Result<()> {
    let output = cmd.output().await?;
    if !output.status.success() {
        bail!(
            "{:?} exited with {}: {}",
            cmd.as_std().get_program(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

async fn read_pidfile(path: &Path) -> Option<u32> {
    let raw = tokio::fs::read_to_string(path).await.ok()?;
    raw.trim().parse().ok()
}

// ============================================================================
// QMP monitor
// ============================================================================

type QmpLines = Lines<BufReader<OwnedReadHalf>>;

async fn qmp_monitor(
    instance_id: Uuid,
    sock: PathBuf,
    mut control: mpsc::Receiver<MonitorCmd>,
    connected: watch::Sender<bool>,
    closed: watch::Sender<bool>,
) {
    let Some(stream) = connect_retry(&sock).await else {
        warn!(instance = %instance_id, "QMP socket never appeared");
        let _ = closed.send(true);
        return;
    };
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    // Greeting, then capability negotiation.
    let greeted = matches!(lines.next_line().await, Ok(Some(_)));
    if !greeted
        || execute(&mut write, &mut lines, json!({"execute": "qmp_capabilities"}))
            .await
            .is_err()
    {
        let _ = closed.send(true);
        return;
    }

    debug!(instance = %instance_id, "QMP session established");
    let _ = connected.send(true);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(_event)) => {
                    // Async events (SHUTDOWN, POWERDOWN, ...) need no action;
                    // the EOF that follows process exit is the real signal.
                }
                Ok(None) | Err(_) => {
                    let _ = closed.send(true);
                    break;
                }
            },
            cmd = control.recv() => match cmd {
                Some(MonitorCmd::Stop) => {
                    if let Err(e) = execute(
                        &mut write,
                        &mut lines,
                        json!({"execute": "system_powerdown"}),
                    )
                    .await
                    {
                        warn!(instance = %instance_id, error = %e, "QMP powerdown failed");
                    }
                }
                Some(MonitorCmd::Attach { volume_id, device, reply }) => {
                    let result = attach_volume(&mut write, &mut lines, volume_id, &device).await;
                    let _ = reply.send(result);
                }
                Some(MonitorCmd::Detach { volume_id, reply }) => {
                    let result = detach_volume(&mut write, &mut lines, volume_id).await;
                    let _ = reply.send(result);
                }
                None => break,
            },
        }
    }
}

async fn connect_retry(sock: &Path) -> Option<UnixStream> {
    for _ in 0..QMP_CONNECT_ATTEMPTS {
        if let Ok(stream) = UnixStream::connect(sock).await {
            return Some(stream);
        }
        sleep(QMP_CONNECT_BACKOFF).await;
    }
    None
}

/// Send one QMP command and wait for its return, skipping interleaved
/// async events.
async fn execute(
    write: &mut OwnedWriteHalf,
    lines: &mut QmpLines,
    cmd: serde_json::Value,
) -> Result<()> {
    let mut buf = cmd.to_string();
    buf.push('\n');
    write.write_all(buf.as_bytes()).await?;
    loop {
        match lines.next_line().await? {
            Some(line) => {
                let Ok(v) = serde_json::from_str::<serde_json::Value>(&line) else {
                    continue;
                };
                if v.get("return").is_some() {
                    return Ok(());
                }
                if let Some(e) = v.get("error") {
                    bail!("QMP error: {e}");
                }
            }
            None => bail!("QMP session closed mid-command"),
        }
    }
}

/// Node and device ids derived from the volume UUID. QMP node-names are
/// capped at 31 characters, so the UUID is truncated.
fn qdev_ids(volume_id: Uuid) -> (String, String) {
    let simple = volume_id.simple().to_string();
    let short = &simple[..12];
    (format!("blk-{short}"), format!("dev-{short}"))
}

async fn attach_volume(
    write: &mut OwnedWriteHalf,
    lines: &mut QmpLines,
    volume_id: Uuid,
    device: &Path,
) -> Result<()> {
    let (node, dev) = qdev_ids(volume_id);
    execute(
        write,
        lines,
        json!({
            "execute": "blockdev-add",
            "arguments": {
                "node-name": node,
                "driver": "raw",
                "file": {"driver": "host_device", "filename": device.display().to_string()},
            }
        }),
    )
    .await?;
    execute(
        write,
        lines,
        json!({
            "execute": "device_add",
            "arguments": {"driver": "virtio-blk-pci", "id": dev, "drive": node},
        }),
    )
    .await
}

async fn detach_volume(
    write: &mut OwnedWriteHalf,
    lines: &mut QmpLines,
    volume_id: Uuid,
) -> Result<()> {
    let (node, dev) = qdev_ids(volume_id);
    execute(
        write,
        lines,
        json!({"execute": "device_del", "arguments": {"id": dev}}),
    )
    .await?;
    execute(
        write,
        lines,
        json!({"execute": "blockdev-del", "arguments": {"node-name": node}}),
    )
    .await
}
