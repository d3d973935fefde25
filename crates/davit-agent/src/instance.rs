//! One supervising task per instance.
//!
//! The task exclusively owns its Virtualizer, its in-memory
//! [`InstanceConfig`], and its on-disk directory. It serializes commands
//! from its mailbox, watches the monitor's connected/closed signals,
//! samples guest resources while connected, and reports every externally
//! observable transition to the overseer. It never calls into the
//! overseer synchronously while holding anything the overseer might be
//! waiting on — all traffic is fire-and-forget messages, and self-removal
//! goes the long way around through the dispatcher (the suicide delete).

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use davit_core::config::STOP_ON_DELETE_TIMEOUT;
use davit_core::error::{AttachError, DeleteError, DetachError, RestartError, StartError, StopError};
use davit_core::frame::{ControlFrame, EventFrame, Inbound};
use davit_core::instance::{InstanceConfig, InstanceKind, RunningState, VolumeConfig};
use davit_core::store;
use davit_virt::network::VnicRequest;
use davit_virt::virtualizer::{Monitor, MonitorCmd, Virtualizer};

use crate::agent::AgentContext;
use crate::overseer::OverseerHandle;

/// Typed commands delivered to an instance task's mailbox.
#[derive(Debug)]
pub enum InstanceCmd {
    Start {
        user_data: String,
        meta_data: String,
        correlation: Uuid,
    },
    Restart {
        correlation: Uuid,
    },
    Stop {
        correlation: Uuid,
    },
    Delete {
        correlation: Uuid,
        migration: bool,
        suicide: bool,
    },
    Attach {
        volume_id: Uuid,
        correlation: Uuid,
    },
    Detach {
        volume_id: Uuid,
        correlation: Uuid,
    },
}

/// Send-only handle to an instance task's command queue.
pub type Mailbox = mpsc::UnboundedSender<InstanceCmd>;

/// Create the instance directory, build the Virtualizer, and spawn the
/// supervising task. Called only from the overseer's admit path.
pub(crate) fn spawn(
    config: InstanceConfig,
    recovered: bool,
    ctx: Arc<AgentContext>,
    overseer: OverseerHandle,
    completion: mpsc::Sender<()>,
) -> anyhow::Result<Mailbox> {
    let dir = store::ensure_dir(&ctx.config.data_root, config.instance_id)?;
    let image_root = ctx.config.data_root.join("images");
    let virt = Virtualizer::select(&config, &dir, &image_root, ctx.config.simulation);

    let (tx, rx) = mpsc::unbounded_channel();
    let task = InstanceTask {
        config,
        dir,
        virt,
        monitor: None,
        state: RunningState::Pending,
        shutting_down: false,
        image_created: recovered,
        ctx,
        overseer,
        rx,
        _completion: completion,
    };
    tokio::spawn(task.run());
    Ok(tx)
}

enum MonitorEvent {
    Connected,
    Closed,
}

struct InstanceTask {
    config: InstanceConfig,
    dir: PathBuf,
    virt: Virtualizer,
    monitor: Option<Monitor>,
    state: RunningState,
    /// Set after a delete was accepted (or a suicide was posted); every
    /// further command fails with its no-instance reason.
    shutting_down: bool,
    /// Whether `create_image` has run for this directory (true from the
    /// start for recovered instances).
    image_created: bool,
    ctx: Arc<AgentContext>,
    overseer: OverseerHandle,
    rx: mpsc::UnboundedReceiver<InstanceCmd>,
    /// Held for the overseer's shutdown barrier; dropped on task exit.
    _completion: mpsc::Sender<()>,
}

impl InstanceTask {
    async fn run(mut self) {
        let instance_id = self.config.instance_id;
        debug!(instance = %instance_id, "Instance task started");

        let mut done = self.ctx.done.clone();
        let mut stats_tick = tokio::time::interval(self.ctx.config.resource_period);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let running = self.state == RunningState::Running;
            tokio::select! {
                _ = done.changed() => {
                    debug!(instance = %instance_id, "Instance task observed shutdown");
                    break;
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle(cmd).await {
                            break;
                        }
                    }
                    None => break,
                },
                event = monitor_event(&mut self.monitor, running) => match event {
                    MonitorEvent::Connected => self.on_connected(),
                    MonitorEvent::Closed => self.on_closed().await,
                },
                _ = stats_tick.tick(), if running => self.push_stats().await,
            }
        }
        debug!(instance = %instance_id, "Instance task exiting");
    }

    /// Handle one command. Returns true when the task must exit.
    async fn handle(&mut self, cmd: InstanceCmd) -> bool {
        match cmd {
            InstanceCmd::Start {
                user_data,
                meta_data,
                correlation,
            } => {
                self.handle_start(&user_data, &meta_data, correlation).await;
                false
            }
            InstanceCmd::Restart { correlation } => {
                self.handle_restart(correlation).await;
                false
            }
            InstanceCmd::Stop { correlation } => {
                self.handle_stop(correlation).await;
                false
            }
            InstanceCmd::Delete {
                correlation,
                migration,
                suicide,
            } => self.handle_delete(correlation, migration, suicide).await,
            InstanceCmd::Attach {
                volume_id,
                correlation,
            } => {
                self.handle_attach(volume_id, correlation).await;
                false
            }
            InstanceCmd::Detach {
                volume_id,
                correlation,
            } => {
                self.handle_detach(volume_id, correlation).await;
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    fn on_connected(&mut self) {
        info!(instance = %self.config.instance_id, "Guest connected");
        self.state = RunningState::Running;
        self.virt.connected();
        self.overseer
            .state_change(self.config.instance_id, RunningState::Running);
    }

    async fn on_closed(&mut self) {
        info!(instance = %self.config.instance_id, "Guest gone");
        self.monitor = None;
        self.virt.lost();
        if self.state != RunningState::Stopped {
            self.state = RunningState::Stopped;
            self.overseer
                .state_change(self.config.instance_id, RunningState::Stopped);
            self.push_stats().await;
        }
    }

    async fn push_stats(&mut self) {
        let stats = self.virt.stats().await;
        self.overseer
            .stats_update(self.config.instance_id, stats, self.config.volume_ids());
    }

    // ------------------------------------------------------------------
    // Start / Restart
    // ------------------------------------------------------------------

    async fn handle_start(&mut self, user_data: &str, meta_data: &str, correlation: Uuid) {
        let instance_id = self.config.instance_id;
        if self.monitor.is_some() {
            self.fail_start(correlation, StartError::AlreadyRunning);
            return;
        }
        if self.shutting_down || self.image_created {
            self.fail_start(correlation, StartError::InstanceExists);
            return;
        }

        if let Err(e) = self.virt.ensure_backing_image().await {
            warn!(instance = %instance_id, error = %e, "Backing image unavailable");
            self.fail_start_fatal(correlation, StartError::ImageFailure);
            return;
        }

        let vnic = match self.ctx.network.create_vnic(&self.vnic_request()).await {
            Ok(vnic) => vnic,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Instance networking failed");
                self.fail_start_fatal(correlation, StartError::NetworkFailure);
                return;
            }
        };

        let bridge = vnic.as_ref().map(|v| v.bridge.as_str());
        if let Err(e) = self.virt.create_image(bridge, user_data, meta_data).await {
            warn!(instance = %instance_id, error = %e, "Image creation failed");
            self.fail_start_fatal(correlation, StartError::ImageFailure);
            return;
        }

        if let Err(e) = store::persist(&self.dir, &self.config) {
            error!(instance = %instance_id, error = %e, "Failed to persist instance state");
            self.fail_start_fatal(correlation, StartError::ImageFailure);
            return;
        }

        match self.launch(vnic.as_ref().map(|v| v.name.as_str())).await {
            Ok(()) => {
                self.image_created = true;
            }
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Launch failed");
                self.fail_start(correlation, StartError::LaunchFailure);
                // The persisted state stays; the instance can be restarted.
                self.image_created = true;
                self.state = RunningState::Stopped;
                self.overseer.state_change(instance_id, RunningState::Stopped);
            }
        }
    }

    async fn handle_restart(&mut self, correlation: Uuid) {
        let instance_id = self.config.instance_id;
        if self.shutting_down {
            self.fail_restart(correlation, RestartError::NoInstance);
            return;
        }
        if self.monitor.is_some() {
            self.fail_restart(correlation, RestartError::AlreadyRunning);
            return;
        }

        // The vnic may be gone after a crash-recovery; recreate it. The
        // networking collaborator reuses a live link.
        let vnic = match self.ctx.network.create_vnic(&self.vnic_request()).await {
            Ok(vnic) => vnic,
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "Instance networking failed on restart");
                self.fail_restart(correlation, RestartError::LaunchFailure);
                return;
            }
        };

        if let Err(e) = self.launch(vnic.as_ref().map(|v| v.name.as_str())).await {
            warn!(instance = %instance_id, error = %e, "Relaunch failed");
            self.fail_restart(correlation, RestartError::LaunchFailure);
        }
    }

    /// Map the boot volume if there is one, launch the guest, and spawn
    /// its monitor.
    async fn launch(&mut self, vnic: Option<&str>) -> anyhow::Result<()> {
        let boot_device = match self.config.bootable_volume() {
            Some(volume) => Some(self.ctx.blockstore.map(volume.volume_id).await?),
            None => None,
        };
        self.virt
            .start(vnic, &self.ctx.node_ip, boot_device.as_deref())
            .await?;
        self.monitor = Some(self.virt.monitor());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Stop / Delete
    // ------------------------------------------------------------------

    async fn handle_stop(&mut self, correlation: Uuid) {
        if self.shutting_down {
            self.fail_stop(correlation, StopError::NoInstance);
            return;
        }
        let Some(monitor) = &self.monitor else {
            self.fail_stop(correlation, StopError::AlreadyStopped);
            return;
        };
        if monitor.control.send(MonitorCmd::Stop).await.is_err() {
            // Monitor went away under us; the closed signal is in flight.
            self.fail_stop(correlation, StopError::AlreadyStopped);
        }
        // Success is observed through the closed signal, not acknowledged.
    }

    async fn handle_delete(&mut self, correlation: Uuid, migration: bool, suicide: bool) -> bool {
        let instance_id = self.config.instance_id;
        if self.shutting_down && !suicide {
            self.emit(EventFrame::DeleteFailure {
                correlation,
                instance_uuid: instance_id,
                reason: DeleteError::NoInstance,
            });
            return false;
        }
        self.shutting_down = true;
        info!(instance = %instance_id, migration, suicide, "Deleting instance");

        if let Some(mut monitor) = self.monitor.take() {
            let _ = monitor.control.send(MonitorCmd::Stop).await;
            // Bounded wait; a guest that will not die does not get to wedge
            // the teardown.
            let _ = tokio::time::timeout(
                STOP_ON_DELETE_TIMEOUT,
                monitor.closed.wait_for(|closed| *closed),
            )
            .await;
            self.virt.lost();
        }

        if let Err(e) = self.virt.delete_image().await {
            warn!(instance = %instance_id, error = %e, "Image removal failed, continuing teardown");
        }

        if let Err(e) = self.ctx.network.destroy_vnic(&self.vnic_request()).await {
            warn!(instance = %instance_id, error = %e, "Vnic teardown failed, continuing");
        }

        // Unmap errors are ignored: another instance on the node may still
        // share the volume mapping.
        for volume_id in self.config.volume_ids() {
            if let Err(e) = self.ctx.blockstore.unmap(volume_id).await {
                debug!(instance = %instance_id, volume = %volume_id, error = %e, "Unmap skipped");
            }
        }

        if let Err(e) = store::remove(&self.dir) {
            warn!(instance = %instance_id, error = %e, "Instance directory removal failed");
        }

        self.emit(if migration {
            EventFrame::InstanceStopped {
                instance_uuid: instance_id,
            }
        } else {
            EventFrame::InstanceDeleted {
                instance_uuid: instance_id,
            }
        });
        self.overseer.forget(instance_id);
        true
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    async fn handle_attach(&mut self, volume_id: Uuid, correlation: Uuid) {
        let instance_id = self.config.instance_id;
        if self.shutting_down {
            self.fail_attach(correlation, volume_id, AttachError::InstanceFailure);
            return;
        }
        if self.config.kind == InstanceKind::Container {
            self.fail_attach(correlation, volume_id, AttachError::NotSupported);
            return;
        }
        if self.config.has_volume(volume_id) {
            self.fail_attach(correlation, volume_id, AttachError::AlreadyAttached);
            return;
        }
        let Some(monitor) = &self.monitor else {
            self.fail_attach(correlation, volume_id, AttachError::InstanceFailure);
            return;
        };

        let device = match self.ctx.blockstore.map(volume_id).await {
            Ok(device) => device,
            Err(e) => {
                warn!(instance = %instance_id, volume = %volume_id, error = %e, "Volume mapping failed");
                self.fail_attach(correlation, volume_id, AttachError::AttachFailure);
                return;
            }
        };

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let delivered = monitor
            .control
            .send(MonitorCmd::Attach {
                volume_id,
                device,
                reply: reply_tx,
            })
            .await
            .is_ok();
        let attached = delivered && matches!(reply_rx.await, Ok(Ok(())));
        if !attached {
            let _ = self.ctx.blockstore.unmap(volume_id).await;
            self.fail_attach(correlation, volume_id, AttachError::AttachFailure);
            return;
        }

        self.config.volumes.push(VolumeConfig {
            volume_id,
            bootable: false,
        });
        if let Err(e) = store::persist(&self.dir, &self.config) {
            error!(instance = %instance_id, error = %e, "Failed to persist volume attach");
            self.config.volumes.pop();
            self.fail_attach(correlation, volume_id, AttachError::StateFailure);
            return;
        }

        info!(instance = %instance_id, volume = %volume_id, "Volume attached");
        self.push_stats().await;
    }

    async fn handle_detach(&mut self, volume_id: Uuid, correlation: Uuid) {
        let instance_id = self.config.instance_id;
        if self.shutting_down {
            self.fail_detach(correlation, volume_id, DetachError::InstanceFailure);
            return;
        }
        if self.config.kind == InstanceKind::Container {
            self.fail_detach(correlation, volume_id, DetachError::NotSupported);
            return;
        }
        let Some(position) = self
            .config
            .volumes
            .iter()
            .position(|v| v.volume_id == volume_id)
        else {
            self.fail_detach(correlation, volume_id, DetachError::NotAttached);
            return;
        };
        if self.config.volumes[position].bootable {
            // The guest is running off this volume.
            self.fail_detach(correlation, volume_id, DetachError::DetachFailure);
            return;
        }
        let Some(monitor) = &self.monitor else {
            self.fail_detach(correlation, volume_id, DetachError::InstanceFailure);
            return;
        };

        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let delivered = monitor
            .control
            .send(MonitorCmd::Detach {
                volume_id,
                reply: reply_tx,
            })
            .await
            .is_ok();
        let detached = delivered && matches!(reply_rx.await, Ok(Ok(())));
        if !detached {
            self.fail_detach(correlation, volume_id, DetachError::DetachFailure);
            return;
        }

        if let Err(e) = self.ctx.blockstore.unmap(volume_id).await {
            debug!(instance = %instance_id, volume = %volume_id, error = %e, "Unmap skipped");
        }

        let removed = self.config.volumes.remove(position);
        if let Err(e) = store::persist(&self.dir, &self.config) {
            error!(instance = %instance_id, error = %e, "Failed to persist volume detach");
            self.config.volumes.insert(position, removed);
            self.fail_detach(correlation, volume_id, DetachError::DetachFailure);
            return;
        }

        info!(instance = %instance_id, volume = %volume_id, "Volume detached");
        self.push_stats().await;
    }

    // ------------------------------------------------------------------
    // Failure plumbing
    // ------------------------------------------------------------------

    fn vnic_request(&self) -> VnicRequest {
        VnicRequest {
            instance_id: self.config.instance_id,
            tenant_id: self.config.tenant_id,
            vnic_id: self.config.net.vnic_id,
            kind: self.config.kind,
            mac: self.config.net.mac.clone(),
            subnet: self.config.net.subnet.clone(),
        }
    }

    fn emit(&self, frame: EventFrame) {
        let _ = self.ctx.outbound.send(frame);
    }

    fn fail_start(&self, correlation: Uuid, reason: StartError) {
        self.emit(EventFrame::StartFailure {
            correlation,
            instance_uuid: self.config.instance_id,
            reason,
        });
    }

    /// A start failed in a way that leaves nothing restartable behind:
    /// report it, then post the self-issued delete through the dispatcher.
    /// Asking the overseer to remove us directly could deadlock against an
    /// overseer blocked forwarding a command.
    fn fail_start_fatal(&mut self, correlation: Uuid, reason: StartError) {
        self.fail_start(correlation, reason);
        self.shutting_down = true;
        let frame = ControlFrame::suicide_delete(self.config.instance_id);
        if self.ctx.inbound.send(Inbound::Command(frame)).is_err() {
            warn!(instance = %self.config.instance_id, "Dispatcher gone, suicide delete dropped");
        }
    }

    fn fail_restart(&self, correlation: Uuid, reason: RestartError) {
        self.emit(EventFrame::RestartFailure {
            correlation,
            instance_uuid: self.config.instance_id,
            reason,
        });
    }

    fn fail_stop(&self, correlation: Uuid, reason: StopError) {
        self.emit(EventFrame::StopFailure {
            correlation,
            instance_uuid: self.config.instance_id,
            reason,
        });
    }

    fn fail_attach(&self, correlation: Uuid, volume_id: Uuid, reason: AttachError) {
        self.emit(EventFrame::AttachVolumeFailure {
            correlation,
            instance_uuid: self.config.instance_id,
            volume_uuid: volume_id,
            reason,
        });
    }

    fn fail_detach(&self, correlation: Uuid, volume_id: Uuid, reason: DetachError) {
        self.emit(EventFrame::DetachVolumeFailure {
            correlation,
            instance_uuid: self.config.instance_id,
            volume_uuid: volume_id,
            reason,
        });
    }
}

/// Wait for the next monitor signal. Pends forever when no monitor is
/// live; while running only the closed signal matters.
async fn monitor_event(monitor: &mut Option<Monitor>, running: bool) -> MonitorEvent {
    let Some(m) = monitor.as_mut() else {
        return std::future::pending().await;
    };
    if running {
        let _ = m.closed.wait_for(|closed| *closed).await;
        MonitorEvent::Closed
    } else {
        tokio::select! {
            res = m.connected.wait_for(|connected| *connected) => match res {
                Ok(_) => MonitorEvent::Connected,
                // Monitor died before the guest ever connected.
                Err(_) => MonitorEvent::Closed,
            },
            _ = m.closed.wait_for(|closed| *closed) => MonitorEvent::Closed,
        }
    }
}
