//! The overseer: singleton hub owning node capacity and the instance
//! registry.
//!
//! Runs one cooperative event loop over a unified command stream. Nothing
//! else ever touches the registry, so there is no lock around it; instance
//! tasks and the dispatcher talk to the overseer exclusively through
//! [`OverseerHandle`], with oneshot reply channels where a value is
//! needed. A periodic tick emits the node status and stats snapshots.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use davit_core::config::{AgentConfig, DISK_HWM_MB, DISK_LWM_MB, MEM_HWM_MB, MEM_LWM_MB};
use davit_core::frame::{EventFrame, InstanceStat, NodeSummary, StatsPayload, TraceFrame};
use davit_core::instance::{InstanceConfig, RunningState};
use davit_virt::telemetry::Telemetry;
use davit_virt::virtualizer::GuestStats;

use crate::agent::AgentContext;
use crate::instance::{self, Mailbox};

/// Requested resource caps of one instance, and the node-wide sum.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Caps {
    pub vcpus: u32,
    pub memory_mb: i64,
    pub disk_mb: i64,
}

impl Caps {
    pub fn of(config: &InstanceConfig) -> Self {
        Self {
            vcpus: config.vcpus,
            memory_mb: config.memory_mb,
            disk_mb: config.disk_mb,
        }
    }

    fn add(&mut self, other: Self) {
        self.vcpus += other.vcpus;
        self.memory_mb += other.memory_mb;
        self.disk_mb += other.disk_mb;
    }

    /// Subtract, clamping each field at zero. Returns true when clamping
    /// kicked in, which means the books were already wrong.
    fn sub_clamped(&mut self, other: Self) -> bool {
        let clamped = self.vcpus < other.vcpus
            || self.memory_mb < other.memory_mb
            || self.disk_mb < other.disk_mb;
        self.vcpus = self.vcpus.saturating_sub(other.vcpus);
        self.memory_mb = (self.memory_mb - other.memory_mb).max(0);
        self.disk_mb = (self.disk_mb - other.disk_mb).max(0);
        clamped
    }
}

/// Node-level availability at one instant, after capacity accounting.
#[derive(Debug, Clone, Copy)]
pub struct Availability {
    pub disk_mb: i64,
    pub mem_mb: i64,
    pub instances: usize,
    pub max_instances: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Ready,
    Full,
}

/// Ready/full classification against the high-water marks.
pub fn classify(config: &AgentConfig, avail: Availability) -> NodeStatus {
    if avail.instances >= avail.max_instances
        || (config.disk_limit && avail.disk_mb < DISK_HWM_MB)
        || (config.mem_limit && avail.mem_mb < MEM_HWM_MB)
    {
        NodeStatus::Full
    } else {
        NodeStatus::Ready
    }
}

/// Admission check against the low-water marks.
pub fn admits(config: &AgentConfig, avail: Availability, requested: &Caps) -> bool {
    avail.instances < avail.max_instances
        && (!config.disk_limit || avail.disk_mb - requested.disk_mb >= DISK_LWM_MB)
        && (!config.mem_limit || avail.mem_mb - requested.memory_mb >= MEM_LWM_MB)
}

/// Commands accepted on the overseer's unified stream.
#[derive(Debug)]
pub enum OverseerCmd {
    GetInstance {
        instance_id: Uuid,
        reply: oneshot::Sender<Option<InstanceLookup>>,
    },
    Admit {
        config: Box<InstanceConfig>,
        recovered: bool,
        reply: oneshot::Sender<AdmitOutcome>,
    },
    Forget {
        instance_id: Uuid,
    },
    StateChange {
        instance_id: Uuid,
        state: RunningState,
    },
    StatsUpdate {
        instance_id: Uuid,
        stats: GuestStats,
        volumes: Vec<Uuid>,
    },
    StatusTick,
    StatsTick,
    Trace(TraceFrame),
}

#[derive(Debug, Clone)]
pub struct InstanceLookup {
    pub mailbox: Mailbox,
    pub state: RunningState,
}

#[derive(Debug)]
pub enum AdmitOutcome {
    /// A new instance task was created and capacity reserved.
    Admitted(Mailbox),
    /// An instance task with this id already exists.
    Existing(Mailbox),
    /// The node cannot take the instance.
    Full,
    /// Task creation itself failed (instance directory unusable).
    Failed,
}

/// Cheap cloneable front door to the overseer loop.
#[derive(Debug, Clone)]
pub struct OverseerHandle {
    tx: mpsc::UnboundedSender<OverseerCmd>,
}

impl OverseerHandle {
    pub async fn lookup(&self, instance_id: Uuid) -> Option<InstanceLookup> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(OverseerCmd::GetInstance { instance_id, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    pub async fn admit(&self, config: InstanceConfig, recovered: bool) -> AdmitOutcome {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(OverseerCmd::Admit {
                config: Box::new(config),
                recovered,
                reply,
            })
            .is_err()
        {
            return AdmitOutcome::Full;
        }
        rx.await.unwrap_or(AdmitOutcome::Full)
    }

    pub fn forget(&self, instance_id: Uuid) {
        let _ = self.tx.send(OverseerCmd::Forget { instance_id });
    }

    pub fn state_change(&self, instance_id: Uuid, state: RunningState) {
        let _ = self.tx.send(OverseerCmd::StateChange { instance_id, state });
    }

    pub fn stats_update(&self, instance_id: Uuid, stats: GuestStats, volumes: Vec<Uuid>) {
        let _ = self.tx.send(OverseerCmd::StatsUpdate {
            instance_id,
            stats,
            volumes,
        });
    }

    pub fn status_tick(&self) {
        let _ = self.tx.send(OverseerCmd::StatusTick);
    }

    pub fn stats_tick(&self) {
        let _ = self.tx.send(OverseerCmd::StatsTick);
    }

    pub fn trace(&self, frame: TraceFrame) {
        let _ = self.tx.send(OverseerCmd::Trace(frame));
    }
}

/// In-memory record of one admitted instance. Owned by the overseer,
/// never read by instance tasks.
#[derive(Debug)]
struct InstanceRecord {
    mailbox: Mailbox,
    state: RunningState,
    stats: GuestStats,
    caps: Caps,
    ssh_ip: String,
    ssh_port: u32,
    volumes: Vec<Uuid>,
}

pub struct Overseer {
    ctx: Arc<AgentContext>,
    telemetry: Telemetry,
    rx: mpsc::UnboundedReceiver<OverseerCmd>,
    handle: OverseerHandle,
    instances: HashMap<Uuid, InstanceRecord>,
    allocated: Caps,
    trace_buf: Vec<TraceFrame>,
    max_instances: usize,
    /// Wait-group: every instance task holds a clone of the token; the
    /// receiver yields None only when all tasks have exited.
    completions: mpsc::Receiver<()>,
    completion_token: Option<mpsc::Sender<()>>,
    draining: bool,
}

impl Overseer {
    pub fn new(
        ctx: Arc<AgentContext>,
        telemetry: Telemetry,
        max_instances: usize,
    ) -> (Self, OverseerHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (completion_token, completions) = mpsc::channel(1);
        let handle = OverseerHandle { tx };
        let overseer = Self {
            ctx,
            telemetry,
            rx,
            handle: handle.clone(),
            instances: HashMap::new(),
            allocated: Caps::default(),
            trace_buf: Vec::new(),
            max_instances,
            completions,
            completion_token: Some(completion_token),
            draining: false,
        };
        (overseer, handle)
    }

    pub async fn run(mut self) {
        let mut done = self.ctx.done.clone();
        let mut tick = tokio::time::interval(self.ctx.config.stats_period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = done.changed() => break,
                Some(cmd) = self.rx.recv() => self.handle(cmd),
                _ = tick.tick() => self.handle(OverseerCmd::StatsTick),
            }
        }
        self.drain().await;
    }

    /// Shutdown barrier: stop admitting, release the token prototype, and
    /// keep consuming updates until every instance task has exited.
    /// Abandoning the command stream here would leave tasks blocked on
    /// their update sends.
    async fn drain(&mut self) {
        self.draining = true;
        self.completion_token = None;
        info!(instances = self.instances.len(), "Overseer draining");
        loop {
            tokio::select! {
                Some(cmd) = self.rx.recv() => self.handle(cmd),
                res = self.completions.recv() => if res.is_none() { break },
            }
        }
        info!("All instance tasks completed");
    }

    fn handle(&mut self, cmd: OverseerCmd) {
        match cmd {
            OverseerCmd::GetInstance { instance_id, reply } => {
                let lookup = self.instances.get(&instance_id).map(|r| InstanceLookup {
                    mailbox: r.mailbox.clone(),
                    state: r.state,
                });
                let _ = reply.send(lookup);
            }
            OverseerCmd::Admit {
                config,
                recovered,
                reply,
            } => self.handle_admit(*config, recovered, reply),
            OverseerCmd::Forget { instance_id } => self.handle_forget(instance_id),
            OverseerCmd::StateChange { instance_id, state } => {
                if let Some(record) = self.instances.get_mut(&instance_id) {
                    debug!(instance = %instance_id, from = %record.state, to = %state, "State change");
                    record.state = state;
                }
                self.emit_status();
            }
            OverseerCmd::StatsUpdate {
                instance_id,
                stats,
                volumes,
            } => {
                if let Some(record) = self.instances.get_mut(&instance_id) {
                    record.stats = stats;
                    record.volumes = volumes;
                }
            }
            OverseerCmd::StatusTick => self.emit_status(),
            OverseerCmd::StatsTick => self.emit_stats_tick(),
            OverseerCmd::Trace(frame) => self.trace_buf.push(frame),
        }
    }

    fn handle_admit(
        &mut self,
        config: InstanceConfig,
        recovered: bool,
        reply: oneshot::Sender<AdmitOutcome>,
    ) {
        let instance_id = config.instance_id;
        if let Some(record) = self.instances.get(&instance_id) {
            let _ = reply.send(AdmitOutcome::Existing(record.mailbox.clone()));
            return;
        }
        if self.draining {
            let _ = reply.send(AdmitOutcome::Full);
            return;
        }

        let caps = Caps::of(&config);
        let host = self.telemetry.sample();
        let avail = self.availability(&host);
        if !admits(&self.ctx.config, avail, &caps) {
            if recovered {
                // Every persisted directory gets a task back; capacity was
                // already spoken for before the restart.
                warn!(instance = %instance_id, "Recovered instance exceeds capacity, admitting anyway");
            } else {
                debug!(instance = %instance_id, "Admission denied");
                let _ = reply.send(AdmitOutcome::Full);
                return;
            }
        }

        let Some(token) = self.completion_token.clone() else {
            let _ = reply.send(AdmitOutcome::Full);
            return;
        };

        let ssh_ip = config.net.concentrator_ip.clone();
        let ssh_port = config.net.ssh_port;
        let volumes = config.volume_ids();
        match instance::spawn(
            config,
            recovered,
            Arc::clone(&self.ctx),
            self.handle.clone(),
            token,
        ) {
            Ok(mailbox) => {
                self.instances.insert(
                    instance_id,
                    InstanceRecord {
                        mailbox: mailbox.clone(),
                        state: RunningState::Pending,
                        stats: GuestStats::UNKNOWN,
                        caps,
                        ssh_ip,
                        ssh_port,
                        volumes,
                    },
                );
                self.allocated.add(caps);
                info!(instance = %instance_id, recovered, "Instance admitted");
                let _ = reply.send(AdmitOutcome::Admitted(mailbox));
                self.emit_status();
            }
            Err(e) => {
                error!(instance = %instance_id, error = %e, "Failed to create instance task");
                let _ = reply.send(AdmitOutcome::Failed);
            }
        }
    }

    fn handle_forget(&mut self, instance_id: Uuid) {
        let Some(record) = self.instances.remove(&instance_id) else {
            return;
        };
        if self.allocated.sub_clamped(record.caps) {
            warn!(instance = %instance_id, "Capacity accounting clamped below zero");
        }
        self.emit_status();
    }

    /// Recompute availability: host free space plus what admitted
    /// instances actually use (clamped to their caps) minus everything
    /// reserved for them.
    fn availability(&self, host: &NodeSummary) -> Availability {
        let mut used_mem = 0i64;
        let mut used_disk = 0i64;
        for record in self.instances.values() {
            if record.stats.mem_mb >= 0 {
                used_mem += record.stats.mem_mb.min(record.caps.memory_mb);
            }
            if record.stats.disk_mb >= 0 {
                used_disk += record.stats.disk_mb.min(record.caps.disk_mb);
            }
        }
        Availability {
            disk_mb: host.disk_available_mb + used_disk - self.allocated.disk_mb,
            mem_mb: host.mem_available_mb + used_mem - self.allocated.memory_mb,
            instances: self.instances.len(),
            max_instances: self.max_instances,
        }
    }

    fn emit_status(&mut self) {
        let host = self.telemetry.sample();
        let avail = self.availability(&host);
        self.emit_classified(host, avail, false);
    }

    fn emit_stats_tick(&mut self) {
        let host = self.telemetry.sample();
        let avail = self.availability(&host);
        self.emit_classified(host, avail, true);
    }

    fn emit_classified(&mut self, mut host: NodeSummary, avail: Availability, with_stats: bool) {
        host.mem_available_mb = avail.mem_mb.max(0);
        host.disk_available_mb = avail.disk_mb.max(0);

        match classify(&self.ctx.config, avail) {
            NodeStatus::Ready => self.emit(EventFrame::Ready(host.clone())),
            NodeStatus::Full => self.emit(EventFrame::Full),
        }

        if with_stats {
            let mut instances: Vec<InstanceStat> = self
                .instances
                .iter()
                .map(|(id, record)| InstanceStat {
                    instance_uuid: *id,
                    state: record.state,
                    memory_usage_mb: record.stats.mem_mb,
                    disk_usage_mb: record.stats.disk_mb,
                    cpu_usage_pct: record.stats.cpu_pct,
                    ssh_ip: record.ssh_ip.clone(),
                    ssh_port: record.ssh_port,
                    volumes: record.volumes.clone(),
                })
                .collect();
            instances.sort_by_key(|s| s.instance_uuid);
            self.emit(EventFrame::Stats(StatsPayload {
                node: host,
                instances,
            }));

            if !self.trace_buf.is_empty() {
                let frames = std::mem::take(&mut self.trace_buf);
                self.emit(EventFrame::TraceReport(frames));
            }
        }
    }

    fn emit(&self, frame: EventFrame) {
        let _ = self.ctx.outbound.send(frame);
    }
}
