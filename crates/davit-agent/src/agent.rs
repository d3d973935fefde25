//! Agent assembly: global singletons first, then the overseer, then the
//! recovery scan, then the dispatcher. Shutdown runs the same order in
//! reverse, with a hard ceiling on the drain.

use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use davit_core::config::{AgentConfig, SHUTDOWN_DRAIN_TIMEOUT};
use davit_core::frame::{EventFrame, Inbound};
use davit_core::store;
use davit_virt::blockstore::BlockStore;
use davit_virt::network::{NetworkEvent, NodeNetwork};
use davit_virt::telemetry::{self, Telemetry};
use davit_virt::virtualizer::{ContainerDriver, QemuDriver};

use crate::bounds::{self, Lockfile};
use crate::overseer::{Overseer, OverseerHandle};
use crate::{dispatcher, recovery};

/// Everything shared between the overseer, the dispatcher, and every
/// instance task. Immutable after assembly.
pub struct AgentContext {
    pub config: AgentConfig,
    /// Primary address of this node, handed to drivers and tenant events.
    pub node_ip: String,
    /// Outbound frames toward the control-channel client.
    pub outbound: mpsc::UnboundedSender<EventFrame>,
    /// Inbound stream of the dispatcher; instance tasks post their
    /// suicide deletes here.
    pub inbound: mpsc::UnboundedSender<Inbound>,
    pub network: NodeNetwork,
    pub blockstore: BlockStore,
    /// Global done broadcast observed at every suspension point.
    pub done: watch::Receiver<bool>,
}

/// A running agent. The control-channel client feeds `inbound` and
/// consumes the receiver returned by [`Agent::take_outbound`].
pub struct Agent {
    pub inbound: mpsc::UnboundedSender<Inbound>,
    outbound: Option<mpsc::UnboundedReceiver<EventFrame>>,
    overseer_handle: OverseerHandle,
    done: watch::Sender<bool>,
    overseer_task: JoinHandle<()>,
    dispatcher_task: JoinHandle<()>,
    net_forwarder: Option<JoinHandle<()>>,
    _lock: Option<Lockfile>,
}

impl Agent {
    pub async fn start(mut config: AgentConfig) -> Result<Self> {
        // Singletons before any component: lockfile, directories, fd
        // headroom.
        let lock = if config.simulation {
            None
        } else {
            Some(Lockfile::acquire(&config.data_root.join("davit.lock"))?)
        };
        fs::create_dir_all(store::instances_root(&config.data_root))
            .context("Failed to create instance root")?;
        fs::create_dir_all(config.data_root.join("images"))
            .context("Failed to create image root")?;

        let max_instances = match config.max_instances {
            Some(max) => max,
            None => {
                let soft = bounds::raise_nofile_limit()?;
                let max = bounds::max_instances_for(soft);
                config.max_instances = Some(max);
                max
            }
        };
        info!(max_instances, data_root = %config.data_root.display(), "Agent starting");

        let node = telemetry::node_id(&config.data_root)?;
        let telemetry = Telemetry::new(node, config.data_root.clone());
        let node_ip = telemetry.primary_ip();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = watch::channel(false);

        let (network, net_events) = if config.manage_network {
            let (network, events) = NodeNetwork::linux(node_ip.clone());
            (network, Some(events))
        } else {
            (NodeNetwork::disabled(), None)
        };
        let blockstore = BlockStore::select(
            config.storage_id.as_deref(),
            config.simulation,
            config.data_root.clone(),
        );

        let ctx = Arc::new(AgentContext {
            config: config.clone(),
            node_ip,
            outbound: outbound_tx.clone(),
            inbound: inbound_tx.clone(),
            network,
            blockstore,
            done: done_rx.clone(),
        });

        let (overseer, overseer_handle) = Overseer::new(Arc::clone(&ctx), telemetry, max_instances);
        let overseer_task = tokio::spawn(overseer.run());

        let recovered = recovery::resurrect(&config, &overseer_handle).await;
        if recovered > 0 {
            info!(recovered, "Resurrected persisted instances");
        }

        let dispatcher_task = tokio::spawn(dispatcher::run(
            inbound_rx,
            overseer_handle.clone(),
            outbound_tx.clone(),
            done_rx.clone(),
        ));

        let net_forwarder = net_events.map(|mut events| {
            let outbound = outbound_tx;
            let mut done = done_rx;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = done.changed() => break,
                        event = events.recv() => match event {
                            Some(NetworkEvent::TenantAdded(t)) => {
                                let _ = outbound.send(EventFrame::TenantAdded(t));
                            }
                            Some(NetworkEvent::TenantRemoved(t)) => {
                                let _ = outbound.send(EventFrame::TenantRemoved(t));
                            }
                            None => break,
                        },
                    }
                }
            })
        });

        Ok(Self {
            inbound: inbound_tx,
            outbound: Some(outbound_rx),
            overseer_handle,
            done: done_tx,
            overseer_task,
            dispatcher_task,
            net_forwarder,
            _lock: lock,
        })
    }

    /// Hand the outbound stream to the control-channel client. Single
    /// consumer; callable once.
    pub fn take_outbound(&mut self) -> mpsc::UnboundedReceiver<EventFrame> {
        self.outbound
            .take()
            .expect("outbound stream already taken")
    }

    pub fn overseer(&self) -> &OverseerHandle {
        &self.overseer_handle
    }

    /// Broadcast done and wait for the engine to drain. The overseer gets
    /// a bounded grace period; exceeding it means an instance task is
    /// wedged, and the panic is deliberate so the deadlock surfaces.
    pub async fn shutdown(self) -> Result<()> {
        info!("Broadcasting shutdown");
        let _ = self.done.send(true);

        if tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, self.overseer_task)
            .await
            .is_err()
        {
            panic!(
                "overseer failed to drain within {:?}; an instance task is stuck",
                SHUTDOWN_DRAIN_TIMEOUT
            );
        }
        let _ = self.dispatcher_task.await;
        if let Some(task) = self.net_forwarder {
            let _ = task.await;
        }
        info!("Agent stopped");
        Ok(())
    }
}

/// Daemon entry point: start the agent, run until a signal, shut down.
///
/// The control-channel client is wired up externally; when none is
/// attached, outbound frames are logged at debug level and dropped.
pub async fn run(config: AgentConfig) -> Result<()> {
    let mut agent = Agent::start(config).await?;
    let mut outbound = agent.take_outbound();
    let drain = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            debug!(frame = frame.wire_name(), "Outbound frame (no control session)");
        }
    });

    bounds::shutdown_signal().await;
    agent.shutdown().await?;
    let _ = drain.await;
    Ok(())
}

/// `hard_reset`: terminate every detected instance, tear down davit
/// networking, and leave an empty node behind. Cleanup is best-effort
/// throughout and the command always exits zero.
pub async fn hard_reset(config: &AgentConfig) -> Result<()> {
    info!("Hard reset requested");
    let root = store::instances_root(&config.data_root);
    match fs::read_dir(&root) {
        Ok(entries) => {
            for entry in entries.flatten() {
                let dir = entry.path();
                if !dir.is_dir() {
                    continue;
                }
                QemuDriver::kill_stale(&dir).await;
                ContainerDriver::remove_stale(&dir).await;
                if let Err(e) = fs::remove_dir_all(&dir) {
                    warn!(dir = %dir.display(), error = %e, "Failed to remove instance directory");
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(error = %e, "Failed to enumerate instance directories"),
    }

    if config.manage_network {
        let (network, _events) = NodeNetwork::linux("0.0.0.0".to_string());
        if let Err(e) = network.reset().await {
            warn!(error = %e, "Network reset incomplete");
        }
    }
    info!("Hard reset complete");
    Ok(())
}
