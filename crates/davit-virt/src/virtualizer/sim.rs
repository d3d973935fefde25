//! Simulator back-end.
//!
//! No processes, no daemons: the guest "connects" as soon as it is
//! started and goes away on stop. A process-wide fault registry lets a
//! harness disconnect a simulated guest from the outside, which is how
//! unexpected-exit paths are exercised without a hypervisor.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use anyhow::Result;
use tokio::sync::mpsc;
use uuid::Uuid;

use davit_core::instance::InstanceConfig;

use super::{GuestStats, Monitor, MonitorCmd, monitor_channels};

/// Faults a harness can inject into a live simulated guest.
#[derive(Debug, Clone, Copy)]
pub enum SimFault {
    /// The guest disappears as if it crashed or powered itself off.
    Disconnect,
}

static FAULTS: OnceLock<Mutex<HashMap<Uuid, mpsc::UnboundedSender<SimFault>>>> = OnceLock::new();

fn faults() -> &'static Mutex<HashMap<Uuid, mpsc::UnboundedSender<SimFault>>> {
    FAULTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Inject a fault into a running simulated instance. Returns false when
/// no live simulator monitor is registered for the id.
pub fn inject_fault(instance_id: Uuid, fault: SimFault) -> bool {
    let registry = faults().lock().expect("fault registry poisoned");
    match registry.get(&instance_id) {
        Some(tx) => tx.send(fault).is_ok(),
        None => false,
    }
}

fn register(instance_id: Uuid) -> mpsc::UnboundedReceiver<SimFault> {
    let (tx, rx) = mpsc::unbounded_channel();
    faults()
        .lock()
        .expect("fault registry poisoned")
        .insert(instance_id, tx);
    rx
}

fn deregister(instance_id: Uuid) {
    faults()
        .lock()
        .expect("fault registry poisoned")
        .remove(&instance_id);
}

#[derive(Debug)]
pub struct SimDriver {
    instance_id: Uuid,
    dir: PathBuf,
    memory_mb: i64,
    started: bool,
}

impl SimDriver {
    pub fn new(config: &InstanceConfig, instance_dir: &Path) -> Self {
        Self {
            instance_id: config.instance_id,
            dir: instance_dir.to_path_buf(),
            memory_mb: config.memory_mb,
            started: false,
        }
    }

    fn marker(&self) -> PathBuf {
        self.dir.join("sim-image")
    }

    pub fn ensure_backing_image(&mut self) -> Result<()> {
        Ok(())
    }

    pub fn create_image(&mut self) -> Result<()> {
        std::fs::write(self.marker(), b"simulated\n")?;
        Ok(())
    }

    pub fn delete_image(&mut self) -> Result<()> {
        match std::fs::remove_file(self.marker()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    pub fn monitor(&mut self) -> Monitor {
        let (control_rx, connected_tx, closed_tx, handle) = monitor_channels();
        let mut fault_rx = register(self.instance_id);
        let instance_id = self.instance_id;
        tokio::spawn(async move {
            let mut control = control_rx;
            // A simulated guest is live the moment it is monitored.
            let _ = connected_tx.send(true);
            loop {
                tokio::select! {
                    cmd = control.recv() => match cmd {
                        Some(MonitorCmd::Stop) => {
                            let _ = closed_tx.send(true);
                            break;
                        }
                        Some(MonitorCmd::Attach { reply, .. }) => {
                            let _ = reply.send(Ok(()));
                        }
                        Some(MonitorCmd::Detach { reply, .. }) => {
                            let _ = reply.send(Ok(()));
                        }
                        None => break,
                    },
                    fault = fault_rx.recv() => match fault {
                        Some(SimFault::Disconnect) => {
                            let _ = closed_tx.send(true);
                            break;
                        }
                        None => break,
                    },
                }
            }
            deregister(instance_id);
        });
        handle
    }

    pub fn stats(&mut self) -> GuestStats {
        if !self.started {
            return GuestStats::UNKNOWN;
        }
        // Deterministic synthetic readings; zero CPU is a real reading,
        // distinct from unknown.
        GuestStats {
            disk_mb: 16,
            mem_mb: self.memory_mb.min(32),
            cpu_pct: 0,
        }
    }

    pub fn connected(&mut self) {}

    pub fn lost(&mut self) {
        self.started = false;
    }
}
