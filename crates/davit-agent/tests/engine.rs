//! End-to-end engine tests: frames in, frames out, simulator back-end.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use davit_agent::Agent;
use davit_core::config::AgentConfig;
use davit_core::error::{AttachError, DeleteError, DetachError, RestartError, StartError, StopError};
use davit_core::frame::{ControlFrame, EventFrame, Inbound, TraceFrame, WireCommand};
use davit_core::instance::{Firmware, InstanceConfig, InstanceKind, NetConfig, RunningState};
use davit_core::store;
use davit_virt::virtualizer::sim::{SimFault, inject_fault};

const WAIT: Duration = Duration::from_secs(5);

fn test_config(root: &Path) -> AgentConfig {
    AgentConfig {
        data_root: root.to_path_buf(),
        simulation: true,
        manage_network: false,
        disk_limit: false,
        mem_limit: false,
        stats_period: Duration::from_millis(50),
        resource_period: Duration::from_millis(25),
        max_instances: Some(10),
        ..AgentConfig::default()
    }
}

fn start_yaml(instance: Uuid, kind: &str) -> String {
    format!(
        r#"instance_uuid: {instance}
tenant_uuid: 67d86208-b46c-4465-9018-fe14087d415f
image: test-image
kind: {kind}
resources:
  vcpus: 2
  mem_mb: 370
  disk_mb: 8000
network:
  mac: "02:00:ac:10:02:03"
  private_ip: 172.16.2.3
  concentrator_ip: 198.51.100.2
  concentrator_uuid: 67d86208-b46c-4365-9018-fe14087d415f
  subnet: 172.16.2.0/24
  vnic_uuid: {vnic}
user_data: ""
meta_data: ""
"#,
        vnic = Uuid::new_v4(),
    )
}

fn send(agent: &Agent, command: WireCommand, payload: String) -> Uuid {
    let frame = ControlFrame::new(command, payload);
    let correlation = frame.correlation;
    agent
        .inbound
        .send(Inbound::Command(frame))
        .expect("dispatcher gone");
    correlation
}

async fn next_matching<F>(
    outbound: &mut mpsc::UnboundedReceiver<EventFrame>,
    pred: F,
) -> EventFrame
where
    F: Fn(&EventFrame) -> bool,
{
    timeout(WAIT, async {
        loop {
            match outbound.recv().await {
                Some(frame) if pred(&frame) => return frame,
                Some(_) => continue,
                None => panic!("outbound channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Wait for a stats frame where the instance appears in the given state.
async fn wait_instance_state(
    outbound: &mut mpsc::UnboundedReceiver<EventFrame>,
    instance: Uuid,
    state: RunningState,
) -> EventFrame {
    next_matching(outbound, |frame| match frame {
        EventFrame::Stats(stats) => stats
            .instances
            .iter()
            .any(|i| i.instance_uuid == instance && i.state == state),
        _ => false,
    })
    .await
}

async fn start_and_run(
    agent: &Agent,
    outbound: &mut mpsc::UnboundedReceiver<EventFrame>,
    kind: &str,
) -> Uuid {
    let instance = Uuid::new_v4();
    send(agent, WireCommand::Start, start_yaml(instance, kind));
    wait_instance_state(outbound, instance, RunningState::Running).await;
    instance
}

#[tokio::test]
async fn test_admit_and_run() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = Uuid::new_v4();
    send(&agent, WireCommand::Start, start_yaml(instance, "vm"));

    let frame = wait_instance_state(&mut outbound, instance, RunningState::Running).await;
    let EventFrame::Stats(stats) = frame else {
        unreachable!()
    };
    let stat = stats
        .instances
        .iter()
        .find(|i| i.instance_uuid == instance)
        .unwrap();
    assert_eq!(stat.ssh_ip, "198.51.100.2");
    assert_eq!(stat.ssh_port, 33000 + (2 << 8) + 3);
    // Simulator reports real (non-sentinel) readings once sampled.
    assert!(stat.volumes.is_empty());

    // The persisted snapshot landed during start.
    let dir = store::instance_dir(tmp.path(), instance);
    let persisted = store::load(&dir).unwrap();
    assert_eq!(persisted.instance_id, instance);
    assert_eq!(persisted.vcpus, 2);
    assert_eq!(persisted.memory_mb, 370);
    assert_eq!(persisted.disk_mb, 8000);

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_admission_denial_on_zero_capacity() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.max_instances = Some(0);
    let mut agent = Agent::start(config).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = Uuid::new_v4();
    let correlation = send(&agent, WireCommand::Start, start_yaml(instance, "vm"));

    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::StartFailure { .. })
    })
    .await;
    match frame {
        EventFrame::StartFailure {
            correlation: c,
            instance_uuid,
            reason,
        } => {
            assert_eq!(c, correlation);
            assert_eq!(instance_uuid, instance);
            assert_eq!(reason, StartError::FullComputeNode);
        }
        _ => unreachable!(),
    }
    // Nothing was registered.
    assert!(agent.overseer().lookup(instance).await.is_none());

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_admission_boundary_last_slot() {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = test_config(tmp.path());
    config.max_instances = Some(1);
    let mut agent = Agent::start(config).await.unwrap();
    let mut outbound = agent.take_outbound();

    // The slot from max-1 to max succeeds.
    let first = start_and_run(&agent, &mut outbound, "vm").await;
    assert!(agent.overseer().lookup(first).await.is_some());

    // The next START is refused.
    let second = Uuid::new_v4();
    send(&agent, WireCommand::Start, start_yaml(second, "vm"));
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::StartFailure { .. })
    })
    .await;
    match frame {
        EventFrame::StartFailure { reason, .. } => {
            assert_eq!(reason, StartError::FullComputeNode);
        }
        _ => unreachable!(),
    }

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_start_payload_validation() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    send(&agent, WireCommand::Start, "{{{not yaml".to_string());
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::StartFailure { .. })
    })
    .await;
    match frame {
        EventFrame::StartFailure { reason, .. } => {
            assert_eq!(reason, StartError::InvalidPayload);
        }
        _ => unreachable!(),
    }

    let instance = Uuid::new_v4();
    let bad = start_yaml(instance, "zone");
    send(&agent, WireCommand::Start, bad);
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::StartFailure { .. })
    })
    .await;
    match frame {
        EventFrame::StartFailure {
            instance_uuid,
            reason,
            ..
        } => {
            assert_eq!(instance_uuid, instance);
            assert_eq!(reason, StartError::InvalidData);
        }
        _ => unreachable!(),
    }
    assert!(agent.overseer().lookup(instance).await.is_none());

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_duplicate_start_already_running() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = start_and_run(&agent, &mut outbound, "vm").await;
    send(&agent, WireCommand::Start, start_yaml(instance, "vm"));

    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::StartFailure { .. })
    })
    .await;
    match frame {
        EventFrame::StartFailure {
            instance_uuid,
            reason,
            ..
        } => {
            assert_eq!(instance_uuid, instance);
            assert_eq!(reason, StartError::AlreadyRunning);
        }
        _ => unreachable!(),
    }

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_recovery_scan_resurrects_pending() {
    let tmp = tempfile::tempdir().unwrap();
    let instance = Uuid::new_v4();
    let config = InstanceConfig {
        instance_id: instance,
        tenant_id: Uuid::new_v4(),
        image_ref: "test-image".to_string(),
        vcpus: 1,
        memory_mb: 128,
        disk_mb: 1024,
        kind: InstanceKind::Vm,
        firmware: Firmware::Legacy,
        network_node: false,
        net: NetConfig {
            mac: "02:00:ac:10:00:05".to_string(),
            private_ip: "172.16.0.5".to_string(),
            concentrator_ip: "198.51.100.2".to_string(),
            concentrator_id: Uuid::new_v4(),
            subnet: "172.16.0.0/24".to_string(),
            vnic_id: Uuid::new_v4(),
            ssh_port: 33005,
        },
        volumes: vec![],
    };
    let dir = store::ensure_dir(tmp.path(), instance).unwrap();
    store::persist(&dir, &config).unwrap();

    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let frame = wait_instance_state(&mut outbound, instance, RunningState::Pending).await;
    let EventFrame::Stats(stats) = frame else {
        unreachable!()
    };
    let stat = stats
        .instances
        .iter()
        .find(|i| i.instance_uuid == instance)
        .unwrap();
    // Nothing sampled yet: unknown sentinels.
    assert_eq!(stat.memory_usage_mb, -1);
    assert_eq!(stat.disk_usage_mb, -1);
    assert_eq!(stat.cpu_usage_pct, -1);

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_volume_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = start_and_run(&agent, &mut outbound, "vm").await;
    let dir = store::instance_dir(tmp.path(), instance);
    let pristine = std::fs::read(dir.join(store::STATE_FILE)).unwrap();
    let volume = Uuid::new_v4();
    let volume_payload = format!("instance_uuid: {instance}\nvolume_uuid: {volume}\n");

    // Attach: appears in stats and in the persisted snapshot.
    send(&agent, WireCommand::AttachVolume, volume_payload.clone());
    next_matching(&mut outbound, |f| match f {
        EventFrame::Stats(stats) => stats
            .instances
            .iter()
            .any(|i| i.instance_uuid == instance && i.volumes == vec![volume]),
        _ => false,
    })
    .await;
    assert_eq!(store::load(&dir).unwrap().volume_ids(), vec![volume]);

    // Duplicate attach.
    send(&agent, WireCommand::AttachVolume, volume_payload.clone());
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::AttachVolumeFailure { .. })
    })
    .await;
    match frame {
        EventFrame::AttachVolumeFailure {
            volume_uuid,
            reason,
            ..
        } => {
            assert_eq!(volume_uuid, volume);
            assert_eq!(reason, AttachError::AlreadyAttached);
        }
        _ => unreachable!(),
    }

    // Detach: volume list drains and the snapshot reverts byte-for-byte.
    send(&agent, WireCommand::DetachVolume, volume_payload.clone());
    next_matching(&mut outbound, |f| match f {
        EventFrame::Stats(stats) => stats
            .instances
            .iter()
            .any(|i| i.instance_uuid == instance && i.volumes.is_empty()),
        _ => false,
    })
    .await;
    assert_eq!(std::fs::read(dir.join(store::STATE_FILE)).unwrap(), pristine);

    // Detach again.
    send(&agent, WireCommand::DetachVolume, volume_payload);
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::DetachVolumeFailure { .. })
    })
    .await;
    match frame {
        EventFrame::DetachVolumeFailure { reason, .. } => {
            assert_eq!(reason, DetachError::NotAttached);
        }
        _ => unreachable!(),
    }

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_container_attach_not_supported() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = start_and_run(&agent, &mut outbound, "container").await;
    let volume = Uuid::new_v4();
    send(
        &agent,
        WireCommand::AttachVolume,
        format!("instance_uuid: {instance}\nvolume_uuid: {volume}\n"),
    );
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::AttachVolumeFailure { .. })
    })
    .await;
    match frame {
        EventFrame::AttachVolumeFailure { reason, .. } => {
            assert_eq!(reason, AttachError::NotSupported);
        }
        _ => unreachable!(),
    }

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lost_instance_then_delete() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = start_and_run(&agent, &mut outbound, "vm").await;
    assert!(inject_fault(instance, SimFault::Disconnect));

    // The overseer observes the death as a state change, not an error.
    wait_instance_state(&mut outbound, instance, RunningState::Stopped).await;

    send(
        &agent,
        WireCommand::Delete,
        format!("instance_uuid: {instance}\n"),
    );
    next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::InstanceDeleted { instance_uuid } if *instance_uuid == instance)
    })
    .await;

    assert!(agent.overseer().lookup(instance).await.is_none());
    assert!(!store::instance_dir(tmp.path(), instance).exists());

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_migration_delete_reports_stopped() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = start_and_run(&agent, &mut outbound, "vm").await;
    send(
        &agent,
        WireCommand::Delete,
        format!("instance_uuid: {instance}\nmigration: true\n"),
    );
    next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::InstanceStopped { instance_uuid } if *instance_uuid == instance)
    })
    .await;

    // Capacity released: the registry no longer knows the instance.
    assert!(agent.overseer().lookup(instance).await.is_none());

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_delete_before_connected_does_not_deadlock() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = Uuid::new_v4();
    send(&agent, WireCommand::Start, start_yaml(instance, "vm"));
    send(
        &agent,
        WireCommand::Delete,
        format!("instance_uuid: {instance}\n"),
    );

    next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::InstanceDeleted { instance_uuid } if *instance_uuid == instance)
    })
    .await;

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_stop_restart_cycle() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let instance = start_and_run(&agent, &mut outbound, "vm").await;
    let instance_payload = format!("instance_uuid: {instance}\n");

    // Restart while running is refused.
    send(&agent, WireCommand::Restart, instance_payload.clone());
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::RestartFailure { .. })
    })
    .await;
    match frame {
        EventFrame::RestartFailure { reason, .. } => {
            assert_eq!(reason, RestartError::AlreadyRunning);
        }
        _ => unreachable!(),
    }

    // Stop: observed through the state machine.
    send(&agent, WireCommand::Stop, instance_payload.clone());
    wait_instance_state(&mut outbound, instance, RunningState::Stopped).await;

    // Stop again: already stopped.
    send(&agent, WireCommand::Stop, instance_payload.clone());
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::StopFailure { .. })
    })
    .await;
    match frame {
        EventFrame::StopFailure { reason, .. } => {
            assert_eq!(reason, StopError::AlreadyStopped);
        }
        _ => unreachable!(),
    }

    // Restart brings it back.
    send(&agent, WireCommand::Restart, instance_payload);
    wait_instance_state(&mut outbound, instance, RunningState::Running).await;

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_instance_failures() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let unknown = Uuid::new_v4();
    let instance_payload = format!("instance_uuid: {unknown}\n");

    send(&agent, WireCommand::Stop, instance_payload.clone());
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::StopFailure { .. })
    })
    .await;
    match frame {
        EventFrame::StopFailure {
            instance_uuid,
            reason,
            ..
        } => {
            assert_eq!(instance_uuid, unknown);
            assert_eq!(reason, StopError::NoInstance);
        }
        _ => unreachable!(),
    }

    send(&agent, WireCommand::Restart, instance_payload.clone());
    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::RestartFailure { .. })
    })
    .await;
    match frame {
        EventFrame::RestartFailure { reason, .. } => {
            assert_eq!(reason, RestartError::NoInstance);
        }
        _ => unreachable!(),
    }

    // Duplicate delete of an unknown instance: a no-op with a failure
    // frame and no side effects.
    for _ in 0..2 {
        send(&agent, WireCommand::Delete, instance_payload.clone());
        let frame = next_matching(&mut outbound, |f| {
            matches!(f, EventFrame::DeleteFailure { .. })
        })
        .await;
        match frame {
            EventFrame::DeleteFailure { reason, .. } => {
                assert_eq!(reason, DeleteError::NoInstance);
            }
            _ => unreachable!(),
        }
    }
    assert!(!store::instance_dir(tmp.path(), unknown).exists());

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_trace_frames_batched_into_report() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    for n in 0..3 {
        agent
            .inbound
            .send(Inbound::Trace(TraceFrame {
                label: format!("span-{n}"),
                body: "{}".to_string(),
            }))
            .unwrap();
    }

    let frame = next_matching(&mut outbound, |f| {
        matches!(f, EventFrame::TraceReport(_))
    })
    .await;
    let EventFrame::TraceReport(frames) = frame else {
        unreachable!()
    };
    assert_eq!(frames.len(), 3);

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_graceful_shutdown_preserves_directories() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let first = start_and_run(&agent, &mut outbound, "vm").await;
    let second = start_and_run(&agent, &mut outbound, "container").await;

    // Shutdown must drain within its ceiling (no panic) with live
    // instances on the node.
    agent.shutdown().await.unwrap();

    assert!(store::instance_dir(tmp.path(), first).exists());
    assert!(store::instance_dir(tmp.path(), second).exists());
}

#[tokio::test]
async fn test_ready_emitted_at_steady_state() {
    let tmp = tempfile::tempdir().unwrap();
    let mut agent = Agent::start(test_config(tmp.path())).await.unwrap();
    let mut outbound = agent.take_outbound();

    let frame = next_matching(&mut outbound, |f| matches!(f, EventFrame::Ready(_))).await;
    let EventFrame::Ready(node) = frame else {
        unreachable!()
    };
    assert!(node.timestamp.ends_with('Z'));
    assert!(node.mem_total_mb > 0);
    assert!(node.cpus_online > 0);
    assert!(!node.hostname.is_empty());

    agent.shutdown().await.unwrap();
}
