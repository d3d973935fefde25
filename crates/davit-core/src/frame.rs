//! Control-channel frame contracts.
//!
//! The control-channel client (transport, TLS, auth) lives outside this
//! repo. It hands parsed inbound frames to the dispatcher over a channel
//! and consumes [`EventFrame`]s from the outbound channel. Frame bodies
//! are YAML documents.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AttachError, DeleteError, DetachError, RestartError, StartError, StopError};
use crate::instance::RunningState;

/// Lifecycle commands recognized on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WireCommand {
    Start,
    Restart,
    Stop,
    Delete,
    AttachVolume,
    DetachVolume,
}

/// One parsed inbound command frame.
#[derive(Debug, Clone)]
pub struct ControlFrame {
    pub command: WireCommand,
    /// Raw YAML payload, validated by the dispatcher.
    pub payload: String,
    /// Correlation identifier echoed in the matching failure frame.
    pub correlation: Uuid,
    /// Set only on self-issued deletes posted by an instance task.
    pub suicide: bool,
}

impl ControlFrame {
    pub fn new(command: WireCommand, payload: impl Into<String>) -> Self {
        Self {
            command,
            payload: payload.into(),
            correlation: Uuid::new_v4(),
            suicide: false,
        }
    }

    /// Build the self-issued delete an instance task posts after a
    /// catastrophic start failure.
    pub fn suicide_delete(instance_id: Uuid) -> Self {
        Self {
            command: WireCommand::Delete,
            payload: format!("instance_uuid: {instance_id}\n"),
            correlation: Uuid::new_v4(),
            suicide: true,
        }
    }
}

/// A control-channel trace frame awaiting batched upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceFrame {
    pub label: String,
    pub body: String,
}

/// Everything the control-channel client can feed into the agent.
#[derive(Debug, Clone)]
pub enum Inbound {
    Command(ControlFrame),
    Trace(TraceFrame),
}

// ============================================================================
// Outbound payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NicSample {
    pub ip: String,
    pub mac: String,
}

/// Node-level readings shared by the `ready` and `stats` payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSummary {
    pub node_uuid: Uuid,
    /// RFC 3339 UTC stamp taken when the sample was collected.
    pub timestamp: String,
    pub mem_total_mb: i64,
    pub mem_available_mb: i64,
    pub disk_total_mb: i64,
    pub disk_available_mb: i64,
    /// 1-minute load average.
    pub load: f64,
    pub cpus_online: usize,
    pub hostname: String,
    pub networks: Vec<NicSample>,
}

/// Per-instance entry in the `stats` payload. `-1` means unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceStat {
    pub instance_uuid: Uuid,
    pub state: RunningState,
    pub memory_usage_mb: i64,
    pub disk_usage_mb: i64,
    pub cpu_usage_pct: i32,
    pub ssh_ip: String,
    pub ssh_port: u32,
    pub volumes: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsPayload {
    #[serde(flatten)]
    pub node: NodeSummary,
    pub instances: Vec<InstanceStat>,
}

/// Tenant networking lifecycle event, passed through from the networking
/// collaborator untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantEvent {
    pub tenant_uuid: Uuid,
    pub agent_ip: String,
    pub subnet: String,
}

/// Every frame the agent can emit toward the control channel.
#[derive(Debug, Clone)]
pub enum EventFrame {
    Ready(NodeSummary),
    /// Status with an empty body: the node cannot admit more work.
    Full,
    Stats(StatsPayload),
    TraceReport(Vec<TraceFrame>),
    InstanceDeleted {
        instance_uuid: Uuid,
    },
    InstanceStopped {
        instance_uuid: Uuid,
    },
    StartFailure {
        correlation: Uuid,
        instance_uuid: Uuid,
        reason: StartError,
    },
    RestartFailure {
        correlation: Uuid,
        instance_uuid: Uuid,
        reason: RestartError,
    },
    StopFailure {
        correlation: Uuid,
        instance_uuid: Uuid,
        reason: StopError,
    },
    DeleteFailure {
        correlation: Uuid,
        instance_uuid: Uuid,
        reason: DeleteError,
    },
    AttachVolumeFailure {
        correlation: Uuid,
        instance_uuid: Uuid,
        volume_uuid: Uuid,
        reason: AttachError,
    },
    DetachVolumeFailure {
        correlation: Uuid,
        instance_uuid: Uuid,
        volume_uuid: Uuid,
        reason: DetachError,
    },
    TenantAdded(TenantEvent),
    TenantRemoved(TenantEvent),
}

#[derive(Serialize)]
struct InstanceEventBody {
    instance_uuid: Uuid,
}

#[derive(Serialize)]
struct FailureBody<'a> {
    instance_uuid: Uuid,
    reason: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    volume_uuid: Option<Uuid>,
}

#[derive(Serialize)]
struct TraceReportBody<'a> {
    frames: &'a [TraceFrame],
}

impl EventFrame {
    /// Frame type name as it appears on the wire.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Ready(_) => "ready",
            Self::Full => "full",
            Self::Stats(_) => "stats",
            Self::TraceReport(_) => "trace_report",
            Self::InstanceDeleted { .. } => "instance_deleted",
            Self::InstanceStopped { .. } => "instance_stopped",
            Self::StartFailure { .. } => "start_failure",
            Self::RestartFailure { .. } => "restart_failure",
            Self::StopFailure { .. } => "stop_failure",
            Self::DeleteFailure { .. } => "delete_failure",
            Self::AttachVolumeFailure { .. } => "attach_volume_failure",
            Self::DetachVolumeFailure { .. } => "detach_volume_failure",
            Self::TenantAdded(_) => "tenant_added",
            Self::TenantRemoved(_) => "tenant_removed",
        }
    }

    /// Correlation identifier for failure frames, `None` otherwise.
    pub fn correlation(&self) -> Option<Uuid> {
        match self {
            Self::StartFailure { correlation, .. }
            | Self::RestartFailure { correlation, .. }
            | Self::StopFailure { correlation, .. }
            | Self::DeleteFailure { correlation, .. }
            | Self::AttachVolumeFailure { correlation, .. }
            | Self::DetachVolumeFailure { correlation, .. } => Some(*correlation),
            _ => None,
        }
    }

    /// Serialize the frame body to YAML. `full` has an empty body.
    pub fn to_yaml(&self) -> anyhow::Result<String> {
        let body = match self {
            Self::Ready(node) => serde_yaml::to_string(node)?,
            Self::Full => String::new(),
            Self::Stats(stats) => serde_yaml::to_string(stats)?,
            Self::TraceReport(frames) => serde_yaml::to_string(&TraceReportBody { frames })?,
            Self::InstanceDeleted { instance_uuid } | Self::InstanceStopped { instance_uuid } => {
                serde_yaml::to_string(&InstanceEventBody {
                    instance_uuid: *instance_uuid,
                })?
            }
            Self::StartFailure {
                instance_uuid,
                reason,
                ..
            } => failure_yaml(*instance_uuid, &reason.to_string(), None)?,
            Self::RestartFailure {
                instance_uuid,
                reason,
                ..
            } => failure_yaml(*instance_uuid, &reason.to_string(), None)?,
            Self::StopFailure {
                instance_uuid,
                reason,
                ..
            } => failure_yaml(*instance_uuid, &reason.to_string(), None)?,
            Self::DeleteFailure {
                instance_uuid,
                reason,
                ..
            } => failure_yaml(*instance_uuid, &reason.to_string(), None)?,
            Self::AttachVolumeFailure {
                instance_uuid,
                volume_uuid,
                reason,
                ..
            } => failure_yaml(*instance_uuid, &reason.to_string(), Some(*volume_uuid))?,
            Self::DetachVolumeFailure {
                instance_uuid,
                volume_uuid,
                reason,
                ..
            } => failure_yaml(*instance_uuid, &reason.to_string(), Some(*volume_uuid))?,
            Self::TenantAdded(ev) | Self::TenantRemoved(ev) => serde_yaml::to_string(ev)?,
        };
        Ok(body)
    }
}

fn failure_yaml(
    instance_uuid: Uuid,
    reason: &str,
    volume_uuid: Option<Uuid>,
) -> anyhow::Result<String> {
    Ok(serde_yaml::to_string(&FailureBody {
        instance_uuid,
        reason,
        volume_uuid,
    })?)
}
