//! Per-command failure taxonomies.
//!
//! Each lifecycle command has a closed set of failure reasons; the
//! `Display` form of every variant is the exact snake_case reason string
//! carried in the corresponding failure frame. Nothing outside these sets
//! ever reaches the wire.

use thiserror::Error;

use crate::payload::PayloadError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StartError {
    #[error("invalid_payload")]
    InvalidPayload,
    #[error("invalid_data")]
    InvalidData,
    #[error("already_running")]
    AlreadyRunning,
    #[error("instance_exists")]
    InstanceExists,
    #[error("image_failure")]
    ImageFailure,
    #[error("network_failure")]
    NetworkFailure,
    #[error("full_compute_node")]
    FullComputeNode,
    #[error("launch_failure")]
    LaunchFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RestartError {
    #[error("restart_invalid_payload")]
    InvalidPayload,
    #[error("restart_invalid_data")]
    InvalidData,
    #[error("restart_no_instance")]
    NoInstance,
    #[error("restart_already_running")]
    AlreadyRunning,
    #[error("restart_launch_failure")]
    LaunchFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StopError {
    #[error("stop_invalid_payload")]
    InvalidPayload,
    #[error("stop_invalid_data")]
    InvalidData,
    #[error("stop_no_instance")]
    NoInstance,
    #[error("stop_already_stopped")]
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeleteError {
    #[error("delete_invalid_payload")]
    InvalidPayload,
    #[error("delete_invalid_data")]
    InvalidData,
    #[error("delete_no_instance")]
    NoInstance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AttachError {
    #[error("attach_volume_invalid_payload")]
    InvalidPayload,
    #[error("attach_volume_invalid_data")]
    InvalidData,
    #[error("attach_volume_not_supported")]
    NotSupported,
    #[error("attach_volume_already_attached")]
    AlreadyAttached,
    #[error("attach_volume_attach_failure")]
    AttachFailure,
    #[error("attach_volume_instance_failure")]
    InstanceFailure,
    #[error("attach_volume_state_failure")]
    StateFailure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DetachError {
    #[error("detach_volume_invalid_payload")]
    InvalidPayload,
    #[error("detach_volume_invalid_data")]
    InvalidData,
    #[error("detach_volume_not_supported")]
    NotSupported,
    #[error("detach_volume_not_attached")]
    NotAttached,
    #[error("detach_volume_detach_failure")]
    DetachFailure,
    #[error("detach_volume_instance_failure")]
    InstanceFailure,
}

macro_rules! from_payload_error {
    ($($err:ty),+) => {
        $(impl From<&PayloadError> for $err {
            fn from(e: &PayloadError) -> Self {
                match e {
                    PayloadError::Malformed(_) => Self::InvalidPayload,
                    PayloadError::Invalid(_) => Self::InvalidData,
                }
            }
        })+
    };
}

from_payload_error!(StartError, RestartError, StopError, DeleteError, AttachError, DetachError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_reason_strings() {
        assert_eq!(StartError::InvalidPayload.to_string(), "invalid_payload");
        assert_eq!(StartError::FullComputeNode.to_string(), "full_compute_node");
        assert_eq!(StartError::LaunchFailure.to_string(), "launch_failure");
    }

    #[test]
    fn test_prefixed_reason_strings() {
        assert_eq!(RestartError::NoInstance.to_string(), "restart_no_instance");
        assert_eq!(
            StopError::AlreadyStopped.to_string(),
            "stop_already_stopped"
        );
        assert_eq!(DeleteError::NoInstance.to_string(), "delete_no_instance");
        assert_eq!(
            AttachError::AlreadyAttached.to_string(),
            "attach_volume_already_attached"
        );
        assert_eq!(
            DetachError::NotAttached.to_string(),
            "detach_volume_not_attached"
        );
    }

    #[test]
    fn test_payload_error_mapping() {
        let malformed = PayloadError::Malformed("{{{".to_string());
        let invalid = PayloadError::Invalid("bad uuid".to_string());
        assert_eq!(StartError::from(&malformed), StartError::InvalidPayload);
        assert_eq!(StartError::from(&invalid), StartError::InvalidData);
        assert_eq!(AttachError::from(&malformed), AttachError::InvalidPayload);
        assert_eq!(DetachError::from(&invalid), DetachError::InvalidData);
    }
}
