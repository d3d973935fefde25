//! Inbound command payload parsing and validation.
//!
//! Control frames carry YAML documents. Parsing distinguishes two failure
//! classes: a document that does not deserialize at all is `Malformed`
//! (surfaced as `*_invalid_payload`), a document whose fields fail
//! semantic validation is `Invalid` (surfaced as `*_invalid_data`).
//! Validation never touches any state.

use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::instance::{
    Firmware, InstanceConfig, InstanceKind, NetConfig, VolumeConfig, ssh_port_for,
};

#[derive(Debug, Clone, Error)]
pub enum PayloadError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("invalid payload data: {0}")]
    Invalid(String),
}

fn parse_uuid(field: &str, value: &str) -> Result<Uuid, PayloadError> {
    if value.is_empty() {
        return Err(PayloadError::Invalid(format!("{field} is empty")));
    }
    Uuid::parse_str(value)
        .map_err(|_| PayloadError::Invalid(format!("{field} is not a valid UUID: {value:?}")))
}

// ============================================================================
// START
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawResources {
    vcpus: u32,
    mem_mb: i64,
    disk_mb: i64,
}

#[derive(Debug, Deserialize)]
struct RawNetwork {
    mac: String,
    private_ip: String,
    concentrator_ip: String,
    concentrator_uuid: String,
    subnet: String,
    vnic_uuid: String,
}

#[derive(Debug, Deserialize)]
struct RawVolume {
    #[serde(default)]
    volume_uuid: String,
    #[serde(default)]
    bootable: bool,
}

#[derive(Debug, Deserialize)]
struct RawStart {
    instance_uuid: String,
    tenant_uuid: String,
    #[serde(default)]
    image: String,
    kind: String,
    #[serde(default)]
    firmware: Option<String>,
    #[serde(default)]
    network_node: bool,
    resources: RawResources,
    network: RawNetwork,
    #[serde(default)]
    storage: Vec<RawVolume>,
    #[serde(default)]
    user_data: String,
    #[serde(default)]
    meta_data: String,
}

/// A validated START command.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub config: InstanceConfig,
    pub user_data: String,
    pub meta_data: String,
}

pub fn parse_start(yaml: &str) -> Result<StartRequest, PayloadError> {
    let raw: RawStart =
        serde_yaml::from_str(yaml).map_err(|e| PayloadError::Malformed(e.to_string()))?;

    let instance_id = parse_uuid("instance_uuid", &raw.instance_uuid)?;
    let tenant_id = parse_uuid("tenant_uuid", &raw.tenant_uuid)?;
    let concentrator_id = parse_uuid("concentrator_uuid", &raw.network.concentrator_uuid)?;
    let vnic_id = parse_uuid("vnic_uuid", &raw.network.vnic_uuid)?;

    let kind = match raw.kind.as_str() {
        "vm" => InstanceKind::Vm,
        "container" => InstanceKind::Container,
        other => {
            return Err(PayloadError::Invalid(format!(
                "kind must be vm or container, got {other:?}"
            )));
        }
    };

    let firmware = match raw.firmware.as_deref() {
        None | Some("legacy") => Firmware::Legacy,
        Some("efi") => Firmware::Efi,
        Some(other) => {
            return Err(PayloadError::Invalid(format!(
                "firmware must be legacy or efi, got {other:?}"
            )));
        }
    };

    let mut volumes = Vec::with_capacity(raw.storage.len());
    for entry in &raw.storage {
        if entry.volume_uuid.is_empty() {
            return Err(PayloadError::Invalid(
                "storage entry with empty volume_uuid".to_string(),
            ));
        }
        let volume_id = parse_uuid("volume_uuid", &entry.volume_uuid)?;
        if volumes.iter().any(|v: &VolumeConfig| v.volume_id == volume_id) {
            return Err(PayloadError::Invalid(format!(
                "duplicate storage entry {volume_id}"
            )));
        }
        volumes.push(VolumeConfig {
            volume_id,
            bootable: entry.bootable,
        });
    }
    if volumes.iter().filter(|v| v.bootable).count() > 1 {
        return Err(PayloadError::Invalid(
            "more than one bootable storage entry".to_string(),
        ));
    }
    if raw.image.is_empty() && !volumes.iter().any(|v| v.bootable) {
        return Err(PayloadError::Invalid(
            "no image and no bootable storage entry".to_string(),
        ));
    }

    let ssh_port = ssh_port_for(&raw.network.private_ip).ok_or_else(|| {
        PayloadError::Invalid(format!(
            "private_ip is not a valid IPv4 address: {:?}",
            raw.network.private_ip
        ))
    })?;

    Ok(StartRequest {
        config: InstanceConfig {
            instance_id,
            tenant_id,
            image_ref: raw.image,
            vcpus: raw.resources.vcpus,
            memory_mb: raw.resources.mem_mb,
            disk_mb: raw.resources.disk_mb,
            kind,
            firmware,
            network_node: raw.network_node,
            net: NetConfig {
                mac: raw.network.mac,
                private_ip: raw.network.private_ip,
                concentrator_ip: raw.network.concentrator_ip,
                concentrator_id,
                subnet: raw.network.subnet,
                vnic_id,
                ssh_port,
            },
            volumes,
        },
        user_data: raw.user_data,
        meta_data: raw.meta_data,
    })
}

/// Best-effort extraction of the target instance UUID from a START payload
/// that failed full validation, so the failure frame can still name it.
pub fn instance_uuid_hint(yaml: &str) -> Uuid {
    serde_yaml::from_str::<serde_yaml::Value>(yaml)
        .ok()
        .and_then(|v| {
            v.get("instance_uuid")
                .and_then(|u| u.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
        })
        .unwrap_or_else(Uuid::nil)
}

// ============================================================================
// RESTART / STOP / DELETE / ATTACH_VOLUME / DETACH_VOLUME
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawInstanceRef {
    instance_uuid: String,
}

pub fn parse_instance_ref(yaml: &str) -> Result<Uuid, PayloadError> {
    let raw: RawInstanceRef =
        serde_yaml::from_str(yaml).map_err(|e| PayloadError::Malformed(e.to_string()))?;
    parse_uuid("instance_uuid", &raw.instance_uuid)
}

#[derive(Debug, Deserialize)]
struct RawDelete {
    instance_uuid: String,
    #[serde(default)]
    migration: bool,
}

/// A validated DELETE command.
#[derive(Debug, Clone, Copy)]
pub struct DeleteRequest {
    pub instance_id: Uuid,
    /// Migration deletes report `instance_stopped` instead of
    /// `instance_deleted` so the scheduler keeps the instance record.
    pub migration: bool,
}

pub fn parse_delete(yaml: &str) -> Result<DeleteRequest, PayloadError> {
    let raw: RawDelete =
        serde_yaml::from_str(yaml).map_err(|e| PayloadError::Malformed(e.to_string()))?;
    Ok(DeleteRequest {
        instance_id: parse_uuid("instance_uuid", &raw.instance_uuid)?,
        migration: raw.migration,
    })
}

#[derive(Debug, Deserialize)]
struct RawVolumeRef {
    instance_uuid: String,
    volume_uuid: String,
}

/// A validated ATTACH_VOLUME / DETACH_VOLUME command.
#[derive(Debug, Clone, Copy)]
pub struct VolumeRef {
    pub instance_id: Uuid,
    pub volume_id: Uuid,
}

pub fn parse_volume_ref(yaml: &str) -> Result<VolumeRef, PayloadError> {
    let raw: RawVolumeRef =
        serde_yaml::from_str(yaml).map_err(|e| PayloadError::Malformed(e.to_string()))?;
    Ok(VolumeRef {
        instance_id: parse_uuid("instance_uuid", &raw.instance_uuid)?,
        volume_id: parse_uuid("volume_uuid", &raw.volume_uuid)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) const START_YAML: &str = r#"
instance_uuid: d7d86208-b46c-4465-9018-ee14200d8897
tenant_uuid: 67d86208-b46c-4465-9018-fe14087d415f
image: ubuntu-24.04
kind: vm
firmware: legacy
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
  vnic_uuid: 67d86208-b46c-4465-9018-fe13087d415f
user_data: |
  #cloud-config
  hostname: test
meta_data: |
  instance-id: d7d86208-b46c-4465-9018-ee14200d8897
"#;

    #[test]
    fn test_parse_start_ok() {
        let req = parse_start(START_YAML).unwrap();
        assert_eq!(
            req.config.instance_id.to_string(),
            "d7d86208-b46c-4465-9018-ee14200d8897"
        );
        assert_eq!(req.config.kind, InstanceKind::Vm);
        assert_eq!(req.config.firmware, Firmware::Legacy);
        assert_eq!(req.config.vcpus, 2);
        assert_eq!(req.config.memory_mb, 370);
        assert_eq!(req.config.disk_mb, 8000);
        assert_eq!(req.config.net.ssh_port, 33000 + (2 << 8) + 3);
        assert!(req.user_data.starts_with("#cloud-config"));
        assert!(req.config.volumes.is_empty());
    }

    #[test]
    fn test_parse_start_malformed_yaml() {
        let err = parse_start("{{{not yaml").unwrap_err();
        assert!(matches!(err, PayloadError::Malformed(_)));
    }

    #[test]
    fn test_parse_start_bad_uuid() {
        let yaml = START_YAML.replace("d7d86208-b46c-4465-9018-ee14200d8897", "nope");
        let err = parse_start(&yaml).unwrap_err();
        assert!(matches!(err, PayloadError::Invalid(_)));
    }

    #[test]
    fn test_parse_start_bad_kind() {
        let yaml = START_YAML.replace("kind: vm", "kind: zone");
        assert!(matches!(
            parse_start(&yaml).unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_start_bad_firmware() {
        let yaml = START_YAML.replace("firmware: legacy", "firmware: bios");
        assert!(matches!(
            parse_start(&yaml).unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_start_with_storage() {
        let yaml = format!(
            "{START_YAML}storage:\n  - volume_uuid: 67d86208-b46c-4465-9018-fe14087d415f\n    bootable: true\n"
        );
        let req = parse_start(&yaml).unwrap();
        assert_eq!(req.config.volumes.len(), 1);
        assert!(req.config.volumes[0].bootable);
    }

    #[test]
    fn test_parse_start_empty_volume_uuid() {
        let yaml = format!("{START_YAML}storage:\n  - bootable: true\n");
        assert!(matches!(
            parse_start(&yaml).unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_start_duplicate_volume() {
        let yaml = format!(
            "{START_YAML}storage:\n  - volume_uuid: 67d86208-b46c-4465-9018-fe14087d415f\n  - volume_uuid: 67d86208-b46c-4465-9018-fe14087d415f\n"
        );
        assert!(matches!(
            parse_start(&yaml).unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_start_two_bootable_volumes() {
        let yaml = format!(
            "{START_YAML}storage:\n  - volume_uuid: 67d86208-b46c-4465-9018-fe14087d415f\n    bootable: true\n  - volume_uuid: 77d86208-b46c-4465-9018-fe14087d415f\n    bootable: true\n"
        );
        assert!(matches!(
            parse_start(&yaml).unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_start_no_image_no_bootable() {
        let yaml = START_YAML.replace("image: ubuntu-24.04", "image: \"\"");
        assert!(matches!(
            parse_start(&yaml).unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_start_boot_from_volume() {
        let base = START_YAML.replace("image: ubuntu-24.04", "image: \"\"");
        let yaml = format!(
            "{base}storage:\n  - volume_uuid: 67d86208-b46c-4465-9018-fe14087d415f\n    bootable: true\n"
        );
        let req = parse_start(&yaml).unwrap();
        assert!(req.config.image_ref.is_empty());
        assert!(req.config.bootable_volume().is_some());
    }

    #[test]
    fn test_instance_uuid_hint() {
        assert_eq!(
            instance_uuid_hint(START_YAML).to_string(),
            "d7d86208-b46c-4465-9018-ee14200d8897"
        );
        assert!(instance_uuid_hint("{{{").is_nil());
        assert!(instance_uuid_hint("instance_uuid: junk").is_nil());
    }

    #[test]
    fn test_parse_instance_ref() {
        let id =
            parse_instance_ref("instance_uuid: d7d86208-b46c-4465-9018-ee14200d8897").unwrap();
        assert_eq!(id.to_string(), "d7d86208-b46c-4465-9018-ee14200d8897");

        assert!(matches!(
            parse_instance_ref("no_such_field: 1").unwrap_err(),
            PayloadError::Malformed(_)
        ));
        assert!(matches!(
            parse_instance_ref("instance_uuid: zzz").unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }

    #[test]
    fn test_parse_delete_migration_flag() {
        let req =
            parse_delete("instance_uuid: d7d86208-b46c-4465-9018-ee14200d8897").unwrap();
        assert!(!req.migration);

        let req = parse_delete(
            "instance_uuid: d7d86208-b46c-4465-9018-ee14200d8897\nmigration: true",
        )
        .unwrap();
        assert!(req.migration);
    }

    #[test]
    fn test_parse_volume_ref() {
        let req = parse_volume_ref(
            "instance_uuid: d7d86208-b46c-4465-9018-ee14200d8897\nvolume_uuid: 67d86208-b46c-4465-9018-fe14087d415f",
        )
        .unwrap();
        assert_eq!(
            req.volume_id.to_string(),
            "67d86208-b46c-4465-9018-fe14087d415f"
        );

        assert!(matches!(
            parse_volume_ref(
                "instance_uuid: d7d86208-b46c-4465-9018-ee14200d8897\nvolume_uuid: nope"
            )
            .unwrap_err(),
            PayloadError::Invalid(_)
        ));
    }
}
