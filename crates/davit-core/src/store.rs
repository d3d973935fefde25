//! Instance state store.
//!
//! Each instance owns one directory under `<root>/instances/<instance_id>`
//! holding the serialized [`InstanceConfig`] plus whatever artifacts its
//! driver drops there (seed image, container id, monitor socket). The
//! `state` snapshot is always replaced through a temp-file rename so a
//! crash can never leave a partial snapshot behind.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::warn;
use uuid::Uuid;

use crate::instance::InstanceConfig;

/// File name of the serialized config inside an instance directory.
pub const STATE_FILE: &str = "state";

pub fn instances_root(data_root: &Path) -> PathBuf {
    data_root.join("instances")
}

pub fn instance_dir(data_root: &Path, instance_id: Uuid) -> PathBuf {
    instances_root(data_root).join(instance_id.to_string())
}

/// Create the directory for an instance, including parents.
pub fn ensure_dir(data_root: &Path, instance_id: Uuid) -> Result<PathBuf> {
    let dir = instance_dir(data_root, instance_id);
    fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create instance directory {}", dir.display()))?;
    Ok(dir)
}

/// Persist the config snapshot atomically (temp file + rename).
pub fn persist(dir: &Path, config: &InstanceConfig) -> Result<()> {
    let json = serde_json::to_string_pretty(config)?;
    let tmp = dir.join(".state.tmp");
    let dest = dir.join(STATE_FILE);
    fs::write(&tmp, json)
        .with_context(|| format!("Failed to write state snapshot {}", tmp.display()))?;
    fs::rename(&tmp, &dest)
        .with_context(|| format!("Failed to move state snapshot into {}", dest.display()))?;
    Ok(())
}

/// Load the persisted config from an instance directory.
pub fn load(dir: &Path) -> Result<InstanceConfig> {
    let path = dir.join(STATE_FILE);
    let json = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read state snapshot {}", path.display()))?;
    let config: InstanceConfig = serde_json::from_str(&json)
        .with_context(|| format!("Malformed state snapshot {}", path.display()))?;
    Ok(config)
}

/// Remove an instance directory and everything in it.
pub fn remove(dir: &Path) -> Result<()> {
    fs::remove_dir_all(dir)
        .with_context(|| format!("Failed to remove instance directory {}", dir.display()))
}

/// Enumerate persisted instance directories and load each snapshot.
///
/// Directories with a missing or malformed snapshot are skipped with a
/// warning; the recovery scan must not abort on one bad instance.
pub fn scan(data_root: &Path) -> Result<Vec<InstanceConfig>> {
    let root = instances_root(data_root);
    let mut configs = Vec::new();
    let entries = match fs::read_dir(&root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(configs),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to enumerate instances in {}", root.display()));
        }
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        match load(&entry.path()) {
            Ok(config) => configs.push(config),
            Err(e) => {
                warn!(dir = %entry.path().display(), error = %e, "Skipping unreadable instance directory");
            }
        }
    }

    // Deterministic resurrection order.
    configs.sort_by_key(|c| c.instance_id);
    Ok(configs)
}
