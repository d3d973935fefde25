//! Process-wide boundary glue: the single-instance lockfile, the
//! file-descriptor headroom, and the shutdown signal.
//!
//! Everything here is initialized before any component starts and torn
//! down last; instance tasks never touch it.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use tracing::{info, warn};

/// Advisory-exclusive pidfile. The OS releases the lock if the process
/// dies; `Drop` also removes the file on a clean exit.
#[derive(Debug)]
pub struct Lockfile {
    file: File,
    path: PathBuf,
}

impl Lockfile {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lockfile {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "Another agent already holds {}; refusing to start",
                path.display()
            );
        }
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for Lockfile {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

/// Raise the `nofile` soft limit to its hard limit and return the new
/// soft limit.
pub fn raise_nofile_limit() -> Result<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit/setrlimit write/read only the struct we hand them.
    unsafe {
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            bail!("getrlimit(RLIMIT_NOFILE) failed");
        }
        if limit.rlim_cur < limit.rlim_max {
            limit.rlim_cur = limit.rlim_max;
            if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
                warn!("setrlimit(RLIMIT_NOFILE) failed; keeping current soft limit");
                libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit);
            }
        }
    }
    Ok(limit.rlim_cur)
}

/// Instance cap derived from the descriptor budget: each instance costs a
/// handful of descriptors (monitor socket, artifacts, driver plumbing).
pub fn max_instances_for(nofile_soft: u64) -> usize {
    (nofile_soft / 5) as usize
}

/// Resolve once SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable; relying on ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
        _ = term.recv() => info!("SIGTERM received"),
    }
}
