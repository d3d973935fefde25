//! Crash recovery: resurrect one instance task per persisted directory.
//!
//! Runs once at startup, before the dispatcher accepts commands. Every
//! recovered instance comes back in the pending state with unknown
//! resource samples; whether its guest still runs is discovered by the
//! first restart or delete that touches it.

use tracing::{info, warn};

use davit_core::config::AgentConfig;
use davit_core::store;

use crate::overseer::{AdmitOutcome, OverseerHandle};

pub async fn resurrect(config: &AgentConfig, overseer: &OverseerHandle) -> usize {
    let configs = match store::scan(&config.data_root) {
        Ok(configs) => configs,
        Err(e) => {
            warn!(error = %e, "Recovery scan failed; starting with no instances");
            return 0;
        }
    };

    let mut count = 0;
    for instance in configs {
        let instance_id = instance.instance_id;
        match overseer.admit(instance, true).await {
            AdmitOutcome::Admitted(_) => {
                info!(instance = %instance_id, "Recovered instance");
                count += 1;
            }
            AdmitOutcome::Existing(_) => {
                warn!(instance = %instance_id, "Duplicate instance directory during recovery");
            }
            AdmitOutcome::Full | AdmitOutcome::Failed => {
                warn!(instance = %instance_id, "Could not resurrect instance");
            }
        }
    }
    count
}
