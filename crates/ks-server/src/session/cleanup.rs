//! Idempotent session teardown.
//!
//! Every teardown trigger — explicit disconnect, transport loss, shell
//! close, shell error, idle timeout, process shutdown — funnels into
//! [`cleanup`]. No trigger coordinates with any other: the first caller to
//! claim the session wins the handles, everyone else no-ops. Individual
//! release steps log and continue on failure so a broken shell channel
//! never leaks the SSH connection behind it.

use tracing::{debug, info, warn};

use super::registry::SessionRegistry;

/// Release all resources owned by the session exactly once. Returns `true`
/// if this call performed the release, `false` if there was nothing to do.
pub async fn cleanup(registry: &SessionRegistry, id: &str) -> bool {
    let Some(claimed) = registry.claim_for_cleanup(id).await else {
        debug!(session_id = %id, "cleanup: already done or unknown session");
        return false;
    };

    if let Some(mut shell) = claimed.shell {
        if let Err(e) = shell.close() {
            warn!(session_id = %id, error = %e, "shell channel close failed");
        }
    }
    if let Some(mut remote) = claimed.remote {
        if let Err(e) = remote.close() {
            warn!(session_id = %id, error = %e, "remote shell close failed");
        }
    }

    registry.remove(id).await;
    info!(session_id = %id, "session closed");
    true
}
