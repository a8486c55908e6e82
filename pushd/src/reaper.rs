//! Reaps clients whose ping deadline passed without a response.
//!
//! A client that never answers a liveness probe within the ping-timeout
//! window is presumed disconnected. This sweep is the only path in the
//! engine that demotes a client to Offline.

use tracing::debug;

use crate::store::ClientStore;
use crate::DispatchError;

/// Bulk-demote every overdue pinged client to Offline. Returns whether
/// anything changed.
pub fn sweep(store: &mut ClientStore, now: i64) -> Result<bool, DispatchError> {
    let changed = store.reap_overdue(now)?;
    if changed {
        debug!("reaped clients with expired ping deadlines");
    }
    Ok(changed)
}
