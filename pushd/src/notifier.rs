//! Admission-controlled notification fan-out.
//!
//! One pass over the ordered pending-candidates scan. Rows due now produce
//! at most one check-in message per address; rows due in the future fold
//! into the next proactive wake-up interval. A configured notify threshold
//! caps how many new clients are told to check in per pass, bounding the
//! burst of simultaneous check-ins the fleet can produce.

use tracing::debug;

use crate::store::ClientStore;
use crate::transport::{MessageKind, ProtocolClient};
use crate::DispatchError;

/// Sentinel for "no next interval observed yet". Any real delta is smaller,
/// so the first one always wins the min-fold.
const MAX_POLL_INTERVAL: i64 = 86_400;

#[derive(Debug, Default)]
pub struct NotificationOutcome {
    /// Addresses notified this pass, in send order.
    pub notified: Vec<String>,
    /// Seconds until the earliest not-yet-due action, if any was seen.
    pub next_poll_interval: Option<i64>,
}

/// Run one notification pass.
pub async fn notify_nodes<P: ProtocolClient + ?Sized>(
    store: &mut ClientStore,
    protocol: &mut P,
    notify_threshold: Option<u32>,
    now: i64,
) -> Result<NotificationOutcome, DispatchError> {
    let running = store.running_count()?;
    let mut free_slots = notify_threshold.map(|t| i64::from(t) - running);
    debug!(
        threshold = ?notify_threshold,
        running,
        free_slots = ?free_slots,
        "starting notification pass"
    );

    let mut outcome = NotificationOutcome::default();
    for row in store.pending_candidates(now)? {
        if let Some(slots) = free_slots {
            if slots <= 0 {
                debug!("max running clients reached; stop notifying");
                break;
            }
        }

        if row.delta > 0 {
            // Not due yet; remember the soonest wake-up instead.
            let current = outcome.next_poll_interval.unwrap_or(MAX_POLL_INTERVAL);
            outcome.next_poll_interval = Some(current.min(row.delta));
            continue;
        }

        let Some(jid) = row.jabber_id.as_deref() else {
            // Not even online.
            continue;
        };
        if outcome.notified.iter().any(|sent| sent == jid) {
            // One notification per address per pass.
            continue;
        }
        if store.reboot_in_progress(row.server_id)? {
            debug!(server_id = row.server_id, "reboot in progress; holding off");
            continue;
        }
        if !protocol.is_available(jid) {
            // Keep scanning; other clients may still be reachable.
            debug!(jid, "node not available for notifications");
            continue;
        }

        debug!(jid, server_id = row.server_id, "notifying");
        protocol.send_message(jid, MessageKind::CheckIn).await?;
        outcome.notified.push(jid.to_string());
        if let Some(slots) = free_slots.as_mut() {
            *slots -= 1;
        }
    }
    Ok(outcome)
}
