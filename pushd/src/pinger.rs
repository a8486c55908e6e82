//! Liveness ping scheduling for online clients.
//!
//! Selects every online client that has been pinged before and is not
//! currently awaiting a response, stamps the whole batch with a response
//! deadline in one store update, then sends one probe per address.

use tracing::debug;

use crate::store::ClientStore;
use crate::transport::{MessageKind, ProtocolClient};
use crate::DispatchError;

/// Schedule and send liveness pings. The deadline update is committed
/// before any probe goes out, so a crash mid-batch never leaves a probe
/// without a deadline. Returns how many clients were pinged.
pub async fn schedule_pings<P: ProtocolClient + ?Sized>(
    store: &mut ClientStore,
    protocol: &mut P,
    now: i64,
    ping_timeout: i64,
) -> Result<usize, DispatchError> {
    let clients = store.clients_needing_ping()?;
    if clients.is_empty() {
        return Ok(0);
    }
    debug!(count = clients.len(), "clients to be pinged");

    let ids: Vec<i64> = clients.iter().map(|c| c.id).collect();
    store.schedule_pings(&ids, now + ping_timeout)?;

    for client in &clients {
        // The selection query guarantees an address.
        if let Some(jid) = client.jabber_id.as_deref() {
            protocol.send_message(jid, MessageKind::Ping).await?;
        }
    }
    Ok(clients.len())
}
