//! Protocol roster reconciliation against the known client set.
//!
//! The messaging server's subscription store can be reset independently of
//! the client database, so every (re)connection re-derives it: subscribe to
//! every known client missing from the roster, drop every roster entry with
//! no matching client. Addresses are compared with resource suffixes
//! stripped.

use std::collections::HashSet;

use tracing::debug;

use push_common::strip_resource;

use crate::store::ClientStore;
use crate::transport::ProtocolClient;
use crate::DispatchError;

#[derive(Debug, Default)]
pub struct RosterChanges {
    pub subscribed: Vec<String>,
    pub unsubscribed: Vec<String>,
}

pub async fn reconcile<P: ProtocolClient + ?Sized>(
    store: &ClientStore,
    protocol: &mut P,
) -> Result<RosterChanges, DispatchError> {
    let roster = protocol.retrieve_roster().await?;
    let subscribed: HashSet<String> = roster
        .all()
        .iter()
        .map(|jid| strip_resource(jid).to_string())
        .collect();
    let active: HashSet<String> = store
        .active_client_jids()?
        .iter()
        .map(|jid| strip_resource(jid).to_string())
        .collect();

    let mut to_add: Vec<String> = active.difference(&subscribed).cloned().collect();
    let mut to_remove: Vec<String> = subscribed.difference(&active).cloned().collect();
    to_add.sort();
    to_remove.sort();

    debug!(
        subscribe = to_add.len(),
        unsubscribe = to_remove.len(),
        "reconciling roster"
    );
    if !to_add.is_empty() {
        protocol.subscribe(&to_add).await?;
    }
    if !to_remove.is_empty() {
        protocol.unsubscribe(&to_remove).await?;
    }
    Ok(RosterChanges {
        subscribed: to_add,
        unsubscribed: to_remove,
    })
}
