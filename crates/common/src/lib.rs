//! Types shared between the dispatcher daemon and its tooling.

pub mod config;

/// Action lifecycle statuses as written by the upstream scheduler.
///
/// This daemon only ever reads these; transitions are owned by the
/// server-side schedulers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Queued,
    PickedUp,
    Completed,
    Failed,
}

impl ActionStatus {
    /// Numeric code used in the store.
    pub fn code(self) -> i64 {
        match self {
            ActionStatus::Queued => 0,
            ActionStatus::PickedUp => 1,
            ActionStatus::Completed => 2,
            ActionStatus::Failed => 3,
        }
    }
}

/// Liveness state labels in the push_client_state lookup table.
pub const STATE_ONLINE: &str = "online";
pub const STATE_OFFLINE: &str = "offline";

/// Action type label marking a host reboot; a server with one of these in
/// PickedUp must not be notified.
pub const REBOOT_ACTION_LABEL: &str = "reboot.reboot";

/// A managed agent row, as returned by the fetch-to-ping query.
#[derive(Debug, Clone)]
pub struct ClientRow {
    pub id: i64,
    pub name: String,
    pub shared_key: String,
    pub jabber_id: Option<String>,
}

/// One candidate row from the pending-actions query.
///
/// `delta` is the number of seconds until the action becomes due; a value
/// greater than zero means the action lies in the future and must not be
/// notified yet.
#[derive(Debug, Clone)]
pub struct PendingRow {
    pub action_id: i64,
    pub server_id: i64,
    pub jabber_id: Option<String>,
    pub delta: i64,
}

/// Strip the resource qualifier from a protocol address.
///
/// Presence addresses may carry a `/resource` suffix that must be ignored
/// for identity comparison.
pub fn strip_resource(jid: &str) -> &str {
    jid.split('/').next().unwrap_or(jid)
}
