//! Dispatch-and-liveness engine for the push daemon.
//!
//! Tells remote agents over a presence-based messaging channel when they
//! have work queued, pings online agents to track liveness, and reaps the
//! ones that stop answering. The engine is a single-threaded reactor: one
//! cycle per wake-up, one combined socket-or-timeout wait per cycle.

pub mod identity;
pub mod notifier;
pub mod pinger;
pub mod reaper;
pub mod roster;
pub mod runner;
pub mod store;
pub mod transport;

use transport::TransportError;

/// Errors that escape a dispatch cycle. Both variants are fatal to the
/// current connection and send the loop back to Connecting.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("store error: {0}")]
    Store(#[from] rusqlite::Error),
    #[error(transparent)]
    Transport(#[from] TransportError),
}
