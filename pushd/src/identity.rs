//! Dispatcher credentials and registration record.
//!
//! Each dispatcher instance authenticates to the messaging server with a
//! generated alphanumeric password stored alongside its registration row.
//! The password is a shared transport credential, not a cryptographic
//! authorization token.

use rand::{distributions::Alphanumeric, Rng};
use tracing::debug;

use crate::store::ClientStore;

pub const DISPATCHER_USERNAME: &str = "push-dispatcher";
pub const DISPATCHER_RESOURCE: &str = "dispatcher";
const PASSWORD_LENGTH: usize = 32;

#[derive(Debug, Clone)]
pub struct DispatcherIdentity {
    pub username: String,
    pub resource: String,
    pub password: String,
}

impl DispatcherIdentity {
    /// Resolve this instance's identity against the store: reuse the stored
    /// password when a registration row exists, otherwise generate a fresh
    /// one (persisted later by the registration upsert).
    pub fn resolve(store: &mut ClientStore, username: &str, resource: &str) -> rusqlite::Result<Self> {
        let password = match Self::resolve_password(store, username)? {
            Some(password) => password,
            None => Self::generate_password(PASSWORD_LENGTH),
        };
        Ok(Self {
            username: username.to_string(),
            resource: resource.to_string(),
            password,
        })
    }

    /// Stored password for the principal prefix, if any. A registration row
    /// without a password is a legacy upgrade case: generate one and persist
    /// it in the same call.
    fn resolve_password(store: &mut ClientStore, username: &str) -> rusqlite::Result<Option<String>> {
        match store.dispatcher_by_prefix(username)? {
            Some((_, Some(password))) if !password.is_empty() => Ok(Some(password)),
            Some((id, _)) => {
                debug!(id, "registration row has no password; generating one");
                let password = Self::generate_password(PASSWORD_LENGTH);
                store.set_dispatcher_password(id, &password)?;
                Ok(Some(password))
            }
            None => Ok(None),
        }
    }

    /// Uniformly random alphanumeric string.
    pub fn generate_password(length: usize) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(length)
            .map(char::from)
            .collect()
    }

    /// Protocol address for this instance on `host`.
    pub fn jid(&self, host: &str) -> String {
        format!("{}@{}/{}", self.username, host, self.resource)
    }

    /// Registration upsert: update the row matching this address; on zero
    /// rows affected, insert. Kept as two conditional steps so the same
    /// identity survives restarts and concurrent instances racing to
    /// initialize.
    pub fn register_or_refresh(
        &self,
        store: &ClientStore,
        jid: &str,
        hostname: &str,
        now: i64,
    ) -> rusqlite::Result<()> {
        let updated = store.update_registration(jid, hostname, now)?;
        if updated == 0 {
            store.insert_registration(jid, hostname, &self.password, now)?;
        }
        Ok(())
    }
}
