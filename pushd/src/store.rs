//! SQLite-backed client and action store.
//!
//! Owns the store connection for the whole engine and exposes exactly the
//! query contracts the dispatch loop needs: the reap sweep, the fetch-to-ping
//! selection, the ordered pending-candidates scan, the running-server count,
//! the reboot hold check, and the dispatcher registration upsert.
//!
//! Every bulk mutation is a single SQL statement, so a unit of work is never
//! half-applied. Methods that evaluate time take `now` (unix epoch seconds)
//! explicitly; nothing in here reads the wall clock.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{named_params, params, params_from_iter, Connection, OptionalExtension};
use tracing::debug;

use push_common::{ActionStatus, ClientRow, PendingRow, REBOOT_ACTION_LABEL, STATE_OFFLINE, STATE_ONLINE};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS push_client_state (
    id      INTEGER PRIMARY KEY,
    label   TEXT NOT NULL UNIQUE
);
INSERT OR IGNORE INTO push_client_state (label) VALUES ('online');
INSERT OR IGNORE INTO push_client_state (label) VALUES ('offline');

CREATE TABLE IF NOT EXISTS push_client (
    id                INTEGER PRIMARY KEY,
    name              TEXT NOT NULL,
    shared_key        TEXT NOT NULL,
    state_id          INTEGER NOT NULL REFERENCES push_client_state(id),
    jabber_id         TEXT,
    last_ping_time    INTEGER,
    next_action_time  INTEGER,
    server_id         INTEGER
);

CREATE TABLE IF NOT EXISTS push_dispatcher (
    id            INTEGER PRIMARY KEY,
    jabber_id     TEXT NOT NULL UNIQUE,
    last_checkin  INTEGER NOT NULL,
    hostname      TEXT NOT NULL,
    password      TEXT
);

CREATE TABLE IF NOT EXISTS action_type (
    id      INTEGER PRIMARY KEY,
    label   TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS action (
    id               INTEGER PRIMARY KEY,
    action_type     INTEGER REFERENCES action_type(id),
    prerequisite    INTEGER,
    earliest_action INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS server_action (
    server_id  INTEGER NOT NULL,
    action_id  INTEGER NOT NULL REFERENCES action(id),
    status     INTEGER NOT NULL,
    PRIMARY KEY (server_id, action_id)
);
";

/// State-label -> id cache, resolved against the lookup table on first use
/// and held for the life of the store (and therefore the engine).
#[derive(Debug, Default)]
struct StateIds {
    ids: HashMap<String, i64>,
}

/// A dispatcher registration row, keyed by protocol address.
#[derive(Debug, Clone)]
pub struct RegistrationRow {
    pub id: i64,
    pub jabber_id: String,
    pub last_checkin: i64,
    pub hostname: String,
    pub password: Option<String>,
}

pub struct ClientStore {
    conn: Connection,
    states: StateIds,
}

impl ClientStore {
    /// Open (or create) the store at `path` and apply the schema
    /// idempotently. The upstream server normally owns this schema; creating
    /// it here keeps fresh deployments runnable.
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> rusqlite::Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn,
            states: StateIds::default(),
        })
    }

    /// Resolve a liveness state label to its numeric id, hitting the store
    /// only once per label for the life of this instance.
    fn state_id(&mut self, label: &str) -> rusqlite::Result<i64> {
        if let Some(id) = self.states.ids.get(label) {
            return Ok(*id);
        }
        let id: i64 = self.conn.query_row(
            "SELECT id FROM push_client_state WHERE label = ?1",
            params![label],
            |row| row.get(0),
        )?;
        self.states.ids.insert(label.to_string(), id);
        Ok(id)
    }

    /// Bulk reap: every Online client that was pinged and whose response
    /// deadline has passed goes Offline, with the outstanding deadline
    /// cleared. Returns whether any row changed.
    pub fn reap_overdue(&mut self, now: i64) -> rusqlite::Result<bool> {
        let online = self.state_id(STATE_ONLINE)?;
        let offline = self.state_id(STATE_OFFLINE)?;
        let changed = self.conn.execute(
            "UPDATE push_client
                SET state_id = :offline_id,
                    next_action_time = NULL
              WHERE state_id = :online_id
                AND last_ping_time IS NOT NULL
                AND :now > next_action_time",
            named_params! {
                ":offline_id": offline,
                ":online_id": online,
                ":now": now,
            },
        )?;
        Ok(changed > 0)
    }

    /// Online clients that were pinged at least once, are not currently
    /// awaiting a response, and have a protocol address.
    pub fn clients_needing_ping(&mut self) -> rusqlite::Result<Vec<ClientRow>> {
        let online = self.state_id(STATE_ONLINE)?;
        let mut stmt = self.conn.prepare(
            "SELECT id, name, shared_key, jabber_id
               FROM push_client
              WHERE state_id = :online_id
                AND last_ping_time IS NOT NULL
                AND next_action_time IS NULL
                AND jabber_id IS NOT NULL",
        )?;
        let rows = stmt.query_map(named_params! { ":online_id": online }, |row| {
            Ok(ClientRow {
                id: row.get(0)?,
                name: row.get(1)?,
                shared_key: row.get(2)?,
                jabber_id: row.get(3)?,
            })
        })?;
        rows.collect()
    }

    /// Mark a batch of clients as awaiting a ping response. One statement
    /// for the whole batch, so the update is never half-applied.
    pub fn schedule_pings(&mut self, ids: &[i64], deadline: i64) -> rusqlite::Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE push_client SET next_action_time = ? WHERE id IN ({placeholders})"
        );
        let values = std::iter::once(deadline).chain(ids.iter().copied());
        self.conn.execute(&sql, params_from_iter(values))?;
        Ok(())
    }

    /// Distinct servers with at least one action in PickedUp, the proxy for
    /// currently busy fleet capacity.
    pub fn running_count(&self) -> rusqlite::Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(DISTINCT server_id) FROM server_action WHERE status = ?1",
            params![ActionStatus::PickedUp.code()],
            |row| row.get(0),
        )
    }

    /// Candidate rows for the notification pass.
    ///
    /// Ordering is load-bearing: already-picked-up work is more urgent than
    /// merely queued work, then earliest action first, then server id as a
    /// deterministic tie-break so a notify cap picks the same servers
    /// run-to-run. Rows blocked by an incomplete prerequisite are excluded
    /// here.
    pub fn pending_candidates(&self, now: i64) -> rusqlite::Result<Vec<PendingRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT a.id, sa.server_id, pc.jabber_id,
                    a.earliest_action - :now AS delta
               FROM server_action sa
               JOIN action a ON sa.action_id = a.id
               JOIN push_client pc ON pc.server_id = sa.server_id
              WHERE sa.status IN (:queued, :picked_up)
                AND NOT EXISTS (
                    -- no prerequisite, or the prerequisite has completed
                    SELECT 1
                      FROM server_action sap
                     WHERE sap.server_id = sa.server_id
                       AND sap.action_id = a.prerequisite
                       AND sap.status != :completed
                )
              ORDER BY CASE sa.status WHEN :picked_up THEN 0 ELSE 1 END,
                       a.earliest_action, sa.server_id",
        )?;
        let rows = stmt.query_map(
            named_params! {
                ":now": now,
                ":queued": ActionStatus::Queued.code(),
                ":picked_up": ActionStatus::PickedUp.code(),
                ":completed": ActionStatus::Completed.code(),
            },
            |row| {
                Ok(PendingRow {
                    action_id: row.get(0)?,
                    server_id: row.get(1)?,
                    jabber_id: row.get(2)?,
                    delta: row.get(3)?,
                })
            },
        )?;
        rows.collect()
    }

    /// Whether `server_id` has a reboot action currently picked up.
    pub fn reboot_in_progress(&self, server_id: i64) -> rusqlite::Result<bool> {
        let row: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1
                   FROM server_action sa
                   JOIN action a ON sa.action_id = a.id
                   JOIN action_type at ON a.action_type = at.id
                  WHERE sa.server_id = :server_id
                    AND at.label = :label
                    AND sa.status = :picked_up",
                named_params! {
                    ":server_id": server_id,
                    ":label": REBOOT_ACTION_LABEL,
                    ":picked_up": ActionStatus::PickedUp.code(),
                },
                |row| row.get(0),
            )
            .optional()?;
        Ok(row.is_some())
    }

    /// The registration row whose address starts with `prefix`, if exactly
    /// one exists.
    pub fn dispatcher_by_prefix(&self, prefix: &str) -> rusqlite::Result<Option<(i64, Option<String>)>> {
        let pattern = format!("{prefix}%");
        let mut stmt = self
            .conn
            .prepare("SELECT id, password FROM push_dispatcher WHERE jabber_id LIKE ?1")?;
        let rows = stmt.query_map(params![pattern], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Option<String>>(1)?))
        })?;
        let mut matches: Vec<(i64, Option<String>)> = rows.collect::<rusqlite::Result<_>>()?;
        if matches.len() == 1 {
            Ok(matches.pop())
        } else {
            debug!(count = matches.len(), prefix, "no unique dispatcher row");
            Ok(None)
        }
    }

    pub fn set_dispatcher_password(&self, id: i64, password: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE push_dispatcher SET password = :password WHERE id = :id",
            named_params! { ":password": password, ":id": id },
        )?;
        Ok(())
    }

    /// First half of the registration upsert. Returns the number of rows
    /// updated; zero means the caller must insert.
    pub fn update_registration(&self, jid: &str, hostname: &str, now: i64) -> rusqlite::Result<usize> {
        self.conn.execute(
            "UPDATE push_dispatcher
                SET last_checkin = :now,
                    hostname = :hostname
              WHERE jabber_id = :jabber_id",
            named_params! { ":now": now, ":hostname": hostname, ":jabber_id": jid },
        )
    }

    /// Second half of the registration upsert.
    pub fn insert_registration(
        &self,
        jid: &str,
        hostname: &str,
        password: &str,
        now: i64,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO push_dispatcher (jabber_id, last_checkin, hostname, password)
             VALUES (:jabber_id, :now, :hostname, :password)",
            named_params! {
                ":jabber_id": jid,
                ":now": now,
                ":hostname": hostname,
                ":password": password,
            },
        )?;
        Ok(())
    }

    pub fn registration(&self, jid: &str) -> rusqlite::Result<Option<RegistrationRow>> {
        self.conn
            .query_row(
                "SELECT id, jabber_id, last_checkin, hostname, password
                   FROM push_dispatcher
                  WHERE jabber_id = ?1",
                params![jid],
                |row| {
                    Ok(RegistrationRow {
                        id: row.get(0)?,
                        jabber_id: row.get(1)?,
                        last_checkin: row.get(2)?,
                        hostname: row.get(3)?,
                        password: row.get(4)?,
                    })
                },
            )
            .optional()
    }

    pub fn registration_count(&self, jid: &str) -> rusqlite::Result<i64> {
        self.conn.query_row(
            "SELECT COUNT(*) FROM push_dispatcher WHERE jabber_id = ?1",
            params![jid],
            |row| row.get(0),
        )
    }

    /// Every known client address, for roster reconciliation.
    pub fn active_client_jids(&self) -> rusqlite::Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT jabber_id FROM push_client WHERE jabber_id IS NOT NULL")?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    }

    // ---- provisioning helpers -------------------------------------------
    // Client and action rows are owned by the upstream server; these exist
    // for fixtures and local setups.

    pub fn insert_client(
        &mut self,
        name: &str,
        jid: Option<&str>,
        server_id: Option<i64>,
    ) -> rusqlite::Result<i64> {
        let online = self.state_id(STATE_ONLINE)?;
        self.conn.execute(
            "INSERT INTO push_client (name, shared_key, state_id, jabber_id, server_id)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, format!("key-{name}"), online, jid, server_id],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn set_ping_state(
        &self,
        client_id: i64,
        last_ping: Option<i64>,
        next_action: Option<i64>,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE push_client SET last_ping_time = ?1, next_action_time = ?2 WHERE id = ?3",
            params![last_ping, next_action, client_id],
        )?;
        Ok(())
    }

    /// Liveness snapshot of one client: (state label, last ping, deadline).
    pub fn client_liveness(
        &self,
        client_id: i64,
    ) -> rusqlite::Result<(String, Option<i64>, Option<i64>)> {
        self.conn.query_row(
            "SELECT s.label, c.last_ping_time, c.next_action_time
               FROM push_client c
               JOIN push_client_state s ON c.state_id = s.id
              WHERE c.id = ?1",
            params![client_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
    }

    pub fn insert_action_type(&self, label: &str) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT OR IGNORE INTO action_type (label) VALUES (?1)",
            params![label],
        )?;
        self.conn.query_row(
            "SELECT id FROM action_type WHERE label = ?1",
            params![label],
            |row| row.get(0),
        )
    }

    pub fn insert_action(
        &self,
        action_type: Option<i64>,
        prerequisite: Option<i64>,
        earliest_action: i64,
    ) -> rusqlite::Result<i64> {
        self.conn.execute(
            "INSERT INTO action (action_type, prerequisite, earliest_action) VALUES (?1, ?2, ?3)",
            params![action_type, prerequisite, earliest_action],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn insert_server_action(
        &self,
        server_id: i64,
        action_id: i64,
        status: ActionStatus,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "INSERT INTO server_action (server_id, action_id, status) VALUES (?1, ?2, ?3)",
            params![server_id, action_id, status.code()],
        )?;
        Ok(())
    }

    pub fn set_server_action_status(
        &self,
        server_id: i64,
        action_id: i64,
        status: ActionStatus,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE server_action SET status = ?1 WHERE server_id = ?2 AND action_id = ?3",
            params![status.code(), server_id, action_id],
        )?;
        Ok(())
    }
}
