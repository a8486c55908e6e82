//! Dispatch loop state machine.
//!
//! Connecting -> Registering -> Steady, back to Connecting (via
//! Reconnecting) on any fatal transport or store error. Exactly one logical
//! thread of control runs the loop; the only suspension point in a steady
//! cycle is the combined socket-or-timeout wait, so reap always precedes
//! ping scheduling, which always precedes the wait, and no two notification
//! passes ever overlap.

use std::time::Duration;

use chrono::Utc;
use tokio::time::sleep;
use tracing::{debug, error, info};

use push_common::config::DispatcherConfig;

use crate::identity::DispatcherIdentity;
use crate::notifier::{self, NotificationOutcome};
use crate::store::ClientStore;
use crate::transport::{ProtocolClient, Readiness, TcpProtocolClient};
use crate::{pinger, reaper, roster, DispatchError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Registering,
    Steady,
    Reconnecting,
}

/// What one steady cycle did after its wait returned.
#[derive(Debug)]
pub enum CycleOutcome {
    /// Socket became readable; inbound events were drained and notification
    /// was deferred to the next cycle.
    DrainedInbound,
    /// The wait timed out; a notification pass ran.
    Notified(NotificationOutcome),
}

pub struct Runner {
    store: ClientStore,
    config: DispatcherConfig,
    identity: DispatcherIdentity,
    hostname: String,
    jid: String,
    phase: Phase,
    /// Seconds until the next proactive wake-up; reset to the baseline every
    /// cycle and only lowered by the notification pass.
    next_poll_interval: i64,
}

impl Runner {
    pub fn new(
        store: ClientStore,
        config: DispatcherConfig,
        identity: DispatcherIdentity,
        hostname: String,
    ) -> Self {
        let host = config
            .server
            .split(':')
            .next()
            .unwrap_or(config.server.as_str())
            .to_string();
        let jid = identity.jid(&host);
        let baseline = config.poll_interval as i64;
        Self {
            store,
            config,
            identity,
            hostname,
            jid,
            phase: Phase::Connecting,
            next_poll_interval: baseline,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn next_poll_interval(&self) -> i64 {
        self.next_poll_interval
    }

    /// Run until the process is told to stop. Every fatal error tears the
    /// connection down and re-enters Connecting after a fixed backoff.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            self.phase = Phase::Connecting;
            info!(server = %self.config.server, jid = %self.jid, "connecting");
            match TcpProtocolClient::connect(
                &self.config.server,
                &self.jid,
                &self.identity.password,
            )
            .await
            {
                Ok(mut protocol) => {
                    if let Err(err) = self.drive(&mut protocol).await {
                        error!(%err, "connection failed");
                    }
                }
                Err(err) => {
                    error!(%err, "could not connect");
                }
            }
            self.phase = Phase::Reconnecting;
            let backoff = Duration::from_secs(self.config.reconnect_backoff);
            info!(seconds = self.config.reconnect_backoff, "reconnecting after backoff");
            sleep(backoff).await;
        }
    }

    async fn drive<P: ProtocolClient + ?Sized>(
        &mut self,
        protocol: &mut P,
    ) -> Result<(), DispatchError> {
        self.establish(protocol, Utc::now().timestamp()).await?;
        loop {
            self.cycle(protocol, || Utc::now().timestamp()).await?;
        }
    }

    /// Registering phase: refresh the registration row, reconcile the
    /// roster, announce presence. Runs once per connection.
    pub async fn establish<P: ProtocolClient + ?Sized>(
        &mut self,
        protocol: &mut P,
        now: i64,
    ) -> Result<(), DispatchError> {
        self.phase = Phase::Registering;
        self.identity
            .register_or_refresh(&self.store, &self.jid, &self.hostname, now)?;
        let changes = roster::reconcile(&self.store, protocol).await?;
        debug!(
            subscribed = changes.subscribed.len(),
            unsubscribed = changes.unsubscribed.len(),
            "roster reconciled"
        );
        protocol.send_presence().await?;
        self.next_poll_interval = self.config.poll_interval as i64;
        self.phase = Phase::Steady;
        info!("entering steady state");
        Ok(())
    }

    /// One steady cycle: roster refresh, reap, ping scheduling, then the
    /// combined wait. Inbound traffic wins over outbound notification; the
    /// notification pass only runs on the timeout branch. `clock` is read
    /// again after the wait, so an action that became due while we slept is
    /// notified in this pass instead of folding as still-future.
    pub async fn cycle<P, C>(
        &mut self,
        protocol: &mut P,
        clock: C,
    ) -> Result<CycleOutcome, DispatchError>
    where
        P: ProtocolClient + ?Sized,
        C: Fn() -> i64,
    {
        let now = clock();
        let _ = protocol.retrieve_roster().await?;
        reaper::sweep(&mut self.store, now)?;
        pinger::schedule_pings(&mut self.store, protocol, now, self.config.ping_timeout).await?;

        let wait = Duration::from_secs(self.next_poll_interval.max(0) as u64);
        let baseline = self.config.poll_interval as i64;
        self.next_poll_interval = baseline;

        match protocol.wait(wait).await? {
            Readiness::Readable => {
                protocol.process_inbound().await?;
                Ok(CycleOutcome::DrainedInbound)
            }
            Readiness::Timeout => {
                let now = clock();
                let outcome =
                    notifier::notify_nodes(&mut self.store, protocol, self.config.notify_threshold, now)
                        .await?;
                if let Some(computed) = outcome.next_poll_interval {
                    self.next_poll_interval = baseline.min(computed);
                }
                Ok(CycleOutcome::Notified(outcome))
            }
        }
    }

    /// Store handle, for fixtures in tests.
    pub fn store_mut(&mut self) -> &mut ClientStore {
        &mut self.store
    }
}
