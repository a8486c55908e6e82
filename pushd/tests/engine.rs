//! Engine behavior against an in-memory store and a scripted protocol
//! client: reap/ping liveness, notification ordering and admission control,
//! roster reconciliation, and the dispatch-cycle branches.

use std::cell::Cell;
use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use push_common::config::DispatcherConfig;
use push_common::{strip_resource, ActionStatus};
use pushd::identity::{DispatcherIdentity, DISPATCHER_RESOURCE, DISPATCHER_USERNAME};
use pushd::notifier;
use pushd::pinger;
use pushd::reaper;
use pushd::roster;
use pushd::runner::{CycleOutcome, Phase, Runner};
use pushd::store::ClientStore;
use pushd::transport::{MessageKind, ProtocolClient, Readiness, Roster, TransportError};

const NOW: i64 = 1_000_000;

/// Scripted stand-in for the messaging channel.
struct MockClient {
    roster: Roster,
    available: HashSet<String>,
    all_available: bool,
    readiness: Readiness,
    sent: Vec<(String, MessageKind)>,
    subscribed: Vec<String>,
    unsubscribed: Vec<String>,
    presence_sent: usize,
    drained: usize,
}

impl MockClient {
    fn new() -> Self {
        Self {
            roster: Roster::default(),
            available: HashSet::new(),
            all_available: true,
            readiness: Readiness::Timeout,
            sent: Vec::new(),
            subscribed: Vec::new(),
            unsubscribed: Vec::new(),
            presence_sent: 0,
            drained: 0,
        }
    }

    fn checkins(&self) -> Vec<&str> {
        self.sent
            .iter()
            .filter(|(_, kind)| *kind == MessageKind::CheckIn)
            .map(|(jid, _)| jid.as_str())
            .collect()
    }

    fn pings(&self) -> Vec<&str> {
        self.sent
            .iter()
            .filter(|(_, kind)| *kind == MessageKind::Ping)
            .map(|(jid, _)| jid.as_str())
            .collect()
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    async fn retrieve_roster(&mut self) -> Result<Roster, TransportError> {
        Ok(self.roster.clone())
    }

    async fn subscribe(&mut self, jids: &[String]) -> Result<(), TransportError> {
        self.subscribed.extend_from_slice(jids);
        Ok(())
    }

    async fn unsubscribe(&mut self, jids: &[String]) -> Result<(), TransportError> {
        self.unsubscribed.extend_from_slice(jids);
        Ok(())
    }

    async fn send_presence(&mut self) -> Result<(), TransportError> {
        self.presence_sent += 1;
        Ok(())
    }

    async fn send_message(&mut self, jid: &str, kind: MessageKind) -> Result<(), TransportError> {
        self.sent.push((jid.to_string(), kind));
        Ok(())
    }

    fn is_available(&self, jid: &str) -> bool {
        self.all_available || self.available.contains(strip_resource(jid))
    }

    async fn wait(&mut self, _timeout: Duration) -> Result<Readiness, TransportError> {
        Ok(self.readiness)
    }

    async fn process_inbound(&mut self) -> Result<(), TransportError> {
        self.drained += 1;
        Ok(())
    }
}

fn store() -> ClientStore {
    ClientStore::open_in_memory().expect("in-memory store")
}

/// A client with one server action in the given status, due `delta` seconds
/// from NOW. Returns the client id.
fn client_with_action(
    store: &mut ClientStore,
    server_id: i64,
    jid: &str,
    status: ActionStatus,
    delta: i64,
) -> i64 {
    let client = store
        .insert_client(&format!("client-{server_id}"), Some(jid), Some(server_id))
        .unwrap();
    let action = store.insert_action(None, None, NOW + delta).unwrap();
    store.insert_server_action(server_id, action, status).unwrap();
    client
}

// ---- reap ----------------------------------------------------------------

#[test]
fn reap_demotes_overdue_clients_and_clears_the_deadline() {
    let mut store = store();
    let overdue = store.insert_client("overdue", Some("a@x"), Some(1)).unwrap();
    store.set_ping_state(overdue, Some(NOW - 100), Some(NOW - 1)).unwrap();
    let pending = store.insert_client("pending", Some("b@x"), Some(2)).unwrap();
    store.set_ping_state(pending, Some(NOW - 100), Some(NOW + 50)).unwrap();
    let never_pinged = store.insert_client("fresh", Some("c@x"), Some(3)).unwrap();

    assert!(reaper::sweep(&mut store, NOW).unwrap());

    let (state, _, next) = store.client_liveness(overdue).unwrap();
    assert_eq!(state, "offline");
    assert_eq!(next, None);

    let (state, _, next) = store.client_liveness(pending).unwrap();
    assert_eq!(state, "online");
    assert_eq!(next, Some(NOW + 50));

    let (state, _, _) = store.client_liveness(never_pinged).unwrap();
    assert_eq!(state, "online");

    // Second sweep is a no-op.
    assert!(!reaper::sweep(&mut store, NOW).unwrap());
}

// ---- ping scheduling -------------------------------------------------------

#[tokio::test]
async fn pinged_clients_are_not_reselected_until_the_deadline_clears() {
    let mut store = store();
    let mut protocol = MockClient::new();

    let c = store.insert_client("agent", Some("agent@x"), Some(1)).unwrap();
    store.set_ping_state(c, Some(NOW - 60), None).unwrap();
    // Never pinged before: excluded.
    store.insert_client("fresh", Some("fresh@x"), Some(2)).unwrap();
    // No address: unreachable, excluded.
    let dark = store.insert_client("dark", None, Some(3)).unwrap();
    store.set_ping_state(dark, Some(NOW - 60), None).unwrap();

    let pinged = pinger::schedule_pings(&mut store, &mut protocol, NOW, 20)
        .await
        .unwrap();
    assert_eq!(pinged, 1);
    assert_eq!(protocol.pings(), vec!["agent@x"]);

    let (_, _, next) = store.client_liveness(c).unwrap();
    assert_eq!(next, Some(NOW + 20));

    // Awaiting a response now; a second pass selects nobody.
    let pinged = pinger::schedule_pings(&mut store, &mut protocol, NOW + 5, 20)
        .await
        .unwrap();
    assert_eq!(pinged, 0);
    assert_eq!(protocol.pings().len(), 1);
}

// ---- notification pass -----------------------------------------------------

#[tokio::test]
async fn picked_up_work_is_notified_before_queued_then_by_server_id() {
    let mut store = store();
    let mut protocol = MockClient::new();

    client_with_action(&mut store, 1, "one@x", ActionStatus::Queued, -10);
    client_with_action(&mut store, 2, "two@x", ActionStatus::Queued, -10);
    client_with_action(&mut store, 3, "three@x", ActionStatus::PickedUp, -10);

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();

    assert_eq!(outcome.notified, vec!["three@x", "one@x", "two@x"]);
    assert_eq!(protocol.checkins(), vec!["three@x", "one@x", "two@x"]);
}

#[tokio::test]
async fn earlier_actions_win_within_the_same_status() {
    let mut store = store();
    let mut protocol = MockClient::new();

    client_with_action(&mut store, 1, "late@x", ActionStatus::Queued, -5);
    client_with_action(&mut store, 2, "early@x", ActionStatus::Queued, -500);

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    assert_eq!(outcome.notified, vec!["early@x", "late@x"]);
}

#[tokio::test]
async fn the_notify_threshold_caps_new_notifications() {
    let mut store = store();
    let mut protocol = MockClient::new();

    // Server 99 is busy (no push client of its own), so running_count = 1.
    let busy = store.insert_action(None, None, NOW - 100).unwrap();
    store.insert_server_action(99, busy, ActionStatus::PickedUp).unwrap();

    for server_id in 1..=5 {
        client_with_action(
            &mut store,
            server_id,
            &format!("agent{server_id}@x"),
            ActionStatus::Queued,
            -10,
        );
    }

    // threshold 2 minus 1 running leaves exactly one free slot.
    let outcome = notifier::notify_nodes(&mut store, &mut protocol, Some(2), NOW)
        .await
        .unwrap();
    assert_eq!(outcome.notified, vec!["agent1@x"]);

    // No threshold means unlimited fan-out.
    let mut protocol = MockClient::new();
    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    assert_eq!(outcome.notified.len(), 5);
}

#[tokio::test]
async fn an_exhausted_threshold_notifies_nobody() {
    let mut store = store();
    let mut protocol = MockClient::new();

    let busy = store.insert_action(None, None, NOW - 100).unwrap();
    store.insert_server_action(99, busy, ActionStatus::PickedUp).unwrap();
    client_with_action(&mut store, 1, "agent1@x", ActionStatus::Queued, -10);

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, Some(1), NOW)
        .await
        .unwrap();
    assert!(outcome.notified.is_empty());
    assert!(protocol.sent.is_empty());
}

#[tokio::test]
async fn prerequisite_blocked_actions_are_never_notified() {
    let mut store = store();
    let mut protocol = MockClient::new();

    store.insert_client("agent", Some("agent@x"), Some(1)).unwrap();
    let prereq = store.insert_action(None, None, NOW - 100).unwrap();
    store.insert_server_action(1, prereq, ActionStatus::PickedUp).unwrap();
    let dependent = store.insert_action(None, Some(prereq), NOW - 50).unwrap();
    store.insert_server_action(1, dependent, ActionStatus::Queued).unwrap();

    // The prerequisite row itself is still due, so complete it first to
    // isolate the dependent action.
    store.set_server_action_status(1, prereq, ActionStatus::Completed).unwrap();
    store.set_server_action_status(1, dependent, ActionStatus::Queued).unwrap();

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    // Prerequisite completed: the dependent action is eligible.
    assert_eq!(outcome.notified, vec!["agent@x"]);

    // Re-block it: an incomplete prerequisite excludes the dependent row.
    store.set_server_action_status(1, prereq, ActionStatus::PickedUp).unwrap();
    let mut protocol = MockClient::new();
    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    // Only the prerequisite itself (picked up, due) is notified; the
    // dependent queued action no longer adds anything after dedupe, and a
    // client with only the blocked action would not be notified at all.
    assert_eq!(outcome.notified, vec!["agent@x"]);
    assert_eq!(protocol.checkins().len(), 1);
}

#[tokio::test]
async fn a_blocked_action_alone_keeps_its_client_silent() {
    let mut store = store();
    let mut protocol = MockClient::new();

    store.insert_client("agent", Some("agent@x"), Some(1)).unwrap();
    // A failed prerequisite is not a candidate itself and never unblocks
    // its dependent.
    let prereq = store.insert_action(None, None, NOW - 100).unwrap();
    store.insert_server_action(1, prereq, ActionStatus::Failed).unwrap();
    let dependent = store.insert_action(None, Some(prereq), NOW - 50).unwrap();
    store.insert_server_action(1, dependent, ActionStatus::Queued).unwrap();

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    assert!(outcome.notified.is_empty());
}

#[tokio::test]
async fn future_actions_fold_into_the_next_poll_interval() {
    let mut store = store();
    let mut protocol = MockClient::new();

    client_with_action(&mut store, 1, "a@x", ActionStatus::Queued, 50);
    client_with_action(&mut store, 2, "b@x", ActionStatus::Queued, 10);
    client_with_action(&mut store, 3, "c@x", ActionStatus::Queued, 30);

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    assert_eq!(outcome.next_poll_interval, Some(10));
    assert!(outcome.notified.is_empty());
    assert!(protocol.sent.is_empty());
}

#[tokio::test]
async fn duplicate_addresses_get_one_message_and_consume_one_slot() {
    let mut store = store();
    let mut protocol = MockClient::new();

    // Two due actions on the same server, one client address.
    let client = store.insert_client("dup", Some("dup@x"), Some(1)).unwrap();
    assert!(client > 0);
    for _ in 0..2 {
        let action = store.insert_action(None, None, NOW - 10).unwrap();
        store.insert_server_action(1, action, ActionStatus::Queued).unwrap();
    }
    client_with_action(&mut store, 2, "other@x", ActionStatus::Queued, -5);

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, Some(2), NOW)
        .await
        .unwrap();
    // dup@x consumed one slot, not two, so other@x still fit.
    assert_eq!(outcome.notified, vec!["dup@x", "other@x"]);
    assert_eq!(protocol.checkins(), vec!["dup@x", "other@x"]);
}

#[tokio::test]
async fn a_rebooting_server_is_not_disturbed() {
    let mut store = store();
    let mut protocol = MockClient::new();

    client_with_action(&mut store, 1, "rebooting@x", ActionStatus::Queued, -10);
    let reboot_type = store.insert_action_type("reboot.reboot").unwrap();
    let reboot = store.insert_action(Some(reboot_type), None, NOW - 300).unwrap();
    store.insert_server_action(1, reboot, ActionStatus::PickedUp).unwrap();

    client_with_action(&mut store, 2, "steady@x", ActionStatus::Queued, -10);

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    assert_eq!(outcome.notified, vec!["steady@x"]);
}

#[tokio::test]
async fn unreachable_peers_are_skipped_without_aborting_the_pass() {
    let mut store = store();
    let mut protocol = MockClient::new();
    protocol.all_available = false;
    protocol.available.insert("reachable@x".to_string());

    client_with_action(&mut store, 1, "gone@x", ActionStatus::Queued, -10);
    client_with_action(&mut store, 2, "reachable@x", ActionStatus::Queued, -10);
    client_with_action(&mut store, 3, "also-gone@x", ActionStatus::Queued, -10);

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    assert_eq!(outcome.notified, vec!["reachable@x"]);
}

#[tokio::test]
async fn clients_without_an_address_are_skipped() {
    let mut store = store();
    let mut protocol = MockClient::new();

    store.insert_client("offline", None, Some(1)).unwrap();
    let action = store.insert_action(None, None, NOW - 10).unwrap();
    store.insert_server_action(1, action, ActionStatus::Queued).unwrap();

    let outcome = notifier::notify_nodes(&mut store, &mut protocol, None, NOW)
        .await
        .unwrap();
    assert!(outcome.notified.is_empty());
}

// ---- roster -----------------------------------------------------------------

#[tokio::test]
async fn reconciliation_subscribes_missing_and_drops_stale_addresses() {
    let mut store = store();
    store.insert_client("a", Some("a@x/osad"), Some(1)).unwrap();
    store.insert_client("b", Some("b@x/osad"), Some(2)).unwrap();

    let mut protocol = MockClient::new();
    protocol.roster.to.insert("b@x".to_string());
    protocol.roster.from.insert("c@x/stale".to_string());

    let changes = roster::reconcile(&store, &mut protocol).await.unwrap();
    assert_eq!(changes.subscribed, vec!["a@x"]);
    assert_eq!(changes.unsubscribed, vec!["c@x"]);
    assert_eq!(protocol.subscribed, vec!["a@x"]);
    assert_eq!(protocol.unsubscribed, vec!["c@x"]);
}

#[tokio::test]
async fn a_converged_roster_changes_nothing() {
    let mut store = store();
    store.insert_client("a", Some("a@x/osad"), Some(1)).unwrap();

    let mut protocol = MockClient::new();
    protocol.roster.both.insert("a@x".to_string());

    let changes = roster::reconcile(&store, &mut protocol).await.unwrap();
    assert!(changes.subscribed.is_empty());
    assert!(changes.unsubscribed.is_empty());
}

// ---- dispatch loop -----------------------------------------------------------

fn runner_with(config: DispatcherConfig) -> Runner {
    let mut store = store();
    let identity =
        DispatcherIdentity::resolve(&mut store, DISPATCHER_USERNAME, DISPATCHER_RESOURCE)
            .expect("identity");
    Runner::new(store, config, identity, "test-host".to_string())
}

#[tokio::test]
async fn establish_registers_and_announces_presence() {
    let mut runner = runner_with(DispatcherConfig::default());
    let mut protocol = MockClient::new();

    runner.establish(&mut protocol, NOW).await.unwrap();
    assert_eq!(runner.phase(), Phase::Steady);
    assert_eq!(protocol.presence_sent, 1);

    let jid = "push-dispatcher@localhost/dispatcher";
    let row = runner.store_mut().registration(jid).unwrap().unwrap();
    assert_eq!(row.hostname, "test-host");

    // A second establish refreshes the same row.
    runner.establish(&mut protocol, NOW + 60).await.unwrap();
    assert_eq!(runner.store_mut().registration_count(jid).unwrap(), 1);
    assert_eq!(
        runner.store_mut().registration(jid).unwrap().unwrap().last_checkin,
        NOW + 60
    );
}

#[tokio::test]
async fn a_readable_socket_defers_notification_to_the_next_cycle() {
    let mut runner = runner_with(DispatcherConfig::default());
    client_with_action(runner.store_mut(), 1, "due@x", ActionStatus::Queued, -10);

    let mut protocol = MockClient::new();
    protocol.readiness = Readiness::Readable;

    runner.establish(&mut protocol, NOW).await.unwrap();
    let outcome = runner.cycle(&mut protocol, || NOW).await.unwrap();

    assert!(matches!(outcome, CycleOutcome::DrainedInbound));
    assert_eq!(protocol.drained, 1);
    assert!(protocol.checkins().is_empty());
    assert_eq!(runner.next_poll_interval(), 10);
}

#[tokio::test]
async fn a_timeout_runs_the_notification_pass_and_folds_the_interval() {
    let mut config = DispatcherConfig::default();
    config.poll_interval = 10;
    let mut runner = runner_with(config);
    client_with_action(runner.store_mut(), 1, "due@x", ActionStatus::Queued, -10);
    client_with_action(runner.store_mut(), 2, "soon@x", ActionStatus::Queued, 7);

    let mut protocol = MockClient::new();
    runner.establish(&mut protocol, NOW).await.unwrap();

    let outcome = runner.cycle(&mut protocol, || NOW).await.unwrap();
    let CycleOutcome::Notified(pass) = outcome else {
        panic!("expected a notification pass");
    };
    assert_eq!(pass.notified, vec!["due@x"]);
    // The pending 7s action wakes us earlier than the 10s baseline.
    assert_eq!(runner.next_poll_interval(), 7);

    // Inbound traffic resets the interval to the baseline.
    protocol.readiness = Readiness::Readable;
    runner.cycle(&mut protocol, || NOW).await.unwrap();
    assert_eq!(runner.next_poll_interval(), 10);
}

#[tokio::test]
async fn an_action_that_becomes_due_during_the_wait_is_notified() {
    let mut runner = runner_with(DispatcherConfig::default());
    // Due 5 seconds after the cycle starts, i.e. while we sit in the wait.
    client_with_action(runner.store_mut(), 1, "ripens@x", ActionStatus::Queued, 5);

    let mut protocol = MockClient::new();
    runner.establish(&mut protocol, NOW).await.unwrap();

    // First read (reap/ping) sees NOW; the post-wait read sees NOW + 8.
    let calls = Cell::new(0);
    let outcome = runner
        .cycle(&mut protocol, || {
            let n = calls.get();
            calls.set(n + 1);
            if n == 0 {
                NOW
            } else {
                NOW + 8
            }
        })
        .await
        .unwrap();

    let CycleOutcome::Notified(pass) = outcome else {
        panic!("expected a notification pass");
    };
    assert_eq!(pass.notified, vec!["ripens@x"]);
    assert_eq!(protocol.checkins(), vec!["ripens@x"]);
}

#[tokio::test]
async fn a_cycle_reaps_and_schedules_pings_before_waiting() {
    let mut runner = runner_with(DispatcherConfig::default());
    let store = runner.store_mut();
    let overdue = store.insert_client("overdue", Some("overdue@x"), Some(1)).unwrap();
    store.set_ping_state(overdue, Some(NOW - 100), Some(NOW - 1)).unwrap();
    let quiet = store.insert_client("quiet", Some("quiet@x"), Some(2)).unwrap();
    store.set_ping_state(quiet, Some(NOW - 100), None).unwrap();

    let mut protocol = MockClient::new();
    runner.establish(&mut protocol, NOW).await.unwrap();
    runner.cycle(&mut protocol, || NOW).await.unwrap();

    // The overdue client was reaped, not pinged.
    let (state, _, _) = runner.store_mut().client_liveness(overdue).unwrap();
    assert_eq!(state, "offline");
    assert_eq!(protocol.pings(), vec!["quiet@x"]);
    let (_, _, next) = runner.store_mut().client_liveness(quiet).unwrap();
    assert_eq!(next, Some(NOW + 20));
}
