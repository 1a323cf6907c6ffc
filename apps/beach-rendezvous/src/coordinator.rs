//! The signaling coordinator: sole owner of the registry, the negotiation
//! tracker and the connection table.
//!
//! Every transport event is applied by one task, one event at a time, and
//! each handler runs to completion (including its presence broadcast)
//! before the next event is taken off the queue. That is the only ordering
//! mechanism; there are no locks around the state.

use std::collections::VecDeque;

use chrono::Utc;
use metrics::{counter, gauge};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::envelope::{Envelope, EnvelopeKind};
use crate::negotiation::SessionTracker;
use crate::presence::PresenceBroadcaster;
use crate::registry::ConnectionRegistry;
use crate::router::{Delivery, MessageRouter};
use crate::transport::{ConnectionId, ConnectionTable, Frame};

const CAUSE_DISCONNECTED: &str = "disconnected";
const CAUSE_WRITE_FAILURE: &str = "transport_write_failure";

#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorConfig {
    /// Drop answers that match no pending offer instead of forwarding them.
    pub strict_negotiation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub connections: usize,
    pub participants: usize,
    pub sessions_offer_pending: usize,
    pub sessions_established: usize,
    pub presence_broadcasts: u64,
    pub envelopes_routed: u64,
    pub envelopes_dropped: u64,
}

pub struct SignalingCoordinator {
    registry: ConnectionRegistry,
    tracker: SessionTracker,
    presence: PresenceBroadcaster,
    transport: ConnectionTable,
    config: CoordinatorConfig,
    routed: u64,
    dropped: u64,
}

impl SignalingCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            registry: ConnectionRegistry::new(),
            tracker: SessionTracker::new(),
            presence: PresenceBroadcaster::new(),
            transport: ConnectionTable::new(),
            config,
            routed: 0,
            dropped: 0,
        }
    }

    pub fn connected(&mut self, connection: ConnectionId, outbound: mpsc::Sender<Frame>) {
        self.transport.attach(connection, outbound);
        counter!("rendezvous_connections_total", 1);
        info!(connection_id = %connection, "transport connected");
        self.record_gauges();
    }

    pub fn message_received(&mut self, connection: ConnectionId, raw: &str) {
        if !self.transport.contains(connection) {
            debug!(connection_id = %connection, "ignoring envelope from retired connection");
            return;
        }

        let envelope = match Envelope::parse(raw) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(connection_id = %connection, error = %err, "dropping envelope");
                counter!("rendezvous_envelopes_dropped_total", 1, "reason" => err.metric_label());
                self.dropped += 1;
                return;
            }
        };

        let outcome = MessageRouter::new(
            &self.registry,
            &mut self.tracker,
            &self.transport,
            self.config.strict_negotiation,
        )
        .route(connection, &envelope);
        match outcome.delivery {
            Delivery::Dropped(_) => self.dropped += 1,
            Delivery::Forwarded { .. } | Delivery::Broadcast { .. } => self.routed += 1,
        }

        let mut failed = outcome.failed;
        if envelope.kind() == EnvelopeKind::Register && !failed.contains(&connection) {
            failed.extend(self.register(connection, &envelope));
        }
        self.retire(failed.into_iter().map(|id| (id, CAUSE_WRITE_FAILURE)));
    }

    pub fn disconnected(&mut self, connection: ConnectionId) {
        self.retire([(connection, CAUSE_DISCONNECTED)]);
    }

    pub fn stats(&self) -> CoordinatorStats {
        let sessions = self.tracker.counts();
        CoordinatorStats {
            connections: self.transport.len(),
            participants: self.registry.len(),
            sessions_offer_pending: sessions.offer_pending,
            sessions_established: sessions.established,
            presence_broadcasts: self.presence.announcements(),
            envelopes_routed: self.routed,
            envelopes_dropped: self.dropped,
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    /// Returns the connections that failed to receive the presence update.
    fn register(&mut self, connection: ConnectionId, envelope: &Envelope) -> Vec<ConnectionId> {
        let name = match envelope.registration_name() {
            Ok(name) => name,
            Err(err) => {
                warn!(connection_id = %connection, error = %err, "registration rejected");
                counter!("rendezvous_envelopes_dropped_total", 1, "reason" => err.metric_label());
                return Vec::new();
            }
        };
        let joined_at = envelope
            .date()
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        match self.registry.register(connection, name, joined_at) {
            Ok(participant) => {
                info!(
                    connection_id = %connection,
                    name = %participant.name,
                    "participant registered"
                );
            }
            Err(err) => {
                warn!(connection_id = %connection, error = %err, "registration rejected");
                counter!("rendezvous_envelopes_dropped_total", 1, "reason" => err.metric_label());
                return Vec::new();
            }
        }

        let report = self.presence.announce(&self.registry, &self.transport);
        self.record_gauges();
        report.failed
    }

    /// Removes connections from every structure. Connections that fail to
    /// receive the resulting presence updates are retired in the same pass.
    fn retire(&mut self, connections: impl IntoIterator<Item = (ConnectionId, &'static str)>) {
        let mut pending: VecDeque<(ConnectionId, &'static str)> = connections.into_iter().collect();
        if pending.is_empty() {
            return;
        }

        while let Some((connection, cause)) = pending.pop_front() {
            let detached = self.transport.detach(connection);
            let teardown = self.tracker.teardown(connection);
            let removed = self.registry.unregister(connection);

            if detached {
                counter!("rendezvous_connections_closed_total", 1, "cause" => cause);
                if cause == CAUSE_WRITE_FAILURE {
                    warn!(connection_id = %connection, "retiring connection after write failure");
                } else {
                    info!(connection_id = %connection, "transport disconnected");
                }
            }
            if teardown.sessions > 0 {
                debug!(
                    connection_id = %connection,
                    sessions = teardown.sessions,
                    abandoned = teardown.abandoned,
                    candidates_discarded = teardown.candidates_discarded,
                    "negotiation sessions torn down"
                );
            }

            if let Some(participant) = removed {
                info!(
                    connection_id = %connection,
                    name = %participant.name,
                    "participant left"
                );
                let report = self.presence.announce(&self.registry, &self.transport);
                for failed in report.failed {
                    if !pending.iter().any(|(id, _)| *id == failed) {
                        pending.push_back((failed, CAUSE_WRITE_FAILURE));
                    }
                }
            }
        }

        self.record_gauges();
    }

    fn record_gauges(&self) {
        gauge!("rendezvous_connections_active", self.transport.len() as f64);
        gauge!("rendezvous_participants_active", self.registry.len() as f64);
    }

    /// Moves the coordinator onto its own task and returns the handle that
    /// feeds it. The task ends once every handle is dropped.
    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        (CoordinatorHandle { events: tx }, task)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<CoordinatorEvent>) {
        while let Some(event) = events.recv().await {
            self.handle(event);
        }
        debug!("signaling coordinator stopped");
    }

    fn handle(&mut self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::Connected {
                connection,
                outbound,
            } => self.connected(connection, outbound),
            CoordinatorEvent::Message { connection, text } => {
                self.message_received(connection, &text)
            }
            CoordinatorEvent::Disconnected { connection } => self.disconnected(connection),
            CoordinatorEvent::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }
}

#[derive(Debug)]
pub enum CoordinatorEvent {
    Connected {
        connection: ConnectionId,
        outbound: mpsc::Sender<Frame>,
    },
    Message {
        connection: ConnectionId,
        text: String,
    },
    Disconnected {
        connection: ConnectionId,
    },
    Stats {
        reply: oneshot::Sender<CoordinatorStats>,
    },
}

#[derive(Debug, Error)]
#[error("signaling coordinator has stopped")]
pub struct CoordinatorStopped;

#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    events: mpsc::UnboundedSender<CoordinatorEvent>,
}

impl CoordinatorHandle {
    pub fn connected(
        &self,
        connection: ConnectionId,
        outbound: mpsc::Sender<Frame>,
    ) -> Result<(), CoordinatorStopped> {
        self.send(CoordinatorEvent::Connected {
            connection,
            outbound,
        })
    }

    pub fn message(&self, connection: ConnectionId, text: String) -> Result<(), CoordinatorStopped> {
        self.send(CoordinatorEvent::Message { connection, text })
    }

    pub fn disconnected(&self, connection: ConnectionId) -> Result<(), CoordinatorStopped> {
        self.send(CoordinatorEvent::Disconnected { connection })
    }

    pub async fn stats(&self) -> Result<CoordinatorStats, CoordinatorStopped> {
        let (reply, response) = oneshot::channel();
        self.send(CoordinatorEvent::Stats { reply })?;
        response.await.map_err(|_| CoordinatorStopped)
    }

    fn send(&self, event: CoordinatorEvent) -> Result<(), CoordinatorStopped> {
        self.events.send(event).map_err(|_| CoordinatorStopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::NegotiationPhase;
    use crate::presence::PresenceSnapshot;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::collections::HashMap;

    struct Harness {
        coordinator: SignalingCoordinator,
        inboxes: HashMap<ConnectionId, mpsc::Receiver<Frame>>,
    }

    impl Harness {
        fn new(config: CoordinatorConfig) -> Self {
            Self {
                coordinator: SignalingCoordinator::new(config),
                inboxes: HashMap::new(),
            }
        }

        fn connect(&mut self) -> ConnectionId {
            let id = ConnectionId::new();
            let (tx, rx) = mpsc::channel(64);
            self.coordinator.connected(id, tx);
            self.inboxes.insert(id, rx);
            id
        }

        fn join(&mut self, name: &str) -> ConnectionId {
            let id = self.connect();
            self.send(id, &crate::envelope::register_frame(name, 0));
            id
        }

        fn send(&mut self, id: ConnectionId, raw: &str) {
            self.coordinator.message_received(id, raw);
        }

        fn frames(&mut self, id: ConnectionId) -> Vec<String> {
            let rx = self.inboxes.get_mut(&id).unwrap();
            let mut frames = Vec::new();
            while let Ok(frame) = rx.try_recv() {
                frames.push(frame.to_string());
            }
            frames
        }

        fn drain_all(&mut self) {
            let ids: Vec<_> = self.inboxes.keys().copied().collect();
            for id in ids {
                self.frames(id);
            }
        }

        fn presence(&mut self, id: ConnectionId) -> Vec<PresenceSnapshot> {
            self.frames(id)
                .iter()
                .filter_map(|f| serde_json::from_str::<PresenceSnapshot>(f).ok())
                .collect()
        }

        fn envelopes(&mut self, id: ConnectionId) -> Vec<String> {
            self.frames(id)
                .into_iter()
                .filter(|f| serde_json::from_str::<PresenceSnapshot>(f).is_err())
                .collect()
        }
    }

    #[test]
    fn alice_and_bob_negotiate() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let alice = h.join("alice");
        let bob = h.join("bob");

        let latest = h.presence(alice).pop().unwrap();
        assert_eq!(latest.names(), ["alice", "bob"]);
        assert_eq!(h.presence(bob).pop().unwrap(), latest);

        let offer = r#"{"type":"offer","name":"alice","target":"bob","sdp":{"type":"offer","sdp":"v=0"}}"#;
        h.send(alice, offer);
        assert_eq!(h.envelopes(bob), [offer]);
        assert!(h.envelopes(alice).is_empty());

        let answer = r#"{"type":"answer","name":"bob","target":"alice","sdp":{"type":"answer","sdp":"v=0"}}"#;
        h.send(bob, answer);
        assert_eq!(h.envelopes(alice), [answer]);
        assert!(h.envelopes(bob).is_empty());

        assert_eq!(
            h.coordinator.tracker().phase(alice, bob),
            Some(NegotiationPhase::Established)
        );
        let stats = h.coordinator.stats();
        assert_eq!(stats.sessions_established, 1);
        assert_eq!(stats.participants, 2);
    }

    #[test]
    fn caller_leaving_mid_negotiation_tears_down_session() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let alice = h.join("alice");
        let bob = h.join("bob");
        h.send(alice, r#"{"type":"offer","name":"alice","target":"bob"}"#);
        assert_eq!(
            h.coordinator.tracker().phase(alice, bob),
            Some(NegotiationPhase::OfferPending)
        );
        h.drain_all();

        h.coordinator.disconnected(alice);
        assert_eq!(h.coordinator.tracker().phase(alice, bob), None);
        assert_eq!(h.presence(bob).pop().unwrap().names(), ["bob"]);

        let dropped_before = h.coordinator.stats().envelopes_dropped;
        h.send(bob, r#"{"type":"answer","name":"bob","target":"alice"}"#);
        assert!(h.frames(bob).is_empty());
        assert_eq!(h.coordinator.stats().envelopes_dropped, dropped_before + 1);
    }

    #[test]
    fn register_envelope_is_broadcast_before_presence() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let lurker = h.connect();
        let alice = h.connect();
        let raw = r#"{"type":"register","name":"alice","date":1700000000000}"#;
        h.send(alice, raw);

        let frames = h.frames(lurker);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], raw);
        let snapshot: PresenceSnapshot = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(snapshot.users[0].joined_at, 1_700_000_000_000);
        assert_eq!(snapshot.users[0].connection, alice);
    }

    #[test]
    fn duplicate_registration_keeps_first_name() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let alice = h.join("alice");
        h.drain_all();

        h.send(alice, &crate::envelope::register_frame("mallory", 1));
        assert!(h.presence(alice).is_empty());
        assert_eq!(h.coordinator.registry().resolve("alice").unwrap(), alice);
        assert!(h.coordinator.registry().resolve("mallory").is_err());
        assert_eq!(h.coordinator.stats().presence_broadcasts, 1);
    }

    #[test]
    fn shared_names_route_to_first_registration() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let sender = h.join("dave");
        let first = h.join("carol");
        let second = h.join("carol");
        h.drain_all();

        for _ in 0..5 {
            h.send(sender, r#"{"type":"offer","target":"carol"}"#);
        }
        assert_eq!(h.envelopes(first).len(), 5);
        assert!(h.envelopes(second).is_empty());
    }

    #[test]
    fn malformed_envelopes_are_dropped_quietly() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let alice = h.join("alice");
        let bob = h.join("bob");
        h.drain_all();

        h.send(alice, "{not json");
        h.send(alice, r#"{"name":"alice"}"#);
        assert!(h.frames(bob).is_empty());
        assert_eq!(h.coordinator.stats().envelopes_dropped, 2);

        // routed like any envelope, but binds nothing
        h.send(alice, &crate::envelope::register_frame("", 0));
        assert!(h.presence(bob).is_empty());
        assert_eq!(h.coordinator.registry().len(), 2);

        h.send(alice, r#"{"type":"offer","target":"bob"}"#);
        assert_eq!(h.envelopes(bob), [r#"{"type":"offer","target":"bob"}"#]);
    }

    #[test]
    fn peers_cannot_forge_presence_snapshots() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let a = h.connect();
        let b = h.connect();

        let spoof = r#"{"type":"chat","users":[{"name":"ghost","id":"67e55044-10b1-426f-9247-bb680e5fe0c8","date":1}]}"#;
        h.send(a, spoof);
        assert!(h.frames(a).is_empty());
        assert!(h.frames(b).is_empty());
        assert!(h.coordinator.registry().is_empty());
        assert_eq!(h.coordinator.stats().envelopes_dropped, 1);

        // an ordinary broadcast never classifies as presence
        h.send(a, r#"{"type":"chat","text":"hi"}"#);
        assert!(h.presence(b).is_empty());
    }

    #[test]
    fn write_failure_retires_connection_and_updates_presence() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let alice = h.join("alice");
        let bob = h.join("bob");
        h.send(alice, r#"{"type":"offer","target":"bob"}"#);
        h.drain_all();

        // bob's writer is gone
        h.inboxes.remove(&bob);
        h.send(alice, r#"{"type":"ice-candidate","candidate":{}}"#);

        assert!(h.coordinator.registry().resolve("bob").is_err());
        assert_eq!(h.coordinator.tracker().phase(alice, bob), None);
        let frames = h.frames(alice);
        assert_eq!(frames.len(), 2);
        let snapshot: PresenceSnapshot = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(snapshot.names(), ["alice"]);
        assert_eq!(h.coordinator.stats().connections, 1);
    }

    #[test]
    fn cascading_write_failures_are_retired_in_one_event() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let alice = h.join("alice");
        let bob = h.join("bob");
        let carol = h.join("carol");
        h.drain_all();
        h.inboxes.remove(&bob);
        h.inboxes.remove(&carol);

        h.coordinator.disconnected(alice);
        let stats = h.coordinator.stats();
        assert_eq!(stats.connections, 0);
        assert_eq!(stats.participants, 0);
    }

    #[test]
    fn retired_connections_are_ignored() {
        let mut h = Harness::new(CoordinatorConfig::default());
        let alice = h.join("alice");
        let bob = h.join("bob");
        h.coordinator.disconnected(alice);
        h.coordinator.disconnected(alice);
        h.drain_all();

        h.send(alice, r#"{"type":"offer","target":"bob"}"#);
        h.send(alice, &crate::envelope::register_frame("alice", 0));
        assert!(h.frames(bob).is_empty());
        assert!(h.coordinator.registry().resolve("alice").is_err());
    }

    #[test]
    fn strict_mode_drops_stray_answers() {
        let mut h = Harness::new(CoordinatorConfig {
            strict_negotiation: true,
        });
        let alice = h.join("alice");
        let bob = h.join("bob");
        h.drain_all();

        h.send(bob, r#"{"type":"answer","target":"alice"}"#);
        assert!(h.frames(alice).is_empty());

        h.send(alice, r#"{"type":"offer","target":"bob"}"#);
        h.send(bob, r#"{"type":"answer","target":"alice"}"#);
        assert_eq!(h.envelopes(alice).len(), 1);
    }

    #[test]
    fn presence_always_matches_registry() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut h = Harness::new(CoordinatorConfig::default());
        let observer = h.connect();
        let names = ["ana", "ben", "cy", "ana", "dot"];
        let mut online: Vec<(ConnectionId, String)> = Vec::new();

        for _ in 0..500 {
            if online.is_empty() || rng.gen_bool(0.55) {
                let name = names[rng.gen_range(0..names.len())];
                let id = h.join(name);
                online.push((id, name.to_string()));
            } else {
                let index = rng.gen_range(0..online.len());
                let (id, _) = online.remove(index);
                h.coordinator.disconnected(id);
                h.inboxes.remove(&id);
            }

            // exactly one snapshot per mutation, reflecting it
            let snapshots = h.presence(observer);
            assert_eq!(snapshots.len(), 1);
            let expected: Vec<(ConnectionId, String)> = snapshots[0]
                .users
                .iter()
                .map(|p| (p.connection, p.name.clone()))
                .collect();
            assert_eq!(expected, online);
            assert_eq!(snapshots[0].users, h.coordinator.registry().snapshot());
            h.drain_all();
        }
    }
}
