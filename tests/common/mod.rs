#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing,
    dead_code
)]
//! Shared test utilities for peer-lobby integration tests.
//!
//! - [`Peer`] drives a [`Session`] directly, with detached connection handles
//!   whose outbound text is captured per remote peer.
//! - [`Mesh`] wires several `Peer`s together and relays captured text until
//!   nothing is left in flight.
//! - [`RawPeer`] is a hand-driven participant on a [`MemoryBroker`], used to
//!   forge or inspect wire traffic against a running `LobbyClient`.

use std::collections::BTreeMap;
use std::time::Duration;

use peer_lobby::protocol::{self, Message, Payload, PeerId, Snapshot};
use peer_lobby::transports::{MemoryBroker, MemoryConnection, MemoryNetwork};
use peer_lobby::{
    ConnectionHandle, LobbyClient, LobbyEvent, LobbyView, PeerNetwork, Session, SessionConfig,
    Transport,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Install a `tracing` subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ── Wire helpers ────────────────────────────────────────────────────

pub fn encode(message: &Message) -> String {
    protocol::encode(message).unwrap()
}

pub fn decode(text: &str) -> Message {
    protocol::decode(text).unwrap()
}

pub fn message(from: &str, payload: Payload) -> Message {
    Message::new(from, payload)
}

// ── Session-level peer ──────────────────────────────────────────────

/// A [`Session`] plus everything needed to observe it.
pub struct Peer {
    pub session: Session,
    pub events: mpsc::Receiver<LobbyEvent>,
    outboxes: BTreeMap<PeerId, mpsc::UnboundedReceiver<String>>,
}

impl Default for Peer {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}

impl Peer {
    pub fn new(config: SessionConfig) -> Self {
        let (tx, events) = mpsc::channel(4096);
        Self {
            session: Session::new(&config, tx),
            events,
            outboxes: BTreeMap::new(),
        }
    }

    pub fn hosting(lobby_id: &str, display_name: &str) -> Self {
        let mut peer = Self::default();
        peer.session.register_host(lobby_id, display_name).unwrap();
        peer
    }

    pub fn joining(my_id: &str, lobby_id: &str, display_name: &str) -> Self {
        let mut peer = Self::default();
        peer.session
            .register_join(my_id, lobby_id, display_name)
            .unwrap();
        peer
    }

    /// Register a detached connection to `peer_id`.
    pub fn open(&mut self, peer_id: &str) {
        let (handle, rx) = ConnectionHandle::detached(peer_id);
        self.session.connection_opened(handle).unwrap();
        self.outboxes.insert(peer_id.to_string(), rx);
    }

    /// Everything sent to `peer_id` since the last call.
    pub fn take_sent(&mut self, peer_id: &str) -> Vec<String> {
        let mut sent = Vec::new();
        if let Some(rx) = self.outboxes.get_mut(peer_id) {
            while let Ok(text) = rx.try_recv() {
                sent.push(text);
            }
        }
        sent
    }

    pub fn take_sent_messages(&mut self, peer_id: &str) -> Vec<Message> {
        self.take_sent(peer_id).iter().map(|t| decode(t)).collect()
    }

    /// Deliver a message as if it arrived on `peer_id`'s connection.
    pub fn deliver(&mut self, peer_id: &str, message: &Message) {
        self.deliver_text(peer_id, &encode(message));
    }

    pub fn deliver_text(&mut self, peer_id: &str, text: &str) {
        self.session.handle_data(peer_id, text, Instant::now());
    }

    pub fn drain_events(&mut self) -> Vec<LobbyEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn view(&self) -> LobbyView {
        self.session.view()
    }

    fn drain_outboxes(&mut self) -> Vec<(PeerId, String)> {
        let mut batch = Vec::new();
        for (to, rx) in &mut self.outboxes {
            while let Ok(text) = rx.try_recv() {
                batch.push((to.clone(), text));
            }
        }
        batch
    }
}

/// Assert every team's `member_ids` equals the members pointing at it.
pub fn assert_teams_derived(view: &LobbyView) {
    for team in view.team_lookup.values() {
        let mut expected: Vec<&str> = view
            .member_lookup
            .values()
            .filter(|m| m.team_id.as_deref() == Some(team.id.as_str()))
            .map(|m| m.id.as_str())
            .collect();
        let mut actual: Vec<&str> = team.member_ids.iter().map(String::as_str).collect();
        expected.sort_unstable();
        actual.sort_unstable();
        assert_eq!(actual, expected, "team {} membership drifted", team.id);
    }
}

// ── Mesh ────────────────────────────────────────────────────────────

/// Several session-level peers with relayed connections.
#[derive(Default)]
pub struct Mesh {
    pub peers: BTreeMap<PeerId, Peer>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&mut self, lobby_id: &str, display_name: &str) {
        self.peers
            .insert(lobby_id.to_string(), Peer::hosting(lobby_id, display_name));
    }

    /// Register `my_id` as a joiner, connect it to the host and send the
    /// introduction. Call [`pump`](Self::pump) to let the exchange run.
    pub fn join(&mut self, my_id: &str, lobby_id: &str, display_name: &str) {
        self.peers.insert(
            my_id.to_string(),
            Peer::joining(my_id, lobby_id, display_name),
        );
        self.link(my_id, lobby_id);
        self.peer_mut(my_id).session.introduce_to_host().unwrap();
    }

    pub fn link(&mut self, a: &str, b: &str) {
        self.peer_mut(a).open(b);
        self.peer_mut(b).open(a);
    }

    /// Relay captured text until every outbox is empty. Returns the number of
    /// frames delivered.
    pub fn pump(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            let mut batch = Vec::new();
            for (from, peer) in &mut self.peers {
                for (to, text) in peer.drain_outboxes() {
                    batch.push((from.clone(), to, text));
                }
            }
            if batch.is_empty() {
                return delivered;
            }
            delivered += batch.len();
            for (from, to, text) in batch {
                if let Some(peer) = self.peers.get_mut(&to) {
                    peer.deliver_text(&from, &text);
                }
            }
        }
    }

    /// Both sides observe the connection between `a` and `b` closing.
    pub fn disconnect(&mut self, a: &str, b: &str) {
        self.peer_mut(a).session.connection_closed(b);
        self.peer_mut(a).outboxes.remove(b);
        if let Some(peer) = self.peers.get_mut(b) {
            peer.session.connection_closed(a);
            peer.outboxes.remove(a);
        }
    }

    pub fn peer(&self, id: &str) -> &Peer {
        self.peers
            .get(id)
            .unwrap_or_else(|| panic!("no peer {id}"))
    }

    pub fn peer_mut(&mut self, id: &str) -> &mut Peer {
        self.peers
            .get_mut(id)
            .unwrap_or_else(|| panic!("no peer {id}"))
    }

    pub fn view(&self, id: &str) -> LobbyView {
        self.peer(id).view()
    }
}

// ── Raw broker participant ──────────────────────────────────────────

/// A participant on a [`MemoryBroker`] driven by hand.
pub struct RawPeer {
    pub id: PeerId,
    pub network: MemoryNetwork,
}

impl RawPeer {
    pub async fn listen(broker: &MemoryBroker, id: &str) -> Self {
        let mut network = broker.network();
        network.listen(&id.to_string()).await.unwrap();
        Self {
            id: id.to_string(),
            network,
        }
    }

    pub async fn dial(&mut self, peer_id: &str) -> MemoryConnection {
        self.network.connect(&peer_id.to_string()).await.unwrap()
    }

    pub async fn accept(&mut self) -> (PeerId, MemoryConnection) {
        tokio::time::timeout(Duration::from_secs(30), self.network.accept())
            .await
            .expect("timed out waiting for an incoming connection")
            .expect("network closed")
            .unwrap()
    }

    pub async fn send(&self, conn: &mut MemoryConnection, payload: Payload) -> Message {
        let message = Message::new(self.id.clone(), payload);
        conn.send(encode(&message)).await.unwrap();
        message
    }
}

/// Next decoded message on `conn`, failing after `within`.
pub async fn recv_message(conn: &mut MemoryConnection, within: Duration) -> Message {
    let text = tokio::time::timeout(within, conn.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("connection closed")
        .unwrap();
    decode(&text)
}

/// Wait for an event matching `pred`, skipping everything else.
pub async fn next_event<F>(events: &mut mpsc::Receiver<LobbyEvent>, mut pred: F) -> LobbyEvent
where
    F: FnMut(&LobbyEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(60), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll the client's view until `pred` holds.
pub async fn wait_for_view<F>(client: &LobbyClient, mut pred: F) -> LobbyView
where
    F: FnMut(&LobbyView) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = client.view().await;
            if pred(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for view")
}

/// A snapshot as a host with the given members (in join order) would send it.
pub fn snapshot_of(members: &[(&str, &str)]) -> Snapshot {
    let mut roster = peer_lobby::Roster::new(peer_lobby::config::default_teams());
    let Some(((host_id, host_name), rest)) = members.split_first() else {
        return Snapshot::default();
    };
    roster.host(*host_id, *host_name);
    for (id, name) in rest {
        roster.upsert_member(id, name);
        roster.admit(id).unwrap();
    }
    roster.snapshot()
}
