//! Session controller: the single writer of lobby state.
//!
//! [`Session`] is synchronous. Every inbound message, connection event, timer
//! and user action is fed to it one at a time by the
//! [`LobbyClient`](crate::LobbyClient) loop, so roster updates never interleave.
//! Tests can drive it directly with [`ConnectionHandle::detached`] handles.
//!
//! Inbound pipeline for one data frame:
//!
//! 1. decode; a failure is noted and reported, the connection stays up
//! 2. the claimed `from` must equal the connection's remote id
//! 3. the `uniqueId` must be new to the [`DeliveryTracker`]
//! 4. exactly one handler runs, chosen by an exhaustive `match` on the payload
//! 5. the handler either finishes the message or asks for a retry, which the
//!    [`RetryQueue`] fires later with the same message

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::SessionConfig;
use crate::delivery::{DeliveryTracker, RetryDecision, RetryQueue};
use crate::error::{LobbyError, Result};
use crate::error_codes::ErrorCode;
use crate::event::LobbyEvent;
use crate::lobby::{LobbyPhase, LobbyView, Roster};
use crate::protocol::{self, Message, MessageId, Payload, PeerId, TeamId};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

// ── Error log ───────────────────────────────────────────────────────

/// Append-only, user-visible error notes.
#[derive(Debug, Clone, Default)]
pub struct ErrorLog {
    entries: Vec<String>,
}

impl ErrorLog {
    pub fn push(&mut self, note: impl Into<String>) {
        self.entries.push(note.into());
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    /// All notes joined by newlines.
    pub fn text(&self) -> String {
        self.entries.join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ── Handler outcome ─────────────────────────────────────────────────

enum Outcome {
    Done,
    Rejected(ErrorCode),
    /// Precondition not met yet.
    Retry(&'static str),
}

const NO_CONNECTION: &str = "no connection registered for sender";
const NOT_INTRODUCED: &str = "sender has not introduced itself";

// ── Session ─────────────────────────────────────────────────────────

/// Lobby state, delivery bookkeeping and live connections of one peer.
#[derive(Debug)]
pub struct Session {
    roster: Roster,
    tracker: DeliveryTracker,
    retries: RetryQueue,
    /// Messages waiting for a scheduled retry, keyed by `uniqueId`.
    parked: HashMap<MessageId, Message>,
    registry: ConnectionRegistry,
    errors: ErrorLog,
    display_name: String,
    events: mpsc::Sender<LobbyEvent>,
}

impl Session {
    pub fn new(config: &SessionConfig, events: mpsc::Sender<LobbyEvent>) -> Self {
        Self {
            roster: Roster::new(config.teams.clone()),
            tracker: DeliveryTracker::new(config.retry),
            retries: RetryQueue::new(),
            parked: HashMap::new(),
            registry: ConnectionRegistry::new(),
            errors: ErrorLog::default(),
            display_name: String::new(),
            events,
        }
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn tracker(&self) -> &DeliveryTracker {
        &self.tracker
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn phase(&self) -> LobbyPhase {
        self.roster.phase()
    }

    pub fn pending_retries(&self) -> usize {
        self.retries.len()
    }

    /// Due time of the earliest scheduled retry.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retries.next_due()
    }

    pub fn view(&self) -> LobbyView {
        LobbyView::from_roster(&self.roster, self.errors.text())
    }

    /// The id to reuse when a join attempt is repeated before the host answered.
    pub fn pending_join_id(&self) -> Option<&PeerId> {
        match self.roster.phase() {
            LobbyPhase::JoiningPending => self.roster.my_id(),
            _ => None,
        }
    }

    // ── Inbound pipeline ────────────────────────────────────────────

    /// Process one text frame received on `peer_id`'s connection.
    pub fn handle_data(&mut self, peer_id: &str, text: &str, now: Instant) {
        let message = match protocol::decode(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(%peer_id, "message does not fit protocol: {e}");
                self.record_error(
                    ErrorCode::MalformedMessage,
                    format!("Message from {peer_id} does not fit protocol: {e}"),
                );
                self.emit(LobbyEvent::MessageRejected {
                    unique_id: None,
                    from: peer_id.to_string(),
                    code: ErrorCode::MalformedMessage,
                });
                return;
            }
        };

        if message.from != peer_id {
            warn!(
                %peer_id,
                claimed = %message.from,
                unique_id = %message.unique_id,
                "sender mismatch, dropping spoofed message"
            );
            self.reject(message.unique_id, peer_id, ErrorCode::SpoofedSender);
            return;
        }

        if let Err(state) = self.tracker.receive(&message.unique_id, now) {
            debug!(
                unique_id = %message.unique_id,
                kind = %message.kind(),
                ?state,
                "duplicate message dropped"
            );
            self.emit(LobbyEvent::DuplicateDropped {
                unique_id: message.unique_id,
            });
            return;
        }

        self.process(message, now);
    }

    /// Re-run every parked message whose retry is due.
    pub fn fire_due_retries(&mut self, now: Instant) {
        for entry in self.retries.pop_due(now) {
            if self.tracker.is_finished(&entry.unique_id) {
                self.parked.remove(&entry.unique_id);
                continue;
            }
            let Some(message) = self.parked.remove(&entry.unique_id) else {
                continue;
            };
            debug!(unique_id = %entry.unique_id, attempt = entry.attempt, "retrying message");
            self.process(message, now);
        }
    }

    fn process(&mut self, message: Message, now: Instant) {
        match self.dispatch(&message) {
            Outcome::Done => {
                self.tracker.finish(&message.unique_id);
            }
            Outcome::Rejected(code) => {
                warn!(
                    unique_id = %message.unique_id,
                    kind = %message.kind(),
                    from = %message.from,
                    "message rejected: {code}"
                );
                self.reject(message.unique_id, &message.from, code);
            }
            Outcome::Retry(reason) => self.schedule_retry(message, reason, now),
        }
    }

    /// Drop a rejected message. Protocol violations are finished, so later
    /// copies of the id count as duplicates.
    fn reject(&mut self, unique_id: MessageId, from: &str, code: ErrorCode) {
        if code.is_protocol_violation() {
            self.tracker.finish(&unique_id);
        }
        self.emit(LobbyEvent::MessageRejected {
            unique_id: Some(unique_id),
            from: from.to_string(),
            code,
        });
    }

    fn schedule_retry(&mut self, message: Message, reason: &'static str, now: Instant) {
        match self.tracker.retry(&message.unique_id, now) {
            RetryDecision::Scheduled {
                attempt,
                delay,
                due,
            } => {
                debug!(
                    unique_id = %message.unique_id,
                    kind = %message.kind(),
                    attempt,
                    "{reason}; retrying in {delay:?}"
                );
                self.retries.push(message.unique_id.clone(), attempt, due);
                self.emit(LobbyEvent::RetryScheduled {
                    unique_id: message.unique_id.clone(),
                    kind: message.kind(),
                    attempt,
                    delay,
                });
                self.parked.insert(message.unique_id.clone(), message);
            }
            RetryDecision::Exhausted { retries } => {
                error!(
                    unique_id = %message.unique_id,
                    kind = %message.kind(),
                    from = %message.from,
                    retries,
                    "message retried and failed: {reason}"
                );
                self.record_error(
                    ErrorCode::RetryExhausted,
                    format!(
                        "{} from {} failed after {retries} retries: {reason}",
                        message.kind(),
                        message.from
                    ),
                );
                let kind = message.kind();
                self.emit(LobbyEvent::DeliveryFailed {
                    unique_id: message.unique_id,
                    kind,
                    retries,
                    code: ErrorCode::RetryExhausted,
                });
            }
            RetryDecision::AlreadyFinished | RetryDecision::Untracked => {}
        }
    }

    // ── Handlers ────────────────────────────────────────────────────

    fn dispatch(&mut self, message: &Message) -> Outcome {
        let kind = message.kind();
        if kind.is_host_only() && !self.roster.is_hosting() {
            return Outcome::Rejected(ErrorCode::NotHost);
        }
        if kind.is_host_reply()
            && (self.roster.is_hosting() || !self.roster.is_lobby_host(&message.from))
        {
            return Outcome::Rejected(ErrorCode::NotFromLobbyHost);
        }

        let from = message.from.as_str();
        match &message.payload {
            Payload::ConnectToUser { display_name } => self.on_connect_to_user(from, display_name),
            Payload::AckConnectToUser { display_name } => {
                self.on_ack_connect_to_user(from, display_name)
            }
            Payload::JoinLobby => self.on_join_lobby(from),
            Payload::AckJoinLobby(snapshot) => {
                if !self.registry.contains(from) {
                    return Outcome::Retry(NO_CONNECTION);
                }
                self.roster.apply_snapshot(snapshot.clone());
                if self.roster.phase() == LobbyPhase::JoiningPending {
                    self.roster.enter_joined();
                    info!(lobby_id = %from, "joined lobby");
                    self.emit(LobbyEvent::JoinedLobby {
                        lobby_id: from.to_string(),
                    });
                }
                self.roster_changed();
                Outcome::Done
            }
            Payload::RequestConnectionInfo => {
                if !self.registry.contains(from) {
                    return Outcome::Retry(NO_CONNECTION);
                }
                self.reply(from, Payload::ResponseConnectionInfo(self.roster.snapshot()));
                Outcome::Done
            }
            Payload::ResponseConnectionInfo(snapshot) => {
                self.roster.apply_snapshot(snapshot.clone());
                self.roster_changed();
                Outcome::Done
            }
            Payload::ChooseTeam { target_team_id } => self.on_choose_team(from, target_team_id),
            Payload::AckChooseTeam { target_team_id } => {
                let Some(my_id) = self.roster.my_id().cloned() else {
                    return Outcome::Rejected(ErrorCode::UnknownMember);
                };
                match self.roster.set_team(&my_id, target_team_id) {
                    Ok(()) => {
                        self.roster_changed();
                        Outcome::Done
                    }
                    Err(LobbyError::UnknownTeam(_)) => Outcome::Rejected(ErrorCode::UnknownTeam),
                    Err(_) => Outcome::Rejected(ErrorCode::UnknownMember),
                }
            }
            Payload::ToggleReady => {
                if !self.registry.contains(from) {
                    return Outcome::Retry(NO_CONNECTION);
                }
                if self.roster.toggle_ready(from).is_err() {
                    return Outcome::Retry(NOT_INTRODUCED);
                }
                self.broadcast_snapshot(None);
                self.roster_changed();
                Outcome::Done
            }
            Payload::Ping => {
                if !self.registry.contains(from) {
                    return Outcome::Retry(NO_CONNECTION);
                }
                self.reply(from, Payload::Pong);
                Outcome::Done
            }
            Payload::Pong => {
                self.emit(LobbyEvent::Pong {
                    from: from.to_string(),
                });
                Outcome::Done
            }
        }
    }

    fn on_connect_to_user(&mut self, from: &str, display_name: &str) -> Outcome {
        if !self.registry.contains(from) {
            return Outcome::Retry(NO_CONNECTION);
        }
        self.roster.upsert_member(from, display_name);
        self.emit(LobbyEvent::PeerIntroduced {
            peer_id: from.to_string(),
            display_name: display_name.to_string(),
        });
        self.reply(
            from,
            Payload::AckConnectToUser {
                display_name: self.display_name.clone(),
            },
        );
        Outcome::Done
    }

    fn on_ack_connect_to_user(&mut self, from: &str, display_name: &str) -> Outcome {
        if !self.registry.contains(from) {
            return Outcome::Retry(NO_CONNECTION);
        }
        self.roster.upsert_member(from, display_name);
        self.emit(LobbyEvent::PeerIntroduced {
            peer_id: from.to_string(),
            display_name: display_name.to_string(),
        });
        Outcome::Done
    }

    fn on_join_lobby(&mut self, from: &str) -> Outcome {
        if !self.registry.contains(from) {
            return Outcome::Retry(NO_CONNECTION);
        }
        let Ok(newly_admitted) = self.roster.admit(from) else {
            return Outcome::Retry(NOT_INTRODUCED);
        };
        self.reply(from, Payload::AckJoinLobby(self.roster.snapshot()));
        if newly_admitted {
            info!(peer_id = %from, "member joined");
            self.broadcast_snapshot(Some(from));
            self.emit(LobbyEvent::MemberJoined {
                peer_id: from.to_string(),
            });
            self.roster_changed();
        }
        Outcome::Done
    }

    fn on_choose_team(&mut self, from: &str, target_team_id: &TeamId) -> Outcome {
        if !self.registry.contains(from) {
            return Outcome::Retry(NO_CONNECTION);
        }
        match self.roster.set_team(from, target_team_id) {
            Ok(()) => {}
            Err(LobbyError::UnknownTeam(_)) => return Outcome::Rejected(ErrorCode::UnknownTeam),
            Err(_) => return Outcome::Retry(NOT_INTRODUCED),
        }
        self.reply(
            from,
            Payload::AckChooseTeam {
                target_team_id: target_team_id.clone(),
            },
        );
        self.broadcast_snapshot(None);
        self.roster_changed();
        Outcome::Done
    }

    // ── User actions ────────────────────────────────────────────────

    /// Become the host of a new lobby identified by `lobby_id`.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::AlreadyRegistered`] if this session already has an id.
    pub fn register_host(&mut self, lobby_id: &str, display_name: &str) -> Result<()> {
        if let Some(existing) = self.roster.my_id() {
            return Err(LobbyError::AlreadyRegistered(existing.clone()));
        }
        self.display_name = display_name.to_string();
        self.roster.host(lobby_id, display_name);
        info!(%lobby_id, "hosting lobby");
        self.emit(LobbyEvent::Registered {
            my_id: lobby_id.to_string(),
            lobby_id: lobby_id.to_string(),
            is_hosting: true,
        });
        self.roster_changed();
        Ok(())
    }

    /// Enter `JOINING_PENDING` for `lobby_id` under `my_id`.
    ///
    /// A pending join may be repeated with the same `my_id` as long as the
    /// host is not connected yet.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::AlreadyRegistered`] otherwise.
    pub fn register_join(&mut self, my_id: &str, lobby_id: &str, display_name: &str) -> Result<()> {
        let repeatable = self.pending_join_id().is_some_and(|pending| pending == my_id)
            && self.roster.lobby_id().is_none_or(|host| !self.registry.contains(host));
        if let Some(existing) = self.roster.my_id() {
            if !repeatable {
                return Err(LobbyError::AlreadyRegistered(existing.clone()));
            }
        }
        self.display_name = display_name.to_string();
        self.roster.begin_join(my_id, lobby_id, display_name);
        info!(%my_id, %lobby_id, "joining lobby");
        self.emit(LobbyEvent::Registered {
            my_id: my_id.to_string(),
            lobby_id: lobby_id.to_string(),
            is_hosting: false,
        });
        Ok(())
    }

    /// Send `CONNECT_TO_USER` then `JOIN_LOBBY` to the recorded host.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotRegistered`] before [`register_join`](Self::register_join),
    /// or [`LobbyError::NoConnection`] if the host connection is missing.
    pub fn introduce_to_host(&mut self) -> Result<()> {
        let host = self.lobby_host()?;
        self.send_to(
            &host,
            Payload::ConnectToUser {
                display_name: self.display_name.clone(),
            },
        )?;
        self.send_to(&host, Payload::JoinLobby)
    }

    /// Flip own ready state: directly on the host, or as a request to it.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotRegistered`] or a send error.
    pub fn toggle_ready(&mut self) -> Result<()> {
        let my_id = self.my_id()?;
        if self.roster.is_hosting() {
            self.roster.toggle_ready(&my_id)?;
            self.broadcast_snapshot(None);
            self.roster_changed();
            return Ok(());
        }
        let host = self.lobby_host()?;
        self.send_to(&host, Payload::ToggleReady)?;
        // Optimistic echo, overwritten by the host's next snapshot.
        if self.roster.toggle_ready(&my_id).is_ok() {
            self.roster_changed();
        }
        Ok(())
    }

    /// Move `member_id` to `team_id`. Non-hosts may only move themselves.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotHost`] when a non-host targets another member,
    /// [`LobbyError::UnknownTeam`] / [`LobbyError::UnknownMember`] for bad ids,
    /// or a send error.
    pub fn select_team(&mut self, team_id: &str, member_id: &str) -> Result<()> {
        let my_id = self.my_id()?;
        if self.roster.is_hosting() {
            self.roster.set_team(member_id, team_id)?;
            self.broadcast_snapshot(None);
            self.roster_changed();
            return Ok(());
        }
        if member_id != my_id {
            return Err(LobbyError::NotHost);
        }
        if !self.roster.has_team(&team_id.to_string()) {
            return Err(LobbyError::UnknownTeam(team_id.to_string()));
        }
        let host = self.lobby_host()?;
        self.send_to(
            &host,
            Payload::ChooseTeam {
                target_team_id: team_id.to_string(),
            },
        )?;
        if self.roster.set_team(&my_id, team_id).is_ok() {
            self.roster_changed();
        }
        Ok(())
    }

    /// PING every connected peer.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotRegistered`] before registration.
    pub fn ping_all(&mut self) -> Result<()> {
        self.my_id()?;
        for peer_id in self.registry.peer_ids() {
            self.reply(&peer_id, Payload::Ping);
        }
        Ok(())
    }

    /// Ask the host for a full snapshot. Also driven by the poll timer.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotHost`] on the host itself,
    /// [`LobbyError::NotRegistered`] before registration, or a send error.
    pub fn request_connection_info(&mut self) -> Result<()> {
        if self.roster.is_hosting() {
            return Err(LobbyError::NotHost);
        }
        let host = self.lobby_host()?;
        self.send_to(&host, Payload::RequestConnectionInfo)
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Register a newly opened data connection.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::DuplicateConnection`] if the peer already has a
    /// live connection; the new handle is closed and a note is recorded.
    pub fn connection_opened(&mut self, handle: ConnectionHandle) -> Result<()> {
        let peer_id = handle.peer_id().clone();
        match self.registry.register(handle) {
            Ok(()) => {
                info!(%peer_id, "connection open");
                self.emit(LobbyEvent::PeerConnected { peer_id });
                Ok(())
            }
            Err(e) => {
                self.duplicate_connection(&peer_id);
                Err(e)
            }
        }
    }

    /// Note a second connection from a peer that already has a live one.
    pub fn duplicate_connection(&mut self, peer_id: &str) {
        warn!(%peer_id, "rejecting duplicate connection");
        self.record_error(
            ErrorCode::DuplicateConnection,
            format!("Connection for id {peer_id} exists"),
        );
    }

    /// React to a data connection going away.
    pub fn connection_closed(&mut self, peer_id: &str) {
        if self.registry.remove(peer_id).is_none() {
            debug!(%peer_id, "close for unregistered connection ignored");
            return;
        }
        info!(%peer_id, "connection closed");
        self.record_error(
            ErrorCode::ConnectionClosed,
            format!("Connection {peer_id} closed, please refresh"),
        );
        if self.roster.is_hosting() && self.roster.remove_member(peer_id) {
            self.broadcast_snapshot(None);
            self.emit(LobbyEvent::MemberLeft {
                peer_id: peer_id.to_string(),
            });
            self.roster_changed();
        }
        self.emit(LobbyEvent::PeerDisconnected {
            peer_id: peer_id.to_string(),
        });
    }

    pub fn connection_failed(&mut self, peer_id: &str, error: &LobbyError) {
        warn!(%peer_id, "connection error: {error}");
        self.record_error(
            ErrorCode::TransportError,
            format!("Connection {peer_id} error: {error}"),
        );
    }

    /// The broker client closed; no new connections will arrive.
    pub fn client_closed(&mut self) {
        warn!("peer client closed");
        self.record_error(ErrorCode::ClientClosed, "Peer client closed, please refresh");
    }

    pub fn client_failed(&mut self, error: &LobbyError) {
        warn!("peer client error: {error}");
        self.record_error(ErrorCode::TransportError, format!("Peer client error: {error}"));
    }

    pub fn registration_failed(&mut self, reason: String) {
        error!("registration failed: {reason}");
        self.record_error(
            ErrorCode::RegistrationFailed,
            format!("Registration failed: {reason}"),
        );
        self.emit(LobbyEvent::RegistrationFailed { reason });
    }

    /// Append a note to the error log and announce it with its `code`.
    pub fn record_error(&mut self, code: ErrorCode, note: impl Into<String>) {
        let note = note.into();
        self.errors.push(note.clone());
        self.emit(LobbyEvent::Error {
            code,
            message: note,
        });
    }

    /// Close every connection and cancel every pending retry.
    pub fn teardown(&mut self) {
        debug!(
            connections = self.registry.len(),
            retries = self.retries.len(),
            "session teardown"
        );
        self.retries.clear();
        self.parked.clear();
        self.registry.close_all();
    }

    // ── Outbound helpers ────────────────────────────────────────────

    fn my_id(&self) -> Result<PeerId> {
        self.roster.my_id().cloned().ok_or(LobbyError::NotRegistered)
    }

    fn lobby_host(&self) -> Result<PeerId> {
        self.roster
            .lobby_id()
            .cloned()
            .ok_or(LobbyError::NotRegistered)
    }

    fn send_to(&self, peer_id: &str, payload: Payload) -> Result<()> {
        let message = Message::new(self.my_id()?, payload);
        let text = protocol::encode(&message)?;
        debug!(%peer_id, kind = %message.kind(), unique_id = %message.unique_id, "sending");
        self.registry.send(peer_id, text)
    }

    /// Send from inside a handler, where a failure cannot be returned.
    fn reply(&self, peer_id: &str, payload: Payload) {
        let kind = payload.kind();
        if let Err(e) = self.send_to(peer_id, payload) {
            warn!(%peer_id, %kind, "failed to send: {e}");
        }
    }

    /// Host only: push the full snapshot to every other lobby member.
    fn broadcast_snapshot(&self, except: Option<&str>) {
        if !self.roster.is_hosting() {
            return;
        }
        let snapshot = self.roster.snapshot();
        for peer_id in self.roster.other_member_ids() {
            if Some(peer_id.as_str()) == except {
                continue;
            }
            if !self.registry.contains(peer_id) {
                debug!(%peer_id, "no connection, skipping broadcast");
                continue;
            }
            self.reply(peer_id, Payload::ResponseConnectionInfo(snapshot.clone()));
        }
    }

    fn roster_changed(&self) {
        self.emit(LobbyEvent::RosterChanged(Box::new(self.roster.snapshot())));
    }

    /// Queue an event without blocking. A full channel drops the event.
    fn emit(&self, event: LobbyEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(
                    "event channel full, dropping event: {:?}",
                    std::mem::discriminant(&dropped)
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("event channel closed, receiver dropped");
            }
        }
    }
}
