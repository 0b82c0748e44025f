//! Wire format for the peer lobby `CONNECTION` protocol.
//!
//! Every message is a UTF-8 JSON object with a fixed envelope:
//!
//! ```json
//! {
//!   "protocol": "CONNECTION",
//!   "uniqueId": "5f0c…",
//!   "timestamp": 1735689600000,
//!   "type": "CHOOSE_TEAM",
//!   "from": "m-3e1a…",
//!   "payload": { "targetTeamId": "1" }
//! }
//! ```
//!
//! `protocol`, `type`, `from` and `uniqueId` are mandatory regardless of the
//! message type. `payload` may be an empty object (or absent) for message types
//! that carry nothing.
//!
//! The message type set is closed: [`MessageKind`] names every type, and
//! [`Payload`] pairs each type with its typed body so handlers can be selected
//! by exhaustive `match`.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{DecodeError, Result};

/// Constant value of the `protocol` envelope field.
pub const PROTOCOL: &str = "CONNECTION";

// ── Type aliases ────────────────────────────────────────────────────

/// Opaque unique identifier of a participant. The host's id doubles as the lobby id.
pub type PeerId = String;

/// Identifier of a team (`"1"`, `"2"` by default).
pub type TeamId = String;

/// Per-message idempotency key, generated fresh for every new logical message.
pub type MessageId = String;

/// Members keyed by peer id.
pub type MemberLookup = BTreeMap<PeerId, Member>;

/// Teams keyed by team id.
pub type TeamLookup = BTreeMap<TeamId, Team>;

// ── Roster data ─────────────────────────────────────────────────────

/// A lobby participant as replicated in snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: PeerId,
    pub display_name: String,
    pub is_ready: bool,
    #[serde(default)]
    pub team_id: Option<TeamId>,
}

impl Member {
    /// A freshly introduced member: not ready, no team.
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_ready: false,
            team_id: None,
        }
    }
}

/// A team and its derived membership.
///
/// `member_ids` is always recomputed from the members' `team_id` fields and is
/// never edited on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: TeamId,
    /// Display color used by the lobby UI.
    #[serde(rename = "teamColor", alias = "color")]
    pub color: String,
    #[serde(default)]
    pub member_ids: Vec<PeerId>,
}

impl Team {
    /// A team with no members.
    pub fn new(id: impl Into<TeamId>, color: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            color: color.into(),
            member_ids: Vec::new(),
        }
    }
}

/// The full `{memberLookup, teamLookup, lobbyMemberIds}` triple shipped by the host.
///
/// Receivers replace their replica wholesale; snapshots are never merged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub member_lookup: MemberLookup,
    pub team_lookup: TeamLookup,
    pub lobby_member_ids: Vec<PeerId>,
}

// ── Message types ───────────────────────────────────────────────────

/// Every message type of the `CONNECTION` protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    /// Peer → peer: introduce self to a newly dialed peer.
    ConnectToUser,
    /// Peer → peer: reciprocate identity.
    AckConnectToUser,
    /// Peer → host: request to join.
    JoinLobby,
    /// Host → peer: admission plus full snapshot.
    AckJoinLobby,
    /// Peer → host: poll for the latest snapshot.
    RequestConnectionInfo,
    /// Host → peer: push a full snapshot.
    ResponseConnectionInfo,
    /// Peer → host: request a team change.
    ChooseTeam,
    /// Host → peer: confirm a team change.
    AckChooseTeam,
    /// Peer → host: request a ready-state flip.
    ToggleReady,
    /// Liveness probe.
    Ping,
    /// Liveness reply.
    Pong,
}

impl MessageKind {
    /// All message kinds in declaration order.
    pub const ALL: [MessageKind; 11] = [
        Self::ConnectToUser,
        Self::AckConnectToUser,
        Self::JoinLobby,
        Self::AckJoinLobby,
        Self::RequestConnectionInfo,
        Self::ResponseConnectionInfo,
        Self::ChooseTeam,
        Self::AckChooseTeam,
        Self::ToggleReady,
        Self::Ping,
        Self::Pong,
    ];

    /// The `type` string used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ConnectToUser => "CONNECT_TO_USER",
            Self::AckConnectToUser => "ACK_CONNECT_TO_USER",
            Self::JoinLobby => "JOIN_LOBBY",
            Self::AckJoinLobby => "ACK_JOIN_LOBBY",
            Self::RequestConnectionInfo => "REQUEST_CONNECTION_INFO",
            Self::ResponseConnectionInfo => "RESPONSE_CONNECTION_INFO",
            Self::ChooseTeam => "CHOOSE_TEAM",
            Self::AckChooseTeam => "ACK_CHOOSE_TEAM",
            Self::ToggleReady => "TOGGLE_READY",
            Self::Ping => "PING",
            Self::Pong => "PONG",
        }
    }

    /// Parse a wire `type` string.
    pub fn from_wire(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Requests that only the lobby host may process.
    pub fn is_host_only(self) -> bool {
        matches!(
            self,
            Self::JoinLobby | Self::RequestConnectionInfo | Self::ChooseTeam | Self::ToggleReady
        )
    }

    /// Replies that are only accepted from the recorded lobby host.
    pub fn is_host_reply(self) -> bool {
        matches!(
            self,
            Self::AckJoinLobby | Self::ResponseConnectionInfo | Self::AckChooseTeam
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed message bodies, one variant per [`MessageKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    ConnectToUser { display_name: String },
    AckConnectToUser { display_name: String },
    JoinLobby,
    AckJoinLobby(Snapshot),
    RequestConnectionInfo,
    ResponseConnectionInfo(Snapshot),
    ChooseTeam { target_team_id: TeamId },
    AckChooseTeam { target_team_id: TeamId },
    ToggleReady,
    Ping,
    Pong,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisplayNameBody {
    display_name: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TeamChoiceBody {
    target_team_id: TeamId,
}

impl Payload {
    /// The message type this payload belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::ConnectToUser { .. } => MessageKind::ConnectToUser,
            Self::AckConnectToUser { .. } => MessageKind::AckConnectToUser,
            Self::JoinLobby => MessageKind::JoinLobby,
            Self::AckJoinLobby(_) => MessageKind::AckJoinLobby,
            Self::RequestConnectionInfo => MessageKind::RequestConnectionInfo,
            Self::ResponseConnectionInfo(_) => MessageKind::ResponseConnectionInfo,
            Self::ChooseTeam { .. } => MessageKind::ChooseTeam,
            Self::AckChooseTeam { .. } => MessageKind::AckChooseTeam,
            Self::ToggleReady => MessageKind::ToggleReady,
            Self::Ping => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
        }
    }

    fn to_value(&self) -> serde_json::Result<Value> {
        match self {
            Self::ConnectToUser { display_name } | Self::AckConnectToUser { display_name } => {
                serde_json::to_value(DisplayNameBody {
                    display_name: display_name.clone(),
                })
            }
            Self::AckJoinLobby(snapshot) | Self::ResponseConnectionInfo(snapshot) => {
                serde_json::to_value(snapshot)
            }
            Self::ChooseTeam { target_team_id } | Self::AckChooseTeam { target_team_id } => {
                serde_json::to_value(TeamChoiceBody {
                    target_team_id: target_team_id.clone(),
                })
            }
            Self::JoinLobby
            | Self::RequestConnectionInfo
            | Self::ToggleReady
            | Self::Ping
            | Self::Pong => Ok(Value::Object(serde_json::Map::new())),
        }
    }

    fn from_value(kind: MessageKind, value: Value) -> std::result::Result<Self, DecodeError> {
        let invalid = |e: serde_json::Error| DecodeError::InvalidPayload {
            kind: kind.as_str(),
            reason: e.to_string(),
        };
        let payload = match kind {
            MessageKind::ConnectToUser => {
                let body: DisplayNameBody = serde_json::from_value(value).map_err(invalid)?;
                Self::ConnectToUser {
                    display_name: body.display_name,
                }
            }
            MessageKind::AckConnectToUser => {
                let body: DisplayNameBody = serde_json::from_value(value).map_err(invalid)?;
                Self::AckConnectToUser {
                    display_name: body.display_name,
                }
            }
            MessageKind::AckJoinLobby => {
                Self::AckJoinLobby(serde_json::from_value(value).map_err(invalid)?)
            }
            MessageKind::ResponseConnectionInfo => {
                Self::ResponseConnectionInfo(serde_json::from_value(value).map_err(invalid)?)
            }
            MessageKind::ChooseTeam => {
                let body: TeamChoiceBody = serde_json::from_value(value).map_err(invalid)?;
                Self::ChooseTeam {
                    target_team_id: body.target_team_id,
                }
            }
            MessageKind::AckChooseTeam => {
                let body: TeamChoiceBody = serde_json::from_value(value).map_err(invalid)?;
                Self::AckChooseTeam {
                    target_team_id: body.target_team_id,
                }
            }
            // Bodiless types ignore whatever payload they carry.
            MessageKind::JoinLobby => Self::JoinLobby,
            MessageKind::RequestConnectionInfo => Self::RequestConnectionInfo,
            MessageKind::ToggleReady => Self::ToggleReady,
            MessageKind::Ping => Self::Ping,
            MessageKind::Pong => Self::Pong,
        };
        Ok(payload)
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// A decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub protocol: String,
    pub unique_id: MessageId,
    /// Sender's wall clock in milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub from: PeerId,
    pub payload: Payload,
}

impl Message {
    /// Build a new logical message with a fresh `uniqueId` and the current time.
    pub fn new(from: impl Into<PeerId>, payload: Payload) -> Self {
        Self {
            protocol: PROTOCOL.to_string(),
            unique_id: new_message_id(),
            timestamp: now_millis(),
            from: from.into(),
            payload,
        }
    }

    /// Message type of the payload.
    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutgoingEnvelope<'a> {
    protocol: &'a str,
    unique_id: &'a str,
    timestamp: u64,
    #[serde(rename = "type")]
    kind: MessageKind,
    from: &'a str,
    payload: Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IncomingEnvelope {
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    unique_id: Option<String>,
    #[serde(default)]
    timestamp: Option<u64>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// Serialize a message into its JSON wire form.
///
/// # Errors
///
/// Returns [`LobbyError::Serialization`](crate::LobbyError::Serialization) if
/// the payload cannot be represented as JSON.
pub fn encode(message: &Message) -> Result<String> {
    let envelope = OutgoingEnvelope {
        protocol: &message.protocol,
        unique_id: &message.unique_id,
        timestamp: message.timestamp,
        kind: message.kind(),
        from: &message.from,
        payload: message.payload.to_value()?,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Parse JSON wire text into a [`Message`].
///
/// Empty strings count as absent for the mandatory envelope fields.
///
/// # Errors
///
/// Returns a [`DecodeError`] describing the first problem found.
pub fn decode(text: &str) -> std::result::Result<Message, DecodeError> {
    let envelope: IncomingEnvelope =
        serde_json::from_str(text).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let protocol = required(envelope.protocol, "protocol")?;
    let kind = required(envelope.kind, "type")?;
    let from = required(envelope.from, "from")?;
    let unique_id = required(envelope.unique_id, "uniqueId")?;

    if protocol != PROTOCOL {
        return Err(DecodeError::UnsupportedProtocol(protocol));
    }
    let kind = MessageKind::from_wire(&kind).ok_or(DecodeError::UnknownType(kind))?;
    let payload = match envelope.payload {
        None | Some(Value::Null) => Value::Object(serde_json::Map::new()),
        Some(value) => value,
    };

    Ok(Message {
        protocol,
        unique_id,
        timestamp: envelope.timestamp.unwrap_or_default(),
        from,
        payload: Payload::from_value(kind, payload)?,
    })
}

fn required(
    field: Option<String>,
    name: &'static str,
) -> std::result::Result<String, DecodeError> {
    field
        .filter(|value| !value.is_empty())
        .ok_or(DecodeError::MissingField(name))
}

/// A collision-resistant random message id.
pub fn new_message_id() -> MessageId {
    uuid::Uuid::new_v4().simple().to_string()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn kind_wire_names_match_serde() {
        for kind in MessageKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            assert_eq!(MessageKind::from_wire(kind.as_str()), Some(kind));
        }
    }

    #[test]
    fn new_messages_get_distinct_ids() {
        let a = Message::new("p1", Payload::Ping);
        let b = Message::new("p1", Payload::Ping);
        assert_ne!(a.unique_id, b.unique_id);
        assert_eq!(a.protocol, PROTOCOL);
        assert!(a.timestamp > 0);
    }

    #[test]
    fn encode_uses_wire_field_names() {
        let message = Message::new(
            "m-1",
            Payload::ChooseTeam {
                target_team_id: "2".into(),
            },
        );
        let value: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
        assert_eq!(value["protocol"], "CONNECTION");
        assert_eq!(value["type"], "CHOOSE_TEAM");
        assert_eq!(value["from"], "m-1");
        assert_eq!(value["uniqueId"], message.unique_id.as_str());
        assert_eq!(value["payload"]["targetTeamId"], "2");
    }

    #[test]
    fn bodiless_payload_encodes_as_empty_object() {
        let message = Message::new("m-1", Payload::JoinLobby);
        let value: Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();
        assert_eq!(value["payload"], serde_json::json!({}));
    }

    #[test]
    fn team_color_uses_legacy_wire_name() {
        let team = Team::new("1", "#ccffcc");
        let value = serde_json::to_value(&team).unwrap();
        assert_eq!(value["teamColor"], "#ccffcc");
        let parsed: Team =
            serde_json::from_value(serde_json::json!({"id": "2", "color": "#ccccff"})).unwrap();
        assert_eq!(parsed.color, "#ccccff");
        assert!(parsed.member_ids.is_empty());
    }
}
