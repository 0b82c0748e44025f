//! Events delivered to the embedding application.

use std::time::Duration;

use crate::error_codes::ErrorCode;
use crate::protocol::{MessageId, MessageKind, PeerId, Snapshot};

/// Something the UI may want to react to.
///
/// State itself is read through [`LobbyClient::view`](crate::LobbyClient::view);
/// events say *that* it changed and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LobbyEvent {
    // ── Registration ────────────────────────────────────────────────
    /// The broker accepted this peer's id.
    Registered {
        my_id: PeerId,
        lobby_id: PeerId,
        is_hosting: bool,
    },
    /// Listening or dialing the host failed. The session stays usable for
    /// another attempt only if it never left `UNREGISTERED`.
    RegistrationFailed { reason: String },

    // ── Connections ─────────────────────────────────────────────────
    PeerConnected { peer_id: PeerId },
    PeerDisconnected { peer_id: PeerId },
    /// A `CONNECT_TO_USER` or its ack told us the peer's display name.
    PeerIntroduced {
        peer_id: PeerId,
        display_name: String,
    },

    // ── Lobby ───────────────────────────────────────────────────────
    /// Host only: a joiner was admitted.
    MemberJoined { peer_id: PeerId },
    /// Host only: a member's connection closed and it was removed.
    MemberLeft { peer_id: PeerId },
    /// The host admitted this peer.
    JoinedLobby { lobby_id: PeerId },
    /// The local roster changed; carries the new state triple.
    RosterChanged(Box<Snapshot>),

    // ── Delivery ────────────────────────────────────────────────────
    /// An inbound message was dropped as a protocol violation.
    /// `unique_id` is `None` when the envelope could not be decoded.
    MessageRejected {
        unique_id: Option<MessageId>,
        from: PeerId,
        code: ErrorCode,
    },
    DuplicateDropped { unique_id: MessageId },
    RetryScheduled {
        unique_id: MessageId,
        kind: MessageKind,
        attempt: u32,
        delay: Duration,
    },
    /// A message exhausted its retries. Terminal.
    DeliveryFailed {
        unique_id: MessageId,
        kind: MessageKind,
        retries: u32,
        code: ErrorCode,
    },

    // ── Misc ────────────────────────────────────────────────────────
    Pong { from: PeerId },
    /// A note was appended to the error log.
    Error { code: ErrorCode, message: String },
    /// The session loop exited. Always the last event.
    Stopped { reason: Option<String> },
}
