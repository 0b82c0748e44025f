//! Classification codes for rejected and failed lobby messages.
//!
//! Codes serialize as `SCREAMING_SNAKE_CASE` strings (e.g. `"SPOOFED_SENDER"`)
//! so they can be forwarded to a UI or a log pipeline unchanged.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an inbound message or connection event did not take effect.
///
/// Use [`description()`](ErrorCode::description) for a human-readable explanation
/// and [`is_protocol_violation()`](ErrorCode::is_protocol_violation) to tell
/// violations apart from transport trouble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Protocol violations
    MalformedMessage,
    SpoofedSender,
    NotHost,
    NotFromLobbyHost,
    UnknownTeam,
    UnknownMember,

    // Delivery
    RetryExhausted,
    ActionFailed,

    // Transport
    DuplicateConnection,
    ConnectionClosed,
    TransportError,
    ClientClosed,
    RegistrationFailed,
}

impl ErrorCode {
    /// Returns a human-readable description of this code.
    pub fn description(&self) -> &'static str {
        match self {
            Self::MalformedMessage => {
                "Message does not fit the protocol: an envelope field is missing or the payload is invalid."
            }
            Self::SpoofedSender => {
                "The message claims a sender different from the connection it arrived on."
            }
            Self::NotHost => "Only the lobby host processes this request.",
            Self::NotFromLobbyHost => {
                "Lobby state replies are only accepted from the recorded lobby host."
            }
            Self::UnknownTeam => "The requested team does not exist in this lobby.",
            Self::UnknownMember => "The referenced member is not part of this lobby.",
            Self::RetryExhausted => {
                "The message kept waiting for its precondition and exhausted its retries."
            }
            Self::ActionFailed => "A local lobby action could not be carried out.",
            Self::DuplicateConnection => "A live connection for this peer already exists.",
            Self::ConnectionClosed => "The data connection to this peer closed.",
            Self::TransportError => "The data connection reported an error.",
            Self::ClientClosed => "The connection broker client closed; please refresh.",
            Self::RegistrationFailed => "Registering with the connection broker failed.",
        }
    }

    /// `true` for codes that mean the remote peer broke the protocol rules.
    ///
    /// Violations are dropped and marked finished; retrying them cannot succeed.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage
                | Self::SpoofedSender
                | Self::NotHost
                | Self::NotFromLobbyHost
                | Self::UnknownTeam
                | Self::UnknownMember
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::NotFromLobbyHost).unwrap();
        assert_eq!(json, "\"NOT_FROM_LOBBY_HOST\"");
        let parsed: ErrorCode = serde_json::from_str("\"RETRY_EXHAUSTED\"").unwrap();
        assert_eq!(parsed, ErrorCode::RetryExhausted);
    }

    #[test]
    fn violations_are_distinguished_from_transport_codes() {
        assert!(ErrorCode::SpoofedSender.is_protocol_violation());
        assert!(ErrorCode::NotHost.is_protocol_violation());
        assert!(!ErrorCode::ConnectionClosed.is_protocol_violation());
        assert!(!ErrorCode::ActionFailed.is_protocol_violation());
    }

    #[test]
    fn display_uses_description() {
        assert_eq!(
            ErrorCode::UnknownTeam.to_string(),
            ErrorCode::UnknownTeam.description()
        );
    }
}
