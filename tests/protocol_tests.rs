#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
//! Wire format tests for the `CONNECTION` protocol.
//!
//! Covers the envelope rules of `decode`, typed payload parsing for every
//! message type, and JSON fixtures shaped like real peer output.

use peer_lobby::error_codes::ErrorCode;
use peer_lobby::protocol::{
    decode, encode, Member, Message, MessageKind, Payload, Snapshot, Team, PROTOCOL,
};
use peer_lobby::DecodeError;
use serde_json::json;

fn envelope(kind: &str, payload: serde_json::Value) -> String {
    json!({
        "protocol": "CONNECTION",
        "uniqueId": "u-1",
        "timestamp": 1_735_689_600_000_u64,
        "type": kind,
        "from": "m-1",
        "payload": payload,
    })
    .to_string()
}

// ════════════════════════════════════════════════════════════════════
// Envelope
// ════════════════════════════════════════════════════════════════════

#[test]
fn decodes_full_envelope() {
    let message = decode(&envelope("PING", json!({}))).unwrap();
    assert_eq!(message.protocol, PROTOCOL);
    assert_eq!(message.unique_id, "u-1");
    assert_eq!(message.timestamp, 1_735_689_600_000);
    assert_eq!(message.from, "m-1");
    assert_eq!(message.payload, Payload::Ping);
}

#[test]
fn missing_mandatory_fields_are_reported_by_name() {
    let full = json!({
        "protocol": "CONNECTION",
        "uniqueId": "u-1",
        "type": "PING",
        "from": "m-1",
    });
    for field in ["protocol", "uniqueId", "type", "from"] {
        let mut value = full.clone();
        value.as_object_mut().unwrap().remove(field);
        let err = decode(&value.to_string()).unwrap_err();
        assert!(
            matches!(err, DecodeError::MissingField(name) if name == field),
            "removing {field} gave {err:?}"
        );
    }
}

#[test]
fn empty_strings_count_as_missing() {
    let text = json!({
        "protocol": "CONNECTION",
        "uniqueId": "",
        "type": "PING",
        "from": "m-1",
    })
    .to_string();
    assert!(matches!(
        decode(&text),
        Err(DecodeError::MissingField("uniqueId"))
    ));

    let text = json!({
        "protocol": "CONNECTION",
        "uniqueId": "u-1",
        "type": "PING",
        "from": "",
    })
    .to_string();
    assert!(matches!(decode(&text), Err(DecodeError::MissingField("from"))));
}

#[test]
fn missing_timestamp_defaults_to_zero() {
    let text = json!({
        "protocol": "CONNECTION",
        "uniqueId": "u-1",
        "type": "PONG",
        "from": "m-1",
    })
    .to_string();
    let message = decode(&text).unwrap();
    assert_eq!(message.timestamp, 0);
    assert_eq!(message.payload, Payload::Pong);
}

#[test]
fn foreign_protocol_is_rejected() {
    let text = envelope("PING", json!({})).replace("\"CONNECTION\"", "\"GAME\"");
    match decode(&text) {
        Err(DecodeError::UnsupportedProtocol(protocol)) => assert_eq!(protocol, "GAME"),
        other => panic!("expected UnsupportedProtocol, got {other:?}"),
    }
}

#[test]
fn unknown_type_is_rejected() {
    match decode(&envelope("KICK_MEMBER", json!({}))) {
        Err(DecodeError::UnknownType(kind)) => assert_eq!(kind, "KICK_MEMBER"),
        other => panic!("expected UnknownType, got {other:?}"),
    }
}

#[test]
fn type_names_are_case_sensitive() {
    assert!(matches!(
        decode(&envelope("ping", json!({}))),
        Err(DecodeError::UnknownType(_))
    ));
}

#[test]
fn non_json_and_non_object_input_is_malformed() {
    for text in ["", "not json", "42", "null", "\"PING\"", "{\"from\": 5}"] {
        assert!(
            matches!(decode(text), Err(DecodeError::Malformed(_))),
            "{text:?} should be malformed"
        );
    }
}

#[test]
fn unknown_envelope_fields_are_ignored() {
    let mut value: serde_json::Value = serde_json::from_str(&envelope("PING", json!({}))).unwrap();
    value["hops"] = json!(3);
    assert!(decode(&value.to_string()).is_ok());
}

// ════════════════════════════════════════════════════════════════════
// Payloads
// ════════════════════════════════════════════════════════════════════

#[test]
fn bodiless_types_accept_absent_null_or_extra_payload() {
    for kind in ["JOIN_LOBBY", "REQUEST_CONNECTION_INFO", "TOGGLE_READY", "PING", "PONG"] {
        let absent = json!({
            "protocol": "CONNECTION",
            "uniqueId": "u-1",
            "type": kind,
            "from": "m-1",
        })
        .to_string();
        assert!(decode(&absent).is_ok(), "{kind} without payload");
        assert!(decode(&envelope(kind, json!(null))).is_ok(), "{kind} null");
        assert!(
            decode(&envelope(kind, json!({"extra": true}))).is_ok(),
            "{kind} extra"
        );
    }
}

#[test]
fn display_name_payloads() {
    let message = decode(&envelope(
        "CONNECT_TO_USER",
        json!({"displayName": "Bob"}),
    ))
    .unwrap();
    assert_eq!(
        message.payload,
        Payload::ConnectToUser {
            display_name: "Bob".into()
        }
    );

    let message = decode(&envelope(
        "ACK_CONNECT_TO_USER",
        json!({"displayName": "Alice"}),
    ))
    .unwrap();
    assert_eq!(message.kind(), MessageKind::AckConnectToUser);
}

#[test]
fn team_choice_payloads() {
    let message = decode(&envelope("CHOOSE_TEAM", json!({"targetTeamId": "2"}))).unwrap();
    assert_eq!(
        message.payload,
        Payload::ChooseTeam {
            target_team_id: "2".into()
        }
    );
    let message = decode(&envelope("ACK_CHOOSE_TEAM", json!({"targetTeamId": "1"}))).unwrap();
    assert_eq!(
        message.payload,
        Payload::AckChooseTeam {
            target_team_id: "1".into()
        }
    );
}

#[test]
fn payload_with_wrong_shape_is_invalid() {
    let cases = [
        ("CONNECT_TO_USER", json!({})),
        ("CONNECT_TO_USER", json!({"displayName": 7})),
        ("CHOOSE_TEAM", json!(null)),
        ("CHOOSE_TEAM", json!({"teamId": "1"})),
        ("ACK_JOIN_LOBBY", json!({"memberLookup": {}})),
        ("RESPONSE_CONNECTION_INFO", json!([])),
    ];
    for (kind, payload) in cases {
        match decode(&envelope(kind, payload.clone())) {
            Err(DecodeError::InvalidPayload { kind: reported, .. }) => {
                assert_eq!(reported, kind);
            }
            other => panic!("{kind} with {payload} gave {other:?}"),
        }
    }
}

#[test]
fn snapshot_fixture_from_host() {
    let fixture = json!({
        "memberLookup": {
            "host1": {"id": "host1", "displayName": "Alice", "isReady": true, "teamId": "1"},
            "m-b": {"id": "m-b", "displayName": "Bob", "isReady": false, "teamId": null},
            "m-c": {"id": "m-c", "displayName": "Carol", "isReady": false}
        },
        "teamLookup": {
            "1": {"id": "1", "teamColor": "#ccffcc", "memberIds": ["host1"]},
            "2": {"id": "2", "teamColor": "#ccccff", "memberIds": []}
        },
        "lobbyMemberIds": ["host1", "m-b", "m-c"]
    });
    let message = decode(&envelope("ACK_JOIN_LOBBY", fixture)).unwrap();
    let Payload::AckJoinLobby(snapshot) = message.payload else {
        panic!("expected AckJoinLobby");
    };

    assert_eq!(snapshot.lobby_member_ids, vec!["host1", "m-b", "m-c"]);
    assert_eq!(snapshot.member_lookup["host1"].team_id.as_deref(), Some("1"));
    assert!(snapshot.member_lookup["host1"].is_ready);
    assert_eq!(snapshot.member_lookup["m-b"].team_id, None);
    assert_eq!(snapshot.member_lookup["m-c"].team_id, None);
    assert_eq!(snapshot.team_lookup["2"].color, "#ccccff");
    assert_eq!(snapshot.team_lookup["1"].member_ids, vec!["host1"]);
}

#[test]
fn snapshot_encodes_with_camel_case_keys() {
    let mut member = Member::new("m-b", "Bob");
    member.team_id = Some("2".into());
    let mut team = Team::new("2", "#ccccff");
    team.member_ids.push("m-b".into());
    let snapshot = Snapshot {
        member_lookup: [("m-b".to_string(), member)].into_iter().collect(),
        team_lookup: [("2".to_string(), team)].into_iter().collect(),
        lobby_member_ids: vec!["host1".into(), "m-b".into()],
    };
    let message = Message::new("host1", Payload::ResponseConnectionInfo(snapshot.clone()));
    let value: serde_json::Value = serde_json::from_str(&encode(&message).unwrap()).unwrap();

    let payload = &value["payload"];
    assert_eq!(payload["lobbyMemberIds"], json!(["host1", "m-b"]));
    assert_eq!(payload["memberLookup"]["m-b"]["displayName"], "Bob");
    assert_eq!(payload["memberLookup"]["m-b"]["isReady"], false);
    assert_eq!(payload["memberLookup"]["m-b"]["teamId"], "2");
    assert_eq!(payload["teamLookup"]["2"]["teamColor"], "#ccccff");
    assert_eq!(payload["teamLookup"]["2"]["memberIds"], json!(["m-b"]));

    let decoded = decode(&value.to_string()).unwrap();
    assert_eq!(decoded.payload, Payload::ResponseConnectionInfo(snapshot));
    assert_eq!(decoded.unique_id, message.unique_id);
}

// ════════════════════════════════════════════════════════════════════
// Message kinds
// ════════════════════════════════════════════════════════════════════

#[test]
fn authority_classes_do_not_overlap() {
    let host_only: Vec<_> = MessageKind::ALL
        .into_iter()
        .filter(|k| k.is_host_only())
        .collect();
    let host_replies: Vec<_> = MessageKind::ALL
        .into_iter()
        .filter(|k| k.is_host_reply())
        .collect();

    assert_eq!(
        host_only,
        vec![
            MessageKind::JoinLobby,
            MessageKind::RequestConnectionInfo,
            MessageKind::ChooseTeam,
            MessageKind::ToggleReady,
        ]
    );
    assert_eq!(
        host_replies,
        vec![
            MessageKind::AckJoinLobby,
            MessageKind::ResponseConnectionInfo,
            MessageKind::AckChooseTeam,
        ]
    );
    assert!(!MessageKind::Ping.is_host_only() && !MessageKind::Ping.is_host_reply());
}

#[test]
fn every_kind_decodes_from_its_wire_name() {
    for kind in MessageKind::ALL {
        let payload = match kind {
            MessageKind::ConnectToUser | MessageKind::AckConnectToUser => {
                json!({"displayName": "x"})
            }
            MessageKind::ChooseTeam | MessageKind::AckChooseTeam => json!({"targetTeamId": "1"}),
            MessageKind::AckJoinLobby | MessageKind::ResponseConnectionInfo => json!({
                "memberLookup": {}, "teamLookup": {}, "lobbyMemberIds": []
            }),
            _ => json!({}),
        };
        let message = decode(&envelope(kind.as_str(), payload)).unwrap();
        assert_eq!(message.kind(), kind);
        assert_eq!(kind.to_string(), kind.as_str());
    }
}

// ════════════════════════════════════════════════════════════════════
// Error codes
// ════════════════════════════════════════════════════════════════════

#[test]
fn error_codes_serialize_screaming_snake_case() {
    let cases = [
        (ErrorCode::MalformedMessage, "MALFORMED_MESSAGE"),
        (ErrorCode::SpoofedSender, "SPOOFED_SENDER"),
        (ErrorCode::NotFromLobbyHost, "NOT_FROM_LOBBY_HOST"),
        (ErrorCode::RetryExhausted, "RETRY_EXHAUSTED"),
        (ErrorCode::DuplicateConnection, "DUPLICATE_CONNECTION"),
    ];
    for (code, wire) in cases {
        assert_eq!(serde_json::to_value(code).unwrap(), json!(wire));
        let back: ErrorCode = serde_json::from_value(json!(wire)).unwrap();
        assert_eq!(back, code);
        assert!(!code.description().is_empty());
    }
}

#[test]
fn protocol_violations_are_classified() {
    assert!(ErrorCode::SpoofedSender.is_protocol_violation());
    assert!(ErrorCode::NotHost.is_protocol_violation());
    assert!(!ErrorCode::ConnectionClosed.is_protocol_violation());
    assert!(!ErrorCode::RetryExhausted.is_protocol_violation());
}
