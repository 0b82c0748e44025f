//! # Peer Lobby
//!
//! Host-authoritative lobby session protocol for small groups of peers that
//! talk over direct data connections.
//!
//! One peer hosts; its id is the lobby id. Joiners dial the host, introduce
//! themselves and ask to join. The host owns the only authoritative roster and
//! after every change pushes the *full* `{memberLookup, teamLookup,
//! lobbyMemberIds}` snapshot to everyone else, who overwrite their replica
//! wholesale. Joiners also poll the host periodically as a backstop.
//!
//! ## Features
//!
//! - **Transport-agnostic**: implement [`PeerNetwork`] and [`Transport`] for
//!   your signaling / data channel stack; an in-process [`transports::MemoryBroker`]
//!   is included
//! - **Idempotent delivery**: every message carries a `uniqueId`; duplicates
//!   are dropped, unmet preconditions are retried with bounded backoff
//! - **Single writer**: all state lives in one [`Session`] driven by one task
//! - **Event-driven**: receive typed [`LobbyEvent`]s via a channel and read
//!   [`LobbyView`] snapshots for rendering
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), peer_lobby::LobbyError> {
//! use peer_lobby::transports::MemoryBroker;
//! use peer_lobby::{LobbyClient, SessionConfig};
//!
//! let broker = MemoryBroker::new();
//! let (host, _host_events) = LobbyClient::start(broker.network(), SessionConfig::default());
//! let (guest, _guest_events) = LobbyClient::start(broker.network(), SessionConfig::default());
//!
//! host.register_host("host1", "Alice")?;
//! guest.register_join("host1", "Bob")?;
//! host.select_team("1", "host1")?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod delivery;
pub mod error;
pub mod error_codes;
pub mod event;
pub mod lobby;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use client::LobbyClient;
pub use config::SessionConfig;
pub use delivery::{DeliveryTracker, RetryPolicy};
pub use error::{DecodeError, LobbyError};
pub use error_codes::ErrorCode;
pub use event::LobbyEvent;
pub use lobby::{LobbyPhase, LobbyView, Roster};
pub use protocol::{Member, Message, MessageKind, Payload, PeerId, Snapshot, Team, TeamId};
pub use registry::{ConnectionHandle, ConnectionRegistry};
pub use session::{ErrorLog, Session};
pub use transport::{PeerNetwork, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::WebSocketTransport;
