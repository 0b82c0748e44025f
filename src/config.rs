//! Session configuration.

use std::time::Duration;

use crate::delivery::RetryPolicy;
use crate::protocol::Team;

/// Default interval of the joiner's `REQUEST_CONNECTION_INFO` poll.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Shortest poll period; `tokio::time::interval` panics on zero.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default bound on broker registration and dialing.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the bounded event channel.
pub const DEFAULT_EVENT_CHANNEL_CAPACITY: usize = 256;

/// Default timeout for the graceful shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// The two teams every hosted lobby starts with.
pub fn default_teams() -> Vec<Team> {
    vec![Team::new("1", "#ccffcc"), Team::new("2", "#ccccff")]
}

/// Configuration for a [`LobbyClient`](crate::LobbyClient) session.
///
/// All fields have defaults; use the `with_*` builders to tune them.
///
/// # Example
///
/// ```
/// use peer_lobby::SessionConfig;
/// use std::time::Duration;
///
/// let config = SessionConfig::default()
///     .with_poll_interval(Duration::from_secs(5))
///     .with_event_channel_capacity(0);
/// assert_eq!(config.poll_interval, Duration::from_secs(5));
/// assert_eq!(config.event_channel_capacity, 1);
/// assert_eq!(config.teams.len(), 2);
/// ```
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often a joined peer asks the host for a full snapshot, as a
    /// backstop to pushed broadcasts.
    ///
    /// Defaults to **10 seconds**. Values below 1 ms are clamped to 1 ms.
    pub poll_interval: Duration,
    /// Backoff for messages waiting on a precondition.
    pub retry: RetryPolicy,
    /// Upper bound on [`listen`](crate::PeerNetwork::listen) and
    /// [`connect`](crate::PeerNetwork::connect). A handshake that never
    /// completes surfaces as [`LobbyError::Timeout`](crate::LobbyError::Timeout).
    ///
    /// Defaults to **10 seconds**.
    pub connect_timeout: Duration,
    /// Capacity of the bounded event channel.
    ///
    /// When the consumer cannot keep up, events are dropped (with a warning
    /// logged) so the session loop never blocks. The final `Stopped` event is
    /// always delivered.
    ///
    /// Defaults to **256**. Values below 1 are clamped to 1.
    pub event_channel_capacity: usize,
    /// How long [`LobbyClient::shutdown`](crate::LobbyClient::shutdown) waits
    /// for the loop to close connections before aborting it.
    ///
    /// Defaults to **1 second**.
    pub shutdown_timeout: Duration,
    /// Teams seeded into a newly hosted lobby.
    pub teams: Vec<Team>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            event_channel_capacity: DEFAULT_EVENT_CHANNEL_CAPACITY,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            teams: default_teams(),
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_POLL_INTERVAL);
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the capacity of the bounded event channel. Values below 1 are
    /// clamped to 1.
    #[must_use]
    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity.max(1);
        self
    }

    /// A zero timeout aborts the loop immediately on shutdown.
    #[must_use]
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Replace the default team set.
    #[must_use]
    pub fn with_teams(mut self, teams: Vec<Team>) -> Self {
        self.teams = teams;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.event_channel_capacity, 256);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.retry.max_retries, 5);
        let ids: Vec<&str> = config.teams.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn zero_poll_interval_is_clamped() {
        let config = SessionConfig::new().with_poll_interval(Duration::ZERO);
        assert_eq!(config.poll_interval, Duration::from_millis(1));
    }
}
