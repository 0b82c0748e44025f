//! Async lobby client.
//!
//! [`LobbyClient`] is a thin handle that talks to a background session loop
//! over an unbounded command channel. The loop owns the [`PeerNetwork`], every
//! data connection, the retry timer, the poll timer and the [`Session`], so all
//! lobby mutations happen on one task. Events are emitted on a bounded channel
//! returned from [`LobbyClient::start`].
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), peer_lobby::LobbyError> {
//! use peer_lobby::transports::MemoryBroker;
//! use peer_lobby::{LobbyClient, LobbyEvent, SessionConfig};
//!
//! let broker = MemoryBroker::new();
//! let (host, mut events) = LobbyClient::start(broker.network(), SessionConfig::default());
//! host.register_host("host1", "Alice")?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         LobbyEvent::MemberJoined { peer_id } => println!("{peer_id} joined"),
//!         LobbyEvent::Stopped { .. } => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{SessionConfig, MIN_POLL_INTERVAL};
use crate::connection::{spawn_connection, ConnectionEvent};
use crate::error::{LobbyError, Result};
use crate::error_codes::ErrorCode;
use crate::event::LobbyEvent;
use crate::lobby::{LobbyPhase, LobbyView};
use crate::protocol::{PeerId, TeamId};
use crate::session::Session;
use crate::transport::{PeerNetwork, Transport};

/// Generate a joiner id of the form `m-<32 hex>`.
pub fn new_joiner_id() -> PeerId {
    format!("m-{}", uuid::Uuid::new_v4().simple())
}

// ── Commands ────────────────────────────────────────────────────────

#[derive(Debug)]
enum Command {
    RegisterHost {
        lobby_id: PeerId,
        display_name: String,
    },
    RegisterJoin {
        lobby_id: PeerId,
        display_name: String,
    },
    ToggleReady,
    SelectTeam {
        team_id: TeamId,
        member_id: PeerId,
    },
    PingAll,
    RequestConnectionInfo,
}

// ── Shared state ────────────────────────────────────────────────────

/// Internal shared state between the client handle and the session loop.
struct SharedState {
    running: AtomicBool,
    view: Mutex<LobbyView>,
}

impl SharedState {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            view: Mutex::new(LobbyView::default()),
        }
    }
}

// ── Client handle ───────────────────────────────────────────────────

/// Handle to a running lobby session.
///
/// Action methods queue a command and return immediately. Their outcome is
/// observed through [`LobbyEvent`]s and [`view`](Self::view); a failed action
/// is recorded in the view's `error_message`.
pub struct LobbyClient {
    cmd_tx: mpsc::UnboundedSender<Command>,
    state: Arc<SharedState>,
    task: Option<tokio::task::JoinHandle<()>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    shutdown_timeout: Duration,
}

impl LobbyClient {
    /// Spawn the session loop on `network` and return a handle plus the event
    /// receiver. Must be called from within a tokio runtime.
    #[must_use = "the event receiver must be used to receive events"]
    pub fn start<N: PeerNetwork>(
        network: N,
        config: SessionConfig,
    ) -> (Self, mpsc::Receiver<LobbyEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<Command>();
        // Clamp capacity to at least 1 (tokio panics on 0).
        let capacity = config.event_channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel::<LobbyEvent>(capacity);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let state = Arc::new(SharedState::new());
        let shutdown_timeout = config.shutdown_timeout;

        let task = tokio::spawn(session_loop(
            network,
            config,
            cmd_rx,
            event_tx,
            Arc::clone(&state),
            shutdown_rx,
        ));

        let client = Self {
            cmd_tx,
            state,
            task: Some(task),
            shutdown_tx: Some(shutdown_tx),
            shutdown_timeout,
        };
        (client, event_rx)
    }

    // ── Actions ─────────────────────────────────────────────────────

    /// Register `lobby_id` with the broker and host a new lobby under it.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the session loop has stopped.
    pub fn register_host(
        &self,
        lobby_id: impl Into<PeerId>,
        display_name: impl Into<String>,
    ) -> Result<()> {
        self.send(Command::RegisterHost {
            lobby_id: lobby_id.into(),
            display_name: display_name.into(),
        })
    }

    /// Register under a fresh `m-…` id, dial `lobby_id` and ask to join.
    ///
    /// The dial runs alongside the session loop. Repeating the call after a
    /// failed dial re-dials the host under the same id; a repeat while a dial
    /// is still in flight is reported as [`LobbyEvent::RegistrationFailed`].
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the session loop has stopped.
    pub fn register_join(
        &self,
        lobby_id: impl Into<PeerId>,
        display_name: impl Into<String>,
    ) -> Result<()> {
        self.send(Command::RegisterJoin {
            lobby_id: lobby_id.into(),
            display_name: display_name.into(),
        })
    }

    /// Flip own ready state.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the session loop has stopped.
    pub fn toggle_ready(&self) -> Result<()> {
        self.send(Command::ToggleReady)
    }

    /// Move `member_id` to `team_id`. Only the host may move other members.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the session loop has stopped.
    pub fn select_team(
        &self,
        team_id: impl Into<TeamId>,
        member_id: impl Into<PeerId>,
    ) -> Result<()> {
        self.send(Command::SelectTeam {
            team_id: team_id.into(),
            member_id: member_id.into(),
        })
    }

    /// Send a PING on every open connection; replies arrive as
    /// [`LobbyEvent::Pong`].
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the session loop has stopped.
    pub fn ping_all(&self) -> Result<()> {
        self.send(Command::PingAll)
    }

    /// Ask the host for a full snapshot now instead of waiting for the poll.
    ///
    /// # Errors
    ///
    /// Returns [`LobbyError::NotConnected`] if the session loop has stopped.
    pub fn request_connection_info(&self) -> Result<()> {
        self.send(Command::RequestConnectionInfo)
    }

    /// Stop the session loop, closing every connection and timer.
    ///
    /// After calling this method, the event receiver yields
    /// [`LobbyEvent::Stopped`] and then `None`.
    pub async fn shutdown(&mut self) {
        debug!("LobbyClient: shutdown requested");

        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(mut task) = self.task.take() {
            match tokio::time::timeout(self.shutdown_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(join_err)) => {
                    warn!("session loop terminated with join error: {join_err}");
                }
                Err(_) => {
                    warn!("session loop did not exit within timeout; aborting task");
                    task.abort();
                    if let Err(join_err) = task.await {
                        debug!("session loop aborted: {join_err}");
                    }
                }
            }
        }

        self.state.running.store(false, Ordering::Release);
    }

    // ── State accessors ─────────────────────────────────────────────

    /// Returns `true` until the session loop has stopped.
    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::Acquire)
    }

    /// Latest lobby state published by the session loop.
    pub async fn view(&self) -> LobbyView {
        self.state.view.lock().await.clone()
    }

    fn send(&self, command: Command) -> Result<()> {
        if !self.state.running.load(Ordering::Acquire) {
            return Err(LobbyError::NotConnected);
        }
        self.cmd_tx
            .send(command)
            .map_err(|_| LobbyError::NotConnected)
    }
}

impl std::fmt::Debug for LobbyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LobbyClient")
            .field("running", &self.is_running())
            .field("has_task", &self.task.is_some())
            .finish()
    }
}

impl Drop for LobbyClient {
    fn drop(&mut self) {
        // No executor to drive a graceful close here. Aborting drops the loop
        // future, which drops every connection handle and the network.
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ── Session loop ────────────────────────────────────────────────────

/// Result of dialing the lobby host, with the network handed back.
type DialOutcome<N> = (N, PeerId, Result<<N as PeerNetwork>::Connection>);

/// A dial in flight. It owns the network until the handshake resolves.
type PendingDial<N> = Pin<Box<dyn Future<Output = DialOutcome<N>> + Send>>;

/// Everything the loop needs besides the session itself.
struct LoopContext<N: PeerNetwork> {
    /// `None` while `dial` holds the network.
    network: Option<N>,
    dial: Option<PendingDial<N>>,
    config: SessionConfig,
    listening: bool,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

/// Background loop multiplexing commands, broker accepts, connection events
/// and timers via `tokio::select!`.
///
/// Exits when the shutdown signal fires or the client handle is dropped.
async fn session_loop<N: PeerNetwork>(
    network: N,
    config: SessionConfig,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    event_tx: mpsc::Sender<LobbyEvent>,
    state: Arc<SharedState>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    debug!("session loop started");

    let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ConnectionEvent>();
    let mut session = Session::new(&config, event_tx.clone());
    let mut ctx = LoopContext {
        network: Some(network),
        dial: None,
        config,
        listening: false,
        conn_tx,
    };
    let mut poll: Option<Interval> = None;

    let reason = loop {
        let next_retry = session.next_retry_at();

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(cmd) => run_command(cmd, &mut session, &mut ctx).await,
                    None => {
                        debug!("command channel closed, shutting down session loop");
                        break "client dropped".to_string();
                    }
                }
            }

            _ = &mut shutdown_rx => {
                debug!("shutdown signal received");
                break "client shut down".to_string();
            }

            incoming = accept_opt(ctx.network.as_mut()), if ctx.listening => {
                match incoming {
                    Some(Ok((peer_id, transport))) => {
                        accept_connection(peer_id, transport, &mut session, ctx.conn_tx.clone())
                            .await;
                    }
                    Some(Err(e)) => session.client_failed(&e),
                    None => {
                        ctx.listening = false;
                        session.client_closed();
                    }
                }
            }

            (network, lobby_id, dialed) = dial_opt(&mut ctx.dial) => {
                ctx.network = Some(network);
                finish_join(&mut session, ctx.conn_tx.clone(), lobby_id, dialed);
            }

            Some(event) = conn_rx.recv() => {
                match event {
                    ConnectionEvent::Data { peer_id, text } => {
                        session.handle_data(&peer_id, &text, Instant::now());
                    }
                    ConnectionEvent::Error { peer_id, error } => {
                        session.connection_failed(&peer_id, &error);
                    }
                    ConnectionEvent::Closed { peer_id } => {
                        session.connection_closed(&peer_id);
                    }
                }
            }

            _ = sleep_until_opt(next_retry) => {
                session.fire_due_retries(Instant::now());
            }

            _ = tick_opt(&mut poll) => {
                if let Err(e) = session.request_connection_info() {
                    debug!("connection info poll skipped: {e}");
                }
            }
        }

        // The poll only runs while joined.
        match (session.phase() == LobbyPhase::Joined, poll.is_some()) {
            (true, false) => {
                let period = ctx.config.poll_interval.max(MIN_POLL_INTERVAL);
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                poll = Some(interval);
                debug!(?period, "connection info poll started");
            }
            (false, true) => poll = None,
            _ => {}
        }

        *state.view.lock().await = session.view();
    };

    session.teardown();
    if ctx.dial.take().is_some() {
        debug!("dial to lobby host abandoned");
    }
    if let Some(network) = ctx.network.as_mut() {
        if let Err(e) = network.close().await {
            warn!("error while closing peer network: {e}");
        }
    }
    *state.view.lock().await = session.view();
    state.running.store(false, Ordering::Release);

    // Stopped is the last event and must never be dropped.
    if event_tx
        .send(LobbyEvent::Stopped {
            reason: Some(reason),
        })
        .await
        .is_err()
    {
        debug!("event channel closed, receiver dropped");
    }

    debug!("session loop exited");
}

async fn run_command<N: PeerNetwork>(
    cmd: Command,
    session: &mut Session,
    ctx: &mut LoopContext<N>,
) {
    let result = match cmd {
        Command::RegisterHost {
            lobby_id,
            display_name,
        } => {
            register_host(session, ctx, lobby_id, display_name).await;
            Ok(())
        }
        Command::RegisterJoin {
            lobby_id,
            display_name,
        } => {
            register_join(session, ctx, lobby_id, display_name).await;
            Ok(())
        }
        Command::ToggleReady => session.toggle_ready(),
        Command::SelectTeam { team_id, member_id } => session.select_team(&team_id, &member_id),
        Command::PingAll => session.ping_all(),
        Command::RequestConnectionInfo => session.request_connection_info(),
    };
    if let Err(e) = result {
        warn!("action failed: {e}");
        session.record_error(ErrorCode::ActionFailed, format!("Action failed: {e}"));
    }
}

async fn register_host<N: PeerNetwork>(
    session: &mut Session,
    ctx: &mut LoopContext<N>,
    lobby_id: PeerId,
    display_name: String,
) {
    if let Some(existing) = session.roster().my_id() {
        let e = LobbyError::AlreadyRegistered(existing.clone());
        session.registration_failed(e.to_string());
        return;
    }
    if let Err(e) = listen(ctx, &lobby_id).await {
        session.registration_failed(e.to_string());
        return;
    }
    if let Err(e) = session.register_host(&lobby_id, &display_name) {
        session.registration_failed(e.to_string());
    }
}

async fn register_join<N: PeerNetwork>(
    session: &mut Session,
    ctx: &mut LoopContext<N>,
    lobby_id: PeerId,
    display_name: String,
) {
    if ctx.dial.is_some() {
        let reason = format!("already dialing the lobby host, {lobby_id} not dialed");
        session.registration_failed(reason);
        return;
    }
    let my_id = match session.pending_join_id() {
        Some(pending) => pending.clone(),
        None => {
            if let Some(existing) = session.roster().my_id() {
                let e = LobbyError::AlreadyRegistered(existing.clone());
                session.registration_failed(e.to_string());
                return;
            }
            new_joiner_id()
        }
    };

    if !ctx.listening {
        if let Err(e) = listen(ctx, &my_id).await {
            session.registration_failed(e.to_string());
            return;
        }
    }
    if let Err(e) = session.register_join(&my_id, &lobby_id, &display_name) {
        session.registration_failed(e.to_string());
        return;
    }

    let Some(mut network) = ctx.network.take() else {
        session.registration_failed(format!("could not reach lobby {lobby_id}: network busy"));
        return;
    };
    // Only accepts wait for the handshake; the rest of the loop keeps running.
    let connect_timeout = ctx.config.connect_timeout;
    debug!(%lobby_id, "dialing lobby host");
    ctx.dial = Some(Box::pin(async move {
        let dialed = tokio::time::timeout(connect_timeout, network.connect(&lobby_id))
            .await
            .map_err(|_| LobbyError::Timeout)
            .and_then(|result| result);
        (network, lobby_id, dialed)
    }));
}

fn finish_join<T: Transport>(
    session: &mut Session,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
    lobby_id: PeerId,
    dialed: Result<T>,
) {
    let transport = match dialed {
        Ok(transport) => transport,
        Err(e) => {
            session.registration_failed(format!("could not reach lobby {lobby_id}: {e}"));
            return;
        }
    };

    let handle = spawn_connection(lobby_id.clone(), transport, conn_tx);
    if session.connection_opened(handle).is_err() {
        return;
    }
    if let Err(e) = session.introduce_to_host() {
        session.record_error(
            ErrorCode::TransportError,
            format!("Could not introduce to lobby {lobby_id}: {e}"),
        );
    }
}

async fn listen<N: PeerNetwork>(ctx: &mut LoopContext<N>, my_id: &PeerId) -> Result<()> {
    let network = ctx.network.as_mut().ok_or(LobbyError::NotConnected)?;
    tokio::time::timeout(ctx.config.connect_timeout, network.listen(my_id))
        .await
        .map_err(|_| LobbyError::Timeout)??;
    ctx.listening = true;
    info!(%my_id, "registered with peer network");
    Ok(())
}

async fn accept_connection<T: Transport>(
    peer_id: PeerId,
    mut transport: T,
    session: &mut Session,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
) {
    if session.registry().contains(&peer_id) {
        // Refuse before any frame from the second connection is read.
        if let Err(e) = transport.close().await {
            debug!(%peer_id, "error closing duplicate connection: {e}");
        }
        session.duplicate_connection(&peer_id);
        return;
    }
    let handle = spawn_connection(peer_id, transport, conn_tx);
    // The registry was checked above; a failure here is already recorded.
    let _ = session.connection_opened(handle);
}

async fn accept_opt<N: PeerNetwork>(
    network: Option<&mut N>,
) -> Option<Result<(PeerId, N::Connection)>> {
    match network {
        Some(network) => network.accept().await,
        None => std::future::pending().await,
    }
}

/// Resolves when the pending dial does, clearing the slot.
async fn dial_opt<N: PeerNetwork>(dial: &mut Option<PendingDial<N>>) -> DialOutcome<N> {
    match dial {
        Some(pending) => {
            let outcome = pending.as_mut().await;
            *dial = None;
            outcome
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn tick_opt(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use crate::transports::MemoryBroker;

    async fn next_matching<F>(events: &mut mpsc::Receiver<LobbyEvent>, mut pred: F) -> LobbyEvent
    where
        F: FnMut(&LobbyEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
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

    #[test]
    fn joiner_ids_have_prefix_and_hex_body() {
        let id = new_joiner_id();
        let body = id.strip_prefix("m-").unwrap();
        assert_eq!(body.len(), 32);
        assert!(body.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, new_joiner_id());
    }

    #[tokio::test]
    async fn register_host_publishes_view() {
        let broker = MemoryBroker::new();
        let (client, mut events) = LobbyClient::start(broker.network(), SessionConfig::default());
        client.register_host("host1", "Alice").unwrap();

        next_matching(&mut events, |e| matches!(e, LobbyEvent::Registered { .. })).await;
        // The view is published after the command iteration completes.
        tokio::task::yield_now().await;
        let view = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                let view = client.view().await;
                if view.is_hosting {
                    return view;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(view.lobby_member_ids, vec!["host1".to_string()]);
        assert!(broker.is_listening("host1"));
    }

    #[tokio::test]
    async fn taken_lobby_id_fails_registration() {
        let broker = MemoryBroker::new();
        let mut squatter = broker.network();
        squatter.listen(&"host1".to_string()).await.unwrap();

        let (client, mut events) = LobbyClient::start(broker.network(), SessionConfig::default());
        client.register_host("host1", "Alice").unwrap();
        match next_matching(&mut events, |e| {
            matches!(e, LobbyEvent::RegistrationFailed { .. })
        })
        .await
        {
            LobbyEvent::RegistrationFailed { reason } => assert!(reason.contains("host1")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn actions_fail_after_shutdown() {
        let broker = MemoryBroker::new();
        let (mut client, mut events) =
            LobbyClient::start(broker.network(), SessionConfig::default());
        client.shutdown().await;

        assert!(!client.is_running());
        assert!(matches!(client.toggle_ready(), Err(LobbyError::NotConnected)));
        let stopped = next_matching(&mut events, |e| matches!(e, LobbyEvent::Stopped { .. })).await;
        assert_eq!(
            stopped,
            LobbyEvent::Stopped {
                reason: Some("client shut down".into())
            }
        );
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn double_shutdown_and_drop_do_not_panic() {
        let broker = MemoryBroker::new();
        let (mut client, _events) = LobbyClient::start(broker.network(), SessionConfig::default());
        client.shutdown().await;
        client.shutdown().await;
        drop(client);

        let (client, _events) = LobbyClient::start(broker.network(), SessionConfig::default());
        drop(client);
    }

    #[tokio::test]
    async fn zero_event_channel_capacity_does_not_panic() {
        let broker = MemoryBroker::new();
        let config = SessionConfig {
            event_channel_capacity: 0,
            ..SessionConfig::default()
        };
        let (mut client, _events) = LobbyClient::start(broker.network(), config);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn debug_impl_for_client() {
        let broker = MemoryBroker::new();
        let (mut client, _events) = LobbyClient::start(broker.network(), SessionConfig::default());
        let debug = format!("{client:?}");
        assert!(debug.contains("LobbyClient"));
        assert!(debug.contains("running"));
        client.shutdown().await;
    }
}
