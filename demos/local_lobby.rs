//! # Local Lobby Example
//!
//! Runs a host and two guests in one process over the in-memory broker:
//!
//! - the host opens lobby `host1`
//! - Bob and Carol join, pick teams and ready up
//! - every peer prints its converged view
//!
//! ## Running
//!
//! ```sh
//! RUST_LOG=peer_lobby=debug cargo run --example local_lobby
//! ```

use std::time::Duration;

use peer_lobby::transports::MemoryBroker;
use peer_lobby::{LobbyClient, LobbyEvent, LobbyPhase, LobbyView, SessionConfig};
use tokio::sync::mpsc;

// ─────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────

/// Poll `client` until `pred` holds or a few seconds pass.
async fn settle<F>(
    client: &LobbyClient,
    mut pred: F,
) -> Result<LobbyView, Box<dyn std::error::Error>>
where
    F: FnMut(&LobbyView) -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let view = client.view().await;
            if pred(&view) {
                return view;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    Ok(waited)
}

/// Log every event a client emits until it stops.
fn print_events(label: &'static str, mut events: mpsc::Receiver<LobbyEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                LobbyEvent::RosterChanged(_) => {}
                LobbyEvent::Stopped { reason } => {
                    tracing::info!("[{label}] stopped: {}", reason.as_deref().unwrap_or("-"));
                }
                other => tracing::info!("[{label}] {other:?}"),
            }
        }
    });
}

fn describe(label: &str, view: &LobbyView) {
    tracing::info!("[{label}] phase={:?} members={:?}", view.phase, view.lobby_member_ids);
    for id in &view.lobby_member_ids {
        if let Some(member) = view.member_lookup.get(id) {
            tracing::info!(
                "[{label}]   {} ({}) team={} ready={}",
                member.display_name,
                member.id,
                member.team_id.as_deref().unwrap_or("-"),
                member.is_ready
            );
        }
    }
}

// ─────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let broker = MemoryBroker::new();
    let config = SessionConfig::default().with_poll_interval(Duration::from_secs(2));

    // ── Host ────────────────────────────────────────────────────────
    let (mut host, host_events) = LobbyClient::start(broker.network(), config.clone());
    print_events("host", host_events);
    host.register_host("host1", "Alice")?;
    settle(&host, |v| v.is_hosting).await?;

    // ── Guests ──────────────────────────────────────────────────────
    let (mut bob, bob_events) = LobbyClient::start(broker.network(), config.clone());
    print_events("bob", bob_events);
    bob.register_join("host1", "Bob")?;
    let bob_id = settle(&bob, |v| v.phase == LobbyPhase::Joined)
        .await?
        .my_id
        .ok_or("bob has no id")?;

    let (mut carol, carol_events) = LobbyClient::start(broker.network(), config);
    print_events("carol", carol_events);
    carol.register_join("host1", "Carol")?;
    let carol_id = settle(&carol, |v| v.phase == LobbyPhase::Joined)
        .await?
        .my_id
        .ok_or("carol has no id")?;

    // ── Teams and ready state ───────────────────────────────────────
    bob.select_team("1", bob_id.clone())?;
    carol.select_team("2", carol_id.clone())?;
    host.select_team("1", "host1")?;
    bob.toggle_ready()?;
    carol.toggle_ready()?;

    let all_ready = |v: &LobbyView| {
        [&bob_id, &carol_id]
            .iter()
            .all(|id| v.member_lookup.get(*id).is_some_and(|m| m.is_ready))
    };
    let host_view = settle(&host, all_ready).await?;
    let bob_view = settle(&bob, |v| v.team_lookup == host_view.team_lookup).await?;
    let carol_view = settle(&carol, |v| v.team_lookup == host_view.team_lookup).await?;

    describe("host", &host_view);
    describe("bob", &bob_view);
    describe("carol", &carol_view);

    // ── Clean shutdown ──────────────────────────────────────────────
    carol.shutdown().await;
    let after = settle(&host, |v| v.lobby_member_ids.len() == 2).await?;
    tracing::info!("host error log after carol left: {:?}", after.error_message);

    bob.shutdown().await;
    host.shutdown().await;
    Ok(())
}
