//! LobbySync demo - a host and two clients over the in-process adapters.
//!
//! Walks through create, join, ready, start and activation, logging every
//! session event. Tune with `RUST_LOG` and the `LOBBYSYNC_*` variables.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lobbysync_domain::PlayerId;
use lobbysync_player::infrastructure::testing::{
    InMemoryRelay, InMemorySessionStore, SimulatedLoader,
};
use lobbysync_player::ports::outbound::{RelayPort, SessionStorePort};
use lobbysync_player::{
    load_dotenv_from_repo_root, LocalIdentity, SessionConfig, SessionManager,
};
use lobbysync_shared::CreateSessionRequest;

const MAX_FRAMES: usize = 2_000;

fn peer(
    store: &Arc<dyn SessionStorePort>,
    relay: &Arc<dyn RelayPort>,
    config: &SessionConfig,
    id: &str,
) -> Result<SessionManager> {
    let player_id = PlayerId::new(id).with_context(|| format!("invalid player id {id}"))?;
    Ok(SessionManager::new(
        Arc::clone(store),
        Arc::clone(relay),
        Arc::new(SimulatedLoader::default()),
        LocalIdentity::Player(player_id),
        config.clone(),
    ))
}

#[tokio::main]
async fn main() -> Result<()> {
    load_dotenv_from_repo_root();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lobbysync_player=debug,lobbysync_demo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = SessionConfig::from_env().context("loading session config")?;
    tracing::info!(scene = %config.scene, threshold = config.activation_threshold, "Starting LobbySync demo");

    let store: Arc<dyn SessionStorePort> = Arc::new(InMemorySessionStore::new());
    let relay: Arc<dyn RelayPort> = Arc::new(InMemoryRelay::new());

    let mut host = peer(&store, &relay, &config, "host")?;
    let mut alice = peer(&store, &relay, &config, "alice")?;
    let mut bob = peer(&store, &relay, &config, "bob")?;

    host.subscribe(|event| tracing::info!(peer = "host", ?event, "Session event"))
        .await;

    let session_id = host
        .create_session(CreateSessionRequest::new("Demo lobby", 4), "Host")
        .await?
        .id()
        .clone();
    alice.join_session(&session_id, "Alice", None).await?;
    bob.join_session(&session_id, "Bob", None).await?;

    let mut peers = [host, alice, bob];
    for manager in peers.iter_mut() {
        manager.set_ready(true).await?;
    }

    let mut interval = tokio::time::interval(config.tick_interval);
    let mut started = false;
    for frame in 0..MAX_FRAMES {
        interval.tick().await;
        for manager in peers.iter_mut() {
            manager.tick(config.tick_interval).await;
        }

        if !started && peers[0].can_start() {
            tracing::info!(frame, "Everyone is ready, starting");
            peers[0].start_game().await?;
            started = true;
        }

        if peers.iter().all(|m| m.start_phase().is_terminal()) {
            for manager in &peers {
                tracing::info!(player = %manager.player_id(), phase = ?manager.start_phase(), "Handshake finished");
            }
            break;
        }
    }

    if !peers.iter().all(|m| m.start_phase().is_terminal()) {
        bail!("handshake did not finish within {MAX_FRAMES} frames");
    }

    for manager in peers.iter_mut() {
        manager.shutdown().await;
    }
    tracing::info!("Demo finished");
    Ok(())
}
