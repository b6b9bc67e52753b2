//! Integration harness: wires `MeshEngine` instances together over
//! loopback UDP bearers, standing in for a real BLE/Wi-Fi Direct radio.
//! Each scenario file below spins up its own nodes and drives the public
//! engine API exactly as an application would.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libsummit::{MeshEngine, MeshEvent};
use summit_core::config::MeshConfig;
use summit_core::crypto::{select_provider, Keypair};
use summit_services::loopback::LoopbackBearer;
use summit_services::peer::PeerId;
use summit_services::transport::{Bearer, MultiTransport};
use tokio::sync::mpsc;

mod broadcast;
mod channel;
mod fragmentation;
mod handshake;
mod store_and_forward;

pub struct Node {
    pub id: PeerId,
    pub engine: MeshEngine,
    pub events: mpsc::Receiver<MeshEvent>,
    loopback: Arc<LoopbackBearer>,
}

/// A config with a short housekeeping sweep so sweep-driven behavior
/// (fragment/handshake expiry, health transitions) doesn't need a
/// multi-second wait inside a test.
pub fn test_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.health.sweep_interval_secs = 1;
    config
}

pub async fn spawn_node(config: MeshConfig) -> Result<Node> {
    let provider = select_provider().context("no crypto provider available")?;
    let identity = Keypair::generate(provider.as_ref());
    let id = peer_id_from(&identity);

    // The loopback bearer stands in for a real UDP socket, not a
    // bandwidth-constrained radio, so it's given a generous frame cap
    // independent of `config.mesh.fragment_size` (which governs whether
    // the engine fragments at all, not what the transport can carry).
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (loopback, bearer_events) = LoopbackBearer::bind(addr, 65536).context("binding loopback bearer")?;
    let loopback = Arc::new(loopback);

    let transport = MultiTransport::new(
        vec![loopback.clone() as Arc<dyn Bearer>],
        config.transport.policy,
        config.transport.wifi_threshold_bytes,
        config.transport.rate_limit_capacity,
        config.transport.rate_limit_refill_per_sec,
    );

    let (engine, events) = MeshEngine::start(id, identity, provider, config, transport, vec![bearer_events]);
    Ok(Node { id, engine, events, loopback })
}

fn peer_id_from(identity: &Keypair) -> PeerId {
    let hash = summit_core::crypto::hash(&identity.public);
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash[..8]);
    id
}

/// Registers two nodes' loopback bearers with each other so frames sent
/// between them actually reach a socket.
pub fn link(a: &Node, b: &Node) -> Result<()> {
    let addr_a = a.loopback.local_addr().context("node a local_addr")?;
    let addr_b = b.loopback.local_addr().context("node b local_addr")?;
    a.loopback.register_peer(b.id, addr_b);
    b.loopback.register_peer(a.id, addr_a);
    Ok(())
}

/// Drains `events` until `matches` returns true or `timeout` elapses.
/// Events that don't match are discarded — callers only need the one
/// event they're waiting for, not the full sequence.
pub async fn wait_for(
    events: &mut mpsc::Receiver<MeshEvent>,
    timeout: Duration,
    mut matches: impl FnMut(&MeshEvent) -> bool,
) -> Option<MeshEvent> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }
        match tokio::time::timeout(remaining, events.recv()).await {
            Ok(Some(event)) if matches(&event) => return Some(event),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Performs a handshake from `a` to `b` and waits for both sides to
/// report the session as secured.
pub async fn secure_pair(a: &mut Node, b: &mut Node) -> Result<()> {
    a.engine.initiate_handshake(b.id).await?;
    wait_for(&mut a.events, Duration::from_secs(2), |e| {
        matches!(e, MeshEvent::PeerSecured { peer } if *peer == b.id)
    })
    .await
    .context("initiator never reported PeerSecured")?;
    wait_for(&mut b.events, Duration::from_secs(2), |e| {
        matches!(e, MeshEvent::PeerSecured { peer } if *peer == a.id)
    })
    .await
    .context("responder never reported PeerSecured")?;
    Ok(())
}
