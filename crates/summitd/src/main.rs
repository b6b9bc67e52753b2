//! summitd — Summit peer-to-peer mesh daemon.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use libsummit::{MeshEngine, MeshEvent};
use summit_core::config::MeshConfig;
use summit_core::crypto::{select_provider, Keypair};
use summit_services::loopback::LoopbackBearer;
use summit_services::peer::PeerId;
use summit_services::transport::MultiTransport;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_path = MeshConfig::write_default_if_missing().context("writing default config")?;
    let config = MeshConfig::load().context("loading config")?;
    tracing::info!(path = %config_path.display(), "config loaded");

    let provider = select_provider().context("selecting crypto provider")?;
    let identity = load_or_generate_identity(&config, provider.as_ref())?;
    let local_id = derive_peer_id(&identity);
    tracing::info!(peer_id = hex::encode(local_id), "summitd starting");

    // No BLE/Wi-Fi Direct radio is available on a development host; a
    // loopback bearer on an ephemeral UDP port stands in so the engine has
    // something to drive. A real deployment wires BleBearer/WifiBearer here.
    let bind_addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let (loopback, bearer_events) =
        LoopbackBearer::bind(bind_addr, config.mesh.fragment_size).context("binding loopback bearer")?;
    tracing::info!(addr = %loopback.local_addr()?, "loopback bearer bound");

    let transport = MultiTransport::new(
        vec![Arc::new(loopback)],
        config.transport.policy,
        config.transport.wifi_threshold_bytes,
        config.transport.rate_limit_capacity,
        config.transport.rate_limit_refill_per_sec,
    );
    transport.start().context("starting transport bearers")?;

    let (engine, mut events) = MeshEngine::start(local_id, identity, provider, config, transport, vec![bearer_events]);

    let event_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            log_event(&event);
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    tracing::info!("shutting down");
    engine.stop().await.context("stopping engine")?;
    event_task.abort();
    Ok(())
}

fn log_event(event: &MeshEvent) {
    match event {
        MeshEvent::MessageReceived { sender, content } => {
            tracing::info!(sender = hex::encode(sender), bytes = content.len(), "message received");
        }
        MeshEvent::ChannelMessageReceived { channel, sender, content } => {
            tracing::info!(
                channel = hex::encode(channel),
                sender = hex::encode(sender),
                bytes = content.len(),
                "channel message received"
            );
        }
        MeshEvent::PeerSecured { peer } => tracing::info!(peer = hex::encode(peer), "peer secured"),
        MeshEvent::PeerDisconnected { peer } => tracing::info!(peer = hex::encode(peer), "peer disconnected"),
        MeshEvent::HandshakeFailed { peer } => tracing::warn!(peer = hex::encode(peer), "handshake failed"),
        MeshEvent::SessionFailed { peer } => tracing::warn!(peer = hex::encode(peer), "session torn down after repeated decrypt failures"),
        MeshEvent::Error { context } => tracing::error!(context, "engine error"),
    }
}

/// Loads the static keypair from `config.identity.key_path`, generating and
/// persisting a fresh one on first run.
fn load_or_generate_identity(config: &MeshConfig, provider: &dyn summit_core::crypto::CryptoProvider) -> Result<Keypair> {
    let path = &config.identity.key_path;
    if path.exists() {
        let bytes = std::fs::read(path).with_context(|| format!("reading identity key from {}", path.display()))?;
        let secret: [u8; 32] =
            bytes.try_into().map_err(|_| anyhow::anyhow!("identity key at {} is not 32 bytes", path.display()))?;
        return Ok(Keypair::from_private(secret));
    }
    let keypair = Keypair::generate(provider);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    std::fs::write(path, keypair.private_bytes()).with_context(|| format!("writing identity key to {}", path.display()))?;
    Ok(keypair)
}

fn derive_peer_id(identity: &Keypair) -> PeerId {
    let hash = summit_core::crypto::hash(&identity.public);
    let mut id = [0u8; 8];
    id.copy_from_slice(&hash[..8]);
    id
}
