//! `MeshEngine` — the orchestrator. Owns every piece of long-lived mesh
//! state (peer table, dedup, reassembly, store-and-forward, health) behind
//! a single actor task; public methods post onto the actor's inbox rather
//! than touching that state directly, so there is no locking anywhere in
//! this module.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use zerocopy::{AsBytes, FromBytes};

use summit_core::config::MeshConfig;
use summit_core::crypto::{CryptoProvider, Keypair, NoiseHandshake, Role};
use summit_core::wire::{self, MessageFlags, MessageHeader, MessageType};
use summit_services::dedup::Dedup;
use summit_services::fragment::{fragment, Assembler, Fragment};
use summit_services::health::{HealthConfig, HealthMonitor};
use summit_services::peer::{ConnectionState, PeerId, PeerRecord};
use summit_services::store_forward::StoreAndForward;
use summit_services::transport::{BearerEvent, MultiTransport, PeerId as TransportPeerId};

pub type MessageId = [u8; 16];
pub type ChannelId = [u8; 8];

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("peer has no secured session")]
    NoSecuredSession,
    #[error("peer is blocked")]
    PeerBlocked,
    #[error(transparent)]
    Crypto(#[from] summit_core::crypto::CryptoError),
    #[error(transparent)]
    Transport(#[from] summit_services::transport::TransportError),
    #[error(transparent)]
    Fragment(#[from] summit_services::fragment::FragmentError),
    #[error("engine has already stopped")]
    Stopped,
    #[error("not a member of this channel")]
    NotInChannel,
}

/// Upcalls to the application. Delivered on a channel handed back by
/// [`MeshEngine::start`].
#[derive(Debug, Clone)]
pub enum MeshEvent {
    MessageReceived { sender: PeerId, content: Vec<u8> },
    ChannelMessageReceived { channel: ChannelId, sender: PeerId, content: Vec<u8> },
    PeerSecured { peer: PeerId },
    PeerDisconnected { peer: PeerId },
    HandshakeFailed { peer: PeerId },
    /// A session's AEAD decrypt failures crossed [`wire::AEAD_FAILURE_THRESHOLD`]
    /// and the session was torn down; the peer needs a fresh handshake.
    SessionFailed { peer: PeerId },
    Error { context: String },
}

enum Command {
    SendBroadcast { content: Vec<u8>, reply: oneshot::Sender<MessageId> },
    SendDirect { peer: PeerId, content: Vec<u8>, reply: oneshot::Sender<Result<MessageId, EngineError>> },
    JoinChannel { channel: ChannelId, password: Option<Vec<u8>>, reply: oneshot::Sender<()> },
    LeaveChannel { channel: ChannelId, reply: oneshot::Sender<()> },
    SendToChannel { channel: ChannelId, content: Vec<u8>, reply: oneshot::Sender<Result<MessageId, EngineError>> },
    BlockPeer { peer: PeerId, reply: oneshot::Sender<()> },
    UnblockPeer { peer: PeerId, reply: oneshot::Sender<()> },
    InitiateHandshake { peer: PeerId, reply: oneshot::Sender<Result<(), EngineError>> },
    Stop { reply: oneshot::Sender<()> },
}

/// Handle to a running actor. Cloning is cheap (it's just a sender); every
/// clone talks to the same actor task.
#[derive(Clone)]
pub struct MeshEngine {
    inbox: mpsc::Sender<Command>,
}

impl MeshEngine {
    /// Spawns the actor task and returns a handle plus the application
    /// event stream. `local_id` is this node's 8-byte peer id; `identity`
    /// is the long-lived Noise static keypair.
    pub fn start(
        local_id: PeerId,
        identity: Keypair,
        provider: Arc<dyn CryptoProvider>,
        config: MeshConfig,
        transport: MultiTransport,
        bearer_events: Vec<mpsc::Receiver<BearerEvent>>,
    ) -> (Self, mpsc::Receiver<MeshEvent>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(256);
        let (events_tx, events_rx) = mpsc::channel(256);

        let merged_bearer_events = merge_bearer_events(bearer_events);

        let actor = Actor {
            local_id,
            identity,
            provider,
            dedup: Dedup::new(
                config.mesh.bloom_size_bits,
                config.mesh.bloom_hash_count,
                config.mesh.max_pending_fragments.max(1000),
            ),
            assembler: Assembler::new(Duration::from_secs(config.mesh.fragment_timeout_secs)),
            store_forward: StoreAndForward::new(
                config.store_and_forward.max_cache_bytes,
                config.store_and_forward.max_total,
                config.store_and_forward.max_per_recipient,
                Duration::from_secs(config.store_and_forward.ttl_secs),
            ),
            health: HealthMonitor::new(HealthConfig {
                ema_alpha: config.health.ema_alpha,
                ring_buffer_len: config.health.ring_buffer_len,
                peer_timeout: Duration::from_secs(config.health.peer_timeout_secs),
                min_active_peers: config.health.min_active_peers,
            }),
            peers: HashMap::new(),
            pending_handshakes: HashMap::new(),
            blocked: HashSet::new(),
            channels: HashMap::new(),
            transport,
            max_hops: config.mesh.max_hops,
            fragment_size: config.mesh.fragment_size,
            sweep_interval: Duration::from_secs(config.health.sweep_interval_secs.max(1)),
            handshake_timeout: Duration::from_secs(config.mesh.handshake_timeout_secs.max(1)),
            peer_timeout: Duration::from_secs(config.health.peer_timeout_secs.max(1)),
            events_tx,
        };

        tokio::spawn(actor.run(inbox_rx, merged_bearer_events));

        (Self { inbox: inbox_tx }, events_rx)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.inbox.send(make(tx)).await.map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }

    pub async fn send_broadcast(&self, content: Vec<u8>) -> Result<MessageId, EngineError> {
        self.call(|reply| Command::SendBroadcast { content, reply }).await
    }

    pub async fn send_direct(&self, peer: PeerId, content: Vec<u8>) -> Result<MessageId, EngineError> {
        self.call(|reply| Command::SendDirect { peer, content, reply }).await?
    }

    /// Joins `channel`. A `password` derives a separate AEAD key (via
    /// `hkdf_expand`) layered on top of the flood, so only members who know
    /// it can read the content; without one, channel messages go out in
    /// the clear.
    pub async fn join_channel(&self, channel: ChannelId, password: Option<Vec<u8>>) -> Result<(), EngineError> {
        self.call(|reply| Command::JoinChannel { channel, password, reply }).await
    }

    pub async fn leave_channel(&self, channel: ChannelId) -> Result<(), EngineError> {
        self.call(|reply| Command::LeaveChannel { channel, reply }).await
    }

    pub async fn send_to_channel(&self, channel: ChannelId, content: Vec<u8>) -> Result<MessageId, EngineError> {
        self.call(|reply| Command::SendToChannel { channel, content, reply }).await?
    }

    pub async fn block_peer(&self, peer: PeerId) -> Result<(), EngineError> {
        self.call(|reply| Command::BlockPeer { peer, reply }).await
    }

    pub async fn unblock_peer(&self, peer: PeerId) -> Result<(), EngineError> {
        self.call(|reply| Command::UnblockPeer { peer, reply }).await
    }

    pub async fn initiate_handshake(&self, peer: PeerId) -> Result<(), EngineError> {
        self.call(|reply| Command::InitiateHandshake { peer, reply }).await?
    }

    pub async fn stop(&self) -> Result<(), EngineError> {
        self.call(|reply| Command::Stop { reply }).await
    }
}

/// Fans multiple bearer event receivers into one, so the actor's
/// `select!` loop only needs a single branch regardless of how many
/// bearers are configured.
fn merge_bearer_events(receivers: Vec<mpsc::Receiver<BearerEvent>>) -> mpsc::Receiver<BearerEvent> {
    let (tx, rx) = mpsc::channel(256);
    for mut receiver in receivers {
        let forward_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                if forward_tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
    rx
}

struct PendingHandshake {
    noise: NoiseHandshake,
    started_at: Instant,
}

struct Actor {
    local_id: PeerId,
    identity: Keypair,
    provider: Arc<dyn CryptoProvider>,
    dedup: Dedup,
    assembler: Assembler,
    store_forward: StoreAndForward,
    health: HealthMonitor,
    peers: HashMap<PeerId, PeerRecord>,
    pending_handshakes: HashMap<PeerId, PendingHandshake>,
    blocked: HashSet<PeerId>,
    /// Joined channels and, if password-protected, their derived AEAD key.
    channels: HashMap<ChannelId, Option<[u8; 32]>>,
    transport: MultiTransport,
    max_hops: u8,
    fragment_size: usize,
    sweep_interval: Duration,
    handshake_timeout: Duration,
    peer_timeout: Duration,
    events_tx: mpsc::Sender<MeshEvent>,
}

impl Actor {
    async fn run(mut self, mut inbox: mpsc::Receiver<Command>, mut bearer_events: mpsc::Receiver<BearerEvent>) {
        let mut housekeeping = tokio::time::interval(self.sweep_interval);

        loop {
            tokio::select! {
                cmd = inbox.recv() => {
                    match cmd {
                        Some(Command::Stop { reply }) => {
                            self.transport.stop();
                            let _ = reply.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                event = bearer_events.recv() => {
                    match event {
                        Some(event) => self.handle_bearer_event(event).await,
                        None => {}
                    }
                }
                _ = housekeeping.tick() => {
                    self.sweep(Instant::now()).await;
                }
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SendBroadcast { content, reply } => {
                let id = self.send_broadcast(content);
                let _ = reply.send(id);
            }
            Command::SendDirect { peer, content, reply } => {
                let result = self.send_direct(peer, content);
                let _ = reply.send(result);
            }
            Command::JoinChannel { channel, password, reply } => {
                self.join_channel(channel, password);
                let _ = reply.send(());
            }
            Command::LeaveChannel { channel, reply } => {
                self.channels.remove(&channel);
                let _ = reply.send(());
            }
            Command::SendToChannel { channel, content, reply } => {
                let result = self.send_to_channel(channel, content);
                let _ = reply.send(result);
            }
            Command::BlockPeer { peer, reply } => {
                self.blocked.insert(peer);
                let _ = reply.send(());
            }
            Command::UnblockPeer { peer, reply } => {
                self.blocked.remove(&peer);
                let _ = reply.send(());
            }
            Command::InitiateHandshake { peer, reply } => {
                let result = self.initiate_handshake(peer);
                let _ = reply.send(result);
            }
            Command::Stop { .. } => unreachable!("handled in run()"),
        }
    }

    fn new_message_id(&self) -> MessageId {
        let random = self.provider.random_bytes(16);
        let mut id = [0u8; 16];
        id.copy_from_slice(&random);
        id
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_millis() as u64
    }

    fn frame(&self, message_type: MessageType, flags: MessageFlags, id: MessageId, recipient: PeerId, ttl: u8, payload: &[u8]) -> Vec<u8> {
        let header = MessageHeader::new(message_type, flags, id, self.local_id, recipient, ttl, Self::now_ms(), payload.len() as u16);
        let mut out = Vec::with_capacity(46 + payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn send_broadcast(&mut self, content: Vec<u8>) -> MessageId {
        let id = self.new_message_id();
        self.dedup.observe(id);
        let frame = self.frame(MessageType::Text, MessageFlags(MessageFlags::IS_BROADCAST), id, [0u8; 8], self.max_hops, &content);
        self.transport.broadcast(frame);
        id
    }

    fn send_direct(&mut self, peer: PeerId, content: Vec<u8>) -> Result<MessageId, EngineError> {
        if self.blocked.contains(&peer) {
            return Err(EngineError::PeerBlocked);
        }
        let id = self.new_message_id();
        if !self.encrypt_and_send(peer, id, &content)? {
            // The cache holds the plaintext, not the ciphertext: a session
            // can be replaced by a fresh handshake before delivery is
            // retried, and a frame encrypted under a since-discarded
            // session is never decryptable again.
            self.store_forward.cache(peer, id, content, None);
        }
        Ok(id)
    }

    /// Encrypts `content` for `peer` under its current session and sends
    /// it, fragmenting first if the framed message won't fit in one piece.
    /// Returns `Ok(true)` if every piece went out, `Ok(false)` if the
    /// transport couldn't reach the peer at all.
    fn encrypt_and_send(&mut self, peer: PeerId, id: MessageId, content: &[u8]) -> Result<bool, EngineError> {
        let ciphertext = {
            let record = self.peers.get_mut(&peer).ok_or(EngineError::NoSecuredSession)?;
            let session = record.session_mut().ok_or(EngineError::NoSecuredSession)?;
            session.encrypt(content)?
        };

        self.health.track_sent(peer, id, Instant::now());

        let frame = self.frame(MessageType::PrivateMessage, MessageFlags(MessageFlags::ENCRYPTED), id, peer, self.max_hops, &ciphertext);

        let sent = if frame.len() > self.fragment_size {
            // Each fragment still rides inside a full MessageHeader once
            // framed below, so the budget handed to `fragment()` has to
            // leave room for that header, not just the FragmentHeader it
            // already accounts for.
            let per_fragment_budget = self.fragment_size.saturating_sub(46);
            let fragments = fragment(&ciphertext, per_fragment_budget)?;
            let mut any_sent = false;
            for frag in fragments {
                let frame = self.frame(MessageType::Fragment, MessageFlags(MessageFlags::IS_FRAGMENT), id, peer, self.max_hops, &frag.to_wire());
                any_sent |= self.transport.send(peer, frame).is_ok();
            }
            any_sent
        } else {
            self.transport.send(peer, frame).is_ok()
        };

        // No ack round-trip exists yet to confirm the peer actually
        // received this, so "delivered" here means "handed off to the
        // transport" rather than "acknowledged".
        if sent {
            self.health.track_delivered(id, Instant::now(), None);
        } else {
            self.health.track_failed(id);
        }

        Ok(sent)
    }

    /// Derives a channel's AEAD key from `password` via `hkdf_expand`, using
    /// the channel id as the info parameter so the same password yields a
    /// different key per channel.
    fn join_channel(&mut self, channel: ChannelId, password: Option<Vec<u8>>) {
        let key = password.map(|pw| {
            let derived = self.provider.hkdf_expand(&pw, &channel, 32);
            let mut key = [0u8; 32];
            key.copy_from_slice(&derived);
            key
        });
        self.channels.insert(channel, key);
    }

    /// Encrypts (if the channel has a password-derived key) and floods
    /// `content` tagged with `channel`. Fails if `channel` was never
    /// joined — there's no key to reach for otherwise.
    fn send_to_channel(&mut self, channel: ChannelId, content: Vec<u8>) -> Result<MessageId, EngineError> {
        let key = *self.channels.get(&channel).ok_or(EngineError::NotInChannel)?;
        let id = self.new_message_id();
        self.dedup.observe(id);

        let (flags, payload) = match key {
            Some(key) => {
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&self.provider.random_bytes(12));
                let ciphertext = self.provider.aead_encrypt(&key, &nonce, &content, &channel);
                let mut payload = Vec::with_capacity(12 + ciphertext.len());
                payload.extend_from_slice(&nonce);
                payload.extend_from_slice(&ciphertext);
                (MessageFlags(MessageFlags::IS_BROADCAST | MessageFlags::ENCRYPTED), payload)
            }
            None => (MessageFlags(MessageFlags::IS_BROADCAST), content),
        };

        let frame = self.frame(MessageType::ChannelMessage, flags, id, channel, self.max_hops, &payload);
        self.transport.broadcast(frame);
        Ok(id)
    }

    fn initiate_handshake(&mut self, peer: PeerId) -> Result<(), EngineError> {
        if self.blocked.contains(&peer) {
            return Err(EngineError::PeerBlocked);
        }
        let mut noise = NoiseHandshake::new(Arc::clone(&self.provider), Role::Initiator, Keypair::from_private(*self.identity.private_bytes()), b"summit-mesh");
        let msg1 = noise.write_message1()?;

        self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer, Instant::now())).set_state(ConnectionState::Securing, Instant::now());
        self.pending_handshakes.insert(peer, PendingHandshake { noise, started_at: Instant::now() });

        let id = self.new_message_id();
        let frame = self.frame(MessageType::HandshakeInit, MessageFlags::default(), id, peer, 1, &msg1);
        self.transport.send(peer, frame)?;
        Ok(())
    }

    async fn handle_bearer_event(&mut self, event: BearerEvent) {
        match event {
            BearerEvent::FrameReceived { from, frame } => {
                self.on_receive(from, frame).await;
            }
            BearerEvent::PeerDiscovered { peer, signal_strength_dbm } => {
                let record = self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer, Instant::now()));
                record.signal_strength_dbm = signal_strength_dbm;
                record.touch(Instant::now());
            }
            BearerEvent::PeerConnected { peer } => {
                let now = Instant::now();
                self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer, now)).touch(now);
                self.attempt_cached_delivery(peer);
            }
            BearerEvent::PeerLost { peer } => {
                // Keep the session around for a grace window rather than
                // dropping it immediately — a bearer dropout is often
                // transient (BLE out of range for a few seconds).
                if let Some(record) = self.peers.get_mut(&peer) {
                    record.mark_lost(Instant::now());
                }
                let _ = self.events_tx.send(MeshEvent::PeerDisconnected { peer }).await;
            }
            BearerEvent::StateChanged { state } => {
                tracing::debug!(?state, "bearer state changed");
            }
            BearerEvent::Error { message } => {
                let _ = self.events_tx.send(MeshEvent::Error { context: message }).await;
            }
        }
    }

    /// Implements the inbound pipeline: parse, dedup, reassemble, drive
    /// handshakes, decrypt-and-upcall, or flood-forward.
    async fn on_receive(&mut self, from: TransportPeerId, raw: Vec<u8>) {
        if self.blocked.contains(&from) {
            return;
        }
        let Some(header) = MessageHeader::read_from_prefix(&raw) else {
            return;
        };
        let Ok(message_type) = header.message_type() else {
            return;
        };
        let id = header.id;
        let flags = header.flags();
        let ttl = header.ttl;
        let payload_len = header.payload_len() as usize;
        let payload = raw[46..(46 + payload_len).min(raw.len())].to_vec();

        if self.dedup.is_duplicate(&id) {
            return;
        }
        self.dedup.observe(id);

        // Only the final recipient reassembles; a fragment not addressed to
        // us falls through to the plain TTL-forward step below untouched.
        if flags.has(MessageFlags::IS_FRAGMENT) && header.recipient_id == self.local_id {
            let Some(frag_header) = wire::FragmentHeader::read_from_prefix(&payload) else {
                return;
            };
            let frag_payload = payload[4..].to_vec();
            let fragment = Fragment { index: frag_header.index, total: frag_header.total, payload: frag_payload };
            if let Ok(Some(reassembled)) = self.assembler.receive(id, Instant::now(), fragment) {
                self.deliver_decrypted(from, reassembled).await;
            }
            return;
        }

        match message_type {
            MessageType::HandshakeInit | MessageType::HandshakeResponse | MessageType::HandshakeFinal => {
                self.drive_handshake(from, message_type, &payload).await;
                return;
            }
            _ => {}
        }

        if flags.has(MessageFlags::ENCRYPTED) && header.recipient_id == self.local_id {
            self.deliver_decrypted(from, payload.clone()).await;
            return;
        }

        if matches!(message_type, MessageType::ChannelMessage) {
            if let Some(key) = self.channels.get(&header.recipient_id).copied() {
                let content = match key {
                    Some(key) if payload.len() >= 12 => {
                        let (nonce, ciphertext) = payload.split_at(12);
                        let mut nonce_arr = [0u8; 12];
                        nonce_arr.copy_from_slice(nonce);
                        self.provider.aead_decrypt(&key, &nonce_arr, ciphertext, &header.recipient_id).ok()
                    }
                    Some(_) => None,
                    None => Some(payload.clone()),
                };
                if let Some(content) = content {
                    let _ = self.events_tx.send(MeshEvent::ChannelMessageReceived { channel: header.recipient_id, sender: from, content }).await;
                }
            }
        } else if flags.has(MessageFlags::IS_BROADCAST) {
            // Every node on a flood is a recipient; still falls through to
            // the TTL-forward step below so the flood continues.
            let _ = self.events_tx.send(MeshEvent::MessageReceived { sender: from, content: payload.clone() }).await;
        } else if header.recipient_id == self.local_id {
            let _ = self.events_tx.send(MeshEvent::MessageReceived { sender: from, content: payload.clone() }).await;
            return;
        }

        if ttl > 0 {
            let new_ttl = ttl - 1;
            if new_ttl > 0 {
                let header = MessageHeader::new(message_type, flags, id, header.sender_id, header.recipient_id, new_ttl, header.timestamp_ms(), payload_len as u16);
                let mut frame = Vec::with_capacity(46 + payload.len());
                frame.extend_from_slice(header.as_bytes());
                frame.extend_from_slice(&payload);
                self.transport.broadcast(frame);
            }
        }
    }

    async fn drive_handshake(&mut self, peer: PeerId, message_type: MessageType, payload: &[u8]) {
        match message_type {
            MessageType::HandshakeInit => {
                let mut noise = NoiseHandshake::new(Arc::clone(&self.provider), Role::Responder, Keypair::from_private(*self.identity.private_bytes()), b"summit-mesh");
                if noise.read_message1(payload).is_err() {
                    let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
                    return;
                }
                let Ok(msg2) = noise.write_message2() else {
                    let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
                    return;
                };
                self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer, Instant::now())).set_state(ConnectionState::Securing, Instant::now());
                self.pending_handshakes.insert(peer, PendingHandshake { noise, started_at: Instant::now() });

                let id = self.new_message_id();
                let frame = self.frame(MessageType::HandshakeResponse, MessageFlags::default(), id, peer, 1, &msg2);
                let _ = self.transport.send(peer, frame);
            }
            MessageType::HandshakeResponse => {
                let Some(mut pending) = self.pending_handshakes.remove(&peer) else { return };
                if pending.noise.read_message2(payload).is_err() {
                    let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
                    return;
                }
                let Ok(msg3) = pending.noise.write_message3() else {
                    let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
                    return;
                };
                let id = self.new_message_id();
                let frame = self.frame(MessageType::HandshakeFinal, MessageFlags::default(), id, peer, 1, &msg3);
                let _ = self.transport.send(peer, frame);

                match pending.noise.split() {
                    Ok(session) => {
                        self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer, Instant::now())).secure(session, Instant::now());
                        let _ = self.events_tx.send(MeshEvent::PeerSecured { peer }).await;
                        self.attempt_cached_delivery(peer);
                    }
                    Err(_) => {
                        let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
                    }
                }
            }
            MessageType::HandshakeFinal => {
                let Some(mut pending) = self.pending_handshakes.remove(&peer) else { return };
                if pending.noise.read_message3(payload).is_err() {
                    let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
                    return;
                }
                match pending.noise.split() {
                    Ok(session) => {
                        self.peers.entry(peer).or_insert_with(|| PeerRecord::new(peer, Instant::now())).secure(session, Instant::now());
                        let _ = self.events_tx.send(MeshEvent::PeerSecured { peer }).await;
                        self.attempt_cached_delivery(peer);
                    }
                    Err(_) => {
                        let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
                    }
                }
            }
            _ => {}
        }
    }

    async fn deliver_decrypted(&mut self, from: PeerId, ciphertext: Vec<u8>) {
        let outcome = {
            let Some(record) = self.peers.get_mut(&from) else { return };
            let Some(session) = record.session_mut() else { return };
            session.decrypt(&ciphertext)
        };
        match outcome {
            Ok(plaintext) => {
                if let Some(record) = self.peers.get_mut(&from) {
                    record.reset_decrypt_failures();
                }
                let _ = self.events_tx.send(MeshEvent::MessageReceived { sender: from, content: plaintext }).await;
            }
            Err(_) => {
                let Some(record) = self.peers.get_mut(&from) else { return };
                let failures = record.note_decrypt_failure();
                if failures >= wire::AEAD_FAILURE_THRESHOLD {
                    record.set_state(ConnectionState::Failed, Instant::now());
                    let _ = self.events_tx.send(MeshEvent::SessionFailed { peer: from }).await;
                }
            }
        }
    }

    /// Flushes whatever plaintext is queued for `peer`, re-encrypting under
    /// the session just established rather than replaying old ciphertext.
    fn attempt_cached_delivery(&mut self, peer: PeerId) {
        for cached in self.store_forward.drain(peer) {
            let id = self.new_message_id();
            let sent = self.encrypt_and_send(peer, id, &cached.payload).unwrap_or(false);
            if !sent {
                self.store_forward.cache(peer, cached.id, cached.payload, None);
            }
        }
    }

    async fn sweep(&mut self, now: Instant) {
        self.assembler.sweep(now);
        self.store_forward.sweep_expired();
        if let Some(_changed) = self.health.sweep(now) {
            tracing::info!("mesh health changed");
        }

        let timed_out: Vec<PeerId> =
            self.pending_handshakes.iter().filter(|(_, p)| now.duration_since(p.started_at) >= self.handshake_timeout).map(|(peer, _)| *peer).collect();
        for peer in timed_out {
            self.pending_handshakes.remove(&peer);
            let _ = self.events_tx.send(MeshEvent::HandshakeFailed { peer }).await;
        }

        for record in self.peers.values_mut() {
            record.purge_if_expired(now, self.peer_timeout);
        }
    }
}
