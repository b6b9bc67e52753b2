//! Transport abstraction over the mesh's physical bearers (BLE, Wi-Fi
//! Direct). [`MultiTransport`] picks which bearer carries a given frame
//! according to the configured policy; bearers themselves only know how to
//! move bytes to a peer and report events back.

use std::sync::{Arc, Mutex};

use summit_core::config::TransportPolicyConfig;

use crate::qos::TokenBucket;

pub type PeerId = [u8; 8];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BearerKind {
    Ble,
    WifiDirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BearerState {
    Starting,
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone)]
pub enum BearerEvent {
    FrameReceived { from: PeerId, frame: Vec<u8> },
    PeerDiscovered { peer: PeerId, signal_strength_dbm: Option<i8> },
    /// A previously discovered peer finished connecting (e.g. GATT
    /// subscription complete), distinct from [`BearerEvent::PeerDiscovered`]
    /// which only means the radio saw an advertisement.
    PeerConnected { peer: PeerId },
    PeerLost { peer: PeerId },
    StateChanged { state: BearerState },
    Error { message: String },
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("no bearer available for this policy")]
    NoBearerAvailable,
    #[error("frame of {size} bytes exceeds bearer max of {max}")]
    FrameTooLarge { size: usize, max: usize },
    #[error("bearer rejected the frame")]
    SendFailed,
    #[error("rate limit exceeded for this bearer")]
    RateLimited,
}

/// A physical link capable of moving opaque frames to a known peer.
/// Discovery, connection setup, and inbound framing are bearer-internal;
/// only outbound delivery is exposed here. Inbound data and discovery
/// surface as [`BearerEvent`]s on a channel handed back at construction.
pub trait Bearer: Send + Sync {
    fn kind(&self) -> BearerKind;
    fn max_frame_size(&self) -> usize;
    fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Peers currently reachable for a broadcast. Bearers with no
    /// peer-presence tracking of their own (the platform radio adapters)
    /// default to an empty list; the loopback test bearer overrides this.
    fn connected_peers(&self) -> Vec<PeerId> {
        Vec::new()
    }

    /// Bring the radio up (power on, start scanning/advertising). Bearers
    /// that have nothing to do at startup (a socket already bound at
    /// construction, like the loopback test bearer) can leave this at the
    /// default no-op.
    fn start(&self) -> Result<(), TransportError> {
        Ok(())
    }

    /// Tear the radio down. Default no-op, same reasoning as [`Bearer::start`].
    fn stop(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn is_connected(&self, peer: PeerId) -> bool {
        self.connected_peers().contains(&peer)
    }

    /// Send `frame` to every currently connected peer on this bearer.
    /// Default implementation just loops [`Bearer::connected_peers`];
    /// overridden by bearers with a cheaper native broadcast primitive.
    fn broadcast(&self, frame: Vec<u8>) -> Vec<PeerId> {
        self.connected_peers().into_iter().filter(|&peer| self.send(peer, frame.clone()).is_ok()).collect()
    }
}

/// Composes the available bearers and routes outbound frames according to
/// the configured [`TransportPolicyConfig`]. Each bearer gets its own
/// [`TokenBucket`] so a saturated Wi-Fi Direct link can't starve BLE.
pub struct MultiTransport {
    bearers: Vec<Arc<dyn Bearer>>,
    limiters: Vec<Mutex<TokenBucket>>,
    policy: TransportPolicyConfig,
    wifi_threshold_bytes: usize,
}

impl MultiTransport {
    pub fn new(
        bearers: Vec<Arc<dyn Bearer>>,
        policy: TransportPolicyConfig,
        wifi_threshold_bytes: usize,
        rate_limit_capacity: f64,
        rate_limit_refill_per_sec: f64,
    ) -> Self {
        let limiters = bearers.iter().map(|_| Mutex::new(TokenBucket::new(rate_limit_capacity, rate_limit_refill_per_sec))).collect();
        Self { bearers, limiters, policy, wifi_threshold_bytes }
    }

    fn bearer_index_of_kind(&self, kind: BearerKind) -> Option<usize> {
        self.bearers.iter().position(|b| b.kind() == kind)
    }

    /// Chooses a single bearer index for `frame_size` bytes under the
    /// current policy. `Redundant` has no single answer — callers needing
    /// it should use [`MultiTransport::send`] directly.
    fn select_bearer_index(&self, frame_size: usize) -> Option<usize> {
        match self.policy {
            TransportPolicyConfig::BleOnly => self.bearer_index_of_kind(BearerKind::Ble),
            TransportPolicyConfig::WifiOnly => self.bearer_index_of_kind(BearerKind::WifiDirect),
            TransportPolicyConfig::Auto => {
                if frame_size > self.wifi_threshold_bytes {
                    self.bearer_index_of_kind(BearerKind::WifiDirect).or_else(|| self.bearer_index_of_kind(BearerKind::Ble))
                } else {
                    self.bearer_index_of_kind(BearerKind::Ble).or_else(|| self.bearer_index_of_kind(BearerKind::WifiDirect))
                }
            }
            TransportPolicyConfig::Redundant => {
                if self.bearers.is_empty() {
                    None
                } else {
                    Some(0)
                }
            }
        }
    }

    fn try_consume(&self, idx: usize) -> bool {
        self.limiters[idx].lock().unwrap().allow()
    }

    /// Send `frame` to `peer`. Under `Redundant` policy the frame goes out
    /// over every available bearer; the call succeeds if at least one
    /// accepted it. Each bearer's rate limit is checked independently, so a
    /// bearer that's out of tokens just doesn't carry this frame rather
    /// than failing the whole send.
    pub fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<(), TransportError> {
        if matches!(self.policy, TransportPolicyConfig::Redundant) {
            let mut last_err = None;
            let mut any_ok = false;
            for (idx, bearer) in self.bearers.iter().enumerate() {
                if !self.try_consume(idx) {
                    last_err = Some(TransportError::RateLimited);
                    continue;
                }
                match bearer.send(peer, frame.clone()) {
                    Ok(()) => any_ok = true,
                    Err(e) => last_err = Some(e),
                }
            }
            return if any_ok { Ok(()) } else { Err(last_err.unwrap_or(TransportError::NoBearerAvailable)) };
        }

        let idx = self.select_bearer_index(frame.len()).ok_or(TransportError::NoBearerAvailable)?;
        let bearer = &self.bearers[idx];
        if frame.len() > bearer.max_frame_size() {
            return Err(TransportError::FrameTooLarge { size: frame.len(), max: bearer.max_frame_size() });
        }
        if !self.try_consume(idx) {
            return Err(TransportError::RateLimited);
        }
        bearer.send(peer, frame)
    }

    /// Broadcasts `frame` to every peer every bearer currently considers
    /// connected. Returns the peers the frame was actually handed off to;
    /// a peer reachable over more than one bearer may appear once per
    /// bearer. A bearer with an empty token bucket is skipped for this
    /// round rather than failing the whole broadcast.
    pub fn broadcast(&self, frame: Vec<u8>) -> Vec<PeerId> {
        let mut delivered = Vec::new();
        for (idx, bearer) in self.bearers.iter().enumerate() {
            if !self.try_consume(idx) {
                continue;
            }
            for peer in bearer.connected_peers() {
                if bearer.send(peer, frame.clone()).is_ok() {
                    delivered.push(peer);
                }
            }
        }
        delivered
    }

    pub fn bearer_count(&self) -> usize {
        self.bearers.len()
    }

    /// Starts every configured bearer. Succeeds as long as at least one
    /// bearer comes up; the first error from a bearer that failed to start
    /// is logged but doesn't block the others.
    pub fn start(&self) -> Result<(), TransportError> {
        let mut last_err = None;
        let mut any_ok = false;
        for bearer in &self.bearers {
            match bearer.start() {
                Ok(()) => any_ok = true,
                Err(e) => {
                    tracing::warn!(error = %e, "bearer failed to start");
                    last_err = Some(e);
                }
            }
        }
        if any_ok || self.bearers.is_empty() {
            Ok(())
        } else {
            Err(last_err.unwrap_or(TransportError::NoBearerAvailable))
        }
    }

    /// Stops every bearer, continuing past individual failures.
    pub fn stop(&self) {
        for bearer in &self.bearers {
            if let Err(e) = bearer.stop() {
                tracing::warn!(error = %e, "bearer failed to stop cleanly");
            }
        }
    }
}
