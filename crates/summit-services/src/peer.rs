//! Peer registry — tracks every node the mesh currently knows about, from
//! first sighting through handshake to an established transport session.

use std::time::{Duration, Instant};

use summit_core::crypto::Session;

pub type PeerId = [u8; 8];

/// Where a peer sits in the connection lifecycle. A [`Session`] exists on a
/// [`PeerRecord`] if and only if its state is `Secured`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Securing,
    Secured,
    Failed,
}

/// Everything known about one peer. `session` is only ever `Some` while
/// `state == Secured`; every mutator that changes `state` away from
/// `Secured` also clears it.
pub struct PeerRecord {
    pub id: PeerId,
    pub static_public_key: Option<[u8; 32]>,
    pub display_name: Option<String>,
    pub signal_strength_dbm: Option<i8>,
    pub hop_distance: u8,
    pub last_seen: Instant,
    pub state: ConnectionState,
    session: Option<Session>,
    /// When the bearer last reported this peer unreachable. `None` while
    /// connected or already purged. Kept separate from `state` so a brief
    /// radio dropout doesn't throw away a session that's still good.
    disconnected_at: Option<Instant>,
    /// Consecutive AEAD failures since the last successful decrypt.
    failed_decrypts: u32,
}

impl PeerRecord {
    pub fn new(id: PeerId, now: Instant) -> Self {
        Self {
            id,
            static_public_key: None,
            display_name: None,
            signal_strength_dbm: None,
            hop_distance: 1,
            last_seen: now,
            state: ConnectionState::Disconnected,
            session: None,
            disconnected_at: None,
            failed_decrypts: 0,
        }
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn is_secured(&self) -> bool {
        matches!(self.state, ConnectionState::Secured) && self.session.is_some()
    }

    /// Transition to any non-`Secured` state, dropping the session if one
    /// was present. Use [`PeerRecord::secure`] to move into `Secured`, or
    /// [`PeerRecord::mark_lost`] for a bearer-reported disconnect that
    /// should still get a grace window before the session is dropped.
    pub fn set_state(&mut self, state: ConnectionState, now: Instant) {
        debug_assert!(state != ConnectionState::Secured, "use secure() to install a session");
        self.state = state;
        self.session = None;
        self.disconnected_at = None;
        self.last_seen = now;
    }

    /// Install an established session and move to `Secured`.
    pub fn secure(&mut self, session: Session, now: Instant) {
        self.session = Some(session);
        self.state = ConnectionState::Secured;
        self.disconnected_at = None;
        self.failed_decrypts = 0;
        self.last_seen = now;
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    /// Records a bearer-level disconnect without discarding the session:
    /// the peer may just be out of BLE range for a few seconds. The
    /// session is only actually dropped once [`PeerRecord::purge_if_expired`]
    /// observes the grace window has elapsed.
    pub fn mark_lost(&mut self, now: Instant) {
        self.state = ConnectionState::Disconnected;
        self.disconnected_at = Some(now);
        self.last_seen = now;
    }

    /// Drops the session if it's been disconnected longer than `grace`.
    /// Returns true if a session was purged.
    pub fn purge_if_expired(&mut self, now: Instant, grace: Duration) -> bool {
        match self.disconnected_at {
            Some(at) if now.saturating_duration_since(at) >= grace => {
                self.session = None;
                self.disconnected_at = None;
                true
            }
            _ => false,
        }
    }

    /// Bumps the AEAD failure counter for this session and returns the new
    /// count. Reset by [`PeerRecord::secure`] and on a successful decrypt
    /// via [`PeerRecord::reset_decrypt_failures`].
    pub fn note_decrypt_failure(&mut self) -> u32 {
        self.failed_decrypts += 1;
        self.failed_decrypts
    }

    pub fn reset_decrypt_failures(&mut self) {
        self.failed_decrypts = 0;
    }
}
