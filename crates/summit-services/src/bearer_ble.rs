//! BLE GATT bearer. Wraps a platform-specific driver (out of scope here —
//! implemented by the host application against the underlying BLE stack)
//! behind the [`Bearer`] trait, using the Nordic UART Service UUIDs the
//! wire protocol pins.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use tokio::sync::mpsc;

use summit_core::wire::BLE_SERVICE_UUID;

use crate::transport::{Bearer, BearerEvent, BearerKind, PeerId, TransportError};

/// Per-packet ATT protocol overhead (opcode + handle) eaten out of the
/// negotiated MTU before payload bytes fit in a write.
const ATT_OVERHEAD: usize = 3;
/// Floor on the usable chunk size regardless of how small the negotiated
/// MTU is, matching the minimum legal BLE MTU of 23 bytes minus overhead.
const MIN_CHUNK: usize = 20;

/// Platform BLE driver the host application supplies. Connecting,
/// scanning, and GATT characteristic plumbing live on the other side of
/// this trait; `BleBearer` only knows how to hand it outbound bytes.
pub trait BleDriver: Send + Sync {
    fn write_characteristic(&self, peer: PeerId, data: &[u8]) -> Result<(), String>;
    fn negotiated_mtu(&self, peer: PeerId) -> usize;
}

/// BLE bearer. `events_tx` is cloned into the driver's receive callback by
/// the host application so inbound GATT writes surface as
/// [`BearerEvent::FrameReceived`].
pub struct BleBearer {
    driver: Box<dyn BleDriver>,
    default_mtu: usize,
    events_tx: mpsc::Sender<BearerEvent>,
    last_seen_mtu: Mutex<usize>,
    /// One lock per peer so writes to different peers proceed concurrently
    /// while writes to the same peer stay strictly in order — a GATT
    /// characteristic has no notion of message boundaries, so an
    /// interleaved write from a second in-flight send would corrupt both.
    write_locks: DashMap<PeerId, Arc<Mutex<()>>>,
}

impl BleBearer {
    pub fn new(driver: Box<dyn BleDriver>, default_mtu: usize) -> (Self, mpsc::Receiver<BearerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (Self { driver, default_mtu, events_tx: tx, last_seen_mtu: Mutex::new(default_mtu), write_locks: DashMap::new() }, rx)
    }

    pub fn events_sender(&self) -> mpsc::Sender<BearerEvent> {
        self.events_tx.clone()
    }

    pub fn service_uuid(&self) -> &'static str {
        BLE_SERVICE_UUID
    }

    fn lock_for(&self, peer: PeerId) -> Arc<Mutex<()>> {
        Arc::clone(&*self.write_locks.entry(peer).or_insert_with(|| Arc::new(Mutex::new(()))))
    }
}

impl Bearer for BleBearer {
    fn kind(&self) -> BearerKind {
        BearerKind::Ble
    }

    fn max_frame_size(&self) -> usize {
        *self.last_seen_mtu.lock().unwrap()
    }

    /// Chunks `frame` to fit the peer's negotiated MTU minus ATT overhead
    /// and writes each chunk in order under a per-peer lock, so a frame
    /// from a concurrent send can't land between this one's chunks.
    fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<(), TransportError> {
        let mtu = self.driver.negotiated_mtu(peer);
        let mtu = if mtu > 0 { mtu } else { self.default_mtu };
        *self.last_seen_mtu.lock().unwrap() = mtu;
        let chunk_size = mtu.saturating_sub(ATT_OVERHEAD).max(MIN_CHUNK);

        let lock = self.lock_for(peer);
        let _guard = lock.lock().unwrap();
        for chunk in frame.chunks(chunk_size) {
            self.driver.write_characteristic(peer, chunk).map_err(|_| TransportError::SendFailed)?;
        }
        Ok(())
    }
}
