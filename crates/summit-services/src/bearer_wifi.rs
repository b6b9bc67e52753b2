//! Wi-Fi Direct bearer. Same shape as [`crate::bearer_ble`] but fronting a
//! socket-oriented driver capable of much larger frames.

use tokio::sync::mpsc;

use crate::transport::{Bearer, BearerEvent, BearerKind, PeerId, TransportError};

/// Platform Wi-Fi Direct driver the host application supplies: group
/// formation, peer resolution to a socket address, and the actual socket
/// I/O live on the other side of this trait.
pub trait WifiDriver: Send + Sync {
    fn send_datagram(&self, peer: PeerId, data: &[u8]) -> Result<(), String>;
}

pub struct WifiBearer {
    driver: Box<dyn WifiDriver>,
    max_frame_size: usize,
    events_tx: mpsc::Sender<BearerEvent>,
}

impl WifiBearer {
    pub fn new(driver: Box<dyn WifiDriver>, max_frame_size: usize) -> (Self, mpsc::Receiver<BearerEvent>) {
        let (tx, rx) = mpsc::channel(256);
        (Self { driver, max_frame_size, events_tx: tx }, rx)
    }

    pub fn events_sender(&self) -> mpsc::Sender<BearerEvent> {
        self.events_tx.clone()
    }
}

impl Bearer for WifiBearer {
    fn kind(&self) -> BearerKind {
        BearerKind::WifiDirect
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<(), TransportError> {
        self.driver.send_datagram(peer, &frame).map_err(|_| TransportError::SendFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeDriver {
        sent: Mutex<Vec<(PeerId, Vec<u8>)>>,
    }

    impl WifiDriver for FakeDriver {
        fn send_datagram(&self, peer: PeerId, data: &[u8]) -> Result<(), String> {
            self.sent.lock().unwrap().push((peer, data.to_vec()));
            Ok(())
        }
    }

    #[test]
    fn send_forwards_to_driver() {
        let driver = Box::new(FakeDriver { sent: Mutex::new(Vec::new()) });
        let (bearer, _events) = WifiBearer::new(driver, 65536);
        bearer.send([2u8; 8], vec![9, 9, 9]).unwrap();
        assert_eq!(bearer.kind(), BearerKind::WifiDirect);
    }
}
