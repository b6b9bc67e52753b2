//! UDP-loopback bearer used by tests and local development in place of a
//! real BLE or Wi-Fi Direct driver.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::transport::{Bearer, BearerEvent, BearerKind, PeerId, TransportError};

/// Routes frames over real UDP sockets on `127.0.0.1`, keyed by a
/// statically configured peer-id-to-address map. A background thread reads
/// inbound datagrams and forwards them as [`BearerEvent::FrameReceived`].
pub struct LoopbackBearer {
    socket: Arc<StdUdpSocket>,
    peers: Arc<Mutex<HashMap<PeerId, SocketAddr>>>,
    max_frame_size: usize,
}

impl LoopbackBearer {
    pub fn bind(addr: SocketAddr, max_frame_size: usize) -> std::io::Result<(Self, mpsc::Receiver<BearerEvent>)> {
        let socket = Arc::new(StdUdpSocket::bind(addr)?);
        socket.set_nonblocking(false)?;
        let peers = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx) = mpsc::channel(256);

        let reader_socket = Arc::clone(&socket);
        let reader_peers = Arc::clone(&peers);
        std::thread::spawn(move || {
            let mut buf = vec![0u8; 65536];
            loop {
                let (len, from) = match reader_socket.recv_from(&mut buf) {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let peer_id = reader_peers
                    .lock()
                    .unwrap()
                    .iter()
                    .find(|(_, &addr)| addr == from)
                    .map(|(id, _)| *id)
                    .unwrap_or([0u8; 8]);
                let event = BearerEvent::FrameReceived { from: peer_id, frame: buf[..len].to_vec() };
                if tx.blocking_send(event).is_err() {
                    break;
                }
            }
        });

        Ok((Self { socket, peers, max_frame_size }, rx))
    }

    pub fn register_peer(&self, peer: PeerId, addr: SocketAddr) {
        self.peers.lock().unwrap().insert(peer, addr);
    }

    /// Drops a peer's address, as if it had moved out of range. Further
    /// sends to it fail until it's registered again.
    pub fn unregister_peer(&self, peer: PeerId) {
        self.peers.lock().unwrap().remove(&peer);
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

impl Bearer for LoopbackBearer {
    fn kind(&self) -> BearerKind {
        BearerKind::Ble
    }

    fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn send(&self, peer: PeerId, frame: Vec<u8>) -> Result<(), TransportError> {
        let addr = self.peers.lock().unwrap().get(&peer).copied().ok_or(TransportError::SendFailed)?;
        self.socket.send_to(&frame, addr).map(|_| ()).map_err(|_| TransportError::SendFailed)
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap().keys().copied().collect()
    }
}
