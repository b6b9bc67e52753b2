//! Long-lived mesh services: fragmentation, duplicate detection,
//! store-and-forward caching, network-health tracking, peer bookkeeping,
//! rate limiting, and the transport abstraction over physical bearers.

pub mod bearer_ble;
pub mod bearer_wifi;
pub mod dedup;
pub mod fragment;
pub mod health;
pub mod loopback;
pub mod peer;
pub mod qos;
pub mod store_forward;
pub mod transport;

pub use peer::{ConnectionState, PeerId, PeerRecord};
