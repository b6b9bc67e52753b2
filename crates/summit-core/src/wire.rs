//! Mesh wire format — on-wire types for all mesh communication.
//!
//! These types ARE the protocol. Every field, every size, every reserved
//! byte is part of the wire format.
//!
//! `timestamp_ms` and `payload_len` are transmitted big-endian; every other
//! multi-byte field on the wire is either a single byte or an opaque byte
//! array. Because `zerocopy`'s derives give native-endian accessors, the
//! two big-endian fields are stored as raw `[u8; N]` and converted
//! explicitly at the struct boundary rather than exposed as `u64`/`u16`
//! with native layout.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Current wire protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Mesh hop cap. A message is never forwarded once its TTL reaches zero.
pub const MAX_HOPS: u8 = 7;

// ── Message type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Text = 0x01,
    TextAck = 0x02,
    HandshakeInit = 0x10,
    HandshakeResponse = 0x11,
    HandshakeFinal = 0x12,
    PeerAnnounce = 0x20,
    PeerRequest = 0x21,
    PeerResponse = 0x22,
    ChannelJoin = 0x30,
    ChannelLeave = 0x31,
    ChannelMessage = 0x32,
    PrivateMessage = 0x40,
    PrivateAck = 0x41,
    Heartbeat = 0x60,
    Ping = 0x61,
    Pong = 0x62,
    Fragment = 0x70,
    VoiceStart = 0x80,
    VoiceData = 0x81,
    VoiceEnd = 0x82,
    VoiceAck = 0x83,
    StreamRequest = 0x84,
    StreamAccept = 0x85,
    StreamReject = 0x86,
    StreamData = 0x87,
    StreamEnd = 0x88,
    Error = 0xFF,
}

impl TryFrom<u8> for MessageType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, <MessageType as TryFrom<u8>>::Error> {
        use MessageType::*;
        Ok(match value {
            0x01 => Text,
            0x02 => TextAck,
            0x10 => HandshakeInit,
            0x11 => HandshakeResponse,
            0x12 => HandshakeFinal,
            0x20 => PeerAnnounce,
            0x21 => PeerRequest,
            0x22 => PeerResponse,
            0x30 => ChannelJoin,
            0x31 => ChannelLeave,
            0x32 => ChannelMessage,
            0x40 => PrivateMessage,
            0x41 => PrivateAck,
            0x60 => Heartbeat,
            0x61 => Ping,
            0x62 => Pong,
            0x70 => Fragment,
            0x80 => VoiceStart,
            0x81 => VoiceData,
            0x82 => VoiceEnd,
            0x83 => VoiceAck,
            0x84 => StreamRequest,
            0x85 => StreamAccept,
            0x86 => StreamReject,
            0x87 => StreamData,
            0x88 => StreamEnd,
            0xFF => Error,
            other => return Err(WireError::UnknownMessageType(other)),
        })
    }
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

// ── Message flags ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(pub u8);

impl MessageFlags {
    pub const NONE: u8 = 0x00;
    pub const ENCRYPTED: u8 = 0x01;
    pub const COMPRESSED: u8 = 0x02;
    pub const REQUIRES_ACK: u8 = 0x04;
    pub const IS_FRAGMENT: u8 = 0x08;
    pub const IS_BROADCAST: u8 = 0x10;
    pub const HIGH_PRIORITY: u8 = 0x20;

    pub fn has(&self, bit: u8) -> bool {
        self.0 & bit != 0
    }

    pub fn set(&mut self, bit: u8) {
        self.0 |= bit;
    }

    pub fn clear(&mut self, bit: u8) {
        self.0 &= !bit;
    }
}

// ── Message header ───────────────────────────────────────────────────────────

/// Fixed-shape header preceding every mesh message payload. Wire size: 46
/// bytes (version1 + type1 + flags1 + id16 + sender8 + recipient8 + ttl1 +
/// timestamp8 + payload_len2 = 46), followed by `payload_len` bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct MessageHeader {
    pub version: u8,
    pub message_type: u8,
    pub flags: u8,
    pub id: [u8; 16],
    pub sender_id: [u8; 8],
    pub recipient_id: [u8; 8],
    pub ttl: u8,
    /// Big-endian milliseconds since epoch. Use [`MessageHeader::timestamp_ms`]
    /// / [`MessageHeader::set_timestamp_ms`].
    timestamp_ms_be: [u8; 8],
    /// Big-endian payload length. Use [`MessageHeader::payload_len`] /
    /// [`MessageHeader::set_payload_len`].
    payload_len_be: [u8; 2],
}

assert_eq_size!(MessageHeader, [u8; 46]);

impl MessageHeader {
    pub fn new(
        message_type: MessageType,
        flags: MessageFlags,
        id: [u8; 16],
        sender_id: [u8; 8],
        recipient_id: [u8; 8],
        ttl: u8,
        timestamp_ms: u64,
        payload_len: u16,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            message_type: message_type as u8,
            flags: flags.0,
            id,
            sender_id,
            recipient_id,
            ttl,
            timestamp_ms_be: timestamp_ms.to_be_bytes(),
            payload_len_be: payload_len.to_be_bytes(),
        }
    }

    pub fn timestamp_ms(&self) -> u64 {
        u64::from_be_bytes(self.timestamp_ms_be)
    }

    pub fn set_timestamp_ms(&mut self, value: u64) {
        self.timestamp_ms_be = value.to_be_bytes();
    }

    pub fn payload_len(&self) -> u16 {
        u16::from_be_bytes(self.payload_len_be)
    }

    pub fn set_payload_len(&mut self, value: u16) {
        self.payload_len_be = value.to_be_bytes();
    }

    pub fn message_type(&self) -> Result<MessageType, WireError> {
        MessageType::try_from(self.message_type)
    }

    pub fn flags(&self) -> MessageFlags {
        MessageFlags(self.flags)
    }
}

// ── Fragment frame ───────────────────────────────────────────────────────────

/// Fragment header: `index(1) | total(1) | payload_len(2, big-endian)`,
/// immediately followed by `payload_len` bytes of payload. Wire size: 4
/// bytes plus payload.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FragmentHeader {
    pub index: u8,
    pub total: u8,
    payload_len_be: [u8; 2],
}

assert_eq_size!(FragmentHeader, [u8; 4]);

impl FragmentHeader {
    pub fn new(index: u8, total: u8, payload_len: u16) -> Self {
        Self { index, total, payload_len_be: payload_len.to_be_bytes() }
    }

    pub fn payload_len(&self) -> u16 {
        u16::from_be_bytes(self.payload_len_be)
    }
}

// ── Noise wire sizes ─────────────────────────────────────────────────────────

/// `-> e`. 32 bytes.
pub const NOISE_MSG1_LEN: usize = 32;
/// `<- e, ee, s, es`: 32-byte ephemeral + 32-byte encrypted static + 16-byte tag.
pub const NOISE_MSG2_LEN: usize = 80;
/// `-> s, se`: 32-byte encrypted static + 16-byte tag.
pub const NOISE_MSG3_LEN: usize = 48;
/// ChaCha20-Poly1305 authentication tag length.
pub const AEAD_TAG_LEN: usize = 16;

// ── Mesh configuration defaults ─────────────────────────────────────────────

pub const MAX_MESSAGE_SIZE: usize = 500;
pub const FRAGMENT_SIZE: usize = 180;
pub const MESSAGE_TTL_SECS: u64 = 30 * 60;
pub const PEER_TIMEOUT_SECS: u64 = 5 * 60;
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 30;
pub const BLOOM_SIZE_BITS: usize = 2048;
pub const BLOOM_HASH_COUNT: u32 = 7;
pub const MAX_PENDING_FRAGMENTS: usize = 256;
pub const FRAGMENT_TIMEOUT_SECS: u64 = 60;
pub const MAX_PEERS: usize = 8;
pub const ROUTE_TIMEOUT_SECS: u64 = 10 * 60;
/// Consecutive AEAD decrypt failures on one session before it's torn down.
pub const AEAD_FAILURE_THRESHOLD: u32 = 5;

/// BLE GATT service/characteristic UUIDs (Nordic UART Service layout).
pub const BLE_SERVICE_UUID: &str = "6E400001-B5A3-F393-E0A9-E50E24DCCA9E";
pub const BLE_TX_CHARACTERISTIC_UUID: &str = "6E400002-B5A3-F393-E0A9-E50E24DCCA9E";
pub const BLE_RX_CHARACTERISTIC_UUID: &str = "6E400003-B5A3-F393-E0A9-E50E24DCCA9E";

// ── Hashing ──────────────────────────────────────────────────────────────────

/// BLAKE3 hash used for content identifiers distinct from the Noise
/// handshake's SHA-256.
pub type ContentHash = [u8; 32];

pub fn content_hash(data: &[u8]) -> ContentHash {
    *blake3::hash(data).as_bytes()
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown message type byte: 0x{0:02x}")]
    UnknownMessageType(u8),

    #[error("unknown protocol version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("payload length {0} exceeds maximum {}", MAX_MESSAGE_SIZE)]
    PayloadTooLarge(usize),

    #[error("buffer too short: got {got} bytes, need at least {need}")]
    TooShort { got: usize, need: usize },

    #[error("ttl {0} exceeds MAX_HOPS {MAX_HOPS}")]
    TtlTooLarge(u8),
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::AsBytes;

    #[test]
    fn message_header_round_trip() {
        let original = MessageHeader::new(
            MessageType::Text,
            MessageFlags(MessageFlags::ENCRYPTED),
            [0xab; 16],
            [0x01; 8],
            [0x02; 8],
            MAX_HOPS,
            1_725_000_000_000,
            1024,
        );

        let bytes = original.as_bytes();
        assert_eq!(bytes.len(), 46);

        let recovered = MessageHeader::read_from(bytes).unwrap();
        assert_eq!(recovered.id, original.id);
        assert_eq!(recovered.sender_id, original.sender_id);
        assert_eq!(recovered.recipient_id, original.recipient_id);
        assert_eq!(recovered.ttl, original.ttl);
        assert_eq!(recovered.timestamp_ms(), 1_725_000_000_000);
        assert_eq!(recovered.payload_len(), 1024);
        assert_eq!(recovered.message_type().unwrap(), MessageType::Text);
        assert!(recovered.flags().has(MessageFlags::ENCRYPTED));
    }

    #[test]
    fn timestamp_and_payload_len_are_big_endian_on_wire() {
        let header = MessageHeader::new(
            MessageType::Ping,
            MessageFlags::default(),
            [0u8; 16],
            [0u8; 8],
            [0u8; 8],
            0,
            0x0102030405060708,
            0x0A0B,
        );
        let bytes = header.as_bytes();
        // timestamp_ms_be starts right after version+type+flags+id+sender+recipient+ttl = 35
        assert_eq!(&bytes[35..43], &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[43..45], &[0x0A, 0x0B]);
    }

    #[test]
    fn fragment_header_round_trip() {
        let original = FragmentHeader::new(2, 6, 88);
        let bytes = original.as_bytes();
        assert_eq!(bytes.len(), 4);
        let recovered = FragmentHeader::read_from(bytes).unwrap();
        assert_eq!(recovered.index, 2);
        assert_eq!(recovered.total, 6);
        assert_eq!(recovered.payload_len(), 88);
    }

    #[test]
    fn fragment_header_payload_len_is_big_endian() {
        let original = FragmentHeader::new(0, 1, 0x0102);
        let bytes = original.as_bytes();
        assert_eq!(&bytes[2..4], &[0x01, 0x02]);
    }

    #[test]
    fn message_type_round_trip() {
        assert_eq!(MessageType::try_from(0x01).unwrap(), MessageType::Text);
        assert_eq!(MessageType::try_from(0x70).unwrap(), MessageType::Fragment);
        assert_eq!(MessageType::try_from(0xFF).unwrap(), MessageType::Error);
        assert!(MessageType::try_from(0x99).is_err());
    }

    #[test]
    fn noise_wire_sizes_sum_to_160() {
        assert_eq!(NOISE_MSG1_LEN + NOISE_MSG2_LEN + NOISE_MSG3_LEN, 160);
    }

    #[test]
    fn content_hash_is_deterministic() {
        let a = content_hash(b"hello");
        let b = content_hash(b"hello");
        let c = content_hash(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
