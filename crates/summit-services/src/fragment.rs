//! Fragmentation and reassembly for messages larger than the bearer MTU.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use summit_core::wire::FragmentHeader;

/// Hard cap on a reassembled message, independent of the sender's claimed
/// fragment count — guards against a malicious `total` driving unbounded
/// allocation.
pub const MAX_REASSEMBLED_SIZE: usize = 500 * 1024;

pub const DEFAULT_FRAGMENT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FragmentError {
    #[error("payload of {len} bytes needs {needed} fragments, exceeding the 255 limit")]
    TooManyFragments { len: usize, needed: usize },
    #[error("fragment_size must leave room for the 4-byte header")]
    FragmentSizeTooSmall,
    #[error("fragment index {index} is out of range for total {total}")]
    IndexOutOfRange { index: u8, total: u8 },
    #[error("fragment claims total {claimed} but the pending set was opened with total {expected}")]
    TotalMismatch { claimed: u8, expected: u8 },
    #[error("reassembled message of {size} bytes exceeds the {MAX_REASSEMBLED_SIZE}-byte cap")]
    ReassembledTooLarge { size: usize },
}

/// One outbound fragment: header plus the payload slice it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub index: u8,
    pub total: u8,
    pub payload: Vec<u8>,
}

impl Fragment {
    pub fn to_wire(&self) -> Vec<u8> {
        let header = FragmentHeader::new(self.index, self.total, self.payload.len() as u16);
        let mut out = Vec::with_capacity(4 + self.payload.len());
        out.extend_from_slice(zerocopy::AsBytes::as_bytes(&header));
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Split `payload` into fragments no larger than `max_fragment_size`
/// (header included). Fails if more than 255 fragments would be required.
pub fn fragment(payload: &[u8], max_fragment_size: usize) -> Result<Vec<Fragment>, FragmentError> {
    if max_fragment_size <= 4 {
        return Err(FragmentError::FragmentSizeTooSmall);
    }
    let capacity = max_fragment_size - 4;
    if payload.is_empty() {
        return Ok(vec![Fragment { index: 0, total: 1, payload: Vec::new() }]);
    }
    let needed = payload.len().div_ceil(capacity);
    if needed > 255 {
        return Err(FragmentError::TooManyFragments { len: payload.len(), needed });
    }
    let total = needed as u8;
    Ok(payload
        .chunks(capacity)
        .enumerate()
        .map(|(i, chunk)| Fragment { index: i as u8, total, payload: chunk.to_vec() })
        .collect())
}

struct PendingMessage {
    total: u8,
    parts: HashMap<u8, Vec<u8>>,
    expires_at: Instant,
}

impl PendingMessage {
    fn is_complete(&self) -> bool {
        self.parts.len() == self.total as usize
    }

    fn concatenate(&self) -> Result<Vec<u8>, FragmentError> {
        let mut out = Vec::new();
        for index in 0..self.total {
            if let Some(part) = self.parts.get(&index) {
                out.extend_from_slice(part);
            }
            if out.len() > MAX_REASSEMBLED_SIZE {
                return Err(FragmentError::ReassembledTooLarge { size: out.len() });
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AssemblerCounters {
    pub fragments_received: u64,
    pub messages_assembled: u64,
    pub duplicates: u64,
    pub expired_sets: u64,
}

/// Reassembles fragments keyed by message id. One instance is owned by the
/// engine per active mesh; there is no internal locking.
pub struct Assembler {
    pending: HashMap<[u8; 16], PendingMessage>,
    timeout: Duration,
    counters: AssemblerCounters,
}

impl Assembler {
    pub fn new(timeout: Duration) -> Self {
        Self { pending: HashMap::new(), timeout, counters: AssemblerCounters::default() }
    }

    pub fn counters(&self) -> AssemblerCounters {
        self.counters
    }

    /// Feed one fragment for `id`. Returns `Ok(Some(payload))` once every
    /// index 0..total has arrived, `Ok(None)` while still pending.
    pub fn receive(&mut self, id: [u8; 16], now: Instant, fragment: Fragment) -> Result<Option<Vec<u8>>, FragmentError> {
        if fragment.index >= fragment.total {
            return Err(FragmentError::IndexOutOfRange { index: fragment.index, total: fragment.total });
        }
        self.counters.fragments_received += 1;

        let entry = self.pending.entry(id).or_insert_with(|| PendingMessage {
            total: fragment.total,
            parts: HashMap::new(),
            expires_at: now + self.timeout,
        });

        if entry.total != fragment.total {
            return Err(FragmentError::TotalMismatch { claimed: fragment.total, expected: entry.total });
        }

        if entry.parts.contains_key(&fragment.index) {
            self.counters.duplicates += 1;
            return Ok(None);
        }
        entry.parts.insert(fragment.index, fragment.payload);

        if entry.is_complete() {
            let pending = self.pending.remove(&id).expect("just inserted above");
            let payload = pending.concatenate()?;
            self.counters.messages_assembled += 1;
            return Ok(Some(payload));
        }
        Ok(None)
    }

    /// Drop pending sets whose deadline has passed. Returns the ids
    /// expired this sweep.
    pub fn sweep(&mut self, now: Instant) -> Vec<[u8; 16]> {
        let expired: Vec<[u8; 16]> =
            self.pending.iter().filter(|(_, p)| now >= p.expires_at).map(|(id, _)| *id).collect();
        for id in &expired {
            self.pending.remove(id);
            self.counters.expired_sets += 1;
        }
        expired
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragment_at_mtu_23_produces_at_least_six_fragments() {
        let payload = vec![0x42u8; 100];
        let fragments = fragment(&payload, 23).unwrap();
        assert!(fragments.len() >= 6);
        let total = fragments[0].total;
        assert!(fragments.iter().all(|f| f.total == total));
    }

    #[test]
    fn fragment_and_reassemble_in_reverse_order() {
        let payload: Vec<u8> = (0..250u16).map(|i| (i % 256) as u8).collect();
        let id = [7u8; 16];
        let fragments = fragment(&payload, 23).unwrap();
        let mut assembler = Assembler::new(DEFAULT_FRAGMENT_TIMEOUT);
        let now = Instant::now();

        let mut result = None;
        for f in fragments.into_iter().rev() {
            result = assembler.receive(id, now, f).unwrap();
        }
        assert_eq!(result, Some(payload));
    }

    #[test]
    fn too_many_fragments_fails() {
        let payload = vec![0u8; 10_000];
        let err = fragment(&payload, 5).unwrap_err();
        assert!(matches!(err, FragmentError::TooManyFragments { .. }));
    }

    #[test]
    fn duplicate_index_is_counted_not_overwritten() {
        let payload = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
        let fragments = fragment(&payload, 8).unwrap();
        let id = [1u8; 16];
        let mut assembler = Assembler::new(DEFAULT_FRAGMENT_TIMEOUT);
        let now = Instant::now();

        assembler.receive(id, now, fragments[0].clone()).unwrap();
        assembler.receive(id, now, fragments[0].clone()).unwrap();
        assert_eq!(assembler.counters().duplicates, 1);
    }

    #[test]
    fn mismatched_total_is_rejected() {
        let id = [2u8; 16];
        let mut assembler = Assembler::new(DEFAULT_FRAGMENT_TIMEOUT);
        let now = Instant::now();
        assembler.receive(id, now, Fragment { index: 0, total: 3, payload: vec![1] }).unwrap();
        let err = assembler.receive(id, now, Fragment { index: 1, total: 4, payload: vec![2] }).unwrap_err();
        assert!(matches!(err, FragmentError::TotalMismatch { .. }));
    }

    #[test]
    fn incomplete_set_expires_after_timeout() {
        let id = [3u8; 16];
        let mut assembler = Assembler::new(Duration::from_secs(60));
        let now = Instant::now();
        assembler.receive(id, now, Fragment { index: 0, total: 2, payload: vec![1] }).unwrap();

        let expired = assembler.sweep(now + Duration::from_secs(30));
        assert!(expired.is_empty());

        let expired = assembler.sweep(now + Duration::from_secs(61));
        assert_eq!(expired, vec![id]);
        assert_eq!(assembler.pending_count(), 0);
        assert_eq!(assembler.counters().expired_sets, 1);
    }
}
