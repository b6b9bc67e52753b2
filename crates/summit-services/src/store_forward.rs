//! Store-and-forward cache: holds messages for offline recipients until
//! they reconnect, bounded by total bytes, total count, and per-recipient
//! count.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

pub type RecipientId = [u8; 8];
pub type MessageId = [u8; 16];

#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub id: MessageId,
    pub recipient_id: RecipientId,
    pub payload: Vec<u8>,
    pub cached_at: u64,
    pub expires_at: u64,
    pub attempts: u32,
    pub size: usize,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StoreAndForwardCounters {
    pub cached: u64,
    pub delivered: u64,
    pub failed: u64,
    pub dropped: u64,
    pub expired: u64,
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Per-recipient FIFO queues plus global size/count bookkeeping. Queue
/// ordering and global-oldest lookups are implemented over `DashMap`, the
/// same concurrent-registry shape used for the rest of the mesh's
/// long-lived state.
pub struct StoreAndForward {
    queues: DashMap<RecipientId, VecDeque<CachedMessage>>,
    max_cache_bytes: u64,
    max_total: usize,
    max_per_recipient: usize,
    default_ttl: Duration,
    total_bytes: AtomicU64,
    total_count: AtomicUsize,
    counters: std::sync::Mutex<StoreAndForwardCounters>,
}

impl StoreAndForward {
    pub fn new(max_cache_bytes: u64, max_total: usize, max_per_recipient: usize, default_ttl: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            max_cache_bytes,
            max_total,
            max_per_recipient,
            default_ttl,
            total_bytes: AtomicU64::new(0),
            total_count: AtomicUsize::new(0),
            counters: std::sync::Mutex::new(StoreAndForwardCounters::default()),
        }
    }

    pub fn counters(&self) -> StoreAndForwardCounters {
        *self.counters.lock().unwrap()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn total_count(&self) -> usize {
        self.total_count.load(Ordering::Relaxed)
    }

    /// Evict the globally oldest message across all recipients (minimum
    /// `cached_at`). Returns true if something was evicted.
    fn evict_oldest(&self) -> bool {
        let mut oldest: Option<(RecipientId, u64)> = None;
        for entry in self.queues.iter() {
            if let Some(front) = entry.value().front() {
                if oldest.map(|(_, t)| front.cached_at < t).unwrap_or(true) {
                    oldest = Some((*entry.key(), front.cached_at));
                }
            }
        }
        let Some((recipient, _)) = oldest else {
            return false;
        };
        if let Some(mut queue) = self.queues.get_mut(&recipient) {
            if let Some(evicted) = queue.pop_front() {
                self.total_bytes.fetch_sub(evicted.size as u64, Ordering::Relaxed);
                self.total_count.fetch_sub(1, Ordering::Relaxed);
                self.counters.lock().unwrap().dropped += 1;
                return true;
            }
        }
        false
    }

    /// Cache `payload` for `recipient`, enforcing global and per-recipient
    /// bounds before appending.
    pub fn cache(&self, recipient: RecipientId, id: MessageId, payload: Vec<u8>, ttl: Option<Duration>) {
        let size = payload.len();
        let cached_at = now_ms();
        let expires_at = cached_at + ttl.unwrap_or(self.default_ttl).as_millis() as u64;

        while self.total_bytes.load(Ordering::Relaxed) + size as u64 > self.max_cache_bytes
            || self.total_count.load(Ordering::Relaxed) >= self.max_total
        {
            if !self.evict_oldest() {
                break;
            }
        }

        let mut queue = self.queues.entry(recipient).or_default();
        if queue.len() >= self.max_per_recipient {
            if let Some(evicted) = queue.pop_front() {
                self.total_bytes.fetch_sub(evicted.size as u64, Ordering::Relaxed);
                self.total_count.fetch_sub(1, Ordering::Relaxed);
                self.counters.lock().unwrap().dropped += 1;
            }
        }

        queue.push_back(CachedMessage { id, recipient_id: recipient, payload, cached_at, expires_at, attempts: 0, size });
        self.total_bytes.fetch_add(size as u64, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        self.counters.lock().unwrap().cached += 1;
    }

    /// Attempt delivery of every queued message for `recipient`, in FIFO
    /// order, via `send_fn`. Expired messages are dropped without being
    /// sent. Returns `(delivered, failed)`.
    pub fn deliver(&self, recipient: RecipientId, mut send_fn: impl FnMut(&[u8]) -> bool) -> (u64, u64) {
        let Some(mut queue) = self.queues.get_mut(&recipient) else {
            return (0, 0);
        };
        let now = now_ms();
        let mut delivered = 0u64;
        let mut failed = 0u64;
        let mut remaining = VecDeque::new();

        while let Some(mut entry) = queue.pop_front() {
            if now > entry.expires_at {
                self.total_bytes.fetch_sub(entry.size as u64, Ordering::Relaxed);
                self.total_count.fetch_sub(1, Ordering::Relaxed);
                self.counters.lock().unwrap().expired += 1;
                continue;
            }
            if send_fn(&entry.payload) {
                self.total_bytes.fetch_sub(entry.size as u64, Ordering::Relaxed);
                self.total_count.fetch_sub(1, Ordering::Relaxed);
                delivered += 1;
                self.counters.lock().unwrap().delivered += 1;
            } else {
                entry.attempts += 1;
                failed += 1;
                self.counters.lock().unwrap().failed += 1;
                remaining.push_back(entry);
            }
        }
        *queue = remaining;
        (delivered, failed)
    }

    /// Removes every non-expired message queued for `recipient` and hands
    /// them back to the caller; expired ones are dropped in place. Unlike
    /// [`StoreAndForward::deliver`], the caller decides what "delivered"
    /// means and is responsible for re-`cache`-ing anything it couldn't
    /// send — useful when delivery requires work (like re-encrypting)
    /// that doesn't fit a plain `&[u8] -> bool` callback.
    pub fn drain(&self, recipient: RecipientId) -> Vec<CachedMessage> {
        let Some(mut queue) = self.queues.get_mut(&recipient) else {
            return Vec::new();
        };
        let now = now_ms();
        let mut out = Vec::new();
        while let Some(entry) = queue.pop_front() {
            self.total_bytes.fetch_sub(entry.size as u64, Ordering::Relaxed);
            self.total_count.fetch_sub(1, Ordering::Relaxed);
            if now > entry.expires_at {
                self.counters.lock().unwrap().expired += 1;
                continue;
            }
            out.push(entry);
        }
        out
    }

    /// Drop every expired message across all recipients, independent of
    /// any delivery attempt. Intended to run on a periodic sweep.
    pub fn sweep_expired(&self) -> u64 {
        let now = now_ms();
        let mut expired = 0u64;
        for mut entry in self.queues.iter_mut() {
            let before = entry.value().len();
            entry.value_mut().retain(|m| {
                let keep = now <= m.expires_at;
                if !keep {
                    self.total_bytes.fetch_sub(m.size as u64, Ordering::Relaxed);
                    self.total_count.fetch_sub(1, Ordering::Relaxed);
                }
                keep
            });
            expired += (before - entry.value().len()) as u64;
        }
        if expired > 0 {
            self.counters.lock().unwrap().expired += expired;
        }
        expired
    }

    pub fn queue_len(&self, recipient: RecipientId) -> usize {
        self.queues.get(&recipient).map(|q| q.len()).unwrap_or(0)
    }
}
