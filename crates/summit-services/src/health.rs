//! Network-health tracking: per-peer latency/loss/activity plus a global
//! ring buffer and GOOD/FAIR/POOR classification that drives adaptive
//! behavior elsewhere in the engine.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;

pub type PeerId = [u8; 8];
pub type MessageId = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallHealth {
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone)]
pub struct PeerHealth {
    pub ema_latency_ms: f64,
    pub sent: u64,
    pub delivered: u64,
    pub failed: u64,
    pub last_seen: Instant,
    pub active: bool,
}

impl PeerHealth {
    fn new(now: Instant) -> Self {
        Self { ema_latency_ms: 0.0, sent: 0, delivered: 0, failed: 0, last_seen: now, active: true }
    }

    pub fn loss_ratio(&self) -> f64 {
        if self.sent == 0 {
            0.0
        } else {
            self.failed as f64 / self.sent as f64
        }
    }
}

struct PendingSend {
    peer: PeerId,
    started_at: Instant,
}

/// Fixed-capacity ring buffer of latency samples with an O(1) running mean.
struct LatencyRing {
    capacity: usize,
    samples: VecDeque<f64>,
    sum: f64,
}

impl LatencyRing {
    fn new(capacity: usize) -> Self {
        Self { capacity: capacity.max(1), samples: VecDeque::new(), sum: 0.0 }
    }

    fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            if let Some(oldest) = self.samples.pop_front() {
                self.sum -= oldest;
            }
        }
        self.samples.push_back(value);
        self.sum += value;
    }

    fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            self.sum / self.samples.len() as f64
        }
    }
}

pub struct HealthConfig {
    pub ema_alpha: f64,
    pub ring_buffer_len: usize,
    pub peer_timeout: Duration,
    pub min_active_peers: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { ema_alpha: 0.2, ring_buffer_len: 100, peer_timeout: Duration::from_secs(60), min_active_peers: 1 }
    }
}

/// Tracks per-peer delivery health plus a global rolling view. One
/// instance is owned by the engine; `DashMap` gives the same
/// concurrent-registry shape used by the rest of the mesh's long-lived
/// state even though today only the engine task touches it.
pub struct HealthMonitor {
    config: HealthConfig,
    peers: DashMap<PeerId, PeerHealth>,
    pending: DashMap<MessageId, PendingSend>,
    ring: std::sync::Mutex<LatencyRing>,
    total_sent: std::sync::atomic::AtomicU64,
    total_failed: std::sync::atomic::AtomicU64,
    current_health: std::sync::Mutex<OverallHealth>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let ring = LatencyRing::new(config.ring_buffer_len);
        Self {
            config,
            peers: DashMap::new(),
            pending: DashMap::new(),
            ring: std::sync::Mutex::new(ring),
            total_sent: std::sync::atomic::AtomicU64::new(0),
            total_failed: std::sync::atomic::AtomicU64::new(0),
            current_health: std::sync::Mutex::new(OverallHealth::Good),
        }
    }

    pub fn track_sent(&self, peer: PeerId, msg_id: MessageId, now: Instant) {
        self.peers.entry(peer).or_insert_with(|| PeerHealth::new(now)).sent += 1;
        self.peers.entry(peer).and_modify(|p| p.last_seen = now);
        self.pending.insert(msg_id, PendingSend { peer, started_at: now });
        self.total_sent.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Record a successful delivery. `latency` overrides the measured
    /// `now - started_at` if provided.
    pub fn track_delivered(&self, msg_id: MessageId, now: Instant, latency: Option<Duration>) {
        let Some((_, pending)) = self.pending.remove(&msg_id) else {
            return;
        };
        let latency_ms = latency.unwrap_or_else(|| now.saturating_duration_since(pending.started_at)).as_secs_f64() * 1000.0;

        if let Some(mut peer) = self.peers.get_mut(&pending.peer) {
            peer.delivered += 1;
            peer.last_seen = now;
            peer.ema_latency_ms = if peer.delivered == 1 {
                latency_ms
            } else {
                self.config.ema_alpha * latency_ms + (1.0 - self.config.ema_alpha) * peer.ema_latency_ms
            };
        }
        self.ring.lock().unwrap().push(latency_ms);
    }

    pub fn track_failed(&self, msg_id: MessageId) {
        let Some((_, pending)) = self.pending.remove(&msg_id) else {
            return;
        };
        if let Some(mut peer) = self.peers.get_mut(&pending.peer) {
            peer.failed += 1;
        }
        self.total_failed.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn global_loss_ratio(&self) -> f64 {
        let sent = self.total_sent.load(std::sync::atomic::Ordering::Relaxed);
        if sent == 0 {
            0.0
        } else {
            self.total_failed.load(std::sync::atomic::Ordering::Relaxed) as f64 / sent as f64
        }
    }

    fn active_peer_count(&self) -> usize {
        self.peers.iter().filter(|p| p.active).count()
    }

    /// Periodic sweep: marks inactive peers, fails stale pending sends,
    /// recomputes overall health. Returns the new health if it changed
    /// from the previous sweep.
    pub fn sweep(&self, now: Instant) -> Option<OverallHealth> {
        for mut peer in self.peers.iter_mut() {
            if now.saturating_duration_since(peer.last_seen) > self.config.peer_timeout {
                peer.active = false;
            }
        }

        let stale: Vec<MessageId> = self
            .pending
            .iter()
            .filter(|p| now.saturating_duration_since(p.started_at) > self.config.peer_timeout)
            .map(|p| *p.key())
            .collect();
        for msg_id in stale {
            self.track_failed(msg_id);
        }

        let active = self.active_peer_count();
        let loss = self.global_loss_ratio();
        let latency = self.ring.lock().unwrap().mean();

        let new_health = if active < self.config.min_active_peers || loss > 0.5 || latency > 2000.0 {
            OverallHealth::Poor
        } else if active < 2 * self.config.min_active_peers || loss > 0.2 || latency > 1000.0 {
            OverallHealth::Fair
        } else {
            OverallHealth::Good
        };

        let mut current = self.current_health.lock().unwrap();
        if *current != new_health {
            *current = new_health;
            Some(new_health)
        } else {
            None
        }
    }

    pub fn peer_health(&self, peer: &PeerId) -> Option<PeerHealth> {
        self.peers.get(peer).map(|p| p.clone())
    }

    pub fn overall_health(&self) -> OverallHealth {
        *self.current_health.lock().unwrap()
    }
}

/// Optional per-peer connection-quality sub-tracker: weighted scoring over
/// RSSI, latency, loss, and throughput, refreshed on a five-second cadence
/// by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionQualityLevel {
    Excellent,
    Good,
    Fair,
    Poor,
    Disconnected,
}

pub struct ConnectionQualitySample {
    pub rssi_dbm: f64,
    pub latency_ms: f64,
    pub loss_ratio: f64,
    pub throughput_bytes_per_sec: f64,
}

const WEIGHT_RSSI: f64 = 0.30;
const WEIGHT_LATENCY: f64 = 0.30;
const WEIGHT_LOSS: f64 = 0.25;
const WEIGHT_THROUGHPUT: f64 = 0.15;

/// Normalizes a sample into a 0.0-1.0 score and classifies it. RSSI is
/// normalized against a -100..-30 dBm range, latency against 0..2000 ms,
/// loss is already a ratio, throughput is normalized against an
/// application-supplied expected ceiling.
pub fn score_connection_quality(sample: &ConnectionQualitySample, expected_throughput: f64) -> (f64, ConnectionQualityLevel) {
    let rssi_score = ((sample.rssi_dbm + 100.0) / 70.0).clamp(0.0, 1.0);
    let latency_score = (1.0 - sample.latency_ms / 2000.0).clamp(0.0, 1.0);
    let loss_score = (1.0 - sample.loss_ratio).clamp(0.0, 1.0);
    let throughput_score = if expected_throughput > 0.0 {
        (sample.throughput_bytes_per_sec / expected_throughput).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let score = WEIGHT_RSSI * rssi_score + WEIGHT_LATENCY * latency_score + WEIGHT_LOSS * loss_score + WEIGHT_THROUGHPUT * throughput_score;

    let level = if score >= 0.85 {
        ConnectionQualityLevel::Excellent
    } else if score >= 0.65 {
        ConnectionQualityLevel::Good
    } else if score >= 0.4 {
        ConnectionQualityLevel::Fair
    } else if score > 0.0 {
        ConnectionQualityLevel::Poor
    } else {
        ConnectionQualityLevel::Disconnected
    };
    (score, level)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_delivered_updates_ema_latency() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let peer = [1u8; 8];
        let now = Instant::now();
        monitor.track_sent(peer, [1u8; 16], now);
        monitor.track_delivered([1u8; 16], now, Some(Duration::from_millis(100)));
        let health = monitor.peer_health(&peer).unwrap();
        assert!((health.ema_latency_ms - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn track_failed_increments_loss() {
        let monitor = HealthMonitor::new(HealthConfig::default());
        let peer = [2u8; 8];
        let now = Instant::now();
        monitor.track_sent(peer, [2u8; 16], now);
        monitor.track_failed([2u8; 16]);
        let health = monitor.peer_health(&peer).unwrap();
        assert_eq!(health.failed, 1);
        assert!((health.loss_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn sweep_marks_peer_inactive_after_timeout() {
        let mut config = HealthConfig::default();
        config.peer_timeout = Duration::from_millis(10);
        let monitor = HealthMonitor::new(config);
        let peer = [3u8; 8];
        let t0 = Instant::now();
        monitor.track_sent(peer, [3u8; 16], t0);
        monitor.track_delivered([3u8; 16], t0, Some(Duration::from_millis(5)));

        monitor.sweep(t0 + Duration::from_millis(50));
        assert!(!monitor.peer_health(&peer).unwrap().active);
    }

    #[test]
    fn overall_health_degrades_with_high_loss() {
        let mut config = HealthConfig::default();
        config.min_active_peers = 1;
        let monitor = HealthMonitor::new(config);
        let peer = [4u8; 8];
        let now = Instant::now();
        for i in 0..10u8 {
            monitor.track_sent(peer, [i; 16], now);
            monitor.track_failed([i; 16]);
        }
        monitor.track_sent(peer, [200u8; 16], now);
        monitor.track_delivered([200u8; 16], now, Some(Duration::from_millis(10)));

        let changed = monitor.sweep(now);
        assert_eq!(changed, Some(OverallHealth::Poor));
    }

    #[test]
    fn connection_quality_scores_excellent_for_ideal_sample() {
        let sample = ConnectionQualitySample { rssi_dbm: -30.0, latency_ms: 10.0, loss_ratio: 0.0, throughput_bytes_per_sec: 1_000_000.0 };
        let (score, level) = score_connection_quality(&sample, 1_000_000.0);
        assert!(score > 0.85);
        assert_eq!(level, ConnectionQualityLevel::Excellent);
    }

    #[test]
    fn connection_quality_scores_poor_for_bad_sample() {
        let sample = ConnectionQualitySample { rssi_dbm: -95.0, latency_ms: 1900.0, loss_ratio: 0.8, throughput_bytes_per_sec: 0.0 };
        let (_, level) = score_connection_quality(&sample, 1_000_000.0);
        assert!(matches!(level, ConnectionQualityLevel::Poor | ConnectionQualityLevel::Disconnected));
    }
}
