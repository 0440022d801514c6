//! Session counters: sync checks, protocol events, traffic and ping RTT.
//!
//! Everything here lives inside the session context and is reset when the
//! session is torn down.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// Sync counters
// ---------------------------------------------------------------------------

/// Categories of periodic simulation cross-checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    /// Droid position and damage.
    Droid,
    /// Structure damage.
    Structure,
    /// Power levels.
    Power,
    /// Score.
    Score,
    /// Ping.
    Ping,
}

/// Sent and unsent check counts plus protocol event counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub sent_droid_check: u64,
    pub unsent_droid_check: u64,
    pub sent_structure_check: u64,
    pub unsent_structure_check: u64,
    pub sent_power_check: u64,
    pub unsent_power_check: u64,
    pub sent_score_check: u64,
    pub unsent_score_check: u64,
    pub sent_ping: u64,
    pub unsent_ping: u64,
    /// Players kicked.
    pub kicks: u16,
    /// Players admitted.
    pub joins: u16,
    /// Players that left cleanly.
    pub left: u16,
    /// Players dropped by the transport or a timeout.
    pub drops: u16,
    /// Joins refused because the session was full.
    pub cantjoin: u16,
    /// Joins refused because of a ban.
    pub banned: u16,
    /// Joins refused for any reason.
    pub rejected: u16,
}

impl SyncCounters {
    /// Count one check of `kind`. `sent` is false when it was skipped.
    pub fn record_check(&mut self, kind: CheckKind, sent: bool) {
        let (sent_count, unsent_count) = match kind {
            CheckKind::Droid => (&mut self.sent_droid_check, &mut self.unsent_droid_check),
            CheckKind::Structure => (
                &mut self.sent_structure_check,
                &mut self.unsent_structure_check,
            ),
            CheckKind::Power => (&mut self.sent_power_check, &mut self.unsent_power_check),
            CheckKind::Score => (&mut self.sent_score_check, &mut self.unsent_score_check),
            CheckKind::Ping => (&mut self.sent_ping, &mut self.unsent_ping),
        };
        if sent {
            *sent_count += 1;
        } else {
            *unsent_count += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Traffic
// ---------------------------------------------------------------------------

/// Byte and packet totals with a one-second "recent" window.
#[derive(Debug, Clone, Default)]
pub struct TrafficStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    /// Bytes sent during the last complete one-second window.
    pub recent_bytes_sent: u64,
    /// Bytes received during the last complete one-second window.
    pub recent_bytes_received: u64,
    /// Envelopes that failed to decode.
    pub malformed: u64,
    /// Envelopes relayed by the host on behalf of a client.
    pub relayed: u64,
    /// Envelopes dropped because of a routing inconsistency.
    pub routing_dropped: u64,
    window_start: Option<Instant>,
    window_sent: u64,
    window_received: u64,
}

impl TrafficStats {
    /// Count one outbound packet.
    pub fn record_sent(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.bytes_sent += bytes as u64;
        self.packets_sent += 1;
        self.window_sent += bytes as u64;
    }

    /// Count one inbound read.
    pub fn record_received(&mut self, bytes: usize, now: Instant) {
        self.roll(now);
        self.bytes_received += bytes as u64;
        self.packets_received += 1;
        self.window_received += bytes as u64;
    }

    /// Close the current window if a second has passed.
    pub fn roll(&mut self, now: Instant) {
        let start = *self.window_start.get_or_insert(now);
        if now.duration_since(start) >= Duration::from_secs(1) {
            self.recent_bytes_sent = self.window_sent;
            self.recent_bytes_received = self.window_received;
            self.window_sent = 0;
            self.window_received = 0;
            self.window_start = Some(now);
        }
    }
}

// ---------------------------------------------------------------------------
// Ping
// ---------------------------------------------------------------------------

struct Outstanding {
    sequence: u32,
    sent_at: Instant,
}

/// Rolling RTT window for one peer.
pub struct PingTracker {
    window: usize,
    timeout: Duration,
    samples: VecDeque<Duration>,
    outstanding: VecDeque<Outstanding>,
    next_sequence: u32,
    sent: u64,
    answered: u64,
}

impl Default for PingTracker {
    fn default() -> Self {
        Self::new(32, Duration::from_secs(10))
    }
}

impl std::fmt::Debug for PingTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PingTracker")
            .field("samples", &self.samples.len())
            .field("outstanding", &self.outstanding.len())
            .finish()
    }
}

impl PingTracker {
    /// Keep `window` samples; pings unanswered after `timeout` count as lost.
    pub fn new(window: usize, timeout: Duration) -> Self {
        Self {
            window: window.max(1),
            timeout,
            samples: VecDeque::with_capacity(window),
            outstanding: VecDeque::new(),
            next_sequence: 0,
            sent: 0,
            answered: 0,
        }
    }

    /// Register an outgoing ping and return its sequence number.
    pub fn ping_sent(&mut self, now: Instant) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        self.outstanding.push_back(Outstanding {
            sequence,
            sent_at: now,
        });
        self.sent += 1;
        sequence
    }

    /// Match a reply; unknown or late sequences are ignored.
    pub fn reply_received(&mut self, sequence: u32, now: Instant) {
        let Some(pos) = self.outstanding.iter().position(|p| p.sequence == sequence) else {
            return;
        };
        if let Some(ping) = self.outstanding.remove(pos) {
            if self.samples.len() >= self.window {
                self.samples.pop_front();
            }
            self.samples.push_back(now.saturating_duration_since(ping.sent_at));
            self.answered += 1;
        }
    }

    /// Forget pings that timed out.
    pub fn expire(&mut self, now: Instant) {
        while let Some(front) = self.outstanding.front() {
            if now.saturating_duration_since(front.sent_at) > self.timeout {
                self.outstanding.pop_front();
            } else {
                break;
            }
        }
    }

    /// Mean RTT over the window.
    pub fn average_rtt(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<Duration>() / self.samples.len() as u32)
    }

    /// Sample standard deviation of RTT.
    pub fn jitter(&self) -> Option<Duration> {
        if self.samples.len() < 2 {
            return None;
        }
        let mean = self.average_rtt()?.as_secs_f64();
        let variance = self
            .samples
            .iter()
            .map(|s| (s.as_secs_f64() - mean).powi(2))
            .sum::<f64>()
            / (self.samples.len() - 1) as f64;
        Some(Duration::from_secs_f64(variance.sqrt()))
    }

    /// Fraction of pings never answered, excluding those still in flight.
    pub fn loss_rate(&self) -> f64 {
        if self.sent == 0 {
            return 0.0;
        }
        let lost = self
            .sent
            .saturating_sub(self.answered)
            .saturating_sub(self.outstanding.len() as u64);
        lost as f64 / self.sent as f64
    }

    /// Immutable view for display.
    pub fn snapshot(&self) -> PingSnapshot {
        PingSnapshot {
            average_rtt: self.average_rtt(),
            jitter: self.jitter(),
            loss_rate: self.loss_rate(),
            samples: self.samples.len(),
        }
    }
}

/// Point-in-time ping statistics for one peer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PingSnapshot {
    pub average_rtt: Option<Duration>,
    pub jitter: Option<Duration>,
    pub loss_rate: f64,
    pub samples: usize,
}
