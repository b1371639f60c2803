//! Channel metrics emission (§4.4 "Metrics", §6 "Metrics event format").
//!
//! A channel may carry an optional metrics pipe -- itself another buffered
//! channel -- onto which it emits periodic [`MetricsEvent`]s. Emission is
//! asynchronous (a non-blocking send into the pipe) so a channel's hot path
//! never blocks on a slow metrics consumer; drops on pipe overflow are
//! silent (§9 Design Notes, "Metrics emission").

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A snapshot of a channel's counters, emitted whenever the operation-delta
/// or elapsed-time threshold from [`crate::config::MetricsConfig`] is met.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "metrics", derive(serde::Serialize))]
pub struct MetricsEvent {
    pub total_sends: u64,
    pub total_recvs: u64,
    pub total_bytes_sent: u64,
    pub total_bytes_recv: u64,
    pub delta_sends: u64,
    pub delta_recvs: u64,
    pub delta_bytes_sent: u64,
    pub delta_bytes_recv: u64,
    /// Emission timestamp in nanoseconds on the monotonic clock, relative to
    /// an arbitrary epoch fixed at process start.
    pub emitted_at_ns: u64,
}

/// Monotonic counters a channel keeps regardless of whether metrics
/// emission is wired up; emission only decides *whether* a [`MetricsEvent`]
/// is produced from them.
#[derive(Debug, Default)]
pub struct Counters {
    pub sends: AtomicU64,
    pub recvs: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_recv: AtomicU64,
    pub would_block: AtomicU64,
    pub deadline: AtomicU64,
    pub cancelled: AtomicU64,
    pub closed: AtomicU64,
    pub dropped: AtomicU64,
}

impl Counters {
    pub fn record_send(&self, bytes: usize) {
        self.sends.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_recv(&self, bytes: usize) {
        self.recvs.fetch_add(1, Ordering::Relaxed);
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self, kind: crate::error::FailureKind) {
        use crate::error::FailureKind::*;
        match kind {
            Availability => self.would_block.fetch_add(1, Ordering::Relaxed),
            Lifecycle => self.closed.fetch_add(1, Ordering::Relaxed),
            Capability | Programmer => self.dropped.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn snapshot_totals(&self) -> (u64, u64, u64, u64) {
        (
            self.sends.load(Ordering::Relaxed),
            self.recvs.load(Ordering::Relaxed),
            self.bytes_sent.load(Ordering::Relaxed),
            self.bytes_recv.load(Ordering::Relaxed),
        )
    }
}

/// Decides when a channel should attempt to emit a [`MetricsEvent`], and
/// builds one from the running totals plus the previous snapshot.
pub struct EmitPolicy {
    epoch: Instant,
    emit_min_ops: u64,
    emit_min_ms: u64,
    last_emit_at: Instant,
    last_sends: u64,
    last_recvs: u64,
    last_bytes_sent: u64,
    last_bytes_recv: u64,
}

impl EmitPolicy {
    pub fn new(emit_min_ops: u64, emit_min_ms: u64) -> EmitPolicy {
        EmitPolicy {
            epoch: Instant::now(),
            emit_min_ops,
            emit_min_ms,
            last_emit_at: Instant::now(),
            last_sends: 0,
            last_recvs: 0,
            last_bytes_sent: 0,
            last_bytes_recv: 0,
        }
    }

    /// Check the thresholds against `counters`; if either is met, produce the
    /// event and reset the running baseline.
    pub fn maybe_emit(&mut self, counters: &Counters) -> Option<MetricsEvent> {
        let (sends, recvs, bytes_sent, bytes_recv) = counters.snapshot_totals();
        let op_delta = (sends - self.last_sends) + (recvs - self.last_recvs);
        let elapsed = self.last_emit_at.elapsed();

        if op_delta < self.emit_min_ops && elapsed.as_millis() < self.emit_min_ms as u128 {
            return None;
        }

        let event = MetricsEvent {
            total_sends: sends,
            total_recvs: recvs,
            total_bytes_sent: bytes_sent,
            total_bytes_recv: bytes_recv,
            delta_sends: sends - self.last_sends,
            delta_recvs: recvs - self.last_recvs,
            delta_bytes_sent: bytes_sent - self.last_bytes_sent,
            delta_bytes_recv: bytes_recv - self.last_bytes_recv,
            emitted_at_ns: self.epoch.elapsed().as_nanos() as u64,
        };

        self.last_emit_at = Instant::now();
        self.last_sends = sends;
        self.last_recvs = recvs;
        self.last_bytes_sent = bytes_sent;
        self.last_bytes_recv = bytes_recv;

        Some(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_once_op_threshold_met() {
        let counters = Counters::default();
        let mut policy = EmitPolicy::new(2, 60_000);

        assert!(policy.maybe_emit(&counters).is_none());

        counters.record_send(4);
        assert!(policy.maybe_emit(&counters).is_none());

        counters.record_send(4);
        let ev = policy.maybe_emit(&counters).unwrap();
        assert_eq!(ev.delta_sends, 2);
        assert_eq!(ev.total_bytes_sent, 8);

        // Baseline reset: next check with no further ops stays quiet.
        assert!(policy.maybe_emit(&counters).is_none());
    }
}
