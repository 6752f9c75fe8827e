//! Ingest counters shared between a receive thread and a reporter.
//!
//! The receive loop only ever increments; reporters take a [`StatsSnapshot`]
//! on their own cadence and difference successive snapshots for rates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use minstant::Instant;

/// Atomic ingest counters for one stream.
#[derive(Debug, Default)]
pub struct IngestStats {
    bytes_transferred: AtomicU64,
    packets_transferred: AtomicU64,
    bytes_dropped: AtomicU64,
    packets_dropped: AtomicU64,
    bytes_lost: AtomicU64,
    sleeps: AtomicU64,
}

impl IngestStats {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes_transferred: AtomicU64::new(0),
            packets_transferred: AtomicU64::new(0),
            bytes_dropped: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
            bytes_lost: AtomicU64::new(0),
            sleeps: AtomicU64::new(0),
        }
    }

    /// Records one packet of `n` bytes placed into a block.
    #[inline]
    pub fn increment_bytes(&self, n: u64) {
        self.bytes_transferred.fetch_add(n, Ordering::Relaxed);
        self.packets_transferred.fetch_add(1, Ordering::Relaxed);
    }

    /// Records one rejected packet of `n` payload bytes (late or duplicate).
    #[inline]
    pub fn drop_bytes(&self, n: u64) {
        self.bytes_dropped.fetch_add(n, Ordering::Relaxed);
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `n` bytes of a block that no packet ever filled.
    #[inline]
    pub fn lost_bytes(&self, n: u64) {
        if n > 0 {
            self.bytes_lost.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Records `n` receive attempts that found no data.
    #[inline]
    pub fn record_sleep(&self, n: u64) {
        self.sleeps.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_transferred: self.bytes_transferred.load(Ordering::Relaxed),
            packets_transferred: self.packets_transferred.load(Ordering::Relaxed),
            bytes_dropped: self.bytes_dropped.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            bytes_lost: self.bytes_lost.load(Ordering::Relaxed),
            sleeps: self.sleeps.load(Ordering::Relaxed),
        }
    }

    /// Zeroes every counter ahead of a new observation.
    pub fn reset(&self) {
        self.bytes_transferred.store(0, Ordering::Relaxed);
        self.packets_transferred.store(0, Ordering::Relaxed);
        self.bytes_dropped.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.bytes_lost.store(0, Ordering::Relaxed);
        self.sleeps.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`IngestStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub bytes_transferred: u64,
    pub packets_transferred: u64,
    pub bytes_dropped: u64,
    pub packets_dropped: u64,
    pub bytes_lost: u64,
    pub sleeps: u64,
}

impl StatsSnapshot {
    /// Counter growth from `earlier` to `self`.
    #[must_use]
    pub const fn since(&self, earlier: &Self) -> Self {
        Self {
            bytes_transferred: self.bytes_transferred.saturating_sub(earlier.bytes_transferred),
            packets_transferred: self
                .packets_transferred
                .saturating_sub(earlier.packets_transferred),
            bytes_dropped: self.bytes_dropped.saturating_sub(earlier.bytes_dropped),
            packets_dropped: self.packets_dropped.saturating_sub(earlier.packets_dropped),
            bytes_lost: self.bytes_lost.saturating_sub(earlier.bytes_lost),
            sleeps: self.sleeps.saturating_sub(earlier.sleeps),
        }
    }

    /// Transfer rate in MB/s over `elapsed`, given a delta snapshot.
    #[must_use]
    pub fn rate_mb_per_s(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes_transferred as f64 / 1e6 / secs
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "recv {} B ({} pkts), dropped {} B ({} pkts), lost {} B, sleeps {}",
            self.bytes_transferred,
            self.packets_transferred,
            self.bytes_dropped,
            self.packets_dropped,
            self.bytes_lost,
            self.sleeps
        )
    }
}

/// Turns successive snapshots of one [`IngestStats`] into interval rates.
#[derive(Debug)]
pub struct RateMeter {
    last: StatsSnapshot,
    at: Instant,
}

impl RateMeter {
    #[must_use]
    pub fn new(stats: &IngestStats) -> Self {
        Self {
            last: stats.snapshot(),
            at: Instant::now(),
        }
    }

    /// Time since the previous sample.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.at.elapsed()
    }

    /// Counter growth since the previous sample and the transfer rate in MB/s.
    pub fn sample(&mut self, stats: &IngestStats) -> (StatsSnapshot, f64) {
        let now = Instant::now();
        let snap = stats.snapshot();
        let delta = snap.since(&self.last);
        let rate = delta.rate_mb_per_s(now.duration_since(self.at));
        self.last = snap;
        self.at = now;
        (delta, rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = IngestStats::new();
        stats.increment_bytes(4096);
        stats.increment_bytes(4096);
        stats.drop_bytes(4096);
        stats.lost_bytes(0);
        stats.lost_bytes(8192);
        stats.record_sleep(1000);

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_transferred, 8192);
        assert_eq!(snap.packets_transferred, 2);
        assert_eq!(snap.bytes_dropped, 4096);
        assert_eq!(snap.packets_dropped, 1);
        assert_eq!(snap.bytes_lost, 8192);
        assert_eq!(snap.sleeps, 1000);
    }

    #[test]
    fn test_since_and_rate() {
        let stats = IngestStats::new();
        stats.increment_bytes(1_000_000);
        let first = stats.snapshot();
        stats.increment_bytes(2_000_000);
        let delta = stats.snapshot().since(&first);
        assert_eq!(delta.bytes_transferred, 2_000_000);
        assert!((delta.rate_mb_per_s(Duration::from_secs(2)) - 1.0).abs() < 1e-9);
        assert_eq!(delta.rate_mb_per_s(Duration::ZERO), 0.0);
    }

    #[test]
    fn test_reset() {
        let stats = IngestStats::new();
        stats.increment_bytes(10);
        stats.reset();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_concurrent_increments() {
        let stats = std::sync::Arc::new(IngestStats::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let stats = std::sync::Arc::clone(&stats);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        stats.increment_bytes(8);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(stats.snapshot().bytes_transferred, 32_000);
    }

    #[test]
    fn test_rate_meter_reports_deltas() {
        let stats = IngestStats::new();
        stats.increment_bytes(100);
        let mut meter = RateMeter::new(&stats);
        stats.increment_bytes(4096);
        std::thread::sleep(Duration::from_millis(5));
        let (delta, rate) = meter.sample(&stats);
        assert_eq!(delta.bytes_transferred, 4096);
        assert!(rate > 0.0);
        let (delta, _) = meter.sample(&stats);
        assert_eq!(delta.bytes_transferred, 0);
    }
}
