// Pool metrics
// Lock-free counters updated on every acquire and statement, snapshotted on demand

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters embedded in every pool
#[derive(Debug, Default)]
pub struct PoolMetrics {
    acquire_count: AtomicU64,
    acquire_duration_us: AtomicU64,
    empty_acquire_count: AtomicU64,
    canceled_acquire_count: AtomicU64,
    acquire_error_count: AtomicU64,
    query_count: AtomicU64,
    query_error_count: AtomicU64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// A successful checkout. `waited` is true when no idle connection was available.
    pub fn record_acquire(&self, elapsed: Duration, waited: bool) {
        self.acquire_count.fetch_add(1, Ordering::Relaxed);
        self.acquire_duration_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        if waited {
            self.empty_acquire_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_canceled_acquire(&self) {
        self.canceled_acquire_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acquire_error(&self) {
        self.acquire_error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_query(&self, ok: bool) {
        self.query_count.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.query_error_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Combine the counters with the pool's live connection state
    pub fn snapshot(&self, total_conns: u32, idle_conns: u32, max_conns: u32) -> PoolStats {
        let acquire_count = self.acquire_count.load(Ordering::Relaxed);
        let acquire_duration_us = self.acquire_duration_us.load(Ordering::Relaxed);
        let avg_acquire_ms = if acquire_count == 0 {
            0.0
        } else {
            acquire_duration_us as f64 / acquire_count as f64 / 1000.0
        };

        PoolStats {
            total_conns,
            idle_conns,
            acquired_conns: total_conns.saturating_sub(idle_conns),
            max_conns,
            acquire_count,
            acquire_duration_ms: acquire_duration_us / 1000,
            avg_acquire_ms,
            empty_acquire_count: self.empty_acquire_count.load(Ordering::Relaxed),
            canceled_acquire_count: self.canceled_acquire_count.load(Ordering::Relaxed),
            acquire_error_count: self.acquire_error_count.load(Ordering::Relaxed),
            query_count: self.query_count.load(Ordering::Relaxed),
            query_error_count: self.query_error_count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total_conns: u32,
    pub idle_conns: u32,
    pub acquired_conns: u32,
    pub max_conns: u32,
    pub acquire_count: u64,
    pub acquire_duration_ms: u64,
    pub avg_acquire_ms: f64,
    pub empty_acquire_count: u64,
    pub canceled_acquire_count: u64,
    pub acquire_error_count: u64,
    pub query_count: u64,
    pub query_error_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_snapshot_derives_acquired_and_average() {
        let metrics = PoolMetrics::new();
        metrics.record_acquire(Duration::from_millis(2), false);
        metrics.record_acquire(Duration::from_millis(4), true);
        metrics.record_query(true);
        metrics.record_query(false);
        metrics.record_canceled_acquire();

        let stats = metrics.snapshot(5, 3, 10);
        assert_eq!(stats.acquired_conns, 2);
        assert_eq!(stats.acquire_count, 2);
        assert_eq!(stats.acquire_duration_ms, 6);
        assert!((stats.avg_acquire_ms - 3.0).abs() < 1e-9);
        assert_eq!(stats.empty_acquire_count, 1);
        assert_eq!(stats.canceled_acquire_count, 1);
        assert_eq!(stats.query_count, 2);
        assert_eq!(stats.query_error_count, 1);
    }

    #[test]
    fn test_empty_snapshot() {
        let stats = PoolMetrics::new().snapshot(0, 0, 4);
        assert_eq!(stats.acquire_count, 0);
        assert_eq!(stats.avg_acquire_ms, 0.0);
        assert_eq!(stats.max_conns, 4);
    }

    #[test]
    fn test_counters_are_safe_across_threads() {
        let metrics = Arc::new(PoolMetrics::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = Arc::clone(&metrics);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        metrics.record_query(true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(metrics.snapshot(0, 0, 1).query_count, 8000);
    }
}
