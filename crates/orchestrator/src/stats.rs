use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Cycle counters exposed for external scraping. Shared by reference
/// between the running loop and whatever reports on it.
#[derive(Debug, Default)]
pub struct OrchestratorStats {
    orders_sent: AtomicU64,
    cycles: AtomicU64,
    last_cycle_micros: AtomicU64,
}

impl OrchestratorStats {
    pub fn inc_orders_sent(&self) {
        self.orders_sent.fetch_add(1, Ordering::Relaxed);
    }

    #[must_use]
    pub fn orders_sent(&self) -> u64 {
        self.orders_sent.load(Ordering::Relaxed)
    }

    pub fn record_cycle(&self, elapsed: Duration) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.last_cycle_micros
            .store(elapsed.as_micros().min(u128::from(u64::MAX)) as u64, Ordering::Relaxed);
    }

    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// Latency of the most recent decision cycle in milliseconds.
    #[must_use]
    pub fn last_cycle_ms(&self) -> f64 {
        self.last_cycle_micros.load(Ordering::Relaxed) as f64 / 1_000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_latency_and_counts() {
        let stats = OrchestratorStats::default();
        stats.inc_orders_sent();
        stats.record_cycle(Duration::from_millis(3));
        assert_eq!(stats.orders_sent(), 1);
        assert_eq!(stats.cycles(), 1);
        assert!((stats.last_cycle_ms() - 3.0).abs() < 0.5);
    }
}
