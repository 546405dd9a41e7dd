//! Cache statistics for capacity tuning

use serde::Serialize;

/// Hit/miss counter for one access method
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccessCounter {
    pub hits: u64,
    pub misses: u64,
}

impl AccessCounter {
    pub(crate) fn record(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
    }

    /// Fraction of hits (0.0 when never accessed)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Snapshot of cache counters and gauges
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub prefetch: AccessCounter,
    pub check: AccessCounter,
    pub acquire: AccessCounter,
    pub reference: AccessCounter,

    pub queued: usize,
    pub fetching: usize,
    pub ready: usize,
    pub errored: usize,

    pub budget: u64,
    /// Predicted cost of queued and fetching items
    pub estimated_cost: u64,
    /// Predicted cost of fetching items only
    pub in_flight_cost: u64,
    /// Actual cost of ready items
    pub realized_cost: u64,

    pub fetches_started: u64,
    pub fetch_errors: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn item_count(&self) -> usize {
        self.queued + self.fetching + self.ready + self.errored
    }
}
