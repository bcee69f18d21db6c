//! Link statistics.
//!
//! Counters are plain atomics bumped by the controller thread and read from
//! any thread. [`LinkStats::snapshot`] produces a serializable copy.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Live counters of one link.
#[derive(Debug, Default)]
pub struct LinkStats {
    pub tx_transactions: AtomicU64,
    pub rx_transactions: AtomicU64,
    pub tx_data_bytes: AtomicU64,
    pub rx_data_bytes: AtomicU64,
    pub empty_transactions: AtomicU64,
    pub bad_magic: AtomicU64,
    pub bad_crc: AtomicU64,
    pub malformed: AtomicU64,
    pub device_busy: AtomicU64,
    pub transport_timeouts: AtomicU64,
    pub rx_dropped: AtomicU64,
    pub resyncs: AtomicU64,
}

impl LinkStats {
    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            tx_transactions: load(&self.tx_transactions),
            rx_transactions: load(&self.rx_transactions),
            tx_data_bytes: load(&self.tx_data_bytes),
            rx_data_bytes: load(&self.rx_data_bytes),
            empty_transactions: load(&self.empty_transactions),
            bad_magic: load(&self.bad_magic),
            bad_crc: load(&self.bad_crc),
            malformed: load(&self.malformed),
            device_busy: load(&self.device_busy),
            transport_timeouts: load(&self.transport_timeouts),
            rx_dropped: load(&self.rx_dropped),
            resyncs: load(&self.resyncs),
            has_data_irqs: 0,
            ready_irqs: 0,
        }
    }
}

/// Point-in-time copy of [`LinkStats`] plus IRQ counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub tx_transactions: u64,
    pub rx_transactions: u64,
    pub tx_data_bytes: u64,
    pub rx_data_bytes: u64,
    pub empty_transactions: u64,
    pub bad_magic: u64,
    pub bad_crc: u64,
    pub malformed: u64,
    pub device_busy: u64,
    pub transport_timeouts: u64,
    pub rx_dropped: u64,
    pub resyncs: u64,
    pub has_data_irqs: u64,
    pub ready_irqs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = LinkStats::default();
        LinkStats::incr(&stats.bad_crc);
        LinkStats::incr(&stats.bad_crc);
        LinkStats::add(&stats.rx_data_bytes, 10);

        let snap = stats.snapshot();
        assert_eq!(snap.bad_crc, 2);
        assert_eq!(snap.rx_data_bytes, 10);
        assert_eq!(snap.resyncs, 0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let snap = LinkStats::default().snapshot();
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["tx_transactions"], 0);
        assert!(json.get("resyncs").is_some());
    }
}
