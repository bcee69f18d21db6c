//! Ring of recently received transactions, kept for diagnostics.

use std::collections::VecDeque;
use std::time::Instant;

use bytes::Bytes;
use serde::Serialize;

/// One received physical transaction.
#[derive(Debug, Clone)]
pub struct RxHistoryEntry {
    pub start: Instant,
    pub end: Instant,
    pub len: usize,
    pub data: Bytes,
}

/// Bounded history; the oldest entry is overwritten first.
#[derive(Debug)]
pub struct RxHistory {
    entries: VecDeque<RxHistoryEntry>,
    depth: usize,
}

impl RxHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(depth),
            depth,
        }
    }

    /// Record a transaction. No-op when the depth is 0.
    pub fn push(&mut self, start: Instant, end: Instant, data: &[u8]) {
        if self.depth == 0 {
            return;
        }
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(RxHistoryEntry {
            start,
            end,
            len: data.len(),
            data: Bytes::copy_from_slice(data),
        });
    }

    /// Entries from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &RxHistoryEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&RxHistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Summaries relative to `origin`, oldest first.
    pub fn summarize(&self, origin: Instant) -> Vec<HistorySummary> {
        self.entries
            .iter()
            .map(|e| HistorySummary {
                start_us: e.start.saturating_duration_since(origin).as_micros() as u64,
                duration_us: e.end.saturating_duration_since(e.start).as_micros() as u64,
                len: e.len,
                kind: e.data.get(crate::protocol::HEADER_SIZE).copied(),
            })
            .collect()
    }
}

/// Serializable view of one history entry.
#[derive(Debug, Clone, Serialize)]
pub struct HistorySummary {
    pub start_us: u64,
    pub duration_us: u64,
    pub len: usize,
    /// Packet kind byte, if the transaction was long enough to carry one.
    pub kind: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oldest_overwritten_first() {
        let mut history = RxHistory::new(2);
        let now = Instant::now();
        history.push(now, now, b"one");
        history.push(now, now, b"two");
        history.push(now, now, b"three");

        let lens: Vec<_> = history.iter().map(|e| e.len).collect();
        assert_eq!(lens, vec![3, 5]);
        assert_eq!(&history.latest().unwrap().data[..], b"three");
    }

    #[test]
    fn test_zero_depth() {
        let mut history = RxHistory::new(0);
        let now = Instant::now();
        history.push(now, now, b"x");
        assert!(history.is_empty());
    }

    #[test]
    fn test_summarize() {
        let mut history = RxHistory::new(4);
        let now = Instant::now();
        let mut wire = vec![0u8; 16];
        wire[crate::protocol::HEADER_SIZE] = crate::protocol::kind::SYNC;
        history.push(now, now, &wire);

        let summary = history.summarize(now);
        assert_eq!(summary.len(), 1);
        assert_eq!(summary[0].len, 16);
        assert_eq!(summary[0].kind, Some(crate::protocol::kind::SYNC));
    }
}
