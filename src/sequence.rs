//! Sequence-number allocator.
//!
//! Clients correlate command/response pairs with one-byte sequence numbers
//! handed out from a bounded pool. A number is allocated globally iff exactly
//! one attached client holds it.
//!
//! Allocation scans forward from the last number handed out, wrapping once
//! over the configured range, so a freshly released number is not reused
//! before the rest of the range has been tried.
//!
//! # Example
//!
//! ```
//! use stp_link::sequence::SequencePool;
//!
//! let mut pool = SequencePool::new(1, 254);
//! let client = pool.attach();
//! let seq = pool.allocate(client).unwrap();
//! assert_eq!(seq, 1);
//! pool.release(client, seq).unwrap();
//! ```

use std::collections::HashMap;

use crate::error::{Result, StpError};

/// Identifier of a client attached to a [`SequencePool`].
pub type ClientId = u32;

/// Fixed-size set of 256 bits, one per `u8` value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeqBitset([u64; 4]);

impl SeqBitset {
    #[inline]
    pub fn contains(&self, seq: u8) -> bool {
        self.0[seq as usize / 64] & (1 << (seq % 64)) != 0
    }

    #[inline]
    pub fn insert(&mut self, seq: u8) {
        self.0[seq as usize / 64] |= 1 << (seq % 64);
    }

    #[inline]
    pub fn remove(&mut self, seq: u8) {
        self.0[seq as usize / 64] &= !(1 << (seq % 64));
    }

    /// `self &= !other`.
    pub fn remove_all(&mut self, other: &SeqBitset) {
        for (word, mask) in self.0.iter_mut().zip(other.0.iter()) {
            *word &= !mask;
        }
    }

    pub fn len(&self) -> usize {
        self.0.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|&w| w == 0)
    }

    pub fn clear(&mut self) {
        self.0 = [0; 4];
    }

    /// Members in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0..=u8::MAX).filter(move |&seq| self.contains(seq))
    }
}

/// Pool of sequence numbers in `min..=max`.
#[derive(Debug)]
pub struct SequencePool {
    min: u8,
    max: u8,
    allocated: SeqBitset,
    last_seq_num: u8,
    allocation_count: usize,
    clients: HashMap<ClientId, SeqBitset>,
    next_client: ClientId,
}

impl SequencePool {
    /// Create an empty pool over `min..=max`.
    pub fn new(min: u8, max: u8) -> Self {
        debug_assert!(min <= max);
        Self {
            min,
            max,
            allocated: SeqBitset::default(),
            last_seq_num: max,
            allocation_count: 0,
            clients: HashMap::new(),
            next_client: 0,
        }
    }

    /// Register a client and return its id.
    pub fn attach(&mut self) -> ClientId {
        let id = self.next_client;
        self.next_client = self.next_client.wrapping_add(1);
        self.clients.insert(id, SeqBitset::default());
        tracing::debug!("Sequence client {} attached", id);
        id
    }

    /// Release everything `client` holds and unregister it.
    ///
    /// The pool is reset once the last client has detached.
    pub fn detach(&mut self, client: ClientId) {
        self.release_all_for_client(client);
        self.clients.remove(&client);
        tracing::debug!("Sequence client {} detached", client);
        if self.clients.is_empty() {
            self.reset();
        }
    }

    /// Hand out the next free number to `client`.
    pub fn allocate(&mut self, client: ClientId) -> Result<u8> {
        let held = self
            .clients
            .get_mut(&client)
            .ok_or_else(|| StpError::InvalidParameters(format!("unknown client {client}")))?;

        let span = self.max as u16 - self.min as u16 + 1;
        let mut candidate = if self.last_seq_num >= self.max || self.last_seq_num < self.min {
            self.min
        } else {
            self.last_seq_num + 1
        };

        for _ in 0..span {
            if !self.allocated.contains(candidate) {
                self.allocated.insert(candidate);
                held.insert(candidate);
                self.last_seq_num = candidate;
                self.allocation_count += 1;
                tracing::trace!("Sequence number {} allocated to client {}", candidate, client);
                return Ok(candidate);
            }
            candidate = if candidate == self.max {
                self.min
            } else {
                candidate + 1
            };
        }

        Err(StpError::SequenceExhausted)
    }

    /// Return `seq` to the pool. Only its holder may release it.
    pub fn release(&mut self, client: ClientId, seq: u8) -> Result<()> {
        if seq < self.min || seq > self.max {
            return Err(StpError::InvalidParameters(format!(
                "sequence number {} outside {}..={}",
                seq, self.min, self.max
            )));
        }

        let held = self
            .clients
            .get_mut(&client)
            .ok_or_else(|| StpError::InvalidParameters(format!("unknown client {client}")))?;
        if !held.contains(seq) {
            return Err(StpError::SequenceNotHeld(seq));
        }

        held.remove(seq);
        self.allocated.remove(seq);
        self.allocation_count -= 1;
        tracing::trace!("Sequence number {} released by client {}", seq, client);
        Ok(())
    }

    /// Release every number held by `client`.
    pub fn release_all_for_client(&mut self, client: ClientId) {
        if let Some(held) = self.clients.get_mut(&client) {
            self.allocated.remove_all(held);
            self.allocation_count -= held.len();
            held.clear();
        }
    }

    /// Clear the whole pool.
    pub fn reset(&mut self) {
        if !self.clients.is_empty() || self.allocation_count != 0 {
            tracing::error!(
                "Resetting sequence pool with {} clients attached and {} numbers outstanding",
                self.clients.len(),
                self.allocation_count
            );
        }
        self.allocated.clear();
        for held in self.clients.values_mut() {
            held.clear();
        }
        self.allocation_count = 0;
        self.last_seq_num = self.max;
    }

    #[inline]
    pub fn is_allocated(&self, seq: u8) -> bool {
        self.allocated.contains(seq)
    }

    /// Numbers held by `client`.
    pub fn held_by(&self, client: ClientId) -> Option<&SeqBitset> {
        self.clients.get(&client)
    }

    #[inline]
    pub fn allocation_count(&self) -> usize {
        self.allocation_count
    }

    #[inline]
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Size of the configured range.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.max as usize - self.min as usize + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_first_allocation_is_min() {
        let mut pool = SequencePool::new(1, 254);
        let c = pool.attach();
        assert_eq!(pool.allocate(c).unwrap(), 1);
        assert_eq!(pool.allocate(c).unwrap(), 2);
        assert_eq!(pool.allocation_count(), 2);
    }

    #[test]
    fn test_forward_scan_skips_released_number() {
        let mut pool = SequencePool::new(1, 10);
        let c = pool.attach();
        for _ in 0..5 {
            pool.allocate(c).unwrap();
        }
        pool.release(c, 2).unwrap();
        // Scan continues after the last number handed out.
        assert_eq!(pool.allocate(c).unwrap(), 6);
    }

    #[test]
    fn test_exhaustion_and_wraparound() {
        let mut pool = SequencePool::new(0, 255);
        let c = pool.attach();
        for expected in 0..=255u8 {
            assert_eq!(pool.allocate(c).unwrap(), expected);
        }
        let err = pool.allocate(c).unwrap_err();
        assert!(matches!(err, StpError::SequenceExhausted));
        assert_eq!(err.errno(), -11);

        pool.release(c, 100).unwrap();
        assert_eq!(pool.allocate(c).unwrap(), 100);
    }

    #[test]
    fn test_release_out_of_range() {
        let mut pool = SequencePool::new(1, 254);
        let c = pool.attach();
        assert!(matches!(
            pool.release(c, 0),
            Err(StpError::InvalidParameters(_))
        ));
        assert!(matches!(
            pool.release(c, 255),
            Err(StpError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_release_by_non_holder_keeps_bit() {
        let mut pool = SequencePool::new(1, 254);
        let a = pool.attach();
        let b = pool.attach();
        let seq = pool.allocate(a).unwrap();

        let err = pool.release(b, seq).unwrap_err();
        assert!(matches!(err, StpError::SequenceNotHeld(s) if s == seq));
        assert_eq!(err.errno(), -13);
        assert!(pool.is_allocated(seq));
        assert!(pool.held_by(a).unwrap().contains(seq));
    }

    #[test]
    fn test_release_twice() {
        let mut pool = SequencePool::new(1, 254);
        let c = pool.attach();
        let seq = pool.allocate(c).unwrap();
        pool.release(c, seq).unwrap();
        assert!(matches!(
            pool.release(c, seq),
            Err(StpError::SequenceNotHeld(_))
        ));
    }

    #[test]
    fn test_detach_releases_client_numbers() {
        let mut pool = SequencePool::new(1, 254);
        let a = pool.attach();
        let b = pool.attach();
        let sa = pool.allocate(a).unwrap();
        let sb = pool.allocate(b).unwrap();

        pool.detach(a);
        assert!(!pool.is_allocated(sa));
        assert!(pool.is_allocated(sb));
        assert_eq!(pool.allocation_count(), 1);
        assert_eq!(pool.client_count(), 1);
    }

    #[test]
    fn test_last_detach_resets_pool() {
        let mut pool = SequencePool::new(1, 254);
        let c = pool.attach();
        for _ in 0..3 {
            pool.allocate(c).unwrap();
        }
        pool.detach(c);

        let c = pool.attach();
        assert_eq!(pool.allocate(c).unwrap(), 1);
    }

    #[test]
    fn test_unknown_client() {
        let mut pool = SequencePool::new(1, 254);
        assert!(pool.allocate(42).is_err());
    }

    #[test]
    fn test_bitset_ops() {
        let mut a = SeqBitset::default();
        a.insert(0);
        a.insert(63);
        a.insert(64);
        a.insert(255);
        assert_eq!(a.len(), 4);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 63, 64, 255]);

        let mut b = SeqBitset::default();
        b.insert(63);
        b.insert(255);
        a.remove_all(&b);
        assert_eq!(a.iter().collect::<Vec<_>>(), vec![0, 64]);
    }

    proptest! {
        #[test]
        fn allocations_are_unique(ops in prop::collection::vec((0usize..3, any::<bool>()), 0..600)) {
            let mut pool = SequencePool::new(1, 254);
            let clients: Vec<_> = (0..3).map(|_| pool.attach()).collect();
            let mut held: Vec<Vec<u8>> = vec![Vec::new(); 3];

            for (who, alloc) in ops {
                if alloc || held[who].is_empty() {
                    if let Ok(seq) = pool.allocate(clients[who]) {
                        prop_assert!(held.iter().all(|h| !h.contains(&seq)));
                        held[who].push(seq);
                    }
                } else {
                    let seq = held[who].remove(0);
                    pool.release(clients[who], seq).unwrap();
                }

                let total: usize = held.iter().map(Vec::len).sum();
                prop_assert_eq!(pool.allocation_count(), total);
            }
        }
    }
}
