//! Per-link context shared by the controller thread and client handles.
//!
//! There is one [`LinkContext`] per physical link; nothing is global. The
//! controller thread is the only writer of protocol state. Clients touch the
//! channel open flags, the pipelines (through their own locks), the sequence
//! pool and the wake primitive.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::channel::{Channel, NoopHooks, SignalHooks};
use crate::config::LinkConfig;
use crate::error::{Result, StpError};
use crate::history::{HistorySummary, RxHistory};
use crate::sequence::SequencePool;
use crate::signal::{EdgeSignals, IrqLineSnapshot};
use crate::stats::{LinkStats, StatsSnapshot};

/// Capacity of the link event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Link-level events delivered to channel handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Handshake completed.
    Synced,
    /// Link dropped back to unsynced; every channel was invalidated.
    Desynced,
    /// The far end opened a channel.
    Opened(u8),
    /// The far end closed a channel.
    Closed(u8),
    /// Application notification on a channel.
    Notify { channel: u8, code: u8 },
}

/// Shared state of one link.
pub struct LinkContext {
    pub(crate) config: LinkConfig,
    pub(crate) channels: Box<[Channel]>,
    pub(crate) stats: LinkStats,
    pub(crate) signals: Arc<EdgeSignals>,
    pub(crate) sequences: Mutex<SequencePool>,
    pub(crate) history: Mutex<RxHistory>,
    pub(crate) hooks: Arc<dyn SignalHooks>,
    events: broadcast::Sender<LinkEvent>,
    synced: AtomicBool,
    session: AtomicU32,
    suspended: AtomicBool,
    stopped: AtomicBool,
    disconnect_requested: AtomicBool,
    started: Instant,
}

impl LinkContext {
    /// Build a context for a validated configuration.
    pub fn new(
        config: LinkConfig,
        signals: Arc<EdgeSignals>,
        hooks: Option<Arc<dyn SignalHooks>>,
    ) -> Self {
        let channels = (0..config.channel_count).map(Channel::new).collect();
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sequences: Mutex::new(SequencePool::new(config.seq_num_min, config.seq_num_max)),
            history: Mutex::new(RxHistory::new(config.history_depth)),
            hooks: hooks.unwrap_or_else(|| Arc::new(NoopHooks)),
            channels,
            stats: LinkStats::default(),
            signals,
            events,
            synced: AtomicBool::new(false),
            session: AtomicU32::new(0),
            suspended: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            disconnect_requested: AtomicBool::new(false),
            started: Instant::now(),
            config,
        }
    }

    #[inline]
    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// Sequence number pool, locked for inspection.
    pub fn sequence_pool(&self) -> MutexGuard<'_, SequencePool> {
        self.sequences.lock()
    }

    /// Channel by id.
    pub fn channel(&self, id: u8) -> Result<&Channel> {
        self.channels.get(id as usize).ok_or_else(|| {
            StpError::InvalidParameters(format!(
                "channel {} out of range 0..{}",
                id,
                self.channels.len()
            ))
        })
    }

    #[inline]
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    #[inline]
    pub fn signals(&self) -> &Arc<EdgeSignals> {
        &self.signals
    }

    #[inline]
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    pub(crate) fn set_synced(&self, synced: bool) {
        self.synced.store(synced, Ordering::Release);
    }

    /// Epoch counter, bumped on every desync.
    #[inline]
    pub fn session(&self) -> u32 {
        self.session.load(Ordering::Acquire)
    }

    pub(crate) fn next_session(&self) -> u32 {
        self.session.fetch_add(1, Ordering::AcqRel).wrapping_add(1)
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    pub(crate) fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
        self.signals.wake();
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Ask the controller to exit and fail every blocked client.
    pub(crate) fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.signals.wake();
            for ch in self.channels.iter() {
                ch.wake_all();
            }
        }
    }

    pub(crate) fn request_disconnect(&self) {
        self.disconnect_requested.store(true, Ordering::Release);
        self.signals.wake();
    }

    pub(crate) fn take_disconnect_request(&self) -> bool {
        self.disconnect_requested.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn emit(&self, event: LinkEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Counters plus IRQ line counts.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snap = self.stats.snapshot();
        snap.has_data_irqs = self.signals.has_data_line().count();
        snap.ready_irqs = self.signals.ready_line().count();
        snap
    }

    /// Full diagnostic state.
    pub fn debug_snapshot(&self) -> DebugSnapshot {
        DebugSnapshot {
            synced: self.is_synced(),
            suspended: self.is_suspended(),
            session: self.session(),
            stats: self.stats(),
            channels: self
                .channels
                .iter()
                .map(|ch| ChannelSnapshot {
                    id: ch.id(),
                    priority: ch.priority(),
                    controller_connected: ch.is_controller_connected(),
                    device_connected: ch.is_device_connected(),
                    tx_pending: ch.tx().get_data_size(),
                    rx_pending: ch.rx().get_data_size(),
                    tx_filled_pct: ch.tx().get_percentage_filled(),
                    rx_filled_pct: ch.rx().get_percentage_filled(),
                })
                .collect(),
            sequence_numbers_allocated: self.sequences.lock().allocation_count(),
            irq_lines: vec![
                IrqLineSnapshot::from(self.signals.has_data_line()),
                IrqLineSnapshot::from(self.signals.ready_line()),
            ],
            rx_history: self.history.lock().summarize(self.started),
        }
    }
}

/// Per-channel part of [`DebugSnapshot`].
#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub id: u8,
    pub priority: u8,
    pub controller_connected: bool,
    pub device_connected: bool,
    pub tx_pending: usize,
    pub rx_pending: usize,
    pub tx_filled_pct: u32,
    pub rx_filled_pct: u32,
}

/// Everything `Link::debug_json` reports.
#[derive(Debug, Clone, Serialize)]
pub struct DebugSnapshot {
    pub synced: bool,
    pub suspended: bool,
    pub session: u32,
    pub stats: StatsSnapshot,
    pub channels: Vec<ChannelSnapshot>,
    pub sequence_numbers_allocated: usize,
    pub irq_lines: Vec<IrqLineSnapshot>,
    pub rx_history: Vec<HistorySummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> LinkContext {
        let config = LinkConfig {
            channel_count: 4,
            ..LinkConfig::default()
        };
        LinkContext::new(config, Arc::new(EdgeSignals::new()), None)
    }

    #[test]
    fn test_channel_lookup() {
        let ctx = context();
        assert_eq!(ctx.channels().len(), 4);
        assert_eq!(ctx.channel(3).unwrap().id(), 3);
        assert!(matches!(
            ctx.channel(4),
            Err(StpError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_session_increments() {
        let ctx = context();
        assert_eq!(ctx.session(), 0);
        assert_eq!(ctx.next_session(), 1);
        assert_eq!(ctx.session(), 1);
    }

    #[test]
    fn test_disconnect_request_consumed_once() {
        let ctx = context();
        ctx.request_disconnect();
        assert!(ctx.take_disconnect_request());
        assert!(!ctx.take_disconnect_request());
    }

    #[test]
    fn test_debug_snapshot_serializes() {
        let ctx = context();
        let json = serde_json::to_value(ctx.debug_snapshot()).unwrap();
        assert_eq!(json["synced"], false);
        assert_eq!(json["channels"].as_array().unwrap().len(), 4);
        assert_eq!(json["irq_lines"][0]["name"], "has_data");
    }

    #[tokio::test]
    async fn test_events_reach_subscribers() {
        let ctx = context();
        let mut rx = ctx.subscribe();
        ctx.emit(LinkEvent::Opened(2));
        assert_eq!(rx.recv().await.unwrap(), LinkEvent::Opened(2));
    }
}
