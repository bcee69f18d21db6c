//! Edge-triggered device signals.
//!
//! Two digital inputs drive the controller:
//! - **has data**: falling edge, wake capable. The device has something to send.
//! - **ready**: rising edge, not wake capable. The device can take the next
//!   transaction.
//!
//! Edge handlers only record a timestamp, set an atomic flag and wake the
//! controller. A has-data edge wakes an idle controller; a ready edge only
//! releases a controller gated on the device being ready. Everything else
//! happens on the controller thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;

/// Edge polarity of an input line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
}

/// One edge-triggered input line.
#[derive(Debug)]
pub struct IrqLine {
    name: &'static str,
    edge: Edge,
    wake_capable: bool,
    enabled: AtomicBool,
    wake_enabled: AtomicBool,
    level: AtomicBool,
    count: AtomicU64,
    /// Nanoseconds since `epoch` of the last accepted edge, 0 if none.
    last_edge_ns: AtomicU64,
    epoch: Instant,
}

impl IrqLine {
    /// Create an enabled line.
    pub fn new(name: &'static str, edge: Edge, wake_capable: bool) -> Self {
        Self {
            name,
            edge,
            wake_capable,
            enabled: AtomicBool::new(true),
            wake_enabled: AtomicBool::new(wake_capable),
            // Idle level is the one the active edge leaves from.
            level: AtomicBool::new(edge == Edge::Falling),
            count: AtomicU64::new(0),
            last_edge_ns: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn edge(&self) -> Edge {
        self.edge
    }

    #[inline]
    pub fn is_wake_capable(&self) -> bool {
        self.wake_capable
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_wake_enabled(&self) -> bool {
        self.wake_enabled.load(Ordering::Acquire)
    }

    /// Number of accepted edges.
    #[inline]
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Last sampled level.
    #[inline]
    pub fn level(&self) -> bool {
        self.level.load(Ordering::Acquire)
    }

    /// Time of the last accepted edge, relative to line creation.
    pub fn last_edge(&self) -> Option<Duration> {
        match self.last_edge_ns.load(Ordering::Acquire) {
            0 => None,
            ns => Some(Duration::from_nanos(ns)),
        }
    }

    /// Record an edge. Returns `false` if the line is disabled.
    pub fn fire(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        let ns = (self.epoch.elapsed().as_nanos() as u64).max(1);
        self.last_edge_ns.store(ns, Ordering::Release);
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Feed a level sample; fires when it forms this line's active edge.
    pub fn sample(&self, level: bool) -> bool {
        let previous = self.level.swap(level, Ordering::AcqRel);
        let active = match self.edge {
            Edge::Rising => !previous && level,
            Edge::Falling => previous && !level,
        };
        active && self.fire()
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
        if self.wake_capable {
            self.wake_enabled.store(true, Ordering::Release);
        }
    }

    pub fn disable(&self) {
        self.wake_enabled.store(false, Ordering::Release);
        self.enabled.store(false, Ordering::Release);
    }
}

/// Snapshot of one line for debug output.
#[derive(Debug, Clone, Serialize)]
pub struct IrqLineSnapshot {
    pub name: &'static str,
    pub edge: Edge,
    pub enabled: bool,
    pub level: bool,
    pub count: u64,
    pub last_edge_us: Option<u64>,
}

impl From<&IrqLine> for IrqLineSnapshot {
    fn from(line: &IrqLine) -> Self {
        Self {
            name: line.name(),
            edge: line.edge(),
            enabled: line.is_enabled(),
            level: line.level(),
            count: line.count(),
            last_edge_us: line.last_edge().map(|d| d.as_micros() as u64),
        }
    }
}

/// The has-data and ready lines of one link plus the controller wake-up.
#[derive(Debug)]
pub struct EdgeSignals {
    has_data_line: IrqLine,
    ready_line: IrqLine,
    has_data: AtomicBool,
    device_ready: AtomicBool,
    wake: Notify,
    ready: Notify,
}

impl EdgeSignals {
    /// Lines with the standard polarity. The device starts out ready.
    pub fn new() -> Self {
        Self {
            has_data_line: IrqLine::new("has_data", Edge::Falling, true),
            ready_line: IrqLine::new("ready", Edge::Rising, false),
            has_data: AtomicBool::new(false),
            device_ready: AtomicBool::new(true),
            wake: Notify::new(),
            ready: Notify::new(),
        }
    }

    /// Has-data edge handler.
    pub fn on_has_data(&self) {
        if self.has_data_line.fire() {
            self.has_data.store(true, Ordering::Release);
            self.wake.notify_one();
        }
    }

    /// Ready edge handler.
    pub fn on_device_ready(&self) {
        if self.ready_line.fire() {
            self.device_ready.store(true, Ordering::Release);
            self.ready.notify_one();
        }
    }

    /// Feed a level sample of the has-data line.
    pub fn sample_has_data(&self, level: bool) {
        if self.has_data_line.sample(level) {
            self.has_data.store(true, Ordering::Release);
            self.wake.notify_one();
        }
    }

    /// Feed a level sample of the ready line.
    pub fn sample_ready(&self, level: bool) {
        if self.ready_line.sample(level) {
            self.device_ready.store(true, Ordering::Release);
            self.ready.notify_one();
        }
    }

    /// Consume the has-data flag.
    #[inline]
    pub fn take_has_data(&self) -> bool {
        self.has_data.swap(false, Ordering::AcqRel)
    }

    /// Consume the ready flag.
    #[inline]
    pub fn take_device_ready(&self) -> bool {
        self.device_ready.swap(false, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_device_ready(&self) -> bool {
        self.device_ready.load(Ordering::Acquire)
    }

    /// Wake the controller without an edge (client activity, shutdown).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Wake primitive the controller waits on.
    #[inline]
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wake.notified()
    }

    /// Wake primitive of the ready edge.
    #[inline]
    pub fn ready_notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.ready.notified()
    }

    pub fn has_data_line(&self) -> &IrqLine {
        &self.has_data_line
    }

    pub fn ready_line(&self) -> &IrqLine {
        &self.ready_line
    }

    /// Disable both lines, the wake-capable one first.
    pub fn teardown(&self) {
        self.has_data_line.disable();
        self.ready_line.disable();
        tracing::debug!("Edge signals torn down");
    }
}

impl Default for EdgeSignals {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_polarity() {
        let has_data = IrqLine::new("has_data", Edge::Falling, true);
        assert!(has_data.level());
        assert!(!has_data.sample(true));
        assert!(has_data.sample(false));
        assert!(!has_data.sample(false));
        assert_eq!(has_data.count(), 1);

        let ready = IrqLine::new("ready", Edge::Rising, false);
        assert!(!ready.sample(false));
        assert!(ready.sample(true));
        assert!(!ready.sample(true));
        assert!(!ready.sample(false));
        assert_eq!(ready.count(), 1);
        assert!(ready.last_edge().is_some());
    }

    #[test]
    fn test_disabled_line_ignores_edges() {
        let line = IrqLine::new("ready", Edge::Rising, false);
        line.disable();
        assert!(!line.fire());
        assert_eq!(line.count(), 0);
        assert!(line.last_edge().is_none());

        line.enable();
        assert!(line.fire());
    }

    #[test]
    fn test_wake_enable_follows_capability() {
        let wake = IrqLine::new("has_data", Edge::Falling, true);
        let plain = IrqLine::new("ready", Edge::Rising, false);
        assert!(wake.is_wake_enabled());
        assert!(!plain.is_wake_enabled());

        wake.disable();
        assert!(!wake.is_wake_enabled());
        wake.enable();
        assert!(wake.is_wake_enabled());
    }

    #[test]
    fn test_flags_are_consumed() {
        let signals = EdgeSignals::new();
        assert!(signals.take_device_ready());
        assert!(!signals.take_device_ready());

        signals.on_has_data();
        assert!(signals.take_has_data());
        assert!(!signals.take_has_data());
    }

    #[test]
    fn test_teardown_disables_lines() {
        let signals = EdgeSignals::new();
        signals.teardown();
        assert!(!signals.has_data_line().is_enabled());
        assert!(!signals.has_data_line().is_wake_enabled());
        assert!(!signals.ready_line().is_enabled());

        signals.on_has_data();
        assert!(!signals.take_has_data());
    }

    #[tokio::test]
    async fn test_ready_edge_does_not_wake_idle_controller() {
        let signals = EdgeSignals::new();
        signals.sample_ready(false);
        signals.sample_ready(true);
        assert!(signals.is_device_ready());

        tokio::time::timeout(Duration::from_secs(1), signals.ready_notified())
            .await
            .unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(10), signals.notified())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_edge_wakes_waiter() {
        let signals = std::sync::Arc::new(EdgeSignals::new());
        let waiter = {
            let signals = signals.clone();
            tokio::spawn(async move { signals.notified().await })
        };
        tokio::task::yield_now().await;
        signals.sample_has_data(false);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
