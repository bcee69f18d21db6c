//! Logical channels multiplexed over one link.
//!
//! A channel is available when both ends have it open:
//! - `controller_connected` is owned by this end (flipped by client open/close)
//! - `device_connected` mirrors the far end's last Open/Close notification
//!
//! Each channel owns a TX and an RX [`Pipeline`], a FIFO of notifications
//! waiting to be sent, a scheduling priority and two wake primitives used by
//! blocked readers and writers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Result, StpError};
use crate::pipeline::Pipeline;
use crate::protocol::Notification;

/// Default scheduling priority of a channel.
pub const DEFAULT_PRIORITY: u8 = 0;

/// Callbacks fired by the controller thread.
///
/// Implementations must not block; they run between two physical
/// transactions.
pub trait SignalHooks: Send + Sync {
    /// The far end opened `channel`.
    fn signal_open(&self, _channel: u8) {}

    /// Data arrived in the RX pipeline of `channel`.
    fn signal_read(&self, _channel: u8) {}

    /// TX space was freed on `channel`.
    fn signal_write(&self, _channel: u8) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHooks;

impl SignalHooks for NoopHooks {}

/// One logical channel.
#[derive(Debug)]
pub struct Channel {
    id: u8,
    priority: AtomicU8,
    tx: Pipeline,
    rx: Pipeline,
    device_connected: AtomicBool,
    controller_connected: AtomicBool,
    notifications: Mutex<VecDeque<Notification>>,
    /// Serializes local open/close against invalidation.
    transition: Mutex<()>,
    readable: Notify,
    writable: Notify,
}

impl Channel {
    /// Create a closed channel.
    pub fn new(id: u8) -> Self {
        Self {
            id,
            priority: AtomicU8::new(DEFAULT_PRIORITY),
            tx: Pipeline::new(),
            rx: Pipeline::new(),
            device_connected: AtomicBool::new(false),
            controller_connected: AtomicBool::new(false),
            notifications: Mutex::new(VecDeque::new()),
            transition: Mutex::new(()),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Higher values are scheduled first.
    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    #[inline]
    pub fn tx(&self) -> &Pipeline {
        &self.tx
    }

    #[inline]
    pub fn rx(&self) -> &Pipeline {
        &self.rx
    }

    #[inline]
    pub fn is_device_connected(&self) -> bool {
        self.device_connected.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_controller_connected(&self) -> bool {
        self.controller_connected.load(Ordering::Acquire)
    }

    /// Both ends have the channel open.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.is_controller_connected() && self.is_device_connected()
    }

    /// Open this end: allocate pipelines and announce the channel.
    pub fn open_local(&self, pipeline_capacity: usize) -> Result<()> {
        let _transition = self.transition.lock();
        if self
            .controller_connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(StpError::AlreadyOpen(self.id));
        }
        self.tx.init(pipeline_capacity);
        self.rx.init(pipeline_capacity);
        self.queue_notification(Notification::Open);
        Ok(())
    }

    /// Close this end: announce the close and release the pipelines.
    pub fn close_local(&self) -> Result<()> {
        let _transition = self.transition.lock();
        if !self.controller_connected.swap(false, Ordering::AcqRel) {
            return Err(StpError::AlreadyClosed(self.id));
        }
        self.queue_notification(Notification::Close);
        self.tx.destroy();
        self.rx.destroy();
        self.wake_all();
        Ok(())
    }

    /// Record an Open from the far end. Returns `true` on a transition.
    ///
    /// Pipelines are reset so a reconnected channel never sees bytes from the
    /// previous connection.
    pub fn remote_open(&self) -> bool {
        if self.device_connected.load(Ordering::Acquire) {
            return false;
        }
        self.tx.reset();
        self.rx.reset();
        self.device_connected.store(true, Ordering::Release);
        self.wake_all();
        true
    }

    /// Record a Close from the far end. Returns `true` on a transition.
    ///
    /// Unsent TX bytes are dropped; received bytes stay readable until the
    /// next reconnect.
    pub fn remote_close(&self) -> bool {
        if !self.device_connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        self.tx.reset();
        self.wake_all();
        true
    }

    /// Drop both connections, all buffered data and queued notifications.
    pub fn invalidate(&self) {
        let _transition = self.transition.lock();
        self.controller_connected.store(false, Ordering::Release);
        self.device_connected.store(false, Ordering::Release);
        self.tx.reset();
        self.rx.reset();
        self.notifications.lock().clear();
        self.wake_all();
    }

    /// Error state for client I/O, `Ok` when the channel is usable.
    pub fn check_rw_state(&self, synced: bool) -> Result<()> {
        if !synced {
            return Err(StpError::NotSynced);
        }
        if !self.is_controller_connected() {
            return Err(StpError::ControllerNotConnected(self.id));
        }
        if !self.is_device_connected() {
            return Err(StpError::DeviceNotConnected(self.id));
        }
        Ok(())
    }

    pub fn queue_notification(&self, notification: Notification) {
        self.notifications.lock().push_back(notification);
    }

    pub fn pop_notification(&self) -> Option<Notification> {
        self.notifications.lock().pop_front()
    }

    pub fn has_pending_notification(&self) -> bool {
        !self.notifications.lock().is_empty()
    }

    /// Wake primitive for readers.
    #[inline]
    pub fn readable(&self) -> &Notify {
        &self.readable
    }

    /// Wake primitive for writers.
    #[inline]
    pub fn writable(&self) -> &Notify {
        &self.writable
    }

    pub fn wake_readers(&self) {
        self.readable.notify_waiters();
    }

    pub fn wake_writers(&self) {
        self.writable.notify_waiters();
    }

    pub fn wake_all(&self) {
        self.wake_readers();
        self.wake_writers();
    }
}
