//! Link builder and client channel handles.
//!
//! The [`LinkBuilder`] provides a fluent API for configuring a link and
//! starting its controller thread. The [`Link`] manages the lifecycle:
//! 1. Validate configuration and build the shared context
//! 2. Spawn the controller thread over the SPI transport
//! 3. Hand out [`ChannelHandle`]s once the handshake completed
//! 4. Stop the thread on shutdown or drop
//!
//! # Example
//!
//! ```ignore
//! use stp_link::{LinkBuilder, LinkConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = LinkBuilder::new()
//!         .config(LinkConfig::from_json(r#"{"transaction_length": 256}"#)?)
//!         .idle_poll(std::time::Duration::from_millis(5))
//!         .build(my_spi_transport)?;
//!
//!     link.wait_synced(std::time::Duration::from_secs(1)).await?;
//!     let chan = link.open(5)?;
//!     chan.wait_connected().await?;
//!     chan.write(b"hello").await?;
//!
//!     link.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};

use crate::channel::{Channel, SignalHooks};
use crate::config::LinkConfig;
use crate::context::{DebugSnapshot, LinkContext, LinkEvent};
use crate::controller::{Controller, LinkState};
use crate::error::{Result, StpError};
use crate::protocol::Notification;
use crate::sequence::ClientId;
use crate::signal::EdgeSignals;
use crate::stats::StatsSnapshot;
use crate::transport::SpiTransport;
use crate::worker::{
    spawn_controller_thread, ControllerThread, WorkerRequest, DEFAULT_REQUEST_CAPACITY,
};

/// Most event type codes a [`StreamFilter`] can select.
pub const MAX_STREAM_FILTER_TYPES: usize = 16;

/// Command codes accepted by [`ChannelHandle::ioctl`].
pub mod ioctl {
    /// Allocate a sequence number; returns it.
    pub const ALLOCATE_SEQ: u32 = 0x5301;
    /// Release the sequence number given as argument.
    pub const RELEASE_SEQ: u32 = 0x5302;
    /// Set the channel's data priority to the argument.
    pub const SET_PRIORITY: u32 = 0x5303;
    /// Bytes waiting in the channel's RX pipeline.
    pub const RX_PENDING: u32 = 0x5304;
}

/// Builder for configuring and starting a link.
pub struct LinkBuilder {
    config: LinkConfig,
    signals: Option<Arc<EdgeSignals>>,
    hooks: Option<Arc<dyn SignalHooks>>,
    request_capacity: usize,
}

impl LinkBuilder {
    /// Builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: LinkConfig::default(),
            signals: None,
            hooks: None,
            request_capacity: DEFAULT_REQUEST_CAPACITY,
        }
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: LinkConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transaction_length(mut self, len: usize) -> Self {
        self.config.transaction_length = len;
        self
    }

    pub fn channel_count(mut self, count: u8) -> Self {
        self.config.channel_count = count;
        self
    }

    pub fn pipeline_capacity(mut self, capacity: usize) -> Self {
        self.config.pipeline_capacity = capacity;
        self
    }

    /// Consecutive bad transactions tolerated before resyncing.
    pub fn bad_crc_threshold(mut self, threshold: u32) -> Self {
        self.config.bad_crc_threshold = threshold;
        self
    }

    pub fn history_depth(mut self, depth: usize) -> Self {
        self.config.history_depth = depth;
        self
    }

    pub fn use_fastpath(mut self, enabled: bool) -> Self {
        self.config.use_fastpath = enabled;
        self
    }

    pub fn wait_for_device_ready(mut self, enabled: bool) -> Self {
        self.config.wait_for_device_ready = enabled;
        self
    }

    /// Controller poll period while the link is idle.
    pub fn idle_poll(mut self, period: Duration) -> Self {
        self.config.idle_poll_ms = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Default timeout of blocking channel calls.
    pub fn io_timeout(mut self, timeout: Duration) -> Self {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.config.io_timeout_ms = Some(ms);
        self
    }

    pub fn speed_hz(mut self, speed: u32) -> Self {
        self.config.speed_hz = speed;
        self
    }

    /// Inclusive range of the sequence number pool.
    pub fn seq_num_range(mut self, min: u8, max: u8) -> Self {
        self.config.seq_num_min = min;
        self.config.seq_num_max = max;
        self
    }

    /// Edge signals fed by the platform's GPIO handlers.
    pub fn signals(mut self, signals: Arc<EdgeSignals>) -> Self {
        self.signals = Some(signals);
        self
    }

    /// Open/read/write callbacks fired by the controller.
    pub fn hooks(mut self, hooks: Arc<dyn SignalHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Capacity of the raw-transfer request queue.
    pub fn request_capacity(mut self, capacity: usize) -> Self {
        self.request_capacity = capacity.max(1);
        self
    }

    fn context(self) -> Result<(Arc<LinkContext>, usize)> {
        self.config.validate()?;
        let signals = self.signals.unwrap_or_default();
        let ctx = Arc::new(LinkContext::new(self.config, signals, self.hooks));
        Ok((ctx, self.request_capacity))
    }

    /// Start a link driving `transport` from a dedicated controller thread.
    pub fn build<T>(self, transport: T) -> Result<Link>
    where
        T: SpiTransport + 'static,
    {
        let (ctx, capacity) = self.context()?;
        let (tx, rx) = mpsc::channel(capacity);
        let task = spawn_controller_thread(Controller::new(ctx.clone()), transport, rx)?;
        tracing::debug!(
            "Link started: {} channels, {} byte transactions",
            ctx.channels().len(),
            ctx.config().transaction_length
        );

        Ok(Link {
            ctx,
            requests: Some(tx),
            task: Some(task),
        })
    }

    /// Build the passive end of a link.
    ///
    /// The returned controller answers transfers driven by the other end (for
    /// example through [`LoopbackTransport`](crate::transport::LoopbackTransport));
    /// the [`Link`] gives clients access to its channels.
    pub fn build_peer(self) -> Result<(Link, Controller)> {
        let (ctx, _) = self.context()?;
        let controller = Controller::new(ctx.clone());
        let link = Link {
            ctx,
            requests: None,
            task: None,
        };
        Ok((link, controller))
    }
}

impl Default for LinkBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running link.
///
/// Dropping the link stops its controller thread; outstanding channel handles
/// then fail with [`StpError::LinkStopped`].
pub struct Link {
    ctx: Arc<LinkContext>,
    requests: Option<mpsc::Sender<WorkerRequest>>,
    task: Option<ControllerThread>,
}

impl Link {
    /// Create a new link builder.
    pub fn builder() -> LinkBuilder {
        LinkBuilder::new()
    }

    /// Open channel `id` on this end.
    ///
    /// The far end sees the open with the next control transaction; use
    /// [`ChannelHandle::wait_connected`] to wait for it to open as well.
    pub fn open(&self, id: u8) -> Result<ChannelHandle> {
        if self.ctx.is_stopped() {
            return Err(StpError::LinkStopped);
        }
        let ch = self.ctx.channel(id)?;
        if !self.ctx.is_synced() {
            return Err(StpError::NotSynced);
        }

        let before = self.ctx.session();
        ch.open_local(self.ctx.config().pipeline_capacity)?;

        // A desync racing the open leaves the channel in an epoch the handle
        // would not match.
        let session = self.ctx.session();
        if session != before || !self.ctx.is_synced() || !ch.is_controller_connected() {
            let _ = ch.close_local();
            tracing::debug!("Channel {} open raced a desync, rolled back", id);
            return Err(StpError::NotSynced);
        }

        let client = self.ctx.sequences.lock().attach();
        self.ctx.signals().wake();
        tracing::debug!("Channel {} opened locally (session {})", id, session);

        Ok(ChannelHandle {
            events: self.ctx.subscribe(),
            timeout: self.ctx.config().io_timeout(),
            filter: StreamFilter::default(),
            ctx: self.ctx.clone(),
            id,
            session,
            client,
            closed: false,
        })
    }

    #[inline]
    pub fn is_synced(&self) -> bool {
        self.ctx.is_synced()
    }

    pub fn state(&self) -> LinkState {
        if self.ctx.is_synced() {
            LinkState::Synced
        } else {
            LinkState::Unsynced
        }
    }

    /// Current link epoch.
    #[inline]
    pub fn session(&self) -> u32 {
        self.ctx.session()
    }

    /// Wait until the handshake completes.
    pub async fn wait_synced(&self, timeout: Duration) -> Result<()> {
        let mut events = self.ctx.subscribe();
        let idle = self.ctx.config().idle_poll();
        let wait = async {
            loop {
                if self.ctx.is_synced() {
                    return Ok(());
                }
                if self.ctx.is_stopped() {
                    return Err(StpError::LinkStopped);
                }
                tokio::select! {
                    event = events.recv() => {
                        if let Err(broadcast::error::RecvError::Closed) = event {
                            return Err(StpError::LinkStopped);
                        }
                    }
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StpError::Timeout)?
    }

    /// Counter snapshot.
    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats()
    }

    pub fn debug_snapshot(&self) -> DebugSnapshot {
        self.ctx.debug_snapshot()
    }

    /// Debug state as pretty-printed JSON.
    pub fn debug_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.ctx.debug_snapshot())?)
    }

    /// Park the controller. Pipelines and sequence numbers are kept.
    pub fn suspend(&self) {
        tracing::info!("Link suspended");
        self.ctx.set_suspended(true);
    }

    pub fn resume(&self) {
        tracing::info!("Link resumed");
        self.ctx.set_suspended(false);
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.ctx.is_suspended()
    }

    /// Tell the peer we are going away and drop back to unsynced.
    pub fn disconnect(&self) {
        self.ctx.request_disconnect();
    }

    /// Full-duplex transfer of `tx` outside STP framing.
    ///
    /// Only allowed while the link is suspended.
    pub async fn raw_transfer(&self, tx: Vec<u8>) -> Result<Vec<u8>> {
        let requests = self.requests.as_ref().ok_or_else(|| {
            StpError::InvalidParameters("passive link has no transport".to_string())
        })?;
        if !self.ctx.is_suspended() {
            return Err(StpError::InvalidParameters(
                "raw transfers need a suspended link".to_string(),
            ));
        }

        let (reply, rx) = oneshot::channel();
        requests
            .send(WorkerRequest::RawTransfer { tx, reply })
            .await
            .map_err(|_| StpError::LinkStopped)?;
        rx.await.map_err(|_| StpError::LinkStopped)?
    }

    /// Set the data priority of channel `id`.
    pub fn set_priority(&self, id: u8, priority: u8) -> Result<()> {
        self.ctx.channel(id)?.set_priority(priority);
        Ok(())
    }

    /// Edge signals of this link, for wiring GPIO handlers.
    #[inline]
    pub fn signals(&self) -> &Arc<EdgeSignals> {
        self.ctx.signals()
    }

    #[inline]
    pub fn context(&self) -> &Arc<LinkContext> {
        &self.ctx
    }

    /// Subscribe to every link event, unfiltered.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.ctx.subscribe()
    }

    /// Stop the controller thread and wait for it to exit.
    ///
    /// Returns the error that stopped the controller, if any.
    pub async fn shutdown(mut self) -> Result<()> {
        self.ctx.stop();
        self.requests.take();
        match self.task.take() {
            Some(task) => task.join().await,
            None => Ok(()),
        }
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.ctx.stop();
    }
}

/// Event type codes a channel handle wants to see.
///
/// An empty filter delivers every notification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamFilter {
    types: Vec<u8>,
}

impl StreamFilter {
    /// Filter selecting `types`; at most [`MAX_STREAM_FILTER_TYPES`] codes.
    pub fn new(types: &[u8]) -> Result<Self> {
        if types.len() > MAX_STREAM_FILTER_TYPES {
            return Err(StpError::InvalidParameters(format!(
                "{} stream types, at most {} allowed",
                types.len(),
                MAX_STREAM_FILTER_TYPES
            )));
        }
        let mut types = types.to_vec();
        types.sort_unstable();
        types.dedup();
        Ok(Self { types })
    }

    /// Filter delivering everything.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn allows(&self, code: u8) -> bool {
        self.types.is_empty() || self.types.binary_search(&code).is_ok()
    }

    pub fn types(&self) -> &[u8] {
        &self.types
    }
}

/// Client access to one open channel.
///
/// Dropping the handle closes the channel and releases every sequence number
/// it still holds.
pub struct ChannelHandle {
    ctx: Arc<LinkContext>,
    id: u8,
    session: u32,
    client: ClientId,
    filter: StreamFilter,
    events: broadcast::Receiver<LinkEvent>,
    timeout: Option<Duration>,
    closed: bool,
}

impl ChannelHandle {
    #[inline]
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Link epoch this handle was opened in.
    #[inline]
    pub fn session(&self) -> u32 {
        self.session
    }

    fn channel(&self) -> &Channel {
        &self.ctx.channels()[self.id as usize]
    }

    fn check_session(&self) -> Result<()> {
        if self.ctx.is_stopped() {
            return Err(StpError::LinkStopped);
        }
        if self.ctx.session() != self.session {
            return Err(StpError::InvalidSession(self.id));
        }
        Ok(())
    }

    /// Both ends have the channel open.
    pub fn is_connected(&self) -> bool {
        self.check_session().is_ok() && self.channel().is_available()
    }

    /// Read whatever is buffered, without waiting.
    ///
    /// Bytes received before the peer closed stay readable. An empty `buf`
    /// only reports the channel's error state.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<usize> {
        self.check_session()?;
        let ch = self.channel();
        if buf.is_empty() {
            return ch.check_rw_state(self.ctx.is_synced()).map(|()| 0);
        }

        if ch.is_controller_connected() {
            let n = ch.rx().get_data_nb(buf);
            if n > 0 {
                // Freed RX space may change our advertised status.
                self.ctx.signals().wake();
                return Ok(n);
            }
        }
        ch.check_rw_state(self.ctx.is_synced())?;
        Err(StpError::RxDataUnavailable(self.id))
    }

    /// Read at least one byte, waiting for data.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return self.try_read(buf);
        }
        self.wait(self.channel().readable(), || backpressure(self.try_read(buf)))
            .await
    }

    /// Fill `buf` completely.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(&mut buf[filled..]).await?;
            filled += n;
        }
        Ok(())
    }

    /// Queue as much of `data` as fits, without waiting.
    pub fn try_write(&self, data: &[u8]) -> Result<usize> {
        self.check_session()?;
        let ch = self.channel();
        ch.check_rw_state(self.ctx.is_synced())?;
        if data.is_empty() {
            return Ok(0);
        }

        let n = ch.tx().add_data_nb(data);
        if n == 0 {
            return Err(StpError::TxSpaceUnavailable(self.id));
        }
        self.ctx.signals().wake();
        Ok(n)
    }

    /// Queue all of `data`, waiting for TX space as needed.
    pub async fn write(&self, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return self.try_write(data);
        }
        let mut written = 0;
        while written < data.len() {
            let rest = &data[written..];
            let n = self
                .wait(self.channel().writable(), || {
                    backpressure(self.try_write(rest))
                })
                .await?;
            written += n;
        }
        Ok(written)
    }

    /// Wait until the far end has opened the channel too.
    pub async fn wait_connected(&self) -> Result<()> {
        self.wait(self.channel().readable(), || {
            self.check_session()?;
            let ch = self.channel();
            if ch.is_available() {
                Ok(Some(()))
            } else if !ch.is_controller_connected() {
                Err(StpError::ControllerNotConnected(self.id))
            } else {
                Ok(None)
            }
        })
        .await
    }

    /// Send an application notification to the far end.
    pub fn notify(&self, code: u8) -> Result<()> {
        self.check_session()?;
        let ch = self.channel();
        ch.check_rw_state(self.ctx.is_synced())?;
        ch.queue_notification(Notification::Notify(code));
        self.ctx.signals().wake();
        Ok(())
    }

    pub fn set_priority(&self, priority: u8) -> Result<()> {
        self.check_session()?;
        self.channel().set_priority(priority);
        Ok(())
    }

    /// Timeout for blocking calls; `None` waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Allocate a sequence number for this client.
    pub fn allocate_seq(&self) -> Result<u8> {
        let seq = self.ctx.sequences.lock().allocate(self.client)?;
        tracing::trace!("Channel {} allocated sequence number {}", self.id, seq);
        Ok(seq)
    }

    /// Release a sequence number held by this client.
    pub fn release_seq(&self, seq: u8) -> Result<()> {
        self.ctx.sequences.lock().release(self.client, seq)
    }

    /// Numeric command interface; see [`ioctl`] for the codes.
    pub fn ioctl(&self, cmd: u32, arg: u32) -> Result<u32> {
        match cmd {
            ioctl::ALLOCATE_SEQ => self.allocate_seq().map(u32::from),
            ioctl::RELEASE_SEQ => {
                let seq = u8::try_from(arg).map_err(|_| {
                    StpError::InvalidParameters(format!("sequence number {} out of range", arg))
                })?;
                self.release_seq(seq).map(|()| 0)
            }
            ioctl::SET_PRIORITY => {
                let priority = u8::try_from(arg).map_err(|_| {
                    StpError::InvalidParameters(format!("priority {} out of range", arg))
                })?;
                self.set_priority(priority).map(|()| 0)
            }
            ioctl::RX_PENDING => Ok(self.channel().rx().get_data_size() as u32),
            other => Err(StpError::InvalidCommand(other)),
        }
    }

    /// Restrict which notification codes [`next_event`](Self::next_event)
    /// delivers.
    pub fn set_event_filter(&mut self, filter: StreamFilter) {
        self.filter = filter;
    }

    /// Next link event for this channel that passes the filter.
    pub async fn next_event(&mut self) -> Result<LinkEvent> {
        let ctx = self.ctx.clone();
        let id = self.id;
        let timeout = self.timeout;
        let filter = &self.filter;
        let events = &mut self.events;

        let wait = async move {
            let ch = &ctx.channels()[id as usize];
            loop {
                if ctx.is_stopped() {
                    return Err(StpError::LinkStopped);
                }
                // Stop wakes channel waiters, not event subscribers.
                let stopped = ch.readable().notified();
                tokio::pin!(stopped);
                stopped.as_mut().enable();

                tokio::select! {
                    biased;
                    event = events.recv() => match event {
                        Ok(event) if delivers(id, filter, &event) => return Ok(event),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Channel {} missed {} link events", id, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(StpError::LinkStopped);
                        }
                    },
                    _ = &mut stopped => {}
                }
            }
        };
        with_timeout(timeout, wait).await
    }

    /// Close this end of the channel.
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        {
            let mut pool = self.ctx.sequences.lock();
            pool.release_all_for_client(self.client);
            pool.detach(self.client);
        }

        // After a resync the channel was already invalidated, and may belong
        // to a newer handle.
        if self.ctx.session() != self.session {
            return Ok(());
        }
        self.channel().close_local()?;
        self.ctx.signals().wake();
        tracing::debug!("Channel {} closed locally", self.id);
        Ok(())
    }

    /// Run `attempt` until it yields a value, sleeping on `notify` between
    /// attempts.
    async fn wait<R>(
        &self,
        notify: &tokio::sync::Notify,
        mut attempt: impl FnMut() -> Result<Option<R>>,
    ) -> Result<R> {
        let wait = async {
            loop {
                let notified = notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(value) = attempt()? {
                    return Ok(value);
                }
                notified.await;
            }
        };
        with_timeout(self.timeout, wait).await
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            tracing::debug!("Channel {} close on drop: {}", self.id, e);
        }
    }
}

/// Whether a handle on channel `id` with `filter` sees `event`.
fn delivers(id: u8, filter: &StreamFilter, event: &LinkEvent) -> bool {
    match *event {
        LinkEvent::Synced | LinkEvent::Desynced => true,
        LinkEvent::Opened(channel) | LinkEvent::Closed(channel) => channel == id,
        LinkEvent::Notify { channel, code } => channel == id && filter.allows(code),
    }
}

/// Turn backpressure into "not yet".
fn backpressure<R>(result: Result<R>) -> Result<Option<R>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_backpressure() => Ok(None),
        Err(e) => Err(e),
    }
}

async fn with_timeout<R>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<R>>,
) -> Result<R> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| StpError::Timeout)?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn builder() -> LinkBuilder {
        LinkBuilder::new()
            .transaction_length(64)
            .channel_count(8)
            .pipeline_capacity(1024)
            .idle_poll(Duration::from_millis(1))
            .wait_for_device_ready(false)
    }

    async fn pair() -> (Link, Link) {
        let (peer, device) = builder().build_peer().unwrap();
        let link = builder().build(LoopbackTransport::new(device)).unwrap();
        link.wait_synced(Duration::from_secs(5)).await.unwrap();
        (link, peer)
    }

    #[test]
    fn test_builder_configuration() {
        let builder = Link::builder()
            .transaction_length(128)
            .bad_crc_threshold(4)
            .seq_num_range(0, 255)
            .io_timeout(Duration::from_millis(250))
            .request_capacity(0);

        assert_eq!(builder.config.transaction_length, 128);
        assert_eq!(builder.config.bad_crc_threshold, 4);
        assert_eq!(builder.config.seq_num_min, 0);
        assert_eq!(builder.config.seq_num_max, 255);
        assert_eq!(builder.config.io_timeout_ms, Some(250));
        assert_eq!(builder.request_capacity, 1);

        let saturated = Link::builder().io_timeout(Duration::MAX);
        assert_eq!(saturated.config.io_timeout_ms, Some(u64::MAX));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let result = LinkBuilder::new().transaction_length(8).build_peer();
        assert!(matches!(result, Err(StpError::InvalidParameters(_))));
    }

    #[test]
    fn test_stream_filter() {
        let all = StreamFilter::all();
        assert!(all.allows(0));
        assert!(all.allows(255));

        let some = StreamFilter::new(&[7, 3, 7]).unwrap();
        assert_eq!(some.types(), &[3, 7]);
        assert!(some.allows(3));
        assert!(!some.allows(4));

        let too_many: Vec<u8> = (0..17).collect();
        assert!(matches!(
            StreamFilter::new(&too_many),
            Err(StpError::InvalidParameters(_))
        ));
    }

    #[test]
    fn test_open_requires_sync() {
        let (peer, _device) = builder().build_peer().unwrap();
        assert!(matches!(peer.open(0), Err(StpError::NotSynced)));
        assert!(matches!(
            peer.open(8),
            Err(StpError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn test_open_twice_fails() {
        let (link, _peer) = pair().await;
        let _chan = link.open(1).unwrap();
        assert!(matches!(link.open(1), Err(StpError::AlreadyOpen(1))));
    }

    #[tokio::test]
    async fn test_io_before_peer_opens() {
        let (link, _peer) = pair().await;
        let chan = link.open(2).unwrap();

        assert!(matches!(
            chan.try_write(b"x"),
            Err(StpError::DeviceNotConnected(2))
        ));
        assert!(matches!(
            chan.try_read(&mut [0u8; 4]),
            Err(StpError::DeviceNotConnected(2))
        ));
        assert!(matches!(
            chan.try_read(&mut []),
            Err(StpError::DeviceNotConnected(2))
        ));
    }

    #[tokio::test]
    async fn test_read_write_across_link() {
        let (link, peer) = pair().await;
        let a = link.open(3).unwrap();
        let b = peer.open(3).unwrap();
        a.wait_connected().await.unwrap();
        b.wait_connected().await.unwrap();

        assert_eq!(a.write(b"ping").await.unwrap(), 4);
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        assert_eq!(b.write(b"pong").await.unwrap(), 4);
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_read_times_out() {
        let (link, peer) = pair().await;
        let mut a = link.open(4).unwrap();
        let _b = peer.open(4).unwrap();
        a.wait_connected().await.unwrap();

        a.set_timeout(Some(Duration::from_millis(20)));
        let mut buf = [0u8; 8];
        assert!(matches!(a.read(&mut buf).await, Err(StpError::Timeout)));
    }

    #[tokio::test]
    async fn test_ioctl_commands() {
        let (link, _peer) = pair().await;
        let chan = link.open(0).unwrap();

        let seq = chan.ioctl(ioctl::ALLOCATE_SEQ, 0).unwrap();
        assert_eq!(chan.ioctl(ioctl::RELEASE_SEQ, seq).unwrap(), 0);
        assert!(matches!(
            chan.ioctl(ioctl::RELEASE_SEQ, seq),
            Err(StpError::SequenceNotHeld(_))
        ));
        assert!(matches!(
            chan.ioctl(ioctl::RELEASE_SEQ, 300),
            Err(StpError::InvalidParameters(_))
        ));
        assert_eq!(chan.ioctl(ioctl::SET_PRIORITY, 9).unwrap(), 0);
        assert_eq!(link.context().channel(0).unwrap().priority(), 9);
        assert_eq!(chan.ioctl(ioctl::RX_PENDING, 0).unwrap(), 0);
        assert!(matches!(
            chan.ioctl(0xdead, 0),
            Err(StpError::InvalidCommand(0xdead))
        ));
    }

    #[tokio::test]
    async fn test_drop_releases_sequences_and_closes() {
        let (link, _peer) = pair().await;
        let chan = link.open(6).unwrap();
        chan.allocate_seq().unwrap();
        chan.allocate_seq().unwrap();
        assert_eq!(link.context().sequences.lock().allocation_count(), 2);

        drop(chan);
        assert_eq!(link.context().sequences.lock().allocation_count(), 0);
        assert!(!link.context().channel(6).unwrap().is_controller_connected());
        // Reopening works once closed.
        let _again = link.open(6).unwrap();
    }

    #[tokio::test]
    async fn test_stale_handle_cannot_change_priority() {
        let (link, _peer) = pair().await;
        let chan = link.open(5).unwrap();
        chan.set_priority(2).unwrap();

        let session = link.session();
        link.disconnect();
        tokio::time::timeout(Duration::from_secs(5), async {
            while link.session() == session {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            chan.set_priority(7),
            Err(StpError::InvalidSession(5))
        ));
        assert!(matches!(
            chan.ioctl(ioctl::SET_PRIORITY, 7),
            Err(StpError::InvalidSession(5))
        ));
        assert_ne!(link.context().channel(5).unwrap().priority(), 7);
    }

    #[tokio::test]
    async fn test_shutdown_fails_handles() {
        let (link, _peer) = pair().await;
        let chan = link.open(1).unwrap();
        link.shutdown().await.unwrap();
        assert!(matches!(chan.try_write(b"x"), Err(StpError::LinkStopped)));
    }

    #[tokio::test]
    async fn test_raw_transfer_only_when_suspended() {
        let (link, peer) = pair().await;
        assert!(matches!(
            link.raw_transfer(vec![0; 64]).await,
            Err(StpError::InvalidParameters(_))
        ));
        assert!(matches!(
            peer.raw_transfer(vec![0; 64]).await,
            Err(StpError::InvalidParameters(_))
        ));

        link.suspend();
        assert!(link.is_suspended());
        let rx = link.raw_transfer(vec![0; 64]).await.unwrap();
        assert_eq!(rx.len(), 64);
        link.resume();
    }
}
