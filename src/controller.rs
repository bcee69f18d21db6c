//! Link controller state machine.
//!
//! One [`Controller`] drives one physical link. Every iteration it:
//! 1. decides the next outgoing transaction (control preempts data)
//! 2. runs exactly one full-duplex transfer
//! 3. validates the received transaction and dispatches its content
//!
//! # States
//!
//! ```text
//!            Sync{ack} received with ack
//!  UNSYNCED ───────────────────────────► SYNCED
//!     ▲                                     │
//!     └─────────────────────────────────────┘
//!      bad transaction streak, Disconnect,
//!      or Sync{ack = false} (peer restarted)
//! ```
//!
//! While unsynced every outgoing transaction is `Sync { ack }`, where `ack`
//! tells the peer that one of its syncs has been seen. Receiving a sync with
//! `ack` completes the handshake; one more acknowledged sync is echoed so the
//! peer can complete as well.
//!
//! # Outgoing priority
//!
//! 1. retained transaction after a busy device or a transport timeout
//! 2. sync (while unsynced, or the post-handshake echo)
//! 3. channel status that withdraws an RX ready bit
//! 4. one notification, round-robin across channels
//! 5. channel status, only when it differs from the last one sent
//! 6. one data packet from the highest-priority eligible channel
//! 7. empty
//!
//! A withdrawn RX ready bit jumps the notification queue: the peer keeps
//! sending data against the last status it saw, and the RX threshold only
//! covers the packets already in flight.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;

use crate::context::{LinkContext, LinkEvent};
use crate::error::{Result, StpError};
use crate::protocol::{
    kind, max_data_len, ChannelStatus, FrameError, Notification, Transaction,
};
use crate::stats::LinkStats;
use crate::transport::{fastpath, SpiMessage, SpiTransfer, SpiTransport};

/// Handshake state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unsynced,
    Synced,
}

/// Result of one controller iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Transaction exchanged; kind codes of both directions.
    Exchanged { sent: u8, received: u8 },
    /// The received transaction failed validation.
    Rejected { sent: u8 },
    /// Device busy or transport timeout; the same bytes go out next time.
    Retry,
}

impl StepOutcome {
    /// Nothing moved in either direction.
    pub fn is_idle(&self) -> bool {
        matches!(
            self,
            StepOutcome::Exchanged {
                sent: kind::EMPTY,
                received: kind::EMPTY
            }
        )
    }
}

/// Protocol state machine of one link end.
pub struct Controller {
    ctx: Arc<LinkContext>,
    state: LinkState,
    peer_seen_sync: bool,
    echo_sync: bool,
    retry_pending: bool,
    last_sent_kind: u8,
    bad_crcs_in_a_row: u32,
    device_status: ChannelStatus,
    last_sent_status: Option<ChannelStatus>,
    notify_cursor: usize,
    data_cursor: usize,
    tx_seq: Vec<u8>,
    rx_seq: Vec<Option<u8>>,
    message: SpiMessage,
    max_data: usize,
    rx_ready_threshold: usize,
}

impl Controller {
    /// Create an unsynced controller for `ctx`.
    pub fn new(ctx: Arc<LinkContext>) -> Self {
        let config = ctx.config();
        let channel_count = ctx.channels().len();
        let max_data = max_data_len(config.transaction_length);
        // Room for the packet in flight plus the one already decided by the
        // peer before our status reaches it.
        let rx_ready_threshold = (3 * max_data).min(config.pipeline_capacity);
        let message =
            SpiMessage::single(SpiTransfer::new(config.transaction_length, config.speed_hz));

        Self {
            state: LinkState::Unsynced,
            peer_seen_sync: false,
            echo_sync: false,
            retry_pending: false,
            last_sent_kind: kind::EMPTY,
            bad_crcs_in_a_row: 0,
            device_status: ChannelStatus::default(),
            last_sent_status: None,
            notify_cursor: 0,
            data_cursor: 0,
            tx_seq: vec![0; channel_count],
            rx_seq: vec![None; channel_count],
            message,
            max_data,
            rx_ready_threshold,
            ctx,
        }
    }

    #[inline]
    pub fn context(&self) -> &Arc<LinkContext> {
        &self.ctx
    }

    #[inline]
    pub fn state(&self) -> LinkState {
        self.state
    }

    #[inline]
    pub fn bad_crcs_in_a_row(&self) -> u32 {
        self.bad_crcs_in_a_row
    }

    /// Status bitmaps last received from the peer.
    #[inline]
    pub fn device_status(&self) -> ChannelStatus {
        self.device_status
    }

    /// Bytes of the transaction prepared for the next transfer.
    #[inline]
    pub fn tx_buffer(&self) -> &[u8] {
        &self.message.transfers[0].tx_buf
    }

    /// Run one iteration over `spi`.
    ///
    /// A transport timeout keeps the prepared transaction for the next call.
    /// Any other transport error is returned and the link should stop.
    pub fn step<T>(&mut self, spi: &mut T) -> Result<StepOutcome>
    where
        T: SpiTransport + ?Sized,
    {
        let sent = self.prepare_tx()?;

        let start = Instant::now();
        let result = if self.ctx.config().use_fastpath {
            fastpath::transfer_one_message(spi, &mut self.message)
        } else {
            spi.transfer(&mut self.message)
        };

        match result {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                LinkStats::incr(&self.ctx.stats.transport_timeouts);
                tracing::warn!("SPI transfer timed out, retrying");
                self.retry_pending = true;
                return Ok(StepOutcome::Retry);
            }
            Err(e) => {
                tracing::error!("SPI transfer failed: {}", e);
                return Err(StpError::Io(e));
            }
        }
        let end = Instant::now();
        LinkStats::incr(&self.ctx.stats.tx_transactions);

        let rx = std::mem::take(&mut self.message.transfers[0].rx_buf);
        self.ctx.history.lock().push(start, end, &rx);
        let outcome = self.process_rx(sent, &rx);
        self.message.transfers[0].rx_buf = rx;
        Ok(outcome)
    }

    /// Passive side of a transfer driven by the other end.
    ///
    /// Fills `to_master` with the next outgoing transaction and processes
    /// `from_master`.
    pub fn exchange(&mut self, from_master: &[u8], to_master: &mut [u8]) -> Result<StepOutcome> {
        if from_master.len() != to_master.len() || to_master.len() != self.tx_buffer().len() {
            return Err(StpError::InvalidParameters(format!(
                "transfer of {} bytes, link uses {}",
                from_master.len(),
                self.tx_buffer().len()
            )));
        }

        let sent = self.prepare_tx()?;
        let start = Instant::now();
        to_master.copy_from_slice(self.tx_buffer());
        LinkStats::incr(&self.ctx.stats.tx_transactions);
        self.ctx.history.lock().push(start, Instant::now(), from_master);
        Ok(self.process_rx(sent, from_master))
    }

    /// Whether the next transaction would carry something.
    pub fn has_pending_work(&self) -> bool {
        if self.retry_pending || self.state == LinkState::Unsynced || self.echo_sync {
            return true;
        }
        let channels = self.ctx.channels();
        if channels.iter().any(|ch| ch.has_pending_notification()) {
            return true;
        }
        if self.last_sent_status != Some(self.local_status()) {
            return true;
        }
        channels.iter().any(|ch| self.is_data_eligible(ch.id()))
    }

    /// Encode the next transaction into the TX buffer; returns its kind.
    pub fn prepare_tx(&mut self) -> Result<u8> {
        if self.retry_pending {
            self.retry_pending = false;
            tracing::trace!("Resending transaction kind {}", self.last_sent_kind);
            return Ok(self.last_sent_kind);
        }

        let tx = self.next_transaction();
        tx.encode_into(&mut self.message.transfers[0].tx_buf)?;
        tracing::trace!("Prepared {:?}", tx);
        self.last_sent_kind = tx.kind();
        Ok(self.last_sent_kind)
    }

    fn next_transaction(&mut self) -> Transaction {
        if self.state == LinkState::Unsynced {
            return Transaction::Sync {
                ack: self.peer_seen_sync,
            };
        }

        if self.ctx.take_disconnect_request() {
            self.desync("local disconnect");
            return Transaction::Disconnect;
        }

        if self.echo_sync {
            self.echo_sync = false;
            return Transaction::Sync { ack: true };
        }

        let status = self.local_status();
        if self.withdraws_rx_ready(status) {
            self.last_sent_status = Some(status);
            return Transaction::Status(status);
        }

        if let Some(tx) = self.next_notification() {
            return tx;
        }

        if self.last_sent_status != Some(status) {
            self.last_sent_status = Some(status);
            return Transaction::Status(status);
        }

        self.next_data().unwrap_or(Transaction::Empty)
    }

    fn next_notification(&mut self) -> Option<Transaction> {
        let channels = self.ctx.channels();
        let n = channels.len();
        for i in 0..n {
            let idx = (self.notify_cursor + i) % n;
            if let Some(notification) = channels[idx].pop_notification() {
                self.notify_cursor = (idx + 1) % n;
                return Some(Transaction::Notification {
                    channel: idx as u8,
                    notification,
                });
            }
        }
        None
    }

    fn local_status(&self) -> ChannelStatus {
        let mut status = ChannelStatus::default();
        for ch in self.ctx.channels() {
            if ch.is_controller_connected() {
                status.open |= 1 << ch.id();
                if ch.rx().get_available_space() >= self.rx_ready_threshold {
                    status.rx_ready |= 1 << ch.id();
                }
            }
        }
        status
    }

    /// `status` clears a ready bit the peer still believes in.
    fn withdraws_rx_ready(&self, status: ChannelStatus) -> bool {
        self.last_sent_status
            .map_or(false, |last| last.rx_ready & !status.rx_ready != 0)
    }

    fn is_data_eligible(&self, id: u8) -> bool {
        let ch = &self.ctx.channels()[id as usize];
        ch.is_available()
            && !ch.tx().is_empty()
            && self.device_status.is_open(id)
            && self.device_status.is_rx_ready(id)
    }

    fn next_data(&mut self) -> Option<Transaction> {
        let channels = self.ctx.channels();
        let n = channels.len();

        // Highest priority wins; equal priorities rotate from the cursor.
        let mut best: Option<(u8, usize)> = None;
        for i in 0..n {
            let idx = (self.data_cursor + i) % n;
            if !self.is_data_eligible(idx as u8) {
                continue;
            }
            let priority = channels[idx].priority();
            if best.map_or(true, |(p, _)| priority > p) {
                best = Some((priority, idx));
            }
        }
        let (_, idx) = best?;
        self.data_cursor = (idx + 1) % n;

        let ch = &channels[idx];
        let mut chunk = BytesMut::zeroed(self.max_data);
        let len = ch.tx().get_data_nb(&mut chunk);
        chunk.truncate(len);

        let sequence_id = self.tx_seq[idx];
        self.tx_seq[idx] = sequence_id.wrapping_add(1);

        LinkStats::add(&self.ctx.stats.tx_data_bytes, len);
        self.ctx.hooks.signal_write(idx as u8);
        ch.wake_writers();

        Some(Transaction::Data {
            channel: idx as u8,
            sequence_id,
            data: chunk.freeze(),
        })
    }

    /// Validate and dispatch a received transaction.
    fn process_rx(&mut self, sent: u8, rx: &[u8]) -> StepOutcome {
        let stats = &self.ctx.stats;
        let tx = match Transaction::decode(rx) {
            Ok(tx) => tx,
            Err(FrameError::DeviceBusy) => {
                LinkStats::incr(&stats.device_busy);
                tracing::trace!("Device busy, retrying transaction");
                self.retry_pending = true;
                return StepOutcome::Retry;
            }
            Err(FrameError::UnsupportedPayload(reason)) => {
                // Intact frame from a peer speaking something newer.
                LinkStats::incr(&stats.malformed);
                LinkStats::incr(&stats.rx_dropped);
                self.bad_crcs_in_a_row = 0;
                tracing::warn!("Dropping transaction: {}", reason);
                return StepOutcome::Rejected { sent };
            }
            Err(e) => {
                match e {
                    FrameError::BadMagic(_) => LinkStats::incr(&stats.bad_magic),
                    FrameError::BadChecksum { .. } => LinkStats::incr(&stats.bad_crc),
                    _ => LinkStats::incr(&stats.malformed),
                }
                self.bad_transaction(&e);
                return StepOutcome::Rejected { sent };
            }
        };

        LinkStats::incr(&stats.rx_transactions);
        self.bad_crcs_in_a_row = 0;
        let received = tx.kind();
        self.dispatch(tx);
        StepOutcome::Exchanged { sent, received }
    }

    fn bad_transaction(&mut self, err: &FrameError) {
        self.bad_crcs_in_a_row += 1;
        tracing::warn!(
            "Rejected transaction ({} in a row): {}",
            self.bad_crcs_in_a_row,
            err
        );

        if self.state == LinkState::Synced
            && self.bad_crcs_in_a_row >= self.ctx.config().bad_crc_threshold
        {
            self.desync("too many bad transactions");
        }
    }

    fn dispatch(&mut self, tx: Transaction) {
        match (self.state, tx) {
            (LinkState::Unsynced, Transaction::Sync { ack }) => {
                self.peer_seen_sync = true;
                if ack {
                    self.become_synced();
                }
            }
            (LinkState::Unsynced, other) => {
                tracing::trace!("Dropping {:?} while unsynced", other);
            }
            (LinkState::Synced, Transaction::Sync { ack: true }) => {}
            (LinkState::Synced, Transaction::Sync { ack: false }) => {
                self.desync("peer restarted");
                self.peer_seen_sync = true;
            }
            (LinkState::Synced, Transaction::Disconnect) => {
                self.desync("peer disconnected");
            }
            (LinkState::Synced, Transaction::Empty) => {
                LinkStats::incr(&self.ctx.stats.empty_transactions);
            }
            (LinkState::Synced, Transaction::Status(status)) => {
                tracing::trace!("Device status {:?}", status);
                self.device_status = status;
            }
            (
                LinkState::Synced,
                Transaction::Notification {
                    channel,
                    notification,
                },
            ) => self.handle_notification(channel, notification),
            (
                LinkState::Synced,
                Transaction::Data {
                    channel,
                    sequence_id,
                    data,
                },
            ) => self.handle_data(channel, sequence_id, &data),
        }
    }

    fn handle_notification(&mut self, id: u8, notification: Notification) {
        let Some(ch) = self.ctx.channels().get(id as usize) else {
            tracing::warn!("Dropping {:?} for unknown channel {}", notification, id);
            LinkStats::incr(&self.ctx.stats.rx_dropped);
            return;
        };

        match notification {
            Notification::Open => {
                if ch.remote_open() {
                    tracing::info!("Channel {} opened by peer", id);
                    self.tx_seq[id as usize] = 0;
                    self.rx_seq[id as usize] = None;
                    self.ctx.hooks.signal_open(id);
                    self.ctx.emit(LinkEvent::Opened(id));
                }
            }
            Notification::Close => {
                if ch.remote_close() {
                    tracing::info!("Channel {} closed by peer", id);
                    self.ctx.emit(LinkEvent::Closed(id));
                }
            }
            Notification::Notify(code) => {
                if ch.is_controller_connected() {
                    tracing::debug!("Notification {} on channel {}", code, id);
                    self.ctx.emit(LinkEvent::Notify { channel: id, code });
                } else {
                    tracing::warn!("Dropping notification {} for closed channel {}", code, id);
                    LinkStats::incr(&self.ctx.stats.rx_dropped);
                }
            }
        }
    }

    fn handle_data(&mut self, id: u8, sequence_id: u8, data: &[u8]) {
        let stats = &self.ctx.stats;
        let Some(ch) = self.ctx.channels().get(id as usize) else {
            tracing::warn!("Dropping {} bytes for unknown channel {}", data.len(), id);
            LinkStats::incr(&stats.rx_dropped);
            return;
        };
        if !ch.is_available() {
            tracing::warn!("Dropping {} bytes for unavailable channel {}", data.len(), id);
            LinkStats::incr(&stats.rx_dropped);
            return;
        }

        let slot = &mut self.rx_seq[id as usize];
        if let Some(expected) = *slot {
            if expected != sequence_id {
                tracing::warn!(
                    "Channel {} packet sequence gap: expected {}, got {}",
                    id,
                    expected,
                    sequence_id
                );
            }
        }
        *slot = Some(sequence_id.wrapping_add(1));

        match ch.rx().add_data(data) {
            Ok(()) => {
                tracing::trace!("Channel {} received {} bytes", id, data.len());
                LinkStats::add(&stats.rx_data_bytes, data.len());
                self.ctx.hooks.signal_read(id);
                ch.wake_readers();
            }
            Err(e) => {
                tracing::warn!("Channel {} RX pipeline full, dropping packet: {}", id, e);
                LinkStats::incr(&stats.rx_dropped);
            }
        }
    }

    fn become_synced(&mut self) {
        self.state = LinkState::Synced;
        self.echo_sync = true;
        self.last_sent_status = None;
        self.device_status = ChannelStatus::default();
        self.ctx.set_synced(true);
        tracing::info!("Link synced (session {})", self.ctx.session());
        self.ctx.emit(LinkEvent::Synced);
    }

    fn desync(&mut self, reason: &str) {
        self.state = LinkState::Unsynced;
        self.ctx.set_synced(false);
        let session = self.ctx.next_session();
        LinkStats::incr(&self.ctx.stats.resyncs);

        self.peer_seen_sync = false;
        self.echo_sync = false;
        self.retry_pending = false;
        self.bad_crcs_in_a_row = 0;
        self.device_status = ChannelStatus::default();
        self.last_sent_status = None;
        self.tx_seq.fill(0);
        self.rx_seq.fill(None);

        for ch in self.ctx.channels() {
            ch.invalidate();
        }

        tracing::info!("Link desynced ({}), new session {}", reason, session);
        self.ctx.emit(LinkEvent::Desynced);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::protocol::{Header, HEADER_SIZE};
    use crate::signal::EdgeSignals;
    use crate::transport::LoopbackTransport;
    use bytes::Bytes;

    const LEN: usize = 64;

    fn config() -> LinkConfig {
        LinkConfig {
            transaction_length: LEN,
            channel_count: 8,
            pipeline_capacity: 1024,
            bad_crc_threshold: 3,
            ..LinkConfig::default()
        }
    }

    fn context() -> Arc<LinkContext> {
        Arc::new(LinkContext::new(config(), Arc::new(EdgeSignals::new()), None))
    }

    fn pair() -> (Controller, LoopbackTransport) {
        let master = Controller::new(context());
        let device = Controller::new(context());
        (master, LoopbackTransport::new(device))
    }

    fn run(master: &mut Controller, spi: &mut LoopbackTransport, rounds: usize) {
        for _ in 0..rounds {
            master.step(spi).unwrap();
        }
    }

    fn synced_pair() -> (Controller, LoopbackTransport) {
        let (mut master, mut spi) = pair();
        run(&mut master, &mut spi, 4);
        assert_eq!(master.state(), LinkState::Synced);
        assert_eq!(spi.device().state(), LinkState::Synced);
        (master, spi)
    }

    fn open_both(master: &mut Controller, spi: &mut LoopbackTransport, id: u8) {
        master.context().channel(id).unwrap().open_local(1024).unwrap();
        spi.device().context().channel(id).unwrap().open_local(1024).unwrap();
        run(master, spi, 4);
        assert!(master.context().channel(id).unwrap().is_available());
        assert!(spi.device().context().channel(id).unwrap().is_available());
    }

    #[test]
    fn test_handshake_syncs_both_ends() {
        let (mut master, mut spi) = pair();
        assert_eq!(master.step(&mut spi).unwrap(), StepOutcome::Exchanged {
            sent: kind::SYNC,
            received: kind::SYNC
        });
        assert_eq!(master.state(), LinkState::Unsynced);

        master.step(&mut spi).unwrap();
        assert_eq!(master.state(), LinkState::Synced);
        assert_eq!(spi.device().state(), LinkState::Synced);
        assert!(master.context().is_synced());
    }

    #[test]
    fn test_control_preempts_data() {
        let (mut master, mut spi) = synced_pair();
        open_both(&mut master, &mut spi, 1);
        run(&mut master, &mut spi, 4);

        let ch = master.context().channel(1).unwrap();
        ch.tx().add_data(b"payload").unwrap();
        ch.queue_notification(Notification::Notify(9));

        assert_eq!(master.prepare_tx().unwrap(), kind::NOTIFICATION);
        assert_eq!(master.prepare_tx().unwrap(), kind::DATA);
    }

    #[test]
    fn test_round_robin_notifications() {
        let (mut master, _spi) = synced_pair();
        let ctx = master.context().clone();
        for id in 0..3u8 {
            for code in 0..3u8 {
                ctx.channel(id)
                    .unwrap()
                    .queue_notification(Notification::Notify(code));
            }
        }

        let mut order = Vec::new();
        for _ in 0..9 {
            assert_eq!(master.prepare_tx().unwrap(), kind::NOTIFICATION);
            let payload = &master.tx_buffer()[HEADER_SIZE..];
            order.push((payload[1], payload[3]));
        }
        assert_eq!(
            order,
            vec![
                (0, 0),
                (1, 0),
                (2, 0),
                (0, 1),
                (1, 1),
                (2, 1),
                (0, 2),
                (1, 2),
                (2, 2)
            ]
        );
    }

    #[test]
    fn test_status_sent_only_on_change() {
        let (mut master, _spi) = synced_pair();
        // Echoed sync and first status were exchanged during the handshake.
        assert_eq!(master.prepare_tx().unwrap(), kind::EMPTY);

        master.context().channel(2).unwrap().open_local(1024).unwrap();
        assert_eq!(master.prepare_tx().unwrap(), kind::NOTIFICATION);
        assert_eq!(master.prepare_tx().unwrap(), kind::STATUS);
        assert_eq!(master.prepare_tx().unwrap(), kind::EMPTY);
    }

    #[test]
    fn test_data_delivered_in_order() {
        let (mut master, mut spi) = synced_pair();
        open_both(&mut master, &mut spi, 5);

        let data: Vec<u8> = (0..200u8).collect();
        master.context().channel(5).unwrap().tx().add_data(&data).unwrap();
        run(&mut master, &mut spi, 10);

        let rx = spi.device().context().channel(5).unwrap().rx();
        let mut out = vec![0u8; 200];
        rx.get_data(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn test_rx_full_status_preempts_notification_backlog() {
        let (mut master, mut spi) = synced_pair();
        open_both(&mut master, &mut spi, 1);
        open_both(&mut master, &mut spi, 2);

        let peer = spi.device().context().clone();
        for code in 0..40u8 {
            peer.channel(2)
                .unwrap()
                .queue_notification(Notification::Notify(code));
        }

        let ctx = master.context().clone();
        let tx = ctx.channel(1).unwrap().tx();
        let mut sent = 0;
        for _ in 0..40 {
            sent += tx.add_data_nb(&[0xA5u8; LEN]);
            master.step(&mut spi).unwrap();
        }

        let rx = peer.channel(1).unwrap().rx();
        assert_eq!(peer.stats().rx_dropped, 0);
        assert_eq!(rx.get_data_size() + tx.get_data_size(), sent);
        assert!(!master.device_status().is_rx_ready(1));
    }

    #[test]
    fn test_malformed_payload_does_not_count_toward_resync() {
        let (mut master, _spi) = synced_pair();
        let session = master.context().session();

        let mut wire = Transaction::Notification {
            channel: 1,
            notification: Notification::Notify(3),
        }
        .encode(LEN)
        .unwrap()
        .to_vec();
        // Notification code unknown to this end, checksum still valid.
        wire[HEADER_SIZE + 2] = 0x7F;
        let crc = crate::protocol::checksum(&wire[HEADER_SIZE..]);
        Header::new(crc).encode_into(&mut wire);

        for _ in 0..10 {
            let outcome = master.process_rx(kind::EMPTY, &wire);
            assert_eq!(outcome, StepOutcome::Rejected { sent: kind::EMPTY });
        }

        let ctx = master.context();
        assert_eq!(master.state(), LinkState::Synced);
        assert_eq!(master.bad_crcs_in_a_row(), 0);
        assert_eq!(ctx.session(), session);
        assert_eq!(ctx.stats().resyncs, 0);
        assert_eq!(ctx.stats().malformed, 10);
        assert_eq!(ctx.stats().rx_dropped, 10);
    }

    #[test]
    fn test_higher_priority_channel_first() {
        let (mut master, mut spi) = synced_pair();
        open_both(&mut master, &mut spi, 1);
        open_both(&mut master, &mut spi, 2);

        let ctx = master.context().clone();
        ctx.channel(2).unwrap().set_priority(5);
        ctx.channel(1).unwrap().tx().add_data(b"low").unwrap();
        ctx.channel(2).unwrap().tx().add_data(b"high").unwrap();

        assert_eq!(master.prepare_tx().unwrap(), kind::DATA);
        assert_eq!(master.tx_buffer()[HEADER_SIZE + 1], 2);
    }

    #[test]
    fn test_corrupted_transaction_leaves_channels_untouched() {
        let (mut master, mut spi) = synced_pair();
        open_both(&mut master, &mut spi, 3);

        let mut wire = Transaction::Data {
            channel: 3,
            sequence_id: 0,
            data: Bytes::from_static(b"abc"),
        }
        .encode(LEN)
        .unwrap()
        .to_vec();
        wire[HEADER_SIZE + 6] ^= 0x10;

        let outcome = master.process_rx(kind::EMPTY, &wire);
        assert_eq!(outcome, StepOutcome::Rejected { sent: kind::EMPTY });
        assert_eq!(master.bad_crcs_in_a_row(), 1);
        let ch = master.context().channel(3).unwrap();
        assert_eq!(ch.rx().get_data_size(), 0);
        assert!(ch.is_available());
        assert_eq!(master.context().stats().bad_crc, 1);
    }

    #[test]
    fn test_bad_streak_invalidates_channels_once() {
        let (mut master, mut spi) = synced_pair();
        open_both(&mut master, &mut spi, 0);
        let session = master.context().session();
        let ch = master.context().channel(0).unwrap();
        ch.tx().add_data(b"unsent bytes").unwrap();
        ch.rx().add_data(b"unread bytes").unwrap();
        let garbage = vec![0x55u8; LEN];

        for _ in 0..10 {
            master.process_rx(kind::EMPTY, &garbage);
        }

        let ctx = master.context();
        assert_eq!(master.state(), LinkState::Unsynced);
        assert!(!ctx.is_synced());
        assert_eq!(ctx.session(), session + 1);
        assert_eq!(ctx.stats().resyncs, 1);
        assert_eq!(ctx.stats().bad_magic, 10);
        let ch = ctx.channel(0).unwrap();
        assert!(!ch.is_controller_connected());
        assert!(!ch.is_device_connected());
        assert_eq!(ch.tx().get_data_size(), 0);
        assert_eq!(ch.rx().get_data_size(), 0);
    }

    #[test]
    fn test_good_transaction_resets_streak() {
        let (mut master, _spi) = synced_pair();
        let garbage = vec![0u8; LEN];
        master.process_rx(kind::EMPTY, &garbage);
        master.process_rx(kind::EMPTY, &garbage);

        let empty = Transaction::Empty.encode(LEN).unwrap();
        master.process_rx(kind::EMPTY, &empty);
        assert_eq!(master.bad_crcs_in_a_row(), 0);
        assert_eq!(master.state(), LinkState::Synced);
    }

    #[test]
    fn test_busy_device_retries_same_bytes() {
        let (mut master, mut spi) = synced_pair();
        let ctx = master.context().clone();
        ctx.channel(4).unwrap().queue_notification(Notification::Notify(1));

        spi.faults().inject_busy(1);
        assert_eq!(master.step(&mut spi).unwrap(), StepOutcome::Retry);
        let before = master.tx_buffer().to_vec();
        assert_eq!(master.prepare_tx().unwrap(), kind::NOTIFICATION);
        assert_eq!(master.tx_buffer(), &before[..]);
        assert_eq!(master.bad_crcs_in_a_row(), 0);
        assert_eq!(ctx.stats().device_busy, 1);
    }

    #[test]
    fn test_transport_timeout_retries() {
        let (mut master, mut spi) = synced_pair();
        spi.faults().inject_timeouts(2);
        assert_eq!(master.step(&mut spi).unwrap(), StepOutcome::Retry);
        assert_eq!(master.step(&mut spi).unwrap(), StepOutcome::Retry);
        assert!(matches!(
            master.step(&mut spi).unwrap(),
            StepOutcome::Exchanged { .. }
        ));
        assert_eq!(master.context().stats().transport_timeouts, 2);
    }

    #[test]
    fn test_transport_failure_is_fatal() {
        let (mut master, mut spi) = synced_pair();
        spi.faults().fail_transfers(true);
        assert!(matches!(master.step(&mut spi), Err(StpError::Io(_))));
    }

    #[test]
    fn test_peer_restart_desyncs_and_recovers() {
        let (mut master, _old) = synced_pair();
        let mut spi = LoopbackTransport::new(Controller::new(context()));

        master.step(&mut spi).unwrap();
        assert_eq!(master.state(), LinkState::Unsynced);
        assert_eq!(master.context().stats().resyncs, 1);

        run(&mut master, &mut spi, 6);
        assert_eq!(master.state(), LinkState::Synced);
        assert_eq!(spi.device().state(), LinkState::Synced);
    }

    #[test]
    fn test_local_disconnect() {
        let (mut master, mut spi) = synced_pair();
        master.context().request_disconnect();
        assert_eq!(master.step(&mut spi).unwrap(), StepOutcome::Exchanged {
            sent: kind::DISCONNECT,
            received: kind::EMPTY
        });
        assert_eq!(master.state(), LinkState::Unsynced);
        assert_eq!(spi.device().state(), LinkState::Unsynced);

        run(&mut master, &mut spi, 4);
        assert_eq!(master.state(), LinkState::Synced);
    }

    #[test]
    fn test_data_for_closed_channel_dropped() {
        let (mut master, _spi) = synced_pair();
        let wire = Transaction::Data {
            channel: 6,
            sequence_id: 0,
            data: Bytes::from_static(b"nobody"),
        }
        .encode(LEN)
        .unwrap();
        master.process_rx(kind::EMPTY, &wire);
        assert_eq!(master.context().stats().rx_dropped, 1);
        assert_eq!(master.state(), LinkState::Synced);
    }

    #[test]
    fn test_unknown_channel_notification_dropped() {
        let (mut master, _spi) = synced_pair();
        let mut wire = Transaction::Notification {
            channel: 7,
            notification: Notification::Open,
        }
        .encode(LEN)
        .unwrap()
        .to_vec();
        // Channel 20 is valid on the wire but not configured on this link.
        wire[HEADER_SIZE + 1] = 20;
        let crc = crate::protocol::checksum(&wire[HEADER_SIZE..]);
        Header::new(crc).encode_into(&mut wire);

        master.process_rx(kind::EMPTY, &wire);
        assert_eq!(master.context().stats().rx_dropped, 1);
    }

    #[test]
    fn test_rx_ready_withheld_when_pipeline_full() {
        let (mut master, mut spi) = synced_pair();
        open_both(&mut master, &mut spi, 1);
        let status = master.local_status();
        assert!(status.is_rx_ready(1));

        master
            .context()
            .channel(1)
            .unwrap()
            .rx()
            .add_data(&[0u8; 1000])
            .unwrap();
        assert!(!master.local_status().is_rx_ready(1));
        assert!(master.local_status().is_open(1));
    }
}
