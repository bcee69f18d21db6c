//! Transport module - the SPI seam.
//!
//! The link core only needs a full-duplex byte transfer. [`SpiTransport`]
//! models an SPI controller at the level the link uses it:
//! - `transfer_one` moves one segment (the only required method)
//! - `prepare`/`unprepare` bracket a message on the generic path
//! - `handle_err` is told about a failed message
//!
//! Two executors run a prepared [`SpiMessage`]:
//! - [`SpiTransport::transfer`]: generic path, prepare → segments → unprepare
//! - [`fastpath::transfer_one_message`]: segments only, hardware prepared once
//!   for the lifetime of the controller
//!
//! [`LoopbackTransport`] connects a link directly to a second, passive
//! controller for tests and simulations.

use std::io;

pub mod fastpath;
mod loopback;

pub use loopback::{LoopbackFaults, LoopbackTransport};

/// One full-duplex segment of a message.
#[derive(Debug, Clone)]
pub struct SpiTransfer {
    /// Bytes clocked out.
    pub tx_buf: Vec<u8>,
    /// Bytes clocked in, same length as `tx_buf`.
    pub rx_buf: Vec<u8>,
    /// Clock for this segment.
    pub speed_hz: u32,
    /// Word size.
    pub bits_per_word: u8,
    /// Delay after the segment.
    pub delay_usecs: u16,
    /// Deassert chip select after the segment.
    pub cs_change: bool,
}

impl SpiTransfer {
    /// Zeroed segment of `len` bytes.
    pub fn new(len: usize, speed_hz: u32) -> Self {
        Self {
            tx_buf: vec![0u8; len],
            rx_buf: vec![0u8; len],
            speed_hz,
            bits_per_word: 8,
            delay_usecs: 0,
            cs_change: false,
        }
    }

    /// Segment clocking out `tx`.
    pub fn from_tx(tx: Vec<u8>, speed_hz: u32) -> Self {
        let len = tx.len();
        Self {
            tx_buf: tx,
            rx_buf: vec![0u8; len],
            speed_hz,
            bits_per_word: 8,
            delay_usecs: 0,
            cs_change: false,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tx_buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tx_buf.is_empty()
    }
}

/// Chain of segments executed under one chip select.
#[derive(Debug, Clone, Default)]
pub struct SpiMessage {
    pub transfers: Vec<SpiTransfer>,
    /// Bytes moved by the last execution.
    pub actual_length: usize,
}

impl SpiMessage {
    /// Message with a single segment.
    pub fn single(transfer: SpiTransfer) -> Self {
        Self {
            transfers: vec![transfer],
            actual_length: 0,
        }
    }

    /// Total bytes across segments.
    pub fn len(&self) -> usize {
        self.transfers.iter().map(SpiTransfer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// SPI controller as seen by the link.
///
/// A transfer that fails with [`io::ErrorKind::TimedOut`] is retried by the
/// link with the same outgoing bytes; any other error stops the link.
pub trait SpiTransport: Send {
    /// Exchange one segment. `xfer.rx_buf` receives `xfer.len()` bytes.
    fn transfer_one(&mut self, xfer: &mut SpiTransfer) -> io::Result<()>;

    /// Get the hardware ready for transfers.
    fn prepare(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Release what `prepare` acquired.
    fn unprepare(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Called once when a message fails.
    fn handle_err(&mut self, _msg: &mut SpiMessage) {}

    /// Generic path: prepare, run every segment, unprepare.
    fn transfer(&mut self, msg: &mut SpiMessage) -> io::Result<usize> {
        self.prepare()?;
        let result = fastpath::transfer_one_message(self, msg);
        let unprepared = self.unprepare();
        let n = result?;
        unprepared?;
        Ok(n)
    }
}

impl<T: SpiTransport + ?Sized> SpiTransport for Box<T> {
    fn transfer_one(&mut self, xfer: &mut SpiTransfer) -> io::Result<()> {
        (**self).transfer_one(xfer)
    }

    fn prepare(&mut self) -> io::Result<()> {
        (**self).prepare()
    }

    fn unprepare(&mut self) -> io::Result<()> {
        (**self).unprepare()
    }

    fn handle_err(&mut self, msg: &mut SpiMessage) {
        (**self).handle_err(msg)
    }

    fn transfer(&mut self, msg: &mut SpiMessage) -> io::Result<usize> {
        (**self).transfer(msg)
    }
}
