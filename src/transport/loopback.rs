//! In-process transport wiring a link to a passive peer controller.
//!
//! Every transfer is answered by the peer [`Controller`] the way a device
//! answers an SPI master: the peer's next transaction is clocked back while
//! the master's transaction is handed to the peer for processing.
//!
//! Faults (busy device, timeouts, corruption, hard failures) can be injected
//! through the shared [`LoopbackFaults`] while the link runs.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{SpiTransfer, SpiTransport};
use crate::controller::Controller;
use crate::protocol::DEVICE_BUSY_MAGIC;
use crate::signal::EdgeSignals;

/// Fault injection knobs, shared with the test driving the link.
#[derive(Debug, Default)]
pub struct LoopbackFaults {
    busy: AtomicUsize,
    timeouts: AtomicUsize,
    corrupt_to_master: AtomicUsize,
    corrupt_to_device: AtomicUsize,
    fail: AtomicBool,
}

impl LoopbackFaults {
    /// Answer the next `n` transfers with the device-busy magic.
    pub fn inject_busy(&self, n: usize) {
        self.busy.store(n, Ordering::Release);
    }

    /// Fail the next `n` transfers with `TimedOut`.
    pub fn inject_timeouts(&self, n: usize) {
        self.timeouts.store(n, Ordering::Release);
    }

    /// Flip a byte in the next `n` transactions received by the master.
    pub fn corrupt_to_master(&self, n: usize) {
        self.corrupt_to_master.store(n, Ordering::Release);
    }

    /// Flip a byte in the next `n` transactions received by the peer.
    pub fn corrupt_to_device(&self, n: usize) {
        self.corrupt_to_device.store(n, Ordering::Release);
    }

    /// Make every transfer fail with a hard I/O error.
    pub fn fail_transfers(&self, fail: bool) {
        self.fail.store(fail, Ordering::Release);
    }

    /// Corruptions still pending towards the master.
    pub fn pending_corruptions(&self) -> usize {
        self.corrupt_to_master.load(Ordering::Acquire)
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// SPI transport answered by a peer controller.
pub struct LoopbackTransport {
    device: Controller,
    master_signals: Option<Arc<EdgeSignals>>,
    faults: Arc<LoopbackFaults>,
}

impl LoopbackTransport {
    /// Answer transfers with `device`.
    pub fn new(device: Controller) -> Self {
        Self {
            device,
            master_signals: None,
            faults: Arc::new(LoopbackFaults::default()),
        }
    }

    /// Raise the master's ready and has-data lines after each transfer, like
    /// the device would.
    pub fn with_master_signals(mut self, signals: Arc<EdgeSignals>) -> Self {
        self.master_signals = Some(signals);
        self
    }

    /// Peer controller.
    pub fn device(&self) -> &Controller {
        &self.device
    }

    /// Shared fault injection knobs.
    pub fn faults(&self) -> &Arc<LoopbackFaults> {
        &self.faults
    }

    fn raise_lines(&self) {
        if let Some(signals) = &self.master_signals {
            if self.device.has_pending_work() {
                signals.sample_has_data(false);
                signals.sample_has_data(true);
            }
            signals.sample_ready(false);
            signals.sample_ready(true);
        }
    }
}

impl SpiTransport for LoopbackTransport {
    fn transfer_one(&mut self, xfer: &mut SpiTransfer) -> io::Result<()> {
        if self.faults.fail.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "loopback failed"));
        }
        if LoopbackFaults::take(&self.faults.timeouts) {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "loopback timeout"));
        }

        if LoopbackFaults::take(&self.faults.busy) {
            xfer.rx_buf.fill(0);
            let magic = DEVICE_BUSY_MAGIC.to_le_bytes();
            let n = magic.len().min(xfer.rx_buf.len());
            xfer.rx_buf[..n].copy_from_slice(&magic[..n]);
            self.raise_lines();
            return Ok(());
        }

        let result = if LoopbackFaults::take(&self.faults.corrupt_to_device) {
            let mut corrupted = xfer.tx_buf.clone();
            if let Some(last) = corrupted.last_mut() {
                *last ^= 0xFF;
            }
            self.device.exchange(&corrupted, &mut xfer.rx_buf)
        } else {
            self.device.exchange(&xfer.tx_buf, &mut xfer.rx_buf)
        };
        result.map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        if LoopbackFaults::take(&self.faults.corrupt_to_master) {
            if let Some(last) = xfer.rx_buf.last_mut() {
                *last ^= 0xFF;
            }
        }

        self.raise_lines();
        Ok(())
    }
}
