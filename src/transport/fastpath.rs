//! Allocation-free message executor.
//!
//! Runs the segments of an already prepared [`SpiMessage`] directly through
//! [`SpiTransport::transfer_one`], in order, without touching the message
//! queue machinery of the generic path. The controller reuses one message for
//! every transaction, so nothing is allocated per transfer.

use std::io;

use super::{SpiMessage, SpiTransport};

/// Execute every segment of `msg`; stop at the first failure.
///
/// `msg.actual_length` tracks the bytes moved by completed segments. On
/// failure the transport's error handler is called once before the error is
/// returned.
pub fn transfer_one_message<T>(spi: &mut T, msg: &mut SpiMessage) -> io::Result<usize>
where
    T: SpiTransport + ?Sized,
{
    msg.actual_length = 0;

    let mut failure = None;
    for xfer in msg.transfers.iter_mut() {
        if xfer.rx_buf.len() != xfer.tx_buf.len() {
            xfer.rx_buf.resize(xfer.tx_buf.len(), 0);
        }
        match spi.transfer_one(xfer) {
            Ok(()) => msg.actual_length += xfer.len(),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    if let Some(e) = failure {
        tracing::trace!(
            "SPI message failed after {} bytes: {}",
            msg.actual_length,
            e
        );
        spi.handle_err(msg);
        return Err(e);
    }

    Ok(msg.actual_length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::EchoTransport;
    use crate::transport::SpiTransfer;

    fn three_segments() -> SpiMessage {
        SpiMessage {
            transfers: vec![
                SpiTransfer::from_tx(vec![1; 4], 1_000_000),
                SpiTransfer::from_tx(vec![2; 8], 1_000_000),
                SpiTransfer::from_tx(vec![3; 2], 1_000_000),
            ],
            actual_length: 0,
        }
    }

    #[test]
    fn test_segments_run_in_order_without_prepare() {
        let mut spi = EchoTransport::default();
        let mut msg = three_segments();

        assert_eq!(transfer_one_message(&mut spi, &mut msg).unwrap(), 14);
        assert_eq!(msg.actual_length, 14);
        assert_eq!(spi.segments, 3);
        assert_eq!(spi.prepared, 0);
        assert_eq!(msg.transfers[1].rx_buf, vec![2; 8]);
    }

    #[test]
    fn test_stops_at_first_error() {
        let mut spi = EchoTransport {
            fail_at: Some(1),
            ..Default::default()
        };
        let mut msg = three_segments();

        assert!(transfer_one_message(&mut spi, &mut msg).is_err());
        assert_eq!(msg.actual_length, 4);
        assert_eq!(spi.segments, 1);
        assert_eq!(spi.errors, 1);
    }

    #[test]
    fn test_rx_buffer_sized_to_tx() {
        let mut spi = EchoTransport::default();
        let mut xfer = SpiTransfer::from_tx(vec![7; 5], 1_000_000);
        xfer.rx_buf.clear();
        let mut msg = SpiMessage::single(xfer);

        transfer_one_message(&mut spi, &mut msg).unwrap();
        assert_eq!(msg.transfers[0].rx_buf, vec![7; 5]);
    }
}
