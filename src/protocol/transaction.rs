//! Transaction payloads and their serialization.
//!
//! A transaction carries exactly one packet after the header. The first
//! payload byte selects the packet kind (see [`kind`]):
//!
//! | kind | body |
//! |------|------|
//! | `EMPTY` | nothing |
//! | `SYNC` | ack `u8` (0/1) |
//! | `NOTIFICATION` | channel `u8`, code `u8`, value `u8` |
//! | `STATUS` | open bitmap `u32 LE`, rx-ready bitmap `u32 LE` |
//! | `DISCONNECT` | nothing |
//! | `DATA` | channel `u8`, sequence `u8`, length `u16 LE`, bytes |
//!
//! Unused trailing bytes are zero. They are covered by the checksum.
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use stp_link::protocol::Transaction;
//!
//! let tx = Transaction::Data {
//!     channel: 5,
//!     sequence_id: 0,
//!     data: Bytes::from_static(b"0123456789"),
//! };
//! let wire = tx.encode(64).unwrap();
//! assert_eq!(Transaction::decode(&wire).unwrap(), tx);
//! ```

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use super::wire_format::{
    checksum, Header, HEADER_SIZE, MAGIC, MAX_CHANNELS, MIN_TRANSACTION_LENGTH,
};
use crate::error::{Result, StpError};

/// Packet kind codes (first payload byte).
pub mod kind {
    /// Nothing to send.
    pub const EMPTY: u8 = 0x00;
    /// Link handshake.
    pub const SYNC: u8 = 0x01;
    /// Per-channel notification.
    pub const NOTIFICATION: u8 = 0x02;
    /// Channel status bitmaps.
    pub const STATUS: u8 = 0x03;
    /// Explicit link disconnect.
    pub const DISCONNECT: u8 = 0x04;
    /// Channel data.
    pub const DATA: u8 = 0x05;
}

/// Notification codes (second byte of a notification body).
pub mod notification {
    /// Channel opened by the sender.
    pub const OPEN: u8 = 0x01;
    /// Channel closed by the sender.
    pub const CLOSE: u8 = 0x02;
    /// Application event with a one-byte type code.
    pub const NOTIFY: u8 = 0x03;
}

/// Bytes of the data packet header that follow the kind byte.
pub const DATA_HEADER_SIZE: usize = 4;

/// Offset of data bytes inside a transaction.
pub const DATA_OFFSET: usize = HEADER_SIZE + 1 + DATA_HEADER_SIZE;

/// Largest data chunk a transaction of `transaction_length` bytes can carry.
#[inline]
pub fn max_data_len(transaction_length: usize) -> usize {
    transaction_length.saturating_sub(DATA_OFFSET)
}

/// Framing failures detected while decoding a received transaction.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The device did not take part in the transaction.
    #[error("device busy")]
    DeviceBusy,

    /// Unknown magic number.
    #[error("bad magic number 0x{0:08x}")]
    BadMagic(u32),

    /// Stored checksum does not match the payload.
    #[error("bad checksum: stored 0x{stored:04x}, computed 0x{computed:04x}")]
    BadChecksum { stored: u16, computed: u16 },

    /// Structurally invalid transaction.
    #[error("malformed transaction: {0}")]
    Malformed(String),

    /// Checksum passed but the payload is not understood.
    #[error("unsupported payload: {0}")]
    UnsupportedPayload(String),
}

impl From<FrameError> for StpError {
    fn from(err: FrameError) -> Self {
        StpError::Protocol(err.to_string())
    }
}

/// Notification carried for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Sender opened the channel.
    Open,
    /// Sender closed the channel.
    Close,
    /// Application event with a type code.
    Notify(u8),
}

impl Notification {
    fn encode(&self) -> (u8, u8) {
        match self {
            Notification::Open => (notification::OPEN, 0),
            Notification::Close => (notification::CLOSE, 0),
            Notification::Notify(code) => (notification::NOTIFY, *code),
        }
    }

    fn decode(code: u8, value: u8) -> std::result::Result<Self, FrameError> {
        match code {
            notification::OPEN => Ok(Notification::Open),
            notification::CLOSE => Ok(Notification::Close),
            notification::NOTIFY => Ok(Notification::Notify(value)),
            other => Err(FrameError::UnsupportedPayload(format!(
                "unknown notification code {other}"
            ))),
        }
    }
}

/// Channel status bitmaps, bit `n` describing channel `n`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStatus {
    /// Channels open on the sender's side.
    pub open: u32,
    /// Channels whose RX pipeline on the sender can take a full data packet.
    pub rx_ready: u32,
}

impl ChannelStatus {
    /// Whether channel `id` is open.
    #[inline]
    pub fn is_open(&self, id: u8) -> bool {
        self.open & (1 << id) != 0
    }

    /// Whether channel `id` can receive.
    #[inline]
    pub fn is_rx_ready(&self, id: u8) -> bool {
        self.rx_ready & (1 << id) != 0
    }
}

/// One decoded transaction payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    /// Filler transaction.
    Empty,
    /// Handshake; `ack` reports that the sender has seen a sync from us.
    Sync { ack: bool },
    /// Per-channel notification.
    Notification {
        channel: u8,
        notification: Notification,
    },
    /// Channel status bitmaps.
    Status(ChannelStatus),
    /// Sender is dropping the link.
    Disconnect,
    /// Channel data.
    Data {
        channel: u8,
        sequence_id: u8,
        data: Bytes,
    },
}

impl Transaction {
    /// Kind code of this packet.
    pub fn kind(&self) -> u8 {
        match self {
            Transaction::Empty => kind::EMPTY,
            Transaction::Sync { .. } => kind::SYNC,
            Transaction::Notification { .. } => kind::NOTIFICATION,
            Transaction::Status(_) => kind::STATUS,
            Transaction::Disconnect => kind::DISCONNECT,
            Transaction::Data { .. } => kind::DATA,
        }
    }

    /// Check if this is a control packet.
    #[inline]
    pub fn is_control(&self) -> bool {
        !matches!(self, Transaction::Empty | Transaction::Data { .. })
    }

    /// Serialize into `buf`, which must be exactly one transaction long.
    ///
    /// The whole buffer is overwritten: header, payload, zero padding and
    /// checksum.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < MIN_TRANSACTION_LENGTH {
            return Err(StpError::InvalidParameters(format!(
                "transaction buffer of {} bytes is below minimum {}",
                buf.len(),
                MIN_TRANSACTION_LENGTH
            )));
        }

        buf.fill(0);
        let payload = &mut buf[HEADER_SIZE..];
        payload[0] = self.kind();

        match self {
            Transaction::Empty | Transaction::Disconnect => {}
            Transaction::Sync { ack } => payload[1] = u8::from(*ack),
            Transaction::Notification {
                channel,
                notification,
            } => {
                check_channel(*channel)?;
                let (code, value) = notification.encode();
                payload[1] = *channel;
                payload[2] = code;
                payload[3] = value;
            }
            Transaction::Status(status) => {
                payload[1..5].copy_from_slice(&status.open.to_le_bytes());
                payload[5..9].copy_from_slice(&status.rx_ready.to_le_bytes());
            }
            Transaction::Data {
                channel,
                sequence_id,
                data,
            } => {
                check_channel(*channel)?;
                let max = max_data_len(buf.len());
                if data.len() > max {
                    return Err(StpError::InvalidParameters(format!(
                        "data chunk of {} bytes exceeds maximum {}",
                        data.len(),
                        max
                    )));
                }
                let payload = &mut buf[HEADER_SIZE..];
                payload[1] = *channel;
                payload[2] = *sequence_id;
                payload[3..5].copy_from_slice(&(data.len() as u16).to_le_bytes());
                buf[DATA_OFFSET..DATA_OFFSET + data.len()].copy_from_slice(data);
            }
        }

        let crc = checksum(&buf[HEADER_SIZE..]);
        Header::new(crc).encode_into(buf);
        Ok(())
    }

    /// Serialize into a freshly allocated transaction of `transaction_length` bytes.
    pub fn encode(&self, transaction_length: usize) -> Result<Bytes> {
        let mut buf = BytesMut::zeroed(transaction_length);
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Validate and parse a received transaction.
    ///
    /// Checks, in order: length, magic (busy first), reserved bytes,
    /// checksum, then the packet body.
    pub fn decode(buf: &[u8]) -> std::result::Result<Self, FrameError> {
        if buf.len() < MIN_TRANSACTION_LENGTH {
            return Err(FrameError::Malformed(format!(
                "transaction of {} bytes is below minimum {}",
                buf.len(),
                MIN_TRANSACTION_LENGTH
            )));
        }

        let header = Header::decode(buf)
            .ok_or_else(|| FrameError::Malformed("truncated header".to_string()))?;
        if header.is_busy() {
            return Err(FrameError::DeviceBusy);
        }
        if header.magic != MAGIC {
            return Err(FrameError::BadMagic(header.magic));
        }
        if header.reserved != 0 {
            return Err(FrameError::Malformed(
                "reserved header bytes must be 0".to_string(),
            ));
        }

        let payload = &buf[HEADER_SIZE..];
        let computed = checksum(payload);
        if computed != header.checksum {
            return Err(FrameError::BadChecksum {
                stored: header.checksum,
                computed,
            });
        }

        match payload[0] {
            kind::EMPTY => Ok(Transaction::Empty),
            kind::SYNC => match payload[1] {
                0 => Ok(Transaction::Sync { ack: false }),
                1 => Ok(Transaction::Sync { ack: true }),
                other => Err(FrameError::UnsupportedPayload(format!("bad sync ack {other}"))),
            },
            kind::NOTIFICATION => Ok(Transaction::Notification {
                channel: payload[1],
                notification: Notification::decode(payload[2], payload[3])?,
            }),
            kind::STATUS => Ok(Transaction::Status(ChannelStatus {
                open: u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]),
                rx_ready: u32::from_le_bytes([payload[5], payload[6], payload[7], payload[8]]),
            })),
            kind::DISCONNECT => Ok(Transaction::Disconnect),
            kind::DATA => {
                let len = u16::from_le_bytes([payload[3], payload[4]]) as usize;
                let max = max_data_len(buf.len());
                if len > max {
                    return Err(FrameError::UnsupportedPayload(format!(
                        "data length {len} exceeds maximum {max}"
                    )));
                }
                Ok(Transaction::Data {
                    channel: payload[1],
                    sequence_id: payload[2],
                    data: Bytes::copy_from_slice(&buf[DATA_OFFSET..DATA_OFFSET + len]),
                })
            }
            other => Err(FrameError::UnsupportedPayload(format!(
                "unknown packet kind {other}"
            ))),
        }
    }
}

fn check_channel(channel: u8) -> Result<()> {
    if channel >= MAX_CHANNELS {
        return Err(StpError::InvalidParameters(format!(
            "channel {channel} out of range"
        )));
    }
    Ok(())
}
