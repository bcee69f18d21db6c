//! Protocol module - wire format and transaction packets.
//!
//! This module implements the fixed-size transaction framing:
//! - 8-byte header with magic and CRC-16 checksum
//! - Tagged packet payloads (sync, notification, status, disconnect, data)

mod transaction;
mod wire_format;

pub use transaction::{
    kind, max_data_len, notification, ChannelStatus, FrameError, Notification, Transaction,
    DATA_HEADER_SIZE, DATA_OFFSET,
};
pub use wire_format::{
    checksum, Header, CRC16_CCITT, DEVICE_BUSY_MAGIC, HEADER_SIZE, MAGIC, MAX_CHANNELS,
    MIN_TRANSACTION_LENGTH,
};
