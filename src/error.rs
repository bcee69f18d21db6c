//! Error types for stp-link.

use thiserror::Error;

/// Main error type for all link, channel and sequence operations.
#[derive(Debug, Error)]
pub enum StpError {
    /// I/O error reported by the SPI transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration or dumping debug state.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The far end has not announced the channel as open.
    #[error("Device not connected on channel {0}")]
    DeviceNotConnected(u8),

    /// This end has not opened the channel.
    #[error("Controller not connected on channel {0}")]
    ControllerNotConnected(u8),

    /// Link handshake has not completed.
    #[error("Link not synced")]
    NotSynced,

    /// Channel is already open on this end.
    #[error("Channel {0} already open")]
    AlreadyOpen(u8),

    /// Channel is already closed on this end.
    #[error("Channel {0} already closed")]
    AlreadyClosed(u8),

    /// The handle belongs to a link epoch that has since been resynced.
    #[error("Invalid session on channel {0}")]
    InvalidSession(u8),

    /// Malformed request (bad channel id, out-of-range value, ...).
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Unknown command.
    #[error("Invalid command: {0}")]
    InvalidCommand(u32),

    /// Not enough room in the channel's TX pipeline.
    #[error("TX space unavailable on channel {0}")]
    TxSpaceUnavailable(u8),

    /// Not enough bytes in the channel's RX pipeline.
    #[error("RX data unavailable on channel {0}")]
    RxDataUnavailable(u8),

    /// Every sequence number in the pool is allocated.
    #[error("Sequence numbers exhausted")]
    SequenceExhausted,

    /// The client does not hold the sequence number it tried to release.
    #[error("Sequence number {0} not held by client")]
    SequenceNotHeld(u8),

    /// Framing violation (bad magic, reserved bits, bad packet layout).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Blocking client call ran past the configured I/O timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The controller thread has stopped.
    #[error("Link stopped")]
    LinkStopped,
}

impl StpError {
    /// Map to the negative errno a character-device front end would return.
    pub fn errno(&self) -> i32 {
        match self {
            StpError::Io(e) => -e.raw_os_error().unwrap_or(EIO),
            StpError::Json(_) => -EINVAL,
            StpError::DeviceNotConnected(_) => -EAGAIN,
            StpError::ControllerNotConnected(_)
            | StpError::NotSynced
            | StpError::AlreadyOpen(_)
            | StpError::AlreadyClosed(_) => -EBADF,
            StpError::InvalidSession(_) => -EPIPE,
            StpError::InvalidParameters(_) => -EINVAL,
            StpError::InvalidCommand(_) => -ENOTTY,
            StpError::TxSpaceUnavailable(_) | StpError::RxDataUnavailable(_) => -EAGAIN,
            StpError::SequenceExhausted => -EAGAIN,
            StpError::SequenceNotHeld(_) => -EACCES,
            StpError::Protocol(_) => -EIO,
            StpError::Timeout => -ETIMEDOUT,
            StpError::LinkStopped => -ESHUTDOWN,
        }
    }

    /// Transient backpressure: wait for the channel and retry.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            StpError::TxSpaceUnavailable(_) | StpError::RxDataUnavailable(_)
        )
    }
}

// Linux values, independent of the build target.
const EIO: i32 = 5;
const EAGAIN: i32 = 11;
const EBADF: i32 = 9;
const EACCES: i32 = 13;
const EINVAL: i32 = 22;
const ENOTTY: i32 = 25;
const EPIPE: i32 = 32;
const ESHUTDOWN: i32 = 108;
const ETIMEDOUT: i32 = 110;

/// Result type alias using StpError.
pub type Result<T> = std::result::Result<T, StpError>;
