//! Link configuration.
//!
//! [`LinkConfig`] carries every tunable of a physical link. It is usually
//! filled through [`LinkBuilder`](crate::LinkBuilder) setters, but it can also
//! be loaded from a JSON document; missing fields fall back to defaults.
//!
//! ```
//! use stp_link::LinkConfig;
//!
//! let cfg = LinkConfig::from_json(r#"{ "transaction_length": 256, "channel_count": 8 }"#).unwrap();
//! assert_eq!(cfg.transaction_length, 256);
//! assert_eq!(cfg.bad_crc_threshold, stp_link::config::DEFAULT_BAD_CRC_THRESHOLD);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StpError};
use crate::protocol::{HEADER_SIZE, MAX_CHANNELS, MIN_TRANSACTION_LENGTH};

/// Default fixed size of one physical transaction.
pub const DEFAULT_TRANSACTION_LENGTH: usize = 512;

/// Largest supported transaction.
pub const MAX_TRANSACTION_LENGTH: usize = 4096;

/// Default capacity of each channel pipeline (per direction).
pub const DEFAULT_PIPELINE_CAPACITY: usize = 16 * 1024;

/// Consecutive bad transactions tolerated before a resync.
pub const DEFAULT_BAD_CRC_THRESHOLD: u32 = 10;

/// Number of received transactions kept for diagnostics.
pub const DEFAULT_HISTORY_DEPTH: usize = 16;

/// Controller wake-up period when nothing signals it.
pub const DEFAULT_IDLE_POLL_MS: u64 = 10;

/// Default SPI clock.
pub const DEFAULT_SPEED_HZ: u32 = 8_000_000;

/// Lowest sequence number handed out by default.
pub const DEFAULT_SEQ_NUM_MIN: u8 = 1;

/// Highest sequence number handed out by default.
pub const DEFAULT_SEQ_NUM_MAX: u8 = 254;

/// Configuration of one physical link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Size in bytes of every physical transaction. Must match the peer.
    pub transaction_length: usize,
    /// Number of logical channels (at most 32).
    pub channel_count: u8,
    /// Capacity of each TX and RX pipeline.
    pub pipeline_capacity: usize,
    /// Consecutive bad transactions before the link is resynced.
    pub bad_crc_threshold: u32,
    /// Depth of the received-transaction history ring.
    pub history_depth: usize,
    /// Execute transfers through the fast path.
    pub use_fastpath: bool,
    /// Only transact after the device raised its ready line.
    pub wait_for_device_ready: bool,
    /// Idle poll period of the controller, in milliseconds.
    pub idle_poll_ms: u64,
    /// Timeout for blocking client reads and writes, in milliseconds.
    pub io_timeout_ms: Option<u64>,
    /// SPI clock used for each transfer.
    pub speed_hz: u32,
    /// Lowest sequence number in the pool.
    pub seq_num_min: u8,
    /// Highest sequence number in the pool.
    pub seq_num_max: u8,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            transaction_length: DEFAULT_TRANSACTION_LENGTH,
            channel_count: MAX_CHANNELS,
            pipeline_capacity: DEFAULT_PIPELINE_CAPACITY,
            bad_crc_threshold: DEFAULT_BAD_CRC_THRESHOLD,
            history_depth: DEFAULT_HISTORY_DEPTH,
            use_fastpath: true,
            wait_for_device_ready: true,
            idle_poll_ms: DEFAULT_IDLE_POLL_MS,
            io_timeout_ms: None,
            speed_hz: DEFAULT_SPEED_HZ,
            seq_num_min: DEFAULT_SEQ_NUM_MIN,
            seq_num_max: DEFAULT_SEQ_NUM_MAX,
        }
    }
}

impl LinkConfig {
    /// Parse a JSON document, filling unspecified fields with defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: LinkConfig = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Check that the configuration describes a usable link.
    pub fn validate(&self) -> Result<()> {
        if self.transaction_length < MIN_TRANSACTION_LENGTH
            || self.transaction_length > MAX_TRANSACTION_LENGTH
        {
            return Err(StpError::InvalidParameters(format!(
                "transaction length {} outside {}..={}",
                self.transaction_length, MIN_TRANSACTION_LENGTH, MAX_TRANSACTION_LENGTH
            )));
        }

        if self.channel_count == 0 || self.channel_count > MAX_CHANNELS {
            return Err(StpError::InvalidParameters(format!(
                "channel count {} outside 1..={}",
                self.channel_count, MAX_CHANNELS
            )));
        }

        // The receiver must be able to hold at least one full data packet.
        if self.pipeline_capacity < self.transaction_length - HEADER_SIZE {
            return Err(StpError::InvalidParameters(format!(
                "pipeline capacity {} smaller than one transaction payload",
                self.pipeline_capacity
            )));
        }

        if self.pipeline_capacity > u32::MAX as usize / 2 {
            return Err(StpError::InvalidParameters(
                "pipeline capacity too large".to_string(),
            ));
        }

        if self.bad_crc_threshold == 0 {
            return Err(StpError::InvalidParameters(
                "bad CRC threshold must be at least 1".to_string(),
            ));
        }

        if self.seq_num_min > self.seq_num_max {
            return Err(StpError::InvalidParameters(format!(
                "sequence range {}..={} is empty",
                self.seq_num_min, self.seq_num_max
            )));
        }

        Ok(())
    }

    /// Idle poll period as a `Duration`.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Client I/O timeout as a `Duration`, if any.
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }
}
