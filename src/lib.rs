//! # stp-link
//!
//! Multi-channel link layer over a full-duplex SPI transport.
//!
//! Every physical transfer carries exactly one fixed-size, CRC-protected
//! transaction in each direction. A transaction is either control (handshake,
//! per-channel notification, channel status) or data for one logical channel.
//! The crate also provides the sequence number pool used to match commands
//! with their responses.
//!
//! ## Architecture
//!
//! - **Controller thread**: one per link, the only writer of protocol state
//! - **Channels**: TX/RX pipelines plus open/close notifications, with
//!   flow control driven by the peer's status bitmaps
//! - **Clients**: [`ChannelHandle`]s doing blocking or non-blocking I/O,
//!   sequence allocation and event delivery
//!
//! ## Example
//!
//! ```ignore
//! use std::time::Duration;
//! use stp_link::transport::LoopbackTransport;
//! use stp_link::LinkBuilder;
//!
//! #[tokio::main]
//! async fn main() -> stp_link::Result<()> {
//!     let (peer, device) = LinkBuilder::new().build_peer()?;
//!     let link = LinkBuilder::new().build(LoopbackTransport::new(device))?;
//!     link.wait_synced(Duration::from_secs(1)).await?;
//!
//!     let chan = link.open(5)?;
//!     let remote = peer.open(5)?;
//!     chan.wait_connected().await?;
//!     chan.write(b"hello").await?;
//!
//!     let mut buf = [0u8; 5];
//!     remote.read_exact(&mut buf).await?;
//!     link.shutdown().await
//! }
//! ```

pub mod channel;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod history;
pub mod pipeline;
pub mod protocol;
pub mod sequence;
pub mod signal;
pub mod stats;
pub mod transport;

mod client;
mod worker;

pub use channel::SignalHooks;
pub use client::{
    ioctl, ChannelHandle, Link, LinkBuilder, StreamFilter, MAX_STREAM_FILTER_TYPES,
};
pub use config::LinkConfig;
pub use context::LinkEvent;
pub use controller::{Controller, LinkState};
pub use error::{Result, StpError};
