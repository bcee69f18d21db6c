//! Wire format of one fixed-size physical transaction.
//!
//! Every transaction starts with an 8-byte header:
//! ```text
//! ┌──────────┬──────────┬──────────┬─────────────────────┐
//! │ Magic    │ Checksum │ Reserved │ Payload             │
//! │ 4 bytes  │ 2 bytes  │ 2 bytes  │ length - 8 bytes    │
//! │ uint32 LE│ uint16 LE│ zero     │ kind byte + body    │
//! └──────────┴──────────┴──────────┴─────────────────────┘
//! ```
//!
//! All multi-byte integers are Little Endian. The checksum is CRC-16-CCITT
//! (seed 0xFFFF) over every byte after the header.

use crc::{Crc, CRC_16_IBM_3740};

use crate::error::{Result, StpError};

/// Header size in bytes (fixed, exactly 8).
pub const HEADER_SIZE: usize = 8;

/// Magic number of every valid transaction.
pub const MAGIC: u32 = 0xDEFE_C8ED;

/// Magic the device sends when it could not take part in the transaction.
pub const DEVICE_BUSY_MAGIC: u32 = 0xCACA_CACA;

/// Number of channel ids addressable on the wire (status bitmaps are u32).
pub const MAX_CHANNELS: u8 = 32;

/// Smallest transaction able to carry the largest control packet.
pub const MIN_TRANSACTION_LENGTH: usize = 32;

/// CRC-16-CCITT, initial value 0xFFFF, no reflection, no final xor.
pub const CRC16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum over the payload area of a transaction.
#[inline]
pub fn checksum(payload: &[u8]) -> u16 {
    CRC16_CCITT.checksum(payload)
}

/// Decoded transaction header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Magic number ([`MAGIC`] or [`DEVICE_BUSY_MAGIC`]).
    pub magic: u32,
    /// CRC of the payload area.
    pub checksum: u16,
    /// Reserved, must be zero.
    pub reserved: u16,
}

impl Header {
    /// Create a header with the regular magic.
    pub fn new(checksum: u16) -> Self {
        Self {
            magic: MAGIC,
            checksum,
            reserved: 0,
        }
    }

    /// Encode header to bytes (Little Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use stp_link::protocol::{Header, HEADER_SIZE};
    ///
    /// let bytes = Header::new(0x1234).encode();
    /// assert_eq!(bytes.len(), HEADER_SIZE);
    /// assert_eq!(&bytes[4..6], &[0x34, 0x12]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into the first `HEADER_SIZE` bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..6].copy_from_slice(&self.checksum.to_le_bytes());
        buf[6..8].copy_from_slice(&self.reserved.to_le_bytes());
    }

    /// Decode header from bytes.
    ///
    /// Returns `None` if buffer is too short.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            checksum: u16::from_le_bytes([buf[4], buf[5]]),
            reserved: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }

    /// Validate magic and reserved bytes.
    ///
    /// The busy magic is not an error here; callers check [`is_busy`](Self::is_busy)
    /// first.
    pub fn validate(&self) -> Result<()> {
        if self.magic != MAGIC && self.magic != DEVICE_BUSY_MAGIC {
            return Err(StpError::Protocol(format!(
                "Bad magic number 0x{:08x}",
                self.magic
            )));
        }

        if self.reserved != 0 {
            return Err(StpError::Protocol(
                "Reserved header bytes must be 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if the device marked the transaction as not taken.
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.magic == DEVICE_BUSY_MAGIC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_little_endian_byte_order() {
        let header = Header {
            magic: 0x0102_0304,
            checksum: 0x0506,
            reserved: 0,
        };
        let bytes = header.encode();
        assert_eq!(bytes, [0x04, 0x03, 0x02, 0x01, 0x06, 0x05, 0x00, 0x00]);
        assert_eq!(Header::decode(&bytes), Some(header));
    }

    #[test]
    fn test_decode_too_short_buffer() {
        let buf = [0u8; 7];
        assert!(Header::decode(&buf).is_none());
    }

    #[test]
    fn test_validate_bad_magic() {
        let header = Header {
            magic: 0xDEAD_BEEF,
            checksum: 0,
            reserved: 0,
        };
        let err = header.validate().unwrap_err();
        assert!(err.to_string().contains("Bad magic"));
    }

    #[test]
    fn test_validate_reserved_must_be_zero() {
        let header = Header {
            reserved: 1,
            ..Header::new(0)
        };
        let err = header.validate().unwrap_err();
        assert!(err.to_string().contains("Reserved header bytes"));
    }

    #[test]
    fn test_busy_magic_is_valid_but_busy() {
        let header = Header {
            magic: DEVICE_BUSY_MAGIC,
            checksum: 0,
            reserved: 0,
        };
        assert!(header.validate().is_ok());
        assert!(header.is_busy());
        assert!(!Header::new(0).is_busy());
    }

    #[test]
    fn test_checksum_matches_ccitt_false() {
        // Standard check value for CRC-16/CCITT-FALSE.
        assert_eq!(checksum(b"123456789"), 0x29B1);
    }
}
