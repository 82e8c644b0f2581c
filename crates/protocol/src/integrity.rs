//! Data integrity for framed command packets
//!
//! Extended commands and their responses carry a CRC-16/CCITT checksum
//! (polynomial 0x1021, initial value 0x0000, no input or output reflection,
//! no final xor). This is the parameter set the `crc` crate catalogues as
//! CRC-16/XMODEM. The checksum covers the length field through the end of the
//! payload.
//!
//! # Usage
//!
//! ```
//! use protocol::integrity::{checksum, verify_checksum};
//!
//! let crc = checksum(b"123456789");
//! assert_eq!(crc, 0x31c3);
//! assert!(verify_checksum(b"123456789", crc));
//! ```

use crc::{CRC_16_XMODEM, Crc};

/// Table-driven CRC-16/CCITT engine shared by every framed packet
const CRC16_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Compute the CRC-16 of `data`
#[inline]
pub fn checksum(data: &[u8]) -> u16 {
    CRC16_CCITT.checksum(data)
}

/// Check `data` against an expected CRC-16
#[inline]
pub fn verify_checksum(data: &[u8], expected: u16) -> bool {
    checksum(data) == expected
}

/// Compute a CRC-16 over several non-contiguous slices
///
/// Equivalent to concatenating the parts and calling [`checksum`].
pub fn checksum_parts(parts: &[&[u8]]) -> u16 {
    let mut digest = CRC16_CCITT.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}
