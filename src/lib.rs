// SPDX-License-Identifier: MIT OR Apache-2.0
//! Firmware update engine for serial-attached network co-processor radio
//! modules that run either an `EmberZNet` (EZSP over ASH) or an `OpenThread`
//! (Spinel over HDLC-Lite) stack on top of the common Gecko bootloader.
//! The crate speaks all three endpoints over one UART: it probes which of
//! them is listening, coerces the module into the bootloader, streams a
//! firmware image with XMODEM-CRC and reboots back into the application.
//!
//! The protocol layers are `no_std` and reach the outside world only through
//! the [`Read`], [`Write`] and [`Flush`] traits. With the `std` feature
//! (default) the crate adds a `serialport`-backed line and the
//! [`control::Controller`] driver:
//!
//! 1. Create a [`control::Controller`] over a [`SerialLane`].
//! 2. Call `probe`, `restart`, `flash` or `update`.

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![cfg_attr(not(feature = "std"), no_std)]
#[cfg(feature = "std")]
mod std;

pub mod ash;
#[cfg(feature = "std")]
pub mod control;
pub mod ezsp;
pub mod hdlc;
pub mod spinel;
pub mod xmodem;

#[cfg(feature = "std")]
pub use self::std::{SerialLane, SerialLine};

use core::fmt;
use tinyvec::ArrayVec;

/// Size of the frame staging buffers: room for the largest EZSP response
/// with every byte escaped, which no real frame reaches.
const BUFFER_SIZE: usize = 1024;

/// Staging and temporal storage for incoming and outgoing frames
pub type Buffer = ArrayVec<[u8; BUFFER_SIZE]>;

/// Error codes for every engine operation
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// OS-level serial open, read or write failed
    #[error("serial port I/O failed")]
    Port,
    /// No frame delimiter or expected byte arrived within the read window
    #[error("timed out waiting for the device")]
    Timeout,
    /// CRC mismatch on a received ASH or HDLC-Lite frame
    #[error("frame check sequence mismatch")]
    FrameCrc,
    /// The reply does not have the shape the request calls for
    #[error("reply does not match the request")]
    ProtocolMismatch,
    /// The device did not acknowledge an ASH reset
    #[error("no RSTACK acknowledgement after reset")]
    ResetFailed,
    /// Nothing speaking EZSP behind the port; consumed by the probe
    #[error("no EZSP endpoint on the line")]
    NotEzsp,
    /// Nothing speaking Spinel behind the port; consumed by the probe
    #[error("no Spinel endpoint on the line")]
    NotSpinel,
    /// The device could not be coerced into the bootloader
    #[error("could not bring the device into the bootloader")]
    BootloaderEntryFailed,
    /// The image file is missing or not a Gecko bootloader container
    #[error("firmware images must be readable .gbl or .ebl files")]
    InvalidImage,
    /// The XMODEM transfer did not complete
    #[error("firmware upload failed")]
    UploadFailed,
    /// Third-party Thread devices have no known bootloader entry vector
    #[error("no bootloader entry vector for this device")]
    NotSupported,
}

/// Read half of a serial channel or an image source
pub trait Read {
    /// Reads some bytes into the buffer and returns how many arrived.
    /// An exhausted source yields `Ok(0)`.
    ///
    /// # Errors
    ///
    /// * `Err(Error::Timeout)` when the read window closes first
    /// * `Err(Error::Port)` when the underlying I/O fails
    fn read(&mut self, buf: &mut [u8]) -> Result<u32, Error>;

    /// Reads exactly one byte
    ///
    /// # Errors
    ///
    /// * `Err(Error::Timeout)` when no byte arrives within the read window
    /// * `Err(Error::Port)` when the underlying I/O fails
    fn read_byte(&mut self) -> Result<u8, Error>;
}

/// Write half of a serial channel
pub trait Write {
    /// Attempts to write the entire buffer
    ///
    /// # Errors
    ///
    /// * `Err(Error::Port)` when the underlying I/O fails
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error>;

    /// Attempts to write a single byte
    ///
    /// # Errors
    ///
    /// * `Err(Error::Port)` when the underlying I/O fails
    fn write_byte(&mut self, value: u8) -> Result<(), Error> {
        self.write_all(&[value])
    }
}

/// Receive-queue control of a serial channel
pub trait Flush {
    /// Drops every byte already queued on the receive side. Each
    /// request/response exchange starts with this so that stale boot
    /// chatter cannot shift the reply framing.
    ///
    /// # Errors
    ///
    /// * `Err(Error::Port)` when the underlying I/O fails
    fn flush_input(&mut self) -> Result<(), Error>;
}

/// Hex rendering of a byte slice for wire-level log lines
pub struct HexDump<'a>(pub &'a [u8]);

impl fmt::Display for HexDump<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{Error, HexDump, Read};

    #[test]
    fn test_hex_dump() {
        let rendered = format!("{}", HexDump(&[0x1A, 0xC0, 0x38, 0xBC, 0x7E]));
        assert_eq!(rendered, "1a c0 38 bc 7e");
        assert_eq!(format!("{}", HexDump(&[])), "");
    }

    #[test]
    fn test_exhausted_source_times_out() {
        let mut port: &[u8] = &[];
        assert_eq!(port.read_byte(), Err(Error::Timeout));
    }
}
