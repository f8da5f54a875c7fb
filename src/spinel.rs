// SPDX-License-Identifier: MIT OR Apache-2.0
//! Spinel host transport over HDLC-Lite: an 8-bit header carrying the
//! transaction identifier, a varint command, and varint-addressed
//! properties.

use crate::{hdlc, Buffer, Error, HexDump, Read, Write};
use core::fmt::Write as _;
use heapless::String;
use log::debug;

/// Software reset; async, answered by a reset-complete notification
pub const CMD_RESET: u32 = 1;
/// Property read
pub const CMD_PROP_VALUE_GET: u32 = 2;
/// Vendor command: reboot an Elelabs module into the Gecko bootloader
pub const CMD_MFG_LAUNCH_BOOTLOADER: u32 = 15360;

/// Protocol version pair, `major` then `minor`
pub const PROP_PROTOCOL_VERSION: u32 = 1;
/// NCP build string
pub const PROP_NCP_VERSION: u32 = 2;
/// Vendor string from the manufacturing area
pub const PROP_MFG_STRING: u32 = 0x3C01;
/// Board name from the manufacturing area
pub const PROP_MFG_BOARD_NAME: u32 = 0x3C02;

/// Header for every request that expects a reply: TID 1
const HEADER_DEFAULT: u8 = 0x81;
/// Header for the fire-and-forget commands
const HEADER_ASYNC: u8 = 0x80;

/// Attempts at reading a matching protocol-version reply before giving up
const VERSION_POLL_LIMIT: usize = 5;

/// Appends `value` as an unsigned LEB128 varint: seven bits per byte, the
/// high bit marking continuation
pub fn encode_varint(mut value: u32, out: &mut Buffer) {
    loop {
        let mut byte = (value & 0x7F).to_le_bytes()[0];
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

/// Reads a varint off the front of `data`, returning the value and its
/// encoded length
///
/// # Errors
///
/// * `Err(Error::ProtocolMismatch)` when the encoding is unterminated or
///   does not fit 32 bits
pub fn decode_varint(data: &[u8]) -> Result<(u32, usize), Error> {
    let mut value: u32 = 0;
    for (i, &byte) in data.iter().enumerate() {
        if i >= 5 || (i == 4 && byte & 0x70 != 0) {
            return Err(Error::ProtocolMismatch);
        }
        value |= u32::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::ProtocolMismatch)
}

/// Packs a request: header byte, command varint, payload
#[must_use]
pub fn packet(header: u8, command: u32, payload: &[u8]) -> Buffer {
    let mut pkt = Buffer::default();
    pkt.push(header);
    encode_varint(command, &mut pkt);
    pkt.extend_from_slice(payload);
    pkt
}

fn command<P>(port: &mut P, name: &str, command: u32, payload: &[u8]) -> Result<Buffer, Error>
where
    P: Read + Write,
{
    debug!("{name}");
    let pkt = packet(HEADER_DEFAULT, command, payload);
    debug!("[spinel tx] {}", HexDump(&pkt));
    let reply = hdlc::exchange(port, &pkt)?;
    debug!("[spinel rx] {}", HexDump(&reply));
    Ok(reply)
}

/// `CMD_PROP_VALUE_GET` — returns the property value with the echoed
/// header, command and property identifier stripped. Identifiers up to
/// `0xFF` echo as one varint byte, larger ones as two; properties needing
/// a three-byte varint do not occur on this link.
///
/// # Errors
///
/// * `Err(Error::ProtocolMismatch)` when the reply is shorter than its
///   echoed preamble
/// * any [`hdlc::exchange`] error
pub fn prop_value_get<P>(port: &mut P, prop: u32) -> Result<Buffer, Error>
where
    P: Read + Write,
{
    debug_assert!(prop < 0x4000);
    let mut payload = Buffer::default();
    encode_varint(prop, &mut payload);
    let reply = command(port, "CMD_PROP_VALUE_GET", CMD_PROP_VALUE_GET, &payload)?;
    let skip = if prop > 0xFF { 4 } else { 3 };
    let mut value = Buffer::default();
    value.extend_from_slice(reply.get(skip..).ok_or(Error::ProtocolMismatch)?);
    Ok(value)
}

/// `CMD_MFG_LAUNCH_BOOTLOADER` — fire-and-forget with the async header;
/// the module reboots without replying
///
/// # Errors
///
/// * `Err(Error::Port)` when the write I/O fails with the serial port
pub fn launch_bootloader<P>(port: &mut P) -> Result<(), Error>
where
    P: Write,
{
    debug!("CMD_MFG_LAUNCH_BOOTLOADER");
    let pkt = packet(HEADER_ASYNC, CMD_MFG_LAUNCH_BOOTLOADER, &[]);
    debug!("[spinel tx] {}", HexDump(&pkt));
    hdlc::send(port, &pkt)
}

/// One Spinel session; holds the protocol version recorded during init
#[derive(Default)]
pub struct Session {
    version: String<8>,
}

impl Session {
    /// Creates a session with no version recorded yet
    #[must_use]
    pub const fn new() -> Self {
        Self {
            version: String::new(),
        }
    }

    /// Protocol version as `"major.minor"`, empty before init
    #[must_use]
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Resets the NCP and polls for the protocol version. A reply that
    /// echoes the reset request byte-for-byte is the bootloader parroting
    /// the line and classifies as not-Spinel.
    ///
    /// # Errors
    ///
    /// * `Err(Error::NotSpinel)` when nothing Spinel-shaped answers
    /// * `Err(Error::ProtocolMismatch)` when five version polls mismatch
    /// * `Err(Error::Port)` when the I/O fails with the serial port
    pub fn init<P>(&mut self, port: &mut P) -> Result<(), Error>
    where
        P: Read + Write,
    {
        self.version.clear();
        debug!("CMD_RESET");
        let pkt = packet(HEADER_ASYNC, CMD_RESET, &[]);
        debug!("[spinel tx] {}", HexDump(&pkt));
        let reply = match hdlc::exchange(port, &pkt) {
            Ok(reply) => reply,
            Err(Error::Port) => return Err(Error::Port),
            Err(_) => return Err(Error::NotSpinel),
        };
        if reply == pkt {
            debug!("reset request echoed back: bootloader on the line");
            return Err(Error::NotSpinel);
        }
        debug!("[spinel rx] {}", HexDump(&reply));
        let mut prop = Buffer::default();
        encode_varint(PROP_PROTOCOL_VERSION, &mut prop);
        for _ in 0..VERSION_POLL_LIMIT {
            let reply = command(port, "CMD_PROP_VALUE_GET", CMD_PROP_VALUE_GET, &prop)?;
            if reply.get(2).copied().map(u32::from) != Some(PROP_PROTOCOL_VERSION) {
                continue;
            }
            let (major, minor) = match (reply.get(3), reply.get(4)) {
                (Some(major), Some(minor)) => (*major, *minor),
                _ => return Err(Error::ProtocolMismatch),
            };
            let _ = write!(self.version, "{major}.{minor}");
            debug!("SPINEL v{} detected", self.version);
            return Ok(());
        }
        Err(Error::ProtocolMismatch)
    }
}

#[cfg(test)]
mod tests {
    use crate::spinel::{decode_varint, encode_varint, packet, CMD_MFG_LAUNCH_BOOTLOADER};
    use crate::{Buffer, Error};

    #[rstest::rstest]
    #[case(0, &[0x00])]
    #[case(1, &[0x01])]
    #[case(0x7F, &[0x7F])]
    #[case(0x80, &[0x80, 0x01])]
    #[case(15360, &[0x80, 0x78])]
    #[case(0x3C01, &[0x81, 0x78])]
    #[case(0x3C02, &[0x82, 0x78])]
    #[case(u32::MAX, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F])]
    fn test_varint(#[case] value: u32, #[case] wire: &[u8]) {
        let mut out = Buffer::default();
        encode_varint(value, &mut out);
        assert_eq!(out.as_slice(), wire);
        assert_eq!(decode_varint(&out), Ok((value, wire.len())));
    }

    #[rstest::rstest]
    #[case(0)]
    #[case(1)]
    #[case(127)]
    #[case(128)]
    #[case(16383)]
    #[case(16384)]
    #[case(0x0012_3456)]
    #[case(0xDEAD_BEEF)]
    fn test_varint_round_trip(#[case] value: u32) {
        let mut out = Buffer::default();
        encode_varint(value, &mut out);
        let (back, len) = decode_varint(&out).unwrap();
        assert_eq!((back, len), (value, out.len()));
    }

    #[test]
    fn test_varint_rejects_malformed() {
        // Unterminated continuation
        assert_eq!(decode_varint(&[0x80]), Err(Error::ProtocolMismatch));
        // Six bytes can never encode a u32
        assert_eq!(
            decode_varint(&[0x80, 0x80, 0x80, 0x80, 0x80, 0x01]),
            Err(Error::ProtocolMismatch)
        );
    }

    #[test]
    fn test_packet_layout() {
        assert_eq!(packet(0x80, 1, &[]).as_slice(), [0x80, 0x01]);
        assert_eq!(packet(0x81, 2, &[0x01]).as_slice(), [0x81, 0x02, 0x01]);
        assert_eq!(
            packet(0x80, CMD_MFG_LAUNCH_BOOTLOADER, &[]).as_slice(),
            [0x80, 0x80, 0x78]
        );
    }
}
