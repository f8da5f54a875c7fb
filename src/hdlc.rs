// SPDX-License-Identifier: MIT OR Apache-2.0
//! HDLC-Lite framing for the Spinel channel: flag-delimited frames, a
//! two-byte escape set and a little-endian CRC-16/X-25 trailer.

use crate::{Buffer, Error, HexDump, Read, Write};
use log::trace;

/// Frame delimiter
const FLAG: u8 = 0x7E;
/// Escape introducer; the byte that follows is the raw value XOR 0x20
const ESCAPE: u8 = 0x7D;

const FCS_INIT: u16 = 0xFFFF;
/// Reflected X-25 polynomial
const FCS_POLY: u16 = 0x8408;
/// Residual of the FCS run over a correct frame including its trailer
const FCS_GOOD: u16 = 0xF0B8;

/// Per-byte FCS lookup table, evaluated at compile time
static FCS_TABLE: [u16; 256] = fcs_table();

#[allow(clippy::cast_lossless)]
const fn fcs_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut byte: u16 = 0;
    while byte < 256 {
        let mut fcs = byte;
        let mut bit = 0;
        while bit < 8 {
            fcs = if fcs & 1 == 1 {
                (fcs >> 1) ^ FCS_POLY
            } else {
                fcs >> 1
            };
            bit += 1;
        }
        table[byte as usize] = fcs;
        byte += 1;
    }
    table
}

fn fcs_update(fcs: u16, byte: u8) -> u16 {
    (fcs >> 8) ^ FCS_TABLE[usize::from((fcs ^ u16::from(byte)) & 0xFF)]
}

fn push_escaped(frame: &mut Buffer, byte: u8) {
    if byte == FLAG || byte == ESCAPE {
        frame.push(ESCAPE);
        frame.push(byte ^ 0x20);
    } else {
        frame.push(byte);
    }
}

/// Encodes `payload` into a flagged, escaped frame with the FCS trailer
#[must_use]
pub fn encode(payload: &[u8]) -> Buffer {
    let mut frame = Buffer::default();
    frame.push(FLAG);
    let mut fcs = FCS_INIT;
    for &byte in payload {
        fcs = fcs_update(fcs, byte);
        push_escaped(&mut frame, byte);
    }
    fcs ^= 0xFFFF;
    let trailer = fcs.to_le_bytes();
    push_escaped(&mut frame, trailer[0]);
    push_escaped(&mut frame, trailer[1]);
    frame.push(FLAG);
    frame
}

/// Reads one frame: discards noise before the opening flag, unescapes up
/// to the closing flag, verifies the residual and strips the trailer.
///
/// # Errors
///
/// * `Err(Error::Timeout)` when the read window closes before a full frame
/// * `Err(Error::FrameCrc)` when the residual is not `0xF0B8`
/// * `Err(Error::Port)` when the read I/O fails with the serial port
pub fn read_frame<P>(port: &mut P) -> Result<Buffer, Error>
where
    P: Read,
{
    let mut packet = Buffer::default();
    let mut fcs = FCS_INIT;
    let mut synced = false;
    loop {
        let byte = port.read_byte()?;
        if byte == FLAG {
            if synced && !packet.is_empty() {
                break;
            }
            synced = true;
            continue;
        }
        if !synced {
            continue;
        }
        let byte = if byte == ESCAPE {
            port.read_byte()? ^ 0x20
        } else {
            byte
        };
        packet.push(byte);
        fcs = fcs_update(fcs, byte);
    }
    trace!("[hdlc rx] 7e {} 7e", HexDump(&packet));
    if fcs != FCS_GOOD || packet.len() < 2 {
        return Err(Error::FrameCrc);
    }
    packet.truncate(packet.len() - 2);
    Ok(packet)
}

/// Encodes and writes one frame
///
/// # Errors
///
/// * `Err(Error::Port)` when the write I/O fails with the serial port
pub fn send<P>(port: &mut P, payload: &[u8]) -> Result<(), Error>
where
    P: Write,
{
    let frame = encode(payload);
    trace!("[hdlc tx] {}", HexDump(&frame));
    port.write_all(&frame)
}

/// Writes a request frame and reads the paired reply
///
/// # Errors
///
/// * `Err(Error::Timeout)` when no reply frame arrives
/// * `Err(Error::FrameCrc)` when the reply residual is not `0xF0B8`
/// * `Err(Error::Port)` when the I/O fails with the serial port
pub fn exchange<P>(port: &mut P, payload: &[u8]) -> Result<Buffer, Error>
where
    P: Read + Write,
{
    send(port, payload)?;
    read_frame(port)
}

#[cfg(test)]
mod tests {
    use crate::hdlc::{encode, read_frame};
    use crate::Error;

    #[test]
    fn test_empty_payload_trailer() {
        // FCS of nothing is the init value; the XOR-out turns it into 0x0000.
        assert_eq!(encode(&[]).as_slice(), [0x7E, 0x00, 0x00, 0x7E]);
    }

    #[test]
    fn test_check_value() {
        // X-25 check value for "123456789" is 0x906E, sent low byte first.
        let frame = encode(b"123456789");
        assert_eq!(&frame[frame.len() - 3..], [0x6E, 0x90, 0x7E]);
    }

    #[rstest::rstest]
    #[case(&[])]
    #[case(&[0x80, 0x01])]
    #[case(&[0x7E, 0x7D, 0x20, 0x00])]
    #[case(&[0xFF; 64])]
    fn test_round_trip(#[case] payload: &[u8]) {
        let frame = encode(payload);
        // Escaped output carries the flag only as the two delimiters.
        assert_eq!(frame.iter().filter(|&&b| b == 0x7E).count(), 2);
        let mut port = frame.as_slice();
        assert_eq!(read_frame(&mut port).unwrap().as_slice(), payload);
    }

    #[test]
    fn test_noise_before_flag_is_discarded() {
        let mut stream = vec![0x42, 0x13, 0x37];
        stream.extend_from_slice(&encode(&[0x81, 0x06, 0x01, 0x04, 0x03]));
        let mut port = stream.as_slice();
        assert_eq!(
            read_frame(&mut port).unwrap().as_slice(),
            [0x81, 0x06, 0x01, 0x04, 0x03]
        );
    }

    #[test]
    fn test_corrupt_trailer() {
        let mut frame = encode(&[0x80, 0x02, 0x01]).to_vec();
        let len = frame.len();
        frame[len - 2] ^= 0x01;
        let mut port = frame.as_slice();
        assert_eq!(read_frame(&mut port), Err(Error::FrameCrc));
    }

    #[test]
    fn test_silence_times_out() {
        let mut port: &[u8] = &[];
        assert_eq!(read_frame(&mut port), Err(Error::Timeout));
        // A frame that never closes is a timeout as well.
        let mut port: &[u8] = &[0x7E, 0x80, 0x06];
        assert_eq!(read_frame(&mut port), Err(Error::Timeout));
    }
}
