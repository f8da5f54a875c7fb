// SPDX-License-Identifier: MIT OR Apache-2.0
//! ASH link layer, the framing `EmberZNet` stacks expect on a UART. Every
//! DATA frame carries a whitened payload, a CRC-16/CCITT trailer and a
//! control byte holding the paired 3-bit acknowledgement and frame
//! counters; reserved bytes are escaped before the closing flag.

use crate::{Buffer, Error, Flush, HexDump, Read, Write};
use crc::{Crc, CRC_16_IBM_3740};
use log::{debug, trace};
use tinyvec::array_vec;

/// CRC algorithm for ASH frame trailers (poly 0x1021, init 0xFFFF).
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Frame delimiter
const FLAG: u8 = 0x7E;
/// Escape introducer; the byte that follows is the reserved value XOR 0x20
const ESCAPE: u8 = 0x7D;
/// Bytes that never appear raw inside a frame: XON, XOFF, the substitute
/// and cancel pair, and the escape and flag bytes themselves
const RESERVED: [u8; 6] = [0x11, 0x13, 0x18, 0x1A, 0x7D, 0x7E];

/// Seed of the whitening LFSR
const RANDOMIZE_START: u8 = 0x42;
/// Taps applied when the LFSR shifts a set bit out
const RANDOMIZE_SEQ: u8 = 0xB8;

/// Wire literal of the RST frame, cancel byte included
pub const RSTACK_FRAME: [u8; 5] = [0x1A, 0xC0, 0x38, 0xBC, 0x7E];
/// Sequence a successful reset must produce in the reply stream
pub const RSTACK_ACK: [u8; 6] = [0x1A, 0xC1, 0x02, 0x0B, 0x0A, 0x52];

/// CRC-16/CCITT of `data`, as appended big-endian to every outbound frame
#[must_use]
pub fn checksum(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// XORs `data` with the ASH whitening sequence in place. The transformation
/// is an involution: applying it twice yields the input.
pub fn randomize(data: &mut [u8]) {
    let mut rand = RANDOMIZE_START;
    for byte in data {
        *byte ^= rand;
        rand = if rand & 1 == 1 {
            (rand >> 1) ^ RANDOMIZE_SEQ
        } else {
            rand >> 1
        };
    }
}

/// Escapes the reserved bytes of `data` onto the end of `out`
pub fn stuff(data: &[u8], out: &mut Buffer) {
    for &byte in data {
        if RESERVED.contains(&byte) {
            out.push(ESCAPE);
            out.push(byte ^ 0x20);
        } else {
            out.push(byte);
        }
    }
}

/// Reverses the escape transformation of `data` onto the end of `out`
pub fn unstuff(data: &[u8], out: &mut Buffer) {
    let mut escaped = false;
    for &byte in data {
        if escaped {
            out.push(byte ^ 0x20);
            escaped = false;
        } else if byte == ESCAPE {
            escaped = true;
        } else {
            out.push(byte);
        }
    }
}

/// Builds an ACK frame whose low three bits acknowledge the control byte of
/// the frame being answered
#[must_use]
pub fn ack_frame(control: u8) -> Buffer {
    let mut body = array_vec!([u8; 4]);
    body.push(0x80 | (control & 0x07));
    body.extend_from_slice(&CRC16.checksum(&body).to_be_bytes());
    let mut frame = Buffer::from_array_empty([0; crate::BUFFER_SIZE]);
    stuff(&body, &mut frame);
    frame.push(FLAG);
    frame
}

/// Reads one frame: every byte up to the closing flag, with escapes
/// reversed and the flag itself dropped. A read window that closes before
/// any byte arrives yields `Error::Timeout`; one that closes mid-frame
/// returns the partial frame, which some NCPs produce right after a reset.
///
/// # Errors
///
/// * `Err(Error::Timeout)` when no byte at all arrives
/// * `Err(Error::Port)` when the read I/O fails with the serial port
pub fn read_frame<P>(port: &mut P) -> Result<Buffer, Error>
where
    P: Read,
{
    let mut raw = Buffer::from_array_empty([0; crate::BUFFER_SIZE]);
    loop {
        match port.read_byte() {
            Ok(FLAG) => break,
            Ok(byte) => raw.push(byte),
            Err(Error::Timeout) if !raw.is_empty() => break,
            Err(err) => return Err(err),
        }
    }
    let mut frame = Buffer::from_array_empty([0; crate::BUFFER_SIZE]);
    unstuff(&raw, &mut frame);
    trace!("[ash rx] {}", HexDump(&frame));
    Ok(frame)
}

/// Validates a DATA frame's CRC trailer and recovers the de-whitened
/// payload between the control byte and the CRC.
///
/// # Errors
///
/// * `Err(Error::ProtocolMismatch)` when the frame is too short to be DATA
/// * `Err(Error::FrameCrc)` when the trailer does not match
pub fn open_data(frame: &[u8]) -> Result<Buffer, Error> {
    if frame.len() < 4 {
        return Err(Error::ProtocolMismatch);
    }
    let (body, trailer) = frame.split_at(frame.len() - 2);
    if trailer != CRC16.checksum(body).to_be_bytes() {
        return Err(Error::FrameCrc);
    }
    let mut payload = Buffer::from_array_empty([0; crate::BUFFER_SIZE]);
    payload.extend_from_slice(&body[1..]);
    randomize(&mut payload);
    debug!("[ezsp rx] {}", HexDump(&payload));
    Ok(payload)
}

/// Sends the RST frame and requires the RSTACK acknowledgement somewhere in
/// the reply stream. Reset noise may precede the acknowledgement, so the
/// match is a subsequence scan rather than a frame parse.
///
/// # Errors
///
/// * `Err(Error::ResetFailed)` when the reply carries no acknowledgement
/// * `Err(Error::Timeout)` when nothing arrives at all
/// * `Err(Error::Port)` when the I/O fails with the serial port
pub fn reset<P>(port: &mut P) -> Result<(), Error>
where
    P: Read + Write + Flush,
{
    port.flush_input()?;
    debug!("ash reset");
    trace!("[ash tx] {}", HexDump(&RSTACK_FRAME));
    port.write_all(&RSTACK_FRAME)?;
    let frame = read_frame(port)?;
    if frame.windows(RSTACK_ACK.len()).any(|w| w == RSTACK_ACK) {
        Ok(())
    } else {
        Err(Error::ResetFailed)
    }
}

/// Per-session ASH state: the 3-bit acknowledgement and frame counters,
/// which advance together on every outbound DATA frame and are reset only
/// by opening a fresh session.
#[derive(Default)]
pub struct Session {
    ack_num: u8,
    frm_num: u8,
}

impl Session {
    /// Creates a session with both counters at zero
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ack_num: 0,
            frm_num: 0,
        }
    }

    /// Builds a DATA frame around `payload` and advances both counters
    pub fn data_frame(&mut self, payload: &[u8]) -> Buffer {
        let mut body = Buffer::from_array_empty([0; crate::BUFFER_SIZE]);
        body.push((self.ack_num & 0x07) | ((self.frm_num & 0x07) << 4));
        let start = body.len();
        body.extend_from_slice(payload);
        randomize(&mut body[start..]);
        body.extend_from_slice(&CRC16.checksum(&body).to_be_bytes());
        self.ack_num = (self.ack_num + 1) % 8;
        self.frm_num = (self.frm_num + 1) % 8;
        let mut frame = Buffer::from_array_empty([0; crate::BUFFER_SIZE]);
        stuff(&body, &mut frame);
        frame.push(FLAG);
        frame
    }

    /// Writes a DATA frame, reads the paired response and acknowledges it
    /// before returning the de-whitened response payload. No further DATA
    /// frame may go out before that acknowledgement.
    ///
    /// # Errors
    ///
    /// * `Err(Error::Timeout)` when no response frame arrives
    /// * `Err(Error::FrameCrc)` when the response trailer does not match
    /// * `Err(Error::Port)` when the I/O fails with the serial port
    pub fn exchange<P>(&mut self, port: &mut P, payload: &[u8]) -> Result<Buffer, Error>
    where
        P: Read + Write + Flush,
    {
        let frame = self.data_frame(payload);
        trace!("[ash tx] {}", HexDump(&frame));
        port.flush_input()?;
        port.write_all(&frame)?;
        let reply = read_frame(port)?;
        let payload = open_data(&reply)?;
        let ack = ack_frame(reply[0]);
        trace!("[ash tx] {}", HexDump(&ack));
        port.write_all(&ack)?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use crate::ash::{
        ack_frame, checksum, open_data, randomize, read_frame, reset, stuff, unstuff, Session,
        RSTACK_ACK,
    };
    use crate::{Buffer, Error, Flush};
    use std::io;

    /// Half-duplex port over a canned reply
    struct Pipe {
        rx: io::Cursor<Vec<u8>>,
        tx: Vec<u8>,
    }

    impl Pipe {
        fn new(reply: &[u8]) -> Self {
            Self {
                rx: io::Cursor::new(reply.to_vec()),
                tx: Vec::new(),
            }
        }
    }

    impl io::Read for Pipe {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.rx.read(buf)
        }
    }

    impl io::Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Flush for Pipe {
        fn flush_input(&mut self) -> Result<(), Error> {
            Ok(())
        }
    }

    #[rstest::rstest]
    #[case(&[])]
    #[case(&[0x00])]
    #[case(&[0x00, 0x00, 0x00, 0x04])]
    #[case(&[0xFF; 64])]
    #[case(&[0x7E, 0x7D, 0x11, 0x13, 0x18, 0x1A, 0x42])]
    fn test_randomize_involution(#[case] data: &[u8]) {
        let mut once = data.to_vec();
        randomize(&mut once);
        let mut twice = once.clone();
        randomize(&mut twice);
        assert_eq!(twice, data);
    }

    #[test]
    fn test_randomize_sequence() {
        // Whitening a run of zeros exposes the raw LFSR stream.
        let mut data = [0u8; 5];
        randomize(&mut data);
        assert_eq!(data, [0x42, 0x21, 0xA8, 0x54, 0x2A]);
    }

    #[rstest::rstest]
    #[case(&[0x7D], &[0x7D, 0x5D])]
    #[case(&[0x7E], &[0x7D, 0x5E])]
    #[case(&[0x11], &[0x7D, 0x31])]
    #[case(&[0x13], &[0x7D, 0x33])]
    #[case(&[0x18], &[0x7D, 0x38])]
    #[case(&[0x1A], &[0x7D, 0x3A])]
    #[case(&[0x00, 0x7E, 0xFF], &[0x00, 0x7D, 0x5E, 0xFF])]
    fn test_stuff(#[case] data: &[u8], #[case] expected: &[u8]) {
        let mut out = Buffer::default();
        stuff(data, &mut out);
        assert_eq!(out.as_slice(), expected);
        let mut back = Buffer::default();
        unstuff(&out, &mut back);
        assert_eq!(back.as_slice(), data);
    }

    #[test]
    fn test_stuff_leaves_no_flag() {
        let every_byte: Vec<u8> = (0..=0xFF).collect();
        let mut out = Buffer::default();
        stuff(&every_byte, &mut out);
        assert!(!out.contains(&0x7E));
        let mut back = Buffer::default();
        unstuff(&out, &mut back);
        assert_eq!(back.as_slice(), every_byte.as_slice());
    }

    #[test]
    fn test_ack_frame_crc() {
        // CRC-16/CCITT of the single byte 0x80 is 0x2672.
        assert_eq!(checksum(&[0x80]), 0x2672);
        assert_eq!(ack_frame(0x00).as_slice(), [0x80, 0x26, 0x72, 0x7E]);
        // Only the low three bits of the answered control byte survive.
        assert_eq!(ack_frame(0xFB).as_slice()[0], 0x83);
    }

    #[test]
    fn test_counters_advance_together_and_wrap() {
        let mut session = Session::new();
        // Control bytes come back through unstuff because 0x11 and 0x13 are
        // in the reserved set.
        let controls: Vec<u8> = (0..9)
            .map(|_| {
                let frame = session.data_frame(&[0x00]);
                let mut body = Buffer::default();
                unstuff(&frame[..frame.len() - 1], &mut body);
                body[0]
            })
            .collect();
        assert_eq!(controls[0], 0x00);
        assert_eq!(controls[1], 0x11);
        assert_eq!(controls[7], 0x77);
        // Both 3-bit counters return to zero after eight DATA frames.
        assert_eq!(controls[8], 0x00);
    }

    #[test]
    fn test_data_frame_round_trip() {
        let payload = [0x02, 0x00, 0x01, 0xAA, 0x00, 0x11];
        let mut session = Session::new();
        let frame = session.data_frame(&payload);
        assert_eq!(frame.last(), Some(&0x7E));
        let mut body = Buffer::default();
        unstuff(&frame[..frame.len() - 1], &mut body);
        assert_eq!(open_data(&body).unwrap().as_slice(), payload);
    }

    #[test]
    fn test_open_data_rejects_bad_crc() {
        let mut session = Session::new();
        let frame = session.data_frame(&[0x01, 0x02, 0x03, 0x04]);
        let mut body = Buffer::default();
        unstuff(&frame[..frame.len() - 1], &mut body);
        let last = body.len() - 1;
        body[last] ^= 0xFF;
        assert_eq!(open_data(&body), Err(Error::FrameCrc));
        assert_eq!(open_data(&[0xC1, 0x02]), Err(Error::ProtocolMismatch));
    }

    #[test]
    fn test_read_frame_timeout_on_silence() {
        let mut port: &[u8] = &[];
        assert_eq!(read_frame(&mut port), Err(Error::Timeout));
    }

    #[test]
    fn test_reset() {
        let mut reply = RSTACK_ACK.to_vec();
        reply.push(0x7E);
        let mut port = Pipe::new(&reply);
        assert_eq!(reset(&mut port), Ok(()));
        assert!(port.tx.ends_with(&[0x1A, 0xC0, 0x38, 0xBC, 0x7E]));

        let mut port = Pipe::new(&[0xC1, 0x02, 0x0C, 0x0A, 0x52, 0x7E]);
        assert_eq!(reset(&mut port), Err(Error::ResetFailed));

        let mut port = Pipe::new(&[]);
        assert_eq!(reset(&mut port), Err(Error::Timeout));
    }
}
