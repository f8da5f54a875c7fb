// SPDX-License-Identifier: MIT OR Apache-2.0
//! XMODEM-CRC sender for the Gecko bootloader's upload channel. `send`
//! performs a single protocol transaction per call and keeps everything
//! between calls in a [`State`]; drive it until [`Stage::Done`].

use crate::{Error, Read, Write};
use core::convert::TryFrom;
use crc::{Crc, CRC_16_XMODEM};
use log::debug;
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// CRC algorithm for block trailers
const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Payload bytes per block
pub const BLOCK_SIZE: usize = 128;
/// Filler for the tail of a short final block
const PAD: u8 = 0x1A;
/// Start of a 128-byte block
const SOH: u8 = 0x01;
/// End of transmission
const EOT: u8 = 0x04;
/// Resend budget for a single block and for the EOT handshake
const RETRY_LIMIT: u8 = 10;

/// Receiver answers
#[repr(u8)]
#[derive(Clone, Copy, Debug, EnumIter, PartialEq)]
pub enum Answer {
    /// Block accepted
    Ack = 0x06,
    /// Block garbled, send it again
    Nak = 0x15,
    /// Transfer cancelled by the receiver
    Can = 0x18,
}

impl TryFrom<u8> for Answer {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Answer::iter()
            .find(|a| value == *a as u8)
            .ok_or(Error::ProtocolMismatch)
    }
}

/// Transfer stages
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Stage {
    /// Load (or reload) and transmit the next block
    SendBlock,
    /// Await the receiver's answer to the last block
    WaitAck,
    /// All data sent; transmit the end-of-transmission byte
    SendEot,
    /// Await the answer to the end-of-transmission byte
    WaitEotAck,
    Done,
}

/// Sender state for one transfer
#[derive(Debug, PartialEq)]
pub struct State {
    stage: Stage,
    block: u8,
    retries: u8,
    acked: u32,
    len: usize,
    loaded: bool,
    buf: [u8; BLOCK_SIZE],
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Creates the state for a fresh transfer
    #[must_use]
    pub const fn new() -> Self {
        Self {
            stage: Stage::SendBlock,
            block: 1,
            retries: 0,
            acked: 0,
            len: 0,
            loaded: false,
            buf: [0; BLOCK_SIZE],
        }
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Blocks the receiver has accepted so far
    #[must_use]
    pub fn blocks_acked(&self) -> u32 {
        self.acked
    }

    fn retry(&mut self) -> Result<(), Error> {
        self.retries += 1;
        if self.retries > RETRY_LIMIT {
            return Err(Error::UploadFailed);
        }
        self.stage = match self.stage {
            Stage::WaitEotAck => Stage::SendEot,
            _ => Stage::SendBlock,
        };
        Ok(())
    }
}

/// Performs one XMODEM transaction: a block write, an answer read, or a
/// step of the EOT handshake. Call repeatedly until `state.stage()` is
/// [`Stage::Done`].
///
/// # Errors
///
/// * `Err(Error::UploadFailed)` when the receiver cancels or the retry
///   budget runs out
/// * `Err(Error::Port)` when the I/O fails with the serial port
pub fn send<P, F>(port: &mut P, file: &mut F, state: &mut State) -> Result<(), Error>
where
    P: Read + Write,
    F: Read,
{
    match state.stage {
        Stage::SendBlock => {
            if !state.loaded {
                state.len = fill_block(file, &mut state.buf)?;
                state.loaded = true;
            }
            if state.len == 0 {
                state.stage = Stage::SendEot;
                return Ok(());
            }
            write_block(port, state)?;
            state.stage = Stage::WaitAck;
        }
        Stage::WaitAck => match answer(port)? {
            Some(Answer::Ack) => {
                state.block = state.block.wrapping_add(1);
                state.retries = 0;
                state.loaded = false;
                state.acked += 1;
                if state.acked % 20 == 0 {
                    debug!("{} blocks sent", state.acked);
                }
                state.stage = Stage::SendBlock;
            }
            Some(Answer::Can) => return Err(Error::UploadFailed),
            Some(Answer::Nak) | None => state.retry()?,
        },
        Stage::SendEot => {
            port.write_byte(EOT)?;
            state.stage = Stage::WaitEotAck;
        }
        Stage::WaitEotAck => match answer(port)? {
            Some(Answer::Ack) => state.stage = Stage::Done,
            Some(Answer::Can) => return Err(Error::UploadFailed),
            Some(Answer::Nak) | None => state.retry()?,
        },
        Stage::Done => {}
    }
    Ok(())
}

/// Reads the receiver's answer; a closed read window or an unknown byte
/// counts as no answer, which the caller treats like a NAK
fn answer<P>(port: &mut P) -> Result<Option<Answer>, Error>
where
    P: Read,
{
    match port.read_byte() {
        Ok(byte) => Ok(Answer::try_from(byte).ok()),
        Err(Error::Timeout) => Ok(None),
        Err(err) => Err(err),
    }
}

/// Fills `buf` from the image, padding the tail of a short final block.
/// Returns how many image bytes went in.
fn fill_block<F>(file: &mut F, buf: &mut [u8; BLOCK_SIZE]) -> Result<usize, Error>
where
    F: Read,
{
    let mut len = 0;
    while len < BLOCK_SIZE {
        let count = file.read(&mut buf[len..])?;
        if count == 0 {
            break;
        }
        len += count as usize;
    }
    buf[len..].fill(PAD);
    Ok(len)
}

fn write_block<P>(port: &mut P, state: &State) -> Result<(), Error>
where
    P: Write,
{
    let mut frame = [0u8; BLOCK_SIZE + 5];
    frame[0] = SOH;
    frame[1] = state.block;
    frame[2] = 0xFF - state.block;
    frame[3..BLOCK_SIZE + 3].copy_from_slice(&state.buf);
    let crc = CRC16.checksum(&state.buf).to_be_bytes();
    frame[BLOCK_SIZE + 3] = crc[0];
    frame[BLOCK_SIZE + 4] = crc[1];
    port.write_all(&frame)
}
