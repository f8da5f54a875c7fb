// SPDX-License-Identifier: MIT OR Apache-2.0
//! EZSP application transport over ASH. The frame header changes shape
//! with the negotiated protocol version, so the session tracks both the
//! wrapping sequence byte and the version committed during init.

use crate::{ash, Buffer, Error, Flush, HexDump, Read, Write};
use log::debug;

/// Commands driven by the update engine
const VERSION: u16 = 0x0000;
const GET_VALUE: u16 = 0x00AA;
const GET_MFG_TOKEN: u16 = 0x000B;
const LAUNCH_STANDALONE_BOOTLOADER: u16 = 0x008F;

/// `getValue` identifier of the firmware version record
pub const VALUE_VERSION_INFO: u8 = 0x11;
/// Manufacturing token holding the vendor string
pub const MFG_STRING: u8 = 0x01;
/// Manufacturing token holding the board name
pub const MFG_BOARD_NAME: u8 = 0x02;
/// `launchStandaloneBootloader` argument: plain reboot into the bootloader
pub const BOOTLOADER_NORMAL_MODE: u8 = 1;

/// First protocol version offered during negotiation; every stack answers
/// a `version` command shaped for it
const INITIAL_VERSION: u8 = 4;

/// One EZSP session: sequence counter, negotiated version and the ASH
/// session underneath
pub struct Session {
    ash: ash::Session,
    sequence: u8,
    version: u8,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    /// Creates a session that speaks the initial protocol version until
    /// [`Session::init`] negotiates a newer one
    #[must_use]
    pub const fn new() -> Self {
        Self {
            ash: ash::Session::new(),
            sequence: 0,
            version: INITIAL_VERSION,
        }
    }

    /// Protocol version the session currently frames for
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Lays out the version-dependent header, the command identifier and
    /// its arguments
    fn frame(&mut self, command: u16, args: &[u8]) -> Buffer {
        let mut frame = Buffer::default();
        frame.push(self.sequence);
        self.sequence = (self.sequence + 1) % 255;
        frame.push(0x00);
        let id = command.to_le_bytes();
        if self.version >= 8 {
            frame.push(0x01);
            frame.extend_from_slice(&id);
        } else if self.version >= 5 {
            frame.push(0xFF);
            frame.push(0x00);
            frame.push(id[0]);
        } else {
            frame.push(id[0]);
        }
        frame.extend_from_slice(args);
        debug!("[ezsp tx] {}", HexDump(&frame));
        frame
    }

    fn command<P>(
        &mut self,
        port: &mut P,
        name: &str,
        command: u16,
        args: &[u8],
    ) -> Result<Buffer, Error>
    where
        P: Read + Write + Flush,
    {
        debug!("{name}");
        let frame = self.frame(command, args);
        self.ash.exchange(port, &frame)
    }

    /// `version` — offers `desired` and returns the version the stack
    /// reports back
    ///
    /// # Errors
    ///
    /// * `Err(Error::ProtocolMismatch)` when the reply is too short
    /// * any [`ash::Session::exchange`] error
    pub fn send_version<P>(&mut self, port: &mut P, desired: u8) -> Result<u8, Error>
    where
        P: Read + Write + Flush,
    {
        let resp = self.command(port, "version", VERSION, &[desired])?;
        resp.get(3).copied().ok_or(Error::ProtocolMismatch)
    }

    /// `getValue` — returns the stack's status byte and the value bytes
    ///
    /// # Errors
    ///
    /// * `Err(Error::ProtocolMismatch)` when the reply is too short
    /// * any [`ash::Session::exchange`] error
    pub fn get_value<P>(&mut self, port: &mut P, value_id: u8) -> Result<(u8, Buffer), Error>
    where
        P: Read + Write + Flush,
    {
        let resp = self.command(port, "getValue", GET_VALUE, &[value_id])?;
        let status = *resp.get(5).ok_or(Error::ProtocolMismatch)?;
        let len = usize::from(*resp.get(6).ok_or(Error::ProtocolMismatch)?);
        let data = resp.get(7..).ok_or(Error::ProtocolMismatch)?;
        let mut value = Buffer::default();
        value.extend_from_slice(&data[..len.min(data.len())]);
        Ok((status, value))
    }

    /// `getMfgToken` — returns the token bytes
    ///
    /// # Errors
    ///
    /// * `Err(Error::ProtocolMismatch)` when the reply is too short
    /// * any [`ash::Session::exchange`] error
    pub fn get_mfg_token<P>(&mut self, port: &mut P, token_id: u8) -> Result<Buffer, Error>
    where
        P: Read + Write + Flush,
    {
        let resp = self.command(port, "getMfgToken", GET_MFG_TOKEN, &[token_id])?;
        let len = usize::from(*resp.get(5).ok_or(Error::ProtocolMismatch)?);
        let data = resp.get(6..).ok_or(Error::ProtocolMismatch)?;
        let mut token = Buffer::default();
        token.extend_from_slice(&data[..len.min(data.len())]);
        Ok(token)
    }

    /// `launchStandaloneBootloader` — returns the stack's status byte;
    /// zero means the reboot is under way
    ///
    /// # Errors
    ///
    /// * `Err(Error::ProtocolMismatch)` when the reply is too short
    /// * any [`ash::Session::exchange`] error
    pub fn launch_bootloader<P>(&mut self, port: &mut P, mode: u8) -> Result<u8, Error>
    where
        P: Read + Write + Flush,
    {
        let resp = self.command(
            port,
            "launchStandaloneBootloader",
            LAUNCH_STANDALONE_BOOTLOADER,
            &[mode],
        )?;
        resp.get(5).copied().ok_or(Error::ProtocolMismatch)
    }

    /// Resets the link and negotiates the protocol version. When the stack
    /// reports something other than v4, `version` is sent once more and the
    /// new header layout is committed for every later frame.
    ///
    /// # Errors
    ///
    /// * `Err(Error::NotEzsp)` when nothing EZSP-shaped answers the reset
    /// * `Err(Error::Port)` when the I/O fails with the serial port
    /// * any [`Session::send_version`] error
    pub fn init<P>(&mut self, port: &mut P) -> Result<(), Error>
    where
        P: Read + Write + Flush,
    {
        match ash::reset(port) {
            Ok(()) => {}
            Err(Error::Port) => return Err(Error::Port),
            Err(_) => return Err(Error::NotEzsp),
        }
        let reported = self.send_version(port, INITIAL_VERSION)?;
        debug!("EZSP v{reported} detected");
        self.version = reported;
        if reported != INITIAL_VERSION {
            self.send_version(port, reported)?;
        }
        Ok(())
    }
}
