// SPDX-License-Identifier: MIT OR Apache-2.0
//! The mode controller: probes which of the three endpoints is listening,
//! moves the device between application and bootloader, and drives the
//! firmware upload against the bootloader's ASCII menu.

use crate::{ezsp, spinel, xmodem, Error, Flush, Read, Write};
use log::{debug, error, info};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// The bootloader menu always runs at this rate, whatever the application
/// firmware was configured for
const BOOTLOADER_BAUD: u32 = 115_200;

/// Pause after ordering a reboot, before probing again
const REBOOT_SETTLE: Duration = Duration::from_secs(2);
/// Pause between closing a session and reopening at another rate
const REOPEN_SETTLE: Duration = Duration::from_secs(1);
/// How long the bootloader gets to raise its XMODEM ready heartbeat
const READY_BUDGET: Duration = Duration::from_secs(10);
/// Pause after the first ready byte, while the menu finishes printing
const READY_SETTLE: Duration = Duration::from_secs(5);
/// Pause after the last transferred block, before ordering the reboot
const FLASH_SETTLE: Duration = Duration::from_secs(4);

/// What the probe found behind the port
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdapterMode {
    /// An `EmberZNet` stack answered over EZSP
    Zigbee,
    /// An `OpenThread` stack answered over Spinel
    Thread,
    /// The Gecko bootloader menu answered
    Bootloader,
    /// Nothing answered
    Error,
}

/// Where `restart` should leave the device
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Target {
    Bootloader,
    Normal,
}

/// Radio protocol selection for `update`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Zigbee,
    Thread,
}

/// Everything one probe learned
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    pub mode: AdapterMode,
    /// Board name, when the adapter self-identifies as an Elelabs product
    pub board: Option<String>,
    /// Firmware version, or the bootloader banner line
    pub firmware: Option<String>,
}

/// Serial channel factory. Opens the device at a given rate — probing hops
/// between the configured rate and the bootloader's fixed one — and owns
/// the wall-clock pauses between sessions. A session ends when the port
/// value drops, so every open is paired with a close on every exit path.
pub trait Lane {
    type Port: Read + Write + Flush;

    /// Opens a fresh session on the device
    ///
    /// # Errors
    ///
    /// * `Err(Error::Port)` when the OS refuses the port
    fn open(&mut self, baud: u32) -> Result<Self::Port, Error>;

    /// Blocks while the device reboots or drains its output
    fn settle(&mut self, wait: Duration) {
        std::thread::sleep(wait);
    }
}

/// Board-to-image mapping for [`Controller::update`]; which image fits
/// which product is the surrounding driver's knowledge
pub trait Catalog {
    /// Path of the image that brings `board` to `protocol`, when the board
    /// is a known product
    fn image(&self, board: &str, protocol: Protocol) -> Option<PathBuf>;
}

/// Drives one NCP through probe, restart, flash and update
pub struct Controller<L: Lane> {
    lane: L,
    baud: u32,
}

impl<L: Lane> Controller<L> {
    #[must_use]
    pub const fn new(lane: L, baud: u32) -> Self {
        Self { lane, baud }
    }

    /// Classifies the device: EZSP first, Spinel on the same session next,
    /// the bootloader menu at its fixed rate last. A device that answered
    /// one protocol is never offered another.
    ///
    /// # Errors
    ///
    /// * `Err(Error::Port)` when the OS-level I/O fails; every in-protocol
    ///   failure classifies the device instead of surfacing
    pub fn probe(&mut self) -> Result<ProbeReport, Error> {
        let mut port = self.lane.open(self.baud)?;
        let mut session = ezsp::Session::new();
        match session.init(&mut port) {
            Ok(()) => return Self::classify_zigbee(&mut port, &mut session),
            Err(Error::Port) => return Err(Error::Port),
            Err(_) => debug!("no EZSP endpoint, trying spinel"),
        }
        let mut session = spinel::Session::new();
        match session.init(&mut port) {
            Ok(()) => return Self::classify_thread(&mut port, &session),
            Err(Error::Port) => return Err(Error::Port),
            Err(_) => debug!("no spinel endpoint, trying the bootloader menu"),
        }
        if self.baud != BOOTLOADER_BAUD {
            drop(port);
            self.lane.settle(REOPEN_SETTLE);
            port = self.lane.open(BOOTLOADER_BAUD)?;
        }
        Self::classify_bootloader(&mut port)
    }

    fn classify_zigbee(
        port: &mut L::Port,
        session: &mut ezsp::Session,
    ) -> Result<ProbeReport, Error> {
        let firmware = match session.get_value(port, ezsp::VALUE_VERSION_INFO)? {
            (0, value) if value.len() >= 5 => Some(format!(
                "{}.{}.{}-{}",
                value[2], value[3], value[4], value[0]
            )),
            (status, _) => {
                info!("EZSP status returned {status}");
                None
            }
        };
        let vendor = session.get_mfg_token(port, ezsp::MFG_STRING)?;
        let board = if ascii(&vendor) == "Elelabs" {
            let name = ascii(&session.get_mfg_token(port, ezsp::MFG_BOARD_NAME)?);
            info!("Elelabs Zigbee adapter detected:");
            info!("Adapter: {name}");
            Some(name)
        } else {
            info!("Generic Zigbee EZSP adapter detected:");
            None
        };
        if let Some(firmware) = &firmware {
            info!("Firmware: {firmware}");
        }
        info!("EZSP v{}", session.version());
        Ok(ProbeReport {
            mode: AdapterMode::Zigbee,
            board,
            firmware,
        })
    }

    fn classify_thread(port: &mut L::Port, session: &spinel::Session) -> Result<ProbeReport, Error> {
        let firmware = ascii(&spinel::prop_value_get(port, spinel::PROP_NCP_VERSION)?);
        let vendor = ascii(&spinel::prop_value_get(port, spinel::PROP_MFG_STRING)?);
        let board = if vendor == "Elelabs" {
            let name = ascii(&spinel::prop_value_get(port, spinel::PROP_MFG_BOARD_NAME)?);
            info!("Elelabs Thread adapter detected:");
            info!("Adapter: {name}");
            Some(name)
        } else {
            info!("Generic Thread adapter detected:");
            None
        };
        info!("Firmware: {firmware}");
        info!("SPINEL v{}", session.version());
        Ok(ProbeReport {
            mode: AdapterMode::Thread,
            board,
            firmware: Some(firmware),
        })
    }

    fn classify_bootloader(port: &mut L::Port) -> Result<ProbeReport, Error> {
        port.write_byte(0x0D)?;
        let first = read_line(port)?;
        if first.is_empty() {
            info!(
                "Couldn't communicate with the adapter in Zigbee (EZSP) mode, \
                 Thread (Spinel) mode or bootloader mode"
            );
            return Ok(ProbeReport {
                mode: AdapterMode::Error,
                board: None,
                firmware: None,
            });
        }
        let banner = ascii(&read_line(port)?).trim_end().to_string();
        info!("EZSP adapter in bootloader mode detected:");
        info!("{banner}");
        Ok(ProbeReport {
            mode: AdapterMode::Bootloader,
            board: None,
            firmware: Some(banner),
        })
    }

    /// Moves the device to `target` mode, probing first and skipping the
    /// transition when it is already there.
    ///
    /// # Errors
    ///
    /// * `Err(Error::BootloaderEntryFailed)` when the device would not
    ///   enter the bootloader
    /// * `Err(Error::NotSupported)` for third-party Thread devices, which
    ///   have no known in-band bootloader entry
    /// * `Err(Error::Timeout)` when the device stops answering entirely
    /// * `Err(Error::ProtocolMismatch)` when it comes back in a mode other
    ///   than the requested one
    /// * `Err(Error::Port)` when the OS-level I/O fails
    pub fn restart(&mut self, target: Target) -> Result<(), Error> {
        let report = self.probe()?;
        match (report.mode, target) {
            (AdapterMode::Zigbee | AdapterMode::Thread, Target::Bootloader) => {
                self.enter_bootloader(&report)
            }
            (AdapterMode::Zigbee | AdapterMode::Thread, Target::Normal) => {
                info!("Already in normal mode. No need to restart");
                Ok(())
            }
            (AdapterMode::Bootloader, Target::Bootloader) => {
                info!("Already in bootloader mode. No need to restart");
                Ok(())
            }
            (AdapterMode::Bootloader, Target::Normal) => self.leave_bootloader(),
            (AdapterMode::Error, _) => Err(Error::Timeout),
        }
    }

    fn enter_bootloader(&mut self, report: &ProbeReport) -> Result<(), Error> {
        info!("Launch in bootloader mode");
        match self.launch_bootloader(report) {
            Ok(()) => {}
            Err(err @ (Error::Port | Error::NotSupported)) => return Err(err),
            Err(_) => {
                error!("Error launching the adapter in bootloader mode");
                return Err(Error::BootloaderEntryFailed);
            }
        }
        self.lane.settle(REBOOT_SETTLE);
        if self.probe()?.mode == AdapterMode::Bootloader {
            Ok(())
        } else {
            Err(Error::BootloaderEntryFailed)
        }
    }

    /// Orders the running stack to reboot into the bootloader, over
    /// whichever protocol the probe classified
    fn launch_bootloader(&mut self, report: &ProbeReport) -> Result<(), Error> {
        let mut port = self.lane.open(self.baud)?;
        if report.mode == AdapterMode::Zigbee {
            let mut session = ezsp::Session::new();
            session.init(&mut port)?;
            let status = session.launch_bootloader(&mut port, ezsp::BOOTLOADER_NORMAL_MODE)?;
            if status != 0 {
                return Err(Error::BootloaderEntryFailed);
            }
        } else {
            if report.board.is_none() {
                error!(
                    "No Elelabs Thread product detected. We don't know how to force it \
                     into bootloader mode. Manually launch the product into bootloader mode"
                );
                return Err(Error::NotSupported);
            }
            let mut session = spinel::Session::new();
            session.init(&mut port)?;
            spinel::launch_bootloader(&mut port)?;
        }
        Ok(())
    }

    fn leave_bootloader(&mut self) -> Result<(), Error> {
        info!("Launch in normal application mode");
        {
            let mut port = self.lane.open(BOOTLOADER_BAUD)?;
            port.write_byte(b'2')?;
        }
        self.lane.settle(REBOOT_SETTLE);
        match self.probe()?.mode {
            AdapterMode::Zigbee | AdapterMode::Thread => Ok(()),
            AdapterMode::Error => Err(Error::Timeout),
            AdapterMode::Bootloader => Err(Error::ProtocolMismatch),
        }
    }

    /// Uploads a Gecko bootloader image: enters the bootloader, selects
    /// the upload menu item, waits for the XMODEM ready heartbeat, streams
    /// the image, and reboots into the application.
    ///
    /// # Errors
    ///
    /// * `Err(Error::InvalidImage)` when the file is not a readable
    ///   `.gbl`/`.ebl` container
    /// * `Err(Error::BootloaderEntryFailed)` when the device would not
    ///   enter the bootloader
    /// * `Err(Error::Timeout)` when the ready heartbeat never arrives
    /// * `Err(Error::UploadFailed)` when the transfer does not complete
    /// * `Err(Error::Port)` when the OS-level I/O fails
    pub fn flash(&mut self, image: &Path) -> Result<(), Error> {
        if !matches!(
            image.extension().and_then(|e| e.to_str()),
            Some("gbl" | "ebl")
        ) {
            error!("Aborted! Gecko bootloader accepts .gbl or .ebl images only.");
            return Err(Error::InvalidImage);
        }
        self.restart(Target::Bootloader).map_err(|err| match err {
            Error::Port => Error::Port,
            _ => {
                error!("Adapter not in the bootloader mode. Can't perform update procedure");
                Error::BootloaderEntryFailed
            }
        })?;
        let mut file = File::open(image).map_err(|_| Error::InvalidImage)?;
        let mut port = self.lane.open(BOOTLOADER_BAUD)?;
        // Menu item 1: upload GBL
        port.write_byte(0x0A)?;
        port.write_byte(b'1')?;
        let _ = read_line(&mut port)?;
        let _ = read_line(&mut port)?;
        info!(
            "Successfully restarted into X-MODEM mode! Starting upload of the \
             new firmware... DO NOT INTERRUPT(!)"
        );
        self.wait_ready(&mut port)?;
        let mut state = xmodem::State::new();
        loop {
            match xmodem::send(&mut port, &mut file, &mut state) {
                Ok(()) if state.stage() == xmodem::Stage::Done => break,
                Ok(()) => {}
                Err(Error::Port) => return Err(Error::Port),
                Err(_) => {
                    error!(
                        "Firmware upload failed. Please try a correct firmware \
                         image or restart in normal mode."
                    );
                    return Err(Error::UploadFailed);
                }
            }
        }
        info!("Firmware upload complete");
        info!("Rebooting NCP...");
        self.lane.settle(FLASH_SETTLE);
        port.write_byte(b'2')?;
        drop(port);
        self.lane.settle(REBOOT_SETTLE);
        // Best effort: show what came back up
        let _ = self.probe();
        Ok(())
    }

    /// Waits for the receiver's `C` heartbeat, then lets the menu finish
    /// printing and drains the extra ready bytes before the first block
    fn wait_ready(&mut self, port: &mut L::Port) -> Result<(), Error> {
        let deadline = Instant::now() + READY_BUDGET;
        loop {
            match port.read_byte() {
                Ok(b'C') => break,
                Ok(_) | Err(Error::Timeout) => {}
                Err(err) => return Err(err),
            }
            if Instant::now() >= deadline {
                info!("Failed to restart into bootloader mode. Please see users guide.");
                return Err(Error::Timeout);
            }
        }
        self.lane.settle(READY_SETTLE);
        port.flush_input()
    }

    /// Brings an Elelabs product to the packaged firmware for `protocol`,
    /// looking the image up in the caller's catalog.
    ///
    /// # Errors
    ///
    /// * `Err(Error::NotSupported)` when the adapter is generic or the
    ///   catalog does not know the board
    /// * `Err(Error::ProtocolMismatch)` when the device sits in the
    ///   bootloader instead of an application stack
    /// * any [`Controller::flash`] error
    pub fn update<C: Catalog>(&mut self, protocol: Protocol, catalog: &C) -> Result<(), Error> {
        let report = self.probe()?;
        match report.mode {
            AdapterMode::Zigbee | AdapterMode::Thread => {}
            AdapterMode::Bootloader => {
                error!(
                    "The product is not in the normal mode. 'restart' into normal \
                     mode or use 'flash' instead"
                );
                return Err(Error::ProtocolMismatch);
            }
            AdapterMode::Error => {
                error!("No upgradable device found");
                return Err(Error::Timeout);
            }
        }
        let Some(board) = report.board else {
            error!("No Elelabs product detected. Use 'flash' for generic EZSP products.");
            return Err(Error::NotSupported);
        };
        let Some(image) = catalog.image(&board, protocol) else {
            error!("Unknown Elelabs product {board} detected.");
            return Err(Error::NotSupported);
        };
        self.flash(&image)
    }
}

/// Printable rendering of a token or property value: non-ASCII bytes are
/// dropped and padding NULs trimmed
fn ascii(data: &[u8]) -> String {
    let text: String = data
        .iter()
        .copied()
        .filter(u8::is_ascii)
        .map(char::from)
        .collect();
    text.trim_end_matches('\0').to_string()
}

/// Reads one newline-terminated menu line, returning whatever arrived
/// before the newline or the read window closing
fn read_line<P>(port: &mut P) -> Result<Vec<u8>, Error>
where
    P: Read,
{
    let mut line = Vec::new();
    loop {
        match port.read_byte() {
            Ok(byte) => {
                line.push(byte);
                if byte == b'\n' {
                    break;
                }
            }
            Err(Error::Timeout) => break,
            Err(err) => return Err(err),
        }
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use crate::control::ascii;

    #[test]
    fn test_ascii_rendering() {
        assert_eq!(ascii(b"Elelabs\x00\x00"), "Elelabs");
        assert_eq!(ascii(b"ELU0143"), "ELU0143");
        assert_eq!(ascii(b"OT\xFFRCP"), "OTRCP");
        assert_eq!(ascii(b""), "");
    }
}
