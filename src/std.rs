// SPDX-License-Identifier: MIT OR Apache-2.0
//! Std glue: the crate's I/O traits for every `std::io` type, plus the
//! `serialport`-backed line the controller runs on. The blanket impls let
//! byte slices, `Vec<u8>`, cursors and files stand in for ports and image
//! sources in tests.

use crate::control::Lane;
use crate::{Error, Flush, HexDump, Read, Write};
use ::std::io;
use ::std::string::String;
use ::std::thread::sleep;
use ::std::time::Duration;
use log::{error, trace};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

/// Read window on the serial line
const READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Gap the bootloader needs between consecutive writes during an upload
const WRITE_PACING: Duration = Duration::from_millis(1);

fn map_read_err(err: &io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::UnexpectedEof => {
            Error::Timeout
        }
        _ => Error::Port,
    }
}

impl<R: io::Read> Read for R {
    fn read(&mut self, buf: &mut [u8]) -> Result<u32, Error> {
        match io::Read::read(self, buf) {
            Ok(count) => u32::try_from(count).map_err(|_| Error::Port),
            Err(err) => Err(map_read_err(&err)),
        }
    }

    fn read_byte(&mut self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        io::Read::read_exact(self, &mut byte).map_err(|err| map_read_err(&err))?;
        Ok(byte[0])
    }
}

impl<W: io::Write> Write for W {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), Error> {
        io::Write::write_all(self, buf).map_err(|_| Error::Port)
    }
}

/// One open serial session: 8N1, software flow control, 3 second read
/// window. Closing is dropping.
pub struct SerialLine {
    port: Box<dyn SerialPort>,
}

impl SerialLine {
    /// Opens `path` at `baud`
    ///
    /// # Errors
    ///
    /// * `Err(Error::Port)` when the OS refuses the port
    pub fn open(path: &str, baud: u32) -> Result<Self, Error> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::Software)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|err| {
                error!("PORT ERROR: {err}");
                Error::Port
            })?;
        Ok(Self { port })
    }
}

impl io::Read for SerialLine {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = io::Read::read(&mut self.port, buf)?;
        if count > 0 {
            trace!("[serial rx] {}", HexDump(&buf[..count]));
        }
        Ok(count)
    }
}

impl io::Write for SerialLine {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let count = self.port.write(buf)?;
        trace!("[serial tx] {}", HexDump(&buf[..count]));
        sleep(WRITE_PACING);
        Ok(count)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Flush for SerialLine {
    fn flush_input(&mut self) -> Result<(), Error> {
        self.port.clear(ClearBuffer::Input).map_err(|_| Error::Port)
    }
}

/// Lane over a named serial device; every open is a fresh session
pub struct SerialLane {
    path: String,
}

impl SerialLane {
    #[must_use]
    pub fn new(path: &str) -> Self {
        Self { path: path.into() }
    }
}

impl Lane for SerialLane {
    type Port = SerialLine;

    fn open(&mut self, baud: u32) -> Result<SerialLine, Error> {
        SerialLine::open(&self.path, baud)
    }
}
