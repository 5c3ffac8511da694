//! Byte pipe to the board and the means to open one.

use std::io::{self, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};

/// A bidirectional byte stream with a receive timeout.
pub trait Transport: Send {
    /// Writes every byte and flushes.
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Reads whatever is available, waiting at most the current timeout.
    /// Returns `Ok(0)` if nothing arrived.
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Discards anything already received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;
}

impl Transport for Box<dyn SerialPort> {
    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        Write::write_all(self, bytes)?;
        Write::flush(self)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match Read::read(self, buf) {
            Ok(n) => Ok(n),
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        SerialPort::set_timeout(&mut **self, timeout).map_err(io::Error::from)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

/// Opens transports; lets the connection layer run against real hardware or
/// the simulator alike.
pub trait Connector: Send {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, serialport::Error>;
}

/// Opens real serial ports through `serialport`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialConnector;

impl Connector for SerialConnector {
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, serialport::Error> {
        let port = serialport::new(port, baud_rate).timeout(timeout).open()?;
        Ok(Box::new(port))
    }
}
