use serialport::{ClearBuffer, SerialPort};
use std::io::{self, Read, Write};
use std::time::Duration;

/// Byte channel to the BMS console.
///
/// Implemented for real serial ports and for `MockSerialPort`. Reads must
/// return `io::ErrorKind::TimedOut` when nothing arrives within the read
/// timeout, which is how `serialport` reports an idle line.
pub trait SerialLink: Read + Write + Send {
    /// Drops everything the device has sent that has not been read yet.
    fn discard_input(&mut self) -> io::Result<()>;

    /// Sets how long a single `read` may block.
    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

impl SerialLink for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.set_timeout(timeout).map_err(io::Error::from)
    }
}
