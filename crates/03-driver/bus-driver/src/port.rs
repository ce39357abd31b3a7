//! UART collaborator contract consumed by the bus driver.

use std::io;

/// Notifications a port raises toward the thread that owns the driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortEvent {
    /// A previously accepted write has left the port.
    WriteComplete,
    /// Input bytes are waiting to be read.
    ReadReady,
}

/// Byte-level serial port.
///
/// Every successful `write` is followed by exactly one
/// [`PortEvent::WriteComplete`], delivered out of band by the port
/// implementation, also when the port is reset before the write drains.
/// None of the calls may block.
pub trait UartPort: Send {
    /// Starts writing `bytes`; returns how many were accepted.
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize>;

    /// Reads up to `buf.len()` buffered bytes; returns 0 when none are waiting.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Number of bytes that a `read` can return right now.
    fn bytes_available(&self) -> usize;

    /// Drops buffered input and restarts reception; used after a read failure.
    fn reset_read(&mut self) -> io::Result<()>;

    /// Resumes reception after the driver stopped reading.
    fn restart_read(&mut self) -> io::Result<()>;

    /// Changes the line speed.
    fn set_speed(&mut self, baud: u32) -> io::Result<()>;

    /// Re-initializes the port at `baud`, dropping buffered input.
    fn reset(&mut self, baud: u32) -> io::Result<()>;
}

impl<P: UartPort + ?Sized> UartPort for Box<P> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        (**self).write(bytes)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read(buf)
    }

    fn bytes_available(&self) -> usize {
        (**self).bytes_available()
    }

    fn reset_read(&mut self) -> io::Result<()> {
        (**self).reset_read()
    }

    fn restart_read(&mut self) -> io::Result<()> {
        (**self).restart_read()
    }

    fn set_speed(&mut self, baud: u32) -> io::Result<()> {
        (**self).set_speed(baud)
    }

    fn reset(&mut self, baud: u32) -> io::Result<()> {
        (**self).reset(baud)
    }
}
