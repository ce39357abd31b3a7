//! Scripted in-memory port for driving the stack without hardware.
//!
//! Clones share state, so a test can hand one clone to the driver and keep
//! another to feed input and inspect what was written.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::port::UartPort;

#[derive(Debug, Default)]
struct MockState {
    rx: VecDeque<u8>,
    written: Vec<u8>,
    write_sizes: Vec<usize>,
    max_write: Option<usize>,
    fail_writes: bool,
    fail_reads: bool,
    speed: u32,
    resets: u32,
    read_resets: u32,
    read_restarts: u32,
}

/// In-memory [`UartPort`] with scripted input and captured output.
#[derive(Clone, Debug, Default)]
pub struct MockPort {
    state: Arc<Mutex<MockState>>,
}

impl MockPort {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps every write at `max` bytes to exercise partial writes.
    pub fn with_max_write(max: usize) -> Self {
        let port = Self::default();
        port.state.lock().max_write = Some(max.max(1));
        port
    }

    /// Appends bytes to the input stream.
    pub fn push_rx(&self, bytes: &[u8]) {
        self.state.lock().rx.extend(bytes.iter().copied());
    }

    /// Bytes still waiting to be read.
    pub fn pending_rx(&self) -> usize {
        self.state.lock().rx.len()
    }

    /// Drains everything written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.state.lock().written)
    }

    /// Sizes of the individual writes accepted so far.
    pub fn write_sizes(&self) -> Vec<usize> {
        self.state.lock().write_sizes.clone()
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state.lock().fail_writes = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state.lock().fail_reads = fail;
    }

    pub fn speed(&self) -> u32 {
        self.state.lock().speed
    }

    pub fn resets(&self) -> u32 {
        self.state.lock().resets
    }

    pub fn read_resets(&self) -> u32 {
        self.state.lock().read_resets
    }

    pub fn read_restarts(&self) -> u32 {
        self.state.lock().read_restarts
    }
}

impl UartPort for MockPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write failure"));
        }
        let n = state.max_write.map_or(bytes.len(), |max| bytes.len().min(max));
        state.written.extend_from_slice(&bytes[..n]);
        state.write_sizes.push(n);
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state.lock();
        if state.fail_reads {
            return Err(io::Error::new(io::ErrorKind::Other, "mock read failure"));
        }
        let n = buf.len().min(state.rx.len());
        for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn bytes_available(&self) -> usize {
        self.state.lock().rx.len()
    }

    fn reset_read(&mut self) -> io::Result<()> {
        let mut state = self.state.lock();
        state.rx.clear();
        state.read_resets += 1;
        Ok(())
    }

    fn restart_read(&mut self) -> io::Result<()> {
        self.state.lock().read_restarts += 1;
        Ok(())
    }

    fn set_speed(&mut self, baud: u32) -> io::Result<()> {
        self.state.lock().speed = baud;
        Ok(())
    }

    fn reset(&mut self, baud: u32) -> io::Result<()> {
        let mut state = self.state.lock();
        state.rx.clear();
        state.speed = baud;
        state.resets += 1;
        Ok(())
    }
}
