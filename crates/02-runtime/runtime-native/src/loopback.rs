//! In-memory UART link with a scriptable chip side.
//!
//! The host half is a [`UartPort`] that raises [`PortEvent`]s the same way a
//! real serial backend would: one `WriteComplete` per accepted write and a
//! `ReadReady` whenever the chip side injects bytes.

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bus_driver::{PortEvent, UartPort};
use crossbeam_channel::{unbounded, Receiver, Sender};
use log::trace;
use parking_lot::Mutex;

#[derive(Default)]
struct Link {
    to_host: VecDeque<u8>,
    from_host: Vec<u8>,
    speed: u32,
    resets: u32,
}

/// Host side of the loopback link.
pub struct LoopbackPort {
    link: Arc<Mutex<Link>>,
    events: Sender<PortEvent>,
    max_write: usize,
}

/// Chip side of the loopback link, driven by tests and demos.
#[derive(Clone)]
pub struct ChipEnd {
    link: Arc<Mutex<Link>>,
    events: Sender<PortEvent>,
}

/// Creates a linked port pair; writes larger than `max_write` are split.
pub fn loopback(max_write: usize) -> (LoopbackPort, ChipEnd, Receiver<PortEvent>) {
    let link = Arc::new(Mutex::new(Link::default()));
    let (events, port_events) = unbounded();
    let port = LoopbackPort {
        link: Arc::clone(&link),
        events: events.clone(),
        max_write: max_write.max(1),
    };
    (port, ChipEnd { link, events }, port_events)
}

impl UartPort for LoopbackPort {
    fn write(&mut self, bytes: &[u8]) -> io::Result<usize> {
        let n = bytes.len().min(self.max_write);
        self.link.lock().from_host.extend_from_slice(&bytes[..n]);
        trace!("loopback: host wrote {n} bytes");
        self.events
            .send(PortEvent::WriteComplete)
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "port event receiver gone"))?;
        Ok(n)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut link = self.link.lock();
        let n = buf.len().min(link.to_host.len());
        for (slot, byte) in buf.iter_mut().zip(link.to_host.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn bytes_available(&self) -> usize {
        self.link.lock().to_host.len()
    }

    fn reset_read(&mut self) -> io::Result<()> {
        self.link.lock().to_host.clear();
        Ok(())
    }

    fn restart_read(&mut self) -> io::Result<()> {
        if !self.link.lock().to_host.is_empty() {
            let _ = self.events.send(PortEvent::ReadReady);
        }
        Ok(())
    }

    fn set_speed(&mut self, baud: u32) -> io::Result<()> {
        self.link.lock().speed = baud;
        Ok(())
    }

    fn reset(&mut self, baud: u32) -> io::Result<()> {
        let mut link = self.link.lock();
        link.to_host.clear();
        link.speed = baud;
        link.resets += 1;
        Ok(())
    }
}

impl ChipEnd {
    /// Queues bytes toward the host and raises `ReadReady`.
    pub fn inject(&self, bytes: &[u8]) {
        self.link.lock().to_host.extend(bytes.iter().copied());
        let _ = self.events.send(PortEvent::ReadReady);
    }

    /// Drains what the host has written so far.
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.link.lock().from_host)
    }

    /// Waits until the host has written at least `len` bytes, then drains them all.
    ///
    /// Returns whatever was written when `timeout` expires first.
    pub fn wait_written(&self, len: usize, timeout: Duration) -> Vec<u8> {
        let deadline = Instant::now() + timeout;
        while self.link.lock().from_host.len() < len && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        self.take_written()
    }

    /// Line speed last applied by the host.
    pub fn speed(&self) -> u32 {
        self.link.lock().speed
    }

    /// Number of full port resets the host performed.
    pub fn resets(&self) -> u32 {
        self.link.lock().resets
    }
}
