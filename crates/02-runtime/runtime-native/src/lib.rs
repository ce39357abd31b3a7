#![deny(missing_docs)]
//! Native host for the shared transport.
//!
//! [`NativeTransport`] moves a [`TransportEngine`] onto a dedicated I/O
//! thread. Callers talk to it through a request inbox; the port backend feeds
//! it [`PortEvent`]s. Completed sends come back through per-send
//! [`SendTicket`]s and received packets are handed to the channel handlers on
//! the I/O thread.

pub mod loopback;

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{bounded, never, select, unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use shared_transport::{
    ChannelHandler, EventHandler, PortEvent, TransportConfig, TransportEngine, TransportEvent,
    TransportStatistics, UartPort,
};
use transport::{RxOutcome, Transaction, TransportError, TransportResult, TxnPool};

enum Request {
    Open {
        channel: u8,
        handler: ChannelHandler,
        reply: Sender<TransportResult<()>>,
    },
    Close {
        channel: u8,
        reply: Sender<TransportResult<()>>,
    },
    Send(Transaction),
    BufferAvailable,
    SetSpeed {
        baud: u32,
        reply: Sender<TransportResult<()>>,
    },
    Reinit {
        baud: u32,
        reply: Sender<TransportResult<()>>,
    },
    Statistics(Sender<TransportStatistics>),
    Shutdown,
}

/// Handle to a transport running on its own I/O thread.
///
/// Dropping the handle shuts the transport down and joins the thread.
pub struct NativeTransport {
    inbox: Sender<Request>,
    pool: TxnPool,
    max_priorities: u8,
    thread: Option<JoinHandle<()>>,
}

/// Pending completion of one send.
pub struct SendTicket {
    done: Receiver<Transaction>,
}

impl NativeTransport {
    /// Starts the transport on `port`.
    ///
    /// `port_events` carries the backend's write-complete and read-ready
    /// notifications. `events` receives transport-level events on the I/O
    /// thread; `InitComplete` is delivered before this returns.
    pub fn spawn<P>(
        config: TransportConfig,
        port: P,
        port_events: Receiver<PortEvent>,
        events: EventHandler,
    ) -> anyhow::Result<Self>
    where
        P: UartPort + 'static,
    {
        let max_priorities = config.max_priorities;
        let engine =
            TransportEngine::new(config, port, events).context("starting transport engine")?;
        let pool = engine.pool().clone();
        let (inbox, requests) = unbounded();
        let thread = thread::Builder::new()
            .name("uart-transport".into())
            .spawn(move || io_loop(engine, requests, port_events))
            .context("spawning transport I/O thread")?;
        Ok(Self {
            inbox,
            pool,
            max_priorities,
            thread: Some(thread),
        })
    }

    /// Pool that send transactions are allocated from.
    pub fn pool(&self) -> &TxnPool {
        &self.pool
    }

    /// Registers `handler` for received packets of `channel`.
    ///
    /// The handler runs on the I/O thread. Returning
    /// [`RxOutcome::Rejected`] stalls reception until
    /// [`buffer_available`](Self::buffer_available) is called.
    pub fn open<F>(&self, channel: u8, handler: F) -> TransportResult<()>
    where
        F: FnMut(Transaction) -> RxOutcome + Send + 'static,
    {
        let (reply, result) = bounded(1);
        self.request(Request::Open {
            channel,
            handler: Box::new(handler),
            reply,
        })?;
        result.recv().map_err(|_| TransportError::Closed)?
    }

    /// Removes the handler of `channel`.
    pub fn close(&self, channel: u8) -> TransportResult<()> {
        let (reply, result) = bounded(1);
        self.request(Request::Close { channel, reply })?;
        result.recv().map_err(|_| TransportError::Closed)?
    }

    /// Queues `txn` for transmission.
    ///
    /// The transaction must carry a frame header. It is returned through the
    /// ticket once written, failed or flushed.
    pub fn send(&self, mut txn: Transaction) -> TransportResult<SendTicket> {
        if txn.priority() >= self.max_priorities {
            return Err(TransportError::InvalidPriority {
                priority: txn.priority(),
                max: self.max_priorities,
            });
        }
        let (completion, done) = bounded(1);
        txn.set_completion(completion);
        self.request(Request::Send(txn))?;
        Ok(SendTicket { done })
    }

    /// Resumes reception after a handler rejected a packet.
    pub fn buffer_available(&self) -> TransportResult<()> {
        self.request(Request::BufferAvailable)
    }

    /// Changes the line speed without resetting framing.
    pub fn set_speed(&self, baud: u32) -> TransportResult<()> {
        let (reply, result) = bounded(1);
        self.request(Request::SetSpeed { baud, reply })?;
        result.recv().map_err(|_| TransportError::Closed)?
    }

    /// Resets the link at `baud`, abandoning the in-flight send.
    pub fn reinit(&self, baud: u32) -> TransportResult<()> {
        let (reply, result) = bounded(1);
        self.request(Request::Reinit { baud, reply })?;
        result.recv().map_err(|_| TransportError::Closed)?
    }

    /// Snapshot of every counter of the transport.
    pub fn statistics(&self) -> TransportResult<TransportStatistics> {
        let (reply, result) = bounded(1);
        self.request(Request::Statistics(reply))?;
        result.recv().map_err(|_| TransportError::Closed)
    }

    /// Flushes pending sends with `Recovery` status and stops the I/O thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn request(&self, request: Request) -> TransportResult<()> {
        self.inbox.send(request).map_err(|_| TransportError::Closed)
    }

    fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.inbox.send(Request::Shutdown);
            if thread.join().is_err() {
                warn!("transport: I/O thread panicked");
            }
        }
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SendTicket {
    /// Blocks until the transaction comes back.
    pub fn wait(self) -> TransportResult<Transaction> {
        self.done.recv().map_err(|_| TransportError::Closed)
    }

    /// Waits at most `timeout` for the transaction.
    pub fn wait_timeout(&self, timeout: Duration) -> TransportResult<Transaction> {
        self.done.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => TransportError::Timeout,
            RecvTimeoutError::Disconnected => TransportError::Closed,
        })
    }

    /// Returns the transaction if it already came back.
    pub fn try_take(&self) -> Option<Transaction> {
        self.done.try_recv().ok()
    }
}

/// Event handler that forwards every event into a channel.
pub fn event_channel() -> (EventHandler, Receiver<TransportEvent>) {
    let (tx, rx) = unbounded();
    let handler: EventHandler = Box::new(move |event| {
        let _ = tx.send(event);
    });
    (handler, rx)
}

fn io_loop<P: UartPort>(
    mut engine: TransportEngine<P>,
    requests: Receiver<Request>,
    port_events: Receiver<PortEvent>,
) {
    let poll = engine.config().poll_interval();
    let mut port_open = true;
    let mut last_tick = Instant::now();
    debug!("transport: I/O thread running");

    loop {
        let port_rx = if port_open { port_events.clone() } else { never() };
        select! {
            recv(requests) -> msg => match msg {
                Ok(Request::Shutdown) | Err(_) => break,
                Ok(request) => handle_request(&mut engine, request),
            },
            recv(port_rx) -> msg => match msg {
                Ok(PortEvent::WriteComplete) => engine.on_write_complete(Instant::now()),
                Ok(PortEvent::ReadReady) => engine.on_read_ready(Instant::now()),
                Err(_) => {
                    warn!("transport: port event source closed");
                    port_open = false;
                }
            },
            default(poll) => {}
        }

        let now = Instant::now();
        if now.duration_since(last_tick) >= poll {
            engine.tick(now);
            last_tick = now;
        }
    }

    engine.shutdown();
    debug!("transport: I/O thread stopped");
}

fn handle_request<P: UartPort>(engine: &mut TransportEngine<P>, request: Request) {
    let now = Instant::now();
    match request {
        Request::Open {
            channel,
            handler,
            reply,
        } => {
            let _ = reply.send(engine.open(channel, handler));
        }
        Request::Close { channel, reply } => {
            let _ = reply.send(engine.close(channel));
        }
        Request::Send(txn) => {
            if let Err(err) = engine.send(txn, now) {
                debug!("transport: send refused: {err}");
            }
        }
        Request::BufferAvailable => engine.buffer_available(now),
        Request::SetSpeed { baud, reply } => {
            let _ = reply.send(engine.set_speed(baud));
        }
        Request::Reinit { baud, reply } => {
            let _ = reply.send(engine.reinit(baud, now));
        }
        Request::Statistics(reply) => {
            let _ = reply.send(engine.statistics());
        }
        Request::Shutdown => {}
    }
}
