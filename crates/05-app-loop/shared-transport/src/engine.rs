//! The transport engine: channel multiplexing over one bus driver.
//!
//! The engine owns the bus driver, transaction queue, sleep manager and
//! channel table of one transport instance. It is driven from a single
//! thread: every public method runs one event to completion, applying the
//! sleep manager's actions and dispatching queued transactions before it
//! returns.

use std::time::Instant;

use bus_driver::{BusDriver, BusError, RxSink, TxStep, UartPort};
use log::{debug, error, trace};
use sleep_manager::{SleepAction, SleepActions, SleepConfig, SleepManager, SleepState};
use transport::{
    RxOutcome, SleepOp, Transaction, TransportError, TransportResult, TxnDirection, TxnPool,
    TxnStatus,
};
use txn_queue::{Rejected, TxnQueue};

use crate::channel::{ChannelHandler, ChannelTable, Dispatch};
use crate::config::TransportConfig;
use crate::event::{ErrorKind, EventHandler, Module, Severity, TransportEvent};
use crate::stats::{TransportStatistics, TransportStats};

/// Queue function used for every transaction of the transport.
pub const TRANSPORT_FUNC: u8 = 0;

/// Single-threaded core of one transport instance.
pub struct TransportEngine<P> {
    config: TransportConfig,
    pool: TxnPool,
    driver: BusDriver<P>,
    queue: TxnQueue,
    sleep: SleepManager,
    channels: ChannelTable,
    events: EventHandler,
    stats: TransportStats,
    closed: bool,
}

impl<P: UartPort> TransportEngine<P> {
    /// Validates `config`, brings up the port and reports `InitComplete`.
    pub fn new(config: TransportConfig, port: P, events: EventHandler) -> TransportResult<Self> {
        config.validate()?;
        let pool = TxnPool::new(config.pool)?;
        let mut queue = TxnQueue::new(1);
        queue.open(TRANSPORT_FUNC, config.max_priorities)?;
        let mut driver = BusDriver::new(port, pool.clone(), config.rx_buffer_size);
        driver.set_speed(config.baud_rate)?;
        let sleep = SleepManager::new(SleepConfig {
            wake_ack_timeout: config.wake_ack_timeout(),
        });
        let channels = ChannelTable::new(config.max_channels);

        let mut engine = Self {
            config,
            pool,
            driver,
            queue,
            sleep,
            channels,
            events,
            stats: TransportStats::default(),
            closed: false,
        };
        debug!("transport: open at {} baud", engine.config.baud_rate);
        (engine.events)(TransportEvent::InitComplete);
        Ok(engine)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Pool that callers allocate send transactions from.
    pub fn pool(&self) -> &TxnPool {
        &self.pool
    }

    pub fn port(&self) -> &P {
        self.driver.port()
    }

    pub fn sleep_state(&self) -> SleepState {
        self.sleep.state()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Registers `handler` for `channel`, replacing any previous one.
    pub fn open(&mut self, channel: u8, handler: ChannelHandler) -> TransportResult<()> {
        self.channels.open(channel, handler)
    }

    pub fn close(&mut self, channel: u8) -> TransportResult<()> {
        self.channels.close(channel)
    }

    pub fn is_channel_open(&self, channel: u8) -> bool {
        self.channels.is_open(channel)
    }

    /// Queues a user transaction, waking the link first if it sleeps.
    ///
    /// The transaction comes back through its completion channel. A refused
    /// transaction is completed with `Error` status and the reason returned.
    pub fn send(&mut self, mut txn: Transaction, now: Instant) -> TransportResult<()> {
        if self.closed {
            txn.set_status(TxnStatus::Error);
            self.complete(txn);
            return Err(TransportError::Closed);
        }
        txn.set_func_id(TRANSPORT_FUNC);
        txn.set_direction(TxnDirection::Write);
        self.stats.tx += 1;

        let actions = self.sleep.on_tx_request(now);
        self.apply(actions);
        let result = match self.queue.transact(txn) {
            Ok(()) => Ok(()),
            Err(Rejected { error, txn }) => {
                self.complete(txn);
                Err(error)
            }
        };
        self.schedule(now);
        result
    }

    /// The port drained the last write.
    pub fn on_write_complete(&mut self, now: Instant) {
        if let Some(step) = self.driver.on_write_complete() {
            self.finish_tx(step, now);
        }
        self.schedule(now);
    }

    /// Input is waiting in the port.
    pub fn on_read_ready(&mut self, now: Instant) {
        let actions = self.sleep.on_rx_ready();
        self.apply(actions);
        let actions = {
            let (driver, mut sink) = self.rx_parts();
            driver.on_read_ready(&mut sink);
            sink.actions
        };
        self.apply(actions);
        self.schedule(now);
    }

    /// An upper layer can take packets again after rejecting one.
    pub fn buffer_available(&mut self, now: Instant) {
        self.stats.buf_avail += 1;
        let actions = {
            let (driver, mut sink) = self.rx_parts();
            driver.buffer_available(&mut sink);
            sink.actions
        };
        self.apply(actions);
        self.schedule(now);
    }

    pub fn set_speed(&mut self, baud: u32) -> TransportResult<()> {
        self.driver.set_speed(baud)?;
        self.config.baud_rate = baud;
        Ok(())
    }

    /// Re-initializes the link at `baud` after a fatal error.
    ///
    /// The in-flight transaction is abandoned with `Recovery` status, the
    /// sleep handshake returns to `Awake` and queued sends resume.
    pub fn reinit(&mut self, baud: u32, now: Instant) -> TransportResult<()> {
        debug!("transport: reinit at {baud} baud");
        if let Some(mut txn) = self.driver.abort_tx() {
            self.queue.on_done();
            txn.set_status(TxnStatus::Recovery);
            if !txn.is_single_step() {
                self.complete(txn);
            }
        }
        self.driver.reset(baud)?;
        self.config.baud_rate = baud;
        let actions = self.sleep.reinit();
        self.apply(actions);
        self.schedule(now);
        Ok(())
    }

    /// Runs timers; called periodically by the owning thread.
    pub fn tick(&mut self, now: Instant) {
        let actions = self.sleep.on_tick(now);
        if actions.is_empty() {
            return;
        }
        self.apply(actions);
        self.schedule(now);
    }

    /// Flushes every pending transaction with `Recovery` status and closes.
    pub fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut flushed = self.queue.drain_all();
        if let Some(mut txn) = self.driver.abort_tx() {
            txn.set_status(TxnStatus::Recovery);
            flushed.push(txn);
        }
        self.queue.on_done();
        debug!("transport: shutdown, {} transactions flushed", flushed.len());
        for txn in flushed {
            if !txn.is_single_step() {
                self.complete(txn);
            }
        }
        self.channels.clear();
        (self.events)(TransportEvent::DestroyComplete);
    }

    pub fn statistics(&self) -> TransportStatistics {
        TransportStatistics {
            transport: self.stats,
            queue: self.queue.stats(),
            sleep: self.sleep.stats(),
            sleep_state: self.sleep.state(),
            bus: self.driver.stats(),
            rx_state: self.driver.rx_state(),
            pool: self.pool.stats(),
        }
    }

    fn rx_parts(&mut self) -> (&mut BusDriver<P>, Dispatcher<'_>) {
        let sink = Dispatcher {
            sleep: &mut self.sleep,
            channels: &mut self.channels,
            stats: &mut self.stats,
            events: &mut self.events,
            actions: SleepActions::new(),
        };
        (&mut self.driver, sink)
    }

    fn schedule(&mut self, now: Instant) {
        while let Some(txn) = self.queue.select_next() {
            match self.driver.transact(txn) {
                TxStep::InFlight => return,
                step => self.finish_tx(step, now),
            }
        }
    }

    fn finish_tx(&mut self, step: TxStep, now: Instant) {
        match step {
            TxStep::InFlight => {}
            TxStep::Done(txn) => {
                self.queue.on_done();
                self.tx_finished(txn, now);
            }
            TxStep::Failed(txn, err) => {
                self.queue.on_done();
                self.report(ErrorKind::TxErr, Module::BusDriver, &err);
                // A control packet that never left the port leaves the handshake where it is.
                match txn.single_step() {
                    Some(op) => debug!("transport: control {op:?} lost to write failure"),
                    None => self.complete(txn),
                }
            }
            TxStep::Busy(mut txn) => {
                error!("transport: bus driver busy with a transaction the queue released");
                txn.set_status(TxnStatus::Error);
                self.complete(txn);
            }
        }
    }

    fn tx_finished(&mut self, txn: Transaction, now: Instant) {
        if let Some(op) = txn.single_step() {
            trace!("transport: control {op:?} sent");
            drop(txn);
            let queue_empty = self.queue.is_empty(TRANSPORT_FUNC);
            let actions = self.sleep.on_tx_complete(op, queue_empty, now);
            self.apply(actions);
            return;
        }
        if txn.status() == TxnStatus::Ok {
            self.stats.tx_complete += 1;
        }
        self.complete(txn);
    }

    fn complete(&mut self, mut txn: Transaction) {
        if let Some(completion) = txn.take_completion() {
            if completion.send(txn).is_err() {
                trace!("transport: completion receiver dropped");
            }
        }
    }

    fn apply(&mut self, actions: SleepActions) {
        for action in actions {
            match action {
                SleepAction::Emit(op) => self.emit_control(op),
                SleepAction::StopQueue => self.queue.stop(TRANSPORT_FUNC),
                SleepAction::RunQueue => self.queue.run(TRANSPORT_FUNC),
                SleepAction::ResetRx => self.driver.reset_rx(),
            }
        }
    }

    fn emit_control(&mut self, op: SleepOp) {
        let mut txn = match self.pool.alloc() {
            Ok(txn) => txn,
            Err(err) => {
                self.stats.errors += 1;
                error!("transport: cannot send {op:?}: {err}");
                (self.events)(TransportEvent::Error {
                    kind: ErrorKind::NoResource,
                    severity: Severity::Critical,
                    module: Module::SleepManager,
                });
                return;
            }
        };
        txn.set_single_step(op);
        txn.set_func_id(TRANSPORT_FUNC);
        if let Err(rejected) = self.queue.transact(txn) {
            error!("transport: control {op:?} refused: {}", rejected.error);
        }
    }

    fn report(&mut self, kind: ErrorKind, module: Module, err: &BusError) {
        error!("transport: {kind:?} from {module:?}: {err}");
        (self.events)(TransportEvent::Error {
            kind,
            severity: Severity::Critical,
            module,
        });
    }
}

/// Receive-side view of the engine handed to the bus driver.
struct Dispatcher<'a> {
    sleep: &'a mut SleepManager,
    channels: &'a mut ChannelTable,
    stats: &'a mut TransportStats,
    events: &'a mut EventHandler,
    actions: SleepActions,
}

impl RxSink for Dispatcher<'_> {
    fn deliver(&mut self, txn: Transaction) -> RxOutcome {
        if let Some(op) = txn.single_step() {
            trace!("transport: control {op:?} received");
            let actions = self.sleep.on_control_packet(op);
            self.actions.extend(actions);
            return RxOutcome::Accepted;
        }
        let actions = self.sleep.on_data_packet();
        self.actions.extend(actions);

        let channel = txn.channel();
        match self.channels.dispatch(txn) {
            Dispatch::Handled(RxOutcome::Accepted) => {
                self.stats.rx_ind += 1;
                RxOutcome::Accepted
            }
            Dispatch::Handled(RxOutcome::Rejected(txn)) => {
                self.stats.rx_rejected += 1;
                debug!("transport: channel {channel} rejected a packet");
                RxOutcome::Rejected(txn)
            }
            Dispatch::Unregistered => {
                self.stats.errors += 1;
                error!("transport: dropped packet for unregistered channel {channel}");
                RxOutcome::Accepted
            }
        }
    }

    fn rx_error(&mut self, error: BusError) {
        error!("transport: receive failure: {error}");
        (self.events)(TransportEvent::Error {
            kind: ErrorKind::RxErr,
            severity: Severity::Critical,
            module: Module::BusDriver,
        });
    }
}
