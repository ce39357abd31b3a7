//! Priority transaction queue feeding the bus driver one transaction at a time.
//!
//! Each queue function owns one FIFO per priority (0 ≻ 1 ≻ …). Selection
//! scans priorities from the highest, and functions in ascending order within
//! a priority. Single-step control transactions bypass all of that: they sit
//! in a dedicated lane that is drained first and ignores stopped functions.
//! At most one selected transaction is in flight until [`TxnQueue::on_done`].

use std::collections::VecDeque;

use log::{debug, trace, warn};
use smallvec::SmallVec;
use transport::{Transaction, TransportError, TransportResult, TxnStatus};

/// Functions a queue can host unless configured otherwise.
pub const DEFAULT_MAX_FUNCTIONS: usize = 4;

/// Dispatch state of one queue function.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FuncState {
    /// Queued transactions are eligible for selection.
    Running,
    /// Transactions accumulate but are not selected.
    Stopped,
}

/// Queue counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Transactions accepted.
    pub enqueued: u32,
    /// Transactions handed to the bus.
    pub dispatched: u32,
    /// Transactions flushed with `Recovery` status.
    pub recovered: u32,
    /// Transactions refused at submission.
    pub rejected: u32,
    /// Deepest total backlog observed.
    pub high_water: usize,
}

/// A transaction the queue refused, handed back with the reason.
#[derive(Debug)]
pub struct Rejected {
    pub error: TransportError,
    pub txn: Transaction,
}

struct FuncQueues {
    state: FuncState,
    lists: SmallVec<[VecDeque<Transaction>; 3]>,
}

impl FuncQueues {
    fn len(&self) -> usize {
        self.lists.iter().map(VecDeque::len).sum()
    }
}

/// Single-flight priority dispatcher.
pub struct TxnQueue {
    functions: Vec<Option<FuncQueues>>,
    control: VecDeque<Transaction>,
    in_flight: bool,
    stats: QueueStats,
}

impl Default for TxnQueue {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FUNCTIONS)
    }
}

impl TxnQueue {
    pub fn new(max_functions: usize) -> Self {
        Self {
            functions: (0..max_functions).map(|_| None).collect(),
            control: VecDeque::new(),
            in_flight: false,
            stats: QueueStats::default(),
        }
    }

    /// Registers `func` with `num_prios` priority levels, initially running.
    pub fn open(&mut self, func: u8, num_prios: u8) -> TransportResult<()> {
        if num_prios == 0 {
            return Err(TransportError::invalid_config(
                "queue function needs at least one priority",
            ));
        }
        let slot = self
            .functions
            .get_mut(func as usize)
            .ok_or_else(|| TransportError::invalid_config(format!("queue function {func} out of range")))?;
        if slot.is_some() {
            warn!("txn queue: function {func} reopened");
        }
        *slot = Some(FuncQueues {
            state: FuncState::Running,
            lists: (0..num_prios).map(|_| VecDeque::new()).collect(),
        });
        debug!("txn queue: function {func} open with {num_prios} priorities");
        Ok(())
    }

    /// Unregisters `func`, returning its backlog marked `Recovery`.
    pub fn close(&mut self, func: u8) -> Vec<Transaction> {
        let flushed = self.restart(func);
        if let Some(slot) = self.functions.get_mut(func as usize) {
            *slot = None;
        }
        flushed
    }

    /// Queues `txn` under its function and priority.
    pub fn transact(&mut self, mut txn: Transaction) -> Result<(), Rejected> {
        if txn.is_single_step() {
            trace!("txn queue: control {:?} queued", txn.single_step());
            txn.set_status(TxnStatus::Pending);
            self.control.push_back(txn);
            self.record_enqueue();
            return Ok(());
        }

        let func = txn.func_id();
        let priority = txn.priority();
        let Some(queues) = self.functions.get_mut(func as usize).and_then(Option::as_mut) else {
            return Err(self.reject(txn, TransportError::FunctionNotOpen(func)));
        };
        let max = queues.lists.len() as u8;
        let Some(list) = queues.lists.get_mut(priority as usize) else {
            return Err(self.reject(txn, TransportError::InvalidPriority { priority, max }));
        };
        txn.set_status(TxnStatus::Pending);
        list.push_back(txn);
        self.record_enqueue();
        Ok(())
    }

    /// Takes the next transaction to put on the bus, if the bus is free.
    pub fn select_next(&mut self) -> Option<Transaction> {
        if self.in_flight {
            return None;
        }
        let next = self.control.pop_front().or_else(|| self.pop_data());
        if next.is_some() {
            self.in_flight = true;
            self.stats.dispatched += 1;
        }
        next
    }

    fn pop_data(&mut self) -> Option<Transaction> {
        let max_prios = self
            .functions
            .iter()
            .flatten()
            .map(|queues| queues.lists.len())
            .max()?;
        for priority in 0..max_prios {
            for queues in self.functions.iter_mut().flatten() {
                if queues.state != FuncState::Running {
                    continue;
                }
                if let Some(txn) = queues.lists.get_mut(priority).and_then(VecDeque::pop_front) {
                    return Some(txn);
                }
            }
        }
        None
    }

    /// Marks the in-flight transaction finished so the next can be selected.
    pub fn on_done(&mut self) {
        self.in_flight = false;
    }

    /// Holds back `func`'s transactions; control transactions still flow.
    pub fn stop(&mut self, func: u8) {
        self.set_state(func, FuncState::Stopped);
    }

    pub fn run(&mut self, func: u8) {
        self.set_state(func, FuncState::Running);
    }

    fn set_state(&mut self, func: u8, state: FuncState) {
        match self.functions.get_mut(func as usize).and_then(Option::as_mut) {
            Some(queues) => {
                if queues.state != state {
                    debug!("txn queue: function {func} {state:?}");
                }
                queues.state = state;
            }
            None => warn!("txn queue: {state:?} requested for closed function {func}"),
        }
    }

    pub fn state(&self, func: u8) -> Option<FuncState> {
        self.functions
            .get(func as usize)
            .and_then(Option::as_ref)
            .map(|queues| queues.state)
    }

    /// True when `func` has no data transactions waiting.
    pub fn is_empty(&self, func: u8) -> bool {
        self.len(func) == 0
    }

    pub fn len(&self, func: u8) -> usize {
        self.functions
            .get(func as usize)
            .and_then(Option::as_ref)
            .map_or(0, FuncQueues::len)
    }

    /// Control transactions waiting.
    pub fn control_len(&self) -> usize {
        self.control.len()
    }

    /// Flushes `func`'s backlog with `Recovery` status and leaves it running.
    pub fn restart(&mut self, func: u8) -> Vec<Transaction> {
        let Some(queues) = self.functions.get_mut(func as usize).and_then(Option::as_mut) else {
            return Vec::new();
        };
        let mut flushed = Vec::with_capacity(queues.len());
        for list in queues.lists.iter_mut() {
            flushed.extend(list.drain(..));
        }
        queues.state = FuncState::Running;
        self.mark_recovered(&mut flushed);
        if !flushed.is_empty() {
            debug!("txn queue: function {func} restarted, {} flushed", flushed.len());
        }
        flushed
    }

    /// Flushes every queue, control lane included.
    pub fn drain_all(&mut self) -> Vec<Transaction> {
        let mut flushed: Vec<Transaction> = self.control.drain(..).collect();
        for queues in self.functions.iter_mut().flatten() {
            for list in queues.lists.iter_mut() {
                flushed.extend(list.drain(..));
            }
        }
        self.mark_recovered(&mut flushed);
        flushed
    }

    pub fn stats(&self) -> QueueStats {
        self.stats
    }

    fn total_len(&self) -> usize {
        self.control.len()
            + self
                .functions
                .iter()
                .flatten()
                .map(FuncQueues::len)
                .sum::<usize>()
    }

    fn record_enqueue(&mut self) {
        self.stats.enqueued += 1;
        self.stats.high_water = self.stats.high_water.max(self.total_len());
    }

    fn mark_recovered(&mut self, flushed: &mut [Transaction]) {
        for txn in flushed.iter_mut() {
            txn.set_status(TxnStatus::Recovery);
        }
        self.stats.recovered += flushed.len() as u32;
    }

    fn reject(&mut self, mut txn: Transaction, error: TransportError) -> Rejected {
        warn!("txn queue: rejected transaction: {error}");
        self.stats.rejected += 1;
        txn.set_status(TxnStatus::Error);
        Rejected { error, txn }
    }
}
