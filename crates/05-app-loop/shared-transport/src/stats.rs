//! Counters exposed through [`crate::TransportEngine::statistics`].

use bus_driver::{BusDriverStats, RxState};
use sleep_manager::{SleepState, SleepStats};
use transport::PoolStats;
use txn_queue::QueueStats;

/// Façade counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// User transactions submitted.
    pub tx: u32,
    /// User transactions written successfully.
    pub tx_complete: u32,
    /// Packets handed to channel handlers.
    pub rx_ind: u32,
    /// Packets handed back by channel handlers.
    pub rx_rejected: u32,
    /// Buffer-available notifications from upper layers.
    pub buf_avail: u32,
    /// Packets dropped for lack of a handler, and internal allocation failures.
    pub errors: u32,
}

/// Aggregate snapshot of every layer of one transport instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransportStatistics {
    pub transport: TransportStats,
    pub queue: QueueStats,
    pub sleep: SleepStats,
    pub sleep_state: SleepState,
    pub bus: BusDriverStats,
    pub rx_state: RxState,
    pub pool: PoolStats,
}
