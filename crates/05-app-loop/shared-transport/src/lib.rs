//! Shared UART transport: several logical channels over one serial link.
//!
//! [`TransportEngine`] multiplexes command, data, event and vendor channels
//! through one [`bus_driver::BusDriver`], consults the sleep manager before
//! every send and routes every received packet to the handler registered for
//! its channel. The engine is single-threaded; `runtime-native` hosts it on a
//! dedicated I/O thread.

mod channel;
mod config;
mod engine;
mod event;
mod stats;

pub use bus_driver::{BusDriverStats, PortEvent, RxState, UartPort};
pub use channel::ChannelHandler;
pub use config::TransportConfig;
pub use engine::{TransportEngine, TRANSPORT_FUNC};
pub use event::{ErrorKind, EventHandler, Module, Severity, TransportEvent};
pub use sleep_manager::{SleepState, SleepStats};
pub use stats::{TransportStatistics, TransportStats};
pub use txn_queue::QueueStats;
