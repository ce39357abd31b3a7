//! UART bus driver: turns transactions into wire bytes and wire bytes back
//! into transactions.
//!
//! The driver owns one [`UartPort`] and never blocks. Progress is driven from
//! outside: the owner calls [`BusDriver::on_write_complete`] and
//! [`BusDriver::on_read_ready`] for every [`PortEvent`] the port raises.

mod driver;
pub mod mock;
mod port;

pub use driver::{
    BusDriver, BusDriverStats, BusError, RxSink, RxState, TxStep, DEFAULT_RX_BUFFER_SIZE,
};
pub use port::{PortEvent, UartPort};
