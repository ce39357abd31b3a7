//! Core transaction primitives shared by every layer of the UART transport.
//!
//! * [`Transaction`] – one packet to send or one packet received, with its
//!   routing metadata, wire header and up to [`MAX_XFER_BUFS`] data segments.
//! * [`TxnPool`] – bounded, thread-safe allocator for transactions and their
//!   buffers; exhaustion is reported, never waited on.
//! * [`TransportError`] – error surface for allocation and caller misuse.

mod error;
mod pool;
mod txn;

pub use error::{Resource, TransportError, TransportResult};
pub use pool::{BufClass, PoolConfig, PoolStats, TxnPool};
pub use transport_codecs::{FrameHeader, PacketType, SleepOp};
pub use txn::{RxOutcome, Segment, Transaction, TxnDirection, TxnStatus, MAX_XFER_BUFS};
