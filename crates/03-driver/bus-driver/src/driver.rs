//! Framing state machine between transactions and the UART byte stream.
//!
//! Transmit walks a transaction chunk by chunk (wire header, then each
//! non-empty segment), issuing one port write at a time and continuing on
//! every write-complete. Receive assembles packets through
//! `PacketType → Header → Data` and hands each finished packet to an
//! [`RxSink`]. A rejected packet or a failed buffer allocation parks the
//! receiver in `Congestion` until [`BusDriver::buffer_available`].

use std::io;

use log::{debug, error, trace, warn};
use thiserror::Error;
use transport::{FrameHeader, RxOutcome, Segment, Transaction, TxnDirection, TxnPool, TxnStatus};
use transport_codecs::{payload_len, FrameError, PacketType, MAX_WIRE_HEADER_LEN};

use crate::port::UartPort;

/// Receive buffer size used by the reference chip firmware.
pub const DEFAULT_RX_BUFFER_SIZE: usize = 1028;

/// Failures the driver reports upward.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("framing error: {0}")]
    Framing(#[from] FrameError),

    #[error("uart read failed: {0}")]
    Read(#[source] io::Error),

    #[error("uart write failed: {0}")]
    Write(#[source] io::Error),

    #[error("uart accepted no bytes")]
    WriteStalled,
}

impl BusError {
    /// True for failures of the transmit path.
    pub fn is_tx(&self) -> bool {
        matches!(self, BusError::Write(_) | BusError::WriteStalled)
    }
}

/// Consumer of assembled packets.
pub trait RxSink {
    /// Offers a complete packet; a rejection congests the receiver.
    fn deliver(&mut self, txn: Transaction) -> RxOutcome;

    /// Reports a receive failure after the framing state was reset.
    fn rx_error(&mut self, error: BusError);
}

/// Result of a transmit step.
#[derive(Debug)]
pub enum TxStep {
    /// Bytes are on the wire; a write-complete will follow.
    InFlight,
    /// Every chunk was written; the driver is idle again.
    Done(Transaction),
    /// A write failed; the transaction is abandoned with `Error` status.
    Failed(Transaction, BusError),
    /// Another transaction is in flight; the offered one is handed back.
    Busy(Transaction),
}

/// Receive state machine position.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RxState {
    #[default]
    PacketType,
    Header,
    Data,
    Congestion,
}

/// Driver counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BusDriverStats {
    /// Transactions accepted for transmit.
    pub tx: u32,
    /// Transactions fully written.
    pub tx_done: u32,
    /// Transactions abandoned after a write failure.
    pub tx_err: u32,
    /// Port writes issued.
    pub writes: u32,
    /// Write-complete events handled.
    pub write_completes: u32,
    /// Read-ready events handled.
    pub read_ready: u32,
    /// Packets assembled and offered upward.
    pub rx_packets: u32,
    /// Framing and read failures.
    pub rx_err: u32,
    /// Deliveries refused by the sink.
    pub rx_rejected: u32,
    /// Receive buffer allocations refused by the pool.
    pub alloc_err: u32,
    /// Buffer-available notifications.
    pub buf_avail: u32,
    /// Write-complete events that belonged to an aborted transmit.
    pub stale_completes: u32,
}

#[derive(Clone, Copy, Debug)]
enum TxChunk {
    Header,
    Segment(usize),
}

struct TxProgress {
    txn: Transaction,
    chunk: TxChunk,
    offset: usize,
}

impl TxProgress {
    fn new(txn: Transaction) -> Self {
        let chunk = if txn.header().is_some() {
            TxChunk::Header
        } else {
            TxChunk::Segment(0)
        };
        Self {
            txn,
            chunk,
            offset: 0,
        }
    }

    fn chunk_bytes(&self) -> &[u8] {
        match self.chunk {
            TxChunk::Header => self.txn.header().map_or(&[][..], FrameHeader::wire_bytes),
            TxChunk::Segment(index) => self
                .txn
                .segments()
                .get(index)
                .map_or(&[][..], Segment::as_slice),
        }
    }

    fn remaining(&self) -> &[u8] {
        &self.chunk_bytes()[self.offset..]
    }

    /// Moves to the next non-empty chunk; false once the transaction is exhausted.
    fn advance(&mut self) -> bool {
        loop {
            let next = match self.chunk {
                TxChunk::Header if self.txn.is_single_step() => return false,
                TxChunk::Header => 0,
                TxChunk::Segment(index) => index + 1,
            };
            if next >= self.txn.segments().len() {
                return false;
            }
            self.chunk = TxChunk::Segment(next);
            self.offset = 0;
            if !self.chunk_bytes().is_empty() {
                return true;
            }
        }
    }
}

struct RxProgress {
    state: RxState,
    txn: Option<Transaction>,
    held: Option<Transaction>,
    packet_type: PacketType,
    header: [u8; MAX_WIRE_HEADER_LEN],
    accumulated: usize,
    expected: usize,
}

impl RxProgress {
    fn new() -> Self {
        Self {
            state: RxState::PacketType,
            txn: None,
            held: None,
            packet_type: PacketType::Event,
            header: [0; MAX_WIRE_HEADER_LEN],
            accumulated: 0,
            expected: 1,
        }
    }

    fn restart(&mut self) {
        self.state = RxState::PacketType;
        self.accumulated = 0;
        self.expected = 1;
    }

    fn expect(&mut self, state: RxState, len: usize) {
        self.state = state;
        self.accumulated = 0;
        self.expected = len;
    }
}

/// UART framing driver with one transmit and one receive in progress at most.
pub struct BusDriver<P> {
    port: P,
    pool: TxnPool,
    rx_capacity: usize,
    tx: Option<TxProgress>,
    // An aborted transmit left one write in the port; its completion is still due.
    orphaned_write: bool,
    rx: RxProgress,
    stats: BusDriverStats,
}

impl<P: UartPort> BusDriver<P> {
    /// Creates a driver that allocates `rx_capacity`-byte receive buffers from `pool`.
    pub fn new(port: P, pool: TxnPool, rx_capacity: usize) -> Self {
        Self {
            port,
            pool,
            rx_capacity,
            tx: None,
            orphaned_write: false,
            rx: RxProgress::new(),
            stats: BusDriverStats::default(),
        }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn stats(&self) -> BusDriverStats {
        self.stats
    }

    pub fn rx_state(&self) -> RxState {
        self.rx.state
    }

    /// True when no transaction is owned and the port has no write outstanding.
    pub fn is_tx_idle(&self) -> bool {
        self.tx.is_none() && !self.orphaned_write
    }

    /// True while a rejected packet waits for redelivery.
    pub fn has_held_packet(&self) -> bool {
        self.rx.held.is_some()
    }

    /// Starts transmitting `txn`.
    pub fn transact(&mut self, txn: Transaction) -> TxStep {
        if self.tx.is_some() {
            return TxStep::Busy(txn);
        }
        self.stats.tx += 1;
        let mut progress = TxProgress::new(txn);
        if progress.remaining().is_empty() && !progress.advance() {
            trace!("bus driver: empty transaction completes without writing");
            return self.finish(progress);
        }
        if self.orphaned_write {
            trace!("bus driver: aborted write still draining, transmit deferred");
            self.tx = Some(progress);
            return TxStep::InFlight;
        }
        self.write_next(progress)
    }

    /// Continues the in-flight transmit after the port drained the last write.
    ///
    /// Returns `None` when nothing was in flight. The completion of a write
    /// abandoned by [`BusDriver::abort_tx`] only starts the deferred
    /// transaction, if one is waiting.
    pub fn on_write_complete(&mut self) -> Option<TxStep> {
        if self.orphaned_write {
            self.orphaned_write = false;
            self.stats.write_completes += 1;
            self.stats.stale_completes += 1;
            debug!("bus driver: write complete of an aborted transmit");
            return self.tx.take().map(|progress| self.write_next(progress));
        }
        let Some(mut progress) = self.tx.take() else {
            warn!("bus driver: write complete with no transmit in flight");
            return None;
        };
        self.stats.write_completes += 1;
        if progress.remaining().is_empty() && !progress.advance() {
            return Some(self.finish(progress));
        }
        Some(self.write_next(progress))
    }

    /// Drops the in-flight transmit, if any, without waiting for the port.
    ///
    /// The port still owes a write-complete for the abandoned write; the next
    /// transaction is held back until it arrives.
    pub fn abort_tx(&mut self) -> Option<Transaction> {
        let progress = self.tx.take()?;
        self.orphaned_write = true;
        Some(progress.txn)
    }

    fn write_next(&mut self, mut progress: TxProgress) -> TxStep {
        let err = match self.port.write(progress.remaining()) {
            Ok(0) => BusError::WriteStalled,
            Ok(written) => {
                progress.offset += written;
                self.stats.writes += 1;
                trace!(
                    "bus driver: wrote {written} bytes, {} left in chunk",
                    progress.remaining().len()
                );
                self.tx = Some(progress);
                return TxStep::InFlight;
            }
            Err(err) => BusError::Write(err),
        };
        self.stats.tx_err += 1;
        error!("bus driver: {err}");
        let mut txn = progress.txn;
        txn.set_status(TxnStatus::Error);
        TxStep::Failed(txn, err)
    }

    fn finish(&mut self, progress: TxProgress) -> TxStep {
        self.stats.tx_done += 1;
        let mut txn = progress.txn;
        txn.set_status(TxnStatus::Ok);
        TxStep::Done(txn)
    }

    /// Reads and assembles as many packets as the port has bytes for.
    pub fn on_read_ready<S: RxSink>(&mut self, sink: &mut S) {
        self.stats.read_ready += 1;
        self.pump_rx(sink);
    }

    /// Lifts congestion: redelivers the held packet, then resumes reading.
    ///
    /// A second rejection or a failed buffer allocation keeps the driver
    /// congested.
    pub fn buffer_available<S: RxSink>(&mut self, sink: &mut S) {
        self.stats.buf_avail += 1;
        if self.rx.state != RxState::Congestion {
            return;
        }
        if let Some(txn) = self.rx.held.take() {
            if let RxOutcome::Rejected(txn) = sink.deliver(txn) {
                self.stats.rx_rejected += 1;
                debug!("bus driver: held packet rejected again, staying congested");
                self.rx.held = Some(txn);
                return;
            }
        }
        self.rx.restart();
        if self.rx.txn.is_none() && !self.alloc_rx() {
            return;
        }
        debug!("bus driver: congestion cleared");
        if let Err(err) = self.port.restart_read() {
            self.rx_failure(sink, BusError::Read(err));
            return;
        }
        self.pump_rx(sink);
    }

    /// Restarts framing, dropping any partially assembled packet.
    ///
    /// Congestion is left untouched; it is cleared only by
    /// [`BusDriver::buffer_available`].
    pub fn reset_rx(&mut self) {
        if self.rx.state != RxState::Congestion {
            debug!("bus driver: receive framing reset");
            self.rx.restart();
        }
    }

    /// Re-initializes the port at `baud` and restarts framing.
    pub fn reset(&mut self, baud: u32) -> io::Result<()> {
        self.port.reset(baud)?;
        self.reset_rx();
        Ok(())
    }

    pub fn set_speed(&mut self, baud: u32) -> io::Result<()> {
        debug!("bus driver: speed set to {baud}");
        self.port.set_speed(baud)
    }

    fn pump_rx<S: RxSink>(&mut self, sink: &mut S) {
        loop {
            if self.rx.state == RxState::Congestion {
                trace!("bus driver: congested, input left in port");
                return;
            }
            if self.rx.txn.is_none() && !self.alloc_rx() {
                return;
            }
            if self.port.bytes_available() == 0 {
                return;
            }
            match self.read_chunk() {
                Ok(0) => return,
                Ok(read) => self.rx.accumulated += read,
                Err(err) => {
                    self.read_failure(sink, err);
                    return;
                }
            }
            if self.rx.accumulated < self.rx.expected {
                continue;
            }
            if let Err(err) = self.complete_chunk(sink) {
                self.rx_failure(sink, err.into());
            }
        }
    }

    fn read_chunk(&mut self) -> io::Result<usize> {
        let rx = &mut self.rx;
        let (start, end) = (rx.accumulated, rx.expected);
        match rx.state {
            RxState::PacketType => self.port.read(&mut rx.header[start..end]),
            RxState::Header => self.port.read(&mut rx.header[1 + start..1 + end]),
            RxState::Data => match rx.txn.as_mut().and_then(|txn| txn.segment_mut(0)) {
                Some(segment) => self.port.read(&mut segment.spare_mut()[start..end]),
                None => Ok(0),
            },
            RxState::Congestion => Ok(0),
        }
    }

    fn complete_chunk<S: RxSink>(&mut self, sink: &mut S) -> Result<(), FrameError> {
        match self.rx.state {
            RxState::PacketType => {
                let packet_type = PacketType::try_from(self.rx.header[0])?;
                self.rx.packet_type = packet_type;
                if packet_type.is_sleep() {
                    self.deliver(sink, 0)?;
                } else {
                    self.rx.expect(RxState::Header, packet_type.header_len());
                }
            }
            RxState::Header => {
                let packet_type = self.rx.packet_type;
                let header = &self.rx.header[1..1 + packet_type.header_len()];
                let len = payload_len(packet_type, header)?;
                if len > self.rx_capacity {
                    return Err(FrameError::Oversized {
                        declared: len,
                        capacity: self.rx_capacity,
                    });
                }
                if len == 0 {
                    self.deliver(sink, 0)?;
                } else {
                    self.rx.expect(RxState::Data, len);
                }
            }
            RxState::Data => {
                let len = self.rx.expected;
                self.deliver(sink, len)?;
            }
            RxState::Congestion => {}
        }
        Ok(())
    }

    fn deliver<S: RxSink>(&mut self, sink: &mut S, len: usize) -> Result<(), FrameError> {
        let packet_type = self.rx.packet_type;
        let header = FrameHeader::new(
            packet_type,
            &self.rx.header[1..1 + packet_type.header_len()],
        )?;
        self.rx.restart();
        let Some(mut txn) = self.rx.txn.take() else {
            return Ok(());
        };
        txn.set_header(header);
        txn.set_channel(packet_type.as_u8());
        txn.set_direction(TxnDirection::Read);
        txn.set_status(TxnStatus::Ok);
        if let Some(segment) = txn.segment_mut(0) {
            segment.set_len(len);
        }
        self.stats.rx_packets += 1;
        trace!("bus driver: received {packet_type:?} with {len} payload bytes");
        if let RxOutcome::Rejected(txn) = sink.deliver(txn) {
            self.stats.rx_rejected += 1;
            debug!("bus driver: {packet_type:?} rejected, entering congestion");
            self.rx.held = Some(txn);
            self.rx.state = RxState::Congestion;
        }
        Ok(())
    }

    fn alloc_rx(&mut self) -> bool {
        match self.pool.alloc_with_buffer(self.rx_capacity) {
            Ok(txn) => {
                self.rx.txn = Some(txn);
                true
            }
            Err(err) => {
                self.stats.alloc_err += 1;
                warn!("bus driver: no receive buffer ({err}), entering congestion");
                self.rx.state = RxState::Congestion;
                false
            }
        }
    }

    /// Input following a failed read cannot be trusted; drop it before resyncing.
    fn read_failure<S: RxSink>(&mut self, sink: &mut S, err: io::Error) {
        if let Err(reset_err) = self.port.reset_read() {
            warn!("bus driver: cannot discard input after read failure: {reset_err}");
        }
        self.rx_failure(sink, BusError::Read(err));
    }

    fn rx_failure<S: RxSink>(&mut self, sink: &mut S, err: BusError) {
        self.stats.rx_err += 1;
        error!("bus driver: {err}");
        self.rx.restart();
        sink.rx_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPort;
    use transport::{PoolConfig, SleepOp};
    use transport_codecs::encode_frame;

    #[derive(Default)]
    struct Collect {
        packets: Vec<Transaction>,
        errors: Vec<BusError>,
        reject_next: usize,
    }

    impl RxSink for Collect {
        fn deliver(&mut self, txn: Transaction) -> RxOutcome {
            if self.reject_next > 0 {
                self.reject_next -= 1;
                return RxOutcome::Rejected(txn);
            }
            self.packets.push(txn);
            RxOutcome::Accepted
        }

        fn rx_error(&mut self, error: BusError) {
            self.errors.push(error);
        }
    }

    fn pool() -> TxnPool {
        TxnPool::new(PoolConfig::default()).expect("create pool")
    }

    fn driver(port: MockPort) -> BusDriver<MockPort> {
        BusDriver::new(port, pool(), DEFAULT_RX_BUFFER_SIZE)
    }

    fn frame(header: FrameHeader, payload: &[u8]) -> Vec<u8> {
        encode_frame(&header, payload).expect("encode frame")
    }

    #[test]
    fn transmit_writes_header_then_segments() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut txn = driver.pool.alloc().expect("alloc");
        txn.set_header(FrameHeader::acl(0x0001, 5));
        txn.push_segment(vec![1, 2]).expect("segment");
        txn.push_segment(Vec::new()).expect("segment");
        txn.push_segment(vec![3, 4, 5]).expect("segment");

        assert!(matches!(driver.transact(txn), TxStep::InFlight));
        assert!(matches!(driver.on_write_complete(), Some(TxStep::InFlight)));
        assert!(matches!(driver.on_write_complete(), Some(TxStep::InFlight)));
        let done = match driver.on_write_complete() {
            Some(TxStep::Done(txn)) => txn,
            other => panic!("expected completion, got {other:?}"),
        };
        assert_eq!(done.status(), TxnStatus::Ok);
        assert_eq!(port.write_sizes(), vec![5, 2, 3]);
        assert_eq!(
            port.take_written(),
            vec![0x02, 0x01, 0x00, 0x05, 0x00, 1, 2, 3, 4, 5]
        );
        assert!(driver.is_tx_idle());
    }

    #[test]
    fn partial_writes_resume_within_chunk() {
        let port = MockPort::with_max_write(2);
        let mut driver = driver(port.clone());
        let mut txn = driver.pool.alloc().expect("alloc");
        txn.push_segment(vec![9, 8, 7, 6, 5]).expect("segment");

        assert!(matches!(driver.transact(txn), TxStep::InFlight));
        assert!(matches!(driver.on_write_complete(), Some(TxStep::InFlight)));
        assert!(matches!(driver.on_write_complete(), Some(TxStep::InFlight)));
        assert!(matches!(driver.on_write_complete(), Some(TxStep::Done(_))));
        assert_eq!(port.write_sizes(), vec![2, 2, 1]);
        assert_eq!(port.take_written(), vec![9, 8, 7, 6, 5]);
    }

    #[test]
    fn single_step_writes_only_its_type_byte() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut txn = driver.pool.alloc_with_buffer(4).expect("alloc");
        txn.set_single_step(SleepOp::WakeInd);

        assert!(matches!(driver.transact(txn), TxStep::InFlight));
        assert!(matches!(driver.on_write_complete(), Some(TxStep::Done(_))));
        assert_eq!(port.take_written(), vec![0x32]);
    }

    #[test]
    fn second_transact_is_busy() {
        let mut driver = driver(MockPort::new());
        let mut first = driver.pool.alloc().expect("alloc");
        first.push_segment(vec![1]).expect("segment");
        let mut second = driver.pool.alloc().expect("alloc");
        second.push_segment(vec![2]).expect("segment");

        assert!(matches!(driver.transact(first), TxStep::InFlight));
        assert!(matches!(driver.transact(second), TxStep::Busy(_)));
    }

    #[test]
    fn write_failure_abandons_transaction() {
        let port = MockPort::new();
        port.fail_writes(true);
        let mut driver = driver(port);
        let mut txn = driver.pool.alloc().expect("alloc");
        txn.push_segment(vec![1, 2, 3]).expect("segment");

        match driver.transact(txn) {
            TxStep::Failed(txn, err) => {
                assert_eq!(txn.status(), TxnStatus::Error);
                assert!(err.is_tx());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(driver.is_tx_idle());
        assert_eq!(driver.stats().tx_err, 1);
    }

    #[test]
    fn aborted_write_completion_gates_next_transmit() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut first = driver.pool.alloc().expect("alloc");
        first.set_header(FrameHeader::acl(0x0001, 1));
        first.push_segment(vec![1]).expect("segment");
        let mut second = driver.pool.alloc().expect("alloc");
        second.set_header(FrameHeader::acl(0x0001, 1));
        second.push_segment(vec![2]).expect("segment");

        assert!(matches!(driver.transact(first), TxStep::InFlight));
        assert!(driver.abort_tx().is_some());
        assert!(!driver.is_tx_idle());

        assert!(matches!(driver.transact(second), TxStep::InFlight));
        assert_eq!(port.write_sizes(), vec![5], "nothing written while the port drains");

        // Completion of the aborted header write starts the deferred header.
        assert!(matches!(driver.on_write_complete(), Some(TxStep::InFlight)));
        assert_eq!(port.write_sizes(), vec![5, 5]);
        assert!(matches!(driver.on_write_complete(), Some(TxStep::InFlight)));
        assert_eq!(port.write_sizes(), vec![5, 5, 1]);
        assert!(matches!(driver.on_write_complete(), Some(TxStep::Done(_))));
        assert!(driver.is_tx_idle());

        let stats = driver.stats();
        assert_eq!(stats.stale_completes, 1);
        assert_eq!(stats.writes, stats.write_completes);
    }

    #[test]
    fn aborted_write_completion_without_successor_idles() {
        let mut driver = driver(MockPort::new());
        let mut txn = driver.pool.alloc().expect("alloc");
        txn.push_segment(vec![1, 2]).expect("segment");

        assert!(matches!(driver.transact(txn), TxStep::InFlight));
        assert!(driver.abort_tx().is_some());
        assert!(driver.on_write_complete().is_none());
        assert!(driver.is_tx_idle());
        assert!(driver.abort_tx().is_none());
    }

    #[test]
    fn spurious_write_complete_is_ignored() {
        let mut driver = driver(MockPort::new());
        assert!(driver.on_write_complete().is_none());
    }

    #[test]
    fn receives_back_to_back_packets_in_one_event() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect::default();
        let mut bytes = frame(FrameHeader::event(0x0e, 3), &[1, 2, 3]);
        bytes.push(0x30);
        bytes.extend(frame(FrameHeader::vendor(0x11, 2), &[7, 7]));
        port.push_rx(&bytes);

        driver.on_read_ready(&mut sink);

        assert_eq!(sink.packets.len(), 3);
        assert_eq!(sink.packets[0].channel(), 0x04);
        assert_eq!(sink.packets[0].payload(), vec![1, 2, 3]);
        assert_eq!(sink.packets[1].single_step(), Some(SleepOp::SleepInd));
        assert_eq!(sink.packets[1].payload_len(), 0);
        assert_eq!(sink.packets[2].channel(), 0x09);
        assert_eq!(
            sink.packets[2].header().map(FrameHeader::header_bytes),
            Some(&[0x11, 0x02, 0x00][..])
        );
        assert_eq!(driver.rx_state(), RxState::PacketType);
    }

    #[test]
    fn zero_length_payload_skips_data_state() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect::default();
        port.push_rx(&frame(FrameHeader::event(0x05, 0), &[]));

        driver.on_read_ready(&mut sink);

        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].payload_len(), 0);
        assert_eq!(driver.rx_state(), RxState::PacketType);
    }

    #[test]
    fn packet_split_across_events_is_reassembled() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect::default();
        let bytes = frame(FrameHeader::acl(0x0042, 4), &[1, 2, 3, 4]);

        port.push_rx(&bytes[..3]);
        driver.on_read_ready(&mut sink);
        assert_eq!(driver.rx_state(), RxState::Header);
        port.push_rx(&bytes[3..7]);
        driver.on_read_ready(&mut sink);
        assert_eq!(driver.rx_state(), RxState::Data);
        assert!(sink.packets.is_empty());
        port.push_rx(&bytes[7..]);
        driver.on_read_ready(&mut sink);

        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].payload(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_type_reports_error_and_resyncs() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect::default();
        let mut bytes = vec![0x7f];
        bytes.extend(frame(FrameHeader::event(0x0e, 1), &[9]));
        port.push_rx(&bytes);

        driver.on_read_ready(&mut sink);

        assert_eq!(sink.errors.len(), 1);
        assert!(matches!(
            sink.errors[0],
            BusError::Framing(FrameError::UnknownPacketType(0x7f))
        ));
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(driver.stats().rx_err, 1);
    }

    #[test]
    fn read_failure_discards_input_and_resyncs() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect::default();
        port.push_rx(&[0x04, 0x0e]);
        driver.on_read_ready(&mut sink);
        assert_eq!(driver.rx_state(), RxState::Header);

        port.push_rx(&[0x01, 0x07]);
        port.fail_reads(true);
        driver.on_read_ready(&mut sink);

        assert_eq!(sink.errors.len(), 1);
        assert!(matches!(sink.errors[0], BusError::Read(_)));
        assert_eq!(driver.stats().rx_err, 1);
        assert_eq!(driver.rx_state(), RxState::PacketType);
        assert_eq!(port.read_resets(), 1);
        assert_eq!(port.pending_rx(), 0);

        port.fail_reads(false);
        port.push_rx(&frame(FrameHeader::event(0x0e, 1), &[3]));
        driver.on_read_ready(&mut sink);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].payload(), vec![3]);
    }

    #[test]
    fn oversized_length_is_rejected_before_reading_payload() {
        let port = MockPort::new();
        let mut driver = BusDriver::new(port.clone(), pool(), 16);
        let mut sink = Collect::default();
        port.push_rx(&[0x02, 0x01, 0x00, 0x20, 0x00]);

        driver.on_read_ready(&mut sink);

        assert!(matches!(
            sink.errors[0],
            BusError::Framing(FrameError::Oversized {
                declared: 32,
                capacity: 16
            })
        ));
        assert!(sink.packets.is_empty());
        assert_eq!(driver.rx_state(), RxState::PacketType);
    }

    #[test]
    fn rejection_congests_until_buffer_available() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect {
            reject_next: 1,
            ..Collect::default()
        };
        let mut bytes = frame(FrameHeader::event(0x0e, 1), &[1]);
        bytes.extend(frame(FrameHeader::event(0x0e, 1), &[2]));
        port.push_rx(&bytes);

        driver.on_read_ready(&mut sink);
        assert_eq!(driver.rx_state(), RxState::Congestion);
        assert!(driver.has_held_packet());
        assert_eq!(port.pending_rx(), 4, "second packet stays in the port");

        driver.on_read_ready(&mut sink);
        assert_eq!(port.pending_rx(), 4);

        driver.buffer_available(&mut sink);
        assert_eq!(driver.rx_state(), RxState::PacketType);
        let payloads: Vec<_> = sink.packets.iter().map(Transaction::payload).collect();
        assert_eq!(payloads, vec![vec![1], vec![2]]);
        assert_eq!(port.read_restarts(), 1);
    }

    #[test]
    fn repeated_rejection_keeps_congestion() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect {
            reject_next: 2,
            ..Collect::default()
        };
        port.push_rx(&frame(FrameHeader::event(0x0e, 1), &[1]));

        driver.on_read_ready(&mut sink);
        driver.buffer_available(&mut sink);
        assert_eq!(driver.rx_state(), RxState::Congestion);
        assert!(driver.has_held_packet());

        driver.buffer_available(&mut sink);
        assert_eq!(driver.rx_state(), RxState::PacketType);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(driver.stats().rx_rejected, 2);
    }

    #[test]
    fn pool_exhaustion_congests_reader() {
        let port = MockPort::new();
        let pool = TxnPool::new(PoolConfig {
            txn_count: 1,
            ..PoolConfig::default()
        })
        .expect("create pool");
        let mut driver = BusDriver::new(port.clone(), pool, DEFAULT_RX_BUFFER_SIZE);
        let mut sink = Collect::default();
        let mut bytes = frame(FrameHeader::event(0x0e, 1), &[1]);
        bytes.extend(frame(FrameHeader::event(0x0e, 1), &[2]));
        port.push_rx(&bytes);

        driver.on_read_ready(&mut sink);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(driver.rx_state(), RxState::Congestion);
        assert_eq!(driver.stats().alloc_err, 1);

        sink.packets.clear();
        driver.buffer_available(&mut sink);
        assert_eq!(sink.packets.len(), 1);
        assert_eq!(sink.packets[0].payload(), vec![2]);
    }

    #[test]
    fn reset_rx_drops_partial_packet() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        let mut sink = Collect::default();
        port.push_rx(&[0x04, 0x0e]);
        driver.on_read_ready(&mut sink);
        assert_eq!(driver.rx_state(), RxState::Header);

        driver.reset_rx();
        port.push_rx(&frame(FrameHeader::event(0x0f, 1), &[5]));
        driver.on_read_ready(&mut sink);

        assert_eq!(sink.packets.len(), 1);
        assert_eq!(
            sink.packets[0].header().map(FrameHeader::header_bytes),
            Some(&[0x0f, 0x01][..])
        );
    }

    #[test]
    fn reset_reinitializes_port() {
        let port = MockPort::new();
        let mut driver = driver(port.clone());
        driver.set_speed(921_600).expect("set speed");
        assert_eq!(port.speed(), 921_600);
        driver.reset(115_200).expect("reset");
        assert_eq!(port.speed(), 115_200);
        assert_eq!(port.resets(), 1);
    }
}
