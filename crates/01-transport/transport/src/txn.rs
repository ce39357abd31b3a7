//! Transactions: the unit of work that flows through the stack.
//!
//! A transaction is exclusively owned by whichever layer currently holds it.
//! Dropping it frees the object and every pooled buffer back to its pool.

use std::sync::Arc;

use crossbeam_channel::Sender;
use smallvec::SmallVec;
use transport_codecs::{FrameHeader, SleepOp};

use crate::pool::{BufClass, PoolShared};
use crate::{TransportError, TransportResult};

/// Maximum number of data segments a transaction can carry.
pub const MAX_XFER_BUFS: usize = 4;

/// Direction of a transaction relative to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TxnDirection {
    /// Host to peer.
    #[default]
    Write,
    /// Peer to host.
    Read,
}

/// Completion status of a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TxnStatus {
    /// Completed successfully.
    Ok,
    /// Queued or in flight.
    #[default]
    Pending,
    /// Abandoned after an I/O failure.
    Error,
    /// Flushed out of a queue during restart or shutdown.
    Recovery,
}

/// Outcome of offering a received transaction to a consumer.
#[derive(Debug)]
pub enum RxOutcome {
    /// The consumer took ownership.
    Accepted,
    /// The consumer cannot take the packet now and hands it back.
    Rejected(Transaction),
}

/// One data buffer attached to a transaction.
#[derive(Debug)]
pub struct Segment {
    buf: Vec<u8>,
    len: usize,
    class: Option<BufClass>,
}

impl Segment {
    pub(crate) fn pooled(buf: Vec<u8>, len: usize, class: BufClass) -> Self {
        Self {
            buf,
            len,
            class: Some(class),
        }
    }

    /// Valid bytes of the segment.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Whole backing buffer, used by receivers that fill it incrementally.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }

    /// Number of valid bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the segment holds no valid bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the backing buffer.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Sets the number of valid bytes, clamped to the capacity.
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    /// Copies `data` into the segment and sets its length.
    pub fn fill(&mut self, data: &[u8]) -> TransportResult<()> {
        if data.len() > self.buf.len() {
            return Err(TransportError::BufferTooLarge {
                requested: data.len(),
                maximum: self.buf.len(),
            });
        }
        self.buf[..data.len()].copy_from_slice(data);
        self.len = data.len();
        Ok(())
    }
}

/// A packet to send or a packet received, with its routing metadata.
pub struct Transaction {
    priority: u8,
    func_id: u8,
    channel: u8,
    direction: TxnDirection,
    status: TxnStatus,
    header: Option<FrameHeader>,
    segments: SmallVec<[Segment; MAX_XFER_BUFS]>,
    completion: Option<Sender<Transaction>>,
    pool: Arc<PoolShared>,
}

impl Transaction {
    pub(crate) fn new(pool: Arc<PoolShared>, segments: SmallVec<[Segment; MAX_XFER_BUFS]>) -> Self {
        Self {
            priority: 0,
            func_id: 0,
            channel: 0,
            direction: TxnDirection::Write,
            status: TxnStatus::Pending,
            header: None,
            segments,
            completion: None,
            pool,
        }
    }

    pub(crate) fn attach(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Queue priority; 0 is the highest.
    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = priority;
    }

    /// Queue function that owns the transaction.
    pub fn func_id(&self) -> u8 {
        self.func_id
    }

    pub fn set_func_id(&mut self, func_id: u8) {
        self.func_id = func_id;
    }

    /// Logical channel; equals the packet-type byte for received packets.
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn set_channel(&mut self, channel: u8) {
        self.channel = channel;
    }

    pub fn direction(&self) -> TxnDirection {
        self.direction
    }

    pub fn set_direction(&mut self, direction: TxnDirection) {
        self.direction = direction;
    }

    pub fn status(&self) -> TxnStatus {
        self.status
    }

    pub fn set_status(&mut self, status: TxnStatus) {
        self.status = status;
    }

    /// Preformatted wire header written ahead of the segments.
    pub fn header(&self) -> Option<&FrameHeader> {
        self.header.as_ref()
    }

    pub fn set_header(&mut self, header: FrameHeader) {
        self.header = Some(header);
    }

    /// Marks the transaction as a sleep-protocol control packet.
    ///
    /// Single-step transactions are written as their one-byte header; any
    /// segments are ignored on transmit.
    pub fn set_single_step(&mut self, op: SleepOp) {
        self.header = Some(FrameHeader::sleep(op));
    }

    /// Sleep opcode when this is a single-step control transaction.
    pub fn single_step(&self) -> Option<SleepOp> {
        self.header.and_then(|header| header.packet_type().sleep_op())
    }

    pub fn is_single_step(&self) -> bool {
        self.single_step().is_some()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn segment_mut(&mut self, index: usize) -> Option<&mut Segment> {
        self.segments.get_mut(index)
    }

    /// Attaches a caller-owned buffer; it is not returned to the pool on drop.
    pub fn push_segment(&mut self, data: Vec<u8>) -> TransportResult<()> {
        if self.segments.len() == MAX_XFER_BUFS {
            return Err(TransportError::TooManySegments(MAX_XFER_BUFS));
        }
        let len = data.len();
        self.segments.push(Segment {
            buf: data,
            len,
            class: None,
        });
        Ok(())
    }

    /// Sum of the valid bytes of every segment.
    pub fn payload_len(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    /// Copies the valid bytes of every segment into one vector.
    pub fn payload(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload_len());
        for segment in &self.segments {
            out.extend_from_slice(segment.as_slice());
        }
        out
    }

    /// Channel on which the owner expects the finished transaction back.
    pub fn set_completion(&mut self, completion: Sender<Transaction>) {
        self.completion = Some(completion);
    }

    pub fn take_completion(&mut self) -> Option<Sender<Transaction>> {
        self.completion.take()
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("priority", &self.priority)
            .field("func_id", &self.func_id)
            .field("channel", &self.channel)
            .field("direction", &self.direction)
            .field("status", &self.status)
            .field("header", &self.header)
            .field("segments", &self.segments.len())
            .field("payload_len", &self.payload_len())
            .finish()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        for segment in self.segments.drain(..) {
            if let Some(class) = segment.class {
                self.pool.release_buffer(class, segment.buf);
            }
        }
        self.pool.release_txn();
    }
}
