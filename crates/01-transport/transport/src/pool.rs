//! Fixed-capacity transaction pool shared by callers and the I/O thread.
//!
//! The pool hands out a bounded number of transactions and two classes of
//! pre-allocated data buffers. Allocation never blocks: exhaustion comes back
//! as [`TransportError::NoResource`] and callers treat it as backpressure.
//! Buffers return to their free list when the owning transaction is dropped.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use serde::Deserialize;
use smallvec::SmallVec;

use crate::error::Resource;
use crate::txn::{Segment, Transaction, MAX_XFER_BUFS};
use crate::{TransportError, TransportResult};

/// Shape of a transaction pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of transactions that may be alive at once.
    pub txn_count: usize,
    /// Size in bytes of each short buffer.
    pub short_buf_size: usize,
    /// Number of short buffers.
    pub short_buf_count: usize,
    /// Size in bytes of each long buffer.
    pub long_buf_size: usize,
    /// Number of long buffers.
    pub long_buf_count: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            txn_count: 55,
            short_buf_size: 200,
            short_buf_count: 50,
            long_buf_size: 1038,
            long_buf_count: 50,
        }
    }
}

/// Buffer size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BufClass {
    /// Buffers up to [`PoolConfig::short_buf_size`] bytes.
    Short,
    /// Buffers up to [`PoolConfig::long_buf_size`] bytes.
    Long,
}

/// Point-in-time view of pool occupancy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Transactions currently allocated.
    pub live_txns: usize,
    /// Short buffers on the free list.
    pub free_short: usize,
    /// Long buffers on the free list.
    pub free_long: usize,
    /// Allocations refused since creation.
    pub alloc_failures: u32,
}

pub(crate) struct PoolShared {
    config: PoolConfig,
    live_txns: AtomicUsize,
    alloc_failures: AtomicU32,
    free_short: Mutex<Vec<Vec<u8>>>,
    free_long: Mutex<Vec<Vec<u8>>>,
}

impl PoolShared {
    fn free_list(&self, class: BufClass) -> &Mutex<Vec<Vec<u8>>> {
        match class {
            BufClass::Short => &self.free_short,
            BufClass::Long => &self.free_long,
        }
    }

    fn try_reserve_txn(&self) -> bool {
        let limit = self.config.txn_count;
        self.live_txns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            })
            .is_ok()
    }

    pub(crate) fn release_txn(&self) {
        self.live_txns.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn release_buffer(&self, class: BufClass, buf: Vec<u8>) {
        self.free_list(class).lock().push(buf);
    }

    fn fail(&self, resource: Resource) -> TransportError {
        self.alloc_failures.fetch_add(1, Ordering::Relaxed);
        trace!("txn pool: allocation refused ({resource:?})");
        TransportError::NoResource(resource)
    }
}

/// Cloneable handle to a shared transaction pool.
#[derive(Clone)]
pub struct TxnPool {
    shared: Arc<PoolShared>,
}

impl TxnPool {
    /// Creates a pool and pre-allocates every buffer.
    pub fn new(config: PoolConfig) -> TransportResult<Self> {
        if config.txn_count == 0 {
            return Err(TransportError::invalid_config("pool needs at least one transaction"));
        }
        if config.short_buf_size > config.long_buf_size {
            return Err(TransportError::invalid_config(
                "short buffer class must not exceed the long class",
            ));
        }
        let short = (0..config.short_buf_count)
            .map(|_| vec![0u8; config.short_buf_size])
            .collect();
        let long = (0..config.long_buf_count)
            .map(|_| vec![0u8; config.long_buf_size])
            .collect();
        Ok(Self {
            shared: Arc::new(PoolShared {
                config,
                live_txns: AtomicUsize::new(0),
                alloc_failures: AtomicU32::new(0),
                free_short: Mutex::new(short),
                free_long: Mutex::new(long),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Allocates a transaction without buffers.
    pub fn alloc(&self) -> TransportResult<Transaction> {
        if !self.shared.try_reserve_txn() {
            return Err(self.shared.fail(Resource::Transactions));
        }
        Ok(Transaction::new(Arc::clone(&self.shared), SmallVec::new()))
    }

    /// Allocates a transaction with one buffer whose valid length is `size`.
    pub fn alloc_with_buffer(&self, size: usize) -> TransportResult<Transaction> {
        self.alloc_with_buffers(&[size])
    }

    /// Allocates a transaction with one buffer per entry of `sizes`.
    ///
    /// Allocation is all-or-nothing: on failure every buffer already taken is
    /// returned before the error is reported.
    pub fn alloc_with_buffers(&self, sizes: &[usize]) -> TransportResult<Transaction> {
        if sizes.len() > MAX_XFER_BUFS {
            return Err(TransportError::TooManySegments(sizes.len()));
        }
        let classes = sizes
            .iter()
            .map(|&size| self.class_for(size))
            .collect::<TransportResult<SmallVec<[BufClass; MAX_XFER_BUFS]>>>()?;

        if !self.shared.try_reserve_txn() {
            return Err(self.shared.fail(Resource::Transactions));
        }
        // Buffers taken so far go back to the pool when `txn` drops on failure.
        let mut txn = Transaction::new(Arc::clone(&self.shared), SmallVec::new());
        for (&size, &class) in sizes.iter().zip(classes.iter()) {
            let Some(buf) = self.shared.free_list(class).lock().pop() else {
                let resource = match class {
                    BufClass::Short => Resource::ShortBuffers,
                    BufClass::Long => Resource::LongBuffers,
                };
                return Err(self.shared.fail(resource));
            };
            txn.attach(Segment::pooled(buf, size, class));
        }
        Ok(txn)
    }

    fn class_for(&self, size: usize) -> TransportResult<BufClass> {
        let config = &self.shared.config;
        if size <= config.short_buf_size && config.short_buf_count > 0 {
            Ok(BufClass::Short)
        } else if size <= config.long_buf_size {
            Ok(BufClass::Long)
        } else {
            Err(TransportError::BufferTooLarge {
                requested: size,
                maximum: config.long_buf_size,
            })
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live_txns: self.shared.live_txns.load(Ordering::Acquire),
            free_short: self.shared.free_short.lock().len(),
            free_long: self.shared.free_long.lock().len(),
            alloc_failures: self.shared.alloc_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for TxnPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}
