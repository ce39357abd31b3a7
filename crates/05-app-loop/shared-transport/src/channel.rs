//! Channel number to receive handler table.

use log::{debug, warn};
use transport::{RxOutcome, Transaction, TransportError, TransportResult};

/// Receives packets of one channel on the transport's I/O thread.
///
/// Returning [`RxOutcome::Rejected`] hands the packet back and stalls
/// reception until the owner signals buffer availability.
pub type ChannelHandler = Box<dyn FnMut(Transaction) -> RxOutcome + Send>;

pub(crate) enum Dispatch {
    Handled(RxOutcome),
    Unregistered,
}

pub(crate) struct ChannelTable {
    handlers: Vec<Option<ChannelHandler>>,
}

impl ChannelTable {
    pub(crate) fn new(max_channels: usize) -> Self {
        Self {
            handlers: (0..max_channels).map(|_| None).collect(),
        }
    }

    pub(crate) fn open(&mut self, channel: u8, handler: ChannelHandler) -> TransportResult<()> {
        let max = self.handlers.len();
        let slot = self
            .handlers
            .get_mut(channel as usize)
            .ok_or(TransportError::InvalidChannel { channel, max })?;
        if slot.is_some() {
            warn!("transport: channel {channel} handler replaced");
        }
        *slot = Some(handler);
        debug!("transport: channel {channel} open");
        Ok(())
    }

    pub(crate) fn close(&mut self, channel: u8) -> TransportResult<()> {
        let max = self.handlers.len();
        let slot = self
            .handlers
            .get_mut(channel as usize)
            .ok_or(TransportError::InvalidChannel { channel, max })?;
        *slot = None;
        debug!("transport: channel {channel} closed");
        Ok(())
    }

    pub(crate) fn is_open(&self, channel: u8) -> bool {
        matches!(self.handlers.get(channel as usize), Some(Some(_)))
    }

    pub(crate) fn dispatch(&mut self, txn: Transaction) -> Dispatch {
        match self
            .handlers
            .get_mut(txn.channel() as usize)
            .and_then(Option::as_mut)
        {
            Some(handler) => Dispatch::Handled(handler(txn)),
            None => Dispatch::Unregistered,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.iter_mut().for_each(|slot| *slot = None);
    }
}
