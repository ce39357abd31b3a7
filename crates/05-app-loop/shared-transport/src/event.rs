//! Notifications the transport raises toward its owner.

/// Class of a runtime failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Transmit path failure; the affected transaction was abandoned.
    TxErr,
    /// Receive path failure; framing restarted.
    RxErr,
    /// The pool could not supply an internal transaction.
    NoResource,
}

/// How badly the link is affected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    /// The link may need [`crate::TransportEngine::reinit`].
    Critical,
}

/// Component that detected the failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Module {
    BusDriver,
    SleepManager,
}

/// Events delivered through the transport's event handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportEvent {
    /// The transport is open and ready for channels.
    InitComplete,
    /// The transport shut down; queued sends were flushed.
    DestroyComplete,
    Error {
        kind: ErrorKind,
        severity: Severity,
        module: Module,
    },
}

/// Receives [`TransportEvent`]s on the thread that owns the transport.
pub type EventHandler = Box<dyn FnMut(TransportEvent) + Send>;
