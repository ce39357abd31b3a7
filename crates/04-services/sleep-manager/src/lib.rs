//! Interface sleep manager: the link power handshake with the peer chip.
//!
//! The manager is a pure state machine. Every handler computes the transition
//! and returns the side effects it implies as [`SleepAction`]s; the owner
//! applies them (queue control packets, stop or run the transaction queue,
//! reset receive framing) before handling the next event, so no observer sees
//! a half-applied transition.

use std::time::{Duration, Instant};

use log::{debug, error, trace};
use smallvec::SmallVec;
use transport_codecs::SleepOp;

/// Link power state as seen from the host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SleepState {
    /// Link is down; a send must wake the peer first.
    Asleep,
    /// Wake indication sent; user traffic waits for the acknowledgment.
    WaitForAwakeAck,
    /// Link is up.
    #[default]
    Awake,
    /// Sleep acknowledgment queued; the link sleeps once it is on the wire.
    WaitForSleepAckTxComplete,
}

/// Side effect requested by a transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SleepAction {
    /// Queue a single-step control packet.
    Emit(SleepOp),
    /// Hold back user transactions.
    StopQueue,
    /// Release user transactions.
    RunQueue,
    /// Restart receive framing.
    ResetRx,
}

/// Actions produced by one event.
pub type SleepActions = SmallVec<[SleepAction; 4]>;

/// Handshake counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SleepStats {
    pub awake_ind_tx: u32,
    pub awake_ind_rx: u32,
    pub awake_ack_tx: u32,
    pub awake_ack_rx: u32,
    pub sleep_ind_rx: u32,
    pub sleep_ack_tx: u32,
    pub sleep_ack_rx: u32,
    pub sleep_ack_tx_complete: u32,
    /// Wake indications re-sent after the acknowledgment timed out.
    pub wake_retries: u32,
    /// Protocol violations.
    pub errors: u32,
}

/// Sleep manager settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SleepConfig {
    /// Re-send the wake indication when no acknowledgment arrives within this
    /// window. `None` waits indefinitely.
    pub wake_ack_timeout: Option<Duration>,
}

/// Four-state sleep/wake handshake.
#[derive(Debug, Default)]
pub struct SleepManager {
    state: SleepState,
    config: SleepConfig,
    waiting_since: Option<Instant>,
    stats: SleepStats,
}

impl SleepManager {
    pub fn new(config: SleepConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn state(&self) -> SleepState {
        self.state
    }

    pub fn stats(&self) -> SleepStats {
        self.stats
    }

    /// Returns to `Awake` after the link was re-initialized and cycles the queue.
    pub fn reinit(&mut self) -> SleepActions {
        self.enter(SleepState::Awake);
        SmallVec::from_slice(&[SleepAction::StopQueue, SleepAction::RunQueue])
    }

    /// A user transaction is about to be queued.
    pub fn on_tx_request(&mut self, now: Instant) -> SleepActions {
        let mut actions = SleepActions::new();
        if self.state == SleepState::Asleep {
            self.enter(SleepState::WaitForAwakeAck);
            self.emit_wake_ind(&mut actions, now);
        }
        actions
    }

    /// Raw input arrived before framing.
    pub fn on_rx_ready(&mut self) -> SleepActions {
        let mut actions = SleepActions::new();
        if self.state == SleepState::Asleep {
            // Input from a sleeping link counts as the peer's wake indication.
            self.stats.awake_ind_rx += 1;
            self.enter(SleepState::Awake);
            actions.push(SleepAction::ResetRx);
            self.emit(&mut actions, SleepOp::WakeAck);
            actions.push(SleepAction::RunQueue);
        }
        actions
    }

    /// A sleep-protocol packet was received.
    pub fn on_control_packet(&mut self, op: SleepOp) -> SleepActions {
        let mut actions = SleepActions::new();
        match op {
            SleepOp::SleepInd => {
                self.stats.sleep_ind_rx += 1;
                if self.state == SleepState::Awake {
                    self.enter(SleepState::WaitForSleepAckTxComplete);
                    actions.push(SleepAction::StopQueue);
                    self.emit(&mut actions, SleepOp::SleepAck);
                } else {
                    debug!("sleep manager: sleep indication ignored in {:?}", self.state);
                }
            }
            SleepOp::SleepAck => {
                self.stats.sleep_ack_rx += 1;
                self.violation("unexpected sleep acknowledgment");
            }
            SleepOp::WakeInd => {
                self.stats.awake_ind_rx += 1;
                match self.state {
                    SleepState::Asleep => {
                        self.enter(SleepState::Awake);
                        self.emit(&mut actions, SleepOp::WakeAck);
                        actions.push(SleepAction::RunQueue);
                    }
                    SleepState::WaitForAwakeAck => {
                        self.enter(SleepState::Awake);
                        actions.push(SleepAction::RunQueue);
                    }
                    state => debug!("sleep manager: wake indication ignored in {state:?}"),
                }
            }
            SleepOp::WakeAck => {
                self.stats.awake_ack_rx += 1;
                if self.state == SleepState::WaitForAwakeAck {
                    self.enter(SleepState::Awake);
                    actions.push(SleepAction::RunQueue);
                } else {
                    self.violation("wake acknowledgment without pending wake indication");
                }
            }
        }
        actions
    }

    /// An ordinary data packet was received.
    pub fn on_data_packet(&mut self) -> SleepActions {
        let mut actions = SleepActions::new();
        if self.state == SleepState::Asleep {
            self.enter(SleepState::Awake);
            self.emit(&mut actions, SleepOp::WakeAck);
            actions.push(SleepAction::RunQueue);
        }
        actions
    }

    /// A control packet finished transmitting.
    ///
    /// `queue_empty` reports whether user transactions are still waiting.
    pub fn on_tx_complete(&mut self, op: SleepOp, queue_empty: bool, now: Instant) -> SleepActions {
        let mut actions = SleepActions::new();
        if op != SleepOp::SleepAck || self.state != SleepState::WaitForSleepAckTxComplete {
            return actions;
        }
        self.stats.sleep_ack_tx_complete += 1;
        if queue_empty {
            self.enter(SleepState::Asleep);
        } else {
            self.enter(SleepState::WaitForAwakeAck);
            self.emit_wake_ind(&mut actions, now);
        }
        actions
    }

    /// Periodic check for an overdue wake acknowledgment.
    pub fn on_tick(&mut self, now: Instant) -> SleepActions {
        let mut actions = SleepActions::new();
        let (Some(timeout), Some(since)) = (self.config.wake_ack_timeout, self.waiting_since) else {
            return actions;
        };
        if self.state == SleepState::WaitForAwakeAck && now.duration_since(since) >= timeout {
            self.stats.wake_retries += 1;
            debug!("sleep manager: wake acknowledgment overdue, retrying");
            self.emit_wake_ind(&mut actions, now);
        }
        actions
    }

    fn enter(&mut self, state: SleepState) {
        if self.state != state {
            trace!("sleep manager: {:?} -> {state:?}", self.state);
        }
        if state != SleepState::WaitForAwakeAck {
            self.waiting_since = None;
        }
        self.state = state;
    }

    fn emit_wake_ind(&mut self, actions: &mut SleepActions, now: Instant) {
        self.waiting_since = Some(now);
        self.emit(actions, SleepOp::WakeInd);
    }

    fn emit(&mut self, actions: &mut SleepActions, op: SleepOp) {
        match op {
            SleepOp::WakeInd => self.stats.awake_ind_tx += 1,
            SleepOp::WakeAck => self.stats.awake_ack_tx += 1,
            SleepOp::SleepAck => self.stats.sleep_ack_tx += 1,
            SleepOp::SleepInd => {}
        }
        actions.push(SleepAction::Emit(op));
    }

    fn violation(&mut self, what: &str) {
        self.stats.errors += 1;
        error!("sleep manager: {what} in {:?}", self.state);
    }
}
