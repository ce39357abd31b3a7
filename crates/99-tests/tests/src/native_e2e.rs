#![cfg(all(test, not(target_arch = "wasm32")))]
//! Drives a [`NativeTransport`] over the loopback link from the chip side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use runtime_native::loopback::{loopback, ChipEnd};
use runtime_native::{event_channel, NativeTransport, SendTicket};
use shared_transport::{
    RxState, SleepState, TransportConfig, TransportEvent, TransportStatistics,
};
use transport::{FrameHeader, RxOutcome, TxnStatus};

const WAIT: Duration = Duration::from_secs(2);

struct Link {
    transport: NativeTransport,
    chip: ChipEnd,
    events: Receiver<TransportEvent>,
}

impl Link {
    fn start(config: TransportConfig) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (port, chip, port_events) = loopback(16);
        let (handler, events) = event_channel();
        let transport =
            NativeTransport::spawn(config, port, port_events, handler).expect("spawn transport");
        Self {
            transport,
            chip,
            events,
        }
    }

    fn send_command(&self, opcode: u16, priority: u8, payload: &[u8]) -> SendTicket {
        let mut txn = self
            .transport
            .pool()
            .alloc_with_buffer(payload.len())
            .expect("alloc");
        txn.set_channel(0x01);
        txn.set_priority(priority);
        txn.set_header(FrameHeader::command(opcode, payload.len() as u8));
        txn.segment_mut(0)
            .expect("segment")
            .fill(payload)
            .expect("fill");
        self.transport.send(txn).expect("send")
    }

    fn wait_stats(&self, what: &str, done: impl Fn(&TransportStatistics) -> bool) {
        let deadline = Instant::now() + WAIT;
        loop {
            let stats = self.transport.statistics().expect("statistics");
            if done(&stats) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {what}: {stats:?}");
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn put_to_sleep(&self) {
        self.chip.inject(&[0x30]);
        assert_eq!(self.chip.wait_written(1, WAIT), vec![0x31]);
        self.wait_stats("asleep", |s| s.sleep_state == SleepState::Asleep);
    }
}

fn event_frame(code: u8, payload: &[u8]) -> Vec<u8> {
    let mut bytes = FrameHeader::event(code, payload.len() as u8)
        .wire_bytes()
        .to_vec();
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn received_events_reach_the_channel_handler() {
    let link = Link::start(TransportConfig::default());
    let (tx, rx) = unbounded();
    link.transport
        .open(0x04, move |txn| {
            let _ = tx.send((txn.channel(), txn.payload()));
            RxOutcome::Accepted
        })
        .expect("open");

    let mut stream = event_frame(0x0e, &[0x01, 0x03, 0x0c, 0x00]);
    stream.extend(event_frame(0x13, &[0x05]));
    // Split across injections so framing spans several reads.
    let (first, second) = stream.split_at(5);
    link.chip.inject(first);
    link.chip.inject(second);

    assert_eq!(
        rx.recv_timeout(WAIT).expect("first"),
        (0x04, vec![0x01, 0x03, 0x0c, 0x00])
    );
    assert_eq!(rx.recv_timeout(WAIT).expect("second"), (0x04, vec![0x05]));
    link.wait_stats("rx counters", |s| s.transport.rx_ind == 2);
}

#[test]
fn concurrent_senders_all_complete_in_full() {
    let link = Arc::new(Link::start(TransportConfig::default()));
    let senders: Vec<_> = (0..4u8)
        .map(|id| {
            let link = Arc::clone(&link);
            thread::spawn(move || {
                (0..8u8)
                    .map(|n| link.send_command(0x0400 | u16::from(id), id % 3, &[id, n, 0xee]))
                    .map(|ticket| ticket.wait_timeout(WAIT).expect("completion").status())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    for sender in senders {
        let statuses = sender.join().expect("sender thread");
        assert!(statuses.iter().all(|status| *status == TxnStatus::Ok));
    }

    // 32 command frames of 4 header bytes and 3 payload bytes each.
    let written = link.chip.wait_written(32 * 7, WAIT);
    assert_eq!(written.len(), 32 * 7);
    for frame in written.chunks(7) {
        assert_eq!(frame[0], 0x01);
        assert_eq!(frame[3], 3);
        assert_eq!(frame[6], 0xee);
    }
    link.wait_stats("tx counters", |s| s.transport.tx_complete == 32);
}

#[test]
fn sleep_handshake_defers_sends_until_woken() {
    let link = Link::start(TransportConfig::default());
    let (tx, rx) = unbounded();
    link.transport
        .open(0x04, move |txn| {
            let _ = tx.send(txn.payload());
            RxOutcome::Accepted
        })
        .expect("open");

    link.put_to_sleep();

    let ticket = link.send_command(0x0c03, 0, &[]);
    assert_eq!(link.chip.wait_written(1, WAIT), vec![0x32]);
    assert!(ticket.try_take().is_none());
    link.wait_stats("waiting for wake ack", |s| {
        s.sleep_state == SleepState::WaitForAwakeAck
    });

    link.chip.inject(&[0x33]);
    let txn = ticket.wait_timeout(WAIT).expect("completion");
    assert_eq!(txn.status(), TxnStatus::Ok);
    assert_eq!(link.chip.wait_written(4, WAIT), vec![0x01, 0x03, 0x0c, 0x00]);

    link.chip.inject(&event_frame(0x0e, &[0x01]));
    assert_eq!(rx.recv_timeout(WAIT).expect("event"), vec![0x01]);
    link.wait_stats("awake", |s| s.sleep_state == SleepState::Awake);
}

#[test]
fn data_from_a_sleeping_peer_wakes_the_link() {
    let link = Link::start(TransportConfig::default());
    let (tx, rx) = unbounded();
    link.transport
        .open(0x04, move |txn| {
            let _ = tx.send(txn.payload());
            RxOutcome::Accepted
        })
        .expect("open");

    link.put_to_sleep();
    link.chip.inject(&event_frame(0x0f, &[0x00, 0x01]));

    assert_eq!(rx.recv_timeout(WAIT).expect("event"), vec![0x00, 0x01]);
    assert_eq!(link.chip.wait_written(1, WAIT), vec![0x33]);
    link.wait_stats("awake", |s| s.sleep_state == SleepState::Awake);
}

#[test]
fn rejected_packet_is_redelivered_after_buffer_available() {
    let link = Link::start(TransportConfig::default());
    let full = Arc::new(AtomicBool::new(true));
    let seen = Arc::new(Mutex::new(Vec::new()));
    {
        let full = Arc::clone(&full);
        let seen = Arc::clone(&seen);
        link.transport
            .open(0x04, move |txn| {
                if full.load(Ordering::Acquire) {
                    return RxOutcome::Rejected(txn);
                }
                seen.lock().push(txn.payload());
                RxOutcome::Accepted
            })
            .expect("open");
    }

    link.chip.inject(&event_frame(0x0e, &[0x0a]));
    link.chip.inject(&event_frame(0x0e, &[0x0b]));
    link.wait_stats("congestion", |s| s.rx_state == RxState::Congestion);
    assert!(seen.lock().is_empty());

    full.store(false, Ordering::Release);
    link.transport.buffer_available().expect("buffer available");
    link.wait_stats("both delivered", |s| s.transport.rx_ind == 2);
    assert_eq!(*seen.lock(), vec![vec![0x0a], vec![0x0b]]);

    let stats = link.transport.statistics().expect("statistics");
    assert_eq!(stats.rx_state, RxState::PacketType);
    assert_eq!(stats.transport.rx_rejected, 1);
}

#[test]
fn shutdown_flushes_deferred_sends_with_recovery() {
    let link = Link::start(TransportConfig::default());
    link.put_to_sleep();

    let tickets: Vec<_> = (0..3).map(|n| link.send_command(0x0c03, 0, &[n])).collect();
    assert_eq!(link.chip.wait_written(1, WAIT), vec![0x32]);

    let Link {
        transport, events, ..
    } = link;
    transport.shutdown();

    for ticket in tickets {
        let txn = ticket.wait_timeout(WAIT).expect("flushed");
        assert_eq!(txn.status(), TxnStatus::Recovery);
    }
    let seen: Vec<_> = events.try_iter().collect();
    assert_eq!(
        seen,
        vec![TransportEvent::InitComplete, TransportEvent::DestroyComplete]
    );
}

#[test]
fn config_from_toml_drives_the_link() {
    let config = TransportConfig::from_toml_str(
        r#"
        baud_rate = 921600
        max_priorities = 2

        [pool]
        txn_count = 4
        "#,
    )
    .expect("config");
    let link = Link::start(config);
    assert_eq!(link.chip.speed(), 921_600);

    let mut txn = link.transport.pool().alloc().expect("alloc");
    txn.set_priority(2);
    assert!(link.transport.send(txn).is_err());

    let tickets: Vec<_> = (0..3).map(|_| link.send_command(0x0c03, 1, &[])).collect();
    for ticket in tickets {
        assert_eq!(ticket.wait().expect("completion").status(), TxnStatus::Ok);
    }
    assert_eq!(link.transport.pool().stats().live_txns, 0);
}
