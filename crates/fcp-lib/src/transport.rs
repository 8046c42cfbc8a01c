//! Transport boundary: the USB operations the engine needs, as traits.
//!
//! A [`Transport`] moves whole packets over the two vendor control requests
//! (TX, RX), performs step 0, and hands out the interrupt channel as a
//! [`NotifySource`]. The Linux backend lives in [`crate::usb`]; tests use
//! the scripted [`mock::MockTransport`].

use std::fmt;
use std::time::Duration;

/// Why a single USB transfer failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Bus busy / protocol error (`-EPROTO`). The only retryable condition.
    Busy,
    /// Device or endpoint gone (`-ESHUTDOWN`, `-ENODEV`).
    Disconnected,
    /// Transfer cancelled or unlinked (`-ENOENT`, `-ECONNRESET`).
    Cancelled,
    /// Endpoint stalled (`-EPIPE`).
    Stall,
    Other(String),
}

impl TransferError {
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Busy)
    }

    /// The endpoint will not deliver anything again.
    pub fn is_gone(&self) -> bool {
        matches!(self, TransferError::Disconnected | TransferError::Cancelled)
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::Busy => write!(f, "bus busy"),
            TransferError::Disconnected => write!(f, "device disconnected"),
            TransferError::Cancelled => write!(f, "transfer cancelled"),
            TransferError::Stall => write!(f, "endpoint stalled"),
            TransferError::Other(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for TransferError {}

/// Device-facing transfers used by a session.
pub trait Transport: Send {
    /// Step 0: vendor control-in of `len` bytes, issued before any packet.
    fn step0(&self, len: usize) -> Result<Vec<u8>, TransferError>;

    /// TX: send one encoded request packet. Returns bytes accepted.
    fn send(&self, packet: &[u8]) -> Result<usize, TransferError>;

    /// RX: fetch one response packet of up to `len` bytes.
    fn receive(&self, len: usize) -> Result<Vec<u8>, TransferError>;

    /// Open the interrupt endpoint that carries notifications.
    fn open_notifications(&self) -> Result<Box<dyn NotifySource>, TransferError>;
}

/// The interrupt channel, owned by the notification pump thread.
pub trait NotifySource: Send {
    /// Wait up to `timeout` for the next delivery and copy it into `buf`.
    ///
    /// `None` means nothing completed in time. `Some(Err(_))` carries the
    /// transfer status of a completed-but-failed delivery.
    fn wait(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Option<Result<usize, TransferError>>;

    /// Queue the receive for the next delivery.
    fn resubmit(&mut self) -> Result<(), TransferError>;

    /// Cancel anything outstanding and release transfer buffers.
    fn cancel(&mut self);
}

// ── Mock transport for testing ──

/// Scripted in-memory transport for unit and integration tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
    use std::sync::{Arc, Mutex, MutexGuard};

    use crate::notify::Completion;
    use crate::packet::{self, PacketHeader};
    use crate::protocol::{HEADER_SIZE, NOTIFY_ACK, NOTIFY_PAYLOAD_SIZE};

    /// What the next RX returns.
    #[derive(Debug, Clone)]
    pub enum Reply {
        /// Valid response to the last request, carrying this payload.
        Echo(Vec<u8>),
        /// These exact bytes.
        Raw(Vec<u8>),
        Fail(TransferError),
    }

    /// Transfer phase log entry, tagged with the sequence number involved.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Phase {
        Tx(u16),
        Rx(u16),
    }

    type Delivery = Result<Vec<u8>, TransferError>;

    #[derive(Default)]
    pub struct MockBus {
        /// Every TX attempt, including failed ones.
        pub sends: Vec<Vec<u8>>,
        /// Consumed one per TX attempt; `Ok(n)` reports `n` bytes sent.
        /// Empty means "accept the whole packet".
        pub send_script: VecDeque<Result<usize, TransferError>>,
        /// Consumed one per RX. Empty means an all-zero valid response.
        pub replies: VecDeque<Reply>,
        pub step0_reply: Vec<u8>,
        pub step0_error: Option<TransferError>,
        /// ACK every accepted request through the notification channel.
        pub auto_ack: bool,
        /// Completion to signal directly on ACK, for engine-only tests.
        pub ack_completion: Option<Arc<Completion>>,
        /// Sleep at the start of every RX.
        pub rx_delay: Duration,
        pub phases: Vec<Phase>,
        pub notify_tx: Option<Sender<Delivery>>,
        pub notify_open_error: Option<TransferError>,
        pub notifications_opened: usize,
        pub notifications_cancelled: usize,
    }

    #[derive(Clone, Default)]
    pub struct MockTransport {
        pub bus: Arc<Mutex<MockBus>>,
    }

    impl MockTransport {
        /// A transport that answers and ACKs every request.
        pub fn new() -> Self {
            let t = MockTransport::default();
            t.bus().auto_ack = true;
            t
        }

        pub fn bus(&self) -> MutexGuard<'_, MockBus> {
            self.bus.lock().unwrap_or_else(|e| e.into_inner())
        }

        pub fn push_reply(&self, reply: Reply) {
            self.bus().replies.push_back(reply);
        }

        /// Fail the next `count` TX attempts with `err`.
        pub fn fail_sends(&self, err: TransferError, count: usize) {
            let mut bus = self.bus();
            for _ in 0..count {
                bus.send_script.push_back(Err(err.clone()));
            }
        }

        /// Deliver a notification with `bits` in the first word.
        pub fn notify(&self, bits: u32) {
            let mut data = vec![0u8; NOTIFY_PAYLOAD_SIZE];
            data[..4].copy_from_slice(&bits.to_le_bytes());
            self.deliver(Ok(data));
        }

        /// Deliver a failed interrupt transfer.
        pub fn notify_status(&self, err: TransferError) {
            self.deliver(Err(err));
        }

        pub fn deliver(&self, delivery: Delivery) {
            if let Some(tx) = &self.bus().notify_tx {
                let _ = tx.send(delivery);
            }
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.bus().sends.clone()
        }

        /// Sequence numbers of every TX attempt, in order.
        pub fn sent_seqs(&self) -> Vec<u16> {
            self.bus()
                .sends
                .iter()
                .filter_map(|p| PacketHeader::decode(p).map(|h| h.seq))
                .collect()
        }

        pub fn phases(&self) -> Vec<Phase> {
            self.bus().phases.clone()
        }

        fn last_header(bus: &MockBus) -> PacketHeader {
            bus.sends
                .last()
                .and_then(|p| PacketHeader::decode(p))
                .unwrap_or_default()
        }
    }

    impl Transport for MockTransport {
        fn step0(&self, len: usize) -> Result<Vec<u8>, TransferError> {
            let bus = self.bus();
            if let Some(e) = &bus.step0_error {
                return Err(e.clone());
            }
            let mut data = bus.step0_reply.clone();
            data.resize(len, 0);
            Ok(data)
        }

        fn send(&self, pkt: &[u8]) -> Result<usize, TransferError> {
            let mut bus = self.bus();
            bus.sends.push(pkt.to_vec());
            let result = bus.send_script.pop_front().unwrap_or(Ok(pkt.len()));
            if result == Ok(pkt.len()) {
                if let Some(h) = PacketHeader::decode(pkt) {
                    bus.phases.push(Phase::Tx(h.seq));
                }
                if bus.auto_ack {
                    if let Some(c) = &bus.ack_completion {
                        c.complete();
                    }
                    if let Some(tx) = &bus.notify_tx {
                        let mut data = vec![0u8; NOTIFY_PAYLOAD_SIZE];
                        data[..4].copy_from_slice(&NOTIFY_ACK.to_le_bytes());
                        let _ = tx.send(Ok(data));
                    }
                }
            }
            result
        }

        fn receive(&self, len: usize) -> Result<Vec<u8>, TransferError> {
            let delay = {
                let mut bus = self.bus();
                let seq = Self::last_header(&bus).seq;
                bus.phases.push(Phase::Rx(seq));
                bus.rx_delay
            };
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
            let mut bus = self.bus();
            let last = Self::last_header(&bus);
            let reply = bus
                .replies
                .pop_front()
                .unwrap_or_else(|| Reply::Echo(vec![0; len.saturating_sub(HEADER_SIZE)]));
            match reply {
                Reply::Echo(payload) => Ok(packet::build_request(last.opcode, last.seq, &payload)),
                Reply::Raw(bytes) => Ok(bytes),
                Reply::Fail(e) => Err(e),
            }
        }

        fn open_notifications(&self) -> Result<Box<dyn NotifySource>, TransferError> {
            let (tx, rx) = mpsc::channel();
            let mut bus = self.bus();
            if let Some(e) = bus.notify_open_error.clone() {
                return Err(e);
            }
            bus.notify_tx = Some(tx);
            bus.notifications_opened += 1;
            Ok(Box::new(MockNotifySource {
                rx,
                bus: Arc::clone(&self.bus),
            }))
        }
    }

    pub struct MockNotifySource {
        rx: Receiver<Delivery>,
        bus: Arc<Mutex<MockBus>>,
    }

    impl NotifySource for MockNotifySource {
        fn wait(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Option<Result<usize, TransferError>> {
            match self.rx.recv_timeout(timeout) {
                Ok(Ok(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Some(Ok(data.len()))
                }
                Ok(Err(e)) => Some(Err(e)),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => {
                    std::thread::sleep(timeout);
                    None
                }
            }
        }

        fn resubmit(&mut self) -> Result<(), TransferError> {
            Ok(())
        }

        fn cancel(&mut self) {
            let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
            bus.notifications_cancelled += 1;
            bus.notify_tx = None;
        }
    }
}
