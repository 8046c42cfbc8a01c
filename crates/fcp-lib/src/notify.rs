//! Notification receiver: splits device interrupts into command ACKs and events.
//!
//! The device raises an 8-byte interrupt whenever something happens. Bit 0
//! of the first word acknowledges the last command and releases the
//! transaction waiting on [`Completion`]; every other bit is queued on the
//! [`EventQueue`] for the event reader.
//!
//! [`Notifier::deliver`] is the per-delivery handler and does no I/O.
//! [`NotifyPump`] is the thread that keeps the interrupt transfer queued and
//! feeds each delivery to the handler until the endpoint goes away or the
//! session detaches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::events::EventQueue;
use crate::protocol::{NOTIFY_ACK, NOTIFY_PAYLOAD_SIZE};
use crate::transport::{NotifySource, TransferError};

/// Counting completion signal shared between the pump and the transaction engine.
///
/// Each [`complete`](Self::complete) satisfies exactly one
/// [`wait_timeout`](Self::wait_timeout).
#[derive(Debug, Default)]
pub struct Completion {
    done: Mutex<u32>,
    cvar: Condvar,
}

impl Completion {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn complete(&self) {
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        *done = done.saturating_add(1);
        self.cvar.notify_one();
    }

    /// Wait for one completion. Returns `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while *done == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            done = match self.cvar.wait_timeout(done, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
        *done -= 1;
        true
    }

    /// Drop any completions nobody waited for.
    pub fn reinit(&self) {
        *self.done.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }

    /// Completions posted but not yet consumed.
    pub fn pending(&self) -> u32 {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// What the pump does after a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Resubmit,
    /// The endpoint is gone; stop listening.
    Stop,
}

/// Per-delivery handler: routes ACKs to the completion and the rest to the event queue.
#[derive(Debug, Clone)]
pub struct Notifier {
    completion: Arc<Completion>,
    events: Arc<EventQueue>,
}

impl Notifier {
    pub fn new(completion: Arc<Completion>, events: Arc<EventQueue>) -> Self {
        Notifier { completion, events }
    }

    /// Handle one completed interrupt transfer.
    ///
    /// `status` is the transfer result (bytes received on success); `buf`
    /// holds the received data.
    pub fn deliver(&self, status: std::result::Result<usize, TransferError>, buf: &[u8]) -> Requeue {
        let len = match status {
            Ok(len) => len,
            Err(e) if e.is_gone() => {
                log::debug!("notify: endpoint gone ({e}), stopping");
                self.completion.complete();
                return Requeue::Stop;
            }
            Err(e) => {
                log::warn!("notify: ignoring failed delivery: {e}");
                return Requeue::Resubmit;
            }
        };
        if len != NOTIFY_PAYLOAD_SIZE || buf.len() < 4 {
            log::warn!("notify: ignoring {len}-byte delivery");
            return Requeue::Resubmit;
        }

        let mut data = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);

        if data & NOTIFY_ACK != 0 {
            self.completion.complete();
            data &= !NOTIFY_ACK;
        }

        if data != 0 {
            self.events.push(data);
        }

        Requeue::Resubmit
    }
}

/// How long the pump waits per slice before re-checking for shutdown.
const PUMP_SLICE: Duration = Duration::from_millis(50);

/// Background thread that keeps the interrupt transfer queued.
pub struct NotifyPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NotifyPump {
    /// Spawn the pump. `packet_size` is the endpoint's max packet size.
    pub fn start(
        mut source: Box<dyn NotifySource>,
        notifier: Notifier,
        packet_size: usize,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("fcp-notify".into())
            .spawn(move || {
                let mut buf = vec![0u8; packet_size.max(NOTIFY_PAYLOAD_SIZE)];
                while !thread_stop.load(Ordering::SeqCst) {
                    let Some(status) = source.wait(&mut buf, PUMP_SLICE) else {
                        continue;
                    };
                    match notifier.deliver(status, &buf) {
                        Requeue::Resubmit => {
                            if let Err(e) = source.resubmit() {
                                log::warn!("notify: resubmit failed: {e}");
                            }
                        }
                        Requeue::Stop => break,
                    }
                }
                source.cancel();
                log::debug!("notify: pump stopped");
            })?;
        Ok(NotifyPump {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the pump thread has exited on its own (endpoint gone).
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().is_none_or(|h| h.is_finished())
    }

    /// Cancel the interrupt transfer and join the thread.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            log::warn!("notify: pump thread panicked");
        }
    }
}

impl Drop for NotifyPump {
    fn drop(&mut self) {
        self.shutdown();
    }
}
