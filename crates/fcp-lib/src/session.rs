//! Per-device session: the command surface over one attached interface.
//!
//! A session owns the transaction engine, the meter state and the
//! notification pump of a single device. Control-plane operations take the
//! device lock for their whole duration, so a command's TX/RX pair is never
//! interleaved with another caller's. The event side-channel is lock-free
//! with respect to the device lock and can be read from any thread.
//!
//! Lifecycle: [`SessionState::Attached`] after construction,
//! [`SessionState::Ready`] once [`FcpSession::init`] has started the
//! notification pump, [`SessionState::Detached`] after
//! [`FcpSession::detach`] (also run on drop).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::config::Config;
use crate::error::{FcpError, Result};
use crate::events::EventQueue;
use crate::meter::{ControlRegistry, LocalRegistry, MeterInfo, MeterState};
use crate::notify::{Completion, Notifier, NotifyPump};
use crate::protocol::{MAX_COMMAND_SIZE, MAX_STEP0_SIZE, VERSION};
use crate::transaction::{RetryPolicy, TransactionEngine};
use crate::transport::Transport;

/// Where the control interface lives on the device. Fixed at attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Addressing {
    pub interface_number: u8,
    pub endpoint_address: u8,
    pub max_packet_size: usize,
    pub interval: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Attached,
    Ready,
    Detached,
}

/// Control-plane request, for callers that dispatch on a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Version,
    Init {
        size: usize,
    },
    Command {
        opcode: u32,
        request: Vec<u8>,
        response_size: usize,
    },
    SetMeterMap {
        map: Vec<i16>,
        slots: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version(u32),
    Init(Vec<u8>),
    Command(Vec<u8>),
    MeterMapSet,
}

struct Inner<T, R> {
    engine: TransactionEngine<T>,
    meter: MeterState,
    registry: R,
}

pub struct FcpSession<T: Transport, R: ControlRegistry = LocalRegistry> {
    inner: Mutex<Inner<T, R>>,
    pump: Mutex<Option<NotifyPump>>,
    completion: Arc<Completion>,
    events: Arc<EventQueue>,
    addressing: Addressing,
    initialised: AtomicBool,
    detached: AtomicBool,
}

impl<T: Transport, R: ControlRegistry> FcpSession<T, R> {
    pub fn new(transport: T, registry: R, addressing: Addressing, policy: RetryPolicy) -> Self {
        let completion = Arc::new(Completion::new());
        let events = Arc::new(EventQueue::new());
        events.clear();
        FcpSession {
            inner: Mutex::new(Inner {
                engine: TransactionEngine::new(transport, Arc::clone(&completion), policy),
                meter: MeterState::new(),
                registry,
            }),
            pump: Mutex::new(None),
            completion,
            events,
            addressing,
            initialised: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    pub fn addressing(&self) -> Addressing {
        self.addressing
    }

    pub fn state(&self) -> SessionState {
        if self.detached.load(Ordering::SeqCst) {
            SessionState::Detached
        } else if self.pump_running() {
            SessionState::Ready
        } else {
            SessionState::Attached
        }
    }

    /// Protocol version implemented by this library, packed `major.minor.subminor`.
    pub fn version(&self) -> u32 {
        let _inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        VERSION
    }

    /// Run step 0 and bring up notifications. Returns the step-0 reply.
    ///
    /// Safe to repeat: the pump is only started if it is not running, and
    /// the sequence counter restarts at 0 either way.
    pub fn init(&self, size: usize) -> Result<Vec<u8>> {
        if size > MAX_STEP0_SIZE {
            return Err(FcpError::InvalidArgument(format!(
                "step 0 size {size} exceeds {MAX_STEP0_SIZE}"
            )));
        }
        let mut inner = self.lock()?;

        let reply = inner
            .engine
            .transport()
            .step0(size)
            .map_err(|e| FcpError::transfer("FCP step 0", &e))?;

        inner.engine.reset_seq();
        self.start_notifications(inner.engine.transport())?;
        self.initialised.store(true, Ordering::SeqCst);
        log::info!(
            "FCP initialised on interface {} ({size}-byte step 0 reply)",
            self.addressing.interface_number
        );
        Ok(reply)
    }

    /// Init, then apply the meter section of `config` (map and labels).
    pub fn start(&self, config: &Config) -> Result<Vec<u8>> {
        let reply = self.init(config.step0_size)?;
        if !config.meter.map.is_empty() {
            self.set_meter_map(&config.meter.map, config.meter.slots)?;
        }
        if let Some(labels) = config.meter_labels()? {
            self.set_meter_labels(&labels)?;
        }
        Ok(reply)
    }

    /// Execute one opaque FCP command.
    pub fn command(&self, opcode: u32, request: &[u8], response_size: usize) -> Result<Vec<u8>> {
        if request.len() > MAX_COMMAND_SIZE || response_size > MAX_COMMAND_SIZE {
            return Err(FcpError::InvalidArgument(format!(
                "command sizes {}/{response_size} exceed {MAX_COMMAND_SIZE}",
                request.len()
            )));
        }
        let mut inner = self.lock()?;
        self.require_ready()?;
        inner.engine.execute(opcode, request, response_size)
    }

    /// Install a meter map (does not touch the device).
    pub fn set_meter_map(&self, map: &[i16], slots: u16) -> Result<()> {
        let mut inner = self.lock()?;
        let Inner {
            meter, registry, ..
        } = &mut *inner;
        meter.install_map(registry, map, slots)
    }

    /// Current meter levels, one per mapped channel.
    pub fn read_meter(&self) -> Result<Vec<u32>> {
        let mut inner = self.lock()?;
        self.require_ready()?;
        let Inner { engine, meter, .. } = &mut *inner;
        meter.read(engine)
    }

    pub fn meter_labels(&self, capacity: usize) -> Result<Vec<u8>> {
        let inner = self.lock()?;
        Ok(inner.meter.labels(capacity).to_vec())
    }

    pub fn set_meter_labels(&self, blob: &[u8]) -> Result<()> {
        self.lock()?.meter.set_labels(blob)
    }

    pub fn meter_info(&self) -> Result<MeterInfo> {
        Ok(self.lock()?.meter.info())
    }

    /// Run `f` against the control registry.
    pub fn with_registry<U>(&self, f: impl FnOnce(&R) -> U) -> U {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&inner.registry)
    }

    // ── Event side-channel ──

    /// Block until device events are pending and return them.
    pub fn read_event(&self) -> Result<u32> {
        self.events.read()
    }

    pub fn read_event_timeout(&self, timeout: Duration) -> Result<Option<u32>> {
        self.events.read_timeout(timeout)
    }

    pub fn poll_event(&self) -> bool {
        self.events.poll()
    }

    /// The event queue, e.g. to cancel a blocked read from another thread.
    pub fn events(&self) -> Arc<EventQueue> {
        Arc::clone(&self.events)
    }

    /// Dispatch a tagged control-plane request.
    pub fn handle(&self, request: Request) -> Result<Response> {
        match request {
            Request::Version => Ok(Response::Version(self.version())),
            Request::Init { size } => self.init(size).map(Response::Init),
            Request::Command {
                opcode,
                request,
                response_size,
            } => self
                .command(opcode, &request, response_size)
                .map(Response::Command),
            Request::SetMeterMap { map, slots } => {
                self.set_meter_map(&map, slots).map(|()| Response::MeterMapSet)
            }
        }
    }

    /// Tear the session down: release any waiting transaction, fail event
    /// reads, stop the pump and unregister the meter control.
    pub fn detach(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!(
            "FCP detaching interface {}",
            self.addressing.interface_number
        );
        self.completion.complete();
        self.events.close();

        let pump = self.pump_guard().take();
        if let Some(mut pump) = pump {
            pump.shutdown();
        }

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let Inner {
            meter, registry, ..
        } = &mut *inner;
        meter.release(registry);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner<T, R>>> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if self.detached.load(Ordering::SeqCst) {
            return Err(FcpError::Transport("device detached".into()));
        }
        Ok(guard)
    }

    fn pump_guard(&self) -> MutexGuard<'_, Option<NotifyPump>> {
        self.pump.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn pump_running(&self) -> bool {
        self.pump_guard().as_ref().is_some_and(|p| !p.is_finished())
    }

    fn require_ready(&self) -> Result<()> {
        if self.pump_running() {
            Ok(())
        } else if self.initialised.load(Ordering::SeqCst) {
            Err(FcpError::Transport(
                "notifications stopped: endpoint gone".into(),
            ))
        } else {
            Err(FcpError::InvalidArgument(
                "notifications not running; run init first".into(),
            ))
        }
    }

    fn start_notifications(&self, transport: &T) -> Result<()> {
        let mut pump = self.pump_guard();
        if pump.as_ref().is_some_and(|p| !p.is_finished()) {
            return Ok(());
        }
        self.completion.reinit();
        let source = transport
            .open_notifications()
            .map_err(|e| FcpError::transfer("FCP notifications", &e))?;
        let notifier = Notifier::new(Arc::clone(&self.completion), Arc::clone(&self.events));
        *pump = Some(NotifyPump::start(
            source,
            notifier,
            self.addressing.max_packet_size,
        )?);
        log::debug!(
            "notifications started on endpoint {:#04x}",
            self.addressing.endpoint_address
        );
        Ok(())
    }
}

impl<T: Transport, R: ControlRegistry> Drop for FcpSession<T, R> {
    fn drop(&mut self) {
        self.detach();
    }
}
