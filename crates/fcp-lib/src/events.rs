//! Event channel: coalesced device event bits for a single reader.
//!
//! Bits OR-accumulate until one read drains them all. Readers block until
//! something is pending, a cancellation arrives, or the device detaches.

use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{FcpError, Result};

#[derive(Debug, Default)]
struct EventState {
    pending: u32,
    cancelled: bool,
    closed: bool,
}

/// Pending event bitmask plus the condition readers wait on.
#[derive(Debug, Default)]
pub struct EventQueue {
    state: Mutex<EventState>,
    cvar: Condvar,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// OR `bits` into the pending mask and wake the reader.
    pub fn push(&self, bits: u32) {
        if bits == 0 {
            return;
        }
        self.lock().pending |= bits;
        self.cvar.notify_all();
    }

    /// Readiness check: true iff bits are pending.
    pub fn poll(&self) -> bool {
        self.lock().pending != 0
    }

    /// Take the pending bits without blocking.
    pub fn try_take(&self) -> Option<u32> {
        let mut state = self.lock();
        match std::mem::take(&mut state.pending) {
            0 => None,
            bits => Some(bits),
        }
    }

    /// Block until bits are pending, then read and clear them.
    pub fn read(&self) -> Result<u32> {
        let mut state = self.lock();
        loop {
            if let Some(bits) = Self::take_ready(&mut state)? {
                return Ok(bits);
            }
            state = match self.cvar.wait(state) {
                Ok(guard) => guard,
                Err(e) => e.into_inner(),
            };
        }
    }

    /// Like [`read`](Self::read) but gives up after `timeout` with `Ok(None)`.
    pub fn read_timeout(&self, timeout: Duration) -> Result<Option<u32>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let Some(bits) = Self::take_ready(&mut state)? {
                return Ok(Some(bits));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = match self.cvar.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Pending bits win over a cancellation; a cancellation is consumed by
    /// the read it interrupts.
    fn take_ready(state: &mut EventState) -> Result<Option<u32>> {
        if state.pending != 0 {
            return Ok(Some(std::mem::take(&mut state.pending)));
        }
        if state.cancelled {
            state.cancelled = false;
            return Err(FcpError::Cancelled);
        }
        if state.closed {
            return Err(FcpError::Transport("event channel: device detached".into()));
        }
        Ok(None)
    }

    /// Interrupt a blocked (or the next) read with [`FcpError::Cancelled`].
    pub fn cancel(&self) {
        self.lock().cancelled = true;
        self.cvar.notify_all();
    }

    /// Device detached: wake readers and fail reads once drained.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cvar.notify_all();
    }

    /// Forget pending bits and any cancellation (fresh attach).
    pub fn clear(&self) {
        let mut state = self.lock();
        state.pending = 0;
        state.cancelled = false;
        state.closed = false;
    }
}
