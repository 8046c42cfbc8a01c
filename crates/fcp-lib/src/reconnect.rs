//! Re-attach with exponential backoff after the device goes away.
//!
//! Long-running loops (meter watch, event follow) hold one session. When
//! it fails with a fatal transport error the loop drops it and calls
//! [`try_reattach`] on every tick; attempts are spaced out by [`Backoff`].

use std::time::{Duration, Instant};

use crate::config::Config;
use crate::error::{ErrorKind, FcpError, Result};
use crate::usb::{self, UsbSession};

/// Exponential backoff: 1 s, 2 s, 4 s, ... capped at 30 s.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    delay: Duration,
    failures: u32,
    not_before: Option<Instant>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30))
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Backoff {
            initial,
            max,
            delay: initial,
            failures: 0,
            not_before: None,
        }
    }

    /// Whether the next attempt is due.
    pub fn ready(&self) -> bool {
        self.not_before.is_none_or(|t| Instant::now() >= t)
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        self.not_before = Some(Instant::now() + self.delay);
        self.delay = (self.delay * 2).min(self.max);
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.delay = self.initial;
        self.not_before = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Wait that will follow the next failure.
    pub fn next_delay(&self) -> Duration {
        self.delay
    }
}

/// Whether an error means the session is gone and must be re-opened.
pub fn is_disconnect(e: &FcpError) -> bool {
    matches!(e.kind(), ErrorKind::TransportFatal | ErrorKind::Setup)
}

/// Run `open` if the backoff allows it, recording the outcome.
pub fn attempt<S>(backoff: &mut Backoff, open: impl FnOnce() -> Result<S>) -> Option<S> {
    if !backoff.ready() {
        return None;
    }
    match open() {
        Ok(s) => {
            if backoff.failures() > 0 {
                log::info!("reconnected after {} attempts", backoff.failures() + 1);
            }
            backoff.record_success();
            Some(s)
        }
        Err(e) => {
            let wait = backoff.next_delay();
            backoff.record_failure();
            log::warn!(
                "reconnect failed: {e} (attempt {}, retry in {:.1}s)",
                backoff.failures(),
                wait.as_secs_f64()
            );
            None
        }
    }
}

/// Open the configured device and bring it to `Ready`, respecting backoff.
pub fn try_reattach(backoff: &mut Backoff, config: &Config) -> Option<UsbSession> {
    attempt(backoff, || {
        let session = usb::open_session(&config.device_serial, config)?;
        session.start(config)?;
        Ok(session)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_backoff_is_ready() {
        let b = Backoff::default();
        assert!(b.ready());
        assert_eq!(b.failures(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn delay_doubles_and_caps() {
        let mut b = Backoff::default();
        let mut seen = Vec::new();
        for _ in 0..7 {
            seen.push(b.next_delay().as_secs());
            b.record_failure();
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(b.failures(), 7);
    }

    #[test]
    fn failure_blocks_until_delay_elapses() {
        let mut b = Backoff::new(Duration::from_millis(30), Duration::from_secs(1));
        b.record_failure();
        assert!(!b.ready());
        std::thread::sleep(Duration::from_millis(40));
        assert!(b.ready());
    }

    #[test]
    fn success_resets() {
        let mut b = Backoff::default();
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert!(b.ready());
        assert_eq!(b.failures(), 0);
        assert_eq!(b.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn attempt_skips_while_backing_off() {
        let mut b = Backoff::new(Duration::from_secs(60), Duration::from_secs(60));
        let got: Option<()> = attempt(&mut b, || Err(FcpError::NotFound));
        assert!(got.is_none());
        assert_eq!(b.failures(), 1);

        let mut called = false;
        let got = attempt(&mut b, || {
            called = true;
            Ok(())
        });
        assert!(got.is_none());
        assert!(!called);
    }

    #[test]
    fn attempt_success_returns_value() {
        let mut b = Backoff::new(Duration::ZERO, Duration::ZERO);
        let _: Option<()> = attempt(&mut b, || Err(FcpError::NotFound));
        assert_eq!(attempt(&mut b, || Ok(7)), Some(7));
        assert_eq!(b.failures(), 0);
    }

    #[test]
    fn disconnect_classification() {
        assert!(is_disconnect(&FcpError::Transport("gone".into())));
        assert!(is_disconnect(&FcpError::NotFound));
        assert!(!is_disconnect(&FcpError::Timeout("ack".into())));
        assert!(!is_disconnect(&FcpError::InvalidArgument("x".into())));
    }
}
