//! `events` subcommand: follow device notifications, reconnecting on loss.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::time::Duration;

use fcp_lib::session::SessionState;

use super::{
    Backoff, EventOutput, FcpError, FcpSession, RUNNING, Result, Transport, load_config,
    open_ready, reconnect,
};

/// How long one read blocks before checking Ctrl+C.
const POLL: Duration = Duration::from_millis(250);

fn format_event(bits: u32) -> String {
    format!("event {bits:#010x}")
}

fn print_event(bits: u32, json: bool) -> Result<()> {
    if json {
        let output = EventOutput {
            bits,
            hex: format!("{bits:#010x}"),
        };
        let line = serde_json::to_string(&output)
            .map_err(|e| FcpError::Config(format!("JSON output: {e}")))?;
        println!("{line}");
    } else {
        println!("  {}", format_event(bits));
    }
    Ok(())
}

/// Print events until `limit` reads, Ctrl+C, cancellation, or the
/// notification endpoint going away. Returns the number printed.
pub(super) fn follow<T: Transport>(
    session: &FcpSession<T>,
    limit: Option<usize>,
    json: bool,
) -> Result<usize> {
    let mut seen = 0;
    while RUNNING.load(Ordering::SeqCst) && limit.is_none_or(|n| seen < n) {
        match session.read_event_timeout(POLL) {
            Ok(Some(bits)) => {
                seen += 1;
                print_event(bits, json)?;
            }
            Ok(None) if session.state() != SessionState::Ready => break,
            Ok(None) => {}
            Err(FcpError::Cancelled) => break,
            Err(e) => return Err(e),
        }
    }
    Ok(seen)
}

pub(super) fn cmd_events(count: Option<usize>, json: bool, config_path: Option<&Path>) -> Result<()> {
    let config = load_config(config_path);
    let mut session = open_ready(&config)?;
    if !json {
        println!("Listening for device events (Ctrl+C to stop)...");
    }

    let mut remaining = count;
    let mut backoff = Backoff::default();
    loop {
        let seen = follow(&session, remaining, json)?;
        remaining = remaining.map(|n| n.saturating_sub(seen));
        if !RUNNING.load(Ordering::SeqCst) || remaining == Some(0) {
            return Ok(());
        }
        if session.state() == SessionState::Ready {
            // Cancelled from elsewhere; nothing left to follow.
            return Ok(());
        }

        println!("[device] notifications stopped, reconnecting...");
        // Release the claimed interface before re-opening it
        drop(session);
        session = loop {
            if !RUNNING.load(Ordering::SeqCst) {
                return Ok(());
            }
            if let Some(s) = reconnect::try_reattach(&mut backoff, &config) {
                println!("[device] reconnected");
                break s;
            }
            std::thread::sleep(POLL);
        };
    }
}
