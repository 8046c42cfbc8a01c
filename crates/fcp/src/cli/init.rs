//! `init` subcommand: step 0 plus optional INIT_1 handshake.

use std::path::Path;

use fcp_lib::protocol::OPCODE_INIT_1;

use super::{
    FcpSession, InitOutput, Result, Transport, hex_dump, hex_string, load_config, print_json, usb,
};

/// Run step 0 of `size` bytes, then INIT_1 if asked. Returns the step 0 reply.
pub(super) fn run_init<T: Transport>(
    session: &FcpSession<T>,
    size: usize,
    handshake: bool,
) -> Result<Vec<u8>> {
    let reply = session.init(size)?;
    if handshake {
        session.command(OPCODE_INIT_1, &[], 0)?;
        log::debug!("INIT_1 acknowledged");
    }
    Ok(reply)
}

pub(super) fn cmd_init(
    size: Option<usize>,
    handshake: bool,
    json: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    let config = load_config(config_path);
    let size = size.unwrap_or(config.step0_size);
    let session = usb::open_session(&config.device_serial, &config)?;
    let reply = run_init(&session, size, handshake)?;

    if json {
        return print_json(&InitOutput {
            step0: hex_string(&reply),
            size: reply.len(),
            handshake,
        });
    }

    println!("Step 0 reply ({} bytes):", reply.len());
    for line in hex_dump(&reply) {
        println!("{line}");
    }
    if handshake {
        println!("Handshake: INIT_1 acknowledged");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::test_support::mock_session as session;
    use fcp_lib::packet::PacketHeader;
    use fcp_lib::session::SessionState;

    #[test]
    fn init_without_handshake_sends_nothing() {
        let (s, t) = session();
        t.bus().step0_reply = vec![0xAA, 0xBB];
        let reply = run_init(&s, 4, false).unwrap();
        assert_eq!(reply, vec![0xAA, 0xBB, 0, 0]);
        assert!(t.sent().is_empty());
        assert_eq!(s.state(), SessionState::Ready);
    }

    #[test]
    fn handshake_sends_init_1_with_seq_0() {
        let (s, t) = session();
        run_init(&s, 24, true).unwrap();
        let sent = t.sent();
        assert_eq!(sent.len(), 1);
        let h = PacketHeader::decode(&sent[0]).unwrap();
        assert_eq!(h.opcode, OPCODE_INIT_1);
        assert_eq!(h.seq, 0);
        assert_eq!(h.size, 0);
    }

    #[test]
    fn oversized_step0_is_rejected() {
        let (s, _) = session();
        assert!(run_init(&s, 256, false).is_err());
        assert_eq!(s.state(), SessionState::Attached);
    }
}
