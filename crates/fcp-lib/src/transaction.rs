//! Transaction engine: one FCP command/response exchange per call.
//!
//! Each call sends the request with TX, waits for the device's ACK on the
//! notification channel, then fetches the response with RX and checks that
//! it belongs to the request. Callers serialise calls (the session holds
//! its device lock across `execute`), which is what keeps sequence numbers
//! strictly increasing per device.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{FcpError, ResponseMismatch, Result};
use crate::notify::Completion;
use crate::packet::{self, PacketHeader};
use crate::protocol::{
    COMPLETION_TIMEOUT, HEADER_SIZE, OPCODE_REBOOT, SEND_MAX_RETRIES, SEND_RETRY_BASE,
};
use crate::transport::{TransferError, Transport};

/// Send retry and completion timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first send attempt, busy bus only.
    pub max_retries: u32,
    /// Delay before the first retry; doubles each time.
    pub base_delay: Duration,
    /// How long to wait for the ACK after a successful send.
    pub completion_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: SEND_MAX_RETRIES,
            base_delay: SEND_RETRY_BASE,
            completion_timeout: COMPLETION_TIMEOUT,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): base, 2×base, 4×base, ...
    pub fn backoff(&self, retry: u32) -> Duration {
        self.base_delay
            .checked_mul(1u32 << retry.saturating_sub(1).min(16))
            .unwrap_or(Duration::MAX)
    }
}

/// Sequence counter, transport and completion for one device.
pub struct TransactionEngine<T> {
    transport: T,
    completion: Arc<Completion>,
    seq: u16,
    policy: RetryPolicy,
}

impl<T: Transport> TransactionEngine<T> {
    pub fn new(transport: T, completion: Arc<Completion>, policy: RetryPolicy) -> Self {
        TransactionEngine {
            transport,
            completion,
            seq: 0,
            policy,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Sequence number the next request will carry.
    pub fn next_seq(&self) -> u16 {
        self.seq
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    /// Run one command and return exactly `resp_size` payload bytes.
    pub fn execute(&mut self, opcode: u32, req: &[u8], resp_size: usize) -> Result<Vec<u8>> {
        let req_size = u16::try_from(req.len()).map_err(|_| {
            FcpError::InvalidArgument(format!("request size {} exceeds {}", req.len(), u16::MAX))
        })?;
        let expected_size = u16::try_from(resp_size).map_err(|_| {
            FcpError::InvalidArgument(format!("response size {resp_size} exceeds {}", u16::MAX))
        })?;

        // Sequence must go up by 1 for each request, whatever the outcome
        let seq = self.seq;
        self.seq = self.seq.wrapping_add(1);

        let mut pkt = Vec::new();
        pkt.try_reserve_exact(HEADER_SIZE + req.len())?;
        PacketHeader::request(opcode, seq, req_size).encode(&mut pkt);
        pkt.extend_from_slice(req);

        self.send_with_retry(opcode, &pkt)?;

        if !self.completion.wait_timeout(self.policy.completion_timeout) {
            log::error!("FCP request {opcode:08x} timed out");
            return Err(FcpError::Timeout(format!(
                "FCP request {opcode:08x}: no ACK within {}ms",
                self.policy.completion_timeout.as_millis()
            )));
        }

        let rx_size = HEADER_SIZE + resp_size;
        let resp = match self.transport.receive(rx_size) {
            Ok(resp) => resp,
            // The device may drop off the bus mid-reboot
            Err(TransferError::Disconnected | TransferError::Busy) if opcode == OPCODE_REBOOT => {
                log::debug!("FCP reboot {opcode:08x}: device went away, treating as done");
                return Ok(Vec::new());
            }
            Err(e) => {
                log::error!("FCP response {opcode:08x} failed: {e} (expected {rx_size})");
                return Err(FcpError::transfer(format!("FCP response {opcode:08x}"), &e));
            }
        };

        if resp.len() != rx_size {
            log::error!(
                "FCP response {opcode:08x} failed: got {} bytes (expected {rx_size})",
                resp.len()
            );
            return Err(FcpError::Transport(format!(
                "FCP response {opcode:08x}: got {} bytes, expected {rx_size}",
                resp.len()
            )));
        }

        let Some((hdr, payload)) = packet::split_response(&resp) else {
            return Err(FcpError::Transport(format!(
                "FCP response {opcode:08x}: truncated header"
            )));
        };

        // Initialisation quirk: request seq 1 may be answered with seq 0
        let seq_ok = hdr.seq == seq || (seq == 1 && hdr.seq == 0);
        if hdr.opcode != opcode
            || !seq_ok
            || hdr.size != expected_size
            || hdr.error != 0
            || hdr.pad != 0
        {
            let mismatch = ResponseMismatch {
                tx_opcode: opcode,
                rx_opcode: hdr.opcode,
                tx_seq: seq,
                rx_seq: hdr.seq,
                expected_size,
                rx_size: hdr.size,
                error: hdr.error,
                pad: hdr.pad,
            };
            log::error!("{mismatch}");
            return Err(FcpError::Protocol(mismatch));
        }

        let mut out = Vec::new();
        out.try_reserve_exact(resp_size)?;
        out.extend_from_slice(&payload[..resp_size]);
        Ok(out)
    }

    fn send_with_retry(&self, opcode: u32, pkt: &[u8]) -> Result<()> {
        let mut retries = 0;
        loop {
            match self.transport.send(pkt) {
                Ok(n) if n == pkt.len() => return Ok(()),
                Ok(n) => {
                    log::error!("FCP request {opcode:08x} failed: sent {n} of {} bytes", pkt.len());
                    return Err(FcpError::Transport(format!(
                        "FCP request {opcode:08x}: sent {n} of {} bytes",
                        pkt.len()
                    )));
                }
                Err(e) if e.is_transient() && retries < self.policy.max_retries => {
                    retries += 1;
                    let delay = self.policy.backoff(retries);
                    log::debug!(
                        "FCP request {opcode:08x}: {e}, retry {retries} in {}ms",
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
                Err(e) => {
                    log::error!("FCP request {opcode:08x} failed: {e}");
                    return Err(FcpError::transfer(format!("FCP request {opcode:08x}"), &e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::protocol::OPCODE_GET_METER;
    use crate::transport::mock::{MockTransport, Reply};

    fn engine() -> (TransactionEngine<MockTransport>, MockTransport) {
        let t = MockTransport::new();
        let completion = Arc::new(Completion::new());
        t.bus().ack_completion = Some(Arc::clone(&completion));
        let policy = RetryPolicy {
            completion_timeout: Duration::from_millis(50),
            ..RetryPolicy::default()
        };
        (TransactionEngine::new(t.clone(), completion, policy), t)
    }

    fn response(opcode: u32, seq: u16, payload: &[u8]) -> Vec<u8> {
        packet::build_request(opcode, seq, payload)
    }

    #[test]
    fn backoff_doubles_from_base() {
        let p = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|r| p.backoff(r).as_millis() as u64).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16]);
    }

    #[test]
    fn backoff_saturates_instead_of_overflowing() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(u64::MAX),
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(1), Duration::from_millis(u64::MAX));
        assert_eq!(p.backoff(5), Duration::MAX);
    }

    #[test]
    fn execute_returns_response_payload() {
        let (mut e, t) = engine();
        t.push_reply(Reply::Echo(vec![1, 2, 3, 4]));
        let resp = e.execute(0x0080_0000, &[0xAA, 0xBB], 4).unwrap();
        assert_eq!(resp, vec![1, 2, 3, 4]);

        let sent = t.sent();
        assert_eq!(sent.len(), 1);
        let hdr = PacketHeader::decode(&sent[0]).unwrap();
        assert_eq!(hdr.opcode, 0x0080_0000);
        assert_eq!(hdr.size, 2);
        assert_eq!(hdr.seq, 0);
        assert_eq!(&sent[0][16..], &[0xAA, 0xBB]);
    }

    #[test]
    fn zero_size_response() {
        let (mut e, _t) = engine();
        assert!(e.execute(0x2, &[], 0).unwrap().is_empty());
    }

    #[test]
    fn sequence_increments_across_successes_and_failures() {
        let (mut e, t) = engine();
        e.execute(1, &[], 0).unwrap();
        t.push_reply(Reply::Fail(TransferError::Stall));
        assert!(e.execute(1, &[], 0).is_err());
        t.fail_sends(TransferError::Stall, 1);
        assert!(e.execute(1, &[], 0).is_err());
        e.execute(1, &[], 0).unwrap();
        assert_eq!(t.sent_seqs(), vec![0, 1, 2, 3]);
        assert_eq!(e.next_seq(), 4);
    }

    #[test]
    fn sequence_wraps_at_u16() {
        let (mut e, t) = engine();
        e.seq = u16::MAX;
        e.execute(1, &[], 0).unwrap();
        e.execute(1, &[], 0).unwrap();
        assert_eq!(t.sent_seqs(), vec![u16::MAX, 0]);
    }

    #[test]
    fn reset_seq_restarts_at_zero() {
        let (mut e, t) = engine();
        e.execute(1, &[], 0).unwrap();
        e.reset_seq();
        e.execute(1, &[], 0).unwrap();
        assert_eq!(t.sent_seqs(), vec![0, 0]);
    }

    #[test]
    fn busy_send_retried_then_succeeds() {
        let (mut e, t) = engine();
        t.fail_sends(TransferError::Busy, 3);
        e.execute(1, &[], 0).unwrap();
        assert_eq!(t.sent().len(), 4);
        // Retries resend the same packet, same sequence number
        assert_eq!(t.sent_seqs(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn busy_send_gives_up_after_five_retries() {
        let (mut e, t) = engine();
        t.fail_sends(TransferError::Busy, 10);
        let start = std::time::Instant::now();
        let err = e.execute(1, &[], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportTransient);
        assert_eq!(t.sent().len(), 6);
        // 1 + 2 + 4 + 8 + 16 ms of backoff
        assert!(start.elapsed() >= Duration::from_millis(31));
    }

    #[test]
    fn non_transient_send_failure_not_retried() {
        let (mut e, t) = engine();
        t.fail_sends(TransferError::Stall, 1);
        let err = e.execute(1, &[], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFatal);
        assert_eq!(t.sent().len(), 1);
    }

    #[test]
    fn short_send_is_fatal() {
        let (mut e, t) = engine();
        t.bus().send_script.push_back(Ok(3));
        let err = e.execute(1, &[1, 2, 3, 4], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFatal);
        assert_eq!(t.sent().len(), 1);
    }

    #[test]
    fn missing_ack_times_out() {
        let (mut e, t) = engine();
        t.bus().auto_ack = false;
        let err = e.execute(1, &[], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        // No RX after a timeout
        assert_eq!(t.phases().len(), 1);
    }

    #[test]
    fn reboot_tolerates_device_going_away() {
        for failure in [TransferError::Disconnected, TransferError::Busy] {
            let (mut e, t) = engine();
            t.push_reply(Reply::Fail(failure));
            assert_eq!(e.execute(OPCODE_REBOOT, &[], 0).unwrap(), Vec::<u8>::new());
        }
    }

    #[test]
    fn same_rx_failure_fatal_for_other_opcodes() {
        for failure in [TransferError::Disconnected, TransferError::Busy] {
            let (mut e, t) = engine();
            t.push_reply(Reply::Fail(failure));
            let err = e.execute(0x0000_0002, &[], 0).unwrap_err();
            assert!(matches!(err, FcpError::Transport(_) | FcpError::TransportBusy(_)));
        }
    }

    #[test]
    fn reboot_other_rx_failure_still_fatal() {
        let (mut e, t) = engine();
        t.push_reply(Reply::Fail(TransferError::Stall));
        let err = e.execute(OPCODE_REBOOT, &[], 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFatal);
    }

    #[test]
    fn short_response_is_fatal() {
        let (mut e, t) = engine();
        t.push_reply(Reply::Echo(vec![0; 4]));
        let err = e.execute(1, &[], 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransportFatal);
    }

    #[test]
    fn opcode_mismatch_rejected() {
        let (mut e, t) = engine();
        t.push_reply(Reply::Raw(response(0x99, 0, &[0; 4])));
        let err = e.execute(0x98, &[], 4).unwrap_err();
        let FcpError::Protocol(m) = err else {
            panic!("expected protocol error");
        };
        assert_eq!(m.tx_opcode, 0x98);
        assert_eq!(m.rx_opcode, 0x99);
    }

    #[test]
    fn sequence_mismatch_rejected() {
        let (mut e, t) = engine();
        t.push_reply(Reply::Raw(response(1, 5, &[])));
        let err = e.execute(1, &[], 0).unwrap_err();
        let FcpError::Protocol(m) = err else {
            panic!("expected protocol error");
        };
        assert_eq!((m.tx_seq, m.rx_seq), (0, 5));
    }

    #[test]
    fn seq_one_accepts_zero_reply() {
        let (mut e, t) = engine();
        e.seq = 1;
        t.push_reply(Reply::Raw(response(1, 0, &[])));
        e.execute(1, &[], 0).unwrap();
    }

    #[test]
    fn seq_zero_exception_only_for_one() {
        let (mut e, t) = engine();
        e.seq = 2;
        t.push_reply(Reply::Raw(response(1, 0, &[])));
        assert_eq!(
            e.execute(1, &[], 0).unwrap_err().kind(),
            ErrorKind::ProtocolViolation
        );
    }

    #[test]
    fn declared_size_mismatch_rejected() {
        let (mut e, t) = engine();
        // Right length on the wire, wrong size field
        let mut raw = response(1, 0, &[0; 4]);
        raw[4..6].copy_from_slice(&2u16.to_le_bytes());
        t.push_reply(Reply::Raw(raw));
        let err = e.execute(1, &[], 4).unwrap_err();
        let FcpError::Protocol(m) = err else {
            panic!("expected protocol error");
        };
        assert_eq!((m.expected_size, m.rx_size), (4, 2));
    }

    #[test]
    fn device_error_field_rejected() {
        let (mut e, t) = engine();
        let mut raw = response(1, 0, &[]);
        raw[8..12].copy_from_slice(&7u32.to_le_bytes());
        t.push_reply(Reply::Raw(raw));
        let err = e.execute(1, &[], 0).unwrap_err();
        assert!(err.to_string().contains("error 7"), "got: {err}");
    }

    #[test]
    fn pad_field_rejected() {
        let (mut e, t) = engine();
        let mut raw = response(1, 0, &[]);
        raw[12..16].copy_from_slice(&1u32.to_le_bytes());
        t.push_reply(Reply::Raw(raw));
        assert_eq!(
            e.execute(1, &[], 0).unwrap_err().kind(),
            ErrorKind::ProtocolViolation
        );
    }

    #[test]
    fn oversized_request_rejected_before_send() {
        let (mut e, t) = engine();
        let big = vec![0u8; u16::MAX as usize + 1];
        let err = e.execute(OPCODE_GET_METER, &big, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(t.sent().is_empty());
        assert_eq!(e.next_seq(), 0);
    }
}
