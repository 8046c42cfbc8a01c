//! Unified error type for the fcp-lib crate.
//!
//! [`FcpError`] covers every failure a session can surface. String payloads
//! follow the convention **"context: details"** where *context* names the
//! operation or step (e.g. `"FCP request 00001001"`, `"USB open"`).
//! [`FcpError::kind`] folds the variants into the coarse [`ErrorKind`]
//! taxonomy callers match on.

use std::fmt;

use crate::transport::TransferError;

/// A response that came back but does not belong to the request that was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMismatch {
    pub tx_opcode: u32,
    pub rx_opcode: u32,
    pub tx_seq: u16,
    pub rx_seq: u16,
    pub expected_size: u16,
    pub rx_size: u16,
    pub error: u32,
    pub pad: u32,
}

impl fmt::Display for ResponseMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FCP response invalid; opcode tx/rx {:08x}/{:08x} seq {}/{} size {}/{} error {} pad {}",
            self.tx_opcode,
            self.rx_opcode,
            self.tx_seq,
            self.rx_seq,
            self.expected_size,
            self.rx_size,
            self.error,
            self.pad
        )
    }
}

/// Coarse classification of an [`FcpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AllocationFailure,
    /// Bus stayed busy through every send retry.
    TransportTransient,
    TransportFatal,
    ProtocolViolation,
    Timeout,
    InvalidArgument,
    Cancelled,
    /// Discovery, configuration or filesystem problem outside a session.
    Setup,
}

/// Unified error type for fcp-lib operations.
#[derive(Debug)]
pub enum FcpError {
    /// A buffer could not be reserved.
    OutOfMemory(String),
    /// The bus was still busy after the last send retry.
    TransportBusy(String),
    /// A transfer failed or came back the wrong size.
    Transport(String),
    /// The response did not match the request.
    Protocol(ResponseMismatch),
    /// The device never acknowledged the command.
    Timeout(String),
    /// Rejected before touching the device.
    InvalidArgument(String),
    /// A blocking event read was cancelled.
    Cancelled,
    /// No Focusrite device with a control interface was found.
    NotFound,
    /// The device was found but could not be opened or claimed.
    OpenFailed(String),
    /// Configuration validation error.
    Config(String),
    /// Standard I/O error (config persistence, thread spawn).
    Io(std::io::Error),
}

impl FcpError {
    /// Build a transport error from a failed transfer, keeping the context prefix.
    pub fn transfer(context: impl fmt::Display, e: &TransferError) -> Self {
        if e.is_transient() {
            FcpError::TransportBusy(format!("{context}: {e}"))
        } else {
            FcpError::Transport(format!("{context}: {e}"))
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            FcpError::OutOfMemory(_) => ErrorKind::AllocationFailure,
            FcpError::TransportBusy(_) => ErrorKind::TransportTransient,
            FcpError::Transport(_) => ErrorKind::TransportFatal,
            FcpError::Protocol(_) => ErrorKind::ProtocolViolation,
            FcpError::Timeout(_) => ErrorKind::Timeout,
            FcpError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            FcpError::Cancelled => ErrorKind::Cancelled,
            FcpError::NotFound
            | FcpError::OpenFailed(_)
            | FcpError::Config(_)
            | FcpError::Io(_) => ErrorKind::Setup,
        }
    }
}

impl fmt::Display for FcpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FcpError::OutOfMemory(e) => write!(f, "Out of memory: {e}"),
            FcpError::TransportBusy(e) => write!(f, "Bus busy: {e}"),
            FcpError::Transport(e) => write!(f, "Transport error: {e}"),
            FcpError::Protocol(m) => write!(f, "{m}"),
            FcpError::Timeout(e) => write!(f, "Timed out: {e}"),
            FcpError::InvalidArgument(e) => write!(f, "Invalid argument: {e}"),
            FcpError::Cancelled => write!(f, "Interrupted"),
            FcpError::NotFound => write!(f, "Focusrite device not found"),
            FcpError::OpenFailed(e) => write!(f, "Failed to open device: {e}"),
            FcpError::Config(e) => write!(f, "Config error: {e}"),
            FcpError::Io(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for FcpError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FcpError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FcpError {
    fn from(e: std::io::Error) -> Self {
        FcpError::Io(e)
    }
}

impl From<std::collections::TryReserveError> for FcpError {
    fn from(e: std::collections::TryReserveError) -> Self {
        FcpError::OutOfMemory(e.to_string())
    }
}

/// Crate-level Result alias using [`FcpError`].
pub type Result<T> = std::result::Result<T, FcpError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn mismatch() -> ResponseMismatch {
        ResponseMismatch {
            tx_opcode: 0x1001,
            rx_opcode: 0x1002,
            tx_seq: 4,
            rx_seq: 5,
            expected_size: 8,
            rx_size: 12,
            error: 1,
            pad: 0,
        }
    }

    #[test]
    fn mismatch_display_carries_full_context() {
        assert_eq!(
            mismatch().to_string(),
            "FCP response invalid; opcode tx/rx 00001001/00001002 seq 4/5 size 8/12 error 1 pad 0"
        );
    }

    #[test]
    fn transfer_busy_is_transient() {
        let e = FcpError::transfer("FCP request 00000002", &TransferError::Busy);
        assert!(matches!(e, FcpError::TransportBusy(_)));
        assert_eq!(e.kind(), ErrorKind::TransportTransient);
        assert!(e.to_string().contains("FCP request 00000002"));
    }

    #[test]
    fn transfer_disconnected_is_fatal() {
        let e = FcpError::transfer("FCP response 00000002", &TransferError::Disconnected);
        assert_eq!(e.kind(), ErrorKind::TransportFatal);
    }

    #[test]
    fn kinds_cover_taxonomy() {
        assert_eq!(
            FcpError::OutOfMemory("x".into()).kind(),
            ErrorKind::AllocationFailure
        );
        assert_eq!(
            FcpError::Protocol(mismatch()).kind(),
            ErrorKind::ProtocolViolation
        );
        assert_eq!(FcpError::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            FcpError::InvalidArgument("x".into()).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(FcpError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(FcpError::NotFound.kind(), ErrorKind::Setup);
    }

    #[test]
    fn display_invalid_argument() {
        let e = FcpError::InvalidArgument("request size 5000 exceeds 4096".into());
        assert_eq!(
            e.to_string(),
            "Invalid argument: request size 5000 exceeds 4096"
        );
    }

    #[test]
    fn from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let e: FcpError = io_err.into();
        assert!(matches!(e, FcpError::Io(_)));
        assert!(std::error::Error::source(&e).is_some());
    }

    #[test]
    fn from_try_reserve_error() {
        let mut v: Vec<u8> = Vec::new();
        let err = v.try_reserve(usize::MAX).unwrap_err();
        let e: FcpError = err.into();
        assert_eq!(e.kind(), ErrorKind::AllocationFailure);
    }

    #[test]
    fn source_none_for_string_variants() {
        let e = FcpError::Config("test".into());
        assert!(std::error::Error::source(&e).is_none());
    }

    #[test]
    fn question_mark_propagation_io() {
        fn inner() -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "nope"))
        }
        fn outer() -> Result<()> {
            inner()?;
            Ok(())
        }
        assert!(matches!(outer().unwrap_err(), FcpError::Io(_)));
    }
}
