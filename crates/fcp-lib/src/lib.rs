//! fcp-lib: userspace engine for the Focusrite Control Protocol (FCP).
//!
//! FCP is the vendor command/response protocol spoken by Scarlett, Clarett
//! and Vocaster USB interfaces. Open a device with [`usb::open_session`],
//! bring it up with [`FcpSession::init`], then issue opaque commands, read
//! the level meters and follow device events.

pub mod config;
pub mod error;
pub mod events;
pub mod meter;
pub mod notify;
pub mod packet;
pub mod protocol;
pub mod reconnect;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod usb;

pub use error::{ErrorKind, FcpError};
pub use session::{FcpSession, Request, Response, SessionState};
