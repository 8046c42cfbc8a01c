//! Protocol constants for the Focusrite Control Protocol (FCP).
//!
//! FCP is spoken by Scarlett 2nd/3rd/4th Gen, Clarett USB, Clarett+ and
//! Vocaster interfaces over a vendor-specific (class 255) USB interface.
//! Only the opcodes the engine itself has to recognise live here; the rest
//! of the catalog is opaque to this crate and passed through by callers.

use std::time::Duration;

// ── Control-plane version ──

pub const VERSION_MAJOR: u32 = 2;
pub const VERSION_MINOR: u32 = 0;
pub const VERSION_SUBMINOR: u32 = 0;

/// Packed control-plane version: `major << 16 | minor << 8 | subminor`.
pub const VERSION: u32 = (VERSION_MAJOR << 16) | (VERSION_MINOR << 8) | VERSION_SUBMINOR;

/// Split a packed version into `(major, minor, subminor)`.
pub fn unpack_version(v: u32) -> (u8, u8, u8) {
    ((v >> 16) as u8, (v >> 8) as u8, v as u8)
}

// ── USB control transfer parameters ──

/// `bRequest` for init step 0 (control in, sent once before any packet).
pub const USB_BREQUEST_STEP0: u8 = 0;

/// `bRequest` for sending a command packet (TX).
pub const USB_BREQUEST_TX: u8 = 2;

/// `bRequest` for fetching a response packet (RX).
pub const USB_BREQUEST_RX: u8 = 3;

/// Default timeout per USB control transfer in milliseconds.
pub const USB_TIMEOUT_MS: u64 = 1000;

/// `bInterfaceClass` of the Focusrite Control interface.
pub const VENDOR_INTERFACE_CLASS: u8 = 255;

/// Focusrite vendor ID.
pub const FOCUSRITE_VID: u16 = 0x1235;

// ── Packet framing ──

/// Packet header size (opcode + size + seq + error + pad).
pub const HEADER_SIZE: usize = 16;

/// Largest request or response payload accepted from a caller.
pub const MAX_COMMAND_SIZE: usize = 4096;

/// Largest step 0 transfer.
pub const MAX_STEP0_SIZE: usize = 255;

// ── Transaction timing ──

/// Send retries on a busy bus (`-EPROTO`), on top of the first attempt.
pub const SEND_MAX_RETRIES: u32 = 5;

/// First retry delay; doubles on every further retry.
pub const SEND_RETRY_BASE: Duration = Duration::from_millis(1);

/// How long a command waits for the device's ACK notification.
pub const COMPLETION_TIMEOUT: Duration = Duration::from_millis(1000);

// ── Opcodes the engine knows about ──

/// Init step 1: first packet after step 0.
pub const OPCODE_INIT_1: u32 = 0x0000_0000;

/// Reboot: the device may vanish before answering.
pub const OPCODE_REBOOT: u32 = 0x0000_0003;

/// Read live meter levels.
/// Payload: `[pad:u16=0][num_meters:u16][magic:u32=1]`, response `num_meters` u32 values.
pub const OPCODE_GET_METER: u32 = 0x0000_1001;

/// Magic value carried by every GET_METER request.
pub const METER_LEVELS_GET_MAGIC: u32 = 1;

// ── Notifications ──

/// Bit 0 of the notification bitmask: last command acknowledged.
pub const NOTIFY_ACK: u32 = 0x0000_0001;

/// Size of a valid interrupt delivery.
pub const NOTIFY_PAYLOAD_SIZE: usize = 8;

// ── Level meter ──

/// Largest meter map (exposed channel count).
pub const MAX_METER_MAP_LEN: usize = 255;

/// Largest meter label blob.
pub const MAX_METER_LABELS_SIZE: usize = 4096;

/// Meter control range.
pub const METER_LEVEL_MIN: u32 = 0;
pub const METER_LEVEL_MAX: u32 = 4095;

/// Name under which the meter control is registered.
pub const METER_CONTROL_NAME: &str = "Level Meter";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_2_0_0() {
        assert_eq!(VERSION, 0x0002_0000);
        assert_eq!(unpack_version(VERSION), (2, 0, 0));
    }

    #[test]
    fn unpack_version_splits_fields() {
        assert_eq!(unpack_version(0x0001_0203), (1, 2, 3));
        assert_eq!(unpack_version(0xFF12_3456), (0x12, 0x34, 0x56));
    }

    #[test]
    fn usb_brequest_values_distinct() {
        assert_ne!(USB_BREQUEST_STEP0, USB_BREQUEST_TX);
        assert_ne!(USB_BREQUEST_STEP0, USB_BREQUEST_RX);
        assert_ne!(USB_BREQUEST_TX, USB_BREQUEST_RX);
    }

    #[test]
    fn opcodes_distinct() {
        let ops = [OPCODE_INIT_1, OPCODE_REBOOT, OPCODE_GET_METER];
        for i in 0..ops.len() {
            for j in (i + 1)..ops.len() {
                assert_ne!(ops[i], ops[j], "opcodes at index {i} and {j} collide");
            }
        }
    }

    #[test]
    fn header_size_is_16() {
        // opcode(4) + size(2) + seq(2) + error(4) + pad(4) = 16
        assert_eq!(HEADER_SIZE, 16);
    }

    #[test]
    fn command_limits_fit_size_field() {
        const { assert!(MAX_COMMAND_SIZE <= u16::MAX as usize) };
        const { assert!(MAX_STEP0_SIZE <= u8::MAX as usize) };
    }
}
