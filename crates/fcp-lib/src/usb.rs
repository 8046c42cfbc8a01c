//! USB backend: discovery and the [`Transport`] implementation over `nusb`.
//!
//! Focusrite interfaces expose FCP on their vendor-specific interface
//! (`bInterfaceClass == 255`). Its first endpoint is the interrupt-in
//! endpoint that carries notifications; commands go over class/interface
//! control requests on endpoint 0 with `wIndex` = interface number.

use serde::Serialize;

use crate::config::Config;
use crate::error::{FcpError, Result};
use crate::meter::LocalRegistry;
use crate::session::FcpSession;

/// A session on a real USB device.
pub type UsbSession = FcpSession<UsbTransport, LocalRegistry>;

/// A Focusrite device with a control interface (not yet opened).
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// Bus location, e.g. `usb:001/004 [1235:8218]`.
    pub path: String,
    pub product_id: u16,
    pub product: Option<String>,
    pub serial: Option<String>,
    pub interface_number: u8,
}

/// Enumerate Focusrite devices that expose a control interface.
///
/// On unsupported platforms, always returns an empty list.
pub fn enumerate_devices() -> Vec<DiscoveredDevice> {
    #[cfg(target_os = "linux")]
    {
        linux_impl::enumerate()
    }
    #[cfg(not(target_os = "linux"))]
    {
        Vec::new()
    }
}

/// Open and claim a device, returning an attached (not yet initialised) session.
///
/// `serial` picks a device by serial number (case-insensitive); empty means
/// the first device found.
pub fn open_session(serial: &str, config: &Config) -> Result<UsbSession> {
    #[cfg(target_os = "linux")]
    {
        linux_impl::open(serial.trim(), config)
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = (serial, config);
        Err(FcpError::NotFound)
    }
}

/// Pick the device to open from an enumeration.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn select<'a>(devices: &'a [DiscoveredDevice], serial: &str) -> Result<&'a DiscoveredDevice> {
    if serial.is_empty() {
        return devices.first().ok_or(FcpError::NotFound);
    }
    if let Some(dev) = devices.iter().find(|d| {
        d.serial
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case(serial))
    }) {
        return Ok(dev);
    }
    if devices.is_empty() {
        return Err(FcpError::NotFound);
    }
    let available: Vec<&str> = devices
        .iter()
        .map(|d| d.serial.as_deref().unwrap_or("(no serial)"))
        .collect();
    Err(FcpError::OpenFailed(format!(
        "no device with serial '{serial}' found (available: {})",
        available.join(", ")
    )))
}

#[cfg(target_os = "linux")]
pub use linux_impl::{UsbNotifySource, UsbTransport};

#[cfg(target_os = "linux")]
mod linux_impl {
    use super::*;
    use std::time::{Duration, Instant};

    use futures_lite::future;
    use nusb::transfer::{
        Control, ControlType, Direction, EndpointType, Queue, Recipient, RequestBuffer,
    };

    use crate::protocol::{
        FOCUSRITE_VID, USB_BREQUEST_RX, USB_BREQUEST_STEP0, USB_BREQUEST_TX,
        VENDOR_INTERFACE_CLASS,
    };
    use crate::session::Addressing;
    use crate::transport::{NotifySource, TransferError, Transport};

    /// Poll interval while waiting on the interrupt queue.
    const QUEUE_POLL: Duration = Duration::from_millis(2);

    impl From<nusb::transfer::TransferError> for TransferError {
        fn from(e: nusb::transfer::TransferError) -> Self {
            use nusb::transfer::TransferError as E;
            match e {
                E::Fault => TransferError::Busy,
                E::Disconnected => TransferError::Disconnected,
                E::Cancelled => TransferError::Cancelled,
                E::Stall => TransferError::Stall,
                other => TransferError::Other(other.to_string()),
            }
        }
    }

    pub struct UsbTransport {
        interface: nusb::Interface,
        addressing: Addressing,
        timeout: Duration,
    }

    impl UsbTransport {
        fn control(&self, request: u8) -> Control {
            Control {
                control_type: ControlType::Class,
                recipient: Recipient::Interface,
                request,
                value: 0,
                index: u16::from(self.addressing.interface_number),
            }
        }

        fn control_in(&self, request: u8, len: usize) -> std::result::Result<Vec<u8>, TransferError> {
            let mut buf = vec![0u8; len];
            let n = self
                .interface
                .control_in_blocking(self.control(request), &mut buf, self.timeout)?;
            buf.truncate(n);
            log::debug!("control_in(bRequest={request}): {n}/{len} bytes");
            Ok(buf)
        }
    }

    impl Transport for UsbTransport {
        fn step0(&self, len: usize) -> std::result::Result<Vec<u8>, TransferError> {
            self.control_in(USB_BREQUEST_STEP0, len)
        }

        fn send(&self, packet: &[u8]) -> std::result::Result<usize, TransferError> {
            let n = self.interface.control_out_blocking(
                self.control(USB_BREQUEST_TX),
                packet,
                self.timeout,
            )?;
            log::debug!("control_out(bRequest={USB_BREQUEST_TX}): {n}/{} bytes", packet.len());
            Ok(n)
        }

        fn receive(&self, len: usize) -> std::result::Result<Vec<u8>, TransferError> {
            self.control_in(USB_BREQUEST_RX, len)
        }

        fn open_notifications(
            &self,
        ) -> std::result::Result<Box<dyn NotifySource>, TransferError> {
            let mut queue = self
                .interface
                .interrupt_in_queue(self.addressing.endpoint_address);
            let packet_size = self.addressing.max_packet_size;
            queue.submit(RequestBuffer::new(packet_size));
            Ok(Box::new(UsbNotifySource {
                queue,
                packet_size,
                spare: None,
            }))
        }
    }

    /// Interrupt-in queue with a single recycled buffer.
    pub struct UsbNotifySource {
        queue: Queue<RequestBuffer>,
        packet_size: usize,
        spare: Option<Vec<u8>>,
    }

    impl NotifySource for UsbNotifySource {
        fn wait(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Option<std::result::Result<usize, TransferError>> {
            if self.queue.pending() == 0 {
                std::thread::sleep(timeout);
                return None;
            }
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(done) = future::block_on(future::poll_once(self.queue.next_complete()))
                {
                    let len = done.data.len();
                    let n = len.min(buf.len());
                    buf[..n].copy_from_slice(&done.data[..n]);
                    self.spare = Some(done.data);
                    return Some(done.status.map(|()| len).map_err(TransferError::from));
                }
                if Instant::now() >= deadline {
                    return None;
                }
                std::thread::sleep(QUEUE_POLL);
            }
        }

        fn resubmit(&mut self) -> std::result::Result<(), TransferError> {
            let buf = self.spare.take().unwrap_or_default();
            self.queue
                .submit(RequestBuffer::reuse(buf, self.packet_size));
            Ok(())
        }

        fn cancel(&mut self) {
            self.queue.cancel_all();
            while self.queue.pending() > 0 {
                let _ = future::block_on(self.queue.next_complete());
            }
            self.spare = None;
        }
    }

    pub(super) fn enumerate() -> Vec<DiscoveredDevice> {
        let Ok(devices) = nusb::list_devices() else {
            return Vec::new();
        };

        devices
            .filter(|dev| dev.vendor_id() == FOCUSRITE_VID)
            .filter_map(|dev| {
                let iface = dev
                    .interfaces()
                    .find(|iface| iface.class() == VENDOR_INTERFACE_CLASS)?
                    .interface_number();
                Some(DiscoveredDevice {
                    path: format!(
                        "usb:{:03}/{:03} [{:04x}:{:04x}]",
                        dev.bus_number(),
                        dev.device_address(),
                        dev.vendor_id(),
                        dev.product_id(),
                    ),
                    product_id: dev.product_id(),
                    product: dev.product_string().map(|s| s.to_string()),
                    serial: dev.serial_number().map(|s| s.to_string()),
                    interface_number: iface,
                })
            })
            .collect()
    }

    pub(super) fn open(serial: &str, config: &Config) -> Result<UsbSession> {
        let discovered = enumerate();
        let target = select(&discovered, serial)?;

        let device_info = nusb::list_devices()
            .map_err(|e| FcpError::OpenFailed(format!("USB enumeration: {e}")))?
            .find(|dev| {
                dev.vendor_id() == FOCUSRITE_VID
                    && dev.product_id() == target.product_id
                    && dev.serial_number() == target.serial.as_deref()
            })
            .ok_or(FcpError::NotFound)?;

        let device = device_info
            .open()
            .map_err(|e| FcpError::OpenFailed(format!("USB open: {e}")))?;

        let iface_num = target.interface_number;
        let config_desc = device
            .active_configuration()
            .map_err(|e| FcpError::OpenFailed(format!("active configuration: {e}")))?;
        let alt = config_desc
            .interface_alt_settings()
            .find(|alt| alt.interface_number() == iface_num && alt.alternate_setting() == 0)
            .ok_or_else(|| {
                FcpError::OpenFailed(format!("interface {iface_num}: no descriptor"))
            })?;
        let ep = alt.endpoints().next().ok_or_else(|| {
            FcpError::OpenFailed(format!("interface {iface_num}: no endpoint"))
        })?;
        if ep.transfer_type() != EndpointType::Interrupt || ep.direction() != Direction::In {
            return Err(FcpError::OpenFailed(format!(
                "interface {iface_num}: endpoint {:#04x} is not interrupt-in",
                ep.address()
            )));
        }
        let addressing = Addressing {
            interface_number: iface_num,
            endpoint_address: ep.address(),
            max_packet_size: ep.max_packet_size(),
            interval: ep.interval(),
        };

        // Claim interface (nusb auto-detaches kernel driver)
        let interface = device
            .claim_interface(iface_num)
            .map_err(|e| FcpError::OpenFailed(format!("claim interface {iface_num}: {e}")))?;

        log::info!(
            "opened {} (interface {iface_num}, endpoint {:#04x}, {} byte packets, interval {})",
            target.path,
            addressing.endpoint_address,
            addressing.max_packet_size,
            addressing.interval
        );

        let transport = UsbTransport {
            interface,
            addressing,
            timeout: config.transfer_timeout(),
        };
        Ok(FcpSession::new(
            transport,
            LocalRegistry::new(),
            addressing,
            config.retry_policy(),
        ))
    }
}

// ── Stub transport for unsupported platforms ──

/// Uninhabited: sessions cannot be opened on this platform.
#[cfg(not(target_os = "linux"))]
pub enum UsbTransport {}

#[cfg(not(target_os = "linux"))]
impl crate::transport::Transport for UsbTransport {
    fn step0(&self, _len: usize) -> std::result::Result<Vec<u8>, crate::transport::TransferError> {
        match *self {}
    }
    fn send(&self, _packet: &[u8]) -> std::result::Result<usize, crate::transport::TransferError> {
        match *self {}
    }
    fn receive(&self, _len: usize) -> std::result::Result<Vec<u8>, crate::transport::TransferError> {
        match *self {}
    }
    fn open_notifications(
        &self,
    ) -> std::result::Result<Box<dyn crate::transport::NotifySource>, crate::transport::TransferError>
    {
        match *self {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dev(path: &str, serial: Option<&str>) -> DiscoveredDevice {
        DiscoveredDevice {
            path: path.into(),
            product_id: 0x8218,
            product: Some("Scarlett 2i2 4th Gen".into()),
            serial: serial.map(String::from),
            interface_number: 5,
        }
    }

    #[test]
    fn enumerate_devices_returns_vec() {
        // No hardware required; just must not panic
        let _ = enumerate_devices();
    }

    #[test]
    fn select_first_when_no_serial() {
        let devices = [dev("a", Some("S1")), dev("b", Some("S2"))];
        assert_eq!(select(&devices, "").unwrap().path, "a");
    }

    #[test]
    fn select_by_serial_case_insensitive() {
        let devices = [dev("a", Some("S1")), dev("b", Some("abc"))];
        assert_eq!(select(&devices, "ABC").unwrap().path, "b");
    }

    #[test]
    fn select_unknown_serial_lists_available() {
        let devices = [dev("a", Some("S1")), dev("b", None)];
        let err = select(&devices, "zzz").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("S1"), "got: {msg}");
        assert!(msg.contains("(no serial)"), "got: {msg}");
    }

    #[test]
    fn select_from_empty_is_not_found() {
        assert!(matches!(select(&[], ""), Err(FcpError::NotFound)));
        assert!(matches!(select(&[], "S1"), Err(FcpError::NotFound)));
    }

    #[test]
    fn discovered_device_serializes() {
        let json = serde_json::to_value(dev("usb:001/004", Some("X"))).unwrap();
        assert_eq!(json["path"], "usb:001/004");
        assert_eq!(json["serial"], "X");
        assert_eq!(json["interface_number"], 5);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn nusb_errors_map_to_transfer_errors() {
        use crate::transport::TransferError;
        use nusb::transfer::TransferError as E;
        assert_eq!(TransferError::from(E::Fault), TransferError::Busy);
        assert_eq!(TransferError::from(E::Disconnected), TransferError::Disconnected);
        assert_eq!(TransferError::from(E::Cancelled), TransferError::Cancelled);
        assert_eq!(TransferError::from(E::Stall), TransferError::Stall);
    }
}
