//! Transport abstraction for serial devices.
//!
//! The core never talks to an operating system directly. It drives a
//! [`Transport`] that opens devices and returns [`PortHandle`]s, and asks a
//! [`PortRegistry`] which devices exist.
//!
//! - [`native`] (feature `native`): real devices through the `serialport` crate
//! - [`loopback`]: in-memory devices that echo writes back, with fault injection
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------+
//! |        SerialPort (façade)           |
//! |  send/receive   config   status      |
//! +------------------+-------------------+
//!                    |     EventMonitor thread
//!                    |     (wait_for_event loop)
//!                    v            |
//! +------------------+------------+------+
//! |        Arc<dyn PortHandle>           |
//! +------------------+-------------------+
//!          |                    |
//! +--------+---------+ +--------+---------+
//! |  NativeHandle    | |  LoopbackHandle  |
//! |  (serialport)    | |   (in memory)    |
//! +------------------+ +------------------+
//! ```
//!
//! Handle methods take `&self`: the caller's thread and the monitor thread
//! use the same handle concurrently, so implementations synchronize
//! internally. Failures are reported as [`std::io::Error`] and translated
//! by [`crate::Error::from_native`].

pub mod loopback;
#[cfg(feature = "native")]
pub mod native;

use std::io;
use std::sync::Arc;

use crate::dcb::DeviceControlBlock;
use crate::status::{EventMask, ModemBits, NativeStatus};
use crate::timeouts::TimeoutPolicy;

/// Output lines driven by [`PortHandle::set_line`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineSignal {
    /// Request To Send.
    Rts,
    /// Data Terminal Ready.
    Dtr,
    /// Break condition on the transmit line.
    Break,
    /// Behave as if XOFF was received (`true`) or XON (`false`).
    Xoff,
}

/// Queues cleared by [`PortHandle::purge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    /// Discard unread input.
    Input,
    /// Discard unsent output.
    Output,
    /// Discard both.
    All,
}

/// USB identification of a port, when the registry knows it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbIds {
    /// USB vendor ID.
    pub vid: u16,
    /// USB product ID.
    pub pid: u16,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// One entry of a port listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Human readable device name.
    pub description: String,
    /// Identifier to pass to [`Transport::open`].
    pub identifier: String,
    /// USB details for USB adapters.
    pub usb: Option<UsbIds>,
}

/// Opens serial devices.
pub trait Transport: Send + Sync {
    /// Open the device named `identifier`.
    fn open(&self, identifier: &str) -> io::Result<Arc<dyn PortHandle>>;
}

/// An open serial device.
///
/// All methods may be called concurrently from several threads.
pub trait PortHandle: Send + Sync {
    /// Identifier the handle was opened with.
    fn name(&self) -> &str;

    /// Read honoring the current [`TimeoutPolicy`]; `Ok(0)` when it expires without data.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Read whatever is already queued without waiting.
    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write honoring the current [`TimeoutPolicy`].
    ///
    /// Returns the number of bytes accepted; fails with `TimedOut` when the
    /// deadline passes before any byte was accepted.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Apply framing, flow control and special characters.
    fn set_configuration(&self, dcb: &DeviceControlBlock) -> io::Result<()>;

    /// Apply read/write timeouts.
    fn set_timeouts(&self, timeouts: &TimeoutPolicy) -> io::Result<()>;

    /// Current status. Latched line errors are cleared by the query.
    fn query_status(&self) -> io::Result<NativeStatus>;

    /// Current modem status word.
    fn query_modem_pins(&self) -> io::Result<ModemBits>;

    /// Drive an output line.
    fn set_line(&self, signal: LineSignal, state: bool) -> io::Result<()>;

    /// Block until at least one event in `mask` fires and return the fired set.
    ///
    /// Returns `Interrupted` when [`PortHandle::cancel`] is called while waiting.
    fn wait_for_event(&self, mask: EventMask) -> io::Result<EventMask>;

    /// Discard queued data.
    fn purge(&self, purge: Purge) -> io::Result<()>;

    /// Abort every pending blocking call on this handle.
    fn cancel(&self);

    /// Release the device. Later calls fail with `NotConnected`.
    fn close(&self);
}

/// Lists the serial devices present on the host.
///
/// The order of the listing is unspecified.
pub trait PortRegistry {
    /// List available ports. An empty list is a valid answer.
    fn list_ports(&self) -> io::Result<Vec<PortInfo>>;

    /// Ports whose USB adapter matches the given VID/PID.
    fn find_by_vid_pid(&self, vid: u16, pid: u16) -> io::Result<Vec<PortInfo>> {
        let ports = self.list_ports()?;
        Ok(ports
            .into_iter()
            .filter(|p| {
                p.usb
                    .as_ref()
                    .is_some_and(|usb| usb.vid == vid && usb.pid == pid)
            })
            .collect())
    }
}

/// Error returned by handles after [`PortHandle::close`].
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "port handle is closed")
}

/// Error returned by blocking calls aborted through [`PortHandle::cancel`].
pub(crate) fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "operation cancelled")
}

#[cfg(feature = "native")]
pub use native::{NativeHandle, NativeRegistry, NativeTransport};

pub use loopback::{LoopbackController, LoopbackTransport};

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedRegistry(Vec<PortInfo>);

    impl PortRegistry for FixedRegistry {
        fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_find_by_vid_pid() {
        let registry = FixedRegistry(vec![
            PortInfo {
                description: "Built-in".to_string(),
                identifier: "/dev/ttyS0".to_string(),
                usb: None,
            },
            PortInfo {
                description: "CH340".to_string(),
                identifier: "/dev/ttyUSB0".to_string(),
                usb: Some(UsbIds {
                    vid: 0x1A86,
                    pid: 0x7523,
                    manufacturer: None,
                    product: None,
                    serial_number: None,
                }),
            },
        ]);

        let found = registry
            .find_by_vid_pid(0x1A86, 0x7523)
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].identifier, "/dev/ttyUSB0");
        assert!(registry
            .find_by_vid_pid(0x0403, 0x6001)
            .unwrap()
            .is_empty());
    }
}
