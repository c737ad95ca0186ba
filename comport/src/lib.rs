//! # comport
//!
//! A serial-port communication core.
//!
//! This crate owns a serial device for you:
//!
//! - Configuration of framing, flow control and special characters, applied
//!   atomically and re-applied live while connected
//! - Synchronous send/receive bounded by hardware-style timeouts
//! - A background monitor thread turning line errors, received data, breaks
//!   and modem pin changes into notifications
//! - A typed error taxonomy with a single translation point for native codes
//!
//! ## Transports
//!
//! The core talks to devices through the [`transport::Transport`] trait.
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport` crate
//! - **Loopback**: in-memory devices echoing writes back, with fault
//!   injection for tests
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use comport::{PortConfiguration, SerialPort, TimeoutPolicy};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     #[cfg(feature = "native")]
//!     {
//!         let port = SerialPort::native(PortConfiguration::new("/dev/ttyUSB0", 115_200))
//!             .with_timeouts(TimeoutPolicy::constant(500, 500));
//!         port.on_data_received(|data| println!("{}", String::from_utf8_lossy(data)));
//!         port.connect()?;
//!         port.send(b"AT\r\n")?;
//!         std::thread::sleep(std::time::Duration::from_secs(1));
//!         port.disconnect()?;
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod dcb;
pub mod error;
pub mod host;
pub mod monitor;
pub mod notify;
pub mod serial;
pub mod settings;
pub mod status;
pub mod timeouts;
pub mod transport;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use host::discover_native_ports;
#[cfg(feature = "native")]
pub use transport::{NativeRegistry, NativeTransport};
pub use {
    dcb::{DcbFlags, DeviceControlBlock},
    error::{Error, Result},
    host::{BridgeKind, auto_select, discover_ports, format_port_list},
    monitor::{CounterSnapshot, MonitorState},
    notify::Notification,
    serial::SerialPort,
    settings::{DtrControl, FlowControl, Parity, PortConfiguration, RtsControl, StopBits},
    status::{EventMask, LineError, LineErrors, ModemPin, ModemPins, PortStatus},
    timeouts::TimeoutPolicy,
    transport::{
        LineSignal, LoopbackController, LoopbackTransport, PortInfo, PortRegistry, Purge,
        Transport, UsbIds,
    },
};
