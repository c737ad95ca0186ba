//! Native serial devices using the `serialport` crate.
//!
//! This module provides the transport for native platforms
//! (Linux, macOS, Windows, FreeBSD, etc.).
//!
//! The `serialport` API is synchronous and has no event wait, so blocking
//! calls are sliced into short timed reads and the event wait polls the
//! queues and modem pins. Cancellation and close are checked between slices.
//! Line errors are not reported by the driver layer and the receive-flag
//! event is never raised.

use {
    crate::{
        dcb::{
            DTR_DISABLE, DTR_ENABLE, DcbFlags, DeviceControlBlock, RTS_DISABLE, RTS_ENABLE,
            RTS_HANDSHAKE,
        },
        status::{EventMask, HoldState, LineErrors, ModemBits, ModemPins, NativeStatus},
        timeouts::TimeoutPolicy,
        transport::{
            LineSignal, PortHandle, PortInfo, PortRegistry, Purge, Transport, UsbIds,
            cancelled_error, closed_error,
        },
    },
    log::{debug, trace},
    serialport::{ClearBuffer, SerialPort, SerialPortType},
    std::{
        io::{self, Read, Write},
        sync::{Arc, Mutex, MutexGuard, PoisonError},
        time::{Duration, Instant},
    },
};

/// Longest single blocking call on the device.
const IO_SLICE: Duration = Duration::from_millis(50);

/// Interval between two polls of the event sources.
const EVENT_POLL: Duration = Duration::from_millis(10);

/// Opens devices through the operating system's serial driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeTransport;

impl Transport for NativeTransport {
    fn open(&self, identifier: &str) -> io::Result<Arc<dyn PortHandle>> {
        // The configuration is applied right after open; these are placeholders
        let port = serialport::new(identifier, 9600)
            .timeout(IO_SLICE)
            .open()
            .map_err(driver_error)?;
        Ok(Arc::new(NativeHandle::new(identifier, port)?))
    }
}

struct Shared {
    closed: bool,
    cancel_epoch: u64,
    timeouts: TimeoutPolicy,
    dcb: Option<DeviceControlBlock>,
    last_pins: Option<ModemPins>,
    tx_pending: bool,
}

/// Handle to an open native device.
///
/// Reads, writes and control calls go through separate clones of the
/// underlying port so a blocked read does not stall a write.
pub struct NativeHandle {
    name: String,
    reader: Mutex<Option<Box<dyn SerialPort>>>,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    control: Mutex<Option<Box<dyn SerialPort>>>,
    shared: Mutex<Shared>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// Kind of a driver error.
///
/// `serialport` keeps no OS code: errors it has no kind for (EBUSY, Windows
/// sharing violations) arrive as `Unknown` or `Other` with the system's
/// message, and Windows reports access denied as `NoDevice`.
fn error_kind(err: &serialport::Error) -> io::ErrorKind {
    let description = err
        .description
        .to_ascii_lowercase();
    match err.kind() {
        serialport::ErrorKind::Io(kind) if kind != io::ErrorKind::Other => kind,
        _ if description.contains("busy") || description.contains("used by another process") => {
            io::ErrorKind::ResourceBusy
        },
        _ if description.contains("denied") || description.contains("not permitted") => {
            io::ErrorKind::PermissionDenied
        },
        serialport::ErrorKind::NoDevice => io::ErrorKind::NotFound,
        serialport::ErrorKind::InvalidInput => io::ErrorKind::InvalidInput,
        _ => io::ErrorKind::Other,
    }
}

/// Convert a driver error raised while opening or listing devices.
pub(crate) fn driver_error(err: serialport::Error) -> io::Error {
    io::Error::new(error_kind(&err), err.description)
}

/// Convert a driver error raised on an open handle.
///
/// A vanished device means the handle is no longer usable.
fn device_error(err: serialport::Error) -> io::Error {
    let kind = match err.kind() {
        serialport::ErrorKind::NoDevice => io::ErrorKind::NotConnected,
        _ => error_kind(&err),
    };
    io::Error::new(kind, err.description)
}

fn unsupported(what: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{what} is not supported by the native driver"),
    )
}

impl NativeHandle {
    fn new(identifier: &str, port: Box<dyn SerialPort>) -> io::Result<Self> {
        let reader = port
            .try_clone()
            .map_err(device_error)?;
        let writer = port
            .try_clone()
            .map_err(device_error)?;
        debug!("Opened native port {identifier}");
        Ok(Self {
            name: identifier.to_string(),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            control: Mutex::new(Some(port)),
            shared: Mutex::new(Shared {
                closed: false,
                cancel_epoch: 0,
                timeouts: TimeoutPolicy::default(),
                dcb: None,
                last_pins: None,
                tx_pending: false,
            }),
        })
    }

    /// Current cancel epoch, or an error once closed.
    fn epoch(&self) -> io::Result<u64> {
        let shared = lock(&self.shared);
        if shared.closed {
            Err(closed_error())
        } else {
            Ok(shared.cancel_epoch)
        }
    }

    fn interrupted_since(&self, epoch: u64) -> io::Result<bool> {
        Ok(self.epoch()? != epoch)
    }

    fn with_control<R>(
        &self,
        f: impl FnOnce(&mut dyn SerialPort) -> serialport::Result<R>,
    ) -> io::Result<R> {
        let mut guard = lock(&self.control);
        let port = guard
            .as_mut()
            .ok_or_else(closed_error)?;
        f(port.as_mut()).map_err(device_error)
    }

    fn read_pins(port: &mut dyn SerialPort) -> serialport::Result<ModemPins> {
        Ok(ModemPins {
            cts: port.read_clear_to_send()?,
            dsr: port.read_data_set_ready()?,
            rlsd: port.read_carrier_detect()?,
            ring: port.read_ring_indicator()?,
        })
    }

    /// One timed read on the reader clone.
    fn read_slice(&self, buf: &mut [u8], slice: Duration) -> io::Result<usize> {
        let mut guard = lock(&self.reader);
        let port = guard
            .as_mut()
            .ok_or_else(closed_error)?;
        port.set_timeout(slice)
            .map_err(device_error)?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
            {
                Ok(0)
            },
            Err(e) => Err(e),
        }
    }

    fn write_slice(&self, buf: &[u8], slice: Duration) -> io::Result<usize> {
        let mut guard = lock(&self.writer);
        let port = guard
            .as_mut()
            .ok_or_else(closed_error)?;
        port.set_timeout(slice)
            .map_err(device_error)?;
        match port.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
            {
                Ok(0)
            },
            Err(e) => Err(e),
        }
    }
}

/// Length of the next blocking slice, bounded by `until`.
fn next_slice(until: Option<Instant>) -> Duration {
    until.map_or(IO_SLICE, |t| {
        t.saturating_duration_since(Instant::now())
            .min(IO_SLICE)
    })
}

impl PortHandle for NativeHandle {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let epoch = self.epoch()?;
        let timeouts = lock(&self.shared).timeouts;
        if buf.is_empty() {
            return Ok(0);
        }
        if timeouts.is_non_blocking_read() {
            return self.read_available(buf);
        }

        let started = Instant::now();
        let deadline = timeouts
            .read_deadline(buf.len())
            .map(|d| started + d);
        let gap = timeouts.read_gap();
        let mut filled = 0;
        let mut last_byte_at = started;

        loop {
            let mut until = deadline;
            if filled > 0 {
                if let Some(gap) = gap {
                    let gap_end = last_byte_at + gap;
                    until = Some(until.map_or(gap_end, |d| d.min(gap_end)));
                }
            }
            if until.is_some_and(|t| Instant::now() >= t) {
                return Ok(filled);
            }

            let n = self.read_slice(&mut buf[filled..], next_slice(until))?;
            if n > 0 {
                filled += n;
                last_byte_at = Instant::now();
                if filled == buf.len() {
                    return Ok(filled);
                }
            }
            if self.interrupted_since(epoch)? {
                return if filled > 0 {
                    Ok(filled)
                } else {
                    Err(cancelled_error())
                };
            }
        }
    }

    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.epoch()?;
        let queued = self.with_control(|port| port.bytes_to_read())?;
        let want = buf
            .len()
            .min(usize::try_from(queued).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(0);
        }
        self.read_slice(&mut buf[..want], Duration::from_millis(1))
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let epoch = self.epoch()?;
        let timeouts = lock(&self.shared).timeouts;
        let deadline = timeouts
            .write_deadline(buf.len())
            .map(|d| Instant::now() + d);
        let mut written = 0;

        while written < buf.len() {
            if deadline.is_some_and(|t| Instant::now() >= t) {
                break;
            }
            written += self.write_slice(&buf[written..], next_slice(deadline))?;
            if self.interrupted_since(epoch)? {
                if written == 0 {
                    return Err(cancelled_error());
                }
                break;
            }
        }

        if written == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out before any byte was accepted",
            ));
        }
        if written > 0 {
            lock(&self.shared).tx_pending = true;
        }
        trace!("Wrote {written} bytes to {}", self.name);
        Ok(written)
    }

    fn set_configuration(&self, dcb: &DeviceControlBlock) -> io::Result<()> {
        let data_bits = match dcb.byte_size {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            8 => serialport::DataBits::Eight,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{other} data bits"),
                ));
            },
        };
        let parity = match dcb.parity {
            0 => serialport::Parity::None,
            1 => serialport::Parity::Odd,
            2 => serialport::Parity::Even,
            _ => return Err(unsupported("mark or space parity")),
        };
        let stop_bits = match dcb.stop_bits {
            0 => serialport::StopBits::One,
            2 => serialport::StopBits::Two,
            _ => return Err(unsupported("1.5 stop bits")),
        };
        if dcb
            .flags
            .intersects(DcbFlags::OUTX_DSR_FLOW | DcbFlags::DSR_SENSITIVITY)
        {
            return Err(unsupported("DSR flow control"));
        }
        let software = dcb
            .flags
            .intersects(DcbFlags::OUT_X | DcbFlags::IN_X);
        let hardware = dcb
            .flags
            .contains(DcbFlags::OUTX_CTS_FLOW);
        let flow = match (hardware, software) {
            (true, true) => return Err(unsupported("combined hardware and software flow control")),
            (true, false) => serialport::FlowControl::Hardware,
            (false, true) => serialport::FlowControl::Software,
            (false, false) => serialport::FlowControl::None,
        };
        let dtr = match dcb.dtr_control {
            DTR_DISABLE => Some(false),
            DTR_ENABLE => Some(true),
            _ => return Err(unsupported("DTR handshake")),
        };
        let rts = match dcb.rts_control {
            RTS_DISABLE => Some(false),
            RTS_ENABLE => Some(true),
            RTS_HANDSHAKE if flow == serialport::FlowControl::Hardware => None,
            _ => return Err(unsupported("this RTS control mode")),
        };

        self.with_control(|port| {
            port.set_baud_rate(dcb.baud_rate)?;
            port.set_data_bits(data_bits)?;
            port.set_parity(parity)?;
            port.set_stop_bits(stop_bits)?;
            port.set_flow_control(flow)?;
            if let Some(level) = dtr {
                port.write_data_terminal_ready(level)?;
            }
            if let Some(level) = rts {
                port.write_request_to_send(level)?;
            }
            Ok(())
        })?;
        lock(&self.shared).dcb = Some(*dcb);
        Ok(())
    }

    fn set_timeouts(&self, timeouts: &TimeoutPolicy) -> io::Result<()> {
        self.epoch()?;
        lock(&self.shared).timeouts = *timeouts;
        Ok(())
    }

    fn query_status(&self) -> io::Result<NativeStatus> {
        let (in_queue, out_queue, pins) = self.with_control(|port| {
            Ok((
                port.bytes_to_read()?,
                port.bytes_to_write()?,
                Self::read_pins(port)?,
            ))
        })?;
        let mut hold = HoldState::empty();
        if let Some(dcb) = lock(&self.shared).dcb {
            hold.set(
                HoldState::CTS_HOLD,
                dcb.flags
                    .contains(DcbFlags::OUTX_CTS_FLOW)
                    && !pins.cts,
            );
        }
        Ok(NativeStatus {
            errors: LineErrors::empty(),
            hold,
            in_queue,
            out_queue,
        })
    }

    fn query_modem_pins(&self) -> io::Result<ModemBits> {
        self.with_control(|port| Self::read_pins(port).map(ModemPins::to_native))
    }

    fn set_line(&self, signal: LineSignal, state: bool) -> io::Result<()> {
        trace!("Setting {signal:?} to {state}");
        match signal {
            LineSignal::Rts => self.with_control(|port| port.write_request_to_send(state)),
            LineSignal::Dtr => self.with_control(|port| port.write_data_terminal_ready(state)),
            LineSignal::Break if state => self.with_control(|port| port.set_break()),
            LineSignal::Break => self.with_control(|port| port.clear_break()),
            LineSignal::Xoff => Err(unsupported("simulated XOFF")),
        }
    }

    fn wait_for_event(&self, mask: EventMask) -> io::Result<EventMask> {
        let epoch = self.epoch()?;
        loop {
            let (in_queue, out_queue, pins) = self.with_control(|port| {
                let pins = if mask.intersects(EventMask::MODEM) {
                    Some(Self::read_pins(port)?)
                } else {
                    None
                };
                Ok((port.bytes_to_read()?, port.bytes_to_write()?, pins))
            })?;

            let mut fired = EventMask::empty();
            if in_queue > 0 {
                fired |= EventMask::RX_CHAR;
            }
            {
                let mut shared = lock(&self.shared);
                if shared.closed {
                    return Err(closed_error());
                }
                if shared.cancel_epoch != epoch {
                    return Err(cancelled_error());
                }
                if let Some(pins) = pins {
                    if let Some(last) = shared.last_pins {
                        fired |= last.changes(pins);
                    }
                    shared.last_pins = Some(pins);
                }
                if shared.tx_pending && out_queue == 0 && mask.contains(EventMask::TX_EMPTY) {
                    shared.tx_pending = false;
                    fired |= EventMask::TX_EMPTY;
                }
            }

            let fired = fired.intersection(mask);
            if !fired.is_empty() {
                return Ok(fired);
            }
            std::thread::sleep(EVENT_POLL);
        }
    }

    fn purge(&self, purge: Purge) -> io::Result<()> {
        let buffer = match purge {
            Purge::Input => ClearBuffer::Input,
            Purge::Output => ClearBuffer::Output,
            Purge::All => ClearBuffer::All,
        };
        self.with_control(|port| port.clear(buffer))
    }

    fn cancel(&self) {
        lock(&self.shared).cancel_epoch += 1;
    }

    fn close(&self) {
        {
            let mut shared = lock(&self.shared);
            if shared.closed {
                return;
            }
            shared.closed = true;
            shared.cancel_epoch += 1;
        }
        // Dropping every clone releases the device; a blocked slice ends
        // within IO_SLICE and then sees the closed flag
        lock(&self.control).take();
        lock(&self.writer).take();
        lock(&self.reader).take();
        debug!("Closed native port {}", self.name);
    }
}

/// Lists the serial devices of the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeRegistry;

impl PortRegistry for NativeRegistry {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(driver_error)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (description, usb) = match p.port_type {
                    SerialPortType::UsbPort(info) => (
                        info.product
                            .clone()
                            .unwrap_or_else(|| "USB serial device".to_string()),
                        Some(UsbIds {
                            vid: info.vid,
                            pid: info.pid,
                            manufacturer: info.manufacturer,
                            product: info.product,
                            serial_number: info.serial_number,
                        }),
                    ),
                    SerialPortType::PciPort => ("PCI serial port".to_string(), None),
                    SerialPortType::BluetoothPort => ("Bluetooth serial port".to_string(), None),
                    SerialPortType::Unknown => ("Serial port".to_string(), None),
                };

                PortInfo {
                    description,
                    identifier: p.port_name,
                    usb,
                }
            })
            .collect())
    }
}
