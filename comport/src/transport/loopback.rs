//! In-memory loopback transport.
//!
//! Every byte written to a loopback device is queued for reading on the same
//! device, as if TX were wired to RX. A [`LoopbackController`] lets the other
//! end of the imaginary cable inject data, line errors, breaks and modem pin
//! changes, and inspect what the port did.
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use comport::transport::LoopbackTransport;
//! use comport::{PortConfiguration, SerialPort};
//!
//! let transport = LoopbackTransport::new().with_port("LOOP0");
//! let port = SerialPort::new(
//!     Arc::new(transport.clone()),
//!     PortConfiguration::new("LOOP0", 115_200),
//! );
//! port.connect()?;
//! port.send(b"ping")?;
//! let mut buf = [0u8; 4];
//! assert_eq!(port.receive(&mut buf)?, 4);
//! port.disconnect()?;
//! # Ok::<(), comport::Error>(())
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::trace;

use crate::dcb::{DTR_DISABLE, DTR_ENABLE, DcbFlags, DeviceControlBlock, RTS_DISABLE, RTS_ENABLE};
use crate::status::{EventMask, HoldState, LineErrors, ModemBits, ModemPins, NativeStatus};
use crate::timeouts::TimeoutPolicy;
use crate::transport::{
    LineSignal, PortHandle, PortInfo, PortRegistry, Purge, Transport, cancelled_error,
    closed_error,
};

/// Decides whether a device accepts a configuration.
pub type FramingValidator = dyn Fn(&DeviceControlBlock) -> Result<(), String> + Send + Sync;

/// Framing rules of a typical UART: 5 to 8 data bits, 1.5 stop bits only
/// with 5 data bits, 2 stop bits not with 5 data bits.
pub fn standard_framing(dcb: &DeviceControlBlock) -> Result<(), String> {
    if dcb.baud_rate == 0 {
        return Err("baud rate must be positive".to_string());
    }
    if !(5..=8).contains(&dcb.byte_size) {
        return Err(format!("{} data bits not supported", dcb.byte_size));
    }
    if dcb.parity > 4 {
        return Err(format!("parity code {} not supported", dcb.parity));
    }
    match (dcb.byte_size, dcb.stop_bits) {
        (5, 1) | (5 | 6 | 7 | 8, 0) | (6 | 7 | 8, 2) => Ok(()),
        (bits, 1) => Err(format!("1.5 stop bits require 5 data bits, got {bits}")),
        (5, 2) => Err("2 stop bits cannot be used with 5 data bits".to_string()),
        (_, code) => Err(format!("stop-bit code {code} not supported")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Output line levels driven by the port.
pub struct LineLevels {
    /// Request To Send.
    pub rts: bool,
    /// Data Terminal Ready.
    pub dtr: bool,
    /// Break asserted.
    pub brk: bool,
}

struct DeviceState {
    present: bool,
    open: bool,
    generation: u64,
    cancel_epoch: u64,
    rx: VecDeque<u8>,
    pending: EventMask,
    errors: LineErrors,
    pins: ModemPins,
    lines: LineLevels,
    xoff_hold: bool,
    echo: bool,
    dcb: Option<DeviceControlBlock>,
    timeouts: TimeoutPolicy,
    written: Vec<u8>,
    wait_failures: VecDeque<io::ErrorKind>,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            present: true,
            open: false,
            generation: 0,
            cancel_epoch: 0,
            rx: VecDeque::new(),
            pending: EventMask::empty(),
            errors: LineErrors::empty(),
            pins: ModemPins::default(),
            lines: LineLevels::default(),
            xoff_hold: false,
            echo: true,
            dcb: None,
            timeouts: TimeoutPolicy::default(),
            written: Vec::new(),
            wait_failures: VecDeque::new(),
        }
    }

    fn receive(&mut self, data: &[u8]) {
        let discard_null = self
            .dcb
            .is_some_and(|dcb| {
                dcb.flags
                    .contains(DcbFlags::NULL)
            });
        let event_char = self
            .dcb
            .map(|dcb| dcb.event_char);
        let mut queued = false;
        for &byte in data {
            if discard_null && byte == 0 {
                continue;
            }
            if event_char.is_some_and(|c| c != 0 && c == byte) {
                self.pending |= EventMask::RX_FLAG;
            }
            self.rx
                .push_back(byte);
            queued = true;
        }
        if queued {
            self.pending |= EventMask::RX_CHAR;
        }
    }

    fn tx_held(&self) -> bool {
        if self.xoff_hold {
            return true;
        }
        match self.dcb {
            Some(_) => !self
                .hold_state()
                .is_empty(),
            None => false,
        }
    }

    fn hold_state(&self) -> HoldState {
        let mut hold = HoldState::empty();
        hold.set(HoldState::XOFF_HOLD, self.xoff_hold);
        if let Some(dcb) = self.dcb {
            hold.set(
                HoldState::CTS_HOLD,
                dcb.flags
                    .contains(DcbFlags::OUTX_CTS_FLOW)
                    && !self.pins.cts,
            );
            hold.set(
                HoldState::DSR_HOLD,
                dcb.flags
                    .contains(DcbFlags::OUTX_DSR_FLOW)
                    && !self.pins.dsr,
            );
        }
        hold
    }
}

struct Device {
    name: String,
    state: Mutex<DeviceState>,
    changed: Condvar,
}

impl Device {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        // A panicking test thread must not wedge every other user of the device
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn update<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        let mut state = self.lock();
        let result = f(&mut state);
        drop(state);
        self.changed
            .notify_all();
        result
    }
}

/// Transport of in-memory loopback devices.
///
/// Cloning is cheap; clones share the same devices.
#[derive(Clone)]
pub struct LoopbackTransport {
    devices: Arc<Mutex<BTreeMap<String, Arc<Device>>>>,
    open_delay: Duration,
    validator: Arc<FramingValidator>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// A transport without devices, using [`standard_framing`].
    pub fn new() -> Self {
        Self {
            devices: Arc::new(Mutex::new(BTreeMap::new())),
            open_delay: Duration::ZERO,
            validator: Arc::new(standard_framing),
        }
    }

    /// Add a device named `name`.
    #[must_use]
    pub fn with_port(self, name: impl Into<String>) -> Self {
        let name = name.into();
        let device = Arc::new(Device {
            name: name.clone(),
            state: Mutex::new(DeviceState::new()),
            changed: Condvar::new(),
        });
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name, device);
        self
    }

    /// Make every `open` take `delay`, like a slow driver.
    #[must_use]
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Replace the rule deciding which configurations devices accept.
    #[must_use]
    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&DeviceControlBlock) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Arc::new(validator);
        self
    }

    /// Controller for the far end of device `name`.
    pub fn controller(&self, name: &str) -> Option<LoopbackController> {
        self.device(name)
            .map(|device| LoopbackController { device })
    }

    fn device(&self, name: &str) -> Option<Arc<Device>> {
        self.devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl Transport for LoopbackTransport {
    fn open(&self, identifier: &str) -> io::Result<Arc<dyn PortHandle>> {
        if !self
            .open_delay
            .is_zero()
        {
            std::thread::sleep(self.open_delay);
        }

        let device = self
            .device(identifier)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no loopback device named {identifier}"),
                )
            })?;

        let generation = device.update(|state| {
            if !state.present {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("loopback device {identifier} is unplugged"),
                ));
            }
            if state.open {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    format!("loopback device {identifier} is in use"),
                ));
            }
            state.open = true;
            state.generation += 1;
            state.pending = EventMask::empty();
            state.errors = LineErrors::empty();
            state.xoff_hold = false;
            state.dcb = None;
            state.timeouts = TimeoutPolicy::default();
            Ok(state.generation)
        })?;

        trace!("Opened loopback device {identifier}");
        Ok(Arc::new(LoopbackHandle {
            device,
            generation,
            validator: Arc::clone(&self.validator),
        }))
    }
}

impl PortRegistry for LoopbackTransport {
    fn list_ports(&self) -> io::Result<Vec<PortInfo>> {
        let devices = self
            .devices
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(devices
            .values()
            .filter(|device| {
                device
                    .lock()
                    .present
            })
            .map(|device| PortInfo {
                description: format!("Loopback ({})", device.name),
                identifier: device
                    .name
                    .clone(),
                usb: None,
            })
            .collect())
    }
}

/// Handle to an open loopback device.
pub struct LoopbackHandle {
    device: Arc<Device>,
    generation: u64,
    validator: Arc<FramingValidator>,
}

impl LoopbackHandle {
    fn check(&self, state: &DeviceState) -> io::Result<()> {
        if state.open && state.generation == self.generation {
            Ok(())
        } else {
            Err(closed_error())
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> io::Result<R> {
        let mut state = self
            .device
            .lock();
        self.check(&state)?;
        let result = f(&mut state);
        drop(state);
        self.device
            .changed
            .notify_all();
        Ok(result)
    }
}

impl PortHandle for LoopbackHandle {
    fn name(&self) -> &str {
        &self
            .device
            .name
    }

    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self
            .device
            .lock();
        self.check(&state)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let epoch = state.cancel_epoch;
        let timeouts = state.timeouts;
        let started = Instant::now();
        let deadline = timeouts
            .read_deadline(buf.len())
            .map(|d| started + d);
        let gap = timeouts.read_gap();
        let mut filled = 0;
        let mut last_byte_at = started;

        loop {
            self.check(&state)?;
            while filled < buf.len() {
                match state
                    .rx
                    .pop_front()
                {
                    Some(byte) => {
                        buf[filled] = byte;
                        filled += 1;
                        last_byte_at = Instant::now();
                    },
                    None => break,
                }
            }
            if filled == buf.len() || timeouts.is_non_blocking_read() {
                return Ok(filled);
            }
            if state.cancel_epoch != epoch {
                return if filled > 0 {
                    Ok(filled)
                } else {
                    Err(cancelled_error())
                };
            }

            let now = Instant::now();
            let mut wait = deadline.map(|d| d.saturating_duration_since(now));
            if filled > 0 {
                if let Some(gap) = gap {
                    let gap_left = (last_byte_at + gap).saturating_duration_since(now);
                    wait = Some(wait.map_or(gap_left, |w| w.min(gap_left)));
                }
            }

            state = match wait {
                Some(left) if left.is_zero() => return Ok(filled),
                Some(left) => {
                    self.device
                        .changed
                        .wait_timeout(state, left)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0
                },
                None => self
                    .device
                    .changed
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
            };
        }
    }

    fn read_available(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.with_state(|state| {
            let count = buf
                .len()
                .min(state.rx.len());
            for (slot, byte) in buf
                .iter_mut()
                .zip(state.rx.drain(..count))
            {
                *slot = byte;
            }
            count
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .device
            .lock();
        self.check(&state)?;

        let epoch = state.cancel_epoch;
        let deadline = state
            .timeouts
            .write_deadline(buf.len())
            .map(|d| Instant::now() + d);

        while state.tx_held() {
            if state.cancel_epoch != epoch {
                return Err(cancelled_error());
            }
            state = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "write timed out while transmission was held",
                        ));
                    }
                    self.device
                        .changed
                        .wait_timeout(state, left)
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .0
                },
                None => self
                    .device
                    .changed
                    .wait(state)
                    .unwrap_or_else(std::sync::PoisonError::into_inner),
            };
            self.check(&state)?;
        }

        state
            .written
            .extend_from_slice(buf);
        if state.echo {
            state.receive(buf);
        }
        if !buf.is_empty() {
            state.pending |= EventMask::TX_EMPTY;
        }
        drop(state);
        self.device
            .changed
            .notify_all();
        Ok(buf.len())
    }

    fn set_configuration(&self, dcb: &DeviceControlBlock) -> io::Result<()> {
        (self.validator)(dcb).map_err(|msg| io::Error::new(io::ErrorKind::InvalidInput, msg))?;
        self.with_state(|state| {
            state.dcb = Some(*dcb);
            match dcb.dtr_control {
                DTR_DISABLE => state.lines.dtr = false,
                DTR_ENABLE => state.lines.dtr = true,
                _ => {},
            }
            match dcb.rts_control {
                RTS_DISABLE => state.lines.rts = false,
                RTS_ENABLE => state.lines.rts = true,
                _ => {},
            }
        })
    }

    fn set_timeouts(&self, timeouts: &TimeoutPolicy) -> io::Result<()> {
        self.with_state(|state| state.timeouts = *timeouts)
    }

    fn query_status(&self) -> io::Result<NativeStatus> {
        self.with_state(|state| {
            let errors = std::mem::take(&mut state.errors);
            NativeStatus {
                errors,
                hold: state.hold_state(),
                in_queue: u32::try_from(state.rx.len()).unwrap_or(u32::MAX),
                out_queue: 0,
            }
        })
    }

    fn query_modem_pins(&self) -> io::Result<ModemBits> {
        self.with_state(|state| {
            state
                .pins
                .to_native()
        })
    }

    fn set_line(&self, signal: LineSignal, level: bool) -> io::Result<()> {
        self.with_state(|state| match signal {
            LineSignal::Rts => state.lines.rts = level,
            LineSignal::Dtr => state.lines.dtr = level,
            LineSignal::Break => state.lines.brk = level,
            LineSignal::Xoff => state.xoff_hold = level,
        })
    }

    fn wait_for_event(&self, mask: EventMask) -> io::Result<EventMask> {
        let mut state = self
            .device
            .lock();
        let epoch = state.cancel_epoch;
        loop {
            self.check(&state)?;
            if let Some(kind) = state
                .wait_failures
                .pop_front()
            {
                return Err(io::Error::new(kind, "injected wait failure"));
            }
            let fired = state
                .pending
                .intersection(mask);
            if !fired.is_empty() {
                state.pending = state
                    .pending
                    .difference(fired);
                return Ok(fired);
            }
            if state.cancel_epoch != epoch {
                return Err(cancelled_error());
            }
            state = self
                .device
                .changed
                .wait(state)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn purge(&self, purge: Purge) -> io::Result<()> {
        self.with_state(|state| {
            if matches!(purge, Purge::Input | Purge::All) {
                state
                    .rx
                    .clear();
            }
        })
    }

    fn cancel(&self) {
        self.device
            .update(|state| state.cancel_epoch += 1);
    }

    fn close(&self) {
        self.device
            .update(|state| {
                if state.generation == self.generation {
                    state.open = false;
                    state.cancel_epoch += 1;
                    state.lines = LineLevels::default();
                }
            });
    }
}

/// The far end of a loopback device.
#[derive(Clone)]
pub struct LoopbackController {
    device: Arc<Device>,
}

impl LoopbackController {
    /// Queue bytes as if they arrived on the wire.
    pub fn inject(&self, data: &[u8]) {
        self.device
            .update(|state| state.receive(data));
    }

    /// Latch line errors and raise the error event.
    pub fn raise_errors(&self, errors: LineErrors) {
        self.device
            .update(|state| {
                state.errors |= errors;
                state.pending |= EventMask::ERR;
            });
    }

    /// Latch line errors and queue bytes in one step, so a single wait sees both.
    pub fn inject_with_errors(&self, data: &[u8], errors: LineErrors) {
        self.device
            .update(|state| {
                state.errors |= errors;
                state.pending |= EventMask::ERR;
                state.receive(data);
            });
    }

    /// Signal a break condition.
    pub fn send_break(&self) {
        self.device
            .update(|state| {
                state.errors |= LineErrors::BREAK;
                state.pending |= EventMask::BREAK;
            });
    }

    /// Change the modem input pins, raising an event per changed pin.
    pub fn set_pins(&self, pins: ModemPins) {
        self.device
            .update(|state| {
                state.pending |= state
                    .pins
                    .changes(pins);
                state.pins = pins;
            });
    }

    /// Make the next wait on this device fail with `kind`.
    pub fn fail_next_wait(&self, kind: io::ErrorKind) {
        self.device
            .update(|state| {
                state
                    .wait_failures
                    .push_back(kind);
            });
    }

    /// Turn echoing of written bytes on or off.
    pub fn set_echo(&self, echo: bool) {
        self.device
            .update(|state| state.echo = echo);
    }

    /// Remove the device: open handles become invalid and reopening fails.
    pub fn unplug(&self) {
        self.device
            .update(|state| {
                state.present = false;
                state.open = false;
            });
    }

    /// Make an unplugged device available again.
    pub fn replug(&self) {
        self.device
            .update(|state| state.present = true);
    }

    /// Every byte written by the port since the device was created.
    pub fn written(&self) -> Vec<u8> {
        self.device
            .lock()
            .written
            .clone()
    }

    /// Output line levels.
    pub fn lines(&self) -> LineLevels {
        self.device
            .lock()
            .lines
    }

    /// Whether transmission is held by XOFF.
    pub fn xoff_hold(&self) -> bool {
        self.device
            .lock()
            .xoff_hold
    }

    /// Last configuration applied by the port.
    pub fn configuration(&self) -> Option<DeviceControlBlock> {
        self.device
            .lock()
            .dcb
    }

    /// Timeouts applied by the port.
    pub fn timeouts(&self) -> TimeoutPolicy {
        self.device
            .lock()
            .timeouts
    }

    /// Bytes waiting to be read by the port.
    pub fn pending_input(&self) -> usize {
        self.device
            .lock()
            .rx
            .len()
    }

    /// Whether a handle is currently open.
    pub fn is_open(&self) -> bool {
        self.device
            .lock()
            .open
    }
}
