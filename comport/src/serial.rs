//! The serial port façade.
//!
//! [`SerialPort`] owns a configuration, opens a device through a
//! [`Transport`] on [`SerialPort::connect`], runs the [`EventMonitor`] while
//! connected and hands out notifications to subscribers.
//!
//! All methods take `&self`, so a port can be shared between threads (for
//! example to disconnect from one thread while another is connecting or
//! blocked in [`SerialPort::receive`]).

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::monitor::{CounterSnapshot, EventCounters, EventMonitor, GRACE_PERIOD, MonitorState};
use crate::notify::{Notification, Subscribers};
use crate::settings::{DtrControl, FlowControl, Parity, PortConfiguration, RtsControl, StopBits};
use crate::status::{LineError, ModemPin, ModemPins, PortStatus};
use crate::timeouts::TimeoutPolicy;
use crate::transport::{LineSignal, PortHandle, PortInfo, PortRegistry, Purge, Transport};

struct Link {
    handle: Arc<dyn PortHandle>,
    monitor: EventMonitor,
}

impl Link {
    fn shutdown(&self, grace: Duration) {
        self.monitor
            .cancel(grace);
        self.handle
            .close();
    }
}

enum Lifecycle {
    Closed,
    /// A `connect` identified by its attempt number is in progress.
    Connecting(u64),
    Open(Arc<Link>),
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// A serial port.
pub struct SerialPort {
    transport: Arc<dyn Transport>,
    config: Mutex<PortConfiguration>,
    timeouts: Mutex<TimeoutPolicy>,
    lifecycle: Mutex<Lifecycle>,
    attempts: Mutex<u64>,
    /// Held shared by send/receive and exclusively while applying settings.
    io_gate: RwLock<()>,
    subscribers: Arc<Subscribers>,
    counters: Arc<EventCounters>,
    grace: Duration,
}

macro_rules! config_property {
    ($(#[doc = $doc:literal] $get:ident, $set:ident: $ty:ty;)*) => {
        $(
            #[doc = $doc]
            pub fn $get(&self) -> $ty {
                lock(&self.config).$get()
            }

            #[doc = concat!("Set: ", $doc)]
            ///
            /// Re-applied to the device immediately when connected.
            pub fn $set(&self, value: $ty) -> Result<()> {
                self.update_config(|config| {
                    config.$set(value);
                    Ok(())
                })
            }
        )*
    };
}

macro_rules! timeout_property {
    ($(#[doc = $doc:literal] $field:ident, $set:ident;)*) => {
        $(
            #[doc = $doc]
            pub fn $field(&self) -> u32 {
                lock(&self.timeouts).$field
            }

            #[doc = concat!("Set: ", $doc)]
            pub fn $set(&self, ms: u32) -> Result<()> {
                let mut timeouts = self.timeouts();
                timeouts.$field = ms;
                self.set_timeouts(timeouts)
            }
        )*
    };
}

impl SerialPort {
    /// Create a closed port that will open devices through `transport`.
    pub fn new(transport: Arc<dyn Transport>, config: PortConfiguration) -> Self {
        Self {
            transport,
            config: Mutex::new(config),
            timeouts: Mutex::new(TimeoutPolicy::default()),
            lifecycle: Mutex::new(Lifecycle::Closed),
            attempts: Mutex::new(0),
            io_gate: RwLock::new(()),
            subscribers: Arc::new(Subscribers::default()),
            counters: Arc::new(EventCounters::default()),
            grace: GRACE_PERIOD,
        }
    }

    /// Create a closed port on the operating system's serial devices.
    #[cfg(feature = "native")]
    pub fn native(config: PortConfiguration) -> Self {
        Self::new(Arc::new(crate::transport::NativeTransport), config)
    }

    /// Use `timeouts` from the next `connect` on.
    #[must_use]
    pub fn with_timeouts(self, timeouts: TimeoutPolicy) -> Self {
        *lock(&self.timeouts) = timeouts;
        self
    }

    /// Change how long `disconnect` waits for the monitor thread.
    #[must_use]
    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// List the ports `registry` knows about.
    pub fn enumerate_ports(registry: &dyn PortRegistry) -> Result<Vec<PortInfo>> {
        registry
            .list_ports()
            .map_err(Error::from_native)
    }

    // ---- lifecycle ----

    /// Open the device, apply configuration and timeouts, start the monitor.
    ///
    /// Returns once the monitor is running. On failure nothing stays open.
    /// A [`SerialPort::disconnect`] landing while this runs makes it close
    /// the new link again and fail with [`Error::Cancelled`].
    pub fn connect(&self) -> Result<()> {
        let attempt = {
            let mut life = lock(&self.lifecycle);
            if !matches!(*life, Lifecycle::Closed) {
                return Err(Error::AlreadyConnected);
            }
            let mut attempts = lock(&self.attempts);
            *attempts += 1;
            *life = Lifecycle::Connecting(*attempts);
            *attempts
        };

        let config = self.configuration();
        let timeouts = self.timeouts();
        let link = match self.open_link(&config, &timeouts) {
            Ok(link) => link,
            Err(err) => {
                let mut life = lock(&self.lifecycle);
                if matches!(*life, Lifecycle::Connecting(a) if a == attempt) {
                    *life = Lifecycle::Closed;
                }
                debug!("Connect to {} failed: {err}", config.port_name());
                return Err(err);
            },
        };

        // Same lock order as the setters: settings first, then lifecycle
        let current = lock(&self.config);
        let current_timeouts = lock(&self.timeouts);
        let mut life = lock(&self.lifecycle);
        if !matches!(*life, Lifecycle::Connecting(a) if a == attempt) {
            drop((life, current_timeouts, current));
            debug!("Connect to {} interrupted by disconnect", config.port_name());
            link.shutdown(self.grace);
            return Err(Error::Cancelled);
        }

        // Setters running while the device opened only stored their values
        let caught_up = Self::catch_up(&link, &config, &current, &timeouts, &current_timeouts);
        if let Err(err) = caught_up {
            *life = Lifecycle::Closed;
            drop((life, current_timeouts, current));
            debug!("Connect to {} failed: {err}", config.port_name());
            link.shutdown(self.grace);
            return Err(err);
        }

        debug!("Connected to {} ({})", current.port_name(), current.framing());
        *life = Lifecycle::Open(Arc::new(link));
        Ok(())
    }

    fn catch_up(
        link: &Link,
        opened: &PortConfiguration,
        config: &PortConfiguration,
        opened_timeouts: &TimeoutPolicy,
        timeouts: &TimeoutPolicy,
    ) -> Result<()> {
        if opened != config {
            debug!("Configuration changed while connecting, applying {}", config.framing());
            link.handle
                .set_configuration(&config.to_native())
                .map_err(Error::from_native)?;
        }
        if opened_timeouts != timeouts {
            link.handle
                .set_timeouts(timeouts)
                .map_err(Error::from_native)?;
        }
        Ok(())
    }

    fn open_link(&self, config: &PortConfiguration, timeouts: &TimeoutPolicy) -> Result<Link> {
        config.validate()?;
        let handle = self
            .transport
            .open(config.port_name())
            .map_err(Error::from_native)?;

        let applied = handle
            .set_configuration(&config.to_native())
            .and_then(|()| handle.set_timeouts(timeouts))
            .map_err(Error::from_native);
        if let Err(err) = applied {
            handle.close();
            return Err(err);
        }

        self.counters
            .reset();
        match EventMonitor::start(
            Arc::clone(&handle),
            Arc::clone(&self.subscribers),
            Arc::clone(&self.counters),
        ) {
            Ok(monitor) => Ok(Link { handle, monitor }),
            Err(err) => {
                handle.close();
                Err(err)
            },
        }
    }

    /// Stop the monitor and close the device. Calling it again is a no-op.
    ///
    /// Safe from any thread, including notification handlers.
    pub fn disconnect(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *lock(&self.lifecycle), Lifecycle::Closed);
        match previous {
            Lifecycle::Open(link) => {
                link.shutdown(self.grace);
                debug!(
                    "Disconnected from {}",
                    link.handle
                        .name()
                );
            },
            Lifecycle::Connecting(_) => debug!("Disconnect requested while connecting"),
            Lifecycle::Closed => trace!("Disconnect on a closed port"),
        }
        Ok(())
    }

    /// Whether the port is connected.
    pub fn is_open(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Open(_))
    }

    /// State of the event monitor, `None` when not connected.
    pub fn monitor_state(&self) -> Option<MonitorState> {
        self.link()
            .map(|link| {
                link.monitor
                    .state()
            })
    }

    fn link(&self) -> Option<Arc<Link>> {
        match &*lock(&self.lifecycle) {
            Lifecycle::Open(link) => Some(Arc::clone(link)),
            _ => None,
        }
    }

    fn handle(&self) -> Result<Arc<dyn PortHandle>> {
        self.link()
            .map(|link| Arc::clone(&link.handle))
            .ok_or(Error::NotConnected)
    }

    // ---- I/O ----

    /// Write `buf`, returning how many bytes the device accepted.
    ///
    /// Fails with [`Error::Timeout`] when the write deadline passes first.
    pub fn send(&self, buf: &[u8]) -> Result<usize> {
        let handle = self.handle()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let _gate = self
            .io_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let n = handle
            .write(buf)
            .map_err(Error::from_native)?;
        trace!("Sent {n} bytes");
        Ok(n)
    }

    /// Read into `buf`; returns 0 when the read deadline passes without data.
    pub fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let handle = self.handle()?;
        let _gate = self
            .io_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let n = handle
            .read(buf)
            .map_err(Error::from_native)?;
        trace!("Received {n} bytes");
        Ok(n)
    }

    /// Drive an output line. Setting a line to its current level is fine.
    pub fn set_line(&self, signal: LineSignal, state: bool) -> Result<()> {
        trace!("Setting {signal:?} to {state}");
        self.handle()?
            .set_line(signal, state)
            .map_err(Error::from_native)
    }

    /// Current modem pin levels.
    pub fn modem_pins(&self) -> Result<ModemPins> {
        let bits = self
            .handle()?
            .query_modem_pins()
            .map_err(Error::from_native)?;
        Ok(ModemPins::from_native(bits))
    }

    /// Fresh status snapshot. Reading it clears latched line errors.
    pub fn status(&self) -> Result<PortStatus> {
        let native = self
            .handle()?
            .query_status()
            .map_err(Error::from_native)?;
        Ok(PortStatus::from_native(&native))
    }

    /// Drop queued input, output or both.
    pub fn discard_buffers(&self, purge: Purge) -> Result<()> {
        self.handle()?
            .purge(purge)
            .map_err(Error::from_native)
    }

    /// Event counts since the last `connect`.
    pub fn counters(&self) -> CounterSnapshot {
        self.counters
            .snapshot()
    }

    // ---- configuration ----

    /// Copy of the current configuration.
    pub fn configuration(&self) -> PortConfiguration {
        lock(&self.config).clone()
    }

    /// Replace the whole configuration.
    ///
    /// When connected the new configuration is applied first and only kept
    /// if the device accepts it.
    pub fn set_configuration(&self, config: PortConfiguration) -> Result<()> {
        self.update_config(|current| {
            config.validate()?;
            *current = config;
            Ok(())
        })
    }

    fn update_config(&self, edit: impl FnOnce(&mut PortConfiguration) -> Result<()>) -> Result<()> {
        let mut config = lock(&self.config);
        let mut candidate = config.clone();
        edit(&mut candidate)?;

        if let Some(link) = self.link() {
            let _gate = self
                .io_gate
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            link.handle
                .set_configuration(&candidate.to_native())
                .map_err(Error::from_native)?;
            trace!("Applied {} to {}", candidate.framing(), link.handle.name());
        }
        *config = candidate;
        Ok(())
    }

    /// Port identifier. A change takes effect on the next `connect`.
    pub fn port_name(&self) -> String {
        lock(&self.config)
            .port_name()
            .to_string()
    }

    /// Set the port identifier.
    pub fn set_port_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.update_config(|config| config.set_port_name(name))
    }

    /// Baud rate.
    pub fn baud_rate(&self) -> u32 {
        lock(&self.config).baud_rate()
    }

    /// Set the baud rate; must be positive.
    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<()> {
        self.update_config(|config| config.set_baud_rate(baud_rate))
    }

    /// Data bits per character.
    pub fn data_bits(&self) -> u8 {
        lock(&self.config).data_bits()
    }

    /// Set the data bits per character (4 to 8).
    pub fn set_data_bits(&self, bits: u8) -> Result<()> {
        self.update_config(|config| config.set_data_bits(bits))
    }

    /// XON character.
    pub fn xon_char(&self) -> u8 {
        lock(&self.config).xon_char()
    }

    /// Set the XON character; must differ from XOFF.
    pub fn set_xon_char(&self, value: u8) -> Result<()> {
        self.update_config(|config| config.set_xon_char(value))
    }

    /// XOFF character.
    pub fn xoff_char(&self) -> u8 {
        lock(&self.config).xoff_char()
    }

    /// Set the XOFF character; must differ from XON.
    pub fn set_xoff_char(&self, value: u8) -> Result<()> {
        self.update_config(|config| config.set_xoff_char(value))
    }

    /// Flow-control preset matching the configuration, if any.
    pub fn flow_control(&self) -> Option<FlowControl> {
        lock(&self.config).flow_control()
    }

    /// Apply a flow-control preset.
    pub fn set_flow_control(&self, flow: FlowControl) -> Result<()> {
        self.update_config(|config| {
            config.set_flow_control(flow);
            Ok(())
        })
    }

    config_property! {
        /// Parity mode.
        parity, set_parity: Parity;
        /// Stop bits.
        stop_bits, set_stop_bits: StopBits;
        /// DTR pin mode.
        dtr_control, set_dtr_control: DtrControl;
        /// RTS pin mode.
        rts_control, set_rts_control: RtsControl;
        /// Whether transmission waits for CTS.
        cts_flow, set_cts_flow: bool;
        /// Whether transmission waits for DSR.
        dsr_flow, set_dsr_flow: bool;
        /// Whether input is ignored while DSR is low.
        dsr_sensitivity, set_dsr_sensitivity: bool;
        /// Whether received XON/XOFF gate transmission.
        xon_xoff_tx, set_xon_xoff_tx: bool;
        /// Whether XON/XOFF are sent to gate reception.
        xon_xoff_rx, set_xon_xoff_rx: bool;
        /// Whether transmission continues after sending XOFF.
        tx_continue_on_xoff, set_tx_continue_on_xoff: bool;
        /// Whether received null bytes are dropped.
        discard_null, set_discard_null: bool;
        /// Whether bytes with parity errors are replaced by the error character.
        replace_parity_errors, set_replace_parity_errors: bool;
        /// Whether I/O is aborted on an error.
        abort_on_error, set_abort_on_error: bool;
        /// Parity-error replacement character.
        error_char, set_error_char: u8;
        /// End-of-data character.
        eof_char, set_eof_char: u8;
        /// Character that raises the receive-flag event.
        event_char, set_event_char: u8;
        /// Receive-buffer level at which XON is sent.
        xon_limit, set_xon_limit: u16;
        /// Free receive-buffer space at which XOFF is sent.
        xoff_limit, set_xoff_limit: u16;
    }

    // ---- timeouts ----

    /// Current timeouts.
    pub fn timeouts(&self) -> TimeoutPolicy {
        *lock(&self.timeouts)
    }

    /// Replace the timeouts, applying them immediately when connected.
    pub fn set_timeouts(&self, timeouts: TimeoutPolicy) -> Result<()> {
        let mut current = lock(&self.timeouts);
        if let Some(link) = self.link() {
            let _gate = self
                .io_gate
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            link.handle
                .set_timeouts(&timeouts)
                .map_err(Error::from_native)?;
        }
        *current = timeouts;
        Ok(())
    }

    timeout_property! {
        /// Longest gap between received bytes, in milliseconds.
        read_interval, set_read_interval;
        /// Per-byte part of the read deadline, in milliseconds.
        read_total_multiplier, set_read_total_multiplier;
        /// Constant part of the read deadline, in milliseconds.
        read_total_constant, set_read_total_constant;
        /// Per-byte part of the write deadline, in milliseconds.
        write_total_multiplier, set_write_total_multiplier;
        /// Constant part of the write deadline, in milliseconds.
        write_total_constant, set_write_total_constant;
    }

    // ---- notifications ----

    /// Call `handler` with every chunk of received data.
    pub fn on_data_received(&self, handler: impl Fn(&[u8]) + Send + Sync + 'static) {
        self.subscribers
            .on_data_received(handler);
    }

    /// Call `handler` for every frame, overrun or parity error.
    pub fn on_error(&self, handler: impl Fn(LineError) + Send + Sync + 'static) {
        self.subscribers
            .on_error(handler);
    }

    /// Call `handler` with the pin and its new level on every modem pin change.
    pub fn on_pin_changed(&self, handler: impl Fn(ModemPin, bool) + Send + Sync + 'static) {
        self.subscribers
            .on_pin_changed(handler);
    }

    /// Call `handler` on every break condition.
    pub fn on_break(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.subscribers
            .on_break(handler);
    }

    /// Call `handler` whenever the output queue runs empty.
    pub fn on_transmit_empty(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.subscribers
            .on_transmit_empty(handler);
    }

    /// Call `handler` with the reason when the device is lost.
    pub fn on_disconnected(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.subscribers
            .on_disconnected(handler);
    }

    /// Receive every notification through a channel.
    ///
    /// Data subscriptions made while connected take effect from the next
    /// monitor cycle.
    pub fn subscribe(&self) -> Receiver<Notification> {
        self.subscribers
            .subscribe()
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        let _ = self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn loopback() -> (LoopbackTransport, SerialPort) {
        let transport = LoopbackTransport::new().with_port("T0");
        let port = SerialPort::new(
            Arc::new(transport.clone()),
            PortConfiguration::new("T0", 115_200),
        );
        (transport, port)
    }

    #[test]
    fn test_operations_need_connection() {
        let (_transport, port) = loopback();
        assert!(matches!(port.send(b"x"), Err(Error::NotConnected)));
        let mut buf = [0u8; 1];
        assert!(matches!(port.receive(&mut buf), Err(Error::NotConnected)));
        assert!(matches!(port.status(), Err(Error::NotConnected)));
        assert!(matches!(port.modem_pins(), Err(Error::NotConnected)));
        assert!(matches!(
            port.set_line(LineSignal::Rts, true),
            Err(Error::NotConnected)
        ));
        assert!(port
            .monitor_state()
            .is_none());
    }

    #[test]
    fn test_connect_twice_fails() {
        let (_transport, port) = loopback();
        port.connect()
            .unwrap();
        assert!(matches!(port.connect(), Err(Error::AlreadyConnected)));
        port.disconnect()
            .unwrap();
    }

    #[test]
    fn test_setters_store_while_closed() {
        let (transport, port) = loopback();
        port.set_baud_rate(57_600)
            .unwrap();
        port.set_parity(Parity::Even)
            .unwrap();
        assert!(port
            .set_data_bits(9)
            .is_err());
        assert_eq!(port.data_bits(), 8);
        assert!(transport
            .controller("T0")
            .unwrap()
            .configuration()
            .is_none());

        port.connect()
            .unwrap();
        let dcb = transport
            .controller("T0")
            .unwrap()
            .configuration()
            .unwrap();
        assert_eq!(dcb.baud_rate, 57_600);
        assert_eq!(dcb.parity, 2);
    }

    #[test]
    fn test_rejected_setting_keeps_previous_value() {
        let (transport, port) = loopback();
        port.connect()
            .unwrap();

        // 5 data bits with 2 stop bits is refused by the device
        port.set_stop_bits(StopBits::Two)
            .unwrap();
        let err = port
            .set_data_bits(5)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidConfiguration(_)));
        assert_eq!(port.data_bits(), 8);
        assert_eq!(
            transport
                .controller("T0")
                .unwrap()
                .configuration()
                .unwrap()
                .byte_size,
            8
        );
    }

    #[test]
    fn test_timeouts_apply_when_connected() {
        let (transport, port) = loopback();
        port.connect()
            .unwrap();
        port.set_read_total_constant(40)
            .unwrap();
        assert_eq!(port.read_total_constant(), 40);
        assert_eq!(
            transport
                .controller("T0")
                .unwrap()
                .timeouts()
                .read_total_constant,
            40
        );
    }

    #[test]
    fn test_lines_and_purge() {
        let (transport, port) = loopback();
        port.connect()
            .unwrap();
        let ctl = transport
            .controller("T0")
            .unwrap();

        port.set_line(LineSignal::Rts, false)
            .unwrap();
        port.set_line(LineSignal::Rts, false)
            .unwrap();
        assert!(!ctl
            .lines()
            .rts);

        ctl.inject(b"stale");
        port.discard_buffers(Purge::Input)
            .unwrap();
        assert_eq!(ctl.pending_input(), 0);
    }

    #[test]
    fn test_drop_closes_device() {
        let (transport, port) = loopback();
        port.connect()
            .unwrap();
        let ctl = transport
            .controller("T0")
            .unwrap();
        assert!(ctl.is_open());
        drop(port);
        assert!(!ctl.is_open());
    }

    #[test]
    fn test_enumerate_ports() {
        let transport = LoopbackTransport::new()
            .with_port("A")
            .with_port("B");
        let ports = SerialPort::enumerate_ports(&transport).unwrap();
        let names: Vec<_> = ports
            .iter()
            .map(|p| p.identifier.as_str())
            .collect();
        assert_eq!(names, ["A", "B"]);
    }
}
