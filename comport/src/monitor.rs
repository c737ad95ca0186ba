//! Background event monitor.
//!
//! One monitor thread runs per open port. It blocks in
//! [`PortHandle::wait_for_event`] and turns every fired event into
//! [`Notification`]s, always in this order within a cycle:
//!
//! 1. line errors (frame, overrun, parity)
//! 2. received data, drained until the queue is empty
//! 3. transmit queue empty
//! 4. break
//! 5. modem pins (CTS, DSR, RLSD, RING)
//!
//! Transient wait failures are logged and the loop resumes. A handle that
//! became invalid stops the monitor after a [`Notification::Disconnected`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use crate::error::{Error, Result};
use crate::notify::{Notification, Subscribers};
use crate::status::{EventMask, ModemPin, ModemPins, PortStatus};
use crate::transport::PortHandle;

/// Size of the buffer the monitor drains received data into.
pub const SCRATCH_LEN: usize = 4096;

/// How long `start` waits for the monitor thread to enter its loop.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time `cancel` waits for the monitor thread to exit.
pub const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Pause before waiting again after a transient failure.
const RETRY_PAUSE: Duration = Duration::from_millis(10);

/// Interval at which `cancel` repeats the transport cancel while waiting.
const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Lifecycle of a monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Thread spawned, loop not entered yet.
    Idle,
    /// Blocked waiting for events.
    Waiting,
    /// Turning fired events into notifications.
    Dispatching,
    /// Cancellation requested, loop not exited yet.
    Cancelling,
    /// Loop exited.
    Stopped,
}

/// Cumulative event counts of a connection.
#[derive(Debug, Default)]
pub struct EventCounters {
    frame: AtomicU64,
    overrun: AtomicU64,
    parity: AtomicU64,
    breaks: AtomicU64,
    rings: AtomicU64,
}

/// Point-in-time copy of [`EventCounters`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CounterSnapshot {
    /// Framing errors.
    pub frame: u64,
    /// Overruns.
    pub overrun: u64,
    /// Parity errors.
    pub parity: u64,
    /// Break conditions.
    pub breaks: u64,
    /// Ring indications.
    pub rings: u64,
}

impl EventCounters {
    /// Read every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            frame: self
                .frame
                .load(Ordering::Relaxed),
            overrun: self
                .overrun
                .load(Ordering::Relaxed),
            parity: self
                .parity
                .load(Ordering::Relaxed),
            breaks: self
                .breaks
                .load(Ordering::Relaxed),
            rings: self
                .rings
                .load(Ordering::Relaxed),
        }
    }

    /// Set every counter back to zero.
    pub fn reset(&self) {
        for counter in [
            &self.frame,
            &self.overrun,
            &self.parity,
            &self.breaks,
            &self.rings,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    fn record_error(&self, error: crate::status::LineError) {
        use crate::status::LineError;
        let counter = match error {
            LineError::Frame => &self.frame,
            LineError::Overrun => &self.overrun,
            LineError::Parity => &self.parity,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct Control {
    cancel: AtomicBool,
    state: Mutex<MonitorState>,
    exited: Condvar,
}

impl Control {
    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: MonitorState) {
        let mut state = self.state();
        // Stopped is final; Cancelling is sticky until the loop exits
        match *state {
            MonitorState::Stopped => return,
            MonitorState::Cancelling if next != MonitorState::Stopped => return,
            _ => {},
        }
        *state = next;
        drop(state);
        if next == MonitorState::Stopped {
            self.exited
                .notify_all();
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .load(Ordering::SeqCst)
    }
}

/// Handle to a running monitor thread.
pub struct EventMonitor {
    handle: Arc<dyn PortHandle>,
    control: Arc<Control>,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl EventMonitor {
    /// Spawn the monitor for `handle` and wait until it is running.
    ///
    /// Fails with [`Error::Timeout`] if the thread does not report within
    /// [`STARTUP_TIMEOUT`].
    pub fn start(
        handle: Arc<dyn PortHandle>,
        subscribers: Arc<Subscribers>,
        counters: Arc<EventCounters>,
    ) -> Result<Self> {
        let control = Arc::new(Control {
            cancel: AtomicBool::new(false),
            state: Mutex::new(MonitorState::Idle),
            exited: Condvar::new(),
        });
        let worker = Worker {
            handle: Arc::clone(&handle),
            control: Arc::clone(&control),
            subscribers,
            counters,
            scratch: vec![0; SCRATCH_LEN],
        };

        let (ready_tx, ready_rx) = mpsc::sync_channel(1);
        let thread = thread::Builder::new()
            .name(format!("comport-monitor {}", handle.name()))
            .spawn(move || worker.run(&ready_tx))
            .map_err(Error::from_native)?;
        let thread_id = thread
            .thread()
            .id();

        let monitor = Self {
            handle,
            control,
            thread: Mutex::new(Some(thread)),
            thread_id,
        };
        match ready_rx.recv_timeout(STARTUP_TIMEOUT) {
            Ok(()) => {
                debug!("Event monitor running for {}", monitor.handle.name());
                Ok(monitor)
            },
            Err(_) => {
                monitor.cancel(GRACE_PERIOD);
                Err(Error::Timeout(
                    "event monitor did not start in time".to_string(),
                ))
            },
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MonitorState {
        *self
            .control
            .state()
    }

    /// Whether the loop is still running.
    pub fn is_running(&self) -> bool {
        !matches!(self.state(), MonitorState::Stopped)
    }

    /// Stop the monitor, waiting up to `grace` for it to exit.
    ///
    /// Returns `false` when the grace period elapsed first; the thread is
    /// then left to finish on its own. Called from the monitor thread itself
    /// (from a notification handler) it only requests the stop and returns
    /// `true`.
    pub fn cancel(&self, grace: Duration) -> bool {
        self.control
            .cancel
            .store(true, Ordering::SeqCst);
        self.control
            .set_state(MonitorState::Cancelling);
        self.handle
            .cancel();

        if thread::current().id() == self.thread_id {
            trace!("Monitor cancelled from its own thread");
            return true;
        }

        let deadline = Instant::now() + grace;
        let mut state = self
            .control
            .state();
        while *state != MonitorState::Stopped {
            let now = Instant::now();
            if now >= deadline {
                drop(state);
                warn!(
                    "Event monitor for {} did not stop within {grace:?}",
                    self.handle
                        .name()
                );
                return false;
            }
            state = self
                .control
                .exited
                .wait_timeout(state, CANCEL_POLL.min(deadline - now))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
            // The loop may have entered a new wait after the first cancel
            self.handle
                .cancel();
        }
        drop(state);

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread
                .join()
                .is_err()
            {
                warn!("Event monitor thread panicked");
            }
        }
        true
    }
}

impl Drop for EventMonitor {
    fn drop(&mut self) {
        // After an explicit cancel the owner already spent its grace period;
        // a thread still running then finishes detached
        if self
            .control
            .cancelled()
        {
            return;
        }
        if self.is_running() {
            self.cancel(GRACE_PERIOD);
        }
    }
}

struct Worker {
    handle: Arc<dyn PortHandle>,
    control: Arc<Control>,
    subscribers: Arc<Subscribers>,
    counters: Arc<EventCounters>,
    scratch: Vec<u8>,
}

impl Worker {
    fn run(mut self, ready: &mpsc::SyncSender<()>) {
        self.control
            .set_state(MonitorState::Waiting);
        // `start` may have given up already; the loop then sees the cancel flag
        let _ = ready.send(());

        while !self
            .control
            .cancelled()
        {
            let mask = if self
                .subscribers
                .has_data_consumer()
            {
                EventMask::all()
            } else {
                EventMask::all().difference(EventMask::DATA)
            };

            self.control
                .set_state(MonitorState::Waiting);
            let outcome = self
                .handle
                .wait_for_event(mask)
                .map_err(Error::from_native)
                .and_then(|fired| {
                    if self
                        .control
                        .cancelled()
                    {
                        return Ok(());
                    }
                    self.control
                        .set_state(MonitorState::Dispatching);
                    self.dispatch(fired)
                });

            if let Err(err) = outcome {
                if self
                    .control
                    .cancelled()
                {
                    break;
                }
                if err.is_fatal() {
                    error!(
                        "Event monitor for {} stopped: {err}",
                        self.handle
                            .name()
                    );
                    self.subscribers
                        .dispatch(&Notification::Disconnected {
                            reason: err.to_string(),
                        });
                    break;
                }
                warn!(
                    "Event monitor for {} recovered from: {err}",
                    self.handle
                        .name()
                );
                thread::sleep(RETRY_PAUSE);
            }
        }

        self.control
            .set_state(MonitorState::Stopped);
        debug!(
            "Event monitor for {} exited",
            self.handle
                .name()
        );
    }

    fn emit(&self, notification: &Notification) {
        trace!("{}: {notification:?}", self.handle.name());
        self.subscribers
            .dispatch(notification);
    }

    fn dispatch(&mut self, fired: EventMask) -> Result<()> {
        if fired.contains(EventMask::ERR) {
            let status = PortStatus::from_native(&self.handle.query_status()?);
            for error in status.line_errors() {
                self.counters
                    .record_error(error);
                self.emit(&Notification::ErrorOccurred(error));
            }
        }

        if fired.intersects(EventMask::DATA)
            && self
                .subscribers
                .has_data_consumer()
        {
            self.drain()?;
        }

        if fired.contains(EventMask::TX_EMPTY) {
            self.emit(&Notification::TransmitQueueEmpty);
        }

        if fired.contains(EventMask::BREAK) {
            self.counters
                .breaks
                .fetch_add(1, Ordering::Relaxed);
            self.emit(&Notification::BreakDetected);
        }

        if fired.intersects(EventMask::MODEM) {
            let pins = ModemPins::from_native(self.handle.query_modem_pins()?);
            for pin in ModemPin::ALL {
                if !fired.contains(pin.event()) {
                    continue;
                }
                if pin == ModemPin::Ring {
                    self.counters
                        .rings
                        .fetch_add(1, Ordering::Relaxed);
                }
                self.emit(&Notification::PinChanged {
                    pin,
                    state: pins.get(pin),
                });
            }
        }
        Ok(())
    }

    /// Read until the input queue is empty, one notification per read.
    fn drain(&mut self) -> Result<()> {
        while !self
            .control
            .cancelled()
        {
            let n = self
                .handle
                .read_available(&mut self.scratch)?;
            if n == 0 {
                break;
            }
            let data = self.scratch[..n].to_vec();
            self.emit(&Notification::DataReceived(data));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{LineError, LineErrors};
    use crate::transport::{LoopbackTransport, Transport};
    use std::io;
    use std::sync::mpsc::Receiver;

    const RECV: Duration = Duration::from_secs(2);

    fn setup() -> (LoopbackTransport, Arc<dyn PortHandle>) {
        let transport = LoopbackTransport::new().with_port("M0");
        let handle = transport
            .open("M0")
            .unwrap();
        (transport, handle)
    }

    fn start(
        handle: &Arc<dyn PortHandle>,
    ) -> (EventMonitor, Receiver<Notification>, Arc<EventCounters>) {
        let subs = Arc::new(Subscribers::default());
        let rx = subs.subscribe();
        let counters = Arc::new(EventCounters::default());
        let monitor =
            EventMonitor::start(Arc::clone(handle), subs, Arc::clone(&counters)).unwrap();
        (monitor, rx, counters)
    }

    #[test]
    fn test_start_enters_loop() {
        let (_transport, handle) = setup();
        let (monitor, _rx, _) = start(&handle);
        assert!(monitor.is_running());
        assert!(monitor.cancel(GRACE_PERIOD));
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[test]
    fn test_errors_are_dispatched_before_data() {
        let (transport, handle) = setup();
        let (monitor, rx, counters) = start(&handle);
        let ctl = transport
            .controller("M0")
            .unwrap();

        ctl.inject_with_errors(b"abc", LineErrors::FRAME | LineErrors::RX_PARITY);

        assert_eq!(
            rx.recv_timeout(RECV).unwrap(),
            Notification::ErrorOccurred(LineError::Frame)
        );
        assert_eq!(
            rx.recv_timeout(RECV).unwrap(),
            Notification::ErrorOccurred(LineError::Parity)
        );
        assert_eq!(
            rx.recv_timeout(RECV).unwrap(),
            Notification::DataReceived(b"abc".to_vec())
        );
        let counts = counters.snapshot();
        assert_eq!(counts.frame, 1);
        assert_eq!(counts.parity, 1);
        assert_eq!(counts.overrun, 0);
        monitor.cancel(GRACE_PERIOD);
    }

    #[test]
    fn test_pin_changes_report_current_state() {
        let (transport, handle) = setup();
        let (monitor, rx, counters) = start(&handle);
        let ctl = transport
            .controller("M0")
            .unwrap();

        ctl.set_pins(ModemPins {
            cts: true,
            ring: true,
            ..Default::default()
        });

        assert_eq!(
            rx.recv_timeout(RECV).unwrap(),
            Notification::PinChanged {
                pin: ModemPin::Cts,
                state: true
            }
        );
        assert_eq!(
            rx.recv_timeout(RECV).unwrap(),
            Notification::PinChanged {
                pin: ModemPin::Ring,
                state: true
            }
        );
        assert_eq!(counters.snapshot().rings, 1);
        monitor.cancel(GRACE_PERIOD);
    }

    #[test]
    fn test_survives_transient_wait_failure() {
        let (transport, handle) = setup();
        let (monitor, rx, _) = start(&handle);
        let ctl = transport
            .controller("M0")
            .unwrap();

        ctl.fail_next_wait(io::ErrorKind::Other);
        ctl.send_break();
        assert_eq!(
            rx.recv_timeout(RECV).unwrap(),
            Notification::BreakDetected
        );
        assert!(monitor.is_running());
        monitor.cancel(GRACE_PERIOD);
    }

    #[test]
    fn test_invalid_handle_stops_monitor() {
        let (transport, handle) = setup();
        let (monitor, rx, _) = start(&handle);
        transport
            .controller("M0")
            .unwrap()
            .unplug();

        match rx
            .recv_timeout(RECV)
            .unwrap()
        {
            Notification::Disconnected { reason } => assert!(!reason.is_empty()),
            other => panic!("unexpected notification: {other:?}"),
        }
        let deadline = Instant::now() + RECV;
        while monitor.is_running() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(monitor.state(), MonitorState::Stopped);
    }

    #[test]
    fn test_data_left_queued_without_consumer() {
        let (transport, handle) = setup();
        let subs = Arc::new(Subscribers::default());
        let (break_tx, break_rx) = mpsc::channel();
        subs.on_break(move || {
            let _ = break_tx.send(());
        });
        let monitor = EventMonitor::start(
            Arc::clone(&handle),
            subs,
            Arc::new(EventCounters::default()),
        )
        .unwrap();
        let ctl = transport
            .controller("M0")
            .unwrap();

        ctl.inject(b"queued");
        ctl.send_break();
        break_rx
            .recv_timeout(RECV)
            .unwrap();
        assert_eq!(ctl.pending_input(), 6);
        monitor.cancel(GRACE_PERIOD);
    }

    #[test]
    fn test_drop_after_cancel_does_not_wait_again() {
        let (transport, handle) = setup();
        let subs = Arc::new(Subscribers::default());
        let (entered_tx, entered_rx) = mpsc::channel();
        subs.on_break(move || {
            let _ = entered_tx.send(());
            thread::sleep(Duration::from_millis(1500));
        });
        let monitor = EventMonitor::start(
            Arc::clone(&handle),
            subs,
            Arc::new(EventCounters::default()),
        )
        .unwrap();
        transport
            .controller("M0")
            .unwrap()
            .send_break();
        entered_rx
            .recv_timeout(RECV)
            .unwrap();

        let started = Instant::now();
        assert!(!monitor.cancel(Duration::from_millis(50)));
        drop(monitor);
        let elapsed = started.elapsed();
        assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
    }

    #[test]
    fn test_counters_reset() {
        let counters = EventCounters::default();
        counters.record_error(LineError::Overrun);
        counters
            .breaks
            .fetch_add(2, Ordering::Relaxed);
        assert_eq!(counters.snapshot().overrun, 1);
        assert_eq!(counters.snapshot().breaks, 2);
        counters.reset();
        assert_eq!(counters.snapshot(), CounterSnapshot::default());
    }
}
