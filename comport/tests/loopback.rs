//! End-to-end behaviour of `SerialPort` against the loopback transport.

use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use comport::dcb::{DcbFlags, RTS_HANDSHAKE};
use comport::status::LineErrors;
use comport::transport::loopback::standard_framing;
use comport::{
    Error, LineError, LineSignal, LoopbackTransport, ModemPin, ModemPins, Notification, Parity,
    PortConfiguration, SerialPort, StopBits, TimeoutPolicy,
};

const RECV: Duration = Duration::from_secs(2);

fn init_logger() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

fn loopback(name: &str) -> (LoopbackTransport, SerialPort) {
    init_logger();
    let transport = LoopbackTransport::new().with_port(name);
    let port = SerialPort::new(
        Arc::new(transport.clone()),
        PortConfiguration::new(name, 115_200),
    );
    (transport, port)
}

/// Next notification that is not a transmit-empty report.
fn next_event(rx: &Receiver<Notification>) -> Notification {
    loop {
        match rx
            .recv_timeout(RECV)
            .expect("notification")
        {
            Notification::TransmitQueueEmpty => {},
            other => return other,
        }
    }
}

#[test]
fn test_supported_framings_connect() {
    let (transport, port) = loopback("COM1");
    let ctl = transport
        .controller("COM1")
        .unwrap();

    for data_bits in 5..=8 {
        for parity in [
            Parity::None,
            Parity::Odd,
            Parity::Even,
            Parity::Mark,
            Parity::Space,
        ] {
            for stop_bits in [StopBits::One, StopBits::OnePointFive, StopBits::Two] {
                let mut config = PortConfiguration::new("COM1", 9600);
                config
                    .set_data_bits(data_bits)
                    .unwrap();
                config.set_parity(parity);
                config.set_stop_bits(stop_bits);
                let supported = standard_framing(&config.to_native()).is_ok();

                port.set_configuration(config)
                    .unwrap();
                let result = port.connect();
                if supported {
                    result.unwrap();
                    port.status()
                        .unwrap();
                    assert_eq!(
                        ctl.configuration()
                            .unwrap()
                            .byte_size,
                        data_bits
                    );
                } else {
                    assert!(
                        matches!(result, Err(Error::InvalidConfiguration(_))),
                        "{data_bits} {parity:?} {stop_bits:?}: {result:?}"
                    );
                    assert!(!port.is_open());
                    assert!(!ctl.is_open());
                }
                port.disconnect()
                    .unwrap();
            }
        }
    }
}

#[test]
fn test_disconnect_is_idempotent() {
    let (transport, port) = loopback("COM2");
    port.connect()
        .unwrap();
    port.disconnect()
        .unwrap();
    port.disconnect()
        .unwrap();
    assert!(!port.is_open());
    assert!(!transport
        .controller("COM2")
        .unwrap()
        .is_open());

    port.connect()
        .unwrap();
    assert!(port.is_open());
    port.disconnect()
        .unwrap();
}

#[test]
fn test_round_trip_256_bytes() {
    let (_transport, port) = loopback("COM3");
    let rx = port.subscribe();
    port.connect()
        .unwrap();

    let payload: Vec<u8> = (0..=255).collect();
    assert_eq!(port.send(&payload).unwrap(), 256);

    let mut received = Vec::new();
    while received.len() < payload.len() {
        match next_event(&rx) {
            Notification::DataReceived(chunk) => received.extend(chunk),
            other => panic!("unexpected notification: {other:?}"),
        }
    }
    assert_eq!(received, payload);
    port.disconnect()
        .unwrap();
}

#[test]
fn test_errors_precede_data() {
    let (transport, port) = loopback("COM4");
    let rx = port.subscribe();
    port.connect()
        .unwrap();

    transport
        .controller("COM4")
        .unwrap()
        .inject_with_errors(b"xyz", LineErrors::OVERRUN);

    assert_eq!(
        next_event(&rx),
        Notification::ErrorOccurred(LineError::Overrun)
    );
    assert_eq!(next_event(&rx), Notification::DataReceived(b"xyz".to_vec()));
    assert_eq!(port.counters().overrun, 1);
    port.disconnect()
        .unwrap();
}

#[test]
fn test_receive_timeout_returns_zero() {
    let (_transport, port) = loopback("COM5");
    let port = port.with_timeouts(TimeoutPolicy::constant(100, 0));
    port.connect()
        .unwrap();

    let mut buf = [0u8; 16];
    let started = Instant::now();
    assert_eq!(port.receive(&mut buf).unwrap(), 0);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(90), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(1), "{elapsed:?}");
    port.disconnect()
        .unwrap();
}

#[test]
fn test_connect_to_missing_port() {
    let (_transport, port) = loopback("COM6");
    port.set_port_name("COM99")
        .unwrap();
    assert!(matches!(port.connect(), Err(Error::PortNotFound(_))));
    assert!(!port.is_open());
}

#[test]
fn test_connect_to_busy_port() {
    let (transport, first) = loopback("COM7");
    let second = SerialPort::new(
        Arc::new(transport.clone()),
        PortConfiguration::new("COM7", 9600),
    );
    first
        .connect()
        .unwrap();
    assert!(matches!(second.connect(), Err(Error::AccessDenied(_))));
    assert!(!second.is_open());
}

#[test]
fn test_disconnect_during_connect() {
    init_logger();
    let transport = LoopbackTransport::new()
        .with_port("COM8")
        .with_open_delay(Duration::from_millis(200));
    let ctl = transport
        .controller("COM8")
        .unwrap();
    let port = Arc::new(SerialPort::new(
        Arc::new(transport),
        PortConfiguration::new("COM8", 9600),
    ));

    let (done_tx, done_rx) = mpsc::channel();
    let connecting = {
        let port = Arc::clone(&port);
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            let result = port.connect();
            done_tx
                .send("connect")
                .unwrap();
            result
        })
    };
    thread::sleep(Duration::from_millis(50));
    let disconnecting = {
        let port = Arc::clone(&port);
        thread::spawn(move || {
            let result = port.disconnect();
            done_tx
                .send("disconnect")
                .unwrap();
            result
        })
    };

    // Both calls finish well before any deadlock could be mistaken for slowness
    for _ in 0..2 {
        done_rx
            .recv_timeout(Duration::from_secs(5))
            .unwrap();
    }
    assert!(matches!(connecting.join().unwrap(), Err(Error::Cancelled)));
    disconnecting
        .join()
        .unwrap()
        .unwrap();
    assert!(!port.is_open());
    assert!(!ctl.is_open());
}

#[test]
fn test_disconnect_from_handler() {
    let (transport, port) = loopback("COM9");
    let port = Arc::new(port);
    let weak: Weak<SerialPort> = Arc::downgrade(&port);
    let (done_tx, done_rx) = mpsc::channel();
    port.on_break(move || {
        if let Some(port) = weak.upgrade() {
            port.disconnect()
                .unwrap();
            let _ = done_tx.send(());
        }
    });
    port.connect()
        .unwrap();

    transport
        .controller("COM9")
        .unwrap()
        .send_break();
    done_rx
        .recv_timeout(RECV)
        .unwrap();
    assert!(!port.is_open());
    assert!(!transport
        .controller("COM9")
        .unwrap()
        .is_open());
}

#[test]
fn test_unplugged_device_notifies_disconnect() {
    let (transport, port) = loopback("COM10");
    let (tx, rx) = mpsc::channel();
    port.on_disconnected(move |reason| {
        let _ = tx.send(reason.to_string());
    });
    port.connect()
        .unwrap();

    transport
        .controller("COM10")
        .unwrap()
        .unplug();
    let reason = rx
        .recv_timeout(RECV)
        .unwrap();
    assert!(!reason.is_empty());
    assert!(matches!(port.send(b"x"), Err(Error::InvalidHandle(_))));
    port.disconnect()
        .unwrap();
}

#[test]
fn test_pin_changes_and_snapshot() {
    let (transport, port) = loopback("COM11");
    let (tx, rx) = mpsc::channel();
    port.on_pin_changed(move |pin, state| {
        let _ = tx.send((pin, state));
    });
    port.connect()
        .unwrap();

    let pins = ModemPins {
        dsr: true,
        rlsd: true,
        ..Default::default()
    };
    transport
        .controller("COM11")
        .unwrap()
        .set_pins(pins);

    assert_eq!(rx.recv_timeout(RECV).unwrap(), (ModemPin::Dsr, true));
    assert_eq!(rx.recv_timeout(RECV).unwrap(), (ModemPin::Rlsd, true));
    assert_eq!(port.modem_pins().unwrap(), pins);
    port.disconnect()
        .unwrap();
}

#[test]
fn test_status_reports_queued_input() {
    let (transport, port) = loopback("COM12");
    port.connect()
        .unwrap();
    transport
        .controller("COM12")
        .unwrap()
        .inject(b"abc");

    let status = port
        .status()
        .unwrap();
    assert_eq!(status.in_queue, 3);
    assert!(!status.has_errors());
    port.disconnect()
        .unwrap();
}

#[test]
fn test_send_times_out_while_held() {
    let (_transport, port) = loopback("COM13");
    let port = port.with_timeouts(TimeoutPolicy::constant(0, 50));
    port.connect()
        .unwrap();

    port.set_line(LineSignal::Xoff, true)
        .unwrap();
    assert!(port
        .status()
        .unwrap()
        .xoff_hold);
    assert!(matches!(port.send(b"held"), Err(Error::Timeout(_))));

    port.set_line(LineSignal::Xoff, false)
        .unwrap();
    assert_eq!(port.send(b"free").unwrap(), 4);
    port.disconnect()
        .unwrap();
}

#[test]
fn test_counters_reset_on_connect() {
    let (transport, port) = loopback("COM14");
    let rx = port.subscribe();
    port.connect()
        .unwrap();
    transport
        .controller("COM14")
        .unwrap()
        .send_break();
    assert_eq!(next_event(&rx), Notification::BreakDetected);
    assert_eq!(port.counters().breaks, 1);

    port.disconnect()
        .unwrap();
    port.connect()
        .unwrap();
    assert_eq!(port.counters().breaks, 0);
    port.disconnect()
        .unwrap();
}

#[test]
fn test_live_reconfiguration() {
    let (transport, port) = loopback("COM15");
    port.connect()
        .unwrap();
    port.set_baud_rate(230_400)
        .unwrap();
    port.set_flow_control(comport::FlowControl::Hardware)
        .unwrap();

    let dcb = transport
        .controller("COM15")
        .unwrap()
        .configuration()
        .unwrap();
    assert_eq!(dcb.baud_rate, 230_400);
    assert!(dcb
        .flags
        .contains(DcbFlags::OUTX_CTS_FLOW));
    assert_eq!(dcb.rts_control, RTS_HANDSHAKE);
    port.disconnect()
        .unwrap();
}

#[test]
fn test_settings_changed_while_connecting() {
    init_logger();
    let transport = LoopbackTransport::new()
        .with_port("COM16")
        .with_open_delay(Duration::from_millis(200));
    let ctl = transport
        .controller("COM16")
        .unwrap();
    let port = Arc::new(SerialPort::new(
        Arc::new(transport),
        PortConfiguration::new("COM16", 9600),
    ));

    let connecting = {
        let port = Arc::clone(&port);
        thread::spawn(move || port.connect())
    };
    thread::sleep(Duration::from_millis(50));
    port.set_baud_rate(57_600)
        .unwrap();
    port.set_read_total_constant(40)
        .unwrap();
    connecting
        .join()
        .unwrap()
        .unwrap();

    assert_eq!(port.baud_rate(), 57_600);
    assert_eq!(
        ctl.configuration()
            .unwrap()
            .baud_rate,
        port.baud_rate()
    );
    assert_eq!(
        ctl.timeouts()
            .read_total_constant,
        40
    );
    port.disconnect()
        .unwrap();
}

#[test]
fn test_disconnect_honours_grace_period() {
    let (transport, port) = loopback("COM17");
    let port = port.with_grace_period(Duration::from_millis(100));
    let (busy_tx, busy_rx) = mpsc::channel();
    port.on_break(move || {
        let _ = busy_tx.send(());
        thread::sleep(Duration::from_millis(1500));
    });
    port.connect()
        .unwrap();

    transport
        .controller("COM17")
        .unwrap()
        .send_break();
    busy_rx
        .recv_timeout(RECV)
        .unwrap();

    let started = Instant::now();
    port.disconnect()
        .unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(800), "{elapsed:?}");
    assert!(!port.is_open());
}
