//! Interactive terminal command implementation.
//!
//! Received data arrives through the port's data notifications; the main
//! thread reads the keyboard in raw mode and writes to the port.

use anyhow::{Context, Result};
use comport::{LineSignal, SerialPort};
use console::style;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use log::debug;
use std::fs::{File, OpenOptions};
use std::io::{self, IsTerminal, Write as _};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::text::TerminalText;
use crate::{
    Cli, CliError, clear_interrupted_flag, connect_port, prepare_port, use_fancy_output,
    was_interrupted,
};

const KEY_POLL: Duration = Duration::from_millis(50);
const BREAK_LENGTH: Duration = Duration::from_millis(250);

/// Shared output side of the terminal.
///
/// Status lines and device output go through the same lock so a status line
/// never lands in the middle of a device line. In TTY mode everything goes
/// to stderr; otherwise device output goes to stdout and status to stderr.
struct Screen {
    text: Mutex<TerminalText>,
    tty_mode: bool,
    show_timestamp: AtomicBool,
    log: Option<Mutex<File>>,
}

impl Screen {
    fn write_output(&self, output: &str) {
        if self.tty_mode {
            eprint!("{output}");
            io::stderr().flush().ok();
        } else {
            print!("{output}");
            io::stdout().flush().ok();
        }
    }

    fn status(&self, message: &str) {
        if let Ok(mut text) = self.text.lock() {
            if self.tty_mode {
                if !text.at_line_start() {
                    eprint!("\r\n");
                }
                eprint!("{message}\r\n");
            } else {
                eprintln!("{message}");
            }
            io::stderr().flush().ok();
            text.mark_line_start();
        }
    }

    fn received(&self, chunk: &[u8]) {
        let Ok(mut text) = self.text.lock() else {
            return;
        };
        let (decoded, output) = text.feed(chunk, self.show_timestamp.load(Ordering::Relaxed));
        if decoded.is_empty() {
            return;
        }
        if let Some(log) = &self.log {
            if let Ok(mut file) = log.lock() {
                let _ = file.write_all(decoded.as_bytes());
            }
        }
        self.write_output(&output);
    }

    fn echo(&self, typed: &str) {
        if let Ok(mut text) = self.text.lock() {
            let output = text.format(typed, self.show_timestamp.load(Ordering::Relaxed));
            self.write_output(&output);
        }
    }

    fn toggle_timestamp(&self) -> bool {
        !self
            .show_timestamp
            .fetch_xor(true, Ordering::Relaxed)
    }
}

fn icon(fancy: &'static str, plain: &'static str) -> &'static str {
    if use_fancy_output() { fancy } else { plain }
}

/// Keyboard actions of the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Action {
    Quit,
    ToggleTimestamp,
    ToggleDtr,
    ToggleRts,
    SendBreak,
    Send(Vec<u8>),
    Ignore,
}

fn key_action(code: KeyCode, modifiers: KeyModifiers, line_ending: &[u8]) -> Action {
    match (code, modifiers) {
        (KeyCode::Char('c'), KeyModifiers::CONTROL) => Action::Quit,
        (KeyCode::Char('t'), KeyModifiers::CONTROL) => Action::ToggleTimestamp,
        (KeyCode::Char('d'), KeyModifiers::CONTROL) => Action::ToggleDtr,
        (KeyCode::Char('r'), KeyModifiers::CONTROL) => Action::ToggleRts,
        (KeyCode::Char('b'), KeyModifiers::CONTROL) => Action::SendBreak,
        (KeyCode::Enter, _) => Action::Send(line_ending.to_vec()),
        (KeyCode::Char(c), KeyModifiers::NONE | KeyModifiers::SHIFT) => {
            let mut buf = [0u8; 4];
            Action::Send(
                c.encode_utf8(&mut buf)
                    .as_bytes()
                    .to_vec(),
            )
        },
        (KeyCode::Backspace, _) => Action::Send(vec![0x08]),
        (KeyCode::Tab, _) => Action::Send(vec![0x09]),
        (KeyCode::Esc, _) => Action::Send(vec![0x1B]),
        _ => Action::Ignore,
    }
}

/// RAII guard to restore terminal mode on drop.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        terminal::enable_raw_mode().context("Failed to enable raw terminal mode")?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = terminal::disable_raw_mode();
    }
}

fn register_handlers(port: &SerialPort, screen: &Arc<Screen>, lost: &Arc<AtomicBool>) {
    let data_screen = Arc::clone(screen);
    port.on_data_received(move |chunk| data_screen.received(chunk));

    let error_screen = Arc::clone(screen);
    port.on_error(move |error| {
        error_screen.status(&format!("{} {error}", style(icon("⚠", "!")).yellow()));
    });

    let break_screen = Arc::clone(screen);
    port.on_break(move || {
        break_screen.status(&format!(
            "{} break received",
            style(icon("⚡", "!")).yellow()
        ));
    });

    let pin_screen = Arc::clone(screen);
    port.on_pin_changed(move |pin, state| {
        let level = if state { "on" } else { "off" };
        pin_screen.status(&style(format!("{pin} {level}")).dim().to_string());
    });

    let lost_screen = Arc::clone(screen);
    let lost_flag = Arc::clone(lost);
    port.on_disconnected(move |reason| {
        lost_flag.store(true, Ordering::Relaxed);
        lost_screen.status(&format!(
            "{} connection lost: {reason}",
            style(icon("✗", "x")).red()
        ));
    });
}

/// Carry out one keyboard action. Returns `false` to leave the terminal.
fn apply(
    action: Action,
    port: &SerialPort,
    screen: &Screen,
    lines: &mut (bool, bool),
    echo: bool,
) -> bool {
    let result = match action {
        Action::Quit => return false,
        Action::Ignore => Ok(()),
        Action::ToggleTimestamp => {
            let state = if screen.toggle_timestamp() { "on" } else { "off" };
            screen.status(&format!("{} timestamps {state}", style(icon("⏱", "*")).cyan()));
            Ok(())
        },
        Action::ToggleDtr => port
            .set_line(LineSignal::Dtr, !lines.0)
            .map(|()| {
                lines.0 = !lines.0;
                screen.status(&format!("DTR {}", if lines.0 { "on" } else { "off" }));
            }),
        Action::ToggleRts => port
            .set_line(LineSignal::Rts, !lines.1)
            .map(|()| {
                lines.1 = !lines.1;
                screen.status(&format!("RTS {}", if lines.1 { "on" } else { "off" }));
            }),
        Action::SendBreak => port
            .set_line(LineSignal::Break, true)
            .and_then(|()| {
                thread::sleep(BREAK_LENGTH);
                port.set_line(LineSignal::Break, false)
            })
            .map(|()| screen.status(&format!("break sent ({} ms)", BREAK_LENGTH.as_millis()))),
        Action::Send(bytes) => port
            .send(&bytes)
            .map(|_| {
                if echo {
                    screen.echo(&String::from_utf8_lossy(&bytes));
                }
            }),
    };

    if let Err(e) = result {
        screen.status(&format!("{} {e}", style(icon("⚠", "!")).yellow()));
    }
    true
}

/// Run the interactive terminal until Ctrl+C or until the device goes away.
pub(crate) fn cmd_terminal(
    cli: &Cli,
    config: &mut Config,
    timestamp: bool,
    log_file: Option<&PathBuf>,
) -> Result<()> {
    if !io::stdin().is_terminal() {
        return Err(CliError::Usage(
            "The terminal needs an interactive stdin; use `comport send` in scripts".to_string(),
        )
        .into());
    }

    let port = prepare_port(cli, config)?;
    let log = match log_file {
        Some(path) => Some(Mutex::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file: {}", path.display()))?,
        )),
        None => None,
    };

    let screen = Arc::new(Screen {
        text: Mutex::new(TerminalText::default()),
        tty_mode: io::stdout().is_terminal() && io::stderr().is_terminal(),
        show_timestamp: AtomicBool::new(timestamp || config.terminal.timestamp),
        log,
    });
    let lost = Arc::new(AtomicBool::new(false));
    register_handlers(&port, &screen, &lost);

    screen.status(&format!(
        "{} Opening {} at {}",
        style(icon("📡", ">")).cyan(),
        style(port.port_name()).green(),
        port.configuration()
            .framing()
    ));
    connect_port(&port)?;
    if let Some(path) = log_file {
        screen.status(&format!(
            "{} Logging to {}",
            style(icon("📝", ">")).cyan(),
            path.display()
        ));
    }
    screen.status(
        &style("Ctrl+C quit | Ctrl+T timestamps | Ctrl+D DTR | Ctrl+R RTS | Ctrl+B break")
            .dim()
            .to_string(),
    );

    let line_ending = config
        .terminal
        .line_ending
        .unwrap_or_default()
        .as_bytes();
    let echo = config.terminal.local_echo;
    // DTR and RTS start asserted with the default configuration
    let mut lines = (true, true);

    let guard = RawModeGuard::enable()?;
    let loop_result = (|| -> Result<()> {
        while !lost.load(Ordering::Relaxed) {
            if was_interrupted() {
                clear_interrupted_flag();
                break;
            }
            if !event::poll(KEY_POLL)? {
                continue;
            }
            if let Event::Key(KeyEvent {
                code,
                modifiers,
                kind: KeyEventKind::Press,
                ..
            }) = event::read()?
            {
                let action = key_action(code, modifiers, line_ending);
                if !apply(action, &port, &screen, &mut lines, echo) {
                    break;
                }
            }
        }
        Ok(())
    })();
    drop(guard);

    port.disconnect()?;
    let counters = port.counters();
    debug!(
        "Line events: {} framing, {} overrun, {} parity, {} breaks, {} rings",
        counters.frame, counters.overrun, counters.parity, counters.breaks, counters.rings
    );
    screen.status(&format!("{} Closed {}", icon("👋", "-"), port.port_name()));

    loop_result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_keys() {
        let ctrl = KeyModifiers::CONTROL;
        assert_eq!(key_action(KeyCode::Char('c'), ctrl, b"\r\n"), Action::Quit);
        assert_eq!(
            key_action(KeyCode::Char('t'), ctrl, b"\r\n"),
            Action::ToggleTimestamp
        );
        assert_eq!(key_action(KeyCode::Char('d'), ctrl, b"\r\n"), Action::ToggleDtr);
        assert_eq!(key_action(KeyCode::Char('r'), ctrl, b"\r\n"), Action::ToggleRts);
        assert_eq!(key_action(KeyCode::Char('b'), ctrl, b"\r\n"), Action::SendBreak);
        assert_eq!(key_action(KeyCode::Char('x'), ctrl, b"\r\n"), Action::Ignore);
    }

    #[test]
    fn test_typed_keys() {
        let none = KeyModifiers::NONE;
        assert_eq!(
            key_action(KeyCode::Char('a'), none, b"\r\n"),
            Action::Send(b"a".to_vec())
        );
        assert_eq!(
            key_action(KeyCode::Char('A'), KeyModifiers::SHIFT, b"\r\n"),
            Action::Send(b"A".to_vec())
        );
        assert_eq!(
            key_action(KeyCode::Char('é'), none, b"\r\n"),
            Action::Send("é".as_bytes().to_vec())
        );
        assert_eq!(key_action(KeyCode::Enter, none, b"\r"), Action::Send(b"\r".to_vec()));
        assert_eq!(key_action(KeyCode::Backspace, none, b"\r"), Action::Send(vec![0x08]));
        assert_eq!(key_action(KeyCode::Tab, none, b"\r"), Action::Send(vec![0x09]));
        assert_eq!(key_action(KeyCode::Esc, none, b"\r"), Action::Send(vec![0x1B]));
        assert_eq!(key_action(KeyCode::F(1), none, b"\r"), Action::Ignore);
    }

    fn loopback_screen() -> (comport::LoopbackTransport, SerialPort, Screen) {
        let transport = comport::LoopbackTransport::new().with_port("TERM0");
        let port = SerialPort::new(
            Arc::new(transport.clone()),
            comport::PortConfiguration::new("TERM0", 115_200),
        );
        let screen = Screen {
            text: Mutex::new(TerminalText::default()),
            tty_mode: false,
            show_timestamp: AtomicBool::new(false),
            log: None,
        };
        (transport, port, screen)
    }

    #[test]
    fn test_apply_toggles_lines_and_sends() {
        let (transport, port, screen) = loopback_screen();
        port.connect().unwrap();
        let ctl = transport.controller("TERM0").unwrap();
        let mut lines = (true, true);

        assert!(apply(Action::ToggleDtr, &port, &screen, &mut lines, false));
        assert_eq!(lines, (false, true));
        assert!(!ctl.lines().dtr);

        assert!(apply(Action::ToggleRts, &port, &screen, &mut lines, false));
        assert_eq!(lines, (false, false));
        assert!(!ctl.lines().rts);

        assert!(apply(Action::Send(b"hi".to_vec()), &port, &screen, &mut lines, true));
        assert_eq!(ctl.written(), b"hi");

        assert!(apply(Action::SendBreak, &port, &screen, &mut lines, false));
        assert!(!ctl.lines().brk);

        assert!(!apply(Action::Quit, &port, &screen, &mut lines, false));
        port.disconnect().unwrap();
    }

    #[test]
    fn test_apply_reports_errors_and_keeps_running() {
        let (_transport, port, screen) = loopback_screen();
        let mut lines = (true, true);
        // Not connected: the send fails but the terminal stays up
        assert!(apply(Action::Send(b"x".to_vec()), &port, &screen, &mut lines, false));
        assert!(apply(Action::ToggleDtr, &port, &screen, &mut lines, false));
        assert_eq!(lines, (true, true));
    }

    #[test]
    fn test_toggle_timestamp() {
        let (_transport, _port, screen) = loopback_screen();
        assert!(screen.toggle_timestamp());
        assert!(!screen.toggle_timestamp());
    }
}
