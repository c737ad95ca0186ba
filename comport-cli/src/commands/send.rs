//! One-shot send command implementation.

use anyhow::{Context, Result};
use console::style;
use log::debug;
use std::io::{self, Write as _};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::text::{hex_dump, parse_hex, unescape};
use crate::{Cli, CliError, clear_interrupted_flag, connect_port, prepare_port, was_interrupted};

const POLL: Duration = Duration::from_millis(20);

/// Bytes to put on the wire for `data`.
fn encode_payload(data: &str, hex: bool) -> Result<Vec<u8>> {
    let payload = if hex {
        parse_hex(data)
    } else {
        unescape(data)
    };
    payload.map_err(|e| CliError::Usage(format!("Invalid data: {e}")).into())
}

/// Send `data`, then collect replies for `wait_ms` and print them to stdout.
pub(crate) fn cmd_send(
    cli: &Cli,
    config: &mut Config,
    data: &str,
    hex: bool,
    wait_ms: u64,
) -> Result<()> {
    let payload = encode_payload(data, hex)?;
    let port = prepare_port(cli, config)?;

    let received = Arc::new(Mutex::new(Vec::new()));
    if wait_ms > 0 {
        let sink = Arc::clone(&received);
        port.on_data_received(move |chunk| {
            if let Ok(mut buf) = sink.lock() {
                buf.extend_from_slice(chunk);
            }
        });
    }

    connect_port(&port)?;
    let written = port
        .send(&payload)
        .with_context(|| format!("Failed to send to {}", port.port_name()))?;
    if !cli.quiet {
        eprintln!(
            "{} Sent {written} bytes to {}",
            style("✓").green(),
            style(port.port_name()).cyan()
        );
    }

    let deadline = Instant::now() + Duration::from_millis(wait_ms);
    while Instant::now() < deadline {
        if was_interrupted() {
            clear_interrupted_flag();
            port.disconnect()?;
            return Err(CliError::Cancelled("Interrupted".to_string()).into());
        }
        thread::sleep(POLL);
    }
    port.disconnect()?;

    let response = received
        .lock()
        .map(|buf| buf.clone())
        .unwrap_or_default();
    debug!("Received {} bytes", response.len());
    if response.is_empty() {
        return Ok(());
    }

    let mut stdout = io::stdout().lock();
    if hex {
        stdout.write_all(hex_dump(&response).as_bytes())?;
    } else {
        stdout.write_all(&response)?;
    }
    stdout.flush()?;
    Ok(())
}
