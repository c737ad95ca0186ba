//! Port status command implementation.

use anyhow::Result;
use comport::{ModemPins, PortConfiguration, PortStatus, TimeoutPolicy};
use console::style;
use serde_json::{Value, json};

use crate::config::Config;
use crate::{Cli, connect_port, prepare_port};

fn flow_name(config: &PortConfiguration) -> &'static str {
    match config.flow_control() {
        Some(comport::FlowControl::None) => "none",
        Some(comport::FlowControl::Hardware) => "hardware",
        Some(comport::FlowControl::Software) => "software",
        None => "custom",
    }
}

fn status_json(
    config: &PortConfiguration,
    timeouts: &TimeoutPolicy,
    status: &PortStatus,
    pins: ModemPins,
) -> Value {
    json!({
        "port": config.port_name(),
        "framing": config.framing(),
        "baud": config.baud_rate(),
        "data_bits": config.data_bits(),
        "parity": config.parity(),
        "stop_bits": config.stop_bits(),
        "flow": flow_name(config),
        "timeouts": timeouts,
        "queues": {
            "input": status.in_queue,
            "output": status.out_queue,
        },
        "hold": {
            "cts": status.cts_hold,
            "dsr": status.dsr_hold,
            "rlsd": status.rlsd_hold,
            "xoff": status.xoff_hold,
            "xoff_sent": status.xoff_sent,
        },
        "errors": {
            "break": status.break_detected,
            "frame": status.framing_error,
            "overrun": status.overrun,
            "rx_overflow": status.rx_overflow,
            "parity": status.parity_error,
            "tx_full": status.tx_full,
        },
        "pins": {
            "cts": pins.cts,
            "dsr": pins.dsr,
            "rlsd": pins.rlsd,
            "ring": pins.ring,
        },
    })
}

fn on_off(state: bool) -> String {
    if state {
        style("on").green().to_string()
    } else {
        style("off").dim().to_string()
    }
}

fn print_status(config: &PortConfiguration, status: &PortStatus, pins: ModemPins) {
    println!(
        "{} {} ({}, flow {})",
        style("Port").bold(),
        style(config.port_name()).cyan(),
        config.framing(),
        flow_name(config)
    );
    println!(
        "  Queues:  in {}  out {}",
        status.in_queue, status.out_queue
    );
    println!(
        "  Pins:    CTS {}  DSR {}  RLSD {}  RING {}",
        on_off(pins.cts),
        on_off(pins.dsr),
        on_off(pins.rlsd),
        on_off(pins.ring)
    );

    if status.is_tx_held() {
        let mut reasons = Vec::new();
        for (held, name) in [
            (status.cts_hold, "CTS"),
            (status.dsr_hold, "DSR"),
            (status.rlsd_hold, "RLSD"),
            (status.xoff_hold, "XOFF received"),
            (status.xoff_sent, "XOFF sent"),
        ] {
            if held {
                reasons.push(name);
            }
        }
        println!(
            "  {} transmit held: {}",
            style("⚠").yellow(),
            reasons.join(", ")
        );
    }

    if status.has_errors() {
        let mut errors: Vec<String> = status
            .line_errors()
            .iter()
            .map(ToString::to_string)
            .collect();
        if status.break_detected {
            errors.push("break".to_string());
        }
        if status.rx_overflow {
            errors.push("input overflow".to_string());
        }
        if status.tx_full {
            errors.push("output full".to_string());
        }
        println!(
            "  {} line errors: {}",
            style("⚠").yellow(),
            errors.join(", ")
        );
    } else {
        println!("  Errors:  none");
    }
}

/// Open the port, report its state and close it again.
pub(crate) fn cmd_status(cli: &Cli, config: &mut Config, json: bool) -> Result<()> {
    let port = prepare_port(cli, config)?;
    connect_port(&port)?;

    let port_config = port.configuration();
    let timeouts = port.timeouts();
    let status = port.status()?;
    let pins = port.modem_pins()?;
    port.disconnect()?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&status_json(&port_config, &timeouts, &status, pins))?
        );
    } else {
        print_status(&port_config, &status, pins);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use comport::{FlowControl, Parity};

    #[test]
    fn test_flow_name() {
        let mut config = PortConfiguration::new("COM1", 9600);
        assert_eq!(flow_name(&config), "none");
        config.set_flow_control(FlowControl::Hardware);
        assert_eq!(flow_name(&config), "hardware");
        config.set_dsr_flow(true);
        assert_eq!(flow_name(&config), "custom");
    }

    #[test]
    fn test_status_json_layout() {
        let mut config = PortConfiguration::new("/dev/ttyUSB0", 57600);
        config.set_parity(Parity::Even);
        let status = PortStatus {
            in_queue: 12,
            xoff_hold: true,
            overrun: true,
            ..Default::default()
        };
        let pins = ModemPins {
            cts: true,
            ..Default::default()
        };

        let value = status_json(&config, &TimeoutPolicy::constant(100, 200), &status, pins);
        assert_eq!(value["port"], "/dev/ttyUSB0");
        assert_eq!(value["framing"], "57600 8E1");
        assert_eq!(value["parity"], "even");
        assert_eq!(value["stop_bits"], "one");
        assert_eq!(value["timeouts"]["read_total_constant"], 100);
        assert_eq!(value["queues"]["input"], 12);
        assert_eq!(value["hold"]["xoff"], true);
        assert_eq!(value["errors"]["overrun"], true);
        assert_eq!(value["errors"]["frame"], false);
        assert_eq!(value["pins"]["cts"], true);
        assert_eq!(value["pins"]["ring"], false);
    }
}
