//! List ports command implementation.

use anyhow::{Context, Result};
use comport::{BridgeKind, PortInfo, auto_select, discover_native_ports};
use console::style;
use serde_json::{Value, json};

use crate::config::Config;

fn port_json(port: &PortInfo, config: &Config) -> Value {
    let kind = BridgeKind::of(port);
    let usb = port.usb.as_ref();
    json!({
        "name": port.identifier,
        "description": port.description,
        "device": kind.name(),
        "known": kind.is_known()
            || usb.is_some_and(|usb| config.is_known_usb(usb.vid, usb.pid)),
        "vid": usb.map(|usb| usb.vid),
        "pid": usb.map(|usb| usb.pid),
        "manufacturer": usb.and_then(|usb| usb.manufacturer.as_deref()),
        "product": usb.and_then(|usb| usb.product.as_deref()),
        "serial": usb.and_then(|usb| usb.serial_number.as_deref()),
    })
}

/// Print detected ports; JSON goes to stdout, the styled list to stderr.
pub(crate) fn cmd_list_ports(json: bool, config: &Config) -> Result<()> {
    let ports = discover_native_ports().context("Failed to enumerate serial ports")?;

    if json {
        let entries: Vec<Value> = ports
            .iter()
            .map(|port| port_json(port, config))
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let kind = BridgeKind::of(port);
        let device_type = if kind.is_known() {
            format!(" [{}]", style(kind.name()).yellow())
        } else {
            String::new()
        };
        let vid_pid = port
            .usb
            .as_ref()
            .map(|usb| format!(" ({:04X}:{:04X})", usb.vid, usb.pid))
            .unwrap_or_default();
        let description = if port
            .description
            .is_empty()
        {
            String::new()
        } else {
            format!(" - {}", style(&port.description).dim())
        };

        eprintln!(
            "  {} {}{device_type}{vid_pid}{description}",
            style("•").green(),
            style(&port.identifier).cyan(),
        );
    }

    if let Some(port) = auto_select(&ports) {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&port.identifier).cyan().bold()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use comport::UsbIds;

    #[test]
    fn test_port_json_usb() {
        let port = PortInfo {
            description: "USB Serial".to_string(),
            identifier: "/dev/ttyUSB0".to_string(),
            usb: Some(UsbIds {
                vid: 0x1A86,
                pid: 0x7523,
                manufacturer: Some("QinHeng".to_string()),
                product: None,
                serial_number: Some("1234".to_string()),
            }),
        };
        let value = port_json(&port, &Config::default());
        assert_eq!(value["name"], "/dev/ttyUSB0");
        assert_eq!(value["device"], "CH340/CH341");
        assert_eq!(value["known"], true);
        assert_eq!(value["vid"], 0x1A86);
        assert_eq!(value["manufacturer"], "QinHeng");
        assert!(value["product"].is_null());
        assert_eq!(value["serial"], "1234");
    }

    #[test]
    fn test_port_json_plain() {
        let port = PortInfo {
            description: String::new(),
            identifier: "COM1".to_string(),
            usb: None,
        };
        let value = port_json(&port, &Config::default());
        assert_eq!(value["known"], false);
        assert!(value["vid"].is_null());
        assert_eq!(value["device"], "Unknown");
    }
}
