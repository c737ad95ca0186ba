//! Host-side utilities for serial port discovery.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::transport::{PortInfo, PortRegistry};

/// Common USB-to-UART bridge chips.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeKind {
    /// CH340/CH341.
    Ch340,
    /// Silicon Labs CP210x.
    Cp210x,
    /// FTDI FT232/FT2232/FT4232.
    Ftdi,
    /// Prolific PL2303.
    Prolific,
    /// Anything else, including ports that are not USB.
    Unknown,
}

/// Known USB VID/PID pairs.
const KNOWN_BRIDGES: &[(u16, &[u16], BridgeKind)] = &[
    (
        0x1A86,
        &[0x7523, 0x7522, 0x5523, 0x5512, 0x55D4],
        BridgeKind::Ch340,
    ),
    (0x10C4, &[0xEA60, 0xEA70, 0xEA71, 0xEA63], BridgeKind::Cp210x),
    (
        0x0403,
        &[0x6001, 0x6010, 0x6011, 0x6014, 0x6015],
        BridgeKind::Ftdi,
    ),
    (0x067B, &[0x2303, 0x23A3, 0x23C3, 0x23D3], BridgeKind::Prolific),
];

impl BridgeKind {
    /// Classify a VID/PID pair.
    #[must_use]
    pub fn from_vid_pid(vid: u16, pid: u16) -> Self {
        KNOWN_BRIDGES
            .iter()
            .find(|(known_vid, pids, _)| vid == *known_vid && pids.contains(&pid))
            .map_or(Self::Unknown, |(_, _, kind)| *kind)
    }

    /// Classify a listed port.
    #[must_use]
    pub fn of(port: &PortInfo) -> Self {
        port.usb
            .as_ref()
            .map_or(Self::Unknown, |usb| Self::from_vid_pid(usb.vid, usb.pid))
    }

    /// Human-readable chip name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Ch340 => "CH340/CH341",
            Self::Cp210x => "CP210x",
            Self::Ftdi => "FTDI",
            Self::Prolific => "PL2303",
            Self::Unknown => "Unknown",
        }
    }

    /// Whether the chip was recognized.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

/// List the ports `registry` reports, sorted by identifier.
pub fn discover_ports(registry: &dyn PortRegistry) -> Result<Vec<PortInfo>> {
    let mut ports = registry
        .list_ports()
        .map_err(Error::from_native)?;
    ports.sort_by(|a, b| {
        a.identifier
            .cmp(&b.identifier)
    });
    for port in &ports {
        trace!("Found port {} ({})", port.identifier, port.description);
    }
    Ok(ports)
}

/// List the serial ports of this host.
#[cfg(feature = "native")]
pub fn discover_native_ports() -> Result<Vec<PortInfo>> {
    discover_ports(&crate::transport::NativeRegistry)
}

/// Pick a port without asking: the only one, else the only recognized USB bridge.
#[must_use]
pub fn auto_select(ports: &[PortInfo]) -> Option<&PortInfo> {
    if let [only] = ports {
        debug!("Auto-selected the only port: {}", only.identifier);
        return Some(only);
    }
    let mut bridges = ports
        .iter()
        .filter(|p| BridgeKind::of(p).is_known());
    match (bridges.next(), bridges.next()) {
        (Some(port), None) => {
            debug!(
                "Auto-selected {} bridge: {}",
                BridgeKind::of(port).name(),
                port.identifier
            );
            Some(port)
        },
        _ => None,
    }
}

/// One display line per port.
pub fn format_port_list(ports: &[PortInfo]) -> Vec<String> {
    ports
        .iter()
        .map(|port| {
            let kind = BridgeKind::of(port);
            let device_info = match &port.usb {
                Some(_) if kind.is_known() => format!(" [{}]", kind.name()),
                Some(usb) => format!(" [VID:{:04X} PID:{:04X}]", usb.vid, usb.pid),
                None => String::new(),
            };
            format!("{}{device_info} - {}", port.identifier, port.description)
        })
        .collect()
}
