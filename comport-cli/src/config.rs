//! Configuration file support for comport.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (COMPORT_*)
//! 3. Local config file (./comport.toml)
//! 4. Global config file (~/.config/comport/config.toml)

use comport::{FlowControl, Parity, StopBits, TimeoutPolicy};
use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of the per-directory configuration.
pub const LOCAL_CONFIG: &str = "comport.toml";

/// USB device identification for port matching.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
}

impl UsbDevice {
    /// Check if this device matches the given USB info.
    pub fn matches(&self, vid: u16, pid: u16) -> bool {
        self.vid == vid && self.pid == pid
    }
}

/// `[port]` section: which device to open and how to frame it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortSection {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub name: Option<String>,
    /// Default baud rate.
    pub baud: Option<u32>,
    /// Data bits per character.
    pub data_bits: Option<u8>,
    /// Parity mode.
    pub parity: Option<Parity>,
    /// Stop bits.
    pub stop_bits: Option<StopBits>,
    /// Flow-control preset.
    pub flow: Option<FlowControl>,
    /// Extra USB devices treated as known adapters during auto-selection.
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
}

/// Bytes sent when Enter is pressed in the terminal.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// Carriage return only.
    Cr,
    /// Line feed only.
    Lf,
    /// Carriage return followed by line feed.
    #[default]
    CrLf,
}

impl LineEnding {
    /// Wire bytes for this line ending.
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Self::Cr => b"\r",
            Self::Lf => b"\n",
            Self::CrLf => b"\r\n",
        }
    }
}

/// `[terminal]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TerminalSection {
    /// Prefix received lines with a timestamp.
    #[serde(default)]
    pub timestamp: bool,
    /// Print typed characters locally.
    #[serde(default)]
    pub local_echo: bool,
    /// What Enter sends.
    pub line_ending: Option<LineEnding>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Port configuration.
    #[serde(default)]
    pub port: PortSection,
    /// Read/write timeouts applied when the port opens.
    pub timeouts: Option<TimeoutPolicy>,
    /// Terminal behaviour.
    #[serde(default)]
    pub terminal: TerminalSection,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Local config overrides global
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "comport").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; values set in `other` win.
    fn merge(&mut self, other: Self) {
        let port = other.port;
        if port.name.is_some() {
            self.port.name = port.name;
        }
        if port.baud.is_some() {
            self.port.baud = port.baud;
        }
        if port.data_bits.is_some() {
            self.port.data_bits = port.data_bits;
        }
        if port.parity.is_some() {
            self.port.parity = port.parity;
        }
        if port.stop_bits.is_some() {
            self.port.stop_bits = port.stop_bits;
        }
        if port.flow.is_some() {
            self.port.flow = port.flow;
        }
        for device in port.usb_device {
            if !self.port.usb_device.contains(&device) {
                self.port.usb_device.push(device);
            }
        }

        if other.timeouts.is_some() {
            self.timeouts = other.timeouts;
        }

        if other.terminal.timestamp {
            self.terminal.timestamp = true;
        }
        if other.terminal.local_echo {
            self.terminal.local_echo = true;
        }
        if other.terminal.line_ending.is_some() {
            self.terminal.line_ending = other.terminal.line_ending;
        }
    }

    /// Whether `vid:pid` was added to the known adapters.
    pub fn is_known_usb(&self, vid: u16, pid: u16) -> bool {
        self.port
            .usb_device
            .iter()
            .any(|device| device.matches(vid, pid))
    }

    /// Remember `name` as the preferred port.
    ///
    /// Writes to the local file when one exists, else to the global file.
    pub fn save_port(&mut self, name: &str) -> anyhow::Result<PathBuf> {
        let path = if Path::new(LOCAL_CONFIG).exists() {
            PathBuf::from(LOCAL_CONFIG)
        } else if let Some(global_dir) = Self::global_config_dir() {
            fs::create_dir_all(&global_dir)?;
            global_dir.join("config.toml")
        } else {
            PathBuf::from(LOCAL_CONFIG)
        };

        self.save_port_to(name, &path)?;
        Ok(path)
    }

    fn save_port_to(&mut self, name: &str, path: &Path) -> anyhow::Result<()> {
        // Only the port name changes; the rest of the file is kept as is
        let mut stored = Self::load_from_file(path).unwrap_or_default();
        stored.port.name = Some(name.to_string());
        self.port.name = Some(name.to_string());

        let content = toml::to_string_pretty(&stored)?;
        fs::write(path, content)?;
        info!("Saved port {name} to {}", path.display());
        Ok(())
    }
}
