//! Serial port selection.
//!
//! The port comes from, in order: the `--port` flag (or `COMPORT_PORT`), the
//! configuration file, the only detected port or the only recognized USB
//! adapter, and finally an interactive picker. Non-interactive mode and
//! missing terminals turn the last step into a usage error.

use {
    crate::{CliError, config::Config},
    anyhow::{Context, Result},
    comport::{BridgeKind, PortInfo, auto_select, discover_native_ports},
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, error, info},
    std::io::IsTerminal,
};

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI.
    pub port: Option<String>,
    /// Non-interactive mode (fail instead of prompting).
    pub non_interactive: bool,
}

/// How a port was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Named on the command line or in the environment.
    Explicit,
    /// Taken from a configuration file.
    Configured,
    /// Picked without asking.
    Automatic,
    /// Chosen by the user in the picker.
    Interactive,
}

/// A selected port.
#[derive(Debug, Clone)]
pub struct SelectedPort {
    /// Port identifier to open.
    pub name: String,
    /// How it was chosen.
    pub selection: Selection,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

fn is_known_port(port: &PortInfo, config: &Config) -> bool {
    if BridgeKind::of(port).is_known() {
        return true;
    }
    port.usb
        .as_ref()
        .is_some_and(|usb| config.is_known_usb(usb.vid, usb.pid))
}

/// Pick among detected ports without prompting, if the choice is unambiguous.
fn choose_without_prompt<'a>(ports: &'a [PortInfo], config: &Config) -> Option<&'a PortInfo> {
    if let Some(port) = auto_select(ports) {
        return Some(port);
    }

    let mut known = ports
        .iter()
        .filter(|port| is_known_port(port, config));
    match (known.next(), known.next()) {
        (Some(port), None) => {
            debug!("Auto-selected configured USB device: {}", port.identifier);
            Some(port)
        },
        _ => None,
    }
}

/// Select a serial port from flags, configuration or the detected ports.
pub fn select_serial_port(options: &SerialOptions, config: &Config) -> Result<SelectedPort> {
    if let Some(name) = &options.port {
        return Ok(SelectedPort {
            name: name.clone(),
            selection: Selection::Explicit,
        });
    }

    if let Some(name) = &config.port.name {
        debug!("Using port from config: {name}");
        return Ok(SelectedPort {
            name: name.clone(),
            selection: Selection::Configured,
        });
    }

    let ports = discover_native_ports().context("Failed to enumerate serial ports")?;
    select_from_ports(&ports, options.non_interactive, config)
}

fn select_from_ports(
    ports: &[PortInfo],
    non_interactive: bool,
    config: &Config,
) -> Result<SelectedPort> {
    if ports.is_empty() {
        return Err(usage_err(
            "No serial ports found. Connect a device or pass --port",
        ));
    }

    if let Some(port) = choose_without_prompt(ports, config) {
        info!("Auto-selected port: {}", port.identifier);
        return Ok(SelectedPort {
            name: port
                .identifier
                .clone(),
            selection: Selection::Automatic,
        });
    }

    if non_interactive {
        return Err(usage_err(
            "Multiple serial ports found; pass --port to choose one",
        ));
    }

    ensure_interactive_terminal()?;
    select_port_interactive(ports, config)
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal; pass --port",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err("Port selection prompt failed")
            }
        },
    }
}

/// Picker label for one port.
fn port_label(port: &PortInfo, config: &Config) -> String {
    let name = if is_known_port(port, config) {
        style(&port.identifier)
            .bold()
            .to_string()
    } else {
        port.identifier
            .clone()
    };

    let kind = BridgeKind::of(port);
    let device_info = match &port.usb {
        Some(_) if kind.is_known() => format!(" [{}]", style(kind.name()).yellow()),
        Some(usb) => format!(" ({:04X}:{:04X})", usb.vid, usb.pid),
        None => String::new(),
    };

    let description = if port
        .description
        .is_empty()
    {
        String::new()
    } else {
        format!(" - {}", style(&port.description).dim())
    };

    format!("{name}{device_info}{description}")
}

fn select_port_interactive(ports: &[PortInfo], config: &Config) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    // Known adapters first, otherwise keep the sorted order
    let mut ordered: Vec<&PortInfo> = ports
        .iter()
        .collect();
    ordered.sort_by_key(|port| !is_known_port(port, config));

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ordered
        .iter()
        .map(|port| {
            console::truncate_str(&port_label(port, config), max_item_width, "\u{2026}")
                .into_owned()
        })
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ordered
                .get(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            Ok(SelectedPort {
                name: port
                    .identifier
                    .clone(),
                selection: Selection::Interactive,
            })
        },
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Offer to store an interactively chosen port in the configuration.
pub fn ask_remember_port(selected: &SelectedPort, config: &mut Config) -> Result<()> {
    if selected.selection != Selection::Interactive {
        return Ok(());
    }

    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} as the default port?", selected.name))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        match config.save_port(&selected.name) {
            Ok(path) => eprintln!(
                "{} Saved to {}",
                style("✓").green(),
                style(path.display()).yellow()
            ),
            Err(e) => error!("Failed to save port configuration: {e}"),
        }
    }

    Ok(())
}
