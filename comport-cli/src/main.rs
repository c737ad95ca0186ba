//! comport CLI - Serial terminal and port utilities.
//!
//! ## Features
//!
//! - Interactive serial terminal with timestamps and log files
//! - One-shot sends with optional response capture
//! - Port status, modem pins and line error inspection
//! - Interactive serial port selection
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use comport::{FlowControl, Parity, PortConfiguration, SerialPort, StopBits, TimeoutPolicy};
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;
mod serial;
mod text;

use config::Config;
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Baud rate used when neither flags nor config name one.
const DEFAULT_BAUD: u32 = 115_200;

/// Timeouts used when the config has no `[timeouts]` section.
const DEFAULT_TIMEOUTS: TimeoutPolicy = TimeoutPolicy::constant(500, 2000);

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

pub(crate) fn clear_interrupted_flag() {
    INTERRUPTED.store(false, Ordering::Relaxed);
}

/// Errors with a dedicated exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad invocation or setup; exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Cancelled by the user; exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    const fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Cancelled(_) => 130,
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<CliError>()
        .map_or(1, CliError::exit_code)
}

/// comport - A serial port terminal and toolbox.
///
/// Environment variables:
///   COMPORT_PORT              - Default serial port
///   COMPORT_BAUD              - Default baud rate (default: 115200)
///   COMPORT_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "comport")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    comport list-ports\n  \
    comport -p /dev/ttyUSB0 -b 9600 terminal --timestamp\n  \
    comport -p COM3 send 'AT\\r\\n' --wait-ms 500")]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "COMPORT_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, global = true, env = "COMPORT_BAUD")]
    baud: Option<u32>,

    /// Data bits per character.
    #[arg(long, global = true, value_parser = clap::value_parser!(u8).range(4..=8))]
    data_bits: Option<u8>,

    /// Parity mode.
    #[arg(long, global = true)]
    parity: Option<ParityArg>,

    /// Number of stop bits.
    #[arg(long, global = true)]
    stop_bits: Option<StopBitsArg>,

    /// Flow control.
    #[arg(long, global = true)]
    flow: Option<FlowArg>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "COMPORT_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Parity on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ParityArg {
    /// No parity bit.
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always 1.
    Mark,
    /// Parity bit always 0.
    Space,
}

impl From<ParityArg> for Parity {
    fn from(arg: ParityArg) -> Self {
        match arg {
            ParityArg::None => Parity::None,
            ParityArg::Odd => Parity::Odd,
            ParityArg::Even => Parity::Even,
            ParityArg::Mark => Parity::Mark,
            ParityArg::Space => Parity::Space,
        }
    }
}

/// Stop bits on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum StopBitsArg {
    /// One stop bit.
    #[value(name = "1")]
    One,
    /// One and a half stop bits.
    #[value(name = "1.5")]
    OnePointFive,
    /// Two stop bits.
    #[value(name = "2")]
    Two,
}

impl From<StopBitsArg> for StopBits {
    fn from(arg: StopBitsArg) -> Self {
        match arg {
            StopBitsArg::One => StopBits::One,
            StopBitsArg::OnePointFive => StopBits::OnePointFive,
            StopBitsArg::Two => StopBits::Two,
        }
    }
}

/// Flow control on the command line.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum FlowArg {
    /// No flow control.
    None,
    /// RTS/CTS.
    Hardware,
    /// XON/XOFF.
    Software,
}

impl From<FlowArg> for FlowControl {
    fn from(arg: FlowArg) -> Self {
        match arg {
            FlowArg::None => FlowControl::None,
            FlowArg::Hardware => FlowControl::Hardware,
            FlowArg::Software => FlowControl::Software,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Open an interactive terminal on the port.
    Terminal {
        /// Prefix received lines with a timestamp.
        #[arg(long)]
        timestamp: bool,

        /// Append received text to a file.
        #[arg(long, value_name = "PATH")]
        log_file: Option<PathBuf>,
    },

    /// Show configuration, queue and modem line status of the port.
    Status {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Send data and optionally print what comes back.
    Send {
        /// Data to send; supports \r \n \t \\ \0 and \xNN escapes.
        data: String,

        /// Treat DATA as hex bytes (e.g. "48 65 6C 6C 6F").
        #[arg(long)]
        hex: bool,

        /// Milliseconds to wait for a response after sending.
        #[arg(long, default_value = "0", value_name = "MS")]
        wait_ms: u64,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (auto-detected when --install is used without it).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install completions to the shell's standard location.
        #[arg(long)]
        install: bool,
    },
}

fn main() {
    let code = match run() {
        Ok(()) => 0,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            exit_code_for(&err)
        },
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "comport v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl+C handler: {e}");
    }

    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::ListPorts { json } => commands::list_ports::cmd_list_ports(*json, &config)?,
        Commands::Terminal {
            timestamp,
            log_file,
        } => {
            commands::terminal::cmd_terminal(&cli, &mut config, *timestamp, log_file.as_ref())?;
        },
        Commands::Status { json } => commands::status::cmd_status(&cli, &mut config, *json)?,
        Commands::Send {
            data,
            hex,
            wait_ms,
        } => commands::send::cmd_send(&cli, &mut config, data, *hex, *wait_ms)?,
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)?;
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "specify a shell type, e.g. `comport completions bash`, \
                         or use `comport completions --install`"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
            }
        },
    }

    Ok(())
}

/// Get serial port from CLI args, config or selection.
fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options, config)?;
    if !cli.non_interactive {
        ask_remember_port(&selected, config)?;
    }

    Ok(selected.name)
}

/// Framing from flags over config over defaults.
fn port_configuration(cli: &Cli, config: &Config, name: &str) -> Result<PortConfiguration> {
    let baud = cli
        .baud
        .or(config.port.baud)
        .unwrap_or(DEFAULT_BAUD);
    let mut port_config = PortConfiguration::new(name, baud);

    if let Some(bits) = cli
        .data_bits
        .or(config.port.data_bits)
    {
        port_config
            .set_data_bits(bits)
            .map_err(|e| CliError::Usage(e.to_string()))?;
    }
    if let Some(parity) = cli
        .parity
        .map(Parity::from)
        .or(config.port.parity)
    {
        port_config.set_parity(parity);
    }
    if let Some(stop_bits) = cli
        .stop_bits
        .map(StopBits::from)
        .or(config.port.stop_bits)
    {
        port_config.set_stop_bits(stop_bits);
    }
    if let Some(flow) = cli
        .flow
        .map(FlowControl::from)
        .or(config.port.flow)
    {
        port_config.set_flow_control(flow);
    }

    port_config
        .validate()
        .map_err(|e| CliError::Usage(e.to_string()))?;
    Ok(port_config)
}

/// Select the port and build an unconnected handle for it.
fn prepare_port(cli: &Cli, config: &mut Config) -> Result<SerialPort> {
    let name = get_port(cli, config)?;
    let port_config = port_configuration(cli, config, &name)?;
    debug!("Using {} at {}", name, port_config.framing());
    Ok(SerialPort::native(port_config).with_timeouts(config.timeouts.unwrap_or(DEFAULT_TIMEOUTS)))
}

/// Connect, classifying configuration problems as usage errors.
fn connect_port(port: &SerialPort) -> Result<()> {
    match port.connect() {
        Ok(()) => Ok(()),
        Err(
            e @ (comport::Error::InvalidConfiguration(_) | comport::Error::Unsupported(_)),
        ) => Err(CliError::Usage(format!(
            "Cannot configure {}: {e}",
            port.port_name()
        ))
        .into()),
        Err(e) => Err(e).with_context(|| format!("Failed to open {}", port.port_name())),
    }
}
