//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod list_ports;
pub(crate) mod send;
pub(crate) mod status;
pub(crate) mod terminal;
