//! Port configuration: framing, flow control and special characters.
//!
//! A [`PortConfiguration`] only checks that each value lies in its own
//! domain. Whether a particular combination (say five data bits with two
//! stop bits) works is decided by the transport when the configuration is
//! applied.

use crate::error::{Error, Result};

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
    /// Parity bit always set.
    Mark,
    /// Parity bit always clear.
    Space,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 1.5 stop bits.
    OnePointFive,
    /// 2 stop bits.
    Two,
}

/// DTR pin behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DtrControl {
    /// DTR held low.
    Disabled,
    /// DTR held high while the port is open.
    #[default]
    Enabled,
    /// DTR used for input handshaking.
    Handshake,
}

/// RTS pin behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum RtsControl {
    /// RTS held low.
    Disabled,
    /// RTS held high while the port is open.
    #[default]
    Enabled,
    /// RTS used for input handshaking.
    Handshake,
    /// RTS raised only while bytes are queued for transmission.
    Toggle,
}

/// Common flow-control presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Smallest data-bit count accepted by [`PortConfiguration::set_data_bits`].
pub const MIN_DATA_BITS: u8 = 4;
/// Largest data-bit count accepted by [`PortConfiguration::set_data_bits`].
pub const MAX_DATA_BITS: u8 = 8;

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PortConfiguration {
    port_name: String,
    baud_rate: u32,
    data_bits: u8,
    parity: Parity,
    stop_bits: StopBits,
    dtr_control: DtrControl,
    rts_control: RtsControl,
    cts_flow: bool,
    dsr_flow: bool,
    dsr_sensitivity: bool,
    xon_xoff_tx: bool,
    xon_xoff_rx: bool,
    tx_continue_on_xoff: bool,
    discard_null: bool,
    replace_parity_errors: bool,
    abort_on_error: bool,
    xon_char: u8,
    xoff_char: u8,
    error_char: u8,
    eof_char: u8,
    event_char: u8,
    xon_limit: u16,
    xoff_limit: u16,
}

impl Default for PortConfiguration {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            dtr_control: DtrControl::Enabled,
            rts_control: RtsControl::Enabled,
            cts_flow: false,
            dsr_flow: false,
            dsr_sensitivity: false,
            xon_xoff_tx: false,
            xon_xoff_rx: false,
            tx_continue_on_xoff: false,
            discard_null: false,
            replace_parity_errors: false,
            abort_on_error: false,
            xon_char: 0x11,
            xoff_char: 0x13,
            error_char: b'?',
            eof_char: 0x1A,
            event_char: 0,
            xon_limit: 2048,
            xoff_limit: 512,
        }
    }
}

impl PortConfiguration {
    /// Create a configuration for `port_name` at `baud_rate`, otherwise 8-N-1 without flow control.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Check every field against its own domain.
    ///
    /// Values built through the setters always pass; this catches
    /// configurations that were deserialized or built with [`Self::new`].
    pub fn validate(&self) -> Result<()> {
        check_port_name(&self.port_name)?;
        check_baud_rate(self.baud_rate)?;
        check_data_bits(self.data_bits)?;
        check_special_chars(self.xon_char, self.xoff_char)
    }

    /// Port identifier (e.g. "/dev/ttyUSB0", "COM3").
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Set the port identifier.
    pub fn set_port_name(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        check_port_name(&name)?;
        self.port_name = name;
        Ok(())
    }

    /// Baud rate.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Set the baud rate.
    pub fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        check_baud_rate(baud_rate)?;
        self.baud_rate = baud_rate;
        Ok(())
    }

    /// Data bits per character.
    pub fn data_bits(&self) -> u8 {
        self.data_bits
    }

    /// Set the data bits per character (4 to 8).
    pub fn set_data_bits(&mut self, bits: u8) -> Result<()> {
        check_data_bits(bits)?;
        self.data_bits = bits;
        Ok(())
    }

    /// Parity mode.
    pub fn parity(&self) -> Parity {
        self.parity
    }

    /// Set the parity mode.
    pub fn set_parity(&mut self, parity: Parity) {
        self.parity = parity;
    }

    /// Stop bits.
    pub fn stop_bits(&self) -> StopBits {
        self.stop_bits
    }

    /// Set the stop bits.
    pub fn set_stop_bits(&mut self, stop_bits: StopBits) {
        self.stop_bits = stop_bits;
    }

    /// DTR pin mode.
    pub fn dtr_control(&self) -> DtrControl {
        self.dtr_control
    }

    /// Set the DTR pin mode.
    pub fn set_dtr_control(&mut self, mode: DtrControl) {
        self.dtr_control = mode;
    }

    /// RTS pin mode.
    pub fn rts_control(&self) -> RtsControl {
        self.rts_control
    }

    /// Set the RTS pin mode.
    pub fn set_rts_control(&mut self, mode: RtsControl) {
        self.rts_control = mode;
    }

    /// Transmission waits for CTS.
    pub fn cts_flow(&self) -> bool {
        self.cts_flow
    }

    /// Gate transmission on CTS.
    pub fn set_cts_flow(&mut self, enabled: bool) {
        self.cts_flow = enabled;
    }

    /// Transmission waits for DSR.
    pub fn dsr_flow(&self) -> bool {
        self.dsr_flow
    }

    /// Gate transmission on DSR.
    pub fn set_dsr_flow(&mut self, enabled: bool) {
        self.dsr_flow = enabled;
    }

    /// Received bytes are ignored while DSR is low.
    pub fn dsr_sensitivity(&self) -> bool {
        self.dsr_sensitivity
    }

    /// Gate reception on DSR.
    pub fn set_dsr_sensitivity(&mut self, enabled: bool) {
        self.dsr_sensitivity = enabled;
    }

    /// Transmission stops on XOFF and resumes on XON.
    pub fn xon_xoff_tx(&self) -> bool {
        self.xon_xoff_tx
    }

    /// Enable XON/XOFF gating of transmission.
    pub fn set_xon_xoff_tx(&mut self, enabled: bool) {
        self.xon_xoff_tx = enabled;
    }

    /// XOFF/XON is sent as the receive buffer fills and drains.
    pub fn xon_xoff_rx(&self) -> bool {
        self.xon_xoff_rx
    }

    /// Enable XON/XOFF gating of reception.
    pub fn set_xon_xoff_rx(&mut self, enabled: bool) {
        self.xon_xoff_rx = enabled;
    }

    /// Transmission continues after this side sent XOFF.
    pub fn tx_continue_on_xoff(&self) -> bool {
        self.tx_continue_on_xoff
    }

    /// Continue transmitting after sending XOFF.
    pub fn set_tx_continue_on_xoff(&mut self, enabled: bool) {
        self.tx_continue_on_xoff = enabled;
    }

    /// Null bytes are dropped on reception.
    pub fn discard_null(&self) -> bool {
        self.discard_null
    }

    /// Drop received null bytes.
    pub fn set_discard_null(&mut self, enabled: bool) {
        self.discard_null = enabled;
    }

    /// Bytes with parity errors are replaced by the error character.
    pub fn replace_parity_errors(&self) -> bool {
        self.replace_parity_errors
    }

    /// Replace bytes received with parity errors by [`Self::error_char`].
    pub fn set_replace_parity_errors(&mut self, enabled: bool) {
        self.replace_parity_errors = enabled;
    }

    /// Pending I/O is aborted when a line error occurs.
    pub fn abort_on_error(&self) -> bool {
        self.abort_on_error
    }

    /// Abort pending I/O on line errors.
    pub fn set_abort_on_error(&mut self, enabled: bool) {
        self.abort_on_error = enabled;
    }

    /// XON character.
    pub fn xon_char(&self) -> u8 {
        self.xon_char
    }

    /// Set the XON character; it must differ from the XOFF character.
    pub fn set_xon_char(&mut self, value: u8) -> Result<()> {
        check_special_chars(value, self.xoff_char)?;
        self.xon_char = value;
        Ok(())
    }

    /// XOFF character.
    pub fn xoff_char(&self) -> u8 {
        self.xoff_char
    }

    /// Set the XOFF character; it must differ from the XON character.
    pub fn set_xoff_char(&mut self, value: u8) -> Result<()> {
        check_special_chars(self.xon_char, value)?;
        self.xoff_char = value;
        Ok(())
    }

    /// Set the XON and XOFF characters together.
    pub fn set_flow_chars(&mut self, xon: u8, xoff: u8) -> Result<()> {
        check_special_chars(xon, xoff)?;
        self.xon_char = xon;
        self.xoff_char = xoff;
        Ok(())
    }

    /// Replacement byte for parity errors.
    pub fn error_char(&self) -> u8 {
        self.error_char
    }

    /// Set the replacement byte for parity errors.
    pub fn set_error_char(&mut self, value: u8) {
        self.error_char = value;
    }

    /// End-of-data character.
    pub fn eof_char(&self) -> u8 {
        self.eof_char
    }

    /// Set the end-of-data character.
    pub fn set_eof_char(&mut self, value: u8) {
        self.eof_char = value;
    }

    /// Character that raises the receive-flag event.
    pub fn event_char(&self) -> u8 {
        self.event_char
    }

    /// Set the character that raises the receive-flag event.
    pub fn set_event_char(&mut self, value: u8) {
        self.event_char = value;
    }

    /// Receive-buffer level at which XON is sent.
    pub fn xon_limit(&self) -> u16 {
        self.xon_limit
    }

    /// Set the receive-buffer level at which XON is sent.
    pub fn set_xon_limit(&mut self, limit: u16) {
        self.xon_limit = limit;
    }

    /// Free receive-buffer space at which XOFF is sent.
    pub fn xoff_limit(&self) -> u16 {
        self.xoff_limit
    }

    /// Set the free receive-buffer space at which XOFF is sent.
    pub fn set_xoff_limit(&mut self, limit: u16) {
        self.xoff_limit = limit;
    }

    /// Apply a flow-control preset, clearing the flags of the other presets.
    pub fn set_flow_control(&mut self, flow: FlowControl) {
        self.dsr_flow = false;
        self.dsr_sensitivity = false;
        match flow {
            FlowControl::None => {
                self.cts_flow = false;
                self.xon_xoff_tx = false;
                self.xon_xoff_rx = false;
                self.rts_control = RtsControl::Enabled;
            },
            FlowControl::Hardware => {
                self.cts_flow = true;
                self.xon_xoff_tx = false;
                self.xon_xoff_rx = false;
                self.rts_control = RtsControl::Handshake;
            },
            FlowControl::Software => {
                self.cts_flow = false;
                self.xon_xoff_tx = true;
                self.xon_xoff_rx = true;
                self.rts_control = RtsControl::Enabled;
            },
        }
    }

    /// The preset matching the current flags, if any.
    pub fn flow_control(&self) -> Option<FlowControl> {
        if self.dsr_flow || self.dsr_sensitivity {
            return None;
        }
        let software = self.xon_xoff_tx && self.xon_xoff_rx;
        let no_software = !self.xon_xoff_tx && !self.xon_xoff_rx;
        match (self.cts_flow, self.rts_control) {
            (false, RtsControl::Enabled) if no_software => Some(FlowControl::None),
            (true, RtsControl::Handshake) if no_software => Some(FlowControl::Hardware),
            (false, RtsControl::Enabled) if software => Some(FlowControl::Software),
            _ => None,
        }
    }

    /// Short framing summary such as `9600 8N1`.
    pub fn framing(&self) -> String {
        let parity = match self.parity {
            Parity::None => 'N',
            Parity::Odd => 'O',
            Parity::Even => 'E',
            Parity::Mark => 'M',
            Parity::Space => 'S',
        };
        let stop = match self.stop_bits {
            StopBits::One => "1",
            StopBits::OnePointFive => "1.5",
            StopBits::Two => "2",
        };
        format!("{} {}{parity}{stop}", self.baud_rate, self.data_bits)
    }
}

fn check_port_name(name: &str) -> Result<()> {
    if name
        .trim()
        .is_empty()
    {
        return Err(Error::InvalidConfiguration(
            "port name must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn check_baud_rate(baud_rate: u32) -> Result<()> {
    if baud_rate == 0 {
        return Err(Error::InvalidConfiguration(
            "baud rate must be positive".to_string(),
        ));
    }
    Ok(())
}

fn check_data_bits(bits: u8) -> Result<()> {
    if !(MIN_DATA_BITS..=MAX_DATA_BITS).contains(&bits) {
        return Err(Error::InvalidConfiguration(format!(
            "data bits must be between {MIN_DATA_BITS} and {MAX_DATA_BITS}, got {bits}"
        )));
    }
    Ok(())
}

fn check_special_chars(xon: u8, xoff: u8) -> Result<()> {
    if xon == xoff {
        return Err(Error::InvalidConfiguration(format!(
            "XON and XOFF characters must differ (both {xon:#04x})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_9600_8n1() {
        let config = PortConfiguration::default();
        assert_eq!(config.baud_rate(), 9600);
        assert_eq!(config.data_bits(), 8);
        assert_eq!(config.parity(), Parity::None);
        assert_eq!(config.stop_bits(), StopBits::One);
        assert_eq!(config.flow_control(), Some(FlowControl::None));
        assert_eq!(config.framing(), "9600 8N1");
    }

    #[test]
    fn test_setters_reject_out_of_domain_values() {
        let mut config = PortConfiguration::new("COM3", 115200);
        assert!(config.set_baud_rate(0).is_err());
        assert!(config.set_data_bits(3).is_err());
        assert!(config.set_data_bits(9).is_err());
        assert!(config.set_port_name("  ").is_err());
        assert!(config.set_xon_char(0x13).is_err());

        // Rejected values leave the previous ones in place
        assert_eq!(config.baud_rate(), 115200);
        assert_eq!(config.data_bits(), 8);
        assert_eq!(config.port_name(), "COM3");
        assert_eq!(config.xon_char(), 0x11);
    }

    #[test]
    fn test_swapping_flow_chars() {
        let mut config = PortConfiguration::default();
        // One at a time the swap would pass through XON == XOFF
        assert!(config.set_xon_char(0x13).is_err());
        config.set_flow_chars(0x13, 0x11).unwrap();
        assert_eq!((config.xon_char(), config.xoff_char()), (0x13, 0x11));
        assert!(config.set_flow_chars(0x00, 0x00).is_err());
        assert_eq!(config.xon_char(), 0x13);
    }

    #[test]
    fn test_data_bits_range_is_inclusive() {
        let mut config = PortConfiguration::default();
        for bits in 4..=8 {
            config.set_data_bits(bits).unwrap();
            assert_eq!(config.data_bits(), bits);
        }
    }

    #[test]
    fn test_flow_control_presets() {
        let mut config = PortConfiguration::default();

        config.set_flow_control(FlowControl::Hardware);
        assert!(config.cts_flow());
        assert_eq!(config.rts_control(), RtsControl::Handshake);
        assert_eq!(config.flow_control(), Some(FlowControl::Hardware));

        config.set_flow_control(FlowControl::Software);
        assert!(!config.cts_flow());
        assert!(config.xon_xoff_tx() && config.xon_xoff_rx());
        assert_eq!(config.flow_control(), Some(FlowControl::Software));

        config.set_dsr_flow(true);
        assert_eq!(config.flow_control(), None);
    }

    #[test]
    fn test_validate_catches_unchecked_construction() {
        assert!(PortConfiguration::new("", 9600).validate().is_err());
        assert!(PortConfiguration::new("COM1", 0).validate().is_err());
        assert!(PortConfiguration::new("COM1", 9600).validate().is_ok());
    }

    #[test]
    fn test_framing_summary() {
        let mut config = PortConfiguration::new("/dev/ttyS0", 19200);
        config.set_data_bits(7).unwrap();
        config.set_parity(Parity::Even);
        config.set_stop_bits(StopBits::OnePointFive);
        assert_eq!(config.framing(), "19200 7E1.5");
    }
}
