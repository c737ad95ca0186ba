//! Native device-control form of a [`PortConfiguration`].
//!
//! Transports receive configurations as a [`DeviceControlBlock`]: the
//! integer codes and flag set that DCB-style platform APIs expect, so a
//! transport only has to map codes it supports and reject the rest.

use bitflags::bitflags;

use crate::settings::{DtrControl, Parity, PortConfiguration, RtsControl, StopBits};

bitflags! {
    /// Boolean switches of a [`DeviceControlBlock`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct DcbFlags: u32 {
        /// Binary mode, always set.
        const BINARY = 1 << 0;
        /// Parity checking enabled.
        const PARITY = 1 << 1;
        /// Output gated on CTS.
        const OUTX_CTS_FLOW = 1 << 2;
        /// Output gated on DSR.
        const OUTX_DSR_FLOW = 1 << 3;
        /// Input ignored while DSR is low.
        const DSR_SENSITIVITY = 1 << 6;
        /// Keep transmitting after sending XOFF.
        const TX_CONTINUE_ON_XOFF = 1 << 7;
        /// XON/XOFF output flow control.
        const OUT_X = 1 << 8;
        /// XON/XOFF input flow control.
        const IN_X = 1 << 9;
        /// Replace parity errors with the error character.
        const ERROR_CHAR = 1 << 10;
        /// Discard null bytes.
        const NULL = 1 << 11;
        /// Abort I/O on line errors.
        const ABORT_ON_ERROR = 1 << 14;
    }
}

/// DTR control code: line held low.
pub const DTR_DISABLE: u8 = 0;
/// DTR control code: line held high.
pub const DTR_ENABLE: u8 = 1;
/// DTR control code: driver handshake.
pub const DTR_HANDSHAKE: u8 = 2;

/// RTS control code: line held low.
pub const RTS_DISABLE: u8 = 0;
/// RTS control code: line held high.
pub const RTS_ENABLE: u8 = 1;
/// RTS control code: driver handshake.
pub const RTS_HANDSHAKE: u8 = 2;
/// RTS control code: high while transmitting.
pub const RTS_TOGGLE: u8 = 3;

/// Platform-style configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceControlBlock {
    /// Baud rate.
    pub baud_rate: u32,
    /// Boolean switches.
    pub flags: DcbFlags,
    /// DTR control code, one of the `DTR_*` constants.
    pub dtr_control: u8,
    /// RTS control code, one of the `RTS_*` constants.
    pub rts_control: u8,
    /// Receive-buffer level at which XON is sent.
    pub xon_limit: u16,
    /// Free receive-buffer space at which XOFF is sent.
    pub xoff_limit: u16,
    /// Data bits per character.
    pub byte_size: u8,
    /// Parity code: 0 none, 1 odd, 2 even, 3 mark, 4 space.
    pub parity: u8,
    /// Stop-bit code: 0 one, 1 one and a half, 2 two.
    pub stop_bits: u8,
    /// XON character.
    pub xon_char: u8,
    /// XOFF character.
    pub xoff_char: u8,
    /// Parity-error replacement character.
    pub error_char: u8,
    /// End-of-data character.
    pub eof_char: u8,
    /// Event character.
    pub event_char: u8,
}

impl PortConfiguration {
    /// Derive the native block for this configuration.
    pub fn to_native(&self) -> DeviceControlBlock {
        let mut flags = DcbFlags::BINARY;
        flags.set(DcbFlags::PARITY, self.parity() != Parity::None);
        flags.set(DcbFlags::OUTX_CTS_FLOW, self.cts_flow());
        flags.set(DcbFlags::OUTX_DSR_FLOW, self.dsr_flow());
        flags.set(DcbFlags::DSR_SENSITIVITY, self.dsr_sensitivity());
        flags.set(DcbFlags::TX_CONTINUE_ON_XOFF, self.tx_continue_on_xoff());
        flags.set(DcbFlags::OUT_X, self.xon_xoff_tx());
        flags.set(DcbFlags::IN_X, self.xon_xoff_rx());
        flags.set(DcbFlags::ERROR_CHAR, self.replace_parity_errors());
        flags.set(DcbFlags::NULL, self.discard_null());
        flags.set(DcbFlags::ABORT_ON_ERROR, self.abort_on_error());

        DeviceControlBlock {
            baud_rate: self.baud_rate(),
            flags,
            dtr_control: match self.dtr_control() {
                DtrControl::Disabled => DTR_DISABLE,
                DtrControl::Enabled => DTR_ENABLE,
                DtrControl::Handshake => DTR_HANDSHAKE,
            },
            rts_control: match self.rts_control() {
                RtsControl::Disabled => RTS_DISABLE,
                RtsControl::Enabled => RTS_ENABLE,
                RtsControl::Handshake => RTS_HANDSHAKE,
                RtsControl::Toggle => RTS_TOGGLE,
            },
            xon_limit: self.xon_limit(),
            xoff_limit: self.xoff_limit(),
            byte_size: self.data_bits(),
            parity: match self.parity() {
                Parity::None => 0,
                Parity::Odd => 1,
                Parity::Even => 2,
                Parity::Mark => 3,
                Parity::Space => 4,
            },
            stop_bits: match self.stop_bits() {
                StopBits::One => 0,
                StopBits::OnePointFive => 1,
                StopBits::Two => 2,
            },
            xon_char: self.xon_char(),
            xoff_char: self.xoff_char(),
            error_char: self.error_char(),
            eof_char: self.eof_char(),
            event_char: self.event_char(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::FlowControl;

    #[test]
    fn test_default_block_flags() {
        let dcb = PortConfiguration::new("COM1", 9600).to_native();
        assert_eq!(dcb.flags, DcbFlags::BINARY);
        assert_eq!(dcb.dtr_control, DTR_ENABLE);
        assert_eq!(dcb.rts_control, RTS_ENABLE);
        assert_eq!(dcb.byte_size, 8);
        assert_eq!(dcb.parity, 0);
        assert_eq!(dcb.stop_bits, 0);
        assert_eq!((dcb.xon_char, dcb.xoff_char), (0x11, 0x13));
    }

    #[test]
    fn test_hardware_flow_sets_cts_and_rts_handshake() {
        let mut config = PortConfiguration::new("COM1", 115200);
        config.set_flow_control(FlowControl::Hardware);
        let dcb = config.to_native();
        assert!(dcb.flags.contains(DcbFlags::OUTX_CTS_FLOW));
        assert_eq!(dcb.rts_control, RTS_HANDSHAKE);
        assert!(!dcb.flags.intersects(DcbFlags::OUT_X | DcbFlags::IN_X));
    }

    #[test]
    fn test_software_flow_sets_both_directions() {
        let mut config = PortConfiguration::new("COM1", 9600);
        config.set_flow_control(FlowControl::Software);
        let dcb = config.to_native();
        assert!(dcb.flags.contains(DcbFlags::OUT_X | DcbFlags::IN_X));
        assert!(!dcb.flags.contains(DcbFlags::OUTX_CTS_FLOW));
    }

    #[test]
    fn test_codes_and_switches() {
        let mut config = PortConfiguration::new("/dev/ttyS1", 57600);
        config.set_data_bits(7).unwrap();
        config.set_parity(Parity::Mark);
        config.set_stop_bits(StopBits::Two);
        config.set_dtr_control(DtrControl::Handshake);
        config.set_rts_control(RtsControl::Toggle);
        config.set_discard_null(true);
        config.set_abort_on_error(true);
        config.set_event_char(b'\n');

        let dcb = config.to_native();
        assert_eq!(dcb.baud_rate, 57600);
        assert_eq!(dcb.byte_size, 7);
        assert_eq!(dcb.parity, 3);
        assert_eq!(dcb.stop_bits, 2);
        assert_eq!(dcb.dtr_control, DTR_HANDSHAKE);
        assert_eq!(dcb.rts_control, RTS_TOGGLE);
        assert!(dcb.flags.contains(
            DcbFlags::PARITY | DcbFlags::NULL | DcbFlags::ABORT_ON_ERROR
        ));
        assert_eq!(dcb.event_char, b'\n');
    }
}
