//! Line status, modem pins and the native bitmasks they are decoded from.

use std::fmt;

use bitflags::bitflags;

bitflags! {
    /// Set of line events a transport can wait for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct EventMask: u32 {
        /// A byte was received.
        const RX_CHAR = 0x0001;
        /// The event character was received.
        const RX_FLAG = 0x0002;
        /// The last byte of the output queue was sent.
        const TX_EMPTY = 0x0004;
        /// CTS changed.
        const CTS = 0x0008;
        /// DSR changed.
        const DSR = 0x0010;
        /// RLSD (carrier detect) changed.
        const RLSD = 0x0020;
        /// A break was detected on input.
        const BREAK = 0x0040;
        /// A line-status error (frame, overrun, parity) occurred.
        const ERR = 0x0080;
        /// A ring indicator was detected.
        const RING = 0x0100;

        /// Every received-data event.
        const DATA = Self::RX_CHAR.bits() | Self::RX_FLAG.bits();
        /// Every modem-pin event.
        const MODEM = Self::CTS.bits() | Self::DSR.bits() | Self::RLSD.bits() | Self::RING.bits();
    }
}

bitflags! {
    /// Latched line errors reported by [`NativeStatus::errors`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct LineErrors: u32 {
        /// Receive queue overflowed.
        const RX_OVER = 0x0001;
        /// Hardware overrun: a byte arrived before the previous one was read.
        const OVERRUN = 0x0002;
        /// Parity error.
        const RX_PARITY = 0x0004;
        /// Framing error.
        const FRAME = 0x0008;
        /// Break condition.
        const BREAK = 0x0010;
        /// Output queue full when a byte was queued.
        const TX_FULL = 0x0100;
    }
}

bitflags! {
    /// Reasons transmission is held, reported by [`NativeStatus::hold`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct HoldState: u32 {
        /// Waiting for CTS.
        const CTS_HOLD = 1 << 0;
        /// Waiting for DSR.
        const DSR_HOLD = 1 << 1;
        /// Waiting for RLSD.
        const RLSD_HOLD = 1 << 2;
        /// Waiting because XOFF was received.
        const XOFF_HOLD = 1 << 3;
        /// Waiting because XOFF was sent.
        const XOFF_SENT = 1 << 4;
        /// End-of-data character received.
        const EOF = 1 << 5;
        /// A priority byte is waiting to be sent.
        const TX_IMMEDIATE = 1 << 6;
    }
}

bitflags! {
    /// Modem status word returned by [`crate::transport::PortHandle::query_modem_pins`].
    ///
    /// [RS-232] control lines, same bit values as the usual UART status register.
    ///
    /// [RS-232]: https://en.wikipedia.org/wiki/RS-232
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
    pub struct ModemBits: u32 {
        /// Clear To Send.
        const CTS_ON = 0x0010;
        /// Data Set Ready.
        const DSR_ON = 0x0020;
        /// Ring Indicator.
        const RING_ON = 0x0040;
        /// Receive Line Signal Detect (carrier).
        const RLSD_ON = 0x0080;
    }
}

/// Raw status as returned by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeStatus {
    /// Latched line errors.
    pub errors: LineErrors,
    /// Hold states.
    pub hold: HoldState,
    /// Bytes waiting in the input queue.
    pub in_queue: u32,
    /// Bytes waiting in the output queue.
    pub out_queue: u32,
}

/// Line errors reported through notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LineError {
    /// Framing error.
    Frame,
    /// Character-buffer overrun.
    Overrun,
    /// Parity error.
    Parity,
}

impl fmt::Display for LineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Frame => "framing error",
            Self::Overrun => "overrun",
            Self::Parity => "parity error",
        })
    }
}

/// Point-in-time port status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus {
    /// Transmission waiting for CTS.
    pub cts_hold: bool,
    /// Transmission waiting for DSR.
    pub dsr_hold: bool,
    /// Transmission waiting for RLSD.
    pub rlsd_hold: bool,
    /// Transmission waiting because XOFF was received.
    pub xoff_hold: bool,
    /// Transmission waiting because XOFF was sent.
    pub xoff_sent: bool,
    /// End-of-data character received.
    pub eof: bool,
    /// A priority byte is waiting to be sent.
    pub tx_immediate_waiting: bool,
    /// Bytes waiting in the input queue.
    pub in_queue: u32,
    /// Bytes waiting in the output queue.
    pub out_queue: u32,
    /// Break condition latched.
    pub break_detected: bool,
    /// Framing error latched.
    pub framing_error: bool,
    /// Overrun latched.
    pub overrun: bool,
    /// Input queue overflow latched.
    pub rx_overflow: bool,
    /// Parity error latched.
    pub parity_error: bool,
    /// Output queue full latched.
    pub tx_full: bool,
}

impl PortStatus {
    /// Decode a native status.
    pub fn from_native(native: &NativeStatus) -> Self {
        let hold = native.hold;
        let errors = native.errors;
        Self {
            cts_hold: hold.contains(HoldState::CTS_HOLD),
            dsr_hold: hold.contains(HoldState::DSR_HOLD),
            rlsd_hold: hold.contains(HoldState::RLSD_HOLD),
            xoff_hold: hold.contains(HoldState::XOFF_HOLD),
            xoff_sent: hold.contains(HoldState::XOFF_SENT),
            eof: hold.contains(HoldState::EOF),
            tx_immediate_waiting: hold.contains(HoldState::TX_IMMEDIATE),
            in_queue: native.in_queue,
            out_queue: native.out_queue,
            break_detected: errors.contains(LineErrors::BREAK),
            framing_error: errors.contains(LineErrors::FRAME),
            overrun: errors.contains(LineErrors::OVERRUN),
            rx_overflow: errors.contains(LineErrors::RX_OVER),
            parity_error: errors.contains(LineErrors::RX_PARITY),
            tx_full: errors.contains(LineErrors::TX_FULL),
        }
    }

    /// Whether any line error is latched.
    pub fn has_errors(&self) -> bool {
        self.break_detected
            || self.framing_error
            || self.overrun
            || self.rx_overflow
            || self.parity_error
            || self.tx_full
    }

    /// Whether transmission is held for any reason.
    pub fn is_tx_held(&self) -> bool {
        self.cts_hold || self.dsr_hold || self.rlsd_hold || self.xoff_hold || self.xoff_sent
    }

    /// Frame, overrun and parity errors in notification order.
    pub fn line_errors(&self) -> Vec<LineError> {
        let mut errors = Vec::new();
        if self.framing_error {
            errors.push(LineError::Frame);
        }
        if self.overrun {
            errors.push(LineError::Overrun);
        }
        if self.parity_error {
            errors.push(LineError::Parity);
        }
        errors
    }
}

/// Modem status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModemPin {
    /// Clear To Send.
    Cts,
    /// Data Set Ready.
    Dsr,
    /// Receive Line Signal Detect (carrier).
    Rlsd,
    /// Ring Indicator.
    Ring,
}

impl ModemPin {
    /// Pins in notification order.
    pub const ALL: [Self; 4] = [Self::Cts, Self::Dsr, Self::Rlsd, Self::Ring];

    /// The wait event raised when this pin changes.
    pub const fn event(self) -> EventMask {
        match self {
            Self::Cts => EventMask::CTS,
            Self::Dsr => EventMask::DSR,
            Self::Rlsd => EventMask::RLSD,
            Self::Ring => EventMask::RING,
        }
    }

    /// Bit of this pin in a modem status word.
    pub const fn status_bit(self) -> ModemBits {
        match self {
            Self::Cts => ModemBits::CTS_ON,
            Self::Dsr => ModemBits::DSR_ON,
            Self::Rlsd => ModemBits::RLSD_ON,
            Self::Ring => ModemBits::RING_ON,
        }
    }
}

impl fmt::Display for ModemPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cts => "CTS",
            Self::Dsr => "DSR",
            Self::Rlsd => "RLSD",
            Self::Ring => "RING",
        })
    }
}

/// Snapshot of the modem status lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ModemPins {
    /// Clear To Send.
    pub cts: bool,
    /// Data Set Ready.
    pub dsr: bool,
    /// Receive Line Signal Detect (carrier).
    pub rlsd: bool,
    /// Ring Indicator.
    pub ring: bool,
}

impl ModemPins {
    /// Decode a modem status word.
    pub fn from_native(bits: ModemBits) -> Self {
        Self {
            cts: bits.contains(ModemBits::CTS_ON),
            dsr: bits.contains(ModemBits::DSR_ON),
            rlsd: bits.contains(ModemBits::RLSD_ON),
            ring: bits.contains(ModemBits::RING_ON),
        }
    }

    /// Encode as a modem status word.
    pub fn to_native(self) -> ModemBits {
        ModemPin::ALL
            .iter()
            .filter(|pin| self.get(**pin))
            .fold(ModemBits::empty(), |acc, pin| acc | pin.status_bit())
    }

    /// State of a single pin.
    pub fn get(self, pin: ModemPin) -> bool {
        match pin {
            ModemPin::Cts => self.cts,
            ModemPin::Dsr => self.dsr,
            ModemPin::Rlsd => self.rlsd,
            ModemPin::Ring => self.ring,
        }
    }

    /// Events for every pin that differs between `self` and `other`.
    pub fn changes(self, other: Self) -> EventMask {
        ModemPin::ALL
            .iter()
            .filter(|pin| self.get(**pin) != other.get(**pin))
            .fold(EventMask::empty(), |acc, pin| acc | pin.event())
    }
}
