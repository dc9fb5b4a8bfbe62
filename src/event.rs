/// Number of hardware transmit mailboxes on the controller
pub const TX_SLOT_COUNT: usize = 3;
/// Number of hardware receive buffers on the controller
pub const RX_BUFFER_COUNT: usize = 2;

/// The byte returned by the READ STATUS instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusFlags(pub u8);

impl StatusFlags {
    /// Receive buffer `n` holds a frame that has not been read out yet
    pub fn rx_full(&self, buffer: usize) -> bool {
        buffer < RX_BUFFER_COUNT && self.0 & (1 << buffer) != 0
    }

    /// Transmit slot `n` still has its request-to-send pending
    pub fn tx_pending(&self, slot: usize) -> bool {
        slot < TX_SLOT_COUNT && self.0 & (1 << (2 + slot * 2)) != 0
    }
}

/// CANINTF, the interrupt flag register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct InterruptFlags(pub u8);

impl InterruptFlags {
    pub const RX0IF: u8 = 1 << 0;
    pub const RX1IF: u8 = 1 << 1;
    pub const TX0IF: u8 = 1 << 2;
    pub const TX1IF: u8 = 1 << 3;
    pub const TX2IF: u8 = 1 << 4;
    pub const ERRIF: u8 = 1 << 5;
    pub const WAKIF: u8 = 1 << 6;
    pub const MERRF: u8 = 1 << 7;

    /// Bits the status dispatcher acknowledges itself. Receive flags are
    /// cleared by the READ RX BUFFER instruction instead.
    pub const ACKNOWLEDGED: u8 =
        Self::TX0IF | Self::TX1IF | Self::TX2IF | Self::ERRIF | Self::WAKIF | Self::MERRF;

    pub fn contains(&self, bits: u8) -> bool {
        self.0 & bits == bits
    }

    pub fn to_acknowledge(&self) -> u8 {
        self.0 & Self::ACKNOWLEDGED
    }
}

/// EFLG, the error flag register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ErrorFlags(pub u8);

impl ErrorFlags {
    pub const EWARN: u8 = 1 << 0;
    pub const RXWAR: u8 = 1 << 1;
    pub const TXWAR: u8 = 1 << 2;
    pub const RXEP: u8 = 1 << 3;
    pub const TXEP: u8 = 1 << 4;
    pub const TXBO: u8 = 1 << 5;
    pub const RX0OVR: u8 = 1 << 6;
    pub const RX1OVR: u8 = 1 << 7;

    /// The only EFLG bits that software is allowed to clear
    pub const OVERFLOWS: u8 = Self::RX0OVR | Self::RX1OVR;

    pub fn bus_off(&self) -> bool {
        self.0 & Self::TXBO != 0
    }

    pub fn overflows(&self) -> u8 {
        self.0 & Self::OVERFLOWS
    }

    /// The most severe condition currently flagged
    pub fn severity(&self) -> Option<ErrorKind> {
        if self.bus_off() {
            Some(ErrorKind::BusOff)
        } else if self.0 & (Self::RXEP | Self::TXEP) != 0 {
            Some(ErrorKind::ErrorPassive)
        } else if self.overflows() != 0 {
            Some(ErrorKind::ReceiveOverflow)
        } else if self.0 & (Self::EWARN | Self::RXWAR | Self::TXWAR) != 0 {
            Some(ErrorKind::Warning)
        } else {
            None
        }
    }
}

/// Hardware error conditions surfaced through the status registers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    /// An error counter crossed the warning threshold
    Warning,
    /// The controller went error-passive
    ErrorPassive,
    /// The controller dropped off the bus
    BusOff,
    /// A receive buffer was overwritten before it was read out
    ReceiveOverflow,
}
