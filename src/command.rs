use heapless::Vec;
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Register addresses of the SPI CAN controller.
pub mod register {
    pub const BFPCTRL: u8 = 0x0C;
    pub const TXRTSCTRL: u8 = 0x0D;
    pub const CANSTAT: u8 = 0x0E;
    pub const CANCTRL: u8 = 0x0F;
    pub const CNF3: u8 = 0x28;
    pub const CNF2: u8 = 0x29;
    pub const CNF1: u8 = 0x2A;
    pub const CANINTE: u8 = 0x2B;
    pub const CANINTF: u8 = 0x2C;
    pub const EFLG: u8 = 0x2D;
    pub const TXB0CTRL: u8 = 0x30;
    pub const TXB1CTRL: u8 = 0x40;
    pub const TXB2CTRL: u8 = 0x50;
    pub const RXB0CTRL: u8 = 0x60;
    pub const RXB1CTRL: u8 = 0x70;

    /// Control register of the given transmit buffer
    pub const fn txb_ctrl(slot: u8) -> u8 {
        TXB0CTRL + slot * 0x10
    }

    /// REQOP bits in CANCTRL and OPMOD bits in CANSTAT
    pub const MODE_MASK: u8 = 0xE0;
    /// Transmit priority bits in TXBnCTRL
    pub const TXP_MASK: u8 = 0x03;
    /// Transmit request bit in TXBnCTRL, cleared by the controller once sent
    pub const TXREQ: u8 = 0x08;
}

/// SPI instruction opcodes understood by the controller.
///
/// Read, Write and BitModify take a separate address byte; the remaining
/// instructions fold their argument (buffer index or RTS mask) into the low
/// bits of the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = RegisterError, constructor = RegisterError::UnknownInstruction))]
#[repr(u8)]
pub enum Instruction {
    Reset = 0xC0,
    Read = 0x03,
    Write = 0x02,
    BitModify = 0x05,
    ReadStatus = 0xA0,
    RequestToSend = 0x80,
    ReadRxBuffer = 0x90,
    LoadTxBuffer = 0x40,
}

impl Instruction {
    const fn has_address_byte(&self) -> bool {
        matches!(self, Self::Read | Self::Write | Self::BitModify)
    }

    /// Bits of the opcode that carry an inline argument
    const fn argument_mask(&self) -> u8 {
        match self {
            Self::RequestToSend => 0x07,
            Self::ReadRxBuffer => 0x06,
            Self::LoadTxBuffer => 0x07,
            _ => 0x00,
        }
    }

    /// Builds the bytes clocked out ahead of any payload.
    pub fn header(&self, address: u8) -> Vec<u8, 2> {
        let mut header = Vec::new();
        let opcode: u8 = (*self).into();

        if self.has_address_byte() {
            header.extend_from_slice(&[opcode, address]).ok();
        } else {
            header.push(opcode | (address & self.argument_mask())).ok();
        }

        header
    }

    /// Splits a header back into instruction and address, the inverse of
    /// [`Instruction::header`].
    pub fn decode(bytes: &[u8]) -> Result<(Self, u8, usize), RegisterError> {
        let opcode = *bytes.first().ok_or(RegisterError::Empty)?;

        for instruction in [Self::Read, Self::Write, Self::BitModify] {
            if opcode == u8::from(instruction) {
                let address = *bytes.get(1).ok_or(RegisterError::Empty)?;
                return Ok((instruction, address, 2));
            }
        }

        for instruction in [
            Self::Reset,
            Self::ReadStatus,
            Self::RequestToSend,
            Self::ReadRxBuffer,
            Self::LoadTxBuffer,
        ] {
            let base: u8 = instruction.into();
            if opcode & !instruction.argument_mask() == base {
                return Ok((instruction, opcode & instruction.argument_mask(), 1));
            }
        }

        Err(RegisterError::UnknownInstruction(opcode))
    }
}

/// Operating modes reported in CANSTAT and requested through CANCTRL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = RegisterError, constructor = RegisterError::InvalidOperatingMode))]
#[repr(u8)]
pub enum OperatingMode {
    Normal = 0b000,
    Sleep = 0b001,
    Loopback = 0b010,
    ListenOnly = 0b011,
    /// The mode the controller comes out of reset in
    #[default]
    Configuration = 0b100,
}

impl OperatingMode {
    /// Decodes the OPMOD field of a CANSTAT read-back
    pub fn from_canstat(canstat: u8) -> Result<Self, RegisterError> {
        Self::try_from((canstat & register::MODE_MASK) >> 5)
    }

    /// Value of the REQOP field to write into CANCTRL
    pub fn reqop(self) -> u8 {
        u8::from(self) << 5
    }
}

/// The bit rate used on the bus, assuming a 16 MHz controller oscillator.
///
/// The byte codes are the digits serial-line CAN adapters use for the same
/// rates, so a stored configuration byte maps straight onto a variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = RegisterError, constructor = RegisterError::InvalidNominalBitrate))]
#[repr(u8)]
pub enum NominalBitRate {
    /// Transmits and receives at 50 Kbit/s
    Rate50Kbit = b'2',
    /// Transmits and receives at 100 Kbit/s
    Rate100Kbit = b'3',
    /// Transmits and receives at 125 Kbit/s
    Rate125Kbit = b'4',
    /// Transmits and receives at 250 Kbit/s
    Rate250Kbit = b'5',
    /// Transmits and receives at 500 Kbit/s
    #[default]
    Rate500Kbit = b'6',
    /// Transmits and receives at 1 Mbit/s
    Rate1Mbit = b'8',
}

impl NominalBitRate {
    /// CNF3, CNF2, CNF1 in register order, ready for one sequential write
    /// starting at CNF3.
    pub const fn timing(&self) -> [u8; 3] {
        match self {
            Self::Rate50Kbit => [0x87, 0xFA, 0x07],
            Self::Rate100Kbit => [0x87, 0xFA, 0x03],
            Self::Rate125Kbit => [0x86, 0xF0, 0x03],
            Self::Rate250Kbit => [0x85, 0xF1, 0x41],
            Self::Rate500Kbit => [0x86, 0xF0, 0x00],
            Self::Rate1Mbit => [0x82, 0xD0, 0x00],
        }
    }
}

/// Errors raised while interpreting controller registers and opcodes
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RegisterError {
    #[error("Tried to decode an empty instruction")]
    Empty,
    #[error("Received an unrecognized instruction opcode ({0:?})")]
    UnknownInstruction(u8),
    #[error("Tried to decode operating mode but it was invalid ({0:?})")]
    InvalidOperatingMode(u8),
    #[error("Tried to decode nominal bitrate but it was invalid ({0:?})")]
    InvalidNominalBitrate(u8),
}
