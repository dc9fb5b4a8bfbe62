//! Encode and decode CAN-TP protocol control information.
//!
//! Only normal addressing on classic 8 byte frames is supported: the PCI
//! always starts at byte 0 and every outgoing frame is padded to 8 bytes.

use core::time::Duration;

use embedded_can::Id;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::frame::CanFrame;

/// Largest message a First frame can announce
pub const MAX_MESSAGE_LEN: usize = 4095;
/// Payload bytes of a Single frame
pub const SINGLE_FRAME_DATA: usize = 7;
/// Payload bytes of a First frame
pub const FIRST_FRAME_DATA: usize = 6;
/// Payload bytes of a Consecutive frame
pub const CONSECUTIVE_FRAME_DATA: usize = 7;

/// Frame type carried in the high nibble of byte 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = PduError, constructor = PduError::UnknownFrameType))]
#[repr(u8)]
pub enum PciType {
    Single = 0x0,
    First = 0x1,
    Consecutive = 0x2,
    FlowControl = 0x3,
}

/// Flow control status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[num_enum(error_type(name = PduError, constructor = PduError::InvalidFlowStatus))]
#[repr(u8)]
pub enum FlowStatus {
    /// Clear to send more consecutive frames.
    ClearToSend = 0x0,
    /// Wait before resuming.
    Wait = 0x1,
    /// Abort due to overflow or a protocol violation.
    Overflow = 0x2,
}

/// A parsed CAN-TP frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Pdu<'a> {
    Single {
        data: &'a [u8],
    },
    First {
        len: u16,
        data: &'a [u8],
    },
    Consecutive {
        index: u8,
        data: &'a [u8],
    },
    FlowControl {
        status: FlowStatus,
        /// Block size, or the expected index on an abort we send ourselves
        block_size: u8,
        /// Separation time in its encoded byte form
        separation_time: u8,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PduError {
    #[error("Tried to decode an empty frame")]
    Empty,
    #[error("Frame type nibble ({0:?}) is not a CAN-TP frame")]
    UnknownFrameType(u8),
    #[error("Single frame length ({0:?}) is invalid")]
    InvalidSingleLength(u8),
    #[error("First frame length ({0:?}) is invalid")]
    InvalidFirstLength(u16),
    #[error("Flow control status ({0:?}) is invalid")]
    InvalidFlowStatus(u8),
    #[error("Frame of type {0:?} is too short")]
    Truncated(PciType),
}

impl<'a> Pdu<'a> {
    /// Interprets the payload of a received CAN frame.
    pub fn decode(data: &'a [u8]) -> Result<Self, PduError> {
        let pci = *data.first().ok_or(PduError::Empty)?;

        match PciType::try_from(pci >> 4)? {
            PciType::Single => {
                let len = pci & 0x0F;
                if len == 0 || len as usize > SINGLE_FRAME_DATA {
                    return Err(PduError::InvalidSingleLength(len));
                }
                if data.len() < 1 + len as usize {
                    return Err(PduError::Truncated(PciType::Single));
                }
                Ok(Pdu::Single {
                    data: &data[1..1 + len as usize],
                })
            }
            PciType::First => {
                if data.len() < 2 {
                    return Err(PduError::Truncated(PciType::First));
                }
                let len = u16::from(pci & 0x0F) << 8 | u16::from(data[1]);
                if len == 0 {
                    return Err(PduError::InvalidFirstLength(len));
                }
                Ok(Pdu::First {
                    len,
                    data: &data[2..],
                })
            }
            PciType::Consecutive => Ok(Pdu::Consecutive {
                index: pci & 0x0F,
                data: &data[1..],
            }),
            PciType::FlowControl => {
                if data.len() < 3 {
                    return Err(PduError::Truncated(PciType::FlowControl));
                }
                Ok(Pdu::FlowControl {
                    status: FlowStatus::try_from(pci & 0x0F)?,
                    block_size: data[1],
                    separation_time: data[2],
                })
            }
        }
    }

    /// Lays the frame out in an 8 byte payload, filling the unused tail with
    /// `padding`. Data beyond what the frame type can carry is dropped.
    pub fn encode(&self, padding: u8) -> [u8; 8] {
        let mut payload = [padding; 8];

        match *self {
            Pdu::Single { data } => {
                let len = data.len().min(SINGLE_FRAME_DATA);
                payload[0] = len as u8;
                payload[1..1 + len].copy_from_slice(&data[..len]);
            }
            Pdu::First { len, data } => {
                let chunk = data.len().min(FIRST_FRAME_DATA);
                payload[0] = u8::from(PciType::First) << 4 | ((len >> 8) as u8 & 0x0F);
                payload[1] = len as u8;
                payload[2..2 + chunk].copy_from_slice(&data[..chunk]);
            }
            Pdu::Consecutive { index, data } => {
                let chunk = data.len().min(CONSECUTIVE_FRAME_DATA);
                payload[0] = u8::from(PciType::Consecutive) << 4 | (index & 0x0F);
                payload[1..1 + chunk].copy_from_slice(&data[..chunk]);
            }
            Pdu::FlowControl {
                status,
                block_size,
                separation_time,
            } => {
                payload[0] = u8::from(PciType::FlowControl) << 4 | u8::from(status);
                payload[1] = block_size;
                payload[2] = separation_time;
            }
        }

        payload
    }

    pub fn to_frame(&self, id: impl Into<Id>, padding: u8) -> CanFrame {
        CanFrame::from_payload(id, self.encode(padding))
    }
}

/// Decodes a separation time byte: 0x00..=0xF0 are milliseconds,
/// 0xF1..=0xF9 are 100 to 900 ms, and the reserved rest is read as the
/// longest valid setting, 127 ms.
pub fn separation_time(raw: u8) -> Duration {
    match raw {
        0x00..=0xF0 => Duration::from_millis(u64::from(raw)),
        0xF1..=0xF9 => Duration::from_millis(u64::from(raw - 0xF0) * 100),
        _ => Duration::from_millis(127),
    }
}
