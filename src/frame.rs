use embedded_can::Id;

use crate::codec::{id_from_registers, id_to_registers, DLC_RTR};

/// Size of a frame as laid out in the controller's transmit and receive
/// buffers (SIDH, SIDL, EID8, EID0, DLC, D0..D7).
pub const REGISTER_IMAGE_SIZE: usize = 13;

/// Represents a classic CAN 2.0 frame which supports RTR (Remote
/// Transmission Request).
///
/// The DLC can be up to 8 bytes, and the data if absent means that it is an
/// RTR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanFrame {
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    id: Id,
    dlc: usize,
    data: Option<[u8; 8]>,
}

impl CanFrame {
    /// Creates a new data frame. `data` must have a length in the range
    /// 0..=8 or else `None` will be returned instead.
    pub fn new_data(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        if data.len() > 8 {
            return None;
        }

        let mut copy = [0u8; 8];
        copy[..data.len()].copy_from_slice(data);

        Some(Self {
            id: id.into(),
            dlc: data.len(),
            data: Some(copy),
        })
    }

    /// Creates a full 8 byte data frame from an already padded payload.
    pub fn from_payload(id: impl Into<Id>, payload: [u8; 8]) -> Self {
        Self {
            id: id.into(),
            dlc: 8,
            data: Some(payload),
        }
    }

    /// Creates a new remote frame. `dlc` must be in the range 0..=8 or else
    /// `None` will be returned instead.
    pub fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        if dlc > 8 {
            return None;
        }

        Some(Self {
            id: id.into(),
            dlc,
            data: None,
        })
    }

    /// Gets the message ID of the frame
    pub fn id(&self) -> Id {
        self.id
    }

    /// Gets the DLC (Data Length Code) of the frame
    pub fn dlc(&self) -> usize {
        self.dlc
    }

    /// Gets the data associated with the frame. Will return `None` if it is an
    /// RTR frame.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_ref().map(|d| &d[..self.dlc])
    }

    pub fn is_remote(&self) -> bool {
        self.data.is_none()
    }

    /// Decodes a frame from the register image read out of a receive buffer.
    pub fn from_registers(image: &[u8; REGISTER_IMAGE_SIZE]) -> Result<Self, FrameParseError> {
        let id = id_from_registers(&[image[0], image[1], image[2], image[3]])?;
        let dlc = image[4] & 0x0F;

        if dlc > 8 {
            return Err(FrameParseError::InvalidDataLengthCode(dlc));
        }

        if image[4] & DLC_RTR != 0 {
            return Ok(Self {
                id,
                dlc: dlc as usize,
                data: None,
            });
        }

        let mut data = [0u8; 8];
        data.copy_from_slice(&image[5..]);

        Ok(Self {
            id,
            dlc: dlc as usize,
            data: Some(data),
        })
    }

    /// Encodes the frame into the register image expected by a transmit
    /// buffer load.
    pub fn to_registers(&self) -> [u8; REGISTER_IMAGE_SIZE] {
        let mut image = [0u8; REGISTER_IMAGE_SIZE];

        image[..4].copy_from_slice(&id_to_registers(self.id));
        image[4] = self.dlc as u8;

        match &self.data {
            Some(data) => image[5..].copy_from_slice(data),
            None => image[4] |= DLC_RTR,
        }

        image
    }
}

impl embedded_can::Frame for CanFrame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        Self::new_data(id, data)
    }

    fn new_remote(id: impl Into<Id>, dlc: usize) -> Option<Self> {
        Self::new_remote(id, dlc)
    }

    fn is_extended(&self) -> bool {
        matches!(self.id, Id::Extended(_))
    }

    fn is_remote_frame(&self) -> bool {
        self.is_remote()
    }

    fn id(&self) -> Id {
        self.id
    }

    fn dlc(&self) -> usize {
        self.dlc
    }

    fn data(&self) -> &[u8] {
        self.data().unwrap_or(&[])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FrameParseError {
    #[error("Received a CAN Standard ID ({0:?}) that was out of the valid range (0..=0x7FF)")]
    StandardIdOutOfRange(u16),
    #[error("Received a CAN Extended ID ({0:?}) that was out of the valid range (0..=0x1FFFFFFF)")]
    ExtendedIdOutOfRange(u32),
    #[error("Received a CAN 2 DLC ({0:?}) that was out of the valid range (0..=8)")]
    InvalidDataLengthCode(u8),
}
