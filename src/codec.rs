use embedded_can::{ExtendedId, Id, StandardId};

use crate::FrameParseError;

/// Extended identifier enable bit in SIDL
pub const SIDL_EXIDE: u8 = 1 << 3;
/// Remote transmission request bit in the DLC register
pub const DLC_RTR: u8 = 1 << 6;

/* Encoding */

pub fn standard_id_to_registers(id: StandardId) -> [u8; 4] {
    let raw = id.as_raw();

    [(raw >> 3) as u8, ((raw & 0x07) << 5) as u8, 0, 0]
}

pub fn extended_id_to_registers(id: ExtendedId) -> [u8; 4] {
    let raw = id.as_raw();

    [
        (raw >> 21) as u8,
        ((((raw >> 18) & 0x07) << 5) as u8) | SIDL_EXIDE | ((raw >> 16) & 0x03) as u8,
        (raw >> 8) as u8,
        raw as u8,
    ]
}

pub fn id_to_registers(id: Id) -> [u8; 4] {
    match id {
        Id::Standard(standard_id) => standard_id_to_registers(standard_id),
        Id::Extended(extended_id) => extended_id_to_registers(extended_id),
    }
}

/* Decoding */

pub fn id_from_registers(registers: &[u8; 4]) -> Result<Id, FrameParseError> {
    let [sidh, sidl, eid8, eid0] = *registers;
    let sid = ((sidh as u32) << 3) | ((sidl as u32) >> 5);

    if sidl & SIDL_EXIDE == 0 {
        let raw = sid as u16;
        return StandardId::new(raw)
            .map(Id::Standard)
            .ok_or(FrameParseError::StandardIdOutOfRange(raw));
    }

    let raw = (sid << 18) | (((sidl & 0x03) as u32) << 16) | ((eid8 as u32) << 8) | eid0 as u32;

    ExtendedId::new(raw)
        .map(Id::Extended)
        .ok_or(FrameParseError::ExtendedIdOutOfRange(raw))
}

/// Raw numeric value of an identifier, for logging and ID arithmetic.
pub fn raw_id(id: Id) -> u32 {
    match id {
        Id::Standard(standard_id) => standard_id.as_raw() as u32,
        Id::Extended(extended_id) => extended_id.as_raw(),
    }
}
