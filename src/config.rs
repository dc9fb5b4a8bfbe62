//! Runtime configuration for the engine and the CAN-TP session.

use core::time::Duration;

use embedded_can::{Id, StandardId};

use crate::command::{NominalBitRate, OperatingMode};
use crate::event::TX_SLOT_COUNT;

/// Functional (broadcast) diagnostic request identifier
pub const BROADCAST_REQUEST_ID: u16 = 0x7DF;
/// Physical request identifier of unit 0
pub const REQUEST_ID_BASE: u16 = 0x7E0;
/// Responses go out on the request identifier plus this offset
pub const RESPONSE_ID_OFFSET: u16 = 8;
/// Highest unit address, giving request identifiers 0x7E0..=0x7E7
pub const MAX_UNIT: u8 = 7;

#[derive(Debug, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config {
    /// Unit address, selects the physical request and response identifiers.
    pub unit: u8,
    /// Bus bit rate programmed during bring-up.
    pub bit_rate: NominalBitRate,
    /// Mode requested when leaving configuration mode.
    pub operating_mode: OperatingMode,
    /// How long a transmit slot may wait for its confirmation before it is
    /// reclaimed.
    pub tx_slot_timeout: Duration,
    /// Idle main-loop passes between unsolicited status polls.
    pub status_poll_interval: u32,
    /// Retries of a single bring-up state before it is reported as failed.
    pub bringup_retry_limit: u32,
    /// Timeout waiting for flow control after a First frame or a WAIT.
    pub flow_wait_timeout: Duration,
    /// Block size granted to peers sending us multi-frame requests (0 = unlimited).
    pub rx_block_size: u8,
    /// Raw separation time byte granted to peers sending us multi-frame requests.
    pub rx_separation_time: u8,
    /// Transmit slot the CAN-TP session sends on.
    pub cantp_slot: u8,
    /// Filler for the unused tail of CAN-TP frames.
    pub padding: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unit: 0,
            bit_rate: NominalBitRate::default(),
            operating_mode: OperatingMode::Normal,
            tx_slot_timeout: Duration::from_millis(1000),
            status_poll_interval: 100,
            bringup_retry_limit: 1000,
            flow_wait_timeout: Duration::from_secs(10),
            rx_block_size: 1,
            rx_separation_time: 0,
            cantp_slot: 0,
            padding: 0x55,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConfigError {
    #[error("Unit address ({0:?}) is out of range")]
    UnitOutOfRange(u8),
    #[error("Transmit slot ({0:?}) does not exist")]
    InvalidSlot(u8),
    #[error("Operating mode ({0:?}) cannot carry traffic")]
    InvalidOperatingMode(OperatingMode),
    #[error("The bring-up retry limit must be at least one")]
    ZeroRetryLimit,
    #[error("The status poll interval must be at least one pass")]
    ZeroPollInterval,
    #[error("The transmit slot timeout must be at least one millisecond")]
    ZeroSlotTimeout,
    #[error("The flow control timeout must be at least one millisecond")]
    ZeroFlowTimeout,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.unit > MAX_UNIT {
            return Err(ConfigError::UnitOutOfRange(self.unit));
        }
        if self.cantp_slot as usize >= TX_SLOT_COUNT {
            return Err(ConfigError::InvalidSlot(self.cantp_slot));
        }
        if matches!(
            self.operating_mode,
            OperatingMode::Configuration | OperatingMode::Sleep
        ) {
            return Err(ConfigError::InvalidOperatingMode(self.operating_mode));
        }
        if self.bringup_retry_limit == 0 {
            return Err(ConfigError::ZeroRetryLimit);
        }
        if self.status_poll_interval == 0 {
            return Err(ConfigError::ZeroPollInterval);
        }
        // timers count in whole milliseconds
        if self.tx_slot_timeout.as_millis() == 0 {
            return Err(ConfigError::ZeroSlotTimeout);
        }
        if self.flow_wait_timeout.as_millis() == 0 {
            return Err(ConfigError::ZeroFlowTimeout);
        }
        Ok(())
    }

    /// Physical request identifier of this unit, 0x7E0 + unit
    pub fn request_id(&self) -> StandardId {
        let raw = REQUEST_ID_BASE + u16::from(self.unit.min(MAX_UNIT));
        StandardId::new(raw).unwrap_or(StandardId::MAX)
    }

    /// Response identifier of this unit, request identifier + 8
    pub fn response_id(&self) -> StandardId {
        let raw = REQUEST_ID_BASE + RESPONSE_ID_OFFSET + u16::from(self.unit.min(MAX_UNIT));
        StandardId::new(raw).unwrap_or(StandardId::MAX)
    }

    /// Whether a frame on `id` is a diagnostic request this unit answers:
    /// either the broadcast identifier or its own physical one.
    pub fn accepts_request(&self, id: Id) -> bool {
        match id {
            Id::Standard(id) => {
                id.as_raw() == BROADCAST_REQUEST_ID || id == self.request_id()
            }
            Id::Extended(_) => false,
        }
    }
}
