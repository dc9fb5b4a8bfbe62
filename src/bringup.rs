//! Controller bring-up: reset, enter configuration mode, program timing and
//! buffers, then leave configuration mode.
//!
//! Each state issues its requests once, then waits for the read-back that
//! the last of them produces. The read-back goes through [`transition`],
//! which either advances, asks for the same state to be run again, or gives
//! up. Retries are counted per state and capped by the configured ceiling.

use crate::command::{register, OperatingMode};
use crate::config::Config;
use crate::transfer::{Completion, TransferEngine, TransferError};
use crate::Instruction;

/// CANSTAT read-back while the controller is still in its oscillator
/// start-up and not driving MISO
const NOT_RESPONDING: u8 = 0xFF;

/// RXnBF pins as interrupt outputs for their receive buffer
const BFPCTRL_RX_INTERRUPTS: u8 = 0x0F;
/// TXnRTS pins as plain digital inputs
const TXRTSCTRL_INPUTS: u8 = 0x00;
/// RXB0: accept any frame, roll over into RXB1 when full
const RXB0CTRL_ANY_ROLLOVER: u8 = 0x64;
/// RXB1: accept any frame
const RXB1CTRL_ANY: u8 = 0x60;
/// RX0IE, RX1IE, TX0IE, TX1IE, TX2IE and ERRIE
const CANINTE_ENABLED: u8 = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BringupState {
    /// Issue the reset instruction and wait for it to go out
    Reset,
    /// Poll CANSTAT until the controller answers again
    AwaitReset,
    /// Request configuration mode until CANSTAT confirms it
    ConfigMode,
    /// Write timing, pin function and buffer configuration
    Parameters,
    /// Request the operating mode until CANSTAT leaves configuration
    StartMode,
    Operational,
    Failed,
}

/// Outcome of feeding a read-back into the transition table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Transition {
    Advance(BringupState),
    Retry,
    Fail(BringupError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BringupError {
    #[error("Controller did not converge in state {state:?} after {attempts:?} attempts")]
    NonConvergence { state: BringupState, attempts: u32 },
    #[error("CANSTAT read-back ({0:?}) is not a valid operating mode")]
    InvalidReadback(u8),
    #[error("Failed to queue a bring-up request")]
    Transfer(#[from] TransferError),
}

/// The transition table. `readback` is the CANSTAT value that the state's
/// last request returned (zero for the reset itself).
pub fn transition(state: BringupState, readback: u8) -> Transition {
    match state {
        BringupState::Reset => Transition::Advance(BringupState::AwaitReset),
        BringupState::AwaitReset => {
            if readback == NOT_RESPONDING {
                Transition::Retry
            } else {
                Transition::Advance(BringupState::ConfigMode)
            }
        }
        BringupState::ConfigMode => match OperatingMode::from_canstat(readback) {
            Ok(OperatingMode::Configuration) => Transition::Advance(BringupState::Parameters),
            Ok(_) => Transition::Retry,
            Err(_) => Transition::Fail(BringupError::InvalidReadback(readback)),
        },
        BringupState::Parameters => Transition::Advance(BringupState::StartMode),
        BringupState::StartMode => match OperatingMode::from_canstat(readback) {
            Ok(OperatingMode::Configuration) => Transition::Retry,
            Ok(_) => Transition::Advance(BringupState::Operational),
            Err(_) => Transition::Fail(BringupError::InvalidReadback(readback)),
        },
        BringupState::Operational | BringupState::Failed => Transition::Retry,
    }
}

pub struct BringupSequencer {
    state: BringupState,
    waiting: bool,
    attempts: u32,
    retry_limit: u32,
    last_readback: u8,
    timing: [u8; 3],
    mode: OperatingMode,
    error: Option<BringupError>,
}

impl BringupSequencer {
    pub fn new(config: &Config) -> Self {
        Self {
            state: BringupState::Reset,
            waiting: false,
            attempts: 0,
            retry_limit: config.bringup_retry_limit,
            last_readback: 0,
            timing: config.bit_rate.timing(),
            mode: config.operating_mode,
            error: None,
        }
    }

    pub fn state(&self) -> BringupState {
        self.state
    }

    /// The CANSTAT value behind the last retry-or-advance decision
    pub fn last_readback(&self) -> u8 {
        self.last_readback
    }

    pub fn is_ready(&self) -> bool {
        self.state == BringupState::Operational
    }

    /// Starts over from the reset, e.g. after a reported failure.
    pub fn restart(&mut self) {
        info!("restarting controller bring-up");
        self.state = BringupState::Reset;
        self.waiting = false;
        self.attempts = 0;
        self.error = None;
    }

    /// Advances the sequence as far as it can without blocking. Returns
    /// `Ok(true)` once the controller is operational.
    pub fn poll(&mut self, transfers: &mut TransferEngine) -> Result<bool, BringupError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        if self.waiting || self.state == BringupState::Operational {
            return Ok(self.is_ready());
        }
        if transfers.free() < self.requests_needed() {
            debug!("bring-up waiting for queue space");
            return Ok(false);
        }

        match self.state {
            BringupState::Reset => {
                transfers.enqueue(Instruction::Reset, 0, &[], 0, Completion::Bringup)?;
            }
            BringupState::AwaitReset => {
                transfers.read(register::CANSTAT, 1, Completion::Bringup)?;
            }
            BringupState::ConfigMode => {
                transfers.request_mode(OperatingMode::Configuration, Completion::None)?;
                transfers.read(register::CANSTAT, 1, Completion::Bringup)?;
            }
            BringupState::Parameters => {
                transfers.write(register::CNF3, &self.timing, Completion::None)?;
                transfers.write(register::BFPCTRL, &[BFPCTRL_RX_INTERRUPTS], Completion::None)?;
                transfers.write(register::TXRTSCTRL, &[TXRTSCTRL_INPUTS], Completion::None)?;
                transfers.write(register::RXB0CTRL, &[RXB0CTRL_ANY_ROLLOVER], Completion::None)?;
                transfers.write(register::RXB1CTRL, &[RXB1CTRL_ANY], Completion::None)?;
                transfers.write(register::CANINTF, &[0x00], Completion::None)?;
                transfers.write(register::CANINTE, &[CANINTE_ENABLED], Completion::Bringup)?;
            }
            BringupState::StartMode => {
                transfers.request_mode(self.mode, Completion::None)?;
                transfers.read(register::CANSTAT, 1, Completion::Bringup)?;
            }
            BringupState::Operational | BringupState::Failed => {}
        }

        self.waiting = true;
        Ok(false)
    }

    fn requests_needed(&self) -> usize {
        match self.state {
            BringupState::Parameters => 7,
            BringupState::ConfigMode | BringupState::StartMode => 2,
            _ => 1,
        }
    }

    /// Feeds the read-back of the state's last request into the table.
    pub fn on_completion(&mut self, rx: &[u8]) {
        if !self.waiting {
            warn!("unexpected bring-up completion in {:?}", self.state);
            return;
        }
        self.waiting = false;

        let readback = rx.first().copied().unwrap_or(0);
        self.last_readback = readback;

        match transition(self.state, readback) {
            Transition::Advance(next) => {
                debug!("bring-up {:?} -> {:?}", self.state, next);
                if next == BringupState::Operational {
                    info!("controller operational, CANSTAT {:#x}", readback);
                }
                self.state = next;
                self.attempts = 0;
            }
            Transition::Retry => {
                self.attempts += 1;
                if self.attempts >= self.retry_limit {
                    self.fail(BringupError::NonConvergence {
                        state: self.state,
                        attempts: self.attempts,
                    });
                }
            }
            Transition::Fail(error) => self.fail(error),
        }
    }

    fn fail(&mut self, error: BringupError) {
        error!("controller bring-up failed: {:?}", error);
        self.state = BringupState::Failed;
        self.error = Some(error);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::TransferHardware;

    /// Answers every CANSTAT read from a script, then repeats the last value.
    struct ScriptedCanstat {
        script: std::vec::Vec<u8>,
        reads: usize,
        pending_read: bool,
    }

    impl ScriptedCanstat {
        fn new(script: &[u8]) -> Self {
            Self {
                script: script.to_vec(),
                reads: 0,
                pending_read: false,
            }
        }
    }

    impl TransferHardware for ScriptedCanstat {
        fn begin(&mut self, tx: &[u8], _rx_len: usize) {
            self.pending_read = tx == [u8::from(Instruction::Read), register::CANSTAT];
        }

        fn collect(&mut self, rx: &mut [u8]) {
            if self.pending_read {
                let index = self.reads.min(self.script.len() - 1);
                rx[0] = self.script[index];
                self.reads += 1;
            }
        }
    }

    fn run(
        sequencer: &mut BringupSequencer,
        hw: &mut ScriptedCanstat,
        passes: usize,
    ) -> Result<bool, BringupError> {
        let mut transfers = TransferEngine::new();
        for _ in 0..passes {
            if transfers.dispatch(hw) {
                transfers.complete(hw);
            }
            while let Some(done) = transfers.pop_completed() {
                if done.completion == Completion::Bringup {
                    sequencer.on_completion(done.rx());
                }
            }
            if sequencer.poll(&mut transfers)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    #[test]
    fn table() {
        assert_eq!(
            transition(BringupState::AwaitReset, 0xFF),
            Transition::Retry
        );
        assert_eq!(
            transition(BringupState::AwaitReset, 0x80),
            Transition::Advance(BringupState::ConfigMode)
        );
        assert_eq!(
            transition(BringupState::ConfigMode, 0x00),
            Transition::Retry
        );
        assert_eq!(
            transition(BringupState::ConfigMode, 0x80),
            Transition::Advance(BringupState::Parameters)
        );
        assert_eq!(
            transition(BringupState::StartMode, 0x80),
            Transition::Retry
        );
        assert_eq!(
            transition(BringupState::StartMode, 0x40),
            Transition::Advance(BringupState::Operational)
        );
        assert_eq!(
            transition(BringupState::StartMode, 0xE0),
            Transition::Fail(BringupError::InvalidReadback(0xE0))
        );
    }

    #[test]
    fn converges_after_retries() {
        let mut sequencer = BringupSequencer::new(&Config::default());
        // not responding twice, config mode on the second ask, then normal
        let mut hw = ScriptedCanstat::new(&[0xFF, 0xFF, 0x80, 0x00, 0x80, 0x80, 0x00]);

        assert_eq!(run(&mut sequencer, &mut hw, 200), Ok(true));
        assert!(sequencer.is_ready());
        assert_eq!(sequencer.last_readback(), 0x00);
    }

    #[test]
    fn retry_ceiling_reports_failure() {
        let config = Config {
            bringup_retry_limit: 5,
            ..Config::default()
        };
        let mut sequencer = BringupSequencer::new(&config);
        let mut hw = ScriptedCanstat::new(&[0xFF]);

        assert_eq!(
            run(&mut sequencer, &mut hw, 200),
            Err(BringupError::NonConvergence {
                state: BringupState::AwaitReset,
                attempts: 5
            })
        );
        assert_eq!(sequencer.state(), BringupState::Failed);

        sequencer.restart();
        assert_eq!(sequencer.state(), BringupState::Reset);
    }
}
