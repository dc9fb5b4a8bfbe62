//! The context object that owns every component and runs the main loop.
//!
//! Interrupt handlers only touch the shared [`IrqSignals`]; everything else
//! happens inside [`Engine::poll`], which the application calls from its
//! main loop with the current time.

use core::time::Duration;

use heapless::Deque;

use crate::bringup::{BringupError, BringupSequencer};
use crate::cantp::{CanTpSession, FrameSink, DEFAULT_BUFFER_SIZE};
use crate::codec::raw_id;
use crate::config::{Config, ConfigError};
use crate::event::{ErrorKind, StatusFlags};
use crate::frame::{CanFrame, REGISTER_IMAGE_SIZE};
use crate::hal::{IrqSignals, TransferHardware};
use crate::mailbox::{MailboxManager, SendError, TxCompletions, RX_RING_CAPACITY};
use crate::responder::Responder;
use crate::status::StatusEventDispatcher;
use crate::timer::Instant;
use crate::transfer::{Completed, Completion, TransferEngine, TransferError};

/// Transmit priority of CAN-TP frames, the highest the controller offers
const CANTP_PRIORITY: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EngineState {
    BringingUp,
    Ready,
    /// Bring-up gave up; nothing runs until [`Engine::restart`]
    Faulted,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    #[error("Controller bring-up failed")]
    Bringup(#[from] BringupError),
    #[error("Transfer queue error")]
    Transfer(#[from] TransferError),
    #[error("Failed to send a frame")]
    Send(#[from] SendError),
    #[error("The controller is not operational yet")]
    NotReady,
}

/// Hands CAN-TP frames to the session's transmit slot.
struct SlotSink<'s> {
    mailbox: &'s mut MailboxManager,
    transfers: &'s mut TransferEngine,
    slot: u8,
}

impl FrameSink for SlotSink<'_> {
    fn send(&mut self, frame: &CanFrame) -> Result<(), SendError> {
        self.mailbox
            .request_send(self.slot, frame, CANTP_PRIORITY, self.transfers)
    }
}

pub struct Engine<'a, H, R, const N: usize = DEFAULT_BUFFER_SIZE>
where
    H: TransferHardware,
    R: Responder,
{
    hw: H,
    signals: &'a IrqSignals,
    responder: R,
    config: Config,

    transfers: TransferEngine,
    bringup: BringupSequencer,
    mailbox: MailboxManager,
    status: StatusEventDispatcher,
    session: CanTpSession<N>,

    other: Deque<CanFrame, RX_RING_CAPACITY>,
    last_poll: Option<Instant>,
    faulted: bool,
}

impl<'a, H, R, const N: usize> Engine<'a, H, R, N>
where
    H: TransferHardware,
    R: Responder,
{
    pub fn new(hw: H, signals: &'a IrqSignals, responder: R, config: Config) -> Result<Self, Error> {
        config.validate()?;

        Ok(Self {
            hw,
            signals,
            responder,
            transfers: TransferEngine::new(),
            bringup: BringupSequencer::new(&config),
            mailbox: MailboxManager::new(config.tx_slot_timeout),
            status: StatusEventDispatcher::new(config.status_poll_interval),
            session: CanTpSession::new(&config),
            other: Deque::new(),
            last_poll: None,
            faulted: false,
            config,
        })
    }

    pub fn state(&self) -> EngineState {
        if self.faulted {
            EngineState::Faulted
        } else if self.bringup.is_ready() {
            EngineState::Ready
        } else {
            EngineState::BringingUp
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hardware(&self) -> &H {
        &self.hw
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hw
    }

    pub fn mailbox(&self) -> &MailboxManager {
        &self.mailbox
    }

    pub fn session(&self) -> &CanTpSession<N> {
        &self.session
    }

    /// The most severe error the controller last reported
    pub fn error_state(&self) -> Option<ErrorKind> {
        self.status.error_state()
    }

    /// Runs the bring-up again from the controller reset. Transmit slots,
    /// the CAN-TP exchange and the status bookkeeping start over with it.
    pub fn restart(&mut self) {
        let dropped = self.transfers.discard_queued();
        debug!("restart dropped {} queued transfers", dropped);
        self.bringup.restart();
        self.mailbox.reset_slots();
        self.session.reset();
        self.status = StatusEventDispatcher::new(self.config.status_poll_interval);
        self.signals.take_status_changed();
        self.faulted = false;
    }

    /// One pass of the main loop. Never blocks.
    ///
    /// Returns the bring-up error once when it happens; later passes report
    /// [`EngineState::Faulted`] until the engine is restarted.
    pub fn poll(&mut self, now: Instant) -> Result<EngineState, Error> {
        if self.faulted {
            return Ok(EngineState::Faulted);
        }

        let elapsed = Duration::from_millis(self.last_poll.map_or(0, |last| now.millis_since(last)));
        self.last_poll = Some(now);

        if self.signals.take_transfer_done() {
            self.transfers.complete(&mut self.hw);
        }
        while let Some(done) = self.transfers.pop_completed() {
            self.handle_completion(done, now);
        }

        if !self.bringup.is_ready() {
            if let Err(error) = self.bringup.poll(&mut self.transfers) {
                self.faulted = true;
                return Err(error.into());
            }
            self.transfers.dispatch(&mut self.hw);
            return Ok(self.state());
        }

        let irq = self.signals.take_status_changed();
        if let Err(error) = self.status.poll(irq, &mut self.transfers) {
            debug!("status round deferred: {:?}", error);
        }

        let expired = self.mailbox.tick(elapsed, &mut self.transfers);
        self.forward_completions(expired, now);

        self.route_received(now);

        let mut sink = SlotSink {
            mailbox: &mut self.mailbox,
            transfers: &mut self.transfers,
            slot: self.config.cantp_slot,
        };
        self.session.poll(now, &mut sink);

        self.transfers.dispatch(&mut self.hw);
        Ok(EngineState::Ready)
    }

    /// Takes the next received frame that was not a diagnostic request.
    pub fn receive_other(&mut self) -> Option<CanFrame> {
        self.other.pop_front()
    }

    /// Sends `frame` on the first idle slot not reserved for CAN-TP and
    /// returns that slot.
    pub fn send_frame(&mut self, frame: &CanFrame, priority: u8) -> Result<u8, Error> {
        if self.state() != EngineState::Ready {
            return Err(Error::NotReady);
        }

        let slot = self
            .mailbox
            .first_idle_slot(Some(self.config.cantp_slot))
            .ok_or(SendError::NoIdleSlot)?;
        self.mailbox
            .request_send(slot, frame, priority, &mut self.transfers)?;

        Ok(slot)
    }

    fn handle_completion(&mut self, done: Completed, now: Instant) {
        match done.completion {
            Completion::None => {}
            Completion::Bringup => self.bringup.on_completion(done.rx()),
            Completion::Status => {
                let status = StatusFlags(done.rx().first().copied().unwrap_or(0));
                let confirmed = self
                    .status
                    .on_status(status, &mut self.transfers, &mut self.mailbox);
                self.forward_completions(confirmed, now);
            }
            Completion::Interrupts => self.status.on_interrupts(done.rx(), &mut self.transfers),
            Completion::RxBuffer(buffer) => {
                self.status.on_rx_buffer(buffer);
                self.receive_image(done.rx());
            }
            Completion::TxRequested(slot) => self.mailbox.on_tx_requested(slot, done.handle),
        }
    }

    fn receive_image(&mut self, rx: &[u8]) {
        let Ok(image) = <[u8; REGISTER_IMAGE_SIZE]>::try_from(rx) else {
            warn!("short receive buffer read ({} bytes)", rx.len());
            return;
        };

        match CanFrame::from_registers(&image) {
            Ok(frame) => self.mailbox.push_received(frame),
            Err(error) => warn!("dropping unreadable frame: {:?}", error),
        }
    }

    fn forward_completions(&mut self, completions: TxCompletions, now: Instant) {
        for completion in completions {
            let mut sink = SlotSink {
                mailbox: &mut self.mailbox,
                transfers: &mut self.transfers,
                slot: self.config.cantp_slot,
            };
            self.session
                .on_tx_complete(completion.slot, completion.id, now, &mut sink);
        }
    }

    fn route_received(&mut self, now: Instant) {
        while let Some(frame) = self.mailbox.pop_received() {
            if !self.config.accepts_request(frame.id()) {
                if self.other.push_back(frame).is_err() {
                    warn!("pass-through ring full, dropped {:#x}", raw_id(frame.id()));
                }
                continue;
            }

            let mut sink = SlotSink {
                mailbox: &mut self.mailbox,
                transfers: &mut self.transfers,
                slot: self.config.cantp_slot,
            };
            self.session
                .on_frame(&frame, now, &mut sink, &mut self.responder);
        }
    }
}
