//! Software side of the controller's mailboxes: a ring of received frames
//! and the bookkeeping for the three transmit slots.

use core::time::Duration;

use embedded_can::Id;
use heapless::{Deque, Vec};

use crate::codec::raw_id;
use crate::command::register;
use crate::event::{StatusFlags, TX_SLOT_COUNT};
use crate::frame::CanFrame;
use crate::transfer::{Completion, Handle, TransferEngine, TransferError};

/// Frames held between the status dispatcher and their consumers
pub const RX_RING_CAPACITY: usize = 16;

/// Transfers needed to hand a frame to a transmit slot: priority, load, RTS
const SEND_TRANSFERS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlotState {
    Idle,
    /// Loaded with the given priority, request-to-send not issued yet
    Queued(u8),
    /// Request-to-send issued, waiting for the controller to clear TXREQ
    PendingConfirmation,
    Confirmed,
}

#[derive(Debug, Clone, Copy)]
struct TxSlot {
    state: SlotState,
    id: Option<Id>,
    /// The request-to-send queued for the current occupant
    rts: Option<Handle>,
    remaining: Duration,
}

impl TxSlot {
    const IDLE: Self = Self {
        state: SlotState::Idle,
        id: None,
        rts: None,
        remaining: Duration::ZERO,
    };
}

/// A transmit slot that became free again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxCompletion {
    pub slot: u8,
    #[cfg_attr(feature = "defmt", defmt(Debug2Format))]
    pub id: Id,
    /// `false` when the slot was reclaimed by its timeout
    pub confirmed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SendError {
    #[error("Transmit slot ({0:?}) is busy")]
    SlotBusy(u8),
    #[error("Transmit slot ({0:?}) does not exist")]
    InvalidSlot(u8),
    #[error("No transmit slot is idle")]
    NoIdleSlot,
    #[error("Failed to queue the transmit requests")]
    Transfer(#[from] TransferError),
}

pub type TxCompletions = Vec<TxCompletion, TX_SLOT_COUNT>;

pub struct MailboxManager {
    rx: Deque<CanFrame, RX_RING_CAPACITY>,
    dropped: u32,
    slots: [TxSlot; TX_SLOT_COUNT],
    timeout: Duration,
}

impl MailboxManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            rx: Deque::new(),
            dropped: 0,
            slots: [TxSlot::IDLE; TX_SLOT_COUNT],
            timeout,
        }
    }

    /// Appends a received frame, dropping it if the ring is full.
    pub fn push_received(&mut self, frame: CanFrame) {
        if self.rx.push_back(frame).is_err() {
            self.dropped = self.dropped.saturating_add(1);
            warn!(
                "rx ring full, dropped frame {:#x} ({} total)",
                raw_id(frame.id()),
                self.dropped
            );
        }
    }

    pub fn pop_received(&mut self) -> Option<CanFrame> {
        self.rx.pop_front()
    }

    pub fn received_len(&self) -> usize {
        self.rx.len()
    }

    /// Frames lost to a full receive ring
    pub fn dropped(&self) -> u32 {
        self.dropped
    }

    pub fn slot_state(&self, slot: u8) -> Option<SlotState> {
        self.slots.get(slot as usize).map(|s| s.state)
    }

    /// Lowest idle slot other than `reserved`
    pub fn first_idle_slot(&self, reserved: Option<u8>) -> Option<u8> {
        (0..TX_SLOT_COUNT as u8)
            .filter(|slot| Some(*slot) != reserved)
            .find(|slot| self.slots[*slot as usize].state == SlotState::Idle)
    }

    /// Forgets every transmit slot without reporting completions. Used when
    /// the controller itself was reset and its mailboxes are empty.
    pub fn reset_slots(&mut self) {
        self.slots = [TxSlot::IDLE; TX_SLOT_COUNT];
    }

    /// Loads `frame` into transmit slot `slot` and requests it be sent.
    ///
    /// Either all three transfers (priority, load, request-to-send) are
    /// queued or none are. The slot's timeout starts counting now.
    pub fn request_send(
        &mut self,
        slot: u8,
        frame: &CanFrame,
        priority: u8,
        transfers: &mut TransferEngine,
    ) -> Result<(), SendError> {
        let entry = self
            .slots
            .get_mut(slot as usize)
            .ok_or(SendError::InvalidSlot(slot))?;

        if entry.state != SlotState::Idle {
            return Err(SendError::SlotBusy(slot));
        }
        if transfers.free() < SEND_TRANSFERS {
            return Err(SendError::Transfer(TransferError::QueueFull));
        }

        let priority = priority & register::TXP_MASK;
        transfers.bit_modify(
            register::txb_ctrl(slot),
            register::TXP_MASK,
            priority,
            Completion::None,
        )?;
        transfers.load_tx_buffer(slot, &frame.to_registers())?;
        let rts = transfers.request_to_send(1 << slot, Completion::TxRequested(slot))?;

        entry.state = SlotState::Queued(priority);
        entry.id = Some(frame.id());
        entry.rts = Some(rts);
        entry.remaining = self.timeout;

        trace!("slot {} queued {:#x}", slot, raw_id(frame.id()));
        Ok(())
    }

    /// The request-to-send `handle` for `slot` went out on the SPI bus.
    /// A request left over from a reclaimed occupant is ignored.
    pub fn on_tx_requested(&mut self, slot: u8, handle: Handle) {
        match self.slots.get_mut(slot as usize) {
            Some(entry)
                if matches!(entry.state, SlotState::Queued(_)) && entry.rts == Some(handle) =>
            {
                entry.state = SlotState::PendingConfirmation;
            }
            _ => debug!("request-to-send for slot {} no longer tracked", slot),
        }
    }

    /// Confirms every pending slot whose TXREQ the status snapshot shows
    /// cleared and hands the freed slots back.
    pub fn reconcile(&mut self, status: StatusFlags) -> TxCompletions {
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.state == SlotState::PendingConfirmation && !status.tx_pending(slot) {
                entry.state = SlotState::Confirmed;
            }
        }

        let mut completions = TxCompletions::new();
        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if entry.state != SlotState::Confirmed {
                continue;
            }
            if let Some(id) = entry.id {
                completions
                    .push(TxCompletion {
                        slot: slot as u8,
                        id,
                        confirmed: true,
                    })
                    .ok();
            }
            *entry = TxSlot::IDLE;
        }

        completions
    }

    /// Counts down the slot timeouts. Slots that run out are reclaimed
    /// without confirmation and their pending request is aborted.
    pub fn tick(&mut self, elapsed: Duration, transfers: &mut TransferEngine) -> TxCompletions {
        let mut completions = TxCompletions::new();

        for (slot, entry) in self.slots.iter_mut().enumerate() {
            if !matches!(
                entry.state,
                SlotState::Queued(_) | SlotState::PendingConfirmation
            ) {
                continue;
            }

            entry.remaining = entry.remaining.saturating_sub(elapsed);
            if !entry.remaining.is_zero() {
                continue;
            }

            let Some(id) = entry.id else {
                *entry = TxSlot::IDLE;
                continue;
            };

            warn!(
                "slot {} timed out sending {:#x}, reclaiming",
                slot,
                raw_id(id)
            );
            if transfers
                .bit_modify(
                    register::txb_ctrl(slot as u8),
                    register::TXREQ,
                    0,
                    Completion::None,
                )
                .is_err()
            {
                warn!("could not abort slot {}", slot);
            }

            *entry = TxSlot::IDLE;
            completions
                .push(TxCompletion {
                    slot: slot as u8,
                    id,
                    confirmed: false,
                })
                .ok();
        }

        completions
    }
}
