//! Turns controller status changes into pull-reads and slot reconciliation.
//!
//! A status round is two reads queued back to back: READ STATUS for the
//! receive and transmit bits, then CANINTF together with EFLG. Rounds start
//! on the controller's interrupt or, when the transfer queue has been idle
//! for a while, on their own. The dispatcher never sends frames.

use crate::command::register;
use crate::event::{ErrorFlags, ErrorKind, InterruptFlags, StatusFlags, RX_BUFFER_COUNT};
use crate::mailbox::{MailboxManager, TxCompletions};
use crate::transfer::{Completion, TransferEngine, TransferError};

/// Transfers queued by one status round
const ROUND_TRANSFERS: usize = 2;

pub struct StatusEventDispatcher {
    poll_interval: u32,
    idle_passes: u32,
    outstanding: bool,
    outstanding_passes: u32,
    rerun: bool,
    rx_reads: [bool; RX_BUFFER_COUNT],
    errors: ErrorFlags,
}

impl StatusEventDispatcher {
    pub fn new(poll_interval: u32) -> Self {
        Self {
            poll_interval,
            idle_passes: 0,
            outstanding: false,
            outstanding_passes: 0,
            rerun: false,
            rx_reads: [false; RX_BUFFER_COUNT],
            errors: ErrorFlags::default(),
        }
    }

    /// The most severe error condition seen in the last EFLG read-back
    pub fn error_state(&self) -> Option<ErrorKind> {
        self.errors.severity()
    }

    /// Whether a status round is still waiting for its read-backs
    pub fn is_outstanding(&self) -> bool {
        self.outstanding
    }

    /// One main-loop pass. `irq` is the consumed status-changed signal.
    /// Returns whether a status round was queued.
    pub fn poll(&mut self, irq: bool, transfers: &mut TransferEngine) -> Result<bool, TransferError> {
        if self.outstanding {
            self.rerun |= irq;
            self.outstanding_passes += 1;
            if self.outstanding_passes < self.poll_interval {
                return Ok(false);
            }
            warn!(
                "status read outstanding for {} passes, polling again",
                self.outstanding_passes
            );
            self.outstanding = false;
        }

        let due = if irq || core::mem::take(&mut self.rerun) {
            true
        } else if transfers.is_idle() {
            self.idle_passes += 1;
            self.idle_passes >= self.poll_interval
        } else {
            false
        };

        if !due {
            return Ok(false);
        }
        if transfers.free() < ROUND_TRANSFERS {
            self.rerun = true;
            return Err(TransferError::QueueFull);
        }

        transfers.read_status(Completion::Status)?;
        transfers.read(register::CANINTF, 2, Completion::Interrupts)?;

        self.idle_passes = 0;
        self.outstanding = true;
        self.outstanding_passes = 0;
        Ok(true)
    }

    /// READ STATUS came back: pull full receive buffers and reconcile the
    /// transmit slots.
    pub fn on_status(
        &mut self,
        status: StatusFlags,
        transfers: &mut TransferEngine,
        mailbox: &mut MailboxManager,
    ) -> TxCompletions {
        for buffer in 0..RX_BUFFER_COUNT {
            if !status.rx_full(buffer) || self.rx_reads[buffer] {
                continue;
            }
            match transfers.read_rx_buffer(buffer as u8) {
                Ok(_) => self.rx_reads[buffer] = true,
                Err(_) => {
                    // the flag stays set, so the next round retries
                    self.rerun = true;
                }
            }
        }

        mailbox.reconcile(status)
    }

    /// The register image of receive buffer `buffer` was read out.
    pub fn on_rx_buffer(&mut self, buffer: u8) {
        if let Some(pending) = self.rx_reads.get_mut(buffer as usize) {
            *pending = false;
        }
    }

    /// CANINTF and EFLG came back: report errors and acknowledge what was
    /// handled. Receive flags are left to the READ RX BUFFER instruction.
    pub fn on_interrupts(&mut self, rx: &[u8], transfers: &mut TransferEngine) {
        self.outstanding = false;

        let &[intf, eflg, ..] = rx else {
            warn!("short interrupt flag read-back ({} bytes)", rx.len());
            return;
        };
        let intf = InterruptFlags(intf);
        let eflg = ErrorFlags(eflg);

        if eflg != self.errors {
            match eflg.severity() {
                Some(kind) => warn!("controller error flags {:#x}: {:?}", eflg.0, kind),
                None => info!("controller error flags cleared"),
            }
            self.errors = eflg;
        }
        if intf.contains(InterruptFlags::MERRF) {
            warn!("message error flagged");
        }
        if intf.contains(InterruptFlags::WAKIF) {
            debug!("wake-up flagged");
        }

        let acknowledge = intf.to_acknowledge();
        if acknowledge != 0
            && transfers
                .bit_modify(register::CANINTF, acknowledge, 0, Completion::None)
                .is_err()
        {
            self.rerun = true;
        }

        let overflows = eflg.overflows();
        if overflows != 0
            && transfers
                .bit_modify(register::EFLG, overflows, 0, Completion::None)
                .is_err()
        {
            self.rerun = true;
        }
    }
}
