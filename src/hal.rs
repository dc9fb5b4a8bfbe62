//! Boundary between the transaction engine and the board.
//!
//! Everything register-level (DMA channel setup, SPI peripheral, chip select)
//! lives behind [`TransferHardware`], so the queue and protocol logic can run
//! on a host against a simulated controller.

use core::sync::atomic::{AtomicBool, Ordering};

/// Drives one full-duplex SPI transaction with the transfer accelerator.
pub trait TransferHardware {
    /// Starts a transaction that clocks out `tx` followed by `rx_len` filler
    /// bytes. Implementations program the accelerator's source and
    /// destination, the byte counts, enable the channel and pull chip
    /// select low, in that order. Completion is reported by the interrupt
    /// handler calling [`IrqSignals::transfer_done`].
    fn begin(&mut self, tx: &[u8], rx_len: usize);

    /// Copies the last `rx.len()` received bytes of the finished
    /// transaction into `rx` and releases chip select.
    fn collect(&mut self, rx: &mut [u8]);
}

/// Flags raised from interrupt context and consumed by the main loop.
///
/// Interrupt handlers only ever set a flag; [`crate::Engine::poll`] swaps it
/// back to false and does the actual work.
#[derive(Debug, Default)]
pub struct IrqSignals {
    transfer_done: AtomicBool,
    status_changed: AtomicBool,
}

impl IrqSignals {
    pub const fn new() -> Self {
        Self {
            transfer_done: AtomicBool::new(false),
            status_changed: AtomicBool::new(false),
        }
    }

    /// Called from the transfer accelerator's completion interrupt
    pub fn transfer_done(&self) {
        self.transfer_done.store(true, Ordering::Release);
    }

    /// Called from the controller's INT pin handler
    pub fn status_changed(&self) {
        self.status_changed.store(true, Ordering::Release);
    }

    pub(crate) fn take_transfer_done(&self) -> bool {
        self.transfer_done.swap(false, Ordering::Acquire)
    }

    pub(crate) fn take_status_changed(&self) -> bool {
        self.status_changed.swap(false, Ordering::Acquire)
    }
}
