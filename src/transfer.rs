//! Queue of SPI transactions against the controller.
//!
//! Requests are appended at the write cursor, started one at a time from the
//! read cursor, and handed back to the engine from the process cursor once
//! the hardware reports them finished. `process <= read <= write` always
//! holds modulo the capacity, and at most one request sits between `read - 1`
//! and `read` in the in-flight state.

use heapless::Vec;

use crate::command::{register, Instruction};
use crate::hal::TransferHardware;

/// Number of request slots in the ring
pub const QUEUE_CAPACITY: usize = 64;
/// Slots kept free between the write and process cursors so a full ring
/// never looks empty.
const SAFETY_MARGIN: usize = 1;
/// Inline data buffer of one request, large enough for a frame register image
pub const MAX_TRANSFER_DATA: usize = 16;

/// What the engine does with a request once it has finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Completion {
    /// Fire and forget
    #[default]
    None,
    /// Read-back for the bring-up sequencer
    Bringup,
    /// READ STATUS result for the status dispatcher
    Status,
    /// CANINTF and EFLG read-back for the status dispatcher
    Interrupts,
    /// Register image pulled out of receive buffer `n`
    RxBuffer(u8),
    /// Request-to-send for slot `n` was issued
    TxRequested(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RequestState {
    Queued,
    InFlight,
    Complete,
}

/// Sequence number handed out by [`TransferEngine::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Handle(pub u32);

#[derive(Debug, Clone, Copy)]
struct TransferRequest {
    instruction: Instruction,
    address: u8,
    tx_len: u8,
    rx_len: u8,
    data: [u8; MAX_TRANSFER_DATA],
    completion: Completion,
    swap16: bool,
    state: RequestState,
    handle: Handle,
}

impl TransferRequest {
    const EMPTY: Self = Self {
        instruction: Instruction::ReadStatus,
        address: 0,
        tx_len: 0,
        rx_len: 0,
        data: [0; MAX_TRANSFER_DATA],
        completion: Completion::None,
        swap16: false,
        state: RequestState::Complete,
        handle: Handle(0),
    };
}

/// A finished request as handed back to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Completed {
    pub handle: Handle,
    pub instruction: Instruction,
    pub address: u8,
    pub completion: Completion,
    rx: [u8; MAX_TRANSFER_DATA],
    rx_len: u8,
}

impl Completed {
    /// The bytes received after the instruction header
    pub fn rx(&self) -> &[u8] {
        &self.rx[..self.rx_len as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransferError {
    #[error("The transfer queue has no free capacity")]
    QueueFull,
    #[error("A transfer payload of ({0:?}) bytes does not fit a request")]
    PayloadTooLong(usize),
}

pub struct TransferEngine {
    slots: [TransferRequest; QUEUE_CAPACITY],
    write: usize,
    read: usize,
    process: usize,
    current: Option<usize>,
    next_handle: u32,
}

impl TransferEngine {
    pub const fn new() -> Self {
        Self {
            slots: [TransferRequest::EMPTY; QUEUE_CAPACITY],
            write: 0,
            read: 0,
            process: 0,
            current: None,
            next_handle: 0,
        }
    }

    /// Requests not yet handed back through [`TransferEngine::pop_completed`]
    pub fn pending(&self) -> usize {
        (self.write + QUEUE_CAPACITY - self.process) % QUEUE_CAPACITY
    }

    /// How many more requests can be queued right now
    pub fn free(&self) -> usize {
        QUEUE_CAPACITY - SAFETY_MARGIN - 1 - self.pending()
    }

    pub fn in_flight(&self) -> bool {
        self.current.is_some()
    }

    /// Nothing queued, nothing on the wire and nothing left to hand back
    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Drops every request that has not been started yet and returns how
    /// many were dropped. The transfer in flight and finished requests are
    /// still handed back.
    pub fn discard_queued(&mut self) -> usize {
        let dropped = (self.write + QUEUE_CAPACITY - self.read) % QUEUE_CAPACITY;
        self.write = self.read;
        dropped
    }

    /// Appends a request to the tail of the queue.
    ///
    /// `data` is clocked out after the instruction header and `rx_len` bytes
    /// are captured after it. Fails with [`TransferError::QueueFull`] rather
    /// than overwriting a request the engine has not consumed yet.
    pub fn enqueue(
        &mut self,
        instruction: Instruction,
        address: u8,
        data: &[u8],
        rx_len: usize,
        completion: Completion,
    ) -> Result<Handle, TransferError> {
        self.push(instruction, address, data, rx_len, completion, false)
    }

    /// Like [`TransferEngine::enqueue`], but the received bytes are 16-bit
    /// big-endian register pairs that get swapped into host order on
    /// completion.
    pub fn enqueue_words(
        &mut self,
        instruction: Instruction,
        address: u8,
        data: &[u8],
        rx_len: usize,
        completion: Completion,
    ) -> Result<Handle, TransferError> {
        self.push(instruction, address, data, rx_len, completion, true)
    }

    fn push(
        &mut self,
        instruction: Instruction,
        address: u8,
        data: &[u8],
        rx_len: usize,
        completion: Completion,
        swap16: bool,
    ) -> Result<Handle, TransferError> {
        if data.len() > MAX_TRANSFER_DATA {
            return Err(TransferError::PayloadTooLong(data.len()));
        }
        if rx_len > MAX_TRANSFER_DATA {
            return Err(TransferError::PayloadTooLong(rx_len));
        }
        if self.free() == 0 {
            warn!("transfer queue full, {} requests pending", self.pending());
            return Err(TransferError::QueueFull);
        }

        let handle = Handle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1);

        let mut request = TransferRequest {
            instruction,
            address,
            tx_len: data.len() as u8,
            rx_len: rx_len as u8,
            data: [0; MAX_TRANSFER_DATA],
            completion,
            swap16,
            state: RequestState::Queued,
            handle,
        };
        request.data[..data.len()].copy_from_slice(data);

        self.slots[self.write] = request;
        self.write = (self.write + 1) % QUEUE_CAPACITY;

        Ok(handle)
    }

    pub fn reset(&mut self) -> Result<Handle, TransferError> {
        self.enqueue(Instruction::Reset, 0, &[], 0, Completion::None)
    }

    pub fn read(
        &mut self,
        address: u8,
        len: usize,
        completion: Completion,
    ) -> Result<Handle, TransferError> {
        self.enqueue(Instruction::Read, address, &[], len, completion)
    }

    pub fn write(
        &mut self,
        address: u8,
        data: &[u8],
        completion: Completion,
    ) -> Result<Handle, TransferError> {
        self.enqueue(Instruction::Write, address, data, 0, completion)
    }

    /// Changes only the bits of `address` selected by `mask`
    pub fn bit_modify(
        &mut self,
        address: u8,
        mask: u8,
        value: u8,
        completion: Completion,
    ) -> Result<Handle, TransferError> {
        self.enqueue(Instruction::BitModify, address, &[mask, value], 0, completion)
    }

    pub fn read_status(&mut self, completion: Completion) -> Result<Handle, TransferError> {
        self.enqueue(Instruction::ReadStatus, 0, &[], 1, completion)
    }

    /// Pulses request-to-send for the transmit slots set in `mask`
    pub fn request_to_send(
        &mut self,
        mask: u8,
        completion: Completion,
    ) -> Result<Handle, TransferError> {
        self.enqueue(Instruction::RequestToSend, mask, &[], 0, completion)
    }

    /// Reads the register image of receive buffer `buffer`, which also
    /// clears its interrupt flag.
    pub fn read_rx_buffer(&mut self, buffer: u8) -> Result<Handle, TransferError> {
        self.enqueue(
            Instruction::ReadRxBuffer,
            buffer << 2,
            &[],
            crate::REGISTER_IMAGE_SIZE,
            Completion::RxBuffer(buffer),
        )
    }

    pub fn load_tx_buffer(&mut self, slot: u8, image: &[u8]) -> Result<Handle, TransferError> {
        self.enqueue(
            Instruction::LoadTxBuffer,
            slot * 2,
            image,
            0,
            Completion::None,
        )
    }

    /// Requests the controller switch into `mode` through CANCTRL
    pub fn request_mode(
        &mut self,
        mode: crate::OperatingMode,
        completion: Completion,
    ) -> Result<Handle, TransferError> {
        self.bit_modify(register::CANCTRL, register::MODE_MASK, mode.reqop(), completion)
    }

    /// Starts the next queued request if the bus is free. Does nothing if a
    /// transfer is already in flight or nothing is queued.
    pub fn dispatch(&mut self, hw: &mut impl TransferHardware) -> bool {
        if self.current.is_some() || self.read == self.write {
            return false;
        }

        let index = self.read;
        let request = &mut self.slots[index];

        let mut tx: Vec<u8, { MAX_TRANSFER_DATA + 2 }> = Vec::new();
        tx.extend_from_slice(&request.instruction.header(request.address))
            .ok();
        tx.extend_from_slice(&request.data[..request.tx_len as usize])
            .ok();

        request.state = RequestState::InFlight;
        self.current = Some(index);
        self.read = (self.read + 1) % QUEUE_CAPACITY;

        trace!(
            "dispatch {:?} addr {:#x}",
            request.instruction,
            request.address
        );
        hw.begin(&tx, request.rx_len as usize);

        true
    }

    /// Hardware completion: pulls the received bytes, normalises 16-bit
    /// words when requested, and releases the in-flight slot.
    pub fn complete(&mut self, hw: &mut impl TransferHardware) {
        let Some(index) = self.current.take() else {
            warn!("transfer completion without a transfer in flight");
            return;
        };

        let request = &mut self.slots[index];
        let rx_len = request.rx_len as usize;

        hw.collect(&mut request.data[..rx_len]);

        if request.swap16 {
            request.data[..rx_len]
                .chunks_exact_mut(2)
                .for_each(|word| word.swap(0, 1));
        }

        request.state = RequestState::Complete;
    }

    /// Hands back the oldest finished request, advancing the process cursor.
    /// Returns `None` when the oldest request has not finished yet.
    pub fn pop_completed(&mut self) -> Option<Completed> {
        if self.process == self.read {
            return None;
        }

        let request = &self.slots[self.process];
        if request.state != RequestState::Complete {
            return None;
        }

        self.process = (self.process + 1) % QUEUE_CAPACITY;

        Some(Completed {
            handle: request.handle,
            instruction: request.instruction,
            address: request.address,
            completion: request.completion,
            rx: request.data,
            rx_len: request.rx_len,
        })
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new()
    }
}
