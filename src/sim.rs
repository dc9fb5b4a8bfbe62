//! A host-side model of the SPI CAN controller for the engine tests.
//!
//! Every transaction completes immediately: `begin` computes the reply and
//! raises the transfer-done signal, `collect` hands it over. Frames queued
//! with [`SimController::receive`] arrive one at a time whenever a receive
//! buffer is free and the controller is operational.

use std::collections::VecDeque;
use std::vec::Vec;

use crate::command::{register, Instruction, OperatingMode};
use crate::event::{InterruptFlags, RX_BUFFER_COUNT, TX_SLOT_COUNT};
use crate::frame::{CanFrame, REGISTER_IMAGE_SIZE};
use crate::hal::{IrqSignals, TransferHardware};

/// CANSTAT reads answered with 0xFF after a reset
const RESET_POLLS: usize = 2;
/// CANSTAT reads before a requested mode takes effect
const MODE_LAG: usize = 1;

pub(crate) struct SimController<'a> {
    signals: &'a IrqSignals,
    registers: [u8; 0x80],
    rx_buffers: [[u8; REGISTER_IMAGE_SIZE]; RX_BUFFER_COUNT],
    tx_buffers: [[u8; REGISTER_IMAGE_SIZE]; TX_SLOT_COUNT],
    reset_polls: usize,
    pending_mode: Option<(OperatingMode, usize)>,
    inbox: VecDeque<CanFrame>,
    reply: Vec<u8>,

    /// Frames that made it onto the bus
    pub sent: Vec<CanFrame>,
    /// When false, transmit requests are never acknowledged on the bus
    pub acknowledge: bool,
    /// Keeps answering CANSTAT with 0xFF after a reset
    pub stuck_in_reset: bool,
}

impl<'a> SimController<'a> {
    pub fn new(signals: &'a IrqSignals) -> Self {
        let mut sim = Self {
            signals,
            registers: [0; 0x80],
            rx_buffers: [[0; REGISTER_IMAGE_SIZE]; RX_BUFFER_COUNT],
            tx_buffers: [[0; REGISTER_IMAGE_SIZE]; TX_SLOT_COUNT],
            reset_polls: 0,
            pending_mode: None,
            inbox: VecDeque::new(),
            reply: Vec::new(),
            sent: Vec::new(),
            acknowledge: true,
            stuck_in_reset: false,
        };
        sim.reset();
        sim
    }

    pub fn register(&self, address: u8) -> u8 {
        self.registers[address as usize]
    }

    /// Queues a frame to arrive from the bus.
    pub fn receive(&mut self, frame: CanFrame) {
        self.inbox.push_back(frame);
        self.deliver();
    }

    pub fn tx_requested(&self, slot: u8) -> bool {
        self.register(register::txb_ctrl(slot)) & register::TXREQ != 0
    }

    fn mode(&self) -> OperatingMode {
        OperatingMode::from_canstat(self.register(register::CANSTAT))
            .unwrap_or(OperatingMode::Configuration)
    }

    fn reset(&mut self) {
        self.registers = [0; 0x80];
        self.registers[register::CANSTAT as usize] = OperatingMode::Configuration.reqop();
        self.registers[register::CANCTRL as usize] = OperatingMode::Configuration.reqop();
        self.reset_polls = RESET_POLLS;
        self.pending_mode = None;
    }

    fn read_canstat(&mut self) -> u8 {
        if self.stuck_in_reset || self.reset_polls > 0 {
            self.reset_polls = self.reset_polls.saturating_sub(1);
            return 0xFF;
        }

        if let Some((mode, lag)) = self.pending_mode {
            if lag == 0 {
                self.registers[register::CANSTAT as usize] = mode.reqop();
                self.pending_mode = None;
            } else {
                self.pending_mode = Some((mode, lag - 1));
            }
        }

        self.register(register::CANSTAT)
    }

    fn read_status(&self) -> u8 {
        let intf = self.register(register::CANINTF);
        let mut status = intf & (InterruptFlags::RX0IF | InterruptFlags::RX1IF);

        for slot in 0..TX_SLOT_COUNT as u8 {
            if self.tx_requested(slot) {
                status |= 1 << (2 + slot * 2);
            }
            if intf & (InterruptFlags::TX0IF << slot) != 0 {
                status |= 1 << (3 + slot * 2);
            }
        }

        status
    }

    fn write_register(&mut self, address: u8, value: u8) {
        let Some(cell) = self.registers.get_mut(address as usize) else {
            return;
        };
        *cell = value;

        if address == register::CANCTRL {
            let requested =
                OperatingMode::from_canstat(value).unwrap_or(OperatingMode::Configuration);
            // asking again for the mode already on its way keeps the countdown
            match self.pending_mode {
                Some((mode, _)) if mode == requested => {}
                _ => self.pending_mode = Some((requested, MODE_LAG)),
            }
        }
    }

    fn request_to_send(&mut self, mask: u8) {
        for slot in 0..TX_SLOT_COUNT as u8 {
            if mask & (1 << slot) == 0 {
                continue;
            }

            let ctrl = register::txb_ctrl(slot) as usize;
            self.registers[ctrl] |= register::TXREQ;
            if !self.acknowledge || self.mode() == OperatingMode::Configuration {
                continue;
            }

            if let Ok(frame) = CanFrame::from_registers(&self.tx_buffers[slot as usize]) {
                self.sent.push(frame);
            }
            self.registers[ctrl] &= !register::TXREQ;
            self.registers[register::CANINTF as usize] |= InterruptFlags::TX0IF << slot;
            self.signals.status_changed();
        }
    }

    fn deliver(&mut self) {
        if self.mode() != OperatingMode::Normal {
            return;
        }

        for buffer in 0..RX_BUFFER_COUNT {
            let flag = 1 << buffer;
            if self.register(register::CANINTF) & flag != 0 {
                continue;
            }
            let Some(frame) = self.inbox.pop_front() else {
                return;
            };

            self.rx_buffers[buffer] = frame.to_registers();
            self.registers[register::CANINTF as usize] |= flag;
            self.signals.status_changed();
        }
    }
}

impl TransferHardware for SimController<'_> {
    fn begin(&mut self, tx: &[u8], rx_len: usize) {
        self.reply.clear();

        let Ok((instruction, address, header)) = Instruction::decode(tx) else {
            self.reply.resize(rx_len, 0);
            self.signals.transfer_done();
            return;
        };
        let data = &tx[header..];

        match instruction {
            Instruction::Reset => self.reset(),
            Instruction::Read => {
                for offset in 0..rx_len {
                    let at = address.wrapping_add(offset as u8);
                    let value = if at == register::CANSTAT {
                        self.read_canstat()
                    } else {
                        self.registers.get(at as usize).copied().unwrap_or(0)
                    };
                    self.reply.push(value);
                }
            }
            Instruction::Write => {
                for (offset, value) in data.iter().enumerate() {
                    self.write_register(address.wrapping_add(offset as u8), *value);
                }
            }
            Instruction::BitModify => {
                if let &[mask, value, ..] = data {
                    let current = self.register(address);
                    self.write_register(address, (current & !mask) | (value & mask));
                }
            }
            Instruction::ReadStatus => {
                let status = self.read_status();
                self.reply.push(status);
            }
            Instruction::RequestToSend => self.request_to_send(address),
            Instruction::ReadRxBuffer => {
                let buffer = (address >> 2) as usize % RX_BUFFER_COUNT;
                self.reply.extend_from_slice(&self.rx_buffers[buffer]);
                self.registers[register::CANINTF as usize] &= !(1 << buffer);
            }
            Instruction::LoadTxBuffer => {
                let slot = (address >> 1) as usize % TX_SLOT_COUNT;
                let len = data.len().min(REGISTER_IMAGE_SIZE);
                self.tx_buffers[slot][..len].copy_from_slice(&data[..len]);
            }
        }

        self.reply.resize(rx_len, 0);
        self.signals.transfer_done();
    }

    fn collect(&mut self, rx: &mut [u8]) {
        let len = rx.len().min(self.reply.len());
        rx[..len].copy_from_slice(&self.reply[..len]);
        self.deliver();
    }
}
