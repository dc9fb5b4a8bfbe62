#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod bringup;
mod cantp;
mod codec;
mod command;
mod config;
mod engine;
mod event;
mod frame;
mod hal;
mod mailbox;
mod pdu;
mod responder;
mod status;
mod timer;
mod transfer;

#[cfg(test)]
mod sim;

pub use bringup::{transition, BringupError, BringupSequencer, BringupState, Transition};
pub use cantp::{CanTpSession, FrameSink, SessionState, DEFAULT_BUFFER_SIZE};
pub use codec::raw_id;
pub use command::*;
pub use config::*;
pub use engine::{Engine, EngineState, Error};
pub use event::*;
pub use frame::*;
pub use hal::{IrqSignals, TransferHardware};
pub use mailbox::{MailboxManager, SendError, SlotState, TxCompletion, TxCompletions, RX_RING_CAPACITY};
pub use pdu::{separation_time, FlowStatus, Pdu, PduError, PciType, MAX_MESSAGE_LEN};
pub use responder::{DiagnosticRouter, Responder, UDS_SERVICE_BASE};
pub use status::StatusEventDispatcher;
pub use timer::Instant;
pub use transfer::{
    Completed, Completion, Handle, RequestState, TransferEngine, TransferError, QUEUE_CAPACITY,
};

pub use embedded_can::{ExtendedId, Id, StandardId};
