//! The CAN-TP session: reassembles requests, hands them to the responder
//! and segments the reply.
//!
//! Only one exchange is active at a time. A new Single or First frame is
//! accepted only while the session is idle; everything else that does not
//! fit the current state is ignored. Protocol violations and timeouts drop
//! the exchange and return the session to idle.

use core::time::Duration;

use embedded_can::Id;
use heapless::Deque;

use crate::codec::raw_id;
use crate::config::Config;
use crate::frame::CanFrame;
use crate::mailbox::SendError;
use crate::pdu::{
    separation_time, FlowStatus, Pdu, PduError, CONSECUTIVE_FRAME_DATA, FIRST_FRAME_DATA,
    MAX_MESSAGE_LEN, SINGLE_FRAME_DATA,
};
use crate::responder::Responder;
use crate::timer::Instant;

/// Request and response buffer size used unless another is asked for
pub const DEFAULT_BUFFER_SIZE: usize = 256;

/// Frames the session can hold while its transmit slot is busy
const PENDING_FRAMES: usize = 4;

/// Where the session hands its outgoing frames.
pub trait FrameSink {
    fn send(&mut self, frame: &CanFrame) -> Result<(), SendError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SessionState {
    Idle,
    /// Collecting consecutive frames of a request
    ReceivingMulti { deadline: Instant },
    /// Our First frame or a WAIT is out, waiting for the peer's grant
    AwaitingFlow { deadline: Instant },
    SendingBlock,
    /// A consecutive frame is in the transmit slot
    AwaitingTxComplete,
    AwaitingSeparationTime { until: Instant },
}

pub struct CanTpSession<const N: usize = DEFAULT_BUFFER_SIZE> {
    state: SessionState,
    slot: u8,
    tx_id: Id,
    peer: Option<Id>,
    index: u8,
    block_counter: u8,
    block_size: u8,
    separation: Duration,

    rx: [u8; N],
    rx_len: usize,
    rx_expected: usize,
    tx: [u8; N],
    tx_len: usize,
    tx_offset: usize,
    pending: Deque<CanFrame, PENDING_FRAMES>,

    grant_block_size: u8,
    grant_separation: u8,
    flow_timeout: Duration,
    padding: u8,
}

impl<const N: usize> CanTpSession<N> {
    const CAPACITY_CHECK: () = assert!(N >= 8, "CAN-TP buffers must hold at least 8 bytes");

    pub fn new(config: &Config) -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::CAPACITY_CHECK;

        Self {
            state: SessionState::Idle,
            slot: config.cantp_slot,
            tx_id: Id::Standard(config.response_id()),
            peer: None,
            index: 0,
            block_counter: 0,
            block_size: 0,
            separation: Duration::ZERO,
            rx: [0; N],
            rx_len: 0,
            rx_expected: 0,
            tx: [0; N],
            tx_len: 0,
            tx_offset: 0,
            pending: Deque::new(),
            grant_block_size: config.rx_block_size,
            grant_separation: config.rx_separation_time,
            flow_timeout: config.flow_wait_timeout,
            padding: config.padding,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    /// Frames refused by the transmit slot and waiting for [`Self::poll`]
    pub fn pending_frames(&self) -> usize {
        self.pending.len()
    }

    /// Drops any exchange in progress along with the frames held for the
    /// transmit slot.
    pub fn reset(&mut self) {
        self.abort();
    }

    /// Handles a frame received on one of our request identifiers.
    pub fn on_frame<S: FrameSink, R: Responder>(
        &mut self,
        frame: &CanFrame,
        now: Instant,
        sink: &mut S,
        responder: &mut R,
    ) {
        let Some(data) = frame.data() else {
            return;
        };

        match Pdu::decode(data) {
            Ok(Pdu::Single { data }) => self.on_single(frame.id(), data, now, sink, responder),
            Ok(Pdu::First { len, data }) => {
                self.on_first(frame.id(), len as usize, data, now, sink, responder)
            }
            Ok(Pdu::Consecutive { index, data }) => {
                self.on_consecutive(frame.id(), index, data, now, sink, responder)
            }
            Ok(Pdu::FlowControl {
                status,
                block_size,
                separation_time,
            }) => self.on_flow_control(status, block_size, separation_time, now, sink),
            Err(PduError::InvalidFlowStatus(code))
                if matches!(self.state, SessionState::AwaitingFlow { .. }) =>
            {
                debug!("flow control status {} from peer, aborting", code);
                self.abort();
            }
            Err(error) => debug!(
                "ignoring frame from {:#x}: {:?}",
                raw_id(frame.id()),
                error
            ),
        }
    }

    fn on_single<S: FrameSink, R: Responder>(
        &mut self,
        id: Id,
        data: &[u8],
        now: Instant,
        sink: &mut S,
        responder: &mut R,
    ) {
        if !self.is_idle() {
            debug!("single frame while busy, ignored");
            return;
        }

        self.rx[..data.len()].copy_from_slice(data);
        self.rx_len = data.len();
        self.rx_expected = data.len();
        self.peer = Some(id);
        self.dispatch(now, sink, responder);
    }

    fn on_first<S: FrameSink, R: Responder>(
        &mut self,
        id: Id,
        len: usize,
        data: &[u8],
        now: Instant,
        sink: &mut S,
        responder: &mut R,
    ) {
        if !self.is_idle() {
            debug!("first frame while busy, ignored");
            return;
        }
        if len > N {
            warn!("request of {} bytes does not fit {} byte buffer", len, N);
            let overflow = self.flow_control(FlowStatus::Overflow, 0, 0);
            self.emit(overflow, sink);
            return;
        }

        let chunk = data.len().min(FIRST_FRAME_DATA).min(len);
        self.rx[..chunk].copy_from_slice(&data[..chunk]);
        self.rx_len = chunk;
        self.rx_expected = len;
        self.peer = Some(id);
        self.index = 1;
        self.block_counter = 0;

        if self.rx_len >= self.rx_expected {
            self.dispatch(now, sink, responder);
            return;
        }

        self.state = SessionState::ReceivingMulti {
            deadline: now + self.flow_timeout,
        };
        let grant = self.flow_control(
            FlowStatus::ClearToSend,
            self.grant_block_size,
            self.grant_separation,
        );
        self.emit(grant, sink);
    }

    fn on_consecutive<S: FrameSink, R: Responder>(
        &mut self,
        id: Id,
        index: u8,
        data: &[u8],
        now: Instant,
        sink: &mut S,
        responder: &mut R,
    ) {
        if !matches!(self.state, SessionState::ReceivingMulti { .. }) || self.peer != Some(id) {
            debug!("consecutive frame outside a session, ignored");
            return;
        }

        if index != self.index {
            debug!(
                "consecutive frame {} but expected {}, aborting",
                index,
                self.index
            );
            let expected = self.index;
            self.abort();
            let abort = self.flow_control(FlowStatus::Overflow, expected, 0);
            self.emit(abort, sink);
            return;
        }

        let chunk = data
            .len()
            .min(CONSECUTIVE_FRAME_DATA)
            .min(self.rx_expected - self.rx_len);
        self.rx[self.rx_len..self.rx_len + chunk].copy_from_slice(&data[..chunk]);
        self.rx_len += chunk;
        self.index = (self.index + 1) & 0x0F;
        self.block_counter = self.block_counter.wrapping_add(1);

        if self.rx_len >= self.rx_expected {
            self.dispatch(now, sink, responder);
            return;
        }

        self.state = SessionState::ReceivingMulti {
            deadline: now + self.flow_timeout,
        };
        if self.grant_block_size > 0 && self.block_counter >= self.grant_block_size {
            self.block_counter = 0;
            let grant = self.flow_control(
                FlowStatus::ClearToSend,
                self.grant_block_size,
                self.grant_separation,
            );
            self.emit(grant, sink);
        }
    }

    fn on_flow_control<S: FrameSink>(
        &mut self,
        status: FlowStatus,
        block_size: u8,
        raw_separation: u8,
        now: Instant,
        sink: &mut S,
    ) {
        if !matches!(self.state, SessionState::AwaitingFlow { .. }) {
            debug!("flow control without a transfer waiting, ignored");
            return;
        }

        match status {
            FlowStatus::ClearToSend => {
                self.block_size = block_size;
                self.separation = separation_time(raw_separation);
                self.block_counter = 0;
                self.state = SessionState::SendingBlock;
                self.send_next(sink);
            }
            FlowStatus::Wait => {
                self.state = SessionState::AwaitingFlow {
                    deadline: now + self.flow_timeout,
                };
            }
            FlowStatus::Overflow => {
                debug!("peer aborted the transfer");
                self.abort();
            }
        }
    }

    /// A transmit slot finished or was reclaimed. Only the completion of our
    /// own consecutive frame moves the transfer on.
    pub fn on_tx_complete<S: FrameSink>(&mut self, slot: u8, id: Id, now: Instant, sink: &mut S) {
        if self.state != SessionState::AwaitingTxComplete
            || slot != self.slot
            || id != self.tx_id
            || !self.pending.is_empty()
        {
            return;
        }

        if self.tx_offset >= self.tx_len {
            trace!("response of {} bytes sent", self.tx_len);
            self.state = SessionState::Idle;
        } else if self.block_size > 0 && self.block_counter >= self.block_size {
            self.block_counter = 0;
            self.state = SessionState::AwaitingFlow {
                deadline: now + self.flow_timeout,
            };
        } else if !self.separation.is_zero() {
            self.state = SessionState::AwaitingSeparationTime {
                until: now + self.separation,
            };
        } else {
            self.state = SessionState::SendingBlock;
            self.send_next(sink);
        }
    }

    /// Retries held frames and runs the session's timers.
    pub fn poll<S: FrameSink>(&mut self, now: Instant, sink: &mut S) {
        while let Some(frame) = self.pending.front().copied() {
            if sink.send(&frame).is_err() {
                break;
            }
            self.pending.pop_front();
        }

        match self.state {
            SessionState::ReceivingMulti { deadline } if now >= deadline => {
                warn!("timed out waiting for a consecutive frame");
                self.abort();
            }
            SessionState::AwaitingFlow { deadline } if now >= deadline => {
                warn!("timed out waiting for flow control");
                self.abort();
            }
            SessionState::AwaitingSeparationTime { until } if now >= until => {
                self.state = SessionState::SendingBlock;
                self.send_next(sink);
            }
            _ => {}
        }
    }

    fn dispatch<S: FrameSink, R: Responder>(&mut self, now: Instant, sink: &mut S, responder: &mut R) {
        self.state = SessionState::Idle;
        trace!("request of {} bytes complete", self.rx_len);

        let len = match responder.respond(&self.rx[..self.rx_len], &mut self.tx) {
            Some(len) if len > 0 => len,
            _ => return,
        };
        if len > N.min(MAX_MESSAGE_LEN) {
            warn!("response of {} bytes is too long, dropped", len);
            return;
        }

        self.start_send(len, now, sink);
    }

    fn start_send<S: FrameSink>(&mut self, len: usize, now: Instant, sink: &mut S) {
        self.tx_len = len;

        if len <= SINGLE_FRAME_DATA {
            let single = self.frame(Pdu::Single {
                data: &self.tx[..len],
            });
            self.tx_offset = len;
            self.emit(single, sink);
            return;
        }

        let first = self.frame(Pdu::First {
            len: len as u16,
            data: &self.tx[..FIRST_FRAME_DATA],
        });
        self.tx_offset = FIRST_FRAME_DATA;
        self.index = 1;
        self.block_counter = 0;
        self.state = SessionState::AwaitingFlow {
            deadline: now + self.flow_timeout,
        };
        self.emit(first, sink);
    }

    fn send_next<S: FrameSink>(&mut self, sink: &mut S) {
        let end = (self.tx_offset + CONSECUTIVE_FRAME_DATA).min(self.tx_len);
        let consecutive = self.frame(Pdu::Consecutive {
            index: self.index,
            data: &self.tx[self.tx_offset..end],
        });

        self.tx_offset = end;
        self.index = (self.index + 1) & 0x0F;
        self.block_counter = self.block_counter.wrapping_add(1);
        self.state = SessionState::AwaitingTxComplete;
        self.emit(consecutive, sink);
    }

    fn frame(&self, pdu: Pdu<'_>) -> CanFrame {
        pdu.to_frame(self.tx_id, self.padding)
    }

    fn flow_control(&self, status: FlowStatus, block_size: u8, separation_time: u8) -> CanFrame {
        self.frame(Pdu::FlowControl {
            status,
            block_size,
            separation_time,
        })
    }

    /// Sends `frame` now, or holds it behind frames already waiting.
    fn emit<S: FrameSink>(&mut self, frame: CanFrame, sink: &mut S) {
        if self.pending.is_empty() {
            match sink.send(&frame) {
                Ok(()) => return,
                Err(SendError::InvalidSlot(slot)) => {
                    error!("CAN-TP transmit slot {} does not exist", slot);
                    return;
                }
                Err(_) => {}
            }
        }

        if self.pending.push_back(frame).is_err() {
            warn!("CAN-TP frame dropped, {} already waiting", PENDING_FRAMES);
        }
    }

    fn abort(&mut self) {
        self.state = SessionState::Idle;
        self.peer = None;
        self.rx_len = 0;
        self.rx_expected = 0;
        self.tx_len = 0;
        self.tx_offset = 0;
        self.block_counter = 0;
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::vec::Vec;

    use embedded_can::StandardId;
    use proptest::prelude::*;

    use super::*;

    const REQUEST: u16 = 0x7E0;
    const BROADCAST: u16 = 0x7DF;
    const RESPONSE: u16 = 0x7E8;

    fn id(raw: u16) -> Id {
        Id::Standard(StandardId::new(raw).unwrap())
    }

    fn frame(raw: u16, payload: [u8; 8]) -> CanFrame {
        CanFrame::from_payload(id(raw), payload)
    }

    fn decode(frame: &CanFrame) -> Pdu<'_> {
        Pdu::decode(frame.data().unwrap()).unwrap()
    }

    #[derive(Default)]
    struct Recorder {
        sent: VecDeque<CanFrame>,
        refuse: usize,
    }

    impl FrameSink for Recorder {
        fn send(&mut self, frame: &CanFrame) -> Result<(), SendError> {
            if self.refuse > 0 {
                self.refuse -= 1;
                return Err(SendError::SlotBusy(0));
            }
            self.sent.push_back(*frame);
            Ok(())
        }
    }

    struct Echo;

    impl Responder for Echo {
        fn respond(&mut self, request: &[u8], response: &mut [u8]) -> Option<usize> {
            response[..request.len()].copy_from_slice(request);
            Some(request.len())
        }
    }

    /// Answers with a fixed number of counting bytes.
    struct Counting(usize);

    impl Responder for Counting {
        fn respond(&mut self, _request: &[u8], response: &mut [u8]) -> Option<usize> {
            for (i, byte) in response[..self.0].iter_mut().enumerate() {
                *byte = i as u8;
            }
            Some(self.0)
        }
    }

    /// Mode 01 with only the supported-PIDs query implemented
    struct SupportedPids;

    impl Responder for SupportedPids {
        fn respond(&mut self, request: &[u8], response: &mut [u8]) -> Option<usize> {
            match request {
                [0x01, 0x00] => {
                    response[..6].copy_from_slice(&[0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13]);
                    Some(6)
                }
                _ => None,
            }
        }
    }

    /// The tester on the other end of the bus.
    struct Tester {
        block_size: u8,
        separation_time: u8,
        rx: Vec<u8>,
        expected: usize,
        index: u8,
        counter: u8,
    }

    impl Tester {
        fn new(block_size: u8) -> Self {
            Self {
                block_size,
                separation_time: 0,
                rx: Vec::new(),
                expected: 0,
                index: 0,
                counter: 0,
            }
        }

        fn grant(&self) -> CanFrame {
            Pdu::FlowControl {
                status: FlowStatus::ClearToSend,
                block_size: self.block_size,
                separation_time: self.separation_time,
            }
            .to_frame(id(REQUEST), 0)
        }

        fn complete(&self) -> bool {
            self.expected > 0 && self.rx.len() == self.expected
        }

        /// Takes one frame of the response, answering with flow control
        /// where needed.
        fn receive(&mut self, frame: &CanFrame) -> Option<CanFrame> {
            assert_eq!(frame.id(), id(RESPONSE));
            assert_eq!(frame.dlc(), 8);

            match decode(frame) {
                Pdu::Single { data } => {
                    self.rx = data.to_vec();
                    self.expected = data.len();
                    None
                }
                Pdu::First { len, data } => {
                    self.rx = data.to_vec();
                    self.expected = len as usize;
                    self.index = 1;
                    self.counter = 0;
                    Some(self.grant())
                }
                Pdu::Consecutive { index, data } => {
                    assert_eq!(index, self.index);
                    let take = (self.expected - self.rx.len()).min(data.len());
                    self.rx.extend_from_slice(&data[..take]);
                    self.index = (self.index + 1) & 0x0F;
                    self.counter = self.counter.wrapping_add(1);
                    if !self.complete() && self.block_size > 0 && self.counter == self.block_size {
                        self.counter = 0;
                        Some(self.grant())
                    } else {
                        None
                    }
                }
                Pdu::FlowControl { .. } => panic!("unexpected flow control from the unit"),
            }
        }
    }

    /// Segments `request` towards the session the way a tester would.
    fn send_request<const N: usize, R: Responder>(
        session: &mut CanTpSession<N>,
        sink: &mut Recorder,
        responder: &mut R,
        request: &[u8],
    ) {
        let now = Instant::ZERO;

        if request.len() <= SINGLE_FRAME_DATA {
            let single = Pdu::Single { data: request }.to_frame(id(REQUEST), 0x55);
            session.on_frame(&single, now, sink, responder);
            return;
        }

        let first = Pdu::First {
            len: request.len() as u16,
            data: &request[..FIRST_FRAME_DATA],
        }
        .to_frame(id(REQUEST), 0x55);
        session.on_frame(&first, now, sink, responder);

        let mut offset = FIRST_FRAME_DATA;
        let mut index = 1;
        while offset < request.len() {
            let grant = sink.sent.pop_front().expect("flow control");
            let Pdu::FlowControl {
                status: FlowStatus::ClearToSend,
                block_size,
                ..
            } = decode(&grant)
            else {
                panic!("expected a clear to send");
            };

            let mut sent = 0;
            while offset < request.len() && (block_size == 0 || sent < block_size) {
                let end = (offset + CONSECUTIVE_FRAME_DATA).min(request.len());
                let consecutive = Pdu::Consecutive {
                    index,
                    data: &request[offset..end],
                }
                .to_frame(id(REQUEST), 0x55);
                session.on_frame(&consecutive, now, sink, responder);
                offset = end;
                index = (index + 1) & 0x0F;
                sent += 1;
            }
        }
    }

    /// Confirms every frame the session sends and feeds it to the tester.
    fn collect_response<const N: usize, R: Responder>(
        session: &mut CanTpSession<N>,
        sink: &mut Recorder,
        responder: &mut R,
        tester: &mut Tester,
    ) -> Vec<CanFrame> {
        let now = Instant::ZERO;
        let mut frames = Vec::new();

        while let Some(sent) = sink.sent.pop_front() {
            frames.push(sent);
            session.on_tx_complete(0, sent.id(), now, sink);
            if let Some(reply) = tester.receive(&sent) {
                session.on_frame(&reply, now, sink, responder);
            }
        }

        frames
    }

    fn round_trip<const N: usize>(request: &[u8], tester_block_size: u8) -> Vec<u8> {
        let mut session: CanTpSession<N> = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();
        let mut tester = Tester::new(tester_block_size);

        send_request(&mut session, &mut sink, &mut Echo, request);
        collect_response(&mut session, &mut sink, &mut Echo, &mut tester);

        assert!(session.is_idle());
        assert!(tester.complete());
        tester.rx
    }

    #[test]
    fn round_trip_sizes() {
        for len in [1, 7, 8, 100, 4095] {
            let request: Vec<u8> = (0..len).map(|i| (i * 7 + 3) as u8).collect();
            assert_eq!(round_trip::<4095>(&request, 0), request, "length {}", len);
        }
    }

    #[test]
    fn supported_pids_query() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();

        let request = frame(BROADCAST, [0x02, 0x01, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]);
        session.on_frame(&request, Instant::ZERO, &mut sink, &mut SupportedPids);

        let response = sink.sent.pop_front().unwrap();
        assert_eq!(response.id(), id(RESPONSE));
        assert_eq!(
            response.data().unwrap(),
            &[0x06, 0x41, 0x00, 0xBE, 0x1F, 0xA8, 0x13, 0x55]
        );
        assert!(session.is_idle());
    }

    #[test]
    fn twenty_byte_response_segmentation() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();
        let mut tester = Tester::new(0);
        let mut responder = Counting(20);

        send_request(&mut session, &mut sink, &mut responder, &[0x22, 0xF1, 0x90]);
        let frames = collect_response(&mut session, &mut sink, &mut responder, &mut tester);

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].data().unwrap(), &[0x10, 0x14, 0, 1, 2, 3, 4, 5]);
        assert_eq!(frames[1].data().unwrap(), &[0x21, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(frames[2].data().unwrap(), &[0x22, 13, 14, 15, 16, 17, 18, 19]);
        assert_eq!(tester.rx, (0..20).collect::<Vec<u8>>());
    }

    #[test]
    fn short_last_consecutive_is_padded() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();
        let mut tester = Tester::new(1);
        let mut responder = Counting(26);

        send_request(&mut session, &mut sink, &mut responder, &[0x22, 0xF1, 0x90]);
        let frames = collect_response(&mut session, &mut sink, &mut responder, &mut tester);

        assert_eq!(frames.len(), 4);
        assert_eq!(
            frames[3].data().unwrap(),
            &[0x23, 20, 21, 22, 23, 24, 25, 0x55]
        );
        assert_eq!(tester.rx, (0..26).collect::<Vec<u8>>());
    }

    #[test]
    fn index_mismatch_aborts() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();

        let first = frame(REQUEST, [0x10, 0x14, 1, 2, 3, 4, 5, 6]);
        session.on_frame(&first, Instant::ZERO, &mut sink, &mut Echo);
        assert!(matches!(
            session.state(),
            SessionState::ReceivingMulti { .. }
        ));
        assert_eq!(
            sink.sent.pop_front().unwrap().data().unwrap(),
            &[0x30, 0x01, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]
        );

        let skipped = frame(REQUEST, [0x22, 7, 8, 9, 10, 11, 12, 13]);
        session.on_frame(&skipped, Instant::ZERO, &mut sink, &mut Echo);

        assert!(session.is_idle());
        assert_eq!(
            sink.sent.pop_front().unwrap().data().unwrap(),
            &[0x32, 0x01, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]
        );
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn wait_without_grant_times_out() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();
        let mut responder = Counting(20);

        let request = frame(REQUEST, [0x01, 0x3E, 0, 0, 0, 0, 0, 0]);
        session.on_frame(&request, Instant::ZERO, &mut sink, &mut responder);
        assert!(matches!(decode(&sink.sent.pop_front().unwrap()), Pdu::First { len: 20, .. }));

        let wait = frame(REQUEST, [0x31, 0, 0, 0, 0, 0, 0, 0]);
        session.on_frame(&wait, Instant::from_millis(1_000), &mut sink, &mut responder);

        session.poll(Instant::from_millis(10_999), &mut sink);
        assert!(matches!(session.state(), SessionState::AwaitingFlow { .. }));

        session.poll(Instant::from_millis(11_000), &mut sink);
        assert!(session.is_idle());
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn flow_timeout_after_first_frame() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();

        let request = frame(REQUEST, [0x01, 0x3E, 0, 0, 0, 0, 0, 0]);
        session.on_frame(&request, Instant::ZERO, &mut sink, &mut Counting(20));
        assert_eq!(
            session.state(),
            SessionState::AwaitingFlow {
                deadline: Instant::from_millis(10_000)
            }
        );

        session.poll(Instant::from_millis(9_999), &mut sink);
        assert!(!session.is_idle());
        session.poll(Instant::from_millis(10_000), &mut sink);
        assert!(session.is_idle());
    }

    #[test]
    fn consecutive_gap_times_out() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();

        let first = frame(REQUEST, [0x10, 0x14, 1, 2, 3, 4, 5, 6]);
        session.on_frame(&first, Instant::ZERO, &mut sink, &mut Echo);
        let next = frame(REQUEST, [0x21, 7, 8, 9, 10, 11, 12, 13]);
        session.on_frame(&next, Instant::from_millis(2_000), &mut sink, &mut Echo);
        sink.sent.clear();

        session.poll(Instant::from_millis(11_999), &mut sink);
        assert!(matches!(
            session.state(),
            SessionState::ReceivingMulti { .. }
        ));

        session.poll(Instant::from_millis(12_000), &mut sink);
        assert!(session.is_idle());

        // the rest of the old request no longer belongs to anything
        let late = frame(REQUEST, [0x22, 14, 15, 16, 17, 18, 19, 20]);
        session.on_frame(&late, Instant::from_millis(12_001), &mut sink, &mut Echo);
        assert!(session.is_idle());
        assert!(sink.sent.is_empty());
    }

    #[test]
    fn peer_abort_returns_to_idle() {
        for flow_control in [0x32, 0x35] {
            let mut session: CanTpSession = CanTpSession::new(&Config::default());
            let mut sink = Recorder::default();
            let mut responder = Counting(20);

            let request = frame(REQUEST, [0x01, 0x3E, 0, 0, 0, 0, 0, 0]);
            session.on_frame(&request, Instant::ZERO, &mut sink, &mut responder);
            assert!(matches!(session.state(), SessionState::AwaitingFlow { .. }));
            sink.sent.clear();

            let abort = frame(REQUEST, [flow_control, 0, 0, 0, 0, 0, 0, 0]);
            session.on_frame(&abort, Instant::ZERO, &mut sink, &mut responder);

            assert!(session.is_idle(), "flow status {:#x}", flow_control);
            assert!(sink.sent.is_empty());

            // a grant after the abort starts nothing
            let grant = frame(REQUEST, [0x30, 0, 0, 0, 0, 0, 0, 0]);
            session.on_frame(&grant, Instant::ZERO, &mut sink, &mut responder);
            assert!(sink.sent.is_empty());
        }
    }

    #[test]
    fn unrelated_completion_does_not_release() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();
        let mut responder = Counting(20);
        let now = Instant::ZERO;

        let request = frame(REQUEST, [0x01, 0x3E, 0, 0, 0, 0, 0, 0]);
        session.on_frame(&request, now, &mut sink, &mut responder);
        session.on_frame(
            &frame(REQUEST, [0x30, 0, 0, 0, 0, 0, 0, 0]),
            now,
            &mut sink,
            &mut responder,
        );
        assert_eq!(sink.sent.len(), 2);
        assert_eq!(session.state(), SessionState::AwaitingTxComplete);

        session.on_tx_complete(0, id(0x123), now, &mut sink);
        session.on_tx_complete(1, id(RESPONSE), now, &mut sink);
        assert_eq!(session.state(), SessionState::AwaitingTxComplete);
        assert_eq!(sink.sent.len(), 2);

        session.on_tx_complete(0, id(RESPONSE), now, &mut sink);
        assert_eq!(sink.sent.len(), 3);
    }

    #[test]
    fn separation_time_paces_frames() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();
        let mut responder = Counting(30);
        let start = Instant::from_millis(500);

        let request = frame(REQUEST, [0x01, 0x3E, 0, 0, 0, 0, 0, 0]);
        session.on_frame(&request, start, &mut sink, &mut responder);
        session.on_frame(
            &frame(REQUEST, [0x30, 0, 0x14, 0, 0, 0, 0, 0]),
            start,
            &mut sink,
            &mut responder,
        );
        session.on_tx_complete(0, id(RESPONSE), start, &mut sink);
        assert_eq!(
            session.state(),
            SessionState::AwaitingSeparationTime {
                until: Instant::from_millis(520)
            }
        );

        session.poll(Instant::from_millis(519), &mut sink);
        assert_eq!(sink.sent.len(), 2);
        session.poll(Instant::from_millis(520), &mut sink);
        assert_eq!(sink.sent.len(), 3);
        assert_eq!(decode(&sink.sent[2]), Pdu::Consecutive {
            index: 2,
            data: &[13, 14, 15, 16, 17, 18, 19]
        });
    }

    #[test]
    fn busy_slot_holds_frame() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder {
            refuse: 2,
            ..Recorder::default()
        };

        let request = frame(BROADCAST, [0x02, 0x01, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]);
        session.on_frame(&request, Instant::ZERO, &mut sink, &mut SupportedPids);
        assert_eq!(session.pending_frames(), 1);

        session.poll(Instant::ZERO, &mut sink);
        assert_eq!(session.pending_frames(), 1);
        session.poll(Instant::ZERO, &mut sink);
        assert_eq!(session.pending_frames(), 0);
        assert_eq!(sink.sent[0].data().unwrap()[..3], [0x06, 0x41, 0x00]);
    }

    #[test]
    fn oversize_request_is_refused() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();

        let first = frame(REQUEST, [0x11, 0x2C, 1, 2, 3, 4, 5, 6]);
        session.on_frame(&first, Instant::ZERO, &mut sink, &mut Echo);

        assert!(session.is_idle());
        assert_eq!(
            sink.sent.pop_front().unwrap().data().unwrap(),
            &[0x32, 0x00, 0x00, 0x55, 0x55, 0x55, 0x55, 0x55]
        );
    }

    #[test]
    fn new_request_ignored_while_busy() {
        let mut session: CanTpSession = CanTpSession::new(&Config::default());
        let mut sink = Recorder::default();

        session.on_frame(
            &frame(REQUEST, [0x10, 0x14, 1, 2, 3, 4, 5, 6]),
            Instant::ZERO,
            &mut sink,
            &mut Echo,
        );
        sink.sent.clear();

        session.on_frame(
            &frame(BROADCAST, [0x02, 0x01, 0x00, 0, 0, 0, 0, 0]),
            Instant::ZERO,
            &mut sink,
            &mut SupportedPids,
        );
        assert!(sink.sent.is_empty());
        assert!(matches!(
            session.state(),
            SessionState::ReceivingMulti { .. }
        ));
    }

    proptest! {
        #[test]
        fn reassembles_what_was_segmented(
            request in proptest::collection::vec(any::<u8>(), 1..=600),
            block_size in 0u8..4,
        ) {
            prop_assert_eq!(round_trip::<600>(&request, block_size), request);
        }
    }
}
