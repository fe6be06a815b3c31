//! Segmentation State Machine engine
//!
//! One [`Ssm`] per confirmed transaction. The parts shared by both directions
//! live in [`SsmCore`]: the protocol state with its terminal guard, the single
//! transaction timer, the negotiated capability values and the segmentation
//! context (payload slicing on the way out, reassembly on the way in, window
//! bookkeeping). What differs between the requesting and the responding side
//! is supplied by an [`SsmRole`] strategy, see [`super::client`] and
//! [`super::server`].
//!
//! State machines never touch the network or the application directly. They
//! push [`SapEvent`]s onto the queue borrowed through [`SsmContext`] and
//! install their timers in the access point's [`TaskManager`].

use std::{collections::VecDeque, fmt, time::Duration};

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use super::config::{ApplicationConfig, TransactionParameters};
use super::device_info::{DeviceHandle, DeviceInfoCache};
use super::sap::SapEvent;
use super::{Apdu, ApplicationError, Pdu, Result};
use crate::network::Address;
use crate::service::AbortReason;
use crate::task::{TaskHandle, TaskManager};
use crate::util::{seq_distance, seq_in_window, seq_next, segment_count};

/// Protocol state of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SsmState {
    Idle,
    SegmentedRequest,
    AwaitConfirmation,
    AwaitResponse,
    SegmentedResponse,
    SegmentedConfirmation,
    Completed,
    Aborted,
}

impl SsmState {
    /// COMPLETED and ABORTED are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, SsmState::Completed | SsmState::Aborted)
    }
}

impl fmt::Display for SsmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SsmState::Idle => "IDLE",
            SsmState::SegmentedRequest => "SEGMENTED_REQUEST",
            SsmState::AwaitConfirmation => "AWAIT_CONFIRMATION",
            SsmState::AwaitResponse => "AWAIT_RESPONSE",
            SsmState::SegmentedResponse => "SEGMENTED_RESPONSE",
            SsmState::SegmentedConfirmation => "SEGMENTED_CONFIRMATION",
            SsmState::Completed => "COMPLETED",
            SsmState::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// Which side of the exchange a transaction is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We sent the confirmed request
    Client,
    /// We received the confirmed request
    Server,
}

/// Identity of a transaction in the access point tables
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub invoke_id: u8,
    pub address: Address,
}

impl TransactionKey {
    pub fn new(invoke_id: u8, address: Address) -> Self {
        Self { invoke_id, address }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.invoke_id, self.address)
    }
}

/// Timer payload: which transaction timed out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SsmTimer {
    pub direction: Direction,
    pub key: TransactionKey,
}

/// Access point resources a state machine may use while handling one input
pub struct SsmContext<'a> {
    pub config: &'a ApplicationConfig,
    pub devices: &'a mut DeviceInfoCache,
    pub tasks: &'a mut TaskManager<SsmTimer>,
    pub events: &'a mut VecDeque<SapEvent>,
}

/// State shared by client and server transactions
#[derive(Debug)]
pub struct SsmCore {
    pub(super) direction: Direction,
    pub(super) key: TransactionKey,
    pub(super) state: SsmState,
    pub(super) timer: Option<TaskHandle>,
    pub(super) device: Option<DeviceHandle>,
    pub(super) params: TransactionParameters,

    // negotiated with the peer
    pub(super) max_apdu_length_accepted: u16,
    pub(super) max_segments_accepted: Option<u8>,
    pub(super) segmented_response_accepted: bool,

    // segmentation context
    pub(super) segment_apdu: Option<Apdu>,
    pub(super) segment_data: Bytes,
    pub(super) reassembly: BytesMut,
    pub(super) segment_size: usize,
    pub(super) segment_count: usize,

    pub(super) retry_count: u8,
    pub(super) segment_retry_count: u8,

    // window bookkeeping; `initial_segment` is an absolute segment index,
    // sequence numbers on the wire are that index modulo 256
    pub(super) proposed_window_size: u8,
    pub(super) actual_window_size: u8,
    pub(super) initial_segment: usize,
    pub(super) last_sequence_number: u8,
    pub(super) sent_all_segments: bool,
}

impl SsmCore {
    pub fn new(
        direction: Direction,
        key: TransactionKey,
        params: TransactionParameters,
        proposed_window_size: u8,
    ) -> Self {
        Self {
            direction,
            key,
            state: SsmState::Idle,
            timer: None,
            device: None,
            max_apdu_length_accepted: params.max_apdu_length_accepted,
            max_segments_accepted: params.max_segments_accepted,
            segmented_response_accepted: false,
            params,
            segment_apdu: None,
            segment_data: Bytes::new(),
            reassembly: BytesMut::new(),
            segment_size: params.max_apdu_length_accepted.max(1) as usize,
            segment_count: 1,
            retry_count: 0,
            segment_retry_count: 0,
            proposed_window_size: proposed_window_size.max(1),
            actual_window_size: 1,
            initial_segment: 0,
            last_sequence_number: 0,
            sent_all_segments: false,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn state(&self) -> SsmState {
        self.state
    }

    pub fn segment_count(&self) -> usize {
        self.segment_count
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn actual_window_size(&self) -> u8 {
        self.actual_window_size
    }

    pub fn device(&self) -> Option<DeviceHandle> {
        self.device
    }

    /// Move to `state`. Leaving COMPLETED or ABORTED is refused. Entering
    /// either stops the timer and gives back the device info reference.
    pub fn set_state(&mut self, ctx: &mut SsmContext<'_>, state: SsmState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(ApplicationError::InvalidStateTransition {
                from: self.state,
                to: state,
            });
        }
        debug!(
            "{:?} transaction {}: {} -> {}",
            self.direction, self.key, self.state, state
        );
        self.state = state;

        if state.is_terminal() {
            self.stop_timer(ctx);
            if let Some(handle) = self.device.take() {
                ctx.devices.release(handle)?;
            }
        }
        Ok(())
    }

    /// Move to `state` and arm the timer for `millis`
    pub fn set_state_timed(
        &mut self,
        ctx: &mut SsmContext<'_>,
        state: SsmState,
        millis: u32,
    ) -> Result<()> {
        self.set_state(ctx, state)?;
        self.start_timer(ctx, millis)
    }

    pub fn start_timer(&mut self, ctx: &mut SsmContext<'_>, millis: u32) -> Result<()> {
        self.stop_timer(ctx);
        let handle = ctx.tasks.install(
            Duration::from_millis(u64::from(millis)),
            SsmTimer {
                direction: self.direction,
                key: self.key.clone(),
            },
        )?;
        self.timer = Some(handle);
        Ok(())
    }

    pub fn stop_timer(&mut self, ctx: &mut SsmContext<'_>) {
        if let Some(handle) = self.timer.take() {
            ctx.tasks.cancel(handle);
        }
    }

    pub fn restart_timer(&mut self, ctx: &mut SsmContext<'_>, millis: u32) -> Result<()> {
        self.start_timer(ctx, millis)
    }

    /// Take the message to be segmented. The message itself must not be a
    /// segment.
    pub fn set_segmentation_context(&mut self, apdu: Apdu) -> Result<()> {
        if apdu.is_segmented() || apdu.more_follows() {
            return Err(ApplicationError::SegmentationError(
                "message is already segmented".to_string(),
            ));
        }
        let data = apdu.service_data().cloned().ok_or_else(|| {
            ApplicationError::SegmentationError(format!(
                "{} carries no service data",
                apdu.apdu_type()
            ))
        })?;
        self.segment_data = data;
        self.segment_apdu = Some(apdu);
        self.reassembly.clear();
        Ok(())
    }

    /// Fix the segment size and derive the segment count from the payload
    pub fn set_segment_size(&mut self, size: usize) {
        self.segment_size = size.max(1);
        self.segment_count = segment_count(self.segment_data.len(), self.segment_size);
    }

    /// Message to send for segment `index`: the original message when it fits
    /// in one segment, otherwise a slice of the payload wrapped in a segment
    /// header.
    pub fn get_segment(&self, index: usize) -> Result<Apdu> {
        let template = self.segment_apdu.as_ref().ok_or_else(|| {
            ApplicationError::SegmentationError("no segmentation context".to_string())
        })?;
        if index >= self.segment_count {
            return Err(ApplicationError::SegmentationError(format!(
                "invalid segment number {} of {}",
                index, self.segment_count
            )));
        }
        if self.segment_count == 1 {
            return Ok(template.clone());
        }

        let start = index * self.segment_size;
        let end = (start + self.segment_size).min(self.segment_data.len());
        let service_data = self.segment_data.slice(start..end);
        let more_follows = index < self.segment_count - 1;
        let sequence_number = Some(index as u8);
        let proposed_window_size = (index == 0).then_some(self.proposed_window_size);

        match template {
            Apdu::ConfirmedRequest {
                max_segments,
                max_response_size,
                invoke_id,
                service_choice,
                ..
            } => Ok(Apdu::ConfirmedRequest {
                segmented: true,
                more_follows,
                segmented_response_accepted: self.params.segmentation_supported.can_receive(),
                max_segments: *max_segments,
                max_response_size: *max_response_size,
                invoke_id: *invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice: *service_choice,
                service_data,
            }),
            Apdu::ComplexAck {
                invoke_id,
                service_choice,
                ..
            } => Ok(Apdu::ComplexAck {
                segmented: true,
                more_follows,
                invoke_id: *invoke_id,
                sequence_number,
                proposed_window_size,
                service_choice: *service_choice,
                service_data,
            }),
            other => Err(ApplicationError::SegmentationError(format!(
                "{} cannot be segmented",
                other.apdu_type()
            ))),
        }
    }

    /// Begin reassembling a segmented message from its first segment. The
    /// header of the first segment, stripped of segmentation fields, becomes
    /// the template of the reassembled message.
    pub fn start_reassembly(&mut self, first: &Apdu) -> Result<()> {
        self.set_segmentation_context(unsegmented(first)?)
    }

    /// Append the payload of a received segment
    pub fn append_segment(&mut self, apdu: &Apdu) -> Result<()> {
        let template = self.segment_apdu.as_ref().ok_or_else(|| {
            ApplicationError::SegmentationError("no segmentation context".to_string())
        })?;
        if template.is_segmented() || template.more_follows() {
            return Err(ApplicationError::SegmentationError(
                "segmentation context is itself a segment".to_string(),
            ));
        }
        let data = apdu.service_data().ok_or_else(|| {
            ApplicationError::SegmentationError(format!(
                "{} carries no service data",
                apdu.apdu_type()
            ))
        })?;
        self.reassembly.extend_from_slice(data);
        Ok(())
    }

    /// The reassembled message, consuming the accumulated payload
    pub fn take_reassembled(&mut self) -> Result<Apdu> {
        let mut apdu = self.segment_apdu.clone().ok_or_else(|| {
            ApplicationError::SegmentationError("no segmentation context".to_string())
        })?;
        let payload = self.reassembly.split().freeze();
        match &mut apdu {
            Apdu::ConfirmedRequest { service_data, .. } | Apdu::ComplexAck { service_data, .. } => {
                *service_data = payload;
            }
            _ => {}
        }
        Ok(apdu)
    }

    /// Bytes reassembled so far
    pub fn reassembled_len(&self) -> usize {
        self.reassembly.len()
    }

    /// True iff `seq` lies in `[base, base + actual window size)` modulo 256
    pub fn in_window(&self, seq: u8, base: u8) -> bool {
        seq_in_window(seq, base, self.actual_window_size)
    }

    /// Sequence number of the first segment of the current window
    pub fn initial_sequence_number(&self) -> u8 {
        self.initial_segment as u8
    }

    /// Send up to a window of segments starting at segment `base`
    pub fn fill_window(&mut self, ctx: &mut SsmContext<'_>, base: usize) -> Result<()> {
        for ix in 0..usize::from(self.actual_window_size) {
            let index = base + ix;
            if index >= self.segment_count {
                self.sent_all_segments = true;
                break;
            }
            let apdu = self.get_segment(index)?;
            let last = !apdu.more_follows();
            trace!("transaction {} sending segment {}", self.key, index);
            self.send_to_peer(ctx, apdu);
            if last {
                self.sent_all_segments = true;
                break;
            }
        }
        Ok(())
    }

    /// Move the window past an acknowledged sequence number and send the next
    /// window
    pub fn advance_window(&mut self, ctx: &mut SsmContext<'_>, acked: u8) -> Result<()> {
        let base = self.initial_sequence_number();
        self.initial_segment += usize::from(seq_distance(acked, base)) + 1;
        self.segment_retry_count = 0;
        self.fill_window(ctx, self.initial_segment)
    }

    /// Open reassembly with segment 0 of an inbound segmented message. The
    /// window is the smaller of the sender's proposal and ours.
    pub fn accept_first_segment(&mut self, first: &Apdu) -> Result<()> {
        self.start_reassembly(first)?;
        self.append_segment(first)?;
        self.actual_window_size = first
            .window_size()
            .unwrap_or(1)
            .min(self.proposed_window_size)
            .max(1);
        self.last_sequence_number = 0;
        self.initial_segment = 0;
        Ok(())
    }

    /// Take one segment of an inbound segmented message. Segments must arrive
    /// in order; anything else is answered with a negative ack naming the
    /// last good segment and otherwise dropped. The last segment of each
    /// window and the final segment are acknowledged.
    pub fn receive_segment(
        &mut self,
        ctx: &mut SsmContext<'_>,
        apdu: &Apdu,
    ) -> Result<SegmentReceipt> {
        let seq = apdu.sequence_number().ok_or_else(|| {
            ApplicationError::SegmentationError("segment without sequence number".to_string())
        })?;
        let segment_timeout = self.segment_receive_timeout();

        let expected = seq_next(self.last_sequence_number);
        if seq != expected {
            debug!(
                "transaction {} segment {} out of order, expected {}",
                self.key, seq, expected
            );
            self.restart_timer(ctx, segment_timeout)?;
            let nak = self.segment_ack(true, self.last_sequence_number);
            self.send_to_peer(ctx, nak);
            return Ok(SegmentReceipt::OutOfOrder);
        }

        self.append_segment(apdu)?;
        self.last_sequence_number = seq;

        if !apdu.more_follows() {
            let ack = self.segment_ack(false, seq);
            self.send_to_peer(ctx, ack);
            return Ok(SegmentReceipt::Complete(self.take_reassembled()?));
        }

        self.restart_timer(ctx, segment_timeout)?;
        if seq == self.initial_sequence_number().wrapping_add(self.actual_window_size) {
            self.initial_segment = usize::from(seq);
            let ack = self.segment_ack(false, seq);
            self.send_to_peer(ctx, ack);
            return Ok(SegmentReceipt::WindowAcked);
        }
        Ok(SegmentReceipt::Pending)
    }

    /// How long the receiving side of a segmented message waits for the next
    /// segment: four segment timeouts (clause 5.4.4.4 / 5.4.5.2)
    pub fn segment_receive_timeout(&self) -> u32 {
        self.params.segment_timeout.saturating_mul(4)
    }

    /// Abort PDU for this transaction; the transaction becomes ABORTED
    pub fn abort(&mut self, ctx: &mut SsmContext<'_>, reason: AbortReason) -> Result<Apdu> {
        warn!("{:?} transaction {} aborted: {}", self.direction, self.key, reason);
        self.set_state(ctx, SsmState::Aborted)?;
        Ok(Apdu::Abort {
            server: self.direction == Direction::Server,
            invoke_id: self.key.invoke_id,
            abort_reason: reason,
        })
    }

    /// Segment acknowledgment from this side
    pub fn segment_ack(&self, negative: bool, sequence_number: u8) -> Apdu {
        Apdu::SegmentAck {
            negative,
            server: self.direction == Direction::Server,
            invoke_id: self.key.invoke_id,
            sequence_number,
            window_size: self.actual_window_size,
        }
    }

    /// Queue `apdu` for transmission to the peer
    pub fn send_to_peer(&self, ctx: &mut SsmContext<'_>, apdu: Apdu) {
        ctx.events
            .push_back(SapEvent::Transmit(Pdu::outbound(self.key.address.clone(), apdu)));
    }

    /// Hand an inbound request to the local application
    pub fn deliver_request(&self, ctx: &mut SsmContext<'_>, apdu: Apdu) {
        ctx.events
            .push_back(SapEvent::Request(Pdu::inbound(self.key.address.clone(), apdu)));
    }

    /// Hand a response (ack, error, reject or abort) to the local application
    pub fn deliver_response(&self, ctx: &mut SsmContext<'_>, apdu: Apdu) {
        ctx.events
            .push_back(SapEvent::Response(Pdu::inbound(self.key.address.clone(), apdu)));
    }
}

/// Outcome of [`SsmCore::receive_segment`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentReceipt {
    /// Not the next expected segment; a negative ack was sent
    OutOfOrder,
    /// Accepted, more segments expected in this window
    Pending,
    /// Accepted and the window was acknowledged
    WindowAcked,
    /// Final segment accepted; the reassembled message
    Complete(Apdu),
}

/// Copy of a segment header with the segmentation fields cleared and no payload
fn unsegmented(apdu: &Apdu) -> Result<Apdu> {
    match apdu {
        Apdu::ConfirmedRequest {
            segmented_response_accepted,
            max_segments,
            max_response_size,
            invoke_id,
            service_choice,
            ..
        } => Ok(Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: *segmented_response_accepted,
            max_segments: *max_segments,
            max_response_size: *max_response_size,
            invoke_id: *invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: *service_choice,
            service_data: Bytes::new(),
        }),
        Apdu::ComplexAck {
            invoke_id,
            service_choice,
            ..
        } => Ok(Apdu::ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id: *invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice: *service_choice,
            service_data: Bytes::new(),
        }),
        other => Err(ApplicationError::SegmentationError(format!(
            "{} cannot be reassembled",
            other.apdu_type()
        ))),
    }
}

/// The behavior that differs between the requesting and responding side
pub trait SsmRole: fmt::Debug {
    /// Input travelling towards the peer's answer: the application's request
    /// on the client side, the peer's request traffic on the server side
    fn indication(
        &mut self,
        core: &mut SsmCore,
        ctx: &mut SsmContext<'_>,
        apdu: Apdu,
    ) -> Result<()>;

    /// Input travelling back: the peer's answers on the client side, the
    /// application's reply on the server side
    fn confirmation(
        &mut self,
        core: &mut SsmCore,
        ctx: &mut SsmContext<'_>,
        apdu: Apdu,
    ) -> Result<()>;

    /// The transaction timer fired
    fn process_timeout(&mut self, core: &mut SsmCore, ctx: &mut SsmContext<'_>) -> Result<()>;
}

/// A transaction: the shared engine plus its directional strategy
#[derive(Debug)]
pub struct Ssm<R> {
    core: SsmCore,
    role: R,
}

impl<R: SsmRole> Ssm<R> {
    pub fn with_role(core: SsmCore, role: R) -> Self {
        Self { core, role }
    }

    pub fn core(&self) -> &SsmCore {
        &self.core
    }

    pub fn role(&self) -> &R {
        &self.role
    }

    pub fn state(&self) -> SsmState {
        self.core.state
    }

    pub fn key(&self) -> &TransactionKey {
        &self.core.key
    }

    pub fn indication(&mut self, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        self.role.indication(&mut self.core, ctx, apdu)
    }

    pub fn confirmation(&mut self, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        self.role.confirmation(&mut self.core, ctx, apdu)
    }

    pub fn process_timeout(&mut self, ctx: &mut SsmContext<'_>) -> Result<()> {
        self.core.timer = None;
        if self.core.state.is_terminal() {
            return Ok(());
        }
        trace!("transaction {} timed out in {}", self.core.key, self.core.state);
        self.role.process_timeout(&mut self.core, ctx)
    }

    /// Stop the timer and drop the device info reference without telling
    /// anyone. Used when the owning access point shuts down.
    pub fn discard(&mut self, ctx: &mut SsmContext<'_>) -> Result<()> {
        self.core.stop_timer(ctx);
        if let Some(handle) = self.core.device.take() {
            ctx.devices.release(handle)?;
        }
        Ok(())
    }
}

/// Access point resources owned by a test, lent out as an [`SsmContext`]
#[cfg(test)]
pub(crate) mod testing {
    use std::{collections::VecDeque, sync::Arc};

    use super::*;
    use crate::task::ManualClock;

    pub(crate) struct Harness {
        pub clock: Arc<ManualClock>,
        pub config: ApplicationConfig,
        pub devices: DeviceInfoCache,
        pub tasks: TaskManager<SsmTimer>,
        pub events: VecDeque<SapEvent>,
    }

    impl Harness {
        pub fn new(config: ApplicationConfig) -> Self {
            let clock = Arc::new(ManualClock::new());
            Self {
                tasks: TaskManager::new(clock.clone()),
                clock,
                config,
                devices: DeviceInfoCache::new(),
                events: VecDeque::new(),
            }
        }

        pub fn ctx(&mut self) -> SsmContext<'_> {
            SsmContext {
                config: &self.config,
                devices: &mut self.devices,
                tasks: &mut self.tasks,
                events: &mut self.events,
            }
        }

        pub fn params(&self) -> TransactionParameters {
            TransactionParameters::resolve(None, &self.config)
        }

        /// APDUs queued for the network, in order
        pub fn transmitted(&mut self) -> Vec<Apdu> {
            let mut out = Vec::new();
            self.events.retain(|event| match event {
                SapEvent::Transmit(pdu) => {
                    out.push(pdu.apdu.clone());
                    false
                }
                _ => true,
            });
            out
        }

        /// APDUs handed to the application, in order
        pub fn delivered(&mut self) -> Vec<Apdu> {
            let mut out = Vec::new();
            self.events.retain(|event| match event {
                SapEvent::Request(pdu) | SapEvent::Response(pdu) => {
                    out.push(pdu.apdu.clone());
                    false
                }
                _ => true,
            });
            out
        }
    }

    pub(crate) fn peer() -> Address {
        Address::local_station(vec![192, 168, 1, 20, 0xBA, 0xC0])
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{peer, Harness};
    use super::*;
    use crate::app::{DeviceInfo, DeviceInfoKey};
    use crate::service::ConfirmedServiceChoice;
    use proptest::prelude::*;

    fn new_core(direction: Direction, harness: &Harness) -> SsmCore {
        SsmCore::new(direction, TransactionKey::new(7, peer()), harness.params(), 2)
    }

    fn request(len: usize) -> Apdu {
        let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
        Apdu::confirmed_request(7, ConfirmedServiceChoice::WritePropertyMultiple, payload)
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut harness = Harness::new(ApplicationConfig::default());
        let mut core = new_core(Direction::Client, &harness);
        let mut ctx = harness.ctx();

        core.set_state(&mut ctx, SsmState::AwaitConfirmation).unwrap();
        core.set_state(&mut ctx, SsmState::Completed).unwrap();
        assert_eq!(
            core.set_state(&mut ctx, SsmState::Completed),
            Err(ApplicationError::InvalidStateTransition {
                from: SsmState::Completed,
                to: SsmState::Completed,
            })
        );
        assert!(core.set_state(&mut ctx, SsmState::Aborted).is_err());
        assert_eq!(core.state(), SsmState::Completed);
    }

    #[test]
    fn test_terminal_state_stops_timer_and_releases_device() {
        let mut harness = Harness::new(ApplicationConfig::default());
        let handle = harness
            .devices
            .insert(DeviceInfo::new(None, Some(peer())));
        let mut core = new_core(Direction::Client, &harness);
        core.device = harness.devices.acquire(&DeviceInfoKey::address(peer()));

        let mut ctx = harness.ctx();
        core.set_state_timed(&mut ctx, SsmState::AwaitConfirmation, 100)
            .unwrap();
        let timer = core.timer.unwrap();
        core.abort(&mut ctx, AbortReason::Other).unwrap();

        assert!(!harness.tasks.is_pending(timer));
        assert_eq!(harness.devices.device_info(handle).unwrap().ref_count(), 0);
    }

    #[test]
    fn test_restart_timer_replaces_previous() {
        let mut harness = Harness::new(ApplicationConfig::default());
        let mut core = new_core(Direction::Server, &harness);
        let mut ctx = harness.ctx();

        core.start_timer(&mut ctx, 100).unwrap();
        let first = core.timer.unwrap();
        core.restart_timer(&mut ctx, 100).unwrap();
        assert!(!ctx.tasks.is_pending(first));
        assert_eq!(ctx.tasks.pending(), 1);
    }

    #[test]
    fn test_already_segmented_context_rejected() {
        let harness = Harness::new(ApplicationConfig::default());
        let mut core = new_core(Direction::Client, &harness);
        let mut segment = request(10);
        if let Apdu::ConfirmedRequest { segmented, .. } = &mut segment {
            *segmented = true;
        }
        assert!(matches!(
            core.set_segmentation_context(segment),
            Err(ApplicationError::SegmentationError(_))
        ));
        assert!(core.append_segment(&request(1)).is_err());
    }

    #[test]
    fn test_single_segment_is_original_message() {
        let harness = Harness::new(ApplicationConfig::default());
        let mut core = new_core(Direction::Client, &harness);
        let original = request(40);
        core.set_segmentation_context(original.clone()).unwrap();
        core.set_segment_size(50);

        assert_eq!(core.segment_count(), 1);
        assert_eq!(core.get_segment(0).unwrap(), original);
        assert!(core.get_segment(1).is_err());
    }

    #[test]
    fn test_segment_headers() {
        let harness = Harness::new(
            ApplicationConfig::default().with_segmentation(crate::app::Segmentation::Both),
        );
        let mut core = new_core(Direction::Client, &harness);
        core.set_segmentation_context(request(120)).unwrap();
        core.set_segment_size(50);
        assert_eq!(core.segment_count(), 3);

        let first = core.get_segment(0).unwrap();
        assert!(first.is_segmented());
        assert!(first.more_follows());
        assert_eq!(first.window_size(), Some(2));
        assert_eq!(first.sequence_number(), Some(0));
        assert!(matches!(
            first,
            Apdu::ConfirmedRequest {
                segmented_response_accepted: true,
                ..
            }
        ));

        let last = core.get_segment(2).unwrap();
        assert!(!last.more_follows());
        assert_eq!(last.window_size(), None);
        assert_eq!(last.service_data().unwrap().len(), 20);
        assert!(core.get_segment(3).is_err());
    }

    #[test]
    fn test_fill_window_marks_all_sent() {
        let mut harness = Harness::new(ApplicationConfig::default());
        let mut core = new_core(Direction::Client, &harness);
        core.set_segmentation_context(request(150)).unwrap();
        core.set_segment_size(50);
        core.actual_window_size = 2;

        let mut ctx = harness.ctx();
        core.fill_window(&mut ctx, 0).unwrap();
        assert!(!core.sent_all_segments);
        core.fill_window(&mut ctx, 2).unwrap();
        assert!(core.sent_all_segments);

        let sent: Vec<Option<u8>> = harness
            .transmitted()
            .iter()
            .map(|apdu| apdu.sequence_number())
            .collect();
        assert_eq!(sent, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_in_window_wraps() {
        let harness = Harness::new(ApplicationConfig::default());
        let mut core = new_core(Direction::Client, &harness);
        core.actual_window_size = 10;
        assert!(core.in_window(3, 250));
        assert!(core.in_window(250, 250));
        assert!(!core.in_window(4, 250));
        assert!(!core.in_window(249, 250));
    }

    #[test]
    fn test_reassembly_of_complex_ack() {
        let harness = Harness::new(ApplicationConfig::default());
        let mut sender = new_core(Direction::Server, &harness);
        let ack = Apdu::complex_ack(7, 12, vec![0xAB; 75]);
        sender.set_segmentation_context(ack.clone()).unwrap();
        sender.set_segment_size(30);

        let mut receiver = new_core(Direction::Client, &harness);
        let first = sender.get_segment(0).unwrap();
        receiver.start_reassembly(&first).unwrap();
        for index in 0..sender.segment_count() {
            receiver
                .append_segment(&sender.get_segment(index).unwrap())
                .unwrap();
        }
        assert_eq!(receiver.take_reassembled().unwrap(), ack);
    }

    proptest! {
        #[test]
        fn segments_rebuild_payload_prefix(
            payload in proptest::collection::vec(any::<u8>(), 1..600),
            size in 1usize..128,
            pick in any::<prop::sample::Index>(),
        ) {
            let harness = Harness::new(ApplicationConfig::default());
            let mut sender = new_core(Direction::Client, &harness);
            let original = Apdu::confirmed_request(
                7,
                ConfirmedServiceChoice::AtomicWriteFile,
                payload.clone(),
            );
            sender.set_segmentation_context(original).unwrap();
            sender.set_segment_size(size);
            let count = sender.segment_count();
            let last = pick.index(count);

            let mut receiver = new_core(Direction::Server, &harness);
            receiver.start_reassembly(&sender.get_segment(0).unwrap()).unwrap();
            for index in 0..=last {
                receiver.append_segment(&sender.get_segment(index).unwrap()).unwrap();
            }

            let end = ((last + 1) * size).min(payload.len());
            let rebuilt = receiver.take_reassembled().unwrap();
            prop_assert_eq!(rebuilt.service_data().unwrap().as_ref(), &payload[..end]);
        }

        #[test]
        fn in_window_matches_offsets(base in any::<u8>(), window in 1u8..=127, offset in any::<u8>()) {
            let harness = Harness::new(ApplicationConfig::default());
            let mut core = new_core(Direction::Client, &harness);
            core.actual_window_size = window;
            prop_assert_eq!(core.in_window(base.wrapping_add(offset), base), offset < window);
        }
    }
}
