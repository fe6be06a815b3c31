//! Client transactions
//!
//! A [`ClientSsm`] carries one confirmed request from the local application
//! to a remote device and brings the answer back:
//!
//! ```text
//! IDLE ──► SEGMENTED_REQUEST ──► AWAIT_CONFIRMATION ──► COMPLETED
//!   │                                  │    ▲
//!   └──────────────────────────────────┘    └── SEGMENTED_CONFIRMATION
//! ```
//!
//! Any state may end in ABORTED. A request that fits in one segment never
//! visits SEGMENTED_REQUEST; an unsegmented answer never visits
//! SEGMENTED_CONFIRMATION.

use log::{debug, trace};

use super::config::TransactionParameters;
use super::device_info::DeviceInfoKey;
use super::ssm::{
    Direction, SegmentReceipt, Ssm, SsmContext, SsmCore, SsmRole, SsmState, TransactionKey,
};
use super::{Apdu, ApplicationError, MaxApduSize, MaxSegments, Result};
use crate::service::AbortReason;

/// Requesting side strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientRole;

/// A confirmed request we initiated
pub type ClientSsm = Ssm<ClientRole>;

impl Ssm<ClientRole> {
    pub fn new(key: TransactionKey, params: TransactionParameters, proposed_window_size: u8) -> Self {
        Ssm::with_role(
            SsmCore::new(Direction::Client, key, params, proposed_window_size),
            ClientRole,
        )
    }
}

impl ClientRole {
    /// Send the request held in the segmentation context: work out the
    /// segment size from what is known about the server, check that both
    /// sides can handle the segment count, then send segment 0.
    fn send_request(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>) -> Result<()> {
        let remote = core.device.and_then(|handle| ctx.devices.device_info(handle));

        let segment_size = match remote.map(|info| (info.max_apdu_length_accepted, info.max_npdu_length)) {
            None | Some((None, _)) => core.params.max_apdu_length_accepted,
            Some((Some(apdu), None)) => apdu,
            Some((Some(apdu), Some(npdu))) => apdu.min(npdu),
        };
        let remote_segmentation = remote.map(|info| info.segmentation_supported);
        let remote_max_segments = remote.and_then(|info| info.max_segments_accepted);

        core.set_segment_size(usize::from(segment_size));
        trace!(
            "client transaction {}: {} segment(s) of {} bytes",
            core.key,
            core.segment_count,
            core.segment_size
        );

        if core.segment_count > 1 {
            if !core.params.segmentation_supported.can_transmit() {
                return self.refuse(core, ctx, AbortReason::SegmentationNotSupported);
            }
            if remote_segmentation.is_some_and(|segmentation| !segmentation.can_receive()) {
                return self.refuse(core, ctx, AbortReason::SegmentationNotSupported);
            }
            if remote_max_segments.is_some_and(|max| core.segment_count > usize::from(max)) {
                return self.refuse(core, ctx, AbortReason::ApduTooLong);
            }
        }

        if core.segment_count == 1 {
            core.sent_all_segments = true;
            let timeout = core.params.apdu_timeout;
            core.set_state_timed(ctx, SsmState::AwaitConfirmation, timeout)?;
        } else {
            core.sent_all_segments = false;
            core.segment_retry_count = 0;
            core.initial_segment = 0;
            // the server's first segment ack sets the real window
            core.actual_window_size = 1;
            let timeout = core.params.segment_timeout;
            core.set_state_timed(ctx, SsmState::SegmentedRequest, timeout)?;
        }

        let first = core.get_segment(0)?;
        core.send_to_peer(ctx, first);
        Ok(())
    }

    /// Abort before anything reached the wire; only the application hears
    /// about it
    fn refuse(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, reason: AbortReason) -> Result<()> {
        let abort = core.abort(ctx, reason)?;
        core.deliver_response(ctx, abort);
        Ok(())
    }

    /// Abort on a protocol violation; both the server and the application
    /// are told
    fn violation(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, reason: AbortReason) -> Result<()> {
        let abort = core.abort(ctx, reason)?;
        core.send_to_peer(ctx, abort.clone());
        core.deliver_response(ctx, abort);
        Ok(())
    }

    fn complete(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        core.set_state(ctx, SsmState::Completed)?;
        core.deliver_response(ctx, apdu);
        Ok(())
    }

    fn peer_abort(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        debug!("client transaction {} aborted by server", core.key);
        core.set_state(ctx, SsmState::Aborted)?;
        core.deliver_response(ctx, apdu);
        Ok(())
    }

    /// First segment of a segmented complex ack
    fn start_segmented_confirmation(
        &self,
        core: &mut SsmCore,
        ctx: &mut SsmContext<'_>,
        apdu: Apdu,
    ) -> Result<()> {
        if !core.params.segmentation_supported.can_receive() {
            return self.violation(core, ctx, AbortReason::SegmentationNotSupported);
        }
        if apdu.sequence_number() != Some(0) {
            return self.violation(core, ctx, AbortReason::InvalidApduInThisState);
        }

        core.accept_first_segment(&apdu)?;
        let timeout = core.segment_receive_timeout();
        core.set_state_timed(ctx, SsmState::SegmentedConfirmation, timeout)?;
        let ack = core.segment_ack(false, 0);
        core.send_to_peer(ctx, ack);
        Ok(())
    }

    fn segmented_request(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::SegmentAck {
                sequence_number,
                window_size,
                ..
            } => {
                core.actual_window_size = window_size.max(1);
                let segment_timeout = core.params.segment_timeout;

                if !core.in_window(sequence_number, core.initial_sequence_number()) {
                    trace!(
                        "client transaction {}: ack {} outside window",
                        core.key,
                        sequence_number
                    );
                    core.restart_timer(ctx, segment_timeout)
                } else if core.sent_all_segments {
                    let timeout = core.params.apdu_timeout;
                    core.set_state_timed(ctx, SsmState::AwaitConfirmation, timeout)
                } else {
                    core.advance_window(ctx, sequence_number)?;
                    core.restart_timer(ctx, segment_timeout)
                }
            }
            Apdu::SimpleAck { .. } | Apdu::Error { .. } | Apdu::ComplexAck { .. }
                if !core.sent_all_segments =>
            {
                self.violation(core, ctx, AbortReason::InvalidApduInThisState)
            }
            Apdu::ComplexAck { segmented: true, .. } => {
                self.start_segmented_confirmation(core, ctx, apdu)
            }
            Apdu::SimpleAck { .. } | Apdu::Error { .. } | Apdu::ComplexAck { .. } | Apdu::Reject { .. } => {
                self.complete(core, ctx, apdu)
            }
            Apdu::Abort { .. } => self.peer_abort(core, ctx, apdu),
            other => Err(ApplicationError::InvalidApdu(format!(
                "{} in {}",
                other.apdu_type(),
                core.state
            ))),
        }
    }

    fn await_confirmation(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::Abort { .. } => self.peer_abort(core, ctx, apdu),
            Apdu::ComplexAck { segmented: true, .. } => {
                self.start_segmented_confirmation(core, ctx, apdu)
            }
            Apdu::SimpleAck { .. } | Apdu::ComplexAck { .. } | Apdu::Error { .. } | Apdu::Reject { .. } => {
                self.complete(core, ctx, apdu)
            }
            Apdu::SegmentAck { .. } => {
                trace!("client transaction {}: late segment ack", core.key);
                Ok(())
            }
            other => Err(ApplicationError::InvalidApdu(format!(
                "{} in {}",
                other.apdu_type(),
                core.state
            ))),
        }
    }

    fn segmented_confirmation(
        &self,
        core: &mut SsmCore,
        ctx: &mut SsmContext<'_>,
        apdu: Apdu,
    ) -> Result<()> {
        match apdu {
            Apdu::Abort { .. } => self.peer_abort(core, ctx, apdu),
            Apdu::ComplexAck { segmented: true, .. } => match core.receive_segment(ctx, &apdu)? {
                SegmentReceipt::Complete(response) => self.complete(core, ctx, response),
                _ => Ok(()),
            },
            _ => self.violation(core, ctx, AbortReason::InvalidApduInThisState),
        }
    }
}

impl SsmRole for ClientRole {
    fn indication(&mut self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        if core.state != SsmState::Idle {
            return Err(ApplicationError::InvalidApdu(format!(
                "client transaction {} already started",
                core.key
            )));
        }
        let kind = apdu.apdu_type();
        let Apdu::ConfirmedRequest {
            segmented,
            more_follows,
            invoke_id,
            sequence_number,
            proposed_window_size,
            service_choice,
            service_data,
            ..
        } = apdu
        else {
            return Err(ApplicationError::InvalidApdu(format!(
                "client transaction cannot send {}",
                kind
            )));
        };

        // advertise what we can take back
        let request = Apdu::ConfirmedRequest {
            segmented,
            more_follows,
            segmented_response_accepted: core.params.segmentation_supported.can_receive(),
            max_segments: MaxSegments::from_count(core.params.max_segments_accepted),
            max_response_size: MaxApduSize::from_size(usize::from(
                core.params.max_apdu_length_accepted,
            )),
            invoke_id,
            sequence_number,
            proposed_window_size,
            service_choice,
            service_data,
        };
        core.set_segmentation_context(request)?;
        if core.device.is_none() {
            core.device = ctx
                .devices
                .acquire(&DeviceInfoKey::address(core.key.address.clone()));
        }
        core.retry_count = 0;
        self.send_request(core, ctx)
    }

    fn confirmation(&mut self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        match core.state {
            SsmState::SegmentedRequest => self.segmented_request(core, ctx, apdu),
            SsmState::AwaitConfirmation => self.await_confirmation(core, ctx, apdu),
            SsmState::SegmentedConfirmation => self.segmented_confirmation(core, ctx, apdu),
            state => Err(ApplicationError::InvalidApdu(format!(
                "{} in {}",
                apdu.apdu_type(),
                state
            ))),
        }
    }

    fn process_timeout(&mut self, core: &mut SsmCore, ctx: &mut SsmContext<'_>) -> Result<()> {
        let retries = core.params.number_of_apdu_retries;
        match core.state {
            SsmState::SegmentedRequest if core.segment_retry_count < retries => {
                core.segment_retry_count += 1;
                debug!(
                    "client transaction {}: segment retry {}",
                    core.key, core.segment_retry_count
                );
                let timeout = core.params.segment_timeout;
                core.start_timer(ctx, timeout)?;
                core.fill_window(ctx, core.initial_segment)
            }
            SsmState::AwaitConfirmation if core.retry_count < retries => {
                core.retry_count += 1;
                debug!("client transaction {}: retry {}", core.key, core.retry_count);
                self.send_request(core, ctx)
            }
            SsmState::SegmentedRequest
            | SsmState::AwaitConfirmation
            | SsmState::SegmentedConfirmation => self.refuse(core, ctx, AbortReason::NoResponse),
            _ => Ok(()),
        }
    }
}
