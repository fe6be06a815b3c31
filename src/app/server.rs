//! Server transactions
//!
//! A [`ServerSsm`] receives one confirmed request from a remote client,
//! hands it to the local application and carries the reply back:
//!
//! ```text
//! IDLE ──► SEGMENTED_REQUEST ──► AWAIT_RESPONSE ──► SEGMENTED_RESPONSE ──► COMPLETED
//!   │                                  ▲    │
//!   └──────────────────────────────────┘    └──────────────────────────────► COMPLETED
//! ```
//!
//! Any state may end in ABORTED. If the application does not answer within
//! the application timeout the transaction aborts with
//! [`AbortReason::ServerTimeout`]; only the application is told, the client
//! has long given up by then.

use log::{debug, warn};

use super::config::TransactionParameters;
use super::device_info::DeviceInfoKey;
use super::ssm::{
    Direction, SegmentReceipt, Ssm, SsmContext, SsmCore, SsmRole, SsmState, TransactionKey,
};
use super::{Apdu, ApplicationError, Result, Segmentation};
use crate::service::AbortReason;

/// Responding side strategy
#[derive(Debug, Default, Clone, Copy)]
pub struct ServerRole;

/// A confirmed request we are answering
pub type ServerSsm = Ssm<ServerRole>;

impl Ssm<ServerRole> {
    pub fn new(key: TransactionKey, params: TransactionParameters, proposed_window_size: u8) -> Self {
        Ssm::with_role(
            SsmCore::new(Direction::Server, key, params, proposed_window_size),
            ServerRole,
        )
    }

    /// Whether the client said it can take a segmented answer
    pub fn segmented_response_accepted(&self) -> bool {
        self.core().segmented_response_accepted
    }
}

impl ServerRole {
    fn violation(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, reason: AbortReason) -> Result<()> {
        let abort = core.abort(ctx, reason)?;
        core.send_to_peer(ctx, abort.clone());
        core.deliver_response(ctx, abort);
        Ok(())
    }

    fn peer_abort(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        debug!("server transaction {} aborted by client", core.key);
        core.set_state(ctx, SsmState::Aborted)?;
        core.deliver_response(ctx, apdu);
        Ok(())
    }

    fn idle(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        let Apdu::ConfirmedRequest {
            segmented,
            segmented_response_accepted,
            max_segments,
            max_response_size,
            ..
        } = &apdu
        else {
            return Err(ApplicationError::InvalidApdu(format!(
                "server transaction cannot start with {}",
                apdu.apdu_type()
            )));
        };
        let segmented = *segmented;
        core.segmented_response_accepted = *segmented_response_accepted;

        if core.device.is_none() {
            core.device = ctx
                .devices
                .acquire(&DeviceInfoKey::address(core.key.address.clone()));
        }

        let mut max_apdu = u16::try_from(max_response_size.size()).unwrap_or(u16::MAX);
        if let Some(info) = core.device.and_then(|handle| ctx.devices.device_info_mut(handle)) {
            if core.segmented_response_accepted {
                let upgraded = match info.segmentation_supported {
                    Segmentation::NoSegmentation => Segmentation::Receive,
                    Segmentation::Transmit => Segmentation::Both,
                    other => other,
                };
                if upgraded != info.segmentation_supported {
                    debug!(
                        "device {}: segmentation {} -> {}",
                        core.key.address, info.segmentation_supported, upgraded
                    );
                    info.segmentation_supported = upgraded;
                }
            }
            if let Some(cached) = info.max_apdu_length_accepted {
                max_apdu = max_apdu.min(cached);
            }
        }
        core.max_apdu_length_accepted = max_apdu;
        core.max_segments_accepted = max_segments.count();

        if !segmented {
            let timeout = ctx.config.application_timeout;
            core.set_state_timed(ctx, SsmState::AwaitResponse, timeout)?;
            core.deliver_request(ctx, apdu);
            return Ok(());
        }

        if !core.params.segmentation_supported.can_receive() {
            let abort = core.abort(ctx, AbortReason::SegmentationNotSupported)?;
            core.send_to_peer(ctx, abort);
            return Ok(());
        }
        if apdu.sequence_number() != Some(0) {
            let abort = core.abort(ctx, AbortReason::InvalidApduInThisState)?;
            core.send_to_peer(ctx, abort);
            return Ok(());
        }

        core.accept_first_segment(&apdu)?;
        let timeout = core.segment_receive_timeout();
        core.set_state_timed(ctx, SsmState::SegmentedRequest, timeout)?;
        let ack = core.segment_ack(false, 0);
        core.send_to_peer(ctx, ack);
        Ok(())
    }

    fn segmented_request(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::Abort { .. } => self.peer_abort(core, ctx, apdu),
            Apdu::ConfirmedRequest { segmented: true, .. } => {
                match core.receive_segment(ctx, &apdu)? {
                    SegmentReceipt::Complete(request) => {
                        let timeout = ctx.config.application_timeout;
                        core.set_state_timed(ctx, SsmState::AwaitResponse, timeout)?;
                        core.deliver_request(ctx, request);
                        Ok(())
                    }
                    _ => Ok(()),
                }
            }
            _ => self.violation(core, ctx, AbortReason::InvalidApduInThisState),
        }
    }

    fn await_response(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::ConfirmedRequest { .. } => {
                debug!("server transaction {}: duplicate request ignored", core.key);
                Ok(())
            }
            Apdu::Abort { .. } => self.peer_abort(core, ctx, apdu),
            other => Err(ApplicationError::InvalidApdu(format!(
                "{} in {}",
                other.apdu_type(),
                core.state
            ))),
        }
    }

    fn segmented_response(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        match apdu {
            Apdu::SegmentAck {
                sequence_number,
                window_size,
                ..
            } => {
                core.actual_window_size = window_size.max(1);
                let segment_timeout = core.params.segment_timeout;

                if !core.in_window(sequence_number, core.initial_sequence_number()) {
                    core.restart_timer(ctx, segment_timeout)
                } else if core.sent_all_segments {
                    core.set_state(ctx, SsmState::Completed)
                } else {
                    core.advance_window(ctx, sequence_number)?;
                    core.restart_timer(ctx, segment_timeout)
                }
            }
            Apdu::Abort { .. } => self.peer_abort(core, ctx, apdu),
            other => Err(ApplicationError::InvalidApdu(format!(
                "{} in {}",
                other.apdu_type(),
                core.state
            ))),
        }
    }

    /// The application answered with a complex ack: send it whole or start
    /// segmenting it
    fn respond(&self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        core.set_segmentation_context(apdu)?;

        let max_npdu = core
            .device
            .and_then(|handle| ctx.devices.device_info(handle))
            .and_then(|info| info.max_npdu_length);
        let segment_size = match max_npdu {
            Some(npdu) => npdu.min(core.max_apdu_length_accepted),
            None => core.max_apdu_length_accepted,
        };
        core.set_segment_size(usize::from(segment_size));

        if core.segment_count > 1 {
            if !core.params.segmentation_supported.can_transmit() || !core.segmented_response_accepted {
                return self.violation(core, ctx, AbortReason::SegmentationNotSupported);
            }
            if core
                .max_segments_accepted
                .is_some_and(|max| core.segment_count > usize::from(max))
            {
                return self.violation(core, ctx, AbortReason::ApduTooLong);
            }
        }

        core.segment_retry_count = 0;
        core.initial_segment = 0;
        core.actual_window_size = 1;

        let first = core.get_segment(0)?;
        if core.segment_count == 1 {
            core.set_state(ctx, SsmState::Completed)?;
            core.send_to_peer(ctx, first);
        } else {
            core.sent_all_segments = false;
            core.send_to_peer(ctx, first);
            let timeout = core.params.segment_timeout;
            core.set_state_timed(ctx, SsmState::SegmentedResponse, timeout)?;
        }
        Ok(())
    }
}

impl SsmRole for ServerRole {
    fn indication(&mut self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        match core.state {
            SsmState::Idle => self.idle(core, ctx, apdu),
            SsmState::SegmentedRequest => self.segmented_request(core, ctx, apdu),
            SsmState::AwaitResponse => self.await_response(core, ctx, apdu),
            SsmState::SegmentedResponse => self.segmented_response(core, ctx, apdu),
            state => Err(ApplicationError::InvalidApdu(format!(
                "{} in {}",
                apdu.apdu_type(),
                state
            ))),
        }
    }

    fn confirmation(&mut self, core: &mut SsmCore, ctx: &mut SsmContext<'_>, apdu: Apdu) -> Result<()> {
        if let Apdu::Abort { .. } = apdu {
            core.set_state(ctx, SsmState::Aborted)?;
            core.send_to_peer(ctx, apdu);
            return Ok(());
        }
        if core.state != SsmState::AwaitResponse {
            return Err(ApplicationError::InvalidApdu(format!(
                "application reply {} in {}",
                apdu.apdu_type(),
                core.state
            )));
        }

        match apdu {
            Apdu::SimpleAck { .. } | Apdu::Error { .. } | Apdu::Reject { .. } => {
                core.set_state(ctx, SsmState::Completed)?;
                core.send_to_peer(ctx, apdu);
                Ok(())
            }
            Apdu::ComplexAck { .. } => self.respond(core, ctx, apdu),
            other => Err(ApplicationError::InvalidApdu(format!(
                "application reply {} to a confirmed request",
                other.apdu_type()
            ))),
        }
    }

    fn process_timeout(&mut self, core: &mut SsmCore, ctx: &mut SsmContext<'_>) -> Result<()> {
        match core.state {
            SsmState::SegmentedRequest => {
                warn!("server transaction {}: client stopped sending segments", core.key);
                core.set_state(ctx, SsmState::Aborted)
            }
            SsmState::AwaitResponse => {
                let abort = core.abort(ctx, AbortReason::ServerTimeout)?;
                core.deliver_response(ctx, abort);
                Ok(())
            }
            SsmState::SegmentedResponse
                if core.segment_retry_count < core.params.number_of_apdu_retries =>
            {
                core.segment_retry_count += 1;
                debug!(
                    "server transaction {}: segment retry {}",
                    core.key, core.segment_retry_count
                );
                let timeout = core.params.segment_timeout;
                core.start_timer(ctx, timeout)?;
                core.fill_window(ctx, core.initial_segment)
            }
            SsmState::SegmentedResponse => {
                let abort = core.abort(ctx, AbortReason::NoResponse)?;
                core.deliver_response(ctx, abort);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
