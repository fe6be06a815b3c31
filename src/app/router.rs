//! Service dispatch
//!
//! [`ServiceRouter`] hands reassembled requests to handlers registered per
//! service choice and turns a handler's [`ServiceReply`] into the reply APDU
//! for the requester. Confirmed services nobody registered are rejected with
//! [`RejectReason::UnrecognizedService`].

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use log::{debug, warn};

use super::sap::StateMachineAccessPoint;
use super::{Apdu, Pdu, Result};
use crate::network::Address;
use crate::service::{AbortReason, ConfirmedServiceChoice, RejectReason, UnconfirmedServiceChoice};

/// Outcome of a confirmed service handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceReply {
    SimpleAck,
    /// Encoded service-ack payload
    ComplexAck(Bytes),
    Error { error_class: u16, error_code: u16 },
    Reject(RejectReason),
    Abort(AbortReason),
}

impl ServiceReply {
    /// Reply APDU answering `invoke_id`
    pub fn into_apdu(self, invoke_id: u8, service_choice: ConfirmedServiceChoice) -> Apdu {
        let service_choice = service_choice as u8;
        match self {
            ServiceReply::SimpleAck => Apdu::SimpleAck {
                invoke_id,
                service_choice,
            },
            ServiceReply::ComplexAck(service_data) => {
                Apdu::complex_ack(invoke_id, service_choice, service_data)
            }
            ServiceReply::Error {
                error_class,
                error_code,
            } => Apdu::Error {
                invoke_id,
                service_choice,
                error_class,
                error_code,
            },
            ServiceReply::Reject(reject_reason) => Apdu::Reject {
                invoke_id,
                reject_reason,
            },
            ServiceReply::Abort(abort_reason) => Apdu::Abort {
                server: true,
                invoke_id,
                abort_reason,
            },
        }
    }
}

/// Handler for a confirmed service: requester and encoded request payload in,
/// reply out
pub type ConfirmedHandler = Box<dyn Fn(&Address, &[u8]) -> ServiceReply + Send + Sync>;

/// Handler for an unconfirmed service
pub type UnconfirmedHandler = Box<dyn Fn(&Address, &[u8]) + Send + Sync>;

/// Table of service handlers keyed by service choice
#[derive(Default)]
pub struct ServiceRouter {
    confirmed: HashMap<ConfirmedServiceChoice, ConfirmedHandler>,
    unconfirmed: HashMap<UnconfirmedServiceChoice, UnconfirmedHandler>,
}

impl fmt::Debug for ServiceRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut confirmed: Vec<_> = self.confirmed.keys().collect();
        confirmed.sort();
        let mut unconfirmed: Vec<_> = self.unconfirmed.keys().collect();
        unconfirmed.sort();
        f.debug_struct("ServiceRouter")
            .field("confirmed", &confirmed)
            .field("unconfirmed", &unconfirmed)
            .finish()
    }
}

impl ServiceRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for a confirmed service, replacing any earlier one
    pub fn on_confirmed<F>(&mut self, service: ConfirmedServiceChoice, handler: F) -> &mut Self
    where
        F: Fn(&Address, &[u8]) -> ServiceReply + Send + Sync + 'static,
    {
        self.confirmed.insert(service, Box::new(handler));
        self
    }

    /// Register `handler` for an unconfirmed service, replacing any earlier one
    pub fn on_unconfirmed<F>(&mut self, service: UnconfirmedServiceChoice, handler: F) -> &mut Self
    where
        F: Fn(&Address, &[u8]) + Send + Sync + 'static,
    {
        self.unconfirmed.insert(service, Box::new(handler));
        self
    }

    pub fn supports_confirmed(&self, service: ConfirmedServiceChoice) -> bool {
        self.confirmed.contains_key(&service)
    }

    pub fn supports_unconfirmed(&self, service: UnconfirmedServiceChoice) -> bool {
        self.unconfirmed.contains_key(&service)
    }

    /// Run the handler for an inbound request. Returns the reply addressed to
    /// the requester for confirmed requests, `None` otherwise.
    pub fn route(&self, pdu: &Pdu) -> Option<Pdu> {
        let Some(source) = pdu.source.as_ref() else {
            warn!("request without source address, not routed");
            return None;
        };

        match &pdu.apdu {
            Apdu::ConfirmedRequest {
                invoke_id,
                service_choice,
                service_data,
                ..
            } => {
                let reply = match self.confirmed.get(service_choice) {
                    Some(handler) => handler(source, service_data),
                    None => {
                        debug!("no handler for {:?} from {}", service_choice, source);
                        ServiceReply::Reject(RejectReason::UnrecognizedService)
                    }
                };
                Some(Pdu::outbound(
                    source.clone(),
                    reply.into_apdu(*invoke_id, *service_choice),
                ))
            }
            Apdu::UnconfirmedRequest {
                service_choice,
                service_data,
            } => {
                match self.unconfirmed.get(service_choice) {
                    Some(handler) => handler(source, service_data),
                    None => debug!("no handler for {:?} from {}", service_choice, source),
                }
                None
            }
            other => {
                warn!("{} is not a request, not routed", other.apdu_type());
                None
            }
        }
    }

    /// Route `pdu` and hand any reply back to the access point
    pub fn serve(&self, sap: &mut StateMachineAccessPoint, pdu: &Pdu) -> Result<()> {
        match self.route(pdu) {
            Some(reply) => sap.sap_confirmation(reply),
            None => Ok(()),
        }
    }
}
