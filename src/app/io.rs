//! Control blocks in front of the access point
//!
//! [`ApplicationIoController`] lets the application submit requests as
//! [`Iocb`]s and wait on them. Confirmed requests go through one
//! [`SieveQueue`] per destination so each device has at most one of our
//! requests outstanding. Requests that reach the front of their sieve are
//! parked in an outbox until the owner of the access point calls
//! [`ApplicationIoController::process_outbox`], which assigns invoke IDs and
//! starts the transactions. Answers coming out of the access point as
//! [`SapEvent::Response`] are matched back with
//! [`ApplicationIoController::response`].

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use super::sap::{SapEvent, StateMachineAccessPoint};
use super::ssm::TransactionKey;
use super::{Apdu, Pdu};
use crate::iocb::{Iocb, IocbError, SieveQueue};
use crate::network::Address;

/// Submits control blocks to a [`StateMachineAccessPoint`] and completes
/// them from its responses
#[derive(Debug, Default)]
pub struct ApplicationIoController {
    sieves: Mutex<HashMap<Address, SieveQueue>>,
    outbox: Arc<Mutex<VecDeque<Iocb>>>,
    in_flight: Mutex<HashMap<TransactionKey, Iocb>>,
}

impl ApplicationIoController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Submit a request. The request PDU needs a destination; the invoke ID
    /// of a confirmed request is assigned on sending.
    pub fn request_io(&self, iocb: &Iocb) -> Result<(), IocbError> {
        let destination = iocb
            .request()
            .destination
            .clone()
            .ok_or(IocbError::NoDestination)?;

        let sieve = self
            .sieves
            .lock()
            .entry(destination.clone())
            .or_insert_with(|| {
                trace!("new sieve for {}", destination);
                let outbox = self.outbox.clone();
                SieveQueue::new(destination, move |iocb| {
                    outbox.lock().push_back(iocb.clone());
                    Ok(())
                })
            })
            .clone();
        sieve.request_io(iocb)
    }

    /// Requests waiting for [`ApplicationIoController::process_outbox`]
    pub fn outbox_len(&self) -> usize {
        self.outbox.lock().len()
    }

    /// Transactions started and not answered yet
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Requests queued behind the one in flight to `address`
    pub fn queued(&self, address: &Address) -> usize {
        self.sieves
            .lock()
            .get(address)
            .map_or(0, SieveQueue::queued)
    }

    /// Hand every parked request to the access point. Returns how many were
    /// submitted.
    pub fn process_outbox(&self, sap: &mut StateMachineAccessPoint) -> usize {
        self.in_flight.lock().retain(|_, iocb| !iocb.is_complete());

        let mut submitted = 0;
        loop {
            // completing a request below may park the next one for the same
            // device, so the outbox is not held while submitting
            let Some(iocb) = self.outbox.lock().pop_front() else {
                break;
            };
            if iocb.is_complete() {
                continue;
            }
            if self.submit(sap, &iocb) {
                submitted += 1;
            }
        }
        submitted
    }

    fn submit(&self, sap: &mut StateMachineAccessPoint, iocb: &Iocb) -> bool {
        let request = iocb.request();
        let Some(destination) = request.destination.clone() else {
            iocb.abort(IocbError::NoDestination);
            return false;
        };
        if !sap.permits_initiation(&request.apdu) {
            debug!("iocb {}: communication disabled", iocb.id());
            iocb.abort(IocbError::CommunicationDisabled);
            return false;
        }

        match &request.apdu {
            Apdu::ConfirmedRequest { .. } => {
                let invoke_id = match sap.get_next_invoke_id(&destination) {
                    Ok(invoke_id) => invoke_id,
                    Err(e) => {
                        iocb.abort(e.into());
                        return false;
                    }
                };
                let apdu = with_invoke_id(&request.apdu, invoke_id);
                let key = TransactionKey::new(invoke_id, destination.clone());
                self.in_flight.lock().insert(key.clone(), iocb.clone());

                if let Err(e) = sap.sap_indication(Pdu::outbound(destination, apdu)) {
                    self.in_flight.lock().remove(&key);
                    iocb.abort(e.into());
                    return false;
                }
                trace!("iocb {} is transaction {}", iocb.id(), key);
                true
            }
            Apdu::UnconfirmedRequest { .. } => {
                match sap.sap_indication(request.clone()) {
                    Ok(()) => iocb.complete(None),
                    Err(e) => iocb.abort(e.into()),
                }
                true
            }
            other => {
                debug!("iocb {}: {} is not a request", iocb.id(), other.apdu_type());
                iocb.abort(IocbError::Application(super::ApplicationError::InvalidApdu(
                    format!("{} is not a request", other.apdu_type()),
                )));
                false
            }
        }
    }

    /// Settle the control block waiting on an answer from the access point.
    /// Acks complete it; errors, rejects and aborts abort it. Returns false if
    /// no control block was waiting.
    pub fn response(&self, pdu: &Pdu) -> bool {
        let (Some(source), Some(invoke_id)) = (pdu.source.as_ref(), pdu.apdu.invoke_id()) else {
            return false;
        };
        let key = TransactionKey::new(invoke_id, source.clone());
        let Some(iocb) = self.in_flight.lock().remove(&key) else {
            trace!("no iocb waiting on {}", key);
            return false;
        };

        match &pdu.apdu {
            Apdu::SimpleAck { .. } | Apdu::ComplexAck { .. } => iocb.complete(Some(pdu.clone())),
            Apdu::Error {
                error_class,
                error_code,
                ..
            } => iocb.abort(IocbError::Service {
                error_class: *error_class,
                error_code: *error_code,
            }),
            Apdu::Reject { reject_reason, .. } => iocb.abort(IocbError::Rejected(*reject_reason)),
            Apdu::Abort { abort_reason, .. } => iocb.abort(IocbError::Aborted(*abort_reason)),
            other => {
                debug!("{} does not settle iocb {}", other.apdu_type(), iocb.id());
                self.in_flight.lock().insert(key, iocb);
                return false;
            }
        }
        true
    }

    /// Settle control blocks from access point output. Returns the events
    /// the application still has to handle: transmissions, inbound requests
    /// and answers nobody was waiting on.
    pub fn handle_events(&self, events: Vec<SapEvent>) -> Vec<SapEvent> {
        events
            .into_iter()
            .filter(|event| match event {
                SapEvent::Response(pdu) => !self.response(pdu),
                _ => true,
            })
            .collect()
    }
}

fn with_invoke_id(apdu: &Apdu, invoke_id: u8) -> Apdu {
    let mut apdu = apdu.clone();
    if let Apdu::ConfirmedRequest { invoke_id: id, .. } = &mut apdu {
        *id = invoke_id;
    }
    apdu
}
