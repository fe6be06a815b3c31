//! State Machine Access Point
//!
//! The [`StateMachineAccessPoint`] sits between the network and the local
//! application and owns every live transaction of one stack instance:
//!
//! - [`StateMachineAccessPoint::confirmation`]: a decoded APDU arrived from
//!   the network
//! - [`StateMachineAccessPoint::sap_indication`]: the application wants to
//!   send a request
//! - [`StateMachineAccessPoint::sap_confirmation`]: the application answers a
//!   request it was handed earlier
//! - [`StateMachineAccessPoint::process_tasks`]: run transaction timers that
//!   are due
//!
//! Nothing is sent or delivered directly. Every outcome is queued as a
//! [`SapEvent`] and the owner drains them with
//! [`StateMachineAccessPoint::poll_event`], forwarding `Transmit` events to
//! the network and the rest to the application.
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::app::{Apdu, ApplicationConfig, Pdu, SapEvent, StateMachineAccessPoint};
//! use bacnet_tsm::network::Address;
//! use bacnet_tsm::service::ConfirmedServiceChoice;
//!
//! let mut sap = StateMachineAccessPoint::new(ApplicationConfig::default());
//! let device = Address::local_station(vec![192, 168, 1, 10, 0xBA, 0xC0]);
//!
//! let invoke_id = sap.get_next_invoke_id(&device).unwrap();
//! let request = Apdu::confirmed_request(invoke_id, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
//! sap.sap_indication(Pdu::outbound(device.clone(), request)).unwrap();
//!
//! assert!(matches!(sap.poll_event(), Some(SapEvent::Transmit(_))));
//! assert_eq!(sap.client_transaction_count(), 1);
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Instant,
};

use log::{debug, trace, warn};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::client::{ClientRole, ClientSsm};
use super::config::{ApplicationConfig, LocalDeviceConfig, TransactionParameters};
use super::device_info::DeviceInfoCache;
use super::server::{ServerRole, ServerSsm};
use super::ssm::{Direction, Ssm, SsmContext, SsmRole, SsmState, SsmTimer, TransactionKey};
use super::{Apdu, ApduType, ApplicationError, Pdu, Result};
use crate::network::Address;
use crate::service::{ConfirmedServiceChoice, UnconfirmedServiceChoice};
use crate::task::{Clock, SystemClock, TaskError, TaskManager};

/// Output of the access point
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SapEvent {
    /// Send to the network; `destination` is set
    Transmit(Pdu),
    /// A request for the local application; `source` is set
    Request(Pdu),
    /// An answer for the local application (ack, error, reject or abort);
    /// `source` is set
    Response(Pdu),
}

/// Device communication control state of the local device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DeviceCommunicationControl {
    #[default]
    Enable,
    /// Only DeviceCommunicationControl, ReinitializeDevice and Who-Is get in;
    /// nothing is initiated
    Disable,
    /// Everything gets in; only I-Am is initiated
    DisableInitiation,
}

/// Access point counters
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplicationStatistics {
    /// Total APDUs received
    pub apdus_received: u64,
    /// Total APDUs handed out for transmission
    pub apdus_sent: u64,
    /// Confirmed requests received
    pub confirmed_requests: u64,
    /// Unconfirmed requests received
    pub unconfirmed_requests: u64,
    /// Simple ACKs received
    pub simple_acks: u64,
    /// Complex ACKs received
    pub complex_acks: u64,
    /// Segment ACKs received
    pub segment_acks: u64,
    /// Errors received
    pub errors: u64,
    /// Rejects received
    pub rejects: u64,
    /// Aborts received
    pub aborts: u64,
    /// Aborts sent
    pub aborts_sent: u64,
    /// PDUs dropped by communication control or with no matching transaction
    pub dropped: u64,
    /// Transaction timers fired
    pub timeouts: u64,
}

type Transactions<R> = HashMap<TransactionKey, Ssm<R>>;

/// Dispatcher owning the client and server transaction tables
#[derive(Debug)]
pub struct StateMachineAccessPoint {
    config: ApplicationConfig,
    local_device: Option<LocalDeviceConfig>,
    devices: DeviceInfoCache,
    tasks: TaskManager<SsmTimer>,
    events: VecDeque<SapEvent>,
    client_transactions: Transactions<ClientRole>,
    server_transactions: Transactions<ServerRole>,
    next_invoke_id: u8,
    dcc: DeviceCommunicationControl,
    stats: ApplicationStatistics,
}

impl StateMachineAccessPoint {
    /// Access point on the wall clock
    pub fn new(config: ApplicationConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Access point reading time from `clock`
    pub fn with_clock(config: ApplicationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            local_device: None,
            devices: DeviceInfoCache::new(),
            tasks: TaskManager::new(clock),
            events: VecDeque::new(),
            client_transactions: HashMap::new(),
            server_transactions: HashMap::new(),
            next_invoke_id: 1,
            dcc: DeviceCommunicationControl::Enable,
            stats: ApplicationStatistics::default(),
        }
    }

    /// Values from the local device object, taking precedence over the
    /// access point defaults for transactions started afterwards
    pub fn with_local_device(mut self, local: LocalDeviceConfig) -> Self {
        self.local_device = Some(local);
        self
    }

    pub fn set_local_device(&mut self, local: Option<LocalDeviceConfig>) {
        self.local_device = local;
    }

    pub fn config(&self) -> &ApplicationConfig {
        &self.config
    }

    pub fn device_info_cache(&self) -> &DeviceInfoCache {
        &self.devices
    }

    pub fn device_info_cache_mut(&mut self) -> &mut DeviceInfoCache {
        &mut self.devices
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        self.tasks.clock()
    }

    pub fn statistics(&self) -> &ApplicationStatistics {
        &self.stats
    }

    pub fn dcc(&self) -> DeviceCommunicationControl {
        self.dcc
    }

    pub fn set_dcc(&mut self, dcc: DeviceCommunicationControl) {
        debug!("device communication control {:?} -> {:?}", self.dcc, dcc);
        self.dcc = dcc;
    }

    pub fn client_transaction_count(&self) -> usize {
        self.client_transactions.len()
    }

    pub fn server_transaction_count(&self) -> usize {
        self.server_transactions.len()
    }

    /// State of a live client transaction
    pub fn client_state(&self, invoke_id: u8, address: &Address) -> Option<SsmState> {
        self.client_transactions
            .get(&TransactionKey::new(invoke_id, address.clone()))
            .map(Ssm::state)
    }

    /// State of a live server transaction
    pub fn server_state(&self, invoke_id: u8, address: &Address) -> Option<SsmState> {
        self.server_transactions
            .get(&TransactionKey::new(invoke_id, address.clone()))
            .map(Ssm::state)
    }

    /// True until [`StateMachineAccessPoint::shutdown`]
    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.tasks.is_running() {
            Ok(())
        } else {
            Err(TaskError::Shutdown.into())
        }
    }

    fn params(&self) -> TransactionParameters {
        TransactionParameters::resolve(self.local_device.as_ref(), &self.config)
    }

    fn parts(
        &mut self,
    ) -> (
        SsmContext<'_>,
        &mut Transactions<ClientRole>,
        &mut Transactions<ServerRole>,
    ) {
        (
            SsmContext {
                config: &self.config,
                devices: &mut self.devices,
                tasks: &mut self.tasks,
                events: &mut self.events,
            },
            &mut self.client_transactions,
            &mut self.server_transactions,
        )
    }

    /// Next invoke ID not held by a live client transaction to `address`
    pub fn get_next_invoke_id(&mut self, address: &Address) -> Result<u8> {
        for _ in 0..=u8::MAX {
            let candidate = self.next_invoke_id;
            self.next_invoke_id = self.next_invoke_id.wrapping_add(1);
            let key = TransactionKey::new(candidate, address.clone());
            if !self.client_transactions.contains_key(&key) {
                return Ok(candidate);
            }
        }
        Err(ApplicationError::NoInvokeIdAvailable(address.clone()))
    }

    /// Whether communication control lets `apdu` in from the network
    pub fn permits_inbound(&self, apdu: &Apdu) -> bool {
        match self.dcc {
            DeviceCommunicationControl::Enable | DeviceCommunicationControl::DisableInitiation => {
                true
            }
            DeviceCommunicationControl::Disable => matches!(
                apdu,
                Apdu::ConfirmedRequest {
                    service_choice: ConfirmedServiceChoice::DeviceCommunicationControl
                        | ConfirmedServiceChoice::ReinitializeDevice,
                    ..
                } | Apdu::UnconfirmedRequest {
                    service_choice: UnconfirmedServiceChoice::WhoIs,
                    ..
                }
            ),
        }
    }

    /// Whether communication control lets the application initiate `apdu`
    pub fn permits_initiation(&self, apdu: &Apdu) -> bool {
        match self.dcc {
            DeviceCommunicationControl::Enable => true,
            DeviceCommunicationControl::Disable => false,
            DeviceCommunicationControl::DisableInitiation => matches!(
                apdu,
                Apdu::UnconfirmedRequest {
                    service_choice: UnconfirmedServiceChoice::IAm,
                    ..
                }
            ),
        }
    }

    fn count_received(&mut self, apdu: &Apdu) {
        self.stats.apdus_received += 1;
        let counter = match apdu.apdu_type() {
            ApduType::ConfirmedRequest => &mut self.stats.confirmed_requests,
            ApduType::UnconfirmedRequest => &mut self.stats.unconfirmed_requests,
            ApduType::SimpleAck => &mut self.stats.simple_acks,
            ApduType::ComplexAck => &mut self.stats.complex_acks,
            ApduType::SegmentAck => &mut self.stats.segment_acks,
            ApduType::Error => &mut self.stats.errors,
            ApduType::Reject => &mut self.stats.rejects,
            ApduType::Abort => &mut self.stats.aborts,
        };
        *counter += 1;
    }

    /// A decoded APDU arrived from the network
    pub fn confirmation(&mut self, pdu: Pdu) -> Result<()> {
        self.ensure_running()?;
        let source = pdu.source.ok_or_else(|| {
            ApplicationError::InvalidApdu("inbound PDU without source address".to_string())
        })?;
        let apdu = pdu.apdu;
        self.count_received(&apdu);

        if !self.permits_inbound(&apdu) {
            debug!("communication disabled, dropping {} from {}", apdu.apdu_type(), source);
            self.stats.dropped += 1;
            return Ok(());
        }

        let Some(invoke_id) = apdu.invoke_id() else {
            self.events
                .push_back(SapEvent::Request(Pdu::inbound(source, apdu)));
            return Ok(());
        };
        let key = TransactionKey::new(invoke_id, source);
        let kind = apdu.apdu_type();

        let found = match apdu {
            Apdu::ConfirmedRequest { .. } => {
                if !self.server_transactions.contains_key(&key) {
                    let ssm =
                        ServerSsm::new(key.clone(), self.params(), self.config.proposed_window_size);
                    self.server_transactions.insert(key.clone(), ssm);
                }
                let (mut ctx, _, servers) = self.parts();
                dispatch(servers, &mut ctx, &key, |ssm, ctx| ssm.indication(ctx, apdu))?
            }
            Apdu::SimpleAck { .. }
            | Apdu::ComplexAck { .. }
            | Apdu::Error { .. }
            | Apdu::Reject { .. }
            | Apdu::Abort { server: true, .. }
            | Apdu::SegmentAck { server: true, .. } => {
                let (mut ctx, clients, _) = self.parts();
                dispatch(clients, &mut ctx, &key, |ssm, ctx| ssm.confirmation(ctx, apdu))?
            }
            Apdu::Abort { .. } | Apdu::SegmentAck { .. } => {
                let (mut ctx, _, servers) = self.parts();
                dispatch(servers, &mut ctx, &key, |ssm, ctx| ssm.indication(ctx, apdu))?
            }
            Apdu::UnconfirmedRequest { .. } => true,
        };

        if !found {
            warn!("no transaction for {} {}, dropped", kind, key);
            self.stats.dropped += 1;
        }
        Ok(())
    }

    /// The application sends a request. Confirmed requests carry an invoke ID
    /// from [`StateMachineAccessPoint::get_next_invoke_id`] or one of the
    /// caller's choosing that is not in use towards the same destination.
    pub fn sap_indication(&mut self, pdu: Pdu) -> Result<()> {
        self.ensure_running()?;
        let destination = pdu.destination.ok_or_else(|| {
            ApplicationError::InvalidApdu("outbound PDU without destination address".to_string())
        })?;
        let apdu = pdu.apdu;

        if !self.permits_initiation(&apdu) {
            debug!(
                "communication disabled, not sending {} to {}",
                apdu.apdu_type(),
                destination
            );
            self.stats.dropped += 1;
            return Ok(());
        }

        match apdu {
            Apdu::UnconfirmedRequest { .. } => {
                self.events
                    .push_back(SapEvent::Transmit(Pdu::outbound(destination, apdu)));
                Ok(())
            }
            Apdu::ConfirmedRequest { invoke_id, .. } => {
                let key = TransactionKey::new(invoke_id, destination);
                if self.client_transactions.contains_key(&key) {
                    return Err(ApplicationError::InvokeIdInUse {
                        invoke_id,
                        address: key.address,
                    });
                }
                if !key.address.is_station() {
                    warn!("confirmed request to non-station address {}", key.address);
                }

                let mut ssm = ClientSsm::new(key.clone(), self.params(), self.config.proposed_window_size);
                let (mut ctx, clients, _) = self.parts();
                if let Err(e) = ssm.indication(&mut ctx, apdu) {
                    debug!("transaction {} not started: {}", key, e);
                    if let Err(release) = ssm.discard(&mut ctx) {
                        warn!("transaction {}: {}", key, release);
                    }
                    return Err(e);
                }
                if ssm.state().is_terminal() {
                    trace!("transaction {} finished in {}", key, ssm.state());
                } else {
                    clients.insert(key, ssm);
                }
                Ok(())
            }
            other => Err(ApplicationError::InvalidApdu(format!(
                "application cannot initiate {}",
                other.apdu_type()
            ))),
        }
    }

    /// The application answers a confirmed request it received as a
    /// [`SapEvent::Request`]. `destination` is the requester.
    pub fn sap_confirmation(&mut self, pdu: Pdu) -> Result<()> {
        self.ensure_running()?;
        let destination = pdu.destination.ok_or_else(|| {
            ApplicationError::InvalidApdu("reply without destination address".to_string())
        })?;
        let apdu = pdu.apdu;

        match apdu {
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => {
                let key = TransactionKey::new(invoke_id, destination);
                let kind = apdu.apdu_type();
                let (mut ctx, _, servers) = self.parts();
                let found =
                    dispatch(servers, &mut ctx, &key, |ssm, ctx| ssm.confirmation(ctx, apdu))?;
                if !found {
                    warn!("no server transaction for reply {} {}, dropped", kind, key);
                    self.stats.dropped += 1;
                }
                Ok(())
            }
            other => Err(ApplicationError::InvalidApdu(format!(
                "{} is not a reply",
                other.apdu_type()
            ))),
        }
    }

    /// Run every transaction timer that is due. Returns how many fired.
    pub fn process_tasks(&mut self) -> Result<usize> {
        let mut fired = 0;
        while let Some(timer) = self.tasks.pop_ready() {
            fired += 1;
            self.stats.timeouts += 1;
            let (mut ctx, clients, servers) = self.parts();
            let found = match timer.direction {
                Direction::Client => {
                    dispatch(clients, &mut ctx, &timer.key, |ssm, ctx| ssm.process_timeout(ctx))?
                }
                Direction::Server => {
                    dispatch(servers, &mut ctx, &timer.key, |ssm, ctx| ssm.process_timeout(ctx))?
                }
            };
            if !found {
                trace!("timer for finished transaction {}", timer.key);
            }
        }
        Ok(fired)
    }

    /// When [`StateMachineAccessPoint::process_tasks`] next has work
    pub fn next_deadline(&mut self) -> Option<Instant> {
        self.tasks.next_deadline()
    }

    /// Next queued output
    pub fn poll_event(&mut self) -> Option<SapEvent> {
        let event = self.events.pop_front()?;
        if let SapEvent::Transmit(pdu) = &event {
            self.stats.apdus_sent += 1;
            if pdu.apdu.apdu_type() == ApduType::Abort {
                self.stats.aborts_sent += 1;
            }
        }
        Some(event)
    }

    /// All queued output, oldest first
    pub fn drain_events(&mut self) -> Vec<SapEvent> {
        std::iter::from_fn(|| self.poll_event()).collect()
    }

    /// Drop every transaction without notifying anyone, give back their
    /// device info references and refuse further work
    pub fn shutdown(&mut self) -> Result<()> {
        debug!(
            "access point shutting down with {} client and {} server transactions",
            self.client_transactions.len(),
            self.server_transactions.len()
        );
        let (mut ctx, clients, servers) = self.parts();
        for (_, mut ssm) in clients.drain() {
            ssm.discard(&mut ctx)?;
        }
        for (_, mut ssm) in servers.drain() {
            ssm.discard(&mut ctx)?;
        }
        self.tasks.shutdown();
        self.events.clear();
        Ok(())
    }
}

/// Run `f` against the transaction under `key` and drop the transaction once
/// it is finished. Returns false if there is no such transaction.
fn dispatch<R, F>(
    table: &mut Transactions<R>,
    ctx: &mut SsmContext<'_>,
    key: &TransactionKey,
    f: F,
) -> Result<bool>
where
    R: SsmRole,
    F: FnOnce(&mut Ssm<R>, &mut SsmContext<'_>) -> Result<()>,
{
    let Some(ssm) = table.get_mut(key) else {
        return Ok(false);
    };
    let result = f(ssm, ctx);
    if ssm.state().is_terminal() {
        trace!("transaction {} finished in {}", key, ssm.state());
        table.remove(key);
    }
    result.map(|()| true)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::app::{DeviceInfo, Segmentation};
    use crate::service::AbortReason;
    use crate::task::ManualClock;

    fn device() -> Address {
        Address::local_station(vec![10, 0, 0, 5, 0xBA, 0xC0])
    }

    fn access_point(config: ApplicationConfig) -> (Arc<ManualClock>, StateMachineAccessPoint) {
        let clock = Arc::new(ManualClock::new());
        let sap = StateMachineAccessPoint::with_clock(config, clock.clone());
        (clock, sap)
    }

    fn transmitted(events: &[SapEvent]) -> Vec<&Apdu> {
        events
            .iter()
            .filter_map(|event| match event {
                SapEvent::Transmit(pdu) => Some(&pdu.apdu),
                _ => None,
            })
            .collect()
    }

    fn responses(events: &[SapEvent]) -> Vec<&Apdu> {
        events
            .iter()
            .filter_map(|event| match event {
                SapEvent::Response(pdu) => Some(&pdu.apdu),
                _ => None,
            })
            .collect()
    }

    fn segment_ack(sequence_number: u8, window_size: u8, invoke_id: u8) -> Apdu {
        Apdu::SegmentAck {
            negative: false,
            server: true,
            invoke_id,
            sequence_number,
            window_size,
        }
    }

    fn cache_device(sap: &mut StateMachineAccessPoint, max_apdu: u16, segmentation: Segmentation) {
        let mut info = DeviceInfo::new(Some(5), Some(device()));
        info.max_apdu_length_accepted = Some(max_apdu);
        info.segmentation_supported = segmentation;
        sap.device_info_cache_mut().insert(info);
    }

    #[test]
    fn test_single_segment_request_completes() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        cache_device(&mut sap, 1476, Segmentation::NoSegmentation);

        let invoke_id = sap.get_next_invoke_id(&device()).unwrap();
        let request = Apdu::confirmed_request(invoke_id, ConfirmedServiceChoice::ReadProperty, vec![1, 2, 3]);
        sap.sap_indication(Pdu::outbound(device(), request)).unwrap();
        assert_eq!(sap.client_state(invoke_id, &device()), Some(SsmState::AwaitConfirmation));
        assert_eq!(transmitted(&sap.drain_events()).len(), 1);

        let ack = Apdu::SimpleAck { invoke_id, service_choice: 12 };
        sap.confirmation(Pdu::inbound(device(), ack.clone())).unwrap();

        let events = sap.drain_events();
        assert_eq!(responses(&events), vec![&ack]);
        assert_eq!(sap.client_transaction_count(), 0);
        let handle = sap
            .device_info_cache()
            .lookup(&crate::app::DeviceInfoKey::address(device()))
            .unwrap();
        assert_eq!(sap.device_info_cache().device_info(handle).unwrap().ref_count(), 0);
    }

    #[test]
    fn test_segmented_request_windows() {
        let config = ApplicationConfig::default().with_segmentation(Segmentation::Both);
        let (_clock, mut sap) = access_point(config);
        cache_device(&mut sap, 50, Segmentation::Both);

        let request = Apdu::confirmed_request(1, ConfirmedServiceChoice::WriteProperty, vec![0x55; 150]);
        sap.sap_indication(Pdu::outbound(device(), request)).unwrap();
        assert_eq!(sap.client_state(1, &device()), Some(SsmState::SegmentedRequest));
        let events = sap.drain_events();
        let sent = transmitted(&events);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].sequence_number(), Some(0));
        assert_eq!(sent[0].window_size(), Some(2));

        sap.confirmation(Pdu::inbound(device(), segment_ack(0, 2, 1))).unwrap();
        let events = sap.drain_events();
        let sequence: Vec<Option<u8>> = transmitted(&events)
            .iter()
            .map(|apdu| apdu.sequence_number())
            .collect();
        assert_eq!(sequence, vec![Some(1), Some(2)]);
        assert!(!transmitted(&events)[1].more_follows());

        sap.confirmation(Pdu::inbound(device(), segment_ack(2, 2, 1))).unwrap();
        assert_eq!(sap.client_state(1, &device()), Some(SsmState::AwaitConfirmation));
        assert!(sap.drain_events().is_empty());

        let ack = Apdu::SimpleAck { invoke_id: 1, service_choice: 15 };
        sap.confirmation(Pdu::inbound(device(), ack)).unwrap();
        assert_eq!(sap.client_transaction_count(), 0);
    }

    #[test]
    fn test_rejected_request_leaves_nothing_behind() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        cache_device(&mut sap, 1476, Segmentation::Both);

        let Apdu::ConfirmedRequest {
            max_segments,
            max_response_size,
            service_choice,
            service_data,
            ..
        } = Apdu::confirmed_request(4, ConfirmedServiceChoice::ReadProperty, vec![1, 2, 3])
        else {
            unreachable!()
        };
        let already_segmented = Apdu::ConfirmedRequest {
            segmented: true,
            more_follows: true,
            segmented_response_accepted: false,
            max_segments,
            max_response_size,
            invoke_id: 4,
            sequence_number: Some(0),
            proposed_window_size: Some(2),
            service_choice,
            service_data,
        };
        assert!(matches!(
            sap.sap_indication(Pdu::outbound(device(), already_segmented)),
            Err(ApplicationError::SegmentationError(_))
        ));
        assert_eq!(sap.client_transaction_count(), 0);
        assert_eq!(sap.client_state(4, &device()), None);
        assert!(sap.drain_events().is_empty());
        let handle = sap
            .device_info_cache()
            .lookup(&crate::app::DeviceInfoKey::address(device()))
            .unwrap();
        assert_eq!(sap.device_info_cache().device_info(handle).unwrap().ref_count(), 0);

        // the invoke id is free again
        let request = Apdu::confirmed_request(4, ConfirmedServiceChoice::ReadProperty, vec![1, 2, 3]);
        sap.sap_indication(Pdu::outbound(device(), request)).unwrap();
        assert_eq!(sap.client_state(4, &device()), Some(SsmState::AwaitConfirmation));
    }

    #[test]
    fn test_segmentation_refused_by_device() {
        let config = ApplicationConfig::default().with_segmentation(Segmentation::Both);
        let (_clock, mut sap) = access_point(config);
        cache_device(&mut sap, 50, Segmentation::NoSegmentation);

        let request = Apdu::confirmed_request(4, ConfirmedServiceChoice::WriteProperty, vec![0u8; 150]);
        sap.sap_indication(Pdu::outbound(device(), request)).unwrap();

        let events = sap.drain_events();
        assert!(transmitted(&events).is_empty());
        assert_eq!(
            responses(&events),
            vec![&Apdu::Abort {
                server: false,
                invoke_id: 4,
                abort_reason: AbortReason::SegmentationNotSupported,
            }]
        );
        assert_eq!(sap.client_transaction_count(), 0);
    }

    #[test]
    fn test_application_never_answers() {
        let config = ApplicationConfig::default().with_application_timeout(2000);
        let (clock, mut sap) = access_point(config);

        let request = Apdu::confirmed_request(17, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        sap.confirmation(Pdu::inbound(device(), request)).unwrap();
        assert_eq!(sap.server_state(17, &device()), Some(SsmState::AwaitResponse));
        assert!(matches!(sap.drain_events()[..], [SapEvent::Request(_)]));

        clock.advance(Duration::from_millis(1999));
        assert_eq!(sap.process_tasks().unwrap(), 0);
        clock.advance(Duration::from_millis(1));
        assert_eq!(sap.process_tasks().unwrap(), 1);

        let events = sap.drain_events();
        assert!(transmitted(&events).is_empty());
        assert_eq!(
            responses(&events),
            vec![&Apdu::Abort {
                server: true,
                invoke_id: 17,
                abort_reason: AbortReason::ServerTimeout,
            }]
        );
        assert_eq!(u8::from(AbortReason::ServerTimeout), 64);
        assert_eq!(sap.server_transaction_count(), 0);

        // a late reply finds nothing
        let late = Apdu::SimpleAck { invoke_id: 17, service_choice: 12 };
        sap.sap_confirmation(Pdu::outbound(device(), late)).unwrap();
        assert!(sap.drain_events().is_empty());
        assert_eq!(sap.statistics().dropped, 1);
    }

    #[test]
    fn test_no_response_after_retries() {
        let config = ApplicationConfig::default()
            .with_retries(1)
            .with_apdu_timeout(1000);
        let (clock, mut sap) = access_point(config);
        let request = Apdu::confirmed_request(2, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        sap.sap_indication(Pdu::outbound(device(), request)).unwrap();

        clock.advance(Duration::from_millis(1000));
        sap.process_tasks().unwrap();
        clock.advance(Duration::from_millis(1000));
        sap.process_tasks().unwrap();

        let events = sap.drain_events();
        assert_eq!(transmitted(&events).len(), 2);
        assert!(matches!(
            responses(&events)[..],
            [Apdu::Abort { abort_reason: AbortReason::NoResponse, .. }]
        ));
        assert_eq!(sap.client_transaction_count(), 0);
        assert_eq!(sap.statistics().timeouts, 2);
    }

    #[test]
    fn test_server_round_trip() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        let request = Apdu::confirmed_request(8, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        sap.confirmation(Pdu::inbound(device(), request)).unwrap();

        let Some(SapEvent::Request(inbound)) = sap.poll_event() else {
            panic!("request not delivered");
        };
        assert_eq!(inbound.source, Some(device()));

        let reply = Apdu::complex_ack(8, 12, vec![0x3E, 0x44, 0x42, 0x3F]);
        sap.sap_confirmation(Pdu::outbound(device(), reply.clone())).unwrap();
        assert_eq!(
            sap.poll_event(),
            Some(SapEvent::Transmit(Pdu::outbound(device(), reply)))
        );
        assert_eq!(sap.server_transaction_count(), 0);
        assert_eq!(sap.statistics().apdus_sent, 1);
    }

    #[test]
    fn test_invoke_id_in_use() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        let request = Apdu::confirmed_request(9, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        sap.sap_indication(Pdu::outbound(device(), request.clone())).unwrap();

        assert_eq!(
            sap.sap_indication(Pdu::outbound(device(), request.clone())),
            Err(ApplicationError::InvokeIdInUse {
                invoke_id: 9,
                address: device(),
            })
        );
        // same ID towards another device is fine
        let other = Address::local_station(vec![10, 0, 0, 6, 0xBA, 0xC0]);
        sap.sap_indication(Pdu::outbound(other, request)).unwrap();
        assert_eq!(sap.client_transaction_count(), 2);
    }

    #[test]
    fn test_invoke_id_exhaustion() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        for _ in 0..=u8::MAX {
            let invoke_id = sap.get_next_invoke_id(&device()).unwrap();
            let request = Apdu::confirmed_request(invoke_id, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
            sap.sap_indication(Pdu::outbound(device(), request)).unwrap();
        }
        assert_eq!(sap.client_transaction_count(), 256);
        assert_eq!(
            sap.get_next_invoke_id(&device()),
            Err(ApplicationError::NoInvokeIdAvailable(device()))
        );
        let other = Address::local_station(vec![10, 0, 0, 6, 0xBA, 0xC0]);
        assert!(sap.get_next_invoke_id(&other).is_ok());
    }

    #[test]
    fn test_unmatched_ack_dropped() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        let ack = Apdu::SimpleAck { invoke_id: 77, service_choice: 12 };
        sap.confirmation(Pdu::inbound(device(), ack)).unwrap();
        assert!(sap.drain_events().is_empty());
        assert_eq!(sap.statistics().dropped, 1);
        assert_eq!(sap.statistics().simple_acks, 1);
    }

    #[test]
    fn test_communication_control() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        sap.set_dcc(DeviceCommunicationControl::Disable);

        let read = Apdu::confirmed_request(1, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        sap.confirmation(Pdu::inbound(device(), read.clone())).unwrap();
        assert_eq!(sap.server_transaction_count(), 0);

        let dcc = Apdu::confirmed_request(2, ConfirmedServiceChoice::DeviceCommunicationControl, vec![0x19, 0x00]);
        sap.confirmation(Pdu::inbound(device(), dcc)).unwrap();
        let who_is = Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::WhoIs,
            service_data: Bytes::new(),
        };
        sap.confirmation(Pdu::inbound(device(), who_is)).unwrap();
        assert_eq!(sap.drain_events().len(), 2);

        sap.sap_indication(Pdu::outbound(device(), read.clone())).unwrap();
        assert_eq!(sap.client_transaction_count(), 0);

        sap.set_dcc(DeviceCommunicationControl::DisableInitiation);
        sap.sap_indication(Pdu::outbound(device(), read)).unwrap();
        let i_am = Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::IAm,
            service_data: Bytes::from_static(&[0xC4, 0x02, 0x00, 0x00, 0x05]),
        };
        sap.sap_indication(Pdu::outbound(Address::global_broadcast(), i_am))
            .unwrap();
        let events = sap.drain_events();
        assert_eq!(transmitted(&events).len(), 1);
        assert_eq!(sap.client_transaction_count(), 0);
        assert_eq!(sap.statistics().dropped, 3);
    }

    #[test]
    fn test_client_abort_reaches_server_transaction() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        let request = Apdu::confirmed_request(3, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        sap.confirmation(Pdu::inbound(device(), request)).unwrap();
        sap.drain_events();

        let abort = Apdu::Abort {
            server: false,
            invoke_id: 3,
            abort_reason: AbortReason::Other,
        };
        sap.confirmation(Pdu::inbound(device(), abort.clone())).unwrap();
        assert_eq!(responses(&sap.drain_events()), vec![&abort]);
        assert_eq!(sap.server_transaction_count(), 0);
    }

    #[test]
    fn test_shutdown() {
        let (_clock, mut sap) = access_point(ApplicationConfig::default());
        cache_device(&mut sap, 1476, Segmentation::Both);
        let request = Apdu::confirmed_request(1, ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        sap.sap_indication(Pdu::outbound(device(), request.clone())).unwrap();

        sap.shutdown().unwrap();
        assert!(!sap.is_running());
        assert_eq!(sap.client_transaction_count(), 0);
        assert!(sap.poll_event().is_none());
        assert_eq!(
            sap.sap_indication(Pdu::outbound(device(), request)),
            Err(ApplicationError::Task(TaskError::Shutdown))
        );
        let info = sap
            .device_info_cache()
            .get_device_info(&crate::app::DeviceInfoKey::instance(5))
            .unwrap();
        assert_eq!(info.ref_count(), 0);
    }
}
