//! BACnet Application Layer Module
//!
//! This module implements the transaction half of the BACnet application layer:
//! it turns single, size-limited datagram exchanges into reliable confirmed
//! transactions with segmentation, windowing, retries and aborts.
//!
//! # Overview
//!
//! The application layer handles:
//! - the decoded APDU model shared with the (external) codec
//! - per-device capability records ([`device_info::DeviceInfoCache`])
//! - client and server segmentation state machines ([`client`], [`server`])
//! - the [`sap::StateMachineAccessPoint`] dispatcher owning all live transactions
//! - routing of reassembled requests to service handlers ([`router`])
//! - completing I/O control blocks from transaction results ([`io`])
//!
//! # APDU Types
//!
//! - Confirmed Request PDU
//! - Unconfirmed Request PDU
//! - SimpleACK PDU
//! - ComplexACK PDU
//! - SegmentACK PDU
//! - Error PDU
//! - Reject PDU
//! - Abort PDU
//!
//! Service payloads are opaque [`Bytes`]: the transaction engine slices them
//! into segments and concatenates them again, it never looks inside.
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::app::*;
//! use bacnet_tsm::service::UnconfirmedServiceChoice;
//!
//! let apdu = Apdu::UnconfirmedRequest {
//!     service_choice: UnconfirmedServiceChoice::WhoIs,
//!     service_data: bytes::Bytes::new(),
//! };
//! assert_eq!(apdu.apdu_type(), ApduType::UnconfirmedRequest);
//! ```

use std::fmt;

use bytes::Bytes;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::network::Address;
use crate::service::{AbortReason, ConfirmedServiceChoice, RejectReason, UnconfirmedServiceChoice};
use crate::task::TaskError;

pub mod client;
pub mod config;
pub mod device_info;
pub mod io;
pub mod router;
pub mod sap;
pub mod server;
pub mod ssm;

pub use config::{ApplicationConfig, LocalDeviceConfig};
pub use device_info::{DeviceHandle, DeviceInfo, DeviceInfoCache, DeviceInfoKey};
pub use sap::{DeviceCommunicationControl, SapEvent, StateMachineAccessPoint};
pub use ssm::SsmState;

/// Result type for application layer operations
pub type Result<T> = std::result::Result<T, ApplicationError>;

/// Errors that can occur in application layer operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplicationError {
    /// APDU not acceptable for the operation
    #[error("Invalid APDU: {0}")]
    InvalidApdu(String),
    /// Attempt to leave a terminal transaction state
    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: SsmState, to: SsmState },
    /// Segmentation error
    #[error("Segmentation error: {0}")]
    SegmentationError(String),
    /// Invoke ID already held by a live client transaction
    #[error("Invoke ID {invoke_id} already in use for {address}")]
    InvokeIdInUse { invoke_id: u8, address: Address },
    /// Every invoke ID is held by a live client transaction
    #[error("No available invoke ID for {0}")]
    NoInvokeIdAvailable(Address),
    /// Release of a device info record nobody holds
    #[error("Device info reference count error")]
    ReferenceCount,
    /// Handle does not name a device info record
    #[error("Unknown device info handle")]
    UnknownDevice,
    /// Scheduler refused a timer
    #[error("Scheduler error: {0}")]
    Task(#[from] TaskError),
}

/// APDU types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ApduType {
    ConfirmedRequest = 0,
    UnconfirmedRequest = 1,
    SimpleAck = 2,
    ComplexAck = 3,
    SegmentAck = 4,
    Error = 5,
    Reject = 6,
    Abort = 7,
}

impl fmt::Display for ApduType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Application Protocol Data Unit, already decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Apdu {
    /// Confirmed service request
    ConfirmedRequest {
        segmented: bool,
        more_follows: bool,
        segmented_response_accepted: bool,
        max_segments: MaxSegments,
        max_response_size: MaxApduSize,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: ConfirmedServiceChoice,
        service_data: Bytes,
    },

    /// Unconfirmed service request
    UnconfirmedRequest {
        service_choice: UnconfirmedServiceChoice,
        service_data: Bytes,
    },

    /// Simple acknowledgment
    SimpleAck { invoke_id: u8, service_choice: u8 },

    /// Complex acknowledgment
    ComplexAck {
        segmented: bool,
        more_follows: bool,
        invoke_id: u8,
        sequence_number: Option<u8>,
        proposed_window_size: Option<u8>,
        service_choice: u8,
        service_data: Bytes,
    },

    /// Segment acknowledgment
    SegmentAck {
        negative: bool,
        server: bool,
        invoke_id: u8,
        sequence_number: u8,
        window_size: u8,
    },

    /// Error PDU
    Error {
        invoke_id: u8,
        service_choice: u8,
        error_class: u16,
        error_code: u16,
    },

    /// Reject PDU
    Reject {
        invoke_id: u8,
        reject_reason: RejectReason,
    },

    /// Abort PDU
    Abort {
        server: bool,
        invoke_id: u8,
        abort_reason: AbortReason,
    },
}

impl Apdu {
    /// Unsegmented confirmed request with default header limits
    pub fn confirmed_request(
        invoke_id: u8,
        service_choice: ConfirmedServiceChoice,
        service_data: impl Into<Bytes>,
    ) -> Self {
        Apdu::ConfirmedRequest {
            segmented: false,
            more_follows: false,
            segmented_response_accepted: false,
            max_segments: MaxSegments::Unspecified,
            max_response_size: MaxApduSize::Up1476,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
            service_data: service_data.into(),
        }
    }

    /// Unsegmented complex acknowledgment
    pub fn complex_ack(invoke_id: u8, service_choice: u8, service_data: impl Into<Bytes>) -> Self {
        Apdu::ComplexAck {
            segmented: false,
            more_follows: false,
            invoke_id,
            sequence_number: None,
            proposed_window_size: None,
            service_choice,
            service_data: service_data.into(),
        }
    }

    /// The PDU type of this APDU
    pub fn apdu_type(&self) -> ApduType {
        match self {
            Apdu::ConfirmedRequest { .. } => ApduType::ConfirmedRequest,
            Apdu::UnconfirmedRequest { .. } => ApduType::UnconfirmedRequest,
            Apdu::SimpleAck { .. } => ApduType::SimpleAck,
            Apdu::ComplexAck { .. } => ApduType::ComplexAck,
            Apdu::SegmentAck { .. } => ApduType::SegmentAck,
            Apdu::Error { .. } => ApduType::Error,
            Apdu::Reject { .. } => ApduType::Reject,
            Apdu::Abort { .. } => ApduType::Abort,
        }
    }

    /// Invoke ID, absent only for unconfirmed requests
    pub fn invoke_id(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest { invoke_id, .. }
            | Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck { invoke_id, .. }
            | Apdu::SegmentAck { invoke_id, .. }
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. }
            | Apdu::Abort { invoke_id, .. } => Some(*invoke_id),
            Apdu::UnconfirmedRequest { .. } => None,
        }
    }

    /// True for a segment of a segmented request or complex ack
    pub fn is_segmented(&self) -> bool {
        match self {
            Apdu::ConfirmedRequest { segmented, .. } | Apdu::ComplexAck { segmented, .. } => {
                *segmented
            }
            _ => false,
        }
    }

    /// True if more segments follow this one
    pub fn more_follows(&self) -> bool {
        match self {
            Apdu::ConfirmedRequest { more_follows, .. }
            | Apdu::ComplexAck { more_follows, .. } => *more_follows,
            _ => false,
        }
    }

    /// Segment sequence number, or the acknowledged sequence number of a
    /// segment ack
    pub fn sequence_number(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest {
                sequence_number, ..
            }
            | Apdu::ComplexAck {
                sequence_number, ..
            } => *sequence_number,
            Apdu::SegmentAck {
                sequence_number, ..
            } => Some(*sequence_number),
            _ => None,
        }
    }

    /// Proposed window size of a segment, or actual window size of a segment ack
    pub fn window_size(&self) -> Option<u8> {
        match self {
            Apdu::ConfirmedRequest {
                proposed_window_size,
                ..
            }
            | Apdu::ComplexAck {
                proposed_window_size,
                ..
            } => *proposed_window_size,
            Apdu::SegmentAck { window_size, .. } => Some(*window_size),
            _ => None,
        }
    }

    /// Service payload of requests and complex acks
    pub fn service_data(&self) -> Option<&Bytes> {
        match self {
            Apdu::ConfirmedRequest { service_data, .. }
            | Apdu::UnconfirmedRequest { service_data, .. }
            | Apdu::ComplexAck { service_data, .. } => Some(service_data),
            _ => None,
        }
    }
}

/// An APDU together with its addressing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    /// Station the APDU came from
    pub source: Option<Address>,
    /// Station the APDU is going to
    pub destination: Option<Address>,
    /// The APDU itself
    pub apdu: Apdu,
}

impl Pdu {
    /// Unaddressed PDU
    pub fn new(apdu: Apdu) -> Self {
        Self {
            source: None,
            destination: None,
            apdu,
        }
    }

    /// PDU received from `source`
    pub fn inbound(source: Address, apdu: Apdu) -> Self {
        Self {
            source: Some(source),
            destination: None,
            apdu,
        }
    }

    /// PDU to be sent to `destination`
    pub fn outbound(destination: Address, apdu: Apdu) -> Self {
        Self {
            source: None,
            destination: Some(destination),
            apdu,
        }
    }
}

/// Maximum segments that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MaxSegments {
    Unspecified = 0,
    Two = 1,
    Four = 2,
    Eight = 3,
    Sixteen = 4,
    ThirtyTwo = 5,
    SixtyFour = 6,
    GreaterThan64 = 7,
}

impl MaxSegments {
    /// Decode the 3-bit header field
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => MaxSegments::Two,
            2 => MaxSegments::Four,
            3 => MaxSegments::Eight,
            4 => MaxSegments::Sixteen,
            5 => MaxSegments::ThirtyTwo,
            6 => MaxSegments::SixtyFour,
            7 => MaxSegments::GreaterThan64,
            _ => MaxSegments::Unspecified,
        }
    }

    /// Segment limit, `None` when unspecified or more than 64
    pub fn count(&self) -> Option<u8> {
        match self {
            MaxSegments::Unspecified | MaxSegments::GreaterThan64 => None,
            MaxSegments::Two => Some(2),
            MaxSegments::Four => Some(4),
            MaxSegments::Eight => Some(8),
            MaxSegments::Sixteen => Some(16),
            MaxSegments::ThirtyTwo => Some(32),
            MaxSegments::SixtyFour => Some(64),
        }
    }

    /// Smallest encoding that admits `count` segments
    pub fn from_count(count: Option<u8>) -> Self {
        match count {
            None => MaxSegments::Unspecified,
            Some(0..=2) => MaxSegments::Two,
            Some(3..=4) => MaxSegments::Four,
            Some(5..=8) => MaxSegments::Eight,
            Some(9..=16) => MaxSegments::Sixteen,
            Some(17..=32) => MaxSegments::ThirtyTwo,
            Some(33..=64) => MaxSegments::SixtyFour,
            Some(_) => MaxSegments::GreaterThan64,
        }
    }
}

/// Maximum APDU size that can be accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MaxApduSize {
    Up50 = 0,
    Up128 = 1,
    Up206 = 2,
    Up480 = 3,
    Up1024 = 4,
    Up1476 = 5,
}

impl MaxApduSize {
    /// Get the actual size in bytes
    pub fn size(&self) -> usize {
        match self {
            MaxApduSize::Up50 => 50,
            MaxApduSize::Up128 => 128,
            MaxApduSize::Up206 => 206,
            MaxApduSize::Up480 => 480,
            MaxApduSize::Up1024 => 1024,
            MaxApduSize::Up1476 => 1476,
        }
    }

    /// Decode the 4-bit header field; unknown codes fall back to the minimum
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x0F {
            1 => MaxApduSize::Up128,
            2 => MaxApduSize::Up206,
            3 => MaxApduSize::Up480,
            4 => MaxApduSize::Up1024,
            5 => MaxApduSize::Up1476,
            _ => MaxApduSize::Up50,
        }
    }

    /// Largest encoding not exceeding `size` bytes
    pub fn from_size(size: usize) -> Self {
        match size {
            s if s >= 1476 => MaxApduSize::Up1476,
            s if s >= 1024 => MaxApduSize::Up1024,
            s if s >= 480 => MaxApduSize::Up480,
            s if s >= 206 => MaxApduSize::Up206,
            s if s >= 128 => MaxApduSize::Up128,
            _ => MaxApduSize::Up50,
        }
    }
}

/// Segmentation support enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[repr(u32)]
pub enum Segmentation {
    Both = 0,
    Transmit = 1,
    Receive = 2,
    NoSegmentation = 3,
}

impl Segmentation {
    /// True if segmented messages may be sent
    pub fn can_transmit(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Transmit)
    }

    /// True if segmented messages may be received
    pub fn can_receive(&self) -> bool {
        matches!(self, Segmentation::Both | Segmentation::Receive)
    }
}

impl TryFrom<u32> for Segmentation {
    type Error = ApplicationError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Self::Both),
            1 => Ok(Self::Transmit),
            2 => Ok(Self::Receive),
            3 => Ok(Self::NoSegmentation),
            _ => Err(ApplicationError::InvalidApdu(format!(
                "Unknown segmentation: {}",
                value
            ))),
        }
    }
}

impl fmt::Display for Segmentation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Both => write!(f, "Both"),
            Self::Transmit => write!(f, "Transmit"),
            Self::Receive => write!(f, "Receive"),
            Self::NoSegmentation => write!(f, "None"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_max_apdu_size() {
        assert_eq!(MaxApduSize::Up50.size(), 50);
        assert_eq!(MaxApduSize::Up128.size(), 128);
        assert_eq!(MaxApduSize::Up1476.size(), 1476);
        assert_eq!(MaxApduSize::from_size(1500), MaxApduSize::Up1476);
        assert_eq!(MaxApduSize::from_size(1000), MaxApduSize::Up480);
        assert_eq!(MaxApduSize::from_size(10), MaxApduSize::Up50);
        assert_eq!(MaxApduSize::from_bits(0x0F), MaxApduSize::Up50);
    }

    #[test]
    fn test_max_segments() {
        assert_eq!(MaxSegments::Unspecified.count(), None);
        assert_eq!(MaxSegments::GreaterThan64.count(), None);
        assert_eq!(MaxSegments::Eight.count(), Some(8));
        assert_eq!(MaxSegments::from_count(Some(8)), MaxSegments::Eight);
        assert_eq!(MaxSegments::from_count(Some(9)), MaxSegments::Sixteen);
        assert_eq!(MaxSegments::from_count(Some(100)), MaxSegments::GreaterThan64);
        assert_eq!(MaxSegments::from_count(None), MaxSegments::Unspecified);
        for bits in 0..8 {
            assert_eq!(MaxSegments::from_bits(bits) as u8, bits);
        }
    }

    #[test]
    fn test_segmentation_capabilities() {
        assert!(Segmentation::Both.can_transmit());
        assert!(Segmentation::Both.can_receive());
        assert!(Segmentation::Transmit.can_transmit());
        assert!(!Segmentation::Transmit.can_receive());
        assert!(!Segmentation::Receive.can_transmit());
        assert!(!Segmentation::NoSegmentation.can_receive());
        assert_eq!(Segmentation::try_from(2).unwrap(), Segmentation::Receive);
        assert!(Segmentation::try_from(4).is_err());
    }

    #[test]
    fn test_apdu_accessors() {
        let request = Apdu::confirmed_request(
            9,
            ConfirmedServiceChoice::ReadProperty,
            vec![0x0C, 0x02, 0x00, 0x00, 0x08],
        );
        assert_eq!(request.apdu_type(), ApduType::ConfirmedRequest);
        assert_eq!(request.invoke_id(), Some(9));
        assert!(!request.is_segmented());
        assert_eq!(request.service_data().map(|d| d.len()), Some(5));

        let ack = Apdu::SegmentAck {
            negative: false,
            server: true,
            invoke_id: 9,
            sequence_number: 3,
            window_size: 4,
        };
        assert_eq!(ack.sequence_number(), Some(3));
        assert_eq!(ack.window_size(), Some(4));
        assert_eq!(ack.service_data(), None);

        let who_is = Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::WhoIs,
            service_data: Bytes::new(),
        };
        assert_eq!(who_is.invoke_id(), None);
    }
}
