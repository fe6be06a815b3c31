//! BACnet Service Enumerations
//!
//! The transaction engine does not encode or execute services, but it has to
//! recognise a few of them and it produces and consumes the standard reason
//! codes carried by Abort and Reject PDUs.
//!
//! # Contents
//!
//! - [`ConfirmedServiceChoice`] / [`UnconfirmedServiceChoice`]: the service
//!   selectors carried in request PDUs. Device-communication-control gating in
//!   the access point looks at DeviceCommunicationControl, ReinitializeDevice,
//!   Who-Is and I-Am.
//! - [`AbortReason`]: standard abort reasons plus the two proprietary values the
//!   transaction engine emits itself ([`AbortReason::ServerTimeout`] = 64 and
//!   [`AbortReason::NoResponse`] = 65).
//! - [`RejectReason`]
//! - [`IAmRequest`]: the already-decoded I-Am payload used to populate the
//!   device information cache.
//!
//! # Example
//!
//! ```
//! use bacnet_tsm::service::{AbortReason, ConfirmedServiceChoice};
//!
//! assert_eq!(u8::from(AbortReason::NoResponse), 65);
//! assert_eq!(AbortReason::from(4u8), AbortReason::SegmentationNotSupported);
//! assert_eq!(
//!     ConfirmedServiceChoice::try_from(12u8).unwrap(),
//!     ConfirmedServiceChoice::ReadProperty
//! );
//! ```

use thiserror::Error;

use crate::app::Segmentation;
use crate::generate_custom_enum;

/// Result type for service operations
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors that can occur when interpreting service selectors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// Unsupported service choice
    #[error("Unsupported service choice: {0}")]
    UnsupportedServiceChoice(u8),
}

/// Confirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConfirmedServiceChoice {
    // Alarm and Event Services
    AcknowledgeAlarm = 0,
    ConfirmedCOVNotification = 1,
    ConfirmedEventNotification = 2,
    GetAlarmSummary = 3,
    GetEnrollmentSummary = 4,
    SubscribeCOV = 5,
    GetEventInformation = 29,

    // File Access Services
    AtomicReadFile = 6,
    AtomicWriteFile = 7,

    // Object Access Services
    AddListElement = 8,
    RemoveListElement = 9,
    CreateObject = 10,
    DeleteObject = 11,
    ReadProperty = 12,
    ReadPropertyMultiple = 14,
    WriteProperty = 15,
    WritePropertyMultiple = 16,
    ReadRange = 26,
    SubscribeCOVProperty = 28,

    // Remote Device Management Services
    DeviceCommunicationControl = 17,
    ConfirmedPrivateTransfer = 18,
    ConfirmedTextMessage = 19,
    ReinitializeDevice = 20,
}

impl TryFrom<u8> for ConfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::AcknowledgeAlarm),
            1 => Ok(Self::ConfirmedCOVNotification),
            2 => Ok(Self::ConfirmedEventNotification),
            3 => Ok(Self::GetAlarmSummary),
            4 => Ok(Self::GetEnrollmentSummary),
            5 => Ok(Self::SubscribeCOV),
            6 => Ok(Self::AtomicReadFile),
            7 => Ok(Self::AtomicWriteFile),
            8 => Ok(Self::AddListElement),
            9 => Ok(Self::RemoveListElement),
            10 => Ok(Self::CreateObject),
            11 => Ok(Self::DeleteObject),
            12 => Ok(Self::ReadProperty),
            14 => Ok(Self::ReadPropertyMultiple),
            15 => Ok(Self::WriteProperty),
            16 => Ok(Self::WritePropertyMultiple),
            17 => Ok(Self::DeviceCommunicationControl),
            18 => Ok(Self::ConfirmedPrivateTransfer),
            19 => Ok(Self::ConfirmedTextMessage),
            20 => Ok(Self::ReinitializeDevice),
            26 => Ok(Self::ReadRange),
            28 => Ok(Self::SubscribeCOVProperty),
            29 => Ok(Self::GetEventInformation),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

/// Unconfirmed service choices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum UnconfirmedServiceChoice {
    IAm = 0,
    IHave = 1,
    UnconfirmedCOVNotification = 2,
    UnconfirmedEventNotification = 3,
    UnconfirmedPrivateTransfer = 4,
    UnconfirmedTextMessage = 5,
    TimeSynchronization = 6,
    WhoHas = 7,
    WhoIs = 8,
    UtcTimeSynchronization = 9,
    WriteGroup = 10,
}

impl TryFrom<u8> for UnconfirmedServiceChoice {
    type Error = ServiceError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::IAm),
            1 => Ok(Self::IHave),
            2 => Ok(Self::UnconfirmedCOVNotification),
            3 => Ok(Self::UnconfirmedEventNotification),
            4 => Ok(Self::UnconfirmedPrivateTransfer),
            5 => Ok(Self::UnconfirmedTextMessage),
            6 => Ok(Self::TimeSynchronization),
            7 => Ok(Self::WhoHas),
            8 => Ok(Self::WhoIs),
            9 => Ok(Self::UtcTimeSynchronization),
            10 => Ok(Self::WriteGroup),
            _ => Err(ServiceError::UnsupportedServiceChoice(value)),
        }
    }
}

generate_custom_enum! {
    /// Reject reason codes
    RejectReason {
        Other = 0,
        BufferOverflow = 1,
        InconsistentParameters = 2,
        InvalidParameterDataType = 3,
        InvalidTag = 4,
        MissingRequiredParameter = 5,
        ParameterOutOfRange = 6,
        TooManyArguments = 7,
        UndefinedEnumeration = 8,
        UnrecognizedService = 9,
    },
    u8,
    64..=255
}

generate_custom_enum! {
    /// Abort reason codes
    ///
    /// 64 and 65 sit in the proprietary range. They are what the transaction
    /// engine reports when the local application or the remote device never
    /// answered, and deployed peers expect exactly these values.
    AbortReason {
        Other = 0,
        BufferOverflow = 1,
        InvalidApduInThisState = 2,
        PreemptedByHigherPriorityTask = 3,
        SegmentationNotSupported = 4,
        SecurityError = 5,
        InsufficientSecurity = 6,
        WindowSizeOutOfRange = 7,
        ApplicationExceededReplyTime = 8,
        OutOfResources = 9,
        TsmTimeout = 10,
        ApduTooLong = 11,
        /// The local application did not answer a confirmed request in time
        ServerTimeout = 64,
        /// The remote device did not answer within the retry budget
        NoResponse = 65,
    },
    u8,
    64..=255
}

/// Decoded I-Am announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IAmRequest {
    /// Device object instance number
    pub device_instance: u32,
    /// Maximum APDU length accepted
    pub max_apdu_length_accepted: u16,
    /// Segmentation supported
    pub segmentation_supported: Segmentation,
    /// Vendor identifier
    pub vendor_identifier: u16,
}

impl IAmRequest {
    /// Create a new I-Am payload
    pub fn new(
        device_instance: u32,
        max_apdu_length_accepted: u16,
        segmentation_supported: Segmentation,
        vendor_identifier: u16,
    ) -> Self {
        Self {
            device_instance,
            max_apdu_length_accepted,
            segmentation_supported,
            vendor_identifier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmed_service_choice() {
        assert_eq!(
            ConfirmedServiceChoice::try_from(17).unwrap(),
            ConfirmedServiceChoice::DeviceCommunicationControl
        );
        assert_eq!(ConfirmedServiceChoice::ReinitializeDevice as u8, 20);
        assert_eq!(
            ConfirmedServiceChoice::try_from(13),
            Err(ServiceError::UnsupportedServiceChoice(13))
        );
    }

    #[test]
    fn test_unconfirmed_service_choice() {
        assert_eq!(
            UnconfirmedServiceChoice::try_from(8).unwrap(),
            UnconfirmedServiceChoice::WhoIs
        );
        assert!(UnconfirmedServiceChoice::try_from(200).is_err());
    }

    #[test]
    fn test_proprietary_abort_reasons() {
        assert_eq!(u8::from(AbortReason::ServerTimeout), 64);
        assert_eq!(AbortReason::from(65u8), AbortReason::NoResponse);
        assert!(AbortReason::NoResponse.is_custom());
        assert!(AbortReason::ApduTooLong.is_standard());
        assert_eq!(AbortReason::from(11u8), AbortReason::ApduTooLong);

        let vendor = AbortReason::from(200u8);
        assert!(matches!(vendor, AbortReason::Custom(v) if v.value() == 200));
        let reserved = AbortReason::from(40u8);
        assert!(matches!(reserved, AbortReason::Reserved(_)));
        assert_eq!(reserved.to_string(), "Reserved(40)");
    }

    #[test]
    fn test_reject_reason_round_trip() {
        for raw in 0u8..=255 {
            assert_eq!(u8::from(RejectReason::from(raw)), raw);
        }
    }
}
