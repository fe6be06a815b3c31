#![doc = include_str!("../README.md")]

pub mod app;
pub mod iocb;
pub mod network;
pub mod service;
pub mod task;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use app::{
    Apdu, ApplicationConfig, ApplicationError, DeviceCommunicationControl, DeviceInfoCache, Pdu,
    SapEvent, StateMachineAccessPoint,
};
pub use iocb::{Iocb, IocbError, IocbState, SieveQueue};
pub use network::Address;
pub use service::{AbortReason, ConfirmedServiceChoice, RejectReason, UnconfirmedServiceChoice};

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_MAX_APDU: usize = 1476;
