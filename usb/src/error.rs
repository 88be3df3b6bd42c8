use std::fmt::{Display, Formatter};

#[derive(thiserror::Error, Debug)]
pub enum ConnectError {
    #[error("No panda device was found (vendor {vendor_id:#06x}, product {product_id:#06x})")]
    DeviceNotFound { vendor_id: u16, product_id: u16 },

    #[error("Unable to open the panda: {0}")]
    OpenFailed(#[source] rusb::Error),

    #[error("Unable to claim interface {interface}: {source}")]
    ClaimFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Unexpected endpoint layout on interface {interface}: {reason}")]
    EndpointLayout { interface: u8, reason: String },

    #[error("Unable to release interface {interface}: {source}")]
    ReleaseFailed {
        interface: u8,
        #[source]
        source: rusb::Error,
    },

    #[error("Unable to release interface {interface}, the device handle is still in use")]
    HandleShared { interface: u8 },

    #[error("Invalid session options: {0}")]
    InvalidOptions(String),

    #[error("USB error: {0}")]
    Usb(#[from] rusb::Error),
}

/// Which transfer failed, so errors can name it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Control { request: u8, value: u16, index: u16 },
    EndpointRead { endpoint: u8 },
    EndpointWrite { endpoint: u8 },
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Control {
                request,
                value,
                index,
            } => write!(
                f,
                "control request {:#04x} (value {:#x}, index {:#x})",
                request, value, index
            ),
            Operation::EndpointRead { endpoint } => write!(f, "read from endpoint {:#04x}", endpoint),
            Operation::EndpointWrite { endpoint } => write!(f, "write to endpoint {:#04x}", endpoint),
        }
    }
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransferFailure {
    #[error("the device stalled the request")]
    Stall,

    #[error("timed out waiting for the device")]
    Timeout,

    #[error("the device has been disconnected")]
    DeviceDisconnected,

    #[error("USB error: {0}")]
    Usb(rusb::Error),
}

impl From<rusb::Error> for TransferFailure {
    fn from(error: rusb::Error) -> Self {
        match error {
            rusb::Error::Pipe => TransferFailure::Stall,
            rusb::Error::Timeout => TransferFailure::Timeout,
            rusb::Error::NoDevice => TransferFailure::DeviceDisconnected,
            other => TransferFailure::Usb(other),
        }
    }
}

#[derive(thiserror::Error, Debug, Copy, Clone, PartialEq, Eq)]
#[error("{operation} failed: {reason}")]
pub struct TransferError {
    pub operation: Operation,
    pub reason: TransferFailure,
}

impl TransferError {
    pub(crate) fn new(operation: Operation, error: rusb::Error) -> Self {
        Self {
            operation,
            reason: error.into(),
        }
    }

    pub fn is_stall(&self) -> bool {
        self.reason == TransferFailure::Stall
    }

    pub fn is_timeout(&self) -> bool {
        self.reason == TransferFailure::Timeout
    }

    pub fn is_disconnect(&self) -> bool {
        self.reason == TransferFailure::DeviceDisconnected
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{what} response too short, expected at least {expected} bytes, received {actual}")]
    TooShort {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("CAN payload of {len} bytes exceeds the 8 byte maximum")]
    PayloadTooLong { len: usize },

    #[error("CAN address {address:#x} doesn't fit in 29 bits")]
    AddressOutOfRange { address: u32 },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),
}

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Telemetry is already streaming")]
    AlreadyRunning,

    #[error("Invalid stream configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("Unable to spawn the telemetry worker: {0}")]
    Spawn(#[from] std::io::Error),
}
