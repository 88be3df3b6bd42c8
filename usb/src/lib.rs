pub use rusb;

pub mod channel;
pub mod decode;
pub mod device;
pub mod error;
pub mod locator;
pub mod requests;
pub mod session;
pub mod stream;

pub use channel::{ControlChannel, RawResponse};
pub use device::libusb::LibUsbBus;
pub use error::{ConnectError, DecodeError, QueryError, StreamError, TransferError, TransferFailure};
pub use session::{DeviceSession, SessionOptions};
pub use stream::{StreamConfig, StreamEvent, StreamHandle, TelemetryFrame};
