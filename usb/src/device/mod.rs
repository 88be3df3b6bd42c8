pub mod base;
pub mod libusb;

#[cfg(test)]
pub(crate) mod mock;

pub use base::{DeviceCandidate, EndpointRef, UsbBus, UsbDeviceHandle};
