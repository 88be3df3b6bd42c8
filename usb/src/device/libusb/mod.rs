pub mod device;

pub use device::{LibUsbBus, LibUsbHandle};
