use rusb::{Direction, TransferType};
use std::time::Duration;

// We primarily need the bus number, and address for comparison..
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCandidate {
    pub(crate) bus_number: u8,
    pub(crate) address: u8,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
}

impl DeviceCandidate {
    pub fn new(bus_number: u8, address: u8, vendor_id: u16, product_id: u16) -> Self {
        Self {
            bus_number,
            address,
            vendor_id,
            product_id,
        }
    }

    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }
    pub fn address(&self) -> u8 {
        self.address
    }
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }
    pub fn product_id(&self) -> u16 {
        self.product_id
    }
}

/// One endpoint of the claimed interface, resolved once after claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRef {
    pub(crate) address: u8,
    pub(crate) direction: Direction,
    pub(crate) transfer_type: TransferType,
}

impl EndpointRef {
    pub fn new(address: u8, direction: Direction, transfer_type: TransferType) -> Self {
        Self {
            address,
            direction,
            transfer_type,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }
    pub fn direction(&self) -> Direction {
        self.direction
    }
    pub fn transfer_type(&self) -> TransferType {
        self.transfer_type
    }
}

// The capabilities we need from whatever is driving the USB bus. The libusb backend is the real
// one, tests script their own.
pub trait UsbBus {
    type Handle: UsbDeviceHandle;

    fn devices(&self) -> rusb::Result<Vec<DeviceCandidate>>;
    fn serial_number(&self, candidate: &DeviceCandidate) -> rusb::Result<String>;
    fn open(&self, candidate: &DeviceCandidate) -> rusb::Result<Self::Handle>;
}

/// An opened device. Dropping the handle closes it.
pub trait UsbDeviceHandle: Send + Sync + 'static {
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool>;
    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()>;
    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn release_interface(&mut self, interface: u8) -> rusb::Result<()>;
    fn interface_endpoints(&self, interface: u8) -> rusb::Result<Vec<EndpointRef>>;

    #[allow(clippy::too_many_arguments)]
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    #[allow(clippy::too_many_arguments)]
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn read_endpoint(
        &self,
        endpoint: EndpointRef,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    fn write_endpoint(
        &self,
        endpoint: EndpointRef,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Clears a halt (stall) condition on an endpoint.
    fn clear_halt(&self, endpoint: EndpointRef) -> rusb::Result<()>;

    /// Whether the backend correlates concurrent control transfers itself. When it doesn't,
    /// the session serialises them.
    fn concurrent_control(&self) -> bool {
        false
    }
}
