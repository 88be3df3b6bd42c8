use crate::device::base::{DeviceCandidate, EndpointRef, UsbBus, UsbDeviceHandle};
use log::debug;
use rusb::{Device, DeviceDescriptor, DeviceHandle, GlobalContext, TransferType};
use std::time::Duration;

/// The real bus, driven through libusb's global context.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibUsbBus;

impl LibUsbBus {
    fn find_device(
        candidate: &DeviceCandidate,
    ) -> rusb::Result<(Device<GlobalContext>, DeviceDescriptor)> {
        for usb_device in rusb::devices()?.iter() {
            if usb_device.bus_number() == candidate.bus_number
                && usb_device.address() == candidate.address
            {
                let descriptor = usb_device.device_descriptor()?;
                return Ok((usb_device, descriptor));
            }
        }
        Err(rusb::Error::NoDevice)
    }
}

impl UsbBus for LibUsbBus {
    type Handle = LibUsbHandle;

    fn devices(&self) -> rusb::Result<Vec<DeviceCandidate>> {
        let mut found_devices = Vec::new();

        for device in rusb::devices()?.iter() {
            match device.device_descriptor() {
                Ok(descriptor) => found_devices.push(DeviceCandidate {
                    bus_number: device.bus_number(),
                    address: device.address(),
                    vendor_id: descriptor.vendor_id(),
                    product_id: descriptor.product_id(),
                }),
                Err(e) => debug!("Skipping {:?}, unable to read descriptor: {}", device, e),
            }
        }

        Ok(found_devices)
    }

    fn serial_number(&self, candidate: &DeviceCandidate) -> rusb::Result<String> {
        let (device, descriptor) = LibUsbBus::find_device(candidate)?;
        let handle = device.open()?;
        handle.read_serial_number_string_ascii(&descriptor)
    }

    fn open(&self, candidate: &DeviceCandidate) -> rusb::Result<LibUsbHandle> {
        let (device, _) = LibUsbBus::find_device(candidate)?;
        let handle = device.open()?;
        debug!("Opened device at {:?}", device);

        Ok(LibUsbHandle { handle, device })
    }
}

pub struct LibUsbHandle {
    handle: DeviceHandle<GlobalContext>,
    device: Device<GlobalContext>,
}

impl UsbDeviceHandle for LibUsbHandle {
    fn kernel_driver_active(&self, interface: u8) -> rusb::Result<bool> {
        self.handle.kernel_driver_active(interface)
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.detach_kernel_driver(interface)
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.claim_interface(interface)
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.handle.release_interface(interface)
    }

    fn interface_endpoints(&self, interface: u8) -> rusb::Result<Vec<EndpointRef>> {
        let config = self.device.active_config_descriptor()?;
        let descriptor = config
            .interfaces()
            .find(|i| i.number() == interface)
            .and_then(|i| i.descriptors().next())
            .ok_or(rusb::Error::NotFound)?;

        Ok(descriptor
            .endpoint_descriptors()
            .map(|endpoint| EndpointRef {
                address: endpoint.address(),
                direction: endpoint.direction(),
                transfer_type: endpoint.transfer_type(),
            })
            .collect())
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, buf, timeout)
    }

    fn read_endpoint(
        &self,
        endpoint: EndpointRef,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        match endpoint.transfer_type {
            TransferType::Bulk => self.handle.read_bulk(endpoint.address, buf, timeout),
            TransferType::Interrupt => self.handle.read_interrupt(endpoint.address, buf, timeout),
            _ => Err(rusb::Error::NotSupported),
        }
    }

    fn write_endpoint(
        &self,
        endpoint: EndpointRef,
        buf: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        match endpoint.transfer_type {
            TransferType::Bulk => self.handle.write_bulk(endpoint.address, buf, timeout),
            TransferType::Interrupt => self.handle.write_interrupt(endpoint.address, buf, timeout),
            _ => Err(rusb::Error::NotSupported),
        }
    }

    fn clear_halt(&self, endpoint: EndpointRef) -> rusb::Result<()> {
        self.handle.clear_halt(endpoint.address)
    }
}
