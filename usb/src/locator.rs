use crate::device::{DeviceCandidate, EndpointRef, UsbBus, UsbDeviceHandle};
use crate::error::ConnectError;
use log::{debug, info, warn};
use rusb::Direction;

/// The panda only ever exposes its vendor interface as interface 0.
pub const PANDA_INTERFACE: u8 = 0;

/// The endpoints of a claimed interface, in descriptor order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub inbound: EndpointRef,
    pub outbound: [EndpointRef; 2],
}

impl Endpoints {
    /// The outbound endpoint which carries CAN messages to the device.
    pub fn can_out(&self) -> EndpointRef {
        self.outbound[1]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimedInterface {
    pub number: u8,
    pub endpoints: Endpoints,
}

/// A matching device, and its serial number if we were able to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedDevice {
    pub candidate: DeviceCandidate,
    pub serial: Option<String>,
}

fn matching<B: UsbBus>(
    bus: &B,
    vendor_id: u16,
    product_id: u16,
) -> Result<Vec<DeviceCandidate>, ConnectError> {
    Ok(bus
        .devices()?
        .into_iter()
        .filter(|d| d.vendor_id == vendor_id && d.product_id == product_id)
        .collect())
}

/// Finds the first enumerated device with this vendor / product pair. Nothing is opened.
pub fn locate<B: UsbBus>(
    bus: &B,
    vendor_id: u16,
    product_id: u16,
) -> Result<DeviceCandidate, ConnectError> {
    let mut found = matching(bus, vendor_id, product_id)?;
    if found.len() > 1 {
        warn!(
            "{} devices match {:04x}:{:04x}, using the first (bus {}, address {})",
            found.len(),
            vendor_id,
            product_id,
            found[0].bus_number,
            found[0].address
        );
    }

    if found.is_empty() {
        return Err(ConnectError::DeviceNotFound {
            vendor_id,
            product_id,
        });
    }
    Ok(found.swap_remove(0))
}

/// Like [`locate`], but picks the device reporting this USB serial number.
pub fn locate_serial<B: UsbBus>(
    bus: &B,
    vendor_id: u16,
    product_id: u16,
    serial: &str,
) -> Result<DeviceCandidate, ConnectError> {
    for candidate in matching(bus, vendor_id, product_id)? {
        match bus.serial_number(&candidate) {
            Ok(found) if found == serial => return Ok(candidate),
            Ok(found) => debug!("Skipping device with serial {}", found),
            Err(e) => debug!(
                "Unable to read serial of device at {}:{}: {}",
                candidate.bus_number, candidate.address, e
            ),
        }
    }

    Err(ConnectError::DeviceNotFound {
        vendor_id,
        product_id,
    })
}

pub fn list<B: UsbBus>(
    bus: &B,
    vendor_id: u16,
    product_id: u16,
) -> Result<Vec<ListedDevice>, ConnectError> {
    Ok(matching(bus, vendor_id, product_id)?
        .into_iter()
        .map(|candidate| {
            let serial = bus.serial_number(&candidate).ok();
            ListedDevice { candidate, serial }
        })
        .collect())
}

pub fn open<B: UsbBus>(bus: &B, candidate: &DeviceCandidate) -> Result<B::Handle, ConnectError> {
    let handle = bus.open(candidate).map_err(ConnectError::OpenFailed)?;
    info!(
        "Opened panda at bus {}, address {}",
        candidate.bus_number, candidate.address
    );
    Ok(handle)
}

/// Claims the interface, detaching any kernel driver first, and resolves its endpoints.
pub fn claim_interface<H: UsbDeviceHandle>(
    handle: &mut H,
    interface: u8,
) -> Result<ClaimedInterface, ConnectError> {
    let claim_failed = |source| ConnectError::ClaimFailed { interface, source };

    match handle.kernel_driver_active(interface) {
        Ok(true) => {
            debug!("Detaching kernel driver from interface {}", interface);
            handle.detach_kernel_driver(interface).map_err(claim_failed)?;
        }
        Ok(false) => debug!("No kernel driver active on interface {}", interface),
        Err(rusb::Error::NotSupported) => {
            debug!("Kernel driver state can't be queried on this platform")
        }
        Err(e) => return Err(claim_failed(e)),
    }

    handle.claim_interface(interface).map_err(claim_failed)?;
    debug!("Claimed interface {}", interface);

    let endpoints = handle
        .interface_endpoints(interface)
        .map_err(|e| e.to_string())
        .and_then(|found| resolve_endpoints(&found));

    match endpoints {
        Ok(endpoints) => Ok(ClaimedInterface {
            number: interface,
            endpoints,
        }),
        Err(reason) => {
            // Don't leave the interface claimed behind a failed setup.
            if let Err(e) = handle.release_interface(interface) {
                warn!("Unable to release interface {}: {}", interface, e);
            }
            Err(ConnectError::EndpointLayout { interface, reason })
        }
    }
}

fn resolve_endpoints(found: &[EndpointRef]) -> Result<Endpoints, String> {
    if found.len() < 3 {
        return Err(format!("expected 3 endpoints, found {}", found.len()));
    }
    if found[0].direction != Direction::In {
        return Err(format!("endpoint {:#04x} is not inbound", found[0].address));
    }
    for endpoint in &found[1..3] {
        if endpoint.direction != Direction::Out {
            return Err(format!("endpoint {:#04x} is not outbound", endpoint.address));
        }
    }

    Ok(Endpoints {
        inbound: found[0],
        outbound: [found[1], found[2]],
    })
}
