// A scripted stand-in for the USB bus, so the protocol layer can be exercised without hardware.
use crate::device::base::{DeviceCandidate, EndpointRef, UsbBus, UsbDeviceHandle};
use rusb::{Direction, TransferType};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub opened: usize,
    pub events: Vec<String>,
    pub control_calls: Vec<(u8, u8, u16, u16)>,
    pub written: Vec<(u8, Vec<u8>)>,
}

#[derive(Clone)]
pub(crate) struct MockDevice {
    pub candidate: DeviceCandidate,
    pub serial: Option<String>,
    pub responses: HashMap<(u8, u16), Result<Vec<u8>, rusb::Error>>,
    pub endpoints: Vec<EndpointRef>,
    pub kernel_driver: rusb::Result<bool>,
    pub open_error: Option<rusb::Error>,
    pub claim_error: Option<rusb::Error>,
    pub concurrent: bool,
    pub inbound_halted: bool,
    pub inbound: Arc<Mutex<VecDeque<rusb::Result<Vec<u8>>>>>,
    pub state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    pub fn panda(bus_number: u8, address: u8) -> Self {
        Self {
            candidate: DeviceCandidate::new(
                bus_number,
                address,
                panda_types::VID_PANDA,
                panda_types::PID_PANDA,
            ),
            serial: None,
            responses: HashMap::new(),
            endpoints: vec![
                EndpointRef::new(0x81, Direction::In, TransferType::Bulk),
                EndpointRef::new(0x02, Direction::Out, TransferType::Bulk),
                EndpointRef::new(0x03, Direction::Out, TransferType::Bulk),
            ],
            kernel_driver: Ok(false),
            open_error: None,
            claim_error: None,
            concurrent: false,
            inbound_halted: false,
            inbound: Arc::new(Mutex::new(VecDeque::new())),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    pub fn with_serial(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn respond(mut self, request: u8, value: u16, response: rusb::Result<Vec<u8>>) -> Self {
        self.responses.insert((request, value), response);
        self
    }

    pub fn queue_inbound(&self, chunk: rusb::Result<Vec<u8>>) {
        self.inbound.lock().unwrap().push_back(chunk);
    }

    pub fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.lock().unwrap().opened
    }

    fn record(&self, event: String) {
        self.state.lock().unwrap().events.push(event);
    }
}

pub(crate) struct MockBus {
    pub devices: Vec<MockDevice>,
}

impl MockBus {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self { devices }
    }

    fn find(&self, candidate: &DeviceCandidate) -> rusb::Result<&MockDevice> {
        self.devices
            .iter()
            .find(|d| &d.candidate == candidate)
            .ok_or(rusb::Error::NoDevice)
    }
}

impl UsbBus for MockBus {
    type Handle = MockHandle;

    fn devices(&self) -> rusb::Result<Vec<DeviceCandidate>> {
        Ok(self.devices.iter().map(|d| d.candidate.clone()).collect())
    }

    fn serial_number(&self, candidate: &DeviceCandidate) -> rusb::Result<String> {
        self.find(candidate)?.serial.clone().ok_or(rusb::Error::Access)
    }

    fn open(&self, candidate: &DeviceCandidate) -> rusb::Result<MockHandle> {
        let device = self.find(candidate)?;
        if let Some(error) = device.open_error {
            return Err(error);
        }
        device.state.lock().unwrap().opened += 1;
        device.record("open".to_string());
        Ok(MockHandle {
            device: device.clone(),
        })
    }
}

pub(crate) struct MockHandle {
    device: MockDevice,
}

impl Drop for MockHandle {
    fn drop(&mut self) {
        self.device.record("close".to_string());
    }
}

impl UsbDeviceHandle for MockHandle {
    fn kernel_driver_active(&self, _interface: u8) -> rusb::Result<bool> {
        self.device.kernel_driver
    }

    fn detach_kernel_driver(&mut self, interface: u8) -> rusb::Result<()> {
        self.device.record(format!("detach {}", interface));
        Ok(())
    }

    fn claim_interface(&mut self, interface: u8) -> rusb::Result<()> {
        if let Some(error) = self.device.claim_error {
            return Err(error);
        }
        self.device.record(format!("claim {}", interface));
        Ok(())
    }

    fn release_interface(&mut self, interface: u8) -> rusb::Result<()> {
        self.device.record(format!("release {}", interface));
        Ok(())
    }

    fn interface_endpoints(&self, _interface: u8) -> rusb::Result<Vec<EndpointRef>> {
        Ok(self.device.endpoints.clone())
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.device
            .state
            .lock()
            .unwrap()
            .control_calls
            .push((request_type, request, value, index));

        match self.device.responses.get(&(request, value)) {
            Some(Ok(response)) => {
                let length = response.len().min(buf.len());
                buf[..length].copy_from_slice(&response[..length]);
                Ok(length)
            }
            Some(Err(error)) => Err(*error),
            None => Err(rusb::Error::Pipe),
        }
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.device
            .state
            .lock()
            .unwrap()
            .control_calls
            .push((request_type, request, value, index));

        match self.device.responses.get(&(request, value)) {
            Some(Err(error)) => Err(*error),
            _ => Ok(buf.len()),
        }
    }

    fn read_endpoint(
        &self,
        _endpoint: EndpointRef,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        if self.device.inbound_halted {
            return Err(rusb::Error::Pipe);
        }

        let next = self.device.inbound.lock().unwrap().pop_front();
        match next {
            Some(Ok(chunk)) => {
                let length = chunk.len().min(buf.len());
                buf[..length].copy_from_slice(&chunk[..length]);
                Ok(length)
            }
            Some(Err(error)) => Err(error),
            None => {
                sleep(timeout.min(Duration::from_millis(2)));
                Err(rusb::Error::Timeout)
            }
        }
    }

    fn write_endpoint(
        &self,
        endpoint: EndpointRef,
        buf: &[u8],
        _timeout: Duration,
    ) -> rusb::Result<usize> {
        self.device
            .state
            .lock()
            .unwrap()
            .written
            .push((endpoint.address(), buf.to_vec()));
        Ok(buf.len())
    }

    fn clear_halt(&self, endpoint: EndpointRef) -> rusb::Result<()> {
        self.device
            .record(format!("clear halt {:#04x}", endpoint.address()));
        Ok(())
    }

    fn concurrent_control(&self) -> bool {
        self.device.concurrent
    }
}
