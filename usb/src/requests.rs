use crate::error::Operation;
use panda_types::{Query, SafetyMode};
use rusb::{Direction, Recipient, RequestType};

/// What a control transfer carries: a read length, or a payload to write.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestData {
    Length(usize),
    Payload(Vec<u8>),
}

/// A single vendor control transfer. Built per call, never reused.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlRequest {
    request: u8,
    value: u16,
    index: u16,
    data: RequestData,
}

impl ControlRequest {
    pub fn read(request: u8, value: u16, index: u16, length: usize) -> Self {
        Self {
            request,
            value,
            index,
            data: RequestData::Length(length),
        }
    }

    pub fn write(request: u8, value: u16, index: u16, payload: &[u8]) -> Self {
        Self {
            request,
            value,
            index,
            data: RequestData::Payload(payload.to_vec()),
        }
    }

    pub fn direction(&self) -> Direction {
        match self.data {
            RequestData::Length(_) => Direction::In,
            RequestData::Payload(_) => Direction::Out,
        }
    }

    /// The bmRequestType byte, always vendor / device (0xc0 in, 0x40 out).
    pub fn request_type(&self) -> u8 {
        rusb::request_type(self.direction(), RequestType::Vendor, Recipient::Device)
    }

    pub fn request(&self) -> u8 {
        self.request
    }

    pub fn value(&self) -> u16 {
        self.value
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn data(&self) -> &RequestData {
        &self.data
    }

    pub fn operation(&self) -> Operation {
        Operation::Control {
            request: self.request,
            value: self.value,
            index: self.index,
        }
    }
}

impl From<Query> for ControlRequest {
    fn from(query: Query) -> Self {
        match query {
            Query::Secret => ControlRequest::read(0xd0, 1, 0, 0x10),
            Query::Serial => ControlRequest::read(0xd0, 0, 0, 0x20),
            Query::Health => ControlRequest::read(0xd2, 0, 0, 13),
            Query::GreyModel => ControlRequest::read(0xc1, 0, 0, 0x40),
            Query::Version => ControlRequest::read(0xd6, 0, 0, 0x40),
        }
    }
}

/// Bus id which addresses the shared receive queue rather than a single bus' transmit queue.
pub const CAN_RX_QUEUE: u16 = 0xffff;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetSafetyMode(SafetyMode),
    SetCanLoopback(bool),
    SetCanSpeed { bus: u16, kbps: u16 },
    ClearCan(u16),
    SetCanForwarding { from: u16, to: u16 },
    /// Routes GMLAN onto the given bus, or turns it off.
    SetGmlan(Option<u16>),
    SetUsbPower(bool),
}

impl From<Command> for ControlRequest {
    fn from(command: Command) -> Self {
        match command {
            Command::SetSafetyMode(mode) => ControlRequest::write(0xdc, mode.id(), 0, &[]),
            Command::SetCanLoopback(enabled) => {
                ControlRequest::write(0xe5, u16::from(enabled), 0, &[])
            }
            Command::SetCanSpeed { bus, kbps } => {
                ControlRequest::write(0xde, bus, kbps.saturating_mul(10), &[])
            }
            Command::ClearCan(bus) => ControlRequest::write(0xf1, bus, 0, &[]),
            Command::SetCanForwarding { from, to } => ControlRequest::write(0xdd, from, to, &[]),
            Command::SetGmlan(None) => ControlRequest::write(0xdb, 0, 0, &[]),
            Command::SetGmlan(Some(bus)) => ControlRequest::write(0xdb, 1, bus, &[]),
            Command::SetUsbPower(on) => ControlRequest::write(0xe6, u16::from(on), 0, &[]),
        }
    }
}
