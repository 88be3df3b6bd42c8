use crate::channel::RawResponse;
use crate::error::{DecodeError, EncodeError};
use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use panda_types::{CanFrame, HealthRecord, Query};

pub const HEALTH_LENGTH: usize = 13;

// CAN messages travel in fixed 16 byte slots: two little endian words, then up to 8 data bytes.
pub const CAN_SLOT_LENGTH: usize = 0x10;
const CAN_MAX_DATA: usize = 8;
const CAN_MAX_ADDRESS: u32 = 0x1fff_ffff;
const CAN_TRANSMIT: u32 = 1;
const CAN_EXTENDED: u32 = 4;

/// A decoded query response. Secret, serial and version have no known structure, so they're
/// handed back as-is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryResponse {
    Secret(RawResponse),
    Serial(RawResponse),
    Health(HealthRecord),
    GreyModel(bool),
    Version(RawResponse),
}

pub fn decode(query: Query, raw: RawResponse) -> Result<QueryResponse, DecodeError> {
    Ok(match query {
        Query::Secret => QueryResponse::Secret(raw),
        Query::Serial => QueryResponse::Serial(raw),
        Query::Health => QueryResponse::Health(decode_health(&raw)?),
        Query::GreyModel => QueryResponse::GreyModel(decode_grey_model(&raw)?),
        Query::Version => QueryResponse::Version(raw),
    })
}

fn require(what: &'static str, bytes: &[u8], expected: usize) -> Result<(), DecodeError> {
    if bytes.len() < expected {
        return Err(DecodeError::TooShort {
            what,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

pub fn decode_health(raw: &RawResponse) -> Result<HealthRecord, DecodeError> {
    let d = raw.as_bytes();
    require("health", d, HEALTH_LENGTH)?;

    Ok(HealthRecord {
        voltage: d[0],
        current: d[1],
        started: d[2],
        controls_allowed: d[3],
        gas_interceptor_detected: d[4],
        started_signal_detected: d[5],
        started_alt: d[6],
    })
}

/// Lays a health record out the way the device sends it, zero padded to [`HEALTH_LENGTH`].
pub fn encode_health(record: &HealthRecord) -> RawResponse {
    let mut bytes = vec![
        record.voltage,
        record.current,
        record.started,
        record.controls_allowed,
        record.gas_interceptor_detected,
        record.started_signal_detected,
        record.started_alt,
    ];
    bytes.resize(HEALTH_LENGTH, 0);
    RawResponse::new(bytes)
}

pub fn decode_grey_model(raw: &RawResponse) -> Result<bool, DecodeError> {
    let d = raw.as_bytes();
    require("grey model", d, 1)?;
    Ok(d[0] == 1)
}

pub fn encode_grey_model(grey: bool) -> RawResponse {
    RawResponse::new(vec![u8::from(grey)])
}

/// The bytes the device would have sent for this response.
pub fn encode(response: &QueryResponse) -> RawResponse {
    match response {
        QueryResponse::Secret(raw) | QueryResponse::Serial(raw) | QueryResponse::Version(raw) => {
            raw.clone()
        }
        QueryResponse::Health(record) => encode_health(record),
        QueryResponse::GreyModel(grey) => encode_grey_model(*grey),
    }
}

/// Splits a telemetry frame into its CAN messages. A trailing partial slot is an error rather
/// than being silently dropped.
pub fn decode_can_frames(bytes: &[u8]) -> Result<Vec<CanFrame>, DecodeError> {
    let remainder = bytes.len() % CAN_SLOT_LENGTH;
    if remainder != 0 {
        return Err(DecodeError::TooShort {
            what: "CAN slot",
            expected: CAN_SLOT_LENGTH,
            actual: remainder,
        });
    }

    Ok(bytes
        .chunks_exact(CAN_SLOT_LENGTH)
        .map(|slot| {
            let f1 = LittleEndian::read_u32(&slot[0..4]);
            let f2 = LittleEndian::read_u32(&slot[4..8]);

            let address = if f1 & CAN_EXTENDED != 0 {
                f1 >> 3
            } else {
                f1 >> 21
            };
            let length = ((f2 & 0xf) as usize).min(CAN_MAX_DATA);

            CanFrame {
                address,
                bus_time: (f2 >> 16) as u16,
                data: slot[8..8 + length].to_vec(),
                bus: ((f2 >> 4) & 0xff) as u8,
            }
        })
        .collect())
}

fn write_can_slot(
    out: &mut Vec<u8>,
    frame: &CanFrame,
    bus_time: u16,
    flags: u32,
) -> Result<(), EncodeError> {
    if frame.data.len() > CAN_MAX_DATA {
        return Err(EncodeError::PayloadTooLong {
            len: frame.data.len(),
        });
    }
    if frame.address > CAN_MAX_ADDRESS {
        return Err(EncodeError::AddressOutOfRange {
            address: frame.address,
        });
    }

    let f1 = if frame.address >= 0x800 {
        (frame.address << 3) | CAN_EXTENDED | flags
    } else {
        (frame.address << 21) | flags
    };
    let f2 = frame.data.len() as u32 | (u32::from(frame.bus) << 4) | (u32::from(bus_time) << 16);

    // Writes into a Vec can't fail.
    let _ = out.write_u32::<LittleEndian>(f1);
    let _ = out.write_u32::<LittleEndian>(f2);
    out.extend_from_slice(&frame.data);
    out.resize(out.len() + CAN_MAX_DATA - frame.data.len(), 0);
    Ok(())
}

/// Packs frames in the layout the device reports them in.
pub fn encode_can_frames(frames: &[CanFrame]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(frames.len() * CAN_SLOT_LENGTH);
    for frame in frames {
        write_can_slot(&mut out, frame, frame.bus_time, 0)?;
    }
    Ok(out)
}

/// Packs frames for transmission on the CAN outbound endpoint. The device stamps its own bus
/// time, so any on the frame is left out.
pub fn encode_can_send(frames: &[CanFrame]) -> Result<Vec<u8>, EncodeError> {
    let mut out = Vec::with_capacity(frames.len() * CAN_SLOT_LENGTH);
    for frame in frames {
        write_can_slot(&mut out, frame, 0, CAN_TRANSMIT)?;
    }
    Ok(out)
}
