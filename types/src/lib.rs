// Plain Old Rust Structs describing what the panda reports. Nothing in here knows about USB,
// the wire format lives in panda-usb, these are just the shapes callers get handed back.
#[cfg(feature = "clap")]
use clap::ValueEnum;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{Display, EnumCount, EnumIter};

pub const VID_PANDA: u16 = 0xbbaa;
pub const PID_PANDA: u16 = 0xddcc;

/// The read-only queries the panda answers over the control pipe.
#[derive(Copy, Clone, Debug, Display, EnumIter, EnumCount, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Query {
    Secret,
    Serial,
    Health,
    GreyModel,
    Version,
}

/// Snapshot of the panda's operational state, one byte per field.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct HealthRecord {
    pub voltage: u8,
    pub current: u8,
    pub started: u8,
    pub controls_allowed: u8,
    pub gas_interceptor_detected: u8,
    pub started_signal_detected: u8,
    pub started_alt: u8,
}

impl std::fmt::Display for HealthRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "voltage:                  {}", self.voltage)?;
        writeln!(f, "current:                  {}", self.current)?;
        writeln!(f, "started:                  {}", self.started)?;
        writeln!(f, "controls allowed:         {}", self.controls_allowed)?;
        writeln!(f, "gas interceptor detected: {}", self.gas_interceptor_detected)?;
        writeln!(f, "started signal detected:  {}", self.started_signal_detected)?;
        write!(f, "started alt:              {}", self.started_alt)
    }
}

#[derive(Copy, Clone, Debug, Display, EnumIter, EnumCount, PartialEq, Eq, Hash)]
#[strum(serialize_all = "kebab-case")]
#[cfg_attr(feature = "clap", derive(ValueEnum))]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum SafetyMode {
    NoOutput,
    Honda,
    Toyota,
    ToyotaNoLimits,
    AllOutput,
    Elm327,
}

impl SafetyMode {
    pub fn id(&self) -> u16 {
        match self {
            SafetyMode::NoOutput => 0,
            SafetyMode::Honda => 1,
            SafetyMode::Toyota => 2,
            SafetyMode::ToyotaNoLimits => 0x1336,
            SafetyMode::AllOutput => 0x1337,
            SafetyMode::Elm327 => 0xE327,
        }
    }
}

/// A single CAN message, as carried inside a telemetry frame.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CanFrame {
    pub address: u32,
    pub bus_time: u16,
    pub data: Vec<u8>,
    pub bus: u8,
}

impl std::fmt::Display for CanFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bus {} {:#x} [{}]", self.bus, self.address, self.data.len())?;
        for byte in &self.data {
            write!(f, " {:02x}", byte)?;
        }
        Ok(())
    }
}
