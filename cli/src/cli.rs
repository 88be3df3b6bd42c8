use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use panda_types::{Query, SafetyMode};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(about, version, author)]
pub struct Cli {
    /// Minimum log level to print out
    #[clap(long, value_enum, default_value = "info")]
    pub log_level: LevelFilter,

    /// Location of the settings file on disk
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// Use the panda with this USB serial number, rather than the first one found
    #[clap(long)]
    pub serial: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List attached pandas
    List,

    /// Read a value from the panda
    Query {
        #[clap(value_enum)]
        query: Query,
    },

    /// Stream telemetry until interrupted
    Stream {
        /// Stop after this many seconds
        #[clap(long)]
        duration: Option<u64>,

        /// Decode frames as CAN messages rather than printing raw bytes
        #[clap(long)]
        can: bool,
    },

    /// Change the panda's safety mode
    SafetyMode {
        #[clap(value_enum)]
        mode: SafetyMode,
    },
}

pub fn default_config_location() -> Option<PathBuf> {
    ProjectDirs::from("ai", "comma", "panda-usb").map(|dirs| dirs.config_dir().join("settings.json"))
}

#[repr(usize)]
#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        }
    }
}
