use anyhow::{Context, Result, bail};
use panda_usb::stream::{DEFAULT_CHUNK_SIZE, DEFAULT_POLL_TIMEOUT};
use panda_usb::{SessionOptions, StreamConfig};
use serde::{Deserialize, Serialize};
use std::fs::{create_dir_all, File};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub control_timeout_ms: u64,
    pub poll_timeout_ms: u64,
    pub chunk_size: usize,
    pub query_retries: u8,
    pub serial: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            control_timeout_ms: 1000,
            poll_timeout_ms: DEFAULT_POLL_TIMEOUT.as_millis() as u64,
            chunk_size: DEFAULT_CHUNK_SIZE,
            query_retries: 0,
            serial: None,
        }
    }
}

impl Settings {
    /// Reads the settings, writing out the defaults if the file doesn't exist yet.
    pub fn load(path: &Path) -> Result<Settings> {
        match File::open(path) {
            Ok(reader) => {
                let settings: Settings = serde_json::from_reader(reader).context(format!(
                    "Could not parse settings file at {}",
                    path.to_string_lossy()
                ))?;
                settings.validate().context(format!(
                    "Invalid settings in {}",
                    path.to_string_lossy()
                ))?;
                Ok(settings)
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {
                let settings = Settings::default();
                settings.write(path)?;
                Ok(settings)
            }
            Err(error) => Err(error).context(format!(
                "Could not open settings file for reading at {}",
                path.to_string_lossy()
            )),
        }
    }

    // libusb treats a zero timeout as no timeout at all.
    fn validate(&self) -> Result<()> {
        if self.control_timeout_ms == 0 {
            bail!("control_timeout_ms must be greater than zero");
        }
        if self.poll_timeout_ms == 0 {
            bail!("poll_timeout_ms must be greater than zero");
        }
        if self.chunk_size == 0 {
            bail!("chunk_size must be greater than zero");
        }
        Ok(())
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if let Err(e) = create_dir_all(parent) {
                if e.kind() != ErrorKind::AlreadyExists {
                    return Err(e).context(format!(
                        "Could not create settings directory at {}",
                        parent.to_string_lossy()
                    ))?;
                }
            }
        }
        let writer = File::create(path).context(format!(
            "Could not open settings file for writing at {}",
            path.to_string_lossy()
        ))?;
        serde_json::to_writer_pretty(writer, self).context(format!(
            "Could not write to settings file at {}",
            path.to_string_lossy()
        ))?;
        Ok(())
    }

    /// The command line serial wins over the configured one.
    pub fn session_options(&self, serial: Option<String>) -> SessionOptions {
        SessionOptions {
            serial: serial.or_else(|| self.serial.clone()),
            control_timeout: Duration::from_millis(self.control_timeout_ms),
            query_retries: self.query_retries,
            stream: StreamConfig {
                chunk_size: self.chunk_size,
                poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            },
            ..Default::default()
        }
    }
}
