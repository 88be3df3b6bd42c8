mod cli;
mod settings;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{debug, info, warn};
use panda_types::{Query, PID_PANDA, VID_PANDA};
use panda_usb::decode::{decode_can_frames, QueryResponse};
use panda_usb::requests::Command;
use panda_usb::{locator, DeviceSession, LibUsbBus, RawResponse, StreamEvent};
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode};
use std::time::Duration;
use tokio::signal;
use tokio::time::sleep;

use crate::cli::{default_config_location, Cli, Commands};
use crate::settings::Settings;

const STREAM_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<()> {
    let args: Cli = Cli::parse();

    CombinedLogger::init(vec![TermLogger::new(
        args.log_level.into(),
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    )])
    .context("Could not configure the logger")?;

    let config = match args.config.clone().or_else(default_config_location) {
        Some(path) => path,
        None => return Err(anyhow!("Unable to determine a location for the settings file")),
    };
    debug!("Loading settings from {}", config.to_string_lossy());
    let settings = Settings::load(&config)?;
    let options = settings.session_options(args.serial.clone());

    if let Commands::List = args.command {
        let devices = locator::list(&LibUsbBus, options.vendor_id, options.product_id)
            .context("Unable to enumerate USB devices")?;
        if devices.is_empty() {
            println!("No pandas found ({:04x}:{:04x})", VID_PANDA, PID_PANDA);
        }
        for device in devices {
            println!(
                "bus {:03} address {:03} serial {}",
                device.candidate.bus_number(),
                device.candidate.address(),
                device.serial.as_deref().unwrap_or("(unreadable)")
            );
        }
        return Ok(());
    }

    let mut session = DeviceSession::open(&LibUsbBus, &options).context("Unable to open the panda")?;

    match args.command {
        Commands::List => {}
        Commands::Query { query } => {
            let response = session
                .query(query)
                .with_context(|| format!("{} query failed", query))?;
            print_response(query, response);
        }
        Commands::SafetyMode { mode } => {
            session
                .send_command(Command::SetSafetyMode(mode))
                .context("Unable to set the safety mode")?;
            info!("Safety mode set to {}", mode);
        }
        Commands::Stream { duration, can } => {
            let mut events = session
                .start_telemetry_channel(STREAM_CAPACITY)
                .context("Unable to start telemetry")?;

            let deadline = async {
                match duration {
                    Some(seconds) => sleep(Duration::from_secs(seconds)).await,
                    None => std::future::pending().await,
                }
            };
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(StreamEvent::Frame(frame)) => print_frame(frame.sequence(), frame.data(), can),
                            Some(StreamEvent::Error(e)) if e.is_timeout() => debug!("{}", e),
                            Some(StreamEvent::Error(e)) if e.is_disconnect() => {
                                // The stream has already stopped itself.
                                drop(events);
                                session.stop_telemetry();
                                return Err(e).context("Panda disconnected while streaming");
                            }
                            Some(StreamEvent::Error(e)) => warn!("{}", e),
                            None => break,
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Interrupted, stopping telemetry");
                        break;
                    }
                    _ = &mut deadline => {
                        info!("Stream duration reached");
                        break;
                    }
                }
            }

            drop(events);
            session.stop_telemetry();
        }
    }

    session.close().context("Panda did not close cleanly")?;
    Ok(())
}

fn print_response(query: Query, response: QueryResponse) {
    match response {
        QueryResponse::Health(record) => println!("{}", record),
        QueryResponse::GreyModel(grey) => println!("{}", grey),
        QueryResponse::Secret(raw) | QueryResponse::Serial(raw) | QueryResponse::Version(raw) => {
            print_raw(query, &raw)
        }
    }
}

fn print_raw(query: Query, raw: &RawResponse) {
    println!("{} ({} bytes)", query, raw.len());
    println!("hex:  {}", raw.hex());
    println!("text: {}", raw.text());
}

fn print_frame(sequence: u64, data: &[u8], can: bool) {
    if !can {
        let raw = RawResponse::new(data.to_vec());
        println!("#{} [{}] {}", sequence, raw.len(), raw.hex());
        return;
    }

    match decode_can_frames(data) {
        Ok(frames) => {
            for frame in frames {
                println!("#{} {}", sequence, frame);
            }
        }
        Err(e) => warn!("Frame #{} is not a set of CAN messages: {}", sequence, e),
    }
}
