use crate::device::{EndpointRef, UsbDeviceHandle};
use crate::error::{Operation, StreamError, TransferError};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

// The device hands back up to 256 CAN slots per read.
pub const DEFAULT_CHUNK_SIZE: usize = 0x10 * 256;
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamConfig {
    pub chunk_size: usize,
    pub poll_timeout: Duration,
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.chunk_size == 0 {
            return Err(StreamError::InvalidConfig("chunk size must be non-zero"));
        }
        if self.poll_timeout.is_zero() {
            return Err(StreamError::InvalidConfig("poll timeout must be non-zero"));
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
        }
    }
}

/// One chunk read from the inbound endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryFrame {
    sequence: u64,
    received_at: Instant,
    data: Vec<u8>,
}

impl TelemetryFrame {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn received_at(&self) -> Instant {
        self.received_at
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Receives everything the stream produces, on the stream's worker thread.
pub trait TelemetrySink: Send + 'static {
    fn on_frame(&mut self, frame: TelemetryFrame, stream: &StreamHandle);
    fn on_error(&mut self, error: TransferError, stream: &StreamHandle);
}

struct CallbackSink<F, E> {
    on_frame: F,
    on_error: E,
}

impl<F, E> TelemetrySink for CallbackSink<F, E>
where
    F: FnMut(TelemetryFrame) + Send + 'static,
    E: FnMut(TransferError) + Send + 'static,
{
    fn on_frame(&mut self, frame: TelemetryFrame, _stream: &StreamHandle) {
        (self.on_frame)(frame)
    }

    fn on_error(&mut self, error: TransferError, _stream: &StreamHandle) {
        (self.on_error)(error)
    }
}

struct Shared {
    stopping: AtomicBool,
    worker_id: OnceLock<ThreadId>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Controls a running stream. Clones refer to the same stream.
#[derive(Clone)]
pub struct StreamHandle {
    shared: Arc<Shared>,
}

impl StreamHandle {
    /// Stops polling. Once this returns no further frames or errors will be delivered, unless
    /// it's called from inside the sink, in which case delivery ends when the sink returns.
    pub fn stop(&self) {
        self.shared.stopping.store(true, Ordering::SeqCst);

        if self.shared.worker_id.get() == Some(&thread::current().id()) {
            return;
        }

        let mut worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(worker) = worker.take() {
            if worker.join().is_err() {
                error!("Telemetry worker panicked");
            }
            debug!("Telemetry worker joined");
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.stopping.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        if self.is_stopping() {
            return false;
        }
        match self.shared.worker.lock() {
            Ok(worker) => worker.as_ref().is_some_and(|w| !w.is_finished()),
            Err(_) => false,
        }
    }
}

pub fn start<H, F, E>(
    handle: Arc<H>,
    inbound: EndpointRef,
    config: StreamConfig,
    on_frame: F,
    on_error: E,
) -> Result<StreamHandle, StreamError>
where
    H: UsbDeviceHandle + ?Sized,
    F: FnMut(TelemetryFrame) + Send + 'static,
    E: FnMut(TransferError) + Send + 'static,
{
    start_sink(handle, inbound, config, CallbackSink { on_frame, on_error })
}

pub fn start_sink<H, S>(
    handle: Arc<H>,
    inbound: EndpointRef,
    config: StreamConfig,
    mut sink: S,
) -> Result<StreamHandle, StreamError>
where
    H: UsbDeviceHandle + ?Sized,
    S: TelemetrySink,
{
    config.validate()?;

    let stream = StreamHandle {
        shared: Arc::new(Shared {
            stopping: AtomicBool::new(false),
            worker_id: OnceLock::new(),
            worker: Mutex::new(None),
        }),
    };

    let worker_stream = stream.clone();
    let worker = thread::Builder::new()
        .name("panda-telemetry".to_string())
        .spawn(move || {
            let stream = worker_stream;
            let _ = stream.shared.worker_id.set(thread::current().id());
            poll(&*handle, inbound, config, &mut sink, &stream);
        })?;

    *stream
        .shared
        .worker
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(worker);

    info!("Telemetry streaming from endpoint {:#04x}", inbound.address());
    Ok(stream)
}

fn poll<H, S>(
    handle: &H,
    inbound: EndpointRef,
    config: StreamConfig,
    sink: &mut S,
    stream: &StreamHandle,
) where
    H: UsbDeviceHandle + ?Sized,
    S: TelemetrySink,
{
    let operation = Operation::EndpointRead {
        endpoint: inbound.address(),
    };
    let mut buf = vec![0; config.chunk_size];
    let mut sequence = 0;

    while !stream.is_stopping() {
        let result = handle.read_endpoint(inbound, &mut buf, config.poll_timeout);
        if stream.is_stopping() {
            break;
        }

        match result {
            Ok(0) => {}
            Ok(length) => {
                let frame = TelemetryFrame {
                    sequence,
                    received_at: Instant::now(),
                    data: buf[..length].to_vec(),
                };
                sequence += 1;
                sink.on_frame(frame, stream);
            }
            Err(e) => {
                let error = TransferError::new(operation, e);
                if error.is_disconnect() {
                    warn!("Device disconnected, telemetry stopping");
                    stream.shared.stopping.store(true, Ordering::SeqCst);
                    sink.on_error(error, stream);
                    break;
                }

                let stalled = error.is_stall();
                let timed_out = error.is_timeout();
                sink.on_error(error, stream);

                if stalled {
                    match handle.clear_halt(inbound) {
                        Ok(()) => debug!("Cleared halt on endpoint {:#04x}", inbound.address()),
                        Err(e) => warn!(
                            "Unable to clear halt on endpoint {:#04x}: {}",
                            inbound.address(),
                            e
                        ),
                    }
                }

                // A timed out read has already waited, anything else backs off before retrying.
                if !timed_out && !stream.is_stopping() {
                    thread::sleep(config.poll_timeout);
                }
            }
        }
    }

    debug!("Telemetry worker exiting after {} frames", sequence);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Frame(TelemetryFrame),
    Error(TransferError),
}

/// Forwards stream events into a bounded tokio channel. If the receiver goes away, the stream
/// stops itself.
pub struct ChannelSink {
    sender: mpsc::Sender<StreamEvent>,
}

pub fn channel(capacity: usize) -> (ChannelSink, mpsc::Receiver<StreamEvent>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (ChannelSink { sender }, receiver)
}

impl ChannelSink {
    fn forward(&mut self, mut event: StreamEvent, stream: &StreamHandle) {
        loop {
            match self.sender.try_send(event) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    if stream.is_stopping() {
                        return;
                    }
                    event = returned;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Telemetry receiver closed, stopping stream");
                    stream.stop();
                    return;
                }
            }
        }
    }
}

impl TelemetrySink for ChannelSink {
    fn on_frame(&mut self, frame: TelemetryFrame, stream: &StreamHandle) {
        self.forward(StreamEvent::Frame(frame), stream);
    }

    fn on_error(&mut self, error: TransferError, stream: &StreamHandle) {
        self.forward(StreamEvent::Error(error), stream);
    }
}
