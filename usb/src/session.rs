use crate::channel::{ControlChannel, RawResponse, DEFAULT_CONTROL_TIMEOUT};
use crate::decode::{decode, encode_can_send, QueryResponse};
use crate::device::{DeviceCandidate, UsbBus, UsbDeviceHandle};
use crate::error::{ConnectError, Operation, QueryError, StreamError, TransferError};
use crate::locator::{self, ClaimedInterface, Endpoints, PANDA_INTERFACE};
use crate::requests::{Command, ControlRequest};
use crate::stream::{self, ChannelSink, StreamConfig, StreamEvent, StreamHandle, TelemetryFrame};
use log::{debug, info, warn};
use panda_types::{CanFrame, HealthRecord, Query, PID_PANDA, VID_PANDA};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Pick the device with this USB serial, rather than the first one found.
    pub serial: Option<String>,
    pub control_timeout: Duration,
    /// How many times a query is re-issued after timing out. Stalls are never retried.
    pub query_retries: u8,
    pub stream: StreamConfig,
}

impl SessionOptions {
    /// A zero timeout means "wait forever" to libusb, so neither timeout may be zero.
    pub fn validate(&self) -> Result<(), ConnectError> {
        if self.control_timeout.is_zero() {
            return Err(ConnectError::InvalidOptions(
                "control timeout must be non-zero".to_string(),
            ));
        }
        self.stream
            .validate()
            .map_err(|reason| ConnectError::InvalidOptions(reason.to_string()))
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            vendor_id: VID_PANDA,
            product_id: PID_PANDA,
            serial: None,
            control_timeout: DEFAULT_CONTROL_TIMEOUT,
            query_retries: 0,
            stream: StreamConfig::default(),
        }
    }
}

/// An open, claimed panda. Dropping the session tears it down, `close` does the same but
/// reports what went wrong.
pub struct DeviceSession<H: UsbDeviceHandle> {
    handle: Option<Arc<H>>,
    candidate: DeviceCandidate,
    interface: ClaimedInterface,
    channel: ControlChannel,
    control_lock: Mutex<()>,
    query_retries: u8,
    stream_config: StreamConfig,
    stream: Option<StreamHandle>,
}

impl<H: UsbDeviceHandle> DeviceSession<H> {
    pub fn open<B: UsbBus<Handle = H>>(bus: &B, options: &SessionOptions) -> Result<Self, ConnectError> {
        options.validate()?;

        let candidate = match &options.serial {
            Some(serial) => {
                locator::locate_serial(bus, options.vendor_id, options.product_id, serial)?
            }
            None => locator::locate(bus, options.vendor_id, options.product_id)?,
        };

        let mut handle = locator::open(bus, &candidate)?;

        // If this fails the handle is dropped, which closes the device again.
        let interface = locator::claim_interface(&mut handle, PANDA_INTERFACE)?;

        Ok(Self {
            handle: Some(Arc::new(handle)),
            candidate,
            interface,
            channel: ControlChannel::new(options.control_timeout),
            control_lock: Mutex::new(()),
            query_retries: options.query_retries,
            stream_config: options.stream,
            stream: None,
        })
    }

    pub fn candidate(&self) -> &DeviceCandidate {
        &self.candidate
    }

    pub fn endpoints(&self) -> Endpoints {
        self.interface.endpoints
    }

    fn handle(&self) -> &Arc<H> {
        // Only ever taken by teardown, which consumes the session.
        self.handle
            .as_ref()
            .unwrap_or_else(|| unreachable!("session used after teardown"))
    }

    /// Issues a raw control transfer, serialised against other control transfers unless the
    /// backend says it can correlate them itself.
    pub fn transfer(&self, request: &ControlRequest) -> Result<RawResponse, TransferError> {
        let handle = self.handle();
        if handle.concurrent_control() {
            return self.channel.transfer(&**handle, request);
        }

        let _guard = self
            .control_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.channel.transfer(&**handle, request)
    }

    pub fn query(&self, query: Query) -> Result<QueryResponse, QueryError> {
        let request = ControlRequest::from(query);

        let mut attempt = 0;
        let raw = loop {
            match self.transfer(&request) {
                Ok(raw) => break raw,
                Err(e) if e.is_timeout() && attempt < self.query_retries => {
                    attempt += 1;
                    debug!(
                        "{} query timed out, retrying (attempt {} of {})",
                        query, attempt, self.query_retries
                    );
                }
                Err(e) => return Err(e.into()),
            }
        };

        Ok(decode(query, raw)?)
    }

    pub fn secret(&self) -> Result<RawResponse, QueryError> {
        match self.query(Query::Secret)? {
            QueryResponse::Secret(raw) => Ok(raw),
            other => unreachable!("secret query decoded as {:?}", other),
        }
    }

    pub fn serial(&self) -> Result<RawResponse, QueryError> {
        match self.query(Query::Serial)? {
            QueryResponse::Serial(raw) => Ok(raw),
            other => unreachable!("serial query decoded as {:?}", other),
        }
    }

    pub fn health(&self) -> Result<HealthRecord, QueryError> {
        match self.query(Query::Health)? {
            QueryResponse::Health(record) => Ok(record),
            other => unreachable!("health query decoded as {:?}", other),
        }
    }

    pub fn is_grey(&self) -> Result<bool, QueryError> {
        match self.query(Query::GreyModel)? {
            QueryResponse::GreyModel(grey) => Ok(grey),
            other => unreachable!("grey model query decoded as {:?}", other),
        }
    }

    pub fn version(&self) -> Result<RawResponse, QueryError> {
        match self.query(Query::Version)? {
            QueryResponse::Version(raw) => Ok(raw),
            other => unreachable!("version query decoded as {:?}", other),
        }
    }

    pub fn send_command(&self, command: Command) -> Result<(), TransferError> {
        debug!("Sending {:?}", command);
        self.transfer(&command.into()).map(|_| ())
    }

    /// Sends CAN messages in one bulk write on the CAN outbound endpoint.
    pub fn can_send(&self, frames: &[CanFrame]) -> Result<(), QueryError> {
        let endpoint = self.interface.endpoints.can_out();
        let payload = encode_can_send(frames)?;

        self.handle()
            .write_endpoint(endpoint, &payload, self.channel.timeout())
            .map_err(|e| {
                TransferError::new(
                    Operation::EndpointWrite {
                        endpoint: endpoint.address(),
                    },
                    e,
                )
            })?;
        Ok(())
    }

    pub fn start_telemetry<F, E>(&mut self, on_frame: F, on_error: E) -> Result<(), StreamError>
    where
        F: FnMut(TelemetryFrame) + Send + 'static,
        E: FnMut(TransferError) + Send + 'static,
    {
        self.ensure_not_streaming()?;
        let handle = stream::start(
            self.handle().clone(),
            self.interface.endpoints.inbound,
            self.stream_config,
            on_frame,
            on_error,
        )?;
        self.stream = Some(handle);
        Ok(())
    }

    pub fn start_telemetry_sink<S: stream::TelemetrySink>(&mut self, sink: S) -> Result<(), StreamError> {
        self.ensure_not_streaming()?;
        let handle = stream::start_sink(
            self.handle().clone(),
            self.interface.endpoints.inbound,
            self.stream_config,
            sink,
        )?;
        self.stream = Some(handle);
        Ok(())
    }

    /// Streams telemetry into a bounded channel, for async consumers.
    pub fn start_telemetry_channel(
        &mut self,
        capacity: usize,
    ) -> Result<mpsc::Receiver<StreamEvent>, StreamError> {
        let (sink, receiver): (ChannelSink, _) = stream::channel(capacity);
        self.start_telemetry_sink(sink)?;
        Ok(receiver)
    }

    fn ensure_not_streaming(&mut self) -> Result<(), StreamError> {
        if self.is_streaming() {
            return Err(StreamError::AlreadyRunning);
        }

        // A previous stream may have stopped itself on device loss, reap it before replacing.
        self.stop_telemetry();
        Ok(())
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| s.is_running())
    }

    /// A handle which can stop the running stream from elsewhere, including from its sink.
    pub fn telemetry_handle(&self) -> Option<StreamHandle> {
        self.stream.clone()
    }

    pub fn stop_telemetry(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            info!("Telemetry stopped");
        }
    }

    /// Stops telemetry, releases the interface, then closes the device.
    pub fn close(mut self) -> Result<(), ConnectError> {
        self.teardown()
    }

    fn teardown(&mut self) -> Result<(), ConnectError> {
        self.stop_telemetry();

        let Some(mut handle) = self.handle.take() else {
            return Ok(());
        };

        let interface = self.interface.number;
        let result = match Arc::get_mut(&mut handle) {
            Some(handle) => handle
                .release_interface(interface)
                .map_err(|source| ConnectError::ReleaseFailed { interface, source }),
            None => Err(ConnectError::HandleShared { interface }),
        };

        match &result {
            Ok(()) => debug!("Released interface {}", interface),
            Err(e) => warn!("{}", e),
        }

        drop(handle);
        info!(
            "Closed panda at bus {}, address {}",
            self.candidate.bus_number(),
            self.candidate.address()
        );
        result
    }
}

impl<H: UsbDeviceHandle> Drop for DeviceSession<H> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            warn!("Error while closing the panda: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::encode_health;
    use crate::device::mock::{MockBus, MockDevice, MockHandle};
    use crate::error::TransferFailure;
    use crate::requests::CAN_RX_QUEUE;
    use panda_types::SafetyMode;
    use std::sync::mpsc as std_mpsc;
    use std::thread;

    fn health() -> HealthRecord {
        HealthRecord {
            voltage: 10,
            current: 20,
            started: 1,
            controls_allowed: 0,
            gas_interceptor_detected: 0,
            started_signal_detected: 1,
            started_alt: 0,
        }
    }

    fn panda() -> MockDevice {
        MockDevice::panda(1, 4)
            .respond(0xd0, 1, Ok(b"secret-secret-16".to_vec()))
            .respond(0xd0, 0, Ok(b"0123456789abcdef\0".to_vec()))
            .respond(0xd2, 0, Ok(encode_health(&health()).into_bytes()))
            .respond(0xc1, 0, Ok(vec![1]))
            .respond(0xd6, 0, Ok(b"DEV-1.0\0".to_vec()))
    }

    fn options() -> SessionOptions {
        SessionOptions {
            stream: StreamConfig {
                chunk_size: 64,
                poll_timeout: Duration::from_millis(2),
            },
            ..Default::default()
        }
    }

    fn session(device: &MockDevice) -> DeviceSession<MockHandle> {
        DeviceSession::open(&MockBus::new(vec![device.clone()]), &options()).unwrap()
    }

    #[test]
    fn queries_decode_each_kind() {
        let device = panda();
        let session = session(&device);

        assert_eq!(session.secret().unwrap().as_bytes(), b"secret-secret-16");
        assert_eq!(session.serial().unwrap().text(), "0123456789abcdef");
        assert_eq!(session.health().unwrap(), health());
        assert!(session.is_grey().unwrap());
        assert_eq!(session.version().unwrap().text(), "DEV-1.0");
    }

    #[test]
    fn stall_does_not_poison_later_transfers() {
        let device = panda().respond(0xd0, 0, Err(rusb::Error::Pipe));
        let session = session(&device);

        let error = session.serial().unwrap_err();
        assert!(matches!(
            error,
            QueryError::Transfer(TransferError {
                reason: TransferFailure::Stall,
                ..
            })
        ));
        assert_eq!(session.health().unwrap(), health());
    }

    #[test]
    fn short_health_surfaces_as_decode_error() {
        let device = panda().respond(0xd2, 0, Ok(vec![10, 20, 1]));
        let session = session(&device);

        assert!(matches!(
            session.health(),
            Err(QueryError::Decode(crate::error::DecodeError::TooShort {
                expected: 13,
                actual: 3,
                ..
            }))
        ));
    }

    #[test]
    fn timeouts_are_retried_but_stalls_are_not() {
        let device = panda()
            .respond(0xd6, 0, Err(rusb::Error::Timeout))
            .respond(0xc1, 0, Err(rusb::Error::Pipe));
        let bus = MockBus::new(vec![device.clone()]);
        let session: DeviceSession<MockHandle> = DeviceSession::open(
            &bus,
            &SessionOptions {
                query_retries: 2,
                ..options()
            },
        )
        .unwrap();

        assert!(session.version().is_err());
        assert!(session.is_grey().is_err());

        let calls = device.state.lock().unwrap().control_calls.clone();
        assert_eq!(calls.iter().filter(|c| c.1 == 0xd6).count(), 3);
        assert_eq!(calls.iter().filter(|c| c.1 == 0xc1).count(), 1);
    }

    #[test]
    fn commands_and_can_send() {
        let device = panda();
        let session = session(&device);

        session
            .send_command(Command::SetSafetyMode(SafetyMode::AllOutput))
            .unwrap();
        session.send_command(Command::ClearCan(CAN_RX_QUEUE)).unwrap();
        session
            .can_send(&[CanFrame {
                address: 0x123,
                bus_time: 0,
                data: vec![1, 2],
                bus: 0,
            }])
            .unwrap();

        let state = device.state.lock().unwrap();
        assert!(state.control_calls.contains(&(0x40, 0xdc, 0x1337, 0)));
        assert!(state.control_calls.contains(&(0x40, 0xf1, 0xffff, 0)));
        assert_eq!(state.written.len(), 1);
        assert_eq!(state.written[0].0, 0x03);
        assert_eq!(state.written[0].1.len(), 16);
    }

    #[test]
    fn teardown_runs_in_reverse_order() {
        let device = panda();
        device.queue_inbound(Ok(vec![1, 2, 3]));
        let mut session = session(&device);

        let (tx, rx) = std_mpsc::channel();
        session.start_telemetry(move |frame| tx.send(frame).unwrap(), |_| {}).unwrap();
        assert!(session.is_streaming());
        assert!(matches!(
            session.start_telemetry(|_| {}, |_| {}),
            Err(StreamError::AlreadyRunning)
        ));

        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame.data(), [1, 2, 3]);

        // Queries keep working while streaming.
        assert_eq!(session.health().unwrap(), health());

        session.close().unwrap();
        assert_eq!(device.events(), ["open", "claim 0", "release 0", "close"]);
    }

    #[test]
    fn dropped_session_still_releases() {
        let device = panda();
        {
            let mut session = session(&device);
            session.start_telemetry(|_| {}, |_| {}).unwrap();
        }
        assert_eq!(device.events(), ["open", "claim 0", "release 0", "close"]);
    }

    #[test]
    fn failed_claim_closes_the_device() {
        let mut device = panda();
        device.claim_error = Some(rusb::Error::Busy);
        let bus = MockBus::new(vec![device.clone()]);

        let result = DeviceSession::open(&bus, &options());
        assert!(matches!(result, Err(ConnectError::ClaimFailed { .. })));
        assert_eq!(device.events(), ["open", "close"]);
    }

    #[test]
    fn zero_timeouts_are_refused_before_opening() {
        let device = panda();
        let bus = MockBus::new(vec![device.clone()]);

        let zero_control = SessionOptions {
            control_timeout: Duration::ZERO,
            ..options()
        };
        let zero_poll = SessionOptions {
            stream: StreamConfig {
                chunk_size: 64,
                poll_timeout: Duration::ZERO,
            },
            ..options()
        };
        let zero_chunk = SessionOptions {
            stream: StreamConfig {
                chunk_size: 0,
                poll_timeout: Duration::from_millis(2),
            },
            ..options()
        };

        for options in [zero_control, zero_poll, zero_chunk] {
            assert!(matches!(
                DeviceSession::open(&bus, &options),
                Err(ConnectError::InvalidOptions(_))
            ));
        }
        assert_eq!(device.opened(), 0);
    }

    #[test]
    fn close_with_the_handle_still_shared_is_reported() {
        let device = panda();
        let session = session(&device);
        let outstanding = session.handle.clone();

        assert!(matches!(
            session.close(),
            Err(ConnectError::HandleShared { interface: 0 })
        ));
        assert_eq!(device.events(), ["open", "claim 0"]);

        drop(outstanding);
        assert_eq!(device.events(), ["open", "claim 0", "close"]);
    }

    #[test]
    fn missing_device_never_opens() {
        let device = panda();
        let bus = MockBus::new(vec![device.clone()]);
        let result = DeviceSession::open(
            &bus,
            &SessionOptions {
                serial: Some("not-here".to_string()),
                ..options()
            },
        );

        assert!(matches!(result, Err(ConnectError::DeviceNotFound { .. })));
        assert_eq!(device.opened(), 0);
    }

    #[test]
    fn telemetry_can_restart_after_device_loss() {
        let device = panda();
        device.queue_inbound(Err(rusb::Error::NoDevice));
        let mut session = session(&device);

        let (tx, rx) = std_mpsc::channel();
        session
            .start_telemetry(|_| {}, move |e: TransferError| tx.send(e).unwrap())
            .unwrap();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap().is_disconnect());

        while session.is_streaming() {
            thread::sleep(Duration::from_millis(1));
        }
        session.start_telemetry(|_| {}, |_| {}).unwrap();
        session.stop_telemetry();
        session.stop_telemetry();
        session.close().unwrap();
    }

    #[test]
    fn control_transfers_from_many_threads() {
        let device = panda();
        let session = Arc::new(session(&device));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let session = session.clone();
                thread::spawn(move || {
                    for _ in 0..10 {
                        assert_eq!(session.health().unwrap(), health());
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
    }
}
