use crate::device::UsbDeviceHandle;
use crate::error::TransferError;
use crate::requests::{ControlRequest, RequestData};
use log::debug;
use std::fmt::{Display, Formatter};
use std::time::Duration;

pub const DEFAULT_CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

/// Bytes returned by a control transfer. The device decides the length, and it may be shorter
/// than what was asked for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawResponse(Vec<u8>);

impl RawResponse {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Best effort text rendering, stopping at the first NUL.
    pub fn text(&self) -> String {
        let length = self.0.iter().position(|&c| c == 0).unwrap_or(self.0.len());
        String::from_utf8_lossy(&self.0[..length]).to_string()
    }

    pub fn hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl From<Vec<u8>> for RawResponse {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl Display for RawResponse {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hex())
    }
}

/// Issues vendor control transfers. Holds no state besides its timeout, so it never retries and
/// never orders requests, that's up to whoever owns it.
#[derive(Debug, Clone, Copy)]
pub struct ControlChannel {
    timeout: Duration,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CONTROL_TIMEOUT)
    }
}

impl ControlChannel {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn transfer<H: UsbDeviceHandle + ?Sized>(
        &self,
        handle: &H,
        request: &ControlRequest,
    ) -> Result<RawResponse, TransferError> {
        debug!(
            "Control transfer: request_type={:#x}, request={:#x}, value={:#x}, index={:#x}",
            request.request_type(),
            request.request(),
            request.value(),
            request.index(),
        );

        let result = match request.data() {
            RequestData::Length(length) => {
                let mut buf = vec![0; *length];
                handle
                    .read_control(
                        request.request_type(),
                        request.request(),
                        request.value(),
                        request.index(),
                        &mut buf,
                        self.timeout,
                    )
                    .map(|response_length| {
                        buf.truncate(response_length);
                        RawResponse(buf)
                    })
            }
            RequestData::Payload(payload) => handle
                .write_control(
                    request.request_type(),
                    request.request(),
                    request.value(),
                    request.index(),
                    payload,
                    self.timeout,
                )
                .map(|_| RawResponse::default()),
        };

        match result {
            Ok(response) => {
                debug!("Control transfer succeeded: {} bytes", response.len());
                Ok(response)
            }
            Err(e) => {
                debug!("Control transfer failed: {}", e);
                Err(TransferError::new(request.operation(), e))
            }
        }
    }
}
