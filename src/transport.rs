use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, warn};

use crate::protocol::{self, Frame, StatusPacket, HEADER_LEN, MARKER, MAX_LENGTH};
use crate::{CommError, GripperError};

/// One request/response transaction at a time over a half-duplex link.
///
/// Every transaction takes `&mut self`, so a second request cannot be issued
/// before the previous one has completed or timed out.
pub struct Transport<S> {
    stream: S,
    timeout: Duration,
    max_retries: u32,
    rx: Vec<u8>,
    /// A request timed out; its answer may still be on the way.
    stale: bool,
}

impl Transport<SerialStream> {
    /// Open a serial port, 8N1.
    pub fn open(
        path: impl Into<String>,
        baud_rate: u32,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Self, GripperError> {
        let port = tokio_serial::new(path.into(), baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .timeout(timeout)
            .open_native_async()?;

        Ok(Self::new(port, timeout, max_retries))
    }
}

impl<S> Transport<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an open byte stream. `timeout` bounds the wait for each response,
    /// `max_retries` counts attempts after the first.
    pub fn new(stream: S, timeout: Duration, max_retries: u32) -> Self {
        Self {
            stream,
            timeout,
            max_retries,
            rx: Vec::with_capacity(64),
            stale: false,
        }
    }

    /// Send `request` and wait for its status response.
    ///
    /// Timeouts and corrupted responses are retried up to `max_retries` times
    /// before the last [`CommError`] is surfaced. A device-reported status
    /// error is returned immediately. Broadcast requests return `None`.
    pub async fn transact(&mut self, request: &Frame) -> Result<Option<StatusPacket>, GripperError> {
        let bytes = request.encode()?;
        let mut attempt = 0;
        loop {
            match self.attempt(request, &bytes).await {
                Err(err) if err.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        address = request.address,
                        instruction = ?request.instruction,
                        attempt,
                        error = %err,
                        "bus transaction failed, retrying"
                    );
                }
                result => return result,
            }
        }
    }

    async fn attempt(
        &mut self,
        request: &Frame,
        bytes: &[u8],
    ) -> Result<Option<StatusPacket>, GripperError> {
        // anything still buffered belongs to an abandoned transaction
        self.rx.clear();
        if self.stale {
            self.discard_late_input().await?;
        }
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        if !request.expects_response() {
            return Ok(None);
        }

        let frame = match tokio::time::timeout(self.timeout, self.read_frame(request.address)).await
        {
            Ok(frame) => frame?,
            Err(_) => {
                self.stale = true;
                return Err(CommError::Timeout.into());
            }
        };
        debug!(address = frame.address, len = frame.payload.len(), "status frame received");
        frame.into_status().map(Some)
    }

    /// Drop input until the line has been quiet for one response timeout.
    async fn discard_late_input(&mut self) -> Result<(), GripperError> {
        let mut chunk = [0u8; 64];
        let mut discarded = 0;
        while discarded < 4 * MAX_LENGTH {
            match tokio::time::timeout(self.timeout, self.stream.read(&mut chunk)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => discarded += n,
                Ok(Err(err)) => return Err(err.into()),
            }
        }
        if discarded > 0 {
            debug!(discarded, "late response bytes discarded");
        }
        self.stale = false;
        Ok(())
    }

    /// Read until one complete frame from `address` has been received.
    async fn read_frame(&mut self, address: u8) -> Result<Frame, GripperError> {
        let mut chunk = [0u8; 64];
        loop {
            match protocol::find_marker(&self.rx) {
                Some(start) => {
                    self.rx.drain(..start);
                }
                None => {
                    // keep a possible partial marker at the tail
                    let cut = self.rx.len().saturating_sub(MARKER.len() - 1);
                    self.rx.drain(..cut);
                }
            }

            if self.rx.len() >= HEADER_LEN && self.rx[..MARKER.len()] == MARKER {
                let length = u16::from_le_bytes([self.rx[5], self.rx[6]]) as usize;
                if !(3..=MAX_LENGTH).contains(&length) {
                    self.rx.drain(..MARKER.len());
                    return Err(CommError::Framing(format!("implausible length {length}")).into());
                }
                let total = HEADER_LEN + length;
                if self.rx.len() >= total {
                    let bytes: Vec<u8> = self.rx.drain(..total).collect();
                    return Ok(protocol::decode_from(&bytes, address)?);
                }
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                return Err(std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into());
            }
            self.rx.extend_from_slice(&chunk[..n]);
        }
    }
}
