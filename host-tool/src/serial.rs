use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialStream, StopBits,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::SerialConfig;
use crate::transport::{TpError, Transport};

/// How long to wait for bytes reported as pending before a request goes out
const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// Serial line transport.
///
/// Clones share the port; every read, write and query holds the port lock
/// for its whole duration, so exchanges from different handles never interleave.
#[derive(Clone)]
pub struct SerialTransport {
    config: SerialConfig,
    port: Arc<Mutex<Option<SerialStream>>>,
    unsolicited: broadcast::Sender<Vec<u8>>,
}

impl SerialTransport {
    pub fn new(config: SerialConfig) -> Self {
        let (unsolicited, _) = broadcast::channel(16);
        Self {
            config,
            port: Arc::new(Mutex::new(None)),
            unsolicited,
        }
    }

    /// Names of the serial ports present on this machine
    pub fn available_ports() -> Vec<String> {
        tokio_serial::available_ports()
            .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
            .unwrap_or_default()
    }

    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    /// Wait for the port until `deadline` or until `cancel` fires
    async fn lock(
        &self,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, Option<SerialStream>>, TpError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(TpError::Cancelled),
            guard = tokio::time::timeout_at(deadline, self.port.lock()) => {
                guard.map_err(|_| {
                    warn!(port = %self.config.port, "Port busy");
                    TpError::Timeout
                })
            }
        }
    }

    fn open(&self) -> tokio_serial::Result<SerialStream> {
        let builder = tokio_serial::new(self.config.port.as_str(), self.config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None);
        let port = SerialStream::open(&builder)?;
        port.clear(ClearBuffer::All)?;
        Ok(port)
    }
}

impl Transport for SerialTransport {
    async fn connect(&mut self) -> bool {
        let mut port = self.port.lock().await;
        if port.is_some() {
            return true;
        }

        match self.open() {
            Ok(stream) => {
                info!(port = %self.config.port, baud = self.config.baud_rate, "Serial port opened");
                *port = Some(stream);
                true
            }
            Err(e) => {
                error!(port = %self.config.port, error = %e, "Invalid port, doesn't exist or busy");
                false
            }
        }
    }

    async fn disconnect(&mut self) {
        if self.port.lock().await.take().is_some() {
            info!(port = %self.config.port, "Serial port closed");
        }
    }

    fn is_connected(&self) -> bool {
        // a held lock means an exchange is running on an open port
        self.port.try_lock().map(|p| p.is_some()).unwrap_or(true)
    }

    async fn read(
        &mut self,
        count: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TpError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lock(deadline, cancel).await?;
        let port = guard.as_mut().ok_or(TpError::NotConnected)?;
        read_exact(port, count, deadline, cancel).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), TpError> {
        let mut guard = tokio::time::timeout(self.config.lock_timeout, self.port.lock())
            .await
            .map_err(|_| {
                warn!(port = %self.config.port, "Port busy");
                TpError::Timeout
            })?;
        let port = guard.as_mut().ok_or(TpError::NotConnected)?;
        drain_pending(port, &self.unsolicited).await;
        write_all(port, data).await
    }

    async fn query(
        &mut self,
        request: &[u8],
        response_len: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Result<Vec<u8>, TpError>, TpError> {
        // waiting for the port counts against the response timeout
        let deadline = Instant::now() + timeout;
        let mut guard = match self.lock(deadline, cancel).await {
            Ok(guard) => guard,
            Err(e) => return Ok(Err(e)),
        };
        let port = guard.as_mut().ok_or(TpError::NotConnected)?;
        drain_pending(port, &self.unsolicited).await;
        write_all(port, request).await?;
        Ok(read_exact(port, response_len, deadline, cancel).await)
    }

    fn subscribe_unsolicited(&self) -> broadcast::Receiver<Vec<u8>> {
        self.unsolicited.subscribe()
    }
}

async fn write_all(port: &mut SerialStream, data: &[u8]) -> Result<(), TpError> {
    trace!(tx = %hex::encode(data), "Serial write");
    port.write_all(data).await.map_err(|e| {
        error!(error = %e, "Failed to write to serial port");
        TpError::DeviceError
    })?;
    port.flush().await.map_err(|e| {
        error!(error = %e, "Failed to flush serial port");
        TpError::DeviceError
    })
}

async fn read_exact(
    port: &mut SerialStream,
    count: usize,
    deadline: Instant,
    cancel: &CancellationToken,
) -> Result<Vec<u8>, TpError> {
    let mut buffer = vec![0u8; count];
    let mut filled = 0;

    while filled < count {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TpError::Cancelled),
            read = tokio::time::timeout_at(deadline, port.read(&mut buffer[filled..])) => read,
        };

        match read {
            Ok(Ok(0)) => {
                error!("Serial port closed by peer");
                return Err(TpError::DeviceError);
            }
            Ok(Ok(n)) => filled += n,
            Ok(Err(e)) => {
                error!(error = %e, "Serial read error");
                return Err(TpError::DeviceError);
            }
            Err(_) if filled == 0 => return Err(TpError::Timeout),
            Err(_) => {
                warn!(
                    expected = count,
                    received = filled,
                    data = %hex::encode(&buffer[..filled]),
                    "Rx data too short"
                );
                return Err(TpError::InvalidLength {
                    expected: count,
                    received: filled,
                });
            }
        }
    }

    trace!(rx = %hex::encode(&buffer), "Serial read");
    Ok(buffer)
}

/// Hand bytes that arrived outside of an exchange to the unsolicited channel
async fn drain_pending(port: &mut SerialStream, sink: &broadcast::Sender<Vec<u8>>) {
    let pending = match port.bytes_to_read() {
        Ok(n) if n > 0 => n as usize,
        _ => return,
    };

    let mut buffer = vec![0u8; pending];
    match tokio::time::timeout(DRAIN_TIMEOUT, port.read_exact(&mut buffer)).await {
        Ok(Ok(_)) => {
            debug!(data = %hex::encode(&buffer), "Unsolicited device data");
            // nobody listening is fine
            let _ = sink.send(buffer);
        }
        _ => warn!(pending, "Failed to drain pending input"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport() -> SerialTransport {
        SerialTransport::new(SerialConfig {
            port: "/dev/null-fbl".to_string(),
            baud_rate: 115200,
            lock_timeout: Duration::from_secs(2),
        })
    }

    #[tokio::test]
    async fn test_closed_port() {
        let mut serial = transport();
        let cancel = CancellationToken::new();
        assert!(!serial.is_connected());
        assert_eq!(serial.write(&[0x5A, 0xA6]).await, Err(TpError::NotConnected));
        assert_eq!(
            serial.read(2, Duration::from_millis(100), &cancel).await,
            Err(TpError::NotConnected)
        );
        assert_eq!(
            serial
                .query(&[0x5A, 0xA6], 10, Duration::from_millis(100), &cancel)
                .await,
            Err(TpError::NotConnected)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_port_times_out() {
        let mut serial = transport();
        let other = serial.clone();
        let _held = other.port.lock().await;
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let res = serial
            .query(&[0x5A, 0xA6], 10, Duration::from_millis(500), &cancel)
            .await;
        assert_eq!(res, Ok(Err(TpError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert_eq!(serial.write(&[0x5A, 0xA1]).await, Err(TpError::Timeout));
        assert_eq!(
            serial.read(2, Duration::from_millis(500), &cancel).await,
            Err(TpError::Timeout)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_port_wait_is_cancellable() {
        let mut serial = transport();
        let other = serial.clone();
        let _held = other.port.lock().await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let res = serial
            .query(&[0x5A, 0xA6], 10, Duration::from_secs(3600), &cancel)
            .await;
        assert_eq!(res, Ok(Err(TpError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
