//! Byte channel the command engine runs on.
//!
//! A transport moves raw bytes; it knows nothing about frames. Every read is
//! bounded by a timeout and can be aborted through a [`CancellationToken`].

use std::future::Future;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Transport level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TpError {
    #[error("interface not connected")]
    NotConnected,
    #[error("communication timeout")]
    Timeout,
    #[error("device error")]
    DeviceError,
    #[error("rx data too short, expected {expected} bytes, received {received}")]
    InvalidLength { expected: usize, received: usize },
    #[error("missing rx frames")]
    InvalidMsgCounter,
    #[error("wait cancelled")]
    Cancelled,
}

/// Byte channel to the bootloader (serial line, CAN adapter, ...)
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Open the channel. Returns true when the channel is usable.
    async fn connect(&mut self) -> bool;

    async fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Read exactly `count` bytes, waiting at most `timeout`
    async fn read(
        &mut self,
        count: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>, TpError>;

    async fn write(&mut self, data: &[u8]) -> Result<(), TpError>;

    /// Write a request and read its response as one exchange.
    ///
    /// The outer error reports a failed write, the inner result is the read.
    async fn query(
        &mut self,
        request: &[u8],
        response_len: usize,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Result<Vec<u8>, TpError>, TpError> {
        self.write(request).await?;
        Ok(self.read(response_len, timeout, cancel).await)
    }

    /// Bytes the device sent outside of a request/response turn
    fn subscribe_unsolicited(&self) -> broadcast::Receiver<Vec<u8>>;
}

/// Run `fut` until it completes, `timeout` elapses or `cancel` fires
pub async fn bounded<T, F>(timeout: Duration, cancel: &CancellationToken, fut: F) -> Result<T, TpError>
where
    F: Future<Output = Result<T, TpError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TpError::Cancelled),
        res = tokio::time::timeout(timeout, fut) => res.unwrap_or(Err(TpError::Timeout)),
    }
}
