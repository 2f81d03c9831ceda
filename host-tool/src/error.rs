use fbl_protocol::{ProtocolError, ResponseCode};

use crate::transport::TpError;

/// Failures that end a bootloader call.
///
/// Device statuses and per-attempt decode errors are not errors: they are
/// reported as a [`ResponseCode`] in the `Ok` arm.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(TpError),
    #[error("transport not connected")]
    NotConnected,
    #[error("operation cancelled")]
    Cancelled,
    #[error("bootloader did not answer ping ({0})")]
    NoBootloader(ResponseCode),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<TpError> for Error {
    fn from(e: TpError) -> Self {
        match e {
            TpError::NotConnected => Self::NotConnected,
            TpError::Cancelled => Self::Cancelled,
            other => Self::Transport(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
