//! Host side of the flash bootloader protocol: the command engine, the
//! transport contract it runs on and a serial transport.

pub mod commands;
pub mod config;
pub mod error;
pub mod serial;
pub mod transport;

#[cfg(test)]
mod mock;

pub use commands::FblCommands;
pub use config::{EngineConfig, SerialConfig, ToolConfig};
pub use error::{Error, Result};
pub use serial::SerialTransport;
pub use transport::{TpError, Transport};
