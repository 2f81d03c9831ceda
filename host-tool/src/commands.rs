//! Bootloader command engine.
//!
//! Every command runs the same exchange: the host writes a command frame, the
//! device acknowledges it with an Ack frame, then answers with a generic
//! response which the host acknowledges in turn. A response reporting
//! `Fail`, `Timeout` or `AppCrcCheckOutOfRange` is answered with a Nak and the
//! whole exchange is repeated, up to `max_attempts` times.

use std::time::Duration;

use fbl_protocol::{
    decode_ack, decode_bare, decode_generic_response, decode_ping_response,
    decode_property_response, encode_command, encode_frame, Command, CommandKind, FirmwareVersion,
    FrameKind, PropertyTag, ProtocolError, ResponseCode, ACK_LEN, GENERIC_RESPONSE_LEN,
    PING_RESPONSE_LEN, PROPERTY_RESPONSE_LEN,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::transport::{TpError, Transport};

/// Result of one send cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    /// The device answered with a final status; acknowledge and stop
    Completed(ResponseCode),
    /// Answer with a Nak and send the command again
    Retryable(ResponseCode),
    /// No usable answer to the command itself; stop without acknowledging
    Terminal(ResponseCode),
}

/// Command engine for one bootloader connection.
///
/// All operations take `&mut self`, so at most one command is in flight.
pub struct FblCommands<T> {
    transport: T,
    config: EngineConfig,
    cancel: CancellationToken,
    version: Option<FirmwareVersion>,
    options: Option<u16>,
}

impl<T: Transport> FblCommands<T> {
    pub fn new(transport: T, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            cancel: CancellationToken::new(),
            version: None,
            options: None,
        }
    }

    /// Use `cancel` to abort pending reads
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token aborting the reads of this engine
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Bootloader version seen by the last successful ping
    pub fn firmware_version(&self) -> Option<FirmwareVersion> {
        self.version
    }

    /// Capability options seen by the last successful ping
    pub fn options(&self) -> Option<u16> {
        self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Open the transport and ping the bootloader
    pub async fn connect(&mut self) -> Result<FirmwareVersion> {
        if !self.transport.connect().await {
            error!("Cannot open the transport");
            return Err(Error::NotConnected);
        }

        match (self.ping().await?, self.version) {
            (ResponseCode::Success, Some(version)) => {
                info!(%version, options = ?self.options, "Connection successful");
                Ok(version)
            }
            (status, _) => {
                error!(%status, "Cannot connect to the target");
                Err(Error::NoBootloader(status))
            }
        }
    }

    /// Query the bootloader version and options.
    ///
    /// Ping does not use the Ack/response exchange: the bare ping frame is
    /// answered by a fixed ten byte ping response.
    pub async fn ping(&mut self) -> Result<ResponseCode> {
        let request = encode_frame(FrameKind::Ping, None)?;
        debug!(request = %hex::encode(&request), "Ping");

        let response = self
            .transport
            .query(&request, PING_RESPONSE_LEN, self.config.ping_timeout, &self.cancel)
            .await?;

        let bytes = match response {
            Ok(bytes) => bytes,
            Err(TpError::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                warn!(error = %e, "No ping response");
                return Ok(ResponseCode::Timeout);
            }
        };

        match decode_ping_response(&bytes) {
            Ok((version, options)) => {
                debug!(%version, options, "Ping response");
                self.version = Some(version);
                self.options = Some(options);
                Ok(ResponseCode::Success)
            }
            Err(e) => {
                warn!(error = %e, response = %hex::encode(&bytes), "Invalid ping response");
                Ok(ResponseCode::Timeout)
            }
        }
    }

    pub async fn flash_erase_all(&mut self, memory_id: u32) -> Result<ResponseCode> {
        self.command_no_data(Command::new(CommandKind::FlashEraseAll, vec![memory_id]))
            .await
    }

    pub async fn flash_erase_region(
        &mut self,
        start_address: u32,
        byte_count: u32,
        memory_id: u32,
    ) -> Result<ResponseCode> {
        self.command_no_data(Command::new(
            CommandKind::FlashEraseRegion,
            vec![start_address, byte_count, memory_id],
        ))
        .await
    }

    /// Unlock flash security with the 64-bit backdoor key
    pub async fn flash_security_disable(&mut self, key: u64) -> Result<ResponseCode> {
        self.command_no_data(Command::new(
            CommandKind::FlashSecurityDisable,
            vec![(key & 0xFFFF_FFFF) as u32, (key >> 32) as u32],
        ))
        .await
    }

    pub async fn flash_erase_all_unsecure(&mut self) -> Result<ResponseCode> {
        self.command_no_data(Command::new(CommandKind::FlashEraseAllUnsecure, vec![]))
            .await
    }

    /// Jump to `jump_addr` with `arg`, using the stack pointer at `stack_ptr_addr`
    pub async fn execute(
        &mut self,
        jump_addr: u32,
        arg: u32,
        stack_ptr_addr: u32,
    ) -> Result<ResponseCode> {
        self.command_no_data(Command::new(
            CommandKind::Execute,
            vec![jump_addr, arg, stack_ptr_addr],
        ))
        .await
    }

    pub async fn reset(&mut self) -> Result<ResponseCode> {
        self.command_no_data(Command::new(CommandKind::Reset, vec![]))
            .await
    }

    /// Read a property.
    ///
    /// Reads are idempotent and never repeated: any failure is returned as the
    /// status with a zero value.
    pub async fn get_property(&mut self, tag: PropertyTag) -> Result<(ResponseCode, u32)> {
        let request = encode_command(&Command::new(CommandKind::GetProperty, vec![tag as u32]))?;
        debug!(?tag, request = %hex::encode(&request), "GetProperty");

        let ack = self
            .transport
            .query(&request, ACK_LEN, self.config.ack_timeout, &self.cancel)
            .await?;
        if let Some(status) = ack_failure(ack)? {
            return Ok((status, 0));
        }

        let bytes = match self
            .transport
            .read(PROPERTY_RESPONSE_LEN, self.config.command_timeout, &self.cancel)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => return Ok((read_failure(e)?, 0)),
        };

        match decode_property_response(&bytes) {
            Ok((status, value)) => {
                self.send_ack().await?;
                debug!(?tag, %status, value, "GetProperty response");
                Ok((status, value))
            }
            Err(e) => {
                warn!(error = %e, response = %hex::encode(&bytes), "Invalid property response");
                Ok((ResponseCode::Fail, 0))
            }
        }
    }

    /// Write a property and read it back.
    ///
    /// A readback that differs from `value` turns the result into `Fail` even
    /// when the write itself was acknowledged.
    pub async fn set_property(&mut self, tag: PropertyTag, value: u32) -> Result<ResponseCode> {
        let status = self
            .command_no_data(Command::new(
                CommandKind::SetProperty,
                vec![tag as u32, value],
            ))
            .await?;
        if !status.is_success() {
            return Ok(status);
        }

        let (readback_status, readback) = self.get_property(tag).await?;
        if !readback_status.is_success() || readback != value {
            error!(
                ?tag,
                requested = value,
                readback,
                status = %readback_status,
                "Property verification mismatch"
            );
            return Ok(ResponseCode::Fail);
        }

        Ok(ResponseCode::Success)
    }

    /// Read `byte_count` bytes of memory starting at `start_address`.
    ///
    /// On a short read the status is `Fail` and the data holds what arrived.
    pub async fn read_memory(
        &mut self,
        start_address: u32,
        byte_count: u32,
    ) -> Result<(ResponseCode, Vec<u8>)> {
        let command = Command::with_data_phase(
            CommandKind::ReadMemory,
            vec![start_address, byte_count],
        );
        let status = self.command_no_data(command).await?;
        if !status.is_success() {
            return Ok((status, Vec::new()));
        }

        let total = byte_count as usize;
        let chunk_size = self.config.data_chunk_size.max(1);
        let mut data = Vec::with_capacity(total);

        while data.len() < total {
            let chunk = chunk_size.min(total - data.len());
            match self
                .transport
                .read(chunk, self.config.command_timeout, &self.cancel)
                .await
            {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(e) => {
                    read_failure(e)?;
                    warn!(
                        address = format_args!("0x{:08X}", start_address),
                        expected = total,
                        received = data.len(),
                        error = %e,
                        "Short read in data phase"
                    );
                    return Ok((ResponseCode::Fail, data));
                }
            }
        }

        let status = self
            .final_response(CommandKind::ReadMemory, self.config.command_timeout)
            .await?;
        Ok((status, data))
    }

    /// Write `data` to memory starting at `start_address`
    pub async fn write_memory(&mut self, start_address: u32, data: &[u8]) -> Result<ResponseCode> {
        let byte_count = u32::try_from(data.len())
            .map_err(|_| ProtocolError::PayloadTooLarge(data.len()))?;
        let command = Command::with_data_phase(
            CommandKind::WriteMemory,
            vec![start_address, byte_count],
        );
        let status = self.command_no_data(command).await?;
        if !status.is_success() {
            return Ok(status);
        }

        let chunk_size = self.config.data_chunk_size.max(1);
        for chunk in data.chunks(chunk_size) {
            self.transport.write(chunk).await?;
        }

        self.final_response(CommandKind::WriteMemory, self.config.erase_timeout)
            .await
    }

    /// Run the Ack/response exchange with bounded retries
    async fn command_no_data(&mut self, command: Command) -> Result<ResponseCode> {
        let request = encode_command(&command)?;
        let timeout = self.response_timeout(command.kind);
        let mut status = ResponseCode::Fail;

        for attempt in 1..=self.config.max_attempts {
            match self.attempt(&request, command.kind, timeout).await? {
                Outcome::Completed(code) => {
                    self.send_ack().await?;
                    return Ok(code);
                }
                Outcome::Retryable(code) => {
                    warn!(
                        kind = ?command.kind,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        status = %code,
                        "Command failed, sending Nak"
                    );
                    self.send_nak().await?;
                    status = code;
                }
                Outcome::Terminal(code) => return Ok(code),
            }
        }

        error!(kind = ?command.kind, %status, "Command failed after all attempts");
        Ok(status)
    }

    /// One send -> Ack -> response cycle
    async fn attempt(
        &mut self,
        request: &[u8],
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<Outcome> {
        debug!(?kind, request = %hex::encode(request), "Sending command");

        let ack = self
            .transport
            .query(request, ACK_LEN, self.config.ack_timeout, &self.cancel)
            .await?;
        if let Some(status) = ack_failure(ack)? {
            return Ok(Outcome::Terminal(status));
        }

        let status = self.read_generic_response(kind, timeout).await?;
        if status.is_retryable() {
            Ok(Outcome::Retryable(status))
        } else {
            Ok(Outcome::Completed(status))
        }
    }

    /// Read and check the generic response to a command of `kind`
    async fn read_generic_response(
        &mut self,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<ResponseCode> {
        let bytes = match self
            .transport
            .read(GENERIC_RESPONSE_LEN, timeout, &self.cancel)
            .await
        {
            Ok(bytes) => bytes,
            Err(e) => {
                let status = read_failure(e)?;
                warn!(?kind, error = %e, "No response");
                return Ok(status);
            }
        };

        match decode_generic_response(&bytes) {
            Ok((status, tag)) if tag == kind as u32 => {
                debug!(?kind, %status, "Generic response");
                Ok(status)
            }
            Ok((_, tag)) => {
                error!(
                    expected = ?kind,
                    received = format_args!("0x{:02X}", tag),
                    "Command tag mismatch"
                );
                Ok(ResponseCode::Fail)
            }
            Err(e) => {
                warn!(error = %e, response = %hex::encode(&bytes), "Invalid response");
                Ok(ResponseCode::Fail)
            }
        }
    }

    /// Response closing a data phase; read once and acknowledged, never repeated
    async fn final_response(&mut self, kind: CommandKind, timeout: Duration) -> Result<ResponseCode> {
        let status = self.read_generic_response(kind, timeout).await?;
        if status.is_retryable() {
            self.send_nak().await?;
        } else {
            self.send_ack().await?;
        }
        Ok(status)
    }

    fn response_timeout(&self, kind: CommandKind) -> Duration {
        match kind {
            CommandKind::FlashEraseAll
            | CommandKind::FlashEraseRegion
            | CommandKind::FlashEraseAllUnsecure
            | CommandKind::WriteMemory => self.config.erase_timeout,
            _ => self.config.command_timeout,
        }
    }

    async fn send_ack(&mut self) -> Result<()> {
        let frame = encode_frame(FrameKind::Ack, None)?;
        self.transport.write(&frame).await?;
        Ok(())
    }

    async fn send_nak(&mut self) -> Result<()> {
        let frame = encode_frame(FrameKind::Nak, None)?;
        self.transport.write(&frame).await?;
        Ok(())
    }
}

/// Status of a failed read; cancellation and a lost connection end the call
fn read_failure(e: TpError) -> Result<ResponseCode> {
    match e {
        TpError::Cancelled => Err(Error::Cancelled),
        TpError::NotConnected => Err(Error::NotConnected),
        TpError::Timeout => Ok(ResponseCode::Timeout),
        _ => Ok(ResponseCode::Fail),
    }
}

/// `None` when the device acknowledged the command, otherwise the status to report
fn ack_failure(ack: std::result::Result<Vec<u8>, TpError>) -> Result<Option<ResponseCode>> {
    match ack {
        Ok(bytes) if decode_ack(&bytes) => Ok(None),
        Ok(bytes) => {
            warn!(
                frame = ?decode_bare(&bytes),
                data = %hex::encode(&bytes),
                "Command not acknowledged"
            );
            Ok(Some(ResponseCode::Fail))
        }
        Err(e) => {
            let status = read_failure(e)?;
            warn!(error = %e, "No Ack");
            Ok(Some(status))
        }
    }
}
