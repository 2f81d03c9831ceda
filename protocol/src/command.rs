use crate::{
    decode_frame, encode_frame, CommandKind, FrameKind, ProtocolError, ResponseCode, Result,
    COMMAND_HEADER_LEN, MAX_PARAMETERS,
};

/// Command payload carried inside a [`FrameKind::Command`] frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Command tag
    pub kind: CommandKind,
    /// Set when raw data follows the command
    pub has_data_phase: bool,
    /// Little-endian parameter words, at most [`MAX_PARAMETERS`]
    pub parameters: Vec<u32>,
}

impl Command {
    /// Create a command without a data phase
    pub fn new(kind: CommandKind, parameters: Vec<u32>) -> Self {
        Self {
            kind,
            has_data_phase: false,
            parameters,
        }
    }

    /// Create a command followed by a raw data phase
    pub fn with_data_phase(kind: CommandKind, parameters: Vec<u32>) -> Self {
        Self {
            kind,
            has_data_phase: true,
            parameters,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.parameters.len()
    }

    /// Serialize the command payload (header plus parameters, no framing)
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        let count = self.parameters.len();
        if count > MAX_PARAMETERS {
            return Err(ProtocolError::TooManyParameters(count));
        }

        let mut bytes = Vec::with_capacity(COMMAND_HEADER_LEN + 4 * count);
        bytes.push(self.kind as u8);
        bytes.push(self.has_data_phase as u8);
        bytes.push(0);
        bytes.push(count as u8);
        for parameter in &self.parameters {
            bytes.extend_from_slice(&parameter.to_le_bytes());
        }
        Ok(bytes)
    }

    /// Parse a command payload (the bytes after the frame header)
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < COMMAND_HEADER_LEN {
            return Err(ProtocolError::MalformedFrame("Command payload too short"));
        }

        let kind = CommandKind::try_from(payload[0])?;
        let has_data_phase = payload[1] == 1;
        let count = payload[3] as usize;
        if count > MAX_PARAMETERS {
            return Err(ProtocolError::MalformedFrame("Too many parameters"));
        }

        let words = &payload[COMMAND_HEADER_LEN..];
        if words.len() != 4 * count {
            return Err(ProtocolError::MalformedFrame("Parameter count mismatch"));
        }

        let parameters = words
            .chunks_exact(4)
            .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
            .collect();

        Ok(Self {
            kind,
            has_data_phase,
            parameters,
        })
    }
}

/// Serialize a command and wrap it into a command frame
pub fn encode_command(command: &Command) -> Result<Vec<u8>> {
    let payload = command.to_payload()?;
    encode_frame(FrameKind::Command, Some(&payload[..]))
}

/// Parse a command frame
pub fn decode_command(bytes: &[u8]) -> Result<Command> {
    let frame = decode_frame(bytes)?;
    if frame.kind != FrameKind::Command {
        return Err(ProtocolError::MalformedFrame("Not a command frame"));
    }
    Command::from_payload(frame.payload)
}

/// Parse a generic response into its status and the echoed command tag
pub fn decode_generic_response(bytes: &[u8]) -> Result<(ResponseCode, u32)> {
    let command = decode_command(bytes)?;
    match (command.kind, command.parameters.as_slice()) {
        (CommandKind::ResponseGeneric, &[status, tag]) => Ok((ResponseCode::from(status), tag)),
        (kind, parameters) => Err(ProtocolError::UnexpectedResponseShape {
            kind,
            parameters: parameters.len(),
        }),
    }
}

/// Parse a GetProperty response into its status and the first property word
pub fn decode_property_response(bytes: &[u8]) -> Result<(ResponseCode, u32)> {
    let command = decode_command(bytes)?;
    match (command.kind, command.parameters.as_slice()) {
        (CommandKind::GetPropertyResponse, &[status, value, ..]) => {
            Ok((ResponseCode::from(status), value))
        }
        (kind, parameters) => Err(ProtocolError::UnexpectedResponseShape {
            kind,
            parameters: parameters.len(),
        }),
    }
}
