//! Wire codec for the Kinetis-style flash bootloader (FBL) protocol.
//!
//! The crate is pure: it builds and parses byte buffers and never touches a
//! transport. Framing lives in [`frame`], command payloads in [`command`] and
//! the CRC in [`crc16`].

use core::fmt;
use core::str::FromStr;

pub mod command;
pub mod crc16;
pub mod frame;

pub use command::{
    decode_command, decode_generic_response, decode_property_response, encode_command, Command,
};
pub use crc16::crc16;
pub use frame::{decode_ack, decode_bare, decode_frame, decode_ping_response, encode_frame, Frame};

/// Start byte of every frame
pub const START_BYTE: u8 = 0x5A;

/// Length of a framing header carrying a payload (marker, kind, length, crc)
pub const FRAME_HEADER_LEN: usize = 6;

/// Length of a bare Ack / Nak frame
pub const ACK_LEN: usize = 2;

/// Fixed length of the ping response, which has no length field
pub const PING_RESPONSE_LEN: usize = 10;

/// Length of a command header (kind, flags, reserved, parameter count)
pub const COMMAND_HEADER_LEN: usize = 4;

/// Maximum number of parameters a command can carry
pub const MAX_PARAMETERS: usize = 7;

/// Frame header + command header + two parameters
pub const GENERIC_RESPONSE_LEN: usize = FRAME_HEADER_LEN + COMMAND_HEADER_LEN + 2 * 4;

/// Property responses for single-word properties have the same size as a generic response
pub const PROPERTY_RESPONSE_LEN: usize = GENERIC_RESPONSE_LEN;

/// Errors raised while building or parsing frames
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("unknown frame kind 0x{0:02X}")]
    UnknownFrameKind(u8),
    #[error("unknown command kind 0x{0:02X}")]
    UnknownCommandKind(u8),
    #[error("command carries {0} parameters, at most 7 are allowed")]
    TooManyParameters(usize),
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
    #[error("unexpected response {kind:?} with {parameters} parameters")]
    UnexpectedResponseShape { kind: CommandKind, parameters: usize },
}

pub type Result<T> = core::result::Result<T, ProtocolError>;

/// Frame types (the byte following the start marker)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Previous frame received and accepted
    Ack = 0xA1,
    /// Previous frame corrupt, resend it
    Nak = 0xA2,
    /// Data phase aborted by the receiver
    AckAbort = 0xA3,
    /// Command or response payload follows
    Command = 0xA4,
    /// Data phase payload follows
    Data = 0xA5,
    /// Bootloader presence query
    Ping = 0xA6,
    /// Reply to [`FrameKind::Ping`]
    PingResponse = 0xA7,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0xA1 => Ok(Self::Ack),
            0xA2 => Ok(Self::Nak),
            0xA3 => Ok(Self::AckAbort),
            0xA4 => Ok(Self::Command),
            0xA5 => Ok(Self::Data),
            0xA6 => Ok(Self::Ping),
            0xA7 => Ok(Self::PingResponse),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// Command tags carried in the first byte of a command payload.
///
/// Each logical operation owns one tag; the value is sent verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CommandKind {
    FlashEraseAll = 0x01,
    FlashEraseRegion = 0x02,
    ReadMemory = 0x03,
    WriteMemory = 0x04,
    FlashSecurityDisable = 0x06,
    GetProperty = 0x07,
    Execute = 0x09,
    Reset = 0x0B,
    SetProperty = 0x0C,
    FlashEraseAllUnsecure = 0x0D,
    /// Status reply to any command
    ResponseGeneric = 0xA0,
    ReadMemoryResponse = 0xA3,
    GetPropertyResponse = 0xA7,
}

impl TryFrom<u8> for CommandKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::FlashEraseAll),
            0x02 => Ok(Self::FlashEraseRegion),
            0x03 => Ok(Self::ReadMemory),
            0x04 => Ok(Self::WriteMemory),
            0x06 => Ok(Self::FlashSecurityDisable),
            0x07 => Ok(Self::GetProperty),
            0x09 => Ok(Self::Execute),
            0x0B => Ok(Self::Reset),
            0x0C => Ok(Self::SetProperty),
            0x0D => Ok(Self::FlashEraseAllUnsecure),
            0xA0 => Ok(Self::ResponseGeneric),
            0xA3 => Ok(Self::ReadMemoryResponse),
            0xA7 => Ok(Self::GetPropertyResponse),
            other => Err(ProtocolError::UnknownCommandKind(other)),
        }
    }
}

/// Status codes reported by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseCode {
    Success,
    Fail,
    ReadOnly,
    OutOfRange,
    InvalidArgument,
    Timeout,
    NoTransferInProgress,
    FlashAlignmentError,
    FlashAccessError,
    FlashProtectionViolation,
    FlashCommandFailure,
    UnknownCommand,
    SecurityViolation,
    AbortDataPhase,
    PingError,
    NoResponse,
    NoResponseExpected,
    MemoryRangeInvalid,
    MemoryReadFailed,
    MemoryWriteFailed,
    UnknownProperty,
    ReadOnlyProperty,
    InvalidPropertyValue,
    AppCrcCheckPassed,
    AppCrcCheckFailed,
    AppCrcCheckInactive,
    AppCrcCheckInvalid,
    AppCrcCheckOutOfRange,
    /// Status word without a known meaning
    Unknown(u32),
}

impl ResponseCode {
    /// Status word as sent on the wire
    pub fn code(self) -> u32 {
        match self {
            Self::Success => 0,
            Self::Fail => 1,
            Self::ReadOnly => 2,
            Self::OutOfRange => 3,
            Self::InvalidArgument => 4,
            Self::Timeout => 5,
            Self::NoTransferInProgress => 6,
            Self::FlashAlignmentError => 101,
            Self::FlashAccessError => 103,
            Self::FlashProtectionViolation => 104,
            Self::FlashCommandFailure => 105,
            Self::UnknownCommand => 10000,
            Self::SecurityViolation => 10001,
            Self::AbortDataPhase => 10002,
            Self::PingError => 10003,
            Self::NoResponse => 10004,
            Self::NoResponseExpected => 10005,
            Self::MemoryRangeInvalid => 10200,
            Self::MemoryReadFailed => 10201,
            Self::MemoryWriteFailed => 10202,
            Self::UnknownProperty => 10300,
            Self::ReadOnlyProperty => 10301,
            Self::InvalidPropertyValue => 10302,
            Self::AppCrcCheckPassed => 10400,
            Self::AppCrcCheckFailed => 10401,
            Self::AppCrcCheckInactive => 10402,
            Self::AppCrcCheckInvalid => 10403,
            Self::AppCrcCheckOutOfRange => 10404,
            Self::Unknown(code) => code,
        }
    }

    /// Statuses after which the host sends a Nak and repeats the command
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Fail | Self::Timeout | Self::AppCrcCheckOutOfRange)
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl From<u32> for ResponseCode {
    fn from(code: u32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Fail,
            2 => Self::ReadOnly,
            3 => Self::OutOfRange,
            4 => Self::InvalidArgument,
            5 => Self::Timeout,
            6 => Self::NoTransferInProgress,
            101 => Self::FlashAlignmentError,
            103 => Self::FlashAccessError,
            104 => Self::FlashProtectionViolation,
            105 => Self::FlashCommandFailure,
            10000 => Self::UnknownCommand,
            10001 => Self::SecurityViolation,
            10002 => Self::AbortDataPhase,
            10003 => Self::PingError,
            10004 => Self::NoResponse,
            10005 => Self::NoResponseExpected,
            10200 => Self::MemoryRangeInvalid,
            10201 => Self::MemoryReadFailed,
            10202 => Self::MemoryWriteFailed,
            10300 => Self::UnknownProperty,
            10301 => Self::ReadOnlyProperty,
            10302 => Self::InvalidPropertyValue,
            10400 => Self::AppCrcCheckPassed,
            10401 => Self::AppCrcCheckFailed,
            10402 => Self::AppCrcCheckInactive,
            10403 => Self::AppCrcCheckInvalid,
            10404 => Self::AppCrcCheckOutOfRange,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown({})", code),
            other => write!(f, "{:?} ({})", other, other.code()),
        }
    }
}

/// Device properties readable with GetProperty and writable with SetProperty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyTag {
    CurrentVersion = 0x01,
    AvailablePeripherals = 0x02,
    FlashStartAddress = 0x03,
    FlashSizeInBytes = 0x04,
    FlashSectorSize = 0x05,
    FlashBlockCount = 0x06,
    AvailableCommands = 0x07,
    /// Read back every flash write
    VerifyWrites = 0x0A,
    MaxPacketSize = 0x0B,
    ReservedRegions = 0x0C,
    ValidateRegions = 0x0D,
    RamStartAddress = 0x0E,
    RamSizeInBytes = 0x0F,
    SystemDeviceId = 0x10,
    FlashSecurityState = 0x11,
    UniqueDeviceId = 0x12,
    FacSupport = 0x13,
    FlashAccessSegmentSize = 0x14,
    FlashAccessSegmentCount = 0x15,
}

impl PropertyTag {
    pub const ALL: [PropertyTag; 19] = [
        Self::CurrentVersion,
        Self::AvailablePeripherals,
        Self::FlashStartAddress,
        Self::FlashSizeInBytes,
        Self::FlashSectorSize,
        Self::FlashBlockCount,
        Self::AvailableCommands,
        Self::VerifyWrites,
        Self::MaxPacketSize,
        Self::ReservedRegions,
        Self::ValidateRegions,
        Self::RamStartAddress,
        Self::RamSizeInBytes,
        Self::SystemDeviceId,
        Self::FlashSecurityState,
        Self::UniqueDeviceId,
        Self::FacSupport,
        Self::FlashAccessSegmentSize,
        Self::FlashAccessSegmentCount,
    ];
}

impl TryFrom<u32> for PropertyTag {
    type Error = u32;

    fn try_from(value: u32) -> core::result::Result<Self, u32> {
        Self::ALL
            .iter()
            .copied()
            .find(|tag| *tag as u32 == value)
            .ok_or(value)
    }
}

/// A property tag with its value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertyValue {
    pub tag: PropertyTag,
    pub value: u32,
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} = 0x{:08X} ({})", self.tag, self.value, self.value)
    }
}

/// Bootloader version reported in the ping response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FirmwareVersion {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    pub fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for FirmwareVersion {
    type Err = &'static str;

    fn from_str(s: &str) -> core::result::Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = || -> core::result::Result<u8, &'static str> {
            parts
                .next()
                .ok_or("Missing version component")?
                .parse()
                .map_err(|_| "Invalid version component")
        };
        let version = Self::new(next()?, next()?, next()?);
        if parts.next().is_some() {
            return Err("Too many version components");
        }
        Ok(version)
    }
}
