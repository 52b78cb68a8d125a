/// A malformed response frame. The poll cycle is skipped, no retry is attempted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("missing start of frame")]
    MissingStart,
    #[error("missing end of frame")]
    MissingEnd,
    #[error("frame exceeds {0} bytes")]
    Oversize(usize),
    #[error("invalid hex character 0x{0:02X}")]
    InvalidHex(u8),
    #[error("checksum mismatch - calculated={calculated:#06X} received={received:#06X}")]
    Checksum { calculated: u16, received: u16 },
    #[error("truncated frame - declared={declared} received={received}")]
    Truncated { declared: usize, received: usize },
    #[error("address mismatch - expected={expected:#04X} received={received:#04X}")]
    AddressMismatch { expected: u8, received: u8 },
    #[error("command mismatch - expected={expected:#04X} received={received:#04X}")]
    CommandMismatch { expected: u8, received: u8 },
    #[error("protocol version mismatch - expected={expected:#04X} received={received:#04X}")]
    VersionMismatch { expected: u8, received: u8 },
    #[error("device reported error code {0:#04X}")]
    ErrorResponse(u8),
}

/// A response payload whose shape does not fit the field table of its protocol version.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DecodeError {
    #[error("payload too short - expected={expected} received={received}")]
    Length { expected: usize, received: usize },
    #[error("cell count {0} out of range")]
    CellCount(usize),
    #[error("temperature sensor count {0} out of range")]
    TemperatureCount(usize),
    #[error("value {value} of {channel} does not fit its register")]
    OutOfRange {
        channel: crate::telemetry::Channel,
        value: f32,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("no response within timeout")]
    Timeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("address {0:#04X} is already used on this bus")]
    DuplicateAddress(u8),
    #[error("unsupported protocol version {0:#04X}")]
    UnsupportedProtocolVersion(u8),
    #[error("no device at index {0}")]
    UnknownDevice(usize),
    #[error("unknown channel name '{0}'")]
    UnknownChannel(String),
}
