use crate::telemetry::Channel;
use crate::Error;
use std::fmt;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// https://minimalmodbus.readthedocs.io/en/stable/serialcommunication.html#timing-of-the-serial-communications
// minimum delay 4ms by baud rate 9600
pub const MINIMUM_DELAY: Duration = Duration::from_millis(4);

pub const DEFAULT_RX_TIMEOUT: Duration = Duration::from_millis(150);

/// Maximum number of cell voltage slots any supported protocol version carries.
pub const MAX_CELLS: usize = 16;
/// Maximum number of temperature slots any supported protocol version carries.
pub const MAX_TEMPERATURES: usize = 6;

/// V2.0 device type, always sent as CID1.
pub const CID1_BATTERY: u8 = 0x46;
/// V2.0 analog value request (pack telemetry).
pub const CID2_TELEMETRY: u8 = 0x42;
/// V2.0 alarm information request.
pub const CID2_ALARM: u8 = 0x44;

/// Modbus read coils
pub const READ_COILS: u8 = 0x01;
/// Modbus read input registers
pub const READ_INPUT_REGISTERS: u8 = 0x04;

/// Wire dialect spoken by a device, identified by its protocol-version tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(try_from = "u8", into = "u8")
)]
pub enum ProtocolVersion {
    /// Seplos V2.0, ASCII hex framing with additive checksum.
    V20,
    /// Seplos V3.0, Modbus RTU framing with CRC-16.
    V30,
}

impl ProtocolVersion {
    pub const fn tag(self) -> u8 {
        match self {
            ProtocolVersion::V20 => 0x20,
            ProtocolVersion::V30 => 0x30,
        }
    }

    pub fn table(self) -> &'static FieldTable {
        match self {
            ProtocolVersion::V20 => &V20_TABLE,
            ProtocolVersion::V30 => &V30_TABLE,
        }
    }

    /// Requests whose payloads, concatenated in order, form the telemetry payload.
    pub fn telemetry_queries(self) -> &'static [Query] {
        match self {
            ProtocolVersion::V20 => &V20_TELEMETRY,
            ProtocolVersion::V30 => &V30_TELEMETRY,
        }
    }

    /// Requests whose payloads, concatenated in order, form the status payload.
    pub fn status_queries(self) -> &'static [Query] {
        match self {
            ProtocolVersion::V20 => &V20_STATUS,
            ProtocolVersion::V30 => &V30_STATUS,
        }
    }
}

impl TryFrom<u8> for ProtocolVersion {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x20 => Ok(ProtocolVersion::V20),
            0x30 => Ok(ProtocolVersion::V30),
            _ => Err(Error::UnsupportedProtocolVersion(value)),
        }
    }
}

impl From<ProtocolVersion> for u8 {
    fn from(version: ProtocolVersion) -> Self {
        version.tag()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04X}", self.tag())
    }
}

/// A single request issued during a poll cycle.
///
/// For V2.0 only `command` (CID2) is used. For V3.0 `command` is the Modbus
/// function code and `register`/`count` address the block to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Query {
    pub command: u8,
    pub register: u16,
    pub count: u16,
}

impl Query {
    pub const fn command(command: u8) -> Self {
        Self {
            command,
            register: 0,
            count: 0,
        }
    }

    pub const fn read(function: u8, register: u16, count: u16) -> Self {
        Self {
            command: function,
            register,
            count,
        }
    }

    /// Number of data bytes a Modbus read answers with, `None` for V2.0 commands.
    pub fn response_len(&self) -> Option<usize> {
        match self.command {
            READ_COILS => Some((self.count as usize).div_ceil(8)),
            READ_INPUT_REGISTERS => Some(self.count as usize * 2),
            _ => None,
        }
    }
}

const V20_TELEMETRY: [Query; 1] = [Query::command(CID2_TELEMETRY)];
const V20_STATUS: [Query; 1] = [Query::command(CID2_ALARM)];
// PIA: pack information A, PIB: cell voltages and temperatures
const V30_TELEMETRY: [Query; 2] = [
    Query::read(READ_INPUT_REGISTERS, 0x1000, 0x11),
    Query::read(READ_INPUT_REGISTERS, 0x1100, 0x1A),
];
// PIC: alarm and switch coils
const V30_STATUS: [Query; 1] = [Query::read(READ_COILS, 0x1200, 0x90)];

/// Layout constants of a protocol version's telemetry payload.
#[derive(Debug)]
pub struct FieldTable {
    pub version: ProtocolVersion,
    pub max_cells: usize,
    pub max_temperatures: usize,
    /// Raw value of 0 °C in 0.1 K
    pub temperature_offset: f32,
    /// Rated capacity and port voltage are part of the payload
    pub pack_extras: bool,
}

impl FieldTable {
    /// Whether this version can ever produce the channel.
    pub fn declares(&self, channel: Channel) -> bool {
        match channel {
            Channel::CellVoltage(n) => n >= 1 && n as usize <= self.max_cells,
            Channel::Temperature(n) => n >= 1 && n as usize <= self.max_temperatures,
            Channel::RatedCapacity | Channel::PortVoltage => self.pack_extras,
            _ => true,
        }
    }
}

static V20_TABLE: FieldTable = FieldTable {
    version: ProtocolVersion::V20,
    max_cells: MAX_CELLS,
    max_temperatures: MAX_TEMPERATURES,
    temperature_offset: 2731.0,
    pack_extras: true,
};

static V30_TABLE: FieldTable = FieldTable {
    version: ProtocolVersion::V30,
    max_cells: MAX_CELLS,
    max_temperatures: MAX_TEMPERATURES,
    temperature_offset: 2731.5,
    pack_extras: false,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tags() {
        assert_eq!(ProtocolVersion::try_from(0x20).unwrap(), ProtocolVersion::V20);
        assert_eq!(ProtocolVersion::try_from(0x30).unwrap(), ProtocolVersion::V30);
        assert!(matches!(
            ProtocolVersion::try_from(0x26),
            Err(Error::UnsupportedProtocolVersion(0x26))
        ));
        assert_eq!(u8::from(ProtocolVersion::V30), 0x30);
        assert_eq!(ProtocolVersion::V20.to_string(), "0x20");
    }

    #[test]
    fn modbus_response_sizes() {
        let sizes: Vec<_> = ProtocolVersion::V30
            .telemetry_queries()
            .iter()
            .chain(ProtocolVersion::V30.status_queries())
            .map(|q| q.response_len())
            .collect();
        assert_eq!(sizes, vec![Some(34), Some(52), Some(18)]);
        assert_eq!(ProtocolVersion::V20.telemetry_queries()[0].response_len(), None);
    }

    #[test]
    fn declared_channels() {
        let v20 = ProtocolVersion::V20.table();
        let v30 = ProtocolVersion::V30.table();
        assert!(v20.declares(Channel::CellVoltage(16)));
        assert!(!v20.declares(Channel::CellVoltage(17)));
        assert!(!v20.declares(Channel::Temperature(0)));
        assert!(v20.declares(Channel::PortVoltage));
        assert!(!v30.declares(Channel::PortVoltage));
        assert!(!v30.declares(Channel::RatedCapacity));
        assert!(v30.declares(Channel::Temperature(6)));
    }
}
