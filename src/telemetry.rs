//! Telemetry payload decoding into named channels.
//!
//! Each protocol version has a fixed big-endian layout:
//!
//! * V2.0: `flag group N cell[N] T temp[T] current total_voltage residual custom
//!   battery_capacity soc rated_capacity cycles soh port_voltage reserved[8]`
//! * V3.0: PIA (34 bytes) followed by PIB (52 bytes)
//!
//! Derived channels (min/max/delta/average cell voltage and the power figures)
//! are computed after decoding.

use crate::error::DecodeError;
use crate::protocol::{FieldTable, ProtocolVersion, MAX_CELLS, MAX_TEMPERATURES};
use crate::Error;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// V2.0 bytes following the temperature block, up to and including the rated capacity.
const V20_TRAILER_SIZE: usize = 13;
/// Reserved V2.0 bytes after the port voltage.
const V20_RESERVED_SIZE: usize = 8;
const PIA_SIZE: usize = 34;
const PIB_SIZE: usize = 52;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Unit {
    Volt,
    Ampere,
    Watt,
    Celsius,
    AmpereHour,
    Percent,
    None,
}

impl Unit {
    pub fn symbol(self) -> &'static str {
        match self {
            Unit::Volt => "V",
            Unit::Ampere => "A",
            Unit::Watt => "W",
            Unit::Celsius => "°C",
            Unit::AmpereHour => "Ah",
            Unit::Percent => "%",
            Unit::None => "",
        }
    }
}

/// A named telemetry channel. Cell and temperature numbers are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(into = "String", try_from = "String")
)]
pub enum Channel {
    CellVoltage(u8),
    Temperature(u8),
    MinCellVoltage,
    MaxCellVoltage,
    MinVoltageCell,
    MaxVoltageCell,
    DeltaCellVoltage,
    AverageCellVoltage,
    TotalVoltage,
    Current,
    Power,
    ChargingPower,
    DischargingPower,
    StateOfCharge,
    ResidualCapacity,
    BatteryCapacity,
    RatedCapacity,
    ChargingCycles,
    StateOfHealth,
    PortVoltage,
}

const SCALARS: [(Channel, &str); 18] = [
    (Channel::MinCellVoltage, "min_cell_voltage"),
    (Channel::MaxCellVoltage, "max_cell_voltage"),
    (Channel::MinVoltageCell, "min_voltage_cell"),
    (Channel::MaxVoltageCell, "max_voltage_cell"),
    (Channel::DeltaCellVoltage, "delta_cell_voltage"),
    (Channel::AverageCellVoltage, "average_cell_voltage"),
    (Channel::TotalVoltage, "total_voltage"),
    (Channel::Current, "current"),
    (Channel::Power, "power"),
    (Channel::ChargingPower, "charging_power"),
    (Channel::DischargingPower, "discharging_power"),
    (Channel::StateOfCharge, "state_of_charge"),
    (Channel::ResidualCapacity, "residual_capacity"),
    (Channel::BatteryCapacity, "battery_capacity"),
    (Channel::RatedCapacity, "rated_capacity"),
    (Channel::ChargingCycles, "charging_cycles"),
    (Channel::StateOfHealth, "state_of_health"),
    (Channel::PortVoltage, "port_voltage"),
];

impl Channel {
    /// Number of distinct channels.
    pub const COUNT: usize = MAX_CELLS + MAX_TEMPERATURES + SCALARS.len();

    /// Dense index in `0..COUNT`, `None` for out-of-range cell/temperature numbers.
    pub fn index(self) -> Option<usize> {
        match self {
            Channel::CellVoltage(n) if (1..=MAX_CELLS).contains(&(n as usize)) => {
                Some(n as usize - 1)
            }
            Channel::Temperature(n) if (1..=MAX_TEMPERATURES).contains(&(n as usize)) => {
                Some(MAX_CELLS + n as usize - 1)
            }
            Channel::CellVoltage(_) | Channel::Temperature(_) => None,
            scalar => SCALARS
                .iter()
                .position(|(c, _)| *c == scalar)
                .map(|i| MAX_CELLS + MAX_TEMPERATURES + i),
        }
    }

    fn from_index(index: usize) -> Option<Self> {
        if index < MAX_CELLS {
            Some(Channel::CellVoltage(index as u8 + 1))
        } else if index < MAX_CELLS + MAX_TEMPERATURES {
            Some(Channel::Temperature((index - MAX_CELLS) as u8 + 1))
        } else {
            SCALARS
                .get(index - MAX_CELLS - MAX_TEMPERATURES)
                .map(|(c, _)| *c)
        }
    }

    /// Iterates over every channel in index order.
    pub fn all() -> impl Iterator<Item = Channel> {
        (0..Self::COUNT).filter_map(Self::from_index)
    }

    pub fn unit(self) -> Unit {
        match self {
            Channel::CellVoltage(_)
            | Channel::MinCellVoltage
            | Channel::MaxCellVoltage
            | Channel::DeltaCellVoltage
            | Channel::AverageCellVoltage
            | Channel::TotalVoltage
            | Channel::PortVoltage => Unit::Volt,
            Channel::Temperature(_) => Unit::Celsius,
            Channel::Current => Unit::Ampere,
            Channel::Power | Channel::ChargingPower | Channel::DischargingPower => Unit::Watt,
            Channel::StateOfCharge | Channel::StateOfHealth => Unit::Percent,
            Channel::ResidualCapacity | Channel::BatteryCapacity | Channel::RatedCapacity => {
                Unit::AmpereHour
            }
            Channel::MinVoltageCell | Channel::MaxVoltageCell | Channel::ChargingCycles => {
                Unit::None
            }
        }
    }

    /// Number of decimals the value is meaningful to.
    pub fn precision(self) -> u8 {
        match self {
            Channel::CellVoltage(_)
            | Channel::MinCellVoltage
            | Channel::MaxCellVoltage
            | Channel::DeltaCellVoltage
            | Channel::AverageCellVoltage => 3,
            Channel::Temperature(_)
            | Channel::MinVoltageCell
            | Channel::MaxVoltageCell
            | Channel::ChargingCycles => 0,
            Channel::StateOfCharge | Channel::StateOfHealth => 1,
            _ => 2,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::CellVoltage(n) => write!(f, "cell_voltage_{n}"),
            Channel::Temperature(n) => write!(f, "temperature_{n}"),
            scalar => {
                let name = SCALARS
                    .iter()
                    .find(|(c, _)| c == scalar)
                    .map(|(_, name)| *name)
                    .unwrap_or("unknown");
                f.write_str(name)
            }
        }
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let numbered = |prefix: &str| -> Option<u8> { s.strip_prefix(prefix)?.parse().ok() };
        let channel = if let Some(n) = numbered("cell_voltage_") {
            Some(Channel::CellVoltage(n))
        } else if let Some(n) = numbered("temperature_") {
            Some(Channel::Temperature(n))
        } else {
            SCALARS.iter().find(|(_, name)| *name == s).map(|(c, _)| *c)
        };
        channel
            .filter(|c| c.index().is_some())
            .ok_or_else(|| Error::UnknownChannel(s.to_string()))
    }
}

impl From<Channel> for String {
    fn from(channel: Channel) -> Self {
        channel.to_string()
    }
}

impl TryFrom<String> for Channel {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A set of channels, one bit per channel index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(from = "Vec<Channel>", into = "Vec<Channel>")
)]
pub struct ChannelSet(u64);

impl ChannelSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Channel::all().collect()
    }

    pub fn insert(&mut self, channel: Channel) {
        if let Some(i) = channel.index() {
            self.0 |= 1 << i;
        }
    }

    pub fn remove(&mut self, channel: Channel) {
        if let Some(i) = channel.index() {
            self.0 &= !(1 << i);
        }
    }

    pub fn contains(&self, channel: Channel) -> bool {
        channel.index().is_some_and(|i| self.0 & (1 << i) != 0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Channel> + '_ {
        Channel::all().filter(|c| self.contains(*c))
    }
}

impl FromIterator<Channel> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = Channel>>(iter: I) -> Self {
        let mut set = ChannelSet::empty();
        for channel in iter {
            set.insert(channel);
        }
        set
    }
}

impl From<Vec<Channel>> for ChannelSet {
    fn from(channels: Vec<Channel>) -> Self {
        channels.into_iter().collect()
    }
}

impl From<ChannelSet> for Vec<Channel> {
    fn from(set: ChannelSet) -> Self {
        set.iter().collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Reading {
    pub value: f32,
    pub unit: Unit,
    pub precision: u8,
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.*}", self.precision as usize, self.value)?;
        match self.unit {
            Unit::None => Ok(()),
            unit => write!(f, " {}", unit.symbol()),
        }
    }
}

/// Readings decoded from one telemetry payload.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize), serde(transparent))]
pub struct TelemetrySnapshot {
    readings: BTreeMap<Channel, Reading>,
}

impl TelemetrySnapshot {
    pub fn get(&self, channel: Channel) -> Option<&Reading> {
        self.readings.get(&channel)
    }

    pub fn value(&self, channel: Channel) -> Option<f32> {
        self.get(channel).map(|r| r.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Channel, &Reading)> {
        self.readings.iter().map(|(c, r)| (*c, r))
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn channels(&self) -> ChannelSet {
        self.readings.keys().copied().collect()
    }

    /// Drops every reading whose channel is not in `enabled`.
    pub fn retain(&mut self, enabled: &ChannelSet) {
        self.readings.retain(|c, _| enabled.contains(*c));
    }

    /// Adds a reading unless the protocol version never produces this channel.
    pub fn set(&mut self, table: &FieldTable, channel: Channel, value: f32) {
        if !table.declares(channel) {
            log::debug!(
                "Dropping channel {channel} not declared by protocol {}",
                table.version
            );
            return;
        }
        self.readings.insert(
            channel,
            Reading {
                value,
                unit: channel.unit(),
                precision: channel.precision(),
            },
        );
    }
}

fn validate_len(payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() < expected {
        log::warn!(
            "Invalid payload size - required={} received={}",
            expected,
            payload.len()
        );
        return Err(DecodeError::Length {
            expected,
            received: payload.len(),
        });
    }
    Ok(())
}

fn u16_at(payload: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn i16_at(payload: &[u8], offset: usize) -> i16 {
    i16::from_be_bytes([payload[offset], payload[offset + 1]])
}

fn temperature(table: &FieldTable, raw: u16) -> f32 {
    (raw as f32 - table.temperature_offset) * 0.1
}

/// Scales `value` into a register, rejecting what the register cannot hold.
fn raw_u16(channel: Channel, value: f32, factor: f32) -> Result<u16, DecodeError> {
    let raw = (value * factor).round();
    if !(0.0..=u16::MAX as f32).contains(&raw) {
        return Err(DecodeError::OutOfRange { channel, value });
    }
    Ok(raw as u16)
}

fn raw_i16(channel: Channel, value: f32, factor: f32) -> Result<i16, DecodeError> {
    let raw = (value * factor).round();
    if !(i16::MIN as f32..=i16::MAX as f32).contains(&raw) {
        return Err(DecodeError::OutOfRange { channel, value });
    }
    Ok(raw as i16)
}

fn raw_temperature(table: &FieldTable, channel: Channel, celsius: f32) -> Result<u16, DecodeError> {
    let raw = (celsius * 10.0 + table.temperature_offset).round();
    if !(0.0..=u16::MAX as f32).contains(&raw) {
        return Err(DecodeError::OutOfRange {
            channel,
            value: celsius,
        });
    }
    Ok(raw as u16)
}

/// Adds the cell voltages and the statistics derived from them.
/// Min/max are compared in millivolts so equal readings pick the first cell.
fn set_cells(snapshot: &mut TelemetrySnapshot, table: &FieldTable, cells_mv: &[u16]) {
    for (i, mv) in cells_mv.iter().enumerate() {
        snapshot.set(table, Channel::CellVoltage(i as u8 + 1), *mv as f32 * 0.001);
    }
    let Some(first) = cells_mv.first() else {
        return;
    };
    let (mut min, mut max) = ((0, *first), (0, *first));
    for (i, mv) in cells_mv.iter().enumerate().skip(1) {
        if *mv < min.1 {
            min = (i, *mv);
        }
        if *mv > max.1 {
            max = (i, *mv);
        }
    }
    let sum: u32 = cells_mv.iter().map(|mv| *mv as u32).sum();
    snapshot.set(table, Channel::MinCellVoltage, min.1 as f32 * 0.001);
    snapshot.set(table, Channel::MaxCellVoltage, max.1 as f32 * 0.001);
    snapshot.set(table, Channel::MinVoltageCell, (min.0 + 1) as f32);
    snapshot.set(table, Channel::MaxVoltageCell, (max.0 + 1) as f32);
    snapshot.set(table, Channel::DeltaCellVoltage, (max.1 - min.1) as f32 * 0.001);
    snapshot.set(
        table,
        Channel::AverageCellVoltage,
        sum as f32 / cells_mv.len() as f32 * 0.001,
    );
}

fn set_power(snapshot: &mut TelemetrySnapshot, table: &FieldTable, voltage: f32, current: f32) {
    let power = voltage * current;
    snapshot.set(table, Channel::Power, power);
    snapshot.set(table, Channel::ChargingPower, power.max(0.0));
    snapshot.set(table, Channel::DischargingPower, power.min(0.0).abs());
}

/// Decodes a telemetry payload.
///
/// `cell_count_override` dictates the V2.0 cell block size regardless of the
/// reported count and limits the number of V3.0 cell slots decoded.
pub fn decode_telemetry(
    version: ProtocolVersion,
    payload: &[u8],
    cell_count_override: Option<usize>,
) -> Result<TelemetrySnapshot, DecodeError> {
    let table = version.table();
    log::trace!("decode_telemetry {version}: {:02X?}", payload);
    let snapshot = match version {
        ProtocolVersion::V20 => decode_v20(table, payload, cell_count_override)?,
        ProtocolVersion::V30 => decode_v30(table, payload, cell_count_override)?,
    };
    log::debug!("Decoded {} telemetry channels", snapshot.len());
    Ok(snapshot)
}

fn decode_v20(
    table: &FieldTable,
    payload: &[u8],
    cell_count_override: Option<usize>,
) -> Result<TelemetrySnapshot, DecodeError> {
    validate_len(payload, 3)?;
    let cells = cell_count_override.unwrap_or(payload[2] as usize);
    if cells > table.max_cells {
        return Err(DecodeError::CellCount(cells));
    }
    let offset = 3 + cells * 2;
    validate_len(payload, offset + 1)?;
    let temperatures = payload[offset] as usize;
    if temperatures > table.max_temperatures {
        return Err(DecodeError::TemperatureCount(temperatures));
    }
    let o = offset + 1 + temperatures * 2;
    validate_len(payload, o + V20_TRAILER_SIZE)?;

    let mut snapshot = TelemetrySnapshot::default();
    let cells_mv: Vec<u16> = (0..cells).map(|i| u16_at(payload, 3 + i * 2)).collect();
    set_cells(&mut snapshot, table, &cells_mv);
    for i in 0..temperatures {
        let raw = u16_at(payload, offset + 1 + i * 2);
        snapshot.set(table, Channel::Temperature(i as u8 + 1), temperature(table, raw));
    }

    let current = i16_at(payload, o) as f32 * 0.01;
    let total_voltage = u16_at(payload, o + 2) as f32 * 0.01;
    snapshot.set(table, Channel::Current, current);
    snapshot.set(table, Channel::TotalVoltage, total_voltage);
    set_power(&mut snapshot, table, total_voltage, current);
    snapshot.set(table, Channel::ResidualCapacity, u16_at(payload, o + 4) as f32 * 0.01);
    // o + 6: custom number
    snapshot.set(table, Channel::BatteryCapacity, u16_at(payload, o + 7) as f32 * 0.01);
    snapshot.set(table, Channel::StateOfCharge, u16_at(payload, o + 9) as f32 * 0.1);
    snapshot.set(table, Channel::RatedCapacity, u16_at(payload, o + 11) as f32 * 0.01);

    // older firmware ends the frame early, absent channels are left out
    let optional = [
        (Channel::ChargingCycles, 1.0),
        (Channel::StateOfHealth, 0.1),
        (Channel::PortVoltage, 0.01),
    ];
    for (i, (channel, factor)) in optional.into_iter().enumerate() {
        let offset = o + V20_TRAILER_SIZE + i * 2;
        if payload.len() < offset + 2 {
            log::debug!("Telemetry ends before {channel}");
            break;
        }
        snapshot.set(table, channel, u16_at(payload, offset) as f32 * factor);
    }
    Ok(snapshot)
}

fn decode_v30(
    table: &FieldTable,
    payload: &[u8],
    cell_count_override: Option<usize>,
) -> Result<TelemetrySnapshot, DecodeError> {
    validate_len(payload, PIA_SIZE + PIB_SIZE)?;
    let cells = cell_count_override.unwrap_or(table.max_cells);
    if cells > table.max_cells {
        return Err(DecodeError::CellCount(cells));
    }
    let (pia, pib) = payload.split_at(PIA_SIZE);

    let mut snapshot = TelemetrySnapshot::default();
    let total_voltage = u16_at(pia, 0) as f32 * 0.01;
    let current = i16_at(pia, 2) as f32 * 0.01;
    snapshot.set(table, Channel::TotalVoltage, total_voltage);
    snapshot.set(table, Channel::Current, current);
    set_power(&mut snapshot, table, total_voltage, current);
    snapshot.set(table, Channel::ResidualCapacity, u16_at(pia, 4) as f32 * 0.01);
    snapshot.set(table, Channel::BatteryCapacity, u16_at(pia, 6) as f32 * 0.01);
    snapshot.set(table, Channel::StateOfCharge, u16_at(pia, 10) as f32 * 0.1);
    snapshot.set(table, Channel::StateOfHealth, u16_at(pia, 12) as f32 * 0.1);
    snapshot.set(table, Channel::ChargingCycles, u16_at(pia, 14) as f32);

    let cells_mv: Vec<u16> = (0..cells).map(|i| u16_at(pib, i * 2)).collect();
    set_cells(&mut snapshot, table, &cells_mv);
    // four cell sensors, then ambient and power (mosfet) temperature
    for i in 0..table.max_temperatures {
        let raw = u16_at(pib, 32 + i * 2);
        snapshot.set(table, Channel::Temperature(i as u8 + 1), temperature(table, raw));
    }
    Ok(snapshot)
}

fn numbered_count(snapshot: &TelemetrySnapshot, numbered: fn(u8) -> Channel, max: usize) -> usize {
    (1..=max as u8)
        .rev()
        .find(|n| snapshot.get(numbered(*n)).is_some())
        .map_or(0, |n| n as usize)
}

/// Builds the payload a device would send for `snapshot`. Missing channels
/// are encoded as zero; derived channels are not part of the payload.
///
/// A value its register cannot hold (negative, too large or NaN) is rejected
/// with [`DecodeError::OutOfRange`].
pub fn encode_telemetry(
    version: ProtocolVersion,
    snapshot: &TelemetrySnapshot,
) -> Result<Vec<u8>, DecodeError> {
    let table = version.table();
    let value = |channel: Channel| snapshot.value(channel).unwrap_or(0.0);
    let field = |channel: Channel, factor: f32| raw_u16(channel, value(channel), factor);
    let temperature = |channel: Channel| raw_temperature(table, channel, value(channel));
    let cells = numbered_count(snapshot, Channel::CellVoltage, table.max_cells);
    let mut payload = Vec::new();
    match version {
        ProtocolVersion::V20 => {
            let temperatures =
                numbered_count(snapshot, Channel::Temperature, table.max_temperatures);
            payload.extend_from_slice(&[0x00, 0x01, cells as u8]);
            for n in 1..=cells as u8 {
                payload.extend_from_slice(&field(Channel::CellVoltage(n), 1000.0)?.to_be_bytes());
            }
            payload.push(temperatures as u8);
            for n in 1..=temperatures as u8 {
                payload.extend_from_slice(&temperature(Channel::Temperature(n))?.to_be_bytes());
            }
            let current = raw_i16(Channel::Current, value(Channel::Current), 100.0)?;
            payload.extend_from_slice(&current.to_be_bytes());
            payload.extend_from_slice(&field(Channel::TotalVoltage, 100.0)?.to_be_bytes());
            payload.extend_from_slice(&field(Channel::ResidualCapacity, 100.0)?.to_be_bytes());
            payload.push(0x00);
            payload.extend_from_slice(&field(Channel::BatteryCapacity, 100.0)?.to_be_bytes());
            payload.extend_from_slice(&field(Channel::StateOfCharge, 10.0)?.to_be_bytes());
            payload.extend_from_slice(&field(Channel::RatedCapacity, 100.0)?.to_be_bytes());
            payload.extend_from_slice(&field(Channel::ChargingCycles, 1.0)?.to_be_bytes());
            payload.extend_from_slice(&field(Channel::StateOfHealth, 10.0)?.to_be_bytes());
            payload.extend_from_slice(&field(Channel::PortVoltage, 100.0)?.to_be_bytes());
            payload.extend_from_slice(&[0x00; V20_RESERVED_SIZE]);
        }
        ProtocolVersion::V30 => {
            payload.resize(PIA_SIZE + PIB_SIZE, 0x00);
            let mut put = |offset: usize, raw: u16| {
                payload[offset..offset + 2].copy_from_slice(&raw.to_be_bytes());
            };
            put(0, field(Channel::TotalVoltage, 100.0)?);
            put(2, raw_i16(Channel::Current, value(Channel::Current), 100.0)? as u16);
            put(4, field(Channel::ResidualCapacity, 100.0)?);
            put(6, field(Channel::BatteryCapacity, 100.0)?);
            put(10, field(Channel::StateOfCharge, 10.0)?);
            put(12, field(Channel::StateOfHealth, 10.0)?);
            put(14, field(Channel::ChargingCycles, 1.0)?);
            for n in 1..=cells as u8 {
                let offset = PIA_SIZE + (n as usize - 1) * 2;
                put(offset, field(Channel::CellVoltage(n), 1000.0)?);
            }
            for n in 1..=table.max_temperatures as u8 {
                let offset = PIA_SIZE + 32 + (n as usize - 1) * 2;
                put(offset, temperature(Channel::Temperature(n))?);
            }
        }
    }
    Ok(payload)
}
