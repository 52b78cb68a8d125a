//! Status payload decoding and alarm interpretation.

use crate::error::DecodeError;
use crate::protocol::ProtocolVersion;
use std::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

macro_rules! read_bit {
    ($byte:expr,$position:expr) => {
        ($byte >> $position) & 1 != 0
    };
}

const V20_STATUS_SIZE: usize = 64;
const V30_STATUS_SIZE: usize = 18;

/// Raw status bit-fields of one device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StatusBits {
    pub voltage: u8,
    pub temperature: u8,
    pub current: u8,
    pub soc: u8,
    /// V2.0 switch state: bit0 discharge, bit1 charge
    pub switches: u8,
    pub system: u8,
    pub events: [u8; 8],
    /// One bit per cell, cell 1 in bit 0
    pub balancing: u16,
    /// One bit per cell, cell 1 in bit 0
    pub disconnection: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub enum Category {
    Voltage,
    Temperature,
    Current,
    Soc,
    /// Alarm event byte 1..=8
    Event(u8),
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Voltage => f.write_str("voltage"),
            Category::Temperature => f.write_str("temperature"),
            Category::Current => f.write_str("current"),
            Category::Soc => f.write_str("soc"),
            Category::Event(n) => write!(f, "alarm_event{n}"),
        }
    }
}

/// Reserved bits have no name and never produce a condition.
type BitNames = [Option<&'static str>; 8];

const VOLTAGE_NAMES: BitNames = [
    Some("Cell high voltage alarm"),
    Some("Cell overvoltage protection"),
    Some("Cell low voltage alarm"),
    Some("Cell undervoltage protection"),
    Some("Pack high voltage alarm"),
    Some("Pack overvoltage protection"),
    Some("Pack low voltage alarm"),
    Some("Pack undervoltage protection"),
];

const TEMPERATURE_NAMES: BitNames = [
    Some("Charge high temp alarm"),
    Some("Charge overtemp protection"),
    Some("Charge low temp alarm"),
    Some("Charge undertemp protection"),
    Some("Discharge high temp alarm"),
    Some("Discharge overtemp protection"),
    Some("Discharge low temp alarm"),
    Some("Discharge undertemp protection"),
];

const V20_CURRENT_NAMES: BitNames = [
    Some("Current over alarm"),
    Some("Current over protection"),
    Some("Current under alarm"),
    Some("Current under protection"),
    None,
    None,
    None,
    None,
];

const V30_CURRENT_NAMES: BitNames = [
    Some("Charge current alarm"),
    Some("Charge overcurrent protection"),
    Some("Charge secondary overcurrent protection"),
    Some("Discharge current alarm"),
    Some("Discharge overcurrent protection"),
    Some("Discharge secondary overcurrent protection"),
    Some("Short circuit protection"),
    None,
];

const V20_SOC_NAMES: BitNames = [
    None,
    None,
    Some("SOC low alarm"),
    Some("SOC under protection"),
    None,
    None,
    None,
    None,
];

const NO_NAMES: BitNames = [None; 8];

static EVENT_NAMES: [BitNames; 8] = [
    [
        Some("Voltage sensor fault"),
        Some("Temperature sensor fault"),
        Some("Current sensor fault"),
        Some("Key switch fault"),
        Some("Cell voltage dropout fault"),
        Some("Charge switch fault"),
        Some("Discharge switch fault"),
        Some("Current limit switch fault"),
    ],
    VOLTAGE_NAMES,
    TEMPERATURE_NAMES,
    [
        Some("Env high temp alarm"),
        Some("Env overtemp protection"),
        Some("Env low temp alarm"),
        Some("Env undertemp protection"),
        Some("Power overtemp protection"),
        Some("Power high temp alarm"),
        Some("Cell low temp heating"),
        None,
    ],
    [
        Some("Charge overcurrent alarm"),
        Some("Charge overcurrent protection"),
        Some("Discharge overcurrent alarm"),
        Some("Discharge overcurrent protection"),
        Some("Transient overcurrent protection"),
        Some("Output short circuit protection"),
        Some("Transient overcurrent lockout"),
        Some("Output short circuit lockout"),
    ],
    [
        Some("Charge high voltage protection"),
        Some("Intermittent recharge waiting"),
        Some("Residual capacity alarm"),
        Some("Residual capacity protection"),
        Some("Cell low voltage charging prohibition"),
        Some("Output reverse polarity protection"),
        Some("Output connection fault"),
        None,
    ],
    [
        None,
        None,
        None,
        None,
        Some("Automatic charging waiting"),
        Some("Manual charging waiting"),
        None,
        None,
    ],
    [
        Some("EEP storage fault"),
        Some("RTC error"),
        Some("Voltage calibration not performed"),
        Some("Current calibration not performed"),
        Some("Zero calibration not performed"),
        None,
        None,
        None,
    ],
];

/// One named status bit and whether it is set.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct Condition {
    pub category: Category,
    pub bit: u8,
    pub name: &'static str,
    pub active: bool,
}

/// Everything derived from one [`StatusBits`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize))]
pub struct AlarmReport {
    pub conditions: Vec<Condition>,
    pub voltage_protection: bool,
    pub temperature_protection: bool,
    pub current_protection: bool,
    pub soc_protection: bool,
    pub charging: bool,
    pub discharging: bool,
    pub balancing: bool,
    /// Active protection-category conditions, comma-joined
    pub errors: String,
    /// Active alarm events, comma-joined
    pub alarms: String,
}

impl AlarmReport {
    /// State of the condition called `name`, `None` if no such condition exists.
    pub fn is_active(&self, name: &str) -> Option<bool> {
        self.conditions
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.active)
    }

    pub fn active(&self) -> impl Iterator<Item = &Condition> {
        self.conditions.iter().filter(|c| c.active)
    }
}

fn validate_len(payload: &[u8], expected: usize) -> Result<(), DecodeError> {
    if payload.len() < expected {
        log::warn!(
            "Invalid status payload size - required={} received={}",
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

/// Extracts the status bit-fields from a status payload.
pub fn decode_status(version: ProtocolVersion, payload: &[u8]) -> Result<StatusBits, DecodeError> {
    log::trace!("decode_status {version}: {:02X?}", payload);
    match version {
        ProtocolVersion::V20 => {
            validate_len(payload, V20_STATUS_SIZE)?;
            let mut events = [0u8; 8];
            events[..6].copy_from_slice(&payload[41..47]);
            events[6] = payload[53];
            events[7] = payload[54];
            Ok(StatusBits {
                voltage: payload[24],
                temperature: payload[25],
                current: payload[27],
                soc: payload[28],
                switches: payload[29],
                system: payload[50],
                events,
                balancing: u16::from_be_bytes([payload[47], payload[48]]),
                disconnection: u16::from_be_bytes([payload[51], payload[52]]),
            })
        }
        ProtocolVersion::V30 => {
            validate_len(payload, V30_STATUS_SIZE)?;
            Ok(StatusBits {
                system: payload[0],
                voltage: payload[1],
                temperature: payload[2],
                current: payload[4],
                ..Default::default()
            })
        }
    }
}

fn category_names(version: ProtocolVersion, category: Category) -> &'static BitNames {
    match (version, category) {
        (_, Category::Voltage) => &VOLTAGE_NAMES,
        (_, Category::Temperature) => &TEMPERATURE_NAMES,
        (ProtocolVersion::V20, Category::Current) => &V20_CURRENT_NAMES,
        (ProtocolVersion::V30, Category::Current) => &V30_CURRENT_NAMES,
        (ProtocolVersion::V20, Category::Soc) => &V20_SOC_NAMES,
        (ProtocolVersion::V30, Category::Soc) => &NO_NAMES,
        (_, Category::Event(n)) => EVENT_NAMES
            .get((n as usize).wrapping_sub(1))
            .unwrap_or(&NO_NAMES),
    }
}

fn push_conditions(
    conditions: &mut Vec<Condition>,
    version: ProtocolVersion,
    category: Category,
    byte: u8,
) {
    for (bit, name) in category_names(version, category).iter().enumerate() {
        if let Some(name) = name {
            conditions.push(Condition {
                category,
                bit: bit as u8,
                name,
                active: read_bit!(byte, bit),
            });
        }
    }
}

fn join_active<'a>(conditions: impl Iterator<Item = &'a Condition>) -> String {
    conditions
        .filter(|c| c.active)
        .map(|c| c.name)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Maps status bits to named conditions and text summaries.
pub fn interpret(version: ProtocolVersion, bits: &StatusBits) -> AlarmReport {
    let mut conditions = Vec::new();
    push_conditions(&mut conditions, version, Category::Voltage, bits.voltage);
    push_conditions(&mut conditions, version, Category::Temperature, bits.temperature);
    push_conditions(&mut conditions, version, Category::Current, bits.current);
    push_conditions(&mut conditions, version, Category::Soc, bits.soc);
    if version == ProtocolVersion::V20 {
        for (i, byte) in bits.events.iter().enumerate() {
            push_conditions(&mut conditions, version, Category::Event(i as u8 + 1), *byte);
        }
    }

    let errors = join_active(
        conditions
            .iter()
            .filter(|c| !matches!(c.category, Category::Event(_))),
    );
    let alarms = join_active(
        conditions
            .iter()
            .filter(|c| matches!(c.category, Category::Event(_))),
    );

    let (charging, discharging) = match version {
        ProtocolVersion::V20 => (read_bit!(bits.switches, 1), read_bit!(bits.switches, 0)),
        ProtocolVersion::V30 => (read_bit!(bits.system, 1), read_bit!(bits.system, 0)),
    };

    let report = AlarmReport {
        conditions,
        voltage_protection: bits.voltage != 0,
        temperature_protection: bits.temperature != 0,
        current_protection: bits.current != 0,
        soc_protection: bits.soc != 0,
        charging,
        discharging,
        balancing: bits.balancing != 0,
        errors,
        alarms,
    };
    if !report.errors.is_empty() {
        log::debug!("Active protections: {}", report.errors);
    }
    if !report.alarms.is_empty() {
        log::debug!("Active alarm events: {}", report.alarms);
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_categories_two_conditions() {
        let bits = StatusBits {
            voltage: 0b0000_0001,
            temperature: 0b0000_1000,
            ..Default::default()
        };
        let report = interpret(ProtocolVersion::V20, &bits);
        let active: Vec<_> = report.active().map(|c| c.name).collect();
        assert_eq!(
            active,
            vec!["Cell high voltage alarm", "Charge undertemp protection"]
        );
        assert_eq!(report.is_active("Cell overvoltage protection"), Some(false));
        assert_eq!(report.is_active("Current over alarm"), Some(false));
        assert!(report.voltage_protection);
        assert!(report.temperature_protection);
        assert!(!report.current_protection);
        assert!(!report.soc_protection);
        assert_eq!(
            report.errors,
            "Cell high voltage alarm, Charge undertemp protection"
        );
        assert_eq!(report.alarms, "");
    }

    #[test]
    fn nothing_set_gives_empty_text() {
        for version in [ProtocolVersion::V20, ProtocolVersion::V30] {
            let report = interpret(version, &StatusBits::default());
            assert_eq!(report.errors, "");
            assert_eq!(report.alarms, "");
            assert_eq!(report.active().count(), 0);
            assert!(!report.conditions.is_empty());
        }
    }

    #[test]
    fn reserved_bits_are_ignored() {
        let bits = StatusBits {
            soc: 0b0000_0011,
            events: [0, 0, 0, 0, 0, 0, 0b0000_1111, 0],
            ..Default::default()
        };
        let report = interpret(ProtocolVersion::V20, &bits);
        assert_eq!(report.active().count(), 0);
        assert!(report.soc_protection);
    }

    #[test]
    fn decode_v20_status() {
        let mut payload = vec![0u8; 64];
        payload[24] = 0x02;
        payload[27] = 0x01;
        payload[29] = 0x02;
        payload[41] = 0x01;
        payload[47] = 0x80;
        payload[48] = 0x01;
        payload[54] = 0x02;
        let bits = decode_status(ProtocolVersion::V20, &payload).unwrap();
        assert_eq!(bits.voltage, 0x02);
        assert_eq!(bits.current, 0x01);
        assert_eq!(bits.balancing, 0x8001);
        assert_eq!(bits.events[7], 0x02);

        let report = interpret(ProtocolVersion::V20, &bits);
        assert!(report.charging);
        assert!(!report.discharging);
        assert!(report.balancing);
        assert_eq!(
            report.errors,
            "Cell overvoltage protection, Current over alarm"
        );
        assert_eq!(report.alarms, "Voltage sensor fault, RTC error");
    }

    #[test]
    fn decode_v30_status() {
        let mut payload = vec![0u8; 18];
        payload[0] = 0x01;
        payload[4] = 0x40;
        let bits = decode_status(ProtocolVersion::V30, &payload).unwrap();
        let report = interpret(ProtocolVersion::V30, &bits);
        assert!(report.discharging);
        assert!(!report.charging);
        assert_eq!(report.errors, "Short circuit protection");
        assert_eq!(report.is_active("Current over alarm"), None);
    }

    #[test]
    fn short_status_payload() {
        assert_eq!(
            decode_status(ProtocolVersion::V20, &[0; 63]),
            Err(DecodeError::Length {
                expected: 64,
                received: 63
            })
        );
        assert!(decode_status(ProtocolVersion::V30, &[0; 17]).is_err());
    }
}
