//! Per-device state: configuration, latest readings and online tracking.

use crate::alarm::{interpret, AlarmReport, StatusBits};
use crate::protocol::ProtocolVersion;
use crate::telemetry::{Channel, ChannelSet, TelemetrySnapshot};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Consecutive decode or frame errors after which a device counts as unresponsive.
pub const MAX_INVALID_RESPONSES: u32 = 2;

pub const BINARY_SENSORS: [&str; 8] = [
    "online_status",
    "charging",
    "discharging",
    "balancing",
    "voltage_protection",
    "temperature_protection",
    "current_protection",
    "soc_protection",
];

pub const TEXT_SENSORS: [&str; 2] = ["errors", "alarms"];

const OFFLINE_TEXT: &str = "Offline";

/// Receiver of the values a device produces, keyed by device and entity name.
pub trait EntitySink {
    fn publish_sensor(&mut self, device: &str, name: &str, value: f32);
    fn publish_binary_sensor(&mut self, device: &str, name: &str, value: bool);
    fn publish_text_sensor(&mut self, device: &str, name: &str, value: &str);
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct DeviceConfig {
    pub name: String,
    pub address: u8,
    pub protocol_version: ProtocolVersion,
    /// Fixed number of cells, ignoring what the device reports
    #[cfg_attr(feature = "serde", serde(default))]
    pub cell_count_override: Option<usize>,
    /// Channels never published for this device
    #[cfg_attr(feature = "serde", serde(default))]
    pub disabled_channels: ChannelSet,
    /// Consecutive timed out cycles before the device is reported offline
    #[cfg_attr(
        feature = "serde",
        serde(default = "DeviceConfig::default_offline_after")
    )]
    pub offline_after: u32,
}

impl DeviceConfig {
    pub fn new(name: impl Into<String>, address: u8, protocol_version: ProtocolVersion) -> Self {
        Self {
            name: name.into(),
            address,
            protocol_version,
            cell_count_override: None,
            disabled_channels: ChannelSet::empty(),
            offline_after: Self::default_offline_after(),
        }
    }

    fn default_offline_after() -> u32 {
        1
    }

    /// Channels this device may publish.
    pub fn enabled_channels(&self) -> ChannelSet {
        let table = self.protocol_version.table();
        Channel::all()
            .filter(|c| table.declares(*c) && !self.disabled_channels.contains(*c))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OnlineState {
    Online,
    Unresponsive,
}

/// The two halves of a poll cycle. Their failures are counted separately so
/// a device that keeps answering one of them cannot mask the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStage {
    Telemetry,
    Status,
}

#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    enabled: ChannelSet,
    state: OnlineState,
    timeouts: u32,
    invalid_telemetry: u32,
    invalid_status: u32,
    snapshot: Option<TelemetrySnapshot>,
    status: Option<StatusBits>,
    offline_published: bool,
}

impl Device {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            enabled: config.enabled_channels(),
            config,
            state: OnlineState::Unresponsive,
            timeouts: 0,
            invalid_telemetry: 0,
            invalid_status: 0,
            snapshot: None,
            status: None,
            // nothing was ever published for a device that has not answered yet
            offline_published: true,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn address(&self) -> u8 {
        self.config.address
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.config.protocol_version
    }

    pub fn state(&self) -> OnlineState {
        self.state
    }

    pub fn snapshot(&self) -> Option<&TelemetrySnapshot> {
        self.snapshot.as_ref()
    }

    pub fn status(&self) -> Option<&StatusBits> {
        self.status.as_ref()
    }

    pub fn report(&self) -> Option<AlarmReport> {
        self.status
            .as_ref()
            .map(|bits| interpret(self.config.protocol_version, bits))
    }

    fn set_state(&mut self, state: OnlineState) {
        if self.state != state {
            match state {
                OnlineState::Online => log::info!("Device '{}' is online", self.name()),
                OnlineState::Unresponsive => {
                    log::warn!("Device '{}' is unresponsive", self.name())
                }
            }
            self.state = state;
            self.offline_published = state == OnlineState::Online;
        }
    }

    /// Back online only once neither stage is over the invalid limit.
    fn record_success(&mut self) {
        self.timeouts = 0;
        if self.invalid_telemetry < MAX_INVALID_RESPONSES
            && self.invalid_status < MAX_INVALID_RESPONSES
        {
            self.set_state(OnlineState::Online);
        }
    }

    pub fn record_telemetry(&mut self, mut snapshot: TelemetrySnapshot) {
        snapshot.retain(&self.enabled);
        self.snapshot = Some(snapshot);
        self.invalid_telemetry = 0;
        self.record_success();
    }

    pub fn record_status(&mut self, status: StatusBits) {
        self.status = Some(status);
        self.invalid_status = 0;
        self.record_success();
    }

    /// A poll cycle that got no answer, retry included.
    pub fn record_timeout(&mut self) {
        self.timeouts = self.timeouts.saturating_add(1);
        if self.timeouts >= self.config.offline_after {
            self.set_state(OnlineState::Unresponsive);
        }
    }

    /// A `stage` whose answer could not be framed or decoded. The previous
    /// readings are kept once and discarded on the second consecutive failure
    /// of the same stage.
    pub fn record_invalid(&mut self, stage: PollStage) {
        let invalid = match stage {
            PollStage::Telemetry => &mut self.invalid_telemetry,
            PollStage::Status => &mut self.invalid_status,
        };
        *invalid = invalid.saturating_add(1);
        let invalid = *invalid;
        if invalid >= MAX_INVALID_RESPONSES {
            if self.snapshot.take().is_some() || self.status.is_some() {
                log::warn!(
                    "Discarding stale readings of device '{}' after {} invalid {:?} responses",
                    self.name(),
                    invalid,
                    stage
                );
            }
            self.status = None;
            self.set_state(OnlineState::Unresponsive);
        }
    }

    /// Pushes the current readings to `sink`. While the device is unresponsive
    /// the unavailable values are pushed once per outage.
    pub fn publish(&mut self, sink: &mut dyn EntitySink) {
        match self.state {
            OnlineState::Online => self.publish_readings(sink),
            OnlineState::Unresponsive if !self.offline_published => {
                self.publish_unavailable(sink);
                self.offline_published = true;
            }
            OnlineState::Unresponsive => {}
        }
    }

    fn publish_readings(&self, sink: &mut dyn EntitySink) {
        let name = self.name();
        sink.publish_binary_sensor(name, "online_status", true);
        if let Some(snapshot) = &self.snapshot {
            for (channel, reading) in snapshot.iter() {
                sink.publish_sensor(name, &channel.to_string(), reading.value);
            }
        }
        let (Some(bits), Some(report)) = (&self.status, self.report()) else {
            return;
        };
        sink.publish_binary_sensor(name, "charging", report.charging);
        sink.publish_binary_sensor(name, "discharging", report.discharging);
        sink.publish_binary_sensor(name, "balancing", report.balancing);
        sink.publish_binary_sensor(name, "voltage_protection", report.voltage_protection);
        sink.publish_binary_sensor(name, "temperature_protection", report.temperature_protection);
        sink.publish_binary_sensor(name, "current_protection", report.current_protection);
        sink.publish_binary_sensor(name, "soc_protection", report.soc_protection);
        sink.publish_text_sensor(name, "errors", &report.errors);
        sink.publish_text_sensor(name, "alarms", &report.alarms);
        if self.config.protocol_version == ProtocolVersion::V20 {
            for (i, event) in bits.events.iter().enumerate() {
                sink.publish_sensor(name, &format!("alarm_event{}_bitmask", i + 1), *event as f32);
            }
            sink.publish_sensor(name, "balancing_bitmask", bits.balancing as f32);
            sink.publish_sensor(name, "disconnection_bitmask", bits.disconnection as f32);
        }
    }

    fn publish_unavailable(&self, sink: &mut dyn EntitySink) {
        let name = self.name();
        for binary in BINARY_SENSORS {
            sink.publish_binary_sensor(name, binary, false);
        }
        for text in TEXT_SENSORS {
            sink.publish_text_sensor(name, text, OFFLINE_TEXT);
        }
        for channel in self.enabled.iter() {
            sink.publish_sensor(name, &channel.to_string(), f32::NAN);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingSink {
        pub sensors: BTreeMap<(String, String), f32>,
        pub binary_sensors: BTreeMap<(String, String), bool>,
        pub text_sensors: BTreeMap<(String, String), String>,
        pub calls: usize,
    }

    impl RecordingSink {
        pub fn sensor(&self, device: &str, name: &str) -> Option<f32> {
            self.sensors
                .get(&(device.to_string(), name.to_string()))
                .copied()
        }

        pub fn binary(&self, device: &str, name: &str) -> Option<bool> {
            self.binary_sensors
                .get(&(device.to_string(), name.to_string()))
                .copied()
        }

        pub fn text(&self, device: &str, name: &str) -> Option<&str> {
            self.text_sensors
                .get(&(device.to_string(), name.to_string()))
                .map(String::as_str)
        }
    }

    impl EntitySink for RecordingSink {
        fn publish_sensor(&mut self, device: &str, name: &str, value: f32) {
            self.calls += 1;
            self.sensors.insert((device.into(), name.into()), value);
        }

        fn publish_binary_sensor(&mut self, device: &str, name: &str, value: bool) {
            self.calls += 1;
            self.binary_sensors.insert((device.into(), name.into()), value);
        }

        fn publish_text_sensor(&mut self, device: &str, name: &str, value: &str) {
            self.calls += 1;
            self.text_sensors.insert((device.into(), name.into()), value.into());
        }
    }

    fn snapshot(version: ProtocolVersion) -> TelemetrySnapshot {
        let table = version.table();
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.set(table, Channel::CellVoltage(1), 3.3);
        snapshot.set(table, Channel::CellVoltage(2), 3.295);
        snapshot.set(table, Channel::TotalVoltage, 6.6);
        snapshot
    }

    #[test]
    fn offline_after_threshold() {
        let mut config = DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20);
        config.offline_after = 3;
        let mut device = Device::new(config);
        device.record_telemetry(snapshot(ProtocolVersion::V20));
        assert_eq!(device.state(), OnlineState::Online);
        device.record_timeout();
        device.record_timeout();
        assert_eq!(device.state(), OnlineState::Online);
        device.record_timeout();
        assert_eq!(device.state(), OnlineState::Unresponsive);
        device.record_status(StatusBits::default());
        assert_eq!(device.state(), OnlineState::Online);
    }

    #[test]
    fn default_threshold_is_one_timeout() {
        let mut device = Device::new(DeviceConfig::new("bms0", 0x00, ProtocolVersion::V30));
        device.record_telemetry(snapshot(ProtocolVersion::V30));
        device.record_timeout();
        assert_eq!(device.state(), OnlineState::Unresponsive);
        assert!(device.snapshot().is_some());
    }

    #[test]
    fn two_invalid_responses_discard_snapshot() {
        let mut device = Device::new(DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20));
        device.record_telemetry(snapshot(ProtocolVersion::V20));
        device.record_invalid(PollStage::Telemetry);
        assert_eq!(device.state(), OnlineState::Online);
        assert!(device.snapshot().is_some());
        device.record_invalid(PollStage::Telemetry);
        assert_eq!(device.state(), OnlineState::Unresponsive);
        assert!(device.snapshot().is_none());
    }

    #[test]
    fn invalid_counter_resets_on_success() {
        let mut device = Device::new(DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20));
        device.record_telemetry(snapshot(ProtocolVersion::V20));
        device.record_invalid(PollStage::Telemetry);
        device.record_telemetry(snapshot(ProtocolVersion::V20));
        device.record_invalid(PollStage::Telemetry);
        assert_eq!(device.state(), OnlineState::Online);
    }

    #[test]
    fn telemetry_success_does_not_hide_status_failures() {
        let mut device = Device::new(DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20));
        device.record_telemetry(snapshot(ProtocolVersion::V20));
        device.record_status(StatusBits {
            voltage: 0x02,
            ..Default::default()
        });

        device.record_telemetry(snapshot(ProtocolVersion::V20));
        device.record_invalid(PollStage::Status);
        assert_eq!(device.state(), OnlineState::Online);
        assert!(device.status().is_some());

        device.record_telemetry(snapshot(ProtocolVersion::V20));
        device.record_invalid(PollStage::Status);
        assert_eq!(device.state(), OnlineState::Unresponsive);
        assert!(device.status().is_none());
        assert!(device.report().is_none());

        // fresh telemetry alone does not bring the device back
        device.record_telemetry(snapshot(ProtocolVersion::V20));
        assert_eq!(device.state(), OnlineState::Unresponsive);
        device.record_status(StatusBits::default());
        assert_eq!(device.state(), OnlineState::Online);
    }

    #[test]
    fn disabled_channels_are_not_published() {
        let mut config = DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20);
        config.disabled_channels.insert(Channel::CellVoltage(2));
        let mut device = Device::new(config);
        device.record_telemetry(snapshot(ProtocolVersion::V20));
        let mut sink = RecordingSink::default();
        device.publish(&mut sink);
        assert_eq!(sink.sensor("bms0", "cell_voltage_1"), Some(3.3));
        assert_eq!(sink.sensor("bms0", "cell_voltage_2"), None);
        assert_eq!(sink.binary("bms0", "online_status"), Some(true));
        assert_eq!(sink.text("bms0", "errors"), None);
    }

    #[test]
    fn status_publication() {
        let mut device = Device::new(DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20));
        device.record_status(StatusBits {
            voltage: 0x01,
            switches: 0x01,
            balancing: 0x0003,
            ..Default::default()
        });
        let mut sink = RecordingSink::default();
        device.publish(&mut sink);
        assert_eq!(sink.binary("bms0", "voltage_protection"), Some(true));
        assert_eq!(sink.binary("bms0", "discharging"), Some(true));
        assert_eq!(sink.binary("bms0", "charging"), Some(false));
        assert_eq!(sink.text("bms0", "errors"), Some("Cell high voltage alarm"));
        assert_eq!(sink.text("bms0", "alarms"), Some(""));
        assert_eq!(sink.sensor("bms0", "balancing_bitmask"), Some(3.0));
    }

    #[test]
    fn offline_values_published_once() {
        let mut config = DeviceConfig::new("bms0", 0x00, ProtocolVersion::V30);
        config.disabled_channels.insert(Channel::Temperature(6));
        let mut device = Device::new(config);
        let mut sink = RecordingSink::default();
        device.publish(&mut sink);
        assert_eq!(sink.calls, 0);

        device.record_telemetry(snapshot(ProtocolVersion::V30));
        device.record_timeout();
        device.publish(&mut sink);
        assert_eq!(sink.binary("bms0", "online_status"), Some(false));
        assert_eq!(sink.binary("bms0", "charging"), Some(false));
        assert_eq!(sink.text("bms0", "errors"), Some("Offline"));
        assert_eq!(sink.text("bms0", "alarms"), Some("Offline"));
        assert!(sink.sensor("bms0", "total_voltage").unwrap().is_nan());
        assert!(sink.sensor("bms0", "temperature_5").unwrap().is_nan());
        assert_eq!(sink.sensor("bms0", "temperature_6"), None);
        assert_eq!(sink.sensor("bms0", "port_voltage"), None);

        let calls = sink.calls;
        device.publish(&mut sink);
        assert_eq!(sink.calls, calls);
    }
}
