use crate::commandline::{self, CliArgs};
use anyhow::{Context, Result};
use seplosbms_lib::device::DeviceConfig;
use seplosbms_lib::protocol::{ProtocolVersion, DEFAULT_RX_TIMEOUT, MINIMUM_DELAY};
use seplosbms_lib::scheduler::{Bus, BusBuilder, BusSettings};
use seplosbms_lib::serialport::{SerialTransport, DEFAULT_BAUD_RATE};
use serde::Deserialize;
use std::time::Duration;

/// Serial line and the devices attached to it.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BusConfig {
    #[serde(default = "commandline::default_device_name")]
    device: String,
    #[serde(default = "BusConfig::default_baud_rate")]
    baud_rate: u32,
    #[serde(default = "BusConfig::default_rx_timeout", with = "humantime_serde")]
    rx_timeout: Duration,
    #[serde(
        default = "BusConfig::default_turnaround_delay",
        with = "humantime_serde"
    )]
    turnaround_delay: Duration,
    #[serde(default)]
    flow_control: bool,
    devices: Vec<DeviceConfig>,
}

impl BusConfig {
    fn default_baud_rate() -> u32 {
        DEFAULT_BAUD_RATE
    }

    fn default_rx_timeout() -> Duration {
        DEFAULT_RX_TIMEOUT
    }

    fn default_turnaround_delay() -> Duration {
        MINIMUM_DELAY
    }

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open bus config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read bus config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    /// A bus with the single device described on the command line.
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let version = ProtocolVersion::try_from(args.protocol_version)
            .with_context(|| format!("Invalid protocol version {:#04X}", args.protocol_version))?;
        let mut device = DeviceConfig::new(
            format!("seplos{:02x}", args.address),
            args.address,
            version,
        );
        device.cell_count_override = args.cells;
        Ok(Self {
            device: args.device.clone(),
            baud_rate: args.baud_rate,
            rx_timeout: args.timeout,
            turnaround_delay: args.delay,
            flow_control: args.flow_control,
            devices: vec![device],
        })
    }

    pub fn settings(&self) -> BusSettings {
        BusSettings {
            rx_timeout: self.rx_timeout,
            turnaround_delay: self.turnaround_delay,
            flow_control: self.flow_control,
        }
    }

    pub fn builder(&self) -> Result<BusBuilder> {
        let mut builder = BusBuilder::new(self.settings());
        for device in &self.devices {
            builder
                .add_device(device.clone())
                .with_context(|| format!("Cannot add device '{}'", device.name))?;
        }
        Ok(builder)
    }

    pub fn open(&self) -> Result<Bus<SerialTransport>> {
        let builder = self.builder()?;
        let transport = SerialTransport::new(&self.device, self.baud_rate)
            .with_context(|| format!("Cannot open serial port '{}'", self.device))?;
        Ok(builder.build(transport))
    }
}
