use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use seplosbms_lib::serialport::DEFAULT_BAUD_RATE;
use std::time::Duration;

pub fn default_device_name() -> String {
    if cfg!(target_os = "windows") {
        String::from("COM1")
    } else {
        String::from("/dev/ttyUSB0")
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Show the decoded telemetry of every device: cell voltages, temperatures, current, SOC
    Telemetry,
    /// Show protection flags, charge/discharge state, errors and alarms of every device
    Status,
    /// Show telemetry and status of every device
    All,
    /// Run in daemon mode, periodically polling the bus and outputting all entities
    Daemon {
        /// Output destination for entities
        #[command(subcommand)]
        output: DaemonOutput,
        /// Interval between two polling cycles (e.g., "10s", "1m")
        #[clap(long, short, value_parser = humantime::parse_duration, default_value = "10s")]
        interval: Duration,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Continuously poll the bus and print entities to the standard output (console).
    Console,
    /// Continuously poll the bus and publish entities to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "seplos bms command line tool"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// Bus configuration file with several devices. Overrides the single device options below.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long, default_value_t = default_device_name())]
    pub device: String,

    /// Serial line speed
    #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
    pub baud_rate: u32,

    /// Bus address of the BMS (e.g., "0", "0x01")
    #[arg(short, long, value_parser = maybe_hex::<u8>, default_value = "0")]
    pub address: u8,

    /// Protocol version tag: 0x20 for V2.0 ASCII, 0x30 for V3.0 Modbus RTU
    #[arg(short, long, value_parser = maybe_hex::<u8>, default_value = "0x20")]
    pub protocol_version: u8,

    /// Number of cells to decode, ignoring the count reported by the BMS
    #[arg(long)]
    pub cells: Option<usize>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Time to wait for a complete response (e.g., "150ms", "1s")
    #[arg(value_parser = humantime::parse_duration, long, default_value = "150ms")]
    pub timeout: Duration,

    // Some USB - RS485 dongles requires at least 10ms to switch between TX and RX, so use a save delay between frames
    /// Delay between two exchanges on the bus (e.g., "20ms", "50ms")
    /// (useful for some serial adapters that need time to switch between TX/RX)
    #[arg(value_parser = humantime::parse_duration, long, default_value = "20ms")]
    pub delay: Duration,

    /// Toggle RTS as transmit enable around every request
    #[arg(long, action)]
    pub flow_control: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_address_and_version() {
        let args = CliArgs::parse_from([
            "seplosbms",
            "--address",
            "0x0A",
            "--protocol-version",
            "0x30",
            "telemetry",
        ]);
        assert_eq!(args.address, 0x0A);
        assert_eq!(args.protocol_version, 0x30);
        assert_eq!(args.command, CliCommands::Telemetry);
        assert_eq!(args.timeout, Duration::from_millis(150));
    }

    #[test]
    fn daemon_mqtt_defaults() {
        let args = CliArgs::parse_from(["seplosbms", "daemon", "--interval", "1m", "mqtt"]);
        assert_eq!(
            args.command,
            CliCommands::Daemon {
                output: DaemonOutput::Mqtt {
                    config_file: mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string(),
                    format: MqttFormat::Simple,
                },
                interval: Duration::from_secs(60),
            }
        );
    }
}
