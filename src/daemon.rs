use anyhow::{Context, Result};
use log::{error, info};
use seplosbms_lib::device::EntitySink;
use seplosbms_lib::scheduler::{Bus, Transport};
use serde_json::json;
use std::collections::BTreeMap;

use crate::{commandline, mqtt};

/// Prints every entity as `device/name: value`.
struct ConsoleSink;

impl EntitySink for ConsoleSink {
    fn publish_sensor(&mut self, device: &str, name: &str, value: f32) {
        println!("{device}/{name}: {value}");
    }

    fn publish_binary_sensor(&mut self, device: &str, name: &str, value: bool) {
        println!("{device}/{name}: {value}");
    }

    fn publish_text_sensor(&mut self, device: &str, name: &str, value: &str) {
        println!("{device}/{name}: {value:?}");
    }
}

/// Publishes every entity on its own topic `<base>/<device>/<name>`.
struct SimpleMqttSink<'a> {
    publisher: &'a mut mqtt::MqttPublisher,
}

impl SimpleMqttSink<'_> {
    fn publish(&mut self, device: &str, name: &str, payload: &str) {
        let topic = format!("{}/{device}/{name}", self.publisher.topic());
        if let Err(e) = self.publisher.publish(&topic, payload) {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    }
}

impl EntitySink for SimpleMqttSink<'_> {
    fn publish_sensor(&mut self, device: &str, name: &str, value: f32) {
        self.publish(device, name, &value.to_string());
    }

    fn publish_binary_sensor(&mut self, device: &str, name: &str, value: bool) {
        self.publish(device, name, if value { "ON" } else { "OFF" });
    }

    fn publish_text_sensor(&mut self, device: &str, name: &str, value: &str) {
        self.publish(device, name, value);
    }
}

/// Collects the entities of one cycle into one JSON object per device.
/// Unavailable sensor values (NaN) become `null`.
#[derive(Debug, Default)]
struct JsonSink {
    devices: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

impl JsonSink {
    fn insert(&mut self, device: &str, name: &str, value: serde_json::Value) {
        self.devices
            .entry(device.to_string())
            .or_default()
            .insert(name.to_string(), value);
    }

    /// Drains the collected documents as `(device, payload)`, each stamped with `timestamp`.
    fn take_documents(&mut self, timestamp: &str) -> Result<Vec<(String, String)>> {
        std::mem::take(&mut self.devices)
            .into_iter()
            .map(|(device, mut entities)| {
                entities.insert("timestamp".to_string(), json!(timestamp));
                let payload = serde_json::to_string(&entities)
                    .with_context(|| format!("Failed to serialize entities of '{device}'"))?;
                Ok((device, payload))
            })
            .collect()
    }
}

impl EntitySink for JsonSink {
    fn publish_sensor(&mut self, device: &str, name: &str, value: f32) {
        // serde_json maps non-finite numbers to null
        self.insert(device, name, json!(value));
    }

    fn publish_binary_sensor(&mut self, device: &str, name: &str, value: bool) {
        self.insert(device, name, json!(value));
    }

    fn publish_text_sensor(&mut self, device: &str, name: &str, value: &str) {
        self.insert(device, name, json!(value));
    }
}

enum Output {
    Console,
    Mqtt {
        publisher: mqtt::MqttPublisher,
        format: commandline::MqttFormat,
    },
}

fn poll<T: Transport>(bus: &mut Bus<T>) {
    match bus.poll_all() {
        Ok(outcomes) => {
            for (device, outcome) in bus.devices().iter().zip(outcomes) {
                info!("Polled '{}': {outcome:?}", device.name());
            }
        }
        Err(e) => error!("Polling the bus failed: {e}"),
    }
}

pub fn run<T: Transport>(
    mut bus: Bus<T>,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={output:?}, interval={interval:?}, devices={}",
        bus.devices().len()
    );

    let mut output = match output {
        commandline::DaemonOutput::Console => Output::Console,
        commandline::DaemonOutput::Mqtt {
            config_file,
            format,
        } => {
            let config = mqtt::MqttConfig::load(&config_file)
                .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
            info!("Successfully loaded MQTT config from {config_file}: {config:?}");
            let publisher = mqtt::MqttPublisher::new(config)
                .with_context(|| "Failed to create MQTT publisher")?;
            info!("MQTT Publisher created successfully.");
            Output::Mqtt { publisher, format }
        }
    };

    loop {
        poll(&mut bus);

        match &mut output {
            Output::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                bus.publish_all(&mut ConsoleSink);
                println!("--------------------------");
            }
            Output::Mqtt {
                publisher,
                format: commandline::MqttFormat::Simple,
            } => {
                bus.publish_all(&mut SimpleMqttSink { publisher });
            }
            Output::Mqtt {
                publisher,
                format: commandline::MqttFormat::Json,
            } => {
                let mut sink = JsonSink::default();
                bus.publish_all(&mut sink);
                let timestamp = chrono::Utc::now().to_rfc3339();
                match sink.take_documents(&timestamp) {
                    Ok(documents) if documents.is_empty() => {
                        info!("No data in this cycle to publish via MQTT.");
                    }
                    Ok(documents) => {
                        for (device, payload) in documents {
                            let topic = format!("{}/{device}", publisher.topic());
                            if let Err(e) = publisher.publish(&topic, &payload) {
                                error!("Failed to publish data to MQTT: {e:?}");
                            }
                        }
                    }
                    Err(e) => error!("{e:?}"),
                }
            }
        }
        std::thread::sleep(interval);
    }
}
