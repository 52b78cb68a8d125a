//! Request scheduling on a shared half-duplex bus.
//!
//! A [`Bus`] owns its transport and runs one exchange at a time, so devices
//! sharing the line are polled strictly one after another. The bus holds no
//! clock of its own; the caller drives [`Bus::poll`] or [`Bus::poll_all`]
//! once per polling interval.

use crate::alarm::decode_status;
use crate::device::{Device, DeviceConfig, EntitySink, PollStage};
use crate::frame::{decode_response, encode_request, scan, Frame, Scan};
use crate::protocol::{ProtocolVersion, Query, DEFAULT_RX_TIMEOUT, MINIMUM_DELAY};
use crate::telemetry::decode_telemetry;
use crate::Error;
use std::collections::HashSet;
use std::io;
use std::time::{Duration, Instant};

const READ_INTERVAL: Duration = Duration::from_millis(1);

/// Byte-level access to the serial line.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Returns whatever arrived since the last call, possibly nothing.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;

    /// Drives the transmit-enable line of an RS485 transceiver.
    fn set_flow_control(&mut self, _transmit: bool) -> io::Result<()> {
        Ok(())
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        (**self).write(bytes)
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        (**self).read_available()
    }

    fn set_flow_control(&mut self, transmit: bool) -> io::Result<()> {
        (**self).set_flow_control(transmit)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusSettings {
    /// Time to wait for a complete response
    pub rx_timeout: Duration,
    /// Quiet time between the end of one exchange and the next request
    pub turnaround_delay: Duration,
    /// Toggle the transmit-enable line around every write
    pub flow_control: bool,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            rx_timeout: DEFAULT_RX_TIMEOUT,
            turnaround_delay: MINIMUM_DELAY,
            flow_control: false,
        }
    }
}

/// What a poll cycle did to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Telemetry and status were decoded.
    Updated,
    /// No answer, retry included.
    Unresponsive,
    /// The answer could not be framed or decoded; the cycle was skipped.
    InvalidResponse,
}

/// Collects devices before the bus is opened. Addresses must be unique per bus.
#[derive(Debug, Default)]
pub struct BusBuilder {
    settings: BusSettings,
    devices: Vec<DeviceConfig>,
    addresses: HashSet<u8>,
}

impl BusBuilder {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            ..Default::default()
        }
    }

    pub fn add_device(&mut self, config: DeviceConfig) -> Result<&mut Self, Error> {
        if !self.addresses.insert(config.address) {
            log::error!(
                "Device '{}' uses address {:#04X} which is already taken",
                config.name,
                config.address
            );
            return Err(Error::DuplicateAddress(config.address));
        }
        self.devices.push(config);
        Ok(self)
    }

    /// Settings with the turnaround delay clamped to the minimum, and the devices.
    pub(crate) fn into_parts(self) -> (BusSettings, Vec<Device>) {
        let mut settings = self.settings;
        settings.turnaround_delay = Duration::max(settings.turnaround_delay, MINIMUM_DELAY);
        (settings, self.devices.into_iter().map(Device::new).collect())
    }

    pub fn build<T: Transport>(self, transport: T) -> Bus<T> {
        let (settings, devices) = self.into_parts();
        Bus {
            transport,
            settings,
            devices,
            last_exchange: None,
        }
    }
}

/// Turns a device-level failure into a poll outcome and records it on the
/// device. Anything else is a transport failure and is passed on.
pub(crate) fn record_failure<V>(
    device: &mut Device,
    stage: PollStage,
    result: Result<V, Error>,
) -> Result<Result<V, PollOutcome>, Error> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(Error::Timeout) => {
            device.record_timeout();
            Ok(Err(PollOutcome::Unresponsive))
        }
        Err(err @ (Error::Frame(_) | Error::Decode(_))) => {
            log::warn!("Skipping cycle of device '{}' at {stage:?}: {err}", device.name());
            device.record_invalid(stage);
            Ok(Err(PollOutcome::InvalidResponse))
        }
        Err(err) => Err(err),
    }
}

#[derive(Debug)]
pub struct Bus<T> {
    transport: T,
    settings: BusSettings,
    devices: Vec<Device>,
    last_exchange: Option<Instant>,
}

impl<T: Transport> Bus<T> {
    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn await_turnaround(&self) {
        if let Some(last_exchange) = self.last_exchange {
            let elapsed = Instant::now().duration_since(last_exchange);
            if let Some(remaining) = self.settings.turnaround_delay.checked_sub(elapsed) {
                std::thread::sleep(remaining);
            }
        }
    }

    fn drain(&mut self) -> Result<(), Error> {
        // clear all incoming bytes to avoid mixing a late answer into the next one
        loop {
            let stale = self.transport.read_available()?;
            if stale.is_empty() {
                return Ok(());
            }
            log::trace!("Dropped {} stale bytes: {:02X?}", stale.len(), stale);
        }
    }

    fn send(&mut self, request: &[u8]) -> Result<(), Error> {
        if self.settings.flow_control {
            self.transport.set_flow_control(true)?;
        }
        let written = self.transport.write(request);
        if self.settings.flow_control {
            self.transport.set_flow_control(false)?;
        }
        Ok(written?)
    }

    fn receive(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        query: &Query,
    ) -> Result<Frame, Error> {
        let deadline = Instant::now() + self.settings.rx_timeout;
        let mut buffer = Vec::new();
        loop {
            buffer.extend(self.transport.read_available()?);
            match scan(version, &buffer)? {
                Scan::Complete(len) => {
                    log::trace!("receive: {:02X?}", &buffer[..len]);
                    return Ok(decode_response(version, &buffer[..len], address, query)?);
                }
                Scan::Discard(len) => {
                    log::trace!("Discarding {len} bytes of garbage");
                    buffer.drain(..len);
                    continue;
                }
                Scan::Incomplete => {}
            }
            if Instant::now() >= deadline {
                if !buffer.is_empty() {
                    log::debug!("Incomplete response: {:02X?}", buffer);
                }
                return Err(Error::Timeout);
            }
            std::thread::sleep(READ_INTERVAL);
        }
    }

    /// Runs one request/response exchange without retry.
    pub fn exchange(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        query: &Query,
    ) -> Result<Frame, Error> {
        let request = encode_request(version, address, query);
        self.await_turnaround();
        self.drain()?;
        self.send(&request)?;
        let result = self.receive(version, address, query);
        self.last_exchange = Some(Instant::now());
        result
    }

    /// Runs an exchange and repeats the identical request once on timeout.
    pub fn exchange_with_retry(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        query: &Query,
    ) -> Result<Frame, Error> {
        match self.exchange(version, address, query) {
            Err(Error::Timeout) => {
                log::debug!("No response from address {address:#04X}, retrying");
                self.exchange(version, address, query)
            }
            result => result,
        }
    }

    fn query_payload(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        queries: &[Query],
    ) -> Result<Vec<u8>, Error> {
        let mut payload = Vec::new();
        for query in queries {
            payload.extend(self.exchange_with_retry(version, address, query)?.payload);
        }
        Ok(payload)
    }

    /// Polls telemetry and status of one device and updates its state.
    /// Transport failures are returned; device-level failures are folded
    /// into the outcome.
    pub fn poll(&mut self, index: usize) -> Result<PollOutcome, Error> {
        let device = self.devices.get(index).ok_or(Error::UnknownDevice(index))?;
        let version = device.protocol_version();
        let address = device.address();
        let cell_count_override = device.config().cell_count_override;

        let telemetry = self
            .query_payload(version, address, version.telemetry_queries())
            .and_then(|payload| Ok(decode_telemetry(version, &payload, cell_count_override)?));
        let device = &mut self.devices[index];
        let snapshot = match record_failure(device, PollStage::Telemetry, telemetry)? {
            Ok(snapshot) => snapshot,
            Err(outcome) => return Ok(outcome),
        };
        self.devices[index].record_telemetry(snapshot);

        let status = self
            .query_payload(version, address, version.status_queries())
            .and_then(|payload| Ok(decode_status(version, &payload)?));
        let device = &mut self.devices[index];
        let bits = match record_failure(device, PollStage::Status, status)? {
            Ok(bits) => bits,
            Err(outcome) => return Ok(outcome),
        };
        self.devices[index].record_status(bits);
        Ok(PollOutcome::Updated)
    }

    /// Polls every device in configuration order.
    pub fn poll_all(&mut self) -> Result<Vec<PollOutcome>, Error> {
        (0..self.devices.len()).map(|i| self.poll(i)).collect()
    }

    pub fn publish_all(&mut self, sink: &mut dyn EntitySink) {
        for device in &mut self.devices {
            device.publish(sink);
        }
    }
}
