//! Provides an asynchronous bus for polling Seplos BMS devices using Tokio and the
//! `tokio-serial` crate for serial communication.
//!
//! This module is suitable for applications built on the Tokio runtime. It follows
//! the same exchange rules as the synchronous [`Bus`](crate::scheduler::Bus): one
//! request at a time, a turnaround pause between exchanges, stale input dropped before
//! every request and a single retry of the identical frame after a timeout.
//!
//! # Example
//!
//! ```no_run
//! use seplosbms_lib::device::DeviceConfig;
//! use seplosbms_lib::protocol::ProtocolVersion;
//! use seplosbms_lib::scheduler::{BusBuilder, BusSettings};
//! use seplosbms_lib::tokio_serial_async::{AsyncBus, Error};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let mut builder = BusBuilder::new(BusSettings::default());
//!     builder.add_device(DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20))?;
//!     builder.add_device(DeviceConfig::new("bms1", 0x01, ProtocolVersion::V30))?;
//!     let mut bus = AsyncBus::open(builder, "/dev/ttyUSB0", 19200)?;
//!
//!     let outcomes = bus.poll_all().await?;
//!     println!("Outcomes: {:?}", outcomes);
//!
//!     for device in bus.devices() {
//!         println!("{}: {:?}", device.name(), device.report());
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::alarm::decode_status;
use crate::device::{Device, EntitySink, PollStage};
use crate::frame::{decode_response, encode_request, scan, Frame, Scan};
use crate::protocol::{ProtocolVersion, Query};
use crate::scheduler::{record_failure, BusBuilder, BusSettings, PollOutcome};
use crate::telemetry::decode_telemetry;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_serial::{SerialPort, SerialPortBuilderExt};

/// Errors specific to the asynchronous Tokio bus.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error originating from the Seplos protocol layer.
    #[error("Seplos error: {0}")]
    Seplos(#[from] crate::Error),
    /// An error from the `tokio-serial` crate.
    #[error("Tokio serial error: {0}")]
    TokioSerial(#[from] tokio_serial::Error),
}

/// A specialized `Result` type for operations within the `tokio_serial_async` module.
type Result<T> = std::result::Result<T, Error>;

/// A byte stream the asynchronous bus can run on.
///
/// Implemented for [`tokio_serial::SerialStream`] and for Tokio's in-memory
/// [`DuplexStream`](tokio::io::DuplexStream), which is handy for simulations.
pub trait AsyncLink: AsyncRead + AsyncWrite + Unpin + Send {
    /// Drives the transmit-enable line of an RS485 transceiver.
    fn set_flow_control(&mut self, _transmit: bool) -> io::Result<()> {
        Ok(())
    }
}

impl AsyncLink for tokio_serial::SerialStream {
    fn set_flow_control(&mut self, transmit: bool) -> io::Result<()> {
        self.write_request_to_send(transmit).map_err(io::Error::from)
    }
}

impl AsyncLink for tokio::io::DuplexStream {}

/// The main struct for polling Seplos BMS devices asynchronously.
///
/// It owns the link and the devices registered through a [`BusBuilder`].
/// Exchanges are strictly sequential; every method that touches the line
/// takes `&mut self`.
#[derive(Debug)]
pub struct AsyncBus<L> {
    link: L,
    settings: BusSettings,
    devices: Vec<Device>,
    last_exchange: Option<Instant>,
}

impl AsyncBus<tokio_serial::SerialStream> {
    /// Opens a serial port for asynchronous use and attaches the devices of `builder`.
    ///
    /// # Arguments
    ///
    /// * `builder`: The devices and bus settings.
    /// * `port`: The path to the serial port device (e.g., `/dev/ttyUSB0` on Linux, `COM3` on Windows).
    /// * `baud_rate`: Line speed, Seplos packs default to 19200.
    ///
    /// # Returns
    ///
    /// A `Result` containing the `AsyncBus` instance or an `Error` if the serial port
    /// cannot be opened or configured for asynchronous operation.
    pub fn open(builder: BusBuilder, port: &str, baud_rate: u32) -> Result<Self> {
        let serial = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;
        log::debug!("Opened serial port '{port}' at {baud_rate} baud");
        Ok(Self::new(builder, serial))
    }
}

impl<L: AsyncLink> AsyncBus<L> {
    /// Creates a bus on an already opened link.
    pub fn new(builder: BusBuilder, link: L) -> Self {
        let (settings, devices) = builder.into_parts();
        Self {
            link,
            settings,
            devices,
            last_exchange: None,
        }
    }

    pub fn settings(&self) -> &BusSettings {
        &self.settings
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Option<&Device> {
        self.devices.get(index)
    }

    pub fn into_link(self) -> L {
        self.link
    }

    /// Waits until the turnaround delay since the last exchange has passed.
    async fn await_turnaround(&self) {
        if let Some(last_exchange) = self.last_exchange {
            let elapsed = Instant::now().duration_since(last_exchange);
            if let Some(remaining) = self.settings.turnaround_delay.checked_sub(elapsed) {
                tokio::time::sleep(remaining).await;
            }
        }
    }

    /// Drops whatever is already waiting on the line.
    async fn drain(&mut self) -> io::Result<()> {
        let mut scratch = [0u8; 64];
        loop {
            match tokio::time::timeout(Duration::ZERO, self.link.read(&mut scratch)).await {
                Ok(Ok(0)) | Err(_) => return Ok(()),
                Ok(Ok(n)) => log::trace!("Dropped {n} stale bytes: {:02X?}", &scratch[..n]),
                Ok(Err(err)) => return Err(err),
            }
        }
    }

    async fn send(&mut self, request: &[u8]) -> io::Result<()> {
        if self.settings.flow_control {
            self.link.set_flow_control(true)?;
        }
        log::trace!("write bytes: {request:02X?}");
        let written = async {
            self.link.write_all(request).await?;
            self.link.flush().await
        }
        .await;
        if self.settings.flow_control {
            self.link.set_flow_control(false)?;
        }
        written
    }

    async fn receive(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        query: &Query,
    ) -> std::result::Result<Frame, crate::Error> {
        let deadline = tokio::time::Instant::now() + self.settings.rx_timeout;
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 64];
        loop {
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
            match tokio::time::timeout_at(deadline, self.link.read(&mut chunk)).await {
                Ok(Ok(0)) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
                Ok(Ok(n)) => buffer.extend_from_slice(&chunk[..n]),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => {
                    if !buffer.is_empty() {
                        log::debug!("Incomplete response: {:02X?}", buffer);
                    }
                    return Err(crate::Error::Timeout);
                }
            }
        }
    }

    async fn exchange_once(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        query: &Query,
    ) -> std::result::Result<Frame, crate::Error> {
        let request = encode_request(version, address, query);
        self.await_turnaround().await;
        self.drain().await?;
        self.send(&request).await?;
        let result = self.receive(version, address, query).await;
        self.last_exchange = Some(Instant::now());
        result
    }

    async fn exchange_with_retry(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        query: &Query,
    ) -> std::result::Result<Frame, crate::Error> {
        match self.exchange_once(version, address, query).await {
            Err(crate::Error::Timeout) => {
                log::debug!("No response from address {address:#04X}, retrying");
                self.exchange_once(version, address, query).await
            }
            result => result,
        }
    }

    /// Runs one request/response exchange, repeating the identical request once on timeout.
    pub async fn exchange(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        query: &Query,
    ) -> Result<Frame> {
        Ok(self.exchange_with_retry(version, address, query).await?)
    }

    async fn query_payload(
        &mut self,
        version: ProtocolVersion,
        address: u8,
        queries: &[Query],
    ) -> std::result::Result<Vec<u8>, crate::Error> {
        let mut payload = Vec::new();
        for query in queries {
            payload.extend(self.exchange_with_retry(version, address, query).await?.payload);
        }
        Ok(payload)
    }

    /// Polls telemetry and status of one device and updates its state.
    ///
    /// # Returns
    ///
    /// The outcome of the cycle. Timeouts and malformed answers are recorded on
    /// the device and reported as an outcome; only link failures become an `Error`.
    pub async fn poll(&mut self, index: usize) -> Result<PollOutcome> {
        let device = self
            .devices
            .get(index)
            .ok_or(crate::Error::UnknownDevice(index))?;
        let version = device.protocol_version();
        let address = device.address();
        let cell_count_override = device.config().cell_count_override;

        let telemetry = match self
            .query_payload(version, address, version.telemetry_queries())
            .await
        {
            Ok(payload) => decode_telemetry(version, &payload, cell_count_override)
                .map_err(crate::Error::from),
            Err(err) => Err(err),
        };
        let device = &mut self.devices[index];
        let snapshot = match record_failure(device, PollStage::Telemetry, telemetry)? {
            Ok(snapshot) => snapshot,
            Err(outcome) => return Ok(outcome),
        };
        self.devices[index].record_telemetry(snapshot);

        let status = match self
            .query_payload(version, address, version.status_queries())
            .await
        {
            Ok(payload) => decode_status(version, &payload).map_err(crate::Error::from),
            Err(err) => Err(err),
        };
        let device = &mut self.devices[index];
        let bits = match record_failure(device, PollStage::Status, status)? {
            Ok(bits) => bits,
            Err(outcome) => return Ok(outcome),
        };
        self.devices[index].record_status(bits);
        Ok(PollOutcome::Updated)
    }

    /// Polls every device in configuration order.
    pub async fn poll_all(&mut self) -> Result<Vec<PollOutcome>> {
        let mut outcomes = Vec::with_capacity(self.devices.len());
        for index in 0..self.devices.len() {
            outcomes.push(self.poll(index).await?);
        }
        Ok(outcomes)
    }

    pub fn publish_all(&mut self, sink: &mut dyn EntitySink) {
        for device in &mut self.devices {
            device.publish(sink);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, OnlineState};
    use crate::frame::{encode_ascii_response, encode_rtu_response};
    use crate::protocol::{READ_COILS, READ_INPUT_REGISTERS};
    use crate::telemetry::{encode_telemetry, Channel, TelemetrySnapshot};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    fn settings() -> BusSettings {
        BusSettings {
            rx_timeout: Duration::from_millis(30),
            ..Default::default()
        }
    }

    fn snapshot(version: ProtocolVersion) -> Vec<u8> {
        let table = version.table();
        let mut snapshot = TelemetrySnapshot::default();
        snapshot.set(table, Channel::CellVoltage(1), 3.310);
        snapshot.set(table, Channel::CellVoltage(2), 3.305);
        snapshot.set(table, Channel::Temperature(1), 21.0);
        snapshot.set(table, Channel::TotalVoltage, 6.61);
        snapshot.set(table, Channel::Current, 2.0);
        encode_telemetry(version, &snapshot).unwrap()
    }

    fn end_of_request(version: ProtocolVersion, request: &[u8]) -> bool {
        match version {
            ProtocolVersion::V20 => request.ends_with(b"\r"),
            ProtocolVersion::V30 => request.len() >= 8,
        }
    }

    /// Simulated device: answers each request with the next scripted response,
    /// `None` leaves the request unanswered. Returns the requests it received
    /// together with its end of the link so the line stays open.
    fn serve(
        mut peer: DuplexStream,
        version: ProtocolVersion,
        responses: Vec<Option<Vec<u8>>>,
    ) -> JoinHandle<(Vec<Vec<u8>>, DuplexStream)> {
        tokio::spawn(async move {
            let mut requests = Vec::new();
            let mut chunk = [0u8; 64];
            for response in responses {
                let mut request = Vec::new();
                while !end_of_request(version, &request) {
                    let n = peer.read(&mut chunk).await.unwrap();
                    request.extend_from_slice(&chunk[..n]);
                }
                requests.push(request);
                if let Some(response) = response {
                    peer.write_all(&response).await.unwrap();
                }
            }
            (requests, peer)
        })
    }

    fn bus(config: DeviceConfig, link: DuplexStream) -> AsyncBus<DuplexStream> {
        let mut builder = BusBuilder::new(settings());
        builder.add_device(config).unwrap();
        AsyncBus::new(builder, link)
    }

    #[tokio::test]
    async fn v20_poll_cycle() {
        let (link, peer) = tokio::io::duplex(1024);
        let mut status = vec![0u8; 64];
        status[29] = 0x02;
        let device = serve(
            peer,
            ProtocolVersion::V20,
            vec![
                Some(encode_ascii_response(0x02, 0x00, &snapshot(ProtocolVersion::V20))),
                Some(encode_ascii_response(0x02, 0x00, &status)),
            ],
        );
        let mut bus = bus(DeviceConfig::new("bms", 0x02, ProtocolVersion::V20), link);

        assert_eq!(bus.poll_all().await.unwrap(), vec![PollOutcome::Updated]);
        let (requests, _peer) = device.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(
            requests[0],
            encode_request(
                ProtocolVersion::V20,
                0x02,
                &ProtocolVersion::V20.telemetry_queries()[0]
            )
        );

        let device = bus.device(0).unwrap();
        assert_eq!(device.state(), OnlineState::Online);
        let snapshot = device.snapshot().unwrap();
        assert_eq!(snapshot.value(Channel::MaxVoltageCell), Some(1.0));
        assert!((snapshot.value(Channel::ChargingPower).unwrap() - 13.22).abs() < 0.001);
        assert!(device.report().unwrap().charging);
    }

    #[tokio::test]
    async fn silent_device_is_retried_once() {
        let (link, peer) = tokio::io::duplex(1024);
        let device = serve(peer, ProtocolVersion::V20, vec![None, None]);
        let mut bus = bus(DeviceConfig::new("bms", 0x05, ProtocolVersion::V20), link);

        assert_eq!(bus.poll(0).await.unwrap(), PollOutcome::Unresponsive);
        let (requests, _peer) = device.await.unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0], requests[1]);
        assert_eq!(bus.device(0).unwrap().state(), OnlineState::Unresponsive);
    }

    #[tokio::test]
    async fn v30_poll_cycle() {
        let (link, peer) = tokio::io::duplex(1024);
        let version = ProtocolVersion::V30;
        let telemetry = snapshot(version);
        let mut responses = Vec::new();
        let mut offset = 0;
        for query in version.telemetry_queries() {
            let len = query.response_len().unwrap();
            responses.push(Some(encode_rtu_response(
                0x01,
                READ_INPUT_REGISTERS,
                &telemetry[offset..offset + len],
            )));
            offset += len;
        }
        for query in version.status_queries() {
            let len = query.response_len().unwrap();
            let function = if query.command == READ_COILS {
                READ_COILS
            } else {
                READ_INPUT_REGISTERS
            };
            responses.push(Some(encode_rtu_response(0x01, function, &vec![0u8; len])));
        }
        let expected_requests = responses.len();
        let device = serve(peer, version, responses);
        let mut bus = bus(DeviceConfig::new("bms", 0x01, version), link);

        assert_eq!(bus.poll(0).await.unwrap(), PollOutcome::Updated);
        let (requests, _peer) = device.await.unwrap();
        assert_eq!(requests.len(), expected_requests);
        let snapshot = bus.device(0).unwrap().snapshot().unwrap();
        assert_eq!(snapshot.value(Channel::CellVoltage(2)), Some(3.305));
        assert_eq!(bus.device(0).unwrap().report().unwrap().errors, "");
    }

    #[tokio::test]
    async fn stale_bytes_are_dropped_before_request() {
        let (link, mut peer) = tokio::io::duplex(1024);
        peer.write_all(b"~2001460000\r").await.unwrap();
        let status = vec![0u8; 64];
        let device = serve(
            peer,
            ProtocolVersion::V20,
            vec![
                Some(encode_ascii_response(0x00, 0x00, &snapshot(ProtocolVersion::V20))),
                Some(encode_ascii_response(0x00, 0x00, &status)),
            ],
        );
        let mut bus = bus(DeviceConfig::new("bms", 0x00, ProtocolVersion::V20), link);

        assert_eq!(bus.poll(0).await.unwrap(), PollOutcome::Updated);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_device_index() {
        let (link, _peer) = tokio::io::duplex(64);
        let mut bus = bus(DeviceConfig::new("bms", 0x00, ProtocolVersion::V20), link);
        assert!(matches!(
            bus.poll(3).await,
            Err(Error::Seplos(crate::Error::UnknownDevice(3)))
        ));
    }
}
