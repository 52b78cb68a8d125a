#![cfg_attr(docsrs, feature(doc_cfg))]
//! # seplosbms_lib
//!
//! This crate provides a library for polling Seplos BMS (Battery Management System) devices
//! over an RS485 bus. It frames requests and responses, schedules exchanges on a shared
//! half-duplex line, decodes telemetry into named channels and interprets the alarm bits.
//!
//! Two wire dialects are supported, selected by the protocol-version tag of each device:
//!
//! - `0x20`: Seplos V2.0, hex-ASCII frames with an additive checksum.
//! - `0x30`: Seplos V3.0, Modbus RTU frames with CRC-16.
//!
//! ## Features
//!
//! This crate uses a feature-based system to keep dependencies minimal.
//! You need to enable the transport you want to use.
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `seplosbms` command-line tool and pulls in `serialport` and `serde`.
//!
//! ### Transport Features
//! - `serialport`: Enables the **synchronous** transport using the `serialport` crate.
//! - `tokio-serial-async`: Enables the **asynchronous** bus using `tokio` and `tokio-serial`.
//!
//! ### Utility Features
//! - `serde`: Enables `serde` support for serializing/deserializing data structures.
//! - `bin-dependencies`: Enables all features required by the `seplosbms` binary executable.
//!
//! ## Example
//!
//! ```no_run
//! # #[cfg(feature = "serialport")]
//! # fn main() -> Result<(), seplosbms_lib::Error> {
//! use seplosbms_lib::device::DeviceConfig;
//! use seplosbms_lib::protocol::ProtocolVersion;
//! use seplosbms_lib::scheduler::{BusBuilder, BusSettings};
//! use seplosbms_lib::serialport::SerialTransport;
//!
//! let mut builder = BusBuilder::new(BusSettings::default());
//! builder.add_device(DeviceConfig::new("bms0", 0x00, ProtocolVersion::V20))?;
//! let mut bus = builder.build(SerialTransport::new("/dev/ttyUSB0", 19200)?);
//! bus.poll_all()?;
//! if let Some(snapshot) = bus.device(0).and_then(|d| d.snapshot()) {
//!     for (channel, reading) in snapshot.iter() {
//!         println!("{channel}: {reading}");
//!     }
//! }
//! # Ok(())
//! # }
//! # #[cfg(not(feature = "serialport"))]
//! # fn main() {}
//! ```

/// Alarm and status bit interpretation.
pub mod alarm;
/// Per-device configuration, state and entity publication.
pub mod device;
/// Contains error types for the library.
mod error;
/// Request encoding and response framing.
pub mod frame;
/// Protocol versions, queries and field tables.
pub mod protocol;
/// Request scheduling on a shared bus.
pub mod scheduler;
/// Telemetry channels and payload decoding.
pub mod telemetry;

pub use error::{DecodeError, Error, FrameError};

#[cfg(test)]
mod mock_transport;

/// Synchronous transport over a serial port.
#[cfg_attr(docsrs, doc(cfg(feature = "serialport")))]
#[cfg(feature = "serialport")]
pub mod serialport;

/// Asynchronous bus for Tokio based applications.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
