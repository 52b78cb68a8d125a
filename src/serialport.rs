use crate::scheduler::Transport;
use std::io::{self, Read, Write};
use std::time::Duration;

pub const DEFAULT_BAUD_RATE: u32 = 19200;

/// [`Transport`] over a local serial port. RTS drives the RS485 transmit enable.
pub struct SerialTransport {
    serial: Box<dyn ::serialport::SerialPort>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.serial.name())
            .finish()
    }
}

impl SerialTransport {
    pub fn new(port: &str, baud_rate: u32) -> Result<Self, crate::Error> {
        let serial = ::serialport::new(port, baud_rate)
            .data_bits(::serialport::DataBits::Eight)
            .parity(::serialport::Parity::None)
            .stop_bits(::serialport::StopBits::One)
            .flow_control(::serialport::FlowControl::None)
            // reads only fetch what is already buffered
            .timeout(Duration::from_millis(1))
            .open()
            .map_err(io::Error::from)?;
        log::debug!("Opened serial port '{port}' at {baud_rate} baud");
        Ok(Self { serial })
    }
}

impl Transport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        log::trace!("send_bytes: {:02X?}", bytes);
        self.serial.write_all(bytes)?;
        // the transmit line must stay enabled until the last byte left the UART
        self.serial.flush()
    }

    fn read_available(&mut self) -> io::Result<Vec<u8>> {
        let pending = self.serial.bytes_to_read().map_err(io::Error::from)? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buffer = vec![0; pending];
        let received = match self.serial.read(&mut buffer) {
            Ok(received) => received,
            Err(err) if err.kind() == io::ErrorKind::TimedOut => 0,
            Err(err) => return Err(err),
        };
        buffer.truncate(received);
        log::trace!("receive_bytes: {:02X?}", buffer);
        Ok(buffer)
    }

    fn set_flow_control(&mut self, transmit: bool) -> io::Result<()> {
        self.serial
            .write_request_to_send(transmit)
            .map_err(io::Error::from)
    }
}
