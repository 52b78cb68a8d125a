//! Request encoding and response framing for both wire dialects.
//!
//! V2.0 frames are hex-ASCII between `~` and `\r`:
//!
//! ```text
//! ~ VER ADR CID1 CID2 LENID INFO CHKSUM \r
//! ```
//!
//! V3.0 frames are plain Modbus RTU with a CRC-16 trailer.

use crate::error::FrameError;
use crate::protocol::{ProtocolVersion, Query, CID1_BATTERY};
use crc16::{State, MODBUS};

const START_BYTE: u8 = b'~';
const END_BYTE: u8 = b'\r';
pub const MAX_RESPONSE_SIZE: usize = 340;
// start + VER ADR CID1 RTN LENID (12 hex chars) + CHKSUM (4 hex chars) + end
const MIN_ASCII_FRAME: usize = 1 + 12 + 4 + 1;
// addr func exception-code crc crc
const MIN_RTU_FRAME: usize = 5;

/// A validated response frame. Length and checksum only exist on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub address: u8,
    /// CID2 of the request (V2.0) or the echoed function code (V3.0)
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Result of scanning the receive buffer for a frame boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// More bytes are needed.
    Incomplete,
    /// A frame occupies the first `n` bytes.
    Complete(usize),
    /// The first `n` bytes can never start a frame and should be dropped.
    Discard(usize),
}

/// Two's complement of the wrapping sum of all ASCII characters after `~`.
pub fn ascii_checksum(body: &[u8]) -> u16 {
    let sum = body
        .iter()
        .fold(0u16, |sum, b| sum.wrapping_add(*b as u16));
    (!sum).wrapping_add(1)
}

/// Builds LENID from the INFO length in ASCII characters: the low 12 bits
/// carry the length, the high nibble the two's complement of its nibble sum.
pub fn length_id(len: u16) -> u16 {
    let len = len & 0x0FFF;
    if len == 0 {
        return 0;
    }
    let sum = (len & 0xF) + ((len >> 4) & 0xF) + ((len >> 8) & 0xF);
    let lchk = (!(sum % 16)).wrapping_add(1) & 0xF;
    (lchk << 12) | len
}

/// CRC-16/MODBUS, transmitted little-endian.
pub fn crc16(buffer: &[u8]) -> u16 {
    State::<MODBUS>::calculate(buffer)
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        _ => b'A' + nibble - 10,
    }
}

fn push_hex(out: &mut Vec<u8>, byte: u8) {
    out.push(hex_digit(byte >> 4));
    out.push(hex_digit(byte & 0x0F));
}

fn nibble(c: u8) -> Result<u8, FrameError> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        _ => Err(FrameError::InvalidHex(c)),
    }
}

fn decode_hex(ascii: &[u8]) -> Result<Vec<u8>, FrameError> {
    ascii
        .chunks(2)
        .map(|pair| {
            let lo = pair.get(1).ok_or(FrameError::InvalidHex(pair[0]))?;
            Ok((nibble(pair[0])? << 4) | nibble(*lo)?)
        })
        .collect()
}

/// Builds the request frame for one query.
pub fn encode_request(version: ProtocolVersion, address: u8, query: &Query) -> Vec<u8> {
    let frame = match version {
        ProtocolVersion::V20 => {
            let info = [address];
            let lenid = length_id((info.len() * 2) as u16);
            let mut body = Vec::with_capacity(14 + info.len() * 2);
            for byte in [
                version.tag(),
                address,
                CID1_BATTERY,
                query.command,
                (lenid >> 8) as u8,
                lenid as u8,
            ]
            .iter()
            .chain(&info)
            {
                push_hex(&mut body, *byte);
            }
            let checksum = ascii_checksum(&body);
            let mut frame = Vec::with_capacity(body.len() + 6);
            frame.push(START_BYTE);
            frame.extend_from_slice(&body);
            push_hex(&mut frame, (checksum >> 8) as u8);
            push_hex(&mut frame, checksum as u8);
            frame.push(END_BYTE);
            frame
        }
        ProtocolVersion::V30 => {
            let mut frame = vec![address, query.command];
            frame.extend_from_slice(&query.register.to_be_bytes());
            frame.extend_from_slice(&query.count.to_be_bytes());
            let crc = crc16(&frame);
            frame.extend_from_slice(&crc.to_le_bytes());
            frame
        }
    };
    log::trace!("encode_request: {:02X?}", frame);
    frame
}

/// Looks for a frame boundary at the start of `buffer`.
pub fn scan(version: ProtocolVersion, buffer: &[u8]) -> Result<Scan, FrameError> {
    match version {
        ProtocolVersion::V20 => {
            if buffer.is_empty() {
                return Ok(Scan::Incomplete);
            }
            if buffer[0] != START_BYTE {
                let garbage = buffer
                    .iter()
                    .position(|b| *b == START_BYTE)
                    .unwrap_or(buffer.len());
                return Ok(Scan::Discard(garbage));
            }
            match buffer.iter().position(|b| *b == END_BYTE) {
                Some(end) if end < MAX_RESPONSE_SIZE => Ok(Scan::Complete(end + 1)),
                Some(_) => Err(FrameError::Oversize(MAX_RESPONSE_SIZE)),
                None if buffer.len() >= MAX_RESPONSE_SIZE => {
                    Err(FrameError::Oversize(MAX_RESPONSE_SIZE))
                }
                None => Ok(Scan::Incomplete),
            }
        }
        ProtocolVersion::V30 => {
            if buffer.len() < 3 {
                return Ok(Scan::Incomplete);
            }
            let len = if buffer[1] & 0x80 != 0 {
                MIN_RTU_FRAME
            } else {
                3 + buffer[2] as usize + 2
            };
            if buffer.len() >= len {
                Ok(Scan::Complete(len))
            } else {
                Ok(Scan::Incomplete)
            }
        }
    }
}

/// Validates one complete response frame against the request it answers.
pub fn decode_response(
    version: ProtocolVersion,
    raw: &[u8],
    expected_address: u8,
    query: &Query,
) -> Result<Frame, FrameError> {
    log::trace!("decode_response: {:02X?}", raw);
    let result = match version {
        ProtocolVersion::V20 => decode_ascii(version, raw, expected_address, query),
        ProtocolVersion::V30 => decode_rtu(raw, expected_address, query),
    };
    if let Err(err) = &result {
        log::warn!("Invalid frame from address {expected_address:#04X} - {err}");
    }
    result
}

fn decode_ascii(
    version: ProtocolVersion,
    raw: &[u8],
    expected_address: u8,
    query: &Query,
) -> Result<Frame, FrameError> {
    if raw.first() != Some(&START_BYTE) {
        return Err(FrameError::MissingStart);
    }
    if raw.last() != Some(&END_BYTE) {
        return Err(FrameError::MissingEnd);
    }
    if raw.len() > MAX_RESPONSE_SIZE {
        return Err(FrameError::Oversize(MAX_RESPONSE_SIZE));
    }
    if raw.len() < MIN_ASCII_FRAME {
        return Err(FrameError::Truncated {
            declared: MIN_ASCII_FRAME,
            received: raw.len(),
        });
    }

    let body = &raw[1..raw.len() - 1];
    let (data, checksum) = body.split_at(body.len() - 4);
    let checksum = decode_hex(checksum)?;
    let received = u16::from_be_bytes([checksum[0], checksum[1]]);
    let calculated = ascii_checksum(data);
    if calculated != received {
        return Err(FrameError::Checksum {
            calculated,
            received,
        });
    }

    let bytes = decode_hex(data)?;
    if bytes[0] != version.tag() {
        return Err(FrameError::VersionMismatch {
            expected: version.tag(),
            received: bytes[0],
        });
    }
    if bytes[1] != expected_address {
        return Err(FrameError::AddressMismatch {
            expected: expected_address,
            received: bytes[1],
        });
    }
    if bytes[3] != 0 {
        return Err(FrameError::ErrorResponse(bytes[3]));
    }

    let lenid = u16::from_be_bytes([bytes[4], bytes[5]]);
    let declared = (lenid & 0x0FFF) as usize;
    if length_id(declared as u16) != lenid {
        return Err(FrameError::Checksum {
            calculated: length_id(declared as u16),
            received: lenid,
        });
    }
    let info = &bytes[6..];
    if info.len() * 2 != declared {
        return Err(FrameError::Truncated {
            declared: declared / 2,
            received: info.len(),
        });
    }

    Ok(Frame {
        address: bytes[1],
        command: query.command,
        payload: info.to_vec(),
    })
}

fn decode_rtu(raw: &[u8], expected_address: u8, query: &Query) -> Result<Frame, FrameError> {
    if raw.len() < MIN_RTU_FRAME {
        return Err(FrameError::Truncated {
            declared: MIN_RTU_FRAME,
            received: raw.len(),
        });
    }

    let (data, crc) = raw.split_at(raw.len() - 2);
    let received = u16::from_le_bytes([crc[0], crc[1]]);
    let calculated = crc16(data);
    if calculated != received {
        return Err(FrameError::Checksum {
            calculated,
            received,
        });
    }

    if data[0] != expected_address {
        return Err(FrameError::AddressMismatch {
            expected: expected_address,
            received: data[0],
        });
    }
    let function = data[1];
    if function == query.command | 0x80 {
        return Err(FrameError::ErrorResponse(data[2]));
    }
    if function != query.command {
        return Err(FrameError::CommandMismatch {
            expected: query.command,
            received: function,
        });
    }

    let declared = data[2] as usize;
    let payload = &data[3..];
    if payload.len() != declared {
        return Err(FrameError::Truncated {
            declared,
            received: payload.len(),
        });
    }

    Ok(Frame {
        address: data[0],
        command: function,
        payload: payload.to_vec(),
    })
}

/// Builds a V2.0 response frame. Used by tests and simulators.
pub fn encode_ascii_response(address: u8, rtn: u8, info: &[u8]) -> Vec<u8> {
    let lenid = length_id((info.len() * 2) as u16);
    let mut body = Vec::with_capacity(12 + info.len() * 2);
    for byte in [
        ProtocolVersion::V20.tag(),
        address,
        CID1_BATTERY,
        rtn,
        (lenid >> 8) as u8,
        lenid as u8,
    ]
    .iter()
    .chain(info)
    {
        push_hex(&mut body, *byte);
    }
    let checksum = ascii_checksum(&body);
    let mut frame = vec![START_BYTE];
    frame.extend_from_slice(&body);
    push_hex(&mut frame, (checksum >> 8) as u8);
    push_hex(&mut frame, checksum as u8);
    frame.push(END_BYTE);
    frame
}

/// Builds a V3.0 read response frame. Used by tests and simulators.
pub fn encode_rtu_response(address: u8, function: u8, data: &[u8]) -> Vec<u8> {
    let mut frame = vec![address, function, data.len() as u8];
    frame.extend_from_slice(data);
    let crc = crc16(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CID2_TELEMETRY, READ_INPUT_REGISTERS};

    #[test]
    fn v20_telemetry_request() {
        let query = Query::command(CID2_TELEMETRY);
        assert_eq!(
            encode_request(ProtocolVersion::V20, 0x00, &query),
            b"~20004642E00200FD37\r".to_vec()
        );
    }

    #[test]
    fn length_checksum() {
        assert_eq!(length_id(0), 0x0000);
        assert_eq!(length_id(2), 0xE002);
        assert_eq!(length_id(0x96), 0x1096);
    }

    #[test]
    fn modbus_crc() {
        // read holding register 0, count 1, slave 1
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]).to_le_bytes(), [0x84, 0x0A]);
        assert_eq!(crc16(&[0x01, 0x03, 0x02, 0x56, 0x78]).to_le_bytes(), [0x87, 0xC6]);
    }

    #[test]
    fn v30_request() {
        let query = Query::read(READ_INPUT_REGISTERS, 0x1000, 0x11);
        let frame = encode_request(ProtocolVersion::V30, 0x01, &query);
        assert_eq!(&frame[..6], &[0x01, 0x04, 0x10, 0x00, 0x00, 0x11]);
        assert_eq!(crc16(&frame[..6]).to_le_bytes(), [frame[6], frame[7]]);
    }

    #[test]
    fn v20_decode() {
        let raw = encode_ascii_response(0x00, 0x00, &[0x00, 0x01, 0x02]);
        let query = Query::command(CID2_TELEMETRY);
        assert_eq!(scan(ProtocolVersion::V20, &raw), Ok(Scan::Complete(raw.len())));
        let frame = decode_response(ProtocolVersion::V20, &raw, 0x00, &query).unwrap();
        assert_eq!(frame.payload, vec![0x00, 0x01, 0x02]);
        assert_eq!(frame.command, CID2_TELEMETRY);
    }

    #[test]
    fn v20_checksum_mismatch() {
        let mut raw = encode_ascii_response(0x00, 0x00, &[0x10, 0x20]);
        let n = raw.len();
        raw[n - 2] = if raw[n - 2] == b'0' { b'1' } else { b'0' };
        let query = Query::command(CID2_TELEMETRY);
        assert!(matches!(
            decode_response(ProtocolVersion::V20, &raw, 0x00, &query),
            Err(FrameError::Checksum { .. })
        ));
    }

    #[test]
    fn v20_address_and_rtn() {
        let query = Query::command(CID2_TELEMETRY);
        let raw = encode_ascii_response(0x02, 0x00, &[0x10]);
        assert_eq!(
            decode_response(ProtocolVersion::V20, &raw, 0x01, &query),
            Err(FrameError::AddressMismatch {
                expected: 0x01,
                received: 0x02
            })
        );
        let raw = encode_ascii_response(0x01, 0x04, &[]);
        assert_eq!(
            decode_response(ProtocolVersion::V20, &raw, 0x01, &query),
            Err(FrameError::ErrorResponse(0x04))
        );
    }

    #[test]
    fn v20_missing_delimiters() {
        let query = Query::command(CID2_TELEMETRY);
        let raw = encode_ascii_response(0x00, 0x00, &[0x10]);
        assert_eq!(
            decode_response(ProtocolVersion::V20, &raw[1..], 0x00, &query),
            Err(FrameError::MissingStart)
        );
        assert_eq!(
            decode_response(ProtocolVersion::V20, &raw[..raw.len() - 1], 0x00, &query),
            Err(FrameError::MissingEnd)
        );
    }

    #[test]
    fn v20_scan_discards_garbage() {
        let mut buffer = vec![0x00, 0xFF, 0x13];
        assert_eq!(scan(ProtocolVersion::V20, &buffer), Ok(Scan::Discard(3)));
        buffer.extend_from_slice(b"~2000");
        assert_eq!(scan(ProtocolVersion::V20, &buffer), Ok(Scan::Discard(3)));
        assert_eq!(scan(ProtocolVersion::V20, &buffer[3..]), Ok(Scan::Incomplete));
        assert_eq!(scan(ProtocolVersion::V20, b"0000\r"), Ok(Scan::Discard(5)));
        let mut long = vec![b'~'];
        long.resize(MAX_RESPONSE_SIZE, b'0');
        assert_eq!(
            scan(ProtocolVersion::V20, &long),
            Err(FrameError::Oversize(MAX_RESPONSE_SIZE))
        );
    }

    #[test]
    fn v30_decode_and_errors() {
        let query = Query::read(READ_INPUT_REGISTERS, 0x1000, 0x01);
        let raw = encode_rtu_response(0x01, READ_INPUT_REGISTERS, &[0x12, 0x34]);
        assert_eq!(scan(ProtocolVersion::V30, &raw[..4]), Ok(Scan::Incomplete));
        assert_eq!(scan(ProtocolVersion::V30, &raw), Ok(Scan::Complete(7)));
        let frame = decode_response(ProtocolVersion::V30, &raw, 0x01, &query).unwrap();
        assert_eq!(frame.payload, vec![0x12, 0x34]);

        let raw = encode_rtu_response(0x01, 0x03, &[0x12, 0x34]);
        assert_eq!(
            decode_response(ProtocolVersion::V30, &raw, 0x01, &query),
            Err(FrameError::CommandMismatch {
                expected: 0x04,
                received: 0x03
            })
        );

        let mut exception = vec![0x01, 0x84, 0x02];
        let crc = crc16(&exception);
        exception.extend_from_slice(&crc.to_le_bytes());
        assert_eq!(scan(ProtocolVersion::V30, &exception), Ok(Scan::Complete(5)));
        assert_eq!(
            decode_response(ProtocolVersion::V30, &exception, 0x01, &query),
            Err(FrameError::ErrorResponse(0x02))
        );
    }

    #[test]
    fn v30_bad_crc() {
        let query = Query::read(READ_INPUT_REGISTERS, 0x1000, 0x01);
        let raw = [0x01, 0x04, 0x02, 0x56, 0x78, 0x00, 0x00];
        assert!(matches!(
            decode_response(ProtocolVersion::V30, &raw, 0x01, &query),
            Err(FrameError::Checksum { received: 0, .. })
        ));
    }
}
