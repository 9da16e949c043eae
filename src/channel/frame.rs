//! Mailbox frame encoding
//!
//! Every frame is a fixed 16-byte little-endian header followed by a payload:
//!
//! ```text
//! command:  version:u8 | opcode:u8 | reserved:u16 | session:u32 | correlation:u32 | len:u32 | payload
//! response: version:u8 | status:u8 | reserved:u16 | session:u32 | correlation:u32 | len:u32 | payload
//! ```
//!
//! The correlation id lets the host drop replies that belong to a request it
//! already gave up on.

use crate::error::TokenError;

pub const FRAME_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 16;

/// Command selector understood by the enclave firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Ping = 0x01,
    GetRandom = 0x02,
    GenerateKeyPair = 0x10,
    DeleteKey = 0x11,
    Sign = 0x20,
    Verify = 0x21,
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Opcode::Ping),
            0x02 => Ok(Opcode::GetRandom),
            0x10 => Ok(Opcode::GenerateKeyPair),
            0x11 => Ok(Opcode::DeleteKey),
            0x20 => Ok(Opcode::Sign),
            0x21 => Ok(Opcode::Verify),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// Completion status reported by the enclave
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0x00,
    InvalidKey = 0x01,
    Unsupported = 0x02,
    BadSignature = 0x03,
    Failure = 0xFF,
}

impl TryFrom<u8> for Status {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Status::Ok),
            0x01 => Ok(Status::InvalidKey),
            0x02 => Ok(Status::Unsupported),
            0x03 => Ok(Status::BadSignature),
            0xFF => Ok(Status::Failure),
            other => Err(FrameError::UnknownStatus(other)),
        }
    }
}

/// Wire decoding failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame truncated: needed {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("unsupported frame version {0}")]
    Version(u8),

    #[error("unknown opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    #[error("unknown status 0x{0:02X}")]
    UnknownStatus(u8),

    #[error("declared payload length {declared} but {actual} bytes follow")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("payload length {0} does not fit the frame")]
    Oversized(usize),
}

impl From<FrameError> for TokenError {
    fn from(err: FrameError) -> Self {
        TokenError::DeviceError(err.to_string())
    }
}

/// A request headed for the enclave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub opcode: Opcode,
    pub session: u32,
    /// Assigned by the channel at submit time
    pub correlation: u32,
    pub payload: Vec<u8>,
}

impl Command {
    pub fn new(opcode: Opcode, session: u32, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            session,
            correlation: 0,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.opcode as u8, self.session, self.correlation, &self.payload)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(bytes)?;
        Ok(Self {
            opcode: Opcode::try_from(header.kind)?,
            session: header.session,
            correlation: header.correlation,
            payload: header.payload.to_vec(),
        })
    }
}

/// A reply from the enclave
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub session: u32,
    pub correlation: u32,
    pub payload: Vec<u8>,
}

impl Response {
    /// Build the reply to `command`, echoing its routing fields
    pub fn reply(command: &Command, status: Status, payload: Vec<u8>) -> Self {
        Self {
            status,
            session: command.session,
            correlation: command.correlation,
            payload,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.status as u8, self.session, self.correlation, &self.payload)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        let header = Header::parse(bytes)?;
        Ok(Self {
            status: Status::try_from(header.kind)?,
            session: header.session,
            correlation: header.correlation,
            payload: header.payload.to_vec(),
        })
    }

    pub fn is_ok(&self) -> bool {
        self.status == Status::Ok
    }
}

struct Header<'a> {
    kind: u8,
    session: u32,
    correlation: u32,
    payload: &'a [u8],
}

impl<'a> Header<'a> {
    fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_LEN {
            return Err(FrameError::Truncated {
                needed: HEADER_LEN,
                got: bytes.len(),
            });
        }
        if bytes[0] != FRAME_VERSION {
            return Err(FrameError::Version(bytes[0]));
        }
        let mut reader = PayloadReader::new(&bytes[4..HEADER_LEN]);
        let session = reader.u32()?;
        let correlation = reader.u32()?;
        let declared = reader.u32()? as usize;
        let payload = &bytes[HEADER_LEN..];
        if declared != payload.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: payload.len(),
            });
        }
        Ok(Self {
            kind: bytes[1],
            session,
            correlation,
            payload,
        })
    }
}

fn encode_frame(
    kind: u8,
    session: u32,
    correlation: u32,
    payload: &[u8],
) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized(payload.len()))?;
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.push(FRAME_VERSION);
    out.push(kind);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(&session.to_le_bytes());
    out.extend_from_slice(&correlation.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Little-endian payload builder
#[derive(Debug, Default)]
pub struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(mut self, value: u8) -> Self {
        self.buf.push(value);
        self
    }

    pub fn u16(mut self, value: u16) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn u32(mut self, value: u32) -> Self {
        self.buf.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Append `bytes` prefixed with a u16 length
    pub fn bytes16(self, bytes: &[u8]) -> Result<Self, FrameError> {
        let len = u16::try_from(bytes.len()).map_err(|_| FrameError::Oversized(bytes.len()))?;
        let mut this = self.u16(len);
        this.buf.extend_from_slice(bytes);
        Ok(this)
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Little-endian payload cursor
#[derive(Debug)]
pub struct PayloadReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        let end = self.pos + n;
        if end > self.bytes.len() {
            return Err(FrameError::Truncated {
                needed: end,
                got: self.bytes.len(),
            });
        }
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, FrameError> {
        let raw = self.take(2)?;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    pub fn u32(&mut self) -> Result<u32, FrameError> {
        let raw = self.take(4)?;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    /// Read a u16 length prefix followed by that many bytes
    pub fn bytes16(&mut self) -> Result<&'a [u8], FrameError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos..];
        self.pos = self.bytes.len();
        slice
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_layout() {
        let mut cmd = Command::new(Opcode::Sign, 7, vec![0xAA, 0xBB]);
        cmd.correlation = 0x0102_0304;
        let bytes = cmd.encode().unwrap();

        assert_eq!(bytes.len(), HEADER_LEN + 2);
        assert_eq!(bytes[0], FRAME_VERSION);
        assert_eq!(bytes[1], 0x20);
        assert_eq!(&bytes[4..8], &7u32.to_le_bytes());
        assert_eq!(&bytes[8..12], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[12..16], &2u32.to_le_bytes());
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);
    }

    #[test]
    fn test_reply_echoes_routing() {
        let mut cmd = Command::new(Opcode::Ping, 3, vec![1, 2, 3]);
        cmd.correlation = 42;
        let resp = Response::reply(&cmd, Status::BadSignature, Vec::new());
        let decoded = Response::decode(&resp.encode().unwrap()).unwrap();
        assert_eq!(decoded.correlation, 42);
        assert_eq!(decoded.session, 3);
        assert_eq!(decoded.status, Status::BadSignature);
        assert!(!decoded.is_ok());
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            Response::decode(&[1, 0, 0]),
            Err(FrameError::Truncated { .. })
        ));

        let mut bytes = Command::new(Opcode::Ping, 0, vec![9]).encode().unwrap();
        bytes[0] = 2;
        assert_eq!(Command::decode(&bytes), Err(FrameError::Version(2)));

        let mut bytes = Command::new(Opcode::Ping, 0, vec![9]).encode().unwrap();
        bytes[1] = 0x7E;
        assert_eq!(Command::decode(&bytes), Err(FrameError::UnknownOpcode(0x7E)));

        let mut bytes = Command::new(Opcode::Ping, 0, vec![9, 9]).encode().unwrap();
        bytes.pop();
        assert!(matches!(
            Command::decode(&bytes),
            Err(FrameError::LengthMismatch { declared: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_payload_reader_writer() {
        let payload = PayloadWriter::new()
            .u32(0xDEAD_BEEF)
            .bytes16(&[1, 2, 3])
            .unwrap()
            .u8(5)
            .finish();
        let mut reader = PayloadReader::new(&payload);
        assert_eq!(reader.u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(reader.bytes16().unwrap(), &[1, 2, 3]);
        assert_eq!(reader.u8().unwrap(), 5);
        assert!(reader.rest().is_empty());
        assert!(reader.u8().is_err());
    }

    #[test]
    fn test_frame_error_maps_to_device_error() {
        let err: TokenError = FrameError::UnknownStatus(0x44).into();
        assert!(matches!(err, TokenError::DeviceError(msg) if msg.contains("0x44")));
    }
}
