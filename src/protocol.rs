//! gpioctl protocol types for fixed-size messages over a UNIX socket.
//!
//! Every message occupies exactly [`MESSAGE_SIZE`] bytes on the wire: a
//! big-endian `u32` type tag followed by a payload region whose layout is
//! selected by the tag. Unused payload bytes are zero. Each read or write
//! transfers one whole message.
//!
//! The protocol is private to this program and carries no version. It may
//! change between builds; client and server are always the same binary.
//!
//! | Tag | Kind      | Payload                                              |
//! |-----|-----------|------------------------------------------------------|
//! | 0   | `OK`      | none                                                 |
//! | 1   | `ERROR`   | `i32` errno                                          |
//! | 2   | `PING`    | none                                                 |
//! | 3   | `STOP`    | none                                                 |
//! | 4   | `REQUEST` | chip path, consumer, count, offsets, values, flags   |
//! | 5   | `REQ_OK`  | 32-byte request identifier                           |
//! | 6   | `RELEASE` | 32-byte request identifier                           |

use serde::Serialize;
use std::fmt;
use std::io::{self, Read, Write};
use std::str::FromStr;

use crate::error::ProtocolError;

/// Maximum number of lines in a single request.
pub const MAX_REQ_LINES: usize = 64;

/// Size of the request identifier field.
pub const MAX_REQ_NAME_SIZE: usize = 32;

/// Size of the chip path field.
pub const MAX_CHIP_PATH_SIZE: usize = 128;

/// Size of the consumer label field.
pub const MAX_CONSUMER_SIZE: usize = 32;

const TAG_SIZE: usize = 4;

const REQUEST_PAYLOAD_SIZE: usize =
    MAX_CHIP_PATH_SIZE + MAX_CONSUMER_SIZE + 4 + MAX_REQ_LINES * 4 + MAX_REQ_LINES + 1;

/// Encoded size of every message, whatever its kind.
pub const MESSAGE_SIZE: usize = TAG_SIZE + REQUEST_PAYLOAD_SIZE;

const _: () = assert!(REQUEST_PAYLOAD_SIZE >= MAX_REQ_NAME_SIZE);

const FLAG_ACTIVE_LOW: u8 = 1 << 0;
const FLAG_OUTPUT: u8 = 1 << 1;

/// Message type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    Ok = 0,
    Error = 1,
    Ping = 2,
    Stop = 3,
    Request = 4,
    ReqOk = 5,
    Release = 6,
}

impl TryFrom<u32> for MessageKind {
    type Error = ProtocolError;

    fn try_from(tag: u32) -> Result<Self, ProtocolError> {
        Ok(match tag {
            0 => MessageKind::Ok,
            1 => MessageKind::Error,
            2 => MessageKind::Ping,
            3 => MessageKind::Stop,
            4 => MessageKind::Request,
            5 => MessageKind::ReqOk,
            6 => MessageKind::Release,
            other => return Err(ProtocolError::UnknownKind(other)),
        })
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageKind::Ok => "OK",
            MessageKind::Error => "ERROR",
            MessageKind::Ping => "PING",
            MessageKind::Stop => "STOP",
            MessageKind::Request => "REQUEST",
            MessageKind::ReqOk => "REQ_OK",
            MessageKind::Release => "RELEASE",
        };
        f.write_str(name)
    }
}

/// Opaque identifier the server hands out for a held line request.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Validate and wrap an identifier.
    pub fn new(id: impl Into<String>) -> Result<Self, ProtocolError> {
        let id = id.into();
        check_string("request identifier", &id, MAX_REQ_NAME_SIZE)?;
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ProtocolError::InvalidString {
                field: "request identifier",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Description of a set of lines to acquire on one chip.
///
/// `values` is always parallel to `offsets`; for input requests it is all
/// zeros and ignored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LineRequestSpec {
    chip_path: String,
    consumer: String,
    offsets: Vec<u32>,
    values: Vec<u8>,
    active_low: bool,
    output: bool,
}

impl LineRequestSpec {
    /// Create an input request for `offsets` on the chip at `chip_path`.
    ///
    /// Fails if the line list is empty, longer than [`MAX_REQ_LINES`], or
    /// repeats an offset, or if the path does not fit its field.
    pub fn new(chip_path: impl Into<String>, offsets: Vec<u32>) -> Result<Self, ProtocolError> {
        let chip_path = chip_path.into();
        check_string("chip path", &chip_path, MAX_CHIP_PATH_SIZE)?;
        check_offsets(&offsets)?;

        Ok(Self {
            chip_path,
            consumer: String::new(),
            values: vec![0; offsets.len()],
            offsets,
            active_low: false,
            output: false,
        })
    }

    /// Set the consumer label reported by the kernel for these lines.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Result<Self, ProtocolError> {
        let consumer = consumer.into();
        check_string("consumer", &consumer, MAX_CONSUMER_SIZE)?;
        self.consumer = consumer;
        Ok(self)
    }

    /// Request the lines as outputs driven to `values`.
    pub fn with_output_values(mut self, values: Vec<u8>) -> Result<Self, ProtocolError> {
        check_values(self.offsets.len(), &values)?;
        self.values = values;
        self.output = true;
        Ok(self)
    }

    pub fn with_active_low(mut self, active_low: bool) -> Self {
        self.active_low = active_low;
        self
    }

    pub fn chip_path(&self) -> &str {
        &self.chip_path
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn values(&self) -> &[u8] {
        &self.values
    }

    pub fn active_low(&self) -> bool {
        self.active_low
    }

    pub fn output(&self) -> bool {
        self.output
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.active_low {
            flags |= FLAG_ACTIVE_LOW;
        }
        if self.output {
            flags |= FLAG_OUTPUT;
        }
        flags
    }

    fn encode_into(&self, enc: &mut Encoder<'_>) {
        enc.put_str(&self.chip_path, MAX_CHIP_PATH_SIZE);
        enc.put_str(&self.consumer, MAX_CONSUMER_SIZE);
        // Bounded by MAX_REQ_LINES at construction.
        enc.put_u32(self.offsets.len() as u32);
        for slot in 0..MAX_REQ_LINES {
            enc.put_u32(self.offsets.get(slot).copied().unwrap_or(0));
        }
        for slot in 0..MAX_REQ_LINES {
            enc.put_u8(self.values.get(slot).copied().unwrap_or(0));
        }
        enc.put_u8(self.flags());
    }

    fn decode_from(dec: &mut Decoder<'_>) -> Result<Self, ProtocolError> {
        let chip_path = dec.take_str("chip path", MAX_CHIP_PATH_SIZE)?;
        let consumer = dec.take_str("consumer", MAX_CONSUMER_SIZE)?;
        let count = dec.take_u32() as usize;
        if count > MAX_REQ_LINES {
            return Err(ProtocolError::TooManyLines {
                count,
                max: MAX_REQ_LINES,
            });
        }

        let all_offsets: Vec<u32> = (0..MAX_REQ_LINES).map(|_| dec.take_u32()).collect();
        let all_values: Vec<u8> = (0..MAX_REQ_LINES).map(|_| dec.take_u8()).collect();
        let flags = dec.take_u8();
        if flags & !(FLAG_ACTIVE_LOW | FLAG_OUTPUT) != 0 {
            return Err(ProtocolError::InvalidFlags(flags));
        }

        let offsets = all_offsets[..count].to_vec();
        let values = all_values[..count].to_vec();
        check_offsets(&offsets)?;
        check_values(count, &values)?;

        Ok(Self {
            chip_path,
            consumer,
            offsets,
            values,
            active_low: flags & FLAG_ACTIVE_LOW != 0,
            output: flags & FLAG_OUTPUT != 0,
        })
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Ok,
    Error { errno: i32 },
    Ping,
    Stop,
    Request(LineRequestSpec),
    ReqOk(RequestId),
    Release(RequestId),
}

impl Message {
    /// Build an ERROR reply from an OS error, falling back to `EIO`.
    pub fn error_from(err: &io::Error) -> Self {
        Message::Error {
            errno: err.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Ok => MessageKind::Ok,
            Message::Error { .. } => MessageKind::Error,
            Message::Ping => MessageKind::Ping,
            Message::Stop => MessageKind::Stop,
            Message::Request(_) => MessageKind::Request,
            Message::ReqOk(_) => MessageKind::ReqOk,
            Message::Release(_) => MessageKind::Release,
        }
    }

    /// Encode into a fixed-size buffer.
    pub fn encode(&self) -> [u8; MESSAGE_SIZE] {
        let mut buf = [0u8; MESSAGE_SIZE];
        let mut enc = Encoder::new(&mut buf);
        enc.put_u32(self.kind() as u32);

        match self {
            Message::Ok | Message::Ping | Message::Stop => {}
            Message::Error { errno } => enc.put_bytes(&errno.to_be_bytes()),
            Message::Request(spec) => spec.encode_into(&mut enc),
            Message::ReqOk(id) | Message::Release(id) => {
                enc.put_str(id.as_str(), MAX_REQ_NAME_SIZE)
            }
        }

        buf
    }

    /// Decode one message from exactly [`MESSAGE_SIZE`] bytes.
    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != MESSAGE_SIZE {
            return Err(ProtocolError::Truncated {
                expected: MESSAGE_SIZE,
                actual: buf.len(),
            });
        }

        let mut dec = Decoder::new(buf);
        let kind = MessageKind::try_from(dec.take_u32())?;

        Ok(match kind {
            MessageKind::Ok => Message::Ok,
            MessageKind::Ping => Message::Ping,
            MessageKind::Stop => Message::Stop,
            MessageKind::Error => Message::Error {
                errno: dec.take_u32() as i32,
            },
            MessageKind::Request => Message::Request(LineRequestSpec::decode_from(&mut dec)?),
            MessageKind::ReqOk => Message::ReqOk(decode_request_id(&mut dec)?),
            MessageKind::Release => Message::Release(decode_request_id(&mut dec)?),
        })
    }
}

/// Write one message as a single buffer.
pub fn write_message<W: Write>(writer: &mut W, msg: &Message) -> io::Result<()> {
    writer.write_all(&msg.encode())?;
    writer.flush()
}

/// Read exactly one message.
///
/// A peer that closes before sending anything yields `UnexpectedEof`;
/// undecodable data yields `InvalidData`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Message> {
    let mut buf = [0u8; MESSAGE_SIZE];
    reader.read_exact(&mut buf)?;
    Ok(Message::decode(&buf)?)
}

fn decode_request_id(dec: &mut Decoder<'_>) -> Result<RequestId, ProtocolError> {
    RequestId::new(dec.take_str("request identifier", MAX_REQ_NAME_SIZE)?)
}

fn check_string(field: &'static str, value: &str, max: usize) -> Result<(), ProtocolError> {
    if value.len() > max {
        return Err(ProtocolError::FieldTooLong { field, max });
    }
    if value.contains('\0') {
        return Err(ProtocolError::InvalidString { field });
    }
    Ok(())
}

fn check_offsets(offsets: &[u32]) -> Result<(), ProtocolError> {
    if offsets.is_empty() {
        return Err(ProtocolError::NoLines);
    }
    if offsets.len() > MAX_REQ_LINES {
        return Err(ProtocolError::TooManyLines {
            count: offsets.len(),
            max: MAX_REQ_LINES,
        });
    }
    for (idx, offset) in offsets.iter().enumerate() {
        if offsets[..idx].contains(offset) {
            return Err(ProtocolError::DuplicateOffset(*offset));
        }
    }
    Ok(())
}

fn check_values(expected: usize, values: &[u8]) -> Result<(), ProtocolError> {
    if values.len() != expected {
        return Err(ProtocolError::ValueCount {
            expected,
            actual: values.len(),
        });
    }
    match values.iter().find(|v| **v > 1) {
        Some(bad) => Err(ProtocolError::InvalidValue(*bad)),
        None => Ok(()),
    }
}

struct Encoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Encoder<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    fn put_u32(&mut self, value: u32) {
        self.put_bytes(&value.to_be_bytes());
    }

    fn put_u8(&mut self, value: u8) {
        self.put_bytes(&[value]);
    }

    /// Zero-padded fixed-width field. Length is checked by the caller.
    fn put_str(&mut self, value: &str, width: usize) {
        self.put_bytes(value.as_bytes());
        self.pos += width - value.len();
    }
}

struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> &'a [u8] {
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        bytes
    }

    fn take_u32(&mut self) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4));
        u32::from_be_bytes(raw)
    }

    fn take_u8(&mut self) -> u8 {
        self.take(1)[0]
    }

    fn take_str(&mut self, field: &'static str, width: usize) -> Result<String, ProtocolError> {
        let raw = self.take(width);
        let end = raw.iter().position(|b| *b == 0).unwrap_or(width);
        if raw[end..].iter().any(|b| *b != 0) {
            return Err(ProtocolError::InvalidString { field });
        }
        std::str::from_utf8(&raw[..end])
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidString { field })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> LineRequestSpec {
        LineRequestSpec::new("/dev/gpiochip0", vec![2, 5])
            .unwrap()
            .with_consumer("test")
            .unwrap()
            .with_output_values(vec![1, 0])
            .unwrap()
            .with_active_low(true)
    }

    #[test]
    fn test_round_trip_every_kind() {
        let id = RequestId::new("req-1").unwrap();
        let messages = vec![
            Message::Ok,
            Message::Error { errno: libc::EBUSY },
            Message::Ping,
            Message::Stop,
            Message::Request(sample_request()),
            Message::ReqOk(id.clone()),
            Message::Release(id),
        ];

        for msg in messages {
            let buf = msg.encode();
            assert_eq!(buf.len(), MESSAGE_SIZE);
            assert_eq!(Message::decode(&buf).unwrap(), msg);
        }
    }

    #[test]
    fn test_tag_is_big_endian_prefix() {
        let buf = Message::Release(RequestId::new("x").unwrap()).encode();
        assert_eq!(&buf[..4], &[0, 0, 0, 6]);
        assert_eq!(buf[4], b'x');
        assert!(buf[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_unknown_tag_rejected() {
        let mut buf = Message::Ping.encode();
        buf[3] = 99;
        assert_eq!(Message::decode(&buf), Err(ProtocolError::UnknownKind(99)));
    }

    #[test]
    fn test_short_buffer_rejected() {
        let buf = Message::Ping.encode();
        assert!(matches!(
            Message::decode(&buf[..10]),
            Err(ProtocolError::Truncated { actual: 10, .. })
        ));
    }

    #[test]
    fn test_too_many_lines_rejected_before_send() {
        let offsets: Vec<u32> = (0..=MAX_REQ_LINES as u32).collect();
        let err = LineRequestSpec::new("/dev/gpiochip0", offsets).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::TooManyLines {
                count: MAX_REQ_LINES + 1,
                max: MAX_REQ_LINES
            }
        );
    }

    #[test]
    fn test_full_request_fits() {
        let offsets: Vec<u32> = (0..MAX_REQ_LINES as u32).collect();
        let spec = LineRequestSpec::new("/dev/gpiochip7", offsets).unwrap();
        let msg = Message::Request(spec);
        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_request_validation() {
        assert_eq!(
            LineRequestSpec::new("/dev/gpiochip0", vec![]).unwrap_err(),
            ProtocolError::NoLines
        );
        assert_eq!(
            LineRequestSpec::new("/dev/gpiochip0", vec![3, 3]).unwrap_err(),
            ProtocolError::DuplicateOffset(3)
        );
        assert_eq!(
            LineRequestSpec::new("/dev/gpiochip0", vec![1])
                .unwrap()
                .with_output_values(vec![2])
                .unwrap_err(),
            ProtocolError::InvalidValue(2)
        );
        assert!(matches!(
            LineRequestSpec::new("x".repeat(MAX_CHIP_PATH_SIZE + 1), vec![1]),
            Err(ProtocolError::FieldTooLong { .. })
        ));
    }

    #[test]
    fn test_line_count_over_limit_on_wire() {
        let mut buf = Message::Request(sample_request()).encode();
        let count_at = TAG_SIZE + MAX_CHIP_PATH_SIZE + MAX_CONSUMER_SIZE;
        buf[count_at..count_at + 4].copy_from_slice(&65u32.to_be_bytes());
        assert!(matches!(
            Message::decode(&buf),
            Err(ProtocolError::TooManyLines { count: 65, .. })
        ));
    }

    #[test]
    fn test_request_id_validation() {
        assert!(RequestId::new("").is_err());
        assert!(RequestId::new("has space").is_err());
        assert!(RequestId::new("a".repeat(MAX_REQ_NAME_SIZE)).is_ok());
        assert!(RequestId::new("a".repeat(MAX_REQ_NAME_SIZE + 1)).is_err());
    }

    #[test]
    fn test_read_write_helpers() {
        let mut wire = Vec::new();
        write_message(&mut wire, &Message::Ping).unwrap();
        write_message(&mut wire, &Message::Stop).unwrap();

        let mut cursor = io::Cursor::new(wire);
        assert_eq!(read_message(&mut cursor).unwrap(), Message::Ping);
        assert_eq!(read_message(&mut cursor).unwrap(), Message::Stop);
        assert_eq!(
            read_message(&mut cursor).unwrap_err().kind(),
            io::ErrorKind::UnexpectedEof
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(MessageKind::ReqOk.to_string(), "REQ_OK");
        assert_eq!(Message::Error { errno: 1 }.kind(), MessageKind::Error);
    }
}
