//! Frame format of the controller UDP protocol.
//!
//! ```text
//! FD FD | 02 | id_len id.. | pass_len pass.. | function | entries.. | checksum (u16 LE)
//! ```
//!
//! The checksum is the wrapping sum of every byte after the two header bytes.

use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::parameters::{self, Parameter, Width};

pub const MAX_PACKET_SIZE: usize = 256;
pub const HEADER: [u8; 2] = [0xFD, 0xFD];
pub const PROTOCOL_TYPE: u8 = 0x02;
/// Parameter code announcing an explicit value size and the real parameter code.
pub const ESCAPE: u8 = 0xFE;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("frame does not start with the FD FD header (found {0:02X?})")]
    Header([u8; 2]),
    #[error("unsupported protocol type 0x{0:02X}")]
    ProtocolType(u8),
    #[error("checksum mismatch (frame says 0x{expected:04X}, computed 0x{computed:04X})")]
    Checksum { expected: u16, computed: u16 },
    #[error("unknown function code 0x{0:02X}")]
    FunctionCode(u8),
    #[error("parameter 0x{0:02X} is not registered and was not escaped")]
    UnknownParameter(u8),
    #[error("frame ended early while reading the {0}")]
    Truncated(&'static str),
    #[error("encoded frame would exceed {MAX_PACKET_SIZE} bytes")]
    BufferOverflow,
    #[error("{field} is {len} bytes long, at most 255 fit into a frame")]
    CredentialTooLong { field: &'static str, len: usize },
    #[error("{field} contains a non-ASCII character {character:?}")]
    NonAsciiCredential { field: &'static str, character: char },
    #[error("value of parameter 0x{parameter:02X} is {actual} bytes, expected {expected}")]
    ValueSize { parameter: u8, expected: usize, actual: usize },
    #[error("value of escaped parameter 0x{parameter:02X} is {len} bytes, at most 255 fit")]
    EscapedValueTooLong { parameter: u8, len: usize },
    #[error("datagram I/O failed")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error describes a malformed frame (as opposed to an unencodable packet).
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            Error::Header(_)
                | Error::ProtocolType(_)
                | Error::Checksum { .. }
                | Error::FunctionCode(_)
                | Error::UnknownParameter(_)
                | Error::Truncated(_)
        )
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, strum::FromRepr, strum::IntoStaticStr, strum::EnumString,
)]
#[strum(ascii_case_insensitive)]
#[repr(u8)]
pub enum FunctionCode {
    Read = 0x01,
    Write = 0x02,
    WriteRead = 0x03,
    IncRead = 0x04,
    DecRead = 0x05,
    Response = 0x06,
}

impl FunctionCode {
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        Self::from_repr(byte).ok_or(Error::FunctionCode(byte))
    }

    pub const fn to_byte(self) -> u8 {
        self as u8
    }

    /// Whether entries are followed by their value bytes. Values attached to the entries of
    /// other frames are not sent.
    pub const fn carries_values(self) -> bool {
        matches!(self, Self::Write | Self::WriteRead | Self::Response)
    }
}

impl std::fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.into())
    }
}

/// One parameter of a frame payload along with its raw value, if any.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataEntry {
    parameter: u8,
    value: Option<Vec<u8>>,
}

impl DataEntry {
    /// An entry without a value, as used in read requests.
    pub fn of(parameter: Parameter) -> Self {
        Self { parameter: parameter.code(), value: None }
    }

    /// An entry with a single-byte value.
    pub fn with_byte(parameter: Parameter, value: u8) -> Self {
        Self { parameter: parameter.code(), value: Some(vec![value]) }
    }

    pub fn new(parameter: u8, value: Option<Vec<u8>>) -> Self {
        Self { parameter, value }
    }

    pub fn parameter(&self) -> u8 {
        self.parameter
    }

    pub fn known_parameter(&self) -> Option<Parameter> {
        Parameter::from_code(self.parameter)
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

impl std::fmt::Display for DataEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.known_parameter() {
            Some(p) => f.write_str(p.name())?,
            None => f.write_fmt(format_args!("0x{:02X}", self.parameter))?,
        }
        if let Some(value) = &self.value {
            f.write_str("=")?;
            for b in value {
                f.write_fmt(format_args!("{:02x}", b))?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub device_id: String,
    pub password: String,
    pub function: FunctionCode,
    pub entries: Vec<DataEntry>,
}

impl Packet {
    pub fn new(
        device_id: impl Into<String>,
        password: impl Into<String>,
        function: FunctionCode,
        entries: Vec<DataEntry>,
    ) -> Self {
        Self { device_id: device_id.into(), password: password.into(), function, entries }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        let mut frame = FrameBuilder::new();
        frame.put_slice(&HEADER)?;
        frame.put_u8(PROTOCOL_TYPE)?;
        frame.put_credential("device ID", &self.device_id)?;
        frame.put_credential("password", &self.password)?;
        frame.put_u8(self.function.to_byte())?;
        for entry in &self.entries {
            if self.function.carries_values() {
                frame.put_entry(entry.parameter, entry.value(), true)?;
            } else {
                frame.put_entry(entry.parameter, None, false)?;
            }
        }
        let checksum = checksum(&frame.bytes[HEADER.len()..]);
        frame.put_slice(&checksum.to_le_bytes())?;
        Ok(frame.bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Packet, Error> {
        let Some((header, rest)) = bytes.split_first_chunk::<2>() else {
            return Err(Error::Truncated("header"));
        };
        if *header != HEADER {
            return Err(Error::Header(*header));
        }
        let Some((&protocol_type, _)) = rest.split_first() else {
            return Err(Error::Truncated("protocol type"));
        };
        if protocol_type != PROTOCOL_TYPE {
            return Err(Error::ProtocolType(protocol_type));
        }
        let Some((body, trailer)) = rest.split_last_chunk::<2>() else {
            return Err(Error::Truncated("checksum"));
        };
        let Some((_, payload)) = body.split_first() else {
            return Err(Error::Truncated("checksum"));
        };
        let expected = u16::from_le_bytes(*trailer);
        let computed = checksum(body);
        if expected != computed {
            return Err(Error::Checksum { expected, computed });
        }

        let mut reader = Reader { remaining: payload };
        let device_id = reader.credential("device ID")?;
        let password = reader.credential("password")?;
        let function = FunctionCode::from_byte(reader.u8("function code")?)?;
        let mut entries = Vec::new();
        // Stop with exactly the checksum left, which `body` already excludes.
        while !reader.remaining.is_empty() {
            entries.push(reader.entry(function)?);
        }
        Ok(Packet { device_id, password, function, entries })
    }
}

impl std::fmt::Display for Packet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("{} {:?} [", self.function, self.device_id))?;
        for (i, entry) in self.entries.iter().enumerate() {
            if i != 0 {
                f.write_str(", ")?;
            }
            f.write_fmt(format_args!("{}", entry))?;
        }
        f.write_str("]")
    }
}

pub fn checksum(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
}

/// Append-only frame buffer which refuses to grow past [`MAX_PACKET_SIZE`].
struct FrameBuilder {
    bytes: Vec<u8>,
}

impl FrameBuilder {
    fn new() -> Self {
        Self { bytes: Vec::with_capacity(MAX_PACKET_SIZE) }
    }

    fn reserve(&self, additional: usize) -> Result<(), Error> {
        if self.bytes.len() + additional > MAX_PACKET_SIZE {
            return Err(Error::BufferOverflow);
        }
        Ok(())
    }

    fn put_u8(&mut self, byte: u8) -> Result<(), Error> {
        self.reserve(1)?;
        self.bytes.push(byte);
        Ok(())
    }

    fn put_slice(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.reserve(bytes.len())?;
        self.bytes.extend_from_slice(bytes);
        Ok(())
    }

    fn put_credential(&mut self, field: &'static str, value: &str) -> Result<(), Error> {
        if let Some(character) = value.chars().find(|c| !c.is_ascii()) {
            return Err(Error::NonAsciiCredential { field, character });
        }
        let len = u8::try_from(value.len())
            .map_err(|_| Error::CredentialTooLong { field, len: value.len() })?;
        self.put_u8(len)?;
        self.put_slice(value.as_bytes())
    }

    /// `with_value` entries of registered fixed-width parameters must come with exactly that
    /// many bytes, as the decoder will expect them.
    fn put_entry(
        &mut self,
        parameter: u8,
        value: Option<&[u8]>,
        with_value: bool,
    ) -> Result<(), Error> {
        match parameters::size_of(parameter) {
            Some(Width::Fixed(size)) => {
                self.put_u8(parameter)?;
                if with_value {
                    let value = value.unwrap_or_default();
                    if value.len() != usize::from(size) {
                        return Err(Error::ValueSize {
                            parameter,
                            expected: size.into(),
                            actual: value.len(),
                        });
                    }
                    self.put_slice(value)?;
                }
            }
            // Variable width and unregistered parameters only make sense to the controller
            // with an explicit size.
            Some(Width::Variable) | None => {
                let value = value.unwrap_or_default();
                let len = u8::try_from(value.len())
                    .map_err(|_| Error::EscapedValueTooLong { parameter, len: value.len() })?;
                self.put_slice(&[ESCAPE, len, parameter])?;
                self.put_slice(value)?;
            }
        }
        Ok(())
    }
}

struct Reader<'a> {
    remaining: &'a [u8],
}

impl<'a> Reader<'a> {
    fn u8(&mut self, what: &'static str) -> Result<u8, Error> {
        let (&byte, rest) = self.remaining.split_first().ok_or(Error::Truncated(what))?;
        self.remaining = rest;
        Ok(byte)
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], Error> {
        let (taken, rest) = self.remaining.split_at_checked(len).ok_or(Error::Truncated(what))?;
        self.remaining = rest;
        Ok(taken)
    }

    fn credential(&mut self, what: &'static str) -> Result<String, Error> {
        let len = self.u8(what)?;
        let bytes = self.take(len.into(), what)?;
        Ok(bytes.iter().copied().map(char::from).collect())
    }

    fn entry(&mut self, function: FunctionCode) -> Result<DataEntry, Error> {
        let code = self.u8("parameter")?;
        let (parameter, size) = if code == ESCAPE {
            let size = self.u8("escaped parameter size")?;
            (self.u8("escaped parameter")?, usize::from(size))
        } else {
            let width = parameters::size_of(code).ok_or(Error::UnknownParameter(code))?;
            let size = if function.carries_values() { width.bytes() } else { 0 };
            (code, size)
        };
        let value = match size {
            0 => None,
            size => Some(self.take(size, "parameter value")?.to_vec()),
        };
        Ok(DataEntry { parameter, value })
    }
}

/// Datagram codec: every buffer handed to the decoder is exactly one frame.
#[derive(Default)]
pub struct VentoCodec {}

impl Encoder<&Packet> for VentoCodec {
    type Error = Error;
    fn encode(&mut self, packet: &Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = packet.to_bytes()?;
        dst.put_slice(&bytes);
        trace!(message = "encoded", buffer = ?dst);
        Ok(())
    }
}

impl Decoder for VentoCodec {
    type Item = Packet;
    type Error = Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }
        trace!(message = "decoding", buffer = ?src);
        let result = Packet::from_bytes(src);
        src.advance(src.len());
        result.map(Some)
    }
}
