//! The wire framing layer: encode outbound requests, decode inbound
//! responses. This is the one genuinely in-scope slice of the binary
//! protocol (spec.md §1 draws the line at "the binary encoder/decoder for
//! CQL types" — row/type payload marshalling stays a bytes-in/bytes-out
//! collaborator; the 9-byte frame header and opcode dispatch are the
//! core's job).
//!
//! Frame header layout (spec.md §6): `{version, flags, streamId, opcode,
//! bodyLength: u32}`. `streamId` is one byte for legacy protocol versions
//! and two bytes once [`ProtocolVersion::wide_streams`] is true.

mod request;
mod response;

pub use request::Request;
pub use response::{Event, EventKind, QueryResult, Response, ResponseError, ResponseErrorKind, SchemaChangeResult};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Highest protocol version this crate knows how to negotiate.
pub const MAX_SUPPORTED_VERSION: u8 = 5;
/// Lowest protocol version this crate will downgrade to before giving up.
pub const MIN_SUPPORTED_VERSION: u8 = 3;

/// Capability set exposed by a negotiated protocol version (spec.md §1:
/// "the core is parameterized over a negotiated protocol version that
/// exposes capability queries").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    /// Stream ids are 2 bytes wide from v3 onward; 1 byte for v1/v2.
    pub const fn wide_streams(self) -> bool {
        self.0 >= 3
    }

    pub const fn max_stream_ids(self) -> i16 {
        if self.wide_streams() {
            i16::MAX
        } else {
            127
        }
    }

    /// Whether `QUERY`/`EXECUTE`/`BATCH` flags may carry an explicit
    /// per-request timestamp (protocol v3+).
    pub const fn supports_timestamp_in_flags(self) -> bool {
        self.0 >= 3
    }

    pub const fn supports_continuous_paging(self) -> bool {
        self.0 >= 4
    }
}

macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident: $ty:ty {
            $(const $flag:ident = $value:expr;)*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name(pub $ty);
        impl $name {
            $(pub const $flag: $name = $name($value);)*
            pub const fn empty() -> Self { Self(0) }
            pub const fn contains(self, other: Self) -> bool { self.0 & other.0 == other.0 }
            pub const fn bits(self) -> $ty { self.0 }
        }
        impl std::ops::BitOr for $name {
            type Output = Self;
            fn bitor(self, rhs: Self) -> Self { Self(self.0 | rhs.0) }
        }
        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: Self) { self.0 |= rhs.0; }
        }
    };
}

bitflags_like! {
    /// Frame-level flags (spec.md §6).
    pub struct FrameFlags: u8 {
        const COMPRESSION = 0x01;
        const TRACING = 0x02;
        const CUSTOM_PAYLOAD = 0x04;
        const WARNING = 0x08;
        const USE_BETA = 0x10;
    }
}

/// Request opcodes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    Batch = 0x0D,
    AuthResponse = 0x0F,
}

/// Response opcodes (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl ResponseOpcode {
    pub fn from_u8(b: u8) -> io::Result<Self> {
        Ok(match b {
            0x00 => Self::Error,
            0x02 => Self::Ready,
            0x03 => Self::Authenticate,
            0x06 => Self::Supported,
            0x08 => Self::Result,
            0x0C => Self::Event,
            0x0E => Self::AuthChallenge,
            0x10 => Self::AuthSuccess,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown response opcode 0x{other:02x}"),
                ))
            }
        })
    }
}

/// The 9-byte frame header, parsed independently of the body so the
/// connection's read loop can find frame boundaries before the body is
/// fully buffered (spec.md §4.1: "read-buffer reassembler that extracts
/// frame boundaries from the 9-byte header length field").
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub version: ProtocolVersion,
    pub response: bool,
    pub flags: FrameFlags,
    pub stream_id: i16,
    pub opcode: u8,
    pub body_len: u32,
}

pub const HEADER_LEN: usize = 9;

impl FrameHeader {
    pub fn read_from(mut r: impl Read) -> io::Result<Self> {
        let version_byte = r.read_u8()?;
        let response = version_byte & 0x80 != 0;
        let version = ProtocolVersion::new(version_byte & 0x7F);
        let flags = FrameFlags(r.read_u8()?);
        let stream_id = if version.wide_streams() {
            r.read_i16::<BigEndian>()?
        } else {
            i16::from(r.read_i8()?)
        };
        let opcode = r.read_u8()?;
        let body_len = r.read_u32::<BigEndian>()?;
        Ok(Self {
            version,
            response,
            flags,
            stream_id,
            opcode,
            body_len,
        })
    }

    pub fn write_to(&self, mut w: impl Write) -> io::Result<()> {
        let version_byte = self.version.raw() | if self.response { 0x80 } else { 0x00 };
        w.write_u8(version_byte)?;
        w.write_u8(self.flags.bits())?;
        if self.version.wide_streams() {
            w.write_i16::<BigEndian>(self.stream_id)?;
        } else {
            w.write_i8(self.stream_id as i8)?;
        }
        w.write_u8(self.opcode)?;
        w.write_u32::<BigEndian>(self.body_len)?;
        Ok(())
    }
}

/// Encodes a request into a full frame (header + body) for the given
/// stream id and negotiated version.
pub fn encode(request: &Request, stream_id: i16, version: ProtocolVersion) -> Vec<u8> {
    let mut body = Vec::new();
    request.write_body(&mut body, version);
    let header = FrameHeader {
        version,
        response: false,
        flags: request.flags(),
        stream_id,
        opcode: request.opcode() as u8,
        body_len: body.len() as u32,
    };
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    header
        .write_to(&mut out)
        .expect("writing to a Vec<u8> cannot fail");
    out.extend_from_slice(&body);
    out
}

/// Decodes a full frame (header already stripped) into a typed response.
pub fn decode(header: &FrameHeader, body: &[u8]) -> io::Result<Response> {
    Response::parse(ResponseOpcode::from_u8(header.opcode)?, header.version, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_wide_stream_ids() {
        let header = FrameHeader {
            version: ProtocolVersion::new(4),
            response: true,
            flags: FrameFlags::TRACING,
            stream_id: 12_345,
            opcode: ResponseOpcode::Result as u8,
            body_len: 42,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        let parsed = FrameHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed.version, header.version);
        assert!(parsed.response);
        assert_eq!(parsed.stream_id, 12_345);
        assert_eq!(parsed.body_len, 42);
    }

    #[test]
    fn header_round_trips_legacy_one_byte_stream_ids() {
        let header = FrameHeader {
            version: ProtocolVersion::new(2),
            response: false,
            flags: FrameFlags::empty(),
            stream_id: 100,
            opcode: RequestOpcode::Query as u8,
            body_len: 0,
        };
        let mut buf = Vec::new();
        header.write_to(&mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_LEN);
        let parsed = FrameHeader::read_from(&buf[..]).unwrap();
        assert_eq!(parsed.stream_id, 100);
        assert!(!parsed.version.wide_streams());
    }

    #[test]
    fn protocol_version_capability_queries() {
        assert!(!ProtocolVersion::new(2).wide_streams());
        assert!(ProtocolVersion::new(3).wide_streams());
        assert!(ProtocolVersion::new(3).supports_timestamp_in_flags());
        assert!(!ProtocolVersion::new(3).supports_continuous_paging());
        assert!(ProtocolVersion::new(4).supports_continuous_paging());
    }
}
