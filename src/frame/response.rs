//! Inbound response bodies.
//!
//! As with [`super::request`], full row/type materialization is the bytes-
//! out collaborator's job (spec.md §1); this module decodes exactly what
//! the core needs to operate: error classification for the retry policy,
//! paging-state continuation tokens, prepared-statement ids, and
//! topology/status/schema events.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Read};
use std::net::SocketAddr;

use super::{ProtocolVersion, ResponseOpcode};

#[derive(Debug)]
pub enum Response {
    Error(ResponseError),
    Ready,
    Authenticate { authenticator: String },
    Supported { options: Vec<(String, Vec<String>)> },
    Result(QueryResult),
    Event(Event),
    AuthChallenge { token: Option<Vec<u8>> },
    AuthSuccess { token: Option<Vec<u8>> },
}

impl Response {
    pub fn parse(opcode: ResponseOpcode, version: ProtocolVersion, body: &[u8]) -> io::Result<Self> {
        let mut r = body;
        Ok(match opcode {
            ResponseOpcode::Error => Response::Error(ResponseError::parse(&mut r)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => Response::Authenticate {
                authenticator: read_string(&mut r)?,
            },
            ResponseOpcode::Supported => Response::Supported {
                options: read_string_multimap(&mut r)?,
            },
            ResponseOpcode::Result => Response::Result(QueryResult::parse(&mut r, version)?),
            ResponseOpcode::Event => Response::Event(Event::parse(&mut r)?),
            ResponseOpcode::AuthChallenge => Response::AuthChallenge {
                token: read_opt_bytes(&mut r)?,
            },
            ResponseOpcode::AuthSuccess => Response::AuthSuccess {
                token: read_opt_bytes(&mut r)?,
            },
        })
    }
}

/// Sub-kind of a decoded `RESULT` frame (spec.md §6: result kinds
/// `Void|Rows|SetKeyspace|Prepared|SchemaChange`). Row payloads stay raw
/// bytes — the one part the core must interpret, the paging state, is
/// pulled out eagerly.
#[derive(Debug)]
pub enum QueryResult {
    Void,
    Rows {
        paging_state: Option<Vec<u8>>,
        raw_metadata_and_rows: Vec<u8>,
    },
    SetKeyspace(String),
    Prepared {
        id: Vec<u8>,
        result_metadata_id: Option<Vec<u8>>,
        raw_metadata: Vec<u8>,
    },
    SchemaChange(SchemaChangeResult),
}

#[derive(Debug, Clone)]
pub struct SchemaChangeResult {
    pub change_type: String,
    pub target: String,
    pub keyspace: String,
    pub object_name: Option<String>,
}

const ROWS_FLAG_GLOBAL_TABLES_SPEC: u32 = 0x0001;
const ROWS_FLAG_HAS_MORE_PAGES: u32 = 0x0002;
const ROWS_FLAG_NO_METADATA: u32 = 0x0004;

impl QueryResult {
    fn parse(r: &mut &[u8], version: ProtocolVersion) -> io::Result<Self> {
        let kind = r.read_u32::<BigEndian>()?;
        Ok(match kind {
            0x0001 => Self::Void,
            0x0002 => {
                let start_len = r.len();
                let flags = r.read_u32::<BigEndian>()?;
                let _columns_count = r.read_u32::<BigEndian>()?;
                let paging_state = if flags & ROWS_FLAG_HAS_MORE_PAGES != 0 {
                    read_opt_bytes(r)?
                } else {
                    None
                };
                let _ = ROWS_FLAG_GLOBAL_TABLES_SPEC;
                let _ = ROWS_FLAG_NO_METADATA;
                let consumed = start_len - r.len();
                let _ = consumed;
                let mut raw = Vec::new();
                r.read_to_end(&mut raw)?;
                Self::Rows {
                    paging_state,
                    raw_metadata_and_rows: raw,
                }
            }
            0x0003 => Self::SetKeyspace(read_string(r)?),
            0x0004 => {
                let id = read_short_bytes(r)?;
                let result_metadata_id = if version.raw() >= 5 {
                    Some(read_short_bytes(r)?)
                } else {
                    None
                };
                let mut raw = Vec::new();
                r.read_to_end(&mut raw)?;
                Self::Prepared {
                    id,
                    result_metadata_id,
                    raw_metadata: raw,
                }
            }
            0x0005 => {
                let change_type = read_string(r)?;
                let target = read_string(r)?;
                let keyspace = read_string(r)?;
                let object_name = if target != "KEYSPACE" {
                    Some(read_string(r)?)
                } else {
                    None
                };
                Self::SchemaChange(SchemaChangeResult {
                    change_type,
                    target,
                    keyspace,
                    object_name,
                })
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown RESULT kind 0x{other:08x}"),
                ))
            }
        })
    }

    pub fn paging_state(&self) -> Option<&[u8]> {
        match self {
            Self::Rows { paging_state, .. } => paging_state.as_deref(),
            _ => None,
        }
    }
}

/// Server error classification (spec.md §7 `ResponseError`). The concrete
/// CQL error codes follow the native protocol's well-known ranges; the
/// `kind` is what the Request Handler's retry policy dispatches on.
#[derive(thiserror::Error, Debug, Clone)]
#[error("server error {code:#06x} ({kind:?}): {message}")]
pub struct ResponseError {
    pub code: u32,
    pub message: String,
    pub kind: ResponseErrorKind,
    pub unprepared_id: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseErrorKind {
    ServerError,
    ProtocolError,
    AuthenticationError,
    Unavailable,
    Overloaded,
    IsBootstrapping,
    TruncateError,
    WriteTimeout,
    ReadTimeout,
    ReadFailure,
    FunctionFailure,
    WriteFailure,
    SyntaxError,
    Unauthorized,
    Invalid,
    ConfigError,
    AlreadyExists,
    Unprepared,
    RequestError,
    Other,
}

impl ResponseErrorKind {
    fn from_code(code: u32) -> Self {
        match code {
            0x0000 => Self::ServerError,
            0x000A => Self::ProtocolError,
            0x0100 => Self::AuthenticationError,
            0x1000 => Self::Unavailable,
            0x1001 => Self::Overloaded,
            0x1002 => Self::IsBootstrapping,
            0x1003 => Self::TruncateError,
            0x1100 => Self::WriteTimeout,
            0x1200 => Self::ReadTimeout,
            0x1300 => Self::ReadFailure,
            0x1400 => Self::FunctionFailure,
            0x1500 => Self::WriteFailure,
            0x2000 => Self::SyntaxError,
            0x2100 => Self::Unauthorized,
            0x2200 => Self::Invalid,
            0x2300 => Self::ConfigError,
            0x2400 => Self::AlreadyExists,
            0x2500 => Self::Unprepared,
            _ if (0x3000..0x4000).contains(&code) => Self::RequestError,
            _ => Self::Other,
        }
    }
}

impl ResponseError {
    fn parse(r: &mut &[u8]) -> io::Result<Self> {
        let code = r.read_u32::<BigEndian>()?;
        let message = read_string(r)?;
        let kind = ResponseErrorKind::from_code(code);
        let unprepared_id = if kind == ResponseErrorKind::Unprepared {
            Some(read_short_bytes(r)?)
        } else {
            None
        };
        // Kind-specific trailing fields (consistency, required/alive replica
        // counts, etc.) belong to the out-of-scope detail payload; the core
        // only needs the classification and, for UNPREPARED, the id.
        Ok(Self {
            code,
            message,
            kind,
            unprepared_id,
        })
    }

    /// spec.md §4.6 step 5: an `UNPREPARED` response means the id cached
    /// for this query was evicted server-side (e.g. a restart) and must
    /// be re-issued via `prepareOnce` before the retry.
    pub fn is_unprepared(&self) -> bool {
        self.kind == ResponseErrorKind::Unprepared
    }
}

/// A decoded `EVENT` frame (spec.md §6).
#[derive(Debug, Clone)]
pub enum Event {
    TopologyChange { change: String, addr: SocketAddr },
    StatusChange { change: String, addr: SocketAddr },
    SchemaChange(SchemaChangeResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    TopologyChange,
    StatusChange,
    SchemaChange,
}

impl Event {
    fn parse(r: &mut &[u8]) -> io::Result<Self> {
        let event_type = read_string(r)?;
        Ok(match event_type.as_str() {
            "TOPOLOGY_CHANGE" => Event::TopologyChange {
                change: read_string(r)?,
                addr: read_inet(r)?,
            },
            "STATUS_CHANGE" => Event::StatusChange {
                change: read_string(r)?,
                addr: read_inet(r)?,
            },
            "SCHEMA_CHANGE" => {
                let change_type = read_string(r)?;
                let target = read_string(r)?;
                let keyspace = read_string(r)?;
                let object_name = if target != "KEYSPACE" {
                    Some(read_string(r)?)
                } else {
                    None
                };
                Event::SchemaChange(SchemaChangeResult {
                    change_type,
                    target,
                    keyspace,
                    object_name,
                })
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown event type {other}"),
                ))
            }
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Event::TopologyChange { .. } => EventKind::TopologyChange,
            Event::StatusChange { .. } => EventKind::StatusChange,
            Event::SchemaChange(_) => EventKind::SchemaChange,
        }
    }
}

fn read_string(r: &mut &[u8]) -> io::Result<String> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

fn read_string_multimap(r: &mut &[u8]) -> io::Result<Vec<(String, Vec<String>)>> {
    let n = r.read_u16::<BigEndian>()? as usize;
    let mut out = Vec::with_capacity(n);
    for _ in 0..n {
        let key = read_string(r)?;
        let count = r.read_u16::<BigEndian>()? as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(read_string(r)?);
        }
        out.push((key, values));
    }
    Ok(out)
}

fn read_opt_bytes(r: &mut &[u8]) -> io::Result<Option<Vec<u8>>> {
    let len = r.read_i32::<BigEndian>()?;
    if len < 0 {
        return Ok(None);
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    Ok(Some(buf))
}

fn read_short_bytes(r: &mut &[u8]) -> io::Result<Vec<u8>> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_inet(r: &mut &[u8]) -> io::Result<SocketAddr> {
    let len = r.read_u8()?;
    let ip = match len {
        4 => {
            let mut buf = [0u8; 4];
            r.read_exact(&mut buf)?;
            std::net::IpAddr::from(buf)
        }
        16 => {
            let mut buf = [0u8; 16];
            r.read_exact(&mut buf)?;
            std::net::IpAddr::from(buf)
        }
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported inet address length {other}"),
            ))
        }
    };
    let port = r.read_u32::<BigEndian>()?;
    Ok(SocketAddr::new(ip, port as u16))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn string_bytes(s: &str) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
        out
    }

    #[test]
    fn parses_set_keyspace_result() {
        let mut body = 3u32.to_be_bytes().to_vec();
        body.extend(string_bytes("my_keyspace"));
        let result = QueryResult::parse(&mut body.as_slice(), ProtocolVersion::new(4)).unwrap();
        match result {
            QueryResult::SetKeyspace(ks) => assert_eq!(ks, "my_keyspace"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_rows_with_paging_state() {
        let mut body = 2u32.to_be_bytes().to_vec(); // kind = Rows
        body.extend((ROWS_FLAG_HAS_MORE_PAGES).to_be_bytes());
        body.extend(1u32.to_be_bytes()); // columns_count
        body.extend(3i32.to_be_bytes());
        body.extend([1, 2, 3]);
        let result = QueryResult::parse(&mut body.as_slice(), ProtocolVersion::new(4)).unwrap();
        match result {
            QueryResult::Rows { paging_state, .. } => {
                assert_eq!(paging_state, Some(vec![1, 2, 3]));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn classifies_unprepared_error_and_extracts_id() {
        let mut body = 0x2500u32.to_be_bytes().to_vec();
        body.extend(string_bytes("unprepared"));
        body.extend((2u16).to_be_bytes());
        body.extend([0xAB, 0xCD]);
        let err = ResponseError::parse(&mut body.as_slice()).unwrap();
        assert_eq!(err.kind, ResponseErrorKind::Unprepared);
        assert_eq!(err.unprepared_id, Some(vec![0xAB, 0xCD]));
    }
}
