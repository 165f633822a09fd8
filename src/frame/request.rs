//! Outbound request bodies. Query/prepared parameter *values* are encoded
//! by the caller-supplied bytes-in collaborator (spec.md §1 non-goal); this
//! module only frames the envelope each opcode needs.

use byteorder::{BigEndian, WriteBytesExt};
use std::collections::HashMap;

use super::{FrameFlags, ProtocolVersion, RequestOpcode};

/// A logical request ready to be written to the wire. `body` is the
/// already-encoded payload produced by the row/type codec collaborator for
/// `Query`/`Prepare`/`Execute`/`Batch`; this crate is only responsible for
/// prefixing it with the opcode-appropriate envelope (consistency,
/// paging state, flags byte, etc. are already embedded in `body` by the
/// caller, mirroring the "bytes-in/bytes-out interface only" boundary of
/// spec.md §1).
#[derive(Debug, Clone)]
pub enum Request {
    Startup {
        options: HashMap<String, String>,
    },
    AuthResponse {
        token: Vec<u8>,
    },
    Options,
    Query {
        body: Vec<u8>,
    },
    Prepare {
        query: String,
        keyspace: Option<String>,
    },
    Execute {
        id: Vec<u8>,
        result_metadata_id: Option<Vec<u8>>,
        body: Vec<u8>,
    },
    Batch {
        body: Vec<u8>,
    },
    Register {
        event_types: Vec<&'static str>,
    },
}

impl Request {
    pub fn opcode(&self) -> RequestOpcode {
        match self {
            Self::Startup { .. } => RequestOpcode::Startup,
            Self::AuthResponse { .. } => RequestOpcode::AuthResponse,
            Self::Options => RequestOpcode::Options,
            Self::Query { .. } => RequestOpcode::Query,
            Self::Prepare { .. } => RequestOpcode::Prepare,
            Self::Execute { .. } => RequestOpcode::Execute,
            Self::Batch { .. } => RequestOpcode::Batch,
            Self::Register { .. } => RequestOpcode::Register,
        }
    }

    /// Requests carrying a custom payload or requesting tracing would set
    /// extra flags here; none of the request kinds the core originates do.
    pub fn flags(&self) -> FrameFlags {
        FrameFlags::empty()
    }

    pub fn write_body(&self, out: &mut Vec<u8>, version: ProtocolVersion) {
        match self {
            Self::Startup { options } => write_string_map(out, options),
            Self::AuthResponse { token } => write_bytes(out, token),
            Self::Options => {}
            Self::Query { body } => out.extend_from_slice(body),
            Self::Prepare { query, keyspace } => {
                write_long_string(out, query);
                if version.raw() >= 5 {
                    // v5 carries an explicit flags byte even for PREPARE to
                    // allow a per-request keyspace override.
                    let flags: u32 = if keyspace.is_some() { 0x01 } else { 0x00 };
                    out.write_u32::<BigEndian>(flags).unwrap();
                    if let Some(ks) = keyspace {
                        write_string(out, ks);
                    }
                }
            }
            Self::Execute {
                id,
                result_metadata_id,
                body,
            } => {
                write_short_bytes(out, id);
                if let Some(rmid) = result_metadata_id {
                    write_short_bytes(out, rmid);
                }
                out.extend_from_slice(body);
            }
            Self::Batch { body } => out.extend_from_slice(body),
            Self::Register { event_types } => {
                out.write_u16::<BigEndian>(event_types.len() as u16).unwrap();
                for e in event_types {
                    write_string(out, e);
                }
            }
        }
    }
}

fn write_string(out: &mut Vec<u8>, s: &str) {
    out.write_u16::<BigEndian>(s.len() as u16).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn write_long_string(out: &mut Vec<u8>, s: &str) {
    out.write_u32::<BigEndian>(s.len() as u32).unwrap();
    out.extend_from_slice(s.as_bytes());
}

fn write_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.write_u32::<BigEndian>(b.len() as u32).unwrap();
    out.extend_from_slice(b);
}

fn write_short_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.write_u16::<BigEndian>(b.len() as u16).unwrap();
    out.extend_from_slice(b);
}

fn write_string_map(out: &mut Vec<u8>, map: &HashMap<String, String>) {
    out.write_u16::<BigEndian>(map.len() as u16).unwrap();
    for (k, v) in map {
        write_string(out, k);
        write_string(out, v);
    }
}
