//! PostgreSQL v3 wire framing.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ClientError, Result, ServerError};
use crate::message::{FieldDescriptor, RawRow};
use crate::types::{Format, Oid, Value};

// ============================================================================
// Protocol Constants
// ============================================================================

/// (3 << 16) | 0
pub const PROTOCOL_VERSION: i32 = 196_608;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// A message written by the client. Portals share their statement's name.
#[derive(Debug, Clone, Copy)]
pub enum Frontend<'a> {
    Startup {
        user: &'a str,
        database: &'a str,
        application_name: Option<&'a str>,
    },
    Password(&'a str),
    SaslInitialResponse {
        mechanism: &'a str,
        data: &'a [u8],
    },
    SaslResponse(&'a [u8]),
    Query(&'a str),
    Parse {
        name: &'a str,
        sql: &'a str,
        param_types: &'a [Oid],
    },
    /// Binary parameters, binary results.
    Bind {
        name: &'a str,
        params: &'a [Value],
    },
    DescribePortal(&'a str),
    Execute {
        portal: &'a str,
        max_rows: i32,
    },
    CloseStatement(&'a str),
    Flush,
    Sync,
    Terminate,
}

impl Frontend<'_> {
    pub fn encode(&self, buf: &mut BytesMut) {
        match *self {
            Frontend::Startup {
                user,
                database,
                application_name,
            } => {
                // The startup packet has no type byte.
                let start = buf.len();
                buf.put_i32(0);
                buf.put_i32(PROTOCOL_VERSION);
                put_cstr(buf, "user");
                put_cstr(buf, user);
                put_cstr(buf, "database");
                put_cstr(buf, database);
                if let Some(name) = application_name {
                    put_cstr(buf, "application_name");
                    put_cstr(buf, name);
                }
                buf.put_u8(0);
                patch_len(buf, start);
            }
            Frontend::Password(password) => framed(buf, b'p', |b| put_cstr(b, password)),
            Frontend::SaslInitialResponse { mechanism, data } => framed(buf, b'p', |b| {
                put_cstr(b, mechanism);
                b.put_i32(data.len() as i32);
                b.put_slice(data);
            }),
            Frontend::SaslResponse(data) => framed(buf, b'p', |b| b.put_slice(data)),
            Frontend::Query(sql) => framed(buf, b'Q', |b| put_cstr(b, sql)),
            Frontend::Parse {
                name,
                sql,
                param_types,
            } => framed(buf, b'P', |b| {
                put_cstr(b, name);
                put_cstr(b, sql);
                b.put_i16(param_types.len() as i16);
                for oid in param_types {
                    b.put_i32(oid.as_i32());
                }
            }),
            Frontend::Bind { name, params } => framed(buf, b'B', |b| {
                put_cstr(b, name);
                put_cstr(b, name);
                // One format code applies to every parameter.
                b.put_i16(1);
                b.put_i16(Format::Binary as i16);
                b.put_i16(params.len() as i16);
                for param in params {
                    let start = b.len();
                    b.put_i32(0);
                    match param.encode_binary(b) {
                        Some(()) => patch_value_len(b, start),
                        None => b[start..start + 4].copy_from_slice(&(-1i32).to_be_bytes()),
                    }
                }
                b.put_i16(1);
                b.put_i16(Format::Binary as i16);
            }),
            Frontend::DescribePortal(name) => framed(buf, b'D', |b| {
                b.put_u8(b'P');
                put_cstr(b, name);
            }),
            Frontend::Execute { portal, max_rows } => framed(buf, b'E', |b| {
                put_cstr(b, portal);
                b.put_i32(max_rows);
            }),
            Frontend::CloseStatement(name) => framed(buf, b'C', |b| {
                b.put_u8(b'S');
                put_cstr(b, name);
            }),
            Frontend::Flush => framed(buf, b'H', |_| {}),
            Frontend::Sync => framed(buf, b'S', |_| {}),
            Frontend::Terminate => framed(buf, b'X', |_| {}),
        }
    }
}

fn framed(buf: &mut BytesMut, tag: u8, body: impl FnOnce(&mut BytesMut)) {
    buf.put_u8(tag);
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    patch_len(buf, start);
}

/// Fill the length field at `start`; the length counts itself.
fn patch_len(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

/// Fill a parameter length field; unlike frame lengths it excludes itself.
fn patch_value_len(buf: &mut BytesMut, start: usize) {
    let len = (buf.len() - start - 4) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Backend {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password { salt: [u8; 4] },
    AuthenticationSasl { mechanisms: Vec<String> },
    AuthenticationSaslContinue(Bytes),
    AuthenticationSaslFinal(Bytes),
    BackendKeyData { process_id: i32, secret_key: i32 },
    ParameterStatus { name: String, value: String },
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    EmptyQueryResponse,
    RowDescription(Vec<FieldDescriptor>),
    DataRow(RawRow),
    CommandComplete(String),
    ReadyForQuery(u8),
    ErrorResponse(ServerError),
    NoticeResponse(ServerError),
    /// Messages this client has no use for (notifications, parameter
    /// descriptions, ...).
    Ignored(u8),
}

impl Backend {
    /// Split one complete frame off the front of `buf`, or `None` if more
    /// bytes are needed.
    pub fn parse_frame(buf: &mut BytesMut) -> Result<Option<Self>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let len = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if len < 4 {
            return Err(malformed("frame length"));
        }
        let total = 1 + len as usize;
        if buf.len() < total {
            buf.reserve(total - buf.len());
            return Ok(None);
        }
        let mut frame = buf.split_to(total).freeze();
        let tag = frame.get_u8();
        frame.advance(4);
        Self::decode(tag, frame).map(Some)
    }

    pub fn decode(tag: u8, body: Bytes) -> Result<Self> {
        let mut r = Reader(body);
        let message = match tag {
            b'R' => r.auth()?,
            b'K' => Backend::BackendKeyData {
                process_id: r.i32()?,
                secret_key: r.i32()?,
            },
            b'S' => Backend::ParameterStatus {
                name: r.cstr()?,
                value: r.cstr()?,
            },
            b'1' => Backend::ParseComplete,
            b'2' => Backend::BindComplete,
            b'3' => Backend::CloseComplete,
            b'n' => Backend::NoData,
            b's' => Backend::PortalSuspended,
            b'I' => Backend::EmptyQueryResponse,
            b'T' => Backend::RowDescription(r.row_description()?),
            b'D' => Backend::DataRow(r.data_row()?),
            b'C' => Backend::CommandComplete(r.cstr()?),
            b'Z' => Backend::ReadyForQuery(r.u8()?),
            b'E' => Backend::ErrorResponse(ServerError::from_fields(&r.error_fields()?)),
            b'N' => Backend::NoticeResponse(ServerError::from_fields(&r.error_fields()?)),
            b'A' | b't' | b'G' | b'H' | b'W' | b'v' => Backend::Ignored(tag),
            other => {
                return Err(ClientError::Decode(format!(
                    "Unknown message type: {}",
                    other as char
                )))
            }
        };
        Ok(message)
    }
}

fn malformed(what: &str) -> ClientError {
    ClientError::Decode(format!("Malformed backend message: truncated {}", what))
}

/// Bounds-checked reads over a message body.
struct Reader(Bytes);

impl Reader {
    fn u8(&mut self) -> Result<u8> {
        if self.0.remaining() < 1 {
            return Err(malformed("byte"));
        }
        Ok(self.0.get_u8())
    }

    fn i16(&mut self) -> Result<i16> {
        if self.0.remaining() < 2 {
            return Err(malformed("int16"));
        }
        Ok(self.0.get_i16())
    }

    fn i32(&mut self) -> Result<i32> {
        if self.0.remaining() < 4 {
            return Err(malformed("int32"));
        }
        Ok(self.0.get_i32())
    }

    fn bytes(&mut self, n: usize) -> Result<Bytes> {
        if self.0.remaining() < n {
            return Err(malformed("value"));
        }
        Ok(self.0.split_to(n))
    }

    fn cstr(&mut self) -> Result<String> {
        let end = self
            .0
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("string"))?;
        let raw = self.0.split_to(end);
        self.0.advance(1);
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }

    fn auth(&mut self) -> Result<Backend> {
        match self.i32()? {
            0 => Ok(Backend::AuthenticationOk),
            3 => Ok(Backend::AuthenticationCleartextPassword),
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&self.bytes(4)?);
                Ok(Backend::AuthenticationMd5Password { salt })
            }
            10 => {
                let mut mechanisms = Vec::new();
                while self.0.has_remaining() {
                    let mechanism = self.cstr()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                Ok(Backend::AuthenticationSasl { mechanisms })
            }
            11 => Ok(Backend::AuthenticationSaslContinue(self.0.split_off(0))),
            12 => Ok(Backend::AuthenticationSaslFinal(self.0.split_off(0))),
            other => Err(ClientError::Auth(format!(
                "Unsupported authentication method: {}",
                other
            ))),
        }
    }

    fn row_description(&mut self) -> Result<Vec<FieldDescriptor>> {
        let count = self.i16()?.max(0) as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            let name = self.cstr()?;
            let _table_oid = self.i32()?;
            let _column_attr = self.i16()?;
            let type_oid = Oid(self.i32()?);
            let _type_size = self.i16()?;
            let _type_modifier = self.i32()?;
            let format = Format::from_code(self.i16()?);
            fields.push(FieldDescriptor::new(name, format, type_oid));
        }
        Ok(fields)
    }

    fn data_row(&mut self) -> Result<RawRow> {
        let count = self.i16()?.max(0) as usize;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            let len = self.i32()?;
            values.push(if len < 0 {
                None
            } else {
                Some(self.bytes(len as usize)?)
            });
        }
        Ok(values)
    }

    fn error_fields(&mut self) -> Result<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        while self.0.has_remaining() {
            let code = self.u8()?;
            if code == 0 {
                break;
            }
            fields.insert(code, self.cstr()?);
        }
        Ok(fields)
    }
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5::compute(format!("{}{}", password, user));
    let mut outer = format!("{:x}", inner).into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}
