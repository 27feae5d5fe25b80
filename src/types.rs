//! PostgreSQL type identifiers, values, and their wire codecs.
//!
//! Binary format is used for prepared-statement parameters and results,
//! text format for the simple query protocol.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use bytes::{BufMut, BytesMut};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ClientError, Result};

// ============================================================================
// Format codes
// ============================================================================

/// Wire format of a parameter or result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

impl Format {
    pub fn from_code(code: i16) -> Self {
        if code == 0 {
            Format::Text
        } else {
            Format::Binary
        }
    }
}

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }
}

/// 2000-01-01, the PostgreSQL epoch for dates and timestamps.
pub(crate) fn pg_epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2000, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

// ============================================================================
// Values
// ============================================================================

/// A decoded column value or an encodable parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(String),
    Bytea(Vec<u8>),
    Uuid(Uuid),
    /// Microseconds since 2000-01-01 00:00:00.
    Timestamp(i64),
    /// Microseconds since 2000-01-01 00:00:00 UTC.
    TimestampTz(i64),
    /// Days since 2000-01-01.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    Json(serde_json::Value),
    /// Types without a dedicated decoder keep their raw bytes.
    Raw { oid: Oid, data: Vec<u8> },
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// OID announced in Parse for this parameter. NULL is left for the
    /// server to infer.
    pub fn type_oid(&self) -> Oid {
        match self {
            Value::Null => Oid(0),
            Value::Bool(_) => Oid::BOOL,
            Value::Int2(_) => Oid::INT2,
            Value::Int4(_) => Oid::INT4,
            Value::Int8(_) => Oid::INT8,
            Value::Float4(_) => Oid::FLOAT4,
            Value::Float8(_) => Oid::FLOAT8,
            Value::Text(_) => Oid::TEXT,
            Value::Bytea(_) => Oid::BYTEA,
            Value::Uuid(_) => Oid::UUID,
            Value::Timestamp(_) => Oid::TIMESTAMP,
            Value::TimestampTz(_) => Oid::TIMESTAMPTZ,
            Value::Date(_) => Oid::DATE,
            Value::Time(_) => Oid::TIME,
            Value::Json(_) => Oid::JSONB,
            Value::Raw { oid, .. } => *oid,
        }
    }

    /// Append the binary encoding of this value. Returns `None` for NULL.
    pub fn encode_binary(&self, buf: &mut BytesMut) -> Option<()> {
        match self {
            Value::Null => return None,
            Value::Bool(v) => buf.put_u8(u8::from(*v)),
            Value::Int2(v) => buf.put_i16(*v),
            Value::Int4(v) => buf.put_i32(*v),
            Value::Int8(v) => buf.put_i64(*v),
            Value::Float4(v) => buf.put_f32(*v),
            Value::Float8(v) => buf.put_f64(*v),
            Value::Text(v) => buf.put_slice(v.as_bytes()),
            Value::Bytea(v) => buf.put_slice(v),
            Value::Uuid(v) => buf.put_slice(v.as_bytes()),
            Value::Timestamp(v) | Value::TimestampTz(v) | Value::Time(v) => buf.put_i64(*v),
            Value::Date(v) => buf.put_i32(*v),
            Value::Json(v) => {
                // jsonb version byte
                buf.put_u8(1);
                buf.put_slice(v.to_string().as_bytes());
            }
            Value::Raw { data, .. } => buf.put_slice(data),
        }
        Some(())
    }

    /// Decode a non-null binary-format value.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self> {
        let value = match oid {
            Oid::BOOL => Value::Bool(fixed::<1>(oid, data)?[0] != 0),
            Oid::INT2 => Value::Int2(i16::from_be_bytes(fixed(oid, data)?)),
            Oid::INT4 => Value::Int4(i32::from_be_bytes(fixed(oid, data)?)),
            Oid::INT8 => Value::Int8(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::OID_TYPE => Value::Int8(i64::from(u32::from_be_bytes(fixed(oid, data)?))),
            Oid::FLOAT4 => Value::Float4(f32::from_be_bytes(fixed(oid, data)?)),
            Oid::FLOAT8 => Value::Float8(f64::from_be_bytes(fixed(oid, data)?)),
            Oid::BYTEA => Value::Bytea(data.to_vec()),
            Oid::UUID => Value::Uuid(Uuid::from_bytes(fixed(oid, data)?)),
            Oid::TIMESTAMP => Value::Timestamp(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::TIMESTAMPTZ => Value::TimestampTz(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::DATE => Value::Date(i32::from_be_bytes(fixed(oid, data)?)),
            Oid::TIME => Value::Time(i64::from_be_bytes(fixed(oid, data)?)),
            Oid::JSON => Value::Json(parse_json(data)?),
            Oid::JSONB => match data.split_first() {
                Some((1, rest)) => Value::Json(parse_json(rest)?),
                _ => return Err(ClientError::Decode("Unsupported jsonb version".to_string())),
            },
            _ if oid.is_text_like() => Value::Text(utf8(data)?.to_owned()),
            _ => Value::Raw {
                oid,
                data: data.to_vec(),
            },
        };
        Ok(value)
    }

    /// Decode a non-null text-format value (simple query protocol).
    pub fn decode_text(oid: Oid, data: &[u8]) -> Result<Self> {
        let text = utf8(data)?;
        let invalid = |e: &dyn std::fmt::Display| {
            ClientError::Decode(format!("Invalid text for OID {}: {} ({})", oid.0, text, e))
        };

        let value = match oid {
            Oid::BOOL => match text {
                "t" | "true" => Value::Bool(true),
                "f" | "false" => Value::Bool(false),
                other => return Err(invalid(&other)),
            },
            Oid::INT2 => Value::Int2(text.parse().map_err(|e| invalid(&e))?),
            Oid::INT4 => Value::Int4(text.parse().map_err(|e| invalid(&e))?),
            Oid::INT8 | Oid::OID_TYPE => Value::Int8(text.parse().map_err(|e| invalid(&e))?),
            Oid::FLOAT4 => Value::Float4(text.parse().map_err(|e| invalid(&e))?),
            Oid::FLOAT8 => Value::Float8(text.parse().map_err(|e| invalid(&e))?),
            Oid::UUID => Value::Uuid(Uuid::parse_str(text).map_err(|e| invalid(&e))?),
            Oid::BYTEA => Value::Bytea(decode_hex_bytea(text).ok_or_else(|| invalid(&"hex"))?),
            Oid::DATE => {
                let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|e| invalid(&e))?;
                Value::Date((date - pg_epoch().date()).num_days() as i32)
            }
            Oid::TIME => {
                let time = NaiveTime::parse_from_str(text, "%H:%M:%S%.f").map_err(|e| invalid(&e))?;
                let since_midnight = time - NaiveTime::MIN;
                Value::Time(since_midnight.num_microseconds().unwrap_or_default())
            }
            Oid::TIMESTAMP => {
                let ts = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
                    .map_err(|e| invalid(&e))?;
                Value::Timestamp(micros_since_epoch(ts))
            }
            Oid::TIMESTAMPTZ => {
                let ts = chrono::DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")
                    .map_err(|e| invalid(&e))?;
                Value::TimestampTz(micros_since_epoch(ts.naive_utc()))
            }
            Oid::JSON | Oid::JSONB => Value::Json(parse_json(data)?),
            _ => Value::Text(text.to_owned()),
        };
        Ok(value)
    }
}

pub(crate) fn micros_since_epoch(ts: NaiveDateTime) -> i64 {
    (ts - pg_epoch()).num_microseconds().unwrap_or(i64::MAX)
}

fn fixed<const N: usize>(oid: Oid, data: &[u8]) -> Result<[u8; N]> {
    data.try_into().map_err(|_| {
        ClientError::Decode(format!(
            "Invalid length {} for OID {} (expected {})",
            data.len(),
            oid.0,
            N
        ))
    })
}

fn utf8(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data).map_err(|e| ClientError::Decode(format!("Invalid UTF-8: {}", e)))
}

fn parse_json(data: &[u8]) -> Result<serde_json::Value> {
    serde_json::from_slice(data).map_err(|e| ClientError::Decode(format!("Invalid JSON: {}", e)))
}

fn decode_hex_bytea(text: &str) -> Option<Vec<u8>> {
    let hex = text.strip_prefix("\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect()
}

// ============================================================================
// Decoder selection
// ============================================================================

/// Decoder for one result column, chosen once per field descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoder {
    format: Format,
    oid: Oid,
}

impl Decoder {
    pub fn new(format: Format, oid: Oid) -> Self {
        Self { format, oid }
    }

    /// Decode a non-null raw value. Nulls never reach a decoder.
    pub fn decode(&self, raw: &[u8]) -> Result<Value> {
        match self.format {
            Format::Binary => Value::decode_binary(self.oid, raw),
            Format::Text => Value::decode_text(self.oid, raw),
        }
    }
}
