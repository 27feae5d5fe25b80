//! Conversions between [`Value`] and Rust types.

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::error::{ClientError, Result};
use crate::types::{micros_since_epoch, pg_epoch, Value};

/// Extract a Rust value from a decoded column.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Result<Self>;
}

/// Turn a Rust value into a statement parameter.
pub trait ToValue {
    fn to_value(&self) -> Value;
}

fn wrong_type<T>(expected: &str, value: &Value) -> Result<T> {
    match value {
        Value::Null => Err(ClientError::Decode(format!(
            "Unexpected NULL where {} was expected",
            expected
        ))),
        other => Err(ClientError::Decode(format!(
            "Cannot convert {:?} to {}",
            other, expected
        ))),
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bool(v) => Ok(*v),
            other => wrong_type("bool", other),
        }
    }
}

impl FromValue for i16 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int2(v) => Ok(*v),
            other => wrong_type("i16", other),
        }
    }
}

impl FromValue for i32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int2(v) => Ok(i32::from(*v)),
            Value::Int4(v) => Ok(*v),
            other => wrong_type("i32", other),
        }
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Int2(v) => Ok(i64::from(*v)),
            Value::Int4(v) => Ok(i64::from(*v)),
            Value::Int8(v) => Ok(*v),
            other => wrong_type("i64", other),
        }
    }
}

impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float4(v) => Ok(*v),
            other => wrong_type("f32", other),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float4(v) => Ok(f64::from(*v)),
            Value::Float8(v) => Ok(*v),
            other => wrong_type("f64", other),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(v) => Ok(v.clone()),
            other => wrong_type("String", other),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Bytea(v) => Ok(v.clone()),
            Value::Raw { data, .. } => Ok(data.clone()),
            other => wrong_type("Vec<u8>", other),
        }
    }
}

impl FromValue for Uuid {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Uuid(v) => Ok(*v),
            other => wrong_type("Uuid", other),
        }
    }
}

impl FromValue for NaiveDate {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Date(days) => pg_epoch()
                .date()
                .checked_add_signed(Duration::days(i64::from(*days)))
                .ok_or_else(|| ClientError::Decode(format!("Date out of range: {}", days))),
            other => wrong_type("NaiveDate", other),
        }
    }
}

impl FromValue for NaiveDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Timestamp(micros) | Value::TimestampTz(micros) => pg_epoch()
                .checked_add_signed(Duration::microseconds(*micros))
                .ok_or_else(|| ClientError::Decode(format!("Timestamp out of range: {}", micros))),
            other => wrong_type("NaiveDateTime", other),
        }
    }
}

impl FromValue for DateTime<Utc> {
    fn from_value(value: &Value) -> Result<Self> {
        NaiveDateTime::from_value(value).map(|ts| ts.and_utc())
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(v) => serde_json::from_str(v)
                .map_err(|e| ClientError::Decode(format!("Invalid JSON: {}", e))),
            other => wrong_type("serde_json::Value", other),
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

impl ToValue for Value {
    fn to_value(&self) -> Value {
        self.clone()
    }
}

impl<T: ToValue> ToValue for Option<T> {
    fn to_value(&self) -> Value {
        self.as_ref().map_or(Value::Null, ToValue::to_value)
    }
}

impl<T: ToValue + ?Sized> ToValue for &T {
    fn to_value(&self) -> Value {
        (**self).to_value()
    }
}

macro_rules! to_value_copy {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(impl ToValue for $ty {
            fn to_value(&self) -> Value {
                Value::$variant(*self)
            }
        })*
    };
}

to_value_copy! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    Uuid => Uuid,
}

impl ToValue for str {
    fn to_value(&self) -> Value {
        Value::Text(self.to_owned())
    }
}

impl ToValue for String {
    fn to_value(&self) -> Value {
        Value::Text(self.clone())
    }
}

impl ToValue for [u8] {
    fn to_value(&self) -> Value {
        Value::Bytea(self.to_vec())
    }
}

impl ToValue for Vec<u8> {
    fn to_value(&self) -> Value {
        Value::Bytea(self.clone())
    }
}

impl ToValue for NaiveDate {
    fn to_value(&self) -> Value {
        Value::Date((*self - pg_epoch().date()).num_days() as i32)
    }
}

impl ToValue for NaiveDateTime {
    fn to_value(&self) -> Value {
        Value::Timestamp(micros_since_epoch(*self))
    }
}

impl ToValue for DateTime<Utc> {
    fn to_value(&self) -> Value {
        Value::TimestampTz(micros_since_epoch(self.naive_utc()))
    }
}

impl ToValue for serde_json::Value {
    fn to_value(&self) -> Value {
        Value::Json(self.clone())
    }
}
