//! Runtime column types and values.
//!
//! Rows move between connectors, plans and consumers as `Vec<Value>`. Each
//! column carries a declared [`DataType`]; [`coerce`] converts a value of one
//! runtime type into another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sluice_error::{ErrorCode, Result, SluiceError};
use std::fmt;

use crate::lob::Lob;

pub type Row = Vec<Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Boolean,
    Integer,
    Double,
    String,
    Timestamp,
    Binary,
    Blob,
    Clob,
    /// Any value; never converted.
    Object,
}

impl DataType {
    pub fn is_lob(self) -> bool {
        matches!(self, DataType::Blob | DataType::Clob)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Boolean => "boolean",
            DataType::Integer => "integer",
            DataType::Double => "double",
            DataType::String => "string",
            DataType::Timestamp => "timestamp",
            DataType::Binary => "binary",
            DataType::Blob => "blob",
            DataType::Clob => "clob",
            DataType::Object => "object",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Blob(Lob),
    Clob(Lob),
}

impl Value {
    /// Runtime type of the value; `None` for null.
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Boolean(_) => Some(DataType::Boolean),
            Value::Integer(_) => Some(DataType::Integer),
            Value::Double(_) => Some(DataType::Double),
            Value::String(_) => Some(DataType::String),
            Value::Timestamp(_) => Some(DataType::Timestamp),
            Value::Binary(_) => Some(DataType::Binary),
            Value::Blob(_) => Some(DataType::Blob),
            Value::Clob(_) => Some(DataType::Clob),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_lob(&self) -> Option<&Lob> {
        match self {
            Value::Blob(lob) | Value::Clob(lob) => Some(lob),
            _ => None,
        }
    }

    /// Stable literal text used when a value participates in a cache key.
    pub fn to_literal(&self) -> String {
        match self {
            Value::Null => "null".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Double(d) => format!("{:?}", d),
            Value::String(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Timestamp(ts) => format!("ts'{}'", ts.to_rfc3339()),
            Value::Binary(b) => format!("x'{}'", hex(b)),
            Value::Blob(lob) | Value::Clob(lob) => format!("lob'{}'", lob.describe()),
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn conversion_error(value: &Value, target: DataType) -> SluiceError {
    let from = value
        .data_type()
        .map(|t| t.to_string())
        .unwrap_or_else(|| "null".to_string());
    SluiceError::new(
        ErrorCode::ConversionFailed,
        format!("Cannot convert {} value to {}", from, target),
    )
}

/// Converts `value` to `target`. Nulls and `Object` targets pass through.
///
/// LOB values only convert to their scalar counterpart when already inline;
/// streamed or stored LOBs stay LOBs.
pub fn coerce(value: Value, target: DataType) -> Result<Value> {
    if value.is_null() || target == DataType::Object || value.data_type() == Some(target) {
        return Ok(value);
    }

    let converted = match (value, target) {
        (Value::Integer(i), DataType::Double) => Value::Double(i as f64),
        (Value::Integer(i), DataType::Boolean) if i == 0 || i == 1 => Value::Boolean(i == 1),
        (Value::Boolean(b), DataType::Integer) => Value::Integer(i64::from(b)),
        (Value::Double(d), DataType::Integer)
            if d.fract() == 0.0 && d >= i64::MIN as f64 && d <= i64::MAX as f64 =>
        {
            Value::Integer(d as i64)
        }
        (Value::Boolean(b), DataType::String) => Value::String(b.to_string()),
        (Value::Integer(i), DataType::String) => Value::String(i.to_string()),
        (Value::Double(d), DataType::String) => Value::String(d.to_string()),
        (Value::Timestamp(ts), DataType::String) => Value::String(ts.to_rfc3339()),
        (Value::String(s), DataType::Integer) => match s.trim().parse::<i64>() {
            Ok(i) => Value::Integer(i),
            Err(_) => return Err(conversion_error(&Value::String(s), target)),
        },
        (Value::String(s), DataType::Double) => match s.trim().parse::<f64>() {
            Ok(d) => Value::Double(d),
            Err(_) => return Err(conversion_error(&Value::String(s), target)),
        },
        (Value::String(s), DataType::Boolean) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => return Err(conversion_error(&Value::String(s), target)),
        },
        (Value::String(s), DataType::Timestamp) => match DateTime::parse_from_rfc3339(s.trim()) {
            Ok(ts) => Value::Timestamp(ts.with_timezone(&Utc)),
            Err(_) => return Err(conversion_error(&Value::String(s), target)),
        },
        (Value::String(s), DataType::Clob) => Value::Clob(Lob::inline(s.into_bytes())),
        (Value::Binary(b), DataType::Blob) => Value::Blob(Lob::inline(b)),
        (Value::Blob(Lob::Inline(bytes)), DataType::Binary) => Value::Binary(bytes.to_vec()),
        (Value::Clob(Lob::Inline(bytes)), DataType::String) => {
            match String::from_utf8(bytes.to_vec()) {
                Ok(s) => Value::String(s),
                Err(_) => return Err(SluiceError::new(
                    ErrorCode::ConversionFailed,
                    "Clob content is not valid UTF-8",
                )),
            }
        }
        (value, target) => return Err(conversion_error(&value, target)),
    };
    Ok(converted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_widening_and_narrowing() {
        assert_eq!(
            coerce(Value::Integer(3), DataType::Double).unwrap(),
            Value::Double(3.0)
        );
        assert_eq!(
            coerce(Value::Double(4.0), DataType::Integer).unwrap(),
            Value::Integer(4)
        );
        assert!(coerce(Value::Double(4.5), DataType::Integer).is_err());
    }

    #[test]
    fn test_string_parsing() {
        assert_eq!(
            coerce(Value::String(" 42 ".into()), DataType::Integer).unwrap(),
            Value::Integer(42)
        );
        assert_eq!(
            coerce(Value::String("TRUE".into()), DataType::Boolean).unwrap(),
            Value::Boolean(true)
        );
        let ts = coerce(
            Value::String("2024-03-01T10:00:00Z".into()),
            DataType::Timestamp,
        )
        .unwrap();
        assert!(matches!(ts, Value::Timestamp(_)));

        let err = coerce(Value::String("abc".into()), DataType::Double).unwrap_err();
        assert_eq!(err.code, ErrorCode::ConversionFailed);
    }

    #[test]
    fn test_null_and_object_pass_through() {
        assert_eq!(coerce(Value::Null, DataType::Integer).unwrap(), Value::Null);
        assert_eq!(
            coerce(Value::String("x".into()), DataType::Object).unwrap(),
            Value::String("x".into())
        );
    }

    #[test]
    fn test_scalar_to_lob_wrapping() {
        let clob = coerce(Value::String("text".into()), DataType::Clob).unwrap();
        assert_eq!(clob, Value::Clob(Lob::inline(b"text".to_vec())));
        let back = coerce(clob, DataType::String).unwrap();
        assert_eq!(back, Value::String("text".into()));
    }

    #[test]
    fn test_literal_rendering() {
        assert_eq!(Value::String("it's".into()).to_literal(), "'it''s'");
        assert_eq!(Value::Binary(vec![0xab, 0x01]).to_literal(), "x'ab01'");
        assert_eq!(Value::Double(1.0).to_literal(), "1.0");
    }
}
