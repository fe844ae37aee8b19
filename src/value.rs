//! Tagged field values and their `LOAD DATA` text encoding.

use crate::error::EncodeError;
use bigdecimal::BigDecimal;
use bytes::{BufMut, BytesMut};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use uuid::Uuid;

/// A field value carrying its logical type, sufficient for choosing an
/// encoder without an external schema lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    Decimal(BigDecimal),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
}

/// Logical column types. Enum and set columns travel as [`ValueType::Text`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Bool,
    Int,
    UInt,
    Float,
    Double,
    Decimal,
    Date,
    Time,
    DateTime,
    Text,
    Bytes,
    Uuid,
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::UInt(_) => ValueType::UInt,
            Value::Float(_) => ValueType::Float,
            Value::Double(_) => ValueType::Double,
            Value::Decimal(_) => ValueType::Decimal,
            Value::Date(_) => ValueType::Date,
            Value::Time(_) => ValueType::Time,
            Value::DateTime(_) => ValueType::DateTime,
            Value::Text(_) => ValueType::Text,
            Value::Bytes(_) => ValueType::Bytes,
            Value::Uuid(_) => ValueType::Uuid,
        }
    }
}

/// Field and line formatting for the generated row stream.
#[derive(Debug, Clone)]
pub struct FieldFormat {
    pub field_terminator: Vec<u8>,
    pub line_terminator: Vec<u8>,
    pub quote: Option<u8>,
    pub quote_optional: bool,
    pub escape: u8,
}

impl Default for FieldFormat {
    fn default() -> Self {
        Self {
            field_terminator: b"\t".to_vec(),
            line_terminator: b"\n".to_vec(),
            quote: None,
            quote_optional: false,
            escape: b'\\',
        }
    }
}

/// Encodes one value into `out` using the `LOAD DATA` text format.
///
/// `hex` marks fields bound to a binary destination column: the bytes are
/// written as lowercase hex and decoded server-side through `UNHEX`. Any
/// other value in a hex field, or raw bytes in a non-hex field, is a type
/// mismatch.
pub fn encode_value(
    value: &Value,
    hex: bool,
    format: &FieldFormat,
    out: &mut BytesMut,
) -> Result<(), EncodeError> {
    match value {
        Value::Null => {
            out.put_u8(format.escape);
            out.put_u8(b'N');
        }
        Value::Bytes(bytes) if hex => {
            out.extend_from_slice(hex::encode(bytes).as_bytes());
        }
        _ if hex => return Err(EncodeError::TypeMismatch { expected: "binary" }),
        Value::Bool(b) => out.put_u8(if *b { b'1' } else { b'0' }),
        Value::Int(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::UInt(v) => out.extend_from_slice(v.to_string().as_bytes()),
        Value::Float(v) => {
            if !v.is_finite() {
                return Err(EncodeError::UnsupportedValue);
            }
            out.extend_from_slice(v.to_string().as_bytes());
        }
        Value::Double(v) => {
            if !v.is_finite() {
                return Err(EncodeError::UnsupportedValue);
            }
            out.extend_from_slice(v.to_string().as_bytes());
        }
        Value::Decimal(d) => out.extend_from_slice(d.to_string().as_bytes()),
        Value::Date(d) => {
            out.extend_from_slice(d.format("%Y-%m-%d").to_string().as_bytes());
        }
        Value::Time(t) => {
            out.extend_from_slice(t.format("%H:%M:%S").to_string().as_bytes());
            write_fraction(t.nanosecond(), out);
        }
        Value::DateTime(dt) => {
            out.extend_from_slice(dt.format("%Y-%m-%d %H:%M:%S").to_string().as_bytes());
            write_fraction(dt.nanosecond(), out);
        }
        Value::Text(s) => write_escaped_text(s.as_bytes(), format, out),
        Value::Bytes(_) => {
            return Err(EncodeError::TypeMismatch {
                expected: "text-compatible",
            })
        }
        Value::Uuid(u) => {
            out.extend_from_slice(u.hyphenated().to_string().as_bytes());
        }
    }
    Ok(())
}

/// Microsecond fraction, written only when non-zero (server precision is 6).
fn write_fraction(nanos: u32, out: &mut BytesMut) {
    let micros = (nanos / 1_000) % 1_000_000;
    if micros != 0 {
        out.extend_from_slice(format!(".{:06}", micros).as_bytes());
    }
}

/// Writes text, quoting if a quote character is configured and escaping
/// every byte the server would otherwise treat as structure. The control
/// characters use their letter forms (`\0`, `\n`, `\r`, `\t`), which the
/// server's `FIELDS ESCAPED BY` handling folds back to the raw bytes.
fn write_escaped_text(bytes: &[u8], format: &FieldFormat, out: &mut BytesMut) {
    if let Some(q) = format.quote {
        out.put_u8(q);
    }
    let field_first = format.field_terminator.first().copied();
    let line_first = format.line_terminator.first().copied();
    for &b in bytes {
        match b {
            0 => {
                out.put_u8(format.escape);
                out.put_u8(b'0');
            }
            b'\n' => {
                out.put_u8(format.escape);
                out.put_u8(b'n');
            }
            b'\r' => {
                out.put_u8(format.escape);
                out.put_u8(b'r');
            }
            b'\t' => {
                out.put_u8(format.escape);
                out.put_u8(b't');
            }
            _ if b == format.escape => {
                out.put_u8(format.escape);
                out.put_u8(b);
            }
            _ if Some(b) == format.quote => {
                out.put_u8(format.escape);
                out.put_u8(b);
            }
            _ if Some(b) == field_first || Some(b) == line_first => {
                out.put_u8(format.escape);
                out.put_u8(b);
            }
            _ => out.put_u8(b),
        }
    }
    if let Some(q) = format.quote {
        out.put_u8(q);
    }
}
