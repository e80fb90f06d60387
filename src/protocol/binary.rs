//! Value model plus text- and binary-protocol row codecs.
//!
//! Binary parameters are typed per column; decimals travel as strings,
//! temporal values carry microsecond precision, BIT/geometry stay opaque
//! length-prefixed blobs.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{get_lenenc_bytes, put_lenenc_bytes};
use super::response::{ColumnDefinition, ColumnType};

/// A single cell or bound parameter
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    UInt(u64),
    Float(f32),
    Double(f64),
    /// Strings, decimals-as-strings, BIT and geometry blobs
    Bytes(Bytes),
    /// DATE / DATETIME / TIMESTAMP with microsecond precision
    Date {
        year: u16,
        month: u8,
        day: u8,
        hour: u8,
        minute: u8,
        second: u8,
        micros: u32,
    },
    /// TIME (may be negative and exceed 24h)
    Time {
        negative: bool,
        days: u32,
        hours: u8,
        minutes: u8,
        seconds: u8,
        micros: u32,
    },
}

impl Value {
    pub fn from_str(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Wire type used when binding this value as a binary parameter
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Int(_) => ColumnType::LongLong,
            Value::UInt(_) => ColumnType::LongLong,
            Value::Float(_) => ColumnType::Float,
            Value::Double(_) => ColumnType::Double,
            Value::Bytes(_) => ColumnType::Blob,
            Value::Date { .. } => ColumnType::DateTime,
            Value::Time { .. } => ColumnType::Time,
        }
    }

    /// Lossless string form, used by `getString`-like consumers and by the
    /// rewrite strategy's literal rendering.
    pub fn as_sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(v) => v.to_string(),
            Value::UInt(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Bytes(b) => {
                let mut out = String::with_capacity(b.len() + 2);
                out.push('\'');
                for &byte in b.iter() {
                    match byte {
                        b'\'' => out.push_str("''"),
                        b'\\' => out.push_str("\\\\"),
                        0 => out.push_str("\\0"),
                        _ => out.push(byte as char),
                    }
                }
                out.push('\'');
                out
            }
            Value::Date {
                year,
                month,
                day,
                hour,
                minute,
                second,
                micros,
            } => {
                if *micros > 0 {
                    format!(
                        "'{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}'",
                        year, month, day, hour, minute, second, micros
                    )
                } else {
                    format!(
                        "'{:04}-{:02}-{:02} {:02}:{:02}:{:02}'",
                        year, month, day, hour, minute, second
                    )
                }
            }
            Value::Time {
                negative,
                days,
                hours,
                minutes,
                seconds,
                micros,
            } => {
                let sign = if *negative { "-" } else { "" };
                let total_hours = days * 24 + *hours as u32;
                if *micros > 0 {
                    format!(
                        "'{}{:02}:{:02}:{:02}.{:06}'",
                        sign, total_hours, minutes, seconds, micros
                    )
                } else {
                    format!("'{}{:02}:{:02}:{:02}'", sign, total_hours, minutes, seconds)
                }
            }
        }
    }

    /// Size estimate of the binary encoding, used by the pre-flight
    /// max_allowed_packet check before anything is assembled.
    pub fn binary_size(&self) -> usize {
        match self {
            Value::Null => 0,
            Value::Int(_) | Value::UInt(_) | Value::Double(_) => 8,
            Value::Float(_) => 4,
            Value::Bytes(b) => b.len() + 9,
            Value::Date { .. } => 12,
            Value::Time { .. } => 13,
        }
    }
}

/// Decode a text-protocol row into values, using column metadata for typing.
pub fn decode_text_row(payload: &[u8], columns: &[ColumnDefinition]) -> Option<Vec<Value>> {
    let mut buf = payload;
    let mut row = Vec::with_capacity(columns.len());

    for column in columns {
        if buf.first() == Some(&0xFB) {
            buf.advance(1);
            row.push(Value::Null);
            continue;
        }
        let raw = get_lenenc_bytes(&mut buf)?;
        row.push(text_value(&raw, column));
    }
    Some(row)
}

fn text_value(raw: &Bytes, column: &ColumnDefinition) -> Value {
    let text = || String::from_utf8_lossy(raw);
    match column.column_type {
        ColumnType::Tiny | ColumnType::Short | ColumnType::Int24 | ColumnType::Long
        | ColumnType::LongLong | ColumnType::Year => {
            if column.is_unsigned() {
                text().parse::<u64>().map(Value::UInt).unwrap_or_else(|_| Value::Bytes(raw.clone()))
            } else {
                text().parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::Bytes(raw.clone()))
            }
        }
        ColumnType::Float => text()
            .parse::<f32>()
            .map(Value::Float)
            .unwrap_or_else(|_| Value::Bytes(raw.clone())),
        ColumnType::Double => text()
            .parse::<f64>()
            .map(Value::Double)
            .unwrap_or_else(|_| Value::Bytes(raw.clone())),
        // Decimals stay textual to preserve precision; everything else is bytes
        _ => Value::Bytes(raw.clone()),
    }
}

/// Decode a binary-protocol row (COM_STMT_EXECUTE / COM_STMT_FETCH results).
pub fn decode_binary_row(payload: &[u8], columns: &[ColumnDefinition]) -> Option<Vec<Value>> {
    if payload.first() != Some(&0x00) {
        return None;
    }
    let bitmap_len = (columns.len() + 7 + 2) / 8;
    if payload.len() < 1 + bitmap_len {
        return None;
    }
    let bitmap = &payload[1..1 + bitmap_len];
    let mut buf = &payload[1 + bitmap_len..];

    let mut row = Vec::with_capacity(columns.len());
    for (idx, column) in columns.iter().enumerate() {
        // Null bitmap offset is 2 for result rows
        let bit = idx + 2;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            row.push(Value::Null);
            continue;
        }
        row.push(decode_binary_value(&mut buf, column)?);
    }
    Some(row)
}

fn decode_binary_value(buf: &mut &[u8], column: &ColumnDefinition) -> Option<Value> {
    let unsigned = column.is_unsigned();
    let value = match column.column_type {
        ColumnType::Tiny => {
            if buf.is_empty() {
                return None;
            }
            let v = buf.get_u8();
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i8 as i64)
            }
        }
        ColumnType::Short | ColumnType::Year => {
            if buf.len() < 2 {
                return None;
            }
            let v = buf.get_u16_le();
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i16 as i64)
            }
        }
        ColumnType::Long | ColumnType::Int24 => {
            if buf.len() < 4 {
                return None;
            }
            let v = buf.get_u32_le();
            if unsigned {
                Value::UInt(v as u64)
            } else {
                Value::Int(v as i32 as i64)
            }
        }
        ColumnType::LongLong => {
            if buf.len() < 8 {
                return None;
            }
            let v = buf.get_u64_le();
            if unsigned {
                Value::UInt(v)
            } else {
                Value::Int(v as i64)
            }
        }
        ColumnType::Float => {
            if buf.len() < 4 {
                return None;
            }
            Value::Float(buf.get_f32_le())
        }
        ColumnType::Double => {
            if buf.len() < 8 {
                return None;
            }
            Value::Double(buf.get_f64_le())
        }
        ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => {
            decode_binary_date(buf)?
        }
        ColumnType::Time => decode_binary_time(buf)?,
        ColumnType::Null => Value::Null,
        // Strings, decimals, JSON, BIT, geometry: length-prefixed bytes
        _ => Value::Bytes(get_lenenc_bytes(buf)?),
    };
    Some(value)
}

fn decode_binary_date(buf: &mut &[u8]) -> Option<Value> {
    if buf.is_empty() {
        return None;
    }
    let len = buf.get_u8() as usize;
    if buf.len() < len {
        return None;
    }
    let mut v = Value::Date {
        year: 0,
        month: 0,
        day: 0,
        hour: 0,
        minute: 0,
        second: 0,
        micros: 0,
    };
    if let Value::Date {
        year,
        month,
        day,
        hour,
        minute,
        second,
        micros,
    } = &mut v
    {
        if len >= 4 {
            *year = buf.get_u16_le();
            *month = buf.get_u8();
            *day = buf.get_u8();
        }
        if len >= 7 {
            *hour = buf.get_u8();
            *minute = buf.get_u8();
            *second = buf.get_u8();
        }
        if len >= 11 {
            *micros = buf.get_u32_le();
        }
    }
    Some(v)
}

fn decode_binary_time(buf: &mut &[u8]) -> Option<Value> {
    if buf.is_empty() {
        return None;
    }
    let len = buf.get_u8() as usize;
    if buf.len() < len {
        return None;
    }
    let mut negative = false;
    let (mut days, mut hours, mut minutes, mut seconds, mut micros) = (0u32, 0u8, 0u8, 0u8, 0u32);
    if len >= 8 {
        negative = buf.get_u8() == 1;
        days = buf.get_u32_le();
        hours = buf.get_u8();
        minutes = buf.get_u8();
        seconds = buf.get_u8();
    }
    if len >= 12 {
        micros = buf.get_u32_le();
    }
    Some(Value::Time {
        negative,
        days,
        hours,
        minutes,
        seconds,
        micros,
    })
}

/// Append the binary encoding of one value (no type byte, no null bitmap).
pub fn encode_binary_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => {}
        Value::Int(v) => buf.put_i64_le(*v),
        Value::UInt(v) => buf.put_u64_le(*v),
        Value::Float(v) => buf.put_f32_le(*v),
        Value::Double(v) => buf.put_f64_le(*v),
        Value::Bytes(b) => put_lenenc_bytes(buf, b),
        Value::Date {
            year,
            month,
            day,
            hour,
            minute,
            second,
            micros,
        } => {
            if *micros > 0 {
                buf.put_u8(11);
            } else {
                buf.put_u8(7);
            }
            buf.put_u16_le(*year);
            buf.put_u8(*month);
            buf.put_u8(*day);
            buf.put_u8(*hour);
            buf.put_u8(*minute);
            buf.put_u8(*second);
            if *micros > 0 {
                buf.put_u32_le(*micros);
            }
        }
        Value::Time {
            negative,
            days,
            hours,
            minutes,
            seconds,
            micros,
        } => {
            if *micros > 0 {
                buf.put_u8(12);
            } else {
                buf.put_u8(8);
            }
            buf.put_u8(*negative as u8);
            buf.put_u32_le(*days);
            buf.put_u8(*hours);
            buf.put_u8(*minutes);
            buf.put_u8(*seconds);
            if *micros > 0 {
                buf.put_u32_le(*micros);
            }
        }
    }
}

/// Append the two-byte parameter type entry (type + unsigned flag).
pub fn encode_param_type(buf: &mut BytesMut, value: &Value) {
    buf.put_u8(value.column_type() as u8);
    buf.put_u8(if matches!(value, Value::UInt(_)) {
        0x80
    } else {
        0x00
    });
}

/// Build the parameter block of a COM_STMT_EXECUTE body: null bitmap,
/// new-params-bound flag, type table and values.
pub fn encode_param_block(buf: &mut BytesMut, params: &[Value]) {
    let bitmap_len = (params.len() + 7) / 8;
    let mut bitmap = vec![0u8; bitmap_len];
    for (idx, param) in params.iter().enumerate() {
        if param.is_null() {
            bitmap[idx / 8] |= 1 << (idx % 8);
        }
    }
    buf.extend_from_slice(&bitmap);
    buf.put_u8(1); // new params bound
    for param in params {
        encode_param_type(buf, param);
    }
    for param in params {
        encode_binary_value(buf, param);
    }
}
