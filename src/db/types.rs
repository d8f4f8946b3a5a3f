//! PostgreSQL row decoding for the query runner.
//!
//! Each column is mapped from its server type name to a [`PgColumnKind`],
//! which picks the Rust type sqlx decodes it as and how that value is shown
//! in JSON. A value that cannot be decoded comes back as `null` and is logged;
//! decoding never fails a query.

use crate::models::ColumnMetadata;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueFormat, PgValueRef};
use sqlx::error::BoxDynError;
use sqlx::{Column, Decode, Postgres, Row, Type, TypeInfo};
use std::fmt::Write as _;
use tracing::warn;

/// How a PostgreSQL column is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgColumnKind {
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Numeric,
    Bool,
    Bytea,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    /// Text types. Anything unrecognized is also tried as text.
    Text,
}

impl PgColumnKind {
    /// Map a type name as reported by sqlx (`INT4`, `TIMESTAMPTZ`, ...).
    pub fn from_type_name(name: &str) -> Self {
        match name.to_ascii_uppercase().as_str() {
            "INT2" | "SMALLINT" | "SMALLSERIAL" => Self::Int2,
            "INT4" | "INT" | "INTEGER" | "SERIAL" => Self::Int4,
            "INT8" | "BIGINT" | "BIGSERIAL" => Self::Int8,
            "FLOAT4" | "REAL" => Self::Float4,
            "FLOAT8" | "DOUBLE PRECISION" => Self::Float8,
            "NUMERIC" | "DECIMAL" => Self::Numeric,
            "BOOL" | "BOOLEAN" => Self::Bool,
            "BYTEA" => Self::Bytea,
            "JSON" | "JSONB" => Self::Json,
            "UUID" => Self::Uuid,
            "TIMESTAMP" => Self::Timestamp,
            "TIMESTAMPTZ" => Self::TimestampTz,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            _ => Self::Text,
        }
    }
}

/// NUMERIC kept as the server's exact text rather than rounded through f64.
#[derive(Debug)]
struct NumericText(String);

impl Type<Postgres> for NumericText {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        ty.name() == "NUMERIC"
    }
}

impl<'r> Decode<'r, Postgres> for NumericText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => {
                <&str as Decode<Postgres>>::decode(value).map(|s| NumericText(s.to_owned()))
            }
            PgValueFormat::Binary => numeric_from_binary(value.as_bytes()?).map(NumericText),
        }
    }
}

/// Render the binary NUMERIC wire form: `ndigits, weight, sign, dscale`
/// followed by base-10000 digits, most significant first.
fn numeric_from_binary(buf: &[u8]) -> Result<String, BoxDynError> {
    let word = |i: usize| -> Result<i16, BoxDynError> {
        buf.get(i * 2..i * 2 + 2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };
    let ndigits = word(0)?.max(0) as usize;
    let weight = i32::from(word(1)?);
    let sign = word(2)? as u16;
    let dscale = word(3)?.max(0) as usize;
    match sign {
        0xC000 => return Ok("NaN".to_owned()),
        0xD000 => return Ok("Infinity".to_owned()),
        0xF000 => return Ok("-Infinity".to_owned()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<_>, _>>()?;
    let digit = |k: i32| -> i16 {
        usize::try_from(k)
            .ok()
            .and_then(|k| digits.get(k).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == 0x4000 {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        for k in 0..=weight {
            if k == 0 {
                write!(out, "{}", digit(k))?;
            } else {
                write!(out, "{:04}", digit(k))?;
            }
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
        let mut k = weight + 1;
        while fraction.len() < dscale {
            write!(fraction, "{:04}", digit(k))?;
            k += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }
    Ok(out)
}

/// Render `bytea` for JSON: base64, or plain text when `prefer_text` is set
/// and the bytes are valid UTF-8.
pub fn encode_bytes(bytes: &[u8], prefer_text: bool) -> JsonValue {
    let text = if prefer_text {
        std::str::from_utf8(bytes).ok().map(str::to_owned)
    } else {
        None
    };
    JsonValue::String(text.unwrap_or_else(|| STANDARD.encode(bytes)))
}

/// Rows the query runner can turn into JSON.
pub trait JsonRow {
    fn column_metadata(&self) -> Vec<ColumnMetadata>;

    fn to_json(&self, decode_binary: bool) -> Map<String, JsonValue>;
}

impl JsonRow for PgRow {
    fn column_metadata(&self) -> Vec<ColumnMetadata> {
        self.columns()
            .iter()
            .map(|col| ColumnMetadata::new(col.name(), col.type_info().name()))
            .collect()
    }

    fn to_json(&self, decode_binary: bool) -> Map<String, JsonValue> {
        self.columns()
            .iter()
            .map(|col| {
                let kind = PgColumnKind::from_type_name(col.type_info().name());
                let value = column_value(self, col.ordinal(), kind, decode_binary);
                (col.name().to_owned(), value)
            })
            .collect()
    }
}

fn column_value(row: &PgRow, idx: usize, kind: PgColumnKind, decode_binary: bool) -> JsonValue {
    use PgColumnKind as K;

    let value = match kind {
        K::Int2 => get::<i16>(row, idx).map(JsonValue::from),
        K::Int4 => get::<i32>(row, idx).map(JsonValue::from),
        K::Int8 => get::<i64>(row, idx).map(JsonValue::from),
        K::Float4 => get::<f32>(row, idx).map(|v| float(f64::from(v))),
        K::Float8 => get::<f64>(row, idx).map(float),
        K::Numeric => get::<NumericText>(row, idx).map(|v| JsonValue::String(v.0)),
        K::Bool => get::<bool>(row, idx).map(JsonValue::Bool),
        K::Bytea => get::<Vec<u8>>(row, idx).map(|v| encode_bytes(&v, decode_binary)),
        K::Json => get::<JsonValue>(row, idx),
        K::Uuid => get::<uuid::Uuid>(row, idx).map(|v| JsonValue::String(v.to_string())),
        K::Timestamp => get::<NaiveDateTime>(row, idx).map(|v| JsonValue::String(v.to_string())),
        K::TimestampTz => get::<DateTime<Utc>>(row, idx).map(|v| JsonValue::String(v.to_rfc3339())),
        K::Date => get::<NaiveDate>(row, idx).map(|v| JsonValue::String(v.to_string())),
        K::Time => get::<NaiveTime>(row, idx).map(|v| JsonValue::String(v.to_string())),
        K::Text => get::<String>(row, idx).map(JsonValue::String),
    };
    value.unwrap_or(JsonValue::Null)
}

/// Decode one nullable column, logging values sqlx rejects.
fn get<T>(row: &PgRow, idx: usize) -> Option<T>
where
    T: for<'r> Decode<'r, Postgres> + Type<Postgres>,
{
    match row.try_get::<Option<T>, _>(idx) {
        Ok(value) => value,
        Err(e) => {
            warn!(column = idx, error = %e, "Could not decode column value");
            None
        }
    }
}

/// NaN and infinities have no JSON number form.
fn float(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}
