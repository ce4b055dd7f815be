//! SQL value types shared by every row source and vendor worker.
//!
//! Values are owned: a row leaves its source (entity, `DataTable`, reader)
//! and is handed to the driver's bulk writer, so there is nothing to borrow from.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use uuid::Uuid;

/// Type hint for NULL values.
///
/// Bulk writers need to know what a NULL stands for when the destination
/// column type alone is not enough (SQL Server bulk load tokens are typed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SqlNullType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Bytes,
    Uuid,
    Decimal,
    DateTime,
    DateTimeOffset,
    Date,
    Time,
}

/// A single column value in a bulk row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// NULL with type hint.
    Null(SqlNullType),

    /// Boolean value.
    Bool(bool),

    /// 16-bit signed integer (smallint).
    I16(i16),

    /// 32-bit signed integer (int).
    I32(i32),

    /// 64-bit signed integer (bigint).
    I64(i64),

    /// 32-bit floating point (real/float4).
    F32(f32),

    /// 64-bit floating point (double precision/float8).
    F64(f64),

    /// Text data.
    Text(String),

    /// Binary data.
    Bytes(Vec<u8>),

    /// UUID/GUID value.
    Uuid(Uuid),

    /// Decimal value with arbitrary precision.
    Decimal(Decimal),

    /// Timestamp without timezone.
    DateTime(NaiveDateTime),

    /// Timestamp with timezone offset.
    DateTimeOffset(DateTime<FixedOffset>),

    /// Date without time component.
    Date(NaiveDate),

    /// Time without date component.
    Time(NaiveTime),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null(_))
    }

    /// Get the SqlNullType for this value (for type-aware NULL encoding).
    #[must_use]
    pub fn null_type(&self) -> SqlNullType {
        match self {
            SqlValue::Null(t) => *t,
            SqlValue::Bool(_) => SqlNullType::Bool,
            SqlValue::I16(_) => SqlNullType::I16,
            SqlValue::I32(_) => SqlNullType::I32,
            SqlValue::I64(_) => SqlNullType::I64,
            SqlValue::F32(_) => SqlNullType::F32,
            SqlValue::F64(_) => SqlNullType::F64,
            SqlValue::Text(_) => SqlNullType::String,
            SqlValue::Bytes(_) => SqlNullType::Bytes,
            SqlValue::Uuid(_) => SqlNullType::Uuid,
            SqlValue::Decimal(_) => SqlNullType::Decimal,
            SqlValue::DateTime(_) => SqlNullType::DateTime,
            SqlValue::DateTimeOffset(_) => SqlNullType::DateTimeOffset,
            SqlValue::Date(_) => SqlNullType::Date,
            SqlValue::Time(_) => SqlNullType::Time,
        }
    }

    /// Short type label used in encoding error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SqlValue::Null(_) => "null",
            SqlValue::Bool(_) => "bool",
            SqlValue::I16(_) => "i16",
            SqlValue::I32(_) => "i32",
            SqlValue::I64(_) => "i64",
            SqlValue::F32(_) => "f32",
            SqlValue::F64(_) => "f64",
            SqlValue::Text(_) => "text",
            SqlValue::Bytes(_) => "bytes",
            SqlValue::Uuid(_) => "uuid",
            SqlValue::Decimal(_) => "decimal",
            SqlValue::DateTime(_) => "datetime",
            SqlValue::DateTimeOffset(_) => "datetimeoffset",
            SqlValue::Date(_) => "date",
            SqlValue::Time(_) => "time",
        }
    }

    /// Convert a JSON scalar into a value.
    ///
    /// Integers become `I64`, other numbers `F64`; arrays and objects are
    /// kept as their JSON text so they can land in json/jsonb/nvarchar columns.
    pub fn from_json(value: &serde_json::Value) -> SqlValue {
        use serde_json::Value;
        match value {
            Value::Null => SqlValue::Null(SqlNullType::String),
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::I64(i),
                None => SqlValue::F64(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            other => SqlValue::Text(other.to_string()),
        }
    }
}

/// Coercions used by the vendor encoders.
///
/// Each returns `None` when the value has no sensible conversion; NULL
/// always returns `None`.
impl SqlValue {
    pub fn to_bool(&self) -> Option<bool> {
        match self {
            SqlValue::Bool(b) => Some(*b),
            SqlValue::I16(0) | SqlValue::I32(0) | SqlValue::I64(0) => Some(false),
            SqlValue::I16(1) | SqlValue::I32(1) | SqlValue::I64(1) => Some(true),
            SqlValue::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn to_i64(&self) -> Option<i64> {
        match self {
            SqlValue::I16(i) => Some(i64::from(*i)),
            SqlValue::I32(i) => Some(i64::from(*i)),
            SqlValue::I64(i) => Some(*i),
            SqlValue::Bool(b) => Some(i64::from(*b)),
            SqlValue::Decimal(d) if d.fract().is_zero() => d.to_i64(),
            SqlValue::F64(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_f64(&self) -> Option<f64> {
        match self {
            SqlValue::F32(f) => Some(f64::from(*f)),
            SqlValue::F64(f) => Some(*f),
            SqlValue::I16(i) => Some(f64::from(*i)),
            SqlValue::I32(i) => Some(f64::from(*i)),
            SqlValue::I64(i) => Some(*i as f64),
            SqlValue::Decimal(d) => d.to_f64(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_decimal(&self) -> Option<Decimal> {
        match self {
            SqlValue::Decimal(d) => Some(*d),
            SqlValue::I16(i) => Some(Decimal::from(*i)),
            SqlValue::I32(i) => Some(Decimal::from(*i)),
            SqlValue::I64(i) => Some(Decimal::from(*i)),
            SqlValue::F32(f) => Decimal::try_from(*f).ok(),
            SqlValue::F64(f) => Decimal::try_from(*f).ok(),
            SqlValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn to_uuid(&self) -> Option<Uuid> {
        match self {
            SqlValue::Uuid(u) => Some(*u),
            SqlValue::Text(s) => Uuid::parse_str(s.trim()).ok(),
            SqlValue::Bytes(b) => Uuid::from_slice(b).ok(),
            _ => None,
        }
    }

    pub fn to_naive_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            SqlValue::DateTime(dt) => Some(*dt),
            SqlValue::DateTimeOffset(dto) => Some(dto.naive_utc()),
            SqlValue::Date(d) => Some(d.and_time(NaiveTime::MIN)),
            SqlValue::Text(s) => parse_naive_datetime(s),
            _ => None,
        }
    }

    /// Offset timestamp; naive input is taken as UTC.
    pub fn to_datetime_offset(&self) -> Option<DateTime<FixedOffset>> {
        match self {
            SqlValue::DateTimeOffset(dto) => Some(*dto),
            SqlValue::Text(s) => DateTime::parse_from_rfc3339(s.trim())
                .ok()
                .or_else(|| parse_naive_datetime(s).map(|dt| Utc.from_utc_datetime(&dt).fixed_offset())),
            other => other
                .to_naive_datetime()
                .map(|dt| Utc.from_utc_datetime(&dt).fixed_offset()),
        }
    }

    pub fn to_date(&self) -> Option<NaiveDate> {
        match self {
            SqlValue::Date(d) => Some(*d),
            SqlValue::DateTime(dt) => Some(dt.date()),
            SqlValue::DateTimeOffset(dto) => Some(dto.date_naive()),
            SqlValue::Text(s) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .ok()
                .or_else(|| parse_naive_datetime(s).map(|dt| dt.date())),
            _ => None,
        }
    }

    pub fn to_time(&self) -> Option<NaiveTime> {
        match self {
            SqlValue::Time(t) => Some(*t),
            SqlValue::DateTime(dt) => Some(dt.time()),
            SqlValue::Text(s) => NaiveTime::parse_from_str(s.trim(), "%H:%M:%S%.f").ok(),
            _ => None,
        }
    }

    /// Text form for character columns. Binary data has none.
    pub fn to_text(&self) -> Option<String> {
        Some(match self {
            SqlValue::Null(_) | SqlValue::Bytes(_) => return None,
            SqlValue::Text(s) => s.clone(),
            SqlValue::Bool(b) => b.to_string(),
            SqlValue::I16(i) => i.to_string(),
            SqlValue::I32(i) => i.to_string(),
            SqlValue::I64(i) => i.to_string(),
            SqlValue::F32(f) => f.to_string(),
            SqlValue::F64(f) => f.to_string(),
            SqlValue::Uuid(u) => u.to_string(),
            SqlValue::Decimal(d) => d.to_string(),
            SqlValue::DateTime(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string(),
            SqlValue::DateTimeOffset(dto) => dto.to_rfc3339(),
            SqlValue::Date(d) => d.to_string(),
            SqlValue::Time(t) => t.to_string(),
        })
    }

    pub fn to_bytes(&self) -> Option<Vec<u8>> {
        match self {
            SqlValue::Bytes(b) => Some(b.clone()),
            SqlValue::Text(s) => Some(s.as_bytes().to_vec()),
            SqlValue::Uuid(u) => Some(u.as_bytes().to_vec()),
            _ => None,
        }
    }
}

fn parse_naive_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
}

impl From<bool> for SqlValue {
    fn from(v: bool) -> Self {
        SqlValue::Bool(v)
    }
}

impl From<i16> for SqlValue {
    fn from(v: i16) -> Self {
        SqlValue::I16(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

impl From<f32> for SqlValue {
    fn from(v: f32) -> Self {
        SqlValue::F32(v)
    }
}

impl From<f64> for SqlValue {
    fn from(v: f64) -> Self {
        SqlValue::F64(v)
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> Self {
        SqlValue::Text(v)
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> Self {
        SqlValue::Text(v.to_string())
    }
}

impl From<Vec<u8>> for SqlValue {
    fn from(v: Vec<u8>) -> Self {
        SqlValue::Bytes(v)
    }
}

impl From<Uuid> for SqlValue {
    fn from(v: Uuid) -> Self {
        SqlValue::Uuid(v)
    }
}

impl From<Decimal> for SqlValue {
    fn from(v: Decimal) -> Self {
        SqlValue::Decimal(v)
    }
}

impl From<NaiveDateTime> for SqlValue {
    fn from(v: NaiveDateTime) -> Self {
        SqlValue::DateTime(v)
    }
}

impl From<DateTime<FixedOffset>> for SqlValue {
    fn from(v: DateTime<FixedOffset>) -> Self {
        SqlValue::DateTimeOffset(v)
    }
}

impl From<NaiveDate> for SqlValue {
    fn from(v: NaiveDate) -> Self {
        SqlValue::Date(v)
    }
}

impl From<NaiveTime> for SqlValue {
    fn from(v: NaiveTime) -> Self {
        SqlValue::Time(v)
    }
}

impl<T> From<Option<T>> for SqlValue
where
    T: Into<SqlValue> + NullHint,
{
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => SqlValue::Null(T::NULL_TYPE),
        }
    }
}

/// NULL type used when an `Option<T>` is `None`.
pub trait NullHint {
    const NULL_TYPE: SqlNullType;
}

macro_rules! null_hint {
    ($($ty:ty => $hint:ident),* $(,)?) => {
        $(impl NullHint for $ty {
            const NULL_TYPE: SqlNullType = SqlNullType::$hint;
        })*
    };
}

null_hint! {
    bool => Bool,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    f32 => F32,
    f64 => F64,
    String => String,
    Vec<u8> => Bytes,
    Uuid => Uuid,
    Decimal => Decimal,
    NaiveDateTime => DateTime,
    DateTime<FixedOffset> => DateTimeOffset,
    NaiveDate => Date,
    NaiveTime => Time,
}
