//! Binary COPY encoding of [`SqlValue`] for tokio-postgres.
//!
//! The destination column type decides the wire representation; values are
//! coerced to it (an `I64` from JSON input lands in an `int4` column, text
//! lands in `uuid`, `jsonb` or timestamp columns). Coercion failures are
//! reported per value and surface as a driver error from the COPY.

use std::error::Error;

use bytes::BytesMut;
use tokio_postgres::types::{to_sql_checked, IsNull, Kind, ToSql, Type};

use crate::core::value::SqlValue;

type BoxError = Box<dyn Error + Sync + Send>;

impl ToSql for SqlValue {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        if self.is_null() {
            return Ok(IsNull::Yes);
        }

        match ty.name() {
            "bool" => coerce(self, ty, self.to_bool())?.to_sql(ty, out),
            "int2" => i16::try_from(coerce(self, ty, self.to_i64())?)
                .map_err(|_| out_of_range(self, ty))?
                .to_sql(ty, out),
            "int4" => i32::try_from(coerce(self, ty, self.to_i64())?)
                .map_err(|_| out_of_range(self, ty))?
                .to_sql(ty, out),
            "int8" => coerce(self, ty, self.to_i64())?.to_sql(ty, out),
            "float4" => (coerce(self, ty, self.to_f64())? as f32).to_sql(ty, out),
            "float8" => coerce(self, ty, self.to_f64())?.to_sql(ty, out),
            "numeric" => coerce(self, ty, self.to_decimal())?.to_sql(ty, out),
            "uuid" => coerce(self, ty, self.to_uuid())?.to_sql(ty, out),
            "json" | "jsonb" => as_json(self).to_sql(ty, out),
            "timestamp" => coerce(self, ty, self.to_naive_datetime())?.to_sql(ty, out),
            "timestamptz" => coerce(self, ty, self.to_datetime_offset())?.to_sql(ty, out),
            "date" => coerce(self, ty, self.to_date())?.to_sql(ty, out),
            "time" => coerce(self, ty, self.to_time())?.to_sql(ty, out),
            "bytea" => match self {
                SqlValue::Bytes(b) => b.to_sql(ty, out),
                SqlValue::Text(s) => s.as_bytes().to_sql(ty, out),
                _ => Err(mismatch(self, ty)),
            },
            _ if is_text_like(ty) => {
                let text = coerce(self, ty, self.to_text())?;
                out.extend_from_slice(text.as_bytes());
                Ok(IsNull::No)
            }
            _ => Err(mismatch(self, ty)),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Types whose binary COPY form is the raw text.
fn is_text_like(ty: &Type) -> bool {
    match ty.kind() {
        Kind::Enum(_) => true,
        Kind::Domain(base) => is_text_like(base),
        _ => matches!(
            ty.name(),
            "text" | "varchar" | "bpchar" | "name" | "unknown" | "citext" | "xml"
        ),
    }
}

fn coerce<T>(value: &SqlValue, ty: &Type, converted: Option<T>) -> Result<T, BoxError> {
    converted.ok_or_else(|| mismatch(value, ty))
}

fn mismatch(value: &SqlValue, ty: &Type) -> BoxError {
    format!("cannot encode {} value as PostgreSQL {}", value.kind(), ty.name()).into()
}

fn out_of_range(value: &SqlValue, ty: &Type) -> BoxError {
    format!("{:?} is out of range for PostgreSQL {}", value, ty.name()).into()
}

fn as_json(value: &SqlValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        // Object and array input arrives as JSON text; anything else is a JSON string.
        SqlValue::Text(s) => serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone())),
        SqlValue::Bool(b) => Value::Bool(*b),
        SqlValue::I16(i) => Value::from(*i),
        SqlValue::I32(i) => Value::from(*i),
        SqlValue::I64(i) => Value::from(*i),
        SqlValue::F32(f) => Value::from(f64::from(*f)),
        SqlValue::F64(f) => Value::from(*f),
        other => Value::String(other.to_text().unwrap_or_default()),
    }
}
