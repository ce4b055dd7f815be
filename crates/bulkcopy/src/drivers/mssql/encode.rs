//! Bulk-load encoding of [`SqlValue`] for tiberius.
//!
//! TDS bulk rows are typed by the destination, so each value is coerced to
//! the column's staging type (see [`staging_base`]) and NULLs carry that type.

use std::borrow::Cow;

use chrono::{NaiveDate, NaiveTime, Timelike};
use tiberius::numeric::Numeric;
use tiberius::time::{Date, DateTime2, DateTimeOffset, Time};
use tiberius::ColumnData;

use crate::core::columns::TableColumn;
use crate::core::value::SqlValue;
use crate::drivers::mssql::schema::{staging_base, staging_scale};
use crate::error::{BulkError, Result};

/// Encode `value` for `column` of `table`.
pub fn encode_value(table: &str, column: &TableColumn, value: &SqlValue) -> Result<ColumnData<'static>> {
    let base = staging_base(&column.data_type);
    if value.is_null() {
        return Ok(typed_null(base));
    }

    let scale = staging_scale(column).min(7);
    let mismatch = || {
        BulkError::operation(
            table,
            format!(
                "cannot write {} value {:?} to column {} ({})",
                value.kind(),
                value,
                column.name,
                column.data_type
            ),
        )
    };

    Ok(match base {
        "bit" => ColumnData::Bit(Some(value.to_bool().ok_or_else(mismatch)?)),
        "smallint" => {
            let i = value.to_i64().ok_or_else(mismatch)?;
            ColumnData::I16(Some(i16::try_from(i).map_err(|_| mismatch())?))
        }
        "int" => {
            let i = value.to_i64().ok_or_else(mismatch)?;
            ColumnData::I32(Some(i32::try_from(i).map_err(|_| mismatch())?))
        }
        "bigint" => ColumnData::I64(Some(value.to_i64().ok_or_else(mismatch)?)),
        "real" => ColumnData::F32(Some(value.to_f64().ok_or_else(mismatch)? as f32)),
        "float" => ColumnData::F64(Some(value.to_f64().ok_or_else(mismatch)?)),
        "decimal" | "numeric" => {
            let scale = staging_scale(column);
            let mut d = value.to_decimal().ok_or_else(mismatch)?;
            d.rescale(u32::from(scale));
            ColumnData::Numeric(Some(Numeric::new_with_scale(d.mantissa(), scale)))
        }
        "uniqueidentifier" => ColumnData::Guid(Some(value.to_uuid().ok_or_else(mismatch)?)),
        "date" => ColumnData::Date(Some(to_date(value.to_date().ok_or_else(mismatch)?).ok_or_else(mismatch)?)),
        "time" => ColumnData::Time(Some(to_time(value.to_time().ok_or_else(mismatch)?, scale))),
        "datetime2" => {
            let dt = value.to_naive_datetime().ok_or_else(mismatch)?;
            let date = to_date(dt.date()).ok_or_else(mismatch)?;
            ColumnData::DateTime2(Some(DateTime2::new(date, to_time(dt.time(), scale))))
        }
        "datetimeoffset" => {
            let dto = value.to_datetime_offset().ok_or_else(mismatch)?;
            let utc = dto.naive_utc();
            let date = to_date(utc.date()).ok_or_else(mismatch)?;
            let offset_minutes = (dto.offset().local_minus_utc() / 60) as i16;
            ColumnData::DateTimeOffset(Some(DateTimeOffset::new(
                DateTime2::new(date, to_time(utc.time(), scale)),
                offset_minutes,
            )))
        }
        "binary" | "varbinary" => ColumnData::Binary(Some(Cow::Owned(value.to_bytes().ok_or_else(mismatch)?))),
        // char, varchar, nchar, nvarchar, sysname
        _ => ColumnData::String(Some(Cow::Owned(value.to_text().ok_or_else(mismatch)?))),
    })
}

fn typed_null(base: &str) -> ColumnData<'static> {
    match base {
        "bit" => ColumnData::Bit(None),
        "smallint" => ColumnData::I16(None),
        "int" => ColumnData::I32(None),
        "bigint" => ColumnData::I64(None),
        "real" => ColumnData::F32(None),
        "float" => ColumnData::F64(None),
        "decimal" | "numeric" => ColumnData::Numeric(None),
        "uniqueidentifier" => ColumnData::Guid(None),
        "date" => ColumnData::Date(None),
        "time" => ColumnData::Time(None),
        "datetime2" => ColumnData::DateTime2(None),
        "datetimeoffset" => ColumnData::DateTimeOffset(None),
        "binary" | "varbinary" => ColumnData::Binary(None),
        _ => ColumnData::String(None),
    }
}

/// Days since 0001-01-01.
fn to_date(date: NaiveDate) -> Option<Date> {
    let epoch = NaiveDate::from_ymd_opt(1, 1, 1)?;
    let days = (date - epoch).num_days();
    u32::try_from(days).ok().map(Date::new)
}

/// Time of day in 10^-scale second increments.
fn to_time(time: NaiveTime, scale: u8) -> Time {
    let nanos = u64::from(time.num_seconds_from_midnight()) * 1_000_000_000
        + u64::from(time.nanosecond() % 1_000_000_000);
    let increments = nanos / 10u64.pow(9 - u32::from(scale));
    Time::new(increments, scale)
}
