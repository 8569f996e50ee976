//! Dynamic decoding of PostgreSQL rows into JSON values.
//!
//! The server has no schema knowledge; a row is a list of column values
//! decoded by the column's reported type. Unknown types fall back to
//! their textual form, or NULL when even that fails.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use sqlx::postgres::PgRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};
use uuid::Uuid;

use crate::error::{DataError, Result};

/// Decode every column of a row into its JSON representation.
///
/// # Errors
///
/// Returns an error if a column fails to decode as its reported type.
pub fn row_values(row: &PgRow) -> Result<Vec<Value>> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, col)| decode_column(row, i, col.type_info().name()))
        .collect()
}

fn decode_column(row: &PgRow, i: usize, type_name: &str) -> Result<Value> {
    let raw = row.try_get_raw(i).map_err(DataError::query)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let value = match type_name {
        "BOOL" => Value::Bool(get::<bool>(row, i)?),
        "INT2" => Value::Number(i64::from(get::<i16>(row, i)?).into()),
        "INT4" => Value::Number(i64::from(get::<i32>(row, i)?).into()),
        "INT8" => Value::Number(get::<i64>(row, i)?.into()),
        "FLOAT4" => float_value(f64::from(get::<f32>(row, i)?)),
        "FLOAT8" => float_value(get::<f64>(row, i)?),
        "NUMERIC" => {
            let d = get::<Decimal>(row, i)?;
            d.to_f64().map_or_else(
                || Value::String(d.to_string()),
                float_value,
            )
        }
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "UNKNOWN" => {
            Value::String(get::<String>(row, i)?)
        }
        "JSON" | "JSONB" => get::<Value>(row, i)?,
        "UUID" => Value::String(get::<Uuid>(row, i)?.to_string()),
        "TIMESTAMPTZ" => Value::String(get::<DateTime<Utc>>(row, i)?.to_rfc3339()),
        "TIMESTAMP" => Value::String(get::<NaiveDateTime>(row, i)?.to_string()),
        "DATE" => Value::String(get::<NaiveDate>(row, i)?.to_string()),
        "TIME" => Value::String(get::<NaiveTime>(row, i)?.to_string()),
        "BYTEA" => {
            let bytes = get::<Vec<u8>>(row, i)?;
            let mut out = String::with_capacity(2 + bytes.len() * 2);
            out.push_str("\\x");
            for b in &bytes {
                out.push_str(&format!("{b:02x}"));
            }
            Value::String(out)
        }
        "BOOL[]" => Value::Array(get::<Vec<bool>>(row, i)?.into_iter().map(Value::Bool).collect()),
        "INT4[]" => Value::Array(
            get::<Vec<i32>>(row, i)?
                .into_iter()
                .map(|v| Value::Number(i64::from(v).into()))
                .collect(),
        ),
        "INT8[]" => Value::Array(
            get::<Vec<i64>>(row, i)?
                .into_iter()
                .map(|v| Value::Number(v.into()))
                .collect(),
        ),
        "FLOAT8[]" => Value::Array(
            get::<Vec<f64>>(row, i)?
                .into_iter()
                .map(float_value)
                .collect(),
        ),
        "TEXT[]" | "VARCHAR[]" => Value::Array(
            get::<Vec<String>>(row, i)?
                .into_iter()
                .map(Value::String)
                .collect(),
        ),
        other => match row.try_get::<String, _>(i) {
            Ok(s) => Value::String(s),
            Err(err) => {
                tracing::warn!(column_type = %other, error = %err, "cannot decode column, emitting null");
                Value::Null
            }
        },
    };
    Ok(value)
}

fn get<'r, T>(row: &'r PgRow, i: usize) -> Result<T>
where
    T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
{
    row.try_get::<T, _>(i).map_err(DataError::query)
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}
