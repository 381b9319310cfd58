use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use std::error::Error as StdError;
use std::net::IpAddr;
use tokio_postgres::types::{FromSql, Kind, Type};
use tracing::debug;

use super::types::{Row, Value};
use crate::Result;

/// Materializes a fetched PostgreSQL row into a [`Row`].
pub fn convert_row(row: &tokio_postgres::Row) -> Result<Row> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(index, column)| Ok((column.name().to_string(), convert_value(row, index)?)))
        .collect()
}

fn convert_value(row: &tokio_postgres::Row, index: usize) -> Result<Value> {
    let column = &row.columns()[index];
    let pg_type = column.type_();

    let value = match *pg_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(index)?.map(Value::Boolean),
        Type::CHAR => row
            .try_get::<_, Option<i8>>(index)?
            .map(|c| Value::Text(char::from(c as u8).to_string())),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)?
            .map(|i| Value::Integer(i.into())),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)?
            .map(|i| Value::Integer(i.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(index)?.map(Value::Integer),
        Type::OID => row
            .try_get::<_, Option<u32>>(index)?
            .map(|i| Value::Integer(i.into())),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)?
            .map(|f| Value::Float(f.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(index)?.map(Value::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(index)?
            .map(|d| Value::Text(d.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(index)?.map(Value::Text)
        }
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(index)?
            .map(|ts| Value::Timestamp(DateTime::<Utc>::from_naive_utc_and_offset(ts, Utc))),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(index)?
            .map(Value::Timestamp),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(index)?
            .map(|d| Value::Text(d.to_string())),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(index)?
            .map(|t| Value::Text(t.to_string())),
        Type::INTERVAL => row.try_get::<_, Option<RawValue>>(index)?.map(|raw| {
            interval_to_iso8601(&raw.0)
                .map(Value::Text)
                .unwrap_or_else(|| raw.into_value())
        }),
        Type::INET => row
            .try_get::<_, Option<IpAddr>>(index)?
            .map(|ip| Value::Text(ip.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)?
            .map(Value::Json),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(index)?
            .map(|u| Value::Text(u.to_string())),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(index)?.map(Value::Binary),
        _ => match pg_type.kind() {
            Kind::Array(element) => match convert_array(row, index, element) {
                Ok(Some(value)) => value,
                Ok(None) | Err(_) => raw(row, index)?,
            },
            // Enum labels are sent as plain UTF-8.
            Kind::Enum(_) => raw(row, index)?,
            _ => {
                debug!(
                    column = %column.name(),
                    pg_type = %pg_type,
                    "Publishing column of unmapped type from its wire bytes"
                );
                raw(row, index)?
            }
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

/// One-dimensional arrays of mapped scalar types become JSON arrays.
///
/// `Ok(None)` means the element type is not mapped.
fn convert_array(
    row: &tokio_postgres::Row,
    index: usize,
    element: &Type,
) -> std::result::Result<Option<Option<Value>>, tokio_postgres::Error> {
    use serde_json::Value as Json;

    let value = match *element {
        Type::BOOL => array::<bool, _>(row, index, Json::from)?,
        Type::INT2 => array::<i16, _>(row, index, Json::from)?,
        Type::INT4 => array::<i32, _>(row, index, Json::from)?,
        Type::INT8 => array::<i64, _>(row, index, Json::from)?,
        Type::FLOAT4 => array::<f32, _>(row, index, Json::from)?,
        Type::FLOAT8 => array::<f64, _>(row, index, Json::from)?,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            array::<String, _>(row, index, Json::from)?
        }
        Type::NUMERIC => array::<Decimal, _>(row, index, |d| Json::from(d.to_string()))?,
        Type::UUID => array::<uuid::Uuid, _>(row, index, |u| Json::from(u.to_string()))?,
        Type::TIMESTAMPTZ => array::<DateTime<Utc>, _>(row, index, |ts| {
            Json::from(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
        })?,
        Type::JSON | Type::JSONB => array::<serde_json::Value, _>(row, index, |json| json)?,
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn array<'a, T, F>(
    row: &'a tokio_postgres::Row,
    index: usize,
    to_json: F,
) -> std::result::Result<Option<Value>, tokio_postgres::Error>
where
    T: FromSql<'a>,
    F: Fn(T) -> serde_json::Value,
{
    Ok(row
        .try_get::<_, Option<Vec<Option<T>>>>(index)?
        .map(|items| {
            Value::Json(serde_json::Value::Array(
                items
                    .into_iter()
                    .map(|item| item.map_or(serde_json::Value::Null, &to_json))
                    .collect(),
            ))
        }))
}

fn raw(row: &tokio_postgres::Row, index: usize) -> Result<Option<Value>> {
    Ok(row
        .try_get::<_, Option<RawValue>>(index)?
        .map(RawValue::into_value))
}

/// The undecoded wire value of a column of any type.
struct RawValue(Vec<u8>);

impl RawValue {
    /// Text when the bytes are UTF-8, otherwise binary.
    fn into_value(self) -> Value {
        match String::from_utf8(self.0) {
            Ok(text) => Value::Text(text),
            Err(e) => Value::Binary(e.into_bytes()),
        }
    }
}

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(
        _ty: &Type,
        raw: &'a [u8],
    ) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(Self(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

/// Renders a binary `interval` (microseconds, days, months) in the
/// ISO 8601 format PostgreSQL uses with `intervalstyle = iso_8601`.
fn interval_to_iso8601(raw: &[u8]) -> Option<String> {
    if raw.len() != 16 {
        return None;
    }
    let micros = i64::from_be_bytes(raw[0..8].try_into().ok()?);
    let days = i32::from_be_bytes(raw[8..12].try_into().ok()?);
    let months = i32::from_be_bytes(raw[12..16].try_into().ok()?);

    let mut out = String::from("P");
    let (years, months) = (months / 12, months % 12);
    for (amount, unit) in [(years, 'Y'), (months, 'M'), (days, 'D')] {
        if amount != 0 {
            out.push_str(&format!("{}{}", amount, unit));
        }
    }

    let hours = micros / 3_600_000_000;
    let minutes = (micros % 3_600_000_000) / 60_000_000;
    let second_micros = micros % 60_000_000;
    if micros != 0 {
        out.push('T');
        if hours != 0 {
            out.push_str(&format!("{}H", hours));
        }
        if minutes != 0 {
            out.push_str(&format!("{}M", minutes));
        }
        if second_micros != 0 {
            let sign = if second_micros < 0 { "-" } else { "" };
            let abs = second_micros.unsigned_abs();
            let mut seconds = format!("{}{}.{:06}", sign, abs / 1_000_000, abs % 1_000_000);
            while seconds.ends_with('0') {
                seconds.pop();
            }
            if seconds.ends_with('.') {
                seconds.pop();
            }
            out.push_str(&seconds);
            out.push('S');
        }
    }

    if out == "P" {
        out.push_str("T0S");
    }
    Some(out)
}
