//! Leaf coercion for transformed rows.
//!
//! Upstream values arrive as JSON numbers or numeric strings and timestamps as
//! RFC 3339 strings. Each helper names the field it was reading so a rejected
//! row can be located in the logs.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

use crate::error::TransformError;

/// Offset assumed for timestamps that carry none (Singapore time).
const SOURCE_OFFSET_SECS: i32 = 8 * 3600;

fn coerce_err(field: &str, value: &Value, expected: &'static str) -> TransformError {
    // ---
    TransformError::Coerce {
        field: field.to_string(),
        value: value.to_string(),
        expected,
    }
}

pub fn float(field: &str, value: &Value) -> Result<f64, TransformError> {
    // ---
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .filter(|v| v.is_finite())
        .ok_or_else(|| coerce_err(field, value, "float"))
}

/// Like [`float`] but `null` (or an absent range) maps to `None`.
pub fn optional_float(field: &str, value: Option<&Value>) -> Result<Option<f64>, TransformError> {
    // ---
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(v) => float(field, v).map(Some),
    }
}

fn parse_offset_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    // ---
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt);
    }
    let offset = FixedOffset::east_opt(SOURCE_OFFSET_SECS)?;
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .and_then(|naive| offset.from_local_datetime(&naive).single())
}

pub fn timestamp(field: &str, value: &Value) -> Result<DateTime<Utc>, TransformError> {
    // ---
    value
        .as_str()
        .and_then(parse_offset_datetime)
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| coerce_err(field, value, "timestamp"))
}

/// Calendar date as seen in the timestamp's own offset, so a forecast for
/// `2024-07-20T00:00:00+08:00` lands on the 20th, not the 19th in UTC.
pub fn local_date(field: &str, value: &Value) -> Result<NaiveDate, TransformError> {
    // ---
    let s = value
        .as_str()
        .ok_or_else(|| coerce_err(field, value, "date"))?;
    if let Some(dt) = parse_offset_datetime(s) {
        return Ok(dt.date_naive());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d").map_err(|_| coerce_err(field, value, "date"))
}
