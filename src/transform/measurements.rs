//! Observation families: station readings, PM2.5, PSI and UV index.

use crate::error::TransformError;
use crate::models::payloads::{Location, RegionalReadingData, StationReadingData, UvIndexData};
use crate::models::{Measurement, NationalMeasurement, Parameter, Region, Station};

use super::{coerce, Rows};

/// PSI metric names as stored in `weather_measurements.parameter`.
pub const METRIC_REMAP: [(&str, &str); 10] = [
    ("psi_twenty_four_hourly", "psi_24h"),
    ("pm25_twenty_four_hourly", "pm25_24h"),
    ("pm10_twenty_four_hourly", "pm10_24h"),
    ("o3_eight_hour_max", "o3_8h"),
    ("co_eight_hour_max", "co_8h"),
    ("co_sub_index", "co_subindex"),
    ("o3_sub_index", "o3_subindex"),
    ("pm10_sub_index", "pm10_subindex"),
    ("pm25_sub_index", "pm25_subindex"),
    ("so2_sub_index", "so2_subindex"),
];

const PM25_METRIC: &str = "pm25_one_hourly";
const PM25_UNITS: &str = "mcg/m3";
const INDEX_UNITS: &str = "index";

/// Mapped name for a PSI metric; unmapped names pass through unchanged.
pub fn remap_metric(metric: &str) -> &str {
    // ---
    METRIC_REMAP
        .iter()
        .find(|(from, _)| *from == metric)
        .map(|(_, to)| *to)
        .unwrap_or(metric)
}

fn coordinates(field: &str, location: &Location) -> Result<(f64, f64), TransformError> {
    // ---
    Ok((
        coerce::float(&format!("{field}.latitude"), &location.latitude)?,
        coerce::float(&format!("{field}.longitude"), &location.longitude)?,
    ))
}

/// Record `result` in `rows` via `push`, or keep the error.
fn keep<T>(result: Result<T, TransformError>, errors: &mut Vec<TransformError>, push: impl FnOnce(T)) {
    // ---
    match result {
        Ok(row) => push(row),
        Err(e) => errors.push(e),
    }
}

pub(super) fn station_readings(
    parameter: Parameter,
    data: &StationReadingData,
    rows: &mut Rows,
    errors: &mut Vec<TransformError>,
) {
    // ---
    for (i, meta) in data.stations.iter().enumerate() {
        let station = coordinates(&format!("stations[{i}].location"), &meta.location).map(
            |(latitude, longitude)| Station {
                station_id: meta.id.clone(),
                device_id: meta.device_id.clone(),
                name: meta.name.clone(),
                latitude,
                longitude,
            },
        );
        keep(station, errors, |s| rows.stations.push(s));
    }

    let name = parameter.as_str().replace('-', "_");
    for (i, reading) in data.readings.iter().enumerate() {
        let timestamp = match coerce::timestamp(&format!("readings[{i}].timestamp"), &reading.timestamp) {
            Ok(ts) => ts,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        for (j, item) in reading.data.iter().enumerate() {
            let measurement = coerce::float(&format!("readings[{i}].data[{j}].value"), &item.value)
                .map(|value| Measurement {
                    timestamp,
                    station_id: item.station_id.clone(),
                    parameter: name.clone(),
                    value,
                    units: data.reading_unit.clone(),
                });
            keep(measurement, errors, |m| rows.measurements.push(m));
        }
    }
}

fn regions(data: &RegionalReadingData, rows: &mut Rows, errors: &mut Vec<TransformError>) {
    // ---
    for (i, meta) in data.region_metadata.iter().enumerate() {
        let region = coordinates(&format!("regionMetadata[{i}].labelLocation"), &meta.location)
            .map(|(latitude, longitude)| Region {
                region_id: meta.name.clone(),
                latitude,
                longitude,
            });
        keep(region, errors, |r| rows.regions.push(r));
    }
}

/// Unnest `items[].readings[metric][region]` for the metrics `select` maps
/// to an output parameter name.
fn regional_readings<'a>(
    data: &'a RegionalReadingData,
    units: &str,
    select: impl Fn(&'a str) -> Option<&'a str>,
    rows: &mut Rows,
    errors: &mut Vec<TransformError>,
) {
    // ---
    for (i, item) in data.items.iter().enumerate() {
        let timestamp = match coerce::timestamp(&format!("items[{i}].timestamp"), &item.timestamp) {
            Ok(ts) => ts,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        for (metric, by_region) in &item.readings {
            let Some(parameter) = select(metric.as_str()) else {
                continue;
            };
            for (region, value) in by_region {
                let field = format!("items[{i}].readings.{metric}.{region}");
                let measurement = coerce::float(&field, value).map(|value| Measurement {
                    timestamp,
                    station_id: region.clone(),
                    parameter: parameter.to_string(),
                    value,
                    units: units.to_string(),
                });
                keep(measurement, errors, |m| rows.measurements.push(m));
            }
        }
    }
}

pub(super) fn pm25(data: &RegionalReadingData, rows: &mut Rows, errors: &mut Vec<TransformError>) {
    // ---
    regions(data, rows, errors);
    regional_readings(
        data,
        PM25_UNITS,
        |metric| (metric == PM25_METRIC).then_some("pm25"),
        rows,
        errors,
    );
}

pub(super) fn psi(data: &RegionalReadingData, rows: &mut Rows, errors: &mut Vec<TransformError>) {
    // ---
    regions(data, rows, errors);
    regional_readings(data, INDEX_UNITS, |metric| Some(remap_metric(metric)), rows, errors);
}

pub(super) fn uv_index(data: &UvIndexData, rows: &mut Rows, errors: &mut Vec<TransformError>) {
    // ---
    for (i, record) in data.records.iter().enumerate() {
        for (j, hour) in record.index.iter().enumerate() {
            let field = format!("records[{i}].index[{j}]");
            let row = coerce::timestamp(&format!("{field}.hour"), &hour.hour).and_then(|timestamp| {
                Ok(NationalMeasurement {
                    timestamp,
                    parameter: "uv_index".to_string(),
                    value: coerce::float(&format!("{field}.value"), &hour.value)?,
                    units: INDEX_UNITS.to_string(),
                })
            });
            keep(row, errors, |m| rows.national.push(m));
        }
    }
}
