//! Declarative JSON-to-relational transformation layer.
//!
//! Each [`Family`] is a pure function of `(date, raw records)` producing
//! [`UpsertBatch`]es: rows for one target [`Table`] together with that table's
//! conflict key and update column list. The [`engine`] loads those batches and
//! records the run in the metadata tracker.

use std::collections::HashMap;

use chrono::{NaiveDate, SecondsFormat};
use serde_json::{Map, Value};

use crate::error::TransformError;
use crate::models::payloads::Payload;
use crate::models::{
    Area, FourDayForecast, GeneralForecast, Measurement, NationalMeasurement, Parameter,
    RawRecord, Region, RegionalForecast, Station, TwoHourForecast,
};

pub mod coerce;
pub mod engine;
mod forecasts;
mod measurements;

pub use measurements::{remap_metric, METRIC_REMAP};

// --- Target tables ----------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Stations,
    Regions,
    Areas,
    WeatherMeasurements,
    NationalMeasurements,
    TwoHourForecasts,
    RegionalForecasts,
    GeneralForecasts,
    FourDayForecasts,
}

impl Table {
    // ---
    pub const ALL: [Table; 9] = [
        Table::Stations,
        Table::Regions,
        Table::Areas,
        Table::WeatherMeasurements,
        Table::NationalMeasurements,
        Table::TwoHourForecasts,
        Table::RegionalForecasts,
        Table::GeneralForecasts,
        Table::FourDayForecasts,
    ];

    pub fn name(&self) -> &'static str {
        // ---
        match self {
            Table::Stations => "stations",
            Table::Regions => "regions",
            Table::Areas => "areas",
            Table::WeatherMeasurements => "weather_measurements",
            Table::NationalMeasurements => "national_measurements",
            Table::TwoHourForecasts => "two_hour_forecasts",
            Table::RegionalForecasts => "twentyfour_hour_regional_forecasts",
            Table::GeneralForecasts => "twentyfour_hour_general_forecasts",
            Table::FourDayForecasts => "four_day_forecasts",
        }
    }

    /// All columns, in insert (bind) order.
    pub fn columns(&self) -> &'static [&'static str] {
        // ---
        match self {
            Table::Stations => &["station_id", "device_id", "name", "latitude", "longitude"],
            Table::Regions => &["region_id", "latitude", "longitude"],
            Table::Areas => &["name", "latitude", "longitude"],
            Table::WeatherMeasurements => &["timestamp", "station_id", "parameter", "value", "units"],
            Table::NationalMeasurements => &["timestamp", "parameter", "value", "units"],
            Table::TwoHourForecasts => &[
                "timestamp",
                "area",
                "forecast",
                "forecast_code",
                "valid_period_start",
                "valid_period_end",
            ],
            Table::RegionalForecasts => &[
                "timestamp",
                "region",
                "period_start",
                "period_end",
                "period_text",
                "forecast",
                "forecast_code",
            ],
            Table::GeneralForecasts => &[
                "timestamp",
                "period_start",
                "period_end",
                "temperature_low",
                "temperature_high",
                "humidity_low",
                "humidity_high",
                "wind_speed_low",
                "wind_speed_high",
                "wind_direction",
                "forecast",
                "forecast_code",
            ],
            Table::FourDayForecasts => &[
                "timestamp",
                "forecast_date",
                "day",
                "temperature_low",
                "temperature_high",
                "humidity_low",
                "humidity_high",
                "wind_speed_low",
                "wind_speed_high",
                "wind_direction",
                "forecast",
                "forecast_code",
                "summary",
            ],
        }
    }

    /// Unique key; `ON CONFLICT` target.
    pub fn key_columns(&self) -> &'static [&'static str] {
        // ---
        match self {
            Table::Stations => &["station_id"],
            Table::Regions => &["region_id"],
            Table::Areas => &["name"],
            Table::WeatherMeasurements => &["timestamp", "station_id", "parameter"],
            Table::NationalMeasurements => &["timestamp", "parameter"],
            Table::TwoHourForecasts => &["timestamp", "area"],
            Table::RegionalForecasts => &["timestamp", "region", "period_start"],
            Table::GeneralForecasts => &["timestamp", "period_start"],
            Table::FourDayForecasts => &["timestamp", "forecast_date"],
        }
    }

    /// Columns overwritten when the key already exists.
    pub fn update_columns(&self) -> Vec<&'static str> {
        // ---
        match self {
            Table::WeatherMeasurements | Table::NationalMeasurements => vec!["value"],
            _ => {
                let keys = self.key_columns();
                self.columns()
                    .iter()
                    .copied()
                    .filter(|c| !keys.contains(c))
                    .collect()
            }
        }
    }

    /// Fact tables are partitioned on `timestamp` when TimescaleDB is present.
    pub fn is_time_partitioned(&self) -> bool {
        !matches!(self, Table::Stations | Table::Regions | Table::Areas)
    }
}

// --- Rows and batches -------------------------------------------------------

/// Rows that know their own conflict key.
pub trait Keyed {
    fn key(&self) -> String;
}

fn ts_key(ts: &chrono::DateTime<chrono::Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

impl Keyed for Station {
    fn key(&self) -> String {
        self.station_id.clone()
    }
}

impl Keyed for Region {
    fn key(&self) -> String {
        self.region_id.clone()
    }
}

impl Keyed for Area {
    fn key(&self) -> String {
        self.name.clone()
    }
}

impl Keyed for Measurement {
    fn key(&self) -> String {
        format!("{}|{}|{}", ts_key(&self.timestamp), self.station_id, self.parameter)
    }
}

impl Keyed for NationalMeasurement {
    fn key(&self) -> String {
        format!("{}|{}", ts_key(&self.timestamp), self.parameter)
    }
}

impl Keyed for TwoHourForecast {
    fn key(&self) -> String {
        format!("{}|{}", ts_key(&self.timestamp), self.area)
    }
}

impl Keyed for RegionalForecast {
    fn key(&self) -> String {
        format!(
            "{}|{}|{}",
            ts_key(&self.timestamp),
            self.region,
            ts_key(&self.period_start)
        )
    }
}

impl Keyed for GeneralForecast {
    fn key(&self) -> String {
        format!("{}|{}", ts_key(&self.timestamp), ts_key(&self.period_start))
    }
}

impl Keyed for FourDayForecast {
    fn key(&self) -> String {
        format!("{}|{}", ts_key(&self.timestamp), self.forecast_date)
    }
}

/// Keep one row per key, holding the value of the last occurrence at the
/// position of the first.
fn dedup_last<T: Keyed>(rows: Vec<T>) -> Vec<T> {
    // ---
    let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<T> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.key()) {
            Some(&i) => out[i] = row,
            None => {
                index.insert(row.key(), out.len());
                out.push(row);
            }
        }
    }
    out
}

/// Rows destined for one table; the table fixes the conflict key and update
/// columns.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertBatch {
    Stations(Vec<Station>),
    Regions(Vec<Region>),
    Areas(Vec<Area>),
    WeatherMeasurements(Vec<Measurement>),
    NationalMeasurements(Vec<NationalMeasurement>),
    TwoHourForecasts(Vec<TwoHourForecast>),
    RegionalForecasts(Vec<RegionalForecast>),
    GeneralForecasts(Vec<GeneralForecast>),
    FourDayForecasts(Vec<FourDayForecast>),
}

/// Evaluate `$body` with `$rows` bound to the batch's row vector.
macro_rules! with_rows {
    ($batch:expr, $rows:ident => $body:expr) => {
        match $batch {
            UpsertBatch::Stations($rows) => $body,
            UpsertBatch::Regions($rows) => $body,
            UpsertBatch::Areas($rows) => $body,
            UpsertBatch::WeatherMeasurements($rows) => $body,
            UpsertBatch::NationalMeasurements($rows) => $body,
            UpsertBatch::TwoHourForecasts($rows) => $body,
            UpsertBatch::RegionalForecasts($rows) => $body,
            UpsertBatch::GeneralForecasts($rows) => $body,
            UpsertBatch::FourDayForecasts($rows) => $body,
        }
    };
}

/// Like `with_rows!` but rebuilds the same variant from `$body`.
macro_rules! map_rows {
    ($batch:expr, $rows:ident => $body:expr) => {
        match $batch {
            UpsertBatch::Stations($rows) => UpsertBatch::Stations($body),
            UpsertBatch::Regions($rows) => UpsertBatch::Regions($body),
            UpsertBatch::Areas($rows) => UpsertBatch::Areas($body),
            UpsertBatch::WeatherMeasurements($rows) => UpsertBatch::WeatherMeasurements($body),
            UpsertBatch::NationalMeasurements($rows) => UpsertBatch::NationalMeasurements($body),
            UpsertBatch::TwoHourForecasts($rows) => UpsertBatch::TwoHourForecasts($body),
            UpsertBatch::RegionalForecasts($rows) => UpsertBatch::RegionalForecasts($body),
            UpsertBatch::GeneralForecasts($rows) => UpsertBatch::GeneralForecasts($body),
            UpsertBatch::FourDayForecasts($rows) => UpsertBatch::FourDayForecasts($body),
        }
    };
}

impl UpsertBatch {
    // ---
    pub fn table(&self) -> Table {
        // ---
        match self {
            UpsertBatch::Stations(_) => Table::Stations,
            UpsertBatch::Regions(_) => Table::Regions,
            UpsertBatch::Areas(_) => Table::Areas,
            UpsertBatch::WeatherMeasurements(_) => Table::WeatherMeasurements,
            UpsertBatch::NationalMeasurements(_) => Table::NationalMeasurements,
            UpsertBatch::TwoHourForecasts(_) => Table::TwoHourForecasts,
            UpsertBatch::RegionalForecasts(_) => Table::RegionalForecasts,
            UpsertBatch::GeneralForecasts(_) => Table::GeneralForecasts,
            UpsertBatch::FourDayForecasts(_) => Table::FourDayForecasts,
        }
    }

    pub fn len(&self) -> usize {
        with_rows!(self, rows => rows.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One row per conflict key, last occurrence wins.
    ///
    /// A single `INSERT ... ON CONFLICT DO UPDATE` may not touch the same key
    /// twice, so every batch goes through this before reaching the store.
    pub fn dedup(self) -> UpsertBatch {
        map_rows!(self, rows => dedup_last(rows))
    }

    /// Split into batches of at most `size` rows, preserving order.
    pub fn chunks(self, size: usize) -> Vec<UpsertBatch> {
        // ---
        let size = size.max(1);
        match self {
            UpsertBatch::Stations(rows) => split(rows, size, UpsertBatch::Stations),
            UpsertBatch::Regions(rows) => split(rows, size, UpsertBatch::Regions),
            UpsertBatch::Areas(rows) => split(rows, size, UpsertBatch::Areas),
            UpsertBatch::WeatherMeasurements(rows) => {
                split(rows, size, UpsertBatch::WeatherMeasurements)
            }
            UpsertBatch::NationalMeasurements(rows) => {
                split(rows, size, UpsertBatch::NationalMeasurements)
            }
            UpsertBatch::TwoHourForecasts(rows) => split(rows, size, UpsertBatch::TwoHourForecasts),
            UpsertBatch::RegionalForecasts(rows) => {
                split(rows, size, UpsertBatch::RegionalForecasts)
            }
            UpsertBatch::GeneralForecasts(rows) => split(rows, size, UpsertBatch::GeneralForecasts),
            UpsertBatch::FourDayForecasts(rows) => split(rows, size, UpsertBatch::FourDayForecasts),
        }
    }

    /// `(conflict key, column -> value)` pairs for stores that keep rows as
    /// JSON objects.
    pub fn keyed_json_rows(&self) -> Result<Vec<(String, Map<String, Value>)>, serde_json::Error> {
        // ---
        with_rows!(self, rows => rows
            .iter()
            .map(|row| match serde_json::to_value(row)? {
                Value::Object(map) => Ok((row.key(), map)),
                _ => Err(<serde_json::Error as serde::ser::Error>::custom(
                    "row did not serialize to an object",
                )),
            })
            .collect())
    }
}

fn split<T>(rows: Vec<T>, size: usize, wrap: fn(Vec<T>) -> UpsertBatch) -> Vec<UpsertBatch> {
    // ---
    let mut out = Vec::with_capacity(rows.len() / size + 1);
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        out.push(wrap(rows.by_ref().take(size).collect()));
    }
    out
}

/// Row accumulator shared by the family transforms.
#[derive(Debug, Default)]
pub(crate) struct Rows {
    pub stations: Vec<Station>,
    pub regions: Vec<Region>,
    pub areas: Vec<Area>,
    pub measurements: Vec<Measurement>,
    pub national: Vec<NationalMeasurement>,
    pub two_hour: Vec<TwoHourForecast>,
    pub regional: Vec<RegionalForecast>,
    pub general: Vec<GeneralForecast>,
    pub four_day: Vec<FourDayForecast>,
}

impl Rows {
    /// Non-empty batches, dimensions first, each deduplicated by key.
    fn into_batches(self) -> Vec<UpsertBatch> {
        // ---
        [
            UpsertBatch::Stations(self.stations),
            UpsertBatch::Regions(self.regions),
            UpsertBatch::Areas(self.areas),
            UpsertBatch::WeatherMeasurements(self.measurements),
            UpsertBatch::NationalMeasurements(self.national),
            UpsertBatch::TwoHourForecasts(self.two_hour),
            UpsertBatch::RegionalForecasts(self.regional),
            UpsertBatch::GeneralForecasts(self.general),
            UpsertBatch::FourDayForecasts(self.four_day),
        ]
        .into_iter()
        .filter(|b| !b.is_empty())
        .map(UpsertBatch::dedup)
        .collect()
    }
}

// --- Families ---------------------------------------------------------------

/// One transform rule per group of parameters sharing a payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    StationReadings,
    Pm25,
    Psi,
    UvIndex,
    TwoHourForecast,
    TwentyFourHourForecast,
    FourDayForecast,
}

/// Rows produced by one family for one date, plus what had to be rejected.
#[derive(Debug)]
pub struct FamilyOutput {
    pub family: Family,
    /// Raw records the family consumed.
    pub records: usize,
    pub batches: Vec<UpsertBatch>,
    /// Rejected rows and records; each was skipped, the rest still load.
    pub errors: Vec<TransformError>,
}

impl FamilyOutput {
    pub fn rejected(&self) -> usize {
        self.errors.len()
    }

    pub fn row_count(&self) -> usize {
        self.batches.iter().map(UpsertBatch::len).sum()
    }
}

impl Family {
    // ---
    pub const ALL: [Family; 7] = [
        Family::StationReadings,
        Family::Pm25,
        Family::Psi,
        Family::UvIndex,
        Family::TwoHourForecast,
        Family::TwentyFourHourForecast,
        Family::FourDayForecast,
    ];

    pub fn name(&self) -> &'static str {
        // ---
        match self {
            Family::StationReadings => "station_readings",
            Family::Pm25 => "pm25",
            Family::Psi => "psi",
            Family::UvIndex => "uv_index",
            Family::TwoHourForecast => "two_hour_forecast",
            Family::TwentyFourHourForecast => "twenty_four_hour_forecast",
            Family::FourDayForecast => "four_day_forecast",
        }
    }

    pub fn parameters(&self) -> &'static [Parameter] {
        // ---
        match self {
            Family::StationReadings => &[
                Parameter::Temperature,
                Parameter::Rainfall,
                Parameter::Humidity,
                Parameter::WindSpeed,
                Parameter::WindDirection,
            ],
            Family::Pm25 => &[Parameter::Pm25],
            Family::Psi => &[Parameter::Psi],
            Family::UvIndex => &[Parameter::UvIndex],
            Family::TwoHourForecast => &[Parameter::TwoHourForecast],
            Family::TwentyFourHourForecast => &[Parameter::TwentyFourHourForecast],
            Family::FourDayForecast => &[Parameter::FourDayForecast],
        }
    }

    /// Family transforming `parameter`; `None` for datasets kept raw only.
    pub fn of(parameter: Parameter) -> Option<Family> {
        // ---
        Family::ALL
            .into_iter()
            .find(|f| f.parameters().contains(&parameter))
    }

    /// The family's accepted parameter, if `parameter` names one.
    fn accepted(&self, parameter: &str) -> Option<Parameter> {
        // ---
        self.parameters()
            .iter()
            .copied()
            .find(|p| p.as_str() == parameter)
    }

    /// Transform the raw records of `date` into upsert batches.
    ///
    /// Records of other parameters or other dates are ignored. Records are
    /// processed in `ingestion_timestamp` order so the latest-ingested value
    /// wins when two records disagree about the same key.
    pub fn transform(&self, date: NaiveDate, records: &[RawRecord]) -> FamilyOutput {
        // ---
        let mut selected: Vec<(&RawRecord, Parameter)> = records
            .iter()
            .filter(|r| r.data_timestamp.date_naive() == date)
            .filter_map(|r| self.accepted(&r.parameter).map(|p| (r, p)))
            .collect();
        selected.sort_by_key(|(r, _)| r.ingestion_timestamp);

        let mut rows = Rows::default();
        let mut errors = Vec::new();

        for (record, parameter) in &selected {
            let payload = match Payload::parse(*parameter, &record.validated_data) {
                Ok(payload) => payload,
                Err(source) => {
                    errors.push(TransformError::Shape {
                        parameter: record.parameter.clone(),
                        date,
                        source,
                    });
                    continue;
                }
            };

            match payload {
                Payload::StationReadings(data) => {
                    measurements::station_readings(*parameter, &data, &mut rows, &mut errors)
                }
                Payload::Pm25(data) => measurements::pm25(&data, &mut rows, &mut errors),
                Payload::Psi(data) => measurements::psi(&data, &mut rows, &mut errors),
                Payload::UvIndex(data) => measurements::uv_index(&data, &mut rows, &mut errors),
                Payload::TwoHourForecast(data) => {
                    forecasts::two_hour(&data, &mut rows, &mut errors)
                }
                Payload::TwentyFourHourForecast(data) => {
                    forecasts::twenty_four_hour(date, &data, &mut rows, &mut errors)
                }
                Payload::FourDayForecast(data) => {
                    forecasts::four_day(&data, &mut rows, &mut errors)
                }
                Payload::Records(_) => {}
            }
        }

        FamilyOutput {
            family: *self,
            records: selected.len(),
            batches: rows.into_batches(),
            errors,
        }
    }
}
