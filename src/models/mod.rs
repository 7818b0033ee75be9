//! Data models for the weather pipeline.
//!
//! - [`Parameter`] / [`DataType`]: the closed set of upstream datasets.
//! - [`RawKey`], [`RawDocument`], [`RawRecord`]: the raw store's unit of storage.
//! - Dimension and fact rows written by the transformation engine.
//! - [`payloads`]: typed shapes of the upstream documents, used both to
//!   validate on ingest and to unnest on transform.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod payloads;

// ---

/// Weather datasets offered by the upstream API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Parameter {
    // ---
    Temperature,
    Rainfall,
    Humidity,
    WindSpeed,
    WindDirection,
    TwoHourForecast,
    TwentyFourHourForecast,
    FourDayForecast,
    Pm25,
    Psi,
    UvIndex,
    Wbgt,
    Lightning,
}

impl Parameter {
    // ---
    pub const ALL: [Parameter; 13] = [
        Parameter::Temperature,
        Parameter::Rainfall,
        Parameter::Humidity,
        Parameter::WindSpeed,
        Parameter::WindDirection,
        Parameter::TwoHourForecast,
        Parameter::TwentyFourHourForecast,
        Parameter::FourDayForecast,
        Parameter::Pm25,
        Parameter::Psi,
        Parameter::UvIndex,
        Parameter::Wbgt,
        Parameter::Lightning,
    ];

    /// Identifier stored in `raw_weather_data.parameter`.
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            Parameter::Temperature => "temperature",
            Parameter::Rainfall => "rainfall",
            Parameter::Humidity => "humidity",
            Parameter::WindSpeed => "wind-speed",
            Parameter::WindDirection => "wind-direction",
            Parameter::TwoHourForecast => "two-hour-forecast",
            Parameter::TwentyFourHourForecast => "twenty-four-hour-forecast",
            Parameter::FourDayForecast => "four-day-forecast",
            Parameter::Pm25 => "pm25",
            Parameter::Psi => "psi",
            Parameter::UvIndex => "uv-index",
            Parameter::Wbgt => "wbgt",
            Parameter::Lightning => "lightning",
        }
    }

    /// Path of the dataset below the API base URL.
    pub fn endpoint(&self) -> &'static str {
        // ---
        match self {
            Parameter::Temperature => "/air-temperature",
            Parameter::Rainfall => "/rainfall",
            Parameter::Humidity => "/relative-humidity",
            Parameter::WindSpeed => "/wind-speed",
            Parameter::WindDirection => "/wind-direction",
            Parameter::TwoHourForecast => "/two-hr-forecast",
            Parameter::TwentyFourHourForecast => "/twenty-four-hr-forecast",
            Parameter::FourDayForecast => "/four-day-outlook",
            Parameter::Pm25 => "/pm25",
            Parameter::Psi => "/psi",
            Parameter::UvIndex => "/uv",
            Parameter::Wbgt | Parameter::Lightning => "/weather",
        }
    }

    /// `api` query value of datasets served from the shared `/weather`
    /// endpoint.
    pub fn api_query(&self) -> Option<&'static str> {
        // ---
        match self {
            Parameter::Wbgt => Some("wbgt"),
            Parameter::Lightning => Some("lightning"),
            _ => None,
        }
    }

    pub fn data_type(&self) -> DataType {
        // ---
        match self {
            Parameter::TwoHourForecast
            | Parameter::TwentyFourHourForecast
            | Parameter::FourDayForecast => DataType::Forecast,
            _ => DataType::Reading,
        }
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Parameter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        Parameter::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Parameter::ALL.iter().map(|p| p.as_str()).collect();
                format!("unknown parameter `{}` (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Discriminator stored in `raw_weather_data.data_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DataType {
    Reading,
    Forecast,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            DataType::Reading => "reading",
            DataType::Forecast => "forecast",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---

/// Identity of one raw document: (date, data_type, parameter).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RawKey {
    // ---
    pub date: NaiveDate,
    pub data_type: DataType,
    pub parameter: Parameter,
}

impl RawKey {
    pub fn new(date: NaiveDate, parameter: Parameter) -> Self {
        // ---
        RawKey {
            date,
            data_type: parameter.data_type(),
            parameter,
        }
    }

    /// `data_timestamp` of the document: midnight UTC of its date.
    pub fn data_timestamp(&self) -> DateTime<Utc> {
        // ---
        Utc.from_utc_datetime(&self.date.and_time(chrono::NaiveTime::MIN))
    }
}

impl fmt::Display for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.date, self.data_type, self.parameter)
    }
}

/// Archive file a document was read from or written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    /// Hex SHA-256 of the file contents.
    pub hash: String,
}

/// A validated document waiting to be written to the raw store.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub key: RawKey,
    pub document: Value,
    /// Recorded in `weather_data_metadata` together with the document.
    pub source: Option<SourceFile>,
}

impl RawDocument {
    pub fn new(key: RawKey, document: Value) -> Self {
        // ---
        RawDocument {
            key,
            document,
            source: None,
        }
    }

    pub fn with_source(mut self, source: SourceFile) -> Self {
        self.source = Some(source);
        self
    }
}

/// A row of `raw_weather_data`.
///
/// `data_type` and `parameter` stay as text so that rows written by other
/// tools (or for datasets this crate does not transform) still load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RawRecord {
    // ---
    pub data_timestamp: DateTime<Utc>,
    pub data_type: String,
    pub parameter: String,
    pub validated_data: Value,
    pub ingestion_timestamp: DateTime<Utc>,
}

// --- Dimension rows ---------------------------------------------------------

/// Weather station, from station-reading payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Station {
    pub station_id: String,
    pub device_id: Option<String>,
    pub name: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

/// Monitoring region (west, east, ...), from PM2.5 and PSI payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Region {
    pub region_id: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Forecast area, from two-hour forecast payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Area {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

// --- Fact rows --------------------------------------------------------------

/// Station- or region-scoped observation in `weather_measurements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Measurement {
    pub timestamp: DateTime<Utc>,
    pub station_id: String,
    pub parameter: String,
    pub value: f64,
    pub units: String,
}

/// Island-wide observation in `national_measurements`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct NationalMeasurement {
    pub timestamp: DateTime<Utc>,
    pub parameter: String,
    pub value: f64,
    pub units: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TwoHourForecast {
    pub timestamp: DateTime<Utc>,
    pub area: String,
    pub forecast: String,
    pub forecast_code: Option<String>,
    pub valid_period_start: Option<DateTime<Utc>>,
    pub valid_period_end: Option<DateTime<Utc>>,
}

/// One region's outlook for one period of a 24-hour forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct RegionalForecast {
    pub timestamp: DateTime<Utc>,
    pub region: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub period_text: Option<String>,
    pub forecast: String,
    pub forecast_code: Option<String>,
}

/// Island-wide summary of a 24-hour forecast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct GeneralForecast {
    pub timestamp: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub temperature_low: Option<f64>,
    pub temperature_high: Option<f64>,
    pub humidity_low: Option<f64>,
    pub humidity_high: Option<f64>,
    pub wind_speed_low: Option<f64>,
    pub wind_speed_high: Option<f64>,
    pub wind_direction: Option<String>,
    pub forecast: String,
    pub forecast_code: Option<String>,
}

/// One day of a four-day outlook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FourDayForecast {
    pub timestamp: DateTime<Utc>,
    pub forecast_date: NaiveDate,
    pub day: Option<String>,
    pub temperature_low: Option<f64>,
    pub temperature_high: Option<f64>,
    pub humidity_low: Option<f64>,
    pub humidity_high: Option<f64>,
    pub wind_speed_low: Option<f64>,
    pub wind_speed_high: Option<f64>,
    pub wind_direction: Option<String>,
    pub forecast: String,
    pub forecast_code: Option<String>,
    pub summary: Option<String>,
}
