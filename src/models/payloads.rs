//! Typed shapes of the upstream `data` documents, one per parameter family.
//!
//! Field names follow the API's camelCase with snake_case aliases, so
//! documents re-serialized by other tools still parse. Leaf values that the
//! transforms coerce row by row (readings, timestamps, ranges) stay as raw
//! [`Value`]s here; a bad leaf must fail only its own row, not the document.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use super::Parameter;

// ---

#[derive(Debug, Clone, Deserialize)]
pub struct Location {
    pub latitude: Value,
    pub longitude: Value,
}

/// `forecast` is plain text in some datasets and `{code, text, summary}` in
/// others.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ForecastValue {
    Text(String),
    Coded {
        code: Option<String>,
        text: String,
        summary: Option<String>,
    },
}

impl ForecastValue {
    pub fn text(&self) -> &str {
        // ---
        match self {
            ForecastValue::Text(text) => text,
            ForecastValue::Coded { text, .. } => text,
        }
    }

    pub fn code(&self) -> Option<&str> {
        // ---
        match self {
            ForecastValue::Text(_) => None,
            ForecastValue::Coded { code, .. } => code.as_deref(),
        }
    }

    pub fn summary(&self) -> Option<&str> {
        // ---
        match self {
            ForecastValue::Text(_) => None,
            ForecastValue::Coded { summary, .. } => summary.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidPeriod {
    pub start: Value,
    pub end: Value,
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Range {
    pub low: Value,
    pub high: Value,
    pub unit: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Wind {
    pub speed: Option<Range>,
    pub direction: Option<String>,
}

// --- Station readings (temperature, rainfall, humidity, wind) --------------

#[derive(Debug, Clone, Deserialize)]
pub struct StationReadingData {
    pub stations: Vec<StationMeta>,
    pub readings: Vec<TimestampedReadings>,
    #[serde(rename = "readingType", alias = "reading_type")]
    pub reading_type: Option<String>,
    #[serde(rename = "readingUnit", alias = "reading_unit")]
    pub reading_unit: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationMeta {
    pub id: String,
    #[serde(rename = "deviceId", alias = "device_id")]
    pub device_id: Option<String>,
    pub name: Option<String>,
    #[serde(alias = "labelLocation", alias = "label_location")]
    pub location: Location,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TimestampedReadings {
    pub timestamp: Value,
    pub data: Vec<StationValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StationValue {
    #[serde(rename = "stationId", alias = "station_id")]
    pub station_id: String,
    pub value: Value,
}

// --- PM2.5 and PSI ---------------------------------------------------------

/// Shared by PM2.5 and PSI: per-timestamp items holding `metric -> region -> value`.
#[derive(Debug, Clone, Deserialize)]
pub struct RegionalReadingData {
    #[serde(default, rename = "regionMetadata", alias = "region_metadata")]
    pub region_metadata: Vec<RegionMeta>,
    pub items: Vec<RegionalItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionMeta {
    pub name: String,
    #[serde(rename = "labelLocation", alias = "label_location", alias = "location")]
    pub location: Location,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionalItem {
    pub timestamp: Value,
    pub readings: BTreeMap<String, BTreeMap<String, Value>>,
}

// --- UV index --------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct UvIndexData {
    pub records: Vec<UvRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UvRecord {
    pub timestamp: Option<Value>,
    pub index: Vec<UvHourValue>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UvHourValue {
    pub hour: Value,
    pub value: Value,
}

// --- Two-hour forecast -----------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TwoHourForecastData {
    #[serde(default, alias = "areaMetadata")]
    pub area_metadata: Vec<AreaMeta>,
    pub items: Vec<TwoHourItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaMeta {
    pub name: String,
    #[serde(rename = "label_location", alias = "labelLocation", alias = "location")]
    pub location: Location,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwoHourItem {
    pub timestamp: Value,
    #[serde(alias = "validPeriod")]
    pub valid_period: Option<ValidPeriod>,
    pub forecasts: Vec<AreaForecast>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AreaForecast {
    pub area: String,
    pub forecast: ForecastValue,
}

// --- 24-hour forecast ------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TwentyFourHourData {
    pub records: Vec<TwentyFourHourRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwentyFourHourRecord {
    pub timestamp: Value,
    pub general: GeneralOutlook,
    pub periods: Vec<OutlookPeriod>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralOutlook {
    pub temperature: Option<Range>,
    #[serde(rename = "relativeHumidity", alias = "relative_humidity")]
    pub relative_humidity: Option<Range>,
    pub forecast: ForecastValue,
    #[serde(rename = "validPeriod", alias = "valid_period")]
    pub valid_period: ValidPeriod,
    pub wind: Option<Wind>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutlookPeriod {
    #[serde(rename = "timePeriod", alias = "time_period")]
    pub time_period: ValidPeriod,
    /// Keyed by region name; must hold all five regions.
    pub regions: BTreeMap<String, ForecastValue>,
}

// --- Four-day forecast -----------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct FourDayData {
    pub records: Vec<FourDayRecord>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FourDayRecord {
    pub timestamp: Value,
    pub forecasts: Vec<DailyOutlook>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DailyOutlook {
    pub timestamp: Value,
    pub day: Option<String>,
    pub temperature: Option<Range>,
    #[serde(rename = "relativeHumidity", alias = "relative_humidity")]
    pub relative_humidity: Option<Range>,
    pub wind: Option<Wind>,
    pub forecast: ForecastValue,
}

// --- raw-only datasets -----------------------------------------------------

/// WBGT and lightning documents. They are archived and stored raw only, so
/// validation stops at the record list.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordsData {
    pub records: Vec<Value>,
}

// ---

/// A document parsed into the shape of its parameter family.
#[derive(Debug, Clone)]
pub enum Payload {
    StationReadings(StationReadingData),
    Pm25(RegionalReadingData),
    Psi(RegionalReadingData),
    UvIndex(UvIndexData),
    TwoHourForecast(TwoHourForecastData),
    TwentyFourHourForecast(TwentyFourHourData),
    FourDayForecast(FourDayData),
    Records(RecordsData),
}

impl Payload {
    /// Parse `document` as the payload of `parameter`.
    ///
    /// This is the schema check applied on ingest; the transforms reuse it to
    /// unnest stored documents.
    pub fn parse(parameter: Parameter, document: &Value) -> Result<Payload, serde_json::Error> {
        // ---
        use serde_json::from_value;

        let doc = document.clone();
        Ok(match parameter {
            Parameter::Temperature
            | Parameter::Rainfall
            | Parameter::Humidity
            | Parameter::WindSpeed
            | Parameter::WindDirection => Payload::StationReadings(from_value(doc)?),
            Parameter::Pm25 => Payload::Pm25(from_value(doc)?),
            Parameter::Psi => Payload::Psi(from_value(doc)?),
            Parameter::UvIndex => Payload::UvIndex(from_value(doc)?),
            Parameter::TwoHourForecast => Payload::TwoHourForecast(from_value(doc)?),
            Parameter::TwentyFourHourForecast => Payload::TwentyFourHourForecast(from_value(doc)?),
            Parameter::FourDayForecast => Payload::FourDayForecast(from_value(doc)?),
            Parameter::Wbgt | Parameter::Lightning => Payload::Records(from_value(doc)?),
        })
    }
}
