//! Forecast families: two-hour area forecasts, 24-hour outlooks (general and
//! regional), and four-day outlooks.

use chrono::{DateTime, NaiveDate, Utc};

use crate::error::TransformError;
use crate::models::payloads::{
    DailyOutlook, GeneralOutlook, Range, TwentyFourHourData, TwentyFourHourRecord,
    TwoHourForecastData, FourDayData, ValidPeriod, Wind,
};
use crate::models::{
    Area, FourDayForecast, GeneralForecast, RegionalForecast, TwoHourForecast,
};

use super::{coerce, Rows};

/// Regions every 24-hour outlook period must describe.
pub const OUTLOOK_REGIONS: [&str; 5] = ["west", "east", "north", "south", "central"];

type Bounds = (Option<f64>, Option<f64>);

fn range(field: &str, range: Option<&Range>) -> Result<Bounds, TransformError> {
    // ---
    match range {
        None => Ok((None, None)),
        Some(r) => Ok((
            coerce::optional_float(&format!("{field}.low"), Some(&r.low))?,
            coerce::optional_float(&format!("{field}.high"), Some(&r.high))?,
        )),
    }
}

fn wind(field: &str, wind: Option<&Wind>) -> Result<(Bounds, Option<String>), TransformError> {
    // ---
    match wind {
        None => Ok(((None, None), None)),
        Some(w) => Ok((
            range(&format!("{field}.speed"), w.speed.as_ref())?,
            w.direction.clone(),
        )),
    }
}

fn period(field: &str, p: &ValidPeriod) -> Result<(DateTime<Utc>, DateTime<Utc>), TransformError> {
    // ---
    Ok((
        coerce::timestamp(&format!("{field}.start"), &p.start)?,
        coerce::timestamp(&format!("{field}.end"), &p.end)?,
    ))
}

pub(super) fn two_hour(data: &TwoHourForecastData, rows: &mut Rows, errors: &mut Vec<TransformError>) {
    // ---
    for (i, meta) in data.area_metadata.iter().enumerate() {
        let field = format!("area_metadata[{i}].label_location");
        let area = coerce::float(&format!("{field}.latitude"), &meta.location.latitude).and_then(
            |latitude| {
                Ok(Area {
                    name: meta.name.clone(),
                    latitude,
                    longitude: coerce::float(&format!("{field}.longitude"), &meta.location.longitude)?,
                })
            },
        );
        match area {
            Ok(a) => rows.areas.push(a),
            Err(e) => errors.push(e),
        }
    }

    for (i, item) in data.items.iter().enumerate() {
        let header = coerce::timestamp(&format!("items[{i}].timestamp"), &item.timestamp).and_then(
            |timestamp| {
                let bounds = match &item.valid_period {
                    Some(p) => {
                        let (start, end) = period(&format!("items[{i}].valid_period"), p)?;
                        (Some(start), Some(end))
                    }
                    None => (None, None),
                };
                Ok((timestamp, bounds))
            },
        );
        let (timestamp, (valid_period_start, valid_period_end)) = match header {
            Ok(h) => h,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        for f in &item.forecasts {
            rows.two_hour.push(TwoHourForecast {
                timestamp,
                area: f.area.clone(),
                forecast: f.forecast.text().to_string(),
                forecast_code: f.forecast.code().map(str::to_string),
                valid_period_start,
                valid_period_end,
            });
        }
    }
}

fn general_row(
    field: &str,
    timestamp: DateTime<Utc>,
    general: &GeneralOutlook,
) -> Result<GeneralForecast, TransformError> {
    // ---
    let (period_start, period_end) = period(&format!("{field}.valid_period"), &general.valid_period)?;
    let (temperature_low, temperature_high) =
        range(&format!("{field}.temperature"), general.temperature.as_ref())?;
    let (humidity_low, humidity_high) = range(
        &format!("{field}.relative_humidity"),
        general.relative_humidity.as_ref(),
    )?;
    let ((wind_speed_low, wind_speed_high), wind_direction) =
        wind(&format!("{field}.wind"), general.wind.as_ref())?;

    Ok(GeneralForecast {
        timestamp,
        period_start,
        period_end,
        temperature_low,
        temperature_high,
        humidity_low,
        humidity_high,
        wind_speed_low,
        wind_speed_high,
        wind_direction,
        forecast: general.forecast.text().to_string(),
        forecast_code: general.forecast.code().map(str::to_string),
    })
}

/// Expand one 24-hour record; `Err` rejects the record as a whole.
///
/// Every period must carry all five regions and a parseable time period,
/// otherwise no regional or general row of the record is kept.
fn twenty_four_hour_record(
    date: NaiveDate,
    i: usize,
    record: &TwentyFourHourRecord,
    rows: &mut Rows,
    errors: &mut Vec<TransformError>,
) -> Result<(), TransformError> {
    // ---
    let timestamp = coerce::timestamp(&format!("records[{i}].timestamp"), &record.timestamp)?;

    let mut regional = Vec::with_capacity(record.periods.len() * OUTLOOK_REGIONS.len());
    for (j, p) in record.periods.iter().enumerate() {
        let missing: Vec<&str> = OUTLOOK_REGIONS
            .iter()
            .copied()
            .filter(|r| !p.regions.contains_key(*r))
            .collect();
        if !missing.is_empty() {
            return Err(TransformError::Record {
                parameter: "twenty-four-hour-forecast".to_string(),
                date,
                message: format!(
                    "records[{i}].periods[{j}] is missing regions: {}",
                    missing.join(", ")
                ),
            });
        }

        let field = format!("records[{i}].periods[{j}].time_period");
        let (period_start, period_end) = period(&field, &p.time_period)?;
        for region in OUTLOOK_REGIONS {
            let forecast = &p.regions[region];
            regional.push(RegionalForecast {
                timestamp,
                region: region.to_string(),
                period_start,
                period_end,
                period_text: p.time_period.text.clone(),
                forecast: forecast.text().to_string(),
                forecast_code: forecast.code().map(str::to_string),
            });
        }
    }

    match general_row(&format!("records[{i}].general"), timestamp, &record.general) {
        Ok(row) => rows.general.push(row),
        Err(e) => errors.push(e),
    }
    rows.regional.extend(regional);
    Ok(())
}

pub(super) fn twenty_four_hour(
    date: NaiveDate,
    data: &TwentyFourHourData,
    rows: &mut Rows,
    errors: &mut Vec<TransformError>,
) {
    // ---
    for (i, record) in data.records.iter().enumerate() {
        if let Err(e) = twenty_four_hour_record(date, i, record, rows, errors) {
            errors.push(e);
        }
    }
}

fn four_day_row(
    field: &str,
    timestamp: DateTime<Utc>,
    outlook: &DailyOutlook,
) -> Result<FourDayForecast, TransformError> {
    // ---
    let forecast_date = coerce::local_date(&format!("{field}.timestamp"), &outlook.timestamp)?;
    let (temperature_low, temperature_high) =
        range(&format!("{field}.temperature"), outlook.temperature.as_ref())?;
    let (humidity_low, humidity_high) = range(
        &format!("{field}.relative_humidity"),
        outlook.relative_humidity.as_ref(),
    )?;
    let ((wind_speed_low, wind_speed_high), wind_direction) =
        wind(&format!("{field}.wind"), outlook.wind.as_ref())?;

    Ok(FourDayForecast {
        timestamp,
        forecast_date,
        day: outlook.day.clone(),
        temperature_low,
        temperature_high,
        humidity_low,
        humidity_high,
        wind_speed_low,
        wind_speed_high,
        wind_direction,
        forecast: outlook.forecast.text().to_string(),
        forecast_code: outlook.forecast.code().map(str::to_string),
        summary: outlook.forecast.summary().map(str::to_string),
    })
}

pub(super) fn four_day(data: &FourDayData, rows: &mut Rows, errors: &mut Vec<TransformError>) {
    // ---
    for (i, record) in data.records.iter().enumerate() {
        let timestamp = match coerce::timestamp(&format!("records[{i}].timestamp"), &record.timestamp) {
            Ok(ts) => ts,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        for (j, outlook) in record.forecasts.iter().enumerate() {
            match four_day_row(&format!("records[{i}].forecasts[{j}]"), timestamp, outlook) {
                Ok(row) => rows.four_day.push(row),
                Err(e) => errors.push(e),
            }
        }
    }
}
