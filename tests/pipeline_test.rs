//! End-to-end pipeline behavior against the in-process store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::{json, Value};

use weatherflow::models::{
    FourDayForecast, Measurement, NationalMeasurement, RegionalForecast, TwoHourForecast,
};
use weatherflow::{
    Archive, DateStatus, Engine, FetchError, Governor, Ingestor, MemoryStore, MetadataTracker,
    Parameter, RawDocument, RawKey, RunStatus, Table, UnitState, WeatherApi, WeatherStore,
};

/// Serves canned documents; parameters without one fail with an API error.
#[derive(Default)]
struct CannedApi {
    docs: Mutex<HashMap<Parameter, Value>>,
    calls: Mutex<usize>,
}

impl CannedApi {
    fn with(docs: &[(Parameter, Value)]) -> Arc<Self> {
        // ---
        let api = CannedApi::default();
        for (parameter, doc) in docs {
            api.set(*parameter, doc.clone());
        }
        Arc::new(api)
    }

    fn set(&self, parameter: Parameter, doc: Value) {
        self.docs.lock().unwrap().insert(parameter, doc);
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl WeatherApi for CannedApi {
    async fn fetch(&self, parameter: Parameter, date: NaiveDate) -> Result<Value, FetchError> {
        // ---
        *self.calls.lock().unwrap() += 1;
        self.docs
            .lock()
            .unwrap()
            .get(&parameter)
            .cloned()
            .ok_or_else(|| FetchError::Api {
                url: format!("stub{}?date={}", parameter.endpoint(), date),
                code: 500,
                message: "upstream unavailable".into(),
            })
    }
}

fn day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn governor() -> Governor {
    Governor::new(4, 5, 500, 2)
}

fn pm25_doc(north: &str) -> Value {
    json!({"items": [{"timestamp": "2024-01-01T00:00:00Z",
        "readings": {"pm25_one_hourly": {"north": north, "south": "8.0"}}}]})
}

fn psi_doc() -> Value {
    // ---
    json!({
        "regionMetadata": [
            {"name": "west", "labelLocation": {"latitude": 1.35735, "longitude": 103.7}},
            {"name": "east", "labelLocation": {"latitude": 1.35735, "longitude": 103.94}}
        ],
        "items": [{"timestamp": "2024-01-01T08:00:00+08:00",
            "readings": {
                "psi_twenty_four_hourly": {"west": 45, "east": 50},
                "co_sub_index": {"west": 4, "east": 5}
            }}]
    })
}

fn region_block(text: &str) -> Value {
    json!({"code": "PC", "text": text})
}

fn twenty_four_hour_doc() -> Value {
    // ---
    json!({"records": [{
        "timestamp": "2024-01-01T05:30:00+08:00",
        "general": {
            "temperature": {"low": 24, "high": 31},
            "relativeHumidity": {"low": 65, "high": 95},
            "forecast": {"code": "TL", "text": "Thundery Showers"},
            "validPeriod": {"start": "2024-01-01T06:00:00+08:00",
                            "end": "2024-01-02T06:00:00+08:00"},
            "wind": {"speed": {"low": 10, "high": 20}, "direction": "NE"}
        },
        "periods": [{
            "timePeriod": {"start": "2024-01-01T06:00:00+08:00",
                           "end": "2024-01-01T12:00:00+08:00",
                           "text": "6 am to Midday 1 Jan"},
            "regions": {
                "west": region_block("Cloudy"),
                "east": region_block("Cloudy"),
                "north": region_block("Showers"),
                "south": region_block("Cloudy"),
                "central": region_block("Thundery Showers")
            }
        }]
    }]})
}

async fn seed(store: &MemoryStore, parameter: Parameter, doc: Value) {
    // ---
    store
        .upsert_raw(&[RawDocument::new(RawKey::new(day(), parameter), doc)])
        .await
        .unwrap();
}

fn engine(store: Arc<MemoryStore>) -> Engine {
    Engine::new(store, governor())
}

// --- ingest ----------------------------------------------------------------

#[tokio::test]
async fn ingest_stores_units_and_skips_them_next_time() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let api = CannedApi::with(&[(Parameter::Pm25, pm25_doc("12.5")), (Parameter::Psi, psi_doc())]);
    let ingestor = Ingestor::new(api.clone(), store.clone(), governor());
    let end = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();
    let params = [Parameter::Pm25, Parameter::Psi];

    let first = ingestor.ingest(day(), end, &params, false).await;
    assert!(first.is_complete(), "{:?}", first.failed);
    assert_eq!(first.stored, 6);
    assert_eq!(store.raw_records().len(), 6);

    let states = store.unit_states(day(), end).await.unwrap();
    assert_eq!(states.len(), 6);
    assert!(states.iter().all(|u| u.state == UnitState::Stored));

    let second = ingestor.ingest(day(), end, &params, false).await;
    assert_eq!(second.skipped, 6);
    assert_eq!(second.stored, 0);
    assert_eq!(api.calls(), 6);

    let forced = ingestor.ingest(day(), end, &params, true).await;
    assert_eq!(forced.stored, 6);
    assert_eq!(api.calls(), 12);
    assert_eq!(store.raw_records().len(), 6);
}

#[tokio::test]
async fn failed_fetch_is_recorded_and_retried() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let api = CannedApi::with(&[(Parameter::Pm25, pm25_doc("12.5"))]);
    let ingestor = Ingestor::new(api.clone(), store.clone(), governor());
    let params = [Parameter::Pm25, Parameter::UvIndex];

    let report = ingestor.ingest(day(), day(), &params, false).await;
    assert_eq!(report.stored, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, RawKey::new(day(), Parameter::UvIndex));

    let uv = store.unit_state(day(), Parameter::UvIndex).await.unwrap().unwrap();
    assert_eq!(uv.state, UnitState::Failed);
    assert_eq!(uv.attempts, 1);
    assert!(uv.last_error.unwrap().contains("upstream unavailable"));

    api.set(
        Parameter::UvIndex,
        json!({"records": [{"index": [{"hour": "2024-01-01T07:00:00+08:00", "value": 0}]}]}),
    );
    let retry = ingestor.ingest(day(), day(), &params, false).await;
    assert_eq!(retry.skipped, 1);
    assert_eq!(retry.stored, 1);

    let uv = store.unit_state(day(), Parameter::UvIndex).await.unwrap().unwrap();
    assert_eq!(uv.state, UnitState::Stored);
    assert_eq!(uv.attempts, 2);
}

#[tokio::test]
async fn invalid_document_is_never_stored() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let api = CannedApi::with(&[(Parameter::Psi, json!({"regionMetadata": []}))]);
    let ingestor = Ingestor::new(api, store.clone(), governor());

    let report = ingestor.ingest(day(), day(), &[Parameter::Psi], false).await;
    assert_eq!(report.failed.len(), 1);
    assert!(store.raw_records().is_empty());

    let psi = store.unit_state(day(), Parameter::Psi).await.unwrap().unwrap();
    assert_eq!(psi.state, UnitState::Failed);
}

#[tokio::test]
async fn raw_write_failure_fails_the_unit() {
    // ---
    let store = Arc::new(MemoryStore::new());
    store.fail_raw_writes();
    let api = CannedApi::with(&[(Parameter::Pm25, pm25_doc("12.5"))]);
    let ingestor = Ingestor::new(api, store.clone(), governor());

    let report = ingestor.ingest(day(), day(), &[Parameter::Pm25], false).await;
    assert!(!report.is_complete());

    let unit = store.unit_state(day(), Parameter::Pm25).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::Failed);
}

// --- transform -------------------------------------------------------------

#[tokio::test]
async fn pm25_document_yields_one_row_per_region() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::Pm25, pm25_doc("12.5")).await;

    let outcome = engine(store.clone()).transform_date(day(), false).await.unwrap();
    assert_eq!(outcome.status, DateStatus::Succeeded);

    let rows: Vec<Measurement> = store.rows(Table::WeatherMeasurements).unwrap();
    assert_eq!(rows.len(), 2);
    let north = rows.iter().find(|r| r.station_id == "north").unwrap();
    assert_eq!(north.parameter, "pm25");
    assert_eq!(north.value, 12.5);
    assert_eq!(north.units, "mcg/m3");
    assert_eq!(north.timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
}

#[tokio::test]
async fn forced_rerun_updates_values_without_duplicates() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::Pm25, pm25_doc("12.5")).await;
    let engine = engine(store.clone());

    engine.transform_date(day(), false).await.unwrap();
    seed(&store, Parameter::Pm25, pm25_doc("14.0")).await;
    let rerun = engine.transform_date(day(), true).await.unwrap();
    assert_eq!(rerun.status, DateStatus::Succeeded);

    let rows: Vec<Measurement> = store.rows(Table::WeatherMeasurements).unwrap();
    assert_eq!(rows.len(), 2);
    let north = rows.iter().find(|r| r.station_id == "north").unwrap();
    assert_eq!(north.value, 14.0);
}

#[tokio::test]
async fn succeeded_date_is_skipped_without_writes() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::Pm25, pm25_doc("12.5")).await;
    let engine = engine(store.clone());

    engine.transform_date(day(), false).await.unwrap();
    let writes = store.row_writes();

    let again = engine.transform_date(day(), false).await.unwrap();
    assert_eq!(again.status, DateStatus::AlreadySucceeded);
    assert!(again.is_success());
    assert_eq!(store.row_writes(), writes);
}

#[tokio::test]
async fn psi_metrics_are_renamed() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::Psi, psi_doc()).await;

    engine(store.clone()).transform_date(day(), false).await.unwrap();

    let rows: Vec<Measurement> = store.rows(Table::WeatherMeasurements).unwrap();
    let mut names: Vec<_> = rows.iter().map(|r| r.parameter.as_str()).collect();
    names.sort();
    names.dedup();
    assert_eq!(names, vec!["co_subindex", "psi_24h"]);
    assert!(rows.iter().all(|r| r.units == "index"));
    assert_eq!(store.row_count(Table::Regions), 2);
}

#[tokio::test]
async fn twenty_four_hour_forecast_fans_out() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::TwentyFourHourForecast, twenty_four_hour_doc()).await;

    engine(store.clone()).transform_date(day(), false).await.unwrap();

    let regional: Vec<RegionalForecast> =
        store.rows(Table::RegionalForecasts).unwrap();
    assert_eq!(regional.len(), 5);
    assert_eq!(store.row_count(Table::GeneralForecasts), 1);

    let central = regional.iter().find(|r| r.region == "central").unwrap();
    assert_eq!(central.forecast, "Thundery Showers");
    assert_eq!(central.forecast_code.as_deref(), Some("PC"));
}

#[tokio::test]
async fn failing_family_does_not_block_its_siblings() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::Pm25, pm25_doc("12.5")).await;
    seed(&store, Parameter::TwentyFourHourForecast, twenty_four_hour_doc()).await;
    store.fail_writes_to(Table::WeatherMeasurements);
    let engine = engine(store.clone());

    let outcome = engine.transform_date(day(), false).await.unwrap();
    assert_eq!(outcome.status, DateStatus::Failed);
    assert_eq!(store.row_count(Table::RegionalForecasts), 5);
    assert_eq!(store.row_count(Table::WeatherMeasurements), 0);

    let runs = store.runs(day(), day()).await.unwrap();
    assert_eq!(runs[0].status, RunStatus::Failed);

    store.clear_failures();
    let retry = engine.transform_date(day(), false).await.unwrap();
    assert_eq!(retry.status, DateStatus::Succeeded);
    assert_eq!(store.row_count(Table::WeatherMeasurements), 2);
}

#[tokio::test]
async fn ingest_then_transform_range() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let api = CannedApi::with(&[(Parameter::Pm25, pm25_doc("12.5"))]);
    let end = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

    let report = Ingestor::new(api, store.clone(), governor())
        .ingest(day(), end, &[Parameter::Pm25], false)
        .await;
    assert_eq!(report.stored, 2);

    let summary = engine(store.clone()).transform_range(day(), end, false).await;
    assert!(summary.all_succeeded());
    assert_eq!(summary.count(DateStatus::Succeeded), 2);
    assert_eq!(summary.outcomes[0].date, day());
    assert_eq!(summary.table_count(Table::WeatherMeasurements), Some(2));
    assert_eq!(summary.table_count(Table::TwoHourForecasts), Some(0));

    // Both dates carry the same document, so the rows collapse onto one key set.
    assert_eq!(store.row_count(Table::WeatherMeasurements), 2);

    let runs = store.runs(day(), end).await.unwrap();
    assert_eq!(runs.len(), 2);
    assert!(runs.iter().all(|r| r.status == RunStatus::Succeeded));
}

#[tokio::test]
async fn tracker_failure_fails_only_its_unit() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let api = CannedApi::with(&[(Parameter::Pm25, pm25_doc("12.5")), (Parameter::Psi, psi_doc())]);
    let ingestor = Ingestor::new(api, store.clone(), governor());
    let params = [Parameter::Pm25, Parameter::Psi];

    // the final `stored` write of one unit fails after its raw write
    store.fail_unit_writes(day(), Parameter::Pm25, UnitState::Stored);
    let report = ingestor.ingest(day(), day(), &params, false).await;
    assert_eq!(report.stored, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, RawKey::new(day(), Parameter::Pm25));

    let psi = store.unit_state(day(), Parameter::Psi).await.unwrap().unwrap();
    assert_eq!(psi.state, UnitState::Stored);
    let pm25 = store.unit_state(day(), Parameter::Pm25).await.unwrap().unwrap();
    assert_eq!(pm25.state, UnitState::Validated);

    // a unit that cannot even be started fails alone too
    store.clear_failures();
    store.fail_unit_writes(day(), Parameter::Psi, UnitState::NotFetched);
    let report = ingestor.ingest(day(), day(), &params, true).await;
    assert_eq!(report.stored, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, RawKey::new(day(), Parameter::Psi));
    let pm25 = store.unit_state(day(), Parameter::Pm25).await.unwrap().unwrap();
    assert_eq!(pm25.state, UnitState::Stored);
}

#[tokio::test]
async fn raw_only_datasets_are_stored_but_not_transformed() {
    // ---
    let store = Arc::new(MemoryStore::new());
    let records = json!({"records": [{"datetime": "2024-01-01T08:00:00+08:00", "item": {}}]});
    let api = CannedApi::with(&[
        (Parameter::Wbgt, records.clone()),
        (Parameter::Lightning, records),
    ]);
    let ingestor = Ingestor::new(api, store.clone(), governor());

    let report = ingestor
        .ingest(day(), day(), &[Parameter::Wbgt, Parameter::Lightning], false)
        .await;
    assert!(report.is_complete(), "{:?}", report.failed);
    assert_eq!(store.raw_records().len(), 2);

    let outcome = engine(store.clone()).transform_date(day(), false).await.unwrap();
    assert_eq!(outcome.status, DateStatus::Succeeded);
    assert!(outcome.families.is_empty());
    assert_eq!(store.row_writes(), 0);
}

// --- archive ---------------------------------------------------------------

fn scratch_dir(name: &str) -> std::path::PathBuf {
    // ---
    let dir = std::env::temp_dir().join(format!("weatherflow-{}-{}", name, uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[tokio::test]
async fn archived_documents_load_once_until_changed() {
    // ---
    let root = scratch_dir("load");
    let archive = Archive::new(&root);
    let api = CannedApi::with(&[(Parameter::Pm25, pm25_doc("12.5"))]);
    let fetched = Arc::new(MemoryStore::new());
    Ingestor::new(api, fetched.clone(), governor())
        .with_archive(archive.clone())
        .ingest(day(), day(), &[Parameter::Pm25], false)
        .await;
    let path = archive.path_of(RawKey::new(day(), Parameter::Pm25));
    assert!(path.exists());

    // the ingesting store already knows the file
    let idle = CannedApi::with(&[]);
    let reload = Ingestor::new(idle.clone(), fetched.clone(), governor())
        .load(&archive, day(), day(), &[Parameter::Pm25], false)
        .await
        .unwrap();
    assert_eq!((reload.stored, reload.skipped), (0, 1));

    // a fresh store loads it, then skips it
    let store = Arc::new(MemoryStore::new());
    let loader = Ingestor::new(idle.clone(), store.clone(), governor());
    let first = loader.load(&archive, day(), day(), &Parameter::ALL, false).await.unwrap();
    assert_eq!((first.stored, first.skipped), (1, 0));
    assert_eq!(store.raw_records().len(), 1);
    let unit = store.unit_state(day(), Parameter::Pm25).await.unwrap().unwrap();
    assert_eq!(unit.state, UnitState::Stored);

    let unchanged = loader.load(&archive, day(), day(), &Parameter::ALL, false).await.unwrap();
    assert_eq!((unchanged.stored, unchanged.skipped), (0, 1));

    std::fs::write(&path, serde_json::to_vec(&pm25_doc("20.0")).unwrap()).unwrap();
    let changed = loader.load(&archive, day(), day(), &Parameter::ALL, false).await.unwrap();
    assert_eq!(changed.stored, 1);
    assert_eq!(
        store.raw_records()[0].validated_data["items"][0]["readings"]["pm25_one_hourly"]["north"],
        "20.0"
    );

    let forced = loader.load(&archive, day(), day(), &Parameter::ALL, true).await.unwrap();
    assert_eq!(forced.stored, 1);
    assert_eq!(idle.calls(), 0);

    std::fs::remove_dir_all(root).unwrap();
}

#[tokio::test]
async fn unreadable_archive_file_fails_its_unit() {
    // ---
    let root = scratch_dir("bad-file");
    let archive = Archive::new(&root);
    let good = archive.path_of(RawKey::new(day(), Parameter::Psi));
    let bad = archive.path_of(RawKey::new(day(), Parameter::Pm25));
    for path in [&good, &bad] {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    }
    std::fs::write(&good, serde_json::to_vec(&psi_doc()).unwrap()).unwrap();
    std::fs::write(&bad, b"{\"items\": [").unwrap();

    let store = Arc::new(MemoryStore::new());
    let report = Ingestor::new(CannedApi::with(&[]), store.clone(), governor())
        .load(&archive, day(), day(), &[Parameter::Pm25, Parameter::Psi], false)
        .await
        .unwrap();
    assert_eq!(report.stored, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, RawKey::new(day(), Parameter::Pm25));

    let pm25 = store.unit_state(day(), Parameter::Pm25).await.unwrap().unwrap();
    assert_eq!(pm25.state, UnitState::Failed);
    assert!(pm25.last_error.unwrap().contains("not valid JSON"));

    std::fs::remove_dir_all(root).unwrap();
}

// --- transform, continued --------------------------------------------------

fn pm25_doc_with_regions() -> Value {
    // ---
    json!({
        "regionMetadata": [
            {"name": "west", "labelLocation": {"latitude": 1.35735, "longitude": 103.7}},
            {"name": "east", "labelLocation": {"latitude": 1.35735, "longitude": 103.94}}
        ],
        "items": [{"timestamp": "2024-01-01T08:00:00+08:00",
            "readings": {"pm25_one_hourly": {"west": 9, "east": 11}}}]
    })
}

fn four_day_doc(forecast: &str) -> Value {
    // ---
    let outlook = |ts: &str, name: &str| {
        json!({
            "timestamp": ts,
            "day": name,
            "temperature": {"low": 25, "high": 33},
            "relativeHumidity": {"low": 60, "high": 95},
            "wind": {"speed": {"low": 10, "high": 20}, "direction": "NE"},
            "forecast": {"code": "TL", "text": forecast, "summary": forecast}
        })
    };
    json!({"records": [{
        "timestamp": "2024-01-01T05:30:00+08:00",
        "forecasts": [
            outlook("2024-01-02T00:00:00+08:00", "Tuesday"),
            outlook("2024-01-03T00:00:00+08:00", "Wednesday"),
            outlook("2024-01-04T00:00:00+08:00", "Thursday"),
            outlook("2024-01-05T00:00:00+08:00", "Friday")
        ]
    }]})
}

fn two_hour_doc(forecast: &str) -> Value {
    // ---
    json!({
        "area_metadata": [
            {"name": "Bedok", "label_location": {"latitude": 1.321, "longitude": 103.924}},
            {"name": "Tuas", "label_location": {"latitude": 1.294, "longitude": 103.635}}
        ],
        "items": [{
            "timestamp": "2024-01-01T11:30:00+08:00",
            "valid_period": {"start": "2024-01-01T11:30:00+08:00",
                             "end": "2024-01-01T13:30:00+08:00"},
            "forecasts": [
                {"area": "Bedok", "forecast": forecast},
                {"area": "Tuas", "forecast": forecast}
            ]
        }]
    })
}

#[tokio::test]
async fn abandoned_transform_run_does_not_block_the_date() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::Pm25, pm25_doc("12.5")).await;
    let engine = engine(store.clone());

    // a run that claimed the date and went away without completing
    let abandoned = MetadataTracker::new(store.clone())
        .begin(day(), &["pm25".to_string()], false)
        .await
        .unwrap()
        .unwrap();
    drop(abandoned);
    assert_eq!(store.runs(day(), day()).await.unwrap()[0].status, RunStatus::Running);

    let plain = engine.transform_date(day(), false).await.unwrap();
    assert_eq!(plain.status, DateStatus::Succeeded);

    let abandoned = MetadataTracker::new(store.clone())
        .begin(day(), &["pm25".to_string()], true)
        .await
        .unwrap()
        .unwrap();
    drop(abandoned);
    let forced = engine.transform_date(day(), true).await.unwrap();
    assert_eq!(forced.status, DateStatus::Succeeded);
    assert_eq!(store.row_count(Table::WeatherMeasurements), 2);
}

#[tokio::test]
async fn forecast_reruns_are_idempotent_and_overwrite_non_key_columns() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::FourDayForecast, four_day_doc("Thundery Showers")).await;
    seed(&store, Parameter::TwoHourForecast, two_hour_doc("Cloudy")).await;
    let engine = engine(store.clone());

    let first = engine.transform_date(day(), false).await.unwrap();
    assert_eq!(first.status, DateStatus::Succeeded);
    assert_eq!(store.row_count(Table::FourDayForecasts), 4);
    assert_eq!(store.row_count(Table::TwoHourForecasts), 2);
    assert_eq!(store.row_count(Table::Areas), 2);

    let same = engine.transform_date(day(), true).await.unwrap();
    assert_eq!(same.status, DateStatus::Succeeded);
    assert_eq!(store.row_count(Table::FourDayForecasts), 4);
    assert_eq!(store.row_count(Table::TwoHourForecasts), 2);

    seed(&store, Parameter::FourDayForecast, four_day_doc("Fair and Warm")).await;
    seed(&store, Parameter::TwoHourForecast, two_hour_doc("Light Rain")).await;
    engine.transform_date(day(), true).await.unwrap();

    let four_day: Vec<FourDayForecast> = store.rows(Table::FourDayForecasts).unwrap();
    assert_eq!(four_day.len(), 4);
    assert!(four_day.iter().all(|r| r.forecast == "Fair and Warm"));
    assert!(four_day.iter().all(|r| r.summary.as_deref() == Some("Fair and Warm")));
    let first = four_day.iter().map(|r| r.forecast_date).min();
    assert_eq!(first, NaiveDate::from_ymd_opt(2024, 1, 2));

    let two_hour: Vec<TwoHourForecast> = store.rows(Table::TwoHourForecasts).unwrap();
    assert_eq!(two_hour.len(), 2);
    assert!(two_hour.iter().all(|r| r.forecast == "Light Rain"));
}

#[tokio::test]
async fn uv_index_lands_in_national_measurements() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(
        &store,
        Parameter::UvIndex,
        json!({"records": [{"timestamp": "2024-01-01T09:00:00+08:00", "index": [
            {"hour": "2024-01-01T08:00:00+08:00", "value": 1},
            {"hour": "2024-01-01T09:00:00+08:00", "value": "3"}
        ]}]}),
    )
    .await;

    let outcome = engine(store.clone()).transform_date(day(), false).await.unwrap();
    assert_eq!(outcome.status, DateStatus::Succeeded);

    let rows: Vec<NationalMeasurement> = store.rows(Table::NationalMeasurements).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.parameter == "uv_index" && r.units == "index"));
    let mut values: Vec<f64> = rows.iter().map(|r| r.value).collect();
    values.sort_by(f64::total_cmp);
    assert_eq!(values, vec![1.0, 3.0]);
    assert_eq!(store.row_count(Table::WeatherMeasurements), 0);
}

#[tokio::test]
async fn family_writes_are_chunked_to_write_batch_size() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(
        &store,
        Parameter::Pm25,
        json!({"items": [{"timestamp": "2024-01-01T00:00:00Z",
            "readings": {"pm25_one_hourly": {
                "north": 1, "south": 2, "east": 3, "west": 4, "central": 5}}}]}),
    )
    .await;

    let engine = Engine::new(store.clone(), Governor::new(2, 5, 2, 2));
    let outcome = engine.transform_date(day(), false).await.unwrap();
    assert_eq!(outcome.rows_written(), 5);

    let sizes: Vec<usize> = store
        .batch_writes()
        .into_iter()
        .filter(|(table, _)| *table == Table::WeatherMeasurements)
        .map(|(_, rows)| rows)
        .collect();
    assert_eq!(sizes, vec![2, 2, 1]);
}

#[tokio::test]
async fn pm25_and_psi_share_region_rows() {
    // ---
    let store = Arc::new(MemoryStore::new());
    seed(&store, Parameter::Pm25, pm25_doc_with_regions()).await;
    seed(&store, Parameter::Psi, psi_doc()).await;

    let outcome = engine(store.clone()).transform_date(day(), false).await.unwrap();
    assert_eq!(outcome.status, DateStatus::Succeeded);
    assert_eq!(outcome.families.len(), 2);
    assert_eq!(store.row_count(Table::Regions), 2);

    engine(store.clone()).transform_date(day(), true).await.unwrap();
    assert_eq!(store.row_count(Table::Regions), 2);
}
