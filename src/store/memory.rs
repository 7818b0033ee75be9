//! In-process [`WeatherStore`].
//!
//! Rows are kept as JSON objects keyed by their conflict key, and a conflict
//! overwrites only the table's update columns, exactly as the SQL upserts do.
//! Write failures can be switched on per table to exercise error paths.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{Parameter, RawDocument, RawKey, RawRecord, SourceFile};
use crate::runs::{Claim, RunHandle, RunStatus, TransformRun};
use crate::tracker::{UnitState, UnitStatus};
use crate::transform::{Table, UpsertBatch};

use super::WeatherStore;

// ---

type RawStoreKey = (DateTime<Utc>, String, String);

#[derive(Default)]
struct Inner {
    raw: BTreeMap<RawStoreKey, RawRecord>,
    files: BTreeMap<RawKey, SourceFile>,
    units: BTreeMap<(NaiveDate, String), UnitStatus>,
    tables: HashMap<Table, BTreeMap<String, Map<String, Value>>>,
    runs: BTreeMap<NaiveDate, TransformRun>,
    row_writes: u64,
    batch_writes: Vec<(Table, usize)>,
    failing: HashSet<Table>,
    failing_units: HashSet<(NaiveDate, Parameter, UnitState)>,
    fail_raw: bool,
}

type HeldDates = Arc<Mutex<HashSet<NaiveDate>>>;

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    held: HeldDates,
}

/// A date held in a [`MemoryStore`]; dropping it frees the date.
pub(crate) struct LocalClaim {
    held: HeldDates,
    date: NaiveDate,
}

impl Drop for LocalClaim {
    fn drop(&mut self) {
        // ---
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        held.remove(&self.date);
    }
}

fn injected(what: &str) -> StorageError {
    StorageError::Database(sqlx::Error::Protocol(format!("injected failure writing {what}")))
}

impl MemoryStore {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicking test thread must not hide the data from the others
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Make every write to `table` fail until cleared.
    pub fn fail_writes_to(&self, table: Table) {
        self.lock().failing.insert(table);
    }

    /// Make tracker writes moving one unit to `state` fail until cleared.
    pub fn fail_unit_writes(&self, date: NaiveDate, parameter: Parameter, state: UnitState) {
        self.lock().failing_units.insert((date, parameter, state));
    }

    pub fn clear_failures(&self) {
        // ---
        let mut inner = self.lock();
        inner.failing.clear();
        inner.failing_units.clear();
        inner.fail_raw = false;
    }

    /// Make raw document writes fail until cleared.
    pub fn fail_raw_writes(&self) {
        self.lock().fail_raw = true;
    }

    /// Rows of `table`, ordered by conflict key.
    pub fn rows<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>, serde_json::Error> {
        // ---
        let inner = self.lock();
        inner
            .tables
            .get(&table)
            .map(|rows| {
                rows.values()
                    .map(|row| serde_json::from_value(Value::Object(row.clone())))
                    .collect()
            })
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    pub fn row_count(&self, table: Table) -> usize {
        self.lock().tables.get(&table).map_or(0, BTreeMap::len)
    }

    /// Total rows written to normalized tables, conflicts included.
    pub fn row_writes(&self) -> u64 {
        self.lock().row_writes
    }

    /// `(table, rows)` of every normalized-table write, in call order.
    pub fn batch_writes(&self) -> Vec<(Table, usize)> {
        self.lock().batch_writes.clone()
    }

    pub fn raw_records(&self) -> Vec<RawRecord> {
        self.lock().raw.values().cloned().collect()
    }
}

#[async_trait]
impl WeatherStore for MemoryStore {
    // ---
    async fn upsert_raw(&self, docs: &[RawDocument]) -> Result<u64, StorageError> {
        // ---
        let mut inner = self.lock();
        if inner.fail_raw {
            return Err(injected("raw_weather_data"));
        }
        let now = Utc::now();
        for doc in docs {
            let record = RawRecord {
                data_timestamp: doc.key.data_timestamp(),
                data_type: doc.key.data_type.as_str().to_string(),
                parameter: doc.key.parameter.as_str().to_string(),
                validated_data: doc.document.clone(),
                ingestion_timestamp: now,
            };
            let key = (
                record.data_timestamp,
                record.data_type.clone(),
                record.parameter.clone(),
            );
            inner.raw.insert(key, record);
            if let Some(source) = &doc.source {
                inner.files.insert(doc.key, source.clone());
            }
        }
        Ok(docs.len() as u64)
    }

    async fn file_hash(&self, key: RawKey) -> Result<Option<String>, StorageError> {
        Ok(self.lock().files.get(&key).map(|f| f.hash.clone()))
    }

    async fn records_for_date(
        &self,
        date: NaiveDate,
        parameters: &[String],
    ) -> Result<Vec<RawRecord>, StorageError> {
        // ---
        let mut records: Vec<RawRecord> = self
            .lock()
            .raw
            .values()
            .filter(|r| r.data_timestamp.date_naive() == date)
            .filter(|r| parameters.contains(&r.parameter))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (a.ingestion_timestamp, &a.parameter).cmp(&(b.ingestion_timestamp, &b.parameter))
        });
        Ok(records)
    }

    async fn parameters_for_date(&self, date: NaiveDate) -> Result<Vec<String>, StorageError> {
        // ---
        let mut params: Vec<String> = self
            .lock()
            .raw
            .values()
            .filter(|r| r.data_timestamp.date_naive() == date)
            .map(|r| r.parameter.clone())
            .collect();
        params.sort();
        params.dedup();
        Ok(params)
    }

    async fn raw_date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, StorageError> {
        // ---
        let inner = self.lock();
        let first = inner.raw.keys().next().map(|k| k.0.date_naive());
        let last = inner.raw.keys().next_back().map(|k| k.0.date_naive());
        Ok(first.zip(last))
    }

    async fn clear_raw(&self) -> Result<(), StorageError> {
        // ---
        let mut inner = self.lock();
        inner.raw.clear();
        inner.files.clear();
        inner.units.clear();
        Ok(())
    }

    async fn unit_state(
        &self,
        date: NaiveDate,
        parameter: Parameter,
    ) -> Result<Option<UnitStatus>, StorageError> {
        // ---
        let key = (date, parameter.as_str().to_string());
        Ok(self.lock().units.get(&key).cloned())
    }

    async fn set_unit_state(
        &self,
        date: NaiveDate,
        parameter: Parameter,
        state: UnitState,
        error: Option<&str>,
        new_attempt: bool,
    ) -> Result<(), StorageError> {
        // ---
        let mut inner = self.lock();
        if inner.failing_units.contains(&(date, parameter, state)) {
            return Err(injected("download_state"));
        }
        let status = inner
            .units
            .entry((date, parameter.as_str().to_string()))
            .or_insert_with(|| UnitStatus {
                date,
                parameter: parameter.as_str().to_string(),
                state,
                attempts: 0,
                last_error: None,
                updated_at: Utc::now(),
            });
        status.state = state;
        status.last_error = error.map(str::to_string);
        status.updated_at = Utc::now();
        if new_attempt {
            status.attempts += 1;
        }
        Ok(())
    }

    async fn unit_states(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UnitStatus>, StorageError> {
        // ---
        Ok(self
            .lock()
            .units
            .values()
            .filter(|s| s.date >= start && s.date <= end)
            .cloned()
            .collect())
    }

    async fn upsert_rows(&self, batch: &UpsertBatch) -> Result<u64, StorageError> {
        // ---
        let table = batch.table();
        let rows = batch.keyed_json_rows().map_err(|source| StorageError::Encode {
            column: table.name(),
            source,
        })?;

        let mut inner = self.lock();
        if inner.failing.contains(&table) {
            return Err(injected(table.name()));
        }
        let update_columns = table.update_columns();
        let stored = inner.tables.entry(table).or_default();
        for (key, row) in rows.iter() {
            match stored.get_mut(key) {
                Some(existing) => {
                    for column in &update_columns {
                        if let Some(value) = row.get(*column) {
                            existing.insert(column.to_string(), value.clone());
                        }
                    }
                }
                None => {
                    stored.insert(key.clone(), row.clone());
                }
            }
        }
        inner.row_writes += rows.len() as u64;
        inner.batch_writes.push((table, rows.len()));
        Ok(rows.len() as u64)
    }

    async fn table_count(&self, table: Table) -> Result<u64, StorageError> {
        Ok(self.row_count(table) as u64)
    }

    async fn begin_run(
        &self,
        date: NaiveDate,
        parameters: &[String],
        force: bool,
    ) -> Result<Option<RunHandle>, StorageError> {
        // ---
        let mut held = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if held.contains(&date) {
            return Ok(None);
        }
        let now = Utc::now();
        let mut inner = self.lock();
        if let Some(run) = inner.runs.get(&date) {
            if run.status == RunStatus::Succeeded && !force {
                return Ok(None);
            }
        }

        held.insert(date);
        let run_id = Uuid::new_v4();
        inner.runs.insert(
            date,
            TransformRun {
                date,
                parameters: parameters.to_vec(),
                started_at: Some(now),
                completed_at: None,
                status: RunStatus::Running,
                run_id: Some(run_id),
            },
        );
        Ok(Some(RunHandle {
            date,
            run_id,
            started_at: now,
            claim: Claim::Local(LocalClaim {
                held: self.held.clone(),
                date,
            }),
        }))
    }

    async fn complete_run(
        &self,
        handle: RunHandle,
        status: RunStatus,
    ) -> Result<bool, StorageError> {
        // ---
        let mut inner = self.lock();
        let owned = match inner.runs.get_mut(&handle.date) {
            Some(run) if run.run_id == Some(handle.run_id) => {
                run.status = status;
                run.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        };
        drop(inner);
        drop(handle);
        Ok(owned)
    }

    async fn runs(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TransformRun>, StorageError> {
        // ---
        Ok(self
            .lock()
            .runs
            .range(start..=end)
            .map(|(_, run)| run.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Measurement, RawKey};
    use chrono::TimeZone;
    use serde_json::json;

    fn measurement(value: f64, units: &str) -> Measurement {
        // ---
        Measurement {
            timestamp: Utc.with_ymd_and_hms(2024, 7, 19, 1, 0, 0).unwrap(),
            station_id: "S109".to_string(),
            parameter: "temperature".to_string(),
            value,
            units: units.to_string(),
        }
    }

    #[tokio::test]
    async fn test_measurement_conflict_overwrites_value_only() {
        // ---
        let store = MemoryStore::new();
        store
            .upsert_rows(&UpsertBatch::WeatherMeasurements(vec![measurement(30.1, "deg C")]))
            .await
            .unwrap();
        store
            .upsert_rows(&UpsertBatch::WeatherMeasurements(vec![measurement(30.4, "degC")]))
            .await
            .unwrap();

        let rows: Vec<Measurement> = store.rows(Table::WeatherMeasurements).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 30.4);
        assert_eq!(rows[0].units, "deg C");
        assert_eq!(store.row_writes(), 2);
    }

    #[tokio::test]
    async fn test_raw_upsert_replaces_document() {
        // ---
        let store = MemoryStore::new();
        let key = RawKey::new(NaiveDate::from_ymd_opt(2024, 7, 19).unwrap(), Parameter::Psi);
        for n in [1, 2] {
            store
                .upsert_raw(&[RawDocument::new(key, json!({"items": [], "n": n}))])
                .await
                .unwrap();
        }
        let records = store.raw_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].validated_data["n"], 2);
        assert_eq!(records[0].data_type, "reading");
    }
}
