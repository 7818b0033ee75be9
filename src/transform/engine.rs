//! Runs the family transforms for a date and loads their output.
//!
//! Per date: claim the date in the metadata tracker, read its raw records,
//! run every family that has input concurrently, write each family's batches
//! in chunks of `write_batch_size`, then record `succeeded` or `failed`.
//! A family whose load fails does not stop its siblings; it fails the date.
//! After a range, the row count of every target table is recorded in the
//! summary.

use std::fmt;
use std::sync::Arc;

use chrono::NaiveDate;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::governor::Governor;
use crate::models::RawRecord;
use crate::raw::error_chain;
use crate::runs::{MetadataTracker, RunStatus};
use crate::store::WeatherStore;

use super::{Family, Table};

// ---

/// Result of loading one family for one date.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FamilyReport {
    pub family: &'static str,
    pub records: usize,
    pub rows_written: u64,
    pub rejected: usize,
    /// Set when a write failed; the family's remaining batches were not written.
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DateStatus {
    Succeeded,
    Failed,
    /// Already succeeded; nothing was written.
    AlreadySucceeded,
    /// Held by another, still-live run.
    Busy,
    /// No raw records for the date.
    NoData,
}

impl fmt::Display for DateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        let s = match self {
            DateStatus::Succeeded => "succeeded",
            DateStatus::Failed => "failed",
            DateStatus::AlreadySucceeded => "already succeeded",
            DateStatus::Busy => "busy",
            DateStatus::NoData => "no data",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DateOutcome {
    pub date: NaiveDate,
    pub status: DateStatus,
    pub families: Vec<FamilyReport>,
    pub error: Option<String>,
}

impl DateOutcome {
    fn bare(date: NaiveDate, status: DateStatus) -> Self {
        // ---
        DateOutcome {
            date,
            status,
            families: Vec::new(),
            error: None,
        }
    }

    /// Whether the date ends this call in `succeeded` state.
    pub fn is_success(&self) -> bool {
        matches!(
            self.status,
            DateStatus::Succeeded | DateStatus::AlreadySucceeded | DateStatus::NoData
        )
    }

    pub fn rows_written(&self) -> u64 {
        self.families.iter().map(|f| f.rows_written).sum()
    }
}

/// Rows in a target table once a range finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableCount {
    pub table: &'static str,
    pub rows: u64,
}

/// Outcomes of a date range, ordered by date.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct TransformSummary {
    pub outcomes: Vec<DateOutcome>,
    /// Empty when the counts could not be read.
    pub table_counts: Vec<TableCount>,
}

impl TransformSummary {
    pub fn count(&self, status: DateStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(DateOutcome::is_success)
    }

    pub fn table_count(&self, table: Table) -> Option<u64> {
        self.table_counts
            .iter()
            .find(|c| c.table == table.name())
            .map(|c| c.rows)
    }
}

#[derive(Clone)]
pub struct Engine {
    store: Arc<dyn WeatherStore>,
    runs: MetadataTracker,
    governor: Governor,
}

impl Engine {
    // ---
    pub fn new(store: Arc<dyn WeatherStore>, governor: Governor) -> Self {
        // ---
        Engine {
            runs: MetadataTracker::new(store.clone()),
            store,
            governor,
        }
    }

    /// Transform every date in `[start, end]`, at most `parallelism` at once.
    pub async fn transform_range(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        force: bool,
    ) -> TransformSummary {
        // ---
        let dates: Vec<NaiveDate> = start.iter_days().take_while(|d| *d <= end).collect();
        info!(
            "Transforming {} date(s) from {} to {} ({} in parallel)",
            dates.len(),
            start,
            end,
            self.governor.parallelism()
        );

        let mut outcomes = self
            .governor
            .for_each_bounded(dates, |date| async move {
                match self.transform_date(date, force).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("{}: transform aborted: {}", date, e);
                        DateOutcome {
                            error: Some(error_chain(&e)),
                            ..DateOutcome::bare(date, DateStatus::Failed)
                        }
                    }
                }
            })
            .await;
        outcomes.sort_by_key(|o| o.date);

        let table_counts = match self.table_counts().await {
            Ok(counts) => counts,
            Err(e) => {
                warn!("Could not count table rows: {}", e);
                Vec::new()
            }
        };
        let summary = TransformSummary {
            outcomes,
            table_counts,
        };
        info!(
            "Transform finished: {} succeeded, {} failed, {} skipped, {} busy, {} without data",
            summary.count(DateStatus::Succeeded),
            summary.count(DateStatus::Failed),
            summary.count(DateStatus::AlreadySucceeded),
            summary.count(DateStatus::Busy),
            summary.count(DateStatus::NoData)
        );
        for count in &summary.table_counts {
            info!("  {:<36}: {} rows", count.table, count.rows);
        }
        summary
    }

    async fn table_counts(&self) -> Result<Vec<TableCount>, StorageError> {
        // ---
        let mut counts = Vec::with_capacity(Table::ALL.len());
        for table in Table::ALL {
            counts.push(TableCount {
                table: table.name(),
                rows: self.store.table_count(table).await?,
            });
        }
        Ok(counts)
    }

    /// Transform one date.
    ///
    /// `Err` means the run could not be claimed or its raw records could not
    /// be read; a failed family load is reported in the outcome instead.
    #[tracing::instrument(skip(self))]
    pub async fn transform_date(
        &self,
        date: NaiveDate,
        force: bool,
    ) -> Result<DateOutcome, StorageError> {
        // ---
        let parameters = self.store.parameters_for_date(date).await?;
        if parameters.is_empty() {
            debug!("{}: no raw records", date);
            return Ok(DateOutcome::bare(date, DateStatus::NoData));
        }

        let Some(handle) = self.runs.begin(date, &parameters, force).await? else {
            let status = match self.runs.status(date).await? {
                RunStatus::Succeeded => DateStatus::AlreadySucceeded,
                _ => DateStatus::Busy,
            };
            info!("{}: skipped ({})", date, status);
            return Ok(DateOutcome::bare(date, status));
        };

        let families = match self.load_families(date, &parameters).await {
            Ok(families) => families,
            Err(e) => {
                self.runs.complete(handle, RunStatus::Failed).await?;
                return Err(e);
            }
        };

        let failed = families.iter().any(|f| f.error.is_some());
        let run_status = if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        };
        self.runs.complete(handle, run_status).await?;

        let outcome = DateOutcome {
            date,
            status: if failed {
                DateStatus::Failed
            } else {
                DateStatus::Succeeded
            },
            families,
            error: None,
        };
        info!(
            "{}: {} ({} rows written)",
            date,
            outcome.status,
            outcome.rows_written()
        );
        Ok(outcome)
    }

    async fn load_families(
        &self,
        date: NaiveDate,
        parameters: &[String],
    ) -> Result<Vec<FamilyReport>, StorageError> {
        // ---
        let records = self.store.records_for_date(date, parameters).await?;
        let families = Family::ALL.into_iter().filter(|f| {
            f.parameters()
                .iter()
                .any(|p| parameters.iter().any(|name| name == p.as_str()))
        });
        Ok(join_all(families.map(|f| self.load_family(f, date, &records))).await)
    }

    async fn load_family(
        &self,
        family: Family,
        date: NaiveDate,
        records: &[RawRecord],
    ) -> FamilyReport {
        // ---
        let output = family.transform(date, records);
        for e in &output.errors {
            warn!("{} {}: rejected: {}", date, family.name(), e);
        }

        let mut report = FamilyReport {
            family: family.name(),
            records: output.records,
            rows_written: 0,
            rejected: output.rejected(),
            error: None,
        };

        for batch in output.batches {
            for chunk in self.governor.chunks(batch) {
                match self.store.upsert_rows(&chunk).await {
                    Ok(written) => report.rows_written += written,
                    Err(e) => {
                        let message = error_chain(&e);
                        error!(
                            "{} {}: write to {} failed: {}",
                            date,
                            family.name(),
                            chunk.table().name(),
                            message
                        );
                        report.error = Some(message);
                        return report;
                    }
                }
            }
        }

        debug!(
            "{} {}: {} records, {} rows, {} rejected",
            date,
            family.name(),
            report.records,
            report.rows_written,
            report.rejected
        );
        report
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::models::{Parameter, RawDocument, RawKey};
    use crate::store::MemoryStore;
    use crate::transform::Table;
    use serde_json::json;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    async fn seeded() -> Arc<MemoryStore> {
        // ---
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_raw(&[RawDocument::new(
                RawKey::new(date(), Parameter::Pm25),
                json!({"items": [{"timestamp": "2024-01-01T00:00:00Z",
                    "readings": {"pm25_one_hourly": {"north": "12.5", "south": "8.0"}}}]}),
            )])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_date_without_raw_data() {
        // ---
        let engine = Engine::new(Arc::new(MemoryStore::new()), Governor::new(2, 5, 500, 300));
        let outcome = engine.transform_date(date(), false).await.unwrap();
        assert_eq!(outcome.status, DateStatus::NoData);
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_only_families_with_input_run() {
        // ---
        let store = seeded().await;
        let engine = Engine::new(store.clone(), Governor::new(2, 5, 500, 300));
        let outcome = engine.transform_date(date(), false).await.unwrap();

        assert_eq!(outcome.status, DateStatus::Succeeded);
        let names: Vec<_> = outcome.families.iter().map(|f| f.family).collect();
        assert_eq!(names, vec!["pm25"]);
        assert_eq!(outcome.rows_written(), 2);
        assert_eq!(store.row_count(Table::WeatherMeasurements), 2);
    }

    #[tokio::test]
    async fn test_failed_load_fails_the_date_and_allows_retry() {
        // ---
        let store = seeded().await;
        store.fail_writes_to(Table::WeatherMeasurements);
        let engine = Engine::new(store.clone(), Governor::new(2, 5, 500, 300));

        let outcome = engine.transform_date(date(), false).await.unwrap();
        assert_eq!(outcome.status, DateStatus::Failed);
        assert!(outcome.families[0].error.is_some());

        store.clear_failures();
        let retry = engine.transform_date(date(), false).await.unwrap();
        assert_eq!(retry.status, DateStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_abandoned_run_does_not_block_the_date() {
        // ---
        let store = seeded().await;
        let engine = Engine::new(store.clone(), Governor::new(2, 5, 500, 300));

        let abandoned = MetadataTracker::new(store.clone())
            .begin(date(), &["pm25".to_string()], false)
            .await
            .unwrap()
            .unwrap();
        let busy = engine.transform_date(date(), true).await.unwrap();
        assert_eq!(busy.status, DateStatus::Busy);
        drop(abandoned);

        let plain = engine.transform_date(date(), false).await.unwrap();
        assert_eq!(plain.status, DateStatus::Succeeded);

        let forced = engine.transform_date(date(), true).await.unwrap();
        assert_eq!(forced.status, DateStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_range_reports_table_counts() {
        // ---
        let store = seeded().await;
        let engine = Engine::new(store.clone(), Governor::new(2, 5, 500, 300));
        let summary = engine.transform_range(date(), date(), false).await;

        assert_eq!(summary.table_counts.len(), Table::ALL.len());
        assert_eq!(summary.table_count(Table::WeatherMeasurements), Some(2));
        assert_eq!(summary.table_count(Table::Stations), Some(0));
        assert_eq!(summary.table_count(Table::FourDayForecasts), Some(0));
    }
}
