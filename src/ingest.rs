//! Fetch, validate and store: the ingestion half of the pipeline.
//!
//! Units of work are `(date, parameter)` pairs. Each is fetched (from the API,
//! or read back from the local [`Archive`]) and validated independently,
//! bounded by the [`Governor`]; validated documents are then written to the
//! raw store in groups of `raw_batch_size`, and every unit's final state lands
//! in the download tracker. A unit whose tracker write fails is reported
//! failed on its own; the rest of its group carries on.

use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, Stream, StreamExt};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::archive::{content_hash, Archive, ArchivedFile};
use crate::client::WeatherApi;
use crate::error::{ArchiveError, StorageError, ValidationError};
use crate::governor::Governor;
use crate::models::payloads::Payload;
use crate::models::{Parameter, RawDocument, RawKey, SourceFile};
use crate::raw::{self, error_chain};
use crate::store::WeatherStore;
use crate::tracker::{DownloadTracker, Unit, UnitState};

// ---

/// Totals of one ingest run.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct IngestReport {
    pub stored: usize,
    /// Units already `Stored` and not forced, or archive files unchanged
    /// since their last load.
    pub skipped: usize,
    pub failed: Vec<(RawKey, String)>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Where a unit ended up before the raw write.
enum Prepared {
    Skipped,
    Ready(Unit, RawDocument),
    Failed(RawKey, String),
}

/// A tracker write failed while preparing `key`.
fn untracked(key: RawKey, e: StorageError) -> Prepared {
    // ---
    let message = error_chain(&e);
    error!("Download state write failed for {}: {}", key, message);
    Prepared::Failed(key, message)
}

/// Every `(date, parameter)` pair of the inclusive range.
pub fn units(start: NaiveDate, end: NaiveDate, parameters: &[Parameter]) -> Vec<(NaiveDate, Parameter)> {
    // ---
    start
        .iter_days()
        .take_while(|d| *d <= end)
        .flat_map(|d| parameters.iter().map(move |p| (d, *p)))
        .collect()
}

pub struct Ingestor {
    api: Arc<dyn WeatherApi>,
    store: Arc<dyn WeatherStore>,
    tracker: DownloadTracker,
    governor: Governor,
    archive: Option<Archive>,
}

impl Ingestor {
    // ---
    pub fn new(api: Arc<dyn WeatherApi>, store: Arc<dyn WeatherStore>, governor: Governor) -> Self {
        // ---
        Ingestor {
            api,
            tracker: DownloadTracker::new(store.clone()),
            store,
            governor,
            archive: None,
        }
    }

    /// Also write every validated document to `archive`.
    pub fn with_archive(mut self, archive: Archive) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Ingest `parameters` for every date in `[start, end]` from the API.
    ///
    /// Fetch, validation, raw write and tracker failures are all reported per
    /// unit; one unit never stops the others.
    pub async fn ingest(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        parameters: &[Parameter],
        force: bool,
    ) -> IngestReport {
        // ---
        let units = units(start, end, parameters);
        info!(
            "Ingesting {} unit(s) from {} to {} (force: {})",
            units.len(),
            start,
            end,
            force
        );

        let prepared = stream::iter(units)
            .map(|(date, parameter)| self.fetch_unit(date, parameter, force))
            .buffer_unordered(self.governor.parallelism());
        let report = self.store_all(prepared).await;

        info!(
            "Ingest finished: {} stored, {} skipped, {} failed",
            report.stored,
            report.skipped,
            report.failed.len()
        );
        report
    }

    /// Load archived documents of `parameters` dated within `[start, end]`.
    ///
    /// A file whose hash matches the one recorded at its last load is skipped
    /// unless `force` is set. Fails only if the archive cannot be listed.
    pub async fn load(
        &self,
        archive: &Archive,
        start: NaiveDate,
        end: NaiveDate,
        parameters: &[Parameter],
        force: bool,
    ) -> Result<IngestReport, ArchiveError> {
        // ---
        let files = archive.list(start, end, parameters).await?;
        info!(
            "Loading {} archived file(s) from {} ({} to {}, force: {})",
            files.len(),
            archive.root().display(),
            start,
            end,
            force
        );

        let prepared = stream::iter(files)
            .map(|file| self.load_file(archive, file, force))
            .buffer_unordered(self.governor.parallelism());
        let report = self.store_all(prepared).await;

        info!(
            "Load finished: {} stored, {} unchanged, {} failed",
            report.stored,
            report.skipped,
            report.failed.len()
        );
        Ok(report)
    }

    async fn store_all(&self, prepared: impl Stream<Item = Prepared>) -> IngestReport {
        // ---
        let groups = prepared.chunks(self.governor.raw_batch_size());
        futures::pin_mut!(groups);

        let mut report = IngestReport::default();
        while let Some(group) = groups.next().await {
            let mut ready = Vec::with_capacity(group.len());
            for prepared in group {
                match prepared {
                    Prepared::Skipped => report.skipped += 1,
                    Prepared::Failed(key, message) => report.failed.push((key, message)),
                    Prepared::Ready(unit, doc) => ready.push((unit, doc)),
                }
            }
            self.store_group(ready, &mut report).await;
        }
        report
    }

    /// Fetch and validate one unit.
    #[tracing::instrument(skip(self))]
    async fn fetch_unit(&self, date: NaiveDate, parameter: Parameter, force: bool) -> Prepared {
        // ---
        let key = RawKey::new(date, parameter);
        self.try_fetch_unit(key, force)
            .await
            .unwrap_or_else(|e| untracked(key, e))
    }

    async fn try_fetch_unit(&self, key: RawKey, force: bool) -> Result<Prepared, StorageError> {
        // ---
        if !self.tracker.needs_fetch(key.date, key.parameter, force).await? {
            return Ok(Prepared::Skipped);
        }
        let mut unit = self.tracker.start(key.date, key.parameter).await?;

        let document = match self.api.fetch(key.parameter, key.date).await {
            Ok(document) => document,
            Err(e) => {
                let message = error_chain(&e);
                warn!("Fetch failed for {}: {}", key, message);
                self.tracker.fail(&mut unit, &message).await?;
                return Ok(Prepared::Failed(key, message));
            }
        };
        self.tracker.advance(&mut unit, UnitState::Fetched, None).await?;

        if let Some(failed) = self.validate(&mut unit, key, &document).await? {
            return Ok(failed);
        }

        let mut doc = RawDocument::new(key, document);
        if let Some(archive) = &self.archive {
            match archive.write(key, &doc.document).await {
                Ok(source) => doc = doc.with_source(source),
                Err(e) => warn!("Could not archive {}: {}", key, error_chain(&e)),
            }
        }
        Ok(Prepared::Ready(unit, doc))
    }

    /// Read and validate one archived file.
    #[tracing::instrument(skip_all, fields(key = %file.key))]
    async fn load_file(&self, archive: &Archive, file: ArchivedFile, force: bool) -> Prepared {
        // ---
        let key = file.key;
        self.try_load_file(archive, file, force)
            .await
            .unwrap_or_else(|e| untracked(key, e))
    }

    async fn try_load_file(
        &self,
        archive: &Archive,
        file: ArchivedFile,
        force: bool,
    ) -> Result<Prepared, StorageError> {
        // ---
        let key = file.key;
        let bytes = archive.read(&file.path).await;
        let hash = bytes.as_ref().ok().map(|b| content_hash(b));
        if let Some(hash) = hash.as_ref().filter(|_| !force) {
            if self.store.file_hash(key).await?.as_ref() == Some(hash) {
                debug!("{} unchanged since its last load", file.path.display());
                return Ok(Prepared::Skipped);
            }
        }

        let mut unit = self.tracker.start(key.date, key.parameter).await?;
        let parsed = bytes.and_then(|b| {
            serde_json::from_slice::<Value>(&b).map_err(|source| ArchiveError::Json {
                path: file.path.clone(),
                source,
            })
        });
        let document = match parsed {
            Ok(document) => document,
            Err(e) => {
                let message = error_chain(&e);
                warn!("Could not read {}: {}", key, message);
                self.tracker.fail(&mut unit, &message).await?;
                return Ok(Prepared::Failed(key, message));
            }
        };
        self.tracker.advance(&mut unit, UnitState::Fetched, None).await?;

        if let Some(failed) = self.validate(&mut unit, key, &document).await? {
            return Ok(failed);
        }
        let source = SourceFile {
            path: file.path.display().to_string(),
            hash: hash.unwrap_or_default(),
        };
        Ok(Prepared::Ready(
            unit,
            RawDocument::new(key, document).with_source(source),
        ))
    }

    /// Check `document` against its payload shape; `Some` when it failed.
    async fn validate(
        &self,
        unit: &mut Unit,
        key: RawKey,
        document: &Value,
    ) -> Result<Option<Prepared>, StorageError> {
        // ---
        if let Err(e) = Payload::parse(key.parameter, document) {
            let err = ValidationError {
                parameter: key.parameter,
                date: key.date,
                message: e.to_string(),
            };
            warn!("{}", err);
            self.tracker.fail(unit, &err.to_string()).await?;
            return Ok(Some(Prepared::Failed(key, err.to_string())));
        }
        self.tracker.advance(unit, UnitState::Validated, None).await?;
        Ok(None)
    }

    /// Write validated documents and move each unit to `Stored` or `Failed`.
    async fn store_group(&self, ready: Vec<(Unit, RawDocument)>, report: &mut IngestReport) {
        // ---
        if ready.is_empty() {
            return;
        }
        let (mut units, docs): (Vec<Unit>, Vec<RawDocument>) = ready.into_iter().unzip();
        let batch = raw::upsert_batch(
            self.store.as_ref(),
            &docs,
            self.governor.raw_batch_size(),
        )
        .await;

        for unit in units.iter_mut() {
            let key = RawKey::new(unit.date, unit.parameter);
            let tracked = match batch.failed.iter().find(|(k, _)| *k == key) {
                Some((_, message)) => {
                    error!("Raw write failed for {}: {}", key, message);
                    report.failed.push((key, message.clone()));
                    self.tracker.fail(unit, message).await
                }
                None => {
                    let advanced = self.tracker.advance(unit, UnitState::Stored, None).await;
                    if advanced.is_ok() {
                        report.stored += 1;
                    }
                    advanced
                }
            };

            if let Err(e) = tracked {
                let message = error_chain(&e);
                error!("Download state write failed for {}: {}", key, message);
                if !report.failed.iter().any(|(k, _)| *k == key) {
                    report.failed.push((key, message));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_units_cover_inclusive_range() {
        // ---
        let start = NaiveDate::from_ymd_opt(2024, 2, 28).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let units = units(start, end, &[Parameter::Psi, Parameter::Pm25]);
        assert_eq!(units.len(), 6);
        assert_eq!(units[0], (start, Parameter::Psi));
        assert_eq!(units[5], (end, Parameter::Pm25));

        assert!(super::units(end, start, &[Parameter::Psi]).is_empty());
    }
}
