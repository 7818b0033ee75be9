//! Persistence gateway.
//!
//! [`WeatherStore`] is the only way the pipeline touches storage. The
//! PostgreSQL implementation ([`PgStore`]) is what the binary runs against;
//! [`MemoryStore`] keeps the same conflict semantics in process memory.

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::error::StorageError;
use crate::models::{Parameter, RawDocument, RawKey, RawRecord};
use crate::runs::{RunHandle, RunStatus, TransformRun};
use crate::tracker::{UnitState, UnitStatus};
use crate::transform::{Table, UpsertBatch};

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub(crate) use memory::LocalClaim;
pub(crate) use postgres::SessionClaim;

// ---

#[async_trait]
pub trait WeatherStore: Send + Sync {
    // --- raw_weather_data

    /// Upsert `docs` in one transaction; a conflict replaces the stored
    /// document and refreshes `ingestion_timestamp`. A document's source
    /// file, if any, is recorded in `weather_data_metadata` in the same
    /// transaction.
    async fn upsert_raw(&self, docs: &[RawDocument]) -> Result<u64, StorageError>;

    /// Hash of the archive file last loaded for `key`.
    async fn file_hash(&self, key: RawKey) -> Result<Option<String>, StorageError>;

    /// Raw rows of `date` for `parameters`, oldest ingestion first.
    async fn records_for_date(
        &self,
        date: NaiveDate,
        parameters: &[String],
    ) -> Result<Vec<RawRecord>, StorageError>;

    async fn parameters_for_date(&self, date: NaiveDate) -> Result<Vec<String>, StorageError>;

    /// First and last date present in the raw table.
    async fn raw_date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, StorageError>;

    /// Empty the raw table, its file metadata and the download tracker.
    async fn clear_raw(&self) -> Result<(), StorageError>;

    // --- download_state

    async fn unit_state(
        &self,
        date: NaiveDate,
        parameter: Parameter,
    ) -> Result<Option<UnitStatus>, StorageError>;

    /// Persist `state`; `new_attempt` bumps the attempt counter.
    async fn set_unit_state(
        &self,
        date: NaiveDate,
        parameter: Parameter,
        state: UnitState,
        error: Option<&str>,
        new_attempt: bool,
    ) -> Result<(), StorageError>;

    async fn unit_states(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UnitStatus>, StorageError>;

    // --- normalized tables

    /// Upsert one batch in one transaction, returning the rows written.
    async fn upsert_rows(&self, batch: &UpsertBatch) -> Result<u64, StorageError>;

    async fn table_count(&self, table: Table) -> Result<u64, StorageError>;

    // --- transform_metadata

    /// Claim `date` unless it succeeded (and not `force`) or a live run
    /// holds it. The returned handle keeps the date held until it is passed
    /// to [`complete_run`](Self::complete_run) or dropped.
    async fn begin_run(
        &self,
        date: NaiveDate,
        parameters: &[String],
        force: bool,
    ) -> Result<Option<RunHandle>, StorageError>;

    /// Record the outcome if `handle` still owns the row, then release the
    /// date.
    async fn complete_run(
        &self,
        handle: RunHandle,
        status: RunStatus,
    ) -> Result<bool, StorageError>;

    async fn runs(&self, start: NaiveDate, end: NaiveDate)
        -> Result<Vec<TransformRun>, StorageError>;
}
