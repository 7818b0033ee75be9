//! `weatherflow`: ELT pipeline for the data.gov.sg weather API.
//!
//! Two stages:
//! - **ingest**: fetch each `(date, parameter)` document, validate it against
//!   its payload shape, and upsert it into `raw_weather_data`, tracking each
//!   unit in `download_state`;
//! - **transform**: unnest the raw documents of a date into normalized
//!   dimension, measurement and forecast tables, recording the run in
//!   `transform_metadata`.
//!
//! Fetched documents can also be kept in a local [`Archive`] and loaded back
//! into the raw store later; files whose content hash has not changed since
//! their last load are skipped.
//!
//! This crate follows the Explicit Module Boundary Pattern (EMBP): callers go
//! through the re-exports below rather than reaching into submodules.

pub mod archive;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod governor;
pub mod ingest;
pub mod models;
pub mod raw;
pub mod runs;
pub mod schema;
pub mod store;
pub mod tracker;
pub mod transform;

pub use archive::{Archive, ArchivedFile};
pub use client::{HttpClient, WeatherApi};
pub use config::Config;
pub use error::{
    ArchiveError, Error, FetchError, Result, StorageError, TransformError,
    ValidationError,
};
pub use governor::Governor;
pub use ingest::{IngestReport, Ingestor};
pub use models::{DataType, Parameter, RawDocument, RawKey, RawRecord, SourceFile};
pub use raw::BatchReport;
pub use runs::{MetadataTracker, RunHandle, RunStatus, TransformRun};
pub use store::{MemoryStore, PgStore, WeatherStore};
pub use tracker::{DownloadTracker, UnitState, UnitStatus};
pub use transform::engine::{DateOutcome, DateStatus, Engine, TableCount, TransformSummary};
pub use transform::{Family, FamilyOutput, Table, UpsertBatch};
