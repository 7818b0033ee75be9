//! Metadata tracker: per-date transform run status.
//!
//! A date is reprocessable until a run for it succeeds. A run holds its date
//! through a [`Claim`] owned by the [`RunHandle`]: on PostgreSQL a
//! session-scoped advisory lock, in memory an entry in a shared set. The
//! claim ends when the handle is completed or dropped, and when the process
//! dies the database session goes with it. A date left `running` by a crashed
//! or cancelled run is therefore reclaimed by the next run, forced or not.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::store::{LocalClaim, SessionClaim, WeatherStore};

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            other => Err(StorageError::Decode {
                column: "transform_metadata.status",
                value: other.to_string(),
            }),
        }
    }
}

/// Holds a date for one run. Dropping it releases the date.
pub(crate) enum Claim {
    Session(SessionClaim),
    Local(LocalClaim),
}

/// Proof that the caller holds `date` until it calls `complete` or drops
/// the handle.
pub struct RunHandle {
    pub date: NaiveDate,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub(crate) claim: Claim,
}

impl fmt::Debug for RunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // ---
        f.debug_struct("RunHandle")
            .field("date", &self.date)
            .field("run_id", &self.run_id)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

/// A row of `transform_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformRun {
    pub date: NaiveDate,
    pub parameters: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub run_id: Option<Uuid>,
}

/// Sole writer of run status.
#[derive(Clone)]
pub struct MetadataTracker {
    store: Arc<dyn WeatherStore>,
}

impl MetadataTracker {
    // ---
    pub fn new(store: Arc<dyn WeatherStore>) -> Self {
        MetadataTracker { store }
    }

    /// Claim `date` for a new run.
    ///
    /// Returns `None` when the date already succeeded (and `force` is off) or
    /// when a live run holds it. A `running` row nobody holds is reclaimed.
    pub async fn begin(
        &self,
        date: NaiveDate,
        parameters: &[String],
        force: bool,
    ) -> Result<Option<RunHandle>, StorageError> {
        // ---
        let handle = self
            .store
            .begin_run(date, parameters, force)
            .await?;
        match &handle {
            Some(h) => debug!("{}: run {} started", date, h.run_id),
            None => debug!("{}: not claimed (succeeded or held by another run)", date),
        }
        Ok(handle)
    }

    /// Record the outcome of `handle`'s run and release its date. Returns
    /// `false` if the row no longer names this run.
    pub async fn complete(
        &self,
        handle: RunHandle,
        status: RunStatus,
    ) -> Result<bool, StorageError> {
        // ---
        let (date, run_id) = (handle.date, handle.run_id);
        let owned = self.store.complete_run(handle, status).await?;
        if !owned {
            warn!(
                "{}: run {} no longer owns the date, status {} not recorded",
                date, run_id, status
            );
        }
        Ok(owned)
    }

    /// Status of `date`; a date with no row is `Pending`.
    pub async fn status(&self, date: NaiveDate) -> Result<RunStatus, StorageError> {
        // ---
        let runs = self.store.runs(date, date).await?;
        Ok(runs
            .into_iter()
            .next()
            .map(|r| r.status)
            .unwrap_or(RunStatus::Pending))
    }

    pub async fn runs(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TransformRun>, StorageError> {
        self.store.runs(start, end).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::store::MemoryStore;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, 19).unwrap()
    }

    fn params() -> Vec<String> {
        vec!["pm25".to_string(), "psi".to_string()]
    }

    fn tracker() -> MetadataTracker {
        MetadataTracker::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_succeeded_date_is_skipped_unless_forced() {
        // ---
        let tracker = tracker();
        assert_eq!(tracker.status(date()).await.unwrap(), RunStatus::Pending);

        let handle = tracker.begin(date(), &params(), false).await.unwrap().unwrap();
        assert_eq!(tracker.status(date()).await.unwrap(), RunStatus::Running);
        assert!(tracker.complete(handle, RunStatus::Succeeded).await.unwrap());

        assert!(tracker.begin(date(), &params(), false).await.unwrap().is_none());
        assert!(tracker.begin(date(), &params(), true).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_failed_date_is_reprocessable() {
        // ---
        let tracker = tracker();
        let handle = tracker.begin(date(), &params(), false).await.unwrap().unwrap();
        let first = handle.run_id;
        tracker.complete(handle, RunStatus::Failed).await.unwrap();

        let retry = tracker.begin(date(), &params(), false).await.unwrap();
        assert!(retry.is_some());
        assert_ne!(retry.unwrap().run_id, first);
    }

    #[tokio::test]
    async fn test_running_date_is_exclusive() {
        // ---
        let tracker = tracker();
        let _held = tracker.begin(date(), &params(), false).await.unwrap().unwrap();
        assert!(tracker.begin(date(), &params(), false).await.unwrap().is_none());
        assert!(tracker.begin(date(), &params(), true).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_run_releases_its_date() {
        // ---
        let tracker = tracker();
        let abandoned = tracker.begin(date(), &params(), false).await.unwrap().unwrap();
        let abandoned_id = abandoned.run_id;
        drop(abandoned);

        // the row still says running, but nobody holds the date
        assert_eq!(tracker.status(date()).await.unwrap(), RunStatus::Running);
        let next = tracker.begin(date(), &params(), false).await.unwrap().unwrap();
        assert_ne!(next.run_id, abandoned_id);
        assert!(tracker.complete(next, RunStatus::Succeeded).await.unwrap());
        assert_eq!(tracker.status(date()).await.unwrap(), RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_held_dates_are_independent() {
        // ---
        let tracker = tracker();
        let other = date().succ_opt().unwrap();
        let _held = tracker.begin(date(), &params(), false).await.unwrap().unwrap();
        assert!(tracker.begin(other, &params(), false).await.unwrap().is_some());
    }
}
