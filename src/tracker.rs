//! Download/validation tracker.
//!
//! Every `(date, parameter)` unit moves through
//! `NotFetched -> Fetched -> Validated -> Stored`, with `Failed` reachable
//! from any state before `Stored` (a fetch that never produced a document
//! goes straight from `NotFetched` to `Failed`). The state is persisted in
//! `download_state` so a later run knows what still needs work.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::StorageError;
use crate::models::Parameter;
use crate::store::WeatherStore;

// ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    NotFetched,
    Fetched,
    Validated,
    Stored,
    Failed,
}

impl UnitState {
    // ---
    pub fn as_str(&self) -> &'static str {
        // ---
        match self {
            UnitState::NotFetched => "not_fetched",
            UnitState::Fetched => "fetched",
            UnitState::Validated => "validated",
            UnitState::Stored => "stored",
            UnitState::Failed => "failed",
        }
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: UnitState) -> bool {
        // ---
        use UnitState::*;
        matches!(
            (self, next),
            (NotFetched, Fetched)
                | (Fetched, Validated)
                | (Validated, Stored)
                | (NotFetched, Failed)
                | (Fetched, Failed)
                | (Validated, Failed)
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // ---
        match s {
            "not_fetched" => Ok(UnitState::NotFetched),
            "fetched" => Ok(UnitState::Fetched),
            "validated" => Ok(UnitState::Validated),
            "stored" => Ok(UnitState::Stored),
            "failed" => Ok(UnitState::Failed),
            other => Err(StorageError::Decode {
                column: "download_state.status",
                value: other.to_string(),
            }),
        }
    }
}

/// Persisted state of one unit, as reported by `weatherflow status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitStatus {
    pub date: NaiveDate,
    pub parameter: String,
    pub state: UnitState,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// An in-flight unit; carries the state it was last moved to.
#[derive(Debug, Clone, PartialEq)]
pub struct Unit {
    pub date: NaiveDate,
    pub parameter: Parameter,
    state: UnitState,
}

impl Unit {
    pub fn state(&self) -> UnitState {
        self.state
    }
}

/// Reads and advances unit states in the store.
#[derive(Clone)]
pub struct DownloadTracker {
    store: Arc<dyn WeatherStore>,
}

impl DownloadTracker {
    // ---
    pub fn new(store: Arc<dyn WeatherStore>) -> Self {
        DownloadTracker { store }
    }

    /// Whether the unit must be fetched: anything but `Stored` is retried,
    /// and `force` re-fetches stored units too.
    pub async fn needs_fetch(
        &self,
        date: NaiveDate,
        parameter: Parameter,
        force: bool,
    ) -> Result<bool, StorageError> {
        // ---
        if force {
            return Ok(true);
        }
        let current = self.store.unit_state(date, parameter).await?;
        Ok(!matches!(current, Some(s) if s.state == UnitState::Stored))
    }

    /// Open a new attempt: the unit restarts from `NotFetched`.
    pub async fn start(&self, date: NaiveDate, parameter: Parameter) -> Result<Unit, StorageError> {
        // ---
        self.store
            .set_unit_state(date, parameter, UnitState::NotFetched, None, true)
            .await?;
        Ok(Unit {
            date,
            parameter,
            state: UnitState::NotFetched,
        })
    }

    /// Move `unit` to `next`, persisting the new state.
    ///
    /// Illegal edges are rejected without touching the store.
    pub async fn advance(
        &self,
        unit: &mut Unit,
        next: UnitState,
        error: Option<&str>,
    ) -> Result<(), StorageError> {
        // ---
        if !unit.state.can_transition_to(next) {
            return Err(StorageError::IllegalTransition {
                parameter: unit.parameter.to_string(),
                date: unit.date,
                from: unit.state.to_string(),
                to: next.to_string(),
            });
        }
        self.store
            .set_unit_state(unit.date, unit.parameter, next, error, false)
            .await?;
        debug!(
            "{} {}: {} -> {}",
            unit.date, unit.parameter, unit.state, next
        );
        unit.state = next;
        Ok(())
    }

    /// Mark `unit` failed from whatever state it reached.
    pub async fn fail(&self, unit: &mut Unit, error: &str) -> Result<(), StorageError> {
        self.advance(unit, UnitState::Failed, Some(error)).await
    }

    pub async fn states(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UnitStatus>, StorageError> {
        self.store.unit_states(start, end).await
    }
}
