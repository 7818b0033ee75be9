//! PostgreSQL [`WeatherStore`] backed by an sqlx connection pool.
//!
//! Every write runs in its own transaction on a pooled connection; the
//! connection goes back to the pool when the transaction is dropped, on
//! success and on error alike.
//!
//! The exception is a transform run's claim: it keeps one connection checked
//! out for the whole run, holding a session-scoped advisory lock on the date.
//! A claim dropped without completion detaches and closes that connection,
//! so the server ends the session and frees the lock.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::StorageError;
use crate::models::{Parameter, RawDocument, RawKey, RawRecord};
use crate::runs::{Claim, RunHandle, RunStatus, TransformRun};
use crate::tracker::{UnitState, UnitStatus};
use crate::transform::{Table, UpsertBatch};

use super::WeatherStore;

// ---

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    // ---
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

/// First key of the two-key advisory locks taken on transform dates.
const RUN_LOCK_SPACE: i32 = 0x5746_0001;

/// A transform date held by an advisory lock on a dedicated session.
pub(crate) struct SessionClaim {
    conn: Option<PoolConnection<Postgres>>,
    date: NaiveDate,
}

impl SessionClaim {
    // ---
    fn lock_key(date: NaiveDate) -> i32 {
        date.num_days_from_ce()
    }

    /// Unlock on the claim's own session and hand the connection back.
    async fn release(mut self) -> Result<(), StorageError> {
        // ---
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };
        let unlocked = sqlx::query("SELECT pg_advisory_unlock($1, $2)")
            .bind(RUN_LOCK_SPACE)
            .bind(Self::lock_key(self.date))
            .execute(&mut *conn)
            .await;
        if let Err(e) = unlocked {
            // closing the session is the only other way to free the lock
            drop(conn.detach());
            return Err(e.into());
        }
        Ok(())
    }
}

impl Drop for SessionClaim {
    fn drop(&mut self) {
        // ---
        if let Some(conn) = self.conn.take() {
            warn!("{}: run ended without completing, closing its lock session", self.date);
            drop(conn.detach());
        }
    }
}

/// `[date 00:00 UTC, next day 00:00 UTC)`.
fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    // ---
    let start = date.and_time(NaiveTime::MIN).and_utc();
    (start, start + chrono::Duration::days(1))
}

/// `INSERT INTO <table> (<columns>) VALUES ... ON CONFLICT (<key>) DO UPDATE SET ...`
/// with one bound tuple per row, columns in `Table::columns` order.
fn build_upsert(batch: &UpsertBatch) -> QueryBuilder<'static, Postgres> {
    // ---
    let table = batch.table();
    let mut qb = QueryBuilder::<Postgres>::new(format!(
        "INSERT INTO {} ({}) ",
        table.name(),
        table.columns().join(", ")
    ));

    match batch {
        UpsertBatch::Stations(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.station_id.clone())
                    .push_bind(r.device_id.clone())
                    .push_bind(r.name.clone())
                    .push_bind(r.latitude)
                    .push_bind(r.longitude);
            });
        }
        UpsertBatch::Regions(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.region_id.clone())
                    .push_bind(r.latitude)
                    .push_bind(r.longitude);
            });
        }
        UpsertBatch::Areas(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.name.clone())
                    .push_bind(r.latitude)
                    .push_bind(r.longitude);
            });
        }
        UpsertBatch::WeatherMeasurements(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(r.station_id.clone())
                    .push_bind(r.parameter.clone())
                    .push_bind(r.value)
                    .push_bind(r.units.clone());
            });
        }
        UpsertBatch::NationalMeasurements(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(r.parameter.clone())
                    .push_bind(r.value)
                    .push_bind(r.units.clone());
            });
        }
        UpsertBatch::TwoHourForecasts(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(r.area.clone())
                    .push_bind(r.forecast.clone())
                    .push_bind(r.forecast_code.clone())
                    .push_bind(r.valid_period_start)
                    .push_bind(r.valid_period_end);
            });
        }
        UpsertBatch::RegionalForecasts(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(r.region.clone())
                    .push_bind(r.period_start)
                    .push_bind(r.period_end)
                    .push_bind(r.period_text.clone())
                    .push_bind(r.forecast.clone())
                    .push_bind(r.forecast_code.clone());
            });
        }
        UpsertBatch::GeneralForecasts(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(r.period_start)
                    .push_bind(r.period_end)
                    .push_bind(r.temperature_low)
                    .push_bind(r.temperature_high)
                    .push_bind(r.humidity_low)
                    .push_bind(r.humidity_high)
                    .push_bind(r.wind_speed_low)
                    .push_bind(r.wind_speed_high)
                    .push_bind(r.wind_direction.clone())
                    .push_bind(r.forecast.clone())
                    .push_bind(r.forecast_code.clone());
            });
        }
        UpsertBatch::FourDayForecasts(rows) => {
            qb.push_values(rows, |mut b, r| {
                b.push_bind(r.timestamp)
                    .push_bind(r.forecast_date)
                    .push_bind(r.day.clone())
                    .push_bind(r.temperature_low)
                    .push_bind(r.temperature_high)
                    .push_bind(r.humidity_low)
                    .push_bind(r.humidity_high)
                    .push_bind(r.wind_speed_low)
                    .push_bind(r.wind_speed_high)
                    .push_bind(r.wind_direction.clone())
                    .push_bind(r.forecast.clone())
                    .push_bind(r.forecast_code.clone())
                    .push_bind(r.summary.clone());
            });
        }
    }

    let updates: Vec<String> = table
        .update_columns()
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect();
    qb.push(format!(
        " ON CONFLICT ({}) DO UPDATE SET {}",
        table.key_columns().join(", "),
        updates.join(", ")
    ));
    qb
}

#[derive(FromRow)]
struct UnitRow {
    date: NaiveDate,
    parameter: String,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<UnitRow> for UnitStatus {
    type Error = StorageError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        // ---
        Ok(UnitStatus {
            date: row.date,
            parameter: row.parameter,
            state: row.status.parse()?,
            attempts: row.attempts,
            last_error: row.last_error,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct RunRow {
    date: NaiveDate,
    parameters: Json<Vec<String>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    status: String,
    run_id: Option<Uuid>,
}

impl TryFrom<RunRow> for TransformRun {
    type Error = StorageError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        // ---
        Ok(TransformRun {
            date: row.date,
            parameters: row.parameters.0,
            started_at: row.started_at,
            completed_at: row.completed_at,
            status: row.status.parse()?,
            run_id: row.run_id,
        })
    }
}

#[async_trait]
impl WeatherStore for PgStore {
    // ---
    async fn upsert_raw(&self, docs: &[RawDocument]) -> Result<u64, StorageError> {
        // ---
        let mut tx = self.pool.begin().await?;
        let mut written = 0;
        for doc in docs {
            written += sqlx::query(
                r#"
                INSERT INTO raw_weather_data (
                    data_timestamp, data_type, parameter, validated_data, ingestion_timestamp
                ) VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (data_timestamp, data_type, parameter) DO UPDATE SET
                    validated_data      = EXCLUDED.validated_data,
                    ingestion_timestamp = NOW()
                "#,
            )
            .bind(doc.key.data_timestamp())
            .bind(doc.key.data_type.as_str())
            .bind(doc.key.parameter.as_str())
            .bind(&doc.document)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if let Some(source) = &doc.source {
                sqlx::query(
                    r#"
                    INSERT INTO weather_data_metadata (
                        data_timestamp, data_type, parameter, file_path, file_hash, load_timestamp
                    ) VALUES ($1, $2, $3, $4, $5, NOW())
                    ON CONFLICT (data_timestamp, data_type, parameter) DO UPDATE SET
                        file_path      = EXCLUDED.file_path,
                        file_hash      = EXCLUDED.file_hash,
                        load_timestamp = NOW()
                    "#,
                )
                .bind(doc.key.data_timestamp())
                .bind(doc.key.data_type.as_str())
                .bind(doc.key.parameter.as_str())
                .bind(&source.path)
                .bind(&source.hash)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
        debug!("Upserted {} raw documents", written);
        Ok(written)
    }

    async fn file_hash(&self, key: RawKey) -> Result<Option<String>, StorageError> {
        // ---
        let hash = sqlx::query_scalar::<_, String>(
            r#"
            SELECT file_hash
              FROM weather_data_metadata
             WHERE data_timestamp = $1 AND data_type = $2 AND parameter = $3
            "#,
        )
        .bind(key.data_timestamp())
        .bind(key.data_type.as_str())
        .bind(key.parameter.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(hash)
    }

    async fn records_for_date(
        &self,
        date: NaiveDate,
        parameters: &[String],
    ) -> Result<Vec<RawRecord>, StorageError> {
        // ---
        let (start, end) = day_bounds(date);
        let records = sqlx::query_as::<_, RawRecord>(
            r#"
            SELECT data_timestamp, data_type, parameter, validated_data, ingestion_timestamp
              FROM raw_weather_data
             WHERE data_timestamp >= $1 AND data_timestamp < $2
               AND parameter = ANY($3)
             ORDER BY ingestion_timestamp, parameter
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(parameters)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn parameters_for_date(&self, date: NaiveDate) -> Result<Vec<String>, StorageError> {
        // ---
        let (start, end) = day_bounds(date);
        let params = sqlx::query_scalar::<_, String>(
            r#"
            SELECT DISTINCT parameter
              FROM raw_weather_data
             WHERE data_timestamp >= $1 AND data_timestamp < $2
             ORDER BY parameter
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(params)
    }

    async fn raw_date_range(&self) -> Result<Option<(NaiveDate, NaiveDate)>, StorageError> {
        // ---
        let (first, last): (Option<DateTime<Utc>>, Option<DateTime<Utc>>) =
            sqlx::query_as("SELECT MIN(data_timestamp), MAX(data_timestamp) FROM raw_weather_data")
                .fetch_one(&self.pool)
                .await?;
        Ok(first.zip(last).map(|(a, b)| (a.date_naive(), b.date_naive())))
    }

    async fn clear_raw(&self) -> Result<(), StorageError> {
        // ---
        sqlx::query("TRUNCATE raw_weather_data, weather_data_metadata, download_state")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn unit_state(
        &self,
        date: NaiveDate,
        parameter: Parameter,
    ) -> Result<Option<UnitStatus>, StorageError> {
        // ---
        let row = sqlx::query_as::<_, UnitRow>(
            r#"
            SELECT date, parameter, status, attempts, last_error, updated_at
              FROM download_state
             WHERE date = $1 AND parameter = $2
            "#,
        )
        .bind(date)
        .bind(parameter.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(UnitStatus::try_from).transpose()
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
        sqlx::query(
            r#"
            INSERT INTO download_state (date, parameter, status, attempts, last_error, updated_at)
            VALUES ($1, $2, $3, CASE WHEN $5 THEN 1 ELSE 0 END, $4, NOW())
            ON CONFLICT (date, parameter) DO UPDATE SET
                status     = EXCLUDED.status,
                attempts   = download_state.attempts + CASE WHEN $5 THEN 1 ELSE 0 END,
                last_error = EXCLUDED.last_error,
                updated_at = NOW()
            "#,
        )
        .bind(date)
        .bind(parameter.as_str())
        .bind(state.as_str())
        .bind(error)
        .bind(new_attempt)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn unit_states(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<UnitStatus>, StorageError> {
        // ---
        let rows = sqlx::query_as::<_, UnitRow>(
            r#"
            SELECT date, parameter, status, attempts, last_error, updated_at
              FROM download_state
             WHERE date BETWEEN $1 AND $2
             ORDER BY date, parameter
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(UnitStatus::try_from).collect()
    }

    async fn upsert_rows(&self, batch: &UpsertBatch) -> Result<u64, StorageError> {
        // ---
        if batch.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        let written = build_upsert(batch)
            .build()
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        debug!("Upserted {} rows into {}", written, batch.table().name());
        Ok(written)
    }

    async fn table_count(&self, table: Table) -> Result<u64, StorageError> {
        // ---
        let sql = format!("SELECT COUNT(*) FROM {}", table.name());
        let (count,): (i64,) = sqlx::query_as(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn begin_run(
        &self,
        date: NaiveDate,
        parameters: &[String],
        force: bool,
    ) -> Result<Option<RunHandle>, StorageError> {
        // ---
        let mut conn = self.pool.acquire().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1, $2)")
            .bind(RUN_LOCK_SPACE)
            .bind(SessionClaim::lock_key(date))
            .fetch_one(&mut *conn)
            .await?;
        if !locked {
            return Ok(None);
        }
        let mut claim = SessionClaim {
            conn: Some(conn),
            date,
        };

        // A `running` row is reclaimed here: whoever wrote it no longer
        // holds the lock.
        let claimed = match claim.conn.as_mut() {
            Some(conn) => {
                sqlx::query_as::<_, (NaiveDate, Uuid, DateTime<Utc>)>(
                    r#"
                    INSERT INTO transform_metadata (date, parameters, started_at, completed_at, status, run_id)
                    VALUES ($1, $2, NOW(), NULL, 'running', $3)
                    ON CONFLICT (date) DO UPDATE SET
                        parameters   = EXCLUDED.parameters,
                        started_at   = EXCLUDED.started_at,
                        completed_at = NULL,
                        status       = 'running',
                        run_id       = EXCLUDED.run_id
                    WHERE transform_metadata.status <> 'succeeded' OR $4
                    RETURNING date, run_id, started_at
                    "#,
                )
                .bind(date)
                .bind(Json(parameters))
                .bind(Uuid::new_v4())
                .bind(force)
                .fetch_optional(&mut **conn)
                .await?
            }
            None => None,
        };

        match claimed {
            Some((date, run_id, started_at)) => Ok(Some(RunHandle {
                date,
                run_id,
                started_at,
                claim: Claim::Session(claim),
            })),
            None => {
                claim.release().await?;
                Ok(None)
            }
        }
    }

    async fn complete_run(
        &self,
        handle: RunHandle,
        status: RunStatus,
    ) -> Result<bool, StorageError> {
        // ---
        let result = sqlx::query(
            r#"
            UPDATE transform_metadata
               SET status = $3, completed_at = NOW()
             WHERE date = $1 AND run_id = $2
            "#,
        )
        .bind(handle.date)
        .bind(handle.run_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        if let Claim::Session(claim) = handle.claim {
            claim.release().await?;
        }
        Ok(result.rows_affected() == 1)
    }

    async fn runs(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TransformRun>, StorageError> {
        // ---
        let rows = sqlx::query_as::<_, RunRow>(
            r#"
            SELECT date, parameters, started_at, completed_at, status, run_id
              FROM transform_metadata
             WHERE date BETWEEN $1 AND $2
             ORDER BY date
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(TransformRun::try_from).collect()
    }
}
