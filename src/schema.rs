//! Database schema management for `weatherflow`.
//!
//! Ensures the raw, tracking and normalized tables exist before any command
//! runs. Applied once on startup from `main.rs` (EMBP: single gateway call).

use anyhow::Result;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::transform::Table;

// ---

const TABLES: &[&str] = &[
    // Validated API documents, one per (date, data_type, parameter)
    r#"
    CREATE TABLE IF NOT EXISTS raw_weather_data (
        data_timestamp      TIMESTAMPTZ NOT NULL,
        data_type           TEXT        NOT NULL,
        parameter           TEXT        NOT NULL,
        validated_data      JSONB       NOT NULL,
        ingestion_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (data_timestamp, data_type, parameter)
    );
    "#,
    // Archive file each raw document was last loaded from
    r#"
    CREATE TABLE IF NOT EXISTS weather_data_metadata (
        data_timestamp TIMESTAMPTZ NOT NULL,
        data_type      TEXT        NOT NULL,
        parameter      TEXT        NOT NULL,
        file_path      TEXT        NOT NULL,
        file_hash      TEXT        NOT NULL,
        load_timestamp TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (data_timestamp, data_type, parameter)
    );
    "#,
    // Download/validation tracker
    r#"
    CREATE TABLE IF NOT EXISTS download_state (
        date       DATE        NOT NULL,
        parameter  TEXT        NOT NULL,
        status     TEXT        NOT NULL,
        attempts   INTEGER     NOT NULL DEFAULT 0,
        last_error TEXT,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        PRIMARY KEY (date, parameter)
    );
    "#,
    // Transform run status per date
    r#"
    CREATE TABLE IF NOT EXISTS transform_metadata (
        date         DATE PRIMARY KEY,
        parameters   JSONB       NOT NULL DEFAULT '[]'::jsonb,
        started_at   TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        status       TEXT        NOT NULL DEFAULT 'pending'
                     CHECK (status IN ('pending', 'running', 'succeeded', 'failed')),
        run_id       UUID
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS stations (
        station_id TEXT PRIMARY KEY,
        device_id  TEXT,
        name       TEXT,
        latitude   DOUBLE PRECISION NOT NULL,
        longitude  DOUBLE PRECISION NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS regions (
        region_id TEXT PRIMARY KEY,
        latitude  DOUBLE PRECISION NOT NULL,
        longitude DOUBLE PRECISION NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS areas (
        name      TEXT PRIMARY KEY,
        latitude  DOUBLE PRECISION NOT NULL,
        longitude DOUBLE PRECISION NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS weather_measurements (
        timestamp  TIMESTAMPTZ      NOT NULL,
        station_id TEXT             NOT NULL,
        parameter  TEXT             NOT NULL,
        value      DOUBLE PRECISION NOT NULL,
        units      TEXT             NOT NULL,
        UNIQUE (timestamp, station_id, parameter)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS national_measurements (
        timestamp TIMESTAMPTZ      NOT NULL,
        parameter TEXT             NOT NULL,
        value     DOUBLE PRECISION NOT NULL,
        units     TEXT             NOT NULL,
        UNIQUE (timestamp, parameter)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS two_hour_forecasts (
        timestamp          TIMESTAMPTZ NOT NULL,
        area               TEXT        NOT NULL,
        forecast           TEXT        NOT NULL,
        forecast_code      TEXT,
        valid_period_start TIMESTAMPTZ,
        valid_period_end   TIMESTAMPTZ,
        UNIQUE (timestamp, area)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS twentyfour_hour_regional_forecasts (
        timestamp     TIMESTAMPTZ NOT NULL,
        region        TEXT        NOT NULL,
        period_start  TIMESTAMPTZ NOT NULL,
        period_end    TIMESTAMPTZ NOT NULL,
        period_text   TEXT,
        forecast      TEXT        NOT NULL,
        forecast_code TEXT,
        UNIQUE (timestamp, region, period_start)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS twentyfour_hour_general_forecasts (
        timestamp        TIMESTAMPTZ NOT NULL,
        period_start     TIMESTAMPTZ NOT NULL,
        period_end       TIMESTAMPTZ NOT NULL,
        temperature_low  DOUBLE PRECISION,
        temperature_high DOUBLE PRECISION,
        humidity_low     DOUBLE PRECISION,
        humidity_high    DOUBLE PRECISION,
        wind_speed_low   DOUBLE PRECISION,
        wind_speed_high  DOUBLE PRECISION,
        wind_direction   TEXT,
        forecast         TEXT        NOT NULL,
        forecast_code    TEXT,
        UNIQUE (timestamp, period_start)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS four_day_forecasts (
        timestamp        TIMESTAMPTZ NOT NULL,
        forecast_date    DATE        NOT NULL,
        day              TEXT,
        temperature_low  DOUBLE PRECISION,
        temperature_high DOUBLE PRECISION,
        humidity_low     DOUBLE PRECISION,
        humidity_high    DOUBLE PRECISION,
        wind_speed_low   DOUBLE PRECISION,
        wind_speed_high  DOUBLE PRECISION,
        wind_direction   TEXT,
        forecast         TEXT        NOT NULL,
        forecast_code    TEXT,
        summary          TEXT,
        UNIQUE (timestamp, forecast_date)
    );
    "#,
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist. Errors are
/// propagated if any table DDL fails. Hypertable conversion afterwards is
/// best-effort: without TimescaleDB the tables stay plain.
pub async fn create_schema(pool: &PgPool) -> Result<()> {
    // ---
    let mut tx = pool.begin().await?;

    for ddl in TABLES {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_raw_weather_data_parameter
            ON raw_weather_data (parameter, data_timestamp);
        "#,
    )
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;

    create_hypertables(pool).await;
    Ok(())
}

/// `(table, time column)` pairs partitioned by time when TimescaleDB exists.
fn hypertables() -> Vec<(&'static str, &'static str)> {
    // ---
    let mut tables = vec![("raw_weather_data", "data_timestamp")];
    tables.extend(
        Table::ALL
            .into_iter()
            .filter(Table::is_time_partitioned)
            .map(|t| (t.name(), "timestamp")),
    );
    tables
}

async fn create_hypertables(pool: &PgPool) {
    // ---
    if let Err(e) = sqlx::query("CREATE EXTENSION IF NOT EXISTS timescaledb")
        .execute(pool)
        .await
    {
        warn!("TimescaleDB unavailable, keeping plain tables: {}", e);
        return;
    }

    for (table, column) in hypertables() {
        let sql = format!(
            "SELECT create_hypertable('{table}', '{column}', if_not_exists => TRUE, migrate_data => TRUE)"
        );
        match sqlx::query(&sql).execute(pool).await {
            Ok(_) => info!("Hypertable ready: {}", table),
            Err(e) => warn!("Could not convert {} to a hypertable: {}", table, e),
        }
    }
}
