use crate::errors::Result;
use crate::model::{NewRecord, TelemetryRecord};
use crate::store::{TelemetryStore, MAX_QUERY_LIMIT};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{error, info, warn};

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| crate::errors::Error::StoreUnavailable(e.to_string()))?;
    info!("Migrations completed");

    Ok(pool)
}

/// Postgres-backed telemetry store. Each append is a single-row insert, so
/// atomicity comes from the database; concurrent writers only interleave
/// independent rows.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        PgStore { pool }
    }
}

#[async_trait]
impl TelemetryStore for PgStore {
    async fn append(&self, record: NewRecord) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO device_data (device_id, temperature, humidity, vibration, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&record.device_id)
        .bind(record.temperature)
        .bind(record.humidity)
        .bind(record.vibration)
        .bind(record.recorded_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_transient_error(&e) {
                warn!("Transient database error on append: {}", e);
            } else {
                error!("Database error on append: {}", e);
            }
            e
        })?;

        Ok(id)
    }

    async fn latest(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetryRecord>> {
        let limit = limit.min(MAX_QUERY_LIMIT) as i64;

        let rows = sqlx::query_as::<_, TelemetryRecord>(
            r#"
            SELECT id, device_id, temperature, humidity, vibration, recorded_at
            FROM device_data
            WHERE device_id = $1
            ORDER BY recorded_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(device_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>> {
        let rows = sqlx::query_as::<_, TelemetryRecord>(
            r#"
            SELECT id, device_id, temperature, humidity, vibration, recorded_at
            FROM device_data
            WHERE device_id = $1 AND recorded_at >= $2 AND recorded_at <= $3
            ORDER BY recorded_at ASC, id ASC
            "#,
        )
        .bind(device_id)
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

fn is_transient_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_err) => {
            // Connection-class SQLSTATE codes.
            db_err.code().is_some_and(|code| {
                code == "08000" || // connection_exception
                code == "08003" || // connection_does_not_exist
                code == "08006" || // connection_failure
                code == "57P03" || // cannot_connect_now
                code == "53300" // too_many_connections
            })
        }
        _ => false,
    }
}
