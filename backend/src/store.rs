use crate::errors::Result;
use crate::model::{NewRecord, TelemetryRecord};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Upper bound on rows returned by `latest`, regardless of what the caller
/// asks for.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Narrow interface over the durable telemetry store. Appends and queries
/// must each be atomic and safe under arbitrary interleaving; records are
/// immutable once appended.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Persist one record and return its surrogate key.
    async fn append(&self, record: NewRecord) -> Result<i64>;

    /// Up to `limit` most recent records for a device, newest first
    /// (recorded_at desc, then surrogate key desc). `limit` is clamped to
    /// [`MAX_QUERY_LIMIT`].
    async fn latest(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetryRecord>>;

    /// All records with start <= recorded_at <= end, ascending. Empty when
    /// nothing matches or start > end.
    async fn range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>>;
}

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    records: Vec<TelemetryRecord>,
}

/// In-process store. Key assignment and insert happen under one write lock,
/// so readers never observe a partially written record.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn append(&self, record: NewRecord) -> Result<i64> {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = inner.next_id;

        inner.records.push(TelemetryRecord {
            id,
            device_id: record.device_id,
            temperature: record.temperature,
            humidity: record.humidity,
            vibration: record.vibration,
            recorded_at: record.recorded_at,
        });

        Ok(id)
    }

    async fn latest(&self, device_id: &str, limit: usize) -> Result<Vec<TelemetryRecord>> {
        let limit = limit.min(MAX_QUERY_LIMIT);
        let inner = self.inner.read().await;

        let mut matched: Vec<TelemetryRecord> = inner
            .records
            .iter()
            .filter(|r| r.device_id == device_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            b.recorded_at
                .cmp(&a.recorded_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        matched.truncate(limit);

        Ok(matched)
    }

    async fn range(
        &self,
        device_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<TelemetryRecord>> {
        let inner = self.inner.read().await;

        let mut matched: Vec<TelemetryRecord> = inner
            .records
            .iter()
            .filter(|r| r.device_id == device_id && r.recorded_at >= start && r.recorded_at <= end)
            .cloned()
            .collect();
        matched.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(matched)
    }
}
