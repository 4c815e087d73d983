use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operator role carried in session tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

/// A verified principal: who the caller is and what they may do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject: String,
    pub role: Role,
}

/// One stored sensor reading. Immutable after insert; `id` is the
/// surrogate key assigned by the store and breaks ordering ties.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TelemetryRecord {
    pub id: i64,
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub vibration: f64,
    pub recorded_at: DateTime<Utc>,
}

/// A reading as it arrives on the bus, before the store assigns a key.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub device_id: String,
    pub temperature: f64,
    pub humidity: f64,
    pub vibration: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Inbound MQTT payload. All three fields are required and numeric;
/// anything else is rejected at the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub vibration: f64,
}
