use serde::{Deserialize, Serialize};

/// Payload shape the backend expects on unimount/device/{id}/data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub vibration: f64,
}
