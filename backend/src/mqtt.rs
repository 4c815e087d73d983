use crate::errors::{Error, Result};
use crate::metrics::{
    APPEND_LATENCY_SECONDS, LOST_MESSAGES_TOTAL, MALFORMED_MESSAGES_TOTAL, MESSAGES_TOTAL,
    PERSISTED_MESSAGES_TOTAL, STORE_FAILURES_TOTAL,
};
use crate::model::{NewRecord, Reading};
use crate::store::TelemetryStore;
use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Telemetry from any device: unimount/device/{device_id}/data.
const TOPIC_PATTERN: &str = "unimount/device/+/data";

const MAX_APPEND_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2000;
/// A hung store call must not wedge the subscriber, so every append attempt
/// is individually bounded.
const APPEND_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn run_mqtt(
    broker: String,
    port: u16,
    client_id: String,
    store: Arc<dyn TelemetryStore>,
) -> Result<()> {
    info!("Connecting to MQTT broker at {}:{}", broker, port);

    let mut mqtt_options = MqttOptions::new(client_id, broker, port);
    mqtt_options.set_keep_alive(Duration::from_secs(30));
    mqtt_options.set_clean_session(false);

    let (client, mut eventloop) = AsyncClient::new(mqtt_options, 10000);

    client
        .subscribe(TOPIC_PATTERN, QoS::AtLeastOnce)
        .await
        .map_err(Error::Mqtt)?;

    info!("Subscribed to {} with QoS 1", TOPIC_PATTERN);

    // Single processing loop per connection: every publish is handled here
    // before the next poll, and per-message failures never escape it.
    loop {
        match eventloop.poll().await {
            Ok(notification) => {
                if let Event::Incoming(Packet::Publish(publish)) = notification {
                    MESSAGES_TOTAL.inc();

                    debug!(
                        "Received message on topic {}, size: {} bytes",
                        publish.topic,
                        publish.payload.len()
                    );

                    match handle_publish(&publish.topic, &publish.payload, store.as_ref()).await {
                        Ok(id) => {
                            PERSISTED_MESSAGES_TOTAL.inc();
                            debug!("Appended record {} from {}", id, publish.topic);
                        }
                        Err(Error::MalformedPayload(reason)) => {
                            MALFORMED_MESSAGES_TOTAL.inc();
                            warn!("Dropping message on {}: {}", publish.topic, reason);
                        }
                        Err(e) => {
                            LOST_MESSAGES_TOTAL.inc();
                            error!(
                                "Message on {} lost after exhausting retries: {}",
                                publish.topic, e
                            );
                        }
                    }
                }
            }
            Err(e) => {
                error!("MQTT error: {}", e);
                // rumqttc reconnects on the next poll; session state survives
                // because clean_session is off.
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

/// Parse one inbound publish and append it. Malformed topics and payloads
/// come back as `MalformedPayload`; store outages as `StoreUnavailable`
/// after bounded retries.
async fn handle_publish(topic: &str, payload: &[u8], store: &dyn TelemetryStore) -> Result<i64> {
    let device_id = device_id_from_topic(topic)?;

    let reading = serde_json::from_slice::<Reading>(payload)
        .map_err(|e| Error::MalformedPayload(format!("JSON parse error: {}", e)))?;

    let record = NewRecord {
        device_id: device_id.to_string(),
        temperature: reading.temperature,
        humidity: reading.humidity,
        vibration: reading.vibration,
        recorded_at: Utc::now(),
    };

    append_with_retry(store, record).await
}

/// Position-based extraction of the device id from
/// unimount/device/{device_id}/data.
fn device_id_from_topic(topic: &str) -> Result<&str> {
    let segments: Vec<&str> = topic.split('/').collect();

    match segments.as_slice() {
        ["unimount", "device", device_id, "data"] if !device_id.is_empty() => Ok(device_id),
        _ => Err(Error::MalformedPayload(format!(
            "unexpected topic shape: {}",
            topic
        ))),
    }
}

/// Append with per-attempt timeout and exponential backoff. After the last
/// attempt the record is gone; there is no dead-letter queue.
async fn append_with_retry(store: &dyn TelemetryStore, record: NewRecord) -> Result<i64> {
    let mut attempt = 0;
    let mut backoff_ms = INITIAL_BACKOFF_MS;

    loop {
        attempt += 1;
        let start = Instant::now();

        let outcome = match tokio::time::timeout(APPEND_TIMEOUT, store.append(record.clone())).await
        {
            Ok(result) => result,
            Err(_) => Err(Error::StoreUnavailable(format!(
                "append timed out after {:?}",
                APPEND_TIMEOUT
            ))),
        };

        match outcome {
            Ok(id) => {
                APPEND_LATENCY_SECONDS.observe(start.elapsed().as_secs_f64());
                if attempt > 1 {
                    info!("Append succeeded on attempt {}", attempt);
                }
                return Ok(id);
            }
            Err(e) => {
                STORE_FAILURES_TOTAL.inc();

                if !e.is_retryable() || attempt >= MAX_APPEND_ATTEMPTS {
                    return Err(e);
                }

                warn!(
                    "Append failed (attempt {}/{}): {}. Retrying in {}ms...",
                    attempt, MAX_APPEND_ATTEMPTS, e, backoff_ms
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(MAX_BACKOFF_MS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails the first `failures_left` appends with
    /// `StoreUnavailable`, then behaves like a normal in-memory store.
    struct FlakyStore {
        inner: MemoryStore,
        failures_left: AtomicU32,
        attempts: AtomicU32,
    }

    impl FlakyStore {
        fn failing(times: u32) -> Self {
            FlakyStore {
                inner: MemoryStore::new(),
                failures_left: AtomicU32::new(times),
                attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl TelemetryStore for FlakyStore {
        async fn append(&self, record: NewRecord) -> Result<i64> {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::StoreUnavailable("connection refused".to_string()));
            }
            self.inner.append(record).await
        }

        async fn latest(
            &self,
            device_id: &str,
            limit: usize,
        ) -> Result<Vec<crate::model::TelemetryRecord>> {
            self.inner.latest(device_id, limit).await
        }

        async fn range(
            &self,
            device_id: &str,
            start: DateTime<Utc>,
            end: DateTime<Utc>,
        ) -> Result<Vec<crate::model::TelemetryRecord>> {
            self.inner.range(device_id, start, end).await
        }
    }

    fn sample_record() -> NewRecord {
        NewRecord {
            device_id: "d9".to_string(),
            temperature: 21.5,
            humidity: 40.0,
            vibration: 0.02,
            recorded_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_retries_through_transient_failures() {
        tokio_test::block_on(async {
            let store = FlakyStore::failing(MAX_APPEND_ATTEMPTS - 1);

            append_with_retry(&store, sample_record()).await.unwrap();

            assert_eq!(store.attempts.load(Ordering::SeqCst), MAX_APPEND_ATTEMPTS);
            assert_eq!(store.latest("d9", 10).await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_append_gives_up_after_bounded_attempts() {
        tokio_test::block_on(async {
            let store = FlakyStore::failing(u32::MAX);

            let err = append_with_retry(&store, sample_record())
                .await
                .unwrap_err();

            assert!(matches!(err, Error::StoreUnavailable(_)));
            assert_eq!(store.attempts.load(Ordering::SeqCst), MAX_APPEND_ATTEMPTS);
            assert!(store.latest("d9", 10).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_device_id_extraction() {
        assert_eq!(
            device_id_from_topic("unimount/device/d9/data").unwrap(),
            "d9"
        );
    }

    #[test]
    fn test_topic_wrong_segment_count() {
        assert!(device_id_from_topic("unimount/device/d9/data/extra").is_err());
        assert!(device_id_from_topic("unimount/device/data").is_err());
        assert!(device_id_from_topic("d9").is_err());
    }

    #[test]
    fn test_topic_wrong_segments() {
        assert!(device_id_from_topic("other/device/d9/data").is_err());
        assert!(device_id_from_topic("unimount/device/d9/status").is_err());
        assert!(device_id_from_topic("unimount/device//data").is_err());
    }

    #[test]
    fn test_valid_message_appended() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let payload = br#"{"temperature":21.5,"humidity":40.0,"vibration":0.02}"#;

            handle_publish("unimount/device/d9/data", payload, &store)
                .await
                .unwrap();

            let rows = store.latest("d9", 10).await.unwrap();
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].device_id, "d9");
            assert_eq!(rows[0].temperature, 21.5);
        });
    }

    #[test]
    fn test_integer_fields_accepted() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let payload = br#"{"temperature":1,"humidity":2,"vibration":3}"#;

            handle_publish("unimount/device/d9/data", payload, &store)
                .await
                .unwrap();

            assert_eq!(store.latest("d9", 10).await.unwrap().len(), 1);
        });
    }

    #[test]
    fn test_missing_fields_dropped() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let payload = br#"{"temperature":1}"#;

            let err = handle_publish("unimount/device/d9/data", payload, &store)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::MalformedPayload(_)));
            assert!(store.latest("d9", 10).await.unwrap().is_empty());
        });
    }

    #[test]
    fn test_non_numeric_field_dropped() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();
            let payload = br#"{"temperature":"hot","humidity":40.0,"vibration":0.02}"#;

            let err = handle_publish("unimount/device/d9/data", payload, &store)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::MalformedPayload(_)));
        });
    }

    #[test]
    fn test_processing_continues_after_bad_message() {
        tokio_test::block_on(async {
            let store = MemoryStore::new();

            let bad = br#"{"temperature":1}"#;
            assert!(handle_publish("unimount/device/d9/data", bad, &store)
                .await
                .is_err());

            let good = br#"{"temperature":21.5,"humidity":40.0,"vibration":0.02}"#;
            handle_publish("unimount/device/d9/data", good, &store)
                .await
                .unwrap();

            assert_eq!(store.latest("d9", 10).await.unwrap().len(), 1);
        });
    }
}
