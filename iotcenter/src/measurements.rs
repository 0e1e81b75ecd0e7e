use crate::errors::Result;
use crate::metrics::MEASUREMENTS_WRITTEN_TOTAL;
use crate::model::{
    validate_device_id, TelemetryPoint, DEVICE_TAG, ENVIRONMENT_MEASUREMENT, FIELD_HUMIDITY,
    FIELD_LATITUDE, FIELD_LONGITUDE, FIELD_PRESSURE, FIELD_TEMPERATURE, SENSOR_MODEL,
};
use crate::store::flux::{
    encode_annotated_csv, join_csv_rows, validate_range_start, FluxQuery, Predicate,
};
use crate::store::line_protocol::Point;
use crate::store::TimeSeriesStore;
use crate::telemetry::VirtualSensor;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Result of one device's write inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutcome {
    pub device_id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Environmental readings in the telemetry bucket.
#[derive(Clone)]
pub struct TelemetryStore {
    store: Arc<dyn TimeSeriesStore>,
    sensor: Arc<VirtualSensor>,
    bucket: String,
}

impl TelemetryStore {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        sensor: Arc<VirtualSensor>,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sensor,
            bucket: bucket.into(),
        }
    }

    pub async fn write_measurement(&self, device_id: &str) -> Result<String> {
        validate_device_id(device_id)?;
        let reading = self.sensor.read_sensors().await;

        let point = Point::new(ENVIRONMENT_MEASUREMENT)
            .tag(DEVICE_TAG, device_id)
            .tag("TemperatureSensor", SENSOR_MODEL)
            .tag("HumiditySensor", SENSOR_MODEL)
            .tag("PressureSensor", SENSOR_MODEL)
            .field(FIELD_TEMPERATURE, reading.temperature)
            .field(FIELD_HUMIDITY, reading.humidity)
            .field(FIELD_PRESSURE, reading.pressure)
            .field(FIELD_LATITUDE, reading.latitude)
            .field(FIELD_LONGITUDE, reading.longitude)
            .time(Utc::now());

        self.store.write(&self.bucket, &[point]).await?;
        MEASUREMENTS_WRITTEN_TOTAL.inc();
        Ok(device_id.to_string())
    }

    /// Writes one reading per device, in order. A failure for one device does
    /// not affect the others.
    pub async fn write_measurements(&self, device_ids: &[String]) -> Vec<WriteOutcome> {
        let mut outcomes = Vec::with_capacity(device_ids.len());
        for device_id in device_ids {
            info!("Writing measurements for: {}", device_id);
            let outcome = match self.write_measurement(device_id).await {
                Ok(_) => WriteOutcome {
                    device_id: device_id.clone(),
                    ok: true,
                    error: None,
                },
                Err(e) => {
                    error!("Failed to write measurement for {}: {}", device_id, e);
                    WriteOutcome {
                        device_id: device_id.clone(),
                        ok: false,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    fn device_query(&self, device_id: &str, start: &str) -> FluxQuery {
        FluxQuery::from_bucket(&self.bucket)
            .range(start)
            .filter(Predicate::eq("_measurement", ENVIRONMENT_MEASUREMENT))
            .filter(Predicate::eq(DEVICE_TAG, device_id))
    }

    /// Latest reading for the device; empty when it never reported.
    pub async fn get_measurements(&self, device_id: &str) -> Result<Vec<TelemetryPoint>> {
        let records = self.store.query(&self.device_query(device_id, "0").last()).await?;
        Ok(TelemetryPoint::from_records(&records))
    }

    /// Runs caller-supplied Flux and returns the annotated CSV, comma-joined.
    /// The query is not scoped to `device_id`, which is only logged.
    pub async fn get_measurements_raw(&self, device_id: &str, query: &str) -> Result<String> {
        info!("Forwarding raw query for device {}: {}", device_id, query);
        let body = self.store.query_csv(query).await?;
        join_csv_rows(&body)
    }

    /// Annotated CSV of one device's readings since `start`.
    pub async fn get_measurements_csv(&self, device_id: &str, start: &str) -> Result<String> {
        validate_range_start(start)?;
        let records = self.store.query(&self.device_query(device_id, start)).await?;
        Ok(encode_annotated_csv(&records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::model::{Authorization, AuthorizationRequest, Bucket};
    use crate::store::flux::FluxRecord;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::io;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Rejects writes tagged with one device id, delegating everything else.
    struct RejectingStore {
        inner: MemoryStore,
        reject: String,
    }

    #[async_trait]
    impl TimeSeriesStore for RejectingStore {
        async fn list_buckets(&self) -> Result<Vec<Bucket>> {
            self.inner.list_buckets().await
        }

        async fn find_bucket_by_name(&self, name: &str) -> Result<Option<Bucket>> {
            self.inner.find_bucket_by_name(name).await
        }

        async fn create_authorization(
            &self,
            request: &AuthorizationRequest,
        ) -> Result<Authorization> {
            self.inner.create_authorization(request).await
        }

        async fn write(&self, bucket: &str, points: &[Point]) -> Result<()> {
            let rejected = points
                .iter()
                .any(|p| p.tags.get(DEVICE_TAG) == Some(&self.reject));
            if rejected {
                return Err(Error::Store {
                    status: 503,
                    body: "unavailable".to_string(),
                });
            }
            self.inner.write(bucket, points).await
        }

        async fn query(&self, query: &FluxQuery) -> Result<Vec<FluxRecord>> {
            self.inner.query(query).await
        }

        async fn query_csv(&self, flux: &str) -> Result<String> {
            self.inner.query_csv(flux).await
        }
    }

    fn telemetry(store: Arc<dyn TimeSeriesStore>) -> TelemetryStore {
        let sensor = Arc::new(VirtualSensor::new(None).unwrap());
        TelemetryStore::new(store, sensor, "telemetry")
    }

    #[tokio::test]
    async fn test_write_then_read_back() {
        let store = Arc::new(MemoryStore::with_buckets("org", &["telemetry"]));
        let telemetry = telemetry(store);

        let written = telemetry.write_measurement("dev1").await.unwrap();
        assert_eq!(written, "dev1");

        let points = telemetry.get_measurements("dev1").await.unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].device, "dev1");
        assert!(points[0].is_complete());
    }

    #[tokio::test]
    async fn test_latest_reading_only() {
        let store = Arc::new(MemoryStore::with_buckets("org", &["telemetry"]));
        let telemetry = telemetry(store);

        telemetry.write_measurement("dev1").await.unwrap();
        telemetry.write_measurement("dev1").await.unwrap();
        telemetry.write_measurement("dev2").await.unwrap();

        let points = telemetry.get_measurements("dev1").await.unwrap();
        assert_eq!(points.len(), 1);
        assert!(telemetry.get_measurements("nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_batch_failure_is_isolated() {
        let store = Arc::new(RejectingStore {
            inner: MemoryStore::with_buckets("org", &["telemetry"]),
            reject: "b".to_string(),
        });
        let telemetry = telemetry(store.clone());

        let outcomes = telemetry
            .write_measurements(&["a".to_string(), "b".to_string()])
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].ok);
        assert_eq!(outcomes[0].device_id, "a");
        assert!(!outcomes[1].ok);
        assert!(outcomes[1].error.is_some());
        assert_eq!(store.inner.point_count("telemetry"), 1);
    }

    #[tokio::test]
    async fn test_batch_skips_id_with_line_break() {
        let store = Arc::new(MemoryStore::with_buckets("org", &["telemetry"]));
        let telemetry = telemetry(store.clone());

        let outcomes = telemetry
            .write_measurements(&["ok".to_string(), "a\ndevice=evil".to_string()])
            .await;

        assert!(outcomes[0].ok);
        assert!(!outcomes[1].ok);
        assert_eq!(store.point_count("telemetry"), 1);
    }

    #[tokio::test]
    async fn test_csv_export_for_device() {
        let store = Arc::new(MemoryStore::with_buckets("org", &["telemetry"]));
        let telemetry = telemetry(store);
        telemetry.write_measurement("dev1").await.unwrap();

        let csv = telemetry.get_measurements_csv("dev1", "-1h").await.unwrap();
        let lines: Vec<&str> = csv.lines().collect();

        assert!(lines[0].starts_with("#datatype,"));
        assert!(lines[1].contains("_value"));
        assert_eq!(lines.len(), 2 + 5);
        assert!(lines[2..].iter().all(|l| l.contains("dev1")));
    }

    #[tokio::test]
    async fn test_csv_export_rejects_bad_range() {
        let store = Arc::new(MemoryStore::with_buckets("org", &["telemetry"]));
        let telemetry = telemetry(store);

        let result = telemetry.get_measurements_csv("dev1", "-1h) |> drop()").await;
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_raw_query_logs_device_and_query() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let store = Arc::new(MemoryStore::with_buckets("org", &["telemetry"]));
        let telemetry = telemetry(store);
        let result = telemetry
            .get_measurements_raw("dev1", "from(bucket: \"telemetry\") |> range(start: 0)")
            .await;
        assert!(matches!(result, Err(Error::Unsupported(_))));

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let line = output
            .lines()
            .find(|l| l.contains("Forwarding raw query"))
            .expect("raw query was logged");
        assert!(line.contains("INFO"));
        assert!(line.contains("device dev1"));
        assert!(line.contains("from(bucket: \"telemetry\")"));
    }
}
