//! Process-local store for development without an InfluxDB instance.

use crate::errors::{Error, Result};
use crate::model::{Authorization, AuthorizationRequest, Bucket};
use crate::store::flux::{parse_duration_seconds, FluxQuery, FluxRecord};
use crate::store::line_protocol::Point;
use crate::store::TimeSeriesStore;
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    buckets: Vec<Bucket>,
    points: Vec<(String, Point)>,
    authorizations: Vec<Authorization>,
}

#[derive(Default)]
pub struct MemoryStore {
    org_id: String,
    inner: Mutex<Inner>,
}

impl MemoryStore {
    /// Creates a store holding one empty bucket per name.
    pub fn with_buckets(org_id: &str, names: &[&str]) -> Self {
        let buckets = names
            .iter()
            .map(|name| Bucket {
                id: Uuid::new_v4().simple().to_string(),
                org_id: org_id.to_string(),
                name: name.to_string(),
                description: None,
                retention_rules: Vec::new(),
            })
            .collect();

        Self {
            org_id: org_id.to_string(),
            inner: Mutex::new(Inner {
                buckets,
                ..Inner::default()
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind, still usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Authorizations issued so far, oldest first.
    pub fn authorizations(&self) -> Vec<Authorization> {
        self.lock().authorizations.clone()
    }

    /// Number of points stored in `bucket`.
    pub fn point_count(&self, bucket: &str) -> usize {
        self.lock().points.iter().filter(|(b, _)| b == bucket).count()
    }
}

/// Earliest time a `range(start:)` keeps. Spans reaching past the
/// representable calendar keep everything, like `start: 0`.
fn range_cutoff(start: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let seconds = parse_duration_seconds(start.strip_prefix('-')?)?;
    now.checked_sub_signed(Duration::try_seconds(seconds)?)
}

fn expand(point: &Point, time: DateTime<Utc>) -> impl Iterator<Item = FluxRecord> + '_ {
    let time = time.to_rfc3339_opts(SecondsFormat::AutoSi, true);
    point.fields.iter().map(move |(field, value)| {
        let mut values = Map::new();
        values.insert("_time".to_string(), Value::from(time.as_str()));
        values.insert("_value".to_string(), value.to_json());
        values.insert("_field".to_string(), Value::from(field.as_str()));
        values.insert(
            "_measurement".to_string(),
            Value::from(point.measurement.as_str()),
        );
        for (tag, tag_value) in &point.tags {
            values.insert(tag.clone(), Value::from(tag_value.as_str()));
        }
        FluxRecord { values }
    })
}

fn series_key(record: &FluxRecord) -> String {
    record
        .values
        .iter()
        .filter(|(k, _)| k.as_str() != "_value" && k.as_str() != "_time")
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

#[async_trait]
impl TimeSeriesStore for MemoryStore {
    async fn list_buckets(&self) -> Result<Vec<Bucket>> {
        Ok(self.lock().buckets.clone())
    }

    async fn find_bucket_by_name(&self, name: &str) -> Result<Option<Bucket>> {
        Ok(self.lock().buckets.iter().find(|b| b.name == name).cloned())
    }

    async fn create_authorization(&self, request: &AuthorizationRequest) -> Result<Authorization> {
        let mut inner = self.lock();
        for permission in &request.permissions {
            let known = permission
                .resource
                .id
                .as_ref()
                .map_or(true, |id| inner.buckets.iter().any(|b| &b.id == id));
            if !known {
                return Err(Error::Store {
                    status: 404,
                    body: "bucket not found".to_string(),
                });
            }
        }

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let authorization = Authorization {
            id: Uuid::new_v4().simple().to_string(),
            token: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
            status: Some("active".to_string()),
            description: Some(request.description.clone()),
            org_id: if request.org_id.is_empty() {
                self.org_id.clone()
            } else {
                request.org_id.clone()
            },
            permissions: request.permissions.clone(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        };
        inner.authorizations.push(authorization.clone());
        Ok(authorization)
    }

    async fn write(&self, bucket: &str, points: &[Point]) -> Result<()> {
        let mut inner = self.lock();
        if !inner.buckets.iter().any(|b| b.name == bucket) {
            return Err(Error::Store {
                status: 404,
                body: format!("bucket \"{}\" not found", bucket),
            });
        }
        for point in points {
            point.to_line_protocol()?;
        }

        let now = Utc::now();
        for point in points {
            let mut point = point.clone();
            point.time.get_or_insert(now);
            inner.points.push((bucket.to_string(), point));
        }
        Ok(())
    }

    async fn query(&self, query: &FluxQuery) -> Result<Vec<FluxRecord>> {
        let inner = self.lock();
        if !inner.buckets.iter().any(|b| b.name == query.bucket) {
            return Err(Error::Store {
                status: 404,
                body: format!("could not find bucket \"{}\"", query.bucket),
            });
        }

        let cutoff = range_cutoff(&query.start, Utc::now());
        let records = inner
            .points
            .iter()
            .filter(|(bucket, _)| bucket == &query.bucket)
            .filter_map(|(_, point)| point.time.map(|t| (point, t)))
            .filter(|(_, time)| cutoff.map_or(true, |c| *time >= c))
            .flat_map(|(point, time)| expand(point, time).map(move |r| (time, r)))
            .filter(|(_, record)| query.predicates.iter().all(|p| p.matches(record)));

        if !query.last {
            return Ok(records.map(|(_, r)| r).collect());
        }

        let mut latest: BTreeMap<String, (DateTime<Utc>, FluxRecord)> = BTreeMap::new();
        for (time, record) in records {
            let key = series_key(&record);
            match latest.get(&key) {
                Some((seen, _)) if *seen > time => {}
                _ => {
                    latest.insert(key, (time, record));
                }
            }
        }
        Ok(latest.into_values().map(|(_, r)| r).collect())
    }

    async fn query_csv(&self, _flux: &str) -> Result<String> {
        Err(Error::Unsupported(
            "raw Flux queries need an InfluxDB backend".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::flux::Predicate;

    #[tokio::test]
    async fn test_last_keeps_newest_per_series() {
        let store = MemoryStore::with_buckets("org", &["auth"]);
        let t0 = Utc::now() - Duration::minutes(5);
        let t1 = Utc::now();

        store
            .write(
                "auth",
                &[
                    Point::new("deviceauth")
                        .tag("deviceId", "dev-1")
                        .field("key", "old")
                        .time(t0),
                    Point::new("deviceauth")
                        .tag("deviceId", "dev-1")
                        .field("key", "new")
                        .time(t1),
                ],
            )
            .await
            .unwrap();

        let query = FluxQuery::from_bucket("auth")
            .filter(Predicate::eq("_measurement", "deviceauth"))
            .last();
        let records = store.query(&query).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value_string().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn test_range_excludes_old_points() {
        let store = MemoryStore::with_buckets("org", &["telemetry"]);
        store
            .write(
                "telemetry",
                &[Point::new("environment")
                    .field("Temperature", 20.0)
                    .time(Utc::now() - Duration::hours(2))],
            )
            .await
            .unwrap();

        let recent = FluxQuery::from_bucket("telemetry").range("-1h");
        assert!(store.query(&recent).await.unwrap().is_empty());

        let all = FluxQuery::from_bucket("telemetry");
        assert_eq!(store.query(&all).await.unwrap().len(), 1);
    }

    #[test]
    fn test_range_cutoff_saturates_on_huge_spans() {
        let now = Utc::now();
        assert_eq!(range_cutoff("-1h", now), Some(now - Duration::hours(1)));
        assert_eq!(range_cutoff("0", now), None);
        assert_eq!(range_cutoff("-100000000w", now), None);
        assert_eq!(range_cutoff(&format!("-{}s", i64::MAX), now), None);
    }

    #[tokio::test]
    async fn test_huge_range_returns_everything() {
        let store = MemoryStore::with_buckets("org", &["telemetry"]);
        store
            .write("telemetry", &[Point::new("environment").field("Temperature", 20.0)])
            .await
            .unwrap();

        let query = FluxQuery::from_bucket("telemetry").range("-100000000w");
        assert_eq!(store.query(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unencodable_point_is_not_stored() {
        let store = MemoryStore::with_buckets("org", &["auth"]);
        let result = store
            .write(
                "auth",
                &[
                    Point::new("deviceauth").tag("deviceId", "ok").field("key", "k"),
                    Point::new("deviceauth").tag("deviceId", "a\nb").field("key", "k"),
                ],
            )
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(store.point_count("auth"), 0);
    }

    #[tokio::test]
    async fn test_write_to_unknown_bucket_fails() {
        let store = MemoryStore::with_buckets("org", &["telemetry"]);
        let result = store.write("missing", &[Point::new("m").field("v", 1.0)]).await;
        assert!(matches!(result, Err(Error::Store { status: 404, .. })));
    }
}
