use crate::errors::{Error, Result};
use crate::store::flux::FluxRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEVICE_AUTH_MEASUREMENT: &str = "deviceauth";
pub const ENVIRONMENT_MEASUREMENT: &str = "environment";
pub const DEVICE_ID_TAG: &str = "deviceId";
pub const DEVICE_TAG: &str = "device";
pub const SENSOR_MODEL: &str = "virtual_bme280";

pub const FIELD_KEY: &str = "key";
pub const FIELD_TOKEN: &str = "token";
pub const FIELD_CREATED_AT: &str = "createdAt";

pub const FIELD_TEMPERATURE: &str = "Temperature";
pub const FIELD_HUMIDITY: &str = "Humidity";
pub const FIELD_PRESSURE: &str = "Pressure";
pub const FIELD_LATITUDE: &str = "Lat";
pub const FIELD_LONGITUDE: &str = "Lon";

/// Prefix of the key `create_device` writes before any real authorization exists.
pub const PLACEHOLDER_KEY_PREFIX: &str = "fake_auth_id_";
pub const PLACEHOLDER_TOKEN_PREFIX: &str = "fake_auth_token_";

/// Device ids become tag values, which cannot be blank or carry control characters.
pub fn validate_device_id(device_id: &str) -> Result<()> {
    if device_id.trim().is_empty() {
        return Err(Error::Validation("deviceId must not be empty".to_string()));
    }
    if device_id.chars().any(char::is_control) {
        return Err(Error::Validation(
            "deviceId must not contain control characters".to_string(),
        ));
    }
    Ok(())
}

/// Device identity and authorization record from the `deviceauth` measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// True when the record holds a key issued by the store, not a placeholder.
    pub fn has_live_key(&self) -> bool {
        self.key
            .as_deref()
            .is_some_and(|k| !k.is_empty() && !k.starts_with(PLACEHOLDER_KEY_PREFIX))
    }

    /// Folds one-field-per-row query output into one record per device.
    pub fn from_records(records: &[FluxRecord]) -> Vec<Device> {
        let mut devices: BTreeMap<String, Device> = BTreeMap::new();

        for record in records {
            let Some(device_id) = record.get_str(DEVICE_ID_TAG) else {
                continue;
            };
            let time = record.time().unwrap_or_else(Utc::now);

            let device = devices
                .entry(device_id.to_string())
                .or_insert_with(|| Device {
                    device_id: device_id.to_string(),
                    key: None,
                    token: None,
                    created_at: None,
                    updated_at: time,
                });
            if time > device.updated_at {
                device.updated_at = time;
            }

            let value = record.value_string();
            match record.field() {
                Some(FIELD_KEY) => device.key = value,
                Some(FIELD_TOKEN) => device.token = value,
                Some(FIELD_CREATED_AT) => device.created_at = value,
                _ => {}
            }
        }

        devices.into_values().collect()
    }
}

/// One synthetic environmental reading, before it is tagged and stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Reading {
    pub temperature: f64,
    pub humidity: f64,
    pub pressure: f64,
    pub latitude: f64,
    pub longitude: f64,
}

/// Geolocation result, real or fallback.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

/// Telemetry point read back from the `environment` measurement.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TelemetryPoint {
    pub device: String,
    pub timestamp: DateTime<Utc>,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl TelemetryPoint {
    /// Pivots field rows into one point per device, keeping the newest timestamp.
    pub fn from_records(records: &[FluxRecord]) -> Vec<TelemetryPoint> {
        let mut points: BTreeMap<String, TelemetryPoint> = BTreeMap::new();

        for record in records {
            let Some(device) = record.get_str(DEVICE_TAG) else {
                continue;
            };
            let Some(time) = record.time() else {
                continue;
            };

            let point = points
                .entry(device.to_string())
                .or_insert_with(|| TelemetryPoint {
                    device: device.to_string(),
                    timestamp: time,
                    temperature: None,
                    humidity: None,
                    pressure: None,
                    latitude: None,
                    longitude: None,
                });
            if time > point.timestamp {
                point.timestamp = time;
            }

            let value = record.value_f64();
            match record.field() {
                Some(FIELD_TEMPERATURE) => point.temperature = value,
                Some(FIELD_HUMIDITY) => point.humidity = value,
                Some(FIELD_PRESSURE) => point.pressure = value,
                Some(FIELD_LATITUDE) => point.latitude = value,
                Some(FIELD_LONGITUDE) => point.longitude = value,
                _ => {}
            }
        }

        points.into_values().collect()
    }

    pub fn is_complete(&self) -> bool {
        self.temperature.is_some()
            && self.humidity.is_some()
            && self.pressure.is_some()
            && self.latitude.is_some()
            && self.longitude.is_some()
    }
}

/// Storage bucket as listed by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    #[serde(rename = "orgID")]
    pub org_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, rename = "retentionRules", skip_serializing_if = "Vec::is_empty")]
    pub retention_rules: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionResource {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "orgID", default, skip_serializing_if = "Option::is_none")]
    pub org_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Read,
    Write,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Permission {
    pub action: Action,
    pub resource: PermissionResource,
}

impl Permission {
    pub fn on_bucket(action: Action, bucket: &Bucket) -> Self {
        Self {
            action,
            resource: PermissionResource {
                kind: "buckets".to_string(),
                id: Some(bucket.id.clone()),
                org_id: Some(bucket.org_id.clone()),
            },
        }
    }
}

/// Body of an authorization issuance request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuthorizationRequest {
    #[serde(rename = "orgID")]
    pub org_id: String,
    pub description: String,
    pub permissions: Vec<Permission>,
}

impl AuthorizationRequest {
    /// Read and write grants on `bucket`, labelled with the device id.
    pub fn for_device(device_id: &str, bucket: &Bucket) -> Self {
        Self {
            org_id: bucket.org_id.clone(),
            description: format!("IoTCenterDevice: {}", device_id),
            permissions: vec![
                Permission::on_bucket(Action::Read, bucket),
                Permission::on_bucket(Action::Write, bucket),
            ],
        }
    }
}

/// Credential issued by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub id: String,
    pub token: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "orgID")]
    pub org_id: String,
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: serde_json::Value) -> FluxRecord {
        FluxRecord::from_json(pairs)
    }

    #[test]
    fn test_device_id_validation() {
        assert!(validate_device_id("dev-1").is_ok());
        assert!(validate_device_id("sensor 7, hall=B").is_ok());
        for bad in ["", "   ", "a\nenvironment,device=evil Temperature=1", "a\rb", "tab\there"] {
            assert!(
                matches!(validate_device_id(bad), Err(Error::Validation(_))),
                "{:?} accepted",
                bad
            );
        }
    }

    #[test]
    fn test_device_from_records_folds_fields() {
        let records = vec![
            record(json!({"deviceId": "dev-1", "_field": "key", "_value": "k1",
                          "_time": "2024-01-01T00:00:00Z"})),
            record(json!({"deviceId": "dev-1", "_field": "token", "_value": "t1",
                          "_time": "2024-01-02T00:00:00Z"})),
            record(json!({"deviceId": "dev-2", "_field": "key", "_value": "k2",
                          "_time": "2024-01-01T00:00:00Z"})),
        ];

        let devices = Device::from_records(&records);

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].device_id, "dev-1");
        assert_eq!(devices[0].key.as_deref(), Some("k1"));
        assert_eq!(devices[0].token.as_deref(), Some("t1"));
        assert_eq!(devices[0].updated_at.to_rfc3339(), "2024-01-02T00:00:00+00:00");
        assert_eq!(devices[1].token, None);
    }

    #[test]
    fn test_placeholder_key_is_not_live() {
        let mut device = Device {
            device_id: "dev-1".to_string(),
            key: Some(format!("{}dev-1", PLACEHOLDER_KEY_PREFIX)),
            token: None,
            created_at: None,
            updated_at: Utc::now(),
        };
        assert!(!device.has_live_key());

        device.key = Some("0a1b2c".to_string());
        assert!(device.has_live_key());

        device.key = None;
        assert!(!device.has_live_key());
    }

    #[test]
    fn test_token_omitted_from_json_when_absent() {
        let device = Device {
            device_id: "dev-1".to_string(),
            key: Some("k".to_string()),
            token: None,
            created_at: None,
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&device).unwrap();
        assert!(value.get("token").is_none());
        assert_eq!(value["deviceId"], "dev-1");
    }

    #[test]
    fn test_telemetry_point_pivot() {
        let records = vec![
            record(json!({"device": "dev-1", "_field": "Temperature", "_value": 21.0,
                          "_time": "2024-01-01T00:00:00Z"})),
            record(json!({"device": "dev-1", "_field": "Lon", "_value": 4.0,
                          "_time": "2024-01-01T00:00:00Z"})),
        ];

        let points = TelemetryPoint::from_records(&records);

        assert_eq!(points.len(), 1);
        assert_eq!(points[0].temperature, Some(21.0));
        assert_eq!(points[0].longitude, Some(4.0));
        assert_eq!(points[0].latitude, None);
        assert!(!points[0].is_complete());
    }

    #[test]
    fn test_authorization_request_grants_read_and_write() {
        let bucket = Bucket {
            id: "b1".to_string(),
            org_id: "o1".to_string(),
            name: "iot_center".to_string(),
            description: None,
            retention_rules: Vec::new(),
        };

        let request = AuthorizationRequest::for_device("dev-1", &bucket);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["orgID"], "o1");
        assert_eq!(value["description"], "IoTCenterDevice: dev-1");
        assert_eq!(value["permissions"][0]["action"], "read");
        assert_eq!(value["permissions"][1]["action"], "write");
        assert_eq!(value["permissions"][1]["resource"]["type"], "buckets");
        assert_eq!(value["permissions"][1]["resource"]["id"], "b1");
    }
}
