use crate::errors::Result;
use crate::metrics::DEVICES_CREATED_TOTAL;
use crate::model::{
    validate_device_id, Device, DEVICE_AUTH_MEASUREMENT, DEVICE_ID_TAG, FIELD_CREATED_AT,
    FIELD_KEY, FIELD_TOKEN, PLACEHOLDER_KEY_PREFIX, PLACEHOLDER_TOKEN_PREFIX,
};
use crate::store::flux::{FluxQuery, Predicate};
use crate::store::line_protocol::Point;
use crate::store::TimeSeriesStore;
use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Device identity and authorization records kept in the auth bucket.
#[derive(Clone)]
pub struct DeviceDirectory {
    store: Arc<dyn TimeSeriesStore>,
    auth_bucket: String,
}

impl DeviceDirectory {
    pub fn new(store: Arc<dyn TimeSeriesStore>, auth_bucket: impl Into<String>) -> Self {
        Self {
            store,
            auth_bucket: auth_bucket.into(),
        }
    }

    /// Latest record per device. Listing all devices leaves out tokens;
    /// asking for one id includes it. Unknown ids give an empty vector.
    pub async fn get_device(&self, device_id: Option<&str>) -> Result<Vec<Device>> {
        let mut query = FluxQuery::from_bucket(&self.auth_bucket)
            .filter(Predicate::eq("_measurement", DEVICE_AUTH_MEASUREMENT));
        query = match device_id {
            Some(id) => query.filter(Predicate::eq(DEVICE_ID_TAG, id)),
            None => query.filter(Predicate::ne("_field", FIELD_TOKEN)),
        };

        let records = self.store.query(&query.last()).await?;
        Ok(Device::from_records(&records))
    }

    /// Writes a placeholder record and returns the device id, generating one if absent.
    pub async fn create_device(&self, device_id: Option<String>) -> Result<String> {
        let device_id = match device_id {
            Some(id) => {
                validate_device_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let point = Point::new(DEVICE_AUTH_MEASUREMENT)
            .tag(DEVICE_ID_TAG, device_id.as_str())
            .field(FIELD_KEY, format!("{}{}", PLACEHOLDER_KEY_PREFIX, device_id))
            .field(FIELD_TOKEN, format!("{}{}", PLACEHOLDER_TOKEN_PREFIX, device_id))
            .field(
                FIELD_CREATED_AT,
                Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            );

        if let Err(e) = self.store.write(&self.auth_bucket, &[point]).await {
            error!("Failed to create device {}: {}", device_id, e);
            return Err(e);
        }

        DEVICES_CREATED_TOTAL.inc();
        info!("Created device {}", device_id);
        Ok(device_id)
    }

    /// Stores an issued key and token as the device's current authorization.
    pub async fn persist_authorization(&self, device_id: &str, key: &str, token: &str) -> Result<()> {
        validate_device_id(device_id)?;
        let point = Point::new(DEVICE_AUTH_MEASUREMENT)
            .tag(DEVICE_ID_TAG, device_id)
            .field(FIELD_KEY, key)
            .field(FIELD_TOKEN, token);

        self.store.write(&self.auth_bucket, &[point]).await
    }
}
