use crate::devices::DeviceDirectory;
use crate::errors::{Error, Result};
use crate::metrics::AUTHORIZATIONS_ISSUED_TOTAL;
use crate::model::{validate_device_id, Authorization, AuthorizationRequest, Device};
use crate::store::TimeSeriesStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Outcome of registering a device.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Registration {
    /// A new authorization was issued and stored.
    Issued { authorization: Authorization },
    /// The device already had one; nothing was issued.
    Existing { device: Device },
}

/// Issues read/write credentials on the telemetry bucket.
#[derive(Clone)]
pub struct AuthorizationIssuer {
    store: Arc<dyn TimeSeriesStore>,
    directory: DeviceDirectory,
    bucket: String,
}

impl AuthorizationIssuer {
    pub fn new(
        store: Arc<dyn TimeSeriesStore>,
        directory: DeviceDirectory,
        bucket: impl Into<String>,
    ) -> Self {
        Self {
            store,
            directory,
            bucket: bucket.into(),
        }
    }

    pub async fn create_authorization(&self, device_id: &str) -> Result<Authorization> {
        let bucket = self
            .store
            .find_bucket_by_name(&self.bucket)
            .await?
            .ok_or_else(|| Error::BucketNotFound(self.bucket.clone()))?;

        let request = AuthorizationRequest::for_device(device_id, &bucket);
        let authorization = self.store.create_authorization(&request).await?;

        AUTHORIZATIONS_ISSUED_TOTAL.inc();
        info!(
            "Issued authorization {} for device {}",
            authorization.id, device_id
        );
        Ok(authorization)
    }

    /// Issues an authorization unless the device already holds one.
    pub async fn register_device(&self, device_id: &str) -> Result<Registration> {
        validate_device_id(device_id)?;

        let existing = self
            .directory
            .get_device(Some(device_id))
            .await?
            .into_iter()
            .find(Device::has_live_key);
        if let Some(device) = existing {
            info!("Device {} is already registered", device_id);
            return Ok(Registration::Existing { device });
        }

        let authorization = self.create_authorization(device_id).await?;
        self.directory
            .persist_authorization(device_id, &authorization.id, &authorization.token)
            .await?;
        Ok(Registration::Issued { authorization })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, AuthorizationIssuer) {
        let store = Arc::new(MemoryStore::with_buckets("org", &["telemetry", "auth"]));
        let directory = DeviceDirectory::new(store.clone(), "auth");
        let issuer = AuthorizationIssuer::new(store.clone(), directory, "telemetry");
        (store, issuer)
    }

    #[tokio::test]
    async fn test_create_authorization_scopes_to_bucket() {
        let (store, issuer) = setup();
        let bucket = store.find_bucket_by_name("telemetry").await.unwrap().unwrap();

        let authorization = issuer.create_authorization("dev-1").await.unwrap();

        assert_eq!(authorization.description.as_deref(), Some("IoTCenterDevice: dev-1"));
        assert_eq!(authorization.permissions.len(), 2);
        assert!(authorization
            .permissions
            .iter()
            .all(|p| p.resource.id.as_deref() == Some(bucket.id.as_str())));
    }

    #[tokio::test]
    async fn test_missing_bucket_is_error() {
        let store = Arc::new(MemoryStore::with_buckets("org", &["auth"]));
        let directory = DeviceDirectory::new(store.clone(), "auth");
        let issuer = AuthorizationIssuer::new(store, directory, "telemetry");

        let result = issuer.create_authorization("dev-1").await;
        assert!(matches!(result, Err(Error::BucketNotFound(_))));
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (store, issuer) = setup();

        let authorization = match issuer.register_device("dev-1").await.unwrap() {
            Registration::Issued { authorization } => authorization,
            other => panic!("expected a new authorization, got {:?}", other),
        };

        let device = match issuer.register_device("dev-1").await.unwrap() {
            Registration::Existing { device } => device,
            other => panic!("expected the existing record, got {:?}", other),
        };

        assert_eq!(store.authorizations().len(), 1);
        assert_eq!(device.key.as_deref(), Some(authorization.id.as_str()));
        assert_eq!(device.token.as_deref(), Some(authorization.token.as_str()));

        let third = issuer.register_device("dev-1").await.unwrap();
        assert_eq!(third, Registration::Existing { device });
    }

    #[tokio::test]
    async fn test_register_rejects_control_characters() {
        let (store, issuer) = setup();

        let result = issuer.register_device("dev-1\r\nx").await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert!(store.authorizations().is_empty());
    }

    #[tokio::test]
    async fn test_register_replaces_placeholder() {
        let (store, issuer) = setup();
        let directory = DeviceDirectory::new(store.clone(), "auth");
        directory.create_device(Some("dev-1".to_string())).await.unwrap();

        let registration = issuer.register_device("dev-1").await.unwrap();

        assert!(matches!(registration, Registration::Issued { .. }));
        assert_eq!(store.authorizations().len(), 1);
    }
}
